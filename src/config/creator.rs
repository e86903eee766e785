use crate::config::grid::{GridConfig, StepMode};
use anyhow::Result;
use dialoguer::{theme::ColorfulTheme, Confirm, Input, Select};
use rust_decimal::Decimal;
use std::fs;

pub fn create_config() -> Result<()> {
    let theme = ColorfulTheme::default();

    let config = create_grid(&theme)?;
    config.validate()?;

    let default_filename = generate_default_filename(&config);

    let filename: String = Input::with_theme(&theme)
        .with_prompt("Configuration filename")
        .default(default_filename)
        .interact_text()?;

    let toml_string = toml::to_string_pretty(&config)?;

    let path = if filename.ends_with(".toml") {
        filename
    } else {
        format!("{}.toml", filename)
    };

    // Bare file names go to configs/ when that directory exists.
    let final_path = if !path.contains('/') && fs::metadata("configs").is_ok() {
        format!("configs/{}", path)
    } else {
        path
    };

    fs::write(&final_path, toml_string)?;
    println!("Configuration saved to {}", final_path);

    Ok(())
}

fn positive(input: &Decimal) -> Result<(), &'static str> {
    if *input > Decimal::ZERO {
        Ok(())
    } else {
        Err("Value must be positive")
    }
}

fn create_grid(theme: &ColorfulTheme) -> Result<GridConfig> {
    let symbol: String = Input::with_theme(theme)
        .with_prompt("Symbol (e.g., BNB/USDC)")
        .validate_with(|input: &String| -> Result<(), &str> {
            if input.trim().is_empty() {
                Err("Symbol must not be empty")
            } else {
                Ok(())
            }
        })
        .interact_text()?;

    let lower_bound: Decimal = Input::with_theme(theme)
        .with_prompt("Lower Price")
        .validate_with(positive)
        .interact_text()?;

    let upper_bound: Decimal = Input::with_theme(theme)
        .with_prompt("Upper Price (exclusive)")
        .validate_with(|input: &Decimal| -> Result<(), &str> {
            if *input > lower_bound {
                Ok(())
            } else {
                Err("Upper price must be greater than lower price")
            }
        })
        .interact_text()?;

    let step_modes = vec!["Arithmetic", "Geometric"];
    let step_mode_sel = Select::with_theme(theme)
        .with_prompt("Step Mode")
        .default(0)
        .items(&step_modes)
        .interact()?;
    let step_mode = if step_mode_sel == 0 {
        StepMode::Arithmetic
    } else {
        StepMode::Geometric
    };

    let step_kinds = match step_mode {
        StepMode::Arithmetic => vec!["Step Size (price)", "Step Count"],
        StepMode::Geometric => vec!["Step Percent", "Step Count"],
    };
    let step_kind = Select::with_theme(theme)
        .with_prompt("Define levels by")
        .default(0)
        .items(&step_kinds)
        .interact()?;

    let (mut step_size, mut step_percent, mut step_count) = (None, None, None);
    match (step_mode, step_kind) {
        (StepMode::Arithmetic, 0) => {
            step_size = Some(
                Input::with_theme(theme)
                    .with_prompt("Step Size")
                    .validate_with(positive)
                    .interact_text()?,
            );
        }
        (StepMode::Geometric, 0) => {
            step_percent = Some(
                Input::with_theme(theme)
                    .with_prompt("Step Percent (e.g., 1 for 1%)")
                    .validate_with(positive)
                    .interact_text()?,
            );
        }
        _ => {
            step_count = Some(
                Input::with_theme(theme)
                    .with_prompt("Step Count")
                    .validate_with(|input: &u32| -> Result<(), &str> {
                        if *input > 0 {
                            Ok(())
                        } else {
                            Err("Step count must be at least 1")
                        }
                    })
                    .interact_text()?,
            );
        }
    }

    let order_size: Decimal = Input::with_theme(theme)
        .with_prompt("Order Size per Level (base asset)")
        .validate_with(positive)
        .interact_text()?;

    let has_max_open = Confirm::with_theme(theme)
        .with_prompt("Cap the number of open levels?")
        .default(false)
        .interact()?;
    let max_open_levels = if has_max_open {
        Some(
            Input::with_theme(theme)
                .with_prompt("Max Open Levels")
                .interact_text()?,
        )
    } else {
        None
    };

    let has_threshold = Confirm::with_theme(theme)
        .with_prompt("Recentre on drift inside the bounds?")
        .default(false)
        .interact()?;
    let recentre_threshold = if has_threshold {
        Some(
            Input::with_theme(theme)
                .with_prompt("Recentre Threshold (%)")
                .validate_with(positive)
                .interact_text()?,
        )
    } else {
        None
    };

    let price_decimals: u32 = Input::with_theme(theme)
        .with_prompt("Price Decimals")
        .default(2)
        .interact_text()?;

    let size_decimals: u32 = Input::with_theme(theme)
        .with_prompt("Size Decimals")
        .default(4)
        .interact_text()?;

    Ok(GridConfig {
        step_mode,
        step_size,
        step_percent,
        step_count,
        max_open_levels,
        recentre_threshold,
        price_decimals,
        size_decimals,
        ..GridConfig::arithmetic(&symbol, lower_bound, upper_bound, Decimal::ONE, order_size)
    })
}

fn generate_default_filename(config: &GridConfig) -> String {
    // Extract asset name (e.g., "BNB" from "BNB/USDC")
    let asset = config.symbol.split('/').next().unwrap_or(&config.symbol);
    format!(
        "{}_{:?}_{}_{}.toml",
        asset, config.step_mode, config.lower_bound, config.upper_bound
    )
}

//! Console renderer for dry-run output.

use crate::config::grid::GridConfig;
use crate::grid::{GridLevel, Layout};
use crate::model::OrderSide;
use rust_decimal::Decimal;

/// Capital the initial layout ties up.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlanTotals {
    pub buy_orders: usize,
    pub sell_orders: usize,
    /// Quote currency locked by resting buys.
    pub quote_required: Decimal,
    /// Base currency locked by resting sells.
    pub base_required: Decimal,
}

pub fn plan_totals(levels: &[GridLevel], layout: &Layout, order_size: Decimal) -> PlanTotals {
    let mut totals = PlanTotals {
        buy_orders: 0,
        sell_orders: 0,
        quote_required: Decimal::ZERO,
        base_required: Decimal::ZERO,
    };
    for level in levels {
        match layout.get(&level.index) {
            Some(OrderSide::Buy) => {
                totals.buy_orders += 1;
                totals.quote_required += level.price * order_size;
            }
            Some(OrderSide::Sell) => {
                totals.sell_orders += 1;
                totals.base_required += order_size;
            }
            None => {}
        }
    }
    totals
}

/// Console renderer for dry-run reports.
pub struct ConsoleRenderer;

impl ConsoleRenderer {
    /// Render a complete dry-run report to stdout.
    pub fn render(
        config: &GridConfig,
        levels: &[GridLevel],
        layout: &Layout,
        anchor: Decimal,
        offset: i64,
    ) {
        println!();
        println!("{}", "=".repeat(60));
        println!(" GRID DRY RUN REPORT");
        println!("{}", "=".repeat(60));

        // Section 1: Grid Levels
        println!();
        Self::render_grid(levels, layout, anchor, config.order_size);

        // Section 2: Proposed Actions
        println!();
        println!("{}", "-".repeat(60));
        Self::render_action_plan(levels, layout, config.order_size);

        // Section 3: Configuration & Summary
        println!();
        println!("{}", "=".repeat(60));
        Self::render_config(config, levels.len(), offset);

        println!();
        println!("Anchor Price: {}", anchor);

        println!();
        println!("{}", "-".repeat(60));
        Self::render_summary(config, &plan_totals(levels, layout, config.order_size));

        println!();
        println!("{}", "=".repeat(60));
        println!();
    }

    fn render_config(config: &GridConfig, level_count: usize, offset: i64) {
        println!("CONFIGURATION");
        println!("Symbol:      {}", config.symbol);
        println!("Type:        {}", config.type_name());
        if let Some(step) = config.step_size {
            println!("Step:        {}", step);
        }
        if let Some(pct) = config.step_percent {
            println!("Step:        {}%", pct);
        }
        println!("Levels:      {}", level_count);
        println!(
            "Range:       {} - {} (offset {})",
            config.lower_bound, config.upper_bound, offset
        );
        println!("Order Size:  {}", config.order_size);
        if let Some(max) = config.max_open_levels {
            println!("Max Open:    {}", max);
        }
        match config.recentre_threshold {
            Some(t) => println!("Recentre:    {}% drift", t),
            None => println!("Recentre:    on bound breach"),
        }
    }

    fn render_summary(config: &GridConfig, totals: &PlanTotals) {
        let (base, quote) = parse_symbol(&config.symbol);
        println!("SUMMARY");
        println!(
            "Orders:   {} buys / {} sells",
            totals.buy_orders, totals.sell_orders
        );
        println!(
            "Capital:  {} {} | {} {}",
            totals.quote_required.round_dp(config.price_decimals),
            quote,
            totals.base_required,
            base
        );
    }

    fn render_grid(levels: &[GridLevel], layout: &Layout, anchor: Decimal, order_size: Decimal) {
        println!("GRID LEVELS ({})", levels.len());
        println!(
            "{:<6} | {:<16} | {:<8} | {:<14} | PLAN",
            "IDX", "PRICE", "STEP %", "NOTIONAL"
        );
        println!("{}", "-".repeat(64));

        // Limit display to first 50 + last 50 if too many levels
        let display: Vec<(usize, &GridLevel)> = if levels.len() > 100 {
            levels
                .iter()
                .enumerate()
                .take(50)
                .chain(levels.iter().enumerate().skip(levels.len() - 50))
                .collect()
        } else {
            levels.iter().enumerate().collect()
        };

        // Highest level first, like an order book.
        for (pos, level) in display.into_iter().rev() {
            let step_pct = if pos > 0 && levels[pos - 1].price > Decimal::ZERO {
                let prev = levels[pos - 1].price;
                ((level.price - prev) / prev * Decimal::ONE_HUNDRED).round_dp(3)
            } else {
                Decimal::ZERO
            };
            let plan = match layout.get(&level.index) {
                Some(side) => side.to_string(),
                None if level.price < anchor => "GAP".to_string(),
                None => "-".to_string(),
            };
            println!(
                "{:<6} | {:<16} | {:<8} | {:<14} | {}",
                level.index,
                level.price,
                step_pct,
                level.price * order_size,
                plan
            );
        }

        if levels.len() > 100 {
            println!("... (Hiding {} levels) ...", levels.len() - 100);
        }
    }

    /// Render proposed actions (orders).
    fn render_action_plan(levels: &[GridLevel], layout: &Layout, order_size: Decimal) {
        println!("PROPOSED ACTIONS (What would happen next):");

        if layout.is_empty() {
            println!("  [WAIT] No orders planned.");
            return;
        }

        for level in levels {
            if let Some(side) = layout.get(&level.index) {
                println!(
                    "  [ORDER] {} {} @ {} (level {})",
                    side, order_size, level.price, level.index
                );
            }
        }
    }
}

/// Parse symbol into (base, quote).
fn parse_symbol(symbol: &str) -> (String, String) {
    if let Some(idx) = symbol.find('/') {
        (symbol[..idx].to_string(), symbol[idx + 1..].to_string())
    } else {
        (symbol.to_string(), "USDC".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::{layout, GridModel};
    use rust_decimal_macros::dec;

    #[test]
    fn test_plan_totals_for_scenario_grid() {
        let config = GridConfig::arithmetic("BNB/USDC", dec!(500), dec!(600), dec!(10), dec!(0.01));
        let levels = GridModel::new(&config).unwrap().levels(0);
        let plan = layout(&levels, dec!(550), None);

        let totals = plan_totals(&levels, &plan, config.order_size);
        assert_eq!(totals.buy_orders, 4);
        assert_eq!(totals.sell_orders, 5);
        assert_eq!(totals.quote_required, dec!(20.6)); // (500+510+520+530) * 0.01
        assert_eq!(totals.base_required, dec!(0.05));
    }

    #[test]
    fn test_parse_symbol() {
        assert_eq!(
            parse_symbol("BNB/USDT"),
            ("BNB".to_string(), "USDT".to_string())
        );
        assert_eq!(parse_symbol("HYPE"), ("HYPE".to_string(), "USDC".to_string()));
    }
}

use crate::constants::{
    DEFAULT_BASE_DELAY, DEFAULT_JITTER_FRACTION, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY,
    DEFAULT_RETRY_BUDGET, EXCHANGE_CALL_TIMEOUT, PERSISTENCE_TIMEOUT, RECONCILIATION_INTERVAL,
};
use crate::engine::retry::RetryPolicy;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use crate::grid::StepMode;

/// Grid definition for one symbol, loaded from TOML.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct GridConfig {
    pub symbol: String,
    pub lower_bound: Decimal,
    pub upper_bound: Decimal,
    pub step_mode: StepMode,
    /// Fixed price distance between levels. Arithmetic only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_size: Option<Decimal>,
    /// Percentage distance between levels (0.5 = 0.5%). Geometric only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_percent: Option<Decimal>,
    /// Number of levels between the bounds. Either mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_count: Option<u32>,
    pub order_size: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_open_levels: Option<usize>,
    /// Percentage drift from the anchor that recentres the grid while price is
    /// still inside the bounds. Unset means shift only on a bound breach.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recentre_threshold: Option<Decimal>,
    #[serde(default = "default_reconciliation_interval")]
    pub reconciliation_interval_seconds: u64,
    #[serde(default = "default_retry_budget")]
    pub max_retry_budget: u32,
    #[serde(default = "default_price_decimals")]
    pub price_decimals: u32,
    #[serde(default = "default_size_decimals")]
    pub size_decimals: u32,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_fraction: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_BASE_DELAY.as_millis() as u64,
            max_delay_ms: DEFAULT_MAX_DELAY.as_millis() as u64,
            jitter_fraction: DEFAULT_JITTER_FRACTION,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct TimeoutConfig {
    pub exchange_call_ms: u64,
    pub persistence_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            exchange_call_ms: EXCHANGE_CALL_TIMEOUT.as_millis() as u64,
            persistence_ms: PERSISTENCE_TIMEOUT.as_millis() as u64,
        }
    }
}

fn default_reconciliation_interval() -> u64 {
    RECONCILIATION_INTERVAL.as_secs()
}

fn default_retry_budget() -> u32 {
    DEFAULT_RETRY_BUDGET
}

fn default_price_decimals() -> u32 {
    8
}

fn default_size_decimals() -> u32 {
    6
}

impl GridConfig {
    /// Minimal arithmetic config, remaining options at their defaults.
    pub fn arithmetic(
        symbol: &str,
        lower_bound: Decimal,
        upper_bound: Decimal,
        step_size: Decimal,
        order_size: Decimal,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            lower_bound,
            upper_bound,
            step_mode: StepMode::Arithmetic,
            step_size: Some(step_size),
            step_percent: None,
            step_count: None,
            order_size,
            max_open_levels: None,
            recentre_threshold: None,
            reconciliation_interval_seconds: default_reconciliation_interval(),
            max_retry_budget: default_retry_budget(),
            price_decimals: default_price_decimals(),
            size_decimals: default_size_decimals(),
            retry: RetryConfig::default(),
            timeouts: TimeoutConfig::default(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.symbol.trim().is_empty() {
            return Err(anyhow::anyhow!("Symbol must not be empty."));
        }
        if self.lower_bound <= Decimal::ZERO {
            return Err(anyhow::anyhow!(
                "Lower bound {} must be positive.",
                self.lower_bound
            ));
        }
        if self.upper_bound <= self.lower_bound {
            return Err(anyhow::anyhow!(
                "Upper bound {} must be greater than lower bound {}.",
                self.upper_bound,
                self.lower_bound
            ));
        }

        let given = [
            self.step_size.is_some(),
            self.step_percent.is_some(),
            self.step_count.is_some(),
        ]
        .iter()
        .filter(|s| **s)
        .count();
        if given != 1 {
            return Err(anyhow::anyhow!(
                "Exactly one of step_size, step_percent or step_count must be specified."
            ));
        }

        match self.step_mode {
            StepMode::Arithmetic if self.step_percent.is_some() => {
                return Err(anyhow::anyhow!(
                    "step_percent requires step_mode = \"geometric\"."
                ));
            }
            StepMode::Geometric if self.step_size.is_some() => {
                return Err(anyhow::anyhow!(
                    "step_size requires step_mode = \"arithmetic\"."
                ));
            }
            _ => {}
        }

        if let Some(step) = self.step_size {
            if step <= Decimal::ZERO {
                return Err(anyhow::anyhow!("step_size {} must be positive.", step));
            }
        }
        if let Some(pct) = self.step_percent {
            if pct <= Decimal::ZERO {
                return Err(anyhow::anyhow!("step_percent {} must be positive.", pct));
            }
        }
        if let Some(count) = self.step_count {
            if count == 0 {
                return Err(anyhow::anyhow!("step_count must be at least 1."));
            }
        }

        if self.order_size <= Decimal::ZERO {
            return Err(anyhow::anyhow!("Order size must be positive."));
        }
        if let Some(max) = self.max_open_levels {
            if max == 0 {
                return Err(anyhow::anyhow!("max_open_levels must be at least 1."));
            }
        }
        if let Some(threshold) = self.recentre_threshold {
            if threshold <= Decimal::ZERO {
                return Err(anyhow::anyhow!(
                    "recentre_threshold {} must be positive.",
                    threshold
                ));
            }
        }
        if self.reconciliation_interval_seconds == 0 {
            return Err(anyhow::anyhow!(
                "reconciliation_interval_seconds must be positive."
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(anyhow::anyhow!("retry.max_attempts must be at least 1."));
        }
        if !(0.0..1.0).contains(&self.retry.jitter_fraction) {
            return Err(anyhow::anyhow!(
                "retry.jitter_fraction must be in [0, 1)."
            ));
        }
        if self.timeouts.exchange_call_ms == 0 || self.timeouts.persistence_ms == 0 {
            return Err(anyhow::anyhow!("timeouts must be positive."));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            jitter_fraction: self.retry.jitter_fraction,
        }
    }

    pub fn reconciliation_interval(&self) -> Duration {
        Duration::from_secs(self.reconciliation_interval_seconds)
    }

    pub fn exchange_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.exchange_call_ms)
    }

    pub fn persistence_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.persistence_ms)
    }

    pub fn type_name(&self) -> &str {
        match self.step_mode {
            StepMode::Arithmetic => "Arithmetic Grid",
            StepMode::Geometric => "Geometric Grid",
        }
    }
}

pub fn print_config_help() {
    println!("Grid Configuration (TOML):\n");
    println!("   Required:");
    println!("     - symbol (String): The trading pair symbol (e.g., 'BNB/USDC').");
    println!("     - lower_bound (Decimal): The lower bound of the grid range.");
    println!("     - upper_bound (Decimal): The upper bound of the grid range (exclusive).");
    println!("     - step_mode (String): 'arithmetic' or 'geometric'.");
    println!("     - order_size (Decimal): Base quantity per level.");
    println!("   Exactly one of:");
    println!("     - step_size (Decimal): Price distance between levels (arithmetic).");
    println!("     - step_percent (Decimal): Percent distance between levels (geometric).");
    println!("     - step_count (u32): Number of levels between the bounds.");
    println!("   Optional:");
    println!("     - max_open_levels (usize): Cap on resting orders, nearest the anchor first.");
    println!("     - recentre_threshold (Decimal): Percent drift that recentres the grid.");
    println!("     - reconciliation_interval_seconds (u64): Integrity poll period (default 120).");
    println!("     - max_retry_budget (u32): Retries allowed per reconciliation pass (default 12).");
    println!("     - price_decimals / size_decimals (u32): Exchange precision (default 8 / 6).");
    println!(
        "     - [retry] max_attempts, base_delay_ms, max_delay_ms, jitter_fraction: Backoff policy."
    );
    println!("     - [timeouts] exchange_call_ms, persistence_ms: Per-call deadlines.");
    println!();
}

//! Pure grid geometry: level prices, re-centring and the initial layout.
//!
//! Level indices are global. Index `i` always denotes `lower + i·step`
//! (arithmetic) or `lower · ratio^i` (geometric), so a grid shift only moves
//! the window of active indices and never renumbers a level.

use crate::config::grid::GridConfig;
use crate::error::GridError;
use crate::model::OrderSide;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, MathematicalOps};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Refuse configurations that would generate an unmanageable ladder.
pub const MAX_LEVELS: i64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepMode {
    Arithmetic,
    Geometric,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridLevel {
    pub index: i64,
    pub price: Decimal,
}

/// Planned side per level. Vacant levels are absent.
pub type Layout = BTreeMap<i64, OrderSide>;

#[derive(Debug, Clone, PartialEq)]
pub struct GridModel {
    lower: Decimal,
    mode: StepMode,
    /// Price step (arithmetic) or ratio between neighbours (geometric).
    step: Decimal,
    count: i64,
    price_decimals: u32,
}

impl GridModel {
    pub fn new(config: &GridConfig) -> Result<Self, GridError> {
        if config.lower_bound <= Decimal::ZERO {
            return Err(GridError::InvalidConfig(format!(
                "lower bound {} must be positive",
                config.lower_bound
            )));
        }
        if config.upper_bound <= config.lower_bound {
            return Err(GridError::InvalidConfig(format!(
                "upper bound {} must be greater than lower bound {}",
                config.upper_bound, config.lower_bound
            )));
        }

        let lower = config.lower_bound;
        let upper = config.upper_bound;
        let span = upper - lower;

        let (step, count) = match (config.step_mode, config.step_count) {
            (StepMode::Arithmetic, Some(n)) => {
                if n == 0 {
                    return Err(GridError::InvalidConfig("step count is zero".into()));
                }
                (span / Decimal::from(n), i64::from(n))
            }
            (StepMode::Arithmetic, None) => {
                let step = config.step_size.ok_or_else(|| {
                    GridError::InvalidConfig("arithmetic grid needs step_size or step_count".into())
                })?;
                if step <= Decimal::ZERO {
                    return Err(GridError::InvalidConfig(format!(
                        "step size {} must be positive",
                        step
                    )));
                }
                let count = (span / step).ceil().to_i64().unwrap_or(i64::MAX);
                (step, count)
            }
            (StepMode::Geometric, Some(n)) => {
                if n == 0 {
                    return Err(GridError::InvalidConfig("step count is zero".into()));
                }
                let exponent = Decimal::ONE / Decimal::from(n);
                let ratio = (upper / lower).checked_powd(exponent).ok_or_else(|| {
                    GridError::InvalidConfig("geometric ratio overflows".into())
                })?;
                (ratio, i64::from(n))
            }
            (StepMode::Geometric, None) => {
                let pct = config.step_percent.ok_or_else(|| {
                    GridError::InvalidConfig(
                        "geometric grid needs step_percent or step_count".into(),
                    )
                })?;
                if pct <= Decimal::ZERO {
                    return Err(GridError::InvalidConfig(format!(
                        "step percent {} must be positive",
                        pct
                    )));
                }
                let ratio = Decimal::ONE + pct / Decimal::ONE_HUNDRED;
                let mut count = 0i64;
                let mut price = lower;
                while price < upper && count <= MAX_LEVELS {
                    count += 1;
                    price = match price.checked_mul(ratio) {
                        Some(p) => p,
                        None => break,
                    };
                }
                (ratio, count)
            }
        };

        if count <= 0 {
            return Err(GridError::InvalidConfig("step yields zero levels".into()));
        }
        if count > MAX_LEVELS {
            return Err(GridError::InvalidConfig(format!(
                "step yields more than {} levels",
                MAX_LEVELS
            )));
        }

        let model = Self {
            lower,
            mode: config.step_mode,
            step,
            count,
            price_decimals: config.price_decimals,
        };

        // Rounding can collapse neighbouring levels when the step is finer than
        // the price precision.
        let levels = model.levels(0);
        if levels.len() as i64 != count || levels.windows(2).any(|w| w[0].price >= w[1].price) {
            return Err(GridError::InvalidConfig(format!(
                "step is finer than {} price decimals",
                config.price_decimals
            )));
        }
        if levels.first().map(|l| l.price <= Decimal::ZERO).unwrap_or(true) {
            return Err(GridError::InvalidConfig("step yields zero levels".into()));
        }

        Ok(model)
    }

    pub fn mode(&self) -> StepMode {
        self.mode
    }

    /// Number of levels in the active window.
    pub fn count(&self) -> i64 {
        self.count
    }

    /// Price of global level `index`, rounded to the price precision.
    pub fn price_at(&self, index: i64) -> Option<Decimal> {
        let raw = match self.mode {
            StepMode::Arithmetic => self
                .step
                .checked_mul(Decimal::from(index))
                .and_then(|d| self.lower.checked_add(d)),
            StepMode::Geometric => {
                let factor = self.step.checked_powu(index.unsigned_abs())?;
                if index >= 0 {
                    self.lower.checked_mul(factor)
                } else {
                    self.lower.checked_div(factor)
                }
            }
        }?;
        Some(raw.round_dp(self.price_decimals))
    }

    /// Active level set for a window starting at global index `offset`.
    pub fn levels(&self, offset: i64) -> Vec<GridLevel> {
        (offset..offset + self.count)
            .filter_map(|index| {
                self.price_at(index)
                    .filter(|p| *p > Decimal::ZERO)
                    .map(|price| GridLevel { index, price })
            })
            .collect()
    }

    /// `[lowest level, first level above the window)` for a window. The upper
    /// bound is exclusive.
    pub fn bounds(&self, offset: i64) -> Option<(Decimal, Decimal)> {
        Some((self.price_at(offset)?, self.price_at(offset + self.count)?))
    }

    pub fn contains_index(&self, offset: i64, index: i64) -> bool {
        index >= offset && index < offset + self.count
    }

    /// Global index of the highest level at or below `price`.
    pub fn floor_index(&self, price: Decimal) -> Option<i64> {
        if price <= Decimal::ZERO {
            return None;
        }
        let mut k = match self.mode {
            StepMode::Arithmetic => ((price - self.lower) / self.step).floor().to_i64()?,
            StepMode::Geometric => {
                let ln_ratio = self.step.checked_ln()?;
                if ln_ratio.is_zero() {
                    return None;
                }
                ((price / self.lower).checked_ln()? / ln_ratio)
                    .floor()
                    .to_i64()?
            }
        };
        // ln() and rounding are approximate; settle on the exact neighbour.
        for _ in 0..4 {
            if self.price_at(k)? > price {
                k -= 1;
            } else if self.price_at(k + 1)? <= price {
                k += 1;
            } else {
                break;
            }
        }
        Some(k)
    }

    /// Window offset that centres the grid on `anchor`.
    pub fn recentre_offset(&self, anchor: Decimal) -> Option<i64> {
        self.floor_index(anchor).map(|k| k - self.count / 2)
    }

    /// Global index of the active level priced exactly at `price`.
    pub fn level_at_price(&self, offset: i64, price: Decimal) -> Option<i64> {
        let k = self.floor_index(price)?;
        if self.contains_index(offset, k) && self.price_at(k)? == price {
            Some(k)
        } else {
            None
        }
    }
}

/// Level set for a fresh grid. The anchor is not required to lie inside the
/// bounds; the caller decides whether that calls for a shift.
pub fn compute_levels(config: &GridConfig, _anchor: Decimal) -> Result<Vec<GridLevel>, GridError> {
    Ok(GridModel::new(config)?.levels(0))
}

/// Initial planned side per level.
///
/// Levels at or above the anchor sell, the highest level strictly below it is
/// left vacant as the spread gap, the rest buy. With `max_open` set, the levels
/// furthest from the anchor are dropped first.
pub fn layout(levels: &[GridLevel], anchor: Decimal, max_open: Option<usize>) -> Layout {
    let gap = levels
        .iter()
        .filter(|l| l.price < anchor)
        .map(|l| l.index)
        .max();

    let mut planned: Vec<(&GridLevel, OrderSide)> = levels
        .iter()
        .filter(|l| Some(l.index) != gap)
        .map(|l| {
            let side = if l.price >= anchor {
                OrderSide::Sell
            } else {
                OrderSide::Buy
            };
            (l, side)
        })
        .collect();

    if let Some(max) = max_open {
        planned.sort_by_key(|(l, _)| ((l.price - anchor).abs(), l.index));
        planned.truncate(max);
    }

    planned.into_iter().map(|(l, side)| (l.index, side)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn arithmetic() -> GridConfig {
        GridConfig::arithmetic("BNB/USDC", dec!(500), dec!(600), dec!(10), dec!(0.01))
    }

    fn geometric() -> GridConfig {
        GridConfig {
            step_mode: StepMode::Geometric,
            step_size: None,
            step_percent: Some(dec!(1)),
            price_decimals: 4,
            ..arithmetic()
        }
    }

    #[test]
    fn test_arithmetic_scenario_levels_and_layout() {
        let levels = compute_levels(&arithmetic(), dec!(550)).unwrap();
        assert_eq!(levels.len(), 10);
        assert_eq!(levels[0].price, dec!(500));
        assert_eq!(levels[9].price, dec!(590));

        let plan = layout(&levels, dec!(550), None);
        let buys: Vec<i64> = plan
            .iter()
            .filter(|(_, s)| s.is_buy())
            .map(|(i, _)| *i)
            .collect();
        let sells: Vec<i64> = plan
            .iter()
            .filter(|(_, s)| s.is_sell())
            .map(|(i, _)| *i)
            .collect();
        assert_eq!(buys, vec![0, 1, 2, 3]); // 500..530
        assert_eq!(sells, vec![5, 6, 7, 8, 9]); // 550..590
        assert!(!plan.contains_key(&4)); // 540 is the gap
    }

    #[test]
    fn test_step_count_arithmetic() {
        let config = GridConfig {
            step_size: None,
            step_count: Some(4),
            ..arithmetic()
        };
        let levels = compute_levels(&config, dec!(550)).unwrap();
        let prices: Vec<Decimal> = levels.iter().map(|l| l.price).collect();
        assert_eq!(prices, vec![dec!(500), dec!(525), dec!(550), dec!(575)]);
    }

    #[test]
    fn test_geometric_levels() {
        let model = GridModel::new(&geometric()).unwrap();
        let levels = model.levels(0);
        assert_eq!(levels[0].price, dec!(500));
        assert_eq!(levels[1].price, dec!(505));
        assert_eq!(levels[2].price, dec!(510.05));
        assert!(levels.last().unwrap().price < dec!(600));
        assert!(model.price_at(model.count()).unwrap() >= dec!(600));

        // Negative indices divide by the ratio.
        assert_eq!(model.price_at(-1).unwrap(), dec!(495.0495));
    }

    #[test]
    fn test_invalid_configs() {
        let inverted = GridConfig {
            lower_bound: dec!(600),
            upper_bound: dec!(500),
            ..arithmetic()
        };
        assert!(matches!(
            compute_levels(&inverted, dec!(550)),
            Err(GridError::InvalidConfig(_))
        ));

        let too_fine = GridConfig {
            step_size: Some(dec!(0.001)),
            price_decimals: 2,
            ..arithmetic()
        };
        assert!(GridModel::new(&too_fine).is_err());
    }

    #[test]
    fn test_anchor_outside_bounds_still_returns_levels() {
        let levels = compute_levels(&arithmetic(), dec!(605)).unwrap();
        assert_eq!(levels.len(), 10);
    }

    #[test]
    fn test_recentre_offset() {
        let model = GridModel::new(&arithmetic()).unwrap();
        assert_eq!(model.recentre_offset(dec!(550)), Some(0));
        assert_eq!(model.recentre_offset(dec!(605)), Some(5));
        assert_eq!(model.recentre_offset(dec!(455)), Some(-10));

        let shifted = model.levels(5);
        assert_eq!(shifted.first().unwrap().price, dec!(550));
        assert_eq!(shifted.last().unwrap().price, dec!(640));
        assert_eq!(model.bounds(5), Some((dec!(550), dec!(650))));
    }

    #[test]
    fn test_geometric_floor_index_is_exact() {
        let model = GridModel::new(&geometric()).unwrap();
        let p3 = model.price_at(3).unwrap();
        assert_eq!(model.floor_index(p3), Some(3));
        assert_eq!(model.floor_index(p3 - dec!(0.0001)), Some(2));
        assert_eq!(model.level_at_price(0, p3), Some(3));
        assert_eq!(model.level_at_price(0, p3 + dec!(0.0001)), None);
    }

    #[test]
    fn test_layout_max_open_levels_keeps_nearest() {
        let levels = compute_levels(&arithmetic(), dec!(550)).unwrap();
        let plan = layout(&levels, dec!(550), Some(3));
        let kept: Vec<i64> = plan.keys().copied().collect();
        // 550, then 560, then 530 which wins the tie with 570
        assert_eq!(kept, vec![3, 5, 6]);
    }
}

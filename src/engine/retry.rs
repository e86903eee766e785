use crate::error::GridError;
use crate::exchange::ExchangeError;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::warn;

/// Bounded exponential backoff for a single exchange command.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts per command, first try included
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Random jitter as fraction of delay (e.g., 0.1 = ±10%)
    pub jitter_fraction: f64,
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (1-based).
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        use rand::Rng;

        // Exponential backoff: base * 2^(attempt - 1)
        let exp = attempt.saturating_sub(1).min(30) as i32;
        let base_delay = self.base_delay.as_millis() as f64 * 2f64.powi(exp);

        let capped_delay = base_delay.min(self.max_delay.as_millis() as f64);

        let jitter_range = capped_delay * self.jitter_fraction;
        let jitter = if jitter_range > 0.0 {
            rand::rng().random_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };
        let final_delay = (capped_delay + jitter).max(0.0) as u64;

        Duration::from_millis(final_delay)
    }
}

/// Retries one reconciliation pass may spend across all of its commands.
#[derive(Debug)]
pub struct RetryBudget {
    limit: u32,
    remaining: AtomicU32,
}

impl RetryBudget {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            remaining: AtomicU32::new(limit),
        }
    }

    /// Takes one retry from the budget. `false` once it is spent.
    pub fn try_consume(&self) -> bool {
        self.remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |r| r.checked_sub(1))
            .is_ok()
    }

    pub fn spent(&self) -> u32 {
        self.limit - self.remaining.load(Ordering::SeqCst)
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }
}

/// Runs `op` under `timeout`, retrying transient failures per `policy` while
/// `budget` lasts. A timeout counts as transient.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    budget: &RetryBudget,
    timeout: Duration,
    label: &str,
    mut op: F,
) -> Result<T, GridError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ExchangeError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let reason = match tokio::time::timeout(timeout, op()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(ExchangeError::Permanent(msg))) => return Err(GridError::Permanent(msg)),
            Ok(Err(ExchangeError::Transient(msg))) => msg,
            Err(_) => format!("timed out after {:?}", timeout),
        };

        if attempt >= policy.max_attempts {
            return Err(GridError::Transient(format!(
                "{} failed after {} attempts: {}",
                label, attempt, reason
            )));
        }
        if !budget.try_consume() {
            return Err(GridError::RetryBudgetExhausted(budget.limit()));
        }

        let delay = policy.calculate_delay(attempt);
        warn!(
            "[RETRY] {} attempt {}/{} failed: {}. Retrying in {:?}",
            label, attempt, policy.max_attempts, reason, delay
        );
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            jitter_fraction: 0.0,
        }
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
            jitter_fraction: 0.0,
        };
        assert_eq!(policy.calculate_delay(1), Duration::from_millis(100));
        assert_eq!(policy.calculate_delay(2), Duration::from_millis(200));
        assert_eq!(policy.calculate_delay(3), Duration::from_millis(300));
        assert_eq!(policy.calculate_delay(10), Duration::from_millis(300));
    }

    #[test]
    fn test_delay_jitter_stays_in_range() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(5000),
            jitter_fraction: 0.1,
        };
        for _ in 0..50 {
            let d = policy.calculate_delay(1).as_millis();
            assert!((900..=1100).contains(&d), "delay {} out of range", d);
        }
    }

    #[test]
    fn test_budget_consumption() {
        let budget = RetryBudget::new(2);
        assert!(budget.try_consume());
        assert!(budget.try_consume());
        assert!(!budget.try_consume());
        assert_eq!(budget.spent(), 2);
    }

    #[tokio::test]
    async fn test_transient_then_success() {
        let calls = AtomicUsize::new(0);
        let budget = RetryBudget::new(5);
        let res = with_retry(&fast_policy(3), &budget, Duration::from_secs(1), "op", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(ExchangeError::Transient("connection reset".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(res.unwrap(), 1);
        assert_eq!(budget.spent(), 1);
    }

    #[tokio::test]
    async fn test_permanent_is_not_retried() {
        let calls = AtomicUsize::new(0);
        let budget = RetryBudget::new(5);
        let res: Result<(), _> =
            with_retry(&fast_policy(3), &budget, Duration::from_secs(1), "op", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ExchangeError::Permanent("insufficient balance".into())) }
            })
            .await;
        assert!(matches!(res, Err(GridError::Permanent(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(budget.spent(), 0);
    }

    #[tokio::test]
    async fn test_budget_exhaustion() {
        let budget = RetryBudget::new(1);
        let res: Result<(), _> =
            with_retry(&fast_policy(10), &budget, Duration::from_secs(1), "op", || async {
                Err(ExchangeError::Transient("timeout".into()))
            })
            .await;
        assert!(matches!(res, Err(GridError::RetryBudgetExhausted(1))));
    }

    #[tokio::test]
    async fn test_timeout_counts_as_transient() {
        let budget = RetryBudget::new(5);
        let res: Result<(), _> =
            with_retry(&fast_policy(2), &budget, Duration::from_millis(5), "slow", || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(res, Err(GridError::Transient(_))));
        assert_eq!(budget.spent(), 1);
    }
}

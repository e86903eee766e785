//! Central configuration constants for gridbnb.
//!
//! Defaults for everything the TOML file may leave out, plus the engine's
//! fixed timer intervals and queue sizes.

use std::time::Duration;

// =============================================================================
// ENGINE TIMER INTERVALS
// =============================================================================

/// Interval between order-state integrity polls (2 minutes)
pub const RECONCILIATION_INTERVAL: Duration = Duration::from_secs(2 * 60);

/// Interval for logging the status snapshot (30 seconds)
pub const STATUS_SUMMARY_INTERVAL: Duration = Duration::from_secs(30);

/// Interval between ticker polls by the price feed
pub const PRICE_POLL_INTERVAL: Duration = Duration::from_secs(2);

// =============================================================================
// TIMEOUTS
// =============================================================================

/// Upper bound on a single exchange HTTP call
pub const EXCHANGE_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on a single snapshot write
pub const PERSISTENCE_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on a single notification push
pub const NOTIFICATION_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a shutdown waits for the notification dispatcher to flush
pub const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// RETRY / QUEUES
// =============================================================================

/// Retries a single reconciliation pass may spend across all its commands
pub const DEFAULT_RETRY_BUDGET: u32 = 12;

/// Attempts per exchange command, first try included
pub const DEFAULT_MAX_ATTEMPTS: u32 = 4;

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(250);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(5);

/// ±10% jitter on every backoff delay
pub const DEFAULT_JITTER_FRACTION: f64 = 0.1;

/// Capacity of the engine's inbound event queue
pub const EVENT_QUEUE_CAPACITY: usize = 1024;

/// Capacity of the notification broadcast channel
pub const NOTIFICATION_CHANNEL_CAPACITY: usize = 100;

/// Delay before the order-event listener reconnects after a disconnect
pub const STREAM_RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Cap on the order-event listener's reconnect backoff
pub const STREAM_RECONNECT_MAX_DELAY: Duration = Duration::from_secs(60);

/// A silent order-event stream is reopened after this long
pub const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Quotes older than this are dropped by the price feed
pub const MAX_QUOTE_AGE: Duration = Duration::from_secs(30);

/// Bootstrap attempts before the process gives up on a transient failure
pub const BOOTSTRAP_ATTEMPTS: u32 = 5;

use crate::exchange::ExchangeError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parsing error: {0}")]
    Parsing(#[from] toml::de::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Failure taxonomy of the grid engine.
///
/// Raw I/O failures are classified into one of these before the engine
/// makes any state transition.
#[derive(Error, Debug)]
pub enum GridError {
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
    #[error("Transient exchange error: {0}")]
    Transient(String),
    #[error("Permanent exchange error: {0}")]
    Permanent(String),
    #[error("State divergence: {0}")]
    StateDivergence(String),
    #[error("Persistence failure: {0}")]
    PersistenceFailure(String),
    #[error("Retry budget exhausted after {0} retries")]
    RetryBudgetExhausted(u32),
}

impl From<ExchangeError> for GridError {
    fn from(e: ExchangeError) -> Self {
        match e {
            ExchangeError::Transient(msg) => GridError::Transient(msg),
            ExchangeError::Permanent(msg) => GridError::Permanent(msg),
        }
    }
}

impl From<ConfigError> for GridError {
    fn from(e: ConfigError) -> Self {
        GridError::InvalidConfig(e.to_string())
    }
}

impl GridError {
    /// Whether this failure requires operator attention.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            GridError::InvalidConfig(_)
                | GridError::StateDivergence(_)
                | GridError::RetryBudgetExhausted(_)
        )
    }
}

use std::time::Duration;
use thiserror::Error;

/// Error taxonomy for the trading core. Transient kinds are retried locally
/// with backoff; validation and simulation outcomes surface as structured
/// opportunity/bundle results, never as process-level panics.
#[derive(Debug, Error)]
pub enum BotError {
    #[error("config error: {0}")]
    Config(String),

    #[error("transient network error: {0}")]
    TransientNetwork(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("simulation failed: {0}")]
    Simulation(String),

    #[error("submission failed: {0}")]
    Submission(String),

    #[error("risk governor blocked: {0}")]
    RiskBlocked(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("schema incompatible: store at version {found}, code expects {expected}")]
    SchemaIncompatible { found: u32, expected: u32 },

    #[error("deadline exceeded after {0:?}")]
    Timeout(Duration),

    #[error("signer failure: {0}")]
    Signer(String),

    #[error("chain reorg across blocks {from}..={to}")]
    Reorg { from: u64, to: u64 },

    #[error("fatal invariant broken: {0}")]
    Fatal(String),
}

impl BotError {
    /// Whether a local retry with backoff is worth attempting.
    pub fn is_transient(&self) -> bool {
        matches!(self, BotError::TransientNetwork(_) | BotError::Timeout(_))
    }

    /// Process exit code when this error aborts startup or the main loop.
    pub fn exit_code(&self) -> i32 {
        match self {
            BotError::Config(_) => 1,
            BotError::SchemaIncompatible { .. } => 2,
            BotError::Signer(_) => 3,
            BotError::TransientNetwork(_) | BotError::Protocol(_) | BotError::Reorg { .. } => 4,
            _ => 1,
        }
    }
}

pub type BotResult<T> = Result<T, BotError>;

/// Classify a reqwest transport failure into the taxonomy.
impl From<reqwest::Error> for BotError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            BotError::Timeout(Duration::from_secs(0))
        } else if err.is_connect() || err.is_request() {
            BotError::TransientNetwork(err.to_string())
        } else {
            BotError::Protocol(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(BotError::TransientNetwork("reset".into()).is_transient());
        assert!(BotError::Timeout(Duration::from_millis(50)).is_transient());
        assert!(!BotError::Protocol("bad response".into()).is_transient());
        assert!(!BotError::Fatal("broken".into()).is_transient());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(BotError::Config("missing rpc".into()).exit_code(), 1);
        assert_eq!(
            BotError::SchemaIncompatible {
                found: 9,
                expected: 2
            }
            .exit_code(),
            2
        );
        assert_eq!(BotError::Signer("no key".into()).exit_code(), 3);
        assert_eq!(
            BotError::TransientNetwork("chain down".into()).exit_code(),
            4
        );
    }
}

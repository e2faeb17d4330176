//! raftd Error Types

use thiserror::Error;

/// Result type alias for raftd operations
pub type Result<T> = std::result::Result<T, Error>;

/// raftd error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Log store errors
    #[error("Log error: {0}")]
    Log(String),

    #[error("Log entry corrupted at index {index}: {reason}")]
    LogCorrupted { index: u64, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    // Ledger errors
    #[error("Ledger error: {0}")]
    Ledger(String),

    // Consensus errors
    #[error("Not leader: current leader is {leader_id} at {address}")]
    NotLeader { leader_id: String, address: String },

    #[error("No leader available")]
    NoLeader,

    #[error("A membership change is already in progress")]
    MembershipChangePending,

    #[error("Invalid node descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("Durable write failed, node halted: {0}")]
    Durability(String),

    #[error("Node halted after durability failure: {0}")]
    Halted(String),

    #[error("Timed out waiting for index {0} to commit")]
    CommitTimeout(u64),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("Remote error: {0}")]
    Remote(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionTimeout(_)
                | Error::ConnectionFailed { .. }
                | Error::Network(_)
                | Error::NoLeader
                | Error::NotLeader { .. }
                | Error::MembershipChangePending
                | Error::CommitTimeout(_)
        )
    }

    /// Check if this error means the node must stop participating
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Durability(_) | Error::Halted(_))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Ledger(format!("SQLite error: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(Error::NoLeader.is_retryable());
        assert!(Error::ConnectionTimeout("n2:7654".into()).is_retryable());
        assert!(!Error::NoLeader.is_fatal());

        let err = Error::Durability("fsync failed".into());
        assert!(err.is_fatal());
        assert!(!err.is_retryable());
    }
}

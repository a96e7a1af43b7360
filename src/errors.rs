//! Error types for the replication bridge
//! Structured error handling using thiserror, one variant per failure kind

use thiserror::Error;

/// Main error type for the replication bridge
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Malformed logical-decoding frame: unknown tag, short buffer,
    /// unexpected tuple-type byte. Fatal for the current batch.
    #[error("protocol error: {message}{}", context_suffix(.context))]
    Protocol {
        message: String,
        context: Option<String>,
    },

    /// A DML record arrived for a relation with no cached metadata and no
    /// resolvable declared types. The event is skipped.
    #[error("catalog error: {message}")]
    Catalog { message: String },

    /// A rendered statement was rejected by the target. The statement's
    /// implicit transaction rolls back and the batch continues.
    #[error("apply error: {message}")]
    Apply { message: String },

    /// Source or target unreachable, or replication prerequisites missing.
    #[error("connection error: {message}")]
    Connection {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Invalid configuration; surfaced to the supervisor before any worker
    /// starts.
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// PostgreSQL client errors
    #[error("postgres client error")]
    Postgres(#[from] tokio_postgres::Error),

    /// MySQL client errors
    #[error("mysql client error")]
    MySql(#[from] mysql_async::Error),

    /// Network/IO related errors
    #[error("network IO error")]
    NetworkIO(#[from] std::io::Error),

    /// String conversion errors
    #[error("string conversion error")]
    StringConversion(#[from] std::string::FromUtf8Error),

    /// Task execution errors for async operations
    #[error("task execution error")]
    TaskExecution(#[from] tokio::task::JoinError),

    /// MySQL connection URL parsing errors
    #[error("mysql url error")]
    MySqlUrl(#[from] mysql_async::UrlError),
}

fn context_suffix(context: &Option<String>) -> String {
    match context {
        Some(context) => format!(" ({context})"),
        None => String::new(),
    }
}

/// Result type alias for convenience
pub type BridgeResult<T> = std::result::Result<T, BridgeError>;

impl BridgeError {
    /// Create a protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
            context: None,
        }
    }

    /// Create a protocol error identifying the frame tag and byte offset
    pub fn protocol_at<S: Into<String>>(message: S, tag: u8, offset: usize) -> Self {
        Self::Protocol {
            message: message.into(),
            context: Some(format!("tag '{}' at byte {}", tag as char, offset)),
        }
    }

    /// Create a catalog error
    pub fn catalog<S: Into<String>>(message: S) -> Self {
        Self::Catalog {
            message: message.into(),
        }
    }

    /// Create a target apply error
    pub fn apply<S: Into<String>>(message: S) -> Self {
        Self::Apply {
            message: message.into(),
        }
    }

    /// Create a connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// True for errors the DML worker treats as skip-the-event rather than
    /// skip-the-batch.
    pub fn is_catalog(&self) -> bool {
        matches!(self, Self::Catalog { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_display_carries_tag_and_offset() {
        let err = BridgeError::protocol_at("unknown message tag", b'Z', 0);
        assert_eq!(
            err.to_string(),
            "protocol error: unknown message tag (tag 'Z' at byte 0)"
        );
    }

    #[test]
    fn protocol_display_without_context_stays_bare() {
        let err = BridgeError::protocol("empty frame");
        assert_eq!(err.to_string(), "protocol error: empty frame");
    }
}

//! Error types for the connection cache
//!
//! Provides structured error types for the per-shard registry, the shard set
//! that hosts it, and the reconnecting transports it owns.

use crate::domain::ports::{NodeId, ShardId};
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Unified error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Registry Errors
    // =========================================================================
    #[error("Cannot {operation} node {node}, belonging to shard {owner}, on shard {shard}")]
    ShardAffinityViolation {
        operation: &'static str,
        node: NodeId,
        owner: ShardId,
        shard: ShardId,
    },

    #[error("Cannot {operation} on the cache of shard {shard} from {}", describe_current(.current))]
    OffShard {
        operation: &'static str,
        shard: ShardId,
        current: Option<ShardId>,
    },

    #[error("Connection cache of shard {shard} is stopped")]
    CacheStopped { shard: ShardId },

    #[error("{} transport(s) failed to stop: {}", .failures.len(), StopFailure::join(.failures))]
    StopFailed { failures: Vec<StopFailure> },

    // =========================================================================
    // Shard Set Errors
    // =========================================================================
    #[error("Shard {shard} out of range (shard count {shard_count})")]
    InvalidShard { shard: ShardId, shard_count: usize },

    #[error("Shard {shard} is not running")]
    ShardUnavailable { shard: ShardId },

    // =========================================================================
    // Transport Errors
    // =========================================================================
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Connection to {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: SocketAddr, timeout: Duration },

    #[error("Connection to {addr} is backing off, retry in {retry_in:?}")]
    Backoff { addr: SocketAddr, retry_in: Duration },

    #[error("Not connected to {addr}")]
    NotConnected { addr: SocketAddr },

    #[error("Transport to {addr} is stopped")]
    TransportStopped { addr: SocketAddr },

    // =========================================================================
    // Parse / IO Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn describe_current(current: &Option<ShardId>) -> String {
    match current {
        Some(shard) => format!("shard {shard}"),
        None => "outside any shard".to_string(),
    }
}

/// A single transport that failed to shut down during a drain
#[derive(Debug)]
pub struct StopFailure {
    pub node: NodeId,
    pub error: Box<Error>,
}

impl StopFailure {
    pub fn new(node: NodeId, error: Error) -> Self {
        Self {
            node,
            error: Box::new(error),
        }
    }

    fn join(failures: &[StopFailure]) -> String {
        failures
            .iter()
            .map(|f| f.to_string())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

impl fmt::Display for StopFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node {}: {}", self.node, self.error)
    }
}

/// What a caller should do with an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Retry later, the transport's own backoff applies
    RetryWithBackoff,
    /// Retry after a known delay
    RetryAfter(Duration),
    /// Route the request to the owning shard instead
    Reroute(ShardId),
    /// Caller bug or bad configuration, never retry
    Fail,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            Error::ShardAffinityViolation { owner, .. } => ErrorAction::Reroute(*owner),
            Error::OffShard { shard, .. } => ErrorAction::Reroute(*shard),

            Error::Backoff { retry_in, .. } => ErrorAction::RetryAfter(*retry_in),

            Error::Connect { .. }
            | Error::ConnectTimeout { .. }
            | Error::NotConnected { .. }
            | Error::Io(_) => ErrorAction::RetryWithBackoff,

            Error::Configuration(_)
            | Error::InvalidShard { .. }
            | Error::JsonParse(_)
            | Error::TransportStopped { .. }
            | Error::ShardUnavailable { .. }
            | Error::StopFailed { .. }
            | Error::CacheStopped { .. }
            | Error::Internal(_) => ErrorAction::Fail,
        }
    }

    /// Check if this error is retryable on the same shard
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.action(),
            ErrorAction::RetryWithBackoff | ErrorAction::RetryAfter(_)
        )
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Connect { .. }
                | Error::ConnectTimeout { .. }
                | Error::Backoff { .. }
                | Error::NotConnected { .. }
        )
    }
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;

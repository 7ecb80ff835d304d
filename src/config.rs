//! Configuration
//!
//! Value objects describing how to reach a peer, how the cache is tuned, and
//! the static cluster membership the binary boots from.

use crate::domain::ports::NodeId;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

// =============================================================================
// Backoff Configuration
// =============================================================================

/// Exponential reconnect backoff bounds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// First wait after a failed dial, in milliseconds
    pub initial_ms: u64,
    /// Upper bound on any single wait, in milliseconds
    pub max_ms: u64,
    /// Growth factor between consecutive waits
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 100,
            max_ms: 5_000,
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    pub fn initial(&self) -> Duration {
        Duration::from_millis(self.initial_ms)
    }

    pub fn max(&self) -> Duration {
        Duration::from_millis(self.max_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.initial_ms == 0 {
            return Err(Error::Configuration("backoff initial_ms must be > 0".into()));
        }
        if self.max_ms < self.initial_ms {
            return Err(Error::Configuration(format!(
                "backoff max_ms ({}) must be >= initial_ms ({})",
                self.max_ms, self.initial_ms
            )));
        }
        if !(self.multiplier >= 1.0) {
            return Err(Error::Configuration(format!(
                "backoff multiplier must be >= 1.0, got {}",
                self.multiplier
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Transport Configuration
// =============================================================================

/// How to reach one peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Peer RPC address
    pub server_addr: SocketAddr,
    /// Dial timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Set TCP_NODELAY on established streams
    #[serde(default = "default_nodelay")]
    pub nodelay: bool,
    /// Reconnect backoff
    #[serde(default)]
    pub backoff: BackoffConfig,
}

fn default_connect_timeout_ms() -> u64 {
    1_000
}

fn default_nodelay() -> bool {
    true
}

impl TransportConfig {
    /// Config for `server_addr` with default tuning
    pub fn new(server_addr: SocketAddr) -> Self {
        Self {
            server_addr,
            connect_timeout_ms: default_connect_timeout_ms(),
            nodelay: default_nodelay(),
            backoff: BackoffConfig::default(),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.connect_timeout_ms == 0 {
            return Err(Error::Configuration(format!(
                "connect timeout for {} must be > 0",
                self.server_addr
            )));
        }
        self.backoff.validate()
    }
}

// =============================================================================
// Cache Configuration
// =============================================================================

/// Tuning for a single shard's connection cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Capacity of the cache event broadcast channel
    pub event_channel_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            event_channel_capacity: 256,
        }
    }
}

// =============================================================================
// Cluster Membership
// =============================================================================

/// A peer the local node should hold a connection to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub node_id: NodeId,
    pub addr: SocketAddr,
}

impl FromStr for Member {
    type Err = Error;

    /// Parses `<node_id>=<host:port>`
    fn from_str(s: &str) -> Result<Self> {
        let (id, addr) = s.split_once('=').ok_or_else(|| {
            Error::Configuration(format!("Invalid member '{}', expected <id>=<addr>", s))
        })?;
        let addr = addr.trim().parse().map_err(|e| {
            Error::Configuration(format!("Invalid member address '{}': {}", addr, e))
        })?;
        Ok(Self {
            node_id: id.parse()?,
            addr,
        })
    }
}

/// Load a JSON array of members from `path`
pub fn load_members(path: impl AsRef<Path>) -> Result<Vec<Member>> {
    let raw = std::fs::read_to_string(path.as_ref())?;
    let members: Vec<Member> = serde_json::from_str(&raw)?;
    Ok(members)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_transport_config_defaults() {
        let config = TransportConfig::new("127.0.0.1:33145".parse().unwrap());
        assert_eq!(config.connect_timeout(), Duration::from_secs(1));
        assert!(config.nodelay);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_transport_config_partial_json() {
        let config: TransportConfig =
            serde_json::from_str(r#"{"server_addr":"10.0.0.2:33145","backoff":{"max_ms":800}}"#)
                .unwrap();
        assert_eq!(config.connect_timeout_ms, 1_000);
        assert_eq!(config.backoff.initial_ms, 100);
        assert_eq!(config.backoff.max(), Duration::from_millis(800));
    }

    #[test]
    fn test_backoff_validation() {
        let bad = BackoffConfig {
            initial_ms: 500,
            max_ms: 100,
            multiplier: 2.0,
        };
        assert!(bad.validate().is_err());

        let bad = BackoffConfig {
            multiplier: 0.5,
            ..Default::default()
        };
        assert!(bad.validate().is_err());

        let config = TransportConfig::new("127.0.0.1:1".parse().unwrap())
            .with_connect_timeout(Duration::ZERO);
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_member_from_str() {
        let member: Member = "3=127.0.0.1:33145".parse().unwrap();
        assert_eq!(member.node_id, NodeId(3));
        assert_eq!(member.addr, "127.0.0.1:33145".parse().unwrap());

        assert!("3".parse::<Member>().is_err());
        assert!("x=127.0.0.1:1".parse::<Member>().is_err());
        assert!("3=localhost".parse::<Member>().is_err());
    }

    #[test]
    fn test_load_members_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"node_id":1,"addr":"127.0.0.1:9001"}},{{"node_id":2,"addr":"127.0.0.1:9002"}}]"#
        )
        .unwrap();

        let members = load_members(file.path()).unwrap();
        assert_eq!(members.len(), 2);
        assert_eq!(members[1].node_id, NodeId(2));
    }

    #[test]
    fn test_load_members_bad_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(matches!(load_members(file.path()), Err(Error::JsonParse(_))));
    }
}

//! Reconnecting Transports
//!
//! Concrete [`Transport`](crate::domain::ports::Transport) implementations the
//! connection cache can hold. A transport owns dialing, retry/backoff and raw
//! I/O for one peer; the cache only builds it and, on drain, stops it.

pub mod reconnect;

pub use reconnect::ReconnectTransport;

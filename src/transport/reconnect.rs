//! TCP Reconnecting Transport
//!
//! Lazily dials a peer on first use, redials after failures subject to an
//! exponential backoff window, and refuses all work once stopped.

use crate::config::TransportConfig;
use crate::domain::ports::Transport;
use crate::error::{Error, Result};
use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Connection state guarded by the transport's mutex
struct ConnState {
    stream: Option<TcpStream>,
    backoff: ExponentialBackoff,
    /// Earliest instant the next dial is allowed
    retry_at: Option<Instant>,
}

/// A TCP connection to one peer that re-establishes itself on demand
pub struct ReconnectTransport {
    config: TransportConfig,
    state: Mutex<ConnState>,
    connected: AtomicBool,
    stopped: AtomicBool,
    dial_attempts: AtomicU64,
}

impl std::fmt::Debug for ReconnectTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectTransport")
            .field("server_addr", &self.config.server_addr)
            .field("connected", &self.connected.load(Ordering::Relaxed))
            .field("stopped", &self.stopped.load(Ordering::Relaxed))
            .finish()
    }
}

impl ReconnectTransport {
    /// Create a transport without dialing
    pub fn new(config: TransportConfig) -> Result<Self> {
        config.validate()?;
        let backoff = ExponentialBackoff {
            current_interval: config.backoff.initial(),
            initial_interval: config.backoff.initial(),
            max_interval: config.backoff.max(),
            multiplier: config.backoff.multiplier,
            randomization_factor: 0.0,
            max_elapsed_time: None,
            ..Default::default()
        };
        Ok(Self {
            config,
            state: Mutex::new(ConnState {
                stream: None,
                backoff,
                retry_at: None,
            }),
            connected: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            dial_attempts: AtomicU64::new(0),
        })
    }

    /// Configuration this transport was built from
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Number of dials attempted so far
    pub fn dial_attempts(&self) -> u64 {
        self.dial_attempts.load(Ordering::Relaxed)
    }

    /// Whether `stop` has been called
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Ensure a live connection exists, dialing if allowed
    pub async fn connect(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.ensure_connected(&mut state).await
    }

    /// Write `data` to the peer as-is, connecting first if needed.
    ///
    /// A failed write drops the stream so the next call redials.
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock().await;
        self.ensure_connected(&mut state).await?;

        let addr = self.config.server_addr;
        let stream = state
            .stream
            .as_mut()
            .ok_or(Error::NotConnected { addr })?;

        if let Err(e) = stream.write_all(data).await {
            warn!(addr = %addr, error = %e, "write failed, dropping connection");
            state.stream = None;
            self.connected.store(false, Ordering::Release);
            return Err(e.into());
        }
        Ok(())
    }

    /// Forget any pending backoff so the next call dials immediately
    pub async fn reset_backoff(&self) {
        let mut state = self.state.lock().await;
        state.backoff.reset();
        state.retry_at = None;
    }

    async fn ensure_connected(&self, state: &mut ConnState) -> Result<()> {
        let addr = self.config.server_addr;
        if self.is_stopped() {
            return Err(Error::TransportStopped { addr });
        }
        if state.stream.is_some() {
            return Ok(());
        }

        let now = Instant::now();
        if let Some(retry_at) = state.retry_at {
            if now < retry_at {
                return Err(Error::Backoff {
                    addr,
                    retry_in: retry_at - now,
                });
            }
        }

        self.dial_attempts.fetch_add(1, Ordering::Relaxed);
        let timeout = self.config.connect_timeout();
        let result = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(source)) => Err(Error::Connect { addr, source }),
            Err(_) => Err(Error::ConnectTimeout { addr, timeout }),
        };

        match result {
            Ok(stream) => {
                if self.config.nodelay {
                    stream.set_nodelay(true)?;
                }
                state.stream = Some(stream);
                state.backoff.reset();
                state.retry_at = None;
                self.connected.store(true, Ordering::Release);
                debug!(addr = %addr, "connected");
                Ok(())
            }
            Err(e) => {
                let wait = state
                    .backoff
                    .next_backoff()
                    .unwrap_or_else(|| self.config.backoff.max());
                state.retry_at = Some(Instant::now() + wait);
                debug!(addr = %addr, error = %e, retry_in = ?wait, "dial failed");
                Err(e)
            }
        }
    }
}

#[async_trait]
impl Transport for ReconnectTransport {
    type Config = TransportConfig;

    async fn build(config: TransportConfig) -> Result<Self> {
        Self::new(config)
    }

    fn server_addr(&self) -> SocketAddr {
        self.config.server_addr
    }

    fn is_valid(&self) -> bool {
        self.connected.load(Ordering::Acquire) && !self.is_stopped()
    }

    async fn stop(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.connected.store(false, Ordering::Release);

        let mut state = self.state.lock().await;
        if let Some(mut stream) = state.stream.take() {
            match stream.shutdown().await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotConnected => {}
                Err(e) => return Err(e.into()),
            }
        }
        debug!(addr = %self.config.server_addr, "transport stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackoffConfig;
    use assert_matches::assert_matches;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn closed_addr() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr
    }

    fn slow_backoff() -> BackoffConfig {
        BackoffConfig {
            initial_ms: 60_000,
            max_ms: 120_000,
            multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn test_build_is_lazy() {
        let addr = closed_addr().await;
        let transport = ReconnectTransport::build(TransportConfig::new(addr))
            .await
            .unwrap();
        assert_eq!(transport.server_addr(), addr);
        assert!(!transport.is_valid());
        assert_eq!(transport.dial_attempts(), 0);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let config = TransportConfig::new("127.0.0.1:1".parse().unwrap())
            .with_connect_timeout(Duration::ZERO);
        assert_matches!(
            ReconnectTransport::build(config).await,
            Err(Error::Configuration(_))
        );
    }

    #[tokio::test]
    async fn test_connect_and_send() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            socket.read_exact(&mut buf).await.unwrap();
            buf
        });

        let transport = ReconnectTransport::new(TransportConfig::new(addr)).unwrap();
        transport.send(b"hello").await.unwrap();
        assert!(transport.is_valid());
        assert_eq!(transport.dial_attempts(), 1);

        assert_eq!(&server.await.unwrap(), b"hello");

        // already connected, no redial
        transport.connect().await.unwrap();
        assert_eq!(transport.dial_attempts(), 1);
    }

    #[tokio::test]
    async fn test_failed_dial_enters_backoff() {
        let addr = closed_addr().await;
        let config = TransportConfig::new(addr).with_backoff(slow_backoff());
        let transport = ReconnectTransport::new(config).unwrap();

        assert_matches!(transport.connect().await, Err(Error::Connect { .. }));
        assert_eq!(transport.dial_attempts(), 1);

        // inside the backoff window nothing is dialed
        let err = transport.connect().await.unwrap_err();
        assert_matches!(err, Error::Backoff { .. });
        assert!(err.is_retryable());
        assert_eq!(transport.dial_attempts(), 1);

        transport.reset_backoff().await;
        assert_matches!(transport.connect().await, Err(Error::Connect { .. }));
        assert_eq!(transport.dial_attempts(), 2);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_final() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.map(|(s, _)| s) });

        let transport = ReconnectTransport::new(TransportConfig::new(addr)).unwrap();
        transport.connect().await.unwrap();
        let _peer = accept.await.unwrap().unwrap();

        transport.stop().await.unwrap();
        transport.stop().await.unwrap();
        assert!(transport.is_stopped());
        assert!(!transport.is_valid());

        assert_matches!(transport.connect().await, Err(Error::TransportStopped { .. }));
        assert_matches!(transport.send(b"x").await, Err(Error::TransportStopped { .. }));
    }
}

//! Connection Cache Node
//!
//! Boots a thread-per-core shard set, materializes connections toward a static
//! cluster membership on the shards that own them, and drains everything on
//! Ctrl-C.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  --peer 1=10.0.0.1:33145   --members members.json             │
//! └──────────────────────────────┬───────────────────────────────┘
//!                                │ shard_for(node)
//!            ┌───────────────────┼───────────────────┐
//!     ┌──────┴──────┐     ┌──────┴──────┐     ┌──────┴──────┐
//!     │   shard-0   │     │   shard-1   │     │   shard-N   │
//!     └─────────────┘     └─────────────┘     └─────────────┘
//! ```

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use connection_cache::{
    load_members, BackoffConfig, Error, Member, Result, ShardSet, TransportConfig,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Connection Cache - per-shard RPC connections toward cluster peers
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of shards (defaults to the available parallelism)
    #[arg(long, env = "SHARDS")]
    shards: Option<usize>,

    /// Peer as <node_id>=<host:port>, may be repeated
    #[arg(long = "peer", env = "PEERS", value_delimiter = ',')]
    peers: Vec<Member>,

    /// JSON file with a list of {"node_id", "addr"} members
    #[arg(long, env = "MEMBERS_FILE")]
    members: Option<PathBuf>,

    /// Dial timeout per connection attempt in milliseconds
    #[arg(long, env = "CONNECT_TIMEOUT_MS", default_value = "1000")]
    connect_timeout_ms: u64,

    /// First reconnect backoff in milliseconds
    #[arg(long, env = "BACKOFF_INITIAL_MS", default_value = "100")]
    backoff_initial_ms: u64,

    /// Maximum reconnect backoff in milliseconds
    #[arg(long, env = "BACKOFF_MAX_MS", default_value = "5000")]
    backoff_max_ms: u64,

    /// Dial every peer right after registering it
    #[arg(long, env = "EAGER_CONNECT")]
    eager_connect: bool,

    /// Interval between stats log lines in seconds (0 disables)
    #[arg(long, env = "STATS_INTERVAL_SECS", default_value = "30")]
    stats_interval_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn shard_count(&self) -> usize {
        self.shards.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    fn transport_config(&self, member: &Member) -> Result<TransportConfig> {
        let config = TransportConfig::new(member.addr)
            .with_connect_timeout(Duration::from_millis(self.connect_timeout_ms))
            .with_backoff(BackoffConfig {
                initial_ms: self.backoff_initial_ms,
                max_ms: self.backoff_max_ms,
                ..Default::default()
            });
        config.validate()?;
        Ok(config)
    }

    fn membership(&self) -> Result<Vec<Member>> {
        let mut members = self.peers.clone();
        if let Some(path) = &self.members {
            members.extend(load_members(path)?);
        }
        members.sort_by_key(|m| m.node_id);
        members.dedup_by_key(|m| m.node_id);
        Ok(members)
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    let members = args.membership()?;
    let shard_count = args.shard_count();

    info!("Starting Connection Cache node");
    info!("  Version: {}", connection_cache::VERSION);
    info!("  Shards: {}", shard_count);
    info!("  Members: {}", members.len());

    let shards: Arc<ShardSet> = Arc::new(ShardSet::with_shards(shard_count)?);

    for member in &members {
        let config = args.transport_config(member)?;
        let node = member.node_id;
        match shards.insert(node, config).await {
            Ok(()) => info!(
                node = %node,
                shard = shards.shard_for(node),
                addr = %member.addr,
                "Registered peer"
            ),
            Err(e) => error!(node = %node, error = %e, "Failed to register peer"),
        }

        if args.eager_connect {
            connect_peer(&shards, member).await;
        }
    }

    let shutdown = CancellationToken::new();
    let reporter = (args.stats_interval_secs > 0).then(|| {
        tokio::spawn(report_stats(
            shards.clone(),
            Duration::from_secs(args.stats_interval_secs),
            shutdown.clone(),
        ))
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested, draining shards");

    shutdown.cancel();
    if let Some(reporter) = reporter {
        if let Err(e) = reporter.await {
            warn!(error = %e, "Stats reporter ended abnormally");
        }
    }

    if let Err(e) = shards.stop().await {
        error!(error = %e, "Shard set did not stop cleanly");
        return Err(e);
    }

    info!("Connection cache shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_names(true))
            .init();
    }
}

// =============================================================================
// Peers
// =============================================================================

async fn connect_peer(shards: &ShardSet, member: &Member) {
    let node = member.node_id;
    let dialed = shards
        .invoke_on_owner(node, move |cache| async move {
            match cache.lookup(node) {
                Some(transport) => transport.connect().await,
                None => Err(Error::Internal(format!("node {node} has no transport"))),
            }
        })
        .await
        .and_then(|result| result);

    match dialed {
        Ok(()) => info!(node = %node, addr = %member.addr, "Connected to peer"),
        Err(e) => warn!(
            node = %node,
            addr = %member.addr,
            error = %e,
            retryable = e.is_retryable(),
            "Initial dial failed, transport will retry lazily"
        ),
    }
}

// =============================================================================
// Stats Reporter
// =============================================================================

async fn report_stats(shards: Arc<ShardSet>, every: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                for snapshot in shards.stats().await {
                    info!(
                        shard = snapshot.shard,
                        entries = snapshot.entries,
                        mutations = snapshot.total_mutations(),
                        replacements = snapshot.replacements,
                        affinity_violations = snapshot.affinity_violations,
                        hit_ratio = snapshot.hit_ratio(),
                        "Shard stats"
                    );
                }
            }
        }
    }
}

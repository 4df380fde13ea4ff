//! Tether Relay Server
//!
//! gRPC relay that grants leases, parks members on long-lived streams and
//! relays session commands to them.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tracing::{info, warn};

use tether_core::db::unix_timestamp;
use tether_proto::v1::relay_service_server::RelayServiceServer;

use tether_relay::config::{FailurePolicy, RelayConfig};
use tether_relay::observer::{RelayObserver, TracingObserver};
use tether_relay::registration::RegistrationService;
use tether_relay::registry::ConnectionRegistry;
use tether_relay::relay::RelayService;
use tether_relay::server::RelayServiceImpl;
use tether_relay::storage::{LeaseRepository, RelayDatabase};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum PolicyArg {
    /// End a session on its first failed step.
    Abort,
    /// Keep relaying after failures, up to --max-consecutive-failures.
    Tolerate,
}

#[derive(Parser, Debug)]
#[command(name = "tether-relay")]
#[command(version, about = "Tether relay server - leases, member registry and session relay")]
struct Args {
    /// Address to listen on.
    #[arg(long, env = "TETHER_ADDR", default_value = "0.0.0.0:50051")]
    addr: SocketAddr,

    /// Path to SQLite database file.
    #[arg(long, env = "TETHER_DB_PATH", conflicts_with = "in_memory")]
    db_path: Option<PathBuf>,

    /// Keep leases in a private in-memory database.
    #[arg(long, env = "TETHER_IN_MEMORY")]
    in_memory: bool,

    /// Upper bound on every lease check, in milliseconds.
    #[arg(long, env = "TETHER_VALIDATION_TIMEOUT_MS", default_value_t = 5000)]
    validation_timeout_ms: u64,

    /// What a session does when a relay step fails.
    #[arg(long, env = "TETHER_FAILURE_POLICY", value_enum, default_value_t = PolicyArg::Abort)]
    failure_policy: PolicyArg,

    /// Failures in a row a tolerant session survives.
    #[arg(long, env = "TETHER_MAX_CONSECUTIVE_FAILURES", default_value_t = 3)]
    max_consecutive_failures: u32,

    /// Buffer size of each outbound stream.
    #[arg(long, env = "TETHER_CHANNEL_CAPACITY", default_value_t = 32)]
    channel_capacity: usize,

    /// Seconds between sweeps of expired leases.
    #[arg(long, env = "TETHER_LEASE_CLEANUP_INTERVAL_SECS", default_value_t = 300)]
    lease_cleanup_interval_secs: u64,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "TETHER_LOG_JSON")]
    log_json: bool,

    /// OpenTelemetry OTLP endpoint for traces and metrics export
    /// (e.g. `http://localhost:4317`). Requires the `metrics` feature.
    #[cfg(feature = "metrics")]
    #[arg(long, env = "TETHER_METRICS_ENDPOINT")]
    metrics_endpoint: Option<String>,
}

impl Args {
    fn relay_config(&self) -> RelayConfig {
        let failure_policy = match self.failure_policy {
            PolicyArg::Abort => FailurePolicy::Abort,
            PolicyArg::Tolerate => FailurePolicy::Tolerate {
                max_consecutive: self.max_consecutive_failures.max(1),
            },
        };
        RelayConfig {
            validation_timeout: Duration::from_millis(self.validation_timeout_ms),
            failure_policy,
            channel_capacity: self.channel_capacity.max(1),
        }
    }
}

#[tokio::main]
#[allow(clippy::too_many_lines)]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tether_core::tracing_init::init_tracing("tether_relay=info", args.log_json);

    // Hold the guard so the OTel pipeline stays alive for the process lifetime.
    #[cfg(feature = "metrics")]
    let metrics_guard = match args.metrics_endpoint.as_deref() {
        Some(endpoint) => Some(tether_core::metrics::init_metrics(endpoint, "tether-relay")?),
        None => None,
    };

    let config = args.relay_config();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %args.addr,
        validation_timeout = ?config.validation_timeout,
        failure_policy = ?config.failure_policy,
        "Starting tether-relay"
    );

    let db = if args.in_memory {
        info!("Using in-memory lease database");
        RelayDatabase::open_in_memory().await?
    } else {
        let path = match &args.db_path {
            Some(path) => path.clone(),
            None => default_db_path()?,
        };
        info!(path = %path.display(), "Opening relay database");
        RelayDatabase::open(&path).await?
    };

    match db.list_live_identifiers().await {
        Ok(identifiers) => info!(count = identifiers.len(), "Loaded live leases"),
        Err(e) => warn!(error = %e, "Failed to list live leases"),
    }

    let shutdown = CancellationToken::new();

    let observer = TracingObserver::new();
    #[cfg(feature = "metrics")]
    let observer = if metrics_guard.is_some() {
        observer.with_otel()
    } else {
        observer
    };
    let observer = Arc::new(observer);

    let registration = Arc::new(RegistrationService::new(
        Arc::new(db.clone()) as Arc<dyn LeaseRepository>,
        config.validation_timeout,
    ));
    let relay = Arc::new(RelayService::new(
        Arc::clone(&registration),
        ConnectionRegistry::new(),
        Arc::clone(&observer) as Arc<dyn RelayObserver>,
        config,
        shutdown.clone(),
    ));
    let service = RelayServiceImpl::new(relay, registration);

    // Periodically drop leases that can no longer validate anything.
    let cleanup_db = db.clone();
    let cleanup_shutdown = shutdown.clone();
    let cleanup_every = Duration::from_secs(args.lease_cleanup_interval_secs.max(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(cleanup_every);
        interval.tick().await; // Skip first immediate tick
        loop {
            tokio::select! {
                () = cleanup_shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            match cleanup_db.delete_expired_leases(unix_timestamp()).await {
                Ok(removed) if removed > 0 => {
                    info!(removed, "Background lease cleanup completed");
                }
                Err(e) => {
                    warn!(error = %e, "Background lease cleanup failed");
                }
                _ => {}
            }
        }
    });

    let (health_reporter, health_service) = tonic_health::server::health_reporter();
    health_reporter
        .set_serving::<RelayServiceServer<RelayServiceImpl>>()
        .await;

    info!(addr = %args.addr, "Relay server starting (plaintext)");

    let signal = shutdown.clone();
    Server::builder()
        .http2_keepalive_interval(Some(Duration::from_secs(30)))
        .http2_keepalive_timeout(Some(Duration::from_secs(10)))
        .add_service(health_service)
        .add_service(RelayServiceServer::new(service))
        .serve_with_shutdown(args.addr, async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            info!("Received shutdown signal");
            signal.cancel();
        })
        .await?;

    let totals = observer.snapshot();
    info!(
        requests = totals.requests,
        errors = totals.errors,
        throughput_bytes = totals.throughput_bytes,
        "Relay stopped"
    );

    #[cfg(feature = "metrics")]
    if let Some(guard) = metrics_guard {
        guard.shutdown()?;
    }

    Ok(())
}

fn default_db_path() -> anyhow::Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Cannot determine home directory"))?;
    Ok(home.join(".tether").join("relay.db"))
}

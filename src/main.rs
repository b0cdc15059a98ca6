//! Tenant Disk Operator
//!
//! Disk-as-a-service control plane for Kubernetes: hands out named persistent
//! disks to tenant projects under per-project capacity limits and keeps their
//! usage, status and expiry current.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │   REST API :8090          Health :8081            Metrics :8080              │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │   Disk Service (naming reservation, quota, state machine)                    │
//! │   Usage Watcher (usage, expiry, overuse, orphaned reservations)              │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │   Orchestrator Gateway: Kubernetes API server, or in-memory (--standalone)   │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```

use anyhow::Context;
use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tenant_disk_operator::domain::quantity::parse_quantity;
use tenant_disk_operator::{
    ApiServer, ApiServerConfig, ConflictRetry, DiskMetrics, DiskService, DiskServiceConfig,
    ExpiryAnchor, GatewayFactory, InMemoryConfig, KubeGatewayConfig, NamingConfig,
    OrchestratorGateway, OrchestratorGatewayRef, OverusePolicy, QuotaLimits, UsageWatcher,
    WatcherConfig,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Which parts of the control plane this process runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Component {
    Api,
    Watcher,
    All,
}

impl Component {
    fn runs_api(self) -> bool {
        matches!(self, Component::Api | Component::All)
    }

    fn runs_watcher(self) -> bool {
        matches!(self, Component::Watcher | Component::All)
    }
}

/// Tenant Disk Operator - Disk-as-a-Service Control Plane
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// REST API bind address
    #[arg(long, env = "API_ADDR", default_value = "0.0.0.0:8090")]
    api_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Components to run
    #[arg(long, env = "COMPONENTS", value_enum, default_value_t = Component::All)]
    components: Component,

    /// Storage class for new claims (cluster default when unset)
    #[arg(long, env = "STORAGE_CLASS")]
    storage_class: Option<String>,

    /// Per-project storage limit (e.g. "64Gi")
    #[arg(long, env = "PROJECT_STORAGE_LIMIT", default_value = "64Gi")]
    project_limit: String,

    /// YAML file with the default limit and per org/project overrides
    #[arg(long, env = "QUOTA_FILE")]
    quota_file: Option<PathBuf>,

    /// Orchestrator request timeout in seconds
    #[arg(long, env = "REQUEST_TIMEOUT", default_value = "10")]
    request_timeout_secs: u64,

    /// Usage watcher interval in seconds
    #[arg(long, env = "WATCH_INTERVAL", default_value = "60")]
    watch_interval_secs: u64,

    /// Attempts for updates that hit a version conflict
    #[arg(long, env = "CONFLICT_RETRIES", default_value = "5")]
    conflict_retries: u32,

    /// Seconds before an unbound name reservation may be reclaimed
    #[arg(long, env = "RESERVATION_GRACE", default_value = "60")]
    reservation_grace_secs: u64,

    /// Where disk life spans count from (created-at, last-used)
    #[arg(long, env = "EXPIRY_ANCHOR", default_value = "created-at")]
    expiry_anchor: String,

    /// What to do with disks using more than requested (ignore, log, remove)
    #[arg(long, env = "OVERUSE_POLICY", default_value = "log")]
    overuse_policy: String,

    /// Allowed CORS origins, comma separated, `*` for any
    #[arg(long, env = "CORS_ORIGINS", value_delimiter = ',')]
    cors_origins: Vec<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Run in standalone mode (in-memory orchestrator, no Kubernetes)
    #[arg(long, env = "STANDALONE")]
    standalone: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args)?;

    info!("Starting Tenant Disk Operator");
    info!("  Version: {}", tenant_disk_operator::VERSION);
    info!("  Components: {:?}", args.components);
    info!("  Standalone mode: {}", args.standalone);

    let retry = ConflictRetry {
        max_attempts: args.conflict_retries,
        ..Default::default()
    };
    let quota = match &args.quota_file {
        Some(path) => QuotaLimits::from_yaml_file(path)
            .with_context(|| format!("failed to load quota file {}", path.display()))?,
        None => QuotaLimits::uniform(
            parse_quantity(&args.project_limit).context("invalid project storage limit")?,
        ),
    };
    info!(
        "  Default project limit: {} bytes ({} overrides)",
        quota.default_limit_bytes,
        quota.scopes.len()
    );

    let gateway: OrchestratorGatewayRef = if args.standalone {
        GatewayFactory::in_memory(InMemoryConfig { auto_bind: true })
    } else {
        let client = kube::Client::try_default()
            .await
            .context("failed to create Kubernetes client")?;
        GatewayFactory::kube(
            client,
            KubeGatewayConfig {
                request_timeout: Duration::from_secs(args.request_timeout_secs),
                ..Default::default()
            },
        )
    };
    info!("Orchestrator gateway: {}", gateway.gateway_name());

    let metrics = Arc::new(DiskMetrics::new()?);
    let service = DiskService::new(
        gateway,
        DiskServiceConfig {
            default_storage_class: args.storage_class.clone(),
            naming: NamingConfig {
                reservation_grace: Duration::from_secs(args.reservation_grace_secs),
                retry: retry.clone(),
                ..Default::default()
            },
            quota,
            retry: retry.clone(),
        },
        metrics.clone(),
    );

    // Start health server
    let health_addr = parse_addr(&args.health_addr, "health server")?;
    tokio::spawn(async move {
        if let Err(e) = run_health_server(health_addr).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = parse_addr(&args.metrics_addr, "metrics server")?;
    let served_metrics = metrics.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(metrics_addr, served_metrics).await {
            error!("Metrics server error: {}", e);
        }
    });

    let shutdown = CancellationToken::new();

    let watcher = if args.components.runs_watcher() {
        let watcher = UsageWatcher::new(
            service.clone(),
            WatcherConfig {
                interval: Duration::from_secs(args.watch_interval_secs),
                expiry_anchor: args.expiry_anchor.parse::<ExpiryAnchor>()?,
                overuse_policy: args.overuse_policy.parse::<OverusePolicy>()?,
                retry: retry.clone(),
            },
        );
        let token = shutdown.clone();
        Some(tokio::spawn(async move { watcher.run(token).await }))
    } else {
        None
    };

    let mut api = if args.components.runs_api() {
        let server = Arc::new(ApiServer::new(
            ApiServerConfig {
                addr: parse_addr(&args.api_addr, "REST API")?,
                cors_origins: args.cors_origins.clone(),
            },
            service.clone(),
        ));
        let handle = tokio::spawn({
            let server = server.clone();
            async move { server.run().await }
        });
        Some((server, handle))
    } else {
        None
    };

    let mut api_finished = false;
    let api_exit = async {
        match api.as_mut() {
            Some((_, handle)) => handle.await,
            None => std::future::pending().await,
        }
    };
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for shutdown signal")?;
            info!("Shutdown requested");
        }
        result = api_exit => {
            api_finished = true;
            shutdown.cancel();
            result
                .context("REST API task panicked")?
                .context("REST API server failed")?;
        }
    }

    shutdown.cancel();
    if let Some((server, handle)) = api {
        if !api_finished {
            server.shutdown();
            handle.await.context("REST API task panicked")??;
        }
    }
    if let Some(handle) = watcher {
        handle.await.context("usage watcher task panicked")?;
    }

    info!("Operator shutdown complete");
    Ok(())
}

fn parse_addr(raw: &str, what: &str) -> anyhow::Result<SocketAddr> {
    raw.parse()
        .with_context(|| format!("invalid {} address {}", what, raw))
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse()?)
        .add_directive("kube=info".parse()?)
        .add_directive("tower=warn".parse()?)
        .add_directive("axum=info".parse()?);

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
    Ok(())
}

// =============================================================================
// Health Server
// =============================================================================

fn plain_response(status: hyper::StatusCode, body: &'static str) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(hyper::Body::from(body));
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: SocketAddr) -> anyhow::Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/healthz" | "/livez" | "/readyz" => plain_response(StatusCode::OK, "ok"),
                _ => plain_response(StatusCode::NOT_FOUND, "not found"),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    info!("Health server listening on {}", addr);
    Server::try_bind(&addr)
        .context("failed to bind health server")?
        .serve(make_svc)
        .await
        .context("health server failed")?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

fn metrics_response(metrics: &DiskMetrics, path: &str) -> hyper::Response<hyper::Body> {
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::StatusCode;

    if path != "/metrics" {
        return plain_response(StatusCode::NOT_FOUND, "not found");
    }

    match metrics.encode() {
        Ok((content_type, body)) => {
            let mut response = hyper::Response::new(hyper::Body::from(body));
            if let Ok(value) = HeaderValue::from_str(&content_type) {
                response.headers_mut().insert(CONTENT_TYPE, value);
            }
            response
        }
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            plain_response(StatusCode::INTERNAL_SERVER_ERROR, "metrics unavailable")
        }
    }
}

async fn run_metrics_server(addr: SocketAddr, metrics: Arc<DiskMetrics>) -> anyhow::Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server};

    let make_svc = make_service_fn(move |_conn| {
        let metrics = metrics.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let response = metrics_response(&metrics, req.uri().path());
                async move { Ok::<_, std::convert::Infallible>(response) }
            }))
        }
    });

    info!("Metrics server listening on {}", addr);
    Server::try_bind(&addr)
        .context("failed to bind metrics server")?
        .serve(make_svc)
        .await
        .context("metrics server failed")?;

    Ok(())
}

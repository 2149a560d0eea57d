//! NFS Volume Provisioner
//!
//! Controller-side service provisioning NFS volumes on a storage array.
//! Serves the controller REST API plus health and Prometheus endpoints.

use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use nfs_volume_provisioner::controlplane::{HttpGatewayConfig, MemoryGatewayConfig};
use nfs_volume_provisioner::{
    ApiServer, ApiServerConfig, BackendConfig, BackendFactory, Error, Orchestrator,
    OrchestratorConfig, ProvisionerConfig, Result, StorageProtocol, UnwindPolicy,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// NFS Volume Provisioner - exclusive filesystem and treeq volumes
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

    /// Storage array gateway (memory, http)
    #[arg(long, env = "BACKEND", default_value = "memory")]
    backend: String,

    /// Storage array management endpoint
    #[arg(long, env = "ARRAY_ENDPOINT", default_value = "http://storage-array")]
    array_endpoint: String,

    /// Storage array user
    #[arg(long, env = "ARRAY_USERNAME")]
    array_username: Option<String>,

    /// Storage array password
    #[arg(long, env = "ARRAY_PASSWORD", hide_env_values = true)]
    array_password: Option<String>,

    /// Storage array request timeout in seconds
    #[arg(long, env = "ARRAY_TIMEOUT", default_value = "60")]
    array_timeout_secs: u64,

    /// Provisioner configuration file (YAML)
    #[arg(long, env = "PROVISIONER_CONFIG")]
    config: Option<PathBuf>,

    /// Protocols to serve
    #[arg(long, env = "PROTOCOLS", value_delimiter = ',', default_value = "nfs,nfs_treeq")]
    protocols: Vec<String>,

    /// Protocol for create requests that name none
    #[arg(long, env = "DEFAULT_PROTOCOL", default_value = "nfs")]
    default_protocol: String,

    /// Override the filesystem count ceiling
    #[arg(long, env = "MAX_FILESYSTEMS")]
    max_filesystems: Option<u64>,

    /// Undo every created resource when a create fails
    #[arg(long, env = "FULL_UNWIND")]
    full_unwind: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    info!("Starting NFS Volume Provisioner");
    info!("  Version: {}", nfs_volume_provisioner::VERSION);
    info!("  REST API: {}", args.api_addr);
    info!("  Backend: {}", args.backend);

    let orch_config = orchestrator_config(&args)?;
    info!("  Protocols: {:?}", orch_config.protocols);
    info!("  Unwind policy: {:?}", orch_config.provisioner.unwind_policy);

    let backend_config = BackendConfig {
        memory: MemoryGatewayConfig::default(),
        http: HttpGatewayConfig {
            endpoint: args.array_endpoint.clone(),
            username: args.array_username.clone(),
            password: args.array_password.clone(),
            request_timeout_secs: args.array_timeout_secs,
        },
    };
    let gateway = BackendFactory::create(&args.backend, backend_config)
        .with_context(|| format!("creating {} backend", args.backend))?;

    let orchestrator = Orchestrator::new(orch_config, gateway);
    info!("Orchestrator initialized");

    // Start health server
    let health_addr = args.health_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr).await {
            error!("Metrics server error: {}", e);
        }
    });

    let api_config = ApiServerConfig {
        rest_addr: args
            .api_addr
            .parse()
            .with_context(|| format!("invalid REST API address {}", args.api_addr))?,
        ..Default::default()
    };

    let api_server = ApiServer::new(api_config, orchestrator);

    info!("Starting controller API server");
    api_server.run().await?;

    info!("Provisioner shutdown complete");
    Ok(())
}

/// Merge the config file with command line overrides
fn orchestrator_config(args: &Args) -> anyhow::Result<OrchestratorConfig> {
    let mut provisioner = match &args.config {
        Some(path) => {
            let yaml = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            ProvisionerConfig::from_yaml(&yaml)
                .with_context(|| format!("loading {}", path.display()))?
        }
        None => ProvisionerConfig::default(),
    };

    if let Some(max) = args.max_filesystems {
        provisioner.max_filesystems = max;
    }
    if args.full_unwind {
        provisioner.unwind_policy = UnwindPolicy::Full;
    }
    provisioner.validate()?;

    let protocols = args
        .protocols
        .iter()
        .map(|p| p.parse::<StorageProtocol>())
        .collect::<Result<Vec<_>>>()?;

    Ok(OrchestratorConfig {
        provisioner,
        protocols,
        default_protocol: args.default_protocol.parse()?,
    })
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

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "reqwest=info", "tower=warn", "tower_http=info", "axum=info"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

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
}

// =============================================================================
// Health Server
// =============================================================================

fn plain_response(
    status: hyper::StatusCode,
    body: impl Into<hyper::Body>,
) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(body.into());
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: &str) -> Result<()> {
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

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid health server address: {}", e))
    })?;

    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};
    use prometheus::{Encoder, TextEncoder};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/metrics" => {
                    let encoder = TextEncoder::new();
                    let metric_families = prometheus::gather();
                    let mut buffer = Vec::new();
                    match encoder.encode(&metric_families, &mut buffer) {
                        Ok(()) => {
                            let mut response = plain_response(StatusCode::OK, buffer);
                            if let Ok(content_type) = encoder.format_type().parse() {
                                response
                                    .headers_mut()
                                    .insert(hyper::header::CONTENT_TYPE, content_type);
                            }
                            response
                        }
                        Err(e) => plain_response(
                            StatusCode::INTERNAL_SERVER_ERROR,
                            format!("encoding metrics: {}", e),
                        ),
                    }
                }
                _ => plain_response(StatusCode::NOT_FOUND, "not found"),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid metrics server address: {}", e))
    })?;

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}

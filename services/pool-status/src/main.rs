//! Credential pool status service
//!
//! Single-binary diagnostic companion for the credential pool:
//! 1. Loads config and opens the JSON credential store
//! 2. Serves `/health`, `/health/{service}` and `/metrics`
//! 3. `--once` prints the health report and exits (non-zero when unhealthy)
//! 4. `--verify <service>` decrypts every key of a service and prints
//!    fingerprints (non-zero when any key is unreadable)

mod config;
mod metrics;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use credential_pool::Pool;
use credential_vault::{FileStore, SecretCipher};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    pool: Arc<Pool>,
    prometheus: PrometheusHandle,
    started_at: Instant,
}

/// What the binary was asked to do.
#[derive(Debug, PartialEq, Eq)]
enum Mode {
    Serve,
    Once,
    Verify(String),
}

/// Parsed command line.
#[derive(Debug, PartialEq, Eq)]
struct Cli {
    config_path: Option<String>,
    mode: Mode,
}

impl Cli {
    fn parse(args: &[String]) -> Result<Self> {
        let config_path = args
            .iter()
            .position(|a| a == "--config")
            .and_then(|i| args.get(i + 1))
            .cloned();

        let mode = if let Some(i) = args.iter().position(|a| a == "--verify") {
            let service = args
                .get(i + 1)
                .filter(|s| !s.starts_with("--"))
                .context("--verify requires a service name")?;
            Mode::Verify(service.clone())
        } else if args.iter().any(|a| a == "--once") {
            Mode::Once
        } else {
            Mode::Serve
        };

        Ok(Self { config_path, mode })
    }
}

/// Build the axum router with all routes and shared state.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/health/{service}", get(service_health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .init();

    let args: Vec<String> = std::env::args().collect();
    let cli = Cli::parse(&args)?;

    let config_path = Config::resolve_path(cli.config_path.as_deref());
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.server.listen_addr,
        store = %config.store.path.display(),
        failure_threshold = config.pool.failure_threshold,
        "configuration loaded"
    );

    let passphrase = config
        .cipher
        .passphrase
        .as_ref()
        .context("cipher passphrase missing after config load")?;
    let cipher = SecretCipher::from_passphrase(passphrase.expose_str())
        .context("failed to derive credential cipher")?;

    let store = FileStore::load(config.store.path.clone())
        .await
        .with_context(|| {
            format!("failed to open credential store {}", config.store.path.display())
        })?;
    info!(
        path = %store.path().display(),
        credentials = store.len().await,
        "credential store opened"
    );

    let pool = Arc::new(Pool::new(Arc::new(store), Arc::new(cipher), config.pool));

    match cli.mode {
        Mode::Once => {
            let summary = pool.health_all().await.context("failed to read pool health")?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            if summary["status"] == "unhealthy" {
                std::process::exit(1);
            }
            Ok(())
        }
        Mode::Verify(service) => {
            let report = pool
                .verify_secrets(&service)
                .await
                .with_context(|| format!("failed to verify credentials for {service}"))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report["readable"] != report["total"] {
                std::process::exit(1);
            }
            Ok(())
        }
        Mode::Serve => serve(pool, config.server).await,
    }
}

async fn serve(pool: Arc<Pool>, server: config::ServerConfig) -> Result<()> {
    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus = metrics::install_recorder()?;

    let state = AppState {
        pool,
        prometheus,
        started_at: Instant::now(),
    };
    let app = build_router(state, server.max_connections);

    let listener = TcpListener::bind(server.listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", server.listen_addr))?;
    info!(addr = %server.listen_addr, "accepting requests");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("shutdown complete");
    Ok(())
}

fn json_response(status: StatusCode, body: serde_json::Value) -> axum::response::Response {
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

fn pool_error_response(err: credential_pool::Error) -> axum::response::Response {
    error!(error = %err, "pool health query failed");
    json_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        serde_json::json!({ "error": err.user_message() }),
    )
}

/// 503 when nothing can be served, 200 otherwise.
fn status_code_for(summary: &serde_json::Value) -> StatusCode {
    if summary["status"] == "unhealthy" {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    }
}

/// Overall pool health across every registered service.
async fn health_handler(State(state): State<AppState>) -> axum::response::Response {
    match state.pool.health_all().await {
        Ok(mut summary) => {
            summary["uptime_seconds"] = state.started_at.elapsed().as_secs().into();
            json_response(status_code_for(&summary), summary)
        }
        Err(e) => pool_error_response(e),
    }
}

/// Health for one service; 404 if it has no credentials at all.
async fn service_health_handler(
    State(state): State<AppState>,
    Path(service): Path<String>,
) -> axum::response::Response {
    match state.pool.health(&service).await {
        Ok(summary) if summary["credentials_total"] == 0 => json_response(
            StatusCode::NOT_FOUND,
            serde_json::json!({
                "error": format!("no credentials registered for service: {service}"),
            }),
        ),
        Ok(summary) => json_response(status_code_for(&summary), summary),
        Err(e) => pool_error_response(e),
    }
}

/// Prometheus metrics endpoint, refreshing the per-service gauges first.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.pool.health_all().await {
        Ok(summary) => metrics::record_pool_health(&summary),
        Err(e) => error!(error = %e, "failed to refresh pool gauges"),
    }
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use credential_pool::{FailureReason, ManualClock, NewCredential, PoolConfig};
    use credential_vault::MemoryStore;
    use tower::ServiceExt;

    /// Create a PrometheusHandle for tests without installing a global recorder.
    fn test_prometheus_handle() -> PrometheusHandle {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        recorder.handle()
    }

    fn test_pool() -> Arc<Pool> {
        let cipher = SecretCipher::from_passphrase("status test passphrase").unwrap();
        Arc::new(Pool::with_clock(
            Arc::new(MemoryStore::new()),
            Arc::new(cipher),
            PoolConfig::default(),
            Arc::new(ManualClock::new(1_700_000_000_000)),
        ))
    }

    fn test_app(pool: Arc<Pool>) -> Router {
        build_router(
            AppState {
                pool,
                prometheus: test_prometheus_handle(),
                started_at: Instant::now(),
            },
            16,
        )
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn cli_defaults_to_serve() {
        let cli = Cli::parse(&args(&["credential-pool-status"])).unwrap();
        assert_eq!(cli.mode, Mode::Serve);
        assert_eq!(cli.config_path, None);
    }

    #[test]
    fn cli_parses_config_and_once() {
        let cli = Cli::parse(&args(&["bin", "--config", "/etc/pool.toml", "--once"])).unwrap();
        assert_eq!(cli.mode, Mode::Once);
        assert_eq!(cli.config_path.as_deref(), Some("/etc/pool.toml"));
    }

    #[test]
    fn cli_verify_requires_service() {
        let cli = Cli::parse(&args(&["bin", "--verify", "gemini"])).unwrap();
        assert_eq!(cli.mode, Mode::Verify("gemini".into()));

        assert!(Cli::parse(&args(&["bin", "--verify"])).is_err());
        assert!(Cli::parse(&args(&["bin", "--verify", "--once"])).is_err());
    }

    #[tokio::test]
    async fn health_endpoint_reports_healthy_pool() {
        let pool = test_pool();
        pool.register(NewCredential::new("gemini", "k1")).await.unwrap();
        pool.register(NewCredential::new("gemini", "k2")).await.unwrap();

        let (status, json) = get_json(test_app(pool), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["services"]["gemini"]["credentials_total"], 2);
        assert!(json["uptime_seconds"].is_u64());
    }

    #[tokio::test]
    async fn health_endpoint_is_503_when_nothing_is_available() {
        let pool = test_pool();
        pool.register(NewCredential::new("gemini", "k1")).await.unwrap();
        let handle = pool.acquire("gemini").await.unwrap();
        pool.report_failure(&handle, FailureReason::AuthRejected)
            .await
            .unwrap();

        let (status, json) = get_json(test_app(pool), "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["status"], "unhealthy");
        assert_eq!(json["services"]["gemini"]["credentials_auth_rejected"], 1);
    }

    #[tokio::test]
    async fn service_health_lists_credentials_without_secrets() {
        let pool = test_pool();
        pool.register(NewCredential::new("gemini", "AIzaSy-never-shown"))
            .await
            .unwrap();

        let (status, json) = get_json(test_app(pool), "/health/gemini").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["service"], "gemini");
        assert_eq!(json["credentials"][0]["state"], "closed");
        assert!(!json.to_string().contains("AIzaSy-never-shown"));
    }

    #[tokio::test]
    async fn service_health_unknown_service_is_404() {
        let (status, json) = get_json(test_app(test_pool()), "/health/nothing").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(json["error"].as_str().unwrap().contains("nothing"));
    }

    #[tokio::test]
    async fn metrics_endpoint_returns_prometheus_text() {
        let app = test_app(test_pool());
        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers()[axum::http::header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .to_string();
        assert!(content_type.starts_with("text/plain"));
    }
}

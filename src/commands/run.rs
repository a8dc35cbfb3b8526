use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use kube::api::Api;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use prometheus::{Encoder, TextEncoder};
use tokio::signal;
use tokio::sync::{broadcast, watch};
use tokio::time::timeout;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use kube_rightsizer::crd::{RightSizerConfig, RightSizerPolicy};
use kube_rightsizer::executor;
use kube_rightsizer::hub::{ConfigSnapshot, WatchHub};
use kube_rightsizer::leader::LeaseCoordinator;
use kube_rightsizer::provider::{MetricsApiProvider, sampler_loop};
use kube_rightsizer::reconciler::{Overrides, Reconciler, TickSettings};
use kube_rightsizer::reporter;
use kube_rightsizer::usage::UsageStore;

const DRAIN_WINDOW: Duration = Duration::from_secs(30);
const HARD_STOP: Duration = Duration::from_secs(60);

/* ============================= ARGS & ENV ============================= */

pub struct RunArgs {
    pub kubeconfig: Option<String>,
    pub namespace: Option<String>,
    pub leader_elect: bool,
    pub metrics_addr: String,
    pub health_addr: String,
    pub log_level: Option<String>,
    pub dry_run: bool,
}

fn env_list(name: &str) -> Vec<String> {
    std::env::var(name)
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

/// CLI beats environment, environment beats CRD fields.
fn build_overrides(args: &RunArgs) -> Overrides {
    Overrides {
        dry_run: args.dry_run || env_flag("DRY_RUN"),
        operator_namespace: args
            .namespace
            .clone()
            .or_else(|| std::env::var("OPERATOR_NAMESPACE").ok())
            .or_else(detect_mounted_namespace),
        resize_interval: std::env::var("RESIZE_INTERVAL")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs),
        namespace_include: env_list("KUBE_NAMESPACE_INCLUDE"),
        namespace_exclude: env_list("KUBE_NAMESPACE_EXCLUDE"),
    }
}

fn detect_mounted_namespace() -> Option<String> {
    std::fs::read_to_string("/var/run/secrets/kubernetes.io/serviceaccount/namespace")
        .ok()
        .map(|ns| ns.trim().to_string())
        .filter(|ns| !ns.is_empty())
}

fn init_tracing(args: &RunArgs) {
    let level = args
        .log_level
        .clone()
        .or_else(|| std::env::var("LOG_LEVEL").ok())
        .unwrap_or_else(|| "info".to_string());
    let filter = EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn build_client(kubeconfig: Option<&str>) -> Result<Client> {
    match kubeconfig {
        Some(path) => {
            let kubeconfig =
                Kubeconfig::read_from(path).context("Failed to read kubeconfig file")?;
            let config =
                Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .context("Failed to build client config from kubeconfig")?;
            Client::try_from(config).context("Failed to build client")
        }
        None => Client::try_default()
            .await
            .context("Failed to load kubeconfig"),
    }
}

/* ============================= ENTRY ============================= */

/// Returns the process exit code: 0 clean, 2 lease permanently lost.
/// Fatal init errors bubble as `Err` (exit code 1).
pub async fn run(args: RunArgs) -> Result<i32> {
    init_tracing(&args);
    println!("Starting right-sizer control plane...\n");

    let client = build_client(args.kubeconfig.as_deref()).await?;

    // Verify actual cluster connectivity before starting anything.
    print!("  Cluster connection .......... ");
    match client.apiserver_version().await {
        Ok(v) => println!("OK (v{}.{})", v.major, v.minor),
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot reach cluster: {}. Is the cluster running?", e);
        }
    }

    // CRD schemas must exist; starting without them is a fatal init error.
    print!("  CRD schemas ................. ");
    let configs: Api<RightSizerConfig> = Api::all(client.clone());
    let policies: Api<RightSizerPolicy> = Api::all(client.clone());
    match (
        configs.list(&Default::default()).await,
        policies.list(&Default::default()).await,
    ) {
        (Ok(_), Ok(_)) => println!("OK"),
        _ => {
            println!("MISSING");
            anyhow::bail!("CRD schemas absent; run `kube-rightsizer crd install` first");
        }
    }

    print!("  Resize subresource .......... ");
    let caps = executor::probe_platform_caps(&client).await?;
    if caps.resize_subresource {
        println!("OK");
    } else {
        println!("ABSENT (parent-workload fallback)");
    }

    let overrides = build_overrides(&args);
    let operator_namespace = overrides
        .operator_namespace
        .clone()
        .unwrap_or_else(|| "default".to_string());

    let metrics_addr: SocketAddr = args
        .metrics_addr
        .parse()
        .context("Invalid --metrics-addr")?;
    let health_addr: SocketAddr = args.health_addr.parse().context("Invalid --health-addr")?;

    println!("  Operator namespace .......... {operator_namespace}");
    println!("  Leader election ............. {}", if args.leader_elect { "on" } else { "off" });
    println!("  Metrics server .............. http://{metrics_addr}");
    println!("  Health server ............... http://{health_addr}");
    println!();
    println!("  Available endpoints:");
    println!("    GET /healthz .............. Liveness probe (always 200 OK)");
    println!("    GET /readyz ............... Readiness probe (503 until informers sync)");
    println!("    GET /metrics .............. Prometheus metrics scrape endpoint");
    println!();
    println!("Control plane running. Press Ctrl+C to stop.\n");
    println!("{}", "=".repeat(70));

    info!("control_plane_starting");
    reporter::force_init_metrics();

    let (shutdown_tx, _) = broadcast::channel::<()>(4);
    let (lost_tx, _) = broadcast::channel::<()>(1);

    // CRD watch hub
    let (hub, snapshot_rx) = WatchHub::new(client.clone());
    let hub_handle = {
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move { hub.run(shutdown).await })
    };

    // Usage sampler
    let store = Arc::new(UsageStore::new());
    let sampler_handle = {
        let provider = MetricsApiProvider::new(client.clone());
        let store = store.clone();
        let snapshot_rx = snapshot_rx.clone();
        let shutdown = shutdown_tx.subscribe();
        let interval = TickSettings::resolve(&snapshot_rx.borrow().config.clone(), &overrides)
            .resize_interval;
        tokio::spawn(async move {
            sampler_loop(provider, store, interval, snapshot_rx, shutdown).await;
        })
    };

    // Leader election
    let identity = format!(
        "{}-{}",
        std::env::var("POD_NAME").unwrap_or_else(|_| "kube-rightsizer".to_string()),
        std::env::var("POD_UID").unwrap_or_else(|_| std::process::id().to_string()),
    );
    let leader = Arc::new(LeaseCoordinator::new(
        client.clone(),
        operator_namespace.clone(),
        identity,
    ));
    let active = leader.active_flag();

    let leader_handle = if args.leader_elect {
        let leader = leader.clone();
        let mut wait_shutdown = shutdown_tx.subscribe();
        let renew_shutdown = shutdown_tx.subscribe();
        let lost = lost_tx.clone();
        Some(tokio::spawn(async move {
            match leader.wait_until_leader(&mut wait_shutdown).await {
                Ok(true) => leader.renewal_loop(renew_shutdown, lost).await,
                Ok(false) => {}
                Err(e) => warn!(error = %e, "leader_election_failed"),
            }
        }))
    } else {
        active.store(true, std::sync::atomic::Ordering::SeqCst);
        None
    };

    // Reconciler
    let reconciler = Arc::new(Reconciler::new(
        client.clone(),
        store.clone(),
        snapshot_rx.clone(),
        caps,
        active,
        overrides,
    ));
    let reconciler_handle = {
        let reconciler = reconciler.clone();
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move { reconciler.run(shutdown).await })
    };

    // HTTP servers
    let http_handle = {
        let state = HttpState {
            snapshot_rx: snapshot_rx.clone(),
        };
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(
            async move { serve_http(state, metrics_addr, health_addr, shutdown).await },
        )
    };

    // Wait for a stop signal: Ctrl+C is a clean shutdown; losing the
    // lease beyond the retry budget is exit code 2.
    let mut lost_rx = lost_tx.subscribe();
    let exit_code = tokio::select! {
        _ = signal::ctrl_c() => {
            info!("shutdown_signal_received");
            println!("\n{}", "=".repeat(70));
            println!("Shutdown signal received. Stopping control plane...");
            0
        }
        _ = lost_rx.recv() => {
            warn!("lease_lost_beyond_retry_budget");
            println!("\nLease permanently lost; exiting.");
            2
        }
    };

    // Stop accepting new work, let in-flight patches drain, then stop hard.
    let _ = shutdown_tx.send(());

    let drain = async {
        let _ = timeout(DRAIN_WINDOW, reconciler_handle).await;
        let _ = timeout(DRAIN_WINDOW, sampler_handle).await;
        let _ = timeout(DRAIN_WINDOW, hub_handle).await;
        if let Some(handle) = leader_handle {
            let _ = timeout(DRAIN_WINDOW, handle).await;
        }
        let _ = timeout(DRAIN_WINDOW, http_handle).await;
        if args.leader_elect {
            leader.release().await;
        }
    };
    if timeout(HARD_STOP, drain).await.is_err() {
        warn!("hard_stop_drain_window_exceeded");
    }

    info!("control_plane_stopped");
    println!("Control plane stopped.");
    Ok(exit_code)
}

/* ============================= HTTP SERVER ============================= */

#[derive(Clone)]
pub(crate) struct HttpState {
    pub(crate) snapshot_rx: watch::Receiver<Arc<ConfigSnapshot>>,
}

pub(crate) fn build_router(state: HttpState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(|| async { (StatusCode::OK, "OK") }))
        .route(
            "/readyz",
            get({
                let state = state.clone();
                move || ready_handler(state.clone())
            }),
        )
}

async fn serve_http(
    state: HttpState,
    metrics_addr: SocketAddr,
    health_addr: SocketAddr,
    shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    if metrics_addr == health_addr {
        serve_one(build_router(state), metrics_addr, shutdown).await
    } else {
        let health = {
            let state = state.clone();
            let shutdown = shutdown.resubscribe();
            tokio::spawn(async move { serve_one(build_router(state), health_addr, shutdown).await })
        };
        serve_one(build_router(state), metrics_addr, shutdown).await?;
        let _ = health.await?;
        Ok(())
    }
}

async fn serve_one(
    app: Router,
    addr: SocketAddr,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind HTTP server on {addr}"))?;

    info!(addr = %addr, "http_server_started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    Ok(())
}

async fn ready_handler(state: HttpState) -> impl IntoResponse {
    if state.snapshot_rx.borrow().synced {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = reporter::REGISTRY.gather();
    let mut buffer = Vec::new();

    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => match String::from_utf8(buffer) {
            Ok(body) => (StatusCode::OK, body),
            Err(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "metrics encoding error".to_string(),
            ),
        },
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "metrics encoding error".to_string(),
        ),
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_state(synced: bool) -> HttpState {
        let (tx, rx) = watch::channel(Arc::new(ConfigSnapshot {
            synced,
            ..Default::default()
        }));
        // Keep the sender alive for the duration of the test.
        std::mem::forget(tx);
        HttpState { snapshot_rx: rx }
    }

    #[tokio::test]
    async fn test_healthz_returns_ok() {
        let app = build_router(test_state(false));
        let req = Request::builder()
            .uri("/healthz")
            .body(Body::empty())
            .unwrap();

        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"OK");
    }

    #[tokio::test]
    async fn test_readyz_when_synced() {
        let app = build_router(test_state(true));
        let req = Request::builder()
            .uri("/readyz")
            .body(Body::empty())
            .unwrap();

        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"READY");
    }

    #[tokio::test]
    async fn test_readyz_when_not_synced() {
        let app = build_router(test_state(false));
        let req = Request::builder()
            .uri("/readyz")
            .body(Body::empty())
            .unwrap();

        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"NOT READY");
    }

    #[tokio::test]
    async fn test_metrics_returns_ok() {
        reporter::force_init_metrics();
        let app = build_router(test_state(false));
        let req = Request::builder()
            .uri("/metrics")
            .body(Body::empty())
            .unwrap();

        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("rightsizer_pods_processed_total"));
    }

    #[tokio::test]
    async fn test_unknown_route_returns_404() {
        let app = build_router(test_state(false));
        let req = Request::builder()
            .uri("/nonexistent")
            .body(Body::empty())
            .unwrap();

        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_env_list_parsing() {
        unsafe { std::env::set_var("TEST_RIGHTSIZER_LIST", "a, b,,c") };
        assert_eq!(
            env_list("TEST_RIGHTSIZER_LIST"),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
        unsafe { std::env::remove_var("TEST_RIGHTSIZER_LIST") };
        assert!(env_list("TEST_RIGHTSIZER_LIST").is_empty());
    }

    #[test]
    fn test_env_flag_parsing() {
        unsafe { std::env::set_var("TEST_RIGHTSIZER_FLAG", "true") };
        assert!(env_flag("TEST_RIGHTSIZER_FLAG"));
        unsafe { std::env::set_var("TEST_RIGHTSIZER_FLAG", "0") };
        assert!(!env_flag("TEST_RIGHTSIZER_FLAG"));
        unsafe { std::env::remove_var("TEST_RIGHTSIZER_FLAG") };
        assert!(!env_flag("TEST_RIGHTSIZER_FLAG"));
    }
}

//! Single-process control plane: boots config, logging, the shimlet
//! registry, the spec store, the work queue, and the reconciler worker
//! pool, then serves the ingress HTTP API until SIGINT/SIGTERM.

use std::sync::Arc;

use clap::Parser;
use modserv_shim::api::{self, AppState};
use modserv_shim::config::Config;
use modserv_shim::goal::goalsets::{self, GoalSetRegistry};
use modserv_shim::orchestrator::Orchestrator;
use modserv_shim::queue::RateLimitingQueue;
use modserv_shim::reconciler::Reconciler;
use modserv_shim::registry::Registry;
use modserv_shim::shimlet::demo::DemoShimlet;
use modserv_shim::shimlet::k8s::K8sShimlet;
use modserv_shim::shimlet::Shimlet;
use modserv_shim::spec_store::{InMemorySpecStore, SpecStore};
use tracing_subscriber::fmt::format::FmtSpan;
use warp::http::{header, Method};
use warp::Filter;

#[derive(Debug, Parser)]
#[command(name = "modserv-shimd", about = "Model-serving reconciliation shim")]
struct Cli {
    /// Path to the YAML config file.
    #[arg(short, long, value_name = "FILE")]
    config: std::path::PathBuf,
}

fn block_on<F: std::future::Future>(fut: F) -> F::Output {
    tokio::task::block_in_place(|| tokio::runtime::Handle::current().block_on(fut))
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if !cli.config.exists() {
        eprintln!("config file {} does not exist", cli.config.display());
        std::process::exit(1);
    }

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to load config: {err}");
            std::process::exit(1);
        }
    };

    init_logging(&config.log.level);

    let shimlet = match build_shimlet(&config) {
        Ok(shimlet) => shimlet,
        Err(err) => {
            tracing::error!(error = %err, "failed to initialize shimlet");
            std::process::exit(1);
        }
    };

    let mut goal_sets = GoalSetRegistry::new();
    goalsets::register_all(&mut goal_sets, &config.model_manage.model_root);
    let goal_sets = Arc::new(goal_sets);

    let store: Arc<dyn SpecStore> = Arc::new(InMemorySpecStore::new());
    let queue = RateLimitingQueue::new();

    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        queue.clone(),
        shimlet.clone(),
        config.current_shimlet.clone(),
    ));

    match orchestrator.recover().await {
        Ok(n) => tracing::info!(recovered = n, "re-enqueued services from shimlet enumeration"),
        Err(err) => tracing::warn!(error = %err, "crash-recovery enumeration failed"),
    }

    let reconciler = Arc::new(Reconciler::new(
        store,
        queue.clone(),
        shimlet,
        goal_sets,
        config.reconciler.workers,
        std::time::Duration::from_secs(config.reconciler.retry_interval_secs),
        std::time::Duration::from_secs(config.reconciler.resync_interval_secs),
    ));
    let worker_handles = reconciler.spawn();

    let state = AppState {
        orchestrator,
        model_root: config.model_manage.model_root.clone(),
    };
    let cors = warp::cors()
        .allow_any_origin()
        .allow_headers(&[header::AUTHORIZATION, header::CONTENT_TYPE])
        .allow_methods(&[Method::DELETE, Method::GET, Method::POST, Method::PUT]);
    let routes = api::routes(state).with(cors);

    let (addr, server) = warp::serve(routes).bind_with_graceful_shutdown(
        ([0, 0, 0, 0], config.server.port),
        async {
            wait_for_shutdown_signal().await;
        },
    );
    tracing::info!(%addr, "serving ingress API");
    server.await;

    tracing::info!("draining reconciler workers");
    queue.shutdown_with_drain();
    for handle in worker_handles {
        let _ = handle.await;
    }
}

fn init_logging(configured_level: &str) {
    let filter = if !configured_level.is_empty() {
        configured_level.to_owned()
    } else {
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_owned())
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::CLOSE)
        .init();
}

fn build_shimlet(config: &Config) -> Result<Arc<dyn Shimlet>, String> {
    let registry: Registry<Arc<dyn Shimlet>> = Registry::new();
    registry.register("demo", || Arc::new(DemoShimlet::new("demo")) as Arc<dyn Shimlet>);
    registry.register("k8s", || Arc::new(K8sShimlet::new()) as Arc<dyn Shimlet>);

    let config_path = config
        .shimlets
        .get(&config.current_shimlet)
        .map(|c| c.config_path.clone())
        .unwrap_or_default();

    let shimlet = registry
        .get_singleton_with(&config.current_shimlet, |shimlet: Arc<dyn Shimlet>| {
            block_on(shimlet.init_with_config(&config_path)).map(|()| shimlet)
        })
        .map_err(|err| err.to_string())?;
    Ok((*shimlet).clone())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = sigint.recv() => tracing::info!("received SIGINT"),
        _ = sigterm.recv() => tracing::info!("received SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

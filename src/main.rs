mod backend;
mod cache;
mod config;
mod dispatcher;
mod handlers;
mod jobs;
mod load_balancer;
mod metrics;
mod models;
mod references;
mod retry;
mod scanner;
mod scheduler;
mod sink;
mod sse;
mod state;

use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::backend::BackendSelector;
use crate::cache::FingerprintCache;
use crate::config::Args;
use crate::load_balancer::health_checker;
use crate::references::ReferenceStore;
use crate::scanner::MarkerScanner;
use crate::state::{AppState, idle_sweeper};

// this is main async function with tokio
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // parse cli arguments
    let args = Args::parse();
    let backend_config = args.backend_config();
    let client = reqwest::Client::new();

    let references = Arc::new(ReferenceStore::new(args.reference_dir.clone()));
    let selector =
        BackendSelector::from_config(&backend_config, client.clone(), Arc::clone(&references))
            .context("failed to configure image backend")?;

    // spawn the health checker for proxy endpoints
    if let Some(balancer) = selector.balancer() {
        if args.health_interval > 0 && !balancer.is_empty() {
            info!(endpoints = balancer.len(), "starting proxy health checks");
            let balancer = Arc::clone(balancer);
            let client = client.clone();
            let api_key = backend_config.proxy_api_key.clone();
            let interval = Duration::from_secs(args.health_interval);
            tokio::spawn(async move {
                health_checker(balancer, client, api_key, interval).await;
            });
        }
    }

    let scanner = MarkerScanner::new(args.scanner_config())
        .context("marker tokens do not form a valid pattern")?;
    let cache = FingerprintCache::new(args.cache_config());
    let concurrency = args.concurrency_limit();

    let state = Arc::new(AppState::new(
        Arc::new(selector),
        Arc::new(cache),
        references,
        scanner,
        args.dispatch_config(),
        concurrency,
    ));

    let stream_idle = state.dispatcher.stream_idle();
    if !stream_idle.is_zero() {
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            idle_sweeper(state, stream_idle).await;
        });
    }

    let app = handlers::router(state);

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    info!(port = args.port, "gateway running on http://localhost:{}", args.port);
    info!(
        mode = ?backend_config.mode,
        local_workflow = backend_config.local_workflow,
        speculative = !args.no_speculative,
        concurrency,
        cache_ttl_days = args.cache_ttl_days,
        "pipeline ready"
    );
    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}

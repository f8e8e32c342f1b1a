//! ShareGuard detection engine entry point.
//!
//! Wires the library's components together the way the teacher's
//! mitigation-node main.rs wires its proxy subsystems: load config,
//! validate, construct each subsystem behind an `Arc`, spawn one
//! background task per worker (spec.md §5), then wait on a shutdown
//! signal and drain gracefully.

use anyhow::{Context, Result};
use shareguard_core::config::EngineConfig;
use shareguard_core::ingest::{ConnectedNodes, IngestServer};
use shareguard_core::roster::{HttpPanelFetcher, NullPanelFetcher, PanelFetcher, RosterCache};
use shareguard_core::sinks::{
    CachedEnrich, EnrichSink, FilePersist, NatsNotify, NotifySink, NullEnrich, NullNotify,
    NullPersist, PersistSink,
};
use shareguard_core::{Classifier, Secret, UserTracker};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = EngineConfig::from_sources(std::env::var("SHAREGUARD_CONFIG").ok().as_deref())
        .context("failed to load configuration")?;

    init_logging(&config.logging);

    info!(
        "Starting ShareGuard detection engine v{}",
        env!("CARGO_PKG_VERSION")
    );

    if let Err(e) = config.validate() {
        error!("configuration validation failed: {e}");
        eprintln!("shareguard-core: configuration error: {e}");
        std::process::exit(1);
    }

    config.log_effective_config();
    shareguard_core::metrics::describe_all();

    if let Err(e) = run(config).await {
        error!(error = %e, "fatal error, shutting down");
        eprintln!("shareguard-core: {e}");
        std::process::exit(1);
    }

    info!("shutdown complete");
    Ok(())
}

fn init_logging(cfg: &shareguard_core::config::LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("shareguard_core={}", cfg.level).into());

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);

    if cfg.format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

async fn run(config: EngineConfig) -> Result<()> {
    let ingest_addr: SocketAddr = config
        .ingest_addr()
        .context("invalid ingest listen address")?;
    let query_api_addr: SocketAddr = config
        .query_api_addr()
        .context("invalid query API listen address")?;

    // C2 — user tracker, owns the single reader-writer-locked user map.
    let tracker = Arc::new(UserTracker::new(config.tracker.recent_requests_capacity));

    // C4 — roster cache, fetcher wired from PanelConfig.
    let panel_fetcher: Arc<dyn PanelFetcher> = match (&config.panel.url, &config.panel.token) {
        (Some(url), Some(token)) => Arc::new(
            HttpPanelFetcher::new(
                url.clone(),
                token.clone(),
                Duration::from_secs(config.panel.timeout_seconds),
            )
            .context("failed to build panel HTTP client")?,
        ),
        _ => {
            warn!("PANEL_URL/PANEL_TOKEN missing after validation; using a fetcher that returns no entries");
            Arc::new(NullPanelFetcher)
        }
    };
    let roster = Arc::new(RosterCache::new(
        panel_fetcher,
        config.panel.page_size,
        config.tracker.whitelist_emails.clone(),
    ));
    roster.refresh().await;

    // C7 — optional sinks, each replaced by a no-op when unconfigured so
    // the classifier and query API never branch on presence (spec.md §4.7).
    let persist: Arc<dyn PersistSink> = match &config.sinks.persist {
        Some(cfg) => Arc::new(
            FilePersist::open(cfg.path.clone())
                .await
                .context("failed to open banlist persistence store")?,
        ),
        None => {
            info!("persist sink disabled; banlist will not survive a restart");
            Arc::new(NullPersist)
        }
    };
    let notify: Arc<dyn NotifySink> = match &config.sinks.notify {
        Some(cfg) => Arc::new(
            NatsNotify::connect(cfg.nats_url.clone(), cfg.subject.clone(), cfg.queue_capacity).await,
        ),
        None => {
            info!("notify sink disabled; domain events will not be published");
            Arc::new(NullNotify)
        }
    };
    let enrich: Arc<dyn EnrichSink> = match &config.sinks.enrich {
        Some(cfg) => Arc::new(CachedEnrich::new(
            cfg.cache_capacity,
            Arc::new(|_ip| Box::pin(async move { None })),
        )),
        None => {
            info!("enrich sink disabled; detail views will omit ISP");
            Arc::new(NullEnrich)
        }
    };

    // C3 — classifier, hydrates the banlist from the persist sink before
    // accepting any ingest traffic.
    let classifier = Arc::new(Classifier::new(
        config.classifier.clone(),
        Arc::clone(&tracker),
        Arc::clone(&roster),
        Arc::clone(&persist),
        Arc::clone(&notify),
        config.tracker.whitelist_emails.clone(),
    ));
    match classifier.hydrate_banlist().await {
        Ok(count) => info!(banlisted = count, "banlist hydrated from persist sink"),
        Err(e) => warn!(error = %e, "failed to hydrate banlist; starting with an empty one"),
    }

    // C5 — ingest server. `requests_seen` is shared with the query API so
    // `GET /api/stats` reports total access-log lines ingested, not query
    // API call volume.
    let nodes = Arc::new(ConnectedNodes::new());
    let requests_seen = Arc::new(std::sync::atomic::AtomicU64::new(0));
    let ingest = Arc::new(IngestServer::with_counter(
        ingest_addr,
        config.ingest.max_line_bytes,
        config.idle_timeout(),
        config.tracker.subnet_grouping,
        Arc::clone(&tracker),
        Arc::clone(&nodes),
        Arc::clone(&requests_seen),
    ));

    // C6 — query API.
    let api_token = config
        .query_api
        .api_token
        .clone()
        .unwrap_or_else(|| Secret::new(String::new()));
    let api_state = shareguard_core::api::ApiState {
        tracker: Arc::clone(&tracker),
        roster: Arc::clone(&roster),
        classifier: Arc::clone(&classifier),
        nodes: Arc::clone(&nodes),
        persist: Arc::clone(&persist),
        enrich: Arc::clone(&enrich),
        api_token,
        concurrent_window: config.concurrent_window(),
        requests_seen: Arc::clone(&requests_seen),
    };
    let api_router = shareguard_core::api::router(api_state, config.query_api.cors_enabled);

    let http_listener = tokio::net::TcpListener::bind(query_api_addr)
        .await
        .with_context(|| format!("failed to bind query API to {query_api_addr}"))?;
    info!(addr = %query_api_addr, "query API listening");

    if config.metrics.enabled {
        spawn_metrics_exporter(&config.metrics.listen_addr)?;
    }

    let mut tasks = Vec::new();
    tasks.push(tokio::spawn({
        let ingest = Arc::clone(&ingest);
        async move {
            if let Err(e) = ingest.run().await {
                error!(error = %e, "ingest server exited");
            }
        }
    }));
    tasks.push(tokio::spawn({
        let classifier = Arc::clone(&classifier);
        async move { classifier.run().await }
    }));
    tasks.push(tokio::spawn({
        let roster = Arc::clone(&roster);
        let interval = Duration::from_secs(config.panel.poll_interval_seconds.max(1));
        async move { roster.run(interval).await }
    }));
    tasks.push(tokio::spawn({
        let tracker = Arc::clone(&tracker);
        let retention = config.retention();
        async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(30));
            loop {
                ticker.tick().await;
                tracker.prune(chrono::Utc::now(), retention).await;
            }
        }
    }));

    let http_server =
        axum::serve(http_listener, api_router).with_graceful_shutdown(shutdown_signal());

    info!(ingest_addr = %ingest_addr, query_api_addr = %query_api_addr, "ShareGuard detection engine ready");

    if let Err(e) = http_server.await {
        error!(error = %e, "query API server exited with an error");
    }

    info!("shutdown signal received, draining background workers");
    for task in tasks {
        task.abort();
    }

    Ok(())
}

fn spawn_metrics_exporter(listen_addr: &str) -> Result<()> {
    let addr: SocketAddr = listen_addr
        .parse()
        .with_context(|| format!("invalid metrics listen address: {listen_addr}"))?;
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("failed to install Prometheus exporter")?;
    info!(addr = %addr, "Prometheus metrics exporter installed");
    Ok(())
}

/// Graceful shutdown on SIGINT/SIGTERM (spec.md §5): stop accepting new
/// HTTP connections and let axum drain in-flight requests before this
/// future resolves.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}

//! Column Harvester: binary entrypoint.
//! Boots the pollers, the daily batch scheduler and the Axum status server.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use column_harvester::{
    api::{self, AppState},
    classify::{ChatClassifier, ContentClassifier, PassthroughClassifier},
    config::AppConfig,
    coordinator::PipelineCoordinator,
    dedup_index::DedupIndex,
    error::ErrorKind,
    metrics::Metrics,
    notify::{LogNotifier, Notifier, TelegramNotifier},
    refine::{RefineConfig, SimilarityRefiner},
    retry::RetryPolicy,
    source::{http::HttpSourceAdapter, SharedSession},
    stages::StageContext,
    status::StatusBoard,
    store::DataLayout,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// `RUST_LOG` filter (default `info`); JSON lines when `HARVEST_LOG_JSON=1`.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("HARVEST_LOG_JSON")
        .ok()
        .is_some_and(|v| v == "1");

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().compact()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = AppConfig::load_default().context("loading configuration")?;
    let metrics = Metrics::init()?;
    let layout = DataLayout::new(&cfg.data.root);

    // --- Source session ---
    let adapter = HttpSourceAdapter::new(cfg.adapter_url(), cfg.fetch_timeout())?;
    let session = SharedSession::new(Arc::new(adapter), cfg.fetch_timeout());
    let startup = RetryPolicy::new(
        cfg.source.startup_attempts,
        Duration::from_secs(2),
        Duration::from_secs(30),
    );
    let sources = startup
        .execute(ErrorKind::Browser, "list_columns", || session.list_columns())
        .await
        .context("identifying sources")?;
    if sources.is_empty() {
        bail!("no sources identified; nothing to poll");
    }
    info!(count = sources.len(), adapter = session.adapter_name(), "sources identified");

    let index = Arc::new(DedupIndex::load(layout.latest_index()).await);

    // --- Collaborators ---
    let classifier: Arc<dyn ContentClassifier> = match ChatClassifier::from_env(
        &cfg.classifier.base_url,
        &cfg.classifier.model,
        Duration::from_millis(cfg.classifier.timeout_ms),
    )? {
        Some(c) => Arc::new(c),
        None => {
            warn!("CLASSIFIER_API_KEY not set, batch keeps every item unfiltered");
            Arc::new(PassthroughClassifier)
        }
    };
    let notifier: Arc<dyn Notifier> = match TelegramNotifier::from_env(
        &cfg.notifier.api_base,
        Duration::from_millis(cfg.notifier.timeout_ms),
    )? {
        Some(n) => Arc::new(n),
        None => {
            warn!("TELEGRAM_BOT_TOKEN not set, rollups are logged only");
            Arc::new(LogNotifier)
        }
    };
    info!(classifier = classifier.name(), notifier = notifier.name(), "collaborators ready");

    let refiner = SimilarityRefiner::new(
        classifier.clone(),
        RefineConfig {
            confidence_gate: cfg.batch.confidence_gate,
            strict_confidence_gate: cfg.batch.strict_confidence_gate,
            ..RefineConfig::default()
        },
    );
    let stages = StageContext {
        layout: layout.clone(),
        categories: cfg.category_map(),
        classifier,
        notifier,
        refiner,
        min_relevance: cfg.batch.min_relevance,
    };
    let status = StatusBoard::new();
    let coordinator = Arc::new(PipelineCoordinator::new(
        layout.clone(),
        stages,
        cfg.stage_retry(),
        session,
        status,
    ));

    // --- Shutdown signal ---
    let shutdown = CancellationToken::new();
    {
        let token = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("ctrl-c received");
            }
            token.cancel();
        });
    }

    // --- HTTP status surface ---
    let app = api::router(AppState {
        coordinator: coordinator.clone(),
    })
    .merge(metrics.router());
    let listener = tokio::net::TcpListener::bind(&cfg.api.bind)
        .await
        .with_context(|| format!("binding {}", cfg.api.bind))?;
    info!(bind = %cfg.api.bind, "status server listening");
    let server = {
        let token = shutdown.clone();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(token.cancelled_owned())
                .await
        })
    };

    coordinator
        .run(
            sources,
            index,
            layout,
            cfg.poller_config(),
            cfg.daily_at(),
            cfg.batch.process_previous_day,
            cfg.grace_period(),
            shutdown,
        )
        .await?;

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "status server failed"),
        Err(e) => warn!(error = %e, "status server task ended abnormally"),
    }
    Ok(())
}

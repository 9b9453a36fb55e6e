//! Drip Express — multi-step email sequence delivery worker.
//!
//! Wires the store, content, recipients, engagement and delivery
//! collaborators together, runs the three pollers and serves the
//! engagement webhook until shutdown.

mod seed;
mod webhook;

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, ValueEnum};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::sync::watch;
use tracing::{error, info, warn};

use drip_channels::{CaptureAdapter, ContentLibrary, EngagementLog, RecipientDirectory, SendGridAdapter};
use drip_core::collaborators::{DeliveryAdapter, EngagementTracker};
use drip_core::config::{AppConfig, StoreBackend};
use drip_core::event_bus::TracingSink;
use drip_sequence::{Collaborators, Scheduler};
use drip_store::{DripStore, MemoryStore, RedisStore};

use crate::seed::SeedFixture;
use crate::webhook::WebhookState;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackendArg {
    Memory,
    Redis,
}

impl From<BackendArg> for StoreBackend {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Memory => StoreBackend::Memory,
            BackendArg::Redis => StoreBackend::Redis,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "drip-express")]
#[command(about = "Multi-step email sequence delivery worker")]
#[command(version)]
struct Cli {
    /// Worker identifier used as the claim owner (overrides config)
    #[arg(long, env = "DRIP_EXPRESS__NODE_ID")]
    node_id: Option<String>,

    /// Config file path, without extension
    #[arg(long, short, default_value = "config/drip-express")]
    config: String,

    /// Store backend (overrides config)
    #[arg(long, value_enum)]
    backend: Option<BackendArg>,

    /// JSON fixture with templates, recipients and campaigns to load at startup
    #[arg(long)]
    seed: Option<PathBuf>,

    /// Run every poller once and exit
    #[arg(long, default_value_t = false)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "drip_express=info,drip_sequence=info,drip_store=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Drip Express starting up");

    let mut config = AppConfig::load(Some(&cli.config)).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(backend) = cli.backend {
        config.store.backend = backend.into();
    }
    config
        .worker
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid worker config: {e}"))?;

    info!(
        node_id = %config.node_id,
        backend = ?config.store.backend,
        initial_sends_secs = config.worker.initial_sends_interval_secs,
        queued_steps_secs = config.worker.queued_steps_interval_secs,
        repeat_sweep_secs = config.worker.repeat_sweep_interval_secs,
        "Configuration loaded"
    );

    if config.metrics.enabled && !cli.once {
        let host: IpAddr = config
            .metrics
            .host
            .parse()
            .with_context(|| format!("invalid metrics host {}", config.metrics.host))?;
        let addr = SocketAddr::new(host, config.metrics.port);
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("installing Prometheus exporter")?;
        info!(%addr, "Prometheus exporter listening");
    }

    // Engagement lives next to the step records so that every worker, and
    // the webhook endpoint, read and write the same events.
    let (store, engagement): (Arc<dyn DripStore>, Arc<dyn EngagementTracker>) = match config.store.backend {
        StoreBackend::Memory => {
            warn!("Using in-memory store; state is lost on exit and not shared between workers");
            (Arc::new(MemoryStore::new()), Arc::new(EngagementLog::new()))
        }
        StoreBackend::Redis => {
            let redis = RedisStore::new(&config.redis, &config.store.key_prefix)
                .await
                .context("connecting to Redis")?;
            let tracker = redis.engagement_tracker();
            (Arc::new(redis), Arc::new(tracker))
        }
    };

    let library = ContentLibrary::new();
    let directory = RecipientDirectory::new();

    let dry_run = config.sendgrid.api_key.is_empty();
    let capture = Arc::new(CaptureAdapter::new());
    let delivery: Arc<dyn DeliveryAdapter> = if dry_run {
        warn!("No SendGrid API key configured, deliveries are captured locally");
        capture.clone()
    } else {
        Arc::new(SendGridAdapter::new(
            config.sendgrid.clone(),
            config.worker.delivery_timeout(),
        )?)
    };

    if let Some(path) = &cli.seed {
        SeedFixture::load(path)?
            .apply(&library, &directory, store.as_ref(), Utc::now())
            .await?;
    }

    let collaborators = Collaborators {
        content: Arc::new(library),
        delivery,
        engagement: engagement.clone(),
        recipients: Arc::new(directory),
    };

    let scheduler = Arc::new(Scheduler::new(
        store,
        config.node_id.clone(),
        config.worker.clone(),
        collaborators,
        Arc::new(TracingSink),
    ));

    if cli.once {
        let report = scheduler.run_once(Utc::now()).await;
        info!(
            campaigns_dispatched = report.campaigns_dispatched,
            sent = report.steps.sent,
            skipped = report.steps.skipped,
            failed = report.steps.failed,
            deferred = report.steps.deferred,
            cycles_started = report.sweep.cycles_started,
            campaigns_completed = report.sweep.campaigns_completed,
            captured = if dry_run { capture.count() } else { 0 },
            "Single pass complete"
        );
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let webhook = config.webhook.enabled.then(|| {
        let state = WebhookState { tracker: engagement };
        let (webhook_config, shutdown) = (config.webhook.clone(), shutdown_rx.clone());
        tokio::spawn(async move {
            if let Err(e) = webhook::serve(webhook_config, state, shutdown).await {
                error!(error = %e, "Webhook endpoint failed");
            }
        })
    });
    let mut pollers = scheduler.spawn(shutdown_rx);
    info!(node_id = %config.node_id, pollers = pollers.len(), "Drip Express is running");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping pollers");
    let _ = shutdown_tx.send(true);

    while let Some(joined) = pollers.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "Poller task ended abnormally");
        }
    }
    if let Some(handle) = webhook {
        if let Err(e) = handle.await {
            error!(error = %e, "Webhook task ended abnormally");
        }
    }

    info!("Drip Express shut down");
    Ok(())
}

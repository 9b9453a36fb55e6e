//! Periodic pollers: due initial sends, due queued steps and the repeat
//! sweep. Each runs on its own interval and coordinates with other workers
//! only through store claims, so any number of processes can run them.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use drip_core::config::WorkerConfig;
use drip_core::event_bus::EventSink;
use drip_core::DripResult;
use drip_store::DripStore;

use crate::dispatcher::{elapsed_since, BatchReport, Collaborators, Dispatcher};
use crate::repeat::{RepeatCycleManager, SweepReport};

/// Totals from one pass of every enabled poller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub campaigns_dispatched: usize,
    pub steps: BatchReport,
    pub sweep: SweepReport,
}

pub struct Scheduler {
    store: Arc<dyn DripStore>,
    dispatcher: Arc<Dispatcher>,
    repeat: RepeatCycleManager,
    config: WorkerConfig,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn DripStore>,
        worker_id: impl Into<String>,
        config: WorkerConfig,
        collaborators: Collaborators,
        event_sink: Arc<dyn EventSink>,
    ) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            worker_id,
            &config,
            collaborators,
            event_sink.clone(),
        ));
        let repeat = RepeatCycleManager::new(store.clone(), dispatcher.planner().clone())
            .with_event_sink(event_sink);
        Self {
            store,
            dispatcher,
            repeat,
            config,
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn repeat(&self) -> &RepeatCycleManager {
        &self.repeat
    }

    /// Dispatches every campaign whose initial send is due.
    pub async fn run_initial_sends(&self, now: DateTime<Utc>) -> DripResult<usize> {
        let due = self.store.list_due_campaigns(now, self.config.batch_size).await?;
        let mut dispatched = 0;
        for campaign in due {
            match self.dispatcher.dispatch_campaign(campaign.id, now).await {
                Ok(report) if report.claimed => dispatched += 1,
                Ok(_) => {}
                Err(e) => warn!(campaign_id = %campaign.id, error = %e, "Initial dispatch failed"),
            }
        }
        Ok(dispatched)
    }

    /// Processes pending step records that are due, including ones whose
    /// previous claim expired.
    pub async fn run_queued_steps(&self, now: DateTime<Utc>) -> DripResult<BatchReport> {
        let started = Instant::now();
        let due = self.store.list_due_steps(now, self.config.batch_size).await?;
        if due.is_empty() {
            return Ok(BatchReport::default());
        }
        debug!(count = due.len(), "Processing due steps");
        let ids = due.into_iter().map(|r| r.id).collect();
        Ok(self.dispatcher.process_batch(ids, elapsed_since(now, started)).await)
    }

    pub async fn run_repeat_sweep(&self, now: DateTime<Utc>) -> DripResult<SweepReport> {
        self.repeat.sweep(now).await
    }

    /// Runs every enabled poller once, in pipeline order. Errors are logged.
    pub async fn run_once(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();
        if self.config.enable_initial_sends {
            match self.run_initial_sends(now).await {
                Ok(n) => report.campaigns_dispatched = n,
                Err(e) => warn!(error = %e, "Initial sends poll failed"),
            }
        }
        if self.config.enable_queued_steps {
            match self.run_queued_steps(now).await {
                Ok(steps) => report.steps = steps,
                Err(e) => warn!(error = %e, "Queued steps poll failed"),
            }
        }
        if self.config.enable_repeat_sweep {
            match self.run_repeat_sweep(now).await {
                Ok(sweep) => report.sweep = sweep,
                Err(e) => warn!(error = %e, "Repeat sweep failed"),
            }
        }
        report
    }

    /// Starts the enabled pollers. They stop once `shutdown` carries `true`
    /// or its sender is dropped.
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinSet<()> {
        let mut pollers = JoinSet::new();

        if self.config.enable_initial_sends {
            let this = self.clone();
            let period = Duration::from_secs(self.config.initial_sends_interval_secs);
            pollers.spawn(run_poller("initial_sends", period, shutdown.clone(), move || {
                let this = this.clone();
                async move {
                    match this.run_initial_sends(Utc::now()).await {
                        Ok(n) if n > 0 => info!(campaigns = n, "Initial sends dispatched"),
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "Initial sends poll failed"),
                    }
                }
            }));
        }

        if self.config.enable_queued_steps {
            let this = self.clone();
            let period = Duration::from_secs(self.config.queued_steps_interval_secs);
            pollers.spawn(run_poller("queued_steps", period, shutdown.clone(), move || {
                let this = this.clone();
                async move {
                    match this.run_queued_steps(Utc::now()).await {
                        Ok(report) if report.processed() > 0 || report.errors > 0 => info!(
                            sent = report.sent,
                            skipped = report.skipped,
                            failed = report.failed,
                            deferred = report.deferred,
                            errors = report.errors,
                            "Queued steps processed"
                        ),
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "Queued steps poll failed"),
                    }
                }
            }));
        }

        if self.config.enable_repeat_sweep {
            let this = self.clone();
            let period = Duration::from_secs(self.config.repeat_sweep_interval_secs);
            pollers.spawn(run_poller("repeat_sweep", period, shutdown, move || {
                let this = this.clone();
                async move {
                    match this.run_repeat_sweep(Utc::now()).await {
                        Ok(report) if report.cycles_started > 0 || report.campaigns_completed > 0 => info!(
                            cycles_started = report.cycles_started,
                            completed = report.campaigns_completed,
                            "Repeat sweep advanced campaigns"
                        ),
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "Repeat sweep failed"),
                    }
                }
            }));
        }

        pollers
    }
}

async fn run_poller<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!(poller = name, period_secs = period.as_secs(), "Poller started");

    loop {
        tokio::select! {
            _ = interval.tick() => {
                metrics::counter!("drip.poller.ticks", "poller" => name).increment(1);
                tick().await;
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    info!(poller = name, "Poller stopped");
}

//! Campaign dispatch and step processing.
//!
//! `dispatch_campaign` performs the initial send of a due campaign: it takes
//! the campaign lease, plans cycle 1 for every recipient and sends the step 0
//! records that are already due. `process_step` handles one due step record
//! end to end: claim, gate, render, deliver, resolve and plan the next step.
//!
//! All timestamps derive from the caller's `now` advanced by elapsed wall
//! time, so lease checks, claims and resolutions share one clock.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use drip_core::collaborators::{ContentResolver, DeliveryAdapter, EngagementTracker, RecipientStore};
use drip_core::config::WorkerConfig;
use drip_core::event_bus::{campaign_event, step_event, DripEventType, EventSink};
use drip_core::types::{
    Campaign, CampaignStatus, Message, MessageStatus, OutboundEmail, StepRecord, StepResolution,
};
use drip_core::{DripError, DripResult};
use drip_store::{CascadeReport, DripStore, StepClaim};

use crate::evaluator::{ConditionEvaluator, GateDecision};
use crate::lease::LeaseManager;
use crate::planner::SequencePlanner;

/// The external systems the engine calls into.
#[derive(Clone)]
pub struct Collaborators {
    pub content: Arc<dyn ContentResolver>,
    pub delivery: Arc<dyn DeliveryAdapter>,
    pub engagement: Arc<dyn EngagementTracker>,
    pub recipients: Arc<dyn RecipientStore>,
}

/// What happened to one step record in one processing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Sent,
    Skipped,
    Failed,
    /// Gating could not be evaluated; the claim was released.
    Deferred,
    /// The campaign is not sending; the claim was released.
    Held,
    Contended,
    NotDue,
    Missing,
    LeaseLost,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub sent: usize,
    pub skipped: usize,
    pub failed: usize,
    pub deferred: usize,
    pub held: usize,
    pub contended: usize,
    pub lease_lost: usize,
    pub errors: usize,
}

impl BatchReport {
    fn record(&mut self, outcome: StepOutcome) {
        match outcome {
            StepOutcome::Sent => self.sent += 1,
            StepOutcome::Skipped => self.skipped += 1,
            StepOutcome::Failed => self.failed += 1,
            StepOutcome::Deferred => self.deferred += 1,
            StepOutcome::Held => self.held += 1,
            StepOutcome::Contended | StepOutcome::NotDue | StepOutcome::Missing => self.contended += 1,
            StepOutcome::LeaseLost => self.lease_lost += 1,
        }
    }

    pub fn merge(&mut self, other: BatchReport) {
        self.sent += other.sent;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.deferred += other.deferred;
        self.held += other.held;
        self.contended += other.contended;
        self.lease_lost += other.lease_lost;
        self.errors += other.errors;
    }

    pub fn processed(&self) -> usize {
        self.sent + self.skipped + self.failed
    }
}

/// Result of the pre-send phase of a claimed step.
enum Prepared {
    Done(StepOutcome),
    Ready(ReadyDelivery),
}

struct ReadyDelivery {
    campaign: Campaign,
    message: Message,
    email: OutboundEmail,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Whether this worker won the campaign lease.
    pub claimed: bool,
    pub recipients: usize,
    pub planned: usize,
    pub steps: BatchReport,
}

pub struct Dispatcher {
    store: Arc<dyn DripStore>,
    lease: LeaseManager,
    planner: SequencePlanner,
    evaluator: ConditionEvaluator,
    collaborators: Collaborators,
    event_sink: Arc<dyn EventSink>,
    delivery_timeout: Duration,
    max_concurrent_sends: usize,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("lease", &self.lease)
            .field("delivery_timeout", &self.delivery_timeout)
            .field("max_concurrent_sends", &self.max_concurrent_sends)
            .finish()
    }
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn DripStore>,
        worker_id: impl Into<String>,
        config: &WorkerConfig,
        collaborators: Collaborators,
        event_sink: Arc<dyn EventSink>,
    ) -> Self {
        let lease = LeaseManager::new(store.clone(), worker_id, config);
        let planner = SequencePlanner::new(store.clone(), collaborators.content.clone())
            .with_event_sink(event_sink.clone());
        let evaluator = ConditionEvaluator::new(collaborators.engagement.clone(), config.store_timeout());
        Self {
            store,
            lease,
            planner,
            evaluator,
            collaborators,
            event_sink,
            delivery_timeout: config.delivery_timeout(),
            max_concurrent_sends: config.max_concurrent_sends.max(1),
        }
    }

    pub fn planner(&self) -> &SequencePlanner {
        &self.planner
    }

    pub fn lease(&self) -> &LeaseManager {
        &self.lease
    }

    // ─── Initial dispatch ───────────────────────────────────────────────

    pub async fn dispatch_campaign(self: &Arc<Self>, campaign_id: Uuid, now: DateTime<Utc>) -> DripResult<DispatchReport> {
        let started = Instant::now();
        let Some(campaign) = self.lease.claim_campaign(campaign_id, now).await? else {
            debug!(campaign_id = %campaign_id, "Campaign not claimable, skipping");
            return Ok(DispatchReport::default());
        };
        let mut report = DispatchReport {
            claimed: true,
            ..Default::default()
        };

        if campaign.effective_sequence().map_or(true, |s| s.steps.is_empty()) {
            warn!(campaign_id = %campaign.id, "Campaign has nothing to send, pausing");
            self.lease.finish_campaign(campaign.id, now, CampaignStatus::Paused).await?;
            return Ok(report);
        }

        let recipients = match self.expand_recipients(&campaign).await {
            Ok(recipients) => recipients,
            Err(e) => {
                self.abandon_dispatch(campaign.id).await;
                return Err(e);
            }
        };
        report.recipients = recipients.len();
        info!(campaign_id = %campaign.id, name = %campaign.name, recipients = recipients.len(), "Dispatching campaign");

        let mut due = Vec::new();
        for recipient_id in &recipients {
            match self.planner.start_cycle(&campaign, recipient_id, 1, now, now).await {
                Ok(Some(record)) => {
                    report.planned += 1;
                    if record.is_claimable(now) {
                        due.push(record.id);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    error!(campaign_id = %campaign.id, recipient_id = %recipient_id, error = %e, "Planning failed");
                    self.abandon_dispatch(campaign.id).await;
                    return Err(e);
                }
            }
        }

        if !self.lease.finish_campaign(campaign.id, now, CampaignStatus::Sending).await? {
            return Ok(report);
        }
        metrics::counter!("drip.campaigns.dispatched").increment(1);
        self.event_sink
            .emit(campaign_event(DripEventType::CampaignDispatched, campaign.id));

        report.steps = self.process_batch(due, elapsed_since(now, started)).await;
        Ok(report)
    }

    async fn expand_recipients(&self, campaign: &Campaign) -> DripResult<Vec<String>> {
        let mut seen = HashSet::new();
        let mut recipients = Vec::new();
        for id in &campaign.recipients.recipient_ids {
            if seen.insert(id.clone()) {
                recipients.push(id.clone());
            }
        }
        for list_id in &campaign.recipients.list_ids {
            match self.collaborators.recipients.list_members(list_id).await {
                Ok(members) => {
                    for id in members {
                        if seen.insert(id.clone()) {
                            recipients.push(id);
                        }
                    }
                }
                Err(e) if e.is_content_error() => {
                    warn!(campaign_id = %campaign.id, list_id = %list_id, error = %e, "Recipient list unavailable, skipping");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(recipients)
    }

    async fn abandon_dispatch(&self, campaign_id: Uuid) {
        if let Err(e) = self.lease.release_campaign(campaign_id).await {
            warn!(campaign_id = %campaign_id, error = %e, "Failed to release campaign lease");
        }
    }

    // ─── Step processing ────────────────────────────────────────────────

    /// Processes the given step records with bounded concurrency. Each task
    /// claims at `now` advanced by the time it waited for a send slot, so a
    /// lease always runs from the moment its claim was taken.
    pub async fn process_batch(self: &Arc<Self>, ids: Vec<Uuid>, now: DateTime<Utc>) -> BatchReport {
        let batch_started = Instant::now();
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_sends));
        let mut tasks = JoinSet::new();
        for id in ids {
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            let this = Arc::clone(self);
            let at = elapsed_since(now, batch_started);
            tasks.spawn(async move {
                let _permit = permit;
                (id, this.process_step(id, at).await)
            });
        }

        let mut report = BatchReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(outcome))) => report.record(outcome),
                Ok((id, Err(e))) => {
                    warn!(step_id = %id, error = %e, "Step processing failed");
                    report.errors += 1;
                }
                Err(e) => {
                    error!(error = %e, "Step task panicked");
                    report.errors += 1;
                }
            }
        }
        report
    }

    /// Claims and processes one step record.
    ///
    /// Errors before the transport is called release the claim so another
    /// pass can retry. Once the send happened the claim is never released:
    /// the step is resolved under the lease or left to expire.
    pub async fn process_step(&self, id: Uuid, now: DateTime<Utc>) -> DripResult<StepOutcome> {
        let started = Instant::now();
        let record = match self.lease.claim_step(id, now).await? {
            StepClaim::Claimed(record) => record,
            StepClaim::Contended => return Ok(StepOutcome::Contended),
            StepClaim::NotDue => return Ok(StepOutcome::NotDue),
            StepClaim::Missing => return Ok(StepOutcome::Missing),
        };

        let ready = match self.prepare(&record, now, started).await {
            Ok(Prepared::Done(outcome)) => return Ok(outcome),
            Ok(Prepared::Ready(ready)) => ready,
            Err(e) => {
                if let Err(release_err) = self.lease.release_step(record.id, elapsed_since(now, started)).await {
                    warn!(step_id = %record.id, error = %release_err, "Failed to release step after error");
                }
                return Err(e);
            }
        };
        self.deliver(&record, ready, now, started).await
    }

    /// Everything up to the transport call: campaign state, gating, recipient
    /// and content resolution, the lease check and the message record.
    async fn prepare(&self, record: &StepRecord, now: DateTime<Utc>, started: Instant) -> DripResult<Prepared> {
        let campaign = match self.store.get_campaign(record.key.campaign_id).await? {
            // Scheduled campaigns with step records are mid-dispatch.
            Some(campaign) if campaign.status.runs_steps() => campaign,
            other => {
                debug!(
                    key = %record.key,
                    status = ?other.map(|c| c.status),
                    "Campaign not sending, leaving step pending"
                );
                self.lease.release_step(record.id, elapsed_since(now, started)).await?;
                return Ok(Prepared::Done(StepOutcome::Held));
            }
        };

        let spec = campaign
            .effective_sequence()
            .and_then(|s| s.step(record.key.step_number).cloned());
        let Some(spec) = spec else {
            let resolution = StepResolution::Failed {
                message_id: None,
                error: format!("step {} is no longer defined", record.key.step_number),
            };
            return self.finish_early(&campaign, record, resolution, now, started).await;
        };

        if !spec.conditions.is_empty() {
            if let Some(previous_key) = record.key.previous() {
                let previous_message = self
                    .store
                    .find_step(&previous_key)
                    .await?
                    .and_then(|p| p.message_id);
                match self.evaluator.evaluate(&spec.conditions, previous_message).await {
                    GateDecision::Send => {}
                    GateDecision::Skip { reason } => {
                        let resolution = StepResolution::Skipped { reason };
                        return self.finish_early(&campaign, record, resolution, now, started).await;
                    }
                    GateDecision::Defer { reason } => {
                        self.lease.release_step(record.id, elapsed_since(now, started)).await?;
                        metrics::counter!("drip.steps.deferred", "reason" => "engagement").increment(1);
                        self.event_sink
                            .emit(step_event(DripEventType::StepDeferred, &record.key, Some(reason)));
                        return Ok(Prepared::Done(StepOutcome::Deferred));
                    }
                }
            }
        }

        let recipient = match self.collaborators.recipients.resolve(&record.key.recipient_id).await {
            Ok(recipient) => recipient,
            Err(e) if e.is_content_error() => {
                let resolution = StepResolution::Failed {
                    message_id: None,
                    error: e.to_string(),
                };
                return self.finish_early(&campaign, record, resolution, now, started).await;
            }
            Err(e) => return Err(e),
        };

        let content = match self.collaborators.content.resolve(&spec.content, &recipient).await {
            Ok(content) => content,
            Err(e) if e.is_content_error() => {
                let resolution = StepResolution::Failed {
                    message_id: None,
                    error: e.to_string(),
                };
                return self.finish_early(&campaign, record, resolution, now, started).await;
            }
            Err(e) => return Err(e),
        };

        // The send must finish inside the lease, otherwise another worker
        // could claim the expired step and send it again.
        let at = elapsed_since(now, started);
        if !record.is_held_by(self.lease.worker_id(), at) {
            warn!(key = %record.key, "Lease expired before delivery");
            metrics::counter!("drip.leases.lost", "kind" => "step").increment(1);
            return Ok(Prepared::Done(StepOutcome::LeaseLost));
        }
        let send_deadline = at
            + chrono::Duration::from_std(self.delivery_timeout).unwrap_or_else(|_| chrono::Duration::zero());
        if record.claim_expires_at.map_or(true, |exp| send_deadline >= exp) {
            debug!(key = %record.key, "Too little lease left to deliver, releasing");
            self.lease.release_step(record.id, at).await?;
            metrics::counter!("drip.steps.deferred", "reason" => "lease").increment(1);
            return Ok(Prepared::Done(StepOutcome::Deferred));
        }

        let mut message = Message::queued(record, recipient.email.clone(), content, at);
        self.store.put_message(message.clone()).await?;
        let email = OutboundEmail::from_message(&message, &campaign.sender);
        message.status = MessageStatus::Sending;
        self.store.put_message(message.clone()).await?;

        Ok(Prepared::Ready(ReadyDelivery { campaign, message, email }))
    }

    async fn finish_early(
        &self,
        campaign: &Campaign,
        record: &StepRecord,
        resolution: StepResolution,
        now: DateTime<Utc>,
        started: Instant,
    ) -> DripResult<Prepared> {
        self.finish(campaign, record, resolution, elapsed_since(now, started))
            .await
            .map(Prepared::Done)
    }

    /// Calls the transport and records the result. Nothing here hands the
    /// claim back, so a failure after the send never leads to a second send.
    async fn deliver(
        &self,
        record: &StepRecord,
        ready: ReadyDelivery,
        now: DateTime<Utc>,
        started: Instant,
    ) -> DripResult<StepOutcome> {
        let ReadyDelivery {
            campaign,
            mut message,
            email,
        } = ready;

        let sent = match tokio::time::timeout(self.delivery_timeout, self.collaborators.delivery.send(&email)).await {
            Ok(result) => result,
            Err(_) => Err(DripError::Timeout(format!(
                "delivery exceeded {}ms",
                self.delivery_timeout.as_millis()
            ))),
        };

        let at = elapsed_since(now, started);
        let resolution = match sent {
            Ok(transport_id) => {
                message.status = MessageStatus::Sent;
                message.transport_message_id = Some(transport_id);
                message.sent_at = Some(at);
                StepResolution::Sent {
                    message_id: message.id,
                    sent_at: at,
                }
            }
            Err(e) => {
                warn!(key = %record.key, message_id = %message.id, error = %e, "Delivery failed");
                message.status = MessageStatus::Failed;
                message.error = Some(e.to_string());
                StepResolution::Failed {
                    message_id: Some(message.id),
                    error: e.to_string(),
                }
            }
        };

        if let Err(e) = self.store.put_message(message.clone()).await {
            error!(
                key = %record.key,
                message_id = %message.id,
                status = ?message.status,
                error = %e,
                "Failed to persist message after delivery"
            );
            metrics::counter!("drip.messages.persist_failed").increment(1);
        }

        if message.status == MessageStatus::Sent {
            if let Err(e) = self.collaborators.engagement.record_sent(message.id).await {
                warn!(message_id = %message.id, error = %e, "Failed to record sent event");
            }
            if let Some(transport_id) = &message.transport_message_id {
                if let Err(e) = self
                    .collaborators
                    .engagement
                    .link_transport_id(transport_id, message.id)
                    .await
                {
                    warn!(message_id = %message.id, error = %e, "Failed to index transport message id");
                }
            }
        }

        self.finish(&campaign, record, resolution, at).await
    }

    /// Writes the outcome under the lease, then updates stats and plans the
    /// next step.
    async fn finish(
        &self,
        campaign: &Campaign,
        record: &StepRecord,
        resolution: StepResolution,
        at: DateTime<Utc>,
    ) -> DripResult<StepOutcome> {
        let resolved = match self.lease.resolve_step(record.id, at, &resolution).await {
            Ok(resolved) => resolved,
            Err(DripError::LeaseLost(_)) => return Ok(StepOutcome::LeaseLost),
            Err(e) => return Err(e),
        };
        self.store.record_stats(campaign.id, resolution.stats_delta()).await?;

        let (outcome, event_type, detail) = match &resolution {
            StepResolution::Sent { message_id, .. } => {
                metrics::counter!("drip.steps.sent").increment(1);
                (StepOutcome::Sent, DripEventType::StepSent, Some(message_id.to_string()))
            }
            StepResolution::Skipped { reason } => {
                metrics::counter!("drip.steps.skipped").increment(1);
                (StepOutcome::Skipped, DripEventType::StepSkipped, Some(reason.clone()))
            }
            StepResolution::Failed { error, .. } => {
                metrics::counter!("drip.steps.failed", "reason" => "delivery").increment(1);
                (StepOutcome::Failed, DripEventType::StepFailed, Some(error.clone()))
            }
        };
        info!(key = %resolved.key, status = resolved.status.as_str(), "Step resolved");
        self.event_sink.emit(step_event(event_type, &resolved.key, detail));

        self.planner.advance(campaign, &resolved, at).await?;
        Ok(outcome)
    }

    // ─── Campaign control ───────────────────────────────────────────────

    /// Stops step processing for a sending campaign. Pending steps stay
    /// pending until the campaign resumes.
    pub async fn pause_campaign(&self, id: Uuid, now: DateTime<Utc>) -> DripResult<bool> {
        let paused = self
            .store
            .transition_campaign(id, CampaignStatus::Sending, CampaignStatus::Paused, now)
            .await?;
        if paused {
            info!(campaign_id = %id, "Campaign paused");
        }
        Ok(paused)
    }

    pub async fn resume_campaign(&self, id: Uuid, now: DateTime<Utc>) -> DripResult<bool> {
        let resumed = self
            .store
            .transition_campaign(id, CampaignStatus::Paused, CampaignStatus::Sending, now)
            .await?;
        if resumed {
            info!(campaign_id = %id, "Campaign resumed");
        }
        Ok(resumed)
    }

    /// Cancels everything outstanding for the campaign, then deletes it.
    pub async fn delete_campaign(&self, id: Uuid, now: DateTime<Utc>) -> DripResult<CascadeReport> {
        let report = self.store.delete_campaign(id, now).await?;
        info!(
            campaign_id = %id,
            steps_cancelled = report.steps_cancelled,
            messages_cancelled = report.messages_cancelled,
            "Campaign deleted"
        );
        self.event_sink
            .emit(campaign_event(DripEventType::CampaignCancelled, id));
        Ok(report)
    }
}

/// `now` advanced by the wall time spent since `started`.
pub(crate) fn elapsed_since(now: DateTime<Utc>, started: Instant) -> DateTime<Utc> {
    now + chrono::Duration::from_std(started.elapsed()).unwrap_or_else(|_| chrono::Duration::zero())
}

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use drip_channels::{CaptureAdapter, ContentLibrary, EmailTemplate, EngagementLog, RecipientDirectory};
use drip_core::collaborators::DeliveryAdapter;
use drip_core::config::WorkerConfig;
use drip_core::event_bus::{capture_sink, CaptureSink};
use drip_core::types::{
    Campaign, CampaignStats, CampaignStatus, ContentRef, GatingConditions, Message, MessageStatus,
    OutboundEmail, Recipient, RecipientSet, SendType, SenderConfig, SequenceDefinition, StatsDelta,
    StepKey, StepRecord, StepResolution, StepSpec,
};
use drip_core::{DripError, DripResult};
use drip_store::{CascadeReport, DripStore, InsertOutcome, MemoryStore, StepClaim};

use crate::dispatcher::{Collaborators, Dispatcher};
use crate::planner::SequencePlanner;
use crate::repeat::RepeatCycleManager;
use crate::scheduler::Scheduler;

pub(crate) fn step(template_id: &str, delay_hours: u32, conditions: GatingConditions) -> StepSpec {
    StepSpec {
        content: ContentRef::Template {
            template_id: template_id.to_string(),
        },
        delay_hours,
        conditions,
    }
}

/// An immediate sequence campaign ready for initial dispatch.
pub(crate) fn sequence_campaign(steps: Vec<StepSpec>, repeat_days: u32, recipients: &[&str]) -> Campaign {
    let now = Utc::now();
    Campaign {
        id: Uuid::new_v4(),
        owner_id: "owner-1".into(),
        name: "Onboarding".into(),
        recipients: RecipientSet {
            recipient_ids: recipients.iter().map(|r| r.to_string()).collect(),
            list_ids: vec![],
        },
        send_type: SendType::Sequence,
        content: None,
        sequence: Some(SequenceDefinition {
            steps,
            repeat_days,
            max_cycles: None,
        }),
        sender: SenderConfig::default(),
        status: CampaignStatus::Scheduled,
        scheduled_at: None,
        claimed_by: None,
        claim_expires_at: None,
        stats: CampaignStats::default(),
        created_at: now,
        updated_at: now,
    }
}

/// In-memory store and collaborators wired the way the binary wires them.
pub(crate) struct Harness {
    pub store: Arc<MemoryStore>,
    pub library: ContentLibrary,
    pub directory: RecipientDirectory,
    pub adapter: Arc<CaptureAdapter>,
    pub engagement: EngagementLog,
    pub events: Arc<CaptureSink>,
    pub config: WorkerConfig,
}

impl Harness {
    pub fn new(templates: &[&str], recipients: &[&str]) -> Self {
        let library = ContentLibrary::new();
        for id in templates {
            library.add_template(EmailTemplate {
                id: id.to_string(),
                name: id.to_string(),
                subject: format!("{id} for {{{{recipient.first_name | default}}}}"),
                html: format!("<p>{id}</p>"),
                text: id.to_string(),
                attachments: vec![],
            });
        }
        let directory = RecipientDirectory::new();
        for id in recipients {
            directory.upsert(Recipient {
                id: id.to_string(),
                email: format!("{id}@example.com"),
                profile: HashMap::new(),
            });
        }
        Self {
            store: Arc::new(MemoryStore::new()),
            library,
            directory,
            adapter: Arc::new(CaptureAdapter::new()),
            engagement: EngagementLog::new(),
            events: capture_sink(),
            config: WorkerConfig::default(),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            content: Arc::new(self.library.clone()),
            delivery: self.adapter.clone(),
            engagement: Arc::new(self.engagement.clone()),
            recipients: Arc::new(self.directory.clone()),
        }
    }

    pub fn planner(&self) -> SequencePlanner {
        SequencePlanner::new(self.store.clone(), Arc::new(self.library.clone()))
            .with_event_sink(self.events.clone())
    }

    pub fn dispatcher(&self, worker_id: &str) -> Arc<Dispatcher> {
        Arc::new(Dispatcher::new(
            self.store.clone(),
            worker_id,
            &self.config,
            self.collaborators(),
            self.events.clone(),
        ))
    }

    /// A dispatcher over a different store view or transport than the
    /// harness defaults.
    pub fn dispatcher_with(
        &self,
        worker_id: &str,
        store: Arc<dyn DripStore>,
        delivery: Arc<dyn DeliveryAdapter>,
    ) -> Arc<Dispatcher> {
        let collaborators = Collaborators {
            delivery,
            ..self.collaborators()
        };
        Arc::new(Dispatcher::new(store, worker_id, &self.config, collaborators, self.events.clone()))
    }

    pub fn repeat(&self) -> RepeatCycleManager {
        RepeatCycleManager::new(self.store.clone(), self.planner()).with_event_sink(self.events.clone())
    }

    pub fn scheduler(&self, worker_id: &str) -> Arc<Scheduler> {
        Arc::new(Scheduler::new(
            self.store.clone(),
            worker_id,
            self.config.clone(),
            self.collaborators(),
            self.events.clone(),
        ))
    }
}

/// Delivers through `inner` after a fixed delay.
pub(crate) struct SlowAdapter {
    pub inner: Arc<dyn DeliveryAdapter>,
    pub delay: Duration,
}

#[async_trait]
impl DeliveryAdapter for SlowAdapter {
    async fn send(&self, email: &OutboundEmail) -> DripResult<String> {
        tokio::time::sleep(self.delay).await;
        self.inner.send(email).await
    }
}

/// Notes the stored status of each message at the moment it is handed to
/// the transport.
pub(crate) struct StatusAtSend {
    pub store: Arc<MemoryStore>,
    pub inner: Arc<dyn DeliveryAdapter>,
    pub seen: Mutex<Vec<Option<MessageStatus>>>,
}

#[async_trait]
impl DeliveryAdapter for StatusAtSend {
    async fn send(&self, email: &OutboundEmail) -> DripResult<String> {
        let status = self.store.get_message(email.message_id).await?.map(|m| m.status);
        self.seen
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(status);
        self.inner.send(email).await
    }
}

/// Deletes the campaign while its message is in flight.
pub(crate) struct DeleteDuringSend {
    pub store: Arc<MemoryStore>,
    pub campaign_id: Uuid,
}

#[async_trait]
impl DeliveryAdapter for DeleteDuringSend {
    async fn send(&self, email: &OutboundEmail) -> DripResult<String> {
        self.store.delete_campaign(self.campaign_id, Utc::now()).await?;
        Ok(format!("sg-{}", email.message_id.simple()))
    }
}

/// Memory store whose writes of delivered messages fail.
pub(crate) struct FailingSentWrites {
    pub inner: Arc<MemoryStore>,
    pub failures: AtomicUsize,
}

impl FailingSentWrites {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            failures: AtomicUsize::new(0),
        }
    }

    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DripStore for FailingSentWrites {
    async fn put_campaign(&self, campaign: Campaign) -> DripResult<()> {
        self.inner.put_campaign(campaign).await
    }

    async fn get_campaign(&self, id: Uuid) -> DripResult<Option<Campaign>> {
        self.inner.get_campaign(id).await
    }

    async fn list_campaigns(&self, status: CampaignStatus) -> DripResult<Vec<Campaign>> {
        self.inner.list_campaigns(status).await
    }

    async fn list_due_campaigns(&self, now: DateTime<Utc>, limit: usize) -> DripResult<Vec<Campaign>> {
        self.inner.list_due_campaigns(now, limit).await
    }

    async fn try_claim_campaign(
        &self,
        id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> DripResult<Option<Campaign>> {
        self.inner.try_claim_campaign(id, worker_id, now, lease_until).await
    }

    async fn finish_campaign_dispatch(
        &self,
        id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
        status: CampaignStatus,
    ) -> DripResult<bool> {
        self.inner.finish_campaign_dispatch(id, worker_id, now, status).await
    }

    async fn release_campaign(&self, id: Uuid, worker_id: &str) -> DripResult<bool> {
        self.inner.release_campaign(id, worker_id).await
    }

    async fn transition_campaign(
        &self,
        id: Uuid,
        from: CampaignStatus,
        to: CampaignStatus,
        now: DateTime<Utc>,
    ) -> DripResult<bool> {
        self.inner.transition_campaign(id, from, to, now).await
    }

    async fn record_stats(&self, id: Uuid, delta: StatsDelta) -> DripResult<()> {
        self.inner.record_stats(id, delta).await
    }

    async fn delete_campaign(&self, id: Uuid, now: DateTime<Utc>) -> DripResult<CascadeReport> {
        self.inner.delete_campaign(id, now).await
    }

    async fn insert_step(&self, record: StepRecord) -> DripResult<InsertOutcome> {
        self.inner.insert_step(record).await
    }

    async fn get_step(&self, id: Uuid) -> DripResult<Option<StepRecord>> {
        self.inner.get_step(id).await
    }

    async fn find_step(&self, key: &StepKey) -> DripResult<Option<StepRecord>> {
        self.inner.find_step(key).await
    }

    async fn list_due_steps(&self, now: DateTime<Utc>, limit: usize) -> DripResult<Vec<StepRecord>> {
        self.inner.list_due_steps(now, limit).await
    }

    async fn try_claim_step(
        &self,
        id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> DripResult<StepClaim> {
        self.inner.try_claim_step(id, worker_id, now, lease_until).await
    }

    async fn release_step(&self, id: Uuid, worker_id: &str, now: DateTime<Utc>) -> DripResult<bool> {
        self.inner.release_step(id, worker_id, now).await
    }

    async fn resolve_step(
        &self,
        id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
        resolution: &StepResolution,
    ) -> DripResult<StepRecord> {
        self.inner.resolve_step(id, worker_id, now, resolution).await
    }

    async fn steps_for_campaign(&self, campaign_id: Uuid) -> DripResult<Vec<StepRecord>> {
        self.inner.steps_for_campaign(campaign_id).await
    }

    async fn put_message(&self, message: Message) -> DripResult<()> {
        if message.status == MessageStatus::Sent {
            self.failures.fetch_add(1, Ordering::SeqCst);
            return Err(DripError::Store("connection reset".to_string()));
        }
        self.inner.put_message(message).await
    }

    async fn get_message(&self, id: Uuid) -> DripResult<Option<Message>> {
        self.inner.get_message(id).await
    }
}

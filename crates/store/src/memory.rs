//! In-process store backed by DashMap.
//!
//! Conditional updates run while holding the entry's shard lock, so they are
//! atomic across tasks and threads of one process. Use `RedisStore` once more
//! than one process polls the same campaigns.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use drip_core::types::{
    Campaign, CampaignStatus, Message, MessageStatus, StatsDelta, StepKey, StepRecord,
    StepResolution, StepStatus,
};
use drip_core::{DripError, DripResult};

use crate::repository::{CascadeReport, DripStore, InsertOutcome, StepClaim};

#[derive(Clone, Default)]
pub struct MemoryStore {
    campaigns: Arc<DashMap<Uuid, Campaign>>,
    steps: Arc<DashMap<Uuid, StepRecord>>,
    step_keys: Arc<DashMap<StepKey, Uuid>>,
    messages: Arc<DashMap<Uuid, Message>>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("campaigns", &self.campaigns.len())
            .field("steps", &self.steps.len())
            .field("messages", &self.messages.len())
            .finish()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        info!("Drip store initialized (in-memory)");
        Self::default()
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }
}

#[async_trait]
impl DripStore for MemoryStore {
    async fn put_campaign(&self, campaign: Campaign) -> DripResult<()> {
        debug!(campaign_id = %campaign.id, status = campaign.status.as_str(), "Storing campaign");
        self.campaigns.insert(campaign.id, campaign);
        Ok(())
    }

    async fn get_campaign(&self, id: Uuid) -> DripResult<Option<Campaign>> {
        Ok(self.campaigns.get(&id).map(|r| r.value().clone()))
    }

    async fn list_campaigns(&self, status: CampaignStatus) -> DripResult<Vec<Campaign>> {
        let mut campaigns: Vec<Campaign> = self
            .campaigns
            .iter()
            .filter(|r| r.value().status == status)
            .map(|r| r.value().clone())
            .collect();
        campaigns.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(campaigns)
    }

    async fn list_due_campaigns(&self, now: DateTime<Utc>, limit: usize) -> DripResult<Vec<Campaign>> {
        let mut due: Vec<Campaign> = self
            .campaigns
            .iter()
            .filter(|r| r.value().is_due(now) && !r.value().is_leased(now))
            .map(|r| r.value().clone())
            .collect();
        due.sort_by_key(|c| c.scheduled_at.unwrap_or(c.created_at));
        due.truncate(limit);
        Ok(due)
    }

    async fn try_claim_campaign(
        &self,
        id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> DripResult<Option<Campaign>> {
        let Some(mut entry) = self.campaigns.get_mut(&id) else {
            return Ok(None);
        };
        let campaign = entry.value_mut();
        if !campaign.is_due(now) || campaign.is_leased(now) {
            return Ok(None);
        }
        campaign.claimed_by = Some(worker_id.to_string());
        campaign.claim_expires_at = Some(lease_until);
        campaign.updated_at = now;
        Ok(Some(campaign.clone()))
    }

    async fn finish_campaign_dispatch(
        &self,
        id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
        status: CampaignStatus,
    ) -> DripResult<bool> {
        let Some(mut entry) = self.campaigns.get_mut(&id) else {
            return Ok(false);
        };
        let campaign = entry.value_mut();
        if campaign.claimed_by.as_deref() != Some(worker_id) || !campaign.is_leased(now) {
            return Ok(false);
        }
        campaign.status = status;
        campaign.claimed_by = None;
        campaign.claim_expires_at = None;
        campaign.updated_at = now;
        Ok(true)
    }

    async fn release_campaign(&self, id: Uuid, worker_id: &str) -> DripResult<bool> {
        let Some(mut entry) = self.campaigns.get_mut(&id) else {
            return Ok(false);
        };
        let campaign = entry.value_mut();
        if campaign.claimed_by.as_deref() != Some(worker_id) {
            return Ok(false);
        }
        campaign.claimed_by = None;
        campaign.claim_expires_at = None;
        Ok(true)
    }

    async fn transition_campaign(
        &self,
        id: Uuid,
        from: CampaignStatus,
        to: CampaignStatus,
        now: DateTime<Utc>,
    ) -> DripResult<bool> {
        let Some(mut entry) = self.campaigns.get_mut(&id) else {
            return Ok(false);
        };
        let campaign = entry.value_mut();
        if campaign.status != from {
            return Ok(false);
        }
        campaign.status = to;
        campaign.updated_at = now;
        Ok(true)
    }

    async fn record_stats(&self, id: Uuid, delta: StatsDelta) -> DripResult<()> {
        let mut entry = self
            .campaigns
            .get_mut(&id)
            .ok_or(DripError::CampaignNotFound(id))?;
        let stats = &mut entry.value_mut().stats;
        stats.total_sent += delta.sent;
        stats.total_failed += delta.failed;
        stats.total_skipped += delta.skipped;
        Ok(())
    }

    async fn delete_campaign(&self, id: Uuid, now: DateTime<Utc>) -> DripResult<CascadeReport> {
        let mut report = CascadeReport::default();

        // Removing the campaign first waits out any insert holding its entry
        // and refuses every later one, so the sweep below sees all children.
        self.campaigns.remove(&id);

        let step_ids: Vec<Uuid> = self
            .steps
            .iter()
            .filter(|r| r.value().key.campaign_id == id)
            .map(|r| *r.key())
            .collect();
        for step_id in &step_ids {
            if let Some(mut entry) = self.steps.get_mut(step_id) {
                let record = entry.value_mut();
                if matches!(record.status, StepStatus::Pending | StepStatus::Claimed) {
                    record.status = StepStatus::Cancelled;
                    record.claimed_by = None;
                    record.claim_expires_at = None;
                    record.updated_at = now;
                    report.steps_cancelled += 1;
                }
            }
        }

        let message_ids: Vec<Uuid> = self
            .messages
            .iter()
            .filter(|r| r.value().campaign_id == id)
            .map(|r| *r.key())
            .collect();
        for message_id in &message_ids {
            if let Some(mut entry) = self.messages.get_mut(message_id) {
                let message = entry.value_mut();
                if matches!(message.status, MessageStatus::Queued | MessageStatus::Sending) {
                    message.status = MessageStatus::Cancelled;
                    report.messages_cancelled += 1;
                }
            }
        }

        for step_id in &step_ids {
            if let Some((_, record)) = self.steps.remove(step_id) {
                self.step_keys.remove(&record.key);
                report.steps_deleted += 1;
            }
        }
        for message_id in &message_ids {
            if self.messages.remove(message_id).is_some() {
                report.messages_deleted += 1;
            }
        }

        info!(
            campaign_id = %id,
            steps_cancelled = report.steps_cancelled,
            messages_cancelled = report.messages_cancelled,
            "Deleted campaign"
        );
        Ok(report)
    }

    async fn insert_step(&self, record: StepRecord) -> DripResult<InsertOutcome> {
        let campaign_id = record.key.campaign_id;
        let _campaign = self
            .campaigns
            .get(&campaign_id)
            .ok_or(DripError::CampaignNotFound(campaign_id))?;
        match self.step_keys.entry(record.key.clone()) {
            Entry::Occupied(existing) => {
                let id = *existing.get();
                let current = self
                    .steps
                    .get(&id)
                    .map(|r| r.value().clone())
                    .ok_or(DripError::StepNotFound(id))?;
                Ok(InsertOutcome::Exists(current))
            }
            Entry::Vacant(slot) => {
                self.steps.insert(record.id, record.clone());
                slot.insert(record.id);
                Ok(InsertOutcome::Inserted(record))
            }
        }
    }

    async fn get_step(&self, id: Uuid) -> DripResult<Option<StepRecord>> {
        Ok(self.steps.get(&id).map(|r| r.value().clone()))
    }

    async fn find_step(&self, key: &StepKey) -> DripResult<Option<StepRecord>> {
        let Some(id) = self.step_keys.get(key).map(|r| *r.value()) else {
            return Ok(None);
        };
        Ok(self.steps.get(&id).map(|r| r.value().clone()))
    }

    async fn list_due_steps(&self, now: DateTime<Utc>, limit: usize) -> DripResult<Vec<StepRecord>> {
        let claimable: Vec<StepRecord> = self
            .steps
            .iter()
            .filter(|r| r.value().is_claimable(now))
            .map(|r| r.value().clone())
            .collect();
        // Steps of paused or finished campaigns never take a slot from
        // campaigns that can still deliver.
        let mut due: Vec<StepRecord> = claimable
            .into_iter()
            .filter(|r| {
                self.campaigns
                    .get(&r.key.campaign_id)
                    .is_some_and(|c| c.value().status.runs_steps())
            })
            .collect();
        due.sort_by_key(|r| r.scheduled_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn try_claim_step(
        &self,
        id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> DripResult<StepClaim> {
        let Some(mut entry) = self.steps.get_mut(&id) else {
            return Ok(StepClaim::Missing);
        };
        let record = entry.value_mut();
        if record.status.is_terminal() {
            return Ok(StepClaim::Contended);
        }
        if record.scheduled_at > now {
            return Ok(StepClaim::NotDue);
        }
        if !record.is_claimable(now) {
            return Ok(StepClaim::Contended);
        }
        record.status = StepStatus::Claimed;
        record.claimed_by = Some(worker_id.to_string());
        record.claim_expires_at = Some(lease_until);
        record.updated_at = now;
        Ok(StepClaim::Claimed(record.clone()))
    }

    async fn release_step(&self, id: Uuid, worker_id: &str, now: DateTime<Utc>) -> DripResult<bool> {
        let Some(mut entry) = self.steps.get_mut(&id) else {
            return Ok(false);
        };
        let record = entry.value_mut();
        if record.status != StepStatus::Claimed || record.claimed_by.as_deref() != Some(worker_id) {
            return Ok(false);
        }
        record.status = StepStatus::Pending;
        record.claimed_by = None;
        record.claim_expires_at = None;
        record.updated_at = now;
        Ok(true)
    }

    async fn resolve_step(
        &self,
        id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
        resolution: &StepResolution,
    ) -> DripResult<StepRecord> {
        let mut entry = self.steps.get_mut(&id).ok_or(DripError::StepNotFound(id))?;
        let record = entry.value_mut();
        if !record.is_held_by(worker_id, now) {
            return Err(DripError::LeaseLost(id));
        }
        resolution.apply(record, now);
        Ok(record.clone())
    }

    async fn steps_for_campaign(&self, campaign_id: Uuid) -> DripResult<Vec<StepRecord>> {
        let mut records: Vec<StepRecord> = self
            .steps
            .iter()
            .filter(|r| r.value().key.campaign_id == campaign_id)
            .map(|r| r.value().clone())
            .collect();
        records.sort_by(|a, b| {
            (&a.key.recipient_id, a.key.cycle, a.key.step_number).cmp(&(
                &b.key.recipient_id,
                b.key.cycle,
                b.key.step_number,
            ))
        });
        Ok(records)
    }

    async fn put_message(&self, message: Message) -> DripResult<()> {
        let _campaign = self
            .campaigns
            .get(&message.campaign_id)
            .ok_or(DripError::CampaignNotFound(message.campaign_id))?;
        self.messages.insert(message.id, message);
        Ok(())
    }

    async fn get_message(&self, id: Uuid) -> DripResult<Option<Message>> {
        Ok(self.messages.get(&id).map(|r| r.value().clone()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Duration;
    use drip_core::types::{CampaignStats, ContentRef, RecipientSet, SendType, SenderConfig};

    fn campaign(status: CampaignStatus, scheduled_at: Option<DateTime<Utc>>) -> Campaign {
        let now = Utc::now();
        Campaign {
            id: Uuid::new_v4(),
            owner_id: "owner-1".into(),
            name: "Spring promo".into(),
            recipients: RecipientSet::default(),
            send_type: SendType::Scheduled,
            content: Some(ContentRef::Template {
                template_id: "promo".into(),
            }),
            sequence: None,
            sender: SenderConfig::default(),
            status,
            scheduled_at,
            claimed_by: None,
            claim_expires_at: None,
            stats: CampaignStats::default(),
            created_at: now,
            updated_at: now,
        }
    }

    async fn sending_campaign(store: &MemoryStore) -> Uuid {
        let c = campaign(CampaignStatus::Sending, None);
        let id = c.id;
        store.put_campaign(c).await.unwrap();
        id
    }

    #[tokio::test]
    async fn test_insert_step_is_idempotent_per_key() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let key = StepKey::new(sending_campaign(&store).await, "r-1", 0, 1);

        let first = store
            .insert_step(StepRecord::pending(key.clone(), now, now))
            .await
            .unwrap();
        let second = store
            .insert_step(StepRecord::pending(key.clone(), now, now))
            .await
            .unwrap();

        assert!(first.was_inserted());
        assert!(!second.was_inserted());
        assert_eq!(first.record().id, second.record().id);
        assert_eq!(store.step_count(), 1);
    }

    #[tokio::test]
    async fn test_claim_outcomes() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let lease = now + Duration::minutes(2);
        let campaign_id = sending_campaign(&store).await;

        let future = StepRecord::pending(StepKey::new(campaign_id, "r-1", 0, 1), now + Duration::hours(1), now);
        let future_id = future.id;
        store.insert_step(future).await.unwrap();
        assert_eq!(
            store.try_claim_step(future_id, "w-1", now, lease).await.unwrap(),
            StepClaim::NotDue
        );

        let due = StepRecord::pending(StepKey::new(campaign_id, "r-2", 0, 1), now, now);
        let due_id = due.id;
        store.insert_step(due).await.unwrap();
        assert!(matches!(
            store.try_claim_step(due_id, "w-1", now, lease).await.unwrap(),
            StepClaim::Claimed(_)
        ));
        assert_eq!(
            store.try_claim_step(due_id, "w-2", now, lease).await.unwrap(),
            StepClaim::Contended
        );
        assert_eq!(
            store.try_claim_step(Uuid::new_v4(), "w-2", now, lease).await.unwrap(),
            StepClaim::Missing
        );
    }

    #[tokio::test]
    async fn test_expired_claim_can_be_taken_over() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let campaign_id = sending_campaign(&store).await;
        let record = StepRecord::pending(StepKey::new(campaign_id, "r-1", 0, 1), now, now);
        let id = record.id;
        store.insert_step(record).await.unwrap();

        store
            .try_claim_step(id, "w-1", now, now + Duration::minutes(2))
            .await
            .unwrap();
        let later = now + Duration::minutes(3);
        assert!(store.list_due_steps(later, 10).await.unwrap().iter().any(|r| r.id == id));
        let takeover = store
            .try_claim_step(id, "w-2", later, later + Duration::minutes(2))
            .await
            .unwrap();
        assert!(matches!(takeover, StepClaim::Claimed(r) if r.claimed_by.as_deref() == Some("w-2")));

        let lost = store
            .resolve_step(id, "w-1", later, &StepResolution::Skipped { reason: "late".into() })
            .await;
        assert!(matches!(lost, Err(DripError::LeaseLost(_))));
    }

    #[tokio::test]
    async fn test_campaign_claim_and_finish() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let c = campaign(CampaignStatus::Scheduled, Some(now - Duration::minutes(1)));
        let id = c.id;
        store.put_campaign(c).await.unwrap();
        store
            .put_campaign(campaign(CampaignStatus::Scheduled, Some(now + Duration::hours(1))))
            .await
            .unwrap();

        let due = store.list_due_campaigns(now, 10).await.unwrap();
        assert_eq!(due.len(), 1);

        let lease = now + Duration::minutes(5);
        assert!(store.try_claim_campaign(id, "w-1", now, lease).await.unwrap().is_some());
        assert!(store.try_claim_campaign(id, "w-2", now, lease).await.unwrap().is_none());
        assert!(store.list_due_campaigns(now, 10).await.unwrap().is_empty());

        assert!(!store
            .finish_campaign_dispatch(id, "w-2", now, CampaignStatus::Sending)
            .await
            .unwrap());
        assert!(store
            .finish_campaign_dispatch(id, "w-1", now, CampaignStatus::Sending)
            .await
            .unwrap());
        let stored = store.get_campaign(id).await.unwrap().unwrap();
        assert_eq!(stored.status, CampaignStatus::Sending);
        assert!(stored.claimed_by.is_none());
    }

    #[tokio::test]
    async fn test_delete_campaign_cancels_then_removes() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let c = campaign(CampaignStatus::Sending, None);
        let id = c.id;
        store.put_campaign(c).await.unwrap();

        let pending = StepRecord::pending(StepKey::new(id, "r-1", 1, 1), now, now);
        let sent = StepRecord {
            status: StepStatus::Sent,
            ..StepRecord::pending(StepKey::new(id, "r-1", 0, 1), now, now)
        };
        let queued = Message::queued(&pending, "a@example.com".into(), Default::default(), now);
        store.insert_step(pending).await.unwrap();
        store.insert_step(sent).await.unwrap();
        store.put_message(queued).await.unwrap();

        let report = store.delete_campaign(id, now).await.unwrap();
        assert_eq!(report.steps_cancelled, 1);
        assert_eq!(report.messages_cancelled, 1);
        assert_eq!(report.steps_deleted, 2);
        assert!(store.get_campaign(id).await.unwrap().is_none());
        assert!(store.find_step(&StepKey::new(id, "r-1", 0, 1)).await.unwrap().is_none());
        assert_eq!(store.message_count(), 0);
    }

    #[tokio::test]
    async fn test_record_stats_accumulates() {
        let store = MemoryStore::new();
        let c = campaign(CampaignStatus::Sending, None);
        let id = c.id;
        store.put_campaign(c).await.unwrap();

        store.record_stats(id, StatsDelta::sent()).await.unwrap();
        store.record_stats(id, StatsDelta::sent()).await.unwrap();
        store.record_stats(id, StatsDelta::skipped()).await.unwrap();

        let stats = store.get_campaign(id).await.unwrap().unwrap().stats;
        assert_eq!(stats.total_sent, 2);
        assert_eq!(stats.total_skipped, 1);
        assert_eq!(stats.total_failed, 0);
    }

    #[tokio::test]
    async fn test_due_steps_skip_campaigns_that_cannot_deliver() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let paused = campaign(CampaignStatus::Paused, None);
        let paused_id = paused.id;
        store.put_campaign(paused).await.unwrap();
        let active_id = sending_campaign(&store).await;

        for recipient in ["r-1", "r-2"] {
            let older = StepRecord::pending(
                StepKey::new(paused_id, recipient, 0, 1),
                now - Duration::hours(2),
                now,
            );
            store.insert_step(older).await.unwrap();
        }
        let active = StepRecord::pending(StepKey::new(active_id, "r-3", 0, 1), now, now);
        let active_step = active.id;
        store.insert_step(active).await.unwrap();

        let due = store.list_due_steps(now, 2).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, active_step);

        store
            .transition_campaign(paused_id, CampaignStatus::Paused, CampaignStatus::Sending, now)
            .await
            .unwrap();
        assert_eq!(store.list_due_steps(now, 10).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_writes_for_deleted_campaign_are_refused() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let id = sending_campaign(&store).await;
        let record = StepRecord::pending(StepKey::new(id, "r-1", 0, 1), now, now);
        let step_id = record.id;
        store.insert_step(record).await.unwrap();
        let claimed = match store
            .try_claim_step(step_id, "w-1", now, now + Duration::minutes(2))
            .await
            .unwrap()
        {
            StepClaim::Claimed(record) => record,
            other => panic!("expected claim, got {other:?}"),
        };

        store.delete_campaign(id, now).await.unwrap();

        let message = Message::queued(&claimed, "a@example.com".into(), Default::default(), now);
        assert!(matches!(
            store.put_message(message).await,
            Err(DripError::CampaignNotFound(_))
        ));
        let next = StepRecord::pending(claimed.key.next(), now, now);
        assert!(matches!(
            store.insert_step(next).await,
            Err(DripError::CampaignNotFound(_))
        ));
        assert_eq!(store.step_count(), 0);
        assert_eq!(store.message_count(), 0);
    }
}

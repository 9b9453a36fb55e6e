use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use drip_core::types::{
    Campaign, CampaignStatus, Message, StatsDelta, StepKey, StepRecord, StepResolution,
};
use drip_core::DripResult;

/// Result of inserting a step record under its unique key.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    Inserted(StepRecord),
    /// A record already exists for the key; it is returned unchanged.
    Exists(StepRecord),
}

impl InsertOutcome {
    pub fn record(&self) -> &StepRecord {
        match self {
            InsertOutcome::Inserted(r) | InsertOutcome::Exists(r) => r,
        }
    }

    pub fn into_record(self) -> StepRecord {
        match self {
            InsertOutcome::Inserted(r) | InsertOutcome::Exists(r) => r,
        }
    }

    pub fn was_inserted(&self) -> bool {
        matches!(self, InsertOutcome::Inserted(_))
    }
}

/// Result of a conditional claim on a step record.
#[derive(Debug, Clone, PartialEq)]
pub enum StepClaim {
    Claimed(StepRecord),
    /// Another worker holds a live lease, or the record already resolved.
    Contended,
    NotDue,
    Missing,
}

/// What a campaign delete touched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CascadeReport {
    pub steps_cancelled: usize,
    pub messages_cancelled: usize,
    pub steps_deleted: usize,
    pub messages_deleted: usize,
}

/// Persistence contract for the delivery engine.
///
/// Methods taking `worker_id` are conditional on the caller holding the
/// relevant lease; they report `false`, `StepClaim::Contended` or
/// `DripError::LeaseLost` instead of overwriting someone else's work.
#[async_trait]
pub trait DripStore: Send + Sync {
    // ─── Campaigns ──────────────────────────────────────────────────────

    async fn put_campaign(&self, campaign: Campaign) -> DripResult<()>;

    async fn get_campaign(&self, id: Uuid) -> DripResult<Option<Campaign>>;

    async fn list_campaigns(&self, status: CampaignStatus) -> DripResult<Vec<Campaign>>;

    /// Scheduled campaigns whose `scheduled_at` is at or before `now` and
    /// whose campaign lease is free.
    async fn list_due_campaigns(&self, now: DateTime<Utc>, limit: usize) -> DripResult<Vec<Campaign>>;

    async fn try_claim_campaign(
        &self,
        id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> DripResult<Option<Campaign>>;

    /// Moves a claimed campaign to `status` and drops the lease, if the lease
    /// is still held by `worker_id`.
    async fn finish_campaign_dispatch(
        &self,
        id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
        status: CampaignStatus,
    ) -> DripResult<bool>;

    async fn release_campaign(&self, id: Uuid, worker_id: &str) -> DripResult<bool>;

    /// Compare-and-set on campaign status.
    async fn transition_campaign(
        &self,
        id: Uuid,
        from: CampaignStatus,
        to: CampaignStatus,
        now: DateTime<Utc>,
    ) -> DripResult<bool>;

    async fn record_stats(&self, id: Uuid, delta: StatsDelta) -> DripResult<()>;

    /// Cancels pending/claimed steps and queued messages, then removes the
    /// campaign with all of its records.
    async fn delete_campaign(&self, id: Uuid, now: DateTime<Utc>) -> DripResult<CascadeReport>;

    // ─── Step records ───────────────────────────────────────────────────

    /// Inserts `record` unless a record exists for its key.
    async fn insert_step(&self, record: StepRecord) -> DripResult<InsertOutcome>;

    async fn get_step(&self, id: Uuid) -> DripResult<Option<StepRecord>>;

    async fn find_step(&self, key: &StepKey) -> DripResult<Option<StepRecord>>;

    /// Records that are pending or hold an expired claim, due at `now`,
    /// ordered by `scheduled_at`.
    async fn list_due_steps(&self, now: DateTime<Utc>, limit: usize) -> DripResult<Vec<StepRecord>>;

    async fn try_claim_step(
        &self,
        id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> DripResult<StepClaim>;

    /// Returns a claimed record to pending without resolving it.
    async fn release_step(&self, id: Uuid, worker_id: &str, now: DateTime<Utc>) -> DripResult<bool>;

    /// Writes a terminal outcome. Fails with `DripError::LeaseLost` unless
    /// `worker_id` holds an unexpired claim at `now`.
    async fn resolve_step(
        &self,
        id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
        resolution: &StepResolution,
    ) -> DripResult<StepRecord>;

    async fn steps_for_campaign(&self, campaign_id: Uuid) -> DripResult<Vec<StepRecord>>;

    // ─── Messages ───────────────────────────────────────────────────────

    async fn put_message(&self, message: Message) -> DripResult<()>;

    async fn get_message(&self, id: Uuid) -> DripResult<Option<Message>>;
}

/// Latest record per recipient, ordered by (cycle, step). Used to find where
/// each recipient stands in a campaign.
pub fn latest_per_recipient(records: Vec<StepRecord>) -> Vec<StepRecord> {
    let mut latest: std::collections::HashMap<String, StepRecord> = std::collections::HashMap::new();
    for record in records {
        let position = (record.key.cycle, record.key.step_number);
        match latest.get(&record.key.recipient_id) {
            Some(current) if (current.key.cycle, current.key.step_number) >= position => {}
            _ => {
                latest.insert(record.key.recipient_id.clone(), record);
            }
        }
    }
    let mut out: Vec<StepRecord> = latest.into_values().collect();
    out.sort_by(|a, b| a.key.recipient_id.cmp(&b.key.recipient_id));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latest_per_recipient_picks_highest_cycle_then_step() {
        let now = Utc::now();
        let campaign_id = Uuid::new_v4();
        let records = vec![
            StepRecord::pending(StepKey::new(campaign_id, "a", 0, 1), now, now),
            StepRecord::pending(StepKey::new(campaign_id, "a", 2, 1), now, now),
            StepRecord::pending(StepKey::new(campaign_id, "a", 0, 2), now, now),
            StepRecord::pending(StepKey::new(campaign_id, "b", 1, 1), now, now),
        ];

        let latest = latest_per_recipient(records);
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].key.recipient_id, "a");
        assert_eq!((latest[0].key.cycle, latest[0].key.step_number), (2, 0));
        assert_eq!((latest[1].key.cycle, latest[1].key.step_number), (1, 1));
    }
}

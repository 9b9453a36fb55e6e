use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

// ─── Campaigns ──────────────────────────────────────────────────────────────

/// How a campaign delivers its content.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SendType {
    Immediate,
    Scheduled,
    Sequence,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Scheduled,
    Sending,
    Sent,
    Completed,
    Paused,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Draft => "draft",
            CampaignStatus::Scheduled => "scheduled",
            CampaignStatus::Sending => "sending",
            CampaignStatus::Sent => "sent",
            CampaignStatus::Completed => "completed",
            CampaignStatus::Paused => "paused",
        }
    }

    /// Whether queued steps of a campaign in this status may be delivered.
    pub fn runs_steps(&self) -> bool {
        matches!(self, CampaignStatus::Sending | CampaignStatus::Scheduled)
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "draft" => Some(CampaignStatus::Draft),
            "scheduled" => Some(CampaignStatus::Scheduled),
            "sending" => Some(CampaignStatus::Sending),
            "sent" => Some(CampaignStatus::Sent),
            "completed" => Some(CampaignStatus::Completed),
            "paused" => Some(CampaignStatus::Paused),
            _ => None,
        }
    }
}

/// Direct recipients plus list references, expanded at initial dispatch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecipientSet {
    #[serde(default)]
    pub recipient_ids: Vec<String>,
    #[serde(default)]
    pub list_ids: Vec<String>,
}

/// Envelope settings passed through to the delivery adapter.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SenderConfig {
    pub from_email: String,
    pub from_name: String,
    #[serde(default)]
    pub reply_to: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CampaignStats {
    pub total_sent: u64,
    pub total_failed: u64,
    pub total_skipped: u64,
}

/// Outcome counters applied atomically to a campaign's stats.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsDelta {
    pub sent: u64,
    pub failed: u64,
    pub skipped: u64,
}

impl StatsDelta {
    pub fn sent() -> Self {
        Self { sent: 1, ..Default::default() }
    }

    pub fn failed() -> Self {
        Self { failed: 1, ..Default::default() }
    }

    pub fn skipped() -> Self {
        Self { skipped: 1, ..Default::default() }
    }
}

/// An outreach campaign as seen by the delivery engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: Uuid,
    pub owner_id: String,
    pub name: String,
    pub recipients: RecipientSet,
    pub send_type: SendType,
    /// Content of single-message (immediate/scheduled) campaigns.
    #[serde(default)]
    pub content: Option<ContentRef>,
    #[serde(default)]
    pub sequence: Option<SequenceDefinition>,
    #[serde(default)]
    pub sender: SenderConfig,
    pub status: CampaignStatus,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub claimed_by: Option<String>,
    #[serde(default)]
    pub claim_expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stats: CampaignStats,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Campaign {
    /// The sequence this campaign runs. Single-message campaigns behave as a
    /// one-step sequence that never repeats.
    pub fn effective_sequence(&self) -> Option<SequenceDefinition> {
        match self.send_type {
            SendType::Sequence => self.sequence.clone(),
            SendType::Immediate | SendType::Scheduled => {
                self.content.clone().map(SequenceDefinition::single)
            }
        }
    }

    /// Whether the campaign-level initial dispatch is due at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == CampaignStatus::Scheduled && self.scheduled_at.map_or(true, |t| t <= now)
    }

    /// Whether another worker currently holds the campaign-level lease.
    pub fn is_leased(&self, now: DateTime<Utc>) -> bool {
        self.claim_expires_at.map_or(false, |exp| now < exp)
    }
}

// ─── Sequences ──────────────────────────────────────────────────────────────

/// Where a step's body comes from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ContentRef {
    Template { template_id: String },
    Catalog { item_ids: Vec<String>, message: String },
}

/// Engagement conditions on the previous step's message, combined with AND.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GatingConditions {
    #[serde(default)]
    pub require_open: bool,
    #[serde(default)]
    pub require_click: bool,
    #[serde(default)]
    pub require_no_reply: bool,
}

impl GatingConditions {
    pub fn is_empty(&self) -> bool {
        !self.require_open && !self.require_click && !self.require_no_reply
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepSpec {
    pub content: ContentRef,
    /// Hours after the previous step's schedule (cycle start for step 0).
    #[serde(default)]
    pub delay_hours: u32,
    #[serde(default)]
    pub conditions: GatingConditions,
}

impl StepSpec {
    pub fn delay(&self) -> Duration {
        Duration::hours(i64::from(self.delay_hours))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SequenceDefinition {
    pub steps: Vec<StepSpec>,
    /// Days after a cycle's last step resolves before the next cycle starts.
    /// Zero means the sequence never repeats.
    #[serde(default)]
    pub repeat_days: u32,
    /// Upper bound on the number of cycles; unbounded when absent.
    #[serde(default)]
    pub max_cycles: Option<u32>,
}

impl SequenceDefinition {
    pub fn single(content: ContentRef) -> Self {
        Self {
            steps: vec![StepSpec {
                content,
                delay_hours: 0,
                conditions: GatingConditions::default(),
            }],
            repeat_days: 0,
            max_cycles: Some(1),
        }
    }

    pub fn step(&self, step_number: u32) -> Option<&StepSpec> {
        self.steps.get(step_number as usize)
    }

    pub fn last_step_number(&self) -> Option<u32> {
        self.steps.len().checked_sub(1).map(|n| n as u32)
    }

    pub fn repeats(&self) -> bool {
        self.repeat_days > 0
    }

    pub fn repeat_interval(&self) -> Duration {
        Duration::days(i64::from(self.repeat_days))
    }

    /// Whether a cycle numbered `cycle` may be started.
    pub fn allows_cycle(&self, cycle: u32) -> bool {
        if cycle > 1 && !self.repeats() {
            return false;
        }
        self.max_cycles.map_or(true, |max| cycle <= max)
    }
}

// ─── Step execution records ─────────────────────────────────────────────────

/// Unique identity of one planned send.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepKey {
    pub campaign_id: Uuid,
    pub recipient_id: String,
    pub step_number: u32,
    pub cycle: u32,
}

impl StepKey {
    pub fn new(campaign_id: Uuid, recipient_id: impl Into<String>, step_number: u32, cycle: u32) -> Self {
        Self {
            campaign_id,
            recipient_id: recipient_id.into(),
            step_number,
            cycle,
        }
    }

    /// The key of the step before this one in the same cycle.
    pub fn previous(&self) -> Option<StepKey> {
        self.step_number.checked_sub(1).map(|n| StepKey {
            step_number: n,
            ..self.clone()
        })
    }

    pub fn next(&self) -> StepKey {
        StepKey {
            step_number: self.step_number + 1,
            ..self.clone()
        }
    }
}

impl std::fmt::Display for StepKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.campaign_id, self.recipient_id, self.step_number, self.cycle
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Claimed,
    Sent,
    Failed,
    /// Gated out by its conditions; terminal.
    Skipped,
    Cancelled,
}

impl StepStatus {
    /// Sent, failed and skipped all let the sequence move on.
    pub fn is_resolved(&self) -> bool {
        matches!(self, StepStatus::Sent | StepStatus::Failed | StepStatus::Skipped)
    }

    pub fn is_terminal(&self) -> bool {
        self.is_resolved() || *self == StepStatus::Cancelled
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Claimed => "claimed",
            StepStatus::Sent => "sent",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
            StepStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(StepStatus::Pending),
            "claimed" => Some(StepStatus::Claimed),
            "sent" => Some(StepStatus::Sent),
            "failed" => Some(StepStatus::Failed),
            "skipped" => Some(StepStatus::Skipped),
            "cancelled" => Some(StepStatus::Cancelled),
            _ => None,
        }
    }
}

/// The unit of idempotency: one (campaign, recipient, step, cycle) send.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepRecord {
    pub id: Uuid,
    pub key: StepKey,
    pub status: StepStatus,
    pub scheduled_at: DateTime<Utc>,
    pub claimed_by: Option<String>,
    pub claim_expires_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub message_id: Option<Uuid>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StepRecord {
    pub fn pending(key: StepKey, scheduled_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            key,
            status: StepStatus::Pending,
            scheduled_at,
            claimed_by: None,
            claim_expires_at: None,
            sent_at: None,
            resolved_at: None,
            message_id: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// A record that failed at planning time, e.g. unresolvable content.
    pub fn failed_at_creation(
        key: StepKey,
        scheduled_at: DateTime<Utc>,
        now: DateTime<Utc>,
        error: String,
    ) -> Self {
        Self {
            status: StepStatus::Failed,
            resolved_at: Some(now),
            error: Some(error),
            ..Self::pending(key, scheduled_at, now)
        }
    }

    /// Whether a worker may claim this record at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        if self.scheduled_at > now {
            return false;
        }
        match self.status {
            StepStatus::Pending => true,
            StepStatus::Claimed => self.claim_expires_at.map_or(true, |exp| exp <= now),
            _ => false,
        }
    }

    /// Whether `worker_id` holds an unexpired claim at `now`.
    pub fn is_held_by(&self, worker_id: &str, now: DateTime<Utc>) -> bool {
        self.status == StepStatus::Claimed
            && self.claimed_by.as_deref() == Some(worker_id)
            && self.claim_expires_at.map_or(false, |exp| now < exp)
    }
}

/// Terminal outcome written by the claim holder.
#[derive(Debug, Clone, PartialEq)]
pub enum StepResolution {
    Sent { message_id: Uuid, sent_at: DateTime<Utc> },
    Failed { message_id: Option<Uuid>, error: String },
    Skipped { reason: String },
}

impl StepResolution {
    pub fn status(&self) -> StepStatus {
        match self {
            StepResolution::Sent { .. } => StepStatus::Sent,
            StepResolution::Failed { .. } => StepStatus::Failed,
            StepResolution::Skipped { .. } => StepStatus::Skipped,
        }
    }

    pub fn stats_delta(&self) -> StatsDelta {
        match self {
            StepResolution::Sent { .. } => StatsDelta::sent(),
            StepResolution::Failed { .. } => StatsDelta::failed(),
            StepResolution::Skipped { .. } => StatsDelta::skipped(),
        }
    }

    /// Applies this outcome to a claimed record.
    pub fn apply(&self, record: &mut StepRecord, now: DateTime<Utc>) {
        record.status = self.status();
        record.claimed_by = None;
        record.claim_expires_at = None;
        record.resolved_at = Some(now);
        record.updated_at = now;
        match self {
            StepResolution::Sent { message_id, sent_at } => {
                record.message_id = Some(*message_id);
                record.sent_at = Some(*sent_at);
                record.error = None;
            }
            StepResolution::Failed { message_id, error } => {
                if message_id.is_some() {
                    record.message_id = *message_id;
                }
                record.error = Some(error.clone());
            }
            StepResolution::Skipped { reason } => {
                record.error = Some(reason.clone());
            }
        }
    }
}

// ─── Messages ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Queued,
    Sending,
    Sent,
    Failed,
    Cancelled,
}

/// Rendered body returned by the content resolver.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RenderedContent {
    pub subject: String,
    pub html: String,
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    /// Base64-encoded payload.
    pub content: String,
}

/// One outbound send attempt tied to exactly one step record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: Uuid,
    pub step_record_id: Uuid,
    pub campaign_id: Uuid,
    pub recipient_id: String,
    pub to: String,
    pub content: RenderedContent,
    pub status: MessageStatus,
    pub transport_message_id: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

impl Message {
    pub fn queued(record: &StepRecord, to: String, content: RenderedContent, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            step_record_id: record.id,
            campaign_id: record.key.campaign_id,
            recipient_id: record.key.recipient_id.clone(),
            to,
            content,
            status: MessageStatus::Queued,
            transport_message_id: None,
            error: None,
            created_at: now,
            sent_at: None,
        }
    }
}

/// Everything the delivery adapter needs for one send.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutboundEmail {
    pub message_id: Uuid,
    pub to: String,
    pub subject: String,
    pub html: String,
    pub text: String,
    pub attachments: Vec<Attachment>,
    pub sender: SenderConfig,
}

impl OutboundEmail {
    pub fn from_message(message: &Message, sender: &SenderConfig) -> Self {
        Self {
            message_id: message.id,
            to: message.to.clone(),
            subject: message.content.subject.clone(),
            html: message.content.html.clone(),
            text: message.content.text.clone(),
            attachments: message.content.attachments.clone(),
            sender: sender.clone(),
        }
    }
}

// ─── Engagement ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EngagementKind {
    Sent,
    Opened,
    Clicked,
    Replied,
    Bounced,
}

impl EngagementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngagementKind::Sent => "sent",
            EngagementKind::Opened => "opened",
            EngagementKind::Clicked => "clicked",
            EngagementKind::Replied => "replied",
            EngagementKind::Bounced => "bounced",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngagementEvent {
    pub id: Uuid,
    pub message_id: Uuid,
    pub kind: EngagementKind,
    pub occurred_at: DateTime<Utc>,
}

impl EngagementEvent {
    pub fn new(message_id: Uuid, kind: EngagementKind, occurred_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            message_id,
            kind,
            occurred_at,
        }
    }
}

// ─── Recipients ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Recipient {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub profile: HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(delay_hours: u32) -> StepSpec {
        StepSpec {
            content: ContentRef::Template {
                template_id: "welcome".into(),
            },
            delay_hours,
            conditions: GatingConditions::default(),
        }
    }

    #[test]
    fn test_claimable_respects_schedule_and_lease() {
        let now = Utc::now();
        let key = StepKey::new(Uuid::new_v4(), "r-1", 0, 1);
        let mut record = StepRecord::pending(key, now + Duration::minutes(5), now);
        assert!(!record.is_claimable(now));
        assert!(record.is_claimable(now + Duration::minutes(5)));

        record.status = StepStatus::Claimed;
        record.claimed_by = Some("w-1".into());
        record.claim_expires_at = Some(now + Duration::minutes(7));
        assert!(!record.is_claimable(now + Duration::minutes(6)));
        assert!(record.is_claimable(now + Duration::minutes(7)));
        assert!(record.is_held_by("w-1", now + Duration::minutes(6)));
        assert!(!record.is_held_by("w-1", now + Duration::minutes(7)));
        assert!(!record.is_held_by("w-2", now + Duration::minutes(6)));
    }

    #[test]
    fn test_single_message_campaign_is_one_step_sequence() {
        let seq = SequenceDefinition::single(ContentRef::Template {
            template_id: "promo".into(),
        });
        assert_eq!(seq.last_step_number(), Some(0));
        assert!(seq.allows_cycle(1));
        assert!(!seq.allows_cycle(2));
    }

    #[test]
    fn test_allows_cycle_with_cap() {
        let seq = SequenceDefinition {
            steps: vec![step(0), step(24)],
            repeat_days: 7,
            max_cycles: Some(3),
        };
        assert!(seq.allows_cycle(3));
        assert!(!seq.allows_cycle(4));

        let unbounded = SequenceDefinition {
            max_cycles: None,
            ..seq
        };
        assert!(unbounded.allows_cycle(40));
    }

    #[test]
    fn test_resolution_apply_clears_claim() {
        let now = Utc::now();
        let key = StepKey::new(Uuid::new_v4(), "r-1", 1, 1);
        let mut record = StepRecord::pending(key, now, now);
        record.status = StepStatus::Claimed;
        record.claimed_by = Some("w-1".into());
        record.claim_expires_at = Some(now + Duration::minutes(2));

        StepResolution::Skipped {
            reason: "no open".into(),
        }
        .apply(&mut record, now);

        assert_eq!(record.status, StepStatus::Skipped);
        assert!(record.claimed_by.is_none());
        assert_eq!(record.resolved_at, Some(now));
        assert!(record.status.is_resolved());
    }

    #[test]
    fn test_status_string_round_trip() {
        for status in [
            StepStatus::Pending,
            StepStatus::Claimed,
            StepStatus::Sent,
            StepStatus::Failed,
            StepStatus::Skipped,
            StepStatus::Cancelled,
        ] {
            assert_eq!(StepStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(CampaignStatus::parse("sending"), Some(CampaignStatus::Sending));
    }
}

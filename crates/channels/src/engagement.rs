//! Engagement tracking: per-message delivery, open, click and reply events.
//!
//! Events arrive from the send path (`record_sent`), from SendGrid event
//! webhooks (`ingest_webhook`) and from reply detection (`ingest_reply`).
//! Both ingestion functions work against any `EngagementTracker`, so the
//! webhook endpoint writes to whichever backend the workers read from.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use drip_core::collaborators::EngagementTracker;
use drip_core::types::{EngagementEvent, EngagementKind};
use drip_core::{DripError, DripResult};

/// SendGrid event webhook types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EmailEventType {
    Processed,
    Dropped,
    Delivered,
    Deferred,
    Bounce,
    Open,
    Click,
    #[serde(rename = "spamreport")]
    SpamReport,
    Unsubscribe,
    GroupUnsubscribe,
    GroupResubscribe,
}

impl EmailEventType {
    /// The engagement kind this webhook event counts as, if any.
    pub fn engagement_kind(&self) -> Option<EngagementKind> {
        match self {
            EmailEventType::Open => Some(EngagementKind::Opened),
            EmailEventType::Click => Some(EngagementKind::Clicked),
            EmailEventType::Bounce | EmailEventType::Dropped => Some(EngagementKind::Bounced),
            _ => None,
        }
    }
}

/// One entry of a SendGrid event webhook batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailWebhookEvent {
    pub email: String,
    pub event: EmailEventType,
    #[serde(default)]
    pub sg_message_id: Option<String>,
    /// Custom argument set on every outbound message.
    #[serde(default)]
    pub drip_message_id: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub timestamp: DateTime<Utc>,
}

/// A reply detected by the inbound mail pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundReply {
    pub message_id: Uuid,
    #[serde(default = "Utc::now")]
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngestReport {
    pub received: usize,
    pub recorded: usize,
    pub ignored: usize,
}

/// Applies a SendGrid webhook batch to `tracker`. Events without an
/// engagement signal, or that cannot be correlated to a message, are
/// counted as ignored. Tracker errors abort the batch so the caller can ask
/// SendGrid to redeliver it.
pub async fn ingest_webhook(
    tracker: &dyn EngagementTracker,
    events: &[EmailWebhookEvent],
) -> DripResult<IngestReport> {
    let mut report = IngestReport {
        received: events.len(),
        ..Default::default()
    };
    for event in events {
        metrics::counter!("sendgrid.webhook_events", "type" => format!("{:?}", event.event)).increment(1);

        let Some(kind) = event.event.engagement_kind() else {
            report.ignored += 1;
            continue;
        };
        let Some(message_id) = correlate(tracker, event).await? else {
            warn!(event = ?event.event, email = %event.email, "Webhook event has no known message id, skipping");
            report.ignored += 1;
            continue;
        };
        debug!(message_id = %message_id, kind = ?kind, email = %event.email, "Webhook engagement recorded");
        tracker
            .record(EngagementEvent::new(message_id, kind, event.timestamp))
            .await?;
        report.recorded += 1;
    }
    Ok(report)
}

pub async fn ingest_reply(tracker: &dyn EngagementTracker, reply: &InboundReply) -> DripResult<()> {
    metrics::counter!("drip.engagement.replies").increment(1);
    tracker
        .record(EngagementEvent::new(reply.message_id, EngagementKind::Replied, reply.received_at))
        .await
}

async fn correlate(tracker: &dyn EngagementTracker, event: &EmailWebhookEvent) -> DripResult<Option<Uuid>> {
    if let Some(id) = event
        .drip_message_id
        .as_deref()
        .and_then(|id| Uuid::parse_str(id).ok())
    {
        return Ok(Some(id));
    }
    let Some(sg_message_id) = event.sg_message_id.as_deref() else {
        return Ok(None);
    };
    if let Some(id) = tracker.message_for_transport_id(sg_message_id).await? {
        return Ok(Some(id));
    }
    // SendGrid appends a filter suffix to X-Message-Id in webhook payloads.
    match sg_message_id.split('.').next() {
        Some(base) if base != sg_message_id => tracker.message_for_transport_id(base).await,
        _ => Ok(None),
    }
}

/// Per-message engagement counts.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngagementSummary {
    pub sent: u64,
    pub opens: u64,
    pub clicks: u64,
    pub replies: u64,
    pub bounces: u64,
}

/// In-memory engagement tracker.
#[derive(Clone)]
pub struct EngagementLog {
    events: Arc<DashMap<Uuid, Vec<EngagementEvent>>>,
    /// Transport message id (SendGrid `X-Message-Id`) to our message id.
    transport_index: Arc<DashMap<String, Uuid>>,
    available: Arc<AtomicBool>,
}

impl Default for EngagementLog {
    fn default() -> Self {
        Self {
            events: Arc::new(DashMap::new()),
            transport_index: Arc::new(DashMap::new()),
            available: Arc::new(AtomicBool::new(true)),
        }
    }
}

impl EngagementLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the log unreachable; queries fail until it is restored.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn summary(&self, message_id: Uuid) -> EngagementSummary {
        let mut summary = EngagementSummary::default();
        if let Some(events) = self.events.get(&message_id) {
            for event in events.iter() {
                match event.kind {
                    EngagementKind::Sent => summary.sent += 1,
                    EngagementKind::Opened => summary.opens += 1,
                    EngagementKind::Clicked => summary.clicks += 1,
                    EngagementKind::Replied => summary.replies += 1,
                    EngagementKind::Bounced => summary.bounces += 1,
                }
            }
        }
        summary
    }

    fn push(&self, event: EngagementEvent) {
        self.events.entry(event.message_id).or_default().push(event);
    }

    fn check_available(&self) -> DripResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DripError::Engagement("engagement log unavailable".to_string()))
        }
    }
}

#[async_trait]
impl EngagementTracker for EngagementLog {
    async fn record_sent(&self, message_id: Uuid) -> DripResult<()> {
        self.check_available()?;
        self.push(EngagementEvent::new(message_id, EngagementKind::Sent, Utc::now()));
        Ok(())
    }

    async fn record(&self, event: EngagementEvent) -> DripResult<()> {
        self.check_available()?;
        self.push(event);
        Ok(())
    }

    async fn has_event(&self, message_id: Uuid, kind: EngagementKind) -> DripResult<bool> {
        self.check_available()?;
        Ok(self
            .events
            .get(&message_id)
            .map_or(false, |events| events.iter().any(|e| e.kind == kind)))
    }

    async fn link_transport_id(&self, transport_id: &str, message_id: Uuid) -> DripResult<()> {
        self.check_available()?;
        self.transport_index.insert(transport_id.to_string(), message_id);
        Ok(())
    }

    async fn message_for_transport_id(&self, transport_id: &str) -> DripResult<Option<Uuid>> {
        self.check_available()?;
        Ok(self.transport_index.get(transport_id).map(|id| *id))
    }
}

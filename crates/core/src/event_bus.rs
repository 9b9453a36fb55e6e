//! Delivery event bus — trait for emitting lifecycle events from the engine.
//!
//! Components accept an `Arc<dyn EventSink>` so the binary can route events to
//! logs or a downstream pipeline, and tests can capture them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use uuid::Uuid;

use crate::types::StepKey;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DripEventType {
    CampaignDispatched,
    CampaignCompleted,
    CampaignCancelled,
    CycleStarted,
    StepPlanned,
    StepSent,
    StepSkipped,
    StepFailed,
    StepDeferred,
}

/// A lifecycle event emitted by the delivery engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DripEvent {
    pub event_id: Uuid,
    pub event_type: DripEventType,
    pub campaign_id: Uuid,
    pub recipient_id: Option<String>,
    pub step_number: Option<u32>,
    pub cycle: Option<u32>,
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Trait for emitting engine events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: DripEvent);
}

/// No-op sink for callers that don't need event emission.
pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn emit(&self, _event: DripEvent) {}
}

/// Sink that forwards every event to `tracing` at debug level.
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: DripEvent) {
        tracing::debug!(
            event_type = ?event.event_type,
            campaign_id = %event.campaign_id,
            recipient_id = ?event.recipient_id,
            step = ?event.step_number,
            cycle = ?event.cycle,
            detail = ?event.detail,
            "Drip event"
        );
    }
}

/// In-memory sink that captures events for testing.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<DripEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<DripEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn count_type(&self, event_type: DripEventType) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

impl EventSink for CaptureSink {
    fn emit(&self, event: DripEvent) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).push(event);
    }
}

/// Builds a campaign-scoped event.
pub fn campaign_event(event_type: DripEventType, campaign_id: Uuid) -> DripEvent {
    DripEvent {
        event_id: Uuid::new_v4(),
        event_type,
        campaign_id,
        recipient_id: None,
        step_number: None,
        cycle: None,
        detail: None,
        timestamp: Utc::now(),
    }
}

/// Builds a step-scoped event.
pub fn step_event(event_type: DripEventType, key: &StepKey, detail: Option<String>) -> DripEvent {
    DripEvent {
        recipient_id: Some(key.recipient_id.clone()),
        step_number: Some(key.step_number),
        cycle: Some(key.cycle),
        detail,
        ..campaign_event(event_type, key.campaign_id)
    }
}

pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpSink)
}

pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::new())
}

//! Sequence planner: turns a sequence definition into step records.
//!
//! `plan` computes a cycle's schedule without touching the store; every
//! record the planner writes takes its time from such a plan. The planner
//! materializes records one step at a time: a step is inserted
//! only once the step before it resolved, so a recipient never has two live
//! steps in the same cycle. Inserts go through the store's unique key, which
//! makes every call here safe to repeat.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use drip_core::collaborators::ContentResolver;
use drip_core::event_bus::{noop_sink, step_event, DripEventType, EventSink};
use drip_core::types::{
    Campaign, ContentRef, SequenceDefinition, StatsDelta, StepKey, StepRecord, StepStatus,
};
use drip_core::{DripError, DripResult};
use drip_store::DripStore;

/// One step's absolute schedule within a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedStep {
    pub step_number: u32,
    pub scheduled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CyclePlan {
    pub cycle: u32,
    pub steps: Vec<PlannedStep>,
}

impl CyclePlan {
    pub fn scheduled_at(&self, step_number: u32) -> Option<DateTime<Utc>> {
        self.steps
            .iter()
            .find(|s| s.step_number == step_number)
            .map(|s| s.scheduled_at)
    }
}

/// Computes the schedule of `cycle` starting at `cycle_start`. Step 0 runs
/// `delay[0]` after the start, every later step `delay[i]` after the one
/// before it.
pub fn plan(definition: &SequenceDefinition, cycle: u32, cycle_start: DateTime<Utc>) -> CyclePlan {
    plan_from(definition, cycle, 0, cycle_start)
}

/// Computes the schedule of the steps after `step_number`, given the time
/// that step was scheduled for.
pub fn plan_after(
    definition: &SequenceDefinition,
    cycle: u32,
    step_number: u32,
    scheduled_at: DateTime<Utc>,
) -> CyclePlan {
    plan_from(definition, cycle, step_number + 1, scheduled_at)
}

fn plan_from(definition: &SequenceDefinition, cycle: u32, first: u32, anchor: DateTime<Utc>) -> CyclePlan {
    let mut at = anchor;
    let steps = definition
        .steps
        .iter()
        .enumerate()
        .skip(first as usize)
        .map(|(i, spec)| {
            at = at + spec.delay();
            PlannedStep {
                step_number: i as u32,
                scheduled_at: at,
            }
        })
        .collect();
    CyclePlan { cycle, steps }
}

/// Materializes step records for campaigns.
#[derive(Clone)]
pub struct SequencePlanner {
    store: Arc<dyn DripStore>,
    content: Arc<dyn ContentResolver>,
    event_sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for SequencePlanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequencePlanner").finish_non_exhaustive()
    }
}

impl SequencePlanner {
    pub fn new(store: Arc<dyn DripStore>, content: Arc<dyn ContentResolver>) -> Self {
        Self {
            store,
            content,
            event_sink: noop_sink(),
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Materializes the first live step of `cycle` for one recipient and
    /// returns it. Steps whose content cannot be found are recorded as
    /// failed and skipped over. Returns `None` when the cycle is not allowed
    /// or no step of it can run.
    pub async fn start_cycle(
        &self,
        campaign: &Campaign,
        recipient_id: &str,
        cycle: u32,
        cycle_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DripResult<Option<StepRecord>> {
        let definition = definition_of(campaign)?;
        if !definition.allows_cycle(cycle) {
            debug!(campaign_id = %campaign.id, cycle, "Cycle not allowed by sequence");
            return Ok(None);
        }
        let schedule = plan(&definition, cycle, cycle_start);
        let key = StepKey::new(campaign.id, recipient_id, 0, cycle);
        self.materialize(&definition, schedule, key, now).await
    }

    /// Materializes the step after `resolved`, scheduled its `delay` after
    /// the resolved step's schedule. Does nothing while `resolved` is still
    /// pending or claimed.
    pub async fn advance(
        &self,
        campaign: &Campaign,
        resolved: &StepRecord,
        now: DateTime<Utc>,
    ) -> DripResult<Option<StepRecord>> {
        if !resolved.status.is_resolved() {
            return Ok(None);
        }
        let definition = definition_of(campaign)?;
        let schedule = plan_after(
            &definition,
            resolved.key.cycle,
            resolved.key.step_number,
            resolved.scheduled_at,
        );
        self.materialize(&definition, schedule, resolved.key.next(), now)
            .await
    }

    async fn materialize(
        &self,
        definition: &SequenceDefinition,
        mut schedule: CyclePlan,
        mut key: StepKey,
        now: DateTime<Utc>,
    ) -> DripResult<Option<StepRecord>> {
        loop {
            let (Some(spec), Some(scheduled_at)) = (
                definition.step(key.step_number),
                schedule.scheduled_at(key.step_number),
            ) else {
                return Ok(None);
            };

            let record = match self.store.find_step(&key).await? {
                Some(existing) => {
                    debug!(key = %existing.key, status = existing.status.as_str(), "Step already planned");
                    existing
                }
                None => {
                    let candidate = match self.content_error(&spec.content).await? {
                        None => StepRecord::pending(key.clone(), scheduled_at, now),
                        Some(error) => StepRecord::failed_at_creation(key.clone(), scheduled_at, now, error),
                    };
                    let outcome = self.store.insert_step(candidate).await?;
                    if outcome.was_inserted() {
                        self.on_inserted(outcome.record()).await?;
                    }
                    outcome.into_record()
                }
            };

            if record.status != StepStatus::Failed {
                return Ok(Some(record));
            }

            // Later steps follow the failed record's actual schedule.
            schedule = plan_after(definition, key.cycle, key.step_number, record.scheduled_at);
            key = key.next();
        }
    }

    async fn content_error(&self, content: &ContentRef) -> DripResult<Option<String>> {
        match self.content.exists(content).await {
            Ok(true) => Ok(None),
            Ok(false) => Ok(Some(DripError::ContentNotFound(describe(content)).to_string())),
            Err(e) if e.is_content_error() => Ok(Some(e.to_string())),
            Err(e) => Err(e),
        }
    }

    async fn on_inserted(&self, record: &StepRecord) -> DripResult<()> {
        if record.key.step_number == 0 {
            info!(
                campaign_id = %record.key.campaign_id,
                recipient_id = %record.key.recipient_id,
                cycle = record.key.cycle,
                scheduled_at = %record.scheduled_at,
                "Cycle started"
            );
            self.event_sink
                .emit(step_event(DripEventType::CycleStarted, &record.key, None));
        }

        if record.status == StepStatus::Failed {
            warn!(key = %record.key, error = ?record.error, "Step content unavailable, marked failed");
            metrics::counter!("drip.steps.failed", "reason" => "content").increment(1);
            self.store
                .record_stats(record.key.campaign_id, StatsDelta::failed())
                .await?;
            self.event_sink
                .emit(step_event(DripEventType::StepFailed, &record.key, record.error.clone()));
        } else {
            debug!(key = %record.key, scheduled_at = %record.scheduled_at, "Step planned");
            metrics::counter!("drip.steps.planned").increment(1);
            self.event_sink
                .emit(step_event(DripEventType::StepPlanned, &record.key, None));
        }
        Ok(())
    }
}

fn definition_of(campaign: &Campaign) -> DripResult<SequenceDefinition> {
    campaign.effective_sequence().ok_or_else(|| {
        DripError::InvalidContent(format!("campaign {} has no content to send", campaign.id))
    })
}

fn describe(content: &ContentRef) -> String {
    match content {
        ContentRef::Template { template_id } => format!("template {template_id}"),
        ContentRef::Catalog { item_ids, .. } => format!("catalog items {}", item_ids.join(",")),
    }
}

//! Repeat-cycle sweep.
//!
//! Looks at where each recipient of a sending campaign stands and moves it
//! along: plans a missing next step, starts the next cycle once the repeat
//! window has passed, or marks the recipient finished. A campaign whose
//! recipients are all finished is closed out.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use drip_core::event_bus::{campaign_event, noop_sink, DripEventType, EventSink};
use drip_core::types::{Campaign, CampaignStatus, SendType, StepRecord, StepStatus};
use drip_core::DripResult;
use drip_store::{latest_per_recipient, DripStore};

use crate::planner::SequencePlanner;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub campaigns: usize,
    pub steps_repaired: usize,
    pub cycles_started: usize,
    pub campaigns_completed: usize,
}

impl SweepReport {
    fn merge(&mut self, other: SweepReport) {
        self.campaigns += other.campaigns;
        self.steps_repaired += other.steps_repaired;
        self.cycles_started += other.cycles_started;
        self.campaigns_completed += other.campaigns_completed;
    }
}

/// Where one recipient stands after the sweep looked at it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecipientState {
    Active,
    Repaired,
    CycleStarted,
    Finished,
}

#[derive(Clone)]
pub struct RepeatCycleManager {
    store: Arc<dyn DripStore>,
    planner: SequencePlanner,
    event_sink: Arc<dyn EventSink>,
}

impl RepeatCycleManager {
    pub fn new(store: Arc<dyn DripStore>, planner: SequencePlanner) -> Self {
        Self {
            store,
            planner,
            event_sink: noop_sink(),
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Sweeps every sending campaign. A failing campaign is logged and does
    /// not stop the others.
    pub async fn sweep(&self, now: DateTime<Utc>) -> DripResult<SweepReport> {
        let mut report = SweepReport::default();
        for campaign in self.store.list_campaigns(CampaignStatus::Sending).await? {
            match self.sweep_campaign(&campaign, now).await {
                Ok(campaign_report) => report.merge(campaign_report),
                Err(e) => warn!(campaign_id = %campaign.id, error = %e, "Repeat sweep failed for campaign"),
            }
        }
        debug!(
            campaigns = report.campaigns,
            cycles_started = report.cycles_started,
            completed = report.campaigns_completed,
            "Repeat sweep finished"
        );
        Ok(report)
    }

    pub async fn sweep_campaign(&self, campaign: &Campaign, now: DateTime<Utc>) -> DripResult<SweepReport> {
        let mut report = SweepReport {
            campaigns: 1,
            ..Default::default()
        };
        let records = self.store.steps_for_campaign(campaign.id).await?;
        let mut all_finished = true;

        for latest in latest_per_recipient(records) {
            match self.advance_recipient(campaign, &latest, now).await? {
                RecipientState::Finished => {}
                RecipientState::Active => all_finished = false,
                RecipientState::Repaired => {
                    report.steps_repaired += 1;
                    all_finished = false;
                }
                RecipientState::CycleStarted => {
                    report.cycles_started += 1;
                    all_finished = false;
                }
            }
        }

        if all_finished {
            let terminal = match campaign.send_type {
                SendType::Sequence => CampaignStatus::Completed,
                SendType::Immediate | SendType::Scheduled => CampaignStatus::Sent,
            };
            if self
                .store
                .transition_campaign(campaign.id, CampaignStatus::Sending, terminal, now)
                .await?
            {
                info!(campaign_id = %campaign.id, status = terminal.as_str(), "Campaign finished");
                metrics::counter!("drip.campaigns.completed").increment(1);
                self.event_sink
                    .emit(campaign_event(DripEventType::CampaignCompleted, campaign.id));
                report.campaigns_completed += 1;
            }
        }
        Ok(report)
    }

    async fn advance_recipient(
        &self,
        campaign: &Campaign,
        latest: &StepRecord,
        now: DateTime<Utc>,
    ) -> DripResult<RecipientState> {
        if latest.status == StepStatus::Cancelled {
            return Ok(RecipientState::Finished);
        }
        if !latest.status.is_resolved() {
            return Ok(RecipientState::Active);
        }
        let Some(definition) = campaign.effective_sequence() else {
            return Ok(RecipientState::Finished);
        };
        let Some(last_step) = definition.last_step_number() else {
            return Ok(RecipientState::Finished);
        };

        if latest.key.step_number < last_step {
            // The worker that resolved this step died before planning the next one.
            return Ok(match self.planner.advance(campaign, latest, now).await? {
                Some(_) => RecipientState::Repaired,
                None => RecipientState::Active,
            });
        }

        let next_cycle = latest.key.cycle + 1;
        if !definition.allows_cycle(next_cycle) {
            return Ok(RecipientState::Finished);
        }
        let resolved_at = latest.resolved_at.unwrap_or(latest.updated_at);
        let cycle_start = resolved_at + definition.repeat_interval();
        if now < cycle_start {
            return Ok(RecipientState::Active);
        }

        debug!(
            campaign_id = %campaign.id,
            recipient_id = %latest.key.recipient_id,
            cycle = next_cycle,
            cycle_start = %cycle_start,
            "Starting next cycle"
        );
        match self
            .planner
            .start_cycle(campaign, &latest.key.recipient_id, next_cycle, cycle_start, now)
            .await?
        {
            Some(_) => Ok(RecipientState::CycleStarted),
            // Every step of the new cycle failed at creation; the next sweep
            // sees its last step and moves on.
            None => Ok(RecipientState::Active),
        }
    }
}

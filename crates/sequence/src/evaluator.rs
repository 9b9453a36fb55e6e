use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

use drip_core::collaborators::EngagementTracker;
use drip_core::types::{EngagementKind, GatingConditions};
use drip_core::DripResult;

/// What to do with a claimed step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Send,
    /// A condition is not met; the step resolves as skipped.
    Skip { reason: String },
    /// Engagement could not be checked; release the claim and retry later.
    Defer { reason: String },
}

/// Checks a step's gating conditions against the engagement recorded for
/// the previous step's message.
#[derive(Clone)]
pub struct ConditionEvaluator {
    tracker: Arc<dyn EngagementTracker>,
    timeout: Duration,
}

impl ConditionEvaluator {
    pub fn new(tracker: Arc<dyn EngagementTracker>, timeout: Duration) -> Self {
        Self { tracker, timeout }
    }

    /// `previous_message` is the message sent for the preceding step, or
    /// `None` when that step never produced one (skipped, failed before
    /// sending). Step 0 has no predecessor and is never gated.
    pub async fn evaluate(
        &self,
        conditions: &GatingConditions,
        previous_message: Option<Uuid>,
    ) -> GateDecision {
        if conditions.is_empty() {
            return GateDecision::Send;
        }

        let Some(message_id) = previous_message else {
            if conditions.require_open || conditions.require_click {
                return GateDecision::Skip {
                    reason: "previous step sent no message".to_string(),
                };
            }
            return GateDecision::Send;
        };

        let checks = [
            (conditions.require_open, EngagementKind::Opened, true),
            (conditions.require_click, EngagementKind::Clicked, true),
            (conditions.require_no_reply, EngagementKind::Replied, false),
        ];
        for (enabled, kind, wanted) in checks {
            if !enabled {
                continue;
            }
            match self.query(message_id, kind).await {
                Ok(found) if found == wanted => {}
                Ok(_) => {
                    let reason = if wanted {
                        format!("previous message not {}", kind.as_str())
                    } else {
                        "recipient already replied".to_string()
                    };
                    debug!(message_id = %message_id, reason = %reason, "Gate not met");
                    return GateDecision::Skip { reason };
                }
                Err(e) => {
                    warn!(message_id = %message_id, error = %e, "Engagement lookup failed, deferring");
                    return GateDecision::Defer {
                        reason: e.to_string(),
                    };
                }
            }
        }
        GateDecision::Send
    }

    async fn query(&self, message_id: Uuid, kind: EngagementKind) -> DripResult<bool> {
        match tokio::time::timeout(self.timeout, self.tracker.has_event(message_id, kind)).await {
            Ok(result) => result,
            Err(_) => Err(drip_core::DripError::Timeout(format!(
                "engagement lookup exceeded {}ms",
                self.timeout.as_millis()
            ))),
        }
    }
}

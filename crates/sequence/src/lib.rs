//! Delayed, condition-gated sequence delivery: planning, lease-based claiming,
//! engagement gating, periodic pollers and repeat cycles.

pub mod dispatcher;
pub mod evaluator;
pub mod lease;
pub mod planner;
pub mod repeat;
pub mod scheduler;

pub use dispatcher::{BatchReport, Collaborators, DispatchReport, Dispatcher, StepOutcome};
pub use evaluator::{ConditionEvaluator, GateDecision};
pub use lease::LeaseManager;
pub use planner::{plan, plan_after, CyclePlan, PlannedStep, SequencePlanner};
pub use repeat::{RepeatCycleManager, SweepReport};
pub use scheduler::{Scheduler, TickReport};

#[cfg(test)]
mod test_support;

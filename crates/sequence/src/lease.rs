//! Claim/lease layer over the store's conditional updates.
//!
//! Every store call is bounded by the configured store timeout, which is
//! kept below the lease durations.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use drip_core::config::WorkerConfig;
use drip_core::types::{Campaign, CampaignStatus, StepRecord, StepResolution};
use drip_core::{DripError, DripResult};
use drip_store::{DripStore, StepClaim};

/// Grants exclusive, time-limited processing rights to one worker.
#[derive(Clone)]
pub struct LeaseManager {
    store: Arc<dyn DripStore>,
    worker_id: String,
    step_lease: chrono::Duration,
    campaign_lease: chrono::Duration,
    store_timeout: Duration,
}

impl std::fmt::Debug for LeaseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseManager")
            .field("worker_id", &self.worker_id)
            .field("step_lease", &self.step_lease)
            .field("campaign_lease", &self.campaign_lease)
            .finish()
    }
}

impl LeaseManager {
    pub fn new(store: Arc<dyn DripStore>, worker_id: impl Into<String>, config: &WorkerConfig) -> Self {
        Self {
            store,
            worker_id: worker_id.into(),
            step_lease: chrono::Duration::seconds(config.step_lease_secs as i64),
            campaign_lease: chrono::Duration::seconds(config.campaign_lease_secs as i64),
            store_timeout: config.store_timeout(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn step_lease(&self) -> chrono::Duration {
        self.step_lease
    }

    pub async fn claim_step(&self, id: Uuid, now: DateTime<Utc>) -> DripResult<StepClaim> {
        let lease_until = now + self.step_lease;
        let claim = self
            .bounded("claim_step", self.store.try_claim_step(id, &self.worker_id, now, lease_until))
            .await?;
        match &claim {
            StepClaim::Claimed(_) => {
                debug!(step_id = %id, worker_id = %self.worker_id, lease_until = %lease_until, "Step claimed");
            }
            StepClaim::Contended => {
                metrics::counter!("drip.claims.contended", "kind" => "step").increment(1);
            }
            StepClaim::NotDue | StepClaim::Missing => {}
        }
        Ok(claim)
    }

    pub async fn release_step(&self, id: Uuid, now: DateTime<Utc>) -> DripResult<bool> {
        self.bounded("release_step", self.store.release_step(id, &self.worker_id, now))
            .await
    }

    /// Writes `resolution` if this worker still holds the step's lease.
    pub async fn resolve_step(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        resolution: &StepResolution,
    ) -> DripResult<StepRecord> {
        let result = self
            .bounded(
                "resolve_step",
                self.store.resolve_step(id, &self.worker_id, now, resolution),
            )
            .await;
        if let Err(DripError::LeaseLost(_)) = &result {
            warn!(step_id = %id, worker_id = %self.worker_id, "Lease lost before resolution");
            metrics::counter!("drip.leases.lost", "kind" => "step").increment(1);
        }
        result
    }

    pub async fn claim_campaign(&self, id: Uuid, now: DateTime<Utc>) -> DripResult<Option<Campaign>> {
        let lease_until = now + self.campaign_lease;
        let claimed = self
            .bounded(
                "claim_campaign",
                self.store.try_claim_campaign(id, &self.worker_id, now, lease_until),
            )
            .await?;
        if claimed.is_none() {
            metrics::counter!("drip.claims.contended", "kind" => "campaign").increment(1);
        }
        Ok(claimed)
    }

    /// Moves a claimed campaign to `status` and drops the lease. Returns
    /// `false` when the lease was lost in the meantime.
    pub async fn finish_campaign(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        status: CampaignStatus,
    ) -> DripResult<bool> {
        let finished = self
            .bounded(
                "finish_campaign",
                self.store.finish_campaign_dispatch(id, &self.worker_id, now, status),
            )
            .await?;
        if !finished {
            warn!(campaign_id = %id, worker_id = %self.worker_id, "Campaign lease lost before dispatch finished");
            metrics::counter!("drip.leases.lost", "kind" => "campaign").increment(1);
        }
        Ok(finished)
    }

    pub async fn release_campaign(&self, id: Uuid) -> DripResult<bool> {
        self.bounded("release_campaign", self.store.release_campaign(id, &self.worker_id))
            .await
    }

    async fn bounded<T>(&self, op: &str, fut: impl Future<Output = DripResult<T>>) -> DripResult<T> {
        match tokio::time::timeout(self.store_timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                metrics::counter!("drip.store.timeouts", "op" => op.to_string()).increment(1);
                Err(DripError::Timeout(format!(
                    "{op} exceeded {}ms",
                    self.store_timeout.as_millis()
                )))
            }
        }
    }
}

//! Redis-backed engagement tracker, shared by every worker and by the
//! webhook endpoint.
//!
//! Key layout (`p` = configured prefix):
//! - `p:engagement:{message_id}` hash of engagement kind to first-seen ms
//! - `p:transport:{transport_id}` string holding our message id
//!
//! Both expire after `ENGAGEMENT_TTL_SECS`; gating only ever looks at the
//! message sent by the step before, so older entries are never read.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::debug;
use uuid::Uuid;

use drip_core::collaborators::EngagementTracker;
use drip_core::types::{EngagementEvent, EngagementKind};
use drip_core::{DripError, DripResult};

use crate::redis_store::store_err;

const ENGAGEMENT_TTL_SECS: i64 = 90 * 24 * 3600;

#[derive(Clone)]
pub struct RedisEngagementTracker {
    conn: ConnectionManager,
    prefix: String,
}

impl std::fmt::Debug for RedisEngagementTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisEngagementTracker")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl RedisEngagementTracker {
    pub fn new(conn: ConnectionManager, prefix: &str) -> Self {
        Self {
            conn,
            prefix: prefix.to_string(),
        }
    }

    fn engagement_key(&self, message_id: Uuid) -> String {
        format!("{}:engagement:{message_id}", self.prefix)
    }

    fn transport_key(&self, transport_id: &str) -> String {
        format!("{}:transport:{transport_id}", self.prefix)
    }
}

#[async_trait]
impl EngagementTracker for RedisEngagementTracker {
    async fn record_sent(&self, message_id: Uuid) -> DripResult<()> {
        self.record(EngagementEvent::new(message_id, EngagementKind::Sent, chrono::Utc::now()))
            .await
    }

    async fn record(&self, event: EngagementEvent) -> DripResult<()> {
        let mut conn = self.conn.clone();
        let key = self.engagement_key(event.message_id);
        redis::pipe()
            .atomic()
            .hset_nx(&key, event.kind.as_str(), event.occurred_at.timestamp_millis())
            .ignore()
            .expire(&key, ENGAGEMENT_TTL_SECS)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(store_err)?;
        debug!(message_id = %event.message_id, kind = event.kind.as_str(), "Engagement recorded");
        Ok(())
    }

    async fn has_event(&self, message_id: Uuid, kind: EngagementKind) -> DripResult<bool> {
        let mut conn = self.conn.clone();
        conn.hexists(self.engagement_key(message_id), kind.as_str())
            .await
            .map_err(store_err)
    }

    async fn link_transport_id(&self, transport_id: &str, message_id: Uuid) -> DripResult<()> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(
            self.transport_key(transport_id),
            message_id.to_string(),
            ENGAGEMENT_TTL_SECS as u64,
        )
        .await
        .map_err(store_err)
    }

    async fn message_for_transport_id(&self, transport_id: &str) -> DripResult<Option<Uuid>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .get(self.transport_key(transport_id))
            .await
            .map_err(store_err)?;
        raw.map(|id| {
            Uuid::parse_str(&id)
                .map_err(|e| DripError::Store(format!("transport index {transport_id}: {e}")))
        })
        .transpose()
    }
}

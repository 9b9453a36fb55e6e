//! Redis-backed store shared by every worker process.
//!
//! Campaigns and step records live in hashes so that claim, insert and
//! resolve can run as Lua scripts: each script reads and writes one record
//! inside Redis' single-threaded executor, which is what makes two racing
//! workers see exactly one winner. Messages are plain JSON strings because
//! only the claim holder ever writes them. Step inserts and message writes
//! check the campaign hash in the same script, so nothing is written for a
//! campaign once its delete has started.
//!
//! Key layout (`p` = configured prefix):
//! - `p:campaign:{id}` hash, `p:campaigns:{status}` set, `p:campaigns:due` zset
//! - `p:step:{id}` hash, `p:stepkey:{campaign}:{step}:{cycle}:{recipient}` string
//! - `p:campaign:{id}:steps` set, `p:steps:due` zset
//! - `p:message:{id}` string, `p:campaign:{id}:messages` set
//! - `p:engagement:{message}` hash, `p:transport:{id}` string (see
//!   `RedisEngagementTracker`)

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use drip_core::config::RedisConfig;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use drip_core::types::{
    Campaign, CampaignStatus, Message, MessageStatus, StatsDelta, StepKey, StepRecord,
    StepResolution, StepStatus,
};
use drip_core::{DripError, DripResult};

use crate::redis_engagement::RedisEngagementTracker;
use crate::repository::{CascadeReport, DripStore, InsertOutcome, StepClaim};

const CLAIM_CAMPAIGN: &str = r#"
local status = redis.call('HGET', KEYS[1], 'status')
if not status or status ~= 'scheduled' then return 0 end
local now = tonumber(ARGV[2])
if tonumber(redis.call('HGET', KEYS[1], 'scheduled_ms') or '0') > now then return 0 end
if tonumber(redis.call('HGET', KEYS[1], 'claim_exp_ms') or '0') > now then return 0 end
redis.call('HSET', KEYS[1], 'claimed_by', ARGV[1], 'claim_exp_ms', ARGV[3], 'updated_ms', ARGV[2])
return 1
"#;

const FINISH_CAMPAIGN: &str = r#"
local now = tonumber(ARGV[2])
if redis.call('HGET', KEYS[1], 'claimed_by') ~= ARGV[1] then return 0 end
if tonumber(redis.call('HGET', KEYS[1], 'claim_exp_ms') or '0') <= now then return 0 end
local old = redis.call('HGET', KEYS[1], 'status')
redis.call('HSET', KEYS[1], 'status', ARGV[3], 'claimed_by', '', 'claim_exp_ms', '0', 'updated_ms', ARGV[2])
redis.call('SREM', ARGV[5] .. old, ARGV[4])
redis.call('SADD', ARGV[5] .. ARGV[3], ARGV[4])
if ARGV[3] ~= 'scheduled' then redis.call('ZREM', KEYS[2], ARGV[4]) end
return 1
"#;

const RELEASE_CAMPAIGN: &str = r#"
if redis.call('HGET', KEYS[1], 'claimed_by') ~= ARGV[1] then return 0 end
redis.call('HSET', KEYS[1], 'claimed_by', '', 'claim_exp_ms', '0')
return 1
"#;

const TRANSITION_CAMPAIGN: &str = r#"
if redis.call('HGET', KEYS[1], 'status') ~= ARGV[1] then return 0 end
redis.call('HSET', KEYS[1], 'status', ARGV[2], 'updated_ms', ARGV[3])
redis.call('SMOVE', ARGV[5] .. ARGV[1], ARGV[5] .. ARGV[2], ARGV[4])
if ARGV[2] ~= 'scheduled' then redis.call('ZREM', KEYS[2], ARGV[4]) end
return 1
"#;

const INSERT_STEP: &str = r#"
if redis.call('EXISTS', KEYS[5]) == 0 then return '' end
local existing = redis.call('GET', KEYS[1])
if existing then return existing end
redis.call('SET', KEYS[1], ARGV[1])
redis.call('HSET', KEYS[2], unpack(ARGV, 4))
redis.call('SADD', KEYS[3], ARGV[1])
if ARGV[2] == 'pending' then redis.call('ZADD', KEYS[4], ARGV[3], ARGV[1]) end
return ARGV[1]
"#;

const PUT_MESSAGE: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then return 0 end
redis.call('SET', KEYS[2], ARGV[1])
redis.call('SADD', KEYS[3], ARGV[2])
return 1
"#;

const CLAIM_STEP: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then return 'missing' end
local status = redis.call('HGET', KEYS[1], 'status')
local now = tonumber(ARGV[2])
if status ~= 'pending' and status ~= 'claimed' then return 'contended' end
if tonumber(redis.call('HGET', KEYS[1], 'scheduled_ms')) > now then return 'not_due' end
if status == 'claimed' and tonumber(redis.call('HGET', KEYS[1], 'claim_exp_ms') or '0') > now then
  return 'contended'
end
redis.call('HSET', KEYS[1], 'status', 'claimed', 'claimed_by', ARGV[1], 'claim_exp_ms', ARGV[3], 'updated_ms', ARGV[2])
return 'claimed'
"#;

const RELEASE_STEP: &str = r#"
if redis.call('HGET', KEYS[1], 'status') ~= 'claimed' then return 0 end
if redis.call('HGET', KEYS[1], 'claimed_by') ~= ARGV[1] then return 0 end
redis.call('HSET', KEYS[1], 'status', 'pending', 'claimed_by', '', 'claim_exp_ms', '0', 'updated_ms', ARGV[2])
return 1
"#;

const RESOLVE_STEP: &str = r#"
if redis.call('HGET', KEYS[1], 'status') ~= 'claimed' then return 0 end
if redis.call('HGET', KEYS[1], 'claimed_by') ~= ARGV[1] then return 0 end
if tonumber(redis.call('HGET', KEYS[1], 'claim_exp_ms') or '0') <= tonumber(ARGV[2]) then return 0 end
redis.call('HSET', KEYS[1], 'status', ARGV[3], 'claimed_by', '', 'claim_exp_ms', '0',
  'resolved_ms', ARGV[2], 'updated_ms', ARGV[2], 'error', ARGV[6])
if ARGV[4] ~= '' then redis.call('HSET', KEYS[1], 'message_id', ARGV[4]) end
if ARGV[5] ~= '0' then redis.call('HSET', KEYS[1], 'sent_ms', ARGV[5]) end
redis.call('ZREM', KEYS[2], ARGV[7])
return 1
"#;

const CANCEL_STEP: &str = r#"
local status = redis.call('HGET', KEYS[1], 'status')
if status ~= 'pending' and status ~= 'claimed' then return 0 end
redis.call('HSET', KEYS[1], 'status', 'cancelled', 'claimed_by', '', 'claim_exp_ms', '0', 'updated_ms', ARGV[1])
return 1
"#;

struct Scripts {
    claim_campaign: Script,
    finish_campaign: Script,
    release_campaign: Script,
    transition_campaign: Script,
    insert_step: Script,
    put_message: Script,
    claim_step: Script,
    release_step: Script,
    resolve_step: Script,
    cancel_step: Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            claim_campaign: Script::new(CLAIM_CAMPAIGN),
            finish_campaign: Script::new(FINISH_CAMPAIGN),
            release_campaign: Script::new(RELEASE_CAMPAIGN),
            transition_campaign: Script::new(TRANSITION_CAMPAIGN),
            insert_step: Script::new(INSERT_STEP),
            put_message: Script::new(PUT_MESSAGE),
            claim_step: Script::new(CLAIM_STEP),
            release_step: Script::new(RELEASE_STEP),
            resolve_step: Script::new(RESOLVE_STEP),
            cancel_step: Script::new(CANCEL_STEP),
        }
    }
}

/// Distributed store used when several workers poll the same campaigns.
pub struct RedisStore {
    conn: ConnectionManager,
    prefix: String,
    scripts: Scripts,
}

const DUE_STEP_PAGE: usize = 64;

pub(crate) fn store_err(e: redis::RedisError) -> DripError {
    metrics::counter!("drip.store.redis_errors").increment(1);
    DripError::Store(e.to_string())
}

fn ms(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn from_ms(value: i64) -> DripResult<DateTime<Utc>> {
    Utc.timestamp_millis_opt(value)
        .single()
        .ok_or_else(|| DripError::Store(format!("invalid timestamp {value}")))
}

fn opt_ms(value: i64) -> DripResult<Option<DateTime<Utc>>> {
    if value == 0 {
        Ok(None)
    } else {
        from_ms(value).map(Some)
    }
}

fn field<'a>(fields: &'a HashMap<String, String>, name: &str) -> DripResult<&'a str> {
    fields
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| DripError::Store(format!("missing field {name}")))
}

fn int_field(fields: &HashMap<String, String>, name: &str) -> DripResult<i64> {
    let raw = fields.get(name).map(String::as_str).unwrap_or("0");
    raw.parse::<i64>()
        .map_err(|e| DripError::Store(format!("field {name}: {e}")))
}

fn uuid_field(fields: &HashMap<String, String>, name: &str) -> DripResult<Uuid> {
    Uuid::parse_str(field(fields, name)?).map_err(|e| DripError::Store(format!("field {name}: {e}")))
}

fn non_empty(fields: &HashMap<String, String>, name: &str) -> Option<String> {
    fields.get(name).filter(|v| !v.is_empty()).cloned()
}

fn step_fields(record: &StepRecord) -> Vec<(&'static str, String)> {
    vec![
        ("id", record.id.to_string()),
        ("campaign_id", record.key.campaign_id.to_string()),
        ("recipient_id", record.key.recipient_id.clone()),
        ("step_number", record.key.step_number.to_string()),
        ("cycle", record.key.cycle.to_string()),
        ("status", record.status.as_str().to_string()),
        ("scheduled_ms", ms(record.scheduled_at).to_string()),
        ("claimed_by", record.claimed_by.clone().unwrap_or_default()),
        ("claim_exp_ms", record.claim_expires_at.map_or(0, ms).to_string()),
        ("sent_ms", record.sent_at.map_or(0, ms).to_string()),
        ("resolved_ms", record.resolved_at.map_or(0, ms).to_string()),
        ("message_id", record.message_id.map(|id| id.to_string()).unwrap_or_default()),
        ("error", record.error.clone().unwrap_or_default()),
        ("created_ms", ms(record.created_at).to_string()),
        ("updated_ms", ms(record.updated_at).to_string()),
    ]
}

fn step_from_fields(fields: &HashMap<String, String>) -> DripResult<StepRecord> {
    let status = field(fields, "status")?;
    Ok(StepRecord {
        id: uuid_field(fields, "id")?,
        key: StepKey {
            campaign_id: uuid_field(fields, "campaign_id")?,
            recipient_id: field(fields, "recipient_id")?.to_string(),
            step_number: int_field(fields, "step_number")? as u32,
            cycle: int_field(fields, "cycle")? as u32,
        },
        status: StepStatus::parse(status)
            .ok_or_else(|| DripError::Store(format!("unknown step status {status}")))?,
        scheduled_at: from_ms(int_field(fields, "scheduled_ms")?)?,
        claimed_by: non_empty(fields, "claimed_by"),
        claim_expires_at: opt_ms(int_field(fields, "claim_exp_ms")?)?,
        sent_at: opt_ms(int_field(fields, "sent_ms")?)?,
        resolved_at: opt_ms(int_field(fields, "resolved_ms")?)?,
        message_id: non_empty(fields, "message_id")
            .map(|id| Uuid::parse_str(&id))
            .transpose()
            .map_err(|e| DripError::Store(format!("field message_id: {e}")))?,
        error: non_empty(fields, "error"),
        created_at: from_ms(int_field(fields, "created_ms")?)?,
        updated_at: from_ms(int_field(fields, "updated_ms")?)?,
    })
}

fn campaign_from_fields(fields: &HashMap<String, String>) -> DripResult<Campaign> {
    let mut campaign: Campaign = serde_json::from_str(field(fields, "data")?)?;
    let status = field(fields, "status")?;
    campaign.status = CampaignStatus::parse(status)
        .ok_or_else(|| DripError::Store(format!("unknown campaign status {status}")))?;
    campaign.claimed_by = non_empty(fields, "claimed_by");
    campaign.claim_expires_at = opt_ms(int_field(fields, "claim_exp_ms")?)?;
    campaign.stats.total_sent = int_field(fields, "total_sent")? as u64;
    campaign.stats.total_failed = int_field(fields, "total_failed")? as u64;
    campaign.stats.total_skipped = int_field(fields, "total_skipped")? as u64;
    campaign.updated_at = from_ms(int_field(fields, "updated_ms")?)?;
    Ok(campaign)
}

impl RedisStore {
    /// Connect to Redis and verify connectivity.
    pub async fn new(config: &RedisConfig, prefix: &str) -> anyhow::Result<Self> {
        let url = config
            .urls
            .first()
            .cloned()
            .unwrap_or_else(|| "redis://localhost:6379".to_string());

        info!(url = %url, prefix = %prefix, "Connecting to Redis");

        let client = redis::Client::open(url.as_str())?;
        let mut conn = tokio::time::timeout(
            Duration::from_millis(config.connect_timeout_ms),
            ConnectionManager::new(client),
        )
        .await
        .map_err(|_| anyhow::anyhow!("timed out connecting to Redis at {url}"))??;

        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        info!(response = %pong, "Redis connection established");

        Ok(Self {
            conn,
            prefix: prefix.to_string(),
            scripts: Scripts::load(),
        })
    }

    /// Engagement tracker sharing this store's connection and key prefix.
    pub fn engagement_tracker(&self) -> RedisEngagementTracker {
        RedisEngagementTracker::new(self.conn.clone(), &self.prefix)
    }

    fn campaign_key(&self, id: Uuid) -> String {
        format!("{}:campaign:{id}", self.prefix)
    }

    fn status_set_prefix(&self) -> String {
        format!("{}:campaigns:", self.prefix)
    }

    fn status_set(&self, status: CampaignStatus) -> String {
        format!("{}{}", self.status_set_prefix(), status.as_str())
    }

    fn due_campaigns_key(&self) -> String {
        format!("{}:campaigns:due", self.prefix)
    }

    fn step_key(&self, id: Uuid) -> String {
        format!("{}:step:{id}", self.prefix)
    }

    fn step_index_key(&self, key: &StepKey) -> String {
        format!(
            "{}:stepkey:{}:{}:{}:{}",
            self.prefix, key.campaign_id, key.step_number, key.cycle, key.recipient_id
        )
    }

    fn campaign_steps_key(&self, id: Uuid) -> String {
        format!("{}:campaign:{id}:steps", self.prefix)
    }

    fn due_steps_key(&self) -> String {
        format!("{}:steps:due", self.prefix)
    }

    fn message_key(&self, id: Uuid) -> String {
        format!("{}:message:{id}", self.prefix)
    }

    fn campaign_messages_key(&self, id: Uuid) -> String {
        format!("{}:campaign:{id}:messages", self.prefix)
    }

    async fn load_step(&self, id: Uuid) -> DripResult<Option<StepRecord>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> =
            conn.hgetall(self.step_key(id)).await.map_err(store_err)?;
        if fields.is_empty() {
            return Ok(None);
        }
        step_from_fields(&fields).map(Some)
    }

    async fn load_steps(&self, ids: Vec<String>) -> DripResult<Vec<StepRecord>> {
        let mut records = Vec::with_capacity(ids.len());
        for raw in ids {
            let Ok(id) = Uuid::parse_str(&raw) else {
                warn!(id = %raw, "Skipping malformed step id in index");
                continue;
            };
            if let Some(record) = self.load_step(id).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn load_campaigns(&self, ids: Vec<String>) -> DripResult<Vec<Campaign>> {
        let mut campaigns = Vec::with_capacity(ids.len());
        for raw in ids {
            let Ok(id) = Uuid::parse_str(&raw) else {
                warn!(id = %raw, "Skipping malformed campaign id in index");
                continue;
            };
            if let Some(campaign) = self.get_campaign(id).await? {
                campaigns.push(campaign);
            }
        }
        Ok(campaigns)
    }
}

#[async_trait]
impl DripStore for RedisStore {
    async fn put_campaign(&self, campaign: Campaign) -> DripResult<()> {
        let mut conn = self.conn.clone();
        let key = self.campaign_key(campaign.id);
        let old_status: Option<String> = conn.hget(&key, "status").await.map_err(store_err)?;
        let id = campaign.id.to_string();

        let mut pipe = redis::pipe();
        pipe.atomic();
        if let Some(old) = old_status {
            pipe.srem(format!("{}{old}", self.status_set_prefix()), &id).ignore();
        }
        pipe.hset_multiple(
            &key,
            &[
                ("data", serde_json::to_string(&campaign)?),
                ("status", campaign.status.as_str().to_string()),
                ("scheduled_ms", campaign.scheduled_at.map_or(0, ms).to_string()),
                ("claimed_by", campaign.claimed_by.clone().unwrap_or_default()),
                ("claim_exp_ms", campaign.claim_expires_at.map_or(0, ms).to_string()),
                ("total_sent", campaign.stats.total_sent.to_string()),
                ("total_failed", campaign.stats.total_failed.to_string()),
                ("total_skipped", campaign.stats.total_skipped.to_string()),
                ("updated_ms", ms(campaign.updated_at).to_string()),
            ],
        )
        .ignore();
        pipe.sadd(self.status_set(campaign.status), &id).ignore();
        if campaign.status == CampaignStatus::Scheduled {
            pipe.zadd(
                self.due_campaigns_key(),
                &id,
                campaign.scheduled_at.map_or(0, ms),
            )
            .ignore();
        } else {
            pipe.zrem(self.due_campaigns_key(), &id).ignore();
        }
        pipe.query_async::<_, ()>(&mut conn).await.map_err(store_err)?;

        debug!(campaign_id = %campaign.id, status = campaign.status.as_str(), "Stored campaign");
        Ok(())
    }

    async fn get_campaign(&self, id: Uuid) -> DripResult<Option<Campaign>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> =
            conn.hgetall(self.campaign_key(id)).await.map_err(store_err)?;
        if fields.is_empty() {
            return Ok(None);
        }
        campaign_from_fields(&fields).map(Some)
    }

    async fn list_campaigns(&self, status: CampaignStatus) -> DripResult<Vec<Campaign>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.smembers(self.status_set(status)).await.map_err(store_err)?;
        let mut campaigns = self.load_campaigns(ids).await?;
        campaigns.retain(|c| c.status == status);
        campaigns.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(campaigns)
    }

    async fn list_due_campaigns(&self, now: DateTime<Utc>, limit: usize) -> DripResult<Vec<Campaign>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn
            .zrangebyscore_limit(self.due_campaigns_key(), "-inf", ms(now), 0, limit as isize)
            .await
            .map_err(store_err)?;
        let mut campaigns = self.load_campaigns(ids).await?;
        campaigns.retain(|c| c.is_due(now) && !c.is_leased(now));
        Ok(campaigns)
    }

    async fn try_claim_campaign(
        &self,
        id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> DripResult<Option<Campaign>> {
        let mut conn = self.conn.clone();
        let claimed: i64 = self
            .scripts
            .claim_campaign
            .key(self.campaign_key(id))
            .arg(worker_id)
            .arg(ms(now))
            .arg(ms(lease_until))
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;
        if claimed == 0 {
            return Ok(None);
        }
        self.get_campaign(id).await
    }

    async fn finish_campaign_dispatch(
        &self,
        id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
        status: CampaignStatus,
    ) -> DripResult<bool> {
        let mut conn = self.conn.clone();
        let done: i64 = self
            .scripts
            .finish_campaign
            .key(self.campaign_key(id))
            .key(self.due_campaigns_key())
            .arg(worker_id)
            .arg(ms(now))
            .arg(status.as_str())
            .arg(id.to_string())
            .arg(self.status_set_prefix())
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(done == 1)
    }

    async fn release_campaign(&self, id: Uuid, worker_id: &str) -> DripResult<bool> {
        let mut conn = self.conn.clone();
        let released: i64 = self
            .scripts
            .release_campaign
            .key(self.campaign_key(id))
            .arg(worker_id)
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(released == 1)
    }

    async fn transition_campaign(
        &self,
        id: Uuid,
        from: CampaignStatus,
        to: CampaignStatus,
        now: DateTime<Utc>,
    ) -> DripResult<bool> {
        let mut conn = self.conn.clone();
        let moved: i64 = self
            .scripts
            .transition_campaign
            .key(self.campaign_key(id))
            .key(self.due_campaigns_key())
            .arg(from.as_str())
            .arg(to.as_str())
            .arg(ms(now))
            .arg(id.to_string())
            .arg(self.status_set_prefix())
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(moved == 1)
    }

    async fn record_stats(&self, id: Uuid, delta: StatsDelta) -> DripResult<()> {
        let mut conn = self.conn.clone();
        let key = self.campaign_key(id);
        redis::pipe()
            .atomic()
            .hincr(&key, "total_sent", delta.sent)
            .ignore()
            .hincr(&key, "total_failed", delta.failed)
            .ignore()
            .hincr(&key, "total_skipped", delta.skipped)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(store_err)
    }

    async fn delete_campaign(&self, id: Uuid, now: DateTime<Utc>) -> DripResult<CascadeReport> {
        let mut conn = self.conn.clone();
        let mut report = CascadeReport::default();

        let mut pipe = redis::pipe();
        pipe.atomic();
        for status in [
            CampaignStatus::Draft,
            CampaignStatus::Scheduled,
            CampaignStatus::Sending,
            CampaignStatus::Sent,
            CampaignStatus::Completed,
            CampaignStatus::Paused,
        ] {
            pipe.srem(self.status_set(status), id.to_string()).ignore();
        }
        pipe.zrem(self.due_campaigns_key(), id.to_string()).ignore();
        pipe.del(self.campaign_key(id)).ignore();
        pipe.query_async::<_, ()>(&mut conn).await.map_err(store_err)?;

        let step_ids: Vec<String> = conn
            .smembers(self.campaign_steps_key(id))
            .await
            .map_err(store_err)?;
        let records = self.load_steps(step_ids.clone()).await?;
        for record in &records {
            let cancelled: i64 = self
                .scripts
                .cancel_step
                .key(self.step_key(record.id))
                .arg(ms(now))
                .invoke_async(&mut conn)
                .await
                .map_err(store_err)?;
            report.steps_cancelled += cancelled as usize;
        }

        let message_ids: Vec<String> = conn
            .smembers(self.campaign_messages_key(id))
            .await
            .map_err(store_err)?;
        for raw in &message_ids {
            let Ok(message_id) = Uuid::parse_str(raw) else {
                continue;
            };
            if let Some(mut message) = self.get_message(message_id).await? {
                if matches!(message.status, MessageStatus::Queued | MessageStatus::Sending) {
                    message.status = MessageStatus::Cancelled;
                    let json = serde_json::to_string(&message)?;
                    conn.set::<_, _, ()>(self.message_key(message_id), json)
                        .await
                        .map_err(store_err)?;
                    report.messages_cancelled += 1;
                }
            }
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for record in &records {
            pipe.del(self.step_key(record.id)).ignore();
            pipe.del(self.step_index_key(&record.key)).ignore();
            pipe.zrem(self.due_steps_key(), record.id.to_string()).ignore();
        }
        for raw in &message_ids {
            pipe.del(format!("{}:message:{raw}", self.prefix)).ignore();
        }
        pipe.del(self.campaign_steps_key(id)).ignore();
        pipe.del(self.campaign_messages_key(id)).ignore();
        pipe.query_async::<_, ()>(&mut conn).await.map_err(store_err)?;

        report.steps_deleted = records.len();
        report.messages_deleted = message_ids.len();
        info!(
            campaign_id = %id,
            steps_cancelled = report.steps_cancelled,
            messages_cancelled = report.messages_cancelled,
            "Deleted campaign"
        );
        Ok(report)
    }

    async fn insert_step(&self, record: StepRecord) -> DripResult<InsertOutcome> {
        let mut conn = self.conn.clone();
        let mut invocation = self.scripts.insert_step.prepare_invoke();
        invocation
            .key(self.step_index_key(&record.key))
            .key(self.step_key(record.id))
            .key(self.campaign_steps_key(record.key.campaign_id))
            .key(self.due_steps_key())
            .key(self.campaign_key(record.key.campaign_id))
            .arg(record.id.to_string())
            .arg(record.status.as_str())
            .arg(ms(record.scheduled_at));
        for (name, value) in step_fields(&record) {
            invocation.arg(name).arg(value);
        }
        let stored_id: String = invocation.invoke_async(&mut conn).await.map_err(store_err)?;

        if stored_id.is_empty() {
            return Err(DripError::CampaignNotFound(record.key.campaign_id));
        }
        if stored_id == record.id.to_string() {
            return Ok(InsertOutcome::Inserted(record));
        }
        let existing_id = Uuid::parse_str(&stored_id)
            .map_err(|e| DripError::Store(format!("step index for {}: {e}", record.key)))?;
        let existing = self
            .load_step(existing_id)
            .await?
            .ok_or(DripError::StepNotFound(existing_id))?;
        Ok(InsertOutcome::Exists(existing))
    }

    async fn get_step(&self, id: Uuid) -> DripResult<Option<StepRecord>> {
        self.load_step(id).await
    }

    async fn find_step(&self, key: &StepKey) -> DripResult<Option<StepRecord>> {
        let mut conn = self.conn.clone();
        let id: Option<String> = conn.get(self.step_index_key(key)).await.map_err(store_err)?;
        match id {
            Some(raw) => {
                let id = Uuid::parse_str(&raw)
                    .map_err(|e| DripError::Store(format!("step index for {key}: {e}")))?;
                self.load_step(id).await
            }
            None => Ok(None),
        }
    }

    async fn list_due_steps(&self, now: DateTime<Utc>, limit: usize) -> DripResult<Vec<StepRecord>> {
        let mut conn = self.conn.clone();
        // Records under a live lease, and those of campaigns that cannot
        // deliver, stay in the index; page past them until `limit` is met.
        let page = (limit * 2).max(DUE_STEP_PAGE);
        let mut runnable: HashMap<Uuid, bool> = HashMap::new();
        let mut due = Vec::with_capacity(limit);
        let mut offset = 0;
        while due.len() < limit {
            let ids: Vec<String> = conn
                .zrangebyscore_limit(self.due_steps_key(), "-inf", ms(now), offset, page as isize)
                .await
                .map_err(store_err)?;
            let exhausted = ids.len() < page;
            offset += ids.len() as isize;
            for record in self.load_steps(ids).await? {
                if !record.is_claimable(now) {
                    continue;
                }
                let campaign_id = record.key.campaign_id;
                let runs = match runnable.get(&campaign_id) {
                    Some(runs) => *runs,
                    None => {
                        let status: Option<String> = conn
                            .hget(self.campaign_key(campaign_id), "status")
                            .await
                            .map_err(store_err)?;
                        let runs = status
                            .as_deref()
                            .and_then(CampaignStatus::parse)
                            .is_some_and(|s| s.runs_steps());
                        runnable.insert(campaign_id, runs);
                        runs
                    }
                };
                if runs {
                    due.push(record);
                }
            }
            if exhausted {
                break;
            }
        }
        due.truncate(limit);
        Ok(due)
    }

    async fn try_claim_step(
        &self,
        id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> DripResult<StepClaim> {
        let mut conn = self.conn.clone();
        let outcome: String = self
            .scripts
            .claim_step
            .key(self.step_key(id))
            .arg(worker_id)
            .arg(ms(now))
            .arg(ms(lease_until))
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;
        match outcome.as_str() {
            "claimed" => match self.load_step(id).await? {
                Some(record) => Ok(StepClaim::Claimed(record)),
                None => Ok(StepClaim::Missing),
            },
            "not_due" => Ok(StepClaim::NotDue),
            "missing" => Ok(StepClaim::Missing),
            _ => Ok(StepClaim::Contended),
        }
    }

    async fn release_step(&self, id: Uuid, worker_id: &str, now: DateTime<Utc>) -> DripResult<bool> {
        let mut conn = self.conn.clone();
        let released: i64 = self
            .scripts
            .release_step
            .key(self.step_key(id))
            .arg(worker_id)
            .arg(ms(now))
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(released == 1)
    }

    async fn resolve_step(
        &self,
        id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
        resolution: &StepResolution,
    ) -> DripResult<StepRecord> {
        let (message_id, sent_ms, error) = match resolution {
            StepResolution::Sent { message_id, sent_at } => {
                (message_id.to_string(), ms(*sent_at), String::new())
            }
            StepResolution::Failed { message_id, error } => (
                message_id.map(|m| m.to_string()).unwrap_or_default(),
                0,
                error.clone(),
            ),
            StepResolution::Skipped { reason } => (String::new(), 0, reason.clone()),
        };

        let mut conn = self.conn.clone();
        let resolved: i64 = self
            .scripts
            .resolve_step
            .key(self.step_key(id))
            .key(self.due_steps_key())
            .arg(worker_id)
            .arg(ms(now))
            .arg(resolution.status().as_str())
            .arg(message_id)
            .arg(sent_ms)
            .arg(error)
            .arg(id.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;
        if resolved == 0 {
            return Err(DripError::LeaseLost(id));
        }
        self.load_step(id).await?.ok_or(DripError::StepNotFound(id))
    }

    async fn steps_for_campaign(&self, campaign_id: Uuid) -> DripResult<Vec<StepRecord>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn
            .smembers(self.campaign_steps_key(campaign_id))
            .await
            .map_err(store_err)?;
        let mut records = self.load_steps(ids).await?;
        records.sort_by(|a, b| {
            (&a.key.recipient_id, a.key.cycle, a.key.step_number).cmp(&(
                &b.key.recipient_id,
                b.key.cycle,
                b.key.step_number,
            ))
        });
        Ok(records)
    }

    async fn put_message(&self, message: Message) -> DripResult<()> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(&message)?;
        let stored: i64 = self
            .scripts
            .put_message
            .key(self.campaign_key(message.campaign_id))
            .key(self.message_key(message.id))
            .key(self.campaign_messages_key(message.campaign_id))
            .arg(json)
            .arg(message.id.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;
        if stored == 0 {
            return Err(DripError::CampaignNotFound(message.campaign_id));
        }
        Ok(())
    }

    async fn get_message(&self, id: Uuid) -> DripResult<Option<Message>> {
        let mut conn = self.conn.clone();
        let json: Option<String> = conn.get(self.message_key(id)).await.map_err(store_err)?;
        json.map(|j| serde_json::from_str(&j).map_err(DripError::from))
            .transpose()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Duration;
    use drip_core::types::{CampaignStats, ContentRef, RecipientSet, SendType, SenderConfig};

    #[test]
    fn test_step_fields_round_trip_at_millisecond_precision() {
        let now = Utc.timestamp_millis_opt(1_700_000_000_123).single().unwrap();
        let mut record = StepRecord::pending(StepKey::new(Uuid::new_v4(), "r:1", 2, 3), now, now);
        record.status = StepStatus::Claimed;
        record.claimed_by = Some("node-01-w".into());
        record.claim_expires_at = Some(now + Duration::minutes(2));

        let fields: HashMap<String, String> = step_fields(&record)
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let parsed = step_from_fields(&fields).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn test_missing_optional_fields_parse_as_none() {
        let now = Utc.timestamp_millis_opt(1_700_000_000_000).single().unwrap();
        let record = StepRecord::pending(StepKey::new(Uuid::new_v4(), "r-1", 0, 1), now, now);
        let fields: HashMap<String, String> = step_fields(&record)
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let parsed = step_from_fields(&fields).unwrap();
        assert!(parsed.claimed_by.is_none());
        assert!(parsed.message_id.is_none());
        assert!(parsed.resolved_at.is_none());
    }

    fn campaign(status: CampaignStatus) -> Campaign {
        let now = Utc::now();
        Campaign {
            id: Uuid::new_v4(),
            owner_id: "owner-1".into(),
            name: "Onboarding".into(),
            recipients: RecipientSet::default(),
            send_type: SendType::Immediate,
            content: Some(ContentRef::Template {
                template_id: "welcome".into(),
            }),
            sequence: None,
            sender: SenderConfig::default(),
            status,
            scheduled_at: None,
            claimed_by: None,
            claim_expires_at: None,
            stats: CampaignStats::default(),
            created_at: now,
            updated_at: now,
        }
    }

    async fn local_store() -> RedisStore {
        RedisStore::new(&RedisConfig::default(), &format!("drip-test-{}", Uuid::new_v4()))
            .await
            .unwrap()
    }

    /// Requires a local Redis at redis://localhost:6379.
    #[tokio::test]
    #[ignore]
    async fn test_concurrent_claims_have_one_winner() {
        let store = std::sync::Arc::new(local_store().await);
        let c = campaign(CampaignStatus::Sending);
        let campaign_id = c.id;
        store.put_campaign(c).await.unwrap();
        let now = Utc::now();
        let record = StepRecord::pending(StepKey::new(campaign_id, "r-1", 0, 1), now, now);
        let id = record.id;
        assert!(store.insert_step(record.clone()).await.unwrap().was_inserted());
        assert!(!store.insert_step(StepRecord { id: Uuid::new_v4(), ..record }).await.unwrap().was_inserted());

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .try_claim_step(id, &format!("w-{i}"), now, now + Duration::minutes(2))
                    .await
                    .unwrap()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), StepClaim::Claimed(_)) {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    /// Requires a local Redis at redis://localhost:6379.
    #[tokio::test]
    #[ignore]
    async fn test_due_steps_page_past_paused_campaigns() {
        let store = local_store().await;
        let now = Utc::now();
        let paused = campaign(CampaignStatus::Paused);
        let paused_id = paused.id;
        store.put_campaign(paused).await.unwrap();
        let active = campaign(CampaignStatus::Sending);
        let active_id = active.id;
        store.put_campaign(active).await.unwrap();

        for i in 0..(DUE_STEP_PAGE + 5) {
            let record = StepRecord::pending(
                StepKey::new(paused_id, &format!("r-{i}"), 0, 1),
                now - Duration::hours(1),
                now,
            );
            store.insert_step(record).await.unwrap();
        }
        let live = StepRecord::pending(StepKey::new(active_id, "r-live", 0, 1), now, now);
        let live_id = live.id;
        store.insert_step(live).await.unwrap();

        let due = store.list_due_steps(now, 2).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, live_id);
    }

    /// Requires a local Redis at redis://localhost:6379.
    #[tokio::test]
    #[ignore]
    async fn test_writes_for_deleted_campaign_are_refused() {
        let store = local_store().await;
        let now = Utc::now();
        let c = campaign(CampaignStatus::Sending);
        let id = c.id;
        store.put_campaign(c).await.unwrap();
        let record = StepRecord::pending(StepKey::new(id, "r-1", 0, 1), now, now);
        store.insert_step(record.clone()).await.unwrap();

        store.delete_campaign(id, now).await.unwrap();

        let message = Message::queued(&record, "a@example.com".into(), Default::default(), now);
        assert!(matches!(
            store.put_message(message.clone()).await,
            Err(DripError::CampaignNotFound(_))
        ));
        assert!(store.get_message(message.id).await.unwrap().is_none());
        assert!(matches!(
            store.insert_step(StepRecord::pending(record.key.next(), now, now)).await,
            Err(DripError::CampaignNotFound(_))
        ));
        assert!(store.steps_for_campaign(id).await.unwrap().is_empty());
    }
}

use serde::Deserialize;
use std::time::Duration;

/// Root application configuration. Loaded from an optional TOML file and
/// environment variables with the prefix `DRIP_EXPRESS__`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub sendgrid: SendGridConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
}

/// Poller cadences, lease lengths and per-tick limits.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_initial_sends_interval_secs")]
    pub initial_sends_interval_secs: u64,
    #[serde(default = "default_queued_steps_interval_secs")]
    pub queued_steps_interval_secs: u64,
    #[serde(default = "default_repeat_sweep_interval_secs")]
    pub repeat_sweep_interval_secs: u64,
    #[serde(default = "default_step_lease_secs")]
    pub step_lease_secs: u64,
    #[serde(default = "default_campaign_lease_secs")]
    pub campaign_lease_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_concurrent_sends")]
    pub max_concurrent_sends: usize,
    #[serde(default = "default_delivery_timeout_ms")]
    pub delivery_timeout_ms: u64,
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub enable_initial_sends: bool,
    #[serde(default = "default_true")]
    pub enable_queued_steps: bool,
    #[serde(default = "default_true")]
    pub enable_repeat_sweep: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Redis,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_backend")]
    pub backend: StoreBackend,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_urls")]
    pub urls: Vec<String>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

/// SendGrid email provider configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SendGridConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_sendgrid_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_from_email")]
    pub from_email: String,
    #[serde(default = "default_from_name")]
    pub from_name: String,
    #[serde(default = "default_true")]
    pub open_tracking: bool,
    #[serde(default = "default_true")]
    pub click_tracking: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_metrics_host")]
    pub host: String,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

/// HTTP endpoint receiving SendGrid event webhooks and detected replies.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_metrics_host")]
    pub host: String,
    #[serde(default = "default_webhook_port")]
    pub port: u16,
}

// Default functions
/// Unique per process, so workers started without an explicit id never
/// share claims.
fn default_node_id() -> String {
    let simple = uuid::Uuid::new_v4().simple().to_string();
    format!("node-{}", &simple[..12])
}
fn default_true() -> bool {
    true
}
fn default_initial_sends_interval_secs() -> u64 {
    60
}
fn default_queued_steps_interval_secs() -> u64 {
    60
}
fn default_repeat_sweep_interval_secs() -> u64 {
    600
}
fn default_step_lease_secs() -> u64 {
    120
}
fn default_campaign_lease_secs() -> u64 {
    300
}
fn default_batch_size() -> usize {
    500
}
fn default_max_concurrent_sends() -> usize {
    16
}
fn default_delivery_timeout_ms() -> u64 {
    30_000
}
fn default_store_timeout_ms() -> u64 {
    5_000
}
fn default_store_backend() -> StoreBackend {
    StoreBackend::Memory
}
fn default_key_prefix() -> String {
    "drip".to_string()
}
fn default_redis_urls() -> Vec<String> {
    vec!["redis://localhost:6379".to_string()]
}
fn default_connect_timeout_ms() -> u64 {
    5000
}
fn default_sendgrid_endpoint() -> String {
    "https://api.sendgrid.com/v3/mail/send".to_string()
}
fn default_from_email() -> String {
    "outreach@dripexpress.io".to_string()
}
fn default_from_name() -> String {
    "Drip Express".to_string()
}
fn default_metrics_host() -> String {
    "0.0.0.0".to_string()
}
fn default_metrics_port() -> u16 {
    9091
}
fn default_webhook_port() -> u16 {
    8088
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            initial_sends_interval_secs: default_initial_sends_interval_secs(),
            queued_steps_interval_secs: default_queued_steps_interval_secs(),
            repeat_sweep_interval_secs: default_repeat_sweep_interval_secs(),
            step_lease_secs: default_step_lease_secs(),
            campaign_lease_secs: default_campaign_lease_secs(),
            batch_size: default_batch_size(),
            max_concurrent_sends: default_max_concurrent_sends(),
            delivery_timeout_ms: default_delivery_timeout_ms(),
            store_timeout_ms: default_store_timeout_ms(),
            enable_initial_sends: true,
            enable_queued_steps: true,
            enable_repeat_sweep: true,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            key_prefix: default_key_prefix(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            urls: default_redis_urls(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl Default for SendGridConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            endpoint: default_sendgrid_endpoint(),
            from_email: default_from_email(),
            from_name: default_from_name(),
            open_tracking: true,
            click_tracking: true,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_metrics_host(),
            port: default_metrics_port(),
        }
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_metrics_host(),
            port: default_webhook_port(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            worker: WorkerConfig::default(),
            store: StoreConfig::default(),
            redis: RedisConfig::default(),
            sendgrid: SendGridConfig::default(),
            metrics: MetricsConfig::default(),
            webhook: WebhookConfig::default(),
        }
    }
}

impl WorkerConfig {
    pub fn step_lease(&self) -> Duration {
        Duration::from_secs(self.step_lease_secs)
    }

    pub fn campaign_lease(&self) -> Duration {
        Duration::from_secs(self.campaign_lease_secs)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    /// A delivery that outlives the lease could be re-sent by another worker.
    pub fn validate(&self) -> Result<(), String> {
        if self.delivery_timeout_ms >= self.step_lease_secs * 1000 {
            return Err(format!(
                "delivery_timeout_ms ({}) must be shorter than step_lease_secs ({}s)",
                self.delivery_timeout_ms, self.step_lease_secs
            ));
        }
        if self.max_concurrent_sends == 0 || self.batch_size == 0 {
            return Err("batch_size and max_concurrent_sends must be positive".to_string());
        }
        if self.initial_sends_interval_secs == 0
            || self.queued_steps_interval_secs == 0
            || self.repeat_sweep_interval_secs == 0
        {
            return Err("poller intervals must be at least one second".to_string());
        }
        Ok(())
    }
}

impl AppConfig {
    /// Load configuration from environment variables and an optional config file.
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        let builder = builder.add_source(
            config::Environment::with_prefix("DRIP_EXPRESS")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("redis.urls"),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}

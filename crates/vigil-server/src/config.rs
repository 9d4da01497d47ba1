use anyhow::Context;
use serde::{Deserialize, Serialize};
use vigil_alert::rule::Rule;
use vigil_notify::channel::ChannelSpec;
use vigil_notify::queue::PriorityPolicy;
use vigil_notify::recipient::NotificationRecipient;
use vigil_notify::template::NotificationTemplate;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Snowflake machine/node ids, each in `0..=31`.
    #[serde(default)]
    pub id: IdConfig,
    #[serde(default)]
    pub dispatch: PriorityPolicy,
    /// How long finished messages stay queryable before being pruned.
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    /// Interval of the periodic statistics log line; 0 disables it.
    #[serde(default = "default_stats_log_interval_secs")]
    pub stats_log_interval_secs: u64,
    /// In-app notifications kept per recipient.
    #[serde(default = "default_inbox_capacity")]
    pub inbox_capacity: usize,

    #[serde(default)]
    pub channels: Vec<ChannelSpec>,
    #[serde(default)]
    pub templates: Vec<NotificationTemplate>,
    #[serde(default)]
    pub recipients: Vec<NotificationRecipient>,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            id: IdConfig::default(),
            dispatch: PriorityPolicy::default(),
            retention_secs: default_retention_secs(),
            stats_log_interval_secs: default_stats_log_interval_secs(),
            inbox_capacity: default_inbox_capacity(),
            channels: Vec::new(),
            templates: Vec::new(),
            recipients: Vec::new(),
            rules: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdConfig {
    #[serde(default = "default_id_part")]
    pub machine_id: i32,
    #[serde(default = "default_id_part")]
    pub node_id: i32,
}

impl Default for IdConfig {
    fn default() -> Self {
        Self {
            machine_id: default_id_part(),
            node_id: default_id_part(),
        }
    }
}

fn default_id_part() -> i32 {
    1
}

fn default_retention_secs() -> u64 {
    86400
}

fn default_stats_log_interval_secs() -> u64 {
    300
}

/// Longest accepted `retention_secs`: ten years.
pub const MAX_RETENTION_SECS: u64 = 10 * 366 * 24 * 3600;

fn default_inbox_capacity() -> usize {
    200
}

impl ServerConfig {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file '{path}'"))?;
        Self::parse(&content).with_context(|| format!("Failed to parse config file '{path}'"))
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(content)?;
        if !(0..=31).contains(&config.id.machine_id) || !(0..=31).contains(&config.id.node_id) {
            anyhow::bail!(
                "id.machine_id and id.node_id must be in 0..=31 (got {} and {})",
                config.id.machine_id,
                config.id.node_id
            );
        }
        if config.retention_secs > MAX_RETENTION_SECS {
            anyhow::bail!(
                "retention_secs must be at most {MAX_RETENTION_SECS} (got {})",
                config.retention_secs
            );
        }
        Ok(config)
    }
}

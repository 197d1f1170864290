use chrono::Duration;
use serde::{Deserialize, Deserializer};

/// Cadences, cooldowns and windows used by the scheduling engine.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// A prayer within this much of `now` is still treated as upcoming.
    #[serde(deserialize_with = "seconds")]
    pub grace_window: Duration,
    #[serde(deserialize_with = "seconds")]
    pub final_hour: Duration,
    /// Nominal gap assumed when the previous prayer is unknown.
    #[serde(deserialize_with = "seconds")]
    pub nominal_interval: Duration,
    #[serde(deserialize_with = "seconds")]
    pub schedule_cooldown: Duration,
    #[serde(deserialize_with = "seconds")]
    pub delivery_cooldown: Duration,
    #[serde(deserialize_with = "seconds")]
    pub arrival_poll: Duration,
    #[serde(deserialize_with = "seconds")]
    pub arrival_window: Duration,
    #[serde(deserialize_with = "seconds")]
    pub propagation_delay: Duration,
    #[serde(deserialize_with = "seconds")]
    pub settle_delay: Duration,
    #[serde(deserialize_with = "seconds")]
    pub health_interval: Duration,
    #[serde(deserialize_with = "seconds")]
    pub stuck_grace: Duration,
    #[serde(deserialize_with = "seconds")]
    pub safety_rearm: Duration,
    #[serde(deserialize_with = "seconds")]
    pub settings_sync: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            grace_window: Duration::seconds(60),
            final_hour: Duration::hours(1),
            nominal_interval: Duration::hours(6),
            schedule_cooldown: Duration::seconds(5),
            delivery_cooldown: Duration::seconds(60),
            arrival_poll: Duration::seconds(15),
            arrival_window: Duration::seconds(10),
            propagation_delay: Duration::seconds(2),
            settle_delay: Duration::seconds(30),
            health_interval: Duration::seconds(60),
            stuck_grace: Duration::seconds(20),
            safety_rearm: Duration::seconds(30),
            settings_sync: Duration::seconds(60),
        }
    }
}

fn seconds<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = i64::deserialize(deserializer)?;
    Duration::try_seconds(secs)
        .ok_or_else(|| serde::de::Error::custom(format!("{secs}s is out of range")))
}

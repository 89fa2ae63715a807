//! Configuration types for the stream processor
//!
//! Configuration is layered with figment: built-in defaults, then an optional
//! YAML file, then `ADSTREAM_`-prefixed environment variables where `__`
//! separates nested keys (`ADSTREAM_KAFKA__BROKERS=broker:9092`).

use crate::error::{ProcessorError, Result};
use crate::retry::RetryConfig;
use adstream_types::EventKind;
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix of environment variables overriding file configuration
pub const ENV_PREFIX: &str = "ADSTREAM_";

/// Upper bound for window size, lateness and watermark delays (one week)
pub const MAX_TIME_SETTING_MS: u64 = 7 * 24 * 60 * 60 * 1000;

fn check_time_setting(name: &str, value_ms: u64) -> Result<()> {
    if value_ms > MAX_TIME_SETTING_MS {
        return Err(ProcessorError::config(format!(
            "{} must be at most {} ms, got {}",
            name, MAX_TIME_SETTING_MS, value_ms
        )));
    }
    Ok(())
}

/// Milliseconds as a chrono duration, clamped to [`MAX_TIME_SETTING_MS`]
fn millis(value_ms: u64) -> chrono::Duration {
    chrono::Duration::milliseconds(value_ms.min(MAX_TIME_SETTING_MS) as i64)
}

/// Main processor configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProcessorConfig {
    /// Window configuration
    #[serde(default)]
    pub window: WindowConfig,

    /// Watermark configuration
    #[serde(default)]
    pub watermark: WatermarkConfig,

    /// State and checkpoint configuration
    #[serde(default)]
    pub state: StateConfig,

    /// Kafka client configuration
    #[serde(default)]
    pub kafka: KafkaConfig,

    /// Engine loop configuration
    #[serde(default)]
    pub engine: EngineConfig,

    /// Per event type pipeline settings
    #[serde(default)]
    pub pipelines: PipelinesConfig,
}

impl ProcessorConfig {
    /// Load configuration from defaults, an optional YAML file and the environment
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(ProcessorConfig::default()));

        if let Some(path) = config_path {
            if !path.exists() {
                return Err(ProcessorError::config(format!(
                    "configuration file not found: {}",
                    path.display()
                )));
            }
            figment = figment.merge(Yaml::file(path));
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: ProcessorConfig = figment
            .extract()
            .map_err(|e| ProcessorError::Configuration {
                source: Box::new(e),
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.window.validate()?;
        self.watermark.validate()?;
        self.state.validate()?;
        self.kafka.validate()?;
        self.engine.validate()?;
        self.pipelines.validate()?;

        Ok(())
    }
}

/// Tumbling window configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowConfig {
    /// Window size in milliseconds
    #[serde(default = "default_window_size")]
    pub size_ms: u64,

    /// Alignment offset of window boundaries in milliseconds
    #[serde(default)]
    pub offset_ms: i64,

    /// How long after its end a window keeps accepting events (milliseconds)
    #[serde(default)]
    pub allowed_lateness_ms: u64,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            size_ms: default_window_size(),
            offset_ms: 0,
            allowed_lateness_ms: 0,
        }
    }
}

impl WindowConfig {
    /// Create a tumbling window configuration
    pub fn tumbling(size_ms: u64) -> Self {
        Self {
            size_ms,
            ..Default::default()
        }
    }

    /// Validate window configuration
    pub fn validate(&self) -> Result<()> {
        if self.size_ms == 0 {
            return Err(ProcessorError::config(
                "tumbling window size must be greater than 0",
            ));
        }
        check_time_setting("window size_ms", self.size_ms)?;
        check_time_setting("window allowed_lateness_ms", self.allowed_lateness_ms)?;

        if self.offset_ms.unsigned_abs() >= self.size_ms {
            return Err(ProcessorError::config(
                "window offset must be smaller than the window size",
            ));
        }

        Ok(())
    }

    /// Get window size as chrono Duration
    pub fn size(&self) -> chrono::Duration {
        millis(self.size_ms)
    }

    /// Get window offset as chrono Duration
    pub fn offset(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.offset_ms)
    }

    /// Get allowed lateness as chrono Duration
    pub fn allowed_lateness(&self) -> chrono::Duration {
        millis(self.allowed_lateness_ms)
    }
}

/// Watermark configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatermarkConfig {
    /// Maximum out-of-orderness delay (milliseconds)
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Idle partition timeout (milliseconds)
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_ms: u64,

    /// Advance the watermark with processing time once every partition is idle
    #[serde(default = "default_true")]
    pub idle_advance: bool,

    /// Events stamped further than this ahead of processing time are rejected
    /// (milliseconds)
    #[serde(default = "default_max_future_skew")]
    pub max_future_skew_ms: u64,
}

impl Default for WatermarkConfig {
    fn default() -> Self {
        Self {
            max_delay_ms: default_max_delay(),
            idle_timeout_ms: default_idle_timeout(),
            idle_advance: true,
            max_future_skew_ms: default_max_future_skew(),
        }
    }
}

impl WatermarkConfig {
    /// Validate watermark configuration
    pub fn validate(&self) -> Result<()> {
        if self.idle_timeout_ms == 0 {
            return Err(ProcessorError::config(
                "watermark idle_timeout_ms must be greater than 0",
            ));
        }
        check_time_setting("watermark max_delay_ms", self.max_delay_ms)?;
        check_time_setting("watermark idle_timeout_ms", self.idle_timeout_ms)?;
        check_time_setting("watermark max_future_skew_ms", self.max_future_skew_ms)?;

        Ok(())
    }

    /// Get max delay as Duration
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Get idle timeout as Duration
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Get max future skew as chrono Duration
    pub fn max_future_skew(&self) -> chrono::Duration {
        millis(self.max_future_skew_ms)
    }
}

/// State and checkpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    /// Where checkpoints are kept
    #[serde(default)]
    pub backend: StateBackend,

    /// Checkpoint root directory (for the file system backend)
    #[serde(default = "default_storage_path")]
    pub storage_path: Option<PathBuf>,

    /// Checkpoint interval (milliseconds)
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval_ms: u64,

    /// Number of checkpoints to retain per pipeline
    #[serde(default = "default_checkpoint_retention")]
    pub checkpoint_retention: usize,

    /// Number of key-hash shards of the window state store
    #[serde(default = "default_shards")]
    pub shards: usize,

    /// Retry policy for checkpoint writes
    #[serde(default = "RetryConfig::checkpoint_default")]
    pub retry: RetryConfig,
}

/// Checkpoint backend type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StateBackend {
    /// In-memory checkpoints (not fault-tolerant)
    Memory,
    /// Checkpoint files on a local or mounted file system
    #[default]
    FileSystem,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            backend: StateBackend::FileSystem,
            storage_path: default_storage_path(),
            checkpoint_interval_ms: default_checkpoint_interval(),
            checkpoint_retention: default_checkpoint_retention(),
            shards: default_shards(),
            retry: RetryConfig::checkpoint_default(),
        }
    }
}

impl StateConfig {
    /// Validate state configuration
    pub fn validate(&self) -> Result<()> {
        if self.checkpoint_interval_ms == 0 {
            return Err(ProcessorError::config(
                "checkpoint_interval_ms must be greater than 0",
            ));
        }

        if self.checkpoint_retention == 0 {
            return Err(ProcessorError::config(
                "checkpoint_retention must be greater than 0",
            ));
        }

        if self.shards == 0 {
            return Err(ProcessorError::config("state shards must be greater than 0"));
        }

        if matches!(self.backend, StateBackend::FileSystem) && self.storage_path.is_none() {
            return Err(ProcessorError::config(
                "file system state backend requires storage_path",
            ));
        }

        self.retry.validate("state.retry")
    }

    /// Get checkpoint interval as Duration
    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_millis(self.checkpoint_interval_ms)
    }
}

/// Kafka client configuration shared by all pipelines
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    /// Comma separated broker list
    #[serde(default = "default_brokers")]
    pub brokers: String,

    /// Consumer group id
    #[serde(default = "default_group_id")]
    pub group_id: String,

    /// Offset reset policy when neither a checkpoint nor a committed offset exists
    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,

    /// Consumer session timeout (milliseconds)
    #[serde(default = "default_session_timeout")]
    pub session_timeout_ms: u64,

    /// Maximum wait of a single source poll (milliseconds)
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_ms: u64,

    /// Timeout of topic metadata requests (milliseconds)
    #[serde(default = "default_metadata_timeout")]
    pub metadata_timeout_ms: u64,

    /// Producer delivery timeout for one send (milliseconds)
    #[serde(default = "default_send_timeout")]
    pub send_timeout_ms: u64,

    /// Producer acknowledgement level
    #[serde(default = "default_acks")]
    pub acks: String,

    /// Producer compression codec
    #[serde(default = "default_compression")]
    pub compression_type: String,

    /// Extra librdkafka properties applied to consumers and producers
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: default_brokers(),
            group_id: default_group_id(),
            auto_offset_reset: default_auto_offset_reset(),
            session_timeout_ms: default_session_timeout(),
            poll_timeout_ms: default_poll_timeout(),
            metadata_timeout_ms: default_metadata_timeout(),
            send_timeout_ms: default_send_timeout(),
            acks: default_acks(),
            compression_type: default_compression(),
            properties: HashMap::new(),
        }
    }
}

impl KafkaConfig {
    /// Validate Kafka configuration
    pub fn validate(&self) -> Result<()> {
        if self.brokers.trim().is_empty() {
            return Err(ProcessorError::config("kafka brokers must not be empty"));
        }

        if self.group_id.trim().is_empty() {
            return Err(ProcessorError::config("kafka group_id must not be empty"));
        }

        if !matches!(
            self.auto_offset_reset.as_str(),
            "earliest" | "latest" | "error"
        ) {
            return Err(ProcessorError::config(format!(
                "invalid auto_offset_reset '{}', expected earliest, latest or error",
                self.auto_offset_reset
            )));
        }

        if self.poll_timeout_ms == 0 || self.send_timeout_ms == 0 {
            return Err(ProcessorError::config(
                "kafka poll and send timeouts must be greater than 0",
            ));
        }

        Ok(())
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_millis(self.metadata_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

/// Engine loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Interval of the window firing clock (milliseconds)
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,

    /// Capacity of the record channel between source reader and engine
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Upper bound on decompressed payload size in bytes
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,

    /// Retry policy for sink deliveries
    #[serde(default = "RetryConfig::sink_default")]
    pub sink_retry: RetryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval(),
            buffer_size: default_buffer_size(),
            max_payload_bytes: default_max_payload_bytes(),
            sink_retry: RetryConfig::sink_default(),
        }
    }
}

impl EngineConfig {
    /// Validate engine configuration
    pub fn validate(&self) -> Result<()> {
        if self.tick_interval_ms == 0 {
            return Err(ProcessorError::config(
                "tick_interval_ms must be greater than 0",
            ));
        }

        if self.buffer_size == 0 {
            return Err(ProcessorError::config("buffer_size must be greater than 0"));
        }

        if self.max_payload_bytes == 0 {
            return Err(ProcessorError::config(
                "max_payload_bytes must be greater than 0",
            ));
        }

        self.sink_retry.validate("engine.sink_retry")
    }

    /// Get tick interval as Duration
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

/// Topics and switch of one pipeline
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelineConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub source_topic: String,
    pub sink_topic: String,
}

impl PipelineConfig {
    /// Default topics of the given event kind
    pub fn for_kind(kind: EventKind) -> Self {
        Self {
            enabled: true,
            source_topic: kind.default_source_topic().to_string(),
            sink_topic: kind.default_sink_topic().to_string(),
        }
    }
}

/// Settings of the five pipelines
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelinesConfig {
    #[serde(default = "default_bid_requests")]
    pub bid_requests: PipelineConfig,
    #[serde(default = "default_bid_responses")]
    pub bid_responses: PipelineConfig,
    #[serde(default = "default_wins")]
    pub wins: PipelineConfig,
    #[serde(default = "default_impressions")]
    pub impressions: PipelineConfig,
    #[serde(default = "default_clicks")]
    pub clicks: PipelineConfig,
}

impl Default for PipelinesConfig {
    fn default() -> Self {
        Self {
            bid_requests: default_bid_requests(),
            bid_responses: default_bid_responses(),
            wins: default_wins(),
            impressions: default_impressions(),
            clicks: default_clicks(),
        }
    }
}

impl PipelinesConfig {
    /// Settings of the pipeline for `kind`
    pub fn get(&self, kind: EventKind) -> &PipelineConfig {
        match kind {
            EventKind::BidRequest => &self.bid_requests,
            EventKind::BidResponse => &self.bid_responses,
            EventKind::WinNotification => &self.wins,
            EventKind::Impression => &self.impressions,
            EventKind::Click => &self.clicks,
        }
    }

    /// Event kinds whose pipeline is enabled
    pub fn enabled(&self) -> Vec<EventKind> {
        EventKind::ALL
            .into_iter()
            .filter(|kind| self.get(*kind).enabled)
            .collect()
    }

    /// Validate pipeline settings
    pub fn validate(&self) -> Result<()> {
        let mut sinks = std::collections::HashSet::new();

        for kind in EventKind::ALL {
            let pipeline = self.get(kind);
            if pipeline.source_topic.is_empty() || pipeline.sink_topic.is_empty() {
                return Err(ProcessorError::config(format!(
                    "pipeline {} requires source_topic and sink_topic",
                    kind
                )));
            }
            if pipeline.source_topic == pipeline.sink_topic {
                return Err(ProcessorError::config(format!(
                    "pipeline {} reads and writes the same topic '{}'",
                    kind, pipeline.source_topic
                )));
            }
            if pipeline.enabled && !sinks.insert(pipeline.sink_topic.as_str()) {
                return Err(ProcessorError::config(format!(
                    "sink topic '{}' is used by more than one pipeline",
                    pipeline.sink_topic
                )));
            }
        }

        Ok(())
    }
}

fn default_window_size() -> u64 {
    60_000 // 1 minute
}

fn default_max_delay() -> u64 {
    5_000
}

fn default_idle_timeout() -> u64 {
    60_000
}

fn default_max_future_skew() -> u64 {
    600_000
}

fn default_storage_path() -> Option<PathBuf> {
    Some(PathBuf::from("/data/adstream/checkpoints"))
}

fn default_checkpoint_interval() -> u64 {
    30_000
}

fn default_checkpoint_retention() -> usize {
    3
}

fn default_shards() -> usize {
    8
}

fn default_brokers() -> String {
    "localhost:9092".to_string()
}

fn default_group_id() -> String {
    "adstream-aggregator".to_string()
}

fn default_auto_offset_reset() -> String {
    "earliest".to_string()
}

fn default_session_timeout() -> u64 {
    30_000
}

fn default_poll_timeout() -> u64 {
    100
}

fn default_metadata_timeout() -> u64 {
    10_000
}

fn default_send_timeout() -> u64 {
    5_000
}

fn default_acks() -> String {
    "all".to_string()
}

fn default_compression() -> String {
    "lz4".to_string()
}

fn default_tick_interval() -> u64 {
    1_000
}

fn default_buffer_size() -> usize {
    10_000
}

fn default_max_payload_bytes() -> usize {
    4 * 1024 * 1024
}

fn default_true() -> bool {
    true
}

fn default_bid_requests() -> PipelineConfig {
    PipelineConfig::for_kind(EventKind::BidRequest)
}

fn default_bid_responses() -> PipelineConfig {
    PipelineConfig::for_kind(EventKind::BidResponse)
}

fn default_wins() -> PipelineConfig {
    PipelineConfig::for_kind(EventKind::WinNotification)
}

fn default_impressions() -> PipelineConfig {
    PipelineConfig::for_kind(EventKind::Impression)
}

fn default_clicks() -> PipelineConfig {
    PipelineConfig::for_kind(EventKind::Click)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ProcessorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.window.size_ms, 60_000);
        assert_eq!(config.pipelines.enabled().len(), 5);
    }

    #[test]
    fn test_tumbling_window_config() {
        let config = WindowConfig::tumbling(10_000);
        assert_eq!(config.size(), chrono::Duration::seconds(10));
        assert!(config.validate().is_ok());

        assert!(WindowConfig::tumbling(0).validate().is_err());

        let mut offset = WindowConfig::tumbling(10_000);
        offset.offset_ms = 10_000;
        assert!(offset.validate().is_err());
    }

    #[test]
    fn test_window_config_rejects_out_of_range_durations() {
        assert!(WindowConfig::tumbling(u64::MAX).validate().is_err());
        assert!(WindowConfig::tumbling(MAX_TIME_SETTING_MS + 1).validate().is_err());
        assert!(WindowConfig::tumbling(MAX_TIME_SETTING_MS).validate().is_ok());

        let mut lateness = WindowConfig::tumbling(60_000);
        lateness.allowed_lateness_ms = u64::MAX;
        assert!(lateness.validate().is_err());
        assert!(lateness.allowed_lateness() >= chrono::Duration::zero());

        let huge = WindowConfig::tumbling(u64::MAX);
        assert!(huge.size() > chrono::Duration::zero());
    }

    #[test]
    fn test_watermark_config_bounds() {
        let config = WatermarkConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_future_skew(), chrono::Duration::minutes(10));

        let skew = WatermarkConfig {
            max_future_skew_ms: u64::MAX,
            ..Default::default()
        };
        assert!(skew.validate().is_err());

        let delay = WatermarkConfig {
            max_delay_ms: MAX_TIME_SETTING_MS + 1,
            ..Default::default()
        };
        assert!(delay.validate().is_err());
    }

    #[test]
    fn test_state_config_validation() {
        let config = StateConfig::default();
        assert!(config.validate().is_ok());

        let mut fs_config = config.clone();
        fs_config.storage_path = None;
        assert!(fs_config.validate().is_err());

        fs_config.backend = StateBackend::Memory;
        assert!(fs_config.validate().is_ok());

        fs_config.shards = 0;
        assert!(fs_config.validate().is_err());
    }

    #[test]
    fn test_kafka_config_validation() {
        let mut config = KafkaConfig::default();
        assert!(config.validate().is_ok());

        config.auto_offset_reset = "smallest-ish".to_string();
        assert!(config.validate().is_err());

        let mut config = KafkaConfig::default();
        config.brokers = " ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_pipeline_topics() {
        let config = PipelinesConfig::default();
        assert_eq!(config.get(EventKind::WinNotification).source_topic, "wins");
        assert_eq!(
            config.get(EventKind::Click).sink_topic,
            "aggregated-clicks"
        );

        let mut clash = PipelinesConfig::default();
        clash.clicks.sink_topic = "aggregated-wins".to_string();
        assert!(clash.validate().is_err());

        clash.clicks.enabled = false;
        assert!(clash.validate().is_ok());
        assert_eq!(clash.enabled().len(), 4);
    }

    #[test]
    fn test_load_from_yaml_file() {
        let dir = std::env::temp_dir().join(format!("config_test_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("adstream.yaml");
        std::fs::write(
            &path,
            "window:\n  size_ms: 30000\n  allowed_lateness_ms: 2000\nkafka:\n  group_id: test-group\npipelines:\n  clicks:\n    enabled: false\n    source_topic: clicks\n    sink_topic: aggregated-clicks\n",
        )
        .unwrap();

        let config = ProcessorConfig::load(Some(&path)).unwrap();
        assert_eq!(config.window.size_ms, 30_000);
        assert_eq!(config.window.allowed_lateness_ms, 2_000);
        assert_eq!(config.kafka.group_id, "test-group");
        assert_eq!(config.kafka.brokers, "localhost:9092");
        assert!(!config.pipelines.clicks.enabled);
        assert!(config.pipelines.wins.enabled);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let dir = std::env::temp_dir().join(format!("config_test_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("adstream.yaml");
        std::fs::write(&path, "window:\n  size_ms: 0\n").unwrap();

        let err = ProcessorConfig::load(Some(&path)).unwrap_err();
        assert!(err.is_fatal());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_load_missing_file() {
        let path = std::env::temp_dir().join(format!("missing_{}.yaml", uuid::Uuid::new_v4()));
        assert!(ProcessorConfig::load(Some(&path)).is_err());
    }
}

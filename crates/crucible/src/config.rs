//! Configuration file support (`crucible.toml`) and environment overrides.
//!
//! Every knob has a compiled-in default; a config file overrides defaults and
//! `CRUCIBLE_*` environment variables override the file. Nothing else in the
//! crate reads the environment.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crucible_retry::{PerKindConfig, RetryStrategyConfig};
use crucible_types::{deserialize_duration, serialize_duration};

pub const CONFIG_FILE: &str = "crucible.toml";

/// Credentials for the external competition API.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExternalApiConfig {
    /// Base URL of the competition API.
    #[serde(default)]
    pub endpoint: String,
    /// Basic-auth key id.
    #[serde(default)]
    pub key_id: String,
    /// Basic-auth key token.
    #[serde(default)]
    pub key_token: String,
}

/// Preshared key pair for verifying inbound task payload signatures.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct InboundAuthConfig {
    #[serde(default)]
    pub key_id: String,
    #[serde(default)]
    pub key_token: String,
}

/// Concurrency caps and queue bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// High-water mark for crash and seed queues.
    #[serde(default = "default_queue_high_water")]
    pub queue_high_water: usize,
    /// Concurrent builds per dispatcher process.
    #[serde(default = "default_builder_concurrency")]
    pub builder_concurrency: usize,
    /// Scheduler shard count; a task belongs to `hash(task_id) % shards`.
    #[serde(default = "default_scheduler_shards")]
    pub scheduler_shards: u64,
    /// Outbound competition API requests per second, per task.
    #[serde(default = "default_qps_per_task")]
    pub submitter_qps_per_task: u32,
    /// Outbound competition API requests per second across the whole fleet.
    #[serde(default = "default_qps_global")]
    pub submitter_qps_global: u32,
    /// Lines of subprocess output kept as evidence.
    #[serde(default = "default_output_lines")]
    pub output_lines: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            queue_high_water: default_queue_high_water(),
            builder_concurrency: default_builder_concurrency(),
            scheduler_shards: default_scheduler_shards(),
            submitter_qps_per_task: default_qps_per_task(),
            submitter_qps_global: default_qps_global(),
            output_lines: default_output_lines(),
        }
    }
}

/// All core timers, with the defaults the rest of the crate assumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimersConfig {
    /// Scheduler tick interval.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        default = "default_scheduler_tick"
    )]
    pub scheduler_tick: Duration,
    /// Queue reservation visibility timeout.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        default = "default_visibility_timeout"
    )]
    pub visibility_timeout: Duration,
    /// Stop issuing new patch requests inside this window before the deadline.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        default = "default_freeze_window"
    )]
    pub freeze_window: Duration,
    /// Force-stop all submissions inside this window before the deadline.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        default = "default_hard_stop_window"
    )]
    pub hard_stop_window: Duration,
    /// Grace between SIGTERM and SIGKILL for child processes.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        default = "default_subprocess_grace"
    )]
    pub subprocess_grace: Duration,
    /// Window after terminal + deadline within which GC must finish.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        default = "default_gc_grace"
    )]
    pub gc_grace: Duration,
    /// How long a worker blocks on an empty queue per loop iteration.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        default = "default_reserve_block"
    )]
    pub reserve_block: Duration,
    /// Per-build timeout for the external build tool.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        default = "default_build_timeout"
    )]
    pub build_timeout: Duration,
    /// Per-request timeout for source downloads.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        default = "default_download_timeout"
    )]
    pub download_timeout: Duration,
}

impl Default for TimersConfig {
    fn default() -> Self {
        Self {
            scheduler_tick: default_scheduler_tick(),
            visibility_timeout: default_visibility_timeout(),
            freeze_window: default_freeze_window(),
            hard_stop_window: default_hard_stop_window(),
            subprocess_grace: default_subprocess_grace(),
            gc_grace: default_gc_grace(),
            reserve_block: default_reserve_block(),
            build_timeout: default_build_timeout(),
            download_timeout: default_download_timeout(),
        }
    }
}

/// External build tool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuilderConfig {
    /// Build tool binary, resolved via PATH unless absolute.
    #[serde(default = "default_build_tool")]
    pub tool: String,
    /// Default fuzzing engine for builds that do not name one.
    #[serde(default = "default_engine")]
    pub default_engine: String,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            tool: default_build_tool(),
            default_engine: default_engine(),
        }
    }
}

/// Retry tuning: a default strategy plus per-failure-kind overrides.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RetrySection {
    #[serde(default)]
    pub default: RetryStrategyConfig,
    #[serde(default)]
    pub per_kind: PerKindConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrucibleConfig {
    /// KV/queue store address: `memory:` or `file:<path>`.
    #[serde(default = "default_kv_endpoint")]
    pub kv_endpoint: String,
    /// Shared filesystem base for sources, builds, corpora, and crashes.
    #[serde(default = "default_scratch_root")]
    pub scratch_root: PathBuf,
    /// Base URL of the LLM proxy; used by external worker fleets only.
    #[serde(default)]
    pub llm_proxy_endpoint: Option<String>,
    #[serde(default)]
    pub external_api: ExternalApiConfig,
    #[serde(default)]
    pub inbound_auth: Option<InboundAuthConfig>,
    /// Log filter, e.g. `info` or `crucible=debug`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub telemetry_endpoint: Option<String>,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub timers: TimersConfig,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub builder: BuilderConfig,
}

impl Default for CrucibleConfig {
    fn default() -> Self {
        Self {
            kv_endpoint: default_kv_endpoint(),
            scratch_root: default_scratch_root(),
            llm_proxy_endpoint: None,
            external_api: ExternalApiConfig::default(),
            inbound_auth: None,
            log_level: default_log_level(),
            telemetry_endpoint: None,
            limits: LimitsConfig::default(),
            timers: TimersConfig::default(),
            retry: RetrySection::default(),
            builder: BuilderConfig::default(),
        }
    }
}

fn default_kv_endpoint() -> String {
    "memory:".to_string()
}

fn default_scratch_root() -> PathBuf {
    PathBuf::from("/crucible-scratch")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_queue_high_water() -> usize {
    10_000
}

fn default_builder_concurrency() -> usize {
    4
}

fn default_scheduler_shards() -> u64 {
    4
}

fn default_qps_per_task() -> u32 {
    5
}

fn default_qps_global() -> u32 {
    50
}

fn default_output_lines() -> usize {
    50
}

fn default_scheduler_tick() -> Duration {
    Duration::from_secs(5)
}

fn default_visibility_timeout() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_freeze_window() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_hard_stop_window() -> Duration {
    Duration::from_secs(60)
}

fn default_subprocess_grace() -> Duration {
    Duration::from_secs(10)
}

fn default_gc_grace() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_reserve_block() -> Duration {
    Duration::from_millis(500)
}

fn default_build_timeout() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_download_timeout() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_build_tool() -> String {
    "oss-fuzz-build".to_string()
}

fn default_engine() -> String {
    "libfuzzer".to_string()
}

impl CrucibleConfig {
    /// Load configuration: defaults, then the config file (if present), then
    /// `CRUCIBLE_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default_path = Path::new(CONFIG_FILE);
                if default_path.exists() {
                    Self::from_file(default_path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env();
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    fn apply_env(&mut self) {
        if let Ok(v) = env::var("CRUCIBLE_KV_ENDPOINT") {
            self.kv_endpoint = v;
        }
        if let Ok(v) = env::var("CRUCIBLE_SCRATCH_ROOT") {
            self.scratch_root = PathBuf::from(v);
        }
        if let Ok(v) = env::var("CRUCIBLE_LLM_PROXY_ENDPOINT") {
            self.llm_proxy_endpoint = Some(v);
        }
        if let Ok(v) = env::var("CRUCIBLE_EXTERNAL_API_ENDPOINT") {
            self.external_api.endpoint = v;
        }
        if let Ok(v) = env::var("CRUCIBLE_EXTERNAL_API_KEY_ID") {
            self.external_api.key_id = v;
        }
        if let Ok(v) = env::var("CRUCIBLE_EXTERNAL_API_KEY_TOKEN") {
            self.external_api.key_token = v;
        }
        if let Ok(v) = env::var("CRUCIBLE_LOG_LEVEL") {
            self.log_level = v;
        }
        if let Ok(v) = env::var("CRUCIBLE_TELEMETRY_ENDPOINT") {
            self.telemetry_endpoint = Some(v);
        }
    }
}

//! Configuration system for telcorr
//!
//! Provides:
//! - Config file discovery (CLI flag, env var, standard paths)
//! - TOML parsing with serde
//! - Environment variable overrides
//! - Validation of window, queue, breaker, retry and scoring settings

use crate::events::KeyKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Complete engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub engine: EngineSettings,
    pub window: WindowSettings,
    pub ingest: IngestSettings,
    pub correlation: CorrelationSettings,
    pub state: StateSettings,
    pub breaker: BreakerSettings,
    pub retry: RetrySettings,
    pub export: ExportSettings,
    pub dlq: DlqSettings,
    pub index: IndexSettings,
}

/// Engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Log level: trace, debug, info, warn, error
    pub log_level: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Correlation window settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowSettings {
    /// Window duration in seconds
    pub duration_secs: u64,
}

impl Default for WindowSettings {
    fn default() -> Self {
        Self { duration_secs: 60 }
    }
}

impl WindowSettings {
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }
}

/// Ingestion queue settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestSettings {
    /// Capacity of each queue, in batches
    pub queue_capacity: usize,

    /// Enqueue attempts against a full queue before the batch is dropped
    pub enqueue_max_attempts: u32,

    /// Base backoff between enqueue attempts (doubles each attempt)
    pub enqueue_backoff_ms: u64,

    /// Maximum batches drained from each queue per tick
    pub per_tick_cap: usize,

    /// Maximum wait for the first batch of a tick
    pub tick_timeout_ms: u64,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            enqueue_max_attempts: 5,
            enqueue_backoff_ms: 10,
            per_tick_cap: 64,
            tick_timeout_ms: 100,
        }
    }
}

/// Maps a record attribute to a business key kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyRule {
    /// Attribute name to read from the raw record
    pub attribute: String,

    /// Kind of key the attribute yields
    pub kind: KeyKind,
}

impl KeyRule {
    pub fn new(attribute: impl Into<String>, kind: KeyKind) -> Self {
        Self {
            attribute: attribute.into(),
            kind,
        }
    }
}

/// Scoring weights for inferred relationships
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    pub trace_id: f64,
    pub span_id: f64,
    pub resource_id: f64,
    pub circuit_id: f64,
    pub product_id: f64,

    /// Maximum temporal-proximity bonus
    pub temporal: f64,

    /// Bonus when the parent declares the child's service as downstream
    pub downstream_service: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            trace_id: 1.0,
            span_id: 1.0,
            resource_id: 0.6,
            circuit_id: 0.5,
            product_id: 0.4,
            temporal: 0.5,
            downstream_service: 0.5,
        }
    }
}

impl ScoringWeights {
    /// Weight of an exact identifier match of the given kind
    pub fn for_kind(&self, kind: KeyKind) -> f64 {
        match kind {
            KeyKind::TraceId => self.trace_id,
            KeyKind::SpanId => self.span_id,
            KeyKind::ResourceId => self.resource_id,
            KeyKind::CircuitId => self.circuit_id,
            KeyKind::ProductId => self.product_id,
            KeyKind::Unkeyed => 0.0,
        }
    }

    fn all(&self) -> [f64; 7] {
        [
            self.trace_id,
            self.span_id,
            self.resource_id,
            self.circuit_id,
            self.product_id,
            self.temporal,
            self.downstream_service,
        ]
    }
}

/// Correlation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationSettings {
    /// Business-identifier rules, in priority order
    pub key_rules: Vec<KeyRule>,

    pub weights: ScoringWeights,

    /// Minimum normalized score to accept an inferred parent (inclusive)
    pub confidence_threshold: f64,

    /// Temporal bonus decays to zero at this distance
    pub max_lookback_ms: u64,
}

impl Default for CorrelationSettings {
    fn default() -> Self {
        Self {
            key_rules: vec![
                KeyRule::new("resource_id", KeyKind::ResourceId),
                KeyRule::new("circuit_id", KeyKind::CircuitId),
                KeyRule::new("product_id", KeyKind::ProductId),
            ],
            weights: ScoringWeights::default(),
            confidence_threshold: 0.5,
            max_lookback_ms: 10_000,
        }
    }
}

/// State manager settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateSettings {
    /// Backend: memory, sqlite
    pub backend: String,

    /// Database path (sqlite backend)
    pub path: Option<String>,

    /// TTL of correlation state entries
    pub ttl_secs: u64,
}

impl Default for StateSettings {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            path: None,
            ttl_secs: 900,
        }
    }
}

/// Per-sink circuit breaker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    /// Consecutive failures that open the breaker
    pub failure_threshold: u32,

    /// Time after the last failure before a trial call is admitted
    pub recovery_timeout_ms: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: 30_000,
        }
    }
}

/// Retry settings for sink calls
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Total attempts per permitted call
    pub max_attempts: u32,

    /// Delay after the first failed attempt (doubles each attempt)
    pub initial_delay_ms: u64,

    /// Upper bound on a single delay
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 100,
            max_delay_ms: 30_000,
        }
    }
}

/// Export settings container
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportSettings {
    /// Timeout of a single sink call
    pub call_timeout_ms: u64,

    /// How long shutdown waits for pending exports
    pub shutdown_grace_ms: u64,

    pub jsonl: JsonlExportConfig,
    pub webhook: WebhookExportConfig,
    pub audit: AuditExportConfig,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            call_timeout_ms: 5_000,
            shutdown_grace_ms: 10_000,
            jsonl: JsonlExportConfig::default(),
            webhook: WebhookExportConfig::default(),
            audit: AuditExportConfig::default(),
        }
    }
}

/// JSONL export configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JsonlExportConfig {
    pub enabled: bool,

    /// Output file path
    pub path: String,

    /// Append to existing file
    pub append: bool,

    /// Flush after each window
    pub flush_each: bool,
}

impl Default for JsonlExportConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: "/var/lib/telcorr/summaries.jsonl".to_string(),
            append: true,
            flush_each: true,
        }
    }
}

/// Webhook export configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookExportConfig {
    pub enabled: bool,

    /// Webhook endpoint URL
    pub url: String,

    /// HTTP method: POST, PUT, PATCH
    pub method: String,

    /// Custom headers
    pub headers: HashMap<String, String>,

    /// API key (sent in `api_key_header`)
    pub api_key: Option<String>,
    pub api_key_header: String,

    /// Bearer token
    pub bearer_token: Option<String>,

    /// Accept gzip-compressed responses; request bodies are sent uncompressed
    pub compression: bool,
}

impl Default for WebhookExportConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "http://localhost:8080/summaries".to_string(),
            method: "POST".to_string(),
            headers: HashMap::new(),
            api_key: None,
            api_key_header: "X-API-Key".to_string(),
            bearer_token: None,
            compression: true,
        }
    }
}

/// Audit log export configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditExportConfig {
    /// Emit every summary as a structured log line
    pub enabled: bool,
}

impl Default for AuditExportConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Dead letter queue settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DlqSettings {
    /// Backend: memory, sqlite
    pub backend: String,

    /// Database path (sqlite backend)
    pub path: Option<String>,

    /// Maximum held items; the oldest are evicted beyond this
    pub capacity: usize,
}

impl Default for DlqSettings {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            path: None,
            capacity: 10_000,
        }
    }
}

/// Summary index settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexSettings {
    /// Maximum indexed summaries
    pub max_entries: usize,

    /// Maximum age of an indexed summary
    pub max_age_secs: u64,

    /// Width of the time-bucket index
    pub bucket_secs: u64,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            max_entries: 100_000,
            max_age_secs: 86_400,
            bucket_secs: 300,
        }
    }
}

/// Configuration loader
pub struct ConfigLoader {
    /// Path to config file (if specified via CLI)
    cli_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new config loader
    pub fn new() -> Self {
        Self { cli_path: None }
    }

    /// Set the config path from CLI argument
    pub fn with_cli_path(mut self, path: Option<PathBuf>) -> Self {
        self.cli_path = path;
        self
    }

    /// Load configuration with the following precedence:
    /// 1. CLI --config flag
    /// 2. TELCORR_CONFIG environment variable
    /// 3. ~/.config/telcorr/config.toml
    /// 4. /etc/telcorr/config.toml
    /// 5. Default values
    pub fn load(&self) -> ConfigResult<EngineConfig> {
        let config_path = self.find_config_file();

        let mut config = if let Some(path) = config_path {
            info!("Loading configuration from: {}", path.display());
            self.load_from_file(&path)?
        } else {
            debug!("No config file found, using defaults");
            EngineConfig::default()
        };

        self.apply_env_overrides(&mut config);
        self.validate(&config)?;

        Ok(config)
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.cli_path {
            if path.exists() {
                return Some(path.clone());
            }
            warn!("CLI config path does not exist: {}", path.display());
        }

        if let Ok(env_path) = std::env::var("TELCORR_CONFIG") {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Some(path);
            }
            warn!("TELCORR_CONFIG path does not exist: {}", env_path);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let path = config_dir.join("telcorr").join("config.toml");
            if path.exists() {
                return Some(path);
            }
        }

        #[cfg(unix)]
        {
            let path = PathBuf::from("/etc/telcorr/config.toml");
            if path.exists() {
                return Some(path);
            }
        }

        None
    }

    /// Load configuration from a TOML file
    pub fn load_from_file(&self, path: &Path) -> ConfigResult<EngineConfig> {
        let content = std::fs::read_to_string(path)?;
        let config: EngineConfig = toml::from_str(&content)?;
        Ok(config)
    }

    fn apply_env_overrides(&self, config: &mut EngineConfig) {
        if let Ok(val) = std::env::var("TELCORR_LOG_LEVEL") {
            config.engine.log_level = val;
        }

        if let Ok(val) = std::env::var("TELCORR_WINDOW_SECS") {
            if let Ok(secs) = val.parse() {
                config.window.duration_secs = secs;
            }
        }
        if let Ok(val) = std::env::var("TELCORR_QUEUE_CAPACITY") {
            if let Ok(capacity) = val.parse() {
                config.ingest.queue_capacity = capacity;
            }
        }
        if let Ok(val) = std::env::var("TELCORR_CONFIDENCE_THRESHOLD") {
            if let Ok(threshold) = val.parse() {
                config.correlation.confidence_threshold = threshold;
            }
        }

        if let Ok(val) = std::env::var("TELCORR_STATE_BACKEND") {
            config.state.backend = val;
        }
        if let Ok(val) = std::env::var("TELCORR_STATE_PATH") {
            config.state.path = Some(val);
        }

        if let Ok(val) = std::env::var("TELCORR_DLQ_PATH") {
            config.dlq.path = Some(val);
            config.dlq.backend = "sqlite".to_string();
        }

        if let Ok(val) = std::env::var("TELCORR_JSONL_PATH") {
            config.export.jsonl.path = val;
            config.export.jsonl.enabled = true;
        }
        if let Ok(val) = std::env::var("TELCORR_WEBHOOK_URL") {
            config.export.webhook.url = val;
            config.export.webhook.enabled = true;
        }
    }

    /// Validate configuration
    pub fn validate(&self, config: &EngineConfig) -> ConfigResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&config.engine.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level: {}. Must be one of: {:?}",
                config.engine.log_level, valid_levels
            )));
        }

        if config.window.duration_secs == 0 {
            return Err(ConfigError::ValidationError(
                "Window duration cannot be 0".to_string(),
            ));
        }

        if config.ingest.queue_capacity == 0 || config.ingest.per_tick_cap == 0 {
            return Err(ConfigError::ValidationError(
                "Queue capacity and per-tick cap must be positive".to_string(),
            ));
        }

        let threshold = config.correlation.confidence_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ConfigError::ValidationError(format!(
                "Confidence threshold must be within [0, 1], got {}",
                threshold
            )));
        }
        if config
            .correlation
            .weights
            .all()
            .iter()
            .any(|w| !w.is_finite() || *w < 0.0)
        {
            return Err(ConfigError::ValidationError(
                "Scoring weights must be finite and non-negative".to_string(),
            ));
        }
        if let Some(rule) = config
            .correlation
            .key_rules
            .iter()
            .find(|r| !r.kind.is_business())
        {
            return Err(ConfigError::ValidationError(format!(
                "Key rule for '{}' must map to a business key kind, got {}",
                rule.attribute, rule.kind
            )));
        }

        for (section, backend, path) in [
            ("state", &config.state.backend, &config.state.path),
            ("dlq", &config.dlq.backend, &config.dlq.path),
        ] {
            match backend.to_lowercase().as_str() {
                "memory" => {}
                "sqlite" if path.is_some() => {}
                "sqlite" => {
                    return Err(ConfigError::ValidationError(format!(
                        "[{}] sqlite backend requires a path",
                        section
                    )))
                }
                other => {
                    return Err(ConfigError::ValidationError(format!(
                        "[{}] unknown backend: {}. Must be one of: memory, sqlite",
                        section, other
                    )))
                }
            }
        }

        if config.breaker.failure_threshold == 0 {
            return Err(ConfigError::ValidationError(
                "Breaker failure threshold must be at least 1".to_string(),
            ));
        }
        if config.retry.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "Retry max_attempts must be at least 1".to_string(),
            ));
        }

        if config.export.webhook.enabled {
            let valid_methods = ["POST", "PUT", "PATCH"];
            if !valid_methods.contains(&config.export.webhook.method.to_uppercase().as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid webhook method: {}. Must be one of: {:?}",
                    config.export.webhook.method, valid_methods
                )));
            }
        }

        if config.index.bucket_secs == 0 {
            return Err(ConfigError::ValidationError(
                "Index bucket width cannot be 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Save configuration to a file
    pub fn save(&self, config: &EngineConfig, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(config).map_err(|e| {
            ConfigError::ValidationError(format!("Failed to serialize config: {}", e))
        })?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, content)?;
        info!("Configuration saved to: {}", path.display());
        Ok(())
    }

    /// Get the default config file path for the current platform
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("telcorr").join("config.toml"))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Helper module for platform-specific directories
mod dirs {
    use std::path::PathBuf;

    /// Get the user's config directory
    pub fn config_dir() -> Option<PathBuf> {
        #[cfg(target_os = "macos")]
        {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join(".config"))
        }

        #[cfg(target_os = "linux")]
        {
            std::env::var("XDG_CONFIG_HOME")
                .ok()
                .map(PathBuf::from)
                .or_else(|| {
                    std::env::var("HOME")
                        .ok()
                        .map(|h| PathBuf::from(h).join(".config"))
                })
        }

        #[cfg(target_os = "windows")]
        {
            std::env::var("APPDATA").ok().map(PathBuf::from)
        }

        #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
        {
            None
        }
    }
}

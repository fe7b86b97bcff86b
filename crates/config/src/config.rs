//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Sizing of the three bounded execution queues
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QueueConfig {
    /// Number of logical cores (auto-detected if None)
    pub logical_cores: Option<u32>,
    /// Number of hardware media encoder units (1 if None)
    pub media_engines: Option<u32>,
    /// Concurrent image transforms (0 = auto-derive)
    #[serde(default)]
    pub image_workers: u32,
    /// Concurrent video transforms (0 = auto-derive)
    #[serde(default)]
    pub video_workers: u32,
    /// Concurrent PDF transforms (0 = auto-derive)
    #[serde(default)]
    pub pdf_workers: u32,
}

/// External process supervision settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunnerConfig {
    /// Attempts per tool invocation before giving up (default 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Wall-clock limit for a single attempt in seconds (0 disables)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Whether a timed-out attempt counts towards a retry
    #[serde(default)]
    pub retry_on_timeout: bool,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_timeout_secs() -> u64 {
    1800
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            timeout_secs: default_timeout_secs(),
            retry_on_timeout: false,
        }
    }
}

/// Debounce windows applied before work is handed to a queue
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DebounceConfig {
    /// Delay for user-initiated requests
    #[serde(default)]
    pub user_delay_ms: u64,
    /// Delay for file-watcher-triggered requests
    #[serde(default = "default_watcher_delay_ms")]
    pub watcher_delay_ms: u64,
}

fn default_watcher_delay_ms() -> u64 {
    500
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            user_delay_ms: 0,
            watcher_delay_ms: default_watcher_delay_ms(),
        }
    }
}

/// Auto-removal timing for finished assets
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemovalConfig {
    /// Delay before a finished asset is removed (0 = keep forever)
    #[serde(default = "default_finished_after_ms")]
    pub finished_after_ms: u64,
    /// Delay before a failed asset is removed (0 = keep forever)
    #[serde(default = "default_failed_after_ms")]
    pub failed_after_ms: u64,
    /// Number of removed assets remembered for bring-back
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_finished_after_ms() -> u64 {
    10_000
}

fn default_failed_after_ms() -> u64 {
    3_000
}

fn default_history_limit() -> usize {
    20
}

impl Default for RemovalConfig {
    fn default() -> Self {
        Self {
            finished_after_ms: default_finished_after_ms(),
            failed_after_ms: default_failed_after_ms(),
            history_limit: default_history_limit(),
        }
    }
}

/// Defaults for how transforms trade size against fidelity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OptimisationConfig {
    /// Use the lossy/slower argument profile by default
    #[serde(default)]
    pub aggressive: bool,
    /// Accept results that are not smaller than the input
    #[serde(default)]
    pub allow_larger: bool,
    /// Race quantized PNG against lossy JPEG for aggressive PNG optimisation
    #[serde(default = "default_adaptive_images")]
    pub adaptive_images: bool,
    /// Minimum relative saving the converted candidate must win by
    #[serde(default = "default_min_saving_ratio")]
    pub min_saving_ratio: f32,
}

fn default_adaptive_images() -> bool {
    true
}

fn default_min_saving_ratio() -> f32 {
    0.05
}

impl Default for OptimisationConfig {
    fn default() -> Self {
        Self {
            aggressive: false,
            allow_larger: false,
            adaptive_images: default_adaptive_images(),
            min_saving_ratio: default_min_saving_ratio(),
        }
    }
}

/// Location of scratch space and backups
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    /// Working directory (defaults to `<tmp>/media-optimiser`)
    pub work_dir: Option<PathBuf>,
}

impl StorageConfig {
    /// Resolve the effective working directory
    pub fn work_dir(&self) -> PathBuf {
        self.work_dir
            .clone()
            .unwrap_or_else(|| env::temp_dir().join("media-optimiser"))
    }
}

/// Executable names or absolute paths of the external compressors
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ToolsConfig {
    pub oxipng: String,
    pub pngquant: String,
    pub jpegoptim: String,
    pub gifsicle: String,
    pub cwebp: String,
    pub magick: String,
    pub ffmpeg: String,
    pub ffprobe: String,
    pub gs: String,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            oxipng: "oxipng".to_string(),
            pngquant: "pngquant".to_string(),
            jpegoptim: "jpegoptim".to_string(),
            gifsicle: "gifsicle".to_string(),
            cwebp: "cwebp".to_string(),
            magick: "magick".to_string(),
            ffmpeg: "ffmpeg".to_string(),
            ffprobe: "ffprobe".to_string(),
            gs: "gs".to_string(),
        }
    }
}

/// Local IPC server settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "127.0.0.1:7878".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub queues: QueueConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub debounce: DebounceConfig,
    #[serde(default)]
    pub removal: RemovalConfig,
    #[serde(default)]
    pub optimisation: OptimisationConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.trim().parse::<T>().ok())
}

fn env_bool(name: &str) -> Option<bool> {
    // Accept "true", "1", "yes" as true; "false", "0", "no" as false
    match env::var(name).ok()?.to_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - MEDIA_OPTIMISER_LOGICAL_CORES -> queues.logical_cores
    /// - MEDIA_OPTIMISER_MEDIA_ENGINES -> queues.media_engines
    /// - MEDIA_OPTIMISER_IMAGE_WORKERS -> queues.image_workers
    /// - MEDIA_OPTIMISER_VIDEO_WORKERS -> queues.video_workers
    /// - MEDIA_OPTIMISER_PDF_WORKERS -> queues.pdf_workers
    /// - MEDIA_OPTIMISER_MAX_ATTEMPTS -> runner.max_attempts
    /// - MEDIA_OPTIMISER_TIMEOUT_SECS -> runner.timeout_secs
    /// - MEDIA_OPTIMISER_AGGRESSIVE -> optimisation.aggressive
    /// - MEDIA_OPTIMISER_WORK_DIR -> storage.work_dir
    /// - MEDIA_OPTIMISER_BIND -> server.bind
    pub fn apply_env_overrides(&mut self) {
        if let Some(cores) = env_parse::<u32>("MEDIA_OPTIMISER_LOGICAL_CORES") {
            self.queues.logical_cores = Some(cores);
        }
        if let Some(engines) = env_parse::<u32>("MEDIA_OPTIMISER_MEDIA_ENGINES") {
            self.queues.media_engines = Some(engines);
        }
        if let Some(workers) = env_parse("MEDIA_OPTIMISER_IMAGE_WORKERS") {
            self.queues.image_workers = workers;
        }
        if let Some(workers) = env_parse("MEDIA_OPTIMISER_VIDEO_WORKERS") {
            self.queues.video_workers = workers;
        }
        if let Some(workers) = env_parse("MEDIA_OPTIMISER_PDF_WORKERS") {
            self.queues.pdf_workers = workers;
        }
        if let Some(attempts) = env_parse("MEDIA_OPTIMISER_MAX_ATTEMPTS") {
            self.runner.max_attempts = attempts;
        }
        if let Some(secs) = env_parse("MEDIA_OPTIMISER_TIMEOUT_SECS") {
            self.runner.timeout_secs = secs;
        }
        if let Some(aggressive) = env_bool("MEDIA_OPTIMISER_AGGRESSIVE") {
            self.optimisation.aggressive = aggressive;
        }
        if let Ok(dir) = env::var("MEDIA_OPTIMISER_WORK_DIR") {
            if !dir.is_empty() {
                self.storage.work_dir = Some(PathBuf::from(dir));
            }
        }
        if let Ok(bind) = env::var("MEDIA_OPTIMISER_BIND") {
            if !bind.is_empty() {
                self.server.bind = bind;
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file yields the defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = match Self::load_from_file(&path) {
            Ok(config) => config,
            Err(ConfigError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => return Err(e),
        };
        config.apply_env_overrides();
        Ok(config)
    }
}

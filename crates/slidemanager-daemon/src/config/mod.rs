//! Daemon configuration and the typed per-job options record.

use config::{Config, Environment, File, FileFormat};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

const ENV_PREFIX: &str = "SLIDEMANAGER";
const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:5123";
const DEFAULT_EVENT_CAPACITY: usize = 5000;

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("unable to resolve project directories")]
    MissingProjectDirs,
    #[error(transparent)]
    Build(#[from] config::ConfigError),
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub events: EventsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EventsConfig {
    /// Bounded per-job event buffer; overflow drops the oldest entries.
    pub buffer_capacity: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            },
            events: EventsConfig {
                buffer_capacity: DEFAULT_EVENT_CAPACITY,
            },
        }
    }
}

/// Load configuration: defaults, then `settings.toml` from the user config
/// dir, then `SLIDEMANAGER__`-prefixed environment overrides.
pub fn load() -> Result<AppConfig, AppConfigError> {
    let dirs = project_dirs()?;
    let builder = Config::builder()
        .set_default("server.listen_addr", DEFAULT_LISTEN_ADDR)?
        .set_default("events.buffer_capacity", DEFAULT_EVENT_CAPACITY as i64)?
        .add_source(
            File::from(dirs.config_dir().join("settings.toml"))
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(
            File::from(PathBuf::from("config/settings.toml"))
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let cfg: AppConfig = builder.build()?.try_deserialize()?;
    Ok(cfg)
}

pub fn project_dirs() -> Result<ProjectDirs, AppConfigError> {
    ProjectDirs::from("dev", "slidemanager", "slidemanager")
        .ok_or(AppConfigError::MissingProjectDirs)
}

/// Per-job options submitted with `POST /jobs/index`. Every field has a
/// serde default so a bare `{}` body runs a full index pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobOptions {
    pub enable_text: bool,
    pub enable_thumb: bool,
    pub enable_text_vec: bool,
    pub enable_img_vec: bool,
    pub enable_bm25: bool,
    /// Re-queue artifacts that are already `ready`.
    pub force_rebuild: bool,
    /// Recurse into subdirectories of the library root.
    pub recursive: bool,
    /// Restrict planning to these paths (must resolve under the root);
    /// empty means "scan the root".
    pub file_paths: Vec<PathBuf>,
    pub thumb: ThumbOptions,
    pub pdf: PdfOptions,
    pub embed: EmbedOptions,
    /// Pages per durability checkpoint. 1 makes every page visible as soon
    /// as its transaction commits.
    pub commit_every_pages: u32,
    /// Secondary checkpoint trigger for coarse-grained phases, in seconds.
    pub commit_every_sec: f64,
    pub text_concurrency: usize,
    pub thumb_concurrency: usize,
    pub img_vec_concurrency: usize,
    pub watchdog_threshold_sec: i64,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            enable_text: true,
            enable_thumb: true,
            enable_text_vec: true,
            enable_img_vec: true,
            enable_bm25: true,
            force_rebuild: false,
            recursive: false,
            file_paths: Vec::new(),
            thumb: ThumbOptions::default(),
            pdf: PdfOptions::default(),
            embed: EmbedOptions::default(),
            commit_every_pages: 1,
            commit_every_sec: 1.0,
            text_concurrency: 8,
            thumb_concurrency: 2,
            img_vec_concurrency: 2,
            watchdog_threshold_sec: crate::constants::DEFAULT_WATCHDOG_THRESHOLD_SEC,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThumbOptions {
    pub width: u32,
    pub height_4_3: u32,
    pub height_16_9: u32,
}

impl Default for ThumbOptions {
    fn default() -> Self {
        Self {
            width: 320,
            height_4_3: 240,
            height_16_9: 180,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PdfOptions {
    pub timeout_sec: u64,
    pub max_concurrency: usize,
}

impl Default for PdfOptions {
    fn default() -> Self {
        Self {
            timeout_sec: 180,
            max_concurrency: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbedOptions {
    pub model_text: String,
    pub model_image: String,
    pub batch_size: usize,
    pub req_per_min: u32,
    pub tok_per_min: u32,
    pub max_retries: u32,
    pub max_concurrency: usize,
}

impl Default for EmbedOptions {
    fn default() -> Self {
        Self {
            model_text: "text-embedding-3-large".to_string(),
            model_image: "image-embedding-1".to_string(),
            batch_size: 64,
            req_per_min: 120,
            tok_per_min: 200_000,
            max_retries: 8,
            max_concurrency: 2,
        }
    }
}

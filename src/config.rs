use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::model::SortOrder;
use crate::overlay::DEFAULT_CONCURRENCY;
use crate::settings::{validate_chunking, Defaults};

const DEFAULT_ENV_PREFIX: &str = "CHANNEL_PAGER";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub display: DisplayConfig,
    #[serde(default)]
    pub overlay: OverlayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            user_agent: default_user_agent(),
            timeout: default_timeout(),
        }
    }
}

fn default_base_url() -> String {
    "http://127.0.0.1:5000".into()
}

fn default_user_agent() -> String {
    format!("channel-pager/{}", crate::VERSION)
}

fn default_timeout() -> Duration {
    Duration::from_secs(20)
}

/// System defaults for the display settings, the lowest resolution layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DisplayConfig {
    #[serde(default)]
    pub sort_order: SortOrder,
    #[serde(default = "default_items_per_chunk")]
    pub items_per_chunk: usize,
    #[serde(default = "default_overflow_threshold")]
    pub overflow_threshold: f64,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            sort_order: SortOrder::default(),
            items_per_chunk: default_items_per_chunk(),
            overflow_threshold: default_overflow_threshold(),
        }
    }
}

impl DisplayConfig {
    pub fn defaults(&self) -> Defaults {
        Defaults {
            sort_order: self.sort_order,
            items_per_chunk: self.items_per_chunk,
            overflow_threshold: self.overflow_threshold,
        }
    }
}

fn default_items_per_chunk() -> usize {
    50
}

fn default_overflow_threshold() -> f64 {
    0.2
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OverlayConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
        }
    }
}

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub config_file: Option<PathBuf>,
    pub env_prefix: Option<String>,
}

pub fn load(options: LoadOptions) -> Result<Config> {
    let mut cfg = Config::default();

    if let Some(path) = options.config_file.as_ref() {
        if path.exists() {
            cfg = merge_config(cfg, read_config_file(path)?);
        }
    } else if let Some(default_path) = default_config_path() {
        if default_path.exists() {
            cfg = merge_config(cfg, read_config_file(&default_path)?);
        }
    }

    let prefix = options.env_prefix.as_deref().unwrap_or(DEFAULT_ENV_PREFIX);
    apply_env(&mut cfg, prefix);

    validate_chunking(cfg.display.items_per_chunk, cfg.display.overflow_threshold)
        .context("config: display")?;
    Ok(cfg)
}

fn read_config_file(path: &Path) -> Result<Config> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("config: read {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&data)
        .with_context(|| format!("config: parse {}", path.display()))?;
    Ok(config)
}

fn merge_config(mut base: Config, other: Config) -> Config {
    if !other.backend.base_url.is_empty() {
        base.backend.base_url = other.backend.base_url;
    }
    if !other.backend.user_agent.is_empty() {
        base.backend.user_agent = other.backend.user_agent;
    }
    if !other.backend.timeout.is_zero() {
        base.backend.timeout = other.backend.timeout;
    }

    base.display.sort_order = other.display.sort_order;
    if other.display.items_per_chunk != 0 {
        base.display.items_per_chunk = other.display.items_per_chunk;
    }
    base.display.overflow_threshold = other.display.overflow_threshold;

    if other.overlay.concurrency != 0 {
        base.overlay.concurrency = other.overlay.concurrency;
    }

    base
}

fn apply_env(cfg: &mut Config, prefix: &str) {
    let mut map: HashMap<String, String> = HashMap::new();
    let upper_prefix = format!("{}_", prefix.to_uppercase());

    for (key, value) in env::vars() {
        if let Some(stripped) = key.strip_prefix(&upper_prefix) {
            let normalized = stripped.to_ascii_lowercase().replace("__", ".");
            map.insert(normalized, value);
        }
    }

    for (key, value) in map {
        apply_env_value(cfg, &key, value);
    }
}

fn apply_env_value(cfg: &mut Config, key: &str, value: String) {
    match key {
        "backend.base_url" => cfg.backend.base_url = value,
        "backend.user_agent" => cfg.backend.user_agent = value,
        "backend.timeout" => match humantime::parse_duration(&value) {
            Ok(duration) => cfg.backend.timeout = duration,
            Err(err) => warn!("config: ignoring backend.timeout={value:?}: {err}"),
        },
        "display.sort_order" => match value.parse::<SortOrder>() {
            Ok(order) => cfg.display.sort_order = order,
            Err(err) => warn!("config: ignoring display.sort_order: {err}"),
        },
        "display.items_per_chunk" => {
            if let Ok(parsed) = value.parse::<usize>() {
                cfg.display.items_per_chunk = parsed;
            }
        }
        "display.overflow_threshold" => {
            if let Ok(parsed) = value.parse::<f64>() {
                cfg.display.overflow_threshold = parsed;
            }
        }
        "overlay.concurrency" => {
            if let Ok(parsed) = value.parse::<usize>() {
                cfg.overlay.concurrency = parsed;
            }
        }
        _ => {}
    }
}

pub fn default_path() -> Option<PathBuf> {
    default_config_path()
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("channel-pager").join("config.yaml"))
}

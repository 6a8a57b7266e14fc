// src/config/mod.rs
//! Configuration surface: explicit structs with documented defaults, loaded
//! once from TOML (or JSON) and validated at the boundary.

pub mod generator;

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};

use crate::dedup::DedupSettings;
use crate::error::{RelayError, Result};
use crate::types::{SourceTag, DEFAULT_PRIORITY};

pub use generator::GeneratorConfig;

pub const ENV_CONFIG_PATH: &str = "RELAY_CONFIG_PATH";
pub const DEFAULT_CONFIG_TOML: &str = "config/relay.toml";
pub const DEFAULT_CONFIG_JSON: &str = "config/relay.json";

pub const DEFAULT_POLLING_INTERVAL_MS: u64 = 60_000;
/// Intervals outside this range are accepted but logged as suspicious.
pub const RECOMMENDED_INTERVAL_MS: std::ops::RangeInclusive<u64> = 10_000..=3_600_000;

fn default_interval() -> u64 {
    DEFAULT_POLLING_INTERVAL_MS
}
fn default_priority() -> u32 {
    DEFAULT_PRIORITY
}
fn default_true() -> bool {
    true
}

/// One group/notification source watched by a listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    /// Page the extractor scrapes.
    pub locator: String,
    /// Display name; the id when empty.
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default = "default_interval")]
    pub polling_interval_ms: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Account used for the listener session; the id when unset.
    #[serde(default)]
    pub credentials_ref: Option<String>,
}

impl SourceConfig {
    pub fn new(id: impl Into<String>, locator: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            locator: locator.into(),
            name: String::new(),
            priority: DEFAULT_PRIORITY,
            polling_interval_ms: DEFAULT_POLLING_INTERVAL_MS,
            enabled: true,
            credentials_ref: None,
        }
    }

    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    /// Identity stamped on every event and item this source produces.
    pub fn tag(&self) -> SourceTag {
        SourceTag {
            source_id: self.id.clone(),
            source_name: self.display_name().to_string(),
            priority: self.priority,
        }
    }

    pub fn credentials(&self) -> &str {
        self.credentials_ref.as_deref().unwrap_or(&self.id)
    }

    /// Non-empty id, positive interval.
    pub fn check(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(RelayError::InvalidConfig("source id must not be empty".into()));
        }
        if self.polling_interval_ms == 0 {
            return Err(RelayError::InvalidConfig(format!(
                "source {}: polling_interval_ms must be positive",
                self.id
            )));
        }
        if !RECOMMENDED_INTERVAL_MS.contains(&self.polling_interval_ms) {
            tracing::warn!(
                source_id = %self.id,
                interval_ms = self.polling_interval_ms,
                "polling interval outside recommended range (10s..1h)"
            );
        }
        Ok(())
    }
}

/// A worker account able to post replies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub id: String,
    /// The id when unset.
    #[serde(default)]
    pub credentials_ref: Option<String>,
    /// Carried for the presentation layer; dispatch is queue-driven.
    #[serde(default = "default_interval")]
    pub polling_interval_ms: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl WorkerConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            credentials_ref: None,
            polling_interval_ms: DEFAULT_POLLING_INTERVAL_MS,
            enabled: true,
        }
    }

    pub fn credentials(&self) -> &str {
        self.credentials_ref.as_deref().unwrap_or(&self.id)
    }

    pub fn check(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(RelayError::InvalidConfig("worker id must not be empty".into()));
        }
        if self.polling_interval_ms == 0 {
            return Err(RelayError::InvalidConfig(format!(
                "worker {}: polling_interval_ms must be positive",
                self.id
            )));
        }
        Ok(())
    }
}

/// Dispatcher tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Reassignments allowed before a task is dropped.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Pause between two dispatched tasks.
    #[serde(default = "default_task_delay_ms")]
    pub task_delay_ms: u64,
    /// Posts younger than this are skipped.
    #[serde(default = "default_min_item_age_secs")]
    pub min_item_age_secs: i64,
    /// Skip posts authored by the dispatching account.
    #[serde(default = "default_true")]
    pub skip_own_items: bool,
    /// Worker error count that demotes it to `error`.
    #[serde(default = "default_error_threshold")]
    pub error_threshold: u32,
}

fn default_max_retries() -> u32 {
    3
}
fn default_task_delay_ms() -> u64 {
    1_000
}
fn default_min_item_age_secs() -> i64 {
    60
}
fn default_error_threshold() -> u32 {
    5
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            task_delay_ms: default_task_delay_ms(),
            min_item_age_secs: default_min_item_age_secs(),
            skip_own_items: true,
            error_threshold: default_error_threshold(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformSettings {
    pub base_url: String,
    pub extractor_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    15
}

impl Default for PlatformSettings {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:7070/api".to_string(),
            extractor_url: "http://127.0.0.1:7071".to_string(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiSettings {
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self { bind: default_bind() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifySettings {
    /// Same alert key is suppressed inside this window.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: i64,
}

fn default_cooldown_secs() -> i64 {
    900
}

impl Default for NotifySettings {
    fn default() -> Self {
        Self {
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

/// Root of `config/relay.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub dedup: DedupSettings,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub platform: PlatformSettings,
    #[serde(default)]
    pub generator: GeneratorConfig,
    #[serde(default)]
    pub api: ApiSettings,
    #[serde(default)]
    pub notify: NotifySettings,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub workers: Vec<WorkerConfig>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

impl AppConfig {
    /// Load from an explicit path; format picked by extension (TOML default).
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let cfg: AppConfig = if ext == "json" {
            serde_json::from_str(&content).context("parsing JSON config")?
        } else {
            toml::from_str(&content).context("parsing TOML config")?
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load using env var + fallbacks:
    /// 1) $RELAY_CONFIG_PATH
    /// 2) config/relay.toml
    /// 3) config/relay.json
    pub fn load_default() -> anyhow::Result<Self> {
        if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
            let pb = PathBuf::from(p);
            if !pb.exists() {
                return Err(anyhow!("{ENV_CONFIG_PATH} points to non-existent path"));
            }
            return Self::load_from(&pb);
        }
        for candidate in [DEFAULT_CONFIG_TOML, DEFAULT_CONFIG_JSON] {
            let pb = PathBuf::from(candidate);
            if pb.exists() {
                return Self::load_from(&pb);
            }
        }
        Err(anyhow!(
            "no configuration found (set {ENV_CONFIG_PATH} or create {DEFAULT_CONFIG_TOML})"
        ))
    }

    /// Re-check the invariants the core relies on.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for s in &self.sources {
            s.check()?;
            if !seen.insert(s.id.as_str()) {
                return Err(RelayError::InvalidConfig(format!("duplicate source id {}", s.id)));
            }
        }
        let mut seen = HashSet::new();
        for w in &self.workers {
            w.check()?;
            if !seen.insert(w.id.as_str()) {
                return Err(RelayError::InvalidConfig(format!("duplicate worker id {}", w.id)));
            }
        }
        if self.dedup.trim_target > self.dedup.trim_threshold {
            return Err(RelayError::InvalidConfig(
                "dedup.trim_target must not exceed dedup.trim_threshold".into(),
            ));
        }
        Ok(())
    }
}

//! Environment configuration and the `sources.yaml` registry.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use fundwatch_adapters::{adapter_for_source, builtin_adapters, SourceAdapter, DEFAULT_MAX_PAGES};
use fundwatch_core::{RunCap, DEFAULT_RETENTION, DEFAULT_RUN_CAP};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub state_dir: PathBuf,
    pub workspace_root: PathBuf,
    pub run_cap: RunCap,
    pub retention: usize,
    pub max_pages: usize,
    pub workers: usize,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub pushbullet_api_key: Option<String>,
    pub pushbullet_channel: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; unparsable numbers fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let parsed = |key: &str| non_empty(key).and_then(|v| v.trim().parse::<i64>().ok());

        Self {
            state_dir: non_empty("FUNDWATCH_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
            workspace_root: non_empty("FUNDWATCH_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
            run_cap: RunCap::from_raw(parsed("FUNDWATCH_RUN_CAP").unwrap_or(DEFAULT_RUN_CAP)),
            retention: parsed("FUNDWATCH_RETENTION")
                .and_then(|v| usize::try_from(v).ok())
                .unwrap_or(DEFAULT_RETENTION),
            max_pages: parsed("FUNDWATCH_MAX_PAGES")
                .and_then(|v| usize::try_from(v).ok())
                .filter(|v| *v > 0)
                .unwrap_or(DEFAULT_MAX_PAGES),
            workers: parsed("FUNDWATCH_WORKERS")
                .and_then(|v| usize::try_from(v).ok())
                .filter(|v| *v > 0)
                .unwrap_or(4),
            user_agent: non_empty("FUNDWATCH_USER_AGENT")
                .unwrap_or_else(|| "fundwatch/0.1".to_string()),
            http_timeout_secs: parsed("FUNDWATCH_HTTP_TIMEOUT_SECS")
                .and_then(|v| u64::try_from(v).ok())
                .filter(|v| *v > 0)
                .unwrap_or(20),
            pushbullet_api_key: non_empty("PUSHBULLET_API_KEY"),
            pushbullet_channel: non_empty("PUSHBULLET_CHANNEL"),
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn registry_path(&self) -> PathBuf {
        self.workspace_root.join("sources.yaml")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    /// Overrides the run cap for this source; `<= 0` means no limit.
    #[serde(default)]
    pub max_items: Option<i64>,
}

fn enabled_by_default() -> bool {
    true
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self {
            sources: builtin_adapters()
                .iter()
                .map(|adapter| SourceConfig {
                    source_id: adapter.source_id().to_string(),
                    display_name: None,
                    enabled: true,
                    max_items: None,
                })
                .collect(),
        }
    }
}

impl SourceRegistry {
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing source registry")
    }

    /// Reads the registry, falling back to every built-in source when the file is absent.
    pub async fn load(path: &Path) -> Result<Self> {
        match fs::read_to_string(path).await {
            Ok(text) => Self::from_yaml(&text).with_context(|| format!("parsing {}", path.display())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no source registry, using built-in sources");
                Ok(Self::default())
            }
            Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
        }
    }

    /// Enabled sources, in registry order, bound to their adapters.
    pub fn resolve(&self, default_cap: RunCap) -> Result<Vec<ConfiguredSource>> {
        let mut resolved = Vec::new();
        for source in self.sources.iter().filter(|s| s.enabled) {
            let Some(adapter) = adapter_for_source(&source.source_id) else {
                bail!("no adapter registered for {}", source.source_id);
            };
            if resolved
                .iter()
                .any(|r: &ConfiguredSource| r.adapter.source_id() == adapter.source_id())
            {
                bail!("source {} is listed more than once", source.source_id);
            }
            let cap = source.max_items.map(RunCap::from_raw).unwrap_or(default_cap);
            let mut configured = ConfiguredSource::new(adapter, cap);
            if let Some(name) = source.display_name.as_deref().and_then(non_blank) {
                configured = configured.with_display_name(name);
            }
            resolved.push(configured);
        }
        Ok(resolved)
    }
}

fn non_blank(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

/// A source ready to run: adapter, notification prefix and run cap.
#[derive(Clone)]
pub struct ConfiguredSource {
    pub adapter: Arc<dyn SourceAdapter>,
    pub display_name: String,
    pub cap: RunCap,
}

impl ConfiguredSource {
    pub fn new(adapter: Arc<dyn SourceAdapter>, cap: RunCap) -> Self {
        Self {
            display_name: adapter.display_name().to_string(),
            adapter,
            cap,
        }
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = display_name.into();
        self
    }
}

impl std::fmt::Debug for ConfiguredSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfiguredSource")
            .field("source_id", &self.adapter.source_id())
            .field("display_name", &self.display_name)
            .field("cap", &self.cap)
            .finish()
    }
}

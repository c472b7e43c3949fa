//! Configuration — analyzer registration, the two YAML overlay layers
//! (organization default and repository-local `.lookout.yml`), and the
//! recursive settings merge they share.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

// ─── Analyzer configuration ──────────────────────────────────────────────────

/// Configuration of one analyzer, as registered on the server or overlaid by
/// a YAML layer. `settings` is a free-form dictionary that is deep-merged
/// across layers; every other field is replaced wholesale by an overlay.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    pub name: String,
    pub addr: String,
    pub disabled: bool,
    pub feedback: String,
    pub settings: Map<String, Value>,
}

/// Schema shared by both YAML layers: `{analyzers: [AnalyzerConfig]}`.
/// Unknown keys are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReviewConfig {
    pub analyzers: Vec<AnalyzerConfig>,
}

/// Overlay one YAML layer onto the current effective map.
///
/// Analyzer names not registered on the server are logged and dropped. For
/// registered names the overlay replaces the configuration, except that
/// `settings` are deep-merged and `disabled` is sticky: once any layer
/// disables an analyzer it stays disabled for this event.
///
/// Empty or whitespace-only content leaves `current` untouched; malformed
/// YAML is a fatal configuration error.
pub fn overlay_yaml(
    current: &HashMap<String, AnalyzerConfig>,
    content: &str,
) -> Result<HashMap<String, AnalyzerConfig>> {
    if content.trim().is_empty() {
        return Ok(current.clone());
    }

    let parsed: ReviewConfig =
        serde_yaml::from_str(content).context("can't parse configuration file")?;

    let mut out = current.clone();
    for overlay in parsed.analyzers {
        let Some(base) = out.get(&overlay.name) else {
            warn!(
                analyzer = %overlay.name,
                "analyzer required by configuration file isn't enabled on server"
            );
            continue;
        };

        let merged = AnalyzerConfig {
            settings: merge_maps(&base.settings, &overlay.settings),
            disabled: base.disabled || overlay.disabled,
            ..overlay
        };
        out.insert(merged.name.clone(), merged);
    }

    Ok(out)
}

// ─── Settings deep-merge ─────────────────────────────────────────────────────

/// Deep-merge two settings dictionaries; `local` wins on conflicts unless
/// both sides hold a nested mapping, which is merged recursively.
pub fn merge_settings(global: &Map<String, Value>, local: &Map<String, Value>) -> Map<String, Value> {
    if local.is_empty() {
        return global.clone();
    }
    if global.is_empty() {
        return local.clone();
    }
    merge_maps(global, local)
}

pub fn merge_maps(global: &Map<String, Value>, local: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = global.clone();
    for (key, value) in local {
        match (merged.get(key), value) {
            (Some(Value::Object(gv)), Value::Object(lv)) => {
                merged.insert(key.clone(), Value::Object(merge_maps(gv, lv)));
            }
            _ => {
                merged.insert(key.clone(), value.clone());
            }
        }
    }
    merged
}

// ─── Server configuration (config.yml) ───────────────────────────────────────

/// Per-kind analyzer timeouts in seconds; zero means no timeout. The keys
/// deliberately match the hint users see on analyzer deadline errors.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub analyzer_review: u64,
    pub analyzer_push: u64,
}

/// `config.yml` for the `serve` command.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServeConfig {
    /// Analyzers registered on this server.
    pub analyzers: Vec<AnalyzerConfig>,
    pub timeout: TimeoutConfig,
    /// Bind address of the streaming data service.
    pub data_server: String,
    /// Repository the data service reads from.
    pub git_dir: PathBuf,
    /// Address of the bblfsh syntax-tree parser; unset disables UAST support.
    pub bblfsh: Option<String>,
    /// SQLite database path; unset keeps event/comment state in memory.
    pub db: Option<PathBuf>,
    /// Surface the first analyzer or posting error instead of logging it and
    /// moving on to the next event.
    pub exit_on_error: bool,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            analyzers: Vec::new(),
            timeout: TimeoutConfig::default(),
            data_server: "127.0.0.1:10301".to_string(),
            git_dir: PathBuf::from("."),
            bblfsh: None,
            db: None,
            exit_on_error: false,
        }
    }
}

impl ServeConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("can't read config file '{}'", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("can't parse config file '{}'", path.display()))
    }
}

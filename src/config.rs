//! Startup Configuration
//!
//! Loads one JSON or YAML document and exposes it as a flat key→value map:
//! - Discovery: explicit path, `./config.json`, `$HOME/.llms/config.json`, `LLMS_CONFIG_PATH`
//! - `extends`: shallow merge over a base document; a bare name such as
//!   `"openai"` means `configs/config-openai.json`
//! - `${VAR}` placeholders in string values are replaced from the environment;
//!   unknown or empty variables leave the placeholder untouched
//!
//! Typed accessors cover the keys the server understands (`HOST`, `PORT`,
//! timeouts, proxy, `providers`, `Router`, `transformers`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::dispatch::DispatchSettings;
use crate::providers::ProviderRegistration;
use crate::route_rules::RouteRule;
use crate::transformer::TransformerSpec;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_MODEL: &str = "openrouter,anthropic/claude-3.5-sonnet";
pub const DEFAULT_API_TIMEOUT_MS: u64 = 3_600_000;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 30_000;

const SHORTCUT_DIR: &str = "configs";
const SHORTCUT_PREFIX: &str = "config-";
const SHORTCUT_SUFFIX: &str = ".json";
const MAX_EXTENDS_DEPTH: usize = 8;

const PROXY_KEYS: &[&str] = &["PROXY_URL", "HTTPS_PROXY", "https_proxy", "httpsProxy"];

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$\{([^}]+)\}").unwrap());

/// `Router` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RouterConfig {
    /// Fallback `provider,model`
    #[serde(default)]
    pub default: Option<String>,

    /// Custom rules, tried before the built-in ones
    #[serde(default)]
    pub rules: Vec<RouteRule>,
}

/// Merged configuration document.
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    values: Map<String, Value>,
    source: Option<PathBuf>,
}

impl AppConfig {
    /// Candidate files in lookup order.
    pub fn candidate_paths(explicit: Option<&Path>) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Some(p) = explicit {
            paths.push(p.to_path_buf());
        }
        if let Ok(cwd) = std::env::current_dir() {
            paths.push(cwd.join("config.json"));
        }
        if let Some(home) = std::env::var_os("HOME") {
            paths.push(PathBuf::from(home).join(".llms").join("config.json"));
        }
        if let Ok(p) = std::env::var("LLMS_CONFIG_PATH") {
            if !p.trim().is_empty() {
                paths.push(PathBuf::from(p.trim()));
            }
        }
        paths
    }

    /// Load the first existing candidate. An explicit path that does not exist
    /// is an error; finding nothing otherwise yields the defaults.
    pub fn discover(explicit: Option<&Path>) -> Result<Self> {
        if let Some(p) = explicit {
            if !p.is_file() {
                return Err(anyhow!("Config file not found: {}", p.display()));
            }
        }
        for path in Self::candidate_paths(explicit) {
            if path.is_file() {
                return Self::from_file(&path);
            }
        }
        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Load `path`, resolving `extends` against the working directory.
    pub fn from_file(path: &Path) -> Result<Self> {
        let base = std::env::current_dir().context("Failed to read working directory")?;
        Self::from_file_with_base(path, &base)
    }

    fn from_file_with_base(path: &Path, base_dir: &Path) -> Result<Self> {
        let doc = load_document(path, base_dir, 0)?;
        let mut config = Self::from_value(Value::Object(doc))?;
        config.source = Some(path.to_path_buf());
        tracing::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Build from an in-memory document. Placeholders are interpolated.
    pub fn from_value(value: Value) -> Result<Self> {
        match interpolate_env(value) {
            Value::Object(values) => Ok(Self {
                values,
                source: None,
            }),
            other => Err(anyhow!(
                "Config root must be an object, found {}",
                json_kind(&other)
            )),
        }
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// String form of a scalar value.
    pub fn get_string(&self, key: &str) -> Option<String> {
        match self.values.get(key)? {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        match self.values.get(key)? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn set(&mut self, key: &str, value: Value) {
        self.values.insert(key.to_string(), value);
    }

    pub fn values(&self) -> &Map<String, Value> {
        &self.values
    }

    pub fn host(&self) -> String {
        self.get_string("HOST")
            .unwrap_or_else(|| DEFAULT_HOST.to_string())
    }

    pub fn port(&self) -> u16 {
        self.get_u64("PORT")
            .and_then(|p| u16::try_from(p).ok())
            .unwrap_or(DEFAULT_PORT)
    }

    pub fn log_level(&self) -> Option<String> {
        self.get_string("LOG_LEVEL")
    }

    /// First configured proxy key, then the `HTTPS_PROXY` environment.
    pub fn https_proxy(&self) -> Option<String> {
        PROXY_KEYS
            .iter()
            .find_map(|k| self.get_string(k))
            .or_else(|| {
                ["HTTPS_PROXY", "https_proxy"]
                    .iter()
                    .find_map(|k| std::env::var(k).ok())
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty())
            })
    }

    pub fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings {
            timeout: Duration::from_millis(
                self.get_u64("API_TIMEOUT_MS")
                    .unwrap_or(DEFAULT_API_TIMEOUT_MS),
            ),
            connect_timeout: Duration::from_millis(
                self.get_u64("CONNECT_TIMEOUT_MS")
                    .unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS),
            ),
            https_proxy: self.https_proxy(),
        }
    }

    pub fn router(&self) -> RouterConfig {
        match self.values.get("Router") {
            Some(v) => serde_json::from_value(v.clone()).unwrap_or_else(|e| {
                tracing::warn!("Invalid Router section, ignoring: {}", e);
                RouterConfig::default()
            }),
            None => RouterConfig::default(),
        }
    }

    pub fn default_model(&self) -> String {
        self.router()
            .default
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string())
    }

    /// Provider entries; malformed entries are logged and skipped.
    pub fn providers(&self) -> Vec<ProviderRegistration> {
        let Some(Value::Array(items)) = self.values.get("providers") else {
            return Vec::new();
        };
        items
            .iter()
            .enumerate()
            .filter_map(|(i, item)| {
                serde_json::from_value(item.clone())
                    .map_err(|e| tracing::warn!("Skipping provider entry {}: {}", i, e))
                    .ok()
            })
            .collect()
    }

    /// `transformers` entries: per-transformer default options.
    pub fn transformer_options(&self) -> Vec<TransformerSpec> {
        let Some(Value::Array(items)) = self.values.get("transformers") else {
            return Vec::new();
        };
        items
            .iter()
            .filter_map(|item| match serde_json::from_value(item.clone()) {
                Ok(spec) => Some(spec),
                Err(e) => {
                    tracing::warn!("Skipping transformer entry: {}", e);
                    None
                }
            })
            .collect()
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn parse_document(path: &Path) -> Result<Map<String, Value>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );
    let value: Value = if is_yaml {
        serde_yaml::from_str(&text)
            .with_context(|| format!("Failed to parse YAML config {}", path.display()))?
    } else {
        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse JSON config {}", path.display()))?
    };
    match value {
        Value::Object(map) => Ok(map),
        other => Err(anyhow!(
            "Config root in {} must be an object, found {}",
            path.display(),
            json_kind(&other)
        )),
    }
}

/// Location of an `extends` target.
fn extends_path(target: &str, base_dir: &Path) -> PathBuf {
    if !target.contains('/') && !target.ends_with(SHORTCUT_SUFFIX) {
        base_dir
            .join(SHORTCUT_DIR)
            .join(format!("{}{}{}", SHORTCUT_PREFIX, target, SHORTCUT_SUFFIX))
    } else {
        base_dir.join(target)
    }
}

fn load_document(path: &Path, base_dir: &Path, depth: usize) -> Result<Map<String, Value>> {
    let mut doc = parse_document(path)?;
    let Some(extends) = doc.remove("extends") else {
        return Ok(doc);
    };
    let Some(target) = extends.as_str().map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(doc);
    };
    if depth >= MAX_EXTENDS_DEPTH {
        return Err(anyhow!(
            "Config extends chain deeper than {} at {}",
            MAX_EXTENDS_DEPTH,
            path.display()
        ));
    }

    let base_path = extends_path(target, base_dir);
    if !base_path.is_file() {
        tracing::warn!("Extended config not found: {}", base_path.display());
        return Ok(doc);
    }
    tracing::info!("Config {} extends {}", path.display(), base_path.display());

    let mut merged = load_document(&base_path, base_dir, depth + 1)?;
    merged.extend(doc);
    Ok(merged)
}

/// Replace `${VAR}` in every string of `value`.
pub fn interpolate_env(value: Value) -> Value {
    match value {
        Value::String(s) => Value::String(interpolate_str(&s)),
        Value::Array(items) => Value::Array(items.into_iter().map(interpolate_env).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, interpolate_env(v)))
                .collect(),
        ),
        other => other,
    }
}

fn interpolate_str(s: &str) -> String {
    if !s.contains("${") {
        return s.to_string();
    }
    PLACEHOLDER
        .replace_all(s, |caps: &regex::Captures<'_>| {
            std::env::var(&caps[1])
                .ok()
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

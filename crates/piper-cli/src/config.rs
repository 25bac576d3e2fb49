//! Pipeline configuration.
//!
//! Loaded from an optional file plus `PIPER__SECTION__KEY` environment
//! overrides, e.g. `PIPER__VALIDATION__ENDPOINT=http://localhost:8080/fhir`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use piper_runner::{LoadMode, RunConfig, ThresholdPolicy};
use piper_validation::{HttpEndpointConfig, RetryPolicy};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Startup configuration problem. Exits with status 2.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ConfigError(pub String);

impl ConfigError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    pub source: SourceConfig,
    pub templates: TemplatesConfig,
    #[serde(default)]
    pub bindings: Vec<BindingConfig>,
    /// Entity types or template ids to produce. Empty means all.
    #[serde(default)]
    pub filter: Vec<String>,
    /// Values exposed to every template under `run`.
    #[serde(default)]
    pub run_parameters: Map<String, Value>,
    pub validation: ValidationConfig,
    pub run: RunSection,
    #[serde(default)]
    pub load: LoadConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// NDJSON file with one record per line.
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TemplatesConfig {
    pub dir: PathBuf,
    /// Bind every `Name.hbs` template to entity type `Name`.
    #[serde(default = "default_true")]
    pub conventional: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindingConfig {
    pub entity_type: String,
    pub template: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValidationConfig {
    /// FHIR base URL whose `$validate` operation judges each document.
    pub endpoint: String,
    #[serde(default)]
    pub profile: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Validation calls in flight at once. Defaults to half the render pool.
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub auth_token: Option<String>,
}

fn default_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    500
}
fn default_max_delay_ms() -> u64 {
    10_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// The policy and the drain grace must be spelled out.
#[derive(Debug, Clone, Deserialize)]
pub struct RunSection {
    #[serde(default)]
    pub render_concurrency: Option<usize>,
    pub policy: ThresholdPolicy,
    pub drain_grace_ms: u64,
    #[serde(default)]
    pub load_mode: LoadMode,
    #[serde(default)]
    pub event_buffer: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum LoadConfig {
    #[default]
    None,
    Fhir {
        base_url: String,
        #[serde(default)]
        auth_token: Option<String>,
        #[serde(default = "default_timeout_ms")]
        timeout_ms: u64,
    },
    JsonFile {
        path: PathBuf,
        #[serde(default = "default_buffer_size")]
        buffer_size: usize,
    },
}

fn default_buffer_size() -> usize {
    1000
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OutputConfig {
    /// Quarantine log, written as NDJSON.
    #[serde(default)]
    pub quarantine: Option<PathBuf>,
    /// Run summary, written as JSON.
    #[serde(default)]
    pub summary: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Also write logs to this file, without colours.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.source.path.as_os_str().is_empty() {
            return Err(ConfigError::new("source.path must not be empty"));
        }
        if self.templates.dir.as_os_str().is_empty() {
            return Err(ConfigError::new("templates.dir must not be empty"));
        }
        if !self.templates.conventional && self.bindings.is_empty() {
            return Err(ConfigError::new(
                "no bindings: enable templates.conventional or add [[bindings]] entries",
            ));
        }
        for (i, binding) in self.bindings.iter().enumerate() {
            if binding.entity_type.is_empty() || binding.template.is_empty() {
                return Err(ConfigError::new(format!(
                    "bindings[{i}]: entity_type and template must not be empty"
                )));
            }
        }
        if self.filter.iter().any(String::is_empty) {
            return Err(ConfigError::new("filter entries must not be empty"));
        }

        check_url("validation.endpoint", &self.validation.endpoint)?;
        if self.validation.timeout_ms == 0 {
            return Err(ConfigError::new("validation.timeout_ms must be > 0"));
        }
        if self.validation.concurrency == Some(0) {
            return Err(ConfigError::new("validation.concurrency must be > 0"));
        }
        if self.validation.retry.max_attempts == 0 {
            return Err(ConfigError::new("validation.retry.max_attempts must be >= 1"));
        }
        if self.validation.retry.base_delay_ms > self.validation.retry.max_delay_ms {
            return Err(ConfigError::new(
                "validation.retry.base_delay_ms must not exceed max_delay_ms",
            ));
        }

        if self.run.render_concurrency == Some(0) {
            return Err(ConfigError::new("run.render_concurrency must be > 0"));
        }
        if self.run.event_buffer == Some(0) {
            return Err(ConfigError::new("run.event_buffer must be > 0"));
        }
        self.run
            .policy
            .validate()
            .map_err(|e| ConfigError::new(format!("run.policy: {e}")))?;

        match &self.load {
            LoadConfig::None => {}
            LoadConfig::Fhir { base_url, .. } => check_url("load.base_url", base_url)?,
            LoadConfig::JsonFile { path, buffer_size } => {
                if path.as_os_str().is_empty() {
                    return Err(ConfigError::new("load.path must not be empty"));
                }
                if *buffer_size == 0 {
                    return Err(ConfigError::new("load.buffer_size must be > 0"));
                }
            }
        }

        Ok(())
    }

    pub fn filter(&self) -> Option<piper_core::ResourceFilter> {
        (!self.filter.is_empty())
            .then(|| piper_core::ResourceFilter::new(self.filter.iter().cloned()))
    }

    pub fn run_config(&self) -> RunConfig {
        let mut config = RunConfig::new(
            self.run.policy,
            Duration::from_millis(self.run.drain_grace_ms),
        )
        .with_load_mode(self.run.load_mode);
        if let Some(n) = self.run.render_concurrency {
            config = config.with_render_concurrency(n);
            if self.validation.concurrency.is_none() {
                config = config.with_validation_concurrency((n / 2).max(1));
            }
        }
        if let Some(n) = self.validation.concurrency {
            config = config.with_validation_concurrency(n);
        }
        if let Some(n) = self.run.event_buffer {
            config = config.with_event_buffer(n);
        }
        config
    }

    pub fn endpoint_config(&self) -> HttpEndpointConfig {
        let v = &self.validation;
        let mut config = HttpEndpointConfig::new(v.endpoint.clone())
            .with_timeout(Duration::from_millis(v.timeout_ms));
        if let Some(profile) = &v.profile {
            config = config.with_profile(profile.clone());
        }
        if let Some(token) = &v.auth_token {
            config = config.with_auth_token(token.clone());
        }
        config
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let r = &self.validation.retry;
        RetryPolicy::new(
            r.max_attempts,
            Duration::from_millis(r.base_delay_ms),
            Duration::from_millis(r.max_delay_ms),
        )
    }
}

fn check_url(field: &str, value: &str) -> Result<(), ConfigError> {
    let url = url::Url::parse(value).map_err(|e| ConfigError::new(format!("{field}: {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(ConfigError::new(format!(
            "{field}: unsupported scheme '{other}'"
        ))),
    }
}

pub mod loader {
    use super::{ConfigError, PipelineConfig};
    use config::{Config, Environment, File};
    use std::path::Path;

    /// Read `path` if it exists, apply `PIPER__*` overrides, then validate.
    pub fn load_config(path: &Path) -> Result<PipelineConfig, ConfigError> {
        let mut builder = Config::builder();
        if path.exists() {
            builder = builder.add_source(File::from(path));
        }
        builder = builder.add_source(
            Environment::with_prefix("PIPER")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );
        let cfg = builder
            .build()
            .map_err(|e| ConfigError::new(format!("config build error: {e}")))?;
        let merged: PipelineConfig = cfg
            .try_deserialize()
            .map_err(|e| ConfigError::new(format!("config deserialize error: {e}")))?;
        merged.validate()?;
        Ok(merged)
    }
}

/// Resolve a relative path against the config file's directory.
pub fn resolve_path(config_path: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match config_path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.join(path),
        _ => path.to_path_buf(),
    }
}

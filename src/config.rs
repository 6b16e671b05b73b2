use std::{
    collections::HashMap,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{anyhow, Result};
use blob_store::BlobStorageConfig;
use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use serde_inline_default::serde_inline_default;
use uuid::Uuid;

use crate::{auth::AuthorizationRule, key_mapper::parse_extension};

const LOCAL_ENV: &str = "local";
const ENV_PREFIX: &str = "GATEWAY_";

#[serde_inline_default]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde_inline_default(LOCAL_ENV.to_string())]
    pub env: String,
    #[serde_inline_default("0.0.0.0:3000".to_string())]
    pub listen_addr: String,
    /// Path under which stored items are addressed.
    #[serde_inline_default("/storage".to_string())]
    pub route_prefix: String,
    #[serde_inline_default(100 * 1024 * 1024)]
    pub max_body_bytes: usize,
    #[serde(default)]
    pub blob_storage: BlobStorageConfig,
    #[serde(default)]
    pub conversion: ConversionConfig,
    #[serde(default)]
    pub authorization: AuthorizationConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            env: LOCAL_ENV.to_string(),
            listen_addr: "0.0.0.0:3000".to_string(),
            route_prefix: "/storage".to_string(),
            max_body_bytes: 100 * 1024 * 1024,
            blob_storage: Default::default(),
            conversion: Default::default(),
            authorization: Default::default(),
            telemetry: Default::default(),
        }
    }
}

impl ServerConfig {
    /// Loads the YAML file at `path` (if any) with `GATEWAY_` prefixed
    /// environment variables layered on top. Nested keys are separated by
    /// `__`, e.g. `GATEWAY_CONVERSION__TIMEOUT_SECS=60`.
    pub fn load(path: Option<&Path>) -> Result<ServerConfig> {
        let mut figment = Figment::new();
        if let Some(path) = path {
            figment = figment.merge(Yaml::file_exact(path));
        }
        let config: ServerConfig = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.finalize()
    }

    #[cfg(test)]
    pub fn from_yaml_str(config_str: &str) -> Result<ServerConfig> {
        let config: ServerConfig = Figment::new().merge(Yaml::string(config_str)).extract()?;
        config.finalize()
    }

    fn finalize(mut self) -> Result<ServerConfig> {
        self.conversion.allowed_extensions = self
            .conversion
            .allowed_extensions
            .iter()
            .map(|ext| ext.trim().to_ascii_lowercase())
            .collect();
        self.conversion.derived_extension = self.conversion.derived_extension.to_ascii_lowercase();
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(anyhow!("invalid listen address: {}", self.listen_addr));
        }
        if !self.route_prefix.starts_with('/') || self.route_prefix.len() < 2 {
            return Err(anyhow!(
                "route prefix must start with '/' and name a path: {}",
                self.route_prefix
            ));
        }
        if ["/health", "/conversions"].contains(&self.route_prefix.as_str()) {
            return Err(anyhow!("route prefix is reserved: {}", self.route_prefix));
        }
        if self.route_prefix.ends_with('/') {
            return Err(anyhow!(
                "route prefix must not end with '/': {}",
                self.route_prefix
            ));
        }
        self.conversion.validate()
    }

    pub fn structured_logging(&self) -> bool {
        self.env != LOCAL_ENV
    }

    pub fn instance_id(&self) -> String {
        self.telemetry
            .instance_id
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.env, Uuid::new_v4()))
    }
}

/// External program run once per qualifying write as
/// `program [args...] <input path> <output path>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConverterCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Added to the inherited environment.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl Default for ConverterCommand {
    fn default() -> Self {
        ConverterCommand {
            program: "python3".to_string(),
            args: vec!["scripts/convert.py".to_string()],
            working_dir: None,
            env: HashMap::new(),
        }
    }
}

#[serde_inline_default]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionConfig {
    #[serde_inline_default(true)]
    pub enabled: bool,
    /// First mapped key segment that marks an item as a document.
    #[serde_inline_default("documents".to_string())]
    pub category: String,
    #[serde_inline_default(default_allowed_extensions())]
    pub allowed_extensions: Vec<String>,
    #[serde_inline_default(".md".to_string())]
    pub derived_extension: String,
    #[serde(default)]
    pub converter: ConverterCommand,
    #[serde_inline_default(300)]
    pub timeout_secs: u64,
    #[serde_inline_default(4)]
    pub max_concurrent_jobs: usize,
    /// Per stream cap on captured stdout/stderr.
    #[serde_inline_default(64 * 1024)]
    pub max_captured_output_bytes: usize,
    #[serde_inline_default(1024)]
    pub max_retained_outcomes: usize,
    /// Treat a zero exit without a non-empty output file as a failure.
    #[serde_inline_default(false)]
    pub verify_artifact: bool,
}

fn default_allowed_extensions() -> Vec<String> {
    [".pdf", ".txt", ".pptx", ".docx", ".xlsx", ".xls"]
        .iter()
        .map(|ext| ext.to_string())
        .collect()
}

impl Default for ConversionConfig {
    fn default() -> Self {
        ConversionConfig {
            enabled: true,
            category: "documents".to_string(),
            allowed_extensions: default_allowed_extensions(),
            derived_extension: ".md".to_string(),
            converter: Default::default(),
            timeout_secs: 300,
            max_concurrent_jobs: 4,
            max_captured_output_bytes: 64 * 1024,
            max_retained_outcomes: 1024,
            verify_artifact: false,
        }
    }
}

impl ConversionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        for ext in self
            .allowed_extensions
            .iter()
            .chain(std::iter::once(&self.derived_extension))
        {
            if parse_extension(ext).is_none() {
                return Err(anyhow!(
                    "invalid extension {:?}: expected '.' followed by letters or digits",
                    ext
                ));
            }
        }
        if self.category.is_empty() {
            return Err(anyhow!("conversion category must not be empty"));
        }
        if self.enabled && self.converter.program.is_empty() {
            return Err(anyhow!("converter program must not be empty"));
        }
        if self.max_concurrent_jobs == 0 {
            return Err(anyhow!("max_concurrent_jobs must be at least 1"));
        }
        if self.timeout_secs == 0 {
            return Err(anyhow!("conversion timeout must be at least 1 second"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthorizationConfig {
    #[serde(default)]
    pub rules: Vec<AuthorizationRule>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TracingExporter {
    Stdout,
    Otlp,
}

#[serde_inline_default]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub enable_metrics: bool,
    // OTLP grpc endpoint for traces and metrics. Falls back to
    // OTEL_EXPORTER_OTLP_ENDPOINT or localhost:4317.
    #[serde(default)]
    pub endpoint: Option<String>,
    // No traces are exported when unset.
    #[serde(default)]
    pub tracing_exporter: Option<TracingExporter>,
    #[serde(with = "duration_serde")]
    #[serde_inline_default(Duration::from_secs(10))]
    pub metrics_interval: Duration,
    // Daily rotated log file, in addition to stdout.
    #[serde(default)]
    pub local_log_file: Option<String>,
    #[serde(default)]
    pub instance_id: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enable_metrics: false,
            endpoint: None,
            tracing_exporter: None,
            metrics_interval: Duration::from_secs(10),
            local_log_file: None,
            instance_id: None,
        }
    }
}

mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let seconds = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(seconds))
    }
}

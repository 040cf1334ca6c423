//! # Configuration Management
//!
//! Loads application configuration from multiple sources:
//! - TOML configuration file (config.toml)
//! - Environment variables (with APP_ prefix, `__` between nesting levels)
//! - Well-known deployment variables (HOST, PORT, TINGWU_APP_KEY, STORAGE_BUCKET, ...)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Well-known deployment variables
//! 2. APP_ environment variables (APP_SERVER__PORT, APP_REMOTE__APP_KEY, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! ## Capability Check:
//! [`AppConfig::is_remote_available`] is the single place that decides whether the
//! remote transcription provider may be used. It is evaluated per call by the router,
//! never by probing the network.

use crate::device::DevicePreference;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Lower bound for signed upload URLs; the remote job reads the file asynchronously.
pub const MIN_SIGNED_URL_TTL_SECS: u64 = 3 * 60 * 60;

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// Each section maps to one component (server, pipeline, local model, remote job,
/// object storage, history), so a component only ever sees the slice it needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub pipeline: PipelineConfig,
    pub local: LocalConfig,
    pub remote: RemoteConfig,
    pub object_storage: ObjectStorageConfig,
    pub history: HistoryConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Where task artifacts and the history index live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub artifacts_dir: String,
}

/// Task pipeline tuning.
///
/// ## Fields:
/// - `max_concurrent_tasks`: upper bound of stage workers running at the same time
/// - `keyword_count`: how many tags the keyword extractor derives per finished task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub max_concurrent_tasks: usize,
    pub keyword_count: usize,
}

/// Local Whisper inference settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    /// Model used when the caller does not ask for one ("tiny", "base", "small", ...)
    pub default_model: String,
    /// Compute device preference ("auto", "cpu", "cuda", "metal")
    pub device: String,
    /// Hugging Face cache directory; the hub default is used when unset
    pub model_cache_dir: Option<String>,
}

/// Remote (Tingwu) transcription job settings.
///
/// ## Retry budgets:
/// `max_retries` covers upload, submit and result download; each poll iteration only
/// gets `poll_max_retries`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub enabled: bool,
    pub access_key_id: Option<String>,
    pub access_key_secret: Option<String>,
    pub security_token: Option<String>,
    pub app_key: Option<String>,
    pub endpoint: String,
    pub api_version: String,
    pub source_language: String,
    pub poll_interval_secs: u64,
    pub poll_timeout_secs: u64,
    pub max_retries: u32,
    pub poll_max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub request_timeout_secs: u64,
}

/// Object storage used to hand audio to the remote service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectStorageConfig {
    /// "oss" (Aliyun) or "cos" (Tencent)
    pub provider: Option<String>,
    pub bucket: Option<String>,
    pub region: Option<String>,
    pub endpoint: Option<String>,
    pub prefix: String,
    pub signed_url_ttl_secs: u64,
    /// Tencent COS credentials (OSS reuses the remote access key pair)
    pub secret_id: Option<String>,
    pub secret_key: Option<String>,
}

/// History index settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    pub file_name: String,
    pub lock_timeout_secs: u64,
    pub max_page_size: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            storage: StorageConfig {
                artifacts_dir: "artifacts".to_string(),
            },
            pipeline: PipelineConfig {
                max_concurrent_tasks: 4,
                keyword_count: 5,
            },
            local: LocalConfig {
                default_model: "base".to_string(),
                device: "auto".to_string(),
                model_cache_dir: None,
            },
            remote: RemoteConfig {
                enabled: false,
                access_key_id: None,
                access_key_secret: None,
                security_token: None,
                app_key: None,
                endpoint: "tingwu.cn-beijing.aliyuncs.com".to_string(),
                api_version: "2023-09-30".to_string(),
                source_language: "cn".to_string(),
                poll_interval_secs: 5,
                poll_timeout_secs: 600,
                max_retries: 3,
                poll_max_retries: 2,
                initial_backoff_ms: 2_000,
                max_backoff_ms: 30_000,
                request_timeout_secs: 60,
            },
            object_storage: ObjectStorageConfig {
                provider: None,
                bucket: None,
                region: None,
                endpoint: None,
                prefix: "tingwu-audio".to_string(),
                signed_url_ttl_secs: MIN_SIGNED_URL_TTL_SECS,
                secret_id: None,
                secret_key: None,
            },
            history: HistoryConfig {
                file_name: "history.json".to_string(),
                lock_timeout_secs: 10,
                max_page_size: 100,
            },
        }
    }
}

/// Deployment variables that override a nested key directly.
const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("HOST", "server.host"),
    ("PORT", "server.port"),
    ("ARTIFACTS_DIR", "storage.artifacts_dir"),
    ("TINGWU_APP_KEY", "remote.app_key"),
    ("ALIBABA_CLOUD_ACCESS_KEY_ID", "remote.access_key_id"),
    ("ALIBABA_CLOUD_ACCESS_KEY_SECRET", "remote.access_key_secret"),
    ("ALIBABA_CLOUD_SECURITY_TOKEN", "remote.security_token"),
    ("STORAGE_PROVIDER", "object_storage.provider"),
    ("STORAGE_BUCKET", "object_storage.bucket"),
    ("STORAGE_REGION", "object_storage.region"),
    ("STORAGE_ENDPOINT", "object_storage.endpoint"),
    ("STORAGE_PREFIX", "object_storage.prefix"),
    ("TENCENT_SECRET_ID", "object_storage.secret_id"),
    ("TENCENT_SECRET_KEY", "object_storage.secret_key"),
];

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override server port
    /// - `APP_LOCAL__DEFAULT_MODEL=small`: Override the local Whisper model
    /// - `TINGWU_ENABLED=1`: Turn the remote provider on
    /// - `STORAGE_BUCKET=my-bucket`: Bucket used for remote uploads
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        for (var, key) in ENV_OVERRIDES {
            if let Ok(value) = env::var(var) {
                if !value.trim().is_empty() {
                    settings = settings.set_override(*key, value)?;
                }
            }
        }

        if let Ok(flag) = env::var("TINGWU_ENABLED") {
            settings = settings.set_override("remote.enabled", parse_flag(&flag))?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.pipeline.max_concurrent_tasks == 0 {
            return Err(anyhow::anyhow!("Max concurrent tasks must be greater than 0"));
        }

        if self.remote.poll_interval_secs == 0 {
            return Err(anyhow::anyhow!("Remote poll interval must be greater than 0"));
        }

        if self.remote.poll_timeout_secs < self.remote.poll_interval_secs {
            return Err(anyhow::anyhow!(
                "Remote poll timeout ({}s) is shorter than the poll interval ({}s)",
                self.remote.poll_timeout_secs,
                self.remote.poll_interval_secs
            ));
        }

        if self.object_storage.signed_url_ttl_secs < MIN_SIGNED_URL_TTL_SECS {
            return Err(anyhow::anyhow!(
                "Signed URL TTL must be at least {}s, got {}s",
                MIN_SIGNED_URL_TTL_SECS,
                self.object_storage.signed_url_ttl_secs
            ));
        }

        if self.history.lock_timeout_secs == 0 {
            return Err(anyhow::anyhow!("History lock timeout must be greater than 0"));
        }

        if self.history.max_page_size == 0 {
            return Err(anyhow::anyhow!("History page size must be greater than 0"));
        }

        self.local
            .device
            .parse::<DevicePreference>()
            .map_err(|e| anyhow::anyhow!(e))?;

        Ok(())
    }

    /// Whether the remote provider has everything it needs to run.
    pub fn is_remote_available(&self) -> bool {
        self.remote_missing_fields().is_empty()
    }

    /// Names of the settings that keep the remote provider unavailable.
    pub fn remote_missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        let set = |value: &Option<String>| value.as_deref().is_some_and(|v| !v.trim().is_empty());

        if !self.remote.enabled {
            missing.push("TINGWU_ENABLED");
        }
        if !set(&self.remote.access_key_id) {
            missing.push("ALIBABA_CLOUD_ACCESS_KEY_ID");
        }
        if !set(&self.remote.access_key_secret) {
            missing.push("ALIBABA_CLOUD_ACCESS_KEY_SECRET");
        }
        if !set(&self.remote.app_key) {
            missing.push("TINGWU_APP_KEY");
        }

        match self.object_storage.provider.as_deref().map(str::to_lowercase).as_deref() {
            Some("oss") => {}
            Some("cos") => {
                if !set(&self.object_storage.secret_id) {
                    missing.push("TENCENT_SECRET_ID");
                }
                if !set(&self.object_storage.secret_key) {
                    missing.push("TENCENT_SECRET_KEY");
                }
            }
            _ => missing.push("STORAGE_PROVIDER"),
        }
        if !set(&self.object_storage.bucket) {
            missing.push("STORAGE_BUCKET");
        }
        if !set(&self.object_storage.region) {
            missing.push("STORAGE_REGION");
        }

        missing
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        PathBuf::from(&self.storage.artifacts_dir)
    }

    pub fn history_path(&self) -> PathBuf {
        self.artifacts_dir().join(&self.history.file_name)
    }

    pub fn history_lock_timeout(&self) -> Duration {
        Duration::from_secs(self.history.lock_timeout_secs)
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

//! Provider selection.
//!
//! The provider name comes from request input, so parsing never fails: anything
//! unrecognised is logged and treated as local. Remote requests are checked against
//! the configuration before any network call is made.

use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

use super::{AsrBackend, TranscribeOptions};
use crate::config::AppConfig;
use crate::error::CoreError;
use crate::remote::RemoteJobClient;
use crate::transcript::Transcript;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    Local,
    Remote,
}

impl Provider {
    /// Parse a caller-supplied provider name, falling back to local.
    pub fn parse(input: Option<&str>) -> Provider {
        let Some(raw) = input.map(str::trim).filter(|s| !s.is_empty()) else {
            return Provider::Local;
        };

        match raw.to_lowercase().as_str() {
            "whisper" | "local" => Provider::Local,
            "tingwu" | "remote" => Provider::Remote,
            _ => {
                tracing::warn!(provider = %raw, "Unknown provider, falling back to local whisper");
                Provider::Local
            }
        }
    }

    /// Name recorded in task results and history.
    pub fn name(&self) -> &'static str {
        match self {
            Provider::Local => "whisper",
            Provider::Remote => "tingwu",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Availability report for one provider.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderInfo {
    pub name: &'static str,
    pub available: bool,
    pub missing: Vec<&'static str>,
}

pub struct TranscriptionRouter {
    local: Arc<dyn AsrBackend>,
    remote: Option<Arc<dyn AsrBackend>>,
    remote_missing: Vec<&'static str>,
}

impl TranscriptionRouter {
    /// ## Parameters:
    /// - **local**: Always-present backend
    /// - **remote**: Remote backend, if one could be built
    /// - **remote_missing**: Settings the remote provider still lacks; non-empty means unavailable
    pub fn new(
        local: Arc<dyn AsrBackend>,
        remote: Option<Arc<dyn AsrBackend>>,
        remote_missing: Vec<&'static str>,
    ) -> Self {
        Self {
            local,
            remote,
            remote_missing,
        }
    }

    pub fn from_config(config: &AppConfig, local: Arc<dyn AsrBackend>) -> Self {
        let remote_missing = config.remote_missing_fields();
        let remote = if remote_missing.is_empty() {
            RemoteJobClient::from_config(config).map(|client| Arc::new(client) as Arc<dyn AsrBackend>)
        } else {
            tracing::info!(missing = ?remote_missing, "Remote transcription disabled");
            None
        };
        Self::new(local, remote, remote_missing)
    }

    pub fn is_remote_available(&self) -> bool {
        self.remote_missing.is_empty() && self.remote.is_some()
    }

    fn backend(&self, provider: Provider) -> Result<&Arc<dyn AsrBackend>, CoreError> {
        match provider {
            Provider::Local => Ok(&self.local),
            Provider::Remote if !self.remote_missing.is_empty() => {
                Err(CoreError::ProviderUnavailable(format!(
                    "tingwu is not configured, missing: {}",
                    self.remote_missing.join(", ")
                )))
            }
            Provider::Remote => self.remote.as_ref().ok_or_else(|| {
                CoreError::ProviderUnavailable("tingwu client could not be initialised".to_string())
            }),
        }
    }

    /// Transcribe with the chosen provider.
    pub async fn transcribe(
        &self,
        audio_path: &Path,
        provider: Provider,
        options: &TranscribeOptions,
    ) -> Result<Transcript, CoreError> {
        let backend = self.backend(provider)?;
        tracing::info!(provider = %provider, path = %audio_path.display(), "Routing transcription");
        backend.transcribe(audio_path, options).await
    }

    pub fn providers(&self) -> Vec<ProviderInfo> {
        vec![
            ProviderInfo {
                name: Provider::Local.name(),
                available: true,
                missing: Vec::new(),
            },
            ProviderInfo {
                name: Provider::Remote.name(),
                available: self.is_remote_available(),
                missing: self.remote_missing.clone(),
            },
        ]
    }
}

//! # Local Transcriber
//!
//! Runs Whisper on this machine. Models are loaded from the HuggingFace cache on
//! first use and stay resident in a [`ModelCache`] keyed by model and device.
//!
//! ## Failure Modes:
//! - Missing audio file: rejected before any model work starts
//! - Unknown model name: caller error
//! - Model not downloaded: reported as not available; use [`LocalTranscriber::download_model`]
//! - Decode or inference failure: reported as an inference error
//!
//! No timeout is applied to inference.

use async_trait::async_trait;
use hf_hub::api::tokio::ApiBuilder;
use hf_hub::Cache;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, PoisonError};

use super::cache::{ModelCache, ModelKey};
use super::model::{ModelFiles, ModelInfo, ModelSize, WhisperModel};
use super::{audio, AsrBackend, TranscribeOptions};
use crate::config::LocalConfig;
use crate::device::{device_label, DevicePreference};
use crate::error::CoreError;
use crate::transcript::Transcript;

#[derive(Clone)]
pub struct LocalTranscriber {
    cache: Arc<ModelCache<WhisperModel>>,
    hub_cache: Cache,
    cache_dir: Option<PathBuf>,
    default_model: String,
    device: DevicePreference,
}

impl LocalTranscriber {
    pub fn new(config: &LocalConfig) -> Self {
        let cache_dir = config.model_cache_dir.as_ref().map(PathBuf::from);
        let hub_cache = match &cache_dir {
            Some(dir) => Cache::new(dir.clone()),
            None => Cache::default(),
        };
        let device = DevicePreference::from_str(&config.device).unwrap_or_else(|e| {
            tracing::warn!("{}, falling back to auto device selection", e);
            DevicePreference::Auto
        });

        Self {
            cache: Arc::new(ModelCache::new()),
            hub_cache,
            cache_dir,
            default_model: config.default_model.clone(),
            device,
        }
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    /// Transcribe `audio_path` synchronously. Call from a blocking thread.
    ///
    /// ## Parameters:
    /// - **model**: Model name, the configured default when `None`
    /// - **language**: ISO hint, detected when `None`
    /// - **prompt**: Initial prompt for the decoder
    pub fn run(
        &self,
        audio_path: &Path,
        model: Option<&str>,
        language: Option<&str>,
        prompt: Option<&str>,
    ) -> Result<Transcript, CoreError> {
        if !audio_path.is_file() {
            return Err(CoreError::InputNotFound(audio_path.to_path_buf()));
        }

        let name = model
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(&self.default_model);
        let size = ModelSize::from_str(name).map_err(|_| CoreError::UnknownModel(name.to_string()))?;

        let files = ModelFiles::locate(&self.hub_cache, size).ok_or_else(|| {
            CoreError::ModelNotAvailable(format!(
                "Whisper '{}' is not downloaded, download it before transcribing",
                size
            ))
        })?;

        let device = self.device.resolve();
        let key = ModelKey::new(size.to_string(), device_label(&device));
        let shared = self
            .cache
            .get_or_load(&key, || WhisperModel::load(&files, size, device))
            .map_err(|e| CoreError::Inference(format!("Failed to load model {}: {}", size, e)))?;

        let pcm = audio::decode_to_pcm(audio_path)
            .map_err(|e| CoreError::Inference(format!("Failed to decode audio: {}", e)))?;
        tracing::info!(
            model = %size,
            device = %key.device,
            "Transcribing {:.1}s of audio from {}",
            pcm.len() as f64 / audio::TARGET_SAMPLE_RATE as f64,
            audio_path.display()
        );

        let mut whisper = shared.lock().unwrap_or_else(PoisonError::into_inner);
        whisper
            .transcribe(&pcm, language, prompt)
            .map_err(|e| CoreError::Inference(e.to_string()))
    }

    /// Fetch a model into the local cache.
    pub async fn download_model(&self, name: &str) -> Result<ModelInfo, CoreError> {
        let size = ModelSize::from_str(name).map_err(|_| CoreError::UnknownModel(name.to_string()))?;

        let mut builder = ApiBuilder::new().with_progress(false);
        if let Some(dir) = &self.cache_dir {
            builder = builder.with_cache_dir(dir.clone());
        }
        let api = builder
            .build()
            .map_err(|e| CoreError::Download(format!("Failed to initialise HuggingFace API: {}", e)))?;

        ModelFiles::download(&api, size)
            .await
            .map_err(|e| CoreError::Download(e.to_string()))?;
        tracing::info!("Whisper {} downloaded", size);

        Ok(self.info(size))
    }

    pub fn is_downloaded(&self, size: ModelSize) -> bool {
        ModelFiles::locate(&self.hub_cache, size).is_some()
    }

    pub fn info(&self, size: ModelSize) -> ModelInfo {
        let name = size.to_string();
        let loaded = self.cache.loaded_keys().iter().any(|key| key.model == name);
        ModelInfo::new(size, self.is_downloaded(size), loaded)
    }

    /// Every supported checkpoint with its download and load status.
    pub fn list_models(&self) -> Vec<ModelInfo> {
        ModelSize::ALL.iter().map(|size| self.info(*size)).collect()
    }
}

#[async_trait]
impl AsrBackend for LocalTranscriber {
    async fn transcribe(
        &self,
        audio_path: &Path,
        options: &TranscribeOptions,
    ) -> Result<Transcript, CoreError> {
        let this = self.clone();
        let audio_path = audio_path.to_path_buf();
        let options = options.clone();

        tokio::task::spawn_blocking(move || {
            this.run(
                &audio_path,
                options.model.as_deref(),
                options.language.as_deref(),
                options.prompt.as_deref(),
            )
        })
        .await
        .map_err(|e| CoreError::Inference(format!("Transcription worker failed: {}", e)))?
    }
}

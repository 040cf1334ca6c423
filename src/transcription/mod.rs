//! # Transcription Module
//!
//! Speech-to-text backends and the router that picks between them.
//!
//! ## Key Components:
//! - **[`AsrBackend`]**: the one method both backends implement
//! - **Local**: Whisper via Candle, models cached per (model, device)
//! - **Remote**: [`crate::remote::RemoteJobClient`] (object storage upload + async job)
//! - **Router**: maps the caller's provider choice to a backend, checking availability first
//!
//! ## Whisper Model Sizes:
//! - **tiny / tiny.en**: fastest, least accurate
//! - **base / base.en**: good balance for development
//! - **small / small.en**: better accuracy
//! - **medium / medium.en**: handles technical vocabulary
//! - **large**: best accuracy, slowest
//! - **turbo**: large encoder with a pruned decoder

pub mod audio; // Media decoding, resampling, mel filters
pub mod cache; // Per-(model, device) model cache
pub mod local; // Local Whisper transcriber
pub mod model; // Whisper model loading and decoding
pub mod router; // Provider selection

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::CoreError;
use crate::transcript::Transcript;

pub use local::LocalTranscriber;
pub use router::{Provider, ProviderInfo, TranscriptionRouter};

/// Options accepted by every provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TranscribeOptions {
    /// Local model name; ignored by the remote provider
    pub model: Option<String>,
    /// ISO language code, auto-detected when unset
    pub language: Option<String>,
    /// Vocabulary or style hint
    pub prompt: Option<String>,
}

/// A speech recognition backend.
#[async_trait]
pub trait AsrBackend: Send + Sync {
    async fn transcribe(
        &self,
        audio_path: &Path,
        options: &TranscribeOptions,
    ) -> Result<Transcript, CoreError>;
}

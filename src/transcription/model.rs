//! # Whisper Model
//!
//! Loads a Whisper checkpoint with Candle and runs greedy decoding over 30 second
//! mel windows.
//!
//! ## Model Files:
//! Each size lives in its own HuggingFace repository and needs three files:
//! `config.json`, `tokenizer.json` and `model.safetensors`. Files are resolved
//! from the local hub cache; [`ModelFiles::download`] fetches missing ones.
//!
//! ## Decoding:
//! 1. Log-mel spectrogram of the whole file
//! 2. Language detection on the first window (multilingual models, no hint)
//! 3. Per window: encoder forward, then greedy token-by-token decoding
//! 4. One transcript segment per window, no speaker labels

use anyhow::{anyhow, Context, Result};
use candle_core::{Device, IndexOp, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::whisper::{self as m, Config};
use hf_hub::api::tokio::Api;
use hf_hub::Cache;
use serde::Serialize;
use std::path::PathBuf;
use tokenizers::Tokenizer;

use super::audio;
use crate::transcript::{Transcript, TranscriptSegment};

const CONFIG_FILE: &str = "config.json";
const TOKENIZER_FILE: &str = "tokenizer.json";
const WEIGHTS_FILE: &str = "model.safetensors";
const N_FFT: usize = 400;

/// Language codes in Whisper token order.
const LANGUAGES: &[&str] = &[
    "en", "zh", "de", "es", "ru", "ko", "fr", "ja", "pt", "tr", "pl", "ca", "nl", "ar", "sv", "it",
    "id", "hi", "fi", "vi", "he", "uk", "el", "ms", "cs", "ro", "da", "hu", "ta", "no", "th", "ur",
    "hr", "bg", "lt", "la", "mi", "ml", "cy", "sk", "te", "fa", "lv", "bn", "sr", "az", "sl", "kn",
    "et", "mk", "br", "eu", "is", "hy", "ne", "mn", "bs", "kk", "sq", "sw", "gl", "mr", "pa", "si",
    "km", "sn", "yo", "so", "af", "oc", "ka", "be", "tg", "sd", "gu", "am", "yi", "lo", "uz", "fo",
    "ht", "ps", "tk", "nn", "mt", "sa", "lb", "my", "bo", "tl", "mg", "as", "tt", "haw", "ln", "ha",
    "ba", "jw", "su",
];

/// Supported Whisper checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ModelSize {
    Tiny,
    TinyEn,
    Base,
    BaseEn,
    Small,
    SmallEn,
    Medium,
    MediumEn,
    Large,
    Turbo,
}

impl ModelSize {
    pub const ALL: [ModelSize; 10] = [
        ModelSize::Tiny,
        ModelSize::TinyEn,
        ModelSize::Base,
        ModelSize::BaseEn,
        ModelSize::Small,
        ModelSize::SmallEn,
        ModelSize::Medium,
        ModelSize::MediumEn,
        ModelSize::Large,
        ModelSize::Turbo,
    ];

    /// HuggingFace repository holding this checkpoint.
    pub fn repo_name(&self) -> &'static str {
        match self {
            ModelSize::Tiny => "openai/whisper-tiny",
            ModelSize::TinyEn => "openai/whisper-tiny.en",
            ModelSize::Base => "openai/whisper-base",
            ModelSize::BaseEn => "openai/whisper-base.en",
            ModelSize::Small => "openai/whisper-small",
            ModelSize::SmallEn => "openai/whisper-small.en",
            ModelSize::Medium => "openai/whisper-medium",
            ModelSize::MediumEn => "openai/whisper-medium.en",
            ModelSize::Large => "openai/whisper-large-v3",
            ModelSize::Turbo => "openai/whisper-large-v3-turbo",
        }
    }

    /// Approximate download size in MB.
    pub fn size_mb(&self) -> u32 {
        match self {
            ModelSize::Tiny | ModelSize::TinyEn => 151,
            ModelSize::Base | ModelSize::BaseEn => 290,
            ModelSize::Small | ModelSize::SmallEn => 967,
            ModelSize::Medium | ModelSize::MediumEn => 3060,
            ModelSize::Large => 3090,
            ModelSize::Turbo => 1620,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ModelSize::Tiny | ModelSize::TinyEn => "Fastest, basic accuracy",
            ModelSize::Base | ModelSize::BaseEn => "Fast, good for testing",
            ModelSize::Small | ModelSize::SmallEn => "Balanced speed and accuracy",
            ModelSize::Medium | ModelSize::MediumEn => "Good accuracy, handles technical vocabulary",
            ModelSize::Large => "Best accuracy, slowest processing",
            ModelSize::Turbo => "Near large accuracy with a pruned decoder",
        }
    }

    pub fn is_english_only(&self) -> bool {
        matches!(
            self,
            ModelSize::TinyEn | ModelSize::BaseEn | ModelSize::SmallEn | ModelSize::MediumEn
        )
    }
}

impl std::str::FromStr for ModelSize {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "tiny" => Ok(ModelSize::Tiny),
            "tiny.en" => Ok(ModelSize::TinyEn),
            "base" => Ok(ModelSize::Base),
            "base.en" => Ok(ModelSize::BaseEn),
            "small" => Ok(ModelSize::Small),
            "small.en" => Ok(ModelSize::SmallEn),
            "medium" => Ok(ModelSize::Medium),
            "medium.en" => Ok(ModelSize::MediumEn),
            "large" | "large-v3" => Ok(ModelSize::Large),
            "turbo" | "large-v3-turbo" => Ok(ModelSize::Turbo),
            _ => Err(anyhow!("Unknown model size: {}", s)),
        }
    }
}

impl std::fmt::Display for ModelSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ModelSize::Tiny => "tiny",
            ModelSize::TinyEn => "tiny.en",
            ModelSize::Base => "base",
            ModelSize::BaseEn => "base.en",
            ModelSize::Small => "small",
            ModelSize::SmallEn => "small.en",
            ModelSize::Medium => "medium",
            ModelSize::MediumEn => "medium.en",
            ModelSize::Large => "large",
            ModelSize::Turbo => "turbo",
        };
        write!(f, "{}", name)
    }
}

/// Catalogue entry returned by the models endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub name: String,
    pub repo: &'static str,
    pub description: &'static str,
    pub size_mb: u32,
    pub english_only: bool,
    pub downloaded: bool,
    pub loaded: bool,
}

impl ModelInfo {
    pub fn new(size: ModelSize, downloaded: bool, loaded: bool) -> Self {
        Self {
            name: size.to_string(),
            repo: size.repo_name(),
            description: size.description(),
            size_mb: size.size_mb(),
            english_only: size.is_english_only(),
            downloaded,
            loaded,
        }
    }
}

/// Paths of a checkpoint's files on local disk.
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub weights: PathBuf,
}

impl ModelFiles {
    /// Resolve files from the hub cache without touching the network.
    pub fn locate(cache: &Cache, size: ModelSize) -> Option<Self> {
        let repo = cache.model(size.repo_name().to_string());
        Some(Self {
            config: repo.get(CONFIG_FILE)?,
            tokenizer: repo.get(TOKENIZER_FILE)?,
            weights: repo.get(WEIGHTS_FILE)?,
        })
    }

    /// Fetch all files into the cache the `api` was built with.
    pub async fn download(api: &Api, size: ModelSize) -> Result<Self> {
        tracing::info!("Downloading Whisper {} from {}", size, size.repo_name());
        let repo = api.model(size.repo_name().to_string());
        let fetch = |name: &'static str| {
            let repo = &repo;
            async move {
                repo.get(name)
                    .await
                    .map_err(|e| anyhow!("Failed to download {} from {}: {}", name, size.repo_name(), e))
            }
        };

        Ok(Self {
            config: fetch(CONFIG_FILE).await?,
            tokenizer: fetch(TOKENIZER_FILE).await?,
            weights: fetch(WEIGHTS_FILE).await?,
        })
    }
}

/// Special token ids looked up from the tokenizer.
struct SpecialTokens {
    sot: u32,
    eot: u32,
    transcribe: u32,
    no_timestamps: u32,
    start_of_prev: Option<u32>,
}

/// A loaded Whisper model. Not shareable across threads while decoding; callers
/// wrap it in a mutex.
pub struct WhisperModel {
    model: m::model::Whisper,
    config: Config,
    device: Device,
    size: ModelSize,
    tokenizer: Tokenizer,
    mel_filters: Vec<f32>,
    tokens: SpecialTokens,
    suppress: Tensor,
}

impl WhisperModel {
    /// Load weights onto `device`.
    ///
    /// ## Parameters:
    /// - **files**: Paths resolved by [`ModelFiles::locate`]
    /// - **size**: Which checkpoint the files belong to
    /// - **device**: CPU, CUDA or Metal
    pub fn load(files: &ModelFiles, size: ModelSize, device: Device) -> Result<Self> {
        tracing::info!("Loading Whisper {} model...", size);
        let start_time = std::time::Instant::now();

        let config: Config = serde_json::from_reader(
            std::fs::File::open(&files.config)
                .with_context(|| format!("Failed to open {}", files.config.display()))?,
        )?;
        let tokenizer = Tokenizer::from_file(&files.tokenizer)
            .map_err(|e| anyhow!("Failed to load tokenizer: {}", e))?;

        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[files.weights.clone()], m::DTYPE, &device)?
        };
        let model = m::model::Whisper::load(&vb, config.clone())?;

        let token = |name: &str| {
            tokenizer
                .token_to_id(name)
                .ok_or_else(|| anyhow!("Tokenizer has no {} token", name))
        };
        let tokens = SpecialTokens {
            sot: token(m::SOT_TOKEN)?,
            eot: token(m::EOT_TOKEN)?,
            transcribe: token(m::TRANSCRIBE_TOKEN)?,
            no_timestamps: token(m::NO_TIMESTAMPS_TOKEN)?,
            start_of_prev: tokenizer.token_to_id("<|startofprev|>"),
        };

        let suppress: Vec<f32> = (0..config.vocab_size as u32)
            .map(|i| {
                if config.suppress_tokens.contains(&i) || i == tokens.no_timestamps {
                    f32::NEG_INFINITY
                } else {
                    0.0
                }
            })
            .collect();
        let suppress = Tensor::new(suppress.as_slice(), &device)?;

        let mel_filters =
            audio::mel_filters(config.num_mel_bins, N_FFT, audio::TARGET_SAMPLE_RATE);

        tracing::info!(
            "Whisper {} model loaded in {:.2}s",
            size,
            start_time.elapsed().as_secs_f64()
        );

        Ok(Self {
            model,
            config,
            device,
            size,
            tokenizer,
            mel_filters,
            tokens,
            suppress,
        })
    }

    pub fn size(&self) -> ModelSize {
        self.size
    }

    /// Transcribe 16 kHz mono PCM.
    ///
    /// ## Parameters:
    /// - **pcm**: Samples in [-1.0, 1.0]
    /// - **language**: ISO code hint; detected when absent on multilingual models
    /// - **prompt**: Initial prompt biasing vocabulary and style
    ///
    /// ## Returns:
    /// One segment per 30 second window, plus the language that was used.
    pub fn transcribe(
        &mut self,
        pcm: &[f32],
        language: Option<&str>,
        prompt: Option<&str>,
    ) -> Result<Transcript> {
        if pcm.is_empty() {
            return Err(anyhow!("Audio data is empty"));
        }
        let start_time = std::time::Instant::now();

        let n_mels = self.config.num_mel_bins;
        let mel = m::audio::pcm_to_mel(&self.config, pcm, &self.mel_filters);
        let mel_len = mel.len();
        let mel = Tensor::from_vec(mel, (1, n_mels, mel_len / n_mels), &self.device)?;
        let (_, _, content_frames) = mel.dims3()?;

        let (language_token, language_code) = self.resolve_language(&mel, language)?;
        let prompt_tokens = self.prompt_tokens(prompt)?;

        let audio_secs = pcm.len() as f64 / m::SAMPLE_RATE as f64;
        let mut segments = Vec::new();
        let mut seek = 0;
        while seek < content_frames {
            let segment_size = usize::min(content_frames - seek, m::N_FRAMES);
            let (start, end) = window_bounds(seek, segment_size, audio_secs);

            let mel_segment = mel.narrow(2, seek, segment_size)?;
            let text = self.decode_window(&mel_segment, language_token, &prompt_tokens)?;
            tracing::debug!("{:.1}s-{:.1}s: {}", start, end, text);

            segments.push(TranscriptSegment::new(start, end, text, ""));
            seek += segment_size;
        }

        tracing::debug!(
            "Transcribed {:.2}s of audio in {:.2}s",
            audio_secs,
            start_time.elapsed().as_secs_f64()
        );

        Ok(Transcript::from_segments(segments, language_code))
    }

    /// Pick the language token to force, detecting it when needed.
    fn resolve_language(
        &mut self,
        mel: &Tensor,
        hint: Option<&str>,
    ) -> Result<(Option<u32>, String)> {
        if self.size.is_english_only() {
            return Ok((None, "en".to_string()));
        }

        if let Some(code) = hint.map(|h| h.trim().to_lowercase()).filter(|h| !h.is_empty()) {
            match self.tokenizer.token_to_id(&format!("<|{}|>", code)) {
                Some(token) => return Ok((Some(token), code)),
                None => tracing::warn!("Unsupported language hint '{}', detecting instead", code),
            }
        }

        let (token, code) = self.detect_language(mel)?;
        tracing::info!("Detected language: {}", code);
        Ok((Some(token), code.to_string()))
    }

    fn detect_language(&mut self, mel: &Tensor) -> Result<(u32, &'static str)> {
        let (_, _, frames) = mel.dims3()?;
        let mel = mel.narrow(2, 0, usize::min(frames, m::N_FRAMES))?;
        let audio_features = self.model.encoder.forward(&mel, true)?;

        let tokens = Tensor::new(&[[self.tokens.sot]], &self.device)?;
        let ys = self.model.decoder.forward(&tokens, &audio_features, true)?;
        let logits = self.model.decoder.final_linear(&ys.i(..1)?)?.i(0)?.i(0)?;
        let logits = logits.to_vec1::<f32>()?;

        LANGUAGES
            .iter()
            .filter_map(|code| {
                let token = self.tokenizer.token_to_id(&format!("<|{}|>", code))?;
                logits.get(token as usize).map(|score| (token, *code, *score))
            })
            .max_by(|a, b| a.2.total_cmp(&b.2))
            .map(|(token, code, _)| (token, code))
            .ok_or_else(|| anyhow!("Tokenizer has no language tokens"))
    }

    /// `<|startofprev|>` context from the prompt, trimmed to half the context window.
    fn prompt_tokens(&self, prompt: Option<&str>) -> Result<Vec<u32>> {
        let (Some(prompt), Some(start_of_prev)) = (
            prompt.map(str::trim).filter(|p| !p.is_empty()),
            self.tokens.start_of_prev,
        ) else {
            return Ok(Vec::new());
        };

        let encoding = self
            .tokenizer
            .encode(format!(" {}", prompt), false)
            .map_err(|e| anyhow!("Failed to tokenize prompt: {}", e))?;
        let ids = encoding.get_ids();
        let keep = (self.config.max_target_positions / 2).saturating_sub(1);
        let tail = &ids[ids.len().saturating_sub(keep)..];

        let mut tokens = Vec::with_capacity(tail.len() + 1);
        tokens.push(start_of_prev);
        tokens.extend_from_slice(tail);
        Ok(tokens)
    }

    fn decode_window(
        &mut self,
        mel_segment: &Tensor,
        language_token: Option<u32>,
        prompt_tokens: &[u32],
    ) -> Result<String> {
        let audio_features = self.model.encoder.forward(mel_segment, true)?;

        let mut tokens = prompt_tokens.to_vec();
        tokens.push(self.tokens.sot);
        if let Some(language_token) = language_token {
            tokens.push(language_token);
        }
        tokens.push(self.tokens.transcribe);
        tokens.push(self.tokens.no_timestamps);
        let initial_len = tokens.len();

        let sample_len = self.config.max_target_positions / 2;
        for i in 0..sample_len {
            let tokens_t = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
            let ys = self.model.decoder.forward(&tokens_t, &audio_features, i == 0)?;
            let (_, seq_len, _) = ys.dims3()?;
            let logits = self
                .model
                .decoder
                .final_linear(&ys.i((..1, seq_len - 1..))?)?
                .i(0)?
                .i(0)?;
            let logits = logits.broadcast_add(&self.suppress)?;
            let next_token = logits.argmax(0)?.to_scalar::<u32>()?;

            if next_token == self.tokens.eot || tokens.len() >= self.config.max_target_positions {
                break;
            }
            tokens.push(next_token);
        }

        let text = self
            .tokenizer
            .decode(&tokens[initial_len..], true)
            .map_err(|e| anyhow!("Tokenizer decode error: {}", e))?;
        Ok(text.trim().to_string())
    }
}

/// Start and end seconds of a mel window. The mel is padded past the audio, so the
/// end never goes beyond `audio_secs`.
fn window_bounds(seek: usize, frames: usize, audio_secs: f64) -> (f64, f64) {
    let seconds = |frames: usize| (frames * m::HOP_LENGTH) as f64 / m::SAMPLE_RATE as f64;
    let start = seconds(seek);
    let end = (start + seconds(frames)).min(audio_secs).max(start);
    (start, end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_end_stops_at_audio_length() {
        // 10 s of audio still fills a whole 30 s window of mel frames
        assert_eq!(window_bounds(0, m::N_FRAMES, 10.0), (0.0, 10.0));
        assert_eq!(window_bounds(0, m::N_FRAMES, 75.0), (0.0, 30.0));
        assert_eq!(window_bounds(m::N_FRAMES, 1500, 40.5), (30.0, 40.5));
        assert_eq!(window_bounds(2 * m::N_FRAMES, 10, 59.0), (60.0, 60.0));
    }

    #[test]
    fn test_model_size_parsing() {
        assert_eq!("medium".parse::<ModelSize>().unwrap(), ModelSize::Medium);
        assert_eq!("Tiny.EN".parse::<ModelSize>().unwrap(), ModelSize::TinyEn);
        assert_eq!("large-v3-turbo".parse::<ModelSize>().unwrap(), ModelSize::Turbo);
        assert!("huge".parse::<ModelSize>().is_err());
    }

    #[test]
    fn test_names_round_trip() {
        for size in ModelSize::ALL {
            assert_eq!(size.to_string().parse::<ModelSize>().unwrap(), size);
        }
    }

    #[test]
    fn test_english_only_variants() {
        let english: Vec<_> = ModelSize::ALL
            .iter()
            .filter(|s| s.is_english_only())
            .map(|s| s.to_string())
            .collect();
        assert_eq!(english, vec!["tiny.en", "base.en", "small.en", "medium.en"]);
    }

    #[test]
    fn test_model_info() {
        let info = ModelInfo::new(ModelSize::BaseEn, true, false);
        assert_eq!(info.name, "base.en");
        assert_eq!(info.repo, "openai/whisper-base.en");
        assert!(info.english_only);
        assert!(info.downloaded);
        assert!(!info.loaded);
    }

    #[test]
    fn test_locate_in_empty_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(dir.path().to_path_buf());
        assert!(ModelFiles::locate(&cache, ModelSize::Tiny).is_none());
    }

    #[test]
    fn test_language_table() {
        assert_eq!(LANGUAGES.len(), 99);
        assert_eq!(LANGUAGES[0], "en");
        assert_eq!(LANGUAGES[1], "zh");
    }
}

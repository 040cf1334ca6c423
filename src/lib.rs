//! # Podscript Backend - Transcription Orchestration Core
//!
//! Turns a media URL or an uploaded file into a timestamped transcript.
//!
//! ## Layers (leaf to root):
//! - **retry**: backoff and error classification for every remote call
//! - **transcription**: local Whisper inference, model cache and provider routing
//! - **remote**: signed object upload plus the remote job submit/poll client
//! - **pipeline**: the two-stage download → transcribe task state machine
//! - **history**: the file-backed, lock-protected index of finished tasks
//!
//! The HTTP surface (`handlers`, served by `main.rs`) only translates requests into
//! calls on [`pipeline::TaskPipeline`] and [`history::HistoryStore`].

pub mod config;
pub mod device;
pub mod error;
pub mod handlers;
pub mod health;
pub mod history;
pub mod pipeline;
pub mod remote;
pub mod retry;
pub mod state;
pub mod transcript;
pub mod transcription;

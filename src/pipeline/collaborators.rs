//! # Pipeline Collaborators
//!
//! Outbound seams the pipeline calls into, each with a default implementation:
//! - [`MediaFetcher`]: URL to local media file ([`HttpFetcher`], with `yt-dlp` for YouTube)
//! - [`KeywordExtractor`]: transcript text to history tags ([`FrequencyKeywords`])
//! - [`TranscriptFormatter`]: transcript to SRT and Markdown ([`BasicFormatter`])

use async_trait::async_trait;
use futures_util::StreamExt;
use percent_encoding::percent_decode_str;
use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

use crate::error::CoreError;
use crate::remote::storage::sanitize_filename;
use crate::transcript::Transcript;

/// Media fetched for a task.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedMedia {
    pub path: PathBuf,
    pub mime_type: Option<String>,
    /// Human-readable name, used as the history title
    pub title: String,
}

#[async_trait]
pub trait MediaFetcher: Send + Sync {
    /// Download `url` into `dest_dir`.
    async fn fetch(&self, url: &str, dest_dir: &Path) -> Result<FetchedMedia, CoreError>;
}

/// URLs that need a site-specific extractor rather than a plain GET.
pub fn is_site_specific(url: &str) -> bool {
    let url = url.to_lowercase();
    url.contains("youtube.com/watch") || url.contains("youtu.be/") || url.contains("youtube.com/shorts/")
}

/// Last path segment of a URL, percent-decoded. Falls back to the host.
pub fn title_from_url(url: &str) -> String {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    let trimmed = without_query.trim_end_matches('/');
    let segment = trimmed.rsplit('/').next().unwrap_or(trimmed);
    let decoded = percent_decode_str(segment).decode_utf8_lossy().trim().to_string();

    if decoded.is_empty() || decoded.contains(':') {
        trimmed
            .split("://")
            .nth(1)
            .and_then(|rest| rest.split('/').next())
            .unwrap_or("download")
            .to_string()
    } else {
        decoded
    }
}

pub fn is_video(mime_type: Option<&str>, path: &Path) -> bool {
    if mime_type.is_some_and(|m| m.starts_with("video/")) {
        return true;
    }
    mime_guess::from_path(path)
        .first()
        .is_some_and(|m| m.type_() == mime_guess::mime::VIDEO)
}

/// Cover image written next to site-specific downloads.
pub const THUMBNAIL_FILE: &str = "thumbnail.jpg";

/// yt-dlp arguments: best audio as `audio.<ext>`, the thumbnail converted to
/// [`THUMBNAIL_FILE`], then the final path and title printed on stdout.
fn yt_dlp_args(url: &str, dest_dir: &Path) -> Vec<OsString> {
    let mut thumbnail_template = OsString::from("thumbnail:");
    thumbnail_template.push(dest_dir.join("thumbnail.%(ext)s"));

    let mut args: Vec<OsString> = ["--no-playlist", "-f", "bestaudio/best", "-o"]
        .iter()
        .map(OsString::from)
        .collect();
    args.push(dest_dir.join("audio.%(ext)s").into_os_string());
    args.extend(
        ["--write-thumbnail", "--convert-thumbnails", "jpg", "-o"]
            .iter()
            .map(OsString::from),
    );
    args.push(thumbnail_template);
    args.extend(
        ["--print", "after_move:filepath", "--print", "after_move:title", url]
            .iter()
            .map(OsString::from),
    );
    args
}

pub struct HttpFetcher {
    client: reqwest::Client,
    yt_dlp: String,
}

impl HttpFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            yt_dlp: "yt-dlp".to_string(),
        }
    }

    pub fn with_yt_dlp(mut self, program: impl Into<String>) -> Self {
        self.yt_dlp = program.into();
        self
    }

    async fn fetch_http(&self, url: &str, dest_dir: &Path) -> Result<FetchedMedia, CoreError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| CoreError::Download(e.to_string()))?;

        let mime_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string());

        let title = title_from_url(url);
        let mut file_name = sanitize_filename(&title);
        if Path::new(&file_name).extension().is_none() {
            let ext = mime_type
                .as_deref()
                .and_then(mime_guess::get_mime_extensions_str)
                .and_then(|exts| exts.first())
                .copied()
                .unwrap_or("bin");
            file_name = format!("{}.{}", file_name, ext);
        }
        let path = dest_dir.join(file_name);

        let mut file = tokio::fs::File::create(&path).await?;
        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| CoreError::Download(e.to_string()))?;
            written += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        tracing::debug!(bytes = written, path = %path.display(), "Media downloaded");

        let mime_type = mime_type.or_else(|| mime_guess::from_path(&path).first().map(|m| m.to_string()));
        Ok(FetchedMedia {
            path,
            mime_type,
            title,
        })
    }

    async fn fetch_site(&self, url: &str, dest_dir: &Path) -> Result<FetchedMedia, CoreError> {
        let output = tokio::process::Command::new(&self.yt_dlp)
            .args(yt_dlp_args(url, dest_dir))
            .output()
            .await
            .map_err(|e| CoreError::Download(format!("Failed to run {}: {}", self.yt_dlp, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CoreError::Download(format!(
                "YouTube download failed: {}",
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut lines = stdout.lines().map(str::trim).filter(|l| !l.is_empty());
        let path = lines
            .next()
            .map(PathBuf::from)
            .filter(|p| p.is_file())
            .ok_or_else(|| CoreError::Download("yt-dlp did not report an output file".to_string()))?;
        let title = lines.next().map(str::to_string).unwrap_or_else(|| title_from_url(url));
        let mime_type = mime_guess::from_path(&path).first().map(|m| m.to_string());
        if !dest_dir.join(THUMBNAIL_FILE).is_file() {
            tracing::debug!(url = %url, "No thumbnail written");
        }

        Ok(FetchedMedia {
            path,
            mime_type,
            title,
        })
    }
}

#[async_trait]
impl MediaFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, dest_dir: &Path) -> Result<FetchedMedia, CoreError> {
        tokio::fs::create_dir_all(dest_dir).await?;
        if is_site_specific(url) {
            self.fetch_site(url, dest_dir).await
        } else {
            self.fetch_http(url, dest_dir).await
        }
    }
}

pub trait KeywordExtractor: Send + Sync {
    /// Up to `top_k` keywords, most relevant first.
    fn extract(&self, text: &str, top_k: usize) -> Vec<String>;
}

const STOP_WORDS: &[&str] = &[
    "the", "and", "that", "this", "with", "for", "are", "was", "you", "your", "have", "has",
    "not", "but", "they", "what", "there", "about", "just", "like", "from", "can", "will",
    "would", "all", "one", "our", "out", "its", "it's", "i'm", "don't", "know", "think", "really",
    "very", "yeah", "then", "them", "their", "when", "which", "who", "how", "some", "been", "were",
    "also", "into", "more", "than", "because", "going", "get", "got", "had", "his", "her", "she",
    "him", "we're", "they're", "that's",
];

const CJK_STOP_WORDS: &[&str] = &[
    "我们", "你们", "他们", "这个", "那个", "就是", "然后", "所以", "因为", "但是", "一个", "没有",
    "什么", "可以", "这样", "已经", "还是", "自己", "觉得", "其实",
];

fn is_cjk(ch: char) -> bool {
    matches!(ch as u32, 0x4E00..=0x9FFF | 0x3400..=0x4DBF | 0xF900..=0xFAFF)
}

/// Term-frequency keywords. Latin words are counted whole; CJK runs are counted
/// as overlapping bigrams since there is no whitespace to split on.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrequencyKeywords;

impl FrequencyKeywords {
    fn terms(text: &str) -> Vec<String> {
        let mut terms = Vec::new();
        let mut word = String::new();
        let mut cjk_run: Vec<char> = Vec::new();

        let flush_word = |word: &mut String, terms: &mut Vec<String>| {
            let lowered = word.to_lowercase();
            if lowered.chars().count() >= 3
                && !STOP_WORDS.contains(&lowered.as_str())
                && !lowered.chars().all(|c| c.is_ascii_digit())
            {
                terms.push(lowered);
            }
            word.clear();
        };
        let flush_cjk = |run: &mut Vec<char>, terms: &mut Vec<String>| {
            for pair in run.windows(2) {
                let bigram: String = pair.iter().collect();
                if !CJK_STOP_WORDS.contains(&bigram.as_str()) {
                    terms.push(bigram);
                }
            }
            run.clear();
        };

        for ch in text.chars() {
            if is_cjk(ch) {
                flush_word(&mut word, &mut terms);
                cjk_run.push(ch);
            } else if ch.is_alphanumeric() || ch == '\'' {
                flush_cjk(&mut cjk_run, &mut terms);
                word.push(ch);
            } else {
                flush_word(&mut word, &mut terms);
                flush_cjk(&mut cjk_run, &mut terms);
            }
        }
        flush_word(&mut word, &mut terms);
        flush_cjk(&mut cjk_run, &mut terms);
        terms
    }
}

impl KeywordExtractor for FrequencyKeywords {
    fn extract(&self, text: &str, top_k: usize) -> Vec<String> {
        if top_k == 0 || text.trim().is_empty() {
            return Vec::new();
        }

        // term -> (count, first position)
        let mut counts: HashMap<String, (usize, usize)> = HashMap::new();
        for (position, term) in Self::terms(text).into_iter().enumerate() {
            counts.entry(term).or_insert((0, position)).0 += 1;
        }

        let mut ranked: Vec<_> = counts.into_iter().collect();
        ranked.sort_by(|a, b| b.1 .0.cmp(&a.1 .0).then(a.1 .1.cmp(&b.1 .1)));
        ranked.into_iter().take(top_k).map(|(term, _)| term).collect()
    }
}

/// Rendered transcript documents.
#[derive(Debug, Clone, PartialEq)]
pub struct FormattedTranscript {
    pub srt: String,
    pub markdown: String,
}

pub trait TranscriptFormatter: Send + Sync {
    fn format(&self, transcript: &Transcript) -> FormattedTranscript;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BasicFormatter;

/// `HH:MM:SS,mmm`
pub fn srt_timestamp(seconds: f64) -> String {
    let total_ms = (seconds.max(0.0) * 1000.0).round() as u64;
    format!(
        "{:02}:{:02}:{:02},{:03}",
        total_ms / 3_600_000,
        (total_ms / 60_000) % 60,
        (total_ms / 1000) % 60,
        total_ms % 1000
    )
}

fn short_timestamp(seconds: f64) -> String {
    let total = seconds.max(0.0) as u64;
    format!("{:02}:{:02}", total / 60, total % 60)
}

impl TranscriptFormatter for BasicFormatter {
    fn format(&self, transcript: &Transcript) -> FormattedTranscript {
        let srt = transcript
            .segments
            .iter()
            .enumerate()
            .map(|(i, seg)| {
                format!(
                    "{}\n{} --> {}\n{}\n",
                    i + 1,
                    srt_timestamp(seg.start),
                    srt_timestamp(seg.end),
                    seg.text.trim()
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        let mut markdown = String::from("# Transcript\n");
        if transcript.segments.is_empty() {
            markdown.push('\n');
            markdown.push_str(transcript.text.trim());
            markdown.push('\n');
            return FormattedTranscript { srt, markdown };
        }

        let diarized = transcript.segments.iter().any(|s| !s.speaker.is_empty());
        let mut last_speaker: Option<&str> = None;
        for seg in &transcript.segments {
            let text = seg.text.trim();
            if text.is_empty() {
                continue;
            }
            if diarized {
                // Consecutive segments from one speaker share a heading
                if last_speaker != Some(seg.speaker.as_str()) {
                    let label = if seg.speaker.is_empty() {
                        "Speaker".to_string()
                    } else {
                        format!("Speaker {}", seg.speaker)
                    };
                    markdown.push_str(&format!("\n**{}**  {}\n", label, short_timestamp(seg.start)));
                    last_speaker = Some(seg.speaker.as_str());
                }
            } else {
                markdown.push_str(&format!("\n{}\n", short_timestamp(seg.start)));
            }
            markdown.push_str(text);
            markdown.push('\n');
        }

        FormattedTranscript { srt, markdown }
    }
}

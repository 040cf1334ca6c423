//! # Canonical Transcript
//!
//! The one transcript shape every backend produces, plus normalization of the two
//! raw result layouts the remote service returns.
//!
//! ## Remote layouts:
//! 1. `Transcription.Paragraphs[].Words[]`: a segment per paragraph, start from the
//!    first word, end from the last word, text is the words joined without separator.
//! 2. `Transcription.Sentences[]` (or top-level `Sentences[]`): a segment per sentence,
//!    with `StartTime|Start`, `EndTime|End` and `Text|Sentence`, numbers or strings.
//!
//! The second layout is only consulted when the first yields no segments. All remote
//! times are milliseconds and are converted to seconds.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Language reported when the remote payload does not carry one.
pub const DEFAULT_REMOTE_LANGUAGE: &str = "zh";

/// One timed piece of transcript text.
///
/// `speaker` is empty when the backend does not diarize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
    #[serde(default)]
    pub speaker: String,
}

impl TranscriptSegment {
    pub fn new(start: f64, end: f64, text: impl Into<String>, speaker: impl Into<String>) -> Self {
        Self {
            start,
            end: end.max(start),
            text: text.into(),
            speaker: speaker.into(),
        }
    }
}

/// Ordered segments plus the full text and language.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub segments: Vec<TranscriptSegment>,
    pub text: String,
    pub language: String,
}

impl Transcript {
    /// Build a transcript from segments, dropping blank ones and joining the rest with newlines.
    pub fn from_segments(segments: Vec<TranscriptSegment>, language: impl Into<String>) -> Self {
        let segments: Vec<TranscriptSegment> = segments
            .into_iter()
            .filter_map(|mut segment| {
                let trimmed = segment.text.trim();
                if trimmed.is_empty() {
                    return None;
                }
                segment.text = trimmed.to_string();
                Some(segment)
            })
            .collect();

        let text = segments
            .iter()
            .map(|s| s.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        Self {
            segments,
            text,
            language: language.into(),
        }
    }

    pub fn empty(language: impl Into<String>) -> Self {
        Self::from_segments(Vec::new(), language)
    }

    /// End time of the last segment, zero for an empty transcript.
    pub fn duration(&self) -> f64 {
        self.segments.last().map(|s| s.end).unwrap_or(0.0)
    }
}

/// Normalize a raw remote result payload into a [`Transcript`].
pub fn normalize_remote(payload: &Value) -> Transcript {
    let body = payload.get("Transcription").unwrap_or(payload);

    let mut segments = paragraph_segments(body);
    if segments.is_empty() {
        segments = sentence_segments(body);
    }
    if segments.is_empty() && !std::ptr::eq(body, payload) {
        segments = sentence_segments(payload);
    }

    let language = body
        .get("Language")
        .or_else(|| payload.get("Language"))
        .and_then(Value::as_str)
        .filter(|l| !l.is_empty())
        .unwrap_or(DEFAULT_REMOTE_LANGUAGE);

    Transcript::from_segments(segments, language)
}

fn paragraph_segments(body: &Value) -> Vec<TranscriptSegment> {
    let Some(paragraphs) = body.get("Paragraphs").and_then(Value::as_array) else {
        return Vec::new();
    };

    paragraphs
        .iter()
        .filter_map(|paragraph| {
            let words = paragraph.get("Words").and_then(Value::as_array)?;
            let first = words.first()?;
            let last = words.last()?;

            let text: String = words
                .iter()
                .filter_map(|w| w.get("Text").and_then(Value::as_str))
                .collect();

            let start = millis(first, &["Start"]);
            let end = millis(last, &["End"]);
            Some(TranscriptSegment::new(start, end, text, speaker(paragraph)))
        })
        .collect()
}

fn sentence_segments(body: &Value) -> Vec<TranscriptSegment> {
    let Some(sentences) = body.get("Sentences").and_then(Value::as_array) else {
        return Vec::new();
    };

    sentences
        .iter()
        .map(|sentence| {
            let text = ["Text", "Sentence"]
                .iter()
                .find_map(|key| sentence.get(*key).and_then(Value::as_str))
                .unwrap_or_default();
            TranscriptSegment::new(
                millis(sentence, &["StartTime", "Start"]),
                millis(sentence, &["EndTime", "End"]),
                text,
                speaker(sentence),
            )
        })
        .collect()
}

/// First present key, as number or numeric string, converted from ms to seconds.
fn millis(node: &Value, keys: &[&str]) -> f64 {
    keys.iter()
        .filter_map(|key| node.get(*key))
        .find_map(|value| match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        })
        .map(|ms| ms / 1000.0)
        .unwrap_or(0.0)
}

fn speaker(node: &Value) -> String {
    match node.get("SpeakerId") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_paragraph_words_become_one_segment() {
        let payload = json!({
            "Transcription": {
                "Paragraphs": [{
                    "SpeakerId": "1",
                    "Words": [
                        {"Start": 1000, "End": 2000, "Text": "a"},
                        {"Start": 2000, "End": 3000, "Text": "b"}
                    ]
                }]
            }
        });

        let transcript = normalize_remote(&payload);
        assert_eq!(transcript.segments.len(), 1);
        let segment = &transcript.segments[0];
        assert_eq!(segment.start, 1.0);
        assert_eq!(segment.end, 3.0);
        assert_eq!(segment.text, "ab");
        assert_eq!(segment.speaker, "1");
        assert_eq!(transcript.language, DEFAULT_REMOTE_LANGUAGE);
    }

    #[test]
    fn test_sentences_with_string_times() {
        let payload = json!({
            "Sentences": [{"StartTime": "500", "EndTime": "1500", "Text": "hi"}]
        });

        let transcript = normalize_remote(&payload);
        assert_eq!(
            transcript.segments,
            vec![TranscriptSegment::new(0.5, 1.5, "hi", "")]
        );
        assert_eq!(transcript.text, "hi");
    }

    #[test]
    fn test_sentence_fallback_uses_alternate_field_names() {
        let payload = json!({
            "Transcription": {
                "Paragraphs": [],
                "Language": "en",
                "Sentences": [
                    {"Start": 0, "End": 1200, "Sentence": "hello"},
                    {"Start": 1200, "End": 2500, "Sentence": "world"}
                ]
            }
        });

        let transcript = normalize_remote(&payload);
        assert_eq!(transcript.segments.len(), 2);
        assert_eq!(transcript.segments[1].start, 1.2);
        assert_eq!(transcript.text, "hello\nworld");
        assert_eq!(transcript.language, "en");
    }

    #[test]
    fn test_paragraphs_win_over_sentences() {
        let payload = json!({
            "Transcription": {
                "Paragraphs": [{"Words": [{"Start": 0, "End": 10, "Text": "p"}]}],
                "Sentences": [{"StartTime": 0, "EndTime": 10, "Text": "s"}]
            }
        });

        let transcript = normalize_remote(&payload);
        assert_eq!(transcript.text, "p");
    }

    #[test]
    fn test_blank_segments_are_dropped() {
        let transcript = Transcript::from_segments(
            vec![
                TranscriptSegment::new(0.0, 1.0, "  ", ""),
                TranscriptSegment::new(1.0, 2.0, " kept ", ""),
            ],
            "en",
        );
        assert_eq!(transcript.segments.len(), 1);
        assert_eq!(transcript.segments[0].text, "kept");
        assert_eq!(transcript.duration(), 2.0);
    }

    #[test]
    fn test_unknown_shape_is_empty() {
        let transcript = normalize_remote(&json!({"Other": true}));
        assert!(transcript.segments.is_empty());
        assert_eq!(transcript.text, "");
    }
}

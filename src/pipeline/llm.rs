//! Chat-endpoint client and request construction.
//!
//! This module is intentionally thin: prompt text lives in
//! [`crate::prompts`], answer validation in [`crate::pipeline::candidates`].
//! What remains here is the blocking HTTP call against an OpenAI-compatible
//! `/v1/chat/completions` endpoint, payload assembly for single / batch /
//! vision requests, and content extraction from the response envelope.
//!
//! ## Retry strategy
//!
//! Calls are retried up to `max_retries` times with a fixed
//! `retry_backoff_ms` pause. Every failure mode is a [`ModelError`]; the
//! caller decides whether to fall back to a heuristic phrase, so nothing
//! here aborts a document.

use base64::Engine as _;
use serde_json::{json, Value};
use std::path::Path;
use std::thread::sleep;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::NamerConfig;
use crate::error::{ModelError, NamerError};
use crate::pipeline::context::{ranked_sentences, RefContext, Side};
use crate::prompts::{self, BATCH_SYSTEM_PROMPT, SYSTEM_PROMPT, VISION_SUFFIX};

const DEFAULT_API_BASE: &str = "https://api.openai.com";

/// Blocking client for one OpenAI-compatible chat endpoint.
pub struct ChatClient {
    http: reqwest::blocking::Client,
    endpoint: String,
    api_key: Option<String>,
    model: Option<String>,
    temperature: f32,
    max_tokens: usize,
    max_retries: u32,
    retry_backoff_ms: u64,
    rate_limit_ms: u64,
}

impl ChatClient {
    /// Build a client from the run configuration.
    pub fn from_config(config: &NamerConfig) -> Result<Self, NamerError> {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.api_timeout_secs))
            .build()
            .map_err(|e| NamerError::Internal(format!("http client: {e}")))?;
        Ok(Self {
            http,
            endpoint: chat_endpoint(config.api_base.as_deref()),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            max_retries: config.max_retries,
            retry_backoff_ms: config.retry_backoff_ms,
            rate_limit_ms: config.rate_limit_ms,
        })
    }

    /// Send a chat request and return the assistant's text content.
    pub fn chat(&self, messages: &[Value]) -> Result<String, ModelError> {
        let mut body = json!({
            "messages": messages,
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
        });
        if let Some(model) = &self.model {
            body["model"] = json!(model);
        }
        debug!(endpoint = %self.endpoint, request = %summarize_messages(messages), "chat request");

        let mut last_err = String::new();
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                warn!(attempt, max = self.max_retries, "chat retry after {}ms", self.retry_backoff_ms);
                sleep(Duration::from_millis(self.retry_backoff_ms));
            }
            if self.rate_limit_ms > 0 {
                sleep(Duration::from_millis(self.rate_limit_ms));
            }

            let mut req = self.http.post(&self.endpoint).json(&body);
            if let Some(key) = &self.api_key {
                req = req.bearer_auth(key);
            }
            match req.send().and_then(|r| r.error_for_status()) {
                Ok(resp) => match resp.json::<Value>() {
                    Ok(envelope) => match extract_content(&envelope) {
                        Some(content) if !content.trim().is_empty() => {
                            debug!(response = %truncate(&content, 200), "chat response");
                            return Ok(content);
                        }
                        _ => {
                            last_err = "empty response".to_string();
                            warn!("chat attempt {} returned no content", attempt + 1);
                        }
                    },
                    Err(e) => {
                        last_err = format!("invalid response body: {e}");
                        warn!("chat attempt {} failed: {last_err}", attempt + 1);
                    }
                },
                Err(e) => {
                    last_err = e.to_string();
                    warn!("chat attempt {} failed: {last_err}", attempt + 1);
                }
            }
        }

        if last_err == "empty response" {
            Err(ModelError::EmptyResponse)
        } else {
            Err(ModelError::CallFailed {
                retries: self.max_retries,
                detail: last_err,
            })
        }
    }
}

/// Normalise a base URL into the chat completions endpoint.
///
/// Trailing slashes and a trailing `/v1` are stripped so both
/// "https://host" and "https://host/v1/" produce the same endpoint.
pub fn chat_endpoint(base: Option<&str>) -> String {
    let base = base.unwrap_or(DEFAULT_API_BASE).trim().trim_end_matches('/');
    let base = base.strip_suffix("/v1").unwrap_or(base);
    format!("{base}/v1/chat/completions")
}

/// Pull the assistant text out of a chat-completions envelope.
///
/// Handles plain string content, the multi-part array form (text parts
/// concatenated), and the legacy `choices[0].text` field.
pub fn extract_content(envelope: &Value) -> Option<String> {
    let choice = envelope.get("choices")?.get(0)?;
    if let Some(content) = choice.pointer("/message/content") {
        if let Some(s) = content.as_str() {
            return Some(s.to_string());
        }
        if let Some(parts) = content.as_array() {
            let text: String = parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("");
            if !text.is_empty() {
                return Some(text);
            }
        }
    }
    choice.get("text").and_then(Value::as_str).map(str::to_string)
}

// ── Payload assembly ─────────────────────────────────────────────────────

/// Describe one reference for the model: document title, ranked context
/// sentences for both sides, explicit references, alt text, and the
/// strategy instruction.
pub fn image_payload(
    ctx: &RefContext,
    doc_title: &str,
    alt: &str,
    config: &NamerConfig,
) -> Value {
    let limit = config.context_sentence_limit;
    json!({
        "index": ctx.index,
        "document_title": doc_title,
        "above_sentences": ranked_sentences(&ctx.above, Side::Above, limit),
        "below_sentences": ranked_sentences(&ctx.below, Side::Below, limit),
        "explicit_refs": ctx.explicit_refs,
        "alt": alt,
        "instruction": prompts::strategy_instruction(ctx.effective_strategy),
    })
}

/// Messages for a single-reference request. With `image_part` set the user
/// turn becomes a two-part array carrying the image alongside the text.
pub fn single_messages(payload: &Value, image_part: Option<Value>) -> Vec<Value> {
    let text = match &image_part {
        Some(_) => format!("{payload}\n\n{VISION_SUFFIX}"),
        None => payload.to_string(),
    };
    let user_content = match image_part {
        Some(part) => json!([{"type": "text", "text": text}, part]),
        None => json!(text),
    };
    vec![
        json!({"role": "system", "content": SYSTEM_PROMPT}),
        json!({"role": "user", "content": user_content}),
    ]
}

/// Messages for a batch request covering several references at once.
pub fn batch_messages(payloads: &[Value]) -> Vec<Value> {
    vec![
        json!({"role": "system", "content": BATCH_SYSTEM_PROMPT}),
        json!({"role": "user", "content": json!({"images": payloads}).to_string()}),
    ]
}

/// Build the `image_url` part for a vision request.
///
/// Remote sources are passed through as-is; local files are inlined as a
/// `data:<mime>;base64,...` URI. Returns `None` when the local file cannot
/// be read, in which case the caller sends a text-only request.
pub fn vision_image_part(src: &str, resolved_local: Option<&Path>) -> Option<Value> {
    if src.starts_with("http://") || src.starts_with("https://") {
        return Some(json!({"type": "image_url", "image_url": {"url": src}}));
    }
    let path = resolved_local?;
    let bytes = std::fs::read(path).ok()?;
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
    Some(json!({
        "type": "image_url",
        "image_url": {"url": format!("data:{mime};base64,{encoded}")}
    }))
}

/// Message summary for logs: data URIs reduced to their header, long text
/// clipped.
pub fn summarize_messages(messages: &[Value]) -> String {
    let mut out = String::new();
    for m in messages {
        let role = m.get("role").and_then(Value::as_str).unwrap_or("?");
        let content = m.get("content").map(summarize_content).unwrap_or_default();
        out.push_str(&format!("[{role}] {content} "));
    }
    out.trim_end().to_string()
}

fn summarize_content(content: &Value) -> String {
    match content {
        Value::String(s) => truncate(s, 160),
        Value::Array(parts) => parts
            .iter()
            .map(|p| {
                if let Some(url) = p.pointer("/image_url/url").and_then(Value::as_str) {
                    match url.split_once(',') {
                        Some((header, _)) if url.starts_with("data:") => format!("<{header}>"),
                        _ => truncate(url, 80),
                    }
                } else {
                    truncate(p.get("text").and_then(Value::as_str).unwrap_or(""), 160)
                }
            })
            .collect::<Vec<_>>()
            .join(" + "),
        other => truncate(&other.to_string(), 160),
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        s.chars().take(max_chars).collect::<String>() + "…"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn endpoint_normalisation() {
        assert_eq!(
            chat_endpoint(None),
            "https://api.openai.com/v1/chat/completions"
        );
        for base in [
            "https://host.example",
            "https://host.example/",
            "https://host.example/v1",
            "https://host.example/v1/",
        ] {
            assert_eq!(
                chat_endpoint(Some(base)),
                "https://host.example/v1/chat/completions",
                "base: {base}"
            );
        }
    }

    #[test]
    fn extract_content_string_form() {
        let env = json!({"choices": [{"message": {"content": "hello"}}]});
        assert_eq!(extract_content(&env).as_deref(), Some("hello"));
    }

    #[test]
    fn extract_content_parts_form() {
        let env = json!({"choices": [{"message": {"content": [
            {"type": "text", "text": "part one "},
            {"type": "text", "text": "part two"}
        ]}}]});
        assert_eq!(extract_content(&env).as_deref(), Some("part one part two"));
    }

    #[test]
    fn extract_content_legacy_text_field() {
        let env = json!({"choices": [{"text": "legacy"}]});
        assert_eq!(extract_content(&env).as_deref(), Some("legacy"));
        assert_eq!(extract_content(&json!({"choices": []})), None);
    }

    #[test]
    fn single_messages_shape() {
        let payload = json!({"index": 1});
        let msgs = single_messages(&payload, None);
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0]["role"], "system");
        assert!(msgs[1]["content"].as_str().unwrap().contains("\"index\":1"));
    }

    #[test]
    fn vision_messages_carry_two_parts() {
        let payload = json!({"index": 1});
        let part = json!({"type": "image_url", "image_url": {"url": "https://x/y.png"}});
        let msgs = single_messages(&payload, Some(part));
        let parts = msgs[1]["content"].as_array().unwrap();
        assert_eq!(parts.len(), 2);
        assert!(parts[0]["text"].as_str().unwrap().contains("attached"));
        assert_eq!(parts[1]["image_url"]["url"], "https://x/y.png");
    }

    #[test]
    fn batch_messages_wrap_images_array() {
        let msgs = batch_messages(&[json!({"index": 1}), json!({"index": 2})]);
        let user = msgs[1]["content"].as_str().unwrap();
        let parsed: Value = serde_json::from_str(user).unwrap();
        assert_eq!(parsed["images"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn remote_vision_part_passes_url_through() {
        let part = vision_image_part("https://cdn.example/a.png", None).unwrap();
        assert_eq!(part["image_url"]["url"], "https://cdn.example/a.png");
        assert!(vision_image_part("missing.png", None).is_none());
    }

    #[test]
    fn local_vision_part_becomes_data_uri() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("tiny.png");
        std::fs::write(&file, b"\x89PNG\r\n\x1a\n").unwrap();
        let part = vision_image_part("tiny.png", Some(&file)).unwrap();
        let url = part["image_url"]["url"].as_str().unwrap();
        assert!(url.starts_with("data:image/png;base64,"));
    }

    #[test]
    fn summary_truncates_data_uris() {
        let msgs = vec![json!({"role": "user", "content": [
            {"type": "text", "text": "describe"},
            {"type": "image_url", "image_url": {"url": "data:image/png;base64,AAAAAAAAAAAAAAAA"}}
        ]})];
        let summary = summarize_messages(&msgs);
        assert!(summary.contains("<data:image/png;base64>"));
        assert!(!summary.contains("AAAAAAAA"));
    }
}

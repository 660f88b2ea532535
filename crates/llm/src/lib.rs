//! OpenAI-compatible chat client for the memory engine.
//!
//! Two call shapes: [`LlmClient::chat`] consumes a single JSON body,
//! [`LlmClient::chat_stream`] consumes an SSE stream and concatenates the
//! deltas. Both retry transient failures internally with exponential backoff;
//! the [`LlmError`] taxonomy tells callers which failures are worth another
//! retry layer of their own.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use keepsake_config::ExtractionConfig;

pub mod abort;

pub use abort::{AbortHandle, AbortSignal};

// ── Chat message types ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: ChatRole::System, content: content.into() }
    }
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: ChatRole::User, content: content.into() }
    }
    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: ChatRole::Assistant, content: content.into() }
    }
}

// ── Error taxonomy ────────────────────────────────────────────────────────────

/// Failure modes of a chat call.
///
/// The transient/permanent split drives two retry layers: the client retries
/// transient errors internally, and the background-extraction retry counter
/// consumes one unit per surviving transient failure.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("rate limited (429)")]
    RateLimited,
    #[error("server error ({status})")]
    Server { status: u16 },
    #[error("client error ({status})")]
    Client { status: u16 },
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("call aborted")]
    Aborted,
}

impl LlmError {
    /// Whether a retry is likely to succeed. `Aborted` is transient-style so
    /// cancelled work is never recorded as permanently failed, but callers
    /// can still match on the variant.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::Connect(_) | Self::RateLimited | Self::Server { .. } | Self::Aborted
        )
    }
}

fn classify_reqwest(err: reqwest::Error) -> LlmError {
    if err.is_timeout() {
        LlmError::Timeout
    } else if err.is_connect() {
        LlmError::Connect(err.to_string())
    } else if let Some(status) = err.status() {
        classify_status(status.as_u16())
    } else {
        // Body/decode errors mid-transfer read as connection trouble.
        LlmError::Connect(err.to_string())
    }
}

fn classify_status(status: u16) -> LlmError {
    match status {
        429 => LlmError::RateLimited,
        s if s >= 500 => LlmError::Server { status: s },
        s => LlmError::Client { status: s },
    }
}

/// Exponential backoff: 500ms, 1s, 2s, ...
fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_millis(500u64.saturating_mul(1u64 << attempt.min(6)))
}

// ── Oracle trait ──────────────────────────────────────────────────────────────

/// Seam between the engine and the wire. [`LlmClient`] is the production
/// implementation; tests script verdicts through a fake.
#[async_trait]
pub trait ChatOracle: Send + Sync {
    async fn chat(&self, messages: &[ChatMessage]) -> Result<String, LlmError>;

    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        abort: &AbortSignal,
    ) -> Result<String, LlmError>;
}

// ── Client ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct LlmClient {
    http: reqwest::Client,
    config: ExtractionConfig,
}

impl LlmClient {
    pub fn new(config: ExtractionConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .unwrap_or_default();
        Self { http, config }
    }

    pub fn config(&self) -> &ExtractionConfig {
        &self.config
    }

    fn request(&self, messages: &[ChatMessage], stream: bool) -> reqwest::RequestBuilder {
        let payload = json!({
            "model": self.config.model,
            "messages": messages,
            "stream": stream,
        });
        let mut builder = self.http.post(&self.config.endpoint).json(&payload);
        if let Some(key) = self.config.api_key.as_deref() {
            if !key.trim().is_empty() {
                builder = builder.bearer_auth(key);
            }
        }
        builder
    }

    async fn chat_once(&self, messages: &[ChatMessage]) -> Result<String, LlmError> {
        let response = self
            .request(messages, false)
            .send()
            .await
            .map_err(classify_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status.as_u16()));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| LlmError::Malformed(e.to_string()))?;

        extract_message_content(&body)
            .ok_or_else(|| LlmError::Malformed("response missing choices[0].message.content".to_string()))
    }

    async fn chat_stream_once(
        &self,
        messages: &[ChatMessage],
        abort: &AbortSignal,
    ) -> Result<String, LlmError> {
        if abort.is_aborted() {
            return Err(LlmError::Aborted);
        }

        let mut response = self
            .request(messages, true)
            .send()
            .await
            .map_err(classify_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status.as_u16()));
        }

        let mut full = String::new();
        loop {
            let chunk = tokio::select! {
                chunk = response.chunk() => chunk.map_err(classify_reqwest)?,
                _ = abort.cancelled() => return Err(LlmError::Aborted),
            };
            let Some(chunk) = chunk else { break };
            let chunk_str = String::from_utf8_lossy(&chunk);
            for line in chunk_str.lines() {
                if let Some(delta) = parse_sse_delta(line) {
                    full.push_str(&delta);
                }
            }
        }

        Ok(full)
    }

    async fn with_retries<F, Fut>(&self, mut call: F) -> Result<String, LlmError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<String, LlmError>>,
    {
        let attempts = self.config.max_retries + 1;
        let mut last_err = LlmError::Malformed("no attempts made".to_string());
        for attempt in 0..attempts {
            match call().await {
                Ok(text) => return Ok(text),
                Err(LlmError::Aborted) => return Err(LlmError::Aborted),
                Err(err) if err.is_transient() && attempt + 1 < attempts => {
                    let delay = backoff_delay(attempt);
                    warn!(%err, attempt, ?delay, "transient LLM error, backing off");
                    tokio::time::sleep(delay).await;
                    last_err = err;
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err)
    }
}

#[async_trait]
impl ChatOracle for LlmClient {
    async fn chat(&self, messages: &[ChatMessage]) -> Result<String, LlmError> {
        let text = self.with_retries(|| self.chat_once(messages)).await?;
        debug!(chars = text.len(), "chat completion received");
        Ok(text)
    }

    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        abort: &AbortSignal,
    ) -> Result<String, LlmError> {
        let text = self
            .with_retries(|| self.chat_stream_once(messages, abort))
            .await?;
        debug!(chars = text.len(), "streamed chat completion received");
        Ok(text)
    }
}

// ── Response parsing ──────────────────────────────────────────────────────────

/// `choices[0].message.content` from a non-streaming body.
fn extract_message_content(body: &serde_json::Value) -> Option<String> {
    body.get("choices")
        .and_then(|choices| choices.get(0))
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("content"))
        .and_then(|content| content.as_str())
        .map(ToString::to_string)
}

/// Parse one SSE line into its text delta, if any.
///
/// Non-`data:` lines, the `[DONE]` sentinel, and undecodable payloads all
/// yield `None`.
fn parse_sse_delta(line: &str) -> Option<String> {
    let line = line.trim();
    let data = line.strip_prefix("data: ")?;
    if data == "[DONE]" {
        return None;
    }
    let json: serde_json::Value = serde_json::from_str(data).ok()?;
    json.get("choices")
        .and_then(|choices| choices.get(0))
        .and_then(|choice| choice.get("delta"))
        .and_then(|delta| delta.get("content"))
        .and_then(|content| content.as_str())
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

// ── Structured output extraction ──────────────────────────────────────────────

/// Extract the first valid JSON payload from an LLM reply.
///
/// Models asked for JSON frequently wrap it in a fenced ` ```json ` block or
/// pad it with prose. Strategy 1 looks for a fenced block; strategy 2 takes
/// the span from the first `{` to the last `}`. Returns `None` when neither
/// yields a value that deserialises into `T`.
pub fn extract_json_output<T: serde::de::DeserializeOwned>(response: &str) -> Option<T> {
    if let Some(fence_start) = response.find("```json") {
        let after_fence = &response[fence_start + "```json".len()..];
        if let Some(json_start) = after_fence.find(|c: char| !c.is_whitespace()) {
            let json_body = &after_fence[json_start..];
            if let Some(fence_end) = json_body.find("```") {
                let json_str = json_body[..fence_end].trim();
                if let Ok(val) = serde_json::from_str(json_str) {
                    return Some(val);
                }
            }
        }
    }

    let trimmed = response.trim();
    if let Some(start) = trimmed.find('{') {
        if let Some(end) = trimmed.rfind('}') {
            if end > start {
                let candidate = &trimmed[start..=end];
                if let Ok(val) = serde_json::from_str(candidate) {
                    return Some(val);
                }
            }
        }
    }

    None
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification_table() {
        assert!(LlmError::Timeout.is_transient());
        assert!(LlmError::Connect("reset".into()).is_transient());
        assert!(LlmError::RateLimited.is_transient());
        assert!(LlmError::Server { status: 503 }.is_transient());
        assert!(LlmError::Aborted.is_transient());
        assert!(!LlmError::Client { status: 400 }.is_transient());
        assert!(!LlmError::Malformed("bad json".into()).is_transient());
    }

    #[test]
    fn status_classification() {
        assert!(matches!(classify_status(429), LlmError::RateLimited));
        assert!(matches!(classify_status(500), LlmError::Server { status: 500 }));
        assert!(matches!(classify_status(404), LlmError::Client { status: 404 }));
    }

    #[test]
    fn backoff_doubles() {
        assert_eq!(backoff_delay(0), Duration::from_millis(500));
        assert_eq!(backoff_delay(1), Duration::from_millis(1000));
        assert_eq!(backoff_delay(2), Duration::from_millis(2000));
    }

    #[test]
    fn extracts_message_content() {
        let body = serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": "hello"}}]
        });
        assert_eq!(extract_message_content(&body).as_deref(), Some("hello"));

        let empty = serde_json::json!({"choices": []});
        assert!(extract_message_content(&empty).is_none());
    }

    #[test]
    fn parses_sse_delta_lines() {
        let line = r#"data: {"choices":[{"delta":{"content":"tok"}}]}"#;
        assert_eq!(parse_sse_delta(line).as_deref(), Some("tok"));

        assert!(parse_sse_delta("data: [DONE]").is_none());
        assert!(parse_sse_delta(": keep-alive comment").is_none());
        assert!(parse_sse_delta("data: {not json}").is_none());
        assert!(
            parse_sse_delta(r#"data: {"choices":[{"delta":{}}]}"#).is_none(),
            "role-only deltas carry no content"
        );
    }

    #[test]
    fn chat_message_constructors_set_roles() {
        assert_eq!(ChatMessage::system("s").role, ChatRole::System);
        assert_eq!(ChatMessage::user("u").role, ChatRole::User);
        assert_eq!(ChatMessage::assistant("a").role, ChatRole::Assistant);
    }

    #[derive(serde::Deserialize)]
    struct Verdict {
        verdict: String,
    }

    #[test]
    fn extract_fenced_json() {
        let raw = "Sure!\n```json\n{\"verdict\":\"duplicate\"}\n```";
        let out = extract_json_output::<Verdict>(raw).unwrap();
        assert_eq!(out.verdict, "duplicate");
    }

    #[test]
    fn extract_bare_json_with_surrounding_text() {
        let raw = "here you go {\"verdict\":\"unique\"} hope that helps";
        let out = extract_json_output::<Verdict>(raw).unwrap();
        assert_eq!(out.verdict, "unique");
    }

    #[test]
    fn extract_returns_none_for_plain_text() {
        assert!(extract_json_output::<Verdict>("no json here").is_none());
        assert!(extract_json_output::<Verdict>("").is_none());
        assert!(extract_json_output::<Verdict>("```json\n{broken\n```").is_none());
    }
}

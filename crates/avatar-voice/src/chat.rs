//! Streaming chat replies from an OpenAI-compatible `/chat/completions` endpoint.
//!
//! The response is Server-Sent Events; each `data:` line carries a JSON chunk whose
//! `choices[0].delta.content` is the next text delta, and `data: [DONE]` ends the reply.

use crate::config::BackendConfig;
use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One turn of the conversation history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Ordered text deltas of one reply. An `Err` item ends the reply early.
pub type TextDeltaStream = BoxStream<'static, VoiceResult<String>>;

/// Source of streamed model replies.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Start streaming the reply to `messages` (system prompt included by the caller).
    async fn stream_reply(&self, messages: &[ChatMessage]) -> VoiceResult<TextDeltaStream>;
}

/// Offline chat: echoes the last user message back as word-sized deltas.
#[derive(Debug, Default)]
pub struct PlaceholderChat {
    /// If set, reply with this text instead of the echo.
    pub response: Option<String>,
}

impl PlaceholderChat {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(s: impl Into<String>) -> Self {
        Self { response: Some(s.into()) }
    }
}

/// Split text into deltas that keep their leading whitespace, like a token stream.
pub fn word_deltas(text: &str) -> Vec<String> {
    let mut deltas = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        if ch.is_whitespace() && !current.trim().is_empty() {
            deltas.push(std::mem::take(&mut current));
        }
        current.push(ch);
    }
    if !current.is_empty() {
        deltas.push(current);
    }
    deltas
}

#[async_trait]
impl ChatBackend for PlaceholderChat {
    async fn stream_reply(&self, messages: &[ChatMessage]) -> VoiceResult<TextDeltaStream> {
        let reply = match &self.response {
            Some(r) => r.clone(),
            None => {
                let last = messages
                    .iter()
                    .rev()
                    .find(|m| m.role == Role::User)
                    .map(|m| m.content.as_str())
                    .unwrap_or("");
                format!("You said: {}. Connect a chat model to get a real answer.", last.trim_end_matches(['.', '!', '?']))
            }
        };
        let deltas: Vec<VoiceResult<String>> = word_deltas(&reply).into_iter().map(Ok).collect();
        Ok(futures::stream::iter(deltas).boxed())
    }
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    error: Option<StreamError>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamError {
    #[serde(default)]
    message: String,
}

/// Parsed SSE payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    Delta(String),
    /// The server reported an error mid-stream.
    Error(String),
    Done,
}

/// Incremental SSE line decoder. Bytes may be split anywhere, including inside a UTF-8 sequence.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume bytes and return every event completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&line);
            if let Some(event) = Self::parse_line(line.trim()) {
                events.push(event);
            }
        }
        events
    }

    fn parse_line(line: &str) -> Option<SseEvent> {
        // Blank separators, `:` keep-alives and `event:` lines carry no text.
        let data = line.strip_prefix("data:")?.trim_start();
        if data == "[DONE]" {
            return Some(SseEvent::Done);
        }
        match serde_json::from_str::<StreamChunk>(data) {
            Ok(chunk) => {
                if let Some(err) = chunk.error {
                    return Some(SseEvent::Error(err.message));
                }
                chunk
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|c| c.delta.content)
                    .filter(|c| !c.is_empty())
                    .map(SseEvent::Delta)
            }
            Err(e) => {
                debug!("Chat: unparsable SSE chunk ({}): {}", e, data);
                None
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
}

/// OpenAI-compatible streaming chat (OpenAI, OpenRouter, local servers).
#[derive(Debug, Clone)]
pub struct OpenAiChat {
    url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl OpenAiChat {
    pub fn new(config: &BackendConfig) -> VoiceResult<Self> {
        Ok(Self {
            url: config.endpoint("chat/completions"),
            api_key: config.require_api_key()?.to_string(),
            model: config.chat_model.clone(),
            client: config.http_client()?,
        })
    }
}

#[async_trait]
impl ChatBackend for OpenAiChat {
    async fn stream_reply(&self, messages: &[ChatMessage]) -> VoiceResult<TextDeltaStream> {
        let body = ChatRequest {
            model: &self.model,
            messages,
            stream: true,
        };
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| VoiceError::InputStream(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            error!("Chat: HTTP {} from {}: {}", status, self.url, error_text);
            return Err(VoiceError::InputStream(format!("chat API error ({}): {}", status, error_text)));
        }
        info!("Chat: HTTP {} OK - SSE stream established ({})", status, self.model);

        let (tx, rx) = mpsc::unbounded_channel::<VoiceResult<String>>();
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut decoder = SseDecoder::new();
            loop {
                let bytes = match stream.try_next().await {
                    Ok(Some(bytes)) => bytes,
                    Ok(None) => {
                        debug!("Chat: stream closed without [DONE]");
                        return;
                    }
                    Err(e) => {
                        let _ = tx.send(Err(VoiceError::InputStream(e.to_string())));
                        return;
                    }
                };
                for event in decoder.push(&bytes) {
                    let item = match event {
                        SseEvent::Delta(text) => Ok(text),
                        SseEvent::Error(message) => Err(VoiceError::InputStream(message)),
                        SseEvent::Done => {
                            debug!("Chat: stream completed");
                            return;
                        }
                    };
                    let stop = item.is_err();
                    if tx.send(item).is_err() || stop {
                        // Receiver dropped or the reply failed.
                        return;
                    }
                }
            }
        });

        Ok(UnboundedReceiverStream::new(rx).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(content: &str) -> String {
        format!(
            "data: {{\"choices\":[{{\"index\":0,\"delta\":{{\"content\":{}}}}}]}}\n\n",
            serde_json::to_string(content).unwrap()
        )
    }

    #[test]
    fn test_decodes_deltas_and_done() {
        let mut decoder = SseDecoder::new();
        let body = format!("{}{}data: [DONE]\n\n", chunk("Hello"), chunk(" world."));
        let events = decoder.push(body.as_bytes());
        assert_eq!(
            events,
            vec![
                SseEvent::Delta("Hello".into()),
                SseEvent::Delta(" world.".into()),
                SseEvent::Done
            ]
        );
    }

    #[test]
    fn test_line_split_across_reads() {
        let mut decoder = SseDecoder::new();
        let body = chunk("Très bien");
        let bytes = body.as_bytes();
        // Split inside the two-byte 'è'.
        let split = body.find('è').unwrap() + 1;
        assert!(decoder.push(&bytes[..split]).is_empty());
        assert_eq!(decoder.push(&bytes[split..]), vec![SseEvent::Delta("Très bien".into())]);
    }

    #[test]
    fn test_skips_keepalives_and_role_only_chunks() {
        let mut decoder = SseDecoder::new();
        let body = ": keep-alive\n\nevent: message\ndata: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n";
        assert!(decoder.push(body.as_bytes()).is_empty());
    }

    #[test]
    fn test_error_payload_surfaces() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b"data: {\"error\":{\"message\":\"rate limited\"}}\n");
        assert_eq!(events, vec![SseEvent::Error("rate limited".into())]);
    }

    #[test]
    fn test_request_serializes_roles_lowercase() {
        let messages = vec![ChatMessage::system("Be brief."), ChatMessage::user("Hi")];
        let body = serde_json::to_value(ChatRequest {
            model: "gpt-4o",
            messages: &messages,
            stream: true,
        })
        .unwrap();
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "Hi");
        assert_eq!(body["stream"], true);
    }

    #[test]
    fn test_word_deltas_rejoin_to_original() {
        let text = "Hello there.  How are you?";
        let deltas = word_deltas(text);
        assert_eq!(deltas, vec!["Hello", " there.", "  How", " are", " you?"]);
        assert_eq!(deltas.concat(), text);
    }

    #[tokio::test]
    async fn test_placeholder_echoes_last_user_message() {
        let chat = PlaceholderChat::new();
        let messages = vec![ChatMessage::system("sys"), ChatMessage::user("Teach me French!")];
        let reply: Vec<String> = chat
            .stream_reply(&messages)
            .await
            .unwrap()
            .map(|d| d.unwrap())
            .collect()
            .await;
        assert!(reply.concat().starts_with("You said: Teach me French. "));
    }

    #[test]
    fn test_requires_api_key() {
        let err = OpenAiChat::new(&BackendConfig::default()).unwrap_err();
        assert!(matches!(err, VoiceError::Config(_)));
    }
}

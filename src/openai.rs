use crate::error::AppError;
use crate::llm::{
    ChatMessage, ChatRequest, ChatTurn, LanguageModel, SentenceSplitter, StreamEvent, ToolCall,
};
use crate::openai_types::{
    OpenAIBatchResponse, OpenAIFunctionCall, OpenAIFunctionDef, OpenAIMessage, OpenAIPayload,
    OpenAIStreamResponse, OpenAITool, OpenAIToolCall, ToolCallDelta,
};
use crate::retry::{with_retry, DEFAULT_BACKOFF};

use async_trait::async_trait;
use futures_util::stream::StreamExt;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, trace};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct OpenAiClient {
    http_client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl OpenAiClient {
    pub fn new(
        http_client: reqwest::Client,
        api_key: impl Into<String>,
        model: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            http_client,
            api_key: api_key.into(),
            model: model.into(),
            base_url: base_url.into(),
        }
    }

    fn payload(&self, req: &ChatRequest, stream: bool) -> OpenAIPayload {
        let mut messages = Vec::with_capacity(req.messages.len() + 1);
        messages.push(OpenAIMessage {
            role: "system".to_string(),
            content: Some(req.system_prompt.clone()),
            ..Default::default()
        });
        messages.extend(req.messages.iter().map(to_wire));
        let tools = req
            .tools
            .iter()
            .map(|t| OpenAITool {
                kind: "function",
                function: OpenAIFunctionDef {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.parameters.clone(),
                },
            })
            .collect();
        OpenAIPayload {
            model: self.model.clone(),
            messages,
            stream: stream.then_some(true),
            max_tokens: req.max_tokens,
            tools,
        }
    }

    async fn send(&self, payload: &OpenAIPayload) -> Result<reqwest::Response, AppError> {
        let url = format!("{}/chat/completions", self.base_url);
        let resp = self
            .http_client
            .post(url)
            .bearer_auth(&self.api_key)
            .timeout(REQUEST_TIMEOUT)
            .json(payload)
            .send()
            .await
            .map_err(|e| {
                error!(error=%e, "failed to send request to OpenAI");
                AppError::Http(e)
            })?;
        let status = resp.status();
        if !status.is_success() {
            error!(status=%status, "OpenAI request rejected");
            return Err(AppError::Upstream {
                service: "openai",
                status: status.as_u16(),
            });
        }
        Ok(resp)
    }
}

#[async_trait]
impl LanguageModel for OpenAiClient {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatTurn, AppError> {
        let payload = self.payload(req, false);
        let resp = with_retry("openai.chat", DEFAULT_BACKOFF, AppError::is_transient, || {
            self.send(&payload)
        })
        .await?;
        let body = resp.json::<OpenAIBatchResponse>().await.map_err(|e| {
            error!(error=%e, "failed to deserialize OpenAI response");
            AppError::Http(e)
        })?;
        debug!(id=%body.id, model=%body.model, usage=?body.usage, "OpenAI completion");
        let message = body
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or(AppError::Internal("OpenAI response had no choices"))?;
        Ok(ChatTurn {
            content: message.content,
            tool_calls: message
                .tool_calls
                .unwrap_or_default()
                .into_iter()
                .map(|c| ToolCall {
                    id: c.id,
                    name: c.function.name,
                    arguments: c.function.arguments,
                })
                .collect(),
        })
    }

    async fn chat_stream(
        &self,
        req: &ChatRequest,
    ) -> Result<mpsc::Receiver<Result<StreamEvent, AppError>>, AppError> {
        let payload = self.payload(req, true);
        let resp = with_retry("openai.stream", DEFAULT_BACKOFF, AppError::is_transient, || {
            self.send(&payload)
        })
        .await?;
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(pump_sse(resp, tx));
        Ok(rx)
    }
}

fn to_wire(message: &ChatMessage) -> OpenAIMessage {
    match message {
        ChatMessage::User { content } => OpenAIMessage {
            role: "user".to_string(),
            content: Some(content.clone()),
            ..Default::default()
        },
        ChatMessage::Assistant {
            content,
            tool_calls,
        } => OpenAIMessage {
            role: "assistant".to_string(),
            content: content.clone(),
            tool_calls: (!tool_calls.is_empty()).then(|| {
                tool_calls
                    .iter()
                    .map(|c| OpenAIToolCall {
                        id: c.id.clone(),
                        kind: "function".to_string(),
                        function: OpenAIFunctionCall {
                            name: c.name.clone(),
                            arguments: c.arguments.clone(),
                        },
                    })
                    .collect()
            }),
            tool_call_id: None,
        },
        ChatMessage::Tool {
            tool_call_id,
            content,
        } => OpenAIMessage {
            role: "tool".to_string(),
            content: Some(content.clone()),
            tool_call_id: Some(tool_call_id.clone()),
            ..Default::default()
        },
    }
}

/// Tool-call fragments keyed by their index in the delta stream.
#[derive(Default)]
struct PendingToolCalls(BTreeMap<usize, ToolCall>);

impl PendingToolCalls {
    fn absorb(&mut self, deltas: Vec<ToolCallDelta>) {
        for delta in deltas {
            let entry = self.0.entry(delta.index).or_insert_with(|| ToolCall {
                id: String::new(),
                name: String::new(),
                arguments: String::new(),
            });
            if let Some(id) = delta.id {
                entry.id = id;
            }
            if let Some(function) = delta.function {
                if let Some(name) = function.name {
                    entry.name.push_str(&name);
                }
                if let Some(arguments) = function.arguments {
                    entry.arguments.push_str(&arguments);
                }
            }
        }
    }

    fn finish(self) -> Vec<ToolCall> {
        self.0.into_values().collect()
    }
}

/// Incremental parser for the `data: {...}` lines of an OpenAI event stream.  Byte chunks may
/// split a line, or a multi-byte character, anywhere, so partial input is carried over.
#[derive(Default)]
pub struct SseDecoder {
    bytes: Vec<u8>,
    carry: String,
    splitter: SentenceSplitter,
    tools: PendingToolCalls,
    done: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feed a network chunk.  A trailing incomplete UTF-8 sequence waits for the next chunk.
    pub fn feed_bytes(&mut self, chunk: &[u8]) -> Vec<String> {
        self.bytes.extend_from_slice(chunk);
        let complete = match std::str::from_utf8(&self.bytes) {
            Ok(_) => self.bytes.len(),
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            // genuinely invalid bytes: decode lossily rather than stall
            Err(_) => self.bytes.len(),
        };
        let head: Vec<u8> = self.bytes.drain(..complete).collect();
        let text = String::from_utf8_lossy(&head).into_owned();
        self.feed(&text)
    }

    /// Feed raw text; returns the sentences completed by it.
    pub fn feed(&mut self, text: &str) -> Vec<String> {
        self.carry.push_str(text);
        let mut sentences = vec![];
        while let Some(newline) = self.carry.find('\n') {
            let line: String = self.carry.drain(..=newline).collect();
            let line = line.trim();
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data == "[DONE]" {
                self.done = true;
                continue;
            }
            match serde_json::from_str::<OpenAIStreamResponse>(data) {
                Ok(response) => {
                    for choice in response.choices {
                        if let Some(content) = choice.delta.content {
                            sentences.extend(self.splitter.push(&content));
                        }
                        if let Some(tool_calls) = choice.delta.tool_calls {
                            self.tools.absorb(tool_calls);
                        }
                    }
                }
                Err(e) => trace!(error=%e, line=%data, "skipping unparseable stream line"),
            }
        }
        sentences
    }

    /// Flush what is left: a trailing sentence without terminal whitespace and any tool calls.
    pub fn finish(mut self) -> Vec<StreamEvent> {
        let mut events = vec![];
        if !self.bytes.is_empty() {
            let tail = std::mem::take(&mut self.bytes);
            self.carry.push_str(&String::from_utf8_lossy(&tail));
        }
        if !self.carry.trim().is_empty() {
            let rest = std::mem::take(&mut self.carry);
            for sentence in self.feed(&format!("{rest}\n")) {
                events.push(StreamEvent::Sentence(sentence));
            }
        }
        if let Some(rest) = self.splitter.finish() {
            events.push(StreamEvent::Sentence(rest));
        }
        let calls = self.tools.finish();
        if !calls.is_empty() {
            events.push(StreamEvent::ToolCalls(calls));
        }
        events
    }
}

async fn pump_sse(resp: reqwest::Response, tx: mpsc::Sender<Result<StreamEvent, AppError>>) {
    let mut response_stream = resp.bytes_stream();
    let mut decoder = SseDecoder::new();
    while let Some(chunk) = response_stream.next().await {
        match chunk {
            Ok(chunk) => {
                for sentence in decoder.feed_bytes(&chunk) {
                    if tx.send(Ok(StreamEvent::Sentence(sentence))).await.is_err() {
                        // receiver gone: the caller hung up or moved on
                        return;
                    }
                }
                if decoder.is_done() {
                    break;
                }
            }
            Err(e) => {
                error!(error=%e, "failed to read bytes from OpenAI response");
                let _ = tx.send(Err(AppError::Http(e))).await;
                return;
            }
        }
    }
    for event in decoder.finish() {
        if tx.send(Ok(event)).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(json: &str) -> String {
        format!("data: {json}\n\n")
    }

    fn event(delta: serde_json::Value, finish: Option<&str>) -> String {
        let body = serde_json::json!({
            "id": "x",
            "choices": [{"index": 0, "delta": delta, "finish_reason": finish}],
        });
        line(&body.to_string())
    }

    #[test]
    fn decodes_content_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        let first = event(serde_json::json!({"role": "assistant"}), None);
        let second = event(serde_json::json!({"content": "Hello there. How"}), None);
        let third = event(serde_json::json!({"content": " are you?"}), Some("stop"));
        let all = format!("{first}{second}{third}data: [DONE]\n\n");
        let (a, b) = all.split_at(first.len() + 20);

        let mut sentences = decoder.feed(a);
        sentences.extend(decoder.feed(b));
        assert_eq!(sentences, vec!["Hello there."]);
        assert!(decoder.is_done());
        assert_eq!(
            decoder.finish(),
            vec![StreamEvent::Sentence("How are you?".to_string())]
        );
    }

    #[test]
    fn multi_byte_characters_survive_chunk_boundaries() {
        let mut decoder = SseDecoder::new();
        let text = event(serde_json::json!({"content": "Café opens at 7. "}), None);
        let bytes = text.as_bytes();
        let split = text.find('é').unwrap() + 1;
        assert!(!text.is_char_boundary(split));

        let mut sentences = decoder.feed_bytes(&bytes[..split]);
        sentences.extend(decoder.feed_bytes(&bytes[split..]));
        assert_eq!(sentences, vec!["Café opens at 7."]);
        assert!(decoder.finish().is_empty());
    }

    #[test]
    fn accumulates_tool_call_fragments() {
        let mut decoder = SseDecoder::new();
        let opening = serde_json::json!({"tool_calls": [{
            "index": 0,
            "id": "call_9",
            "type": "function",
            "function": {"name": "current_time", "arguments": ""},
        }]});
        let closing = serde_json::json!({"tool_calls": [{
            "index": 0,
            "function": {"arguments": "{}"},
        }]});
        decoder.feed(&event(opening, None));
        decoder.feed(&event(closing, Some("tool_calls")));
        assert_eq!(
            decoder.finish(),
            vec![StreamEvent::ToolCalls(vec![ToolCall {
                id: "call_9".to_string(),
                name: "current_time".to_string(),
                arguments: "{}".to_string(),
            }])]
        );
    }

    #[test]
    fn wire_messages_carry_tool_plumbing() {
        let client =
            OpenAiClient::new(reqwest::Client::new(), "sk", "gpt-test", "http://localhost");
        let req = ChatRequest {
            system_prompt: "Be brief.".to_string(),
            messages: vec![
                ChatMessage::user("what time is it"),
                ChatMessage::Assistant {
                    content: None,
                    tool_calls: vec![ToolCall {
                        id: "c1".to_string(),
                        name: "current_time".to_string(),
                        arguments: "{}".to_string(),
                    }],
                },
                ChatMessage::Tool {
                    tool_call_id: "c1".to_string(),
                    content: "noon".to_string(),
                },
            ],
            ..Default::default()
        };
        let payload = serde_json::to_value(client.payload(&req, true)).unwrap();
        assert_eq!(payload["stream"], true);
        assert_eq!(payload["messages"][0]["role"], "system");
        assert_eq!(payload["messages"][2]["tool_calls"][0]["type"], "function");
        assert_eq!(payload["messages"][3]["tool_call_id"], "c1");
        assert!(payload.get("tools").is_none());
    }
}

//! Language-model contract used by apps.  A model either answers a whole request at once or
//! streams sentence-sized fragments; in both cases it may instead ask for tools to be run, and
//! the caller loops with the tool output appended.

use crate::consts::{ASCII_SENTENCE_ENDINGS, MAX_HISTORY_MESSAGES, MAX_TOOL_ROUNDS};
use crate::error::AppError;
use crate::tools::{ToolDefinition, ToolRegistry};
use crate::types::CallContext;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Raw JSON arguments as produced by the model.
    pub arguments: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum ChatMessage {
    User {
        content: String,
    },
    Assistant {
        #[serde(default)]
        content: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
    },
    Tool {
        tool_call_id: String,
        content: String,
    },
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        ChatMessage::User {
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        ChatMessage::Assistant {
            content: Some(content.into()),
            tool_calls: vec![],
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ChatRequest {
    pub system_prompt: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: Option<u32>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChatTurn {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    Sentence(String),
    /// Emitted at most once, after the last sentence of a round.
    ToolCalls(Vec<ToolCall>),
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatTurn, AppError>;

    /// Start a streamed completion.  Errors opening the stream are returned directly; errors
    /// after that arrive through the channel.
    async fn chat_stream(
        &self,
        req: &ChatRequest,
    ) -> Result<mpsc::Receiver<Result<StreamEvent, AppError>>, AppError>;
}

/// Run `req` to a final text answer, executing tool calls in between.  Returns the answer and
/// every message the exchange added, ready to be appended to the conversation history.
pub async fn complete_with_tools(
    llm: &dyn LanguageModel,
    tools: &ToolRegistry,
    allowed: &[String],
    ctx: &CallContext,
    mut req: ChatRequest,
) -> Result<(String, Vec<ChatMessage>), AppError> {
    let mut added = vec![];
    for round in 0..MAX_TOOL_ROUNDS {
        let turn = llm.chat(&req).await?;
        if turn.tool_calls.is_empty() {
            let text = turn.content.unwrap_or_default();
            let message = ChatMessage::assistant(text.clone());
            added.push(message);
            return Ok((text, added));
        }
        debug!(
            call_sid=%ctx.call_sid,
            round,
            calls = turn.tool_calls.len(),
            "model requested tools"
        );
        let results = run_tool_calls(tools, allowed, ctx, &turn.tool_calls).await;
        let message = ChatMessage::Assistant {
            content: turn.content,
            tool_calls: turn.tool_calls,
        };
        req.messages.push(message.clone());
        added.push(message);
        for result in results {
            req.messages.push(result.clone());
            added.push(result);
        }
    }
    warn!(call_sid=%ctx.call_sid, "tool loop did not settle");
    Err(AppError::Internal("tool loop exceeded its round limit"))
}

/// Execute every call and wrap the outputs as tool messages, in order.
pub async fn run_tool_calls(
    tools: &ToolRegistry,
    allowed: &[String],
    ctx: &CallContext,
    calls: &[ToolCall],
) -> Vec<ChatMessage> {
    let mut out = Vec::with_capacity(calls.len());
    for call in calls {
        let content = tools.invoke(allowed, ctx, call).await;
        out.push(ChatMessage::Tool {
            tool_call_id: call.id.clone(),
            content,
        });
    }
    out
}

/// Keep the tail of a conversation, never starting on a dangling tool result.
pub fn trim_history(messages: &mut Vec<ChatMessage>) {
    if messages.len() > MAX_HISTORY_MESSAGES {
        let excess = messages.len() - MAX_HISTORY_MESSAGES;
        messages.drain(..excess);
    }
    let leading_tools = messages
        .iter()
        .take_while(|m| matches!(m, ChatMessage::Tool { .. }))
        .count();
    messages.drain(..leading_tools);
}

/// Accumulates streamed text and cuts it at sentence boundaries: one of `. ! ?` followed by
/// whitespace.
#[derive(Default)]
pub struct SentenceSplitter {
    buf: String,
}

impl SentenceSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, fragment: &str) -> Vec<String> {
        self.buf.push_str(fragment);
        let mut sentences = vec![];
        loop {
            let cut = {
                let mut chars = self.buf.char_indices().peekable();
                let mut found = None;
                while let Some((i, c)) = chars.next() {
                    if ASCII_SENTENCE_ENDINGS.contains(&c) {
                        if let Some((_, next)) = chars.peek() {
                            if next.is_whitespace() {
                                found = Some(i + c.len_utf8());
                                break;
                            }
                        }
                    }
                }
                found
            };
            match cut {
                Some(end) => {
                    let rest = self.buf.split_off(end);
                    let sentence = std::mem::replace(&mut self.buf, rest.trim_start().to_string());
                    let sentence = sentence.trim().to_string();
                    if !sentence.is_empty() {
                        sentences.push(sentence);
                    }
                }
                None => break,
            }
        }
        sentences
    }

    /// Whatever is left once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buf);
        let rest = rest.trim();
        if rest.is_empty() {
            None
        } else {
            Some(rest.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_terminal_punctuation_followed_by_whitespace() {
        let mut splitter = SentenceSplitter::new();
        assert!(splitter.push("Here's the").is_empty());
        assert!(splitter.push(" answer.").is_empty());
        assert_eq!(splitter.push(" Anything"), vec!["Here's the answer."]);
        assert_eq!(
            splitter.push(" else? Yes! It costs $3.50 today"),
            vec!["Anything else?", "Yes!"]
        );
        assert_eq!(splitter.finish().as_deref(), Some("It costs $3.50 today"));
        assert_eq!(splitter.finish(), None);
    }

    #[test]
    fn trimming_never_starts_on_a_tool_result() {
        let mut messages = vec![ChatMessage::Tool {
            tool_call_id: "a".to_string(),
            content: "x".to_string(),
        }];
        for i in 0..MAX_HISTORY_MESSAGES {
            messages.push(ChatMessage::user(format!("m{i}")));
        }
        trim_history(&mut messages);
        assert_eq!(messages.len(), MAX_HISTORY_MESSAGES);
        assert_eq!(messages[0], ChatMessage::user("m0"));

        let mut short = vec![
            ChatMessage::Tool {
                tool_call_id: "a".to_string(),
                content: "x".to_string(),
            },
            ChatMessage::assistant("hi"),
        ];
        trim_history(&mut short);
        assert_eq!(short, vec![ChatMessage::assistant("hi")]);
    }

    #[test]
    fn history_round_trips_through_json() {
        let message = ChatMessage::Assistant {
            content: None,
            tool_calls: vec![ToolCall {
                id: "call_1".to_string(),
                name: "current_time".to_string(),
                arguments: "{}".to_string(),
            }],
        };
        let json = serde_json::to_string(&message).unwrap();
        assert!(json.contains("\"role\":\"assistant\""));
        let back: ChatMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, message);
    }
}

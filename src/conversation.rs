//! Open-ended assistant backed by the language model.  History lives in the cache for the
//! length of the call; replies can be produced whole or streamed sentence by sentence.

use crate::app::{pick, AppBase, AppDeps, AppInfo, VoiceApp};
use crate::cache::{get_json, keys, put_json};
use crate::consts::{APOLOGY_RETRY, DEFAULT_GOODBYES, MAX_TOOL_ROUNDS, TOOL_FILLER};
use crate::error::AppError;
use crate::llm::{
    complete_with_tools, run_tool_calls, trim_history, ChatMessage, ChatRequest, StreamEvent,
};
use crate::looks_like_goodbye;
use crate::types::{
    CallContext, ChunkSender, ChunkStream, PhraseKind, Reply, SpeechChunk, TurnInput,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

const STREAM_BUFFER: usize = 4;

fn default_greetings() -> Vec<String> {
    vec!["Hello! How can I help you today?".to_string()]
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ConversationConfig {
    pub system_prompt: String,
    #[serde(default = "default_greetings")]
    pub greetings: Vec<String>,
    #[serde(default)]
    pub goodbyes: Vec<String>,
    /// Names of registry tools the model may call.
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

impl ConversationConfig {
    fn goodbye(&self) -> String {
        pick(&self.goodbyes)
            .or_else(|| pick(DEFAULT_GOODBYES))
            .unwrap_or_else(|| "Goodbye!".to_string())
    }

    fn request(&self, deps: &AppDeps, messages: Vec<ChatMessage>) -> ChatRequest {
        ChatRequest {
            system_prompt: self.system_prompt.clone(),
            messages,
            tools: deps.tools.definitions(&self.tools),
            max_tokens: self.max_tokens,
        }
    }
}

pub struct ConversationalApp {
    base: AppBase,
    config: Arc<ConversationConfig>,
}

impl ConversationalApp {
    pub fn new(info: AppInfo, config: ConversationConfig, deps: AppDeps) -> Self {
        Self {
            base: AppBase::new(info, deps),
            config: Arc::new(config),
        }
    }
}

async fn load_history(deps: &AppDeps, ctx: &CallContext) -> Vec<ChatMessage> {
    match get_json(&*deps.cache, &keys::conversation(&ctx.call_sid)).await {
        Ok(history) => history.unwrap_or_default(),
        Err(e) => {
            warn!(
                call_sid=%ctx.call_sid,
                error=%e,
                "unreadable conversation history; starting fresh"
            );
            vec![]
        }
    }
}

async fn save_history(deps: &AppDeps, ctx: &CallContext, mut history: Vec<ChatMessage>) {
    trim_history(&mut history);
    let key = keys::conversation(&ctx.call_sid);
    if let Err(e) = put_json(&*deps.cache, &key, &history, deps.ttl.conversation).await {
        warn!(call_sid=%ctx.call_sid, error=%e, "failed to save conversation history");
    }
}

#[async_trait]
impl VoiceApp for ConversationalApp {
    fn info(&self) -> &AppInfo {
        &self.base.info
    }

    async fn on_start(&self, ctx: &CallContext) -> Result<Reply, AppError> {
        self.base.log_start(ctx);
        let greeting = pick(&self.config.greetings)
            .unwrap_or_else(|| "Hello! How can I help you today?".to_string());
        save_history(&self.base.deps, ctx, vec![ChatMessage::assistant(greeting.clone())]).await;
        self.base.record_turn(ctx, "app", &greeting);
        Ok(Reply::listen(greeting))
    }

    async fn on_speech(&self, ctx: &CallContext, input: &TurnInput) -> Result<Reply, AppError> {
        self.base.record_turn(ctx, "caller", &input.text);
        if looks_like_goodbye(&input.text) {
            let goodbye = self.config.goodbye();
            self.base.record_turn(ctx, "app", &goodbye);
            return Ok(Reply::hang_up(goodbye));
        }

        let deps = &self.base.deps;
        let mut history = load_history(deps, ctx).await;
        history.push(ChatMessage::user(input.text.clone()));
        let req = self.config.request(deps, history.clone());
        match complete_with_tools(&*deps.llm, &deps.tools, &self.config.tools, ctx, req).await {
            Ok((text, added)) => {
                history.extend(added);
                save_history(deps, ctx, history).await;
                self.base.record_turn(ctx, "app", &text);
                Ok(Reply::listen(text))
            }
            Err(e) => {
                warn!(call_sid=%ctx.call_sid, error=%e, "model call failed");
                Ok(Reply::listen(APOLOGY_RETRY))
            }
        }
    }

    async fn on_end(&self, ctx: &CallContext) -> Result<(), AppError> {
        self.base.cleanup(ctx).await
    }

    fn stream_speech(&self, ctx: &CallContext, input: &TurnInput) -> Option<ChunkStream> {
        self.base.record_turn(ctx, "caller", &input.text);
        if looks_like_goodbye(&input.text) {
            let goodbye = self.config.goodbye();
            self.base.record_turn(ctx, "app", &goodbye);
            return Some(ChunkStream::from_chunks(vec![
                SpeechChunk::phrase(PhraseKind::Goodbye, goodbye).with_hangup(),
            ]));
        }

        let (tx, stream) = ChunkStream::channel(STREAM_BUFFER);
        let producer = Producer {
            deps: self.base.deps.clone(),
            config: self.config.clone(),
            ctx: ctx.clone(),
            tx,
            spoken: vec![],
        };
        tokio::spawn(producer.run(input.text.clone()));
        Some(stream)
    }
}

/// Background task feeding one streamed reply.
struct Producer {
    deps: AppDeps,
    config: Arc<ConversationConfig>,
    ctx: CallContext,
    tx: ChunkSender,
    spoken: Vec<String>,
}

enum RoundEnd {
    Answered,
    Stopped,
}

impl Producer {
    async fn run(mut self, user_text: String) {
        let mut history = load_history(&self.deps, &self.ctx).await;
        history.push(ChatMessage::user(user_text));

        match self.rounds(&mut history).await {
            Ok(RoundEnd::Answered) => {}
            Ok(RoundEnd::Stopped) => {
                debug!(call_sid=%self.ctx.call_sid, "consumer stopped; ending stream early");
            }
            Err(e) => {
                warn!(call_sid=%self.ctx.call_sid, error=%e, "streamed model call failed");
                if self.tx.send(SpeechChunk::fresh(APOLOGY_RETRY)).await {
                    self.spoken.push(APOLOGY_RETRY.to_string());
                }
            }
        }

        // history is kept even when the consumer went away mid-reply
        save_history(&self.deps, &self.ctx, history).await;
        if !self.spoken.is_empty() {
            let text = self.spoken.join(" ");
            if let Err(e) = self.deps.store.record_turn(&self.ctx.call_sid, "app", &text).await {
                warn!(call_sid=%self.ctx.call_sid, error=%e, "failed to record turn");
            }
        }
    }

    async fn rounds(&mut self, history: &mut Vec<ChatMessage>) -> Result<RoundEnd, AppError> {
        for round in 0..MAX_TOOL_ROUNDS {
            let req = self.config.request(&self.deps, history.clone());
            let mut events = self.deps.llm.chat_stream(&req).await?;
            let mut sentences: Vec<String> = vec![];
            let mut calls = vec![];

            while let Some(event) = events.recv().await {
                match event? {
                    StreamEvent::Sentence(sentence) => {
                        let delivered = self.tx.send(SpeechChunk::fresh(sentence.clone())).await;
                        if delivered {
                            self.spoken.push(sentence.clone());
                        }
                        sentences.push(sentence);
                        if !delivered {
                            history.push(ChatMessage::assistant(sentences.join(" ")));
                            return Ok(RoundEnd::Stopped);
                        }
                    }
                    StreamEvent::ToolCalls(requested) => calls = requested,
                }
            }

            if calls.is_empty() {
                history.push(ChatMessage::assistant(sentences.join(" ")));
                return Ok(RoundEnd::Answered);
            }

            debug!(
                call_sid=%self.ctx.call_sid,
                round,
                calls = calls.len(),
                "model requested tools"
            );
            if !self
                .tx
                .send(SpeechChunk::phrase(PhraseKind::Filler, TOOL_FILLER))
                .await
            {
                return Ok(RoundEnd::Stopped);
            }
            let results =
                run_tool_calls(&self.deps.tools, &self.config.tools, &self.ctx, &calls).await;
            let content = if sentences.is_empty() {
                None
            } else {
                Some(sentences.join(" "))
            };
            history.push(ChatMessage::Assistant {
                content,
                tool_calls: calls,
            });
            history.extend(results);
        }
        Err(AppError::Internal("tool loop exceeded its round limit"))
    }
}

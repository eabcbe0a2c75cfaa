#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use voiceapps_rs::app::AppDeps;
use voiceapps_rs::cache::MemoryCache;
use voiceapps_rs::config::{PollConfig, TtlConfig};
use voiceapps_rs::error::AppError;
use voiceapps_rs::llm::{ChatRequest, ChatTurn, LanguageModel, StreamEvent, ToolCall};
use voiceapps_rs::pipeline::StreamPipeline;
use voiceapps_rs::store::CallStore;
use voiceapps_rs::survey::SurveyAnswer;
use voiceapps_rs::tools::ToolRegistry;
use voiceapps_rs::tts::{ProviderVoiceOnly, Renderer, Utterance};
use voiceapps_rs::types::CallContext;

pub enum Script {
    Turn(ChatTurn),
    Stream(Vec<StreamEvent>),
    Fail,
}

/// Language model that plays back a fixed script, one entry per request.
#[derive(Default)]
pub struct ScriptedModel {
    script: Mutex<VecDeque<Script>>,
    pub requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedModel {
    pub fn new(script: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(vec![]),
        })
    }

    fn next(&self, req: &ChatRequest) -> Option<Script> {
        self.requests.lock().unwrap().push(req.clone());
        self.script.lock().unwrap().pop_front()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatTurn, AppError> {
        match self.next(req) {
            Some(Script::Turn(turn)) => Ok(turn),
            _ => Err(AppError::Upstream {
                service: "scripted",
                status: 503,
            }),
        }
    }

    async fn chat_stream(
        &self,
        req: &ChatRequest,
    ) -> Result<mpsc::Receiver<Result<StreamEvent, AppError>>, AppError> {
        let events = match self.next(req) {
            Some(Script::Stream(events)) => events,
            _ => {
                return Err(AppError::Upstream {
                    service: "scripted",
                    status: 503,
                })
            }
        };
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            for event in events {
                if tx.send(Ok(event)).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}

pub fn text_turn(text: &str) -> Script {
    Script::Turn(ChatTurn {
        content: Some(text.to_string()),
        tool_calls: vec![],
    })
}

pub fn tool_turn(name: &str) -> Script {
    Script::Turn(ChatTurn {
        content: None,
        tool_calls: vec![tool_call(name)],
    })
}

pub fn tool_call(name: &str) -> ToolCall {
    ToolCall {
        id: format!("call_{name}"),
        name: name.to_string(),
        arguments: "{}".to_string(),
    }
}

pub fn sentences(texts: &[&str]) -> Script {
    Script::Stream(
        texts
            .iter()
            .map(|t| StreamEvent::Sentence(t.to_string()))
            .collect(),
    )
}

#[derive(Clone, Debug, PartialEq)]
pub struct RecordedSurvey {
    pub call_sid: String,
    pub answers: Vec<SurveyAnswer>,
    pub summary: Option<String>,
}

/// Call store that keeps everything in memory for assertions.
#[derive(Default)]
pub struct RecordingStore {
    pub starts: Mutex<Vec<String>>,
    pub turns: Mutex<Vec<(String, String, String)>>,
    pub surveys: Mutex<Vec<RecordedSurvey>>,
    pub ends: Mutex<Vec<String>>,
}

impl RecordingStore {
    pub async fn wait_for_survey(&self) -> RecordedSurvey {
        for _ in 0..200 {
            if let Some(found) = self.surveys.lock().unwrap().first().cloned() {
                return found;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("survey result never recorded");
    }
}

#[async_trait]
impl CallStore for RecordingStore {
    async fn record_call_start(&self, ctx: &CallContext) -> Result<(), AppError> {
        self.starts.lock().unwrap().push(ctx.call_sid.clone());
        Ok(())
    }

    async fn record_turn(&self, call_sid: &str, speaker: &str, text: &str) -> Result<(), AppError> {
        self.turns
            .lock()
            .unwrap()
            .push((call_sid.to_string(), speaker.to_string(), text.to_string()));
        Ok(())
    }

    async fn record_survey_result(
        &self,
        ctx: &CallContext,
        answers: &[SurveyAnswer],
        summary: Option<&str>,
    ) -> Result<(), AppError> {
        self.surveys.lock().unwrap().push(RecordedSurvey {
            call_sid: ctx.call_sid.clone(),
            answers: answers.to_vec(),
            summary: summary.map(str::to_string),
        });
        Ok(())
    }

    async fn record_call_end(&self, call_sid: &str) -> Result<(), AppError> {
        self.ends.lock().unwrap().push(call_sid.to_string());
        Ok(())
    }
}

pub struct Harness {
    pub cache: Arc<MemoryCache>,
    pub store: Arc<RecordingStore>,
    pub deps: AppDeps,
    pub pipeline: StreamPipeline,
}

pub fn harness(llm: Arc<ScriptedModel>) -> Harness {
    let cache = Arc::new(MemoryCache::new());
    let store = Arc::new(RecordingStore::default());
    let deps = AppDeps {
        cache: cache.clone(),
        llm,
        tools: Arc::new(ToolRegistry::with_builtins()),
        store: store.clone(),
        ttl: TtlConfig::default(),
    };
    let renderer = Arc::new(Renderer::new(
        Arc::new(ProviderVoiceOnly),
        cache.clone(),
        TtlConfig::default(),
        "voice-a",
    ));
    let poll = PollConfig {
        interval: Duration::from_millis(5),
        max_attempts: 400,
    };
    let pipeline = StreamPipeline::new(cache.clone(), renderer, poll, TtlConfig::default());
    Harness {
        cache,
        store,
        deps,
        pipeline,
    }
}

pub fn call(call_sid: &str, app_id: &str) -> CallContext {
    CallContext {
        call_sid: call_sid.to_string(),
        from: "+15550001111".to_string(),
        to: "+15550002222".to_string(),
        app_id: app_id.to_string(),
    }
}

pub fn say(text: &str) -> Utterance {
    Utterance::say(text, None)
}

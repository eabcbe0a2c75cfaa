//! The contract every voice application implements.

use crate::cache::{keys, CacheStore};
use crate::config::TtlConfig;
use crate::error::AppError;
use crate::llm::LanguageModel;
use crate::store::CallStore;
use crate::tools::ToolRegistry;
use crate::types::{CallContext, ChunkStream, Reply, TurnInput};

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

/// Static description of an app.  Fixed at registration; only an explicit replace-by-id
/// changes it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AppInfo {
    pub id: String,
    pub name: String,
    pub fillers: Vec<String>,
    pub retries: Vec<String>,
    /// Synthesis voice; the platform default when unset.
    pub voice: Option<String>,
}

#[async_trait]
pub trait VoiceApp: Send + Sync {
    fn info(&self) -> &AppInfo;

    async fn on_start(&self, ctx: &CallContext) -> Result<Reply, AppError>;

    async fn on_speech(&self, ctx: &CallContext, input: &TurnInput) -> Result<Reply, AppError>;

    async fn on_end(&self, _ctx: &CallContext) -> Result<(), AppError> {
        Ok(())
    }

    /// Lazily produced reply.  Apps that can only answer synchronously return `None`.
    fn stream_speech(&self, _ctx: &CallContext, _input: &TurnInput) -> Option<ChunkStream> {
        None
    }
}

/// Shared collaborators handed to every app at construction.
#[derive(Clone)]
pub struct AppDeps {
    pub cache: Arc<dyn CacheStore>,
    pub llm: Arc<dyn LanguageModel>,
    pub tools: Arc<ToolRegistry>,
    pub store: Arc<dyn CallStore>,
    pub ttl: TtlConfig,
}

/// Behaviour common to the builtin app variants: start logging and end-of-call cleanup.
pub struct AppBase {
    pub info: AppInfo,
    pub deps: AppDeps,
}

impl AppBase {
    pub fn new(info: AppInfo, deps: AppDeps) -> Self {
        Self { info, deps }
    }

    pub fn log_start(&self, ctx: &CallContext) {
        info!(app=%self.info.id, call_sid=%ctx.call_sid, from=%ctx.from, "call started");
    }

    /// Forget everything the app kept for this call.
    pub async fn cleanup(&self, ctx: &CallContext) -> Result<(), AppError> {
        for key in [keys::conversation(&ctx.call_sid), keys::survey(&ctx.call_sid)] {
            if let Err(e) = self.deps.cache.delete(&key).await {
                warn!(call_sid=%ctx.call_sid, key=%key, error=%e, "failed to delete call state");
            }
        }
        info!(app=%self.info.id, call_sid=%ctx.call_sid, "call ended");
        Ok(())
    }

    /// Fire-and-forget transcript write; never delays the reply.
    pub fn record_turn(&self, ctx: &CallContext, speaker: &'static str, text: &str) {
        let store = self.deps.store.clone();
        let call_sid = ctx.call_sid.clone();
        let text = text.to_string();
        tokio::spawn(async move {
            if let Err(e) = store.record_turn(&call_sid, speaker, &text).await {
                warn!(call_sid=%call_sid, error=%e, "failed to record turn");
            }
        });
    }
}

/// Uniform pick from a pool, `None` when the pool is empty.
pub fn pick<T: AsRef<str>>(pool: &[T]) -> Option<String> {
    use rand::seq::IndexedRandom;
    pool.choose(&mut rand::rng()).map(|s| s.as_ref().to_string())
}

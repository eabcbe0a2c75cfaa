use crate::app::VoiceApp;
use crate::cache::CacheStore;
use crate::config::Config;
use crate::error::AppError;
use crate::pipeline::StreamPipeline;
use crate::registry::AppRegistry;
use crate::store::CallStore;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Everything a turn needs to know about the call it belongs to.  Persisted under `call:{sid}`
/// on the first webhook so later turns stay on the same app.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CallContext {
    pub call_sid: String,
    pub from: String,
    pub to: String,
    pub app_id: String,
}

/// One caller utterance as transcribed by the telephony provider.
#[derive(Clone, Debug, Default)]
pub struct TurnInput {
    pub text: String,
    pub confidence: Option<f32>,
    pub language: Option<String>,
}

impl TurnInput {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// A complete, synchronous answer from an app.
#[derive(Clone, Debug, PartialEq)]
pub struct Reply {
    pub speech: String,
    pub keep_listening: bool,
    pub hang_up: bool,
}

impl Reply {
    pub fn listen(speech: impl Into<String>) -> Self {
        Self {
            speech: speech.into(),
            keep_listening: true,
            hang_up: false,
        }
    }

    pub fn hang_up(speech: impl Into<String>) -> Self {
        Self {
            speech: speech.into(),
            keep_listening: false,
            hang_up: true,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PhraseKind {
    Greeting,
    Filler,
    Goodbye,
    Retry,
}

impl fmt::Display for PhraseKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            PhraseKind::Greeting => "greeting",
            PhraseKind::Filler => "filler",
            PhraseKind::Goodbye => "goodbye",
            PhraseKind::Retry => "retry",
        };
        write!(f, "{s}")
    }
}

/// Deterministic identity of a reusable phrase, so its audio can be shared across calls.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct StableKey {
    pub kind: PhraseKind,
    pub slug: String,
}

impl StableKey {
    pub fn new(kind: PhraseKind, text: &str) -> Self {
        Self {
            kind,
            slug: slugify(text),
        }
    }

    pub fn is_filler(&self) -> bool {
        self.kind == PhraseKind::Filler
    }

    /// Audio id for this phrase rendered in `voice`.
    pub fn audio_id(&self, voice: &str) -> String {
        format!("phrase:{}:{}:{}", self.kind, slugify(voice), self.slug)
    }
}

fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    for word in text
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        if !slug.is_empty() {
            slug.push('-');
        }
        slug.push_str(&word.to_ascii_lowercase());
        if slug.len() >= 80 {
            slug.truncate(80);
            break;
        }
    }
    slug
}

/// One sentence-sized unit of speech.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SpeechChunk {
    pub text: String,
    /// Only ever set on the last chunk of a call-ending reply.
    #[serde(default)]
    pub hangup: bool,
    #[serde(default)]
    pub key: Option<StableKey>,
}

impl SpeechChunk {
    pub fn fresh(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            hangup: false,
            key: None,
        }
    }

    pub fn phrase(kind: PhraseKind, text: impl Into<String>) -> Self {
        let text = text.into();
        let key = Some(StableKey::new(kind, &text));
        Self {
            text,
            hangup: false,
            key,
        }
    }

    pub fn with_hangup(mut self) -> Self {
        self.hangup = true;
        self
    }

    pub fn is_filler(&self) -> bool {
        self.key.as_ref().map(StableKey::is_filler).unwrap_or(false)
    }
}

/// Consumer half of a lazily produced reply.  The producer runs on its own task and suspends
/// whenever the channel is full; `stop` tells it the consumer has gone away so it can clean up.
pub struct ChunkStream {
    rx: mpsc::Receiver<Result<SpeechChunk, AppError>>,
    stop: CancellationToken,
}

/// Producer half of a `ChunkStream`.
pub struct ChunkSender {
    tx: mpsc::Sender<Result<SpeechChunk, AppError>>,
    stop: CancellationToken,
}

impl ChunkStream {
    pub fn channel(buffer: usize) -> (ChunkSender, ChunkStream) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let stop = CancellationToken::new();
        (
            ChunkSender {
                tx,
                stop: stop.clone(),
            },
            ChunkStream { rx, stop },
        )
    }

    /// A stream whose chunks are all known up front.
    pub fn from_chunks(chunks: Vec<SpeechChunk>) -> ChunkStream {
        let (tx, rx) = mpsc::channel(chunks.len().max(1));
        for chunk in chunks {
            // capacity matches the chunk count, so this cannot fail
            let _ = tx.try_send(Ok(chunk));
        }
        ChunkStream {
            rx,
            stop: CancellationToken::new(),
        }
    }

    pub async fn next(&mut self) -> Option<Result<SpeechChunk, AppError>> {
        self.rx.recv().await
    }

    /// True once the producer has finished and every buffered chunk has been taken.
    pub fn is_exhausted(&self) -> bool {
        self.rx.is_closed() && self.rx.is_empty()
    }

    pub fn stop(&mut self) {
        self.stop.cancel();
        self.rx.close();
    }
}

impl ChunkSender {
    /// Hand a chunk to the consumer.  Returns false once the consumer has stopped listening, at
    /// which point the producer should wrap up.
    pub async fn send(&self, chunk: SpeechChunk) -> bool {
        self.deliver(Ok(chunk)).await
    }

    pub async fn fail(&self, error: AppError) -> bool {
        self.deliver(Err(error)).await
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled() || self.tx.is_closed()
    }

    async fn deliver(&self, item: Result<SpeechChunk, AppError>) -> bool {
        if self.is_stopped() {
            return false;
        }
        tokio::select! {
            _ = self.stop.cancelled() => false,
            res = self.tx.send(item) => res.is_ok(),
        }
    }
}

/// Deferred `on_end` for a call-ending turn.  Run it only after the reply has been handed back
/// to the transport.
pub struct Cleanup {
    app: Arc<dyn VoiceApp>,
    ctx: CallContext,
}

impl Cleanup {
    pub fn new(app: Arc<dyn VoiceApp>, ctx: CallContext) -> Self {
        Self { app, ctx }
    }

    pub async fn run(self) {
        if let Err(e) = self.app.on_end(&self.ctx).await {
            warn!(call_sid=%self.ctx.call_sid, error=%e, "app cleanup failed");
        }
    }

    pub fn spawn(self) {
        tokio::spawn(self.run());
    }
}

/// Outcome of one turn, as decided by the turn engine.
pub enum TurnResult {
    NoInput {
        retry_phrase: String,
    },
    Response {
        reply: Reply,
        cleanup: Option<Cleanup>,
    },
    Stream {
        chunks: ChunkStream,
        pre_filler: Option<SpeechChunk>,
        skip_fillers: bool,
        cleanup_on_hangup: Cleanup,
    },
}

pub struct AppState {
    pub config: Config,
    pub registry: Arc<AppRegistry>,
    pub cache: Arc<dyn CacheStore>,
    pub pipeline: Arc<StreamPipeline>,
    pub store: Arc<dyn CallStore>,
}

//! Delivery of turn results over a request/response transport.  A streamed reply plays its
//! first chunk (or a filler) right away; the rest is rendered by a background task into a
//! per-turn cache namespace, and the transport polls that namespace through a chain of
//! continuation redirects.

use crate::cache::{get_json, put_json, CacheStore};
use crate::config::{PollConfig, TtlConfig};
use crate::consts::APOLOGY_RETRY;
use crate::error::AppError;
use crate::tts::{Renderer, Utterance};
use crate::types::{CallContext, ChunkStream, Cleanup, PhraseKind, Reply, SpeechChunk, TurnResult};

use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// What the transport should do after playing an instruction's audio.
#[derive(Clone, Debug, PartialEq)]
pub enum NextStep {
    /// Prompt the caller and transcribe what they say.
    Listen,
    /// Redirect to the continuation poller for `turn`, having played up to `index`.
    Continue { turn: String, index: u32 },
    HangUp { pause: bool },
}

#[derive(Clone, Debug, PartialEq)]
pub struct Instruction {
    pub play: Vec<Utterance>,
    pub next: NextStep,
}

impl Instruction {
    pub fn listen(play: Vec<Utterance>) -> Self {
        Self {
            play,
            next: NextStep::Listen,
        }
    }

    pub fn hang_up(play: Vec<Utterance>, pause: bool) -> Self {
        Self {
            play,
            next: NextStep::HangUp { pause },
        }
    }
}

/// Cache namespace of one streamed turn: `stream:{call_sid}:{turn_id}:*`.  The turn id is fresh
/// per turn, so a slow writer from an earlier turn can never be read by a later poller.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamCursor {
    pub call_sid: String,
    pub turn_id: String,
}

impl StreamCursor {
    pub fn new(call_sid: &str) -> Self {
        Self::resume(call_sid, &Uuid::new_v4().to_string())
    }

    pub fn resume(call_sid: &str, turn_id: &str) -> Self {
        Self {
            call_sid: call_sid.to_string(),
            turn_id: turn_id.to_string(),
        }
    }

    fn key(&self, suffix: &str) -> String {
        format!("stream:{}:{}:{}", self.call_sid, self.turn_id, suffix)
    }

    pub fn index_key(&self, index: u32) -> String {
        self.key(&index.to_string())
    }

    pub fn pending_key(&self) -> String {
        self.key("pending")
    }

    pub fn done_key(&self) -> String {
        self.key("done")
    }

    pub fn hangup_key(&self) -> String {
        self.key("hangup")
    }

    pub async fn mark_pending(
        &self,
        cache: &dyn CacheStore,
        ttl: Duration,
    ) -> Result<(), AppError> {
        cache.put(&self.pending_key(), b"1".to_vec(), ttl).await
    }

    pub async fn mark_done(&self, cache: &dyn CacheStore, ttl: Duration) -> Result<(), AppError> {
        cache.put(&self.done_key(), b"1".to_vec(), ttl).await
    }

    pub async fn mark_hangup(
        &self,
        cache: &dyn CacheStore,
        index: u32,
        ttl: Duration,
    ) -> Result<(), AppError> {
        put_json(cache, &self.hangup_key(), &index, ttl).await
    }

    pub async fn record(
        &self,
        cache: &dyn CacheStore,
        index: u32,
        utterance: &Utterance,
        ttl: Duration,
    ) -> Result<(), AppError> {
        put_json(cache, &self.index_key(index), utterance, ttl).await
    }

    /// Read failures count as "not there yet".
    pub async fn fetch(&self, cache: &dyn CacheStore, index: u32) -> Option<Utterance> {
        get_json(cache, &self.index_key(index))
            .await
            .unwrap_or_else(|e| {
                warn!(key=%self.index_key(index), error=%e, "failed to read stream index");
                None
            })
    }

    pub async fn is_done(&self, cache: &dyn CacheStore) -> bool {
        matches!(cache.get(&self.done_key()).await, Ok(Some(_)))
    }

    pub async fn is_pending(&self, cache: &dyn CacheStore) -> bool {
        matches!(cache.get(&self.pending_key()).await, Ok(Some(_)))
    }

    pub async fn hangup_index(&self, cache: &dyn CacheStore) -> Option<u32> {
        get_json(cache, &self.hangup_key()).await.ok().flatten()
    }
}

pub struct StreamPipeline {
    cache: Arc<dyn CacheStore>,
    renderer: Arc<Renderer>,
    poll: PollConfig,
    ttl: TtlConfig,
}

impl StreamPipeline {
    pub fn new(
        cache: Arc<dyn CacheStore>,
        renderer: Arc<Renderer>,
        poll: PollConfig,
        ttl: TtlConfig,
    ) -> Self {
        Self {
            cache,
            renderer,
            poll,
            ttl,
        }
    }

    pub fn renderer(&self) -> &Renderer {
        &self.renderer
    }

    /// Turn a turn result into something the transport can send right now.  The returned cleanup,
    /// if any, must run only after the instruction has been sent.
    pub async fn respond(
        &self,
        ctx: &CallContext,
        voice: Option<&str>,
        result: TurnResult,
    ) -> (Instruction, Option<Cleanup>) {
        match result {
            TurnResult::NoInput { retry_phrase } => {
                let chunk = SpeechChunk::phrase(PhraseKind::Retry, retry_phrase);
                let utterance = self.renderer.render(&chunk, voice).await;
                (Instruction::listen(vec![utterance]), None)
            }
            TurnResult::Response { reply, cleanup } => {
                let instruction = self.render_reply(&reply, voice).await;
                (instruction, cleanup)
            }
            TurnResult::Stream {
                chunks,
                pre_filler,
                skip_fillers,
                cleanup_on_hangup,
            } => {
                self.deliver_stream(ctx, voice, chunks, pre_filler, skip_fillers, cleanup_on_hangup)
                    .await
            }
        }
    }

    pub async fn render_reply(&self, reply: &Reply, voice: Option<&str>) -> Instruction {
        let play = if reply.speech.trim().is_empty() {
            vec![]
        } else {
            vec![self.renderer.render_text(&reply.speech, voice).await]
        };
        if reply.hang_up {
            Instruction::hang_up(play, false)
        } else {
            Instruction::listen(play)
        }
    }

    pub async fn deliver_stream(
        &self,
        ctx: &CallContext,
        voice: Option<&str>,
        mut chunks: ChunkStream,
        pre_filler: Option<SpeechChunk>,
        skip_fillers: bool,
        cleanup_on_hangup: Cleanup,
    ) -> (Instruction, Option<Cleanup>) {
        let cursor = StreamCursor::new(&ctx.call_sid);

        if let Some(filler) = pre_filler {
            let utterance = self.renderer.render(&filler, voice).await;
            self.spawn_consume(cursor.clone(), chunks, skip_fillers, voice, 1);
            let next = NextStep::Continue {
                turn: cursor.turn_id,
                index: 0,
            };
            return (
                Instruction {
                    play: vec![utterance],
                    next,
                },
                None,
            );
        }

        let first = match chunks.next().await {
            Some(Ok(chunk)) => chunk,
            Some(Err(e)) => {
                warn!(call_sid=%ctx.call_sid, error=%e, "stream failed before its first chunk");
                chunks.stop();
                let utterance = self.renderer.render_text(APOLOGY_RETRY, voice).await;
                return (Instruction::listen(vec![utterance]), None);
            }
            None => {
                debug!(call_sid=%ctx.call_sid, "stream ended without speech");
                return (Instruction::listen(vec![]), None);
            }
        };

        let utterance = self.renderer.render(&first, voice).await;
        if first.hangup {
            chunks.stop();
            return (
                Instruction::hang_up(vec![utterance], false),
                Some(cleanup_on_hangup),
            );
        }
        if chunks.is_exhausted() {
            return (Instruction::listen(vec![utterance]), None);
        }

        if let Err(e) = cursor
            .record(&*self.cache, 1, &utterance, self.ttl.audio)
            .await
        {
            warn!(call_sid=%ctx.call_sid, error=%e, "failed to record first stream chunk");
        }
        self.spawn_consume(cursor.clone(), chunks, skip_fillers, voice, 2);
        let next = NextStep::Continue {
            turn: cursor.turn_id,
            index: 1,
        };
        (
            Instruction {
                play: vec![utterance],
                next,
            },
            None,
        )
    }

    fn spawn_consume(
        &self,
        cursor: StreamCursor,
        chunks: ChunkStream,
        skip_fillers: bool,
        voice: Option<&str>,
        first_index: u32,
    ) {
        let task = Consumer {
            cache: self.cache.clone(),
            renderer: self.renderer.clone(),
            ttl: self.ttl.audio,
            cursor,
            skip_fillers,
            voice: voice.map(str::to_string),
        };
        tokio::spawn(task.run(chunks, first_index));
    }

    /// Wait for the chunk after `played` to appear in the turn's namespace.
    pub async fn poll_continuation(
        &self,
        call_sid: &str,
        turn_id: &str,
        played: u32,
    ) -> Instruction {
        let Some(wanted) = played.checked_add(1) else {
            warn!(call_sid, turn_id, played, "continuation index out of range");
            return Instruction::listen(vec![]);
        };
        let cursor = StreamCursor::resume(call_sid, turn_id);
        let cache = &*self.cache;

        for attempt in 0..self.poll.max_attempts {
            if let Some(utterance) = cursor.fetch(cache, wanted).await {
                return self.found(&cursor, wanted, utterance).await;
            }
            if cursor.is_done(cache).await {
                // the final write may have landed between the two reads
                if let Some(utterance) = cursor.fetch(cache, wanted).await {
                    return self.found(&cursor, wanted, utterance).await;
                }
                debug!(call_sid, turn_id, wanted, "stream finished");
                break;
            }
            if attempt + 1 < self.poll.max_attempts {
                tokio::time::sleep(self.poll.interval).await;
            }
        }

        if cursor.hangup_index(cache).await.is_some() {
            return Instruction::hang_up(vec![], true);
        }
        if !cursor.is_done(cache).await {
            let pending = cursor.is_pending(cache).await;
            info!(call_sid, turn_id, wanted, pending, "gave up waiting for stream");
        }
        Instruction::listen(vec![])
    }

    async fn found(&self, cursor: &StreamCursor, index: u32, utterance: Utterance) -> Instruction {
        if cursor.hangup_index(&*self.cache).await == Some(index) {
            return Instruction::hang_up(vec![utterance], true);
        }
        Instruction {
            play: vec![utterance],
            next: NextStep::Continue {
                turn: cursor.turn_id.clone(),
                index,
            },
        }
    }
}

/// Background half of a streamed turn.
struct Consumer {
    cache: Arc<dyn CacheStore>,
    renderer: Arc<Renderer>,
    ttl: Duration,
    cursor: StreamCursor,
    skip_fillers: bool,
    voice: Option<String>,
}

impl Consumer {
    async fn run(self, mut chunks: ChunkStream, first_index: u32) {
        let call_sid = self.cursor.call_sid.clone();
        let turn_id = self.cursor.turn_id.clone();
        if let Err(e) = self.cursor.mark_pending(&*self.cache, self.ttl).await {
            warn!(call_sid=%call_sid, turn_id=%turn_id, error=%e, "failed to mark stream pending");
        }

        let outcome = AssertUnwindSafe(self.feed(&mut chunks, first_index))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(written)) => {
                debug!(call_sid=%call_sid, turn_id=%turn_id, written, "stream consumed")
            }
            Ok(Err(e)) => {
                warn!(call_sid=%call_sid, turn_id=%turn_id, error=%e, "stream production failed")
            }
            Err(_) => error!(call_sid=%call_sid, turn_id=%turn_id, "stream task panicked"),
        }
        chunks.stop();

        if let Err(e) = self.cursor.mark_done(&*self.cache, self.ttl).await {
            error!(call_sid=%call_sid, turn_id=%turn_id, error=%e, "failed to mark stream done");
        }
    }

    /// Render and record every remaining chunk.  Returns how many indices were written.
    async fn feed(&self, chunks: &mut ChunkStream, first_index: u32) -> Result<u32, AppError> {
        let cache = &*self.cache;
        let mut index = first_index;
        while let Some(item) = chunks.next().await {
            let chunk = item?;
            if self.skip_fillers && chunk.is_filler() {
                debug!(text=%chunk.text, "skipping filler after pre-filler");
                continue;
            }
            let utterance = self.renderer.render(&chunk, self.voice.as_deref()).await;
            if chunk.hangup {
                self.cursor.mark_hangup(cache, index, self.ttl).await?;
                self.cursor.record(cache, index, &utterance, self.ttl).await?;
                return Ok(index + 1 - first_index);
            }
            self.cursor.record(cache, index, &utterance, self.ttl).await?;
            index += 1;
        }
        Ok(index - first_index)
    }
}

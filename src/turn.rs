//! Per-turn decision: no input, a synchronous reply, or a streamed reply with an optional
//! pre-filler.  Nothing here knows about the telephony transport.

use crate::app::{pick, AppInfo, VoiceApp};
use crate::config::TurnConfig;
use crate::consts::DEFAULT_RETRY_PHRASES;
use crate::error::AppError;
use crate::looks_like_goodbye;
use crate::types::{CallContext, Cleanup, PhraseKind, SpeechChunk, TurnInput, TurnResult};

use rand::Rng;
use std::sync::Arc;
use tracing::debug;

/// Random phrase from the app's retry pool, or the platform pool when the app has none.
pub fn retry_phrase(info: &AppInfo) -> String {
    pick(&info.retries)
        .or_else(|| pick(DEFAULT_RETRY_PHRASES))
        .unwrap_or_default()
}

/// One coin flip with `probability`; never fires for an empty pool or a goodbye.
pub fn choose_pre_filler(
    fillers: &[String],
    input: &str,
    probability: f64,
) -> Option<SpeechChunk> {
    if fillers.is_empty() || !probability.is_finite() || looks_like_goodbye(input) {
        return None;
    }
    if !rand::rng().random_bool(probability.clamp(0.0, 1.0)) {
        return None;
    }
    pick(fillers).map(|text| SpeechChunk::phrase(PhraseKind::Filler, text))
}

pub async fn process_turn(
    app: Arc<dyn VoiceApp>,
    ctx: &CallContext,
    input: &TurnInput,
    config: TurnConfig,
) -> Result<TurnResult, AppError> {
    if input.is_blank() {
        return Ok(TurnResult::NoInput {
            retry_phrase: retry_phrase(app.info()),
        });
    }

    if config.streaming_enabled {
        if let Some(chunks) = app.stream_speech(ctx, input) {
            let pre_filler = choose_pre_filler(
                &app.info().fillers,
                &input.text,
                config.pre_filler_probability,
            );
            debug!(call_sid=%ctx.call_sid, pre_filler = pre_filler.is_some(), "streaming turn");
            return Ok(TurnResult::Stream {
                chunks,
                skip_fillers: pre_filler.is_some(),
                pre_filler,
                cleanup_on_hangup: Cleanup::new(app.clone(), ctx.clone()),
            });
        }
    }

    let reply = app.on_speech(ctx, input).await?;
    let cleanup = reply.hang_up.then(|| Cleanup::new(app.clone(), ctx.clone()));
    Ok(TurnResult::Response { reply, cleanup })
}

/// First turn of a call.  Always synchronous.
pub async fn start_call(
    app: Arc<dyn VoiceApp>,
    ctx: &CallContext,
) -> Result<TurnResult, AppError> {
    let reply = app.on_start(ctx).await?;
    let cleanup = reply.hang_up.then(|| Cleanup::new(app.clone(), ctx.clone()));
    Ok(TurnResult::Response { reply, cleanup })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChunkStream, Reply};
    use async_trait::async_trait;

    struct Echo {
        info: AppInfo,
        streams: bool,
    }

    #[async_trait]
    impl VoiceApp for Echo {
        fn info(&self) -> &AppInfo {
            &self.info
        }

        async fn on_start(&self, _ctx: &CallContext) -> Result<Reply, AppError> {
            Ok(Reply::hang_up("closed today"))
        }

        async fn on_speech(
            &self,
            _ctx: &CallContext,
            input: &TurnInput,
        ) -> Result<Reply, AppError> {
            if input.text == "bye" {
                Ok(Reply::hang_up("bye"))
            } else {
                Ok(Reply::listen(input.text.clone()))
            }
        }

        fn stream_speech(&self, _ctx: &CallContext, input: &TurnInput) -> Option<ChunkStream> {
            self.streams
                .then(|| ChunkStream::from_chunks(vec![SpeechChunk::fresh(input.text.clone())]))
        }
    }

    fn app(streams: bool, fillers: &[&str], retries: &[&str]) -> Arc<dyn VoiceApp> {
        Arc::new(Echo {
            info: AppInfo {
                id: "echo".to_string(),
                name: "Echo".to_string(),
                fillers: fillers.iter().map(|s| s.to_string()).collect(),
                retries: retries.iter().map(|s| s.to_string()).collect(),
                voice: None,
            },
            streams,
        })
    }

    fn ctx() -> CallContext {
        CallContext {
            call_sid: "CA1".to_string(),
            from: "+15550001".to_string(),
            to: "+15550002".to_string(),
            app_id: "echo".to_string(),
        }
    }

    fn always_filler() -> TurnConfig {
        TurnConfig {
            streaming_enabled: true,
            pre_filler_probability: 1.0,
        }
    }

    async fn run(app: Arc<dyn VoiceApp>, text: &str, config: TurnConfig) -> TurnResult {
        process_turn(app, &ctx(), &TurnInput::new(text), config)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn blank_input_is_no_input() {
        for text in ["", "   ", "\n\t"] {
            let echo = app(true, &["One sec."], &["Say again?"]);
            let TurnResult::NoInput { retry_phrase } = run(echo, text, always_filler()).await else {
                panic!("expected no-input for {text:?}");
            };
            assert_eq!(retry_phrase, "Say again?");
        }
    }

    #[tokio::test]
    async fn retry_phrase_falls_back_to_platform_pool() {
        let result = run(app(false, &[], &[]), " ", TurnConfig::default()).await;
        let TurnResult::NoInput { retry_phrase } = result else {
            panic!("expected no-input");
        };
        assert!(DEFAULT_RETRY_PHRASES.contains(&retry_phrase.as_str()));
    }

    #[tokio::test]
    async fn non_streaming_apps_never_stream() {
        for streaming_enabled in [true, false] {
            let config = TurnConfig {
                streaming_enabled,
                pre_filler_probability: 1.0,
            };
            let result = run(app(false, &["One sec."], &[]), "hello", config).await;
            let TurnResult::Response { reply, cleanup } = result else {
                panic!("expected a synchronous response");
            };
            assert_eq!(reply.speech, "hello");
            assert!(cleanup.is_none());
        }
    }

    #[tokio::test]
    async fn streaming_disabled_uses_on_speech() {
        let config = TurnConfig {
            streaming_enabled: false,
            pre_filler_probability: 1.0,
        };
        let result = run(app(true, &[], &[]), "hi", config).await;
        assert!(matches!(result, TurnResult::Response { .. }));
    }

    #[tokio::test]
    async fn certain_pre_filler_sets_skip_fillers() {
        let echo = app(true, &["One sec."], &[]);
        let result = run(echo, "what's the weather", always_filler()).await;
        let TurnResult::Stream {
            pre_filler,
            skip_fillers,
            ..
        } = result
        else {
            panic!("expected a stream");
        };
        assert_eq!(
            pre_filler,
            Some(SpeechChunk::phrase(PhraseKind::Filler, "One sec."))
        );
        assert!(skip_fillers);
    }

    #[tokio::test]
    async fn zero_probability_means_no_pre_filler() {
        let config = TurnConfig {
            streaming_enabled: true,
            pre_filler_probability: 0.0,
        };
        let result = run(app(true, &["One sec."], &[]), "hello", config).await;
        let TurnResult::Stream {
            pre_filler,
            skip_fillers,
            ..
        } = result
        else {
            panic!("expected a stream");
        };
        assert!(pre_filler.is_none());
        assert!(!skip_fillers);
    }

    #[test]
    fn goodbyes_and_empty_pools_suppress_the_filler() {
        let fillers = vec!["One sec.".to_string()];
        assert!(choose_pre_filler(&fillers, "Goodbye!", 1.0).is_none());
        assert!(choose_pre_filler(&[], "hello", 1.0).is_none());
        assert!(choose_pre_filler(&fillers, "hello", 1.0).is_some());
    }

    #[test]
    fn out_of_range_probabilities_never_panic() {
        let fillers = vec!["One sec.".to_string()];
        for probability in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            assert!(choose_pre_filler(&fillers, "hello", probability).is_none());
        }
        assert!(choose_pre_filler(&fillers, "hello", 7.0).is_some());
        assert!(choose_pre_filler(&fillers, "hello", -3.0).is_none());
    }

    #[tokio::test]
    async fn call_ending_replies_carry_cleanup() {
        let result = run(app(false, &[], &[]), "bye", TurnConfig::default()).await;
        let TurnResult::Response { reply, cleanup } = result else {
            panic!("expected a synchronous response");
        };
        assert!(reply.hang_up);
        assert!(cleanup.is_some());

        let start = start_call(app(false, &[], &[]), &ctx()).await.unwrap();
        assert!(matches!(
            start,
            TurnResult::Response {
                cleanup: Some(_),
                ..
            }
        ));
    }
}

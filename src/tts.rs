//! Speech synthesis and the cache-first renderer that sits in front of it.

use crate::cache::{keys, CacheStore};
use crate::config::TtlConfig;
use crate::error::AppError;
use crate::retry::{with_retry, DEFAULT_BACKOFF};
use crate::types::SpeechChunk;
use crate::utils::b64_decode_to_buf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};
use uuid::Uuid;

const GOOGLE_TTS_URL: &str = "https://texttospeech.googleapis.com/v1/text:synthesize";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// MP3 audio for `text` spoken in `voice`.
    async fn synthesize(&self, text: &str, voice: &str) -> Result<Vec<u8>, AppError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SynthesizeSpeechRequest<'a> {
    input: SynthesisInput<'a>,
    voice: VoiceSelectionParams<'a>,
    audio_config: AudioConfig,
}

#[derive(Serialize)]
struct SynthesisInput<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VoiceSelectionParams<'a> {
    language_code: &'a str,
    name: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AudioConfig {
    audio_encoding: &'static str,
    sample_rate_hertz: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SynthesizeSpeechResponse {
    audio_content: String,
}

/// Google Cloud Text-to-Speech over its REST endpoint.
pub struct GoogleTts {
    http_client: reqwest::Client,
    api_key: String,
    language_code: String,
}

impl GoogleTts {
    pub fn new(
        http_client: reqwest::Client,
        api_key: impl Into<String>,
        language_code: impl Into<String>,
    ) -> Self {
        Self {
            http_client,
            api_key: api_key.into(),
            language_code: language_code.into(),
        }
    }

    async fn request(&self, text: &str, voice: &str) -> Result<Vec<u8>, AppError> {
        let speech_request = SynthesizeSpeechRequest {
            input: SynthesisInput { text },
            voice: VoiceSelectionParams {
                language_code: &self.language_code,
                name: voice,
            },
            audio_config: AudioConfig {
                audio_encoding: "MP3",
                sample_rate_hertz: 8_000,
            },
        };
        let resp = self
            .http_client
            .post(GOOGLE_TTS_URL)
            .query(&[("key", self.api_key.as_str())])
            .timeout(REQUEST_TIMEOUT)
            .json(&speech_request)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            error!(status=%status, "google tts request rejected");
            return Err(AppError::Upstream {
                service: "google-tts",
                status: status.as_u16(),
            });
        }
        let body = resp.json::<SynthesizeSpeechResponse>().await?;
        let mut audio = Vec::new();
        b64_decode_to_buf(&body.audio_content, &mut audio)?;
        Ok(audio)
    }
}

#[async_trait]
impl SpeechSynthesizer for GoogleTts {
    async fn synthesize(&self, text: &str, voice: &str) -> Result<Vec<u8>, AppError> {
        with_retry("google-tts", DEFAULT_BACKOFF, AppError::is_transient, || {
            self.request(text, voice)
        })
        .await
    }
}

/// Used when no synthesis backend is configured: every phrase falls back to the telephony
/// provider's own voice.
pub struct ProviderVoiceOnly;

#[async_trait]
impl SpeechSynthesizer for ProviderVoiceOnly {
    async fn synthesize(&self, _text: &str, _voice: &str) -> Result<Vec<u8>, AppError> {
        Err(AppError::Tts("no synthesis backend configured".to_string()))
    }
}

/// Something the transport can play: cached audio, or text for the provider's builtin voice.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Utterance {
    Play {
        audio_id: String,
    },
    Say {
        text: String,
        /// The app's configured voice, if it named one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        voice: Option<String>,
    },
}

impl Utterance {
    pub fn say(text: impl Into<String>, voice: Option<&str>) -> Self {
        Utterance::Say {
            text: text.into(),
            voice: voice.map(str::to_string),
        }
    }
}

/// Turns speech chunks into playable utterances, caching audio on the way.
pub struct Renderer {
    synth: Arc<dyn SpeechSynthesizer>,
    cache: Arc<dyn CacheStore>,
    ttl: TtlConfig,
    default_voice: String,
}

impl Renderer {
    pub fn new(
        synth: Arc<dyn SpeechSynthesizer>,
        cache: Arc<dyn CacheStore>,
        ttl: TtlConfig,
        default_voice: impl Into<String>,
    ) -> Self {
        Self {
            synth,
            cache,
            ttl,
            default_voice: default_voice.into(),
        }
    }

    /// Stable-key chunks are looked up first and cached for the long phrase TTL; everything else
    /// is synthesized fresh under a random id with the short audio TTL.  Synthesis or cache
    /// failures never fail the turn: the chunk degrades to the provider's voice.
    pub async fn render(&self, chunk: &SpeechChunk, app_voice: Option<&str>) -> Utterance {
        let voice = app_voice.unwrap_or(self.default_voice.as_str());
        let (audio_id, ttl) = match &chunk.key {
            Some(key) => {
                let audio_id = key.audio_id(voice);
                match self.cache.get(&keys::audio(&audio_id)).await {
                    Ok(Some(_)) => {
                        debug!(audio_id=%audio_id, "phrase cache hit");
                        return Utterance::Play { audio_id };
                    }
                    Ok(None) => {}
                    Err(e) => warn!(error=%e, "phrase cache lookup failed"),
                }
                (audio_id, self.ttl.phrase)
            }
            None => (Uuid::new_v4().to_string(), self.ttl.audio),
        };

        let audio = match self.synth.synthesize(&chunk.text, voice).await {
            Ok(audio) => audio,
            Err(e) => {
                warn!(error=%e, "synthesis failed; using provider voice");
                return Utterance::say(chunk.text.as_str(), app_voice);
            }
        };
        if let Err(e) = self.cache.put(&keys::audio(&audio_id), audio, ttl).await {
            warn!(error=%e, "failed to cache audio; using provider voice");
            return Utterance::say(chunk.text.as_str(), app_voice);
        }
        Utterance::Play { audio_id }
    }

    pub async fn render_text(&self, text: &str, voice: Option<&str>) -> Utterance {
        self.render(&SpeechChunk::fresh(text), voice).await
    }
}

use crate::consts::{
    DEFAULT_AUDIO_TTL_SECS, DEFAULT_CONVERSATION_TTL_SECS, DEFAULT_PHRASE_TTL_SECS,
    DEFAULT_POLL_INTERVAL_MS, DEFAULT_POLL_MAX_ATTEMPTS, DEFAULT_PRE_FILLER_PROBABILITY,
};
use crate::error::AppError;

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Clone)]
pub struct Config {
    pub bind_addr: String,
    /// Base for absolute URLs handed to the telephony provider; derived from `Host` when unset.
    pub public_base_url: Option<String>,
    pub openai_api_key: String,
    pub openai_model: String,
    pub openai_base_url: String,
    pub google_tts_api_key: Option<String>,
    pub tts_voice: String,
    pub tts_language: String,
    pub database_url: Option<String>,
    pub apps_file: Option<PathBuf>,
    pub log_level: String,
    pub turn: TurnConfig,
    pub ttl: TtlConfig,
    pub poll: PollConfig,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TurnConfig {
    pub streaming_enabled: bool,
    pub pre_filler_probability: f64,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            streaming_enabled: true,
            pre_filler_probability: DEFAULT_PRE_FILLER_PROBABILITY,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TtlConfig {
    /// Conversation history, survey state and call info.
    pub conversation: Duration,
    /// Freshly generated audio and stream markers.
    pub audio: Duration,
    /// Audio for stable-key phrases shared across calls.
    pub phrase: Duration,
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            conversation: Duration::from_secs(DEFAULT_CONVERSATION_TTL_SECS),
            audio: Duration::from_secs(DEFAULT_AUDIO_TTL_SECS),
            phrase: Duration::from_secs(DEFAULT_PHRASE_TTL_SECS),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PollConfig {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            max_attempts: DEFAULT_POLL_MAX_ATTEMPTS,
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("bind_addr", &self.bind_addr)
            .field("public_base_url", &self.public_base_url)
            .field("openai_api_key", &"[REDACTED]")
            .field("openai_model", &self.openai_model)
            .field("openai_base_url", &self.openai_base_url)
            .field(
                "google_tts_api_key",
                &self.google_tts_api_key.as_ref().map(|_| "[REDACTED]"),
            )
            .field("tts_voice", &self.tts_voice)
            .field("tts_language", &self.tts_language)
            .field("database_url", &self.database_url.as_ref().map(|_| "[REDACTED]"))
            .field("apps_file", &self.apps_file)
            .field("log_level", &self.log_level)
            .field("turn", &self.turn)
            .field("ttl", &self.ttl)
            .field("poll", &self.poll)
            .finish()
    }
}

impl Config {
    /// Read configuration from the process environment.  Call `dotenvy::dotenv()` first if a
    /// `.env` file should be honoured.
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let openai_api_key = var("OPENAI_API_KEY")
            .ok_or_else(|| AppError::Config("OPENAI_API_KEY not set".to_string()))?;

        let pre_filler_probability: f64 = parse_or(
            "PRE_FILLER_PROBABILITY",
            var("PRE_FILLER_PROBABILITY"),
            DEFAULT_PRE_FILLER_PROBABILITY,
        )?;
        if !pre_filler_probability.is_finite() {
            return Err(AppError::Config(format!(
                "PRE_FILLER_PROBABILITY must be a finite number, got {pre_filler_probability}"
            )));
        }
        let turn = TurnConfig {
            streaming_enabled: parse_or("STREAMING_ENABLED", var("STREAMING_ENABLED"), true)?,
            pre_filler_probability: pre_filler_probability.clamp(0.0, 1.0),
        };
        let ttl = TtlConfig {
            conversation: Duration::from_secs(parse_or(
                "CONVERSATION_TTL_SECS",
                var("CONVERSATION_TTL_SECS"),
                DEFAULT_CONVERSATION_TTL_SECS,
            )?),
            audio: Duration::from_secs(parse_or(
                "AUDIO_TTL_SECS",
                var("AUDIO_TTL_SECS"),
                DEFAULT_AUDIO_TTL_SECS,
            )?),
            phrase: Duration::from_secs(parse_or(
                "PHRASE_TTL_SECS",
                var("PHRASE_TTL_SECS"),
                DEFAULT_PHRASE_TTL_SECS,
            )?),
        };
        let poll = PollConfig {
            interval: Duration::from_millis(parse_or(
                "POLL_INTERVAL_MS",
                var("POLL_INTERVAL_MS"),
                DEFAULT_POLL_INTERVAL_MS,
            )?),
            max_attempts: parse_or(
                "POLL_MAX_ATTEMPTS",
                var("POLL_MAX_ATTEMPTS"),
                DEFAULT_POLL_MAX_ATTEMPTS,
            )?,
        };

        Ok(Self {
            bind_addr: var("BIND_ADDR").unwrap_or_else(|| "0.0.0.0:3000".to_string()),
            public_base_url: var("PUBLIC_BASE_URL").map(|u| u.trim_end_matches('/').to_string()),
            openai_api_key,
            openai_model: var("OPENAI_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
            openai_base_url: var("OPENAI_BASE_URL")
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            google_tts_api_key: var("GOOGLE_TTS_API_KEY"),
            tts_voice: var("TTS_VOICE").unwrap_or_else(|| "en-US-Standard-E".to_string()),
            tts_language: var("TTS_LANGUAGE").unwrap_or_else(|| "en-US".to_string()),
            database_url: var("DATABASE_URL"),
            apps_file: var("APPS_FILE").map(PathBuf::from),
            log_level: var("LOG_LEVEL").unwrap_or_else(|| "debug".to_string()),
            turn,
            ttl,
            poll,
        })
    }
}

fn parse_or<T: FromStr>(key: &str, raw: Option<String>, default: T) -> Result<T, AppError> {
    match raw {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| AppError::Config(format!("{key} has an invalid value: {raw:?}"))),
        None => Ok(default),
    }
}

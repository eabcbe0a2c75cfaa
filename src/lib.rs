pub mod app;
pub mod cache;
pub mod config;
pub mod conversation;
pub mod db_types;
pub mod error;
pub mod handlers;
pub mod llm;
pub mod openai;
pub mod openai_types;
pub mod pipeline;
pub mod registry;
pub mod retry;
pub mod store;
pub mod survey;
pub mod tools;
pub mod tts;
pub mod turn;
pub mod twilio_types;
pub mod types;
pub mod utils;

pub mod consts {
    pub const DEFAULT_RETRY_PHRASES: &[&str] = &[
        "Sorry, I didn't catch that. Could you say it again?",
        "I'm sorry, I didn't hear anything. Could you repeat that?",
        "Are you still there? Go ahead whenever you're ready.",
    ];
    /// Cheap lexical goodbye check shared by the turn engine and the conversational app.
    /// Single words must match the whole utterance; phrases may appear anywhere in it.
    pub const GOODBYE_WORDS: &[&str] = &["bye", "goodbye", "no", "nope", "done", "that's it"];
    pub const GOODBYE_PHRASES: &[&str] = &[
        "goodbye",
        "bye bye",
        "bye now",
        "hang up",
        "that's all",
        "that is all",
        "i'm done",
        "i am done",
        "talk to you later",
        "have a good one",
        "no thanks",
        "no thank you",
    ];
    pub const DEFAULT_GOODBYES: &[&str] = &["Goodbye!", "Thanks for calling. Goodbye!"];
    pub const APOLOGY_RETRY: &str =
        "Sorry, I'm having a little trouble right now. Could you say that again?";
    pub const APOLOGY_HANGUP: &str =
        "Sorry, something went wrong on our end. Please try calling again later. Goodbye.";
    pub const TOOL_FILLER: &str = "One moment while I look that up.";

    pub const SURVEY_QUESTION_RETRY_CAP: u32 = 3;
    pub const SURVEY_CALL_FAILURE_CAP: u32 = 5;

    pub const DEFAULT_PRE_FILLER_PROBABILITY: f64 = 0.35;
    pub const DEFAULT_POLL_INTERVAL_MS: u64 = 250;
    pub const DEFAULT_POLL_MAX_ATTEMPTS: u32 = 32;
    pub const DEFAULT_CONVERSATION_TTL_SECS: u64 = 3_600;
    pub const DEFAULT_AUDIO_TTL_SECS: u64 = 600;
    pub const DEFAULT_PHRASE_TTL_SECS: u64 = 7 * 24 * 3_600;

    pub const MAX_HISTORY_MESSAGES: usize = 40;
    pub const MAX_TOOL_ROUNDS: usize = 4;
    pub const ASCII_SENTENCE_ENDINGS: &[char] = &['.', '!', '?'];
}

/// Whether an utterance reads as the caller trying to end the call.
pub fn looks_like_goodbye(text: &str) -> bool {
    let normalized: String = text
        .to_lowercase()
        .chars()
        .map(|c| if c == '\u{2019}' { '\'' } else { c })
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || *c == '\'')
        .collect();
    let normalized = normalized.split_whitespace().collect::<Vec<_>>().join(" ");
    if normalized.is_empty() {
        return false;
    }
    consts::GOODBYE_WORDS.contains(&normalized.as_str())
        || consts::GOODBYE_PHRASES
            .iter()
            .any(|phrase| normalized.contains(phrase))
}

#[cfg(test)]
mod tests {
    use super::looks_like_goodbye;

    #[test]
    fn goodbye_detection() {
        assert!(looks_like_goodbye("Goodbye!"));
        assert!(looks_like_goodbye("ok bye bye"));
        assert!(looks_like_goodbye("No thanks, that's all."));
        assert!(looks_like_goodbye("Nope"));
        assert!(looks_like_goodbye("I’m done"));
        assert!(!looks_like_goodbye("No, I meant Tuesday"));
        assert!(!looks_like_goodbye("maybe"));
        assert!(!looks_like_goodbye("   "));
    }
}

//! Scripted survey: a fixed list of typed questions asked in order, with answer parsing and a
//! retry/bail policy.  The state machine itself is pure (`SurveyState::apply`); `SurveyApp`
//! wraps it with cache persistence and the end-of-survey summary.

use crate::app::{AppBase, AppDeps, AppInfo, VoiceApp};
use crate::cache::{get_json, keys, put_json};
use crate::consts::{SURVEY_CALL_FAILURE_CAP, SURVEY_QUESTION_RETRY_CAP};
use crate::error::AppError;
use crate::llm::{ChatMessage, ChatRequest};
use crate::types::{CallContext, Reply, TurnInput};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

static YES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(yes|yeah|yep|sure|absolutely|definitely|of course)\b").unwrap());
static NO: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(no|nope|nah|not really|negative)\b").unwrap());
static SCALE_DIGIT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b([1-5])\b").unwrap());
static SCALE_WORD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(one|two|three|four|five)\b").unwrap());

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QuestionKind {
    YesNo,
    Scale,
    Open,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Question {
    pub label: String,
    pub text: String,
    pub kind: QuestionKind,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum AnswerValue {
    Bool(bool),
    Scale(u8),
    Text(String),
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SurveyAnswer {
    pub label: String,
    pub question: String,
    pub kind: QuestionKind,
    pub raw: String,
    pub value: AnswerValue,
}

/// Progress through a survey for one call.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct SurveyState {
    pub index: usize,
    pub answers: Vec<SurveyAnswer>,
    /// Consecutive parse failures on the current question.
    pub retries_for_question: u32,
    /// Parse failures across the whole call.
    pub total_failures: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Transition {
    /// Same question again, rephrased.
    Reprompt(String),
    /// Acknowledgement plus the next question.
    Advance(String),
    Completed,
    Bailed,
}

pub fn parse_yes_no(raw: &str) -> Option<bool> {
    let text = raw.to_lowercase();
    let yes = YES.find(&text).map(|m| m.start());
    let no = NO.find(&text).map(|m| m.start());
    match (yes, no) {
        (Some(y), Some(n)) => Some(y < n),
        (Some(_), None) => Some(true),
        (None, Some(_)) => Some(false),
        (None, None) => None,
    }
}

pub fn parse_scale(raw: &str) -> Option<u8> {
    let text = raw.to_lowercase();
    if let Some(caps) = SCALE_DIGIT.captures(&text) {
        return caps[1].parse().ok();
    }
    SCALE_WORD.captures(&text).map(|caps| match &caps[1] {
        "one" => 1,
        "two" => 2,
        "three" => 3,
        "four" => 4,
        _ => 5,
    })
}

pub fn parse_answer(kind: QuestionKind, raw: &str) -> Option<AnswerValue> {
    match kind {
        QuestionKind::YesNo => parse_yes_no(raw).map(AnswerValue::Bool),
        QuestionKind::Scale => parse_scale(raw).map(AnswerValue::Scale),
        QuestionKind::Open => Some(AnswerValue::Text(raw.to_string())),
    }
}

fn acknowledgement(value: &AnswerValue) -> String {
    match value {
        AnswerValue::Bool(true) => "Got it, yes.".to_string(),
        AnswerValue::Bool(false) => "Got it, no.".to_string(),
        AnswerValue::Scale(n) => format!("{n} out of 5, got it."),
        AnswerValue::Text(_) => "Thank you.".to_string(),
    }
}

/// Rephrased question after `attempt` consecutive failures.  There are exactly two tiers; a
/// third failure bails instead.
fn retry_prompt(question: &Question, attempt: u32) -> String {
    let q = &question.text;
    match (attempt, question.kind) {
        (1, QuestionKind::YesNo) => {
            format!("Sorry, I didn't catch that. Please answer yes or no. {q}")
        }
        (1, QuestionKind::Scale) => format!(
            "Sorry, I need a number from 1 to 5, where 1 is the lowest and 5 is the highest. {q}"
        ),
        (1, QuestionKind::Open) => format!("Sorry, I didn't catch that. {q}"),
        (_, QuestionKind::YesNo) => format!("Let's try one last time. {q} Just say yes or no."),
        (_, QuestionKind::Scale) => {
            format!("Let's try one last time. {q} Just say a number from 1 to 5.")
        }
        (_, QuestionKind::Open) => format!("Let's try one last time. {q}"),
    }
}

impl SurveyState {
    pub fn is_finished(&self, questions: &[Question]) -> bool {
        self.index >= questions.len()
    }

    pub fn apply(&mut self, questions: &[Question], raw: &str) -> Transition {
        let Some(question) = questions.get(self.index) else {
            return Transition::Completed;
        };
        match parse_answer(question.kind, raw) {
            None => {
                self.retries_for_question += 1;
                self.total_failures += 1;
                if self.retries_for_question >= SURVEY_QUESTION_RETRY_CAP
                    || self.total_failures >= SURVEY_CALL_FAILURE_CAP
                {
                    Transition::Bailed
                } else {
                    Transition::Reprompt(retry_prompt(question, self.retries_for_question))
                }
            }
            Some(value) => {
                let ack = acknowledgement(&value);
                self.answers.push(SurveyAnswer {
                    label: question.label.clone(),
                    question: question.text.clone(),
                    kind: question.kind,
                    raw: raw.to_string(),
                    value,
                });
                self.retries_for_question = 0;
                self.index += 1;
                match questions.get(self.index) {
                    Some(next) => Transition::Advance(format!("{ack} {}", next.text)),
                    None => Transition::Completed,
                }
            }
        }
    }
}

fn default_closing() -> String {
    "That's everything. Thanks so much for your time. Goodbye!".to_string()
}

fn default_bail_message() -> String {
    "I'm sorry, I'm having trouble understanding. We'll try again another time. Goodbye."
        .to_string()
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SurveyConfig {
    pub intro: String,
    pub questions: Vec<Question>,
    #[serde(default = "default_closing")]
    pub closing: String,
    #[serde(default = "default_bail_message")]
    pub bail_message: String,
}

pub struct SurveyApp {
    base: AppBase,
    config: Arc<SurveyConfig>,
}

impl SurveyApp {
    pub fn new(info: AppInfo, config: SurveyConfig, deps: AppDeps) -> Self {
        Self {
            base: AppBase::new(info, deps),
            config: Arc::new(config),
        }
    }

    async fn load_state(&self, ctx: &CallContext) -> SurveyState {
        match get_json(&*self.base.deps.cache, &keys::survey(&ctx.call_sid)).await {
            Ok(Some(state)) => state,
            Ok(None) => {
                warn!(call_sid=%ctx.call_sid, "no survey state; starting from the first question");
                SurveyState::default()
            }
            Err(e) => {
                warn!(call_sid=%ctx.call_sid, error=%e, "unreadable survey state; starting over");
                SurveyState::default()
            }
        }
    }

    async fn save_state(&self, ctx: &CallContext, state: &SurveyState) -> Result<(), AppError> {
        put_json(
            &*self.base.deps.cache,
            &keys::survey(&ctx.call_sid),
            state,
            self.base.deps.ttl.conversation,
        )
        .await
    }

    /// Summarize and persist in the background; neither step may hold up the closing line.
    fn finalize(&self, ctx: &CallContext, answers: Vec<SurveyAnswer>) {
        let deps = self.base.deps.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let summary = match summarize(&deps, &answers).await {
                Ok(summary) => Some(summary),
                Err(e) => {
                    warn!(call_sid=%ctx.call_sid, error=%e, "survey summary failed");
                    None
                }
            };
            if let Err(e) = deps
                .store
                .record_survey_result(&ctx, &answers, summary.as_deref())
                .await
            {
                warn!(call_sid=%ctx.call_sid, error=%e, "failed to record survey result");
            }
        });
    }
}

async fn summarize(deps: &AppDeps, answers: &[SurveyAnswer]) -> Result<String, AppError> {
    let transcript = answers
        .iter()
        .map(|a| format!("Q: {}\nA: {}", a.question, a.raw))
        .collect::<Vec<String>>()
        .join("\n\n");
    let req = ChatRequest {
        system_prompt: "You summarize phone survey responses for the team that ran the survey."
            .to_string(),
        messages: vec![ChatMessage::user(format!(
            "In one or two sentences, summarize these answers:\n\n{transcript}"
        ))],
        max_tokens: Some(120),
        ..Default::default()
    };
    let turn = deps.llm.chat(&req).await?;
    turn.content
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or(AppError::Internal("empty survey summary"))
}

#[async_trait]
impl VoiceApp for SurveyApp {
    fn info(&self) -> &AppInfo {
        &self.base.info
    }

    async fn on_start(&self, ctx: &CallContext) -> Result<Reply, AppError> {
        self.base.log_start(ctx);
        let Some(first) = self.config.questions.first() else {
            return Ok(Reply::hang_up(self.config.closing.clone()));
        };
        self.save_state(ctx, &SurveyState::default()).await?;
        let speech = format!("{} {}", self.config.intro, first.text);
        self.base.record_turn(ctx, "app", &speech);
        Ok(Reply::listen(speech))
    }

    async fn on_speech(&self, ctx: &CallContext, input: &TurnInput) -> Result<Reply, AppError> {
        let mut state = self.load_state(ctx).await;
        self.base.record_turn(ctx, "caller", &input.text);
        let transition = state.apply(&self.config.questions, &input.text);
        debug!(
            call_sid=%ctx.call_sid,
            index = state.index,
            retries = state.retries_for_question,
            failures = state.total_failures,
            transition = ?transition,
            "survey step"
        );
        let reply = match transition {
            Transition::Reprompt(prompt) | Transition::Advance(prompt) => {
                self.save_state(ctx, &state).await?;
                Reply::listen(prompt)
            }
            Transition::Completed => {
                info!(call_sid=%ctx.call_sid, answers = state.answers.len(), "survey completed");
                self.save_state(ctx, &state).await?;
                self.finalize(ctx, state.answers);
                Reply::hang_up(self.config.closing.clone())
            }
            Transition::Bailed => {
                info!(
                    call_sid=%ctx.call_sid,
                    index = state.index,
                    failures = state.total_failures,
                    "survey bailed"
                );
                self.save_state(ctx, &state).await?;
                Reply::hang_up(self.config.bail_message.clone())
            }
        };
        self.base.record_turn(ctx, "app", &reply.speech);
        Ok(reply)
    }

    async fn on_end(&self, ctx: &CallContext) -> Result<(), AppError> {
        self.base.cleanup(ctx).await
    }
}

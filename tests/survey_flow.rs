mod common;

use common::{call, harness, say, text_turn, ScriptedModel};
use voiceapps_rs::app::VoiceApp;
use voiceapps_rs::cache::{get_json, keys};
use voiceapps_rs::config::TurnConfig;
use voiceapps_rs::pipeline::{Instruction, NextStep};
use voiceapps_rs::registry::{AppDefinition, AppRegistry};
use voiceapps_rs::survey::{AnswerValue, SurveyState};
use voiceapps_rs::turn::{process_turn, start_call};
use voiceapps_rs::types::{TurnInput, TurnResult};

const SURVEY: &str = r#"[{
    "id": "checkup",
    "name": "Post-visit checkup",
    "kind": "survey",
    "default": true,
    "retries": ["Sorry, are you still there?"],
    "intro": "Thanks for visiting us today.",
    "questions": [
        {"label": "resolved", "text": "Was your issue resolved?", "kind": "yes_no"},
        {"label": "rating", "text": "On a scale of 1 to 5, how was the visit?", "kind": "scale"},
        {"label": "comments", "text": "Anything else you'd like to share?", "kind": "open"}
    ],
    "closing": "Thanks, that's all. Goodbye!"
}]"#;

fn survey_app(h: &common::Harness) -> std::sync::Arc<dyn VoiceApp> {
    let defs: Vec<AppDefinition> = serde_json::from_str(SURVEY).unwrap();
    let registry = AppRegistry::load(&defs, &h.deps).unwrap();
    registry.resolve("+15550002222").unwrap()
}

fn sync_turns() -> TurnConfig {
    TurnConfig {
        streaming_enabled: true,
        pre_filler_probability: 1.0,
    }
}

async fn answer(
    h: &common::Harness,
    app: &std::sync::Arc<dyn VoiceApp>,
    text: &str,
) -> (Instruction, bool) {
    let ctx = call("CA-survey", "checkup");
    let result = process_turn(app.clone(), &ctx, &TurnInput::new(text), sync_turns())
        .await
        .unwrap();
    let (instruction, cleanup) = h.pipeline.respond(&ctx, None, result).await;
    let ended = cleanup.is_some();
    if let Some(cleanup) = cleanup {
        cleanup.run().await;
    }
    (instruction, ended)
}

#[tokio::test]
async fn completes_and_records_a_summary() {
    let llm = ScriptedModel::new(vec![text_turn("Issue resolved, rated the visit 4 of 5.")]);
    let h = harness(llm.clone());
    let app = survey_app(&h);
    let ctx = call("CA-survey", "checkup");

    let start = start_call(app.clone(), &ctx).await.unwrap();
    let (instruction, _) = h.pipeline.respond(&ctx, None, start).await;
    assert_eq!(
        instruction,
        Instruction::listen(vec![say("Thanks for visiting us today. Was your issue resolved?")])
    );

    let (instruction, _) = answer(&h, &app, "yeah it was").await;
    assert_eq!(
        instruction.play,
        vec![say("Got it, yes. On a scale of 1 to 5, how was the visit?")]
    );

    let (instruction, _) = answer(&h, &app, "I'd say a 4").await;
    assert_eq!(
        instruction.play,
        vec![say("4 out of 5, got it. Anything else you'd like to share?")]
    );

    let (instruction, ended) = answer(&h, &app, "The parking was hard to find").await;
    assert!(ended);
    assert_eq!(
        instruction,
        Instruction::hang_up(vec![say("Thanks, that's all. Goodbye!")], false)
    );

    let recorded = h.store.wait_for_survey().await;
    assert_eq!(recorded.call_sid, "CA-survey");
    assert_eq!(
        recorded.summary.as_deref(),
        Some("Issue resolved, rated the visit 4 of 5.")
    );
    let values: Vec<AnswerValue> = recorded.answers.iter().map(|a| a.value.clone()).collect();
    assert_eq!(
        values,
        vec![
            AnswerValue::Bool(true),
            AnswerValue::Scale(4),
            AnswerValue::Text("The parking was hard to find".to_string()),
        ]
    );
    assert_eq!(llm.request_count(), 1);

    // on_end ran after the closing line and dropped the per-call state
    let state: Option<SurveyState> =
        get_json(&*h.cache, &keys::survey("CA-survey")).await.unwrap();
    assert!(state.is_none());
}

#[tokio::test]
async fn summary_failure_does_not_block_completion() {
    let h = harness(ScriptedModel::new(vec![]));
    let app = survey_app(&h);
    let ctx = call("CA-survey", "checkup");
    start_call(app.clone(), &ctx).await.unwrap();

    answer(&h, &app, "no").await;
    answer(&h, &app, "two").await;
    let (instruction, ended) = answer(&h, &app, "nothing else").await;
    assert!(ended);
    assert_eq!(instruction.next, NextStep::HangUp { pause: false });

    let recorded = h.store.wait_for_survey().await;
    assert!(recorded.summary.is_none());
    assert_eq!(recorded.answers[0].value, AnswerValue::Bool(false));
}

#[tokio::test]
async fn three_misses_on_one_question_bail() {
    let h = harness(ScriptedModel::new(vec![]));
    let app = survey_app(&h);
    let ctx = call("CA-survey", "checkup");
    start_call(app.clone(), &ctx).await.unwrap();

    let (first, _) = answer(&h, &app, "maybe").await;
    assert_eq!(
        first.play,
        vec![say("Sorry, I didn't catch that. Please answer yes or no. Was your issue resolved?")]
    );
    let state: SurveyState = get_json(&*h.cache, &keys::survey("CA-survey"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.retries_for_question, 1);
    assert_eq!(state.total_failures, 1);

    let (second, _) = answer(&h, &app, "hard to say").await;
    assert_eq!(
        second.play,
        vec![say("Let's try one last time. Was your issue resolved? Just say yes or no.")]
    );

    let (last, ended) = answer(&h, &app, "who knows").await;
    assert!(ended);
    assert_eq!(last.next, NextStep::HangUp { pause: false });
    let Some(voiceapps_rs::tts::Utterance::Say { text, .. }) = last.play.first() else {
        panic!("expected spoken apology");
    };
    assert!(text.starts_with("I'm sorry"));
    assert!(h.store.surveys.lock().unwrap().is_empty());
}

#[tokio::test]
async fn silence_reprompts_without_touching_the_survey() {
    let h = harness(ScriptedModel::new(vec![]));
    let app = survey_app(&h);
    let ctx = call("CA-survey", "checkup");
    start_call(app.clone(), &ctx).await.unwrap();

    let result = process_turn(app.clone(), &ctx, &TurnInput::new("  "), sync_turns())
        .await
        .unwrap();
    let TurnResult::NoInput { retry_phrase } = result else {
        panic!("expected no-input");
    };
    assert_eq!(retry_phrase, "Sorry, are you still there?");

    let state: SurveyState = get_json(&*h.cache, &keys::survey("CA-survey"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state, SurveyState::default());
}

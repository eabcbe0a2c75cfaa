use crate::app::VoiceApp;
use crate::cache::{get_json, keys, put_json};
use crate::consts::APOLOGY_HANGUP;
use crate::error::AppError;
use crate::pipeline::{Instruction, NextStep};
use crate::tts::Utterance;
use crate::turn::{process_turn, start_call};
use crate::twilio_types::{render_instruction, VoiceWebhook};
use crate::types::{AppState, CallContext, Cleanup, TurnInput, TurnResult};
use crate::utils::base_url;

use axum::{
    extract::{Host, Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

type TwimlResponse = (StatusCode, HeaderMap, String);

/// Rendered TwiML plus the end-of-call work to start once it is handed back.
type Delivery = (String, Option<Cleanup>);

fn content_type(value: &'static str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(value));
    headers
}

fn twiml(twiml: String) -> TwimlResponse {
    trace!("twiml: '{}'", twiml);
    (StatusCode::OK, content_type("application/xml"), twiml)
}

fn bad_request(e: AppError) -> TwimlResponse {
    error!(error=%e, "failed to deserialize Twilio webhook payload");
    (StatusCode::BAD_REQUEST, HeaderMap::new(), "Bad request".to_string())
}

/// Anything that escapes a turn ends the call politely instead of leaving the caller in silence.
fn twiml_or_apology(result: Result<Delivery, AppError>, base: &str) -> TwimlResponse {
    match result {
        Ok((body, cleanup)) => {
            let response = twiml(body);
            // the reply is fully rendered; on_end runs detached and never delays or alters it
            if let Some(cleanup) = cleanup {
                cleanup.spawn();
            }
            response
        }
        Err(e) => {
            error!(error=%e, "turn failed; apologizing and hanging up");
            let apology = Instruction::hang_up(vec![Utterance::say(APOLOGY_HANGUP, None)], false);
            twiml(render_instruction(&apology, base))
        }
    }
}

fn parse_webhook(body: &str) -> Result<VoiceWebhook, AppError> {
    Ok(serde_urlencoded::from_str::<VoiceWebhook>(body)?)
}

/// Route a call that has no pinned app yet, and pin it.
async fn assign_call(
    state: &AppState,
    hook: &VoiceWebhook,
) -> Result<(Arc<dyn VoiceApp>, CallContext), AppError> {
    let app = state
        .registry
        .resolve(&hook.to)
        .ok_or(AppError::Internal("no app serves this number"))?;
    let ctx = CallContext {
        call_sid: hook.call_sid.clone(),
        from: hook.from.clone(),
        to: hook.to.clone(),
        app_id: app.info().id.clone(),
    };
    put_json(
        &*state.cache,
        &keys::call(&ctx.call_sid),
        &ctx,
        state.config.ttl.conversation,
    )
    .await?;
    info!(call_sid=%ctx.call_sid, app=%ctx.app_id, to=%ctx.to, "call assigned");
    Ok((app, ctx))
}

/// The app a call was pinned to on its first webhook.  Falls back to routing by number when the
/// pin has expired or the app has since been removed.
async fn call_for(
    state: &AppState,
    hook: &VoiceWebhook,
) -> Result<(Arc<dyn VoiceApp>, CallContext), AppError> {
    let key = keys::call(&hook.call_sid);
    match get_json::<CallContext>(&*state.cache, &key).await {
        Ok(Some(ctx)) => match state.registry.get(&ctx.app_id) {
            Some(app) => {
                // every turn pushes the expiry out again
                put_json(&*state.cache, &key, &ctx, state.config.ttl.conversation).await?;
                return Ok((app, ctx));
            }
            None => warn!(call_sid=%ctx.call_sid, app=%ctx.app_id, "pinned app is gone; rerouting"),
        },
        Ok(None) => debug!(call_sid=%hook.call_sid, "no pinned app; routing by number"),
        Err(e) => warn!(call_sid=%hook.call_sid, error=%e, "unreadable call record; rerouting"),
    }
    assign_call(state, hook).await
}

async fn deliver(
    state: &AppState,
    app: &Arc<dyn VoiceApp>,
    ctx: &CallContext,
    base: &str,
    result: TurnResult,
) -> Delivery {
    let (instruction, cleanup) = state
        .pipeline
        .respond(ctx, app.info().voice.as_deref(), result)
        .await;
    (render_instruction(&instruction, base), cleanup)
}

pub async fn inbound_handler(
    Host(host): Host,
    State(state): State<Arc<AppState>>,
    body: String,
) -> TwimlResponse {
    trace!(body=%body, "inbound request body");
    let hook = match parse_webhook(&body) {
        Ok(hook) => hook,
        Err(e) => return bad_request(e),
    };
    let base = base_url(state.config.public_base_url.as_deref(), &host);
    twiml_or_apology(inbound(&state, &hook, &base).await, &base)
}

async fn inbound(
    state: &AppState,
    hook: &VoiceWebhook,
    base: &str,
) -> Result<Delivery, AppError> {
    let (app, ctx) = assign_call(state, hook).await?;
    let store = state.store.clone();
    let record = ctx.clone();
    tokio::spawn(async move {
        if let Err(e) = store.record_call_start(&record).await {
            warn!(call_sid=%record.call_sid, error=%e, "failed to record call start");
        }
    });
    let result = start_call(app.clone(), &ctx).await?;
    Ok(deliver(state, &app, &ctx, base, result).await)
}

pub async fn speech_handler(
    Host(host): Host,
    State(state): State<Arc<AppState>>,
    body: String,
) -> TwimlResponse {
    trace!(body=%body, "speech request body");
    let hook = match parse_webhook(&body) {
        Ok(hook) => hook,
        Err(e) => return bad_request(e),
    };
    let base = base_url(state.config.public_base_url.as_deref(), &host);
    twiml_or_apology(speech(&state, hook, &base).await, &base)
}

async fn speech(
    state: &AppState,
    hook: VoiceWebhook,
    base: &str,
) -> Result<Delivery, AppError> {
    let (app, ctx) = call_for(state, &hook).await?;
    let input = TurnInput {
        text: hook.speech_result.unwrap_or_default(),
        confidence: hook.confidence,
        language: hook.language,
    };
    debug!(call_sid=%ctx.call_sid, text=%input.text, confidence=?input.confidence, "caller said");
    let result = process_turn(app.clone(), &ctx, &input, state.config.turn).await?;
    Ok(deliver(state, &app, &ctx, base, result).await)
}

pub async fn continue_handler(
    Host(host): Host,
    Path((turn, played)): Path<(String, u32)>,
    State(state): State<Arc<AppState>>,
    body: String,
) -> TwimlResponse {
    let hook = match parse_webhook(&body) {
        Ok(hook) => hook,
        Err(e) => return bad_request(e),
    };
    let base = base_url(state.config.public_base_url.as_deref(), &host);
    let instruction = state
        .pipeline
        .poll_continuation(&hook.call_sid, &turn, played)
        .await;
    debug!(call_sid=%hook.call_sid, turn=%turn, played, next=?instruction.next, "continuation");
    let response = twiml(render_instruction(&instruction, &base));
    if let NextStep::HangUp { .. } = instruction.next {
        match call_for(&state, &hook).await {
            Ok((app, ctx)) => Cleanup::new(app, ctx).spawn(),
            Err(e) => warn!(call_sid=%hook.call_sid, error=%e, "no app to clean up after hangup"),
        }
    }
    response
}

/// Call progress callback.  A final status runs the app's end-of-call cleanup whether or not a
/// hangup instruction already did.
pub async fn status_handler(State(state): State<Arc<AppState>>, body: String) -> StatusCode {
    let hook = match parse_webhook(&body) {
        Ok(hook) => hook,
        Err(e) => {
            error!(error=%e, "failed to deserialize Twilio status payload");
            return StatusCode::BAD_REQUEST;
        }
    };
    let Some(status) = hook.call_status else {
        return StatusCode::NO_CONTENT;
    };
    debug!(call_sid=%hook.call_sid, status=?status, "call status");
    if !status.is_final() {
        return StatusCode::NO_CONTENT;
    }

    let key = keys::call(&hook.call_sid);
    if let Ok(Some(ctx)) = get_json::<CallContext>(&*state.cache, &key).await {
        if let Some(app) = state.registry.get(&ctx.app_id) {
            Cleanup::new(app, ctx).spawn();
        }
    }
    if let Err(e) = state.cache.delete(&key).await {
        warn!(call_sid=%hook.call_sid, error=%e, "failed to forget call");
    }
    let store = state.store.clone();
    tokio::spawn(async move {
        if let Err(e) = store.record_call_end(&hook.call_sid).await {
            warn!(call_sid=%hook.call_sid, error=%e, "failed to record call end");
        }
    });
    StatusCode::NO_CONTENT
}

/// Serves synthesized audio to the telephony provider's `<Play>` fetches.
pub async fn audio_handler(
    Path(audio_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> (StatusCode, HeaderMap, Vec<u8>) {
    match state.cache.get(&keys::audio(&audio_id)).await {
        Ok(Some(bytes)) => (StatusCode::OK, content_type("audio/mpeg"), bytes),
        Ok(None) => {
            warn!(audio_id=%audio_id, "audio not found or expired");
            (StatusCode::NOT_FOUND, HeaderMap::new(), vec![])
        }
        Err(e) => {
            error!(audio_id=%audio_id, error=%e, "failed to read audio");
            (StatusCode::INTERNAL_SERVER_ERROR, HeaderMap::new(), vec![])
        }
    }
}

pub async fn health_handler() -> &'static str {
    "OK"
}

//! Call, transcript and survey persistence.  Nothing here is on the caller-facing path: apps
//! spawn these writes and only log failures.

use crate::db_types::{Call, SurveyResult, Turn};
use crate::error::AppError;
use crate::survey::SurveyAnswer;
use crate::types::CallContext;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};
use tracing::{debug, error, info, warn};

#[async_trait]
pub trait CallStore: Send + Sync {
    async fn record_call_start(&self, ctx: &CallContext) -> Result<(), AppError>;

    async fn record_turn(&self, call_sid: &str, speaker: &str, text: &str) -> Result<(), AppError>;

    async fn record_survey_result(
        &self,
        ctx: &CallContext,
        answers: &[SurveyAnswer],
        summary: Option<&str>,
    ) -> Result<(), AppError>;

    async fn record_call_end(&self, call_sid: &str) -> Result<(), AppError>;
}

/// Used when no database is configured.
pub struct NullStore;

#[async_trait]
impl CallStore for NullStore {
    async fn record_call_start(&self, ctx: &CallContext) -> Result<(), AppError> {
        debug!(call_sid=%ctx.call_sid, "no store configured; call start not persisted");
        Ok(())
    }

    async fn record_turn(
        &self,
        call_sid: &str,
        speaker: &str,
        _text: &str,
    ) -> Result<(), AppError> {
        debug!(call_sid=%call_sid, speaker, "no store configured; turn not persisted");
        Ok(())
    }

    async fn record_survey_result(
        &self,
        ctx: &CallContext,
        answers: &[SurveyAnswer],
        summary: Option<&str>,
    ) -> Result<(), AppError> {
        info!(
            call_sid=%ctx.call_sid,
            answers = answers.len(),
            summary = ?summary,
            "survey completed"
        );
        Ok(())
    }

    async fn record_call_end(&self, call_sid: &str) -> Result<(), AppError> {
        debug!(call_sid=%call_sid, "no store configured; call end not persisted");
        Ok(())
    }
}

pub struct PgStore {
    pool: Pool<Postgres>,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, AppError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        sqlx::migrate!().run(&pool).await.map_err(|e| {
            error!(error=%e, "failed to run migrations");
            AppError::Db(e.into())
        })?;
        Ok(Self { pool })
    }

    async fn insert_turn(
        &self,
        call_sid: &str,
        speaker: &str,
        text: &str,
    ) -> Result<Turn, sqlx::Error> {
        sqlx::query_as::<_, Turn>(
            "
            insert into turns (call_sid, seq, speaker, text)
            select $1, coalesce(max(seq), 0) + 1, $2, $3
            from turns
            where call_sid = $1
            returning *
            ",
        )
        .bind(call_sid)
        .bind(speaker)
        .bind(text)
        .fetch_one(&self.pool)
        .await
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => db.code().as_deref() == Some("23505"),
        _ => false,
    }
}

#[async_trait]
impl CallStore for PgStore {
    async fn record_call_start(&self, ctx: &CallContext) -> Result<(), AppError> {
        let call = sqlx::query_as::<_, Call>(
            "
            insert into calls (call_sid, app_id, caller, callee)
            values ($1, $2, $3, $4)
            on conflict (call_sid) do update set app_id = excluded.app_id
            returning *
            ",
        )
        .bind(&ctx.call_sid)
        .bind(&ctx.app_id)
        .bind(&ctx.from)
        .bind(&ctx.to)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            error!(error=%e, "failed to insert call row");
            AppError::Db(e)
        })?;
        debug!(id = call.id, call_sid=%call.call_sid, started=?call.started, "call row written");
        Ok(())
    }

    /// Sequence numbers are assigned in the insert itself; two concurrent writers for the same
    /// call can collide on the unique index, in which case the loser retries once.
    async fn record_turn(&self, call_sid: &str, speaker: &str, text: &str) -> Result<(), AppError> {
        let turn = match self.insert_turn(call_sid, speaker, text).await {
            Err(e) if is_unique_violation(&e) => {
                warn!(call_sid=%call_sid, "turn sequence collision; retrying once");
                self.insert_turn(call_sid, speaker, text).await
            }
            res => res,
        }
        .map_err(|e| {
            error!(error=%e, "failed to insert turn row");
            AppError::Db(e)
        })?;
        debug!(call_sid=%turn.call_sid, seq = turn.seq, speaker=%turn.speaker, "turn row written");
        Ok(())
    }

    async fn record_survey_result(
        &self,
        ctx: &CallContext,
        answers: &[SurveyAnswer],
        summary: Option<&str>,
    ) -> Result<(), AppError> {
        let answers = serde_json::to_string(answers)?;
        let row = sqlx::query_as::<_, SurveyResult>(
            "
            insert into survey_results (call_sid, app_id, answers, summary)
            values ($1, $2, $3, $4)
            returning *
            ",
        )
        .bind(&ctx.call_sid)
        .bind(&ctx.app_id)
        .bind(answers)
        .bind(summary)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            error!(error=%e, "failed to insert survey result");
            AppError::Db(e)
        })?;
        info!(
            id = row.id,
            call_sid=%row.call_sid,
            app=%row.app_id,
            has_summary = row.summary.is_some(),
            created=?row.created,
            "survey result written"
        );
        Ok(())
    }

    async fn record_call_end(&self, call_sid: &str) -> Result<(), AppError> {
        let ended = sqlx::query_as::<_, Call>(
            "
            update calls set ended = now()
            where call_sid = $1 and ended is null
            returning *
            ",
        )
        .bind(call_sid)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!(error=%e, "failed to mark call ended");
            AppError::Db(e)
        })?;
        if let Some(call) = ended {
            debug!(
                call_sid=%call.call_sid,
                caller=%call.caller,
                callee=%call.callee,
                ended=?call.ended,
                "call row closed"
            );
        }
        Ok(())
    }
}

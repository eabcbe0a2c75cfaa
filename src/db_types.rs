use sqlx::types::time::OffsetDateTime;

#[derive(sqlx::FromRow, Debug)]
pub struct Call {
    pub id: i32,
    pub call_sid: String,
    pub app_id: String,
    pub caller: String,
    pub callee: String,
    pub started: OffsetDateTime,
    pub ended: Option<OffsetDateTime>,
}

#[derive(sqlx::FromRow, Debug)]
pub struct Turn {
    pub id: i32,
    pub call_sid: String,
    pub seq: i32,
    pub speaker: String,
    pub text: String,
    pub created: OffsetDateTime,
}

#[derive(sqlx::FromRow, Debug)]
pub struct SurveyResult {
    pub id: i32,
    pub call_sid: String,
    pub app_id: String,
    /// JSON array of answers.
    pub answers: String,
    pub summary: Option<String>,
    pub created: OffsetDateTime,
}

use serde_json::{json, Value};

/// Failure of a domain operation. Every variant maps to a stable protocol code.
#[derive(Debug, thiserror::Error)]
pub enum ExamError {
    #[error("{what} not found")]
    NotFound { what: String, details: Option<Value> },

    #[error("{0}")]
    BadParams(String),

    #[error("{} item(s) rejected", errors.len())]
    InvalidItems { errors: Vec<Value> },

    #[error("problem hash mismatch for version {version}")]
    HashMismatch {
        version: String,
        stored: Option<String>,
        incoming: Option<String>,
    },

    #[error("question count mismatch for version {version}: file={incoming} db={stored}")]
    QuestionCountMismatch {
        version: String,
        stored: usize,
        incoming: usize,
    },

    #[error("question order mismatch for version {version} at position {position}")]
    OrderMismatch {
        version: String,
        position: usize,
        stored: Value,
        incoming: Value,
    },

    #[error("scores already entered (total={total}); pass force to zero them")]
    ScoresPresent { total: i64, details: Value },

    #[error("guard check failed: {}", violations.join("; "))]
    GuardFailed { violations: Vec<String> },

    #[error("{0}")]
    IncompleteRows(String, Value),

    #[error("confirmation required")]
    ConfirmationRequired { preview: Value },

    #[error("invalid document: {0}")]
    BadDocument(String),

    #[error(transparent)]
    Db(#[from] rusqlite::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

impl ExamError {
    pub fn not_found_with(what: impl Into<String>, details: Value) -> Self {
        Self::NotFound {
            what: what.into(),
            details: Some(details),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::BadParams(_) | Self::InvalidItems { .. } => "bad_params",
            Self::HashMismatch { .. } => "hash_mismatch",
            Self::QuestionCountMismatch { .. } => "question_count_mismatch",
            Self::OrderMismatch { .. } => "order_mismatch",
            Self::ScoresPresent { .. } => "scores_present",
            Self::GuardFailed { .. } => "guard_failed",
            Self::IncompleteRows(..) => "incomplete_rows",
            Self::ConfirmationRequired { .. } => "confirmation_required",
            Self::BadDocument(_) => "bad_json",
            Self::Db(_) => "db_query_failed",
            Self::Json(_) => "bad_json",
            Self::Io(_) => "io_failed",
        }
    }

    pub fn details(&self) -> Option<Value> {
        match self {
            Self::NotFound { details, .. } => details.clone(),
            Self::HashMismatch {
                version,
                stored,
                incoming,
            } => Some(json!({
                "version": version,
                "stored": stored,
                "incoming": incoming,
            })),
            Self::QuestionCountMismatch {
                version,
                stored,
                incoming,
            } => Some(json!({
                "version": version,
                "stored": stored,
                "incoming": incoming,
            })),
            Self::OrderMismatch {
                version,
                position,
                stored,
                incoming,
            } => Some(json!({
                "version": version,
                "position": position,
                "stored": stored,
                "incoming": incoming,
            })),
            Self::ScoresPresent { details, .. } => Some(details.clone()),
            Self::InvalidItems { errors } => Some(json!({ "errors": errors })),
            Self::GuardFailed { violations } => Some(json!({ "violations": violations })),
            Self::IncompleteRows(_, details) => Some(details.clone()),
            Self::ConfirmationRequired { preview } => Some(preview.clone()),
            _ => None,
        }
    }
}

pub type ExamResult<T> = Result<T, ExamError>;

use crate::config::ExamDefaults;
use crate::error::ExamError;
use crate::ipc::error::{err, ok};
use crate::ipc::types::AppState;
use crate::registry;
use rusqlite::Connection;
use serde::Serialize;
use serde_json::{json, Value};

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<Value>,
}

impl HandlerErr {
    pub fn response(self, id: &str) -> Value {
        err(id, self.code, self.message, self.details)
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        Self {
            code: "bad_params",
            message: message.into(),
            details: None,
        }
    }
}

impl From<ExamError> for HandlerErr {
    fn from(e: ExamError) -> Self {
        Self {
            code: e.code(),
            message: e.to_string(),
            details: e.details(),
        }
    }
}

impl From<serde_json::Error> for HandlerErr {
    fn from(e: serde_json::Error) -> Self {
        Self {
            code: "bad_json",
            message: e.to_string(),
            details: None,
        }
    }
}

/// Turns a handler outcome into the response envelope.
pub fn respond(id: &str, result: Result<Value, HandlerErr>) -> Value {
    match result {
        Ok(v) => ok(id, v),
        Err(e) => e.response(id),
    }
}

pub fn to_json<T: Serialize>(value: &T) -> Result<Value, HandlerErr> {
    Ok(serde_json::to_value(value)?)
}

pub fn conn(state: &AppState) -> Result<&Connection, HandlerErr> {
    state.db.as_ref().ok_or_else(|| HandlerErr {
        code: "no_workspace",
        message: "select a workspace first".into(),
        details: None,
    })
}

pub fn required_str(params: &Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn optional_str(params: &Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

pub fn optional_i64(params: &Value, key: &str) -> Result<Option<i64>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be an integer", key))),
    }
}

pub fn required_i64(params: &Value, key: &str) -> Result<i64, HandlerErr> {
    optional_i64(params, key)?.ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn flag(params: &Value, key: &str) -> bool {
    params.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
}

pub fn items<'a>(params: &'a Value) -> Result<&'a [Value], HandlerErr> {
    params
        .get("items")
        .and_then(|v| v.as_array())
        .map(Vec::as_slice)
        .ok_or_else(|| HandlerErr::bad_params("missing items[]"))
}

/// Destructive methods run only with `yes: true`; otherwise the preview is
/// returned as the error details.
pub fn require_yes(params: &Value, preview: Value) -> Result<(), HandlerErr> {
    if flag(params, "yes") {
        return Ok(());
    }
    Err(ExamError::ConfirmationRequired { preview }.into())
}

/// Resolves `subjectId`, or `subjectCode` with `fsyear` falling back to the
/// workspace default.
pub fn subject_id(conn: &Connection, params: &Value) -> Result<String, HandlerErr> {
    if let Some(id) = optional_str(params, "subjectId") {
        registry::get_subject(conn, &id)?;
        return Ok(id);
    }
    let Some(code) = optional_str(params, "subjectCode") else {
        return Err(HandlerErr::bad_params("missing subjectId or subjectCode"));
    };
    let fsyear = match optional_i64(params, "fsyear")? {
        Some(y) => y,
        None => ExamDefaults::load(conn)
            .map_err(|e| HandlerErr {
                code: "db_query_failed",
                message: e.to_string(),
                details: None,
            })?
            .fsyear
            .ok_or_else(|| HandlerErr::bad_params("missing fsyear and no default configured"))?,
    };
    match registry::find_subject(conn, &code, fsyear)? {
        Some(s) => Ok(s.id),
        None => Err(ExamError::not_found_with(
            "subject",
            json!({ "subjectCode": code, "fsyear": fsyear }),
        )
        .into()),
    }
}

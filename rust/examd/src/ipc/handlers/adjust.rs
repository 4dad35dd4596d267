use crate::bulk;
use crate::ipc::helpers::{conn, items, required_str, respond, subject_id, to_json, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::scoring;
use serde_json::{json, Value};

fn adjust_list(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = conn(state)?;
    let exam_id = required_str(&req.params, "examId")?;
    let rows = scoring::list_adjusts(conn, &exam_id)?;
    Ok(json!({ "examId": exam_id, "adjusts": to_json(&rows)? }))
}

fn adjust_update(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = conn(state)?;
    let subject_id = subject_id(conn, &req.params)?;
    let summary = scoring::update_adjustments(conn, &subject_id, items(&req.params)?)?;
    to_json(&summary)
}

fn adjust_ensure_rows(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = conn(state)?;
    let subject_id = subject_id(conn, &req.params)?;
    to_json(&bulk::ensure_adjust_rows(conn, &subject_id)?)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "adjust.list" => adjust_list(state, req),
        "adjust.update" => adjust_update(state, req),
        "adjust.ensureRows" => adjust_ensure_rows(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}

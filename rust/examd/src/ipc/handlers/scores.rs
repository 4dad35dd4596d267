use crate::bulk;
use crate::config::ExamDefaults;
use crate::ipc::helpers::{
    conn, items, optional_i64, required_str, respond, subject_id, to_json, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::scoring;
use serde_json::{json, Value};

fn scores_list(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = conn(state)?;
    let exam_id = required_str(&req.params, "examId")?;
    let student_id = optional_i64(&req.params, "studentId")?;
    let rows = scoring::list_scores(conn, &exam_id, student_id)?;
    Ok(json!({ "examId": exam_id, "scores": to_json(&rows)? }))
}

fn scores_update(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = conn(state)?;
    let entry = scoring::update_score(conn, &req.params)?;
    to_json(&entry)
}

fn scores_bulk_update(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = conn(state)?;
    let items = items(&req.params)?;
    let max_items = ExamDefaults::load(conn)
        .map(|d| d.bulk_update_max_items)
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let summary = scoring::bulk_update_scores(conn, items, max_items)?;
    to_json(&summary)
}

fn scores_exam_result(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = conn(state)?;
    let exam_id = required_str(&req.params, "examId")?;
    to_json(&scoring::exam_result(conn, &exam_id)?)
}

fn scores_subject_summary(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = conn(state)?;
    let subject_id = subject_id(conn, &req.params)?;
    to_json(&scoring::subject_summary(conn, &subject_id)?)
}

fn scores_ensure_rows(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = conn(state)?;
    let subject_id = subject_id(conn, &req.params)?;
    to_json(&bulk::ensure_score_rows(conn, &subject_id)?)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "scores.list" => scores_list(state, req),
        "scores.update" => scores_update(state, req),
        "scores.bulkUpdate" => scores_bulk_update(state, req),
        "scores.examResult" => scores_exam_result(state, req),
        "scores.subjectSummary" => scores_subject_summary(state, req),
        "scores.ensureRows" => scores_ensure_rows(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}

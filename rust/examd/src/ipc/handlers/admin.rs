use crate::bulk;
use crate::ipc::helpers::{conn, flag, require_yes, respond, subject_id, to_json, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::registry;
use serde_json::{json, Value};

fn subject_stats(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = conn(state)?;
    let subject_id = subject_id(conn, &req.params)?;
    to_json(&bulk::subject_stats(conn, &subject_id)?)
}

fn zero_scores(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = conn(state)?;
    let subject_id = subject_id(conn, &req.params)?;
    let stats = bulk::subject_stats(conn, &subject_id)?;
    require_yes(
        &req.params,
        json!({
            "scoreRows": stats.scores.rows,
            "adjustRows": stats.adjusts.rows,
            "correct": stats.scores.correct,
            "nonzeroCorrections": stats.scores.nonzero_corrections,
            "nonzeroAdjusts": stats.adjusts.nonzero,
        }),
    )?;
    to_json(&bulk::zero_scores(conn, &subject_id)?)
}

fn clear_runtime_data(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = conn(state)?;
    let subject_id = subject_id(conn, &req.params)?;
    let force = flag(&req.params, "force");
    let preview = bulk::clear_runtime_data(conn, &subject_id, false, force)?;
    if !flag(&req.params, "execute") {
        return to_json(&preview);
    }
    require_yes(&req.params, to_json(&preview)?)?;
    to_json(&bulk::clear_runtime_data(conn, &subject_id, true, force)?)
}

fn clear_subject_data(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = conn(state)?;
    let subject_id = subject_id(conn, &req.params)?;
    let subject = registry::get_subject(conn, &subject_id)?;
    let preview = bulk::subject_clear_preview(conn, &subject)?;
    require_yes(&req.params, to_json(&preview)?)?;
    let deleted = bulk::clear_subject_data(conn, &subject_id)?;
    Ok(json!({ "subjectId": subject_id, "deleted": to_json(&deleted)? }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "admin.subjectStats" => subject_stats(state, req),
        "admin.zeroScores" => zero_scores(state, req),
        "admin.clearRuntimeData" => clear_runtime_data(state, req),
        "admin.clearSubjectData" => clear_subject_data(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}

use crate::error::ExamError;
use crate::ipc::helpers::{
    conn, flag, optional_i64, optional_str, required_str, respond, subject_id, to_json, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::reconcile;
use crate::roster;
use serde_json::{json, Value};
use std::path::PathBuf;

fn versions_list(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = conn(state)?;
    let subject_id = subject_id(conn, &req.params)?;
    let assignments = reconcile::assignments_for_subject(conn, &subject_id)?;
    Ok(json!({ "subjectId": subject_id, "assignments": to_json(&assignments)? }))
}

fn versions_load_assignments(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = conn(state)?;
    let subject_id = subject_id(conn, &req.params)?;
    let map = match (optional_str(&req.params, "path"), optional_str(&req.params, "yaml")) {
        (Some(path), _) => roster::read_assignment_yaml(&PathBuf::from(path))?,
        (None, Some(text)) => roster::parse_assignment_yaml(&text)?,
        (None, None) => return Err(HandlerErr::bad_params("missing path or yaml")),
    };
    let summary = reconcile::load_assignments(conn, &subject_id, &map)?;
    to_json(&summary)
}

fn versions_assign(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = conn(state)?;
    let subject_id = subject_id(conn, &req.params)?;
    let version = required_str(&req.params, "version")?;
    let student_id = match optional_i64(&req.params, "studentId")? {
        Some(id) => id,
        None => {
            let code = required_str(&req.params, "studentCode")?;
            roster::find_student_by_code(conn, &code)?
                .ok_or_else(|| {
                    ExamError::not_found_with("student", json!({ "studentCode": code }))
                })?
                .id
        }
    };
    let result = reconcile::assign_version(
        conn,
        &subject_id,
        student_id,
        &version,
        flag(&req.params, "force"),
    )?;
    to_json(&result)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "versions.list" => versions_list(state, req),
        "versions.loadAssignments" => versions_load_assignments(state, req),
        "versions.assign" => versions_assign(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}

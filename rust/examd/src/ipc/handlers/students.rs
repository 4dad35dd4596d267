use crate::error::ExamError;
use crate::ipc::helpers::{
    conn, flag, optional_i64, optional_str, require_yes, required_str, respond, subject_id,
    to_json, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::roster;
use crate::scoring;
use anyhow::Context;
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing::warn;

fn students_list(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = conn(state)?;
    let entry_year = optional_i64(&req.params, "entryYear")?;
    let students = roster::list_students(conn, entry_year, flag(&req.params, "enrolledOnly"))?;
    Ok(json!({ "students": to_json(&students)? }))
}

fn students_load_csv(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = conn(state)?;
    let path = PathBuf::from(required_str(&req.params, "path")?);
    let parsed = roster::read_roster(&path)?;
    for w in &parsed.warnings {
        warn!(line = w.line, code = w.code, "roster row skipped");
    }
    let existing = roster::list_students(conn, None, false)?;
    let preview = json!({
        "rows": parsed.students.len(),
        "existing": existing.len(),
        "warnings": to_json(&parsed.warnings)?,
    });
    if flag(&req.params, "dryRun") {
        return Ok(json!({ "dryRun": true, "preview": preview }));
    }
    require_yes(&req.params, preview)?;

    let summary = roster::load_roster(conn, &parsed.students)?;
    Ok(json!({
        "summary": to_json(&summary)?,
        "warnings": to_json(&parsed.warnings)?,
    }))
}

/// Writes the roster to `outPath`, or returns the text when no path is given.
fn students_export_csv(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = conn(state)?;
    let entry_year = optional_i64(&req.params, "entryYear")?;
    let students = roster::list_students(conn, entry_year, flag(&req.params, "enrolledOnly"))?;
    let text = roster::roster_csv(&students);
    let Some(out) = optional_str(&req.params, "outPath") else {
        return Ok(json!({ "rows": students.len(), "csv": text }));
    };
    let path = PathBuf::from(&out);
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))
            .map_err(ExamError::Io)?;
    }
    std::fs::write(&path, text)
        .with_context(|| format!("failed to write roster {}", path.display()))
        .map_err(ExamError::Io)?;
    Ok(json!({ "rows": students.len(), "path": out }))
}

fn subject_students(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = conn(state)?;
    let subject_id = subject_id(conn, &req.params)?;
    let totals = scoring::student_totals(conn, &subject_id)?;
    Ok(json!({ "subjectId": subject_id, "students": to_json(&totals)? }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "students.list" => students_list(state, req),
        "students.loadCsv" => students_load_csv(state, req),
        "students.exportCsv" => students_export_csv(state, req),
        "subjects.students" => subject_students(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}

use crate::config::ExamDefaults;
use crate::error::ExamError;
use crate::interchange::{self, ExportOptions, ImportOptions};
use crate::ipc::helpers::{
    conn, flag, optional_i64, require_yes, required_str, respond, subject_id, to_json, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::registry;
use serde_json::{json, Value};
use std::path::PathBuf;

fn export_scores(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = conn(state)?;
    let subject_id = subject_id(conn, &req.params)?;
    let out_path = PathBuf::from(required_str(&req.params, "outPath")?);
    let opts = ExportOptions {
        fill_missing: flag(&req.params, "fillMissing"),
    };
    let subject = registry::get_subject(conn, &subject_id)?;
    let (block, summary) = interchange::export_subject(conn, &subject_id, opts)?;
    let tool_version = ExamDefaults::load(conn)
        .map(|d| d.tool_version)
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let doc = interchange::write_export(&out_path, &subject.code, block, &tool_version)?;
    Ok(json!({
        "path": out_path.to_string_lossy(),
        "summary": to_json(&summary)?,
        "subjectsInFile": doc.subjects.len(),
    }))
}

fn student_codes(params: &Value) -> Result<Option<Vec<String>>, HandlerErr> {
    let Some(v) = params.get("studentCodes").filter(|v| !v.is_null()) else {
        return Ok(None);
    };
    let Some(arr) = v.as_array() else {
        return Err(HandlerErr::bad_params("studentCodes must be an array"));
    };
    let mut out = Vec::with_capacity(arr.len());
    for c in arr {
        match c {
            Value::String(s) => out.push(s.trim().to_string()),
            Value::Number(n) => out.push(n.to_string()),
            _ => return Err(HandlerErr::bad_params("studentCodes must hold strings")),
        }
    }
    Ok(Some(out))
}

fn import_scores(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = conn(state)?;
    let in_path = PathBuf::from(required_str(&req.params, "inPath")?);
    if !in_path.is_file() {
        return Err(ExamError::not_found_with(
            "interchange file",
            json!({ "path": in_path.to_string_lossy() }),
        )
        .into());
    }
    let subject_code = required_str(&req.params, "subjectCode")?;
    let doc = interchange::read_document(&in_path)?;

    // A given fsyear must agree with the file's subject block.
    if let Some(fsyear) = optional_i64(&req.params, "fsyear")? {
        let file_year = doc.subjects.get(&subject_code).and_then(|b| b.fsyear);
        if file_year.is_some() && file_year != Some(fsyear) {
            return Err(HandlerErr::bad_params(format!(
                "file has fsyear {:?} for {}, request asked for {}",
                file_year, subject_code, fsyear
            )));
        }
    }

    let opts = ImportOptions {
        ignore_hash: flag(&req.params, "ignoreHash"),
        ignore_order: flag(&req.params, "ignoreOrder"),
        student_codes: student_codes(&req.params)?,
    };
    let plan = interchange::plan_import(conn, &doc, &subject_code, &opts)?;
    let preview = interchange::apply_import(conn, &plan, true)?;
    if flag(&req.params, "dryRun") {
        return Ok(json!({
            "plan": to_json(&plan)?,
            "summary": to_json(&preview)?,
        }));
    }
    require_yes(&req.params, to_json(&preview)?)?;
    let summary = interchange::apply_import(conn, &plan, false)?;
    Ok(json!({ "summary": to_json(&summary)? }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "exchange.exportScores" => export_scores(state, req),
        "exchange.importScores" => import_scores(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}

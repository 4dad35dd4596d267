use crate::backup;
use crate::config::ExamDefaults;
use crate::error::ExamError;
use crate::interchange;
use crate::ipc::helpers::{conn, optional_str, required_str, respond, to_json, HandlerErr};
use crate::ipc::types::{AppState, Request};
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing::{info, warn};

fn io_failed(e: anyhow::Error, path: &str) -> HandlerErr {
    HandlerErr {
        code: "io_failed",
        message: e.to_string(),
        details: Some(json!({ "path": path })),
    }
}

fn snapshot_value(state: &AppState) -> Result<Value, HandlerErr> {
    let conn = conn(state)?;
    let tool_version = ExamDefaults::load(conn)
        .map_err(ExamError::Io)?
        .tool_version;
    let docs = interchange::snapshot_documents(conn, &tool_version)?;
    to_json(&docs)
}

fn export_bundle(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let out_path = required_str(&req.params, "outPath")?;
    let db = conn(state)?;
    let Some(workspace) = state.workspace.as_deref() else {
        return Err(HandlerErr {
            code: "no_workspace",
            message: "select a workspace first".into(),
            details: None,
        });
    };
    let include_snapshot = req
        .params
        .get("includeSnapshot")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);
    let snapshot = if include_snapshot {
        Some(snapshot_value(state)?)
    } else {
        None
    };

    if let Err(e) = db.execute_batch("PRAGMA wal_checkpoint(FULL)") {
        warn!(error = %e, "wal checkpoint before backup failed");
    }

    let export = backup::export_workspace_bundle(workspace, &PathBuf::from(&out_path), snapshot.as_ref())
        .map_err(|e| io_failed(e, &out_path))?;
    info!(path = %out_path, entries = export.entry_count, "workspace bundle exported");
    Ok(json!({
        "path": out_path,
        "bundleFormat": export.bundle_format,
        "entryCount": export.entry_count,
    }))
}

fn import_bundle(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let in_path = required_str(&req.params, "inPath")?;
    let workspace = optional_str(&req.params, "workspacePath")
        .map(PathBuf::from)
        .or_else(|| state.workspace.clone())
        .ok_or_else(|| HandlerErr {
            code: "no_workspace",
            message: "select a workspace first".into(),
            details: None,
        })?;
    let src = PathBuf::from(&in_path);
    if !src.is_file() {
        return Err(ExamError::not_found_with("bundle file", json!({ "path": in_path })).into());
    }

    // The open handle must go before the file is replaced.
    state.db = None;
    let import = backup::import_workspace_bundle(&src, &workspace).map_err(|e| io_failed(e, &in_path))?;
    state.open_workspace(&workspace).map_err(|e| HandlerErr {
        code: "db_open_failed",
        message: e.to_string(),
        details: None,
    })?;

    let snapshot_check = match &import.snapshot_exams {
        Some(exams) => Some(interchange::check_snapshot(conn(state)?, exams)?),
        None => None,
    };
    info!(
        path = %in_path,
        format = %import.bundle_format_detected,
        "workspace bundle imported"
    );
    Ok(json!({
        "workspacePath": workspace.to_string_lossy(),
        "bundleFormatDetected": import.bundle_format_detected,
        "hasSnapshot": import.has_snapshot(),
        "snapshotCheck": to_json(&snapshot_check)?,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "backup.exportWorkspaceBundle" => export_bundle(state, req),
        "backup.importWorkspaceBundle" => import_bundle(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}

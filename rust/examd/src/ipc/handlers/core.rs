use crate::config::ExamDefaults;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{conn, respond, to_json, HandlerErr};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::PathBuf;

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string())
        }),
    )
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let p = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from);
    let Some(path) = p else {
        return err(&req.id, "bad_params", "missing params.path", None);
    };

    match state.open_workspace(&path) {
        Ok(()) => ok(&req.id, json!({ "workspacePath": path.to_string_lossy() })),
        Err(e) => err(&req.id, "db_open_failed", format!("{e:?}"), None),
    }
}

fn db_failed(e: anyhow::Error) -> HandlerErr {
    HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    }
}

fn settings_get(state: &AppState) -> Result<serde_json::Value, HandlerErr> {
    let conn = conn(state)?;
    let defaults = ExamDefaults::load(conn).map_err(db_failed)?;
    to_json(&defaults)
}

fn settings_update(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = conn(state)?;
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::bad_params("missing patch object"));
    };
    let mut defaults = ExamDefaults::load(conn).map_err(db_failed)?;
    defaults.merge_patch(patch).map_err(HandlerErr::bad_params)?;
    defaults.save(conn).map_err(db_failed)?;
    to_json(&defaults)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        "settings.get" => Some(respond(&req.id, settings_get(state))),
        "settings.update" => Some(respond(&req.id, settings_update(state, req))),
        _ => None,
    }
}

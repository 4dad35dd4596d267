use crate::config::ExamDefaults;
use crate::error::ExamError;
use crate::ipc::helpers::{
    conn, flag, optional_i64, required_str, respond, subject_id, to_json, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::registry::{self, LoadOptions};
use serde_json::{json, Value};
use std::path::PathBuf;

fn subjects_list(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = conn(state)?;
    let fsyear = optional_i64(&req.params, "fsyear")?;
    let subjects = registry::list_subjects(conn, fsyear)?;
    Ok(json!({ "subjects": to_json(&subjects)? }))
}

fn subjects_load_definition(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = conn(state)?;
    let path = PathBuf::from(required_str(&req.params, "path")?);
    if !path.is_file() {
        return Err(ExamError::not_found_with(
            "definition file",
            json!({ "path": path.to_string_lossy() }),
        )
        .into());
    }
    let def = registry::read_definition(&path)?;
    let defaults = ExamDefaults::load(conn).map_err(ExamError::Io)?;
    let opts = LoadOptions {
        update_subject: flag(&req.params, "updateSubject"),
        update_hash: flag(&req.params, "updateHash"),
        replace_questions: flag(&req.params, "replaceQuestions"),
        default_term: defaults.term,
    };
    let summary = registry::load_definition(conn, &def, opts)?;
    to_json(&summary)
}

fn exams_list(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = conn(state)?;
    let subject_id = subject_id(conn, &req.params)?;
    let exams = registry::list_exams(conn, &subject_id)?;
    Ok(json!({ "subjectId": subject_id, "exams": to_json(&exams)? }))
}

fn exams_get(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = conn(state)?;
    let exam_id = required_str(&req.params, "examId")?;
    let exam = registry::get_exam(conn, &exam_id)?;
    let questions = registry::ordered_questions(conn, &exam_id)?;
    let total_points: i64 = questions.iter().map(|q| q.points).sum();
    Ok(json!({
        "exam": to_json(&exam)?,
        "questions": to_json(&questions)?,
        "totalPoints": total_points,
    }))
}

fn comment_get(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = conn(state)?;
    let subject_id = subject_id(conn, &req.params)?;
    let comment = registry::get_comment(conn, &subject_id)?;
    Ok(json!({ "subjectId": subject_id, "comment": comment }))
}

fn comment_set(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = conn(state)?;
    let subject_id = subject_id(conn, &req.params)?;
    let Some(comment) = req.params.get("comment").and_then(|v| v.as_str()) else {
        return Err(HandlerErr::bad_params("missing comment"));
    };
    let exams = registry::set_comment(conn, &subject_id, comment)?;
    Ok(json!({ "subjectId": subject_id, "examsUpdated": exams }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "subjects.list" => subjects_list(state, req),
        "subjects.loadDefinition" => subjects_load_definition(state, req),
        "exams.list" => exams_list(state, req),
        "exams.get" => exams_get(state, req),
        "adjust.commentGet" => comment_get(state, req),
        "adjust.commentSet" => comment_set(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}

//! Score and adjustment rows: listing, editing and the additive totals.

use crate::error::{ExamError, ExamResult};
use crate::reconcile;
use crate::registry::{self, Exam, Subject};
use crate::roster;
use rusqlite::{Connection, OptionalExtension, Row};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::info;
use uuid::Uuid;

/// Bound on any single correction or adjustment value.
pub const VALUE_LIMIT: i64 = 100_000;

pub(crate) fn check_value(value: i64, min: i64) -> Result<i64, String> {
    if (min..=VALUE_LIMIT).contains(&value) {
        Ok(value)
    } else {
        Err(format!("must be between {} and {}", min, VALUE_LIMIT))
    }
}

pub(crate) fn three_term_total(score: i64, correction: i64, adjust: i64) -> ExamResult<i64> {
    score
        .checked_add(correction)
        .and_then(|v| v.checked_add(adjust))
        .ok_or_else(|| ExamError::BadParams("total out of range".into()))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Totals {
    pub score: i64,
    pub correction: i64,
    pub adjust: i64,
    pub total: i64,
}

/// total = Σ(correct × points) + Σ(correction) + adjust
pub fn exam_totals(conn: &Connection, student_id: i64, exam_id: &str) -> ExamResult<Totals> {
    let (score, correction): (i64, i64) = conn.query_row(
        "SELECT COALESCE(SUM(se.correct * q.points), 0), COALESCE(SUM(se.correction), 0)
         FROM student_exams se
         JOIN questions q ON q.id = se.question_id
         WHERE se.student_id = ? AND se.exam_id = ?",
        (student_id, exam_id),
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;
    let adjust: i64 = conn.query_row(
        "SELECT COALESCE(SUM(adjust), 0) FROM exam_adjusts WHERE student_id = ? AND exam_id = ?",
        (student_id, exam_id),
        |r| r.get(0),
    )?;
    Ok(Totals {
        score,
        correction,
        adjust,
        total: three_term_total(score, correction, adjust)?,
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentTotal {
    pub student_id: i64,
    pub student_code: String,
    pub nickname: String,
    pub version: Option<String>,
    pub exam_id: Option<String>,
    #[serde(flatten)]
    pub totals: Totals,
}

/// Every eligible student of the subject; unassigned ones carry zeros.
pub fn student_totals(conn: &Connection, subject_id: &str) -> ExamResult<Vec<StudentTotal>> {
    let subject = registry::get_subject(conn, subject_id)?;
    let students = roster::eligible_students(conn, &subject)?;
    let mut out = Vec::with_capacity(students.len());
    for s in students {
        let assignment = reconcile::current_assignment(conn, s.id, subject_id)?;
        let totals = match &assignment {
            Some(a) => exam_totals(conn, s.id, &a.exam_id)?,
            None => Totals::default(),
        };
        out.push(StudentTotal {
            student_id: s.id,
            student_code: s.code,
            nickname: s.nickname,
            version: assignment.as_ref().map(|a| a.version.clone()),
            exam_id: assignment.map(|a| a.exam_id),
            totals,
        });
    }
    Ok(out)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamBrief {
    pub id: String,
    pub title: String,
    pub hash: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectSummary {
    pub subject: Subject,
    pub exams: BTreeMap<String, ExamBrief>,
    pub students: Vec<StudentTotal>,
}

pub fn subject_summary(conn: &Connection, subject_id: &str) -> ExamResult<SubjectSummary> {
    let subject = registry::get_subject(conn, subject_id)?;
    let exams = registry::list_exams(conn, subject_id)?
        .into_iter()
        .map(|e| {
            (
                e.version,
                ExamBrief {
                    id: e.id,
                    title: e.title,
                    hash: e.problem_hash,
                },
            )
        })
        .collect();
    let mut students = Vec::new();
    for a in reconcile::assignments_for_subject(conn, subject_id)? {
        let totals = exam_totals(conn, a.student_id, &a.exam_id)?;
        students.push(StudentTotal {
            student_id: a.student_id,
            student_code: a.student_code,
            nickname: a.nickname,
            version: Some(a.version),
            exam_id: Some(a.exam_id),
            totals,
        });
    }
    Ok(SubjectSummary {
        subject,
        exams,
        students,
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamResultView {
    pub exam: Exam,
    pub students: Vec<StudentTotal>,
}

/// Totals for one exam over everyone assigned to it plus anyone still holding
/// rows under it.
pub fn exam_result(conn: &Connection, exam_id: &str) -> ExamResult<ExamResultView> {
    let exam = registry::get_exam(conn, exam_id)?;
    let mut ids = BTreeSet::new();
    let mut stmt = conn.prepare(
        "SELECT student_id FROM student_exam_versions WHERE exam_id = ?1
         UNION SELECT student_id FROM student_exams WHERE exam_id = ?1
         UNION SELECT student_id FROM exam_adjusts WHERE exam_id = ?1",
    )?;
    for id in stmt.query_map([exam_id], |r| r.get::<_, i64>(0))? {
        ids.insert(id?);
    }

    let mut students = Vec::with_capacity(ids.len());
    for id in ids {
        let s = roster::get_student(conn, id)?;
        let assigned: Option<String> = conn
            .query_row(
                "SELECT exam_id FROM student_exam_versions WHERE student_id = ? AND subject_id = ?",
                (id, &exam.subject_id),
                |r| r.get(0),
            )
            .optional()?;
        students.push(StudentTotal {
            student_id: id,
            student_code: s.code,
            nickname: s.nickname,
            version: (assigned.as_deref() == Some(exam.id.as_str())).then(|| exam.version.clone()),
            exam_id: Some(exam.id.clone()),
            totals: exam_totals(conn, id, &exam.id)?,
        });
    }
    students.sort_by(|a, b| a.student_code.cmp(&b.student_code));
    Ok(ExamResultView { exam, students })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreEntry {
    pub id: String,
    pub student_id: i64,
    pub student_code: String,
    pub exam_id: String,
    pub question_id: String,
    pub row: i64,
    pub col: i64,
    pub label: String,
    pub points: i64,
    pub correct: i64,
    pub correction: i64,
}

impl ScoreEntry {
    fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: r.get(0)?,
            student_id: r.get(1)?,
            student_code: r.get(2)?,
            exam_id: r.get(3)?,
            question_id: r.get(4)?,
            row: r.get(5)?,
            col: r.get(6)?,
            label: r.get(7)?,
            points: r.get(8)?,
            correct: r.get(9)?,
            correction: r.get(10)?,
        })
    }
}

const SCORE_SELECT: &str = "SELECT se.id, se.student_id, s.code, se.exam_id, se.question_id,
            q.row_no, q.col_no, q.label, q.points, se.correct, se.correction
     FROM student_exams se
     JOIN students s ON s.id = se.student_id
     JOIN questions q ON q.id = se.question_id";

pub fn list_scores(
    conn: &Connection,
    exam_id: &str,
    student_id: Option<i64>,
) -> ExamResult<Vec<ScoreEntry>> {
    registry::get_exam(conn, exam_id)?;
    let sql = format!(
        "{} WHERE se.exam_id = ?1 AND (?2 IS NULL OR se.student_id = ?2)
         ORDER BY s.code, q.row_no, q.col_no, q.rowid",
        SCORE_SELECT
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map((exam_id, student_id), ScoreEntry::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn get_score(conn: &Connection, id: &str) -> ExamResult<ScoreEntry> {
    let sql = format!("{} WHERE se.id = ?", SCORE_SELECT);
    conn.query_row(&sql, [id], ScoreEntry::from_row)
        .optional()?
        .ok_or_else(|| ExamError::not_found_with("score entry", json!({ "id": id })))
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScorePatch {
    pub id: String,
    pub correct: Option<i64>,
    pub correction: Option<i64>,
}

/// Checks the shape of one patch object; the id is resolved separately.
fn parse_patch(item: &Value) -> Result<ScorePatch, String> {
    let Some(obj) = item.as_object() else {
        return Err("item must be an object".into());
    };
    let Some(id) = obj.get("id").and_then(|v| v.as_str()).filter(|s| !s.is_empty()) else {
        return Err("missing id".into());
    };
    let correct = match obj.get("correct") {
        None | Some(Value::Null) => None,
        Some(Value::Bool(b)) => Some(*b as i64),
        Some(v) => match v.as_i64() {
            Some(n @ (0 | 1)) => Some(n),
            _ => return Err("correct must be 0 or 1".into()),
        },
    };
    let correction = match obj.get("correction") {
        None | Some(Value::Null) => None,
        Some(v) => match v.as_i64() {
            Some(n) => Some(check_value(n, -VALUE_LIMIT).map_err(|e| format!("correction {}", e))?),
            None => return Err("correction must be an integer".into()),
        },
    };
    if correct.is_none() && correction.is_none() {
        return Err("nothing to update".into());
    }
    Ok(ScorePatch {
        id: id.to_string(),
        correct,
        correction,
    })
}

fn apply_patch(conn: &Connection, current: &ScoreEntry, patch: &ScorePatch) -> ExamResult<bool> {
    let correct = patch.correct.unwrap_or(current.correct);
    let correction = patch.correction.unwrap_or(current.correction);
    if correct == current.correct && correction == current.correction {
        return Ok(false);
    }
    conn.execute(
        "UPDATE student_exams SET correct = ?, correction = ? WHERE id = ?",
        (correct, correction, &current.id),
    )?;
    Ok(true)
}

pub fn update_score(conn: &Connection, item: &Value) -> ExamResult<ScoreEntry> {
    let patch = parse_patch(item).map_err(ExamError::BadParams)?;
    let current = get_score(conn, &patch.id)?;
    apply_patch(conn, &current, &patch)?;
    get_score(conn, &patch.id)
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkUpdate {
    pub updated: usize,
    pub unchanged: usize,
}

/// All items are validated before the first write; one bad item rejects the
/// batch with every problem listed.
pub fn bulk_update_scores(
    conn: &Connection,
    items: &[Value],
    max_items: usize,
) -> ExamResult<BulkUpdate> {
    if items.is_empty() {
        return Err(ExamError::BadParams("items must not be empty".into()));
    }
    if items.len() > max_items {
        return Err(ExamError::BadParams(format!(
            "too many items: {} (max {})",
            items.len(),
            max_items
        )));
    }

    let mut errors = Vec::new();
    let mut planned: Vec<(ScoreEntry, ScorePatch)> = Vec::with_capacity(items.len());
    let mut by_id: HashMap<String, usize> = HashMap::new();
    for (index, item) in items.iter().enumerate() {
        let patch = match parse_patch(item) {
            Ok(p) => p,
            Err(message) => {
                errors.push(json!({ "index": index, "message": message }));
                continue;
            }
        };
        // Later items for the same row layer over earlier ones.
        if let Some(&slot) = by_id.get(&patch.id) {
            let merged = &mut planned[slot].1;
            merged.correct = patch.correct.or(merged.correct);
            merged.correction = patch.correction.or(merged.correction);
            continue;
        }
        match get_score(conn, &patch.id) {
            Ok(current) => {
                by_id.insert(patch.id.clone(), planned.len());
                planned.push((current, patch));
            }
            Err(ExamError::NotFound { .. }) => errors.push(json!({
                "index": index,
                "id": patch.id,
                "message": "score entry not found",
            })),
            Err(e) => return Err(e),
        }
    }
    if !errors.is_empty() {
        return Err(ExamError::InvalidItems { errors });
    }

    let tx = conn.unchecked_transaction()?;
    let mut out = BulkUpdate::default();
    for (current, patch) in &planned {
        if apply_patch(&tx, current, patch)? {
            out.updated += 1;
        } else {
            out.unchanged += 1;
        }
    }
    tx.commit()?;
    info!(updated = out.updated, unchanged = out.unchanged, "scores bulk updated");
    Ok(out)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdjustEntry {
    pub id: String,
    pub student_id: i64,
    pub student_code: String,
    pub nickname: String,
    pub exam_id: String,
    pub adjust: i64,
}

pub fn list_adjusts(conn: &Connection, exam_id: &str) -> ExamResult<Vec<AdjustEntry>> {
    registry::get_exam(conn, exam_id)?;
    let mut stmt = conn.prepare(
        "SELECT a.id, a.student_id, s.code, s.nickname, a.exam_id, a.adjust
         FROM exam_adjusts a
         JOIN students s ON s.id = a.student_id
         WHERE a.exam_id = ?
         ORDER BY s.code",
    )?;
    let rows = stmt
        .query_map([exam_id], |r| {
            Ok(AdjustEntry {
                id: r.get(0)?,
                student_id: r.get(1)?,
                student_code: r.get(2)?,
                nickname: r.get(3)?,
                exam_id: r.get(4)?,
                adjust: r.get(5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdjustUpdate {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
}

/// Upserts adjustments for students of one subject. The exam must belong to
/// the subject and be the one the student is assigned to.
pub fn update_adjustments(
    conn: &Connection,
    subject_id: &str,
    items: &[Value],
) -> ExamResult<AdjustUpdate> {
    let subject = registry::get_subject(conn, subject_id)?;
    if items.is_empty() {
        return Err(ExamError::BadParams("items must not be empty".into()));
    }

    let mut errors = Vec::new();
    let mut planned: Vec<(i64, String, i64)> = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        let code = item.get("studentCode").and_then(|v| v.as_str()).unwrap_or("");
        let exam_id = item.get("examId").and_then(|v| v.as_str()).unwrap_or("");
        let adjust = item.get("adjust").and_then(|v| v.as_i64());
        let mut fail = |message: &str| {
            errors.push(json!({ "index": index, "studentCode": code, "message": message }))
        };

        let Some(adjust) = adjust.filter(|a| check_value(*a, 0).is_ok()) else {
            fail(&format!("adjust must be an integer between 0 and {}", VALUE_LIMIT));
            continue;
        };
        let exam = match registry::get_exam(conn, exam_id) {
            Ok(e) if e.subject_id == subject.id => e,
            Ok(_) => {
                fail("exam does not belong to subject");
                continue;
            }
            Err(ExamError::NotFound { .. }) => {
                fail("exam not found");
                continue;
            }
            Err(e) => return Err(e),
        };
        let Some(student) = roster::find_student_by_code(conn, code)? else {
            fail("student not found");
            continue;
        };
        match reconcile::current_assignment(conn, student.id, subject_id)? {
            Some(a) if a.exam_id == exam.id => planned.push((student.id, exam.id, adjust)),
            _ => fail("student is not assigned to this exam"),
        }
    }
    if !errors.is_empty() {
        return Err(ExamError::InvalidItems { errors });
    }

    let tx = conn.unchecked_transaction()?;
    let mut out = AdjustUpdate::default();
    for (student_id, exam_id, adjust) in &planned {
        let current: Option<i64> = tx
            .query_row(
                "SELECT adjust FROM exam_adjusts WHERE student_id = ? AND exam_id = ?",
                (student_id, exam_id),
                |r| r.get(0),
            )
            .optional()?;
        match current {
            Some(v) if v == *adjust => out.unchanged += 1,
            Some(_) => {
                tx.execute(
                    "UPDATE exam_adjusts SET adjust = ? WHERE student_id = ? AND exam_id = ?",
                    (adjust, student_id, exam_id),
                )?;
                out.updated += 1;
            }
            None => {
                tx.execute(
                    "INSERT INTO exam_adjusts(id, student_id, exam_id, adjust) VALUES(?, ?, ?, ?)",
                    (Uuid::new_v4().to_string(), student_id, exam_id, adjust),
                )?;
                out.created += 1;
            }
        }
    }
    tx.commit()?;
    info!(
        subject = %subject.code,
        created = out.created,
        updated = out.updated,
        "adjustments updated"
    );
    Ok(out)
}

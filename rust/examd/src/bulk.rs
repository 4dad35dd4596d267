//! Set-based maintenance over one subject: row creation, zeroing, clearing
//! and statistics.

use crate::error::{ExamError, ExamResult};
use crate::reconcile;
use crate::registry::{self, Subject};
use rusqlite::Connection;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

/// Inserts a zero score row for every question of `exam_id` the student
/// does not already have. Returns the number of rows created.
pub(crate) fn ensure_student_score_rows(
    conn: &Connection,
    student_id: i64,
    exam_id: &str,
) -> ExamResult<usize> {
    let questions = registry::ordered_questions(conn, exam_id)?;
    let mut insert = conn.prepare_cached(
        "INSERT OR IGNORE INTO student_exams(id, student_id, exam_id, question_id, correct, correction)
         VALUES(?, ?, ?, ?, 0, 0)",
    )?;
    let mut created = 0;
    for q in &questions {
        created += insert.execute((Uuid::new_v4().to_string(), student_id, exam_id, &q.id))?;
    }
    Ok(created)
}

pub(crate) fn ensure_student_adjust_row(
    conn: &Connection,
    student_id: i64,
    exam_id: &str,
) -> ExamResult<usize> {
    let n = conn.execute(
        "INSERT OR IGNORE INTO exam_adjusts(id, student_id, exam_id, adjust) VALUES(?, ?, ?, 0)",
        (Uuid::new_v4().to_string(), student_id, exam_id),
    )?;
    Ok(n)
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnsureRows {
    pub assignments: usize,
    pub created: usize,
}

pub fn ensure_score_rows(conn: &Connection, subject_id: &str) -> ExamResult<EnsureRows> {
    let subject = registry::get_subject(conn, subject_id)?;
    let assignments = reconcile::assignments_for_subject(conn, subject_id)?;
    let tx = conn.unchecked_transaction()?;
    let mut created = 0;
    for a in &assignments {
        created += ensure_student_score_rows(&tx, a.student_id, &a.exam_id)?;
    }
    tx.commit()?;
    info!(subject = %subject.code, created, "score rows ensured");
    Ok(EnsureRows {
        assignments: assignments.len(),
        created,
    })
}

pub fn ensure_adjust_rows(conn: &Connection, subject_id: &str) -> ExamResult<EnsureRows> {
    let subject = registry::get_subject(conn, subject_id)?;
    let assignments = reconcile::assignments_for_subject(conn, subject_id)?;
    let tx = conn.unchecked_transaction()?;
    let mut created = 0;
    for a in &assignments {
        created += ensure_student_adjust_row(&tx, a.student_id, &a.exam_id)?;
    }
    tx.commit()?;
    info!(subject = %subject.code, created, "adjust rows ensured");
    Ok(EnsureRows {
        assignments: assignments.len(),
        created,
    })
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreTotals {
    pub rows: i64,
    pub correct: i64,
    pub nonzero_corrections: i64,
    pub unscored: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdjustTotals {
    pub rows: i64,
    pub nonzero: i64,
    pub sum: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectStats {
    pub subject_id: String,
    pub code: String,
    pub fsyear: i64,
    pub exam_count: usize,
    pub versions: Vec<String>,
    pub question_count: i64,
    pub max_row: i64,
    pub total_points: i64,
    pub assignments: i64,
    pub scores: ScoreTotals,
    pub adjusts: AdjustTotals,
}

const SUBJECT_EXAMS: &str = "SELECT id FROM exams WHERE subject_id = ?1";

fn score_totals(conn: &Connection, subject_id: &str) -> ExamResult<ScoreTotals> {
    let sql = format!(
        "SELECT COUNT(*),
                COALESCE(SUM(correct = 1), 0),
                COALESCE(SUM(correction <> 0), 0),
                COALESCE(SUM(correct = 0 AND correction = 0), 0)
         FROM student_exams WHERE exam_id IN ({})",
        SUBJECT_EXAMS
    );
    Ok(conn.query_row(&sql, [subject_id], |r| {
        Ok(ScoreTotals {
            rows: r.get(0)?,
            correct: r.get(1)?,
            nonzero_corrections: r.get(2)?,
            unscored: r.get(3)?,
        })
    })?)
}

fn adjust_totals(conn: &Connection, subject_id: &str) -> ExamResult<AdjustTotals> {
    let sql = format!(
        "SELECT COUNT(*), COALESCE(SUM(adjust <> 0), 0), COALESCE(SUM(adjust), 0)
         FROM exam_adjusts WHERE exam_id IN ({})",
        SUBJECT_EXAMS
    );
    Ok(conn.query_row(&sql, [subject_id], |r| {
        Ok(AdjustTotals {
            rows: r.get(0)?,
            nonzero: r.get(1)?,
            sum: r.get(2)?,
        })
    })?)
}

pub fn subject_stats(conn: &Connection, subject_id: &str) -> ExamResult<SubjectStats> {
    let subject = registry::get_subject(conn, subject_id)?;
    let exams = registry::list_exams(conn, subject_id)?;
    let (question_count, max_row, total_points): (i64, i64, i64) = conn.query_row(
        &format!(
            "SELECT COUNT(*), COALESCE(MAX(row_no), 0), COALESCE(SUM(points), 0)
             FROM questions WHERE exam_id IN ({})",
            SUBJECT_EXAMS
        ),
        [subject_id],
        |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
    )?;
    let assignments: i64 = conn.query_row(
        "SELECT COUNT(*) FROM student_exam_versions WHERE subject_id = ?",
        [subject_id],
        |r| r.get(0),
    )?;
    Ok(SubjectStats {
        subject_id: subject.id.clone(),
        code: subject.code.clone(),
        fsyear: subject.fsyear,
        exam_count: exams.len(),
        versions: exams.into_iter().map(|e| e.version).collect(),
        question_count,
        max_row,
        total_points,
        assignments,
        scores: score_totals(conn, subject_id)?,
        adjusts: adjust_totals(conn, subject_id)?,
    })
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ZeroSummary {
    pub score_rows: usize,
    pub adjust_rows: usize,
}

/// Resets every value of the subject to zero; rows stay in place.
pub fn zero_scores(conn: &Connection, subject_id: &str) -> ExamResult<ZeroSummary> {
    let subject = registry::get_subject(conn, subject_id)?;
    let tx = conn.unchecked_transaction()?;
    let score_rows = tx.execute(
        &format!(
            "UPDATE student_exams SET correct = 0, correction = 0
             WHERE exam_id IN ({}) AND (correct <> 0 OR correction <> 0)",
            SUBJECT_EXAMS
        ),
        [subject_id],
    )?;
    let adjust_rows = tx.execute(
        &format!(
            "UPDATE exam_adjusts SET adjust = 0 WHERE exam_id IN ({}) AND adjust <> 0",
            SUBJECT_EXAMS
        ),
        [subject_id],
    )?;
    tx.commit()?;
    info!(subject = %subject.code, score_rows, adjust_rows, "scores zeroed");
    Ok(ZeroSummary {
        score_rows,
        adjust_rows,
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeClear {
    pub subject_id: String,
    pub executed: bool,
    pub forced: bool,
    pub score_rows: i64,
    pub adjust_rows: i64,
    pub violations: Vec<String>,
}

fn runtime_guard(scores: &ScoreTotals, adjusts: &AdjustTotals) -> Vec<String> {
    let mut v = Vec::new();
    if scores.correct > 0 {
        v.push(format!("{} score rows are marked correct", scores.correct));
    }
    if scores.nonzero_corrections > 0 {
        v.push(format!(
            "{} score rows carry a correction",
            scores.nonzero_corrections
        ));
    }
    if adjusts.sum != 0 {
        v.push(format!("adjustments sum to {}", adjusts.sum));
    }
    v
}

/// Deletes score and adjust rows of the subject. Assignments and questions
/// are kept. Without `execute` only the preview is returned.
pub fn clear_runtime_data(
    conn: &Connection,
    subject_id: &str,
    execute: bool,
    force: bool,
) -> ExamResult<RuntimeClear> {
    let subject = registry::get_subject(conn, subject_id)?;
    let scores = score_totals(conn, subject_id)?;
    let adjusts = adjust_totals(conn, subject_id)?;
    let violations = runtime_guard(&scores, &adjusts);

    let mut out = RuntimeClear {
        subject_id: subject.id.clone(),
        executed: false,
        forced: false,
        score_rows: scores.rows,
        adjust_rows: adjusts.rows,
        violations,
    };
    if !execute {
        return Ok(out);
    }
    if !out.violations.is_empty() {
        if !force {
            return Err(ExamError::GuardFailed {
                violations: out.violations,
            });
        }
        warn!(subject = %subject.code, violations = ?out.violations, "runtime clear forced past guard");
        out.forced = true;
    }

    let tx = conn.unchecked_transaction()?;
    tx.execute(
        &format!("DELETE FROM student_exams WHERE exam_id IN ({})", SUBJECT_EXAMS),
        [subject_id],
    )?;
    tx.execute(
        &format!("DELETE FROM exam_adjusts WHERE exam_id IN ({})", SUBJECT_EXAMS),
        [subject_id],
    )?;
    tx.commit()?;
    out.executed = true;
    info!(
        subject = %subject.code,
        score_rows = out.score_rows,
        adjust_rows = out.adjust_rows,
        "runtime data cleared"
    );
    Ok(out)
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectClear {
    pub exams: i64,
    pub questions: i64,
    pub assignments: i64,
    pub score_rows: i64,
    pub adjust_rows: i64,
}

pub fn subject_clear_preview(conn: &Connection, subject: &Subject) -> ExamResult<SubjectClear> {
    let count = |sql: &str| -> rusqlite::Result<i64> {
        conn.query_row(&format!("{} ({})", sql, SUBJECT_EXAMS), [&subject.id], |r| r.get(0))
    };
    Ok(SubjectClear {
        exams: conn.query_row(
            "SELECT COUNT(*) FROM exams WHERE subject_id = ?",
            [&subject.id],
            |r| r.get(0),
        )?,
        questions: count("SELECT COUNT(*) FROM questions WHERE exam_id IN")?,
        assignments: count("SELECT COUNT(*) FROM student_exam_versions WHERE exam_id IN")?,
        score_rows: count("SELECT COUNT(*) FROM student_exams WHERE exam_id IN")?,
        adjust_rows: count("SELECT COUNT(*) FROM exam_adjusts WHERE exam_id IN")?,
    })
}

/// Deletes every exam of the subject and everything beneath it. The subject
/// row itself stays.
pub fn clear_subject_data(conn: &Connection, subject_id: &str) -> ExamResult<SubjectClear> {
    let subject = registry::get_subject(conn, subject_id)?;
    let preview = subject_clear_preview(conn, &subject)?;
    let tx = conn.unchecked_transaction()?;
    tx.execute("DELETE FROM exams WHERE subject_id = ?", [subject_id])?;
    tx.commit()?;
    info!(
        subject = %subject.code,
        exams = preview.exams,
        score_rows = preview.score_rows,
        "subject data cleared"
    );
    Ok(preview)
}

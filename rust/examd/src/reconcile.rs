//! Student -> exam version assignment, and moving a student between versions
//! without losing track of entered scores.

use crate::bulk;
use crate::error::{ExamError, ExamResult};
use crate::registry::{self, Exam};
use crate::roster::{self, AssignmentMap};
use crate::scoring;
use rusqlite::{Connection, OptionalExtension, Row};
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    pub id: String,
    pub student_id: i64,
    pub student_code: String,
    pub nickname: String,
    pub exam_id: String,
    pub version: String,
}

impl Assignment {
    fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: r.get(0)?,
            student_id: r.get(1)?,
            student_code: r.get(2)?,
            nickname: r.get(3)?,
            exam_id: r.get(4)?,
            version: r.get(5)?,
        })
    }
}

const ASSIGNMENT_SELECT: &str = "SELECT v.id, v.student_id, s.code, s.nickname, v.exam_id, e.version
     FROM student_exam_versions v
     JOIN students s ON s.id = v.student_id
     JOIN exams e ON e.id = v.exam_id";

pub fn current_assignment(
    conn: &Connection,
    student_id: i64,
    subject_id: &str,
) -> ExamResult<Option<Assignment>> {
    let sql = format!(
        "{} WHERE v.student_id = ? AND v.subject_id = ?",
        ASSIGNMENT_SELECT
    );
    Ok(conn
        .query_row(&sql, (student_id, subject_id), Assignment::from_row)
        .optional()?)
}

pub fn assignments_for_subject(conn: &Connection, subject_id: &str) -> ExamResult<Vec<Assignment>> {
    let sql = format!("{} WHERE v.subject_id = ? ORDER BY s.code", ASSIGNMENT_SELECT);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([subject_id], Assignment::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Everything a student has on record across all versions of one subject.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PriorScores {
    pub tf_points: i64,
    pub correction: i64,
    pub adjust: i64,
    pub total: i64,
    pub nonzero_values: i64,
}

impl PriorScores {
    pub fn any(&self) -> bool {
        self.nonzero_values > 0
    }
}

pub fn prior_scores(conn: &Connection, student_id: i64, subject_id: &str) -> ExamResult<PriorScores> {
    let (tf_points, correction, nonzero_scores): (i64, i64, i64) = conn.query_row(
        "SELECT COALESCE(SUM(se.correct * q.points), 0),
                COALESCE(SUM(se.correction), 0),
                COALESCE(SUM((se.correct <> 0) + (se.correction <> 0)), 0)
         FROM student_exams se
         JOIN questions q ON q.id = se.question_id
         JOIN exams e ON e.id = se.exam_id
         WHERE se.student_id = ? AND e.subject_id = ?",
        (student_id, subject_id),
        |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
    )?;
    let (adjust, nonzero_adjusts): (i64, i64) = conn.query_row(
        "SELECT COALESCE(SUM(a.adjust), 0), COALESCE(SUM(a.adjust <> 0), 0)
         FROM exam_adjusts a
         JOIN exams e ON e.id = a.exam_id
         WHERE a.student_id = ? AND e.subject_id = ?",
        (student_id, subject_id),
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;
    Ok(PriorScores {
        tf_points,
        correction,
        adjust,
        total: scoring::three_term_total(tf_points, correction, adjust)?,
        nonzero_values: nonzero_scores + nonzero_adjusts,
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignResult {
    pub student_id: i64,
    pub from_version: Option<String>,
    pub to_version: String,
    /// unchanged | assigned | migrated | forced
    pub status: &'static str,
    pub cleared: Option<PriorScores>,
    pub score_rows_created: usize,
}

/// Moves a student to `target_version`. Entered scores block the move unless
/// `force` is set, in which case they are zeroed first.
pub fn assign_version(
    conn: &Connection,
    subject_id: &str,
    student_id: i64,
    target_version: &str,
    force: bool,
) -> ExamResult<AssignResult> {
    registry::get_subject(conn, subject_id)?;
    let student = roster::get_student(conn, student_id)?;
    let target = registry::exam_by_version(conn, subject_id, target_version)?.ok_or_else(|| {
        ExamError::not_found_with(
            "exam version",
            json!({ "subjectId": subject_id, "version": target_version }),
        )
    })?;

    let current = current_assignment(conn, student_id, subject_id)?;
    let from_version = current.as_ref().map(|a| a.version.clone());
    if current.as_ref().map(|a| a.exam_id.as_str()) == Some(target.id.as_str()) {
        return Ok(AssignResult {
            student_id,
            from_version,
            to_version: target.version,
            status: "unchanged",
            cleared: None,
            score_rows_created: 0,
        });
    }

    let prior = prior_scores(conn, student_id, subject_id)?;
    if prior.any() && !force {
        return Err(ExamError::ScoresPresent {
            total: prior.total,
            details: json!({
                "studentId": student_id,
                "studentCode": student.code,
                "fromVersion": from_version,
                "toVersion": target.version,
                "tfPoints": prior.tf_points,
                "correction": prior.correction,
                "adjust": prior.adjust,
                "total": prior.total,
                "nonzeroValues": prior.nonzero_values,
            }),
        });
    }

    let tx = conn.unchecked_transaction()?;
    if prior.any() {
        warn!(
            student = %student.code,
            total = prior.total,
            "force reassignment: zeroing entered scores"
        );
        zero_student_scores(&tx, student_id, subject_id)?;
    }
    let created = migrate_assignment(&tx, subject_id, student_id, &target)?;
    tx.commit()?;

    let status = match (&current, prior.any()) {
        (None, _) => "assigned",
        (Some(_), true) => "forced",
        (Some(_), false) => "migrated",
    };
    info!(
        student = %student.code,
        from = ?from_version,
        to = %target.version,
        status,
        "assignment changed"
    );

    Ok(AssignResult {
        student_id,
        from_version,
        to_version: target.version,
        status,
        cleared: prior.any().then_some(prior),
        score_rows_created: created,
    })
}

fn zero_student_scores(conn: &Connection, student_id: i64, subject_id: &str) -> ExamResult<()> {
    conn.execute(
        "UPDATE student_exams SET correct = 0, correction = 0
         WHERE student_id = ? AND exam_id IN (SELECT id FROM exams WHERE subject_id = ?)",
        (student_id, subject_id),
    )?;
    conn.execute(
        "UPDATE exam_adjusts SET adjust = 0
         WHERE student_id = ? AND exam_id IN (SELECT id FROM exams WHERE subject_id = ?)",
        (student_id, subject_id),
    )?;
    Ok(())
}

/// Points the assignment at `target` and brings the student's rows along.
/// Callers guarantee the rows under other versions hold only zeros.
/// Returns the number of score rows created for the target exam.
pub(crate) fn migrate_assignment(
    conn: &Connection,
    subject_id: &str,
    student_id: i64,
    target: &Exam,
) -> ExamResult<usize> {
    conn.execute(
        "INSERT INTO student_exam_versions(id, student_id, subject_id, exam_id)
         VALUES(?, ?, ?, ?)
         ON CONFLICT(student_id, subject_id) DO UPDATE SET exam_id = excluded.exam_id",
        (Uuid::new_v4().to_string(), student_id, subject_id, &target.id),
    )?;
    conn.execute(
        "DELETE FROM student_exams
         WHERE student_id = ?
           AND exam_id IN (SELECT id FROM exams WHERE subject_id = ? AND id <> ?)",
        (student_id, subject_id, &target.id),
    )?;
    conn.execute(
        "DELETE FROM exam_adjusts
         WHERE student_id = ?
           AND exam_id IN (SELECT id FROM exams WHERE subject_id = ? AND id <> ?)",
        (student_id, subject_id, &target.id),
    )?;
    let created = bulk::ensure_student_score_rows(conn, student_id, &target.id)?;
    bulk::ensure_student_adjust_row(conn, student_id, &target.id)?;
    Ok(created)
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentLoad {
    pub created: usize,
    pub unchanged: usize,
    pub conflicts: usize,
    pub warnings: Vec<serde_json::Value>,
}

/// Applies the part of an assignment map that matches the subject's fiscal
/// year and grade. Existing assignments to another version are never moved
/// here; that goes through `assign_version`.
pub fn load_assignments(
    conn: &Connection,
    subject_id: &str,
    map: &AssignmentMap,
) -> ExamResult<AssignmentLoad> {
    let subject = registry::get_subject(conn, subject_id)?;
    let mut out = AssignmentLoad::default();

    let Some(versions) = map
        .get(&subject.fsyear)
        .and_then(|grades| grades.get(&subject.grade_level))
    else {
        out.warnings.push(json!({
            "code": "no_entries",
            "message": format!(
                "no assignments for fsyear {} grade {}",
                subject.fsyear, subject.grade_level
            ),
        }));
        return Ok(out);
    };

    let tx = conn.unchecked_transaction()?;
    for (version, codes) in versions {
        let Some(exam) = registry::exam_by_version(&tx, subject_id, version)? else {
            warn!(version = %version, "assignment map names an unknown version");
            out.warnings.push(json!({
                "code": "missing_exam",
                "version": version,
                "message": "no exam for this version",
            }));
            continue;
        };
        for code in codes {
            let Some(student) = roster::find_student_by_code(&tx, code)? else {
                out.warnings.push(json!({
                    "code": "missing_student",
                    "studentCode": code,
                    "message": "student not in roster",
                }));
                continue;
            };
            match current_assignment(&tx, student.id, subject_id)? {
                Some(a) if a.exam_id == exam.id => out.unchanged += 1,
                Some(a) => {
                    out.conflicts += 1;
                    out.warnings.push(json!({
                        "code": "assigned_elsewhere",
                        "studentCode": code,
                        "currentVersion": a.version,
                        "requestedVersion": version,
                        "message": "already assigned to another version; use versions.assign",
                    }));
                }
                None => {
                    tx.execute(
                        "INSERT INTO student_exam_versions(id, student_id, subject_id, exam_id)
                         VALUES(?, ?, ?, ?)",
                        (Uuid::new_v4().to_string(), student.id, subject_id, &exam.id),
                    )?;
                    out.created += 1;
                }
            }
        }
    }
    tx.commit()?;

    info!(
        subject = %subject.code,
        created = out.created,
        conflicts = out.conflicts,
        "assignments loaded"
    );
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{seed, Seeded};

    fn set_score(conn: &Connection, s: &Seeded, student_id: i64, version: &str, idx: usize, correct: i64, correction: i64) {
        let exam = s.exam(version);
        let q = &s.questions[version][idx];
        conn.execute(
            "UPDATE student_exams SET correct = ?, correction = ?
             WHERE student_id = ? AND exam_id = ? AND question_id = ?",
            (correct, correction, student_id, &exam.id, &q.id),
        )
        .expect("update score");
    }

    fn table_snapshot(conn: &Connection) -> Vec<String> {
        let mut out = Vec::new();
        for sql in [
            "SELECT student_id || ':' || exam_id FROM student_exam_versions ORDER BY 1",
            "SELECT student_id || ':' || exam_id || ':' || question_id || ':' || correct || ':' || correction FROM student_exams ORDER BY 1",
            "SELECT student_id || ':' || exam_id || ':' || adjust FROM exam_adjusts ORDER BY 1",
            "SELECT id || ':' || exam_id || ':' || label FROM questions ORDER BY 1",
        ] {
            let mut stmt = conn.prepare(sql).expect("prepare");
            let rows = stmt
                .query_map([], |r| r.get::<_, String>(0))
                .expect("query")
                .collect::<Result<Vec<_>, _>>()
                .expect("rows");
            out.extend(rows);
        }
        out
    }

    #[test]
    fn zero_scored_student_moves_without_force() {
        let (conn, s) = seed();
        let r = assign_version(&conn, &s.subject.id, 1, "B", false).expect("assign");
        assert_eq!(r.status, "migrated");
        assert_eq!(r.from_version.as_deref(), Some("A"));
        assert_eq!(r.score_rows_created, s.questions["B"].len());

        let a = current_assignment(&conn, 1, &s.subject.id).expect("q").expect("assigned");
        assert_eq!(a.version, "B");
        let stray: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM student_exams se JOIN questions q ON q.id = se.question_id
                 WHERE se.student_id = 1 AND q.exam_id <> se.exam_id",
                [],
                |r| r.get(0),
            )
            .expect("count");
        assert_eq!(stray, 0);
        let adjust_exam: String = conn
            .query_row("SELECT exam_id FROM exam_adjusts WHERE student_id = 1", [], |r| r.get(0))
            .expect("adjust row");
        assert_eq!(adjust_exam, s.exam("B").id);
    }

    #[test]
    fn scored_student_is_rejected_and_nothing_changes() {
        let (conn, s) = seed();
        set_score(&conn, &s, 1, "A", 0, 1, 0);
        let before = table_snapshot(&conn);

        let e = assign_version(&conn, &s.subject.id, 1, "B", false).expect_err("must reject");
        assert_eq!(e.code(), "scores_present");
        match e {
            ExamError::ScoresPresent { total, .. } => assert_eq!(total, 2),
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(table_snapshot(&conn), before);
    }

    #[test]
    fn nonzero_values_that_cancel_out_still_block() {
        let (conn, s) = seed();
        set_score(&conn, &s, 1, "A", 0, 1, -2);
        let e = assign_version(&conn, &s.subject.id, 1, "B", false).expect_err("must reject");
        assert_eq!(e.code(), "scores_present");
    }

    #[test]
    fn force_zeroes_then_moves() {
        let (conn, s) = seed();
        set_score(&conn, &s, 1, "A", 0, 1, 3);
        conn.execute("UPDATE exam_adjusts SET adjust = 4 WHERE student_id = 1", [])
            .expect("adjust");

        let r = assign_version(&conn, &s.subject.id, 1, "B", true).expect("forced");
        assert_eq!(r.status, "forced");
        assert_eq!(r.cleared.expect("cleared").total, 2 + 3 + 4);
        assert_eq!(prior_scores(&conn, 1, &s.subject.id).expect("prior").total, 0);
        assert!(!prior_scores(&conn, 1, &s.subject.id).expect("prior").any());
    }

    #[test]
    fn same_version_is_a_noop() {
        let (conn, s) = seed();
        set_score(&conn, &s, 1, "A", 0, 1, 0);
        let r = assign_version(&conn, &s.subject.id, 1, "A", false).expect("noop");
        assert_eq!(r.status, "unchanged");
    }

    #[test]
    fn unknown_version_is_not_found() {
        let (conn, s) = seed();
        let e = assign_version(&conn, &s.subject.id, 1, "Z", true).expect_err("unknown");
        assert_eq!(e.code(), "not_found");
    }

    #[test]
    fn assignment_map_skips_students_assigned_elsewhere() {
        let (conn, s) = seed();
        let map = roster::parse_assignment_yaml(
            "2025:\n  1:\n    A: [\"25367001\"]\n    B: [\"25367002\", \"99999999\"]\n",
        )
        .expect("yaml");
        let r = load_assignments(&conn, &s.subject.id, &map).expect("load");
        assert_eq!(r.unchanged, 1);
        assert_eq!(r.conflicts, 1);
        assert_eq!(r.created, 0);
        assert_eq!(r.warnings.len(), 2);
    }
}

//! Subjects, exam versions and their ordered question lists.

use crate::error::{ExamError, ExamResult};
use anyhow::Context;
use rusqlite::{Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::Path;
use tracing::{info, warn};
use uuid::Uuid;

const HASH_LEN: usize = 32;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Subject {
    pub id: String,
    pub code: String,
    pub fsyear: i64,
    pub term: i64,
    pub name: String,
    pub grade_level: i64,
}

impl Subject {
    /// Entry year of the cohort that sits this subject.
    pub fn cohort_entry_year(&self) -> i64 {
        self.fsyear - self.grade_level + 1
    }

    fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: r.get(0)?,
            code: r.get(1)?,
            fsyear: r.get(2)?,
            term: r.get(3)?,
            name: r.get(4)?,
            grade_level: r.get(5)?,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Exam {
    pub id: String,
    pub subject_id: String,
    pub version: String,
    pub title: String,
    pub problem_hash: Option<String>,
    pub adjust_comment: String,
}

impl Exam {
    fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: r.get(0)?,
            subject_id: r.get(1)?,
            version: r.get(2)?,
            title: r.get(3)?,
            problem_hash: r.get(4)?,
            adjust_comment: r.get(5)?,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Question {
    pub id: String,
    pub exam_id: String,
    pub row: i64,
    pub col: i64,
    pub label: String,
    pub category: String,
    pub points: i64,
    pub answer: String,
    pub width: i64,
    pub height: i64,
}

const SUBJECT_COLS: &str = "id, code, fsyear, term, name, grade_level";
const EXAM_COLS: &str = "id, subject_id, version, title, problem_hash, adjust_comment";

pub fn get_subject(conn: &Connection, subject_id: &str) -> ExamResult<Subject> {
    let sql = format!("SELECT {} FROM subjects WHERE id = ?", SUBJECT_COLS);
    conn.query_row(&sql, [subject_id], Subject::from_row)
        .optional()?
        .ok_or_else(|| ExamError::not_found_with("subject", json!({ "subjectId": subject_id })))
}

pub fn find_subject(conn: &Connection, code: &str, fsyear: i64) -> ExamResult<Option<Subject>> {
    let sql = format!(
        "SELECT {} FROM subjects WHERE code = ? AND fsyear = ?",
        SUBJECT_COLS
    );
    Ok(conn
        .query_row(&sql, (code, fsyear), Subject::from_row)
        .optional()?)
}

pub fn list_subjects(conn: &Connection, fsyear: Option<i64>) -> ExamResult<Vec<Subject>> {
    let sql = format!(
        "SELECT {} FROM subjects WHERE (?1 IS NULL OR fsyear = ?1) ORDER BY fsyear, code",
        SUBJECT_COLS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([fsyear], Subject::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn get_exam(conn: &Connection, exam_id: &str) -> ExamResult<Exam> {
    let sql = format!("SELECT {} FROM exams WHERE id = ?", EXAM_COLS);
    conn.query_row(&sql, [exam_id], Exam::from_row)
        .optional()?
        .ok_or_else(|| ExamError::not_found_with("exam", json!({ "examId": exam_id })))
}

pub fn list_exams(conn: &Connection, subject_id: &str) -> ExamResult<Vec<Exam>> {
    let sql = format!(
        "SELECT {} FROM exams WHERE subject_id = ? ORDER BY version",
        EXAM_COLS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([subject_id], Exam::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn exam_by_version(
    conn: &Connection,
    subject_id: &str,
    version: &str,
) -> ExamResult<Option<Exam>> {
    let sql = format!(
        "SELECT {} FROM exams WHERE subject_id = ? AND version = ?",
        EXAM_COLS
    );
    Ok(conn
        .query_row(&sql, (subject_id, version), Exam::from_row)
        .optional()?)
}

/// Questions in interchange order: (row, col, insertion order).
pub fn ordered_questions(conn: &Connection, exam_id: &str) -> ExamResult<Vec<Question>> {
    let mut stmt = conn.prepare(
        "SELECT id, exam_id, row_no, col_no, label, category, points, answer, width, height
         FROM questions
         WHERE exam_id = ?
         ORDER BY row_no, col_no, rowid",
    )?;
    let rows = stmt
        .query_map([exam_id], |r| {
            Ok(Question {
                id: r.get(0)?,
                exam_id: r.get(1)?,
                row: r.get(2)?,
                col: r.get(3)?,
                label: r.get(4)?,
                category: r.get(5)?,
                points: r.get(6)?,
                answer: r.get(7)?,
                width: r.get(8)?,
                height: r.get(9)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn get_comment(conn: &Connection, subject_id: &str) -> ExamResult<String> {
    get_subject(conn, subject_id)?;
    let comment: Option<String> = conn
        .query_row(
            "SELECT adjust_comment FROM exams WHERE subject_id = ? ORDER BY version LIMIT 1",
            [subject_id],
            |r| r.get(0),
        )
        .optional()?;
    Ok(comment.unwrap_or_default())
}

/// The adjust comment is per subject; every version carries the same text.
pub fn set_comment(conn: &Connection, subject_id: &str, comment: &str) -> ExamResult<usize> {
    get_subject(conn, subject_id)?;
    let n = conn.execute(
        "UPDATE exams SET adjust_comment = ? WHERE subject_id = ?",
        (comment, subject_id),
    )?;
    Ok(n)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamDefinition {
    pub subject: SubjectDef,
    pub versions: Vec<VersionDef>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectDef {
    pub code: String,
    pub fsyear: i64,
    #[serde(default)]
    pub term: Option<i64>,
    pub name: String,
    #[serde(default = "one")]
    pub grade_level: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionDef {
    pub version: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub hash: Option<String>,
    pub rows: Vec<Vec<QuestionDef>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionDef {
    pub label: String,
    #[serde(default = "one")]
    pub points: i64,
    #[serde(default)]
    pub answer: String,
    #[serde(default)]
    pub category: String,
    #[serde(default = "one")]
    pub width: i64,
    #[serde(default = "one")]
    pub height: i64,
}

fn one() -> i64 {
    1
}

impl VersionDef {
    /// Flattened (row, col, question) triples, both 1-based.
    fn positioned(&self) -> Vec<(i64, i64, &QuestionDef)> {
        let mut out = Vec::new();
        for (ri, row) in self.rows.iter().enumerate() {
            for (ci, q) in row.iter().enumerate() {
                out.push(((ri + 1) as i64, (ci + 1) as i64, q));
            }
        }
        out
    }
}

pub fn content_hash<'a, I>(items: I) -> String
where
    I: IntoIterator<Item = (i64, i64, &'a str, i64, &'a str)>,
{
    let mut hasher = Sha256::new();
    for (row, col, label, points, answer) in items {
        hasher.update(format!("{}\t{}\t{}\t{}\t{}\n", row, col, label.trim(), points, answer).as_bytes());
    }
    let hex = format!("{:x}", hasher.finalize());
    hex[..HASH_LEN].to_string()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LoadOptions {
    pub update_subject: bool,
    pub update_hash: bool,
    pub replace_questions: bool,
    /// Used when the definition omits `subject.term`.
    pub default_term: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionLoad {
    pub version: String,
    pub exam_id: String,
    pub exam_created: bool,
    pub hash: String,
    /// One of: created, filled, kept, updated, conflict.
    pub hash_status: &'static str,
    pub questions_created: usize,
    pub questions_unchanged: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadSummary {
    pub subject_id: String,
    pub subject_created: bool,
    pub subject_updated: bool,
    pub versions: Vec<VersionLoad>,
}

pub fn read_definition(path: &Path) -> ExamResult<ExamDefinition> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read definition {}", path.to_string_lossy()))?;
    serde_json::from_str(&text).map_err(|e| ExamError::BadDocument(e.to_string()))
}

fn validate_definition(def: &ExamDefinition) -> ExamResult<()> {
    if def.subject.code.trim().is_empty() {
        return Err(ExamError::BadParams("subject.code is empty".into()));
    }
    if def.subject.grade_level < 1 {
        return Err(ExamError::BadParams("subject.gradeLevel must be >= 1".into()));
    }
    if def.versions.is_empty() {
        return Err(ExamError::BadParams("definition has no versions".into()));
    }
    let mut seen = HashSet::new();
    for v in &def.versions {
        let name = v.version.trim();
        if name.is_empty() {
            return Err(ExamError::BadParams("versions[].version is empty".into()));
        }
        if !seen.insert(name.to_string()) {
            return Err(ExamError::BadParams(format!("duplicate version {}", name)));
        }
        if v.rows.iter().all(|r| r.is_empty()) {
            return Err(ExamError::BadParams(format!("version {} has no questions", name)));
        }
    }
    Ok(())
}

pub fn load_definition(
    conn: &Connection,
    def: &ExamDefinition,
    opts: LoadOptions,
) -> ExamResult<LoadSummary> {
    validate_definition(def)?;
    let sd = &def.subject;
    let code = sd.code.trim();

    let tx = conn.unchecked_transaction()?;

    let (subject, subject_created) = match find_subject(&tx, code, sd.fsyear)? {
        Some(s) => (s, false),
        None => {
            let term = sd.term.or(opts.default_term).ok_or_else(|| {
                ExamError::BadParams("subject.term missing and no default term configured".into())
            })?;
            let id = Uuid::new_v4().to_string();
            tx.execute(
                "INSERT INTO subjects(id, code, fsyear, term, name, grade_level)
                 VALUES(?, ?, ?, ?, ?, ?)",
                (&id, code, sd.fsyear, term, &sd.name, sd.grade_level),
            )?;
            (get_subject(&tx, &id)?, true)
        }
    };

    let mut subject_updated = false;
    if !subject_created && opts.update_subject {
        let term = sd.term.unwrap_or(subject.term);
        let changed = subject.name != sd.name
            || subject.term != term
            || subject.grade_level != sd.grade_level;
        if changed {
            tx.execute(
                "UPDATE subjects SET name = ?, term = ?, grade_level = ? WHERE id = ?",
                (&sd.name, term, sd.grade_level, &subject.id),
            )?;
            subject_updated = true;
        }
    }

    let mut versions = Vec::new();
    for vdef in &def.versions {
        versions.push(load_version(&tx, &subject.id, &sd.name, vdef, opts)?);
    }

    tx.commit()?;

    info!(
        subject = code,
        fsyear = sd.fsyear,
        subject_created,
        versions = versions.len(),
        "exam definition loaded"
    );

    Ok(LoadSummary {
        subject_id: subject.id,
        subject_created,
        subject_updated,
        versions,
    })
}

fn load_version(
    conn: &Connection,
    subject_id: &str,
    subject_name: &str,
    vdef: &VersionDef,
    opts: LoadOptions,
) -> ExamResult<VersionLoad> {
    let version = vdef.version.trim();
    let positioned = vdef.positioned();
    let hash = vdef
        .hash
        .as_deref()
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| {
            content_hash(
                positioned
                    .iter()
                    .map(|(r, c, q)| (*r, *c, q.label.as_str(), q.points, q.answer.as_str())),
            )
        });
    let title = vdef
        .title
        .clone()
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| subject_name.to_string());

    let (exam, exam_created) = match exam_by_version(conn, subject_id, version)? {
        Some(e) => (e, false),
        None => {
            let id = Uuid::new_v4().to_string();
            conn.execute(
                "INSERT INTO exams(id, subject_id, version, title, problem_hash, adjust_comment)
                 VALUES(?, ?, ?, ?, ?, '')",
                (&id, subject_id, version, &title, &hash),
            )?;
            (get_exam(conn, &id)?, true)
        }
    };

    let hash_status = if exam_created {
        "created"
    } else {
        match exam.problem_hash.as_deref().filter(|h| !h.is_empty()) {
            None => {
                conn.execute(
                    "UPDATE exams SET problem_hash = ? WHERE id = ?",
                    (&hash, &exam.id),
                )?;
                "filled"
            }
            Some(stored) if stored == hash => "kept",
            Some(stored) if opts.update_hash => {
                warn!(version, old = stored, new = %hash, "problem hash replaced");
                conn.execute(
                    "UPDATE exams SET problem_hash = ? WHERE id = ?",
                    (&hash, &exam.id),
                )?;
                "updated"
            }
            Some(stored) => {
                warn!(version, stored, incoming = %hash, "problem hash differs; kept stored value");
                "conflict"
            }
        }
    };

    let existing = ordered_questions(conn, &exam.id)?;
    let same_questions = existing.len() == positioned.len()
        && existing.iter().zip(positioned.iter()).all(|(e, (r, c, q))| {
            e.row == *r
                && e.col == *c
                && e.label == q.label.trim()
                && e.points == q.points
                && e.answer == q.answer
        });

    if same_questions {
        return Ok(VersionLoad {
            version: version.to_string(),
            exam_id: exam.id,
            exam_created,
            hash,
            hash_status,
            questions_created: 0,
            questions_unchanged: true,
        });
    }

    if !existing.is_empty() {
        if !opts.replace_questions {
            return Err(ExamError::BadParams(format!(
                "version {} already has {} questions; pass replaceQuestions to rebuild them",
                version,
                existing.len()
            )));
        }
        let scored: i64 = conn.query_row(
            "SELECT COUNT(*) FROM student_exams WHERE exam_id = ?",
            [&exam.id],
            |r| r.get(0),
        )?;
        if scored > 0 {
            return Err(ExamError::GuardFailed {
                violations: vec![format!(
                    "version {} has {} scoring rows; clear runtime data before replacing questions",
                    version, scored
                )],
            });
        }
        conn.execute("DELETE FROM questions WHERE exam_id = ?", [&exam.id])?;
    }

    let mut insert = conn.prepare(
        "INSERT INTO questions(id, exam_id, row_no, col_no, label, category, points, answer, width, height)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )?;
    for (row, col, q) in &positioned {
        insert.execute((
            Uuid::new_v4().to_string(),
            &exam.id,
            row,
            col,
            q.label.trim(),
            q.category.trim(),
            q.points,
            &q.answer,
            q.width.max(1),
            q.height.max(1),
        ))?;
    }

    Ok(VersionLoad {
        version: version.to_string(),
        exam_id: exam.id,
        exam_created,
        hash,
        hash_status,
        questions_created: positioned.len(),
        questions_unchanged: false,
    })
}

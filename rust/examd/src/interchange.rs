//! JSON score interchange. Exports carry the question order and content hash
//! of every version so an import can prove it targets the same exams.

use crate::backup::SnapshotExam;
use crate::error::{ExamError, ExamResult};
use crate::reconcile;
use crate::registry::{self, Exam, Question};
use crate::roster;
use crate::scoring;
use anyhow::Context;
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Document {
    #[serde(default)]
    pub meta: Meta,
    #[serde(default)]
    pub subjects: BTreeMap<String, SubjectBlock>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Meta {
    #[serde(default)]
    pub exported_at: String,
    #[serde(default)]
    pub tool_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubjectBlock {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub fsyear: Option<i64>,
    #[serde(default)]
    pub term: Option<i64>,
    #[serde(default)]
    pub exams: BTreeMap<String, ExamBlock>,
    #[serde(default)]
    pub students: BTreeMap<String, StudentBlock>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExamBlock {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub question_order: Vec<QuestionRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionRef {
    pub row: i64,
    pub col: i64,
    pub label: String,
}

impl QuestionRef {
    fn of(q: &Question) -> Self {
        Self {
            row: q.row,
            col: q.col,
            label: q.label.trim().to_string(),
        }
    }

    fn matches(&self, q: &Question) -> bool {
        self.row == q.row && self.col == q.col && self.label.trim() == q.label.trim()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudentBlock {
    #[serde(default)]
    pub nickname: String,
    pub version: String,
    #[serde(default)]
    pub answers: Vec<Answer>,
    #[serde(default)]
    pub adjustment: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Answer {
    pub correctness: i64,
    #[serde(default)]
    pub correction: i64,
}

pub fn read_document(path: &Path) -> ExamResult<Document> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.to_string_lossy()))?;
    serde_json::from_str(&text).map_err(|e| ExamError::BadDocument(e.to_string()))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExportOptions {
    pub fill_missing: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportSummary {
    pub subject_code: String,
    pub fsyear: i64,
    pub exams: usize,
    pub students: usize,
    pub filled_missing: usize,
}

/// Scores of `(student_id, exam_id)` keyed by question id.
fn score_map(
    conn: &Connection,
    student_id: i64,
    exam_id: &str,
) -> ExamResult<HashMap<String, (String, i64, i64)>> {
    let mut stmt = conn.prepare_cached(
        "SELECT question_id, id, correct, correction FROM student_exams
         WHERE student_id = ? AND exam_id = ?",
    )?;
    let mut out = HashMap::new();
    let rows = stmt.query_map((student_id, exam_id), |r| {
        Ok((r.get::<_, String>(0)?, (r.get(1)?, r.get(2)?, r.get(3)?)))
    })?;
    for row in rows {
        let (qid, v) = row?;
        out.insert(qid, v);
    }
    Ok(out)
}

fn adjust_value(conn: &Connection, student_id: i64, exam_id: &str) -> ExamResult<Option<i64>> {
    Ok(conn
        .query_row(
            "SELECT adjust FROM exam_adjusts WHERE student_id = ? AND exam_id = ?",
            (student_id, exam_id),
            |r| r.get(0),
        )
        .optional()?)
}

pub fn export_subject(
    conn: &Connection,
    subject_id: &str,
    opts: ExportOptions,
) -> ExamResult<(SubjectBlock, ExportSummary)> {
    let subject = registry::get_subject(conn, subject_id)?;

    let mut exams = BTreeMap::new();
    let mut questions: HashMap<String, Vec<Question>> = HashMap::new();
    for exam in registry::list_exams(conn, subject_id)? {
        let qs = registry::ordered_questions(conn, &exam.id)?;
        exams.insert(
            exam.version.clone(),
            ExamBlock {
                title: exam.title.clone(),
                hash: exam.problem_hash.clone(),
                question_order: qs.iter().map(QuestionRef::of).collect(),
            },
        );
        questions.insert(exam.id, qs);
    }

    let mut students = BTreeMap::new();
    let mut filled_missing = 0;
    for a in reconcile::assignments_for_subject(conn, subject_id)? {
        let qs = questions.get(&a.exam_id).map(Vec::as_slice).unwrap_or(&[]);
        let scores = score_map(conn, a.student_id, &a.exam_id)?;
        let missing = qs.iter().filter(|q| !scores.contains_key(&q.id)).count();
        if missing > 0 {
            if !opts.fill_missing {
                return Err(ExamError::IncompleteRows(
                    format!(
                        "student {} is missing {} score rows; run scores.ensureRows or pass fillMissing",
                        a.student_code, missing
                    ),
                    json!({
                        "studentCode": a.student_code,
                        "version": a.version,
                        "missing": missing,
                        "expected": qs.len(),
                    }),
                ));
            }
            filled_missing += missing;
        }
        let answers = qs
            .iter()
            .map(|q| match scores.get(&q.id) {
                Some((_, correct, correction)) => Answer {
                    correctness: *correct,
                    correction: *correction,
                },
                None => Answer {
                    correctness: 0,
                    correction: 0,
                },
            })
            .collect();
        let adjustment = adjust_value(conn, a.student_id, &a.exam_id)?.unwrap_or(0);
        students.insert(
            a.student_code,
            StudentBlock {
                nickname: a.nickname,
                version: a.version,
                answers,
                adjustment,
            },
        );
    }

    let summary = ExportSummary {
        subject_code: subject.code.clone(),
        fsyear: subject.fsyear,
        exams: exams.len(),
        students: students.len(),
        filled_missing,
    };
    let block = SubjectBlock {
        name: subject.name,
        fsyear: Some(subject.fsyear),
        term: Some(subject.term),
        exams,
        students,
    };
    Ok((block, summary))
}

/// Merges one subject block into the document at `path` (created when
/// absent) and refreshes `meta`.
pub fn write_export(
    path: &Path,
    subject_code: &str,
    block: SubjectBlock,
    tool_version: &str,
) -> ExamResult<Document> {
    let mut doc = if path.exists() {
        read_document(path)?
    } else {
        Document::default()
    };
    doc.subjects.insert(subject_code.to_string(), block);
    doc.meta = Meta {
        exported_at: chrono::Utc::now().to_rfc3339(),
        tool_version: tool_version.to_string(),
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.to_string_lossy()))?;
    }
    let text = serde_json::to_string_pretty(&doc)?;
    std::fs::write(path, text)
        .with_context(|| format!("failed to write {}", path.to_string_lossy()))?;
    Ok(doc)
}

/// Every subject of the workspace, one document per fiscal year, with
/// missing rows exported as zeros.
pub fn snapshot_documents(
    conn: &Connection,
    tool_version: &str,
) -> ExamResult<BTreeMap<i64, Document>> {
    let exported_at = chrono::Utc::now().to_rfc3339();
    let mut out: BTreeMap<i64, Document> = BTreeMap::new();
    for subject in registry::list_subjects(conn, None)? {
        let (block, _) = export_subject(conn, &subject.id, ExportOptions { fill_missing: true })?;
        let doc = out.entry(subject.fsyear).or_insert_with(|| Document {
            meta: Meta {
                exported_at: exported_at.clone(),
                tool_version: tool_version.to_string(),
            },
            subjects: BTreeMap::new(),
        });
        doc.subjects.insert(subject.code, block);
    }
    Ok(out)
}

/// Result of comparing a restored database with the snapshot of its bundle.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotCheck {
    pub exams: usize,
    pub matched: usize,
    pub mismatched: Vec<Value>,
    pub missing: Vec<Value>,
}

pub fn check_snapshot(conn: &Connection, exams: &[SnapshotExam]) -> ExamResult<SnapshotCheck> {
    let mut out = SnapshotCheck {
        exams: exams.len(),
        ..SnapshotCheck::default()
    };
    for se in exams {
        let key = json!({
            "fsyear": se.fsyear,
            "subjectCode": se.subject_code,
            "version": se.version,
        });
        let exam = match registry::find_subject(conn, &se.subject_code, se.fsyear)? {
            Some(subject) => registry::exam_by_version(conn, &subject.id, &se.version)?,
            None => None,
        };
        let Some(exam) = exam else {
            out.missing.push(key);
            continue;
        };
        if normalized_hash(exam.problem_hash.as_deref()) == normalized_hash(se.hash.as_deref()) {
            out.matched += 1;
        } else {
            out.mismatched.push(json!({
                "exam": key,
                "snapshot": se.hash,
                "stored": exam.problem_hash,
            }));
        }
    }
    if !out.mismatched.is_empty() || !out.missing.is_empty() {
        warn!(
            mismatched = out.mismatched.len(),
            missing = out.missing.len(),
            "restored database differs from bundle snapshot"
        );
    }
    Ok(out)
}

#[derive(Debug, Clone, Default)]
pub struct ImportOptions {
    pub ignore_hash: bool,
    pub ignore_order: bool,
    pub student_codes: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedStudent {
    pub student_id: i64,
    pub student_code: String,
    pub version: String,
    pub from_version: Option<String>,
    #[serde(skip)]
    exam: Exam,
    #[serde(skip)]
    question_ids: Vec<String>,
    #[serde(skip)]
    answers: Vec<Answer>,
    #[serde(skip)]
    adjustment: i64,
    #[serde(skip)]
    needs_migration: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportPlan {
    pub subject_id: String,
    pub subject_code: String,
    pub overrides: Vec<Value>,
    pub students: Vec<PlannedStudent>,
}

fn normalized_hash(h: Option<&str>) -> Option<&str> {
    h.map(str::trim).filter(|h| !h.is_empty())
}

/// Validates the file against the database. Nothing is written.
pub fn plan_import(
    conn: &Connection,
    doc: &Document,
    subject_code: &str,
    opts: &ImportOptions,
) -> ExamResult<ImportPlan> {
    let Some(block) = doc.subjects.get(subject_code) else {
        return Err(ExamError::BadDocument(format!(
            "subject {} is not in the file",
            subject_code
        )));
    };
    let Some(fsyear) = block.fsyear else {
        return Err(ExamError::BadDocument(format!(
            "subject {} has no fsyear",
            subject_code
        )));
    };
    let subject = registry::find_subject(conn, subject_code, fsyear)?.ok_or_else(|| {
        ExamError::not_found_with("subject", json!({ "code": subject_code, "fsyear": fsyear }))
    })?;

    let mut overrides = Vec::new();
    let mut targets: HashMap<&str, (Exam, Vec<Question>)> = HashMap::new();
    for (version, eb) in &block.exams {
        let exam = registry::exam_by_version(conn, &subject.id, version)?.ok_or_else(|| {
            ExamError::not_found_with(
                "exam version",
                json!({ "subjectCode": subject_code, "version": version }),
            )
        })?;

        let stored = normalized_hash(exam.problem_hash.as_deref());
        let incoming = normalized_hash(eb.hash.as_deref());
        if stored != incoming {
            if !opts.ignore_hash {
                return Err(ExamError::HashMismatch {
                    version: version.clone(),
                    stored: stored.map(str::to_string),
                    incoming: incoming.map(str::to_string),
                });
            }
            warn!(version = %version, ?stored, ?incoming, "importing past problem hash mismatch");
            overrides.push(json!({
                "kind": "ignore_hash",
                "version": version,
                "stored": stored,
                "incoming": incoming,
            }));
        }

        let questions = registry::ordered_questions(conn, &exam.id)?;
        if questions.len() != eb.question_order.len() {
            return Err(ExamError::QuestionCountMismatch {
                version: version.clone(),
                stored: questions.len(),
                incoming: eb.question_order.len(),
            });
        }
        let first_diff = eb
            .question_order
            .iter()
            .zip(questions.iter())
            .position(|(r, q)| !r.matches(q));
        if let Some(position) = first_diff {
            let stored = serde_json::to_value(QuestionRef::of(&questions[position]))?;
            let incoming = serde_json::to_value(&eb.question_order[position])?;
            if !opts.ignore_order {
                return Err(ExamError::OrderMismatch {
                    version: version.clone(),
                    position,
                    stored,
                    incoming,
                });
            }
            warn!(version = %version, position, "importing past question order mismatch");
            overrides.push(json!({
                "kind": "ignore_order",
                "version": version,
                "position": position,
                "stored": stored,
                "incoming": incoming,
            }));
        }
        targets.insert(version.as_str(), (exam, questions));
    }

    let filter: Option<HashSet<&str>> = opts
        .student_codes
        .as_ref()
        .map(|codes| codes.iter().map(String::as_str).collect());
    let selected: Vec<(&String, &StudentBlock)> = block
        .students
        .iter()
        .filter(|(code, _)| filter.as_ref().map_or(true, |f| f.contains(code.as_str())))
        .collect();
    if selected.is_empty() {
        return Err(ExamError::BadParams(
            "no students to import after filtering".into(),
        ));
    }

    let mut students = Vec::with_capacity(selected.len());
    for (code, sb) in selected {
        let student = roster::find_student_by_code(conn, code)?.ok_or_else(|| {
            ExamError::not_found_with("student", json!({ "studentCode": code }))
        })?;
        let Some((exam, questions)) = targets.get(sb.version.as_str()) else {
            return Err(ExamError::BadParams(format!(
                "student {} has unknown version {}",
                code, sb.version
            )));
        };
        if sb.answers.len() != questions.len() {
            return Err(ExamError::BadParams(format!(
                "student {} has {} answers, version {} has {} questions",
                code,
                sb.answers.len(),
                sb.version,
                questions.len()
            )));
        }
        if let Some(i) = sb.answers.iter().position(|a| !matches!(a.correctness, 0 | 1)) {
            return Err(ExamError::BadParams(format!(
                "student {} answer {} has correctness {}",
                code, i, sb.answers[i].correctness
            )));
        }
        for (i, answer) in sb.answers.iter().enumerate() {
            scoring::check_value(answer.correction, -scoring::VALUE_LIMIT).map_err(|e| {
                ExamError::BadParams(format!("student {} answer {} correction {}", code, i, e))
            })?;
        }
        scoring::check_value(sb.adjustment, 0).map_err(|e| {
            ExamError::BadParams(format!("student {} adjustment {}", code, e))
        })?;

        let current = reconcile::current_assignment(conn, student.id, &subject.id)?;
        let needs_migration = match &current {
            Some(a) if a.exam_id == exam.id => {
                let present = score_map(conn, student.id, &exam.id)?;
                let missing = questions.iter().filter(|q| !present.contains_key(&q.id)).count();
                if missing > 0 {
                    return Err(ExamError::IncompleteRows(
                        format!(
                            "student {} is missing {} score rows; run scores.ensureRows first",
                            code, missing
                        ),
                        json!({ "studentCode": code, "version": sb.version, "missing": missing }),
                    ));
                }
                false
            }
            Some(a) => {
                let prior = reconcile::prior_scores(conn, student.id, &subject.id)?;
                if prior.any() {
                    return Err(ExamError::ScoresPresent {
                        total: prior.total,
                        details: json!({
                            "studentCode": code,
                            "fromVersion": a.version,
                            "toVersion": sb.version,
                            "total": prior.total,
                        }),
                    });
                }
                true
            }
            None => true,
        };

        students.push(PlannedStudent {
            student_id: student.id,
            student_code: code.clone(),
            version: sb.version.clone(),
            from_version: current.map(|a| a.version),
            exam: exam.clone(),
            question_ids: questions.iter().map(|q| q.id.clone()).collect(),
            answers: sb.answers.clone(),
            adjustment: sb.adjustment,
            needs_migration,
        });
    }

    Ok(ImportPlan {
        subject_id: subject.id,
        subject_code: subject.code,
        overrides,
        students,
    })
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub subject_code: String,
    pub dry_run: bool,
    pub students: usize,
    pub assignments_changed: usize,
    pub score_rows_updated: usize,
    pub score_rows_unchanged: usize,
    pub adjust_rows_created: usize,
    pub adjust_rows_updated: usize,
    pub overrides: Vec<Value>,
}

impl ImportSummary {
    pub fn changes(&self) -> usize {
        self.assignments_changed
            + self.score_rows_updated
            + self.adjust_rows_created
            + self.adjust_rows_updated
    }
}

/// Writes a validated plan in one transaction. With `dry_run` the
/// transaction is rolled back and only the counters are returned.
pub fn apply_import(conn: &Connection, plan: &ImportPlan, dry_run: bool) -> ExamResult<ImportSummary> {
    let tx = conn.unchecked_transaction()?;
    let mut out = ImportSummary {
        subject_code: plan.subject_code.clone(),
        dry_run,
        students: plan.students.len(),
        overrides: plan.overrides.clone(),
        ..ImportSummary::default()
    };

    for ps in &plan.students {
        if ps.needs_migration {
            reconcile::migrate_assignment(&tx, &plan.subject_id, ps.student_id, &ps.exam)?;
            out.assignments_changed += 1;
        }

        let rows = score_map(&tx, ps.student_id, &ps.exam.id)?;
        for (qid, answer) in ps.question_ids.iter().zip(ps.answers.iter()) {
            let Some((row_id, correct, correction)) = rows.get(qid) else {
                return Err(ExamError::IncompleteRows(
                    format!("student {} has no row for question {}", ps.student_code, qid),
                    json!({ "studentCode": ps.student_code, "questionId": qid }),
                ));
            };
            if *correct == answer.correctness && *correction == answer.correction {
                out.score_rows_unchanged += 1;
                continue;
            }
            tx.execute(
                "UPDATE student_exams SET correct = ?, correction = ? WHERE id = ?",
                (answer.correctness, answer.correction, row_id),
            )?;
            out.score_rows_updated += 1;
        }

        match adjust_value(&tx, ps.student_id, &ps.exam.id)? {
            Some(v) if v == ps.adjustment => {}
            Some(_) => {
                tx.execute(
                    "UPDATE exam_adjusts SET adjust = ? WHERE student_id = ? AND exam_id = ?",
                    (ps.adjustment, ps.student_id, &ps.exam.id),
                )?;
                out.adjust_rows_updated += 1;
            }
            None if ps.adjustment == 0 => {}
            None => {
                tx.execute(
                    "INSERT INTO exam_adjusts(id, student_id, exam_id, adjust) VALUES(?, ?, ?, ?)",
                    (Uuid::new_v4().to_string(), ps.student_id, &ps.exam.id, ps.adjustment),
                )?;
                out.adjust_rows_created += 1;
            }
        }
    }

    if dry_run {
        tx.rollback()?;
    } else {
        tx.commit()?;
        info!(
            subject = %plan.subject_code,
            students = out.students,
            changes = out.changes(),
            "scores imported"
        );
    }
    Ok(out)
}

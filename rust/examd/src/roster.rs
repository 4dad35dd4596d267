use crate::error::{ExamError, ExamResult};
use crate::registry::Subject;
use anyhow::Context;
use rusqlite::{Connection, OptionalExtension, Row};
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use tracing::info;

const ROSTER_COLUMNS: [&str; 10] = [
    "id", "entyear", "stdNo", "email", "name1", "name2", "nickname", "gender", "COO", "enrolled",
];

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Student {
    pub id: i64,
    pub code: String,
    pub entry_year: i64,
    pub email: String,
    pub family_name: String,
    pub given_name: String,
    pub nickname: String,
    pub gender: String,
    pub origin: String,
    pub enrolled: bool,
}

impl Student {
    fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: r.get(0)?,
            code: r.get(1)?,
            entry_year: r.get(2)?,
            email: r.get(3)?,
            family_name: r.get(4)?,
            given_name: r.get(5)?,
            nickname: r.get(6)?,
            gender: r.get(7)?,
            origin: r.get(8)?,
            enrolled: r.get::<_, i64>(9)? != 0,
        })
    }
}

const STUDENT_COLS: &str =
    "id, code, entry_year, email, family_name, given_name, nickname, gender, origin, enrolled";

pub fn get_student(conn: &Connection, student_id: i64) -> ExamResult<Student> {
    let sql = format!("SELECT {} FROM students WHERE id = ?", STUDENT_COLS);
    conn.query_row(&sql, [student_id], Student::from_row)
        .optional()?
        .ok_or_else(|| ExamError::not_found_with("student", json!({ "studentId": student_id })))
}

pub fn find_student_by_code(conn: &Connection, code: &str) -> ExamResult<Option<Student>> {
    let sql = format!("SELECT {} FROM students WHERE code = ?", STUDENT_COLS);
    Ok(conn
        .query_row(&sql, [code], Student::from_row)
        .optional()?)
}

pub fn list_students(
    conn: &Connection,
    entry_year: Option<i64>,
    enrolled_only: bool,
) -> ExamResult<Vec<Student>> {
    let sql = format!(
        "SELECT {} FROM students
         WHERE (?1 IS NULL OR entry_year = ?1) AND (?2 = 0 OR enrolled = 1)
         ORDER BY code",
        STUDENT_COLS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map((entry_year, enrolled_only as i64), Student::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Enrolled students of the cohort a subject targets.
pub fn eligible_students(conn: &Connection, subject: &Subject) -> ExamResult<Vec<Student>> {
    list_students(conn, Some(subject.cohort_entry_year()), true)
}

fn parse_csv_record(line: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut buf = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                buf.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => out.push(std::mem::take(&mut buf)),
            _ => buf.push(ch),
        }
    }
    out.push(buf);
    out
}

fn csv_field<'a>(
    fields: &'a [String],
    index: &HashMap<&str, usize>,
    col: &str,
) -> Option<&'a str> {
    index
        .get(col)
        .and_then(|&i| fields.get(i))
        .map(|s| s.trim())
}

fn parse_flag(raw: Option<&str>) -> bool {
    match raw.map(|s| s.trim().to_ascii_lowercase()) {
        Some(s) if matches!(s.as_str(), "0" | "false" | "f" | "no" | "n") => false,
        _ => true,
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterWarning {
    pub line: usize,
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct ParsedRoster {
    pub students: Vec<Student>,
    pub warnings: Vec<RosterWarning>,
}

pub fn parse_roster_csv(text: &str) -> ExamResult<ParsedRoster> {
    let mut lines = text.lines().enumerate();
    let Some((_, header_line)) = lines.next() else {
        return Err(ExamError::BadParams("roster CSV is empty".into()));
    };
    let header: Vec<String> = parse_csv_record(header_line.trim_start_matches('\u{feff}'))
        .into_iter()
        .map(|h| h.trim().to_string())
        .collect();
    let mut index: HashMap<&str, usize> = HashMap::new();
    for col in ROSTER_COLUMNS {
        match header.iter().position(|h| h == col) {
            Some(i) => {
                index.insert(col, i);
            }
            None if col == "enrolled" => {}
            None => {
                return Err(ExamError::BadParams(format!(
                    "roster CSV header is missing column {}",
                    col
                )))
            }
        }
    }

    let mut students = Vec::new();
    let mut warnings = Vec::new();
    let mut seen_codes = HashSet::new();
    let mut seen_ids = HashSet::new();
    for (line_no, raw_line) in lines {
        let line = raw_line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        let fields = parse_csv_record(line);
        let field = |col: &'static str| csv_field(&fields, &index, col);

        let id = match field("id").and_then(|v| v.parse::<i64>().ok()) {
            Some(v) => v,
            None => {
                warnings.push(RosterWarning {
                    line: line_no + 1,
                    code: "bad_id",
                    message: "id must be an integer".into(),
                });
                continue;
            }
        };
        if seen_ids.contains(&id) {
            warnings.push(RosterWarning {
                line: line_no + 1,
                code: "duplicate_id",
                message: format!("id {} already appeared earlier in the file", id),
            });
            continue;
        }
        let entry_year = match field("entyear").and_then(|v| v.parse::<i64>().ok()) {
            Some(v) => v,
            None => {
                warnings.push(RosterWarning {
                    line: line_no + 1,
                    code: "bad_entry_year",
                    message: "entyear must be an integer".into(),
                });
                continue;
            }
        };
        let code = field("stdNo").unwrap_or("").to_string();
        if code.is_empty() || !seen_codes.insert(code.clone()) {
            warnings.push(RosterWarning {
                line: line_no + 1,
                code: "bad_code",
                message: "stdNo is empty or duplicated".into(),
            });
            continue;
        }

        seen_ids.insert(id);
        students.push(Student {
            id,
            code,
            entry_year,
            email: field("email").unwrap_or("").to_string(),
            family_name: field("name1").unwrap_or("").to_string(),
            given_name: field("name2").unwrap_or("").to_string(),
            nickname: field("nickname").unwrap_or("").to_string(),
            gender: field("gender").unwrap_or("").to_string(),
            origin: field("COO").unwrap_or("").to_string(),
            enrolled: parse_flag(field("enrolled")),
        });
    }

    Ok(ParsedRoster { students, warnings })
}

fn csv_escape(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Renders students with the same columns `parse_roster_csv` reads.
pub fn roster_csv(students: &[Student]) -> String {
    let mut out = ROSTER_COLUMNS.join(",");
    out.push('\n');
    for s in students {
        let fields = [
            s.id.to_string(),
            s.entry_year.to_string(),
            s.code.clone(),
            s.email.clone(),
            s.family_name.clone(),
            s.given_name.clone(),
            s.nickname.clone(),
            s.gender.clone(),
            s.origin.clone(),
            if s.enrolled { "1" } else { "0" }.to_string(),
        ];
        let row: Vec<String> = fields.iter().map(|f| csv_escape(f)).collect();
        out.push_str(&row.join(","));
        out.push('\n');
    }
    out
}

pub fn read_roster(path: &Path) -> ExamResult<ParsedRoster> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read roster {}", path.to_string_lossy()))?;
    parse_roster_csv(&text)
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterLoad {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub missing_from_csv: usize,
}

/// Upserts the roster by id. Rows missing from the file are kept: score
/// history references them.
pub fn load_roster(conn: &Connection, students: &[Student]) -> ExamResult<RosterLoad> {
    let tx = conn.unchecked_transaction()?;
    let mut summary = RosterLoad::default();
    let now = chrono::Utc::now().to_rfc3339();

    for s in students {
        let existing = match get_student(&tx, s.id) {
            Ok(cur) => Some(cur),
            Err(ExamError::NotFound { .. }) => None,
            Err(e) => return Err(e),
        };
        match existing {
            Some(cur) if cur == *s => summary.unchanged += 1,
            Some(_) => {
                tx.execute(
                    "UPDATE students SET code = ?, entry_year = ?, email = ?, family_name = ?,
                       given_name = ?, nickname = ?, gender = ?, origin = ?, enrolled = ?,
                       updated_at = ?
                     WHERE id = ?",
                    (
                        &s.code,
                        s.entry_year,
                        &s.email,
                        &s.family_name,
                        &s.given_name,
                        &s.nickname,
                        &s.gender,
                        &s.origin,
                        s.enrolled as i64,
                        &now,
                        s.id,
                    ),
                )?;
                summary.updated += 1;
            }
            None => {
                tx.execute(
                    "INSERT INTO students(id, code, entry_year, email, family_name, given_name,
                       nickname, gender, origin, enrolled, updated_at)
                     VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                    (
                        s.id,
                        &s.code,
                        s.entry_year,
                        &s.email,
                        &s.family_name,
                        &s.given_name,
                        &s.nickname,
                        &s.gender,
                        &s.origin,
                        s.enrolled as i64,
                        &now,
                    ),
                )?;
                summary.inserted += 1;
            }
        }
    }

    let in_csv: HashSet<i64> = students.iter().map(|s| s.id).collect();
    let mut stmt = tx.prepare("SELECT id FROM students")?;
    let stored = stmt
        .query_map([], |r| r.get::<_, i64>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    drop(stmt);
    summary.missing_from_csv = stored.iter().filter(|id| !in_csv.contains(*id)).count();
    tx.commit()?;

    info!(
        inserted = summary.inserted,
        updated = summary.updated,
        unchanged = summary.unchanged,
        "roster loaded"
    );
    Ok(summary)
}

/// `{fsyear: {grade: {version: [student codes]}}}`
pub type AssignmentMap = BTreeMap<i64, BTreeMap<i64, BTreeMap<String, Vec<String>>>>;

pub fn parse_assignment_yaml(text: &str) -> ExamResult<AssignmentMap> {
    let raw: BTreeMap<i64, BTreeMap<i64, BTreeMap<String, Vec<serde_yaml::Value>>>> =
        serde_yaml::from_str(text).map_err(|e| ExamError::BadDocument(e.to_string()))?;
    let mut out = AssignmentMap::new();
    for (fsyear, grades) in raw {
        for (grade, versions) in grades {
            for (version, codes) in versions {
                let mut list = Vec::with_capacity(codes.len());
                for c in codes {
                    let code = match c {
                        serde_yaml::Value::String(s) => s,
                        serde_yaml::Value::Number(n) => n.to_string(),
                        other => {
                            return Err(ExamError::BadDocument(format!(
                                "student code must be a string or number, got {:?}",
                                other
                            )))
                        }
                    };
                    list.push(code.trim().to_string());
                }
                out.entry(fsyear)
                    .or_default()
                    .entry(grade)
                    .or_default()
                    .insert(version.trim().to_string(), list);
            }
        }
    }
    Ok(out)
}

pub fn read_assignment_yaml(path: &Path) -> ExamResult<AssignmentMap> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read assignments {}", path.to_string_lossy()))?;
    parse_assignment_yaml(&text)
}

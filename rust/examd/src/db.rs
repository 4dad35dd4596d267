use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub const DB_FILE_NAME: &str = "examd.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    init_schema(&conn)?;
    Ok(conn)
}

#[cfg(test)]
pub fn open_in_memory() -> anyhow::Result<Connection> {
    let conn = Connection::open_in_memory()?;
    init_schema(&conn)?;
    Ok(conn)
}

fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            code TEXT NOT NULL,
            fsyear INTEGER NOT NULL,
            term INTEGER NOT NULL,
            name TEXT NOT NULL,
            grade_level INTEGER NOT NULL DEFAULT 1,
            UNIQUE(code, fsyear)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subjects_code_fsyear ON subjects(code, fsyear)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS exams(
            id TEXT PRIMARY KEY,
            subject_id TEXT NOT NULL,
            version TEXT NOT NULL,
            title TEXT NOT NULL,
            problem_hash TEXT,
            adjust_comment TEXT NOT NULL DEFAULT '',
            FOREIGN KEY(subject_id) REFERENCES subjects(id) ON DELETE CASCADE,
            UNIQUE(subject_id, version)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_exams_subject ON exams(subject_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_exams_problem_hash ON exams(problem_hash)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS questions(
            id TEXT PRIMARY KEY,
            exam_id TEXT NOT NULL,
            row_no INTEGER NOT NULL,
            col_no INTEGER NOT NULL,
            label TEXT NOT NULL,
            points INTEGER NOT NULL DEFAULT 1,
            answer TEXT NOT NULL DEFAULT '',
            width INTEGER NOT NULL DEFAULT 1,
            height INTEGER NOT NULL DEFAULT 1,
            category TEXT NOT NULL DEFAULT '',
            FOREIGN KEY(exam_id) REFERENCES exams(id) ON DELETE CASCADE
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_questions_exam_order ON questions(exam_id, row_no, col_no)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id INTEGER PRIMARY KEY,
            code TEXT NOT NULL UNIQUE,
            entry_year INTEGER NOT NULL,
            email TEXT NOT NULL DEFAULT '',
            family_name TEXT NOT NULL DEFAULT '',
            given_name TEXT NOT NULL DEFAULT '',
            nickname TEXT NOT NULL DEFAULT '',
            gender TEXT NOT NULL DEFAULT '',
            origin TEXT NOT NULL DEFAULT '',
            enrolled INTEGER NOT NULL DEFAULT 1,
            updated_at TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_entry_year ON students(entry_year)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_exam_versions(
            id TEXT PRIMARY KEY,
            student_id INTEGER NOT NULL,
            subject_id TEXT NOT NULL,
            exam_id TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id) ON DELETE CASCADE,
            FOREIGN KEY(exam_id) REFERENCES exams(id) ON DELETE CASCADE,
            UNIQUE(student_id, subject_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sev_exam ON student_exam_versions(exam_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_exams(
            id TEXT PRIMARY KEY,
            student_id INTEGER NOT NULL,
            exam_id TEXT NOT NULL,
            question_id TEXT NOT NULL,
            correct INTEGER NOT NULL DEFAULT 0 CHECK(correct IN (0, 1)),
            correction INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(exam_id) REFERENCES exams(id) ON DELETE CASCADE,
            FOREIGN KEY(question_id) REFERENCES questions(id) ON DELETE CASCADE,
            UNIQUE(student_id, exam_id, question_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_student_exams_exam ON student_exams(exam_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_student_exams_student_exam ON student_exams(student_id, exam_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS exam_adjusts(
            id TEXT PRIMARY KEY,
            student_id INTEGER NOT NULL,
            exam_id TEXT NOT NULL,
            adjust INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(exam_id) REFERENCES exams(id) ON DELETE CASCADE,
            UNIQUE(student_id, exam_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_exam_adjusts_exam ON exam_adjusts(exam_id)",
        [],
    )?;

    Ok(())
}

pub fn settings_get_json(
    conn: &Connection,
    key: &str,
) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

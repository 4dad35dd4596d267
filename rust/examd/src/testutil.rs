use crate::db;
use crate::reconcile;
use crate::registry::{self, Exam, LoadOptions, Question, Subject};
use crate::roster;
use rusqlite::Connection;
use std::collections::HashMap;

pub(crate) struct Seeded {
    pub subject: Subject,
    pub exams: Vec<Exam>,
    pub questions: HashMap<String, Vec<Question>>,
}

impl Seeded {
    pub fn exam(&self, version: &str) -> &Exam {
        self.exams
            .iter()
            .find(|e| e.version == version)
            .expect("seeded version")
    }
}

/// Sample subject with versions A and B, the sample roster, students 1 and 2
/// on A and student 3 on B, all rows present and zero.
pub(crate) fn seed() -> (Connection, Seeded) {
    let conn = db::open_in_memory().expect("open");
    let summary = registry::load_definition(
        &conn,
        &registry::tests::sample_definition(),
        LoadOptions::default(),
    )
    .expect("definition");
    let parsed = roster::parse_roster_csv(roster::tests::SAMPLE_ROSTER).expect("roster");
    roster::load_roster(&conn, &parsed.students).expect("load roster");

    for (student_id, version) in [(1, "A"), (2, "A"), (3, "B")] {
        reconcile::assign_version(&conn, &summary.subject_id, student_id, version, false)
            .expect("assign");
    }

    let subject = registry::get_subject(&conn, &summary.subject_id).expect("subject");
    let exams = registry::list_exams(&conn, &subject.id).expect("exams");
    let questions = exams
        .iter()
        .map(|e| {
            (
                e.version.clone(),
                registry::ordered_questions(&conn, &e.id).expect("questions"),
            )
        })
        .collect();
    (
        conn,
        Seeded {
            subject,
            exams,
            questions,
        },
    )
}

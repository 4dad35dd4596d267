use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn fixture_path(rel: &str) -> PathBuf {
    let base = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    base.join("../../").join(rel)
}

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_examd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn examd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn request_err(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    value.get("error").cloned().unwrap_or_else(|| json!({}))
}

/// Opens a fresh workspace with the fixture subject, roster and assignments
/// loaded and all score/adjust rows present. Returns the subject id.
fn setup_subject(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &std::path::Path,
) -> String {
    let _ = request_ok(
        stdin,
        reader,
        "s1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let loaded = request_ok(
        stdin,
        reader,
        "s2",
        "subjects.loadDefinition",
        json!({ "path": fixture_path("fixtures/exam/networks_2025.json").to_string_lossy() }),
    );
    let subject_id = loaded
        .get("subjectId")
        .and_then(|v| v.as_str())
        .expect("subjectId")
        .to_string();
    let _ = request_ok(
        stdin,
        reader,
        "s3",
        "students.loadCsv",
        json!({
            "path": fixture_path("fixtures/roster/students.csv").to_string_lossy(),
            "yes": true
        }),
    );
    let _ = request_ok(
        stdin,
        reader,
        "s4",
        "versions.loadAssignments",
        json!({
            "subjectId": subject_id,
            "path": fixture_path("fixtures/assignments/versions.yaml").to_string_lossy()
        }),
    );
    let _ = request_ok(
        stdin,
        reader,
        "s5",
        "scores.ensureRows",
        json!({ "subjectId": subject_id }),
    );
    let _ = request_ok(
        stdin,
        reader,
        "s6",
        "adjust.ensureRows",
        json!({ "subjectId": subject_id }),
    );
    subject_id
}

fn exam_id(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    subject_id: &str,
    version: &str,
) -> String {
    let exams = request_ok(
        stdin,
        reader,
        "e1",
        "exams.list",
        json!({ "subjectId": subject_id }),
    );
    exams
        .get("exams")
        .and_then(|v| v.as_array())
        .and_then(|arr| {
            arr.iter()
                .find(|e| e.get("version").and_then(|v| v.as_str()) == Some(version))
        })
        .and_then(|e| e.get("id"))
        .and_then(|v| v.as_str())
        .expect("exam id")
        .to_string()
}

fn score_rows(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    exam_id: &str,
    student_id: i64,
) -> Vec<serde_json::Value> {
    request_ok(
        stdin,
        reader,
        "r1",
        "scores.list",
        json!({ "examId": exam_id, "studentId": student_id }),
    )
    .get("scores")
    .and_then(|v| v.as_array())
    .cloned()
    .expect("scores")
}

fn error_code(err: &serde_json::Value) -> Option<&str> {
    err.get("code").and_then(|v| v.as_str())
}

fn score_some_rows(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    subject_id: &str,
) {
    let exam_a = exam_id(stdin, reader, subject_id, "A");
    let exam_b = exam_id(stdin, reader, subject_id, "B");
    let a = score_rows(stdin, reader, &exam_a, 101);
    let b = score_rows(stdin, reader, &exam_b, 104);
    let _ = request_ok(
        stdin,
        reader,
        "x1",
        "scores.bulkUpdate",
        json!({
            "items": [
                { "id": a[0]["id"], "correct": 1 },
                { "id": a[3]["id"], "correct": 1, "correction": -2 },
                { "id": b[1]["id"], "correct": 1 }
            ]
        }),
    );
    let _ = request_ok(
        stdin,
        reader,
        "x2",
        "adjust.update",
        json!({
            "subjectId": subject_id,
            "items": [ { "studentCode": "25367004", "examId": exam_b, "adjust": 3 } ]
        }),
    );
}

#[test]
fn unmodified_round_trip_reports_no_changes() {
    let workspace = temp_dir("examd-exchange-roundtrip");
    let out = workspace.join("out").join("scores.json");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let subject_id = setup_subject(&mut stdin, &mut reader, &workspace);
    score_some_rows(&mut stdin, &mut reader, &subject_id);

    let exported = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "exchange.exportScores",
        json!({ "subjectId": subject_id, "outPath": out.to_string_lossy() }),
    );
    assert_eq!(
        exported
            .get("summary")
            .and_then(|s| s.get("students"))
            .and_then(|v| v.as_u64()),
        Some(4)
    );

    let doc: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&out).expect("read export")).expect("json");
    assert!(doc["meta"]["exported_at"].as_str().is_some());
    assert_eq!(doc["subjects"]["1010401"]["fsyear"], json!(2025));
    assert_eq!(
        doc["subjects"]["1010401"]["exams"]["A"]["hash"],
        json!("a1b2c3d4e5f60718293a4b5c6d7e8f90")
    );
    assert_eq!(
        doc["subjects"]["1010401"]["students"]["25367001"]["answers"][3],
        json!({ "correctness": 1, "correction": -2 })
    );
    assert_eq!(
        doc["subjects"]["1010401"]["students"]["25367004"]["adjustment"],
        json!(3)
    );

    let unconfirmed = request_err(
        &mut stdin,
        &mut reader,
        "2",
        "exchange.importScores",
        json!({ "inPath": out.to_string_lossy(), "subjectCode": "1010401" }),
    );
    assert_eq!(error_code(&unconfirmed), Some("confirmation_required"));

    let imported = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "exchange.importScores",
        json!({ "inPath": out.to_string_lossy(), "subjectCode": "1010401", "yes": true }),
    );
    let summary = imported.get("summary").expect("summary");
    for key in [
        "assignmentsChanged",
        "scoreRowsUpdated",
        "adjustRowsCreated",
        "adjustRowsUpdated",
    ] {
        assert_eq!(summary.get(key).and_then(|v| v.as_u64()), Some(0), "{}", key);
    }
    assert_eq!(
        summary.get("scoreRowsUnchanged").and_then(|v| v.as_u64()),
        Some(16)
    );

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn fingerprint_mismatches_are_rejected_before_any_write() {
    let workspace = temp_dir("examd-exchange-fingerprint");
    let out = workspace.join("scores.json");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let subject_id = setup_subject(&mut stdin, &mut reader, &workspace);
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "exchange.exportScores",
        json!({ "subjectId": subject_id, "outPath": out.to_string_lossy() }),
    );
    let base: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&out).expect("read export")).expect("json");

    // Same questions, different order.
    let mut reordered = base.clone();
    let order = reordered["subjects"]["1010401"]["exams"]["A"]["question_order"]
        .as_array_mut()
        .expect("order");
    order.swap(0, 1);
    reordered["subjects"]["1010401"]["students"]["25367001"]["answers"][0]["correctness"] =
        json!(1);
    let reordered_path = workspace.join("reordered.json");
    std::fs::write(&reordered_path, reordered.to_string()).expect("write reordered");

    let e = request_err(
        &mut stdin,
        &mut reader,
        "2",
        "exchange.importScores",
        json!({ "inPath": reordered_path.to_string_lossy(), "subjectCode": "1010401", "yes": true }),
    );
    assert_eq!(error_code(&e), Some("order_mismatch"));
    assert_eq!(
        e.get("details")
            .and_then(|d| d.get("position"))
            .and_then(|v| v.as_u64()),
        Some(0)
    );
    let exam_a = exam_id(&mut stdin, &mut reader, &subject_id, "A");
    let rows = score_rows(&mut stdin, &mut reader, &exam_a, 101);
    assert_eq!(rows[0]["correct"], json!(0));

    let forced = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "exchange.importScores",
        json!({
            "inPath": reordered_path.to_string_lossy(),
            "subjectCode": "1010401",
            "ignoreOrder": true,
            "yes": true
        }),
    );
    assert_eq!(
        forced["summary"]["overrides"].as_array().map(|a| a.len()),
        Some(1)
    );
    assert_eq!(forced["summary"]["scoreRowsUpdated"], json!(1));

    // Different hash.
    let mut rehashed = base.clone();
    rehashed["subjects"]["1010401"]["exams"]["A"]["hash"] = json!("deadbeef");
    let rehashed_path = workspace.join("rehashed.json");
    std::fs::write(&rehashed_path, rehashed.to_string()).expect("write rehashed");
    let e = request_err(
        &mut stdin,
        &mut reader,
        "4",
        "exchange.importScores",
        json!({ "inPath": rehashed_path.to_string_lossy(), "subjectCode": "1010401", "yes": true }),
    );
    assert_eq!(error_code(&e), Some("hash_mismatch"));
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "exchange.importScores",
        json!({
            "inPath": rehashed_path.to_string_lossy(),
            "subjectCode": "1010401",
            "ignoreHash": true,
            "yes": true
        }),
    );

    // Fewer questions can never be forced through.
    let mut shorter = base.clone();
    shorter["subjects"]["1010401"]["exams"]["B"]["question_order"]
        .as_array_mut()
        .expect("order")
        .pop();
    let shorter_path = workspace.join("shorter.json");
    std::fs::write(&shorter_path, shorter.to_string()).expect("write shorter");
    let e = request_err(
        &mut stdin,
        &mut reader,
        "6",
        "exchange.importScores",
        json!({
            "inPath": shorter_path.to_string_lossy(),
            "subjectCode": "1010401",
            "ignoreHash": true,
            "ignoreOrder": true,
            "yes": true
        }),
    );
    assert_eq!(error_code(&e), Some("question_count_mismatch"));

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn dry_run_and_student_filter_do_not_write() {
    let workspace = temp_dir("examd-exchange-dryrun");
    let out = workspace.join("scores.json");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let subject_id = setup_subject(&mut stdin, &mut reader, &workspace);
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "exchange.exportScores",
        json!({ "subjectId": subject_id, "outPath": out.to_string_lossy() }),
    );
    let mut doc: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&out).expect("read export")).expect("json");
    doc["subjects"]["1010401"]["students"]["25367001"]["answers"][2]["correctness"] = json!(1);
    doc["subjects"]["1010401"]["students"]["25367002"]["adjustment"] = json!(4);
    std::fs::write(&out, doc.to_string()).expect("write edited");

    let dry = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "exchange.importScores",
        json!({ "inPath": out.to_string_lossy(), "subjectCode": "1010401", "dryRun": true }),
    );
    assert_eq!(dry["summary"]["dryRun"], json!(true));
    assert_eq!(dry["summary"]["scoreRowsUpdated"], json!(1));
    assert_eq!(dry["summary"]["adjustRowsUpdated"], json!(1));
    let exam_a = exam_id(&mut stdin, &mut reader, &subject_id, "A");
    assert_eq!(score_rows(&mut stdin, &mut reader, &exam_a, 101)[2]["correct"], json!(0));

    let filtered = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "exchange.importScores",
        json!({
            "inPath": out.to_string_lossy(),
            "subjectCode": "1010401",
            "studentCodes": ["25367001"],
            "yes": true
        }),
    );
    assert_eq!(filtered["summary"]["students"], json!(1));
    assert_eq!(filtered["summary"]["scoreRowsUpdated"], json!(1));
    assert_eq!(filtered["summary"]["adjustRowsUpdated"], json!(0));

    let e = request_err(
        &mut stdin,
        &mut reader,
        "4",
        "exchange.importScores",
        json!({
            "inPath": out.to_string_lossy(),
            "subjectCode": "1010401",
            "studentCodes": ["99999999"],
            "yes": true
        }),
    );
    assert_eq!(error_code(&e), Some("bad_params"));

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn export_merges_into_existing_file() {
    let workspace = temp_dir("examd-exchange-merge");
    let out = workspace.join("scores.json");
    std::fs::write(
        &out,
        json!({
            "meta": { "exported_at": "2024-03-01T00:00:00Z", "tool_version": "old" },
            "subjects": { "9999999": { "name": "Other", "fsyear": 2025, "term": 2, "exams": {}, "students": {} } }
        })
        .to_string(),
    )
    .expect("seed file");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let subject_id = setup_subject(&mut stdin, &mut reader, &workspace);

    let exported = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "exchange.exportScores",
        json!({ "subjectId": subject_id, "outPath": out.to_string_lossy() }),
    );
    assert_eq!(exported["subjectsInFile"], json!(2));
    let doc: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&out).expect("read export")).expect("json");
    assert_eq!(doc["subjects"]["9999999"]["name"], json!("Other"));
    assert_ne!(doc["meta"]["tool_version"], json!("old"));

    let _ = std::fs::remove_dir_all(workspace);
}

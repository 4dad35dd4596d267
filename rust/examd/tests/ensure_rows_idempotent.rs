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

#[test]
fn ensure_rows_creates_once_then_nothing() {
    let workspace = temp_dir("examd-ensure-rows");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let loaded = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "subjects.loadDefinition",
        json!({ "path": fixture_path("fixtures/exam/networks_2025.json").to_string_lossy() }),
    );
    let subject_id = loaded["subjectId"].as_str().expect("subjectId").to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.loadCsv",
        json!({ "path": fixture_path("fixtures/roster/students.csv").to_string_lossy(), "yes": true }),
    );
    let assigned = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "versions.loadAssignments",
        json!({
            "subjectId": subject_id,
            "path": fixture_path("fixtures/assignments/versions.yaml").to_string_lossy()
        }),
    );
    assert_eq!(assigned["created"], json!(4));

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "scores.ensureRows",
        json!({ "subjectId": subject_id }),
    );
    assert_eq!(first["assignments"], json!(4));
    assert_eq!(first["created"], json!(16));
    let second = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "scores.ensureRows",
        json!({ "subjectId": subject_id }),
    );
    assert_eq!(second["created"], json!(0));

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "adjust.ensureRows",
        json!({ "subjectId": subject_id }),
    );
    assert_eq!(first["created"], json!(4));
    let second = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "adjust.ensureRows",
        json!({ "subjectId": subject_id }),
    );
    assert_eq!(second["created"], json!(0));

    let stats = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "admin.subjectStats",
        json!({ "subjectId": subject_id }),
    );
    assert_eq!(stats["scores"]["rows"], json!(16));
    assert_eq!(stats["scores"]["unscored"], json!(16));
    assert_eq!(stats["adjusts"]["rows"], json!(4));

    // Loading the same map again leaves existing assignments alone.
    let again = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "versions.loadAssignments",
        json!({
            "subjectId": subject_id,
            "path": fixture_path("fixtures/assignments/versions.yaml").to_string_lossy()
        }),
    );
    assert_eq!(again["created"], json!(0));
    assert_eq!(again["unchanged"], json!(4));

    let _ = std::fs::remove_dir_all(workspace);
}

#[path = "../src/backup.rs"]
mod backup;

use serde_json::json;
use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

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

#[test]
fn zip_export_and_import_roundtrip() {
    let workspace = temp_dir("examd-backup-src");
    let workspace2 = temp_dir("examd-backup-dst");
    let out_dir = temp_dir("examd-backup-out");

    let db_src = workspace.join("examd.sqlite3");
    let bytes = b"sqlite-test-payload";
    std::fs::write(&db_src, bytes).expect("write source db");

    let snapshot = json!({
        "2025": {
            "meta": {},
            "subjects": {
                "1010401": { "exams": { "A": { "hash": "abc" }, "B": { "hash": null } } }
            }
        }
    });
    let bundle_path = out_dir.join("workspace.examd.zip");
    let export = backup::export_workspace_bundle(&workspace, &bundle_path, Some(&snapshot))
        .expect("export bundle");
    assert_eq!(export.bundle_format, backup::BUNDLE_FORMAT_V1);
    assert_eq!(export.entry_count, 3);

    let f = File::open(&bundle_path).expect("open bundle");
    let mut archive = zip::ZipArchive::new(f).expect("open zip archive");
    let mut manifest = String::new();
    archive
        .by_name("manifest.json")
        .expect("manifest entry")
        .read_to_string(&mut manifest)
        .expect("read manifest");
    assert!(manifest.contains(backup::BUNDLE_FORMAT_V1));
    archive
        .by_name("db/examd.sqlite3")
        .expect("database entry in bundle");
    let mut snap_text = String::new();
    archive
        .by_name("exchange/scores.json")
        .expect("snapshot entry")
        .read_to_string(&mut snap_text)
        .expect("read snapshot");
    let snap: serde_json::Value = serde_json::from_str(&snap_text).expect("snapshot json");
    assert_eq!(snap, snapshot);

    let import = backup::import_workspace_bundle(&bundle_path, &workspace2).expect("import bundle");
    assert_eq!(import.bundle_format_detected, backup::BUNDLE_FORMAT_V1);
    assert!(import.has_snapshot());
    let exams = import.snapshot_exams.expect("snapshot exams");
    assert_eq!(
        exams,
        vec![
            backup::SnapshotExam {
                fsyear: 2025,
                subject_code: "1010401".into(),
                version: "A".into(),
                hash: Some("abc".into()),
            },
            backup::SnapshotExam {
                fsyear: 2025,
                subject_code: "1010401".into(),
                version: "B".into(),
                hash: None,
            },
        ]
    );

    let restored = std::fs::read(workspace2.join("examd.sqlite3")).expect("read restored db");
    assert_eq!(restored, bytes);
    assert!(!workspace2.join("examd.sqlite3.importing").exists());

    let _ = std::fs::remove_dir_all(workspace);
    let _ = std::fs::remove_dir_all(workspace2);
    let _ = std::fs::remove_dir_all(out_dir);
}

#[test]
fn bundle_without_snapshot_has_two_entries() {
    let workspace = temp_dir("examd-backup-nosnap");
    std::fs::write(workspace.join("examd.sqlite3"), b"db").expect("write db");
    let bundle_path = workspace.join("out").join("b.zip");
    let export =
        backup::export_workspace_bundle(&workspace, &bundle_path, None).expect("export bundle");
    assert_eq!(export.entry_count, 2);

    let dst = temp_dir("examd-backup-nosnap-dst");
    let import = backup::import_workspace_bundle(&bundle_path, &dst).expect("import");
    assert!(!import.has_snapshot());

    let _ = std::fs::remove_dir_all(workspace);
    let _ = std::fs::remove_dir_all(dst);
}

#[test]
fn raw_sqlite_import_is_supported() {
    let out_dir = temp_dir("examd-backup-raw");
    let workspace = temp_dir("examd-backup-raw-dst");

    let raw_file = out_dir.join("copy.sqlite3");
    let bytes = b"raw-sqlite-copy";
    std::fs::write(&raw_file, bytes).expect("write sqlite file");

    let import = backup::import_workspace_bundle(&raw_file, &workspace).expect("import raw sqlite");
    assert_eq!(import.bundle_format_detected, backup::RAW_SQLITE_FORMAT);

    let restored = std::fs::read(workspace.join("examd.sqlite3")).expect("read restored sqlite");
    assert_eq!(restored, bytes);

    let _ = std::fs::remove_dir_all(out_dir);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn foreign_bundle_format_is_rejected() {
    let out_dir = temp_dir("examd-backup-foreign");
    let workspace = temp_dir("examd-backup-foreign-dst");
    let bundle_path = out_dir.join("foreign.zip");

    let f = File::create(&bundle_path).expect("create zip");
    let mut zip = zip::ZipWriter::new(f);
    zip.start_file("manifest.json", zip::write::FileOptions::default())
        .expect("start manifest");
    zip.write_all(br#"{"format":"someone-else-v9"}"#)
        .expect("write manifest");
    zip.finish().expect("finish zip");

    let e = backup::import_workspace_bundle(&bundle_path, &workspace).expect_err("foreign format");
    assert!(e.to_string().contains("unsupported bundle format"));
    assert!(!workspace.join("examd.sqlite3").exists());

    let _ = std::fs::remove_dir_all(out_dir);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn malformed_snapshot_leaves_database_untouched() {
    let out_dir = temp_dir("examd-backup-badsnap");
    let workspace = temp_dir("examd-backup-badsnap-dst");
    std::fs::write(workspace.join("examd.sqlite3"), b"current").expect("write current db");
    let bundle_path = out_dir.join("bad.zip");

    let f = File::create(&bundle_path).expect("create zip");
    let mut zip = zip::ZipWriter::new(f);
    let opts = zip::write::FileOptions::default();
    zip.start_file("manifest.json", opts).expect("start manifest");
    zip.write_all(br#"{"format":"examd-workspace-v1"}"#)
        .expect("write manifest");
    zip.start_file("db/examd.sqlite3", opts).expect("start db");
    zip.write_all(b"replacement").expect("write db");
    zip.start_file("exchange/scores.json", opts)
        .expect("start snapshot");
    zip.write_all(br#"{"not-a-year": {}}"#).expect("write snapshot");
    zip.finish().expect("finish zip");

    let e = backup::import_workspace_bundle(&bundle_path, &workspace).expect_err("bad snapshot");
    assert!(e.to_string().contains("not a year"));
    let kept = std::fs::read(workspace.join("examd.sqlite3")).expect("read db");
    assert_eq!(kept, b"current");

    let _ = std::fs::remove_dir_all(out_dir);
    let _ = std::fs::remove_dir_all(workspace);
}

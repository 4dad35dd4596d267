//! Workspace bundles: the database plus an optional interchange snapshot,
//! zipped with a manifest.

use anyhow::{anyhow, bail, Context};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const MANIFEST_ENTRY: &str = "manifest.json";
const DB_FILE: &str = "examd.sqlite3";
const DB_ENTRY: &str = "db/examd.sqlite3";
const SNAPSHOT_ENTRY: &str = "exchange/scores.json";
pub const BUNDLE_FORMAT_V1: &str = "examd-workspace-v1";
pub const RAW_SQLITE_FORMAT: &str = "raw-sqlite3";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Manifest {
    format: String,
    #[serde(default)]
    app_version: String,
    #[serde(default)]
    exported_at: String,
    #[serde(default)]
    has_snapshot: bool,
}

#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub bundle_format: String,
    pub entry_count: usize,
}

/// One exam version as recorded in a bundle snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotExam {
    pub fsyear: i64,
    pub subject_code: String,
    pub version: String,
    pub hash: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ImportSummary {
    pub bundle_format_detected: String,
    /// Exams listed in the snapshot, or `None` when the bundle has none.
    pub snapshot_exams: Option<Vec<SnapshotExam>>,
}

impl ImportSummary {
    pub fn has_snapshot(&self) -> bool {
        self.snapshot_exams.is_some()
    }
}

fn write_json_entry<W: Write + std::io::Seek>(
    zip: &mut ZipWriter<W>,
    name: &str,
    value: &impl Serialize,
    opts: FileOptions,
) -> anyhow::Result<()> {
    let text = serde_json::to_string_pretty(value)
        .with_context(|| format!("failed to serialize {}", name))?;
    zip.start_file(name, opts)
        .with_context(|| format!("failed to start {}", name))?;
    zip.write_all(text.as_bytes())
        .with_context(|| format!("failed to write {}", name))?;
    Ok(())
}

/// Zips the workspace database. `snapshot` maps fsyear to an interchange
/// document and is stored beside it.
pub fn export_workspace_bundle(
    workspace_path: &Path,
    out_path: &Path,
    snapshot: Option<&Value>,
) -> anyhow::Result<ExportSummary> {
    let db_path = workspace_path.join(DB_FILE);
    let mut db_file = File::open(&db_path)
        .with_context(|| format!("workspace database not found: {}", db_path.display()))?;

    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }
    let out_file = File::create(out_path)
        .with_context(|| format!("failed to create output file {}", out_path.display()))?;
    let mut zip = ZipWriter::new(out_file);
    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let manifest = Manifest {
        format: BUNDLE_FORMAT_V1.to_string(),
        app_version: env!("CARGO_PKG_VERSION").to_string(),
        exported_at: chrono::Utc::now().to_rfc3339(),
        has_snapshot: snapshot.is_some(),
    };
    write_json_entry(&mut zip, MANIFEST_ENTRY, &manifest, opts)?;

    zip.start_file(DB_ENTRY, opts)
        .context("failed to start database entry")?;
    std::io::copy(&mut db_file, &mut zip).context("failed to write database entry")?;

    if let Some(doc) = snapshot {
        write_json_entry(&mut zip, SNAPSHOT_ENTRY, doc, opts)?;
    }
    zip.finish().context("failed to finalize zip bundle")?;

    Ok(ExportSummary {
        bundle_format: manifest.format,
        entry_count: if manifest.has_snapshot { 3 } else { 2 },
    })
}

/// Restores a bundle, or a bare SQLite file, as the workspace database. The
/// database is swapped in only after the manifest and snapshot parse.
pub fn import_workspace_bundle(
    in_path: &Path,
    workspace_path: &Path,
) -> anyhow::Result<ImportSummary> {
    std::fs::create_dir_all(workspace_path)
        .with_context(|| format!("failed to create workspace {}", workspace_path.display()))?;
    let dst = workspace_path.join(DB_FILE);

    if !has_zip_signature(in_path)? {
        let mut src = File::open(in_path)
            .with_context(|| format!("failed to open {}", in_path.display()))?;
        install_database(&mut src, &dst)?;
        return Ok(ImportSummary {
            bundle_format_detected: RAW_SQLITE_FORMAT.to_string(),
            snapshot_exams: None,
        });
    }

    let in_file = File::open(in_path)
        .with_context(|| format!("failed to open bundle {}", in_path.display()))?;
    let mut archive = ZipArchive::new(in_file).context("invalid zip archive")?;

    let manifest: Manifest = serde_json::from_str(&read_text_entry(&mut archive, MANIFEST_ENTRY)?)
        .context("manifest.json is invalid")?;
    if manifest.format != BUNDLE_FORMAT_V1 {
        bail!("unsupported bundle format: {}", manifest.format);
    }

    let snapshot_exams = if archive.file_names().any(|n| n == SNAPSHOT_ENTRY) {
        let text = read_text_entry(&mut archive, SNAPSHOT_ENTRY)?;
        let doc: Value = serde_json::from_str(&text).context("snapshot is invalid JSON")?;
        Some(index_snapshot(&doc)?)
    } else {
        None
    };

    let mut db_entry = archive
        .by_name(DB_ENTRY)
        .with_context(|| format!("bundle missing {}", DB_ENTRY))?;
    install_database(&mut db_entry, &dst)?;

    Ok(ImportSummary {
        bundle_format_detected: manifest.format,
        snapshot_exams,
    })
}

fn read_text_entry(archive: &mut ZipArchive<File>, name: &str) -> anyhow::Result<String> {
    let mut text = String::new();
    archive
        .by_name(name)
        .with_context(|| format!("bundle missing {}", name))?
        .read_to_string(&mut text)
        .with_context(|| format!("failed to read {}", name))?;
    Ok(text)
}

/// Lists every exam version of a `{fsyear: document}` snapshot.
pub fn index_snapshot(doc: &Value) -> anyhow::Result<Vec<SnapshotExam>> {
    let years = doc
        .as_object()
        .ok_or_else(|| anyhow!("snapshot must be an object keyed by fsyear"))?;
    let mut out = Vec::new();
    for (year, year_doc) in years {
        let fsyear: i64 = year
            .parse()
            .with_context(|| format!("snapshot key {} is not a year", year))?;
        let Some(subjects) = year_doc.get("subjects").and_then(Value::as_object) else {
            continue;
        };
        for (code, block) in subjects {
            let Some(exams) = block.get("exams").and_then(Value::as_object) else {
                continue;
            };
            for (version, exam) in exams {
                out.push(SnapshotExam {
                    fsyear,
                    subject_code: code.clone(),
                    version: version.clone(),
                    hash: exam.get("hash").and_then(Value::as_str).map(str::to_string),
                });
            }
        }
    }
    Ok(out)
}

/// Streams `src` next to `dst`, then renames it over `dst`.
fn install_database(src: &mut impl Read, dst: &Path) -> anyhow::Result<()> {
    let staging = PathBuf::from(format!("{}.importing", dst.display()));
    {
        let mut out = File::create(&staging)
            .with_context(|| format!("failed to create {}", staging.display()))?;
        std::io::copy(src, &mut out).context("failed to extract database")?;
        out.flush().context("failed to flush extracted database")?;
    }
    if dst.exists() {
        std::fs::remove_file(dst)
            .with_context(|| format!("failed to remove existing database {}", dst.display()))?;
    }
    if let Err(e) = std::fs::rename(&staging, dst) {
        let _ = std::fs::remove_file(&staging);
        return Err(e).with_context(|| format!("failed to move database to {}", dst.display()));
    }
    Ok(())
}

fn has_zip_signature(path: &Path) -> anyhow::Result<bool> {
    let mut sig = [0u8; 4];
    let mut f = File::open(path)
        .with_context(|| format!("failed to open input file {}", path.display()))?;
    match f.read_exact(&mut sig) {
        Ok(()) => Ok(&sig == b"PK\x03\x04"),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e).context("failed to read file signature"),
    }
}

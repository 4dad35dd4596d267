use crate::db;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;

pub const DEFAULTS_KEY: &str = "exam.defaults";
pub const TOOL_VERSION: &str = concat!("examd-", env!("CARGO_PKG_VERSION"));
const DEFAULT_BULK_UPDATE_MAX_ITEMS: usize = 5000;

/// Process-level settings read once at start-up.
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    pub log_filter: String,
    pub workspace: Option<PathBuf>,
}

impl ProcessConfig {
    pub fn from_env() -> Self {
        let log_filter = std::env::var("EXAMD_LOG")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "info".to_string());
        let workspace = std::env::var("EXAMD_WORKSPACE")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);
        Self {
            log_filter,
            workspace,
        }
    }
}

/// Workspace defaults, stored as one JSON section in the settings table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExamDefaults {
    pub fsyear: Option<i64>,
    pub term: Option<i64>,
    pub tool_version: String,
    pub bulk_update_max_items: usize,
}

impl Default for ExamDefaults {
    fn default() -> Self {
        Self {
            fsyear: None,
            term: None,
            tool_version: TOOL_VERSION.to_string(),
            bulk_update_max_items: DEFAULT_BULK_UPDATE_MAX_ITEMS,
        }
    }
}

impl ExamDefaults {
    pub fn load(conn: &Connection) -> anyhow::Result<Self> {
        match db::settings_get_json(conn, DEFAULTS_KEY)? {
            Some(v) => Ok(serde_json::from_value(v)?),
            None => Ok(Self::default()),
        }
    }

    pub fn save(&self, conn: &Connection) -> anyhow::Result<()> {
        db::settings_set_json(conn, DEFAULTS_KEY, &serde_json::to_value(self)?)
    }

    /// Applies a partial update. Unknown keys and wrong types are rejected.
    pub fn merge_patch(&mut self, patch: &Map<String, Value>) -> Result<(), String> {
        for (key, value) in patch {
            match key.as_str() {
                "fsyear" => self.fsyear = optional_year(key, value)?,
                "term" => self.term = optional_year(key, value)?,
                "toolVersion" => {
                    let Some(s) = value.as_str().filter(|s| !s.trim().is_empty()) else {
                        return Err("toolVersion must be a non-empty string".to_string());
                    };
                    self.tool_version = s.trim().to_string();
                }
                "bulkUpdateMaxItems" => match value.as_u64() {
                    Some(n) if n > 0 => self.bulk_update_max_items = n as usize,
                    _ => return Err("bulkUpdateMaxItems must be a positive integer".to_string()),
                },
                other => return Err(format!("unknown settings key: {}", other)),
            }
        }
        Ok(())
    }
}

fn optional_year(key: &str, value: &Value) -> Result<Option<i64>, String> {
    if value.is_null() {
        return Ok(None);
    }
    match value.as_i64() {
        Some(n) if n > 0 => Ok(Some(n)),
        _ => Err(format!("{} must be a positive integer or null", key)),
    }
}

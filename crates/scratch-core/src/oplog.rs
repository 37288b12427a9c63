//! Per-scratch, per-operation audit logs: `logs/<UTC stamp>-<op>.log`.
//!
//! Writing the log never fails the operation it describes; I/O errors are
//! reported through `tracing` and otherwise ignored. Only [`OpLog::open`]
//! creates the log directory, so a log outliving its scratch directory
//! cannot bring it back.

use crate::error::Result;
use crate::exec::{CommandOutput, Invocation};
use crate::paths;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const STAMP_FORMAT: &str = "%Y%m%dT%H%M%SZ";

pub struct OpLog {
    path: PathBuf,
}

impl OpLog {
    pub fn open(releases: &Path, identity: &str, operation: &str) -> Self {
        let now = Utc::now();
        let path = paths::logs_dir(releases, identity)
            .join(format!("{}-{operation}.log", now.format(STAMP_FORMAT)));
        if let Some(parent) = path.parent() {
            if let Err(e) = crate::io::ensure_dir(parent) {
                tracing::warn!(path = %parent.display(), error = %e, "cannot create log directory");
            }
        }
        let log = Self { path };
        log.line(&format!("== {operation} {identity} at {}", now.to_rfc3339()));
        log
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn step(&self, message: &str) {
        self.line(&format!("-- {message}"));
    }

    pub fn failure(&self, message: &str) {
        self.line(&format!("!! {message}"));
    }

    pub fn invocation(&self, invocation: &Invocation, output: &Result<CommandOutput>) {
        self.line(&format!("$ {}", invocation.display()));
        match output {
            Ok(out) => {
                for (label, text) in [("stdout", &out.stdout), ("stderr", &out.stderr)] {
                    for l in text.lines() {
                        self.line(&format!("  [{label}] {l}"));
                    }
                }
                self.line(&format!(
                    "  exit {} after {}ms",
                    out.exit_code,
                    out.duration.as_millis()
                ));
            }
            Err(e) => self.line(&format!("  error: {e}")),
        }
    }

    pub fn finish<T>(&self, result: &Result<T>) {
        match result {
            Ok(_) => self.line("== ok"),
            Err(e) => self.line(&format!("== failed: {e}")),
        }
    }

    fn line(&self, text: &str) {
        let stamp = Utc::now().format("%H:%M:%S%.3f");
        if let Err(e) = crate::io::append_text(&self.path, &format!("{stamp} {text}\n")) {
            tracing::warn!(path = %self.path.display(), error = %e, "operation log write failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Listing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpLogEntry {
    pub file: String,
    pub operation: String,
    pub started_at: DateTime<Utc>,
}

/// Audit logs of a scratch, oldest first. Files not named by [`OpLog`]
/// (e.g. the container output tail) are skipped.
pub fn list(releases: &Path, identity: &str) -> Result<Vec<OpLogEntry>> {
    let dir = paths::logs_dir(releases, identity);
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for entry in std::fs::read_dir(&dir)? {
        let file = entry?.file_name().to_string_lossy().into_owned();
        if let Some(parsed) = parse_file_name(&file) {
            out.push(parsed);
        }
    }
    out.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.file.cmp(&b.file)));
    Ok(out)
}

pub fn read(releases: &Path, identity: &str, file: &str) -> Result<String> {
    if parse_file_name(file).is_none() {
        return Err(crate::error::ScratchError::InvalidPath(file.to_string()));
    }
    Ok(std::fs::read_to_string(
        paths::logs_dir(releases, identity).join(file),
    )?)
}

fn parse_file_name(file: &str) -> Option<OpLogEntry> {
    let stem = file.strip_suffix(".log")?;
    let (stamp, operation) = stem.split_once('-')?;
    let at = NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT).ok()?;
    if operation.is_empty() || operation.contains(['/', '\\']) {
        return None;
    }
    Some(OpLogEntry {
        file: file.to_string(),
        operation: operation.to_string(),
        started_at: at.and_utc(),
    })
}

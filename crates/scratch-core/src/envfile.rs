//! Per-scratch env files under `<scratch>/env/`.
//!
//! Every read and write names a file by its bare name (`backend` or
//! `backend.env`); anything that could resolve outside the env directory is
//! rejected with `InvalidPath` before touching the filesystem.

use crate::error::{Result, ScratchError};
use crate::paths;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvFile {
    pub name: String,
    pub content: String,
    /// `KEY=value` pairs in file order; comments and blank lines skipped.
    pub entries: Vec<(String, String)>,
}

impl EnvFile {
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            name: name.into(),
            entries: parse_entries(&content),
            content,
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Validate an env file name and return its stem. Separators, `..`,
/// leading dots and absolute paths are rejected.
pub fn validate_name(raw: &str) -> Result<String> {
    let invalid = || ScratchError::InvalidPath(raw.to_string());
    let name = paths::env_name(raw);
    if name.is_empty()
        || name.starts_with('.')
        || name.contains("..")
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(invalid());
    }
    Ok(name.to_string())
}

/// Resolve a validated name to its path, refusing symlinks that lead out of
/// the env directory.
pub fn resolve(releases: &Path, identity: &str, raw: &str) -> Result<PathBuf> {
    let name = validate_name(raw)?;
    let dir = paths::env_dir(releases, identity);
    let path = paths::env_file_path(releases, identity, &name);
    if path.exists() {
        let real = path.canonicalize()?;
        let real_dir = dir.canonicalize()?;
        if !real.starts_with(&real_dir) {
            return Err(ScratchError::InvalidPath(raw.to_string()));
        }
    }
    Ok(path)
}

/// All env files of a scratch, keyed by name.
pub fn read_all(releases: &Path, identity: &str) -> Result<BTreeMap<String, EnvFile>> {
    let dir = paths::env_dir(releases, identity);
    let mut out = BTreeMap::new();
    if !dir.is_dir() {
        return Ok(out);
    }
    for entry in std::fs::read_dir(&dir)? {
        let entry = entry?;
        let file_name = entry.file_name().to_string_lossy().into_owned();
        if !entry.file_type()?.is_file() || !file_name.ends_with(&format!(".{}", paths::ENV_EXT)) {
            continue;
        }
        let Ok(name) = validate_name(&file_name) else {
            continue;
        };
        let content = std::fs::read_to_string(entry.path())?;
        out.insert(name.clone(), EnvFile::new(name, content));
    }
    Ok(out)
}

pub fn read(releases: &Path, identity: &str, raw: &str) -> Result<EnvFile> {
    let path = resolve(releases, identity, raw)?;
    let name = validate_name(raw)?;
    if !path.exists() {
        return Err(ScratchError::NotFound(format!("{identity}/env/{name}")));
    }
    Ok(EnvFile::new(name, std::fs::read_to_string(path)?))
}

/// Replace one env file's content. Returns true if the content changed.
pub fn write(releases: &Path, identity: &str, raw: &str, content: &str) -> Result<bool> {
    let path = resolve(releases, identity, raw)?;
    crate::io::write_if_changed(&path, content.as_bytes())
}

/// Parse `KEY=value` lines. Supports `export KEY=value`, single or double
/// quoted values, and skips comments and malformed lines.
pub fn parse_entries(content: &str) -> Vec<(String, String)> {
    content
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            let line = line.strip_prefix("export ").unwrap_or(line);
            let (key, value) = line.split_once('=')?;
            let key = key.trim();
            if key.is_empty() || key.contains(char::is_whitespace) {
                return None;
            }
            Some((key.to_string(), unquote(value.trim()).to_string()))
        })
        .collect()
}

fn unquote(v: &str) -> &str {
    for q in ['"', '\''] {
        if v.len() >= 2 && v.starts_with(q) && v.ends_with(q) {
            return &v[1..v.len() - 1];
        }
    }
    v
}

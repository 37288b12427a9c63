//! Canonical scratch identities derived from branch names.
//!
//! An identity is lower-case ASCII restricted to `[a-z0-9_-]`, at most
//! [`MAX_LEN`] characters so it always fits in a single DNS label. Distinct
//! branches may sanitize to the same identity; see `Controller::create`.

use crate::error::{Result, ScratchError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Longest identity accepted; a DNS label is at most 63 octets.
pub const MAX_LEN: usize = 63;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identity(String);

impl Identity {
    /// Derive an identity from an arbitrary branch name: lower-case it and
    /// strip every character outside the allow-list.
    pub fn from_branch(branch: &str) -> Result<Self> {
        let sanitized = sanitize(branch);
        if sanitized.is_empty() {
            return Err(ScratchError::InvalidIdentity(branch.to_string()));
        }
        Ok(Self(sanitized))
    }

    /// Accept an identity supplied verbatim (path parameter, `--name`).
    /// Fails unless it is already canonical.
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.is_empty() || raw.len() > MAX_LEN || sanitize(raw) != raw {
            return Err(ScratchError::InvalidIdentity(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn sanitize(raw: &str) -> String {
    raw.chars()
        .filter(|c| is_allowed(*c))
        .map(|c| c.to_ascii_lowercase())
        .take(MAX_LEN)
        .collect()
}

fn is_allowed(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Identity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::str::FromStr for Identity {
    type Err = ScratchError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Identity {
    type Error = ScratchError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Identity> for String {
    fn from(value: Identity) -> Self {
        value.0
    }
}

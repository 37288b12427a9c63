use crate::error::{Result, ScratchError};
use crate::identity::Identity;
use crate::paths;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

// ---------------------------------------------------------------------------
// ScratchState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScratchState {
    Absent,
    Materializing,
    Initializing,
    Running,
    Stopped,
    Degraded,
    Deleted,
}

impl ScratchState {
    /// Whether a lifecycle step may move a scratch from `self` to `to`.
    pub fn can_transition(self, to: ScratchState) -> bool {
        use ScratchState::*;
        match (self, to) {
            (Deleted, _) => false,
            (_, Deleted) => self != Absent,
            (Absent, Materializing) => true,
            (Materializing, Initializing | Degraded) => true,
            // Interrupted materialization is resumed by an update.
            (Materializing | Initializing, Materializing) => true,
            (Initializing, Running | Degraded | Stopped) => true,
            (Running | Stopped | Degraded, Materializing | Initializing | Stopped) => true,
            (Running | Degraded, Degraded) => true,
            _ => false,
        }
    }

    /// States in which `create` re-targets an update instead of failing.
    pub fn is_materialized(self) -> bool {
        !matches!(self, ScratchState::Absent | ScratchState::Deleted)
    }
}

impl fmt::Display for ScratchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScratchState::Absent => "absent",
            ScratchState::Materializing => "materializing",
            ScratchState::Initializing => "initializing",
            ScratchState::Running => "running",
            ScratchState::Stopped => "stopped",
            ScratchState::Degraded => "degraded",
            ScratchState::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// ScratchEnvironment
// ---------------------------------------------------------------------------

/// The persisted record of one scratch, `<releases>/<identity>/.scratch.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScratchEnvironment {
    pub identity: Identity,
    pub branch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    pub services: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    pub state: ScratchState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Failures recorded by the last operation that left the scratch degraded.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unhealthy: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_operation: Option<String>,
}

impl ScratchEnvironment {
    pub fn new(
        identity: Identity,
        branch: impl Into<String>,
        profile: Option<String>,
        services: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            identity,
            branch: branch.into(),
            profile,
            services,
            database: None,
            state: ScratchState::Absent,
            created_at: now,
            updated_at: now,
            failures: Vec::new(),
            unhealthy: Vec::new(),
            last_operation: None,
        }
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            let id = path
                .parent()
                .and_then(|p| p.file_name())
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            return Err(ScratchError::NotFound(id));
        }
        let data = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&data)?)
    }

    pub fn load_in(releases: &Path, identity: &Identity) -> Result<Self> {
        Self::load(&paths::manifest_path(releases, identity.as_str()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(path, data.as_bytes())
    }

    pub fn save_in(&self, releases: &Path) -> Result<()> {
        self.save(&paths::manifest_path(releases, self.identity.as_str()))
    }

    /// Identities of every scratch directory under `releases`, sorted. The
    /// directory listing is the registry; entries without a manifest or with
    /// a non-canonical name are skipped.
    pub fn identities(releases: &Path) -> Result<Vec<Identity>> {
        if !releases.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in std::fs::read_dir(releases)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let Ok(identity) = Identity::parse(&name) else {
                continue;
            };
            if paths::manifest_path(releases, &name).exists() {
                out.push(identity);
            }
        }
        out.sort();
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    pub fn transition(&mut self, to: ScratchState) -> Result<()> {
        if !self.state.can_transition(to) {
            return Err(ScratchError::InvalidTransition {
                identity: self.identity.to_string(),
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }
        tracing::debug!(identity = %self.identity, from = %self.state, to = %to, "transition");
        self.state = to;
        self.updated_at = Utc::now();
        if to == ScratchState::Running {
            self.failures.clear();
            self.unhealthy.clear();
        }
        Ok(())
    }

    /// Record failures and move to `degraded`.
    pub fn degrade(&mut self, failures: Vec<String>, unhealthy: Vec<String>) -> Result<()> {
        self.transition(ScratchState::Degraded)?;
        self.failures = failures;
        self.unhealthy = unhealthy;
        Ok(())
    }
}

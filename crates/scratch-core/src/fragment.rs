use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Declarative description of one service, composed into deployment
/// descriptors. Loaded from the `services` list of `scratch.yaml`; its
/// position in that list fixes its position in every rendered descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceFragment {
    pub name: String,
    /// One instance for every scratch instead of one per scratch.
    #[serde(default)]
    pub shared: bool,
    pub image: String,
    /// Build context, relative to the project root. Services with a build
    /// context are refreshed by `rebuild`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<u16>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Names of templated env files (without `.env`) loaded by this service.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env_files: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    /// Container port the ingress reaches through `sockets/<name>.sock`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expose: Option<u16>,
    /// Consumes the scratch database; stopped and re-initialized by
    /// `wipe_database`.
    #[serde(default)]
    pub data: bool,
    /// One-shot initializer run in a throwaway container of this service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init: Option<Vec<String>>,
    /// Unhealthy required services mark the scratch degraded.
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

fn default_required() -> bool {
    true
}

impl ServiceFragment {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shared: false,
            image: image.into(),
            build: None,
            ports: Vec::new(),
            env: BTreeMap::new(),
            env_files: Vec::new(),
            volumes: Vec::new(),
            healthcheck: None,
            command: None,
            expose: None,
            data: false,
            init: None,
            required: true,
            depends_on: Vec::new(),
        }
    }

    pub fn is_per_scratch(&self) -> bool {
        !self.shared
    }

    pub fn uses_env_file(&self, name: &str) -> bool {
        self.env_files.iter().any(|f| f == name)
    }
}

use crate::error::{Result, ScratchError};
use crate::fragment::ServiceFragment;
use crate::paths;
use crate::routing::RoutingMode;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// ServerConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Shared secret for `X-Hub-Signature-256` on the webhook intake;
    /// unsigned payloads are accepted when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_secret: Option<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3456
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            webhook_secret: None,
        }
    }
}

// ---------------------------------------------------------------------------
// RuntimeConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Container CLI; invoked as `<command> compose ...`.
    #[serde(default = "default_runtime_command")]
    pub command: String,
    #[serde(default = "default_project_prefix")]
    pub project_prefix: String,
    #[serde(default = "default_network")]
    pub network: String,
    #[serde(default = "default_label_prefix")]
    pub label_prefix: String,
    #[serde(default = "default_bridge_image")]
    pub bridge_image: String,
    #[serde(default = "default_log_image")]
    pub log_image: String,
    #[serde(default)]
    pub uid: Option<u32>,
    #[serde(default)]
    pub gid: Option<u32>,
    /// How long to wait for services reporting `starting` to settle.
    #[serde(default = "default_health_timeout")]
    pub health_timeout_secs: u64,
    /// How long to wait for bridge sockets to appear after start.
    #[serde(default = "default_bridge_wait")]
    pub bridge_wait_ms: u64,
    #[serde(default = "default_status_ttl")]
    pub status_ttl_secs: u64,
}

fn default_runtime_command() -> String {
    "docker".to_string()
}

fn default_project_prefix() -> String {
    "scratch".to_string()
}

fn default_network() -> String {
    "scratch-network".to_string()
}

fn default_label_prefix() -> String {
    "scratch".to_string()
}

fn default_bridge_image() -> String {
    "alpine/socat:latest".to_string()
}

fn default_log_image() -> String {
    "docker:cli".to_string()
}

fn default_health_timeout() -> u64 {
    60
}

fn default_bridge_wait() -> u64 {
    10_000
}

fn default_status_ttl() -> u64 {
    2
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            command: default_runtime_command(),
            project_prefix: default_project_prefix(),
            network: default_network(),
            label_prefix: default_label_prefix(),
            bridge_image: default_bridge_image(),
            log_image: default_log_image(),
            uid: None,
            gid: None,
            health_timeout_secs: default_health_timeout(),
            bridge_wait_ms: default_bridge_wait(),
            status_ttl_secs: default_status_ttl(),
        }
    }
}

// ---------------------------------------------------------------------------
// IngressConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngressConfig {
    #[serde(default = "default_domain")]
    pub domain: String,
    #[serde(default)]
    pub routing: RoutingMode,
    /// Service every scratch request is forwarded to.
    #[serde(default = "default_ingress_service")]
    pub service: String,
    /// First DNS label reserved for the control API in subdomain mode.
    #[serde(default = "default_control_host")]
    pub control_host: String,
    /// First path segment reserved for the control API in path mode.
    #[serde(default = "default_control_prefix")]
    pub control_prefix: String,
    /// Releases directory as mounted inside the proxy, when it differs.
    #[serde(default)]
    pub socket_root: Option<PathBuf>,
    #[serde(default)]
    pub fallback_page: Option<PathBuf>,
}

fn default_domain() -> String {
    "scratches.localhost".to_string()
}

fn default_ingress_service() -> String {
    "api".to_string()
}

fn default_control_host() -> String {
    "scratch".to_string()
}

fn default_control_prefix() -> String {
    "_scratch".to_string()
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            domain: default_domain(),
            routing: RoutingMode::default(),
            service: default_ingress_service(),
            control_host: default_control_host(),
            control_prefix: default_control_prefix(),
            socket_root: None,
            fallback_page: None,
        }
    }
}

// ---------------------------------------------------------------------------
// DatabaseConfig
// ---------------------------------------------------------------------------

/// Per-scratch database provisioned inside a shared service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub service: String,
    #[serde(default = "default_db_name")]
    pub name: String,
    /// argv exec'd in the shared container; placeholders are substituted.
    pub create: Vec<String>,
    pub drop: Vec<String>,
    /// Optional probe; exit 0 means the database already exists and
    /// `create` is skipped.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exists: Vec<String>,
}

fn default_db_name() -> String {
    "scratch_{{identity}}".to_string()
}

// ---------------------------------------------------------------------------
// ScratchDefaults / Profile
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScratchDefaults {
    #[serde(default)]
    pub services: Vec<String>,
    #[serde(default)]
    pub profiles: BTreeMap<String, Profile>,
    #[serde(default = "default_env_templates")]
    pub env_templates: PathBuf,
}

fn default_env_templates() -> PathBuf {
    PathBuf::from(paths::DEFAULT_ENV_TEMPLATES_DIR)
}

impl Default for ScratchDefaults {
    fn default() -> Self {
        Self {
            services: Vec::new(),
            profiles: BTreeMap::new(),
            env_templates: default_env_templates(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Profile {
    #[serde(default)]
    pub services: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default = "default_releases_dir")]
    pub releases_dir: PathBuf,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub ingress: IngressConfig,
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
    #[serde(default)]
    pub services: Vec<ServiceFragment>,
    #[serde(default)]
    pub scratch: ScratchDefaults,
}

fn default_releases_dir() -> PathBuf {
    PathBuf::from(paths::DEFAULT_RELEASES_DIR)
}

impl Config {
    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Err(ScratchError::ConfigNotFound);
        }
        let raw = std::fs::read_to_string(&path)?;
        Self::parse(&raw)
    }

    /// Parse YAML after `${VAR}` / `${VAR:-default}` interpolation.
    pub fn parse(raw: &str) -> Result<Self> {
        let interpolated = interpolate_env(raw, |name| std::env::var(name).ok());
        let config: Config = serde_yaml::from_str(&interpolated)?;
        Ok(config)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&paths::config_path(root), data.as_bytes())
    }

    /// Absolute releases directory for a project rooted at `root`.
    pub fn releases_path(&self, root: &Path) -> PathBuf {
        absolutize(root, &self.releases_dir)
    }

    pub fn env_templates_path(&self, root: &Path) -> PathBuf {
        absolutize(root, &self.scratch.env_templates)
    }

    pub fn fragment(&self, name: &str) -> Option<&ServiceFragment> {
        self.services.iter().find(|f| f.name == name)
    }

    pub fn profile(&self, name: &str) -> Option<&Profile> {
        self.scratch.profiles.get(name)
    }

    /// Service names selected by `profile` (or the defaults), validated.
    pub fn selected_services(&self, profile: Option<&str>) -> Result<Vec<String>> {
        let names = match profile {
            Some(p) => {
                let profile = self
                    .profile(p)
                    .ok_or_else(|| ScratchError::UnknownProfile(p.to_string()))?;
                if profile.services.is_empty() {
                    self.scratch.services.clone()
                } else {
                    profile.services.clone()
                }
            }
            None => self.scratch.services.clone(),
        };
        for name in &names {
            if self.fragment(name).is_none() {
                return Err(ScratchError::UnknownService(name.clone()));
            }
        }
        Ok(names)
    }

    /// Fragments named in `selected`, in declaration order of `services`.
    pub fn fragments_for<'a>(&'a self, selected: &[String]) -> Vec<&'a ServiceFragment> {
        self.services
            .iter()
            .filter(|f| selected.iter().any(|s| s == &f.name))
            .collect()
    }

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        let mut seen = HashSet::new();
        for f in &self.services {
            if !seen.insert(f.name.as_str()) {
                warnings.push(error(format!("duplicate service '{}'", f.name)));
            }
            if f.expose.is_some() && f.shared {
                warnings.push(warning(format!(
                    "shared service '{}' sets expose; only per-scratch services are bridged",
                    f.name
                )));
            }
        }
        for name in &self.scratch.services {
            if self.fragment(name).is_none() {
                warnings.push(error(format!("default services name unknown '{name}'")));
            }
        }
        for (pname, profile) in &self.scratch.profiles {
            for name in &profile.services {
                if self.fragment(name).is_none() {
                    warnings.push(error(format!(
                        "profile '{pname}' names unknown service '{name}'"
                    )));
                }
            }
        }
        match self.fragment(&self.ingress.service) {
            Some(f) if f.expose.is_none() => warnings.push(warning(format!(
                "ingress service '{}' has no expose port; requests will hit the fallback page",
                f.name
            ))),
            None => warnings.push(warning(format!(
                "ingress service '{}' is not defined",
                self.ingress.service
            ))),
            _ => {}
        }
        if let Some(db) = &self.database {
            match self.fragment(&db.service) {
                Some(f) if !f.shared => warnings.push(error(format!(
                    "database service '{}' must be shared",
                    db.service
                ))),
                None => warnings.push(error(format!(
                    "database service '{}' is not defined",
                    db.service
                ))),
                _ => {}
            }
        }
        if which::which(&self.runtime.command).is_err() {
            warnings.push(warning(format!(
                "container runtime '{}' not found on PATH",
                self.runtime.command
            )));
        }
        warnings
    }
}

fn warning(message: String) -> ConfigWarning {
    ConfigWarning {
        level: WarnLevel::Warning,
        message,
    }
}

fn error(message: String) -> ConfigWarning {
    ConfigWarning {
        level: WarnLevel::Error,
        message,
    }
}

fn absolutize(root: &Path, p: &Path) -> PathBuf {
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        root.join(p)
    }
}

// ---------------------------------------------------------------------------
// Environment interpolation
// ---------------------------------------------------------------------------

static ENV_RE: OnceLock<Regex> = OnceLock::new();

fn env_re() -> &'static Regex {
    ENV_RE.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").expect("valid regex")
    })
}

/// Replace `${NAME}` and `${NAME:-default}` using `lookup`.
pub fn interpolate_env<F>(raw: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    env_re()
        .replace_all(raw, |caps: &Captures| {
            let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            lookup(&caps[1]).unwrap_or_else(|| default.to_string())
        })
        .into_owned()
}

// ---------------------------------------------------------------------------
// Default config
// ---------------------------------------------------------------------------

pub const DEFAULT_CONFIG: &str = r#"# scratch configuration

server:
  host: 0.0.0.0
  port: 3456
  # webhook_secret: "${SCRATCH_WEBHOOK_SECRET}"

releases_dir: releases

runtime:
  command: docker
  project_prefix: scratch
  network: scratch-network

ingress:
  domain: scratches.localhost
  routing: subdomain   # or: path
  service: api
  control_host: scratch
  control_prefix: _scratch

database:
  service: postgres
  name: "scratch_{{identity}}"
  exists: ["sh", "-c", "psql -U postgres -tAc \"SELECT 1 FROM pg_database WHERE datname = '{{database}}'\" | grep -q 1"]
  create: ["psql", "-U", "postgres", "-c", "CREATE DATABASE \"{{database}}\""]
  drop: ["psql", "-U", "postgres", "-c", "DROP DATABASE IF EXISTS \"{{database}}\" WITH (FORCE)"]

services:
  - name: postgres
    shared: true
    image: postgres:16
    ports: [5432]
    env:
      POSTGRES_USER: postgres
      POSTGRES_PASSWORD: "${POSTGRES_PASSWORD:-postgres}"
    healthcheck: "pg_isready -U postgres"

  - name: redis
    image: redis:7-alpine
    ports: [6379]
    healthcheck: "redis-cli ping"

  - name: api
    image: ghcr.io/example/api:latest
    ports: [3000]
    expose: 3000
    env_files: [backend]
    data: true
    depends_on: [redis]
    # init: ["./bin/migrate"]

scratch:
  services: [postgres, redis, api]
  env_templates: templates/env
  profiles:
    minimal:
      services: [postgres, api]
"#;

pub const DEFAULT_ENV_TEMPLATE: &str = r#"# Rendered for scratch {{identity}} (branch {{branch}})
DATABASE_URL=postgres://postgres:postgres@{{project_prefix}}-shared-postgres:5432/{{database}}
REDIS_URL=redis://redis:6379
PUBLIC_URL={{url}}
"#;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Template composition: fragments + env templates -> concrete files.
//!
//! A [`Composer`] reads the env template sources once and renders a fresh,
//! self-contained descriptor and env file set per scratch. Rendering is a
//! pure function of the selected fragments and the [`Vars`]; writing is the
//! only side effect and never leaves the scratch directory.

use crate::config::Config;
use crate::descriptor::{
    ComposeHealthcheck, ComposeNetwork, ComposeService, ComposeVolume, DeploymentDescriptor,
};
use crate::error::Result;
use crate::fragment::ServiceFragment;
use crate::paths;
use crate::routing;
use crate::scratch::ScratchEnvironment;
use regex::{Captures, Regex};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Auxiliary per-scratch service bridging exposed ports to unix sockets.
pub const BRIDGE_SERVICE: &str = "scratch-bridge";
/// Auxiliary per-scratch service tailing container output into `logs/`.
pub const LOG_SERVICE: &str = "scratch-logs";

/// Postgres truncates identifiers beyond this many bytes.
pub const MAX_DATABASE_NAME: usize = 63;
const NAME_HASH_LEN: usize = 8;

// ---------------------------------------------------------------------------
// Placeholder substitution
// ---------------------------------------------------------------------------

/// Scoped substitution variables, e.g. `identity`, `database`, `uid`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Vars(BTreeMap<String, String>);

impl Vars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }
}

static PLACEHOLDER_RE: OnceLock<Regex> = OnceLock::new();

fn placeholder_re() -> &'static Regex {
    PLACEHOLDER_RE
        .get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("valid regex"))
}

/// Replace `{{name}}` with its value; unknown placeholders are left as-is.
pub fn substitute(template: &str, vars: &Vars) -> String {
    placeholder_re()
        .replace_all(template, |caps: &Captures| match vars.get(&caps[1]) {
            Some(v) => v.to_string(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

fn substitute_all(items: &[String], vars: &Vars) -> Vec<String> {
    items.iter().map(|s| substitute(s, vars)).collect()
}

// ---------------------------------------------------------------------------
// Env templates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvTemplate {
    /// File stem, e.g. `backend` for `backend.env`.
    pub name: String,
    pub content: String,
}

/// Read every `*.env` template under `dir`, sorted by name.
pub fn load_env_templates(dir: &Path) -> Result<Vec<EnvTemplate>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let file_name = entry.file_name().to_string_lossy().into_owned();
        if !file_name.ends_with(&format!(".{}", paths::ENV_EXT)) {
            continue;
        }
        out.push(EnvTemplate {
            name: paths::env_name(&file_name).to_string(),
            content: std::fs::read_to_string(entry.path())?,
        });
    }
    out.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(out)
}

// ---------------------------------------------------------------------------
// Composer
// ---------------------------------------------------------------------------

/// Compose project name of a scratch.
pub fn project_name(config: &Config, identity: &str) -> String {
    format!("{}-{identity}", config.runtime.project_prefix)
}

pub struct Composer<'a> {
    config: &'a Config,
    project_root: PathBuf,
    releases: PathBuf,
    templates: Vec<EnvTemplate>,
    uid: u32,
    gid: u32,
}

impl<'a> Composer<'a> {
    pub fn new(config: &'a Config, project_root: &Path) -> Result<Self> {
        let releases = config.releases_path(project_root);
        let templates = load_env_templates(&config.env_templates_path(project_root))?;
        let (uid, gid) = host_ids(config, project_root);
        Ok(Self {
            config,
            project_root: project_root.to_path_buf(),
            releases,
            templates,
            uid,
            gid,
        })
    }

    pub fn templates(&self) -> &[EnvTemplate] {
        &self.templates
    }

    pub fn template(&self, name: &str) -> Option<&EnvTemplate> {
        self.templates.iter().find(|t| t.name == name)
    }

    pub fn project_name(&self, identity: &str) -> String {
        project_name(self.config, identity)
    }

    pub fn shared_project_name(&self) -> String {
        format!("{}-shared", self.config.runtime.project_prefix)
    }

    fn base_vars(&self) -> Vars {
        let mut vars = Vars::new();
        vars.set("project_prefix", &self.config.runtime.project_prefix)
            .set("network", &self.config.runtime.network)
            .set("domain", &self.config.ingress.domain)
            .set("releases_dir", self.releases.display().to_string())
            .set("uid", self.uid.to_string())
            .set("gid", self.gid.to_string());
        vars
    }

    /// Substitution variables scoped to one scratch.
    pub fn vars(&self, scratch: &ScratchEnvironment) -> Vars {
        let id = scratch.identity.as_str();
        let mut vars = self.base_vars();
        vars.set("identity", id)
            .set("branch", &scratch.branch)
            .set("project", self.project_name(id))
            .set("profile", scratch.profile.clone().unwrap_or_default())
            .set("url", routing::public_url(&self.config.ingress, id))
            .set("scratch_dir", paths::scratch_dir(&self.releases, id).display().to_string())
            .set("env_dir", paths::env_dir(&self.releases, id).display().to_string())
            .set("logs_dir", paths::logs_dir(&self.releases, id).display().to_string())
            .set("sockets_dir", paths::sockets_dir(&self.releases, id).display().to_string());
        if let Some(db) = &scratch.database {
            vars.set("database", db);
        }
        vars
    }

    /// Database name for a scratch, from the configured name template.
    pub fn database_name(&self, identity: &str) -> Option<String> {
        let db = self.config.database.as_ref()?;
        let mut vars = self.base_vars();
        vars.set("identity", identity);
        Some(fit_identifier(substitute(&db.name, &vars)))
    }

    /// Render the per-scratch descriptor. Shared fragments are skipped; they
    /// live only in [`Composer::shared_descriptor`].
    pub fn descriptor(&self, scratch: &ScratchEnvironment, vars: &Vars) -> DeploymentDescriptor {
        let id = scratch.identity.as_str();
        let fragments: Vec<&ServiceFragment> = self
            .config
            .fragments_for(&scratch.services)
            .into_iter()
            .filter(|f| f.is_per_scratch())
            .collect();
        let local: Vec<&str> = fragments.iter().map(|f| f.name.as_str()).collect();
        let profile_env = scratch
            .profile
            .as_deref()
            .and_then(|p| self.config.profile(p))
            .map(|p| p.env.clone())
            .unwrap_or_default();

        let mut d = DeploymentDescriptor::new(self.project_name(id));
        for f in &fragments {
            let mut svc = self.render_fragment(f, vars);
            svc.expose = f.ports.iter().map(|p| p.to_string()).collect();
            svc.env_file = f
                .env_files
                .iter()
                .map(|name| format!("./{}/{name}.{}", paths::ENV_DIR, paths::ENV_EXT))
                .collect();
            for (k, v) in &profile_env {
                svc.environment.insert(k.clone(), substitute(v, vars));
            }
            svc.depends_on = f
                .depends_on
                .iter()
                .filter(|d| local.contains(&d.as_str()))
                .cloned()
                .collect();
            svc.networks = vec!["default".to_string(), self.config.runtime.network.clone()];
            svc.labels = self.labels("scratch", id, &f.name);
            declare_named_volumes(&svc.volumes, &mut d.volumes);
            d.services.push(svc);
        }

        let endpoints = routing::bridge_endpoints(&fragments);
        if !endpoints.is_empty() {
            d.services.push(self.bridge_service(id, &endpoints));
        }
        d.services.push(self.log_service(id));

        d.networks.insert(
            self.config.runtime.network.clone(),
            ComposeNetwork {
                external: Some(true),
                name: Some(self.config.runtime.network.clone()),
            },
        );
        d
    }

    /// Render the descriptor holding every shared fragment, once per host.
    pub fn shared_descriptor(&self) -> DeploymentDescriptor {
        let vars = self.base_vars();
        let mut d = DeploymentDescriptor::new(self.shared_project_name());
        for f in self.config.services.iter().filter(|f| f.shared) {
            let mut svc = self.render_fragment(f, &vars);
            svc.container_name = Some(self.shared_container_name(&f.name));
            svc.ports = f.ports.iter().map(|p| format!("{p}:{p}")).collect();
            svc.networks = vec![self.config.runtime.network.clone()];
            svc.labels = self.labels("shared-service", &f.name, &f.name);
            declare_named_volumes(&svc.volumes, &mut d.volumes);
            d.services.push(svc);
        }
        d.networks.insert(
            self.config.runtime.network.clone(),
            ComposeNetwork {
                external: Some(true),
                name: Some(self.config.runtime.network.clone()),
            },
        );
        d
    }

    pub fn shared_container_name(&self, service: &str) -> String {
        format!("{}-{service}", self.shared_project_name())
    }

    fn render_fragment(&self, f: &ServiceFragment, vars: &Vars) -> ComposeService {
        ComposeService {
            name: f.name.clone(),
            image: substitute(&f.image, vars),
            build: f
                .build
                .as_ref()
                .map(|b| self.project_root.join(substitute(b, vars)).display().to_string()),
            command: f.command.as_ref().map(|c| substitute_all(c, vars)),
            environment: f
                .env
                .iter()
                .map(|(k, v)| (k.clone(), substitute(v, vars)))
                .collect(),
            volumes: substitute_all(&f.volumes, vars),
            healthcheck: f.healthcheck.as_ref().map(|hc| ComposeHealthcheck {
                test: vec!["CMD-SHELL".to_string(), substitute(hc, vars)],
                interval: "10s".to_string(),
                timeout: "5s".to_string(),
                retries: 3,
            }),
            restart: Some("unless-stopped".to_string()),
            ..Default::default()
        }
    }

    fn bridge_service(&self, identity: &str, endpoints: &[routing::BridgeEndpoint]) -> ComposeService {
        ComposeService {
            name: BRIDGE_SERVICE.to_string(),
            image: self.config.runtime.bridge_image.clone(),
            entrypoint: Some(vec!["/bin/sh".to_string(), "-c".to_string()]),
            command: Some(vec![routing::bridge_script(endpoints, self.uid, self.gid)]),
            volumes: vec![format!("./{}:/{}", paths::SOCKETS_DIR, paths::SOCKETS_DIR)],
            depends_on: endpoints.iter().map(|e| e.service.clone()).collect(),
            labels: self.labels("scratch", identity, BRIDGE_SERVICE),
            restart: Some("unless-stopped".to_string()),
            ..Default::default()
        }
    }

    fn log_service(&self, identity: &str) -> ComposeService {
        let project = self.project_name(identity);
        // The host may name the CLI by path; inside the container only the
        // program name resolves.
        let command = &self.config.runtime.command;
        let cli = Path::new(command)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(command);
        ComposeService {
            name: LOG_SERVICE.to_string(),
            image: self.config.runtime.log_image.clone(),
            entrypoint: Some(vec!["/bin/sh".to_string(), "-c".to_string()]),
            command: Some(vec![format!(
                "exec {cli} compose -p {project} logs --follow --no-color --timestamps >> /{}/services.log 2>&1",
                paths::LOGS_DIR
            )]),
            volumes: vec![
                "/var/run/docker.sock:/var/run/docker.sock:ro".to_string(),
                format!("./{}:/{}", paths::LOGS_DIR, paths::LOGS_DIR),
            ],
            labels: self.labels("scratch", identity, LOG_SERVICE),
            restart: Some("unless-stopped".to_string()),
            ..Default::default()
        }
    }

    fn labels(&self, kind: &str, owner: &str, service: &str) -> BTreeMap<String, String> {
        let prefix = &self.config.runtime.label_prefix;
        let mut labels = BTreeMap::new();
        labels.insert(format!("{prefix}.{kind}"), owner.to_string());
        labels.insert(format!("{prefix}.service"), service.to_string());
        labels
    }

    // -----------------------------------------------------------------------
    // Env files
    // -----------------------------------------------------------------------

    pub fn render_env(&self, template: &EnvTemplate, vars: &Vars) -> String {
        substitute(&template.content, vars)
    }

    /// Write the descriptor into the scratch directory. Returns true if it
    /// changed on disk.
    pub fn write_descriptor(&self, identity: &str, descriptor: &DeploymentDescriptor) -> Result<bool> {
        descriptor.save(&paths::descriptor_path(&self.releases, identity))
    }

    /// Render env templates into `env/`. With `overwrite == false` existing
    /// files (possibly operator-edited) are kept. Returns the names written.
    pub fn write_env_files(
        &self,
        identity: &str,
        vars: &Vars,
        only: Option<&[String]>,
        overwrite: bool,
    ) -> Result<Vec<String>> {
        let mut written = Vec::new();
        for t in &self.templates {
            if let Some(names) = only {
                if !names.iter().any(|n| n == &t.name) {
                    continue;
                }
            }
            let path = paths::env_file_path(&self.releases, identity, &t.name);
            let data = self.render_env(t, vars);
            let changed = if overwrite {
                crate::io::write_if_changed(&path, data.as_bytes())?
            } else {
                crate::io::write_if_missing(&path, data.as_bytes())?
            };
            if changed {
                written.push(t.name.clone());
            }
        }
        Ok(written)
    }
}

/// A named volume (`data:/var/lib/x`) must be declared at top level; bind
/// mounts (`./x:/y`, `/abs:/y`) must not.
fn declare_named_volumes(mounts: &[String], volumes: &mut BTreeMap<String, ComposeVolume>) {
    for m in mounts {
        let Some((source, _)) = m.split_once(':') else {
            continue;
        };
        if source.is_empty() || source.starts_with(['.', '/', '~', '$']) {
            continue;
        }
        volumes.entry(source.to_string()).or_default();
    }
}

#[cfg(unix)]
fn host_ids(config: &Config, root: &Path) -> (u32, u32) {
    use std::os::unix::fs::MetadataExt;
    let meta = std::fs::metadata(root).ok();
    let uid = config
        .runtime
        .uid
        .or_else(|| meta.as_ref().map(|m| m.uid()))
        .unwrap_or(0);
    let gid = config
        .runtime
        .gid
        .or_else(|| meta.as_ref().map(|m| m.gid()))
        .unwrap_or(0);
    (uid, gid)
}

#[cfg(not(unix))]
fn host_ids(config: &Config, _root: &Path) -> (u32, u32) {
    (config.runtime.uid.unwrap_or(0), config.runtime.gid.unwrap_or(0))
}

/// Shorten `name` to [`MAX_DATABASE_NAME`] bytes. Long names keep a prefix
/// and gain a hash of the full name, so two identities sharing a long prefix
/// never map to the same database.
fn fit_identifier(name: String) -> String {
    if name.len() <= MAX_DATABASE_NAME {
        return name;
    }
    let digest = hex::encode(Sha256::digest(name.as_bytes()));
    let mut cut = MAX_DATABASE_NAME - NAME_HASH_LEN - 1;
    while !name.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}_{}", &name[..cut], &digest[..NAME_HASH_LEN])
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_CONFIG;
    use crate::identity::Identity;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Config) {
        let dir = TempDir::new().unwrap();
        let mut cfg = Config::parse(DEFAULT_CONFIG).unwrap();
        cfg.runtime.uid = Some(1000);
        cfg.runtime.gid = Some(1000);
        let templates = dir.path().join("templates/env");
        std::fs::create_dir_all(&templates).unwrap();
        std::fs::write(
            templates.join("backend.env"),
            "DB={{database}}\nID={{ identity }}\nKEEP={{future_token}}\n",
        )
        .unwrap();
        std::fs::write(templates.join("frontend.env"), "URL={{url}}\n").unwrap();
        std::fs::write(templates.join("README.md"), "ignored").unwrap();
        (dir, cfg)
    }

    fn scratch(cfg: &Config, composer: &Composer) -> ScratchEnvironment {
        let id = Identity::from_branch("feature/Foo Bar!!").unwrap();
        let mut s = ScratchEnvironment::new(
            id.clone(),
            "feature/Foo Bar!!",
            None,
            cfg.selected_services(None).unwrap(),
        );
        s.database = composer.database_name(id.as_str());
        s
    }

    #[test]
    fn substitute_leaves_unknown_placeholders() {
        let mut vars = Vars::new();
        vars.set("identity", "abc");
        assert_eq!(
            substitute("{{identity}}-{{ identity }}-{{nope}}", &vars),
            "abc-abc-{{nope}}"
        );
    }

    #[test]
    fn templates_load_sorted_and_filtered() {
        let (dir, cfg) = setup();
        let composer = Composer::new(&cfg, dir.path()).unwrap();
        let names: Vec<_> = composer.templates().iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["backend", "frontend"]);
    }

    #[test]
    fn descriptor_is_deterministic() {
        let (dir, cfg) = setup();
        let composer = Composer::new(&cfg, dir.path()).unwrap();
        let s = scratch(&cfg, &composer);
        let vars = composer.vars(&s);
        let a = composer.descriptor(&s, &vars).to_yaml().unwrap();
        let b = composer.descriptor(&s, &vars).to_yaml().unwrap();
        assert_eq!(a, b);

        let composer2 = Composer::new(&cfg, dir.path()).unwrap();
        let c = composer2.descriptor(&s, &composer2.vars(&s)).to_yaml().unwrap();
        assert_eq!(a, c);
    }

    #[test]
    fn descriptor_excludes_shared_and_adds_auxiliaries() {
        let (dir, cfg) = setup();
        let composer = Composer::new(&cfg, dir.path()).unwrap();
        let s = scratch(&cfg, &composer);
        let d = composer.descriptor(&s, &composer.vars(&s));
        assert_eq!(d.name, "scratch-featurefoobar");
        assert_eq!(
            d.service_names(),
            vec!["redis", "api", BRIDGE_SERVICE, LOG_SERVICE]
        );
        assert!(d.service("postgres").is_none());

        let api = d.service("api").unwrap();
        assert_eq!(api.env_file, vec!["./env/backend.env"]);
        assert_eq!(api.depends_on, vec!["redis"]);
        assert_eq!(api.labels["scratch.scratch"], "featurefoobar");

        let bridge = d.service(BRIDGE_SERVICE).unwrap();
        let script = &bridge.command.as_ref().unwrap()[0];
        assert!(script.contains("/sockets/api.sock"));
        assert!(script.contains("TCP:api:3000"));
        assert_eq!(bridge.volumes, vec!["./sockets:/sockets"]);
    }

    #[test]
    fn shared_descriptor_holds_only_shared() {
        let (dir, cfg) = setup();
        let composer = Composer::new(&cfg, dir.path()).unwrap();
        let d = composer.shared_descriptor();
        assert_eq!(d.name, "scratch-shared");
        assert_eq!(d.service_names(), vec!["postgres"]);
        let pg = d.service("postgres").unwrap();
        assert_eq!(pg.container_name.as_deref(), Some("scratch-shared-postgres"));
        assert_eq!(pg.ports, vec!["5432:5432"]);
    }

    #[test]
    fn env_rendering_substitutes_known_tokens_only() {
        let (dir, cfg) = setup();
        let composer = Composer::new(&cfg, dir.path()).unwrap();
        let s = scratch(&cfg, &composer);
        let vars = composer.vars(&s);
        let out = composer.render_env(composer.template("backend").unwrap(), &vars);
        assert_eq!(
            out,
            "DB=scratch_featurefoobar\nID=featurefoobar\nKEEP={{future_token}}\n"
        );
    }

    #[test]
    fn write_env_files_respects_overwrite_flag() {
        let (dir, cfg) = setup();
        let composer = Composer::new(&cfg, dir.path()).unwrap();
        let s = scratch(&cfg, &composer);
        let vars = composer.vars(&s);
        let id = s.identity.as_str();
        assert_eq!(
            composer.write_env_files(id, &vars, None, false).unwrap(),
            vec!["backend", "frontend"]
        );
        let releases = cfg.releases_path(dir.path());
        let backend = paths::env_file_path(&releases, id, "backend");
        std::fs::write(&backend, "EDITED=1\n").unwrap();

        assert!(composer.write_env_files(id, &vars, None, false).unwrap().is_empty());
        assert_eq!(std::fs::read_to_string(&backend).unwrap(), "EDITED=1\n");

        let only = vec!["backend".to_string()];
        assert_eq!(
            composer.write_env_files(id, &vars, Some(&only), true).unwrap(),
            vec!["backend"]
        );
        assert!(std::fs::read_to_string(&backend).unwrap().starts_with("DB="));
    }

    #[test]
    fn named_volumes_are_declared() {
        let mut volumes = BTreeMap::new();
        declare_named_volumes(
            &[
                "pgdata:/var/lib/postgresql/data".to_string(),
                "./seed:/seed".to_string(),
                "/etc/hosts:/etc/hosts:ro".to_string(),
            ],
            &mut volumes,
        );
        assert_eq!(volumes.keys().collect::<Vec<_>>(), vec!["pgdata"]);
    }

    #[test]
    fn long_database_names_fit_postgres_identifiers() {
        let (dir, cfg) = setup();
        let composer = Composer::new(&cfg, dir.path()).unwrap();
        assert_eq!(composer.database_name("short").as_deref(), Some("scratch_short"));

        let a = Identity::from_branch(&format!("{}a", "x".repeat(70))).unwrap();
        let b = Identity::from_branch(&format!("{}b", "x".repeat(62))).unwrap();
        let db_a = composer.database_name(a.as_str()).unwrap();
        let db_b = composer.database_name(b.as_str()).unwrap();
        assert_eq!(db_a.len(), MAX_DATABASE_NAME);
        assert_eq!(db_b.len(), MAX_DATABASE_NAME);
        assert!(db_a.starts_with("scratch_xxx"));
        assert_ne!(db_a, db_b);
        assert_eq!(composer.database_name(a.as_str()).unwrap(), db_a, "stable");
    }

    #[test]
    fn log_service_uses_configured_runtime() {
        let (dir, mut cfg) = setup();
        cfg.runtime.command = "/usr/local/bin/podman".into();
        let composer = Composer::new(&cfg, dir.path()).unwrap();
        let s = scratch(&cfg, &composer);
        let d = composer.descriptor(&s, &composer.vars(&s));
        let script = &d.service(LOG_SERVICE).unwrap().command.as_ref().unwrap()[0];
        assert!(script.starts_with("exec podman compose -p scratch-featurefoobar logs"), "{script}");
        assert!(!script.contains("docker compose"));
    }
}

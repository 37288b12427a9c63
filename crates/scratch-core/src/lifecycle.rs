//! Lifecycle controller.
//!
//! Every mutating operation follows the same order: validate inputs, take
//! the per-identity ticket from the [`OpGuard`], check existence, then open
//! the operation log and act. Validation and guard failures therefore never
//! leave anything behind on disk.
//!
//! A failing external step after materialization does not roll anything
//! back: the scratch is marked `degraded`, the reasons are stored in its
//! manifest, and the caller gets `ScratchError::Degraded`. Re-issuing
//! `update`, `restart` or `delete` is the remedy.

use crate::cache::ExpiringCache;
use crate::compose::{Project, Runtime, ServiceStatus};
use crate::composer::{self, Composer, BRIDGE_SERVICE, LOG_SERVICE};
use crate::config::Config;
use crate::descriptor::DeploymentDescriptor;
use crate::envfile::{self, EnvFile};
use crate::error::{Result, ScratchError};
use crate::exec::{CommandRunner, SystemRunner};
use crate::fragment::ServiceFragment;
use crate::guard::{OpGuard, OpTicket};
use crate::identity::Identity;
use crate::oplog::{self, OpLog, OpLogEntry};
use crate::paths;
use crate::routing::{self, RouteBinding};
use crate::scratch::{ScratchEnvironment, ScratchState};
use crate::shared::SharedServices;
use crate::webhook::{self, WebhookIntent};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{info, warn};

const HEALTH_POLL: Duration = Duration::from_secs(1);
pub const DEFAULT_LOG_TAIL: usize = 200;

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreateOutcome {
    Created,
    /// The identity already existed; the call became an update.
    Updated,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateResult {
    pub outcome: CreateOutcome,
    pub url: String,
    pub scratch: ScratchEnvironment,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update: Option<UpdateReport>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpdateReport {
    pub changed: Vec<String>,
    pub removed: Vec<String>,
    pub env_added: Vec<String>,
    pub redeployed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnvReport {
    /// Files targeted by the call.
    pub files: Vec<String>,
    /// Files whose content actually changed.
    pub changed: Vec<String>,
    /// Per-scratch services recreated to pick up the change.
    pub redeployed: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LiveState {
    Running,
    Partial,
    Stopped,
    Unknown,
}

impl fmt::Display for LiveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LiveState::Running => "running",
            LiveState::Partial => "partial",
            LiveState::Stopped => "stopped",
            LiveState::Unknown => "unknown",
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScratchStatus {
    pub identity: Identity,
    pub state: ScratchState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_flight: Option<String>,
    pub live: LiveState,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scratch: Option<ScratchEnvironment>,
    pub services: Vec<ServiceStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum WebhookOutcome {
    Deployed(CreateResult),
    Ignored { reason: String },
}

// ---------------------------------------------------------------------------
// Internal bookkeeping
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Findings {
    failures: Vec<String>,
    unhealthy: Vec<String>,
}

impl Findings {
    fn record(&mut self, log: &OpLog, step: &str, err: ScratchError) {
        let msg = format!("{step}: {err}");
        log.failure(&msg);
        warn!(step, error = %err, "lifecycle step failed");
        self.failures.push(msg);
    }

    fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.unhealthy.is_empty()
    }

    fn reasons(&self) -> Vec<String> {
        let mut out = self.failures.clone();
        out.extend(
            self.unhealthy
                .iter()
                .map(|s| format!("service '{s}' is not healthy")),
        );
        out
    }
}

/// What a bring-up pass does beyond `up -d`.
#[derive(Default)]
struct BringUp {
    /// Services whose initializer runs before start.
    init: Vec<String>,
    provision_database: bool,
    /// Restrict `up` to these services (with `--no-deps`); `None` means all.
    only: Option<Vec<String>>,
}

struct Rendered {
    changed: Vec<String>,
    added: Vec<String>,
    removed: Vec<String>,
    env_added: Vec<String>,
}

fn lock(m: &Mutex<()>) -> MutexGuard<'_, ()> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

pub struct Controller {
    root: PathBuf,
    config: Config,
    releases: PathBuf,
    runtime: Runtime,
    guard: OpGuard,
    shared_lock: Mutex<()>,
    status_cache: ExpiringCache<String, Vec<ServiceStatus>>,
}

impl Controller {
    pub fn new(root: &Path, config: Config, runner: Arc<dyn CommandRunner>) -> Self {
        let releases = config.releases_path(root);
        let runtime = Runtime::new(runner, config.runtime.command.clone());
        let ttl = Duration::from_secs(config.runtime.status_ttl_secs);
        Self {
            root: root.to_path_buf(),
            releases,
            runtime,
            guard: OpGuard::new(),
            shared_lock: Mutex::new(()),
            status_cache: ExpiringCache::new(ttl),
            config,
        }
    }

    /// Load `scratch.yaml` under `root` and drive the real container CLI.
    pub fn load(root: &Path) -> Result<Self> {
        let config = Config::load(root)?;
        Ok(Self::new(root, config, Arc::new(SystemRunner)))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn releases(&self) -> &Path {
        &self.releases
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn guard(&self) -> &OpGuard {
        &self.guard
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn composer(&self) -> Result<Composer<'_>> {
        Composer::new(&self.config, &self.root)
    }

    fn shared<'a>(&'a self, composer: &'a Composer<'a>) -> SharedServices<'a> {
        SharedServices::new(&self.config, composer, &self.runtime, &self.releases)
    }

    fn project(&self, identity: &Identity) -> Project<'_> {
        let id = identity.as_str();
        self.runtime.project(
            composer::project_name(&self.config, id),
            &paths::scratch_dir(&self.releases, id),
            &paths::descriptor_path(&self.releases, id),
        )
    }

    fn per_scratch(&self, scratch: &ScratchEnvironment) -> Vec<&ServiceFragment> {
        self.config
            .fragments_for(&scratch.services)
            .into_iter()
            .filter(|f| f.is_per_scratch())
            .collect()
    }

    fn per_scratch_names(&self, scratch: &ScratchEnvironment) -> Vec<String> {
        self.per_scratch(scratch)
            .iter()
            .map(|f| f.name.clone())
            .collect()
    }

    fn database_for(&self, composer: &Composer, scratch: &ScratchEnvironment) -> Option<String> {
        let db = self.config.database.as_ref()?;
        if !scratch.services.contains(&db.service) {
            return None;
        }
        composer.database_name(scratch.identity.as_str())
    }

    /// Take the ticket, then require the scratch to exist.
    fn begin(&self, identity: &Identity, operation: &str) -> Result<(OpTicket, ScratchEnvironment)> {
        let ticket = self.guard.acquire(identity.as_str(), operation)?;
        let mut scratch = ScratchEnvironment::load_in(&self.releases, identity)?;
        scratch.last_operation = Some(operation.to_string());
        Ok((ticket, scratch))
    }

    fn save(&self, scratch: &ScratchEnvironment) -> Result<()> {
        scratch.save_in(&self.releases)?;
        self.status_cache.invalidate(&scratch.identity.to_string());
        Ok(())
    }

    /// Run `f` with an operation log, recording its outcome.
    fn logged<T>(
        &self,
        identity: &Identity,
        operation: &str,
        f: impl FnOnce(&OpLog) -> Result<T>,
    ) -> Result<T> {
        let log = OpLog::open(&self.releases, identity.as_str(), operation);
        info!(identity = %identity, operation, "operation started");
        let result = f(&log);
        log.finish(&result);
        self.status_cache.invalidate(&identity.to_string());
        match &result {
            Ok(_) => info!(identity = %identity, operation, "operation finished"),
            Err(e) => warn!(identity = %identity, operation, error = %e, "operation failed"),
        }
        result
    }

    /// Move to `running` when clean, otherwise record and return `Degraded`.
    fn settle(&self, scratch: &mut ScratchEnvironment, findings: Findings) -> Result<()> {
        if findings.is_clean() {
            scratch.transition(ScratchState::Running)?;
            return self.save(scratch);
        }
        let reasons = findings.reasons();
        scratch.degrade(findings.failures, findings.unhealthy)?;
        self.save(scratch)?;
        Err(ScratchError::Degraded {
            identity: scratch.identity.to_string(),
            reasons,
        })
    }

    /// Keep a failure that escaped a bring-up visible in the manifest.
    fn record_failure(&self, scratch: &mut ScratchEnvironment, err: &ScratchError) {
        if matches!(err, ScratchError::Degraded { .. }) {
            return;
        }
        if scratch.degrade(vec![err.to_string()], Vec::new()).is_ok() {
            if let Err(e) = self.save(scratch) {
                warn!(identity = %scratch.identity, error = %e, "failed to record failure");
            }
        }
    }

    fn render(&self, composer: &Composer, scratch: &ScratchEnvironment, log: &OpLog) -> Result<Rendered> {
        let id = scratch.identity.as_str();
        for dir in [
            paths::env_dir(&self.releases, id),
            paths::logs_dir(&self.releases, id),
            paths::sockets_dir(&self.releases, id),
        ] {
            crate::io::ensure_dir(&dir)?;
        }
        let path = paths::descriptor_path(&self.releases, id);
        let previous = if path.exists() {
            DeploymentDescriptor::load(&path)?
        } else {
            DeploymentDescriptor::new(composer.project_name(id))
        };
        let vars = composer.vars(scratch);
        let descriptor = composer.descriptor(scratch, &vars);
        if composer.write_descriptor(id, &descriptor)? {
            log.step("descriptor rendered");
        }
        let env_added = composer.write_env_files(id, &vars, None, false)?;
        if !env_added.is_empty() {
            log.step(&format!("env files added: {}", env_added.join(", ")));
        }
        let changed = descriptor.changed_since(&previous);
        let added = changed
            .iter()
            .filter(|s| previous.service(s).is_none())
            .cloned()
            .collect();
        Ok(Rendered {
            changed,
            added,
            removed: descriptor.removed_since(&previous),
            env_added,
        })
    }

    fn bring_up(
        &self,
        composer: &Composer,
        scratch: &ScratchEnvironment,
        plan: &BringUp,
        log: &OpLog,
        findings: &mut Findings,
    ) {
        let id = scratch.identity.as_str();
        let shared = self.shared(composer);

        log.step("ensure network and shared services");
        {
            let _shared = lock(&self.shared_lock);
            if let Err(e) = self.runtime.ensure_network(&self.config.runtime.network, Some(log)) {
                findings.record(log, "network", e);
            }
            if let Err(e) = shared.ensure_up(&shared.selected(&scratch.services), Some(log)) {
                findings.record(log, "shared services", e);
            }
        }

        if plan.provision_database {
            if let Some(db) = &scratch.database {
                log.step(&format!("provision database {db}"));
                let _shared = lock(&self.shared_lock);
                if let Err(e) = shared.create_database(id, db, Some(log)) {
                    findings.record(log, "database", e);
                }
            }
        }

        let project = self.project(&scratch.identity);
        for f in self.per_scratch(scratch) {
            let Some(init) = &f.init else { continue };
            if !plan.init.contains(&f.name) {
                continue;
            }
            log.step(&format!("initialize {}", f.name));
            if let Err(e) = project.run_once(&f.name, init, Some(log)) {
                findings.record(log, &format!("initializer for '{}'", f.name), e);
            }
        }

        let up = match &plan.only {
            Some(services) if services.is_empty() => Ok(()),
            Some(services) => {
                log.step(&format!("start {}", services.join(", ")));
                project.up(services, true, Some(log))
            }
            None => {
                log.step("start services");
                project.up(&[], false, Some(log))
            }
        };
        if let Err(e) = up {
            findings.record(log, "start", e);
            return;
        }

        findings.unhealthy = self.await_health(&project, scratch, log);

        log.step("establish routing bridge");
        let endpoints = routing::bridge_endpoints(&self.per_scratch(scratch));
        let wait = Duration::from_millis(self.config.runtime.bridge_wait_ms);
        for service in routing::establish(&self.releases, id, &endpoints, wait) {
            let msg = format!("bridge socket for '{service}' did not appear");
            log.failure(&msg);
            findings.failures.push(msg);
        }
    }

    /// Required per-scratch services not healthy once health settles or the
    /// wait expires.
    fn await_health(&self, project: &Project, scratch: &ScratchEnvironment, log: &OpLog) -> Vec<String> {
        let required: Vec<String> = self
            .per_scratch(scratch)
            .into_iter()
            .filter(|f| f.required)
            .map(|f| f.name.clone())
            .collect();
        if required.is_empty() {
            return Vec::new();
        }
        let deadline = Instant::now() + Duration::from_secs(self.config.runtime.health_timeout_secs);
        loop {
            let ps = match project.ps(Some(log)) {
                Ok(ps) => ps,
                Err(e) => {
                    log.failure(&format!("status: {e}"));
                    return required;
                }
            };
            let find = |name: &str| ps.iter().find(|s| s.service == name);
            let pending = required
                .iter()
                .any(|name| find(name.as_str()).is_some_and(ServiceStatus::is_starting));
            if !pending || Instant::now() >= deadline {
                return required
                    .into_iter()
                    .filter(|name| !find(name.as_str()).is_some_and(ServiceStatus::is_healthy))
                    .collect();
            }
            std::thread::sleep(HEALTH_POLL);
        }
    }

    fn stop_steps(&self, scratch: &mut ScratchEnvironment, log: &OpLog) -> Result<()> {
        log.step("stop services");
        self.project(&scratch.identity).down(false, Some(log))?;
        let reaped = routing::reap(&self.releases, scratch.identity.as_str())?;
        log.step(&format!("removed {reaped} bridge socket(s)"));
        scratch.transition(ScratchState::Stopped)?;
        self.save(scratch)
    }

    fn start_steps(
        &self,
        composer: &Composer,
        scratch: &mut ScratchEnvironment,
        mut findings: Findings,
        log: &OpLog,
    ) -> Result<()> {
        scratch.transition(ScratchState::Initializing)?;
        self.save(scratch)?;
        self.bring_up(composer, scratch, &BringUp::default(), log, &mut findings);
        self.settle(scratch, findings)
    }

    // -----------------------------------------------------------------------
    // create / update
    // -----------------------------------------------------------------------

    /// Create the scratch for `branch` (or `name`). An existing identity is
    /// updated instead and reported as [`CreateOutcome::Updated`].
    pub fn create(&self, branch: &str, name: Option<&str>, profile: Option<&str>) -> Result<CreateResult> {
        let identity = Identity::from_branch(name.unwrap_or(branch))?;
        if routing::is_reserved(&self.config.ingress, identity.as_str()) {
            return Err(ScratchError::ReservedIdentity(identity.to_string()));
        }
        let services = self.config.selected_services(profile)?;
        let _ticket = self.guard.acquire(identity.as_str(), "create")?;

        match ScratchEnvironment::load_in(&self.releases, &identity) {
            Ok(existing) if existing.state.is_materialized() => {
                if existing.branch != branch {
                    warn!(
                        identity = %identity,
                        existing = %existing.branch,
                        requested = branch,
                        "branch maps to an existing scratch; updating it"
                    );
                }
                let (scratch, report) = self.update_locked(existing, profile)?;
                return Ok(CreateResult {
                    outcome: CreateOutcome::Updated,
                    url: routing::public_url(&self.config.ingress, identity.as_str()),
                    scratch,
                    update: Some(report),
                });
            }
            Ok(_) | Err(ScratchError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let composer = self.composer()?;
        let mut scratch = ScratchEnvironment::new(
            identity.clone(),
            branch,
            profile.map(str::to_string),
            services,
        );
        scratch.database = self.database_for(&composer, &scratch);
        scratch.last_operation = Some("create".to_string());
        scratch.transition(ScratchState::Materializing)?;
        self.save(&scratch)?;

        let result = self.logged(&identity, "create", |log| {
            self.render(&composer, &scratch, log)?;
            scratch.transition(ScratchState::Initializing)?;
            self.save(&scratch)?;
            let plan = BringUp {
                init: self.per_scratch_names(&scratch),
                provision_database: true,
                only: None,
            };
            let mut findings = Findings::default();
            self.bring_up(&composer, &scratch, &plan, log, &mut findings);
            self.settle(&mut scratch, findings)
        });
        if let Err(e) = result {
            self.record_failure(&mut scratch, &e);
            return Err(e);
        }
        Ok(CreateResult {
            outcome: CreateOutcome::Created,
            url: routing::public_url(&self.config.ingress, identity.as_str()),
            scratch,
            update: None,
        })
    }

    /// Re-render descriptor and missing env files from the current fragments
    /// and redeploy only the services whose rendering changed.
    pub fn update(&self, raw: &str) -> Result<UpdateReport> {
        let identity = Identity::parse(raw)?;
        let (_ticket, scratch) = self.begin(&identity, "update")?;
        self.update_locked(scratch, None).map(|(_, report)| report)
    }

    fn update_locked(
        &self,
        mut scratch: ScratchEnvironment,
        profile: Option<&str>,
    ) -> Result<(ScratchEnvironment, UpdateReport)> {
        if let Some(p) = profile {
            scratch.profile = Some(p.to_string());
        }
        scratch.services = self.config.selected_services(scratch.profile.as_deref())?;
        scratch.last_operation = Some("update".to_string());
        let composer = self.composer()?;
        let had_database = scratch.database.is_some();
        scratch.database = self.database_for(&composer, &scratch);
        let was = scratch.state;
        let identity = scratch.identity.clone();

        let result = self.logged(&identity, "update", |log| {
            scratch.transition(ScratchState::Materializing)?;
            self.save(&scratch)?;
            let rendered = self.render(&composer, &scratch, log)?;
            let mut report = UpdateReport {
                changed: rendered.changed.clone(),
                removed: rendered.removed.clone(),
                env_added: rendered.env_added.clone(),
                redeployed: false,
            };
            scratch.transition(ScratchState::Initializing)?;
            self.save(&scratch)?;

            if was == ScratchState::Stopped {
                log.step("scratch is stopped; rendered only");
                scratch.transition(ScratchState::Stopped)?;
                self.save(&scratch)?;
                return Ok(report);
            }
            let full = was != ScratchState::Running;
            if !full && rendered.changed.is_empty() && rendered.removed.is_empty() {
                log.step("nothing changed");
                scratch.transition(ScratchState::Running)?;
                self.save(&scratch)?;
                return Ok(report);
            }

            let mut findings = Findings::default();
            if !rendered.removed.is_empty() {
                log.step(&format!("remove {}", rendered.removed.join(", ")));
                if let Err(e) = self.project(&identity).rm(&rendered.removed, Some(log)) {
                    findings.record(log, "remove services", e);
                }
            }
            let plan = if full {
                BringUp {
                    init: self.per_scratch_names(&scratch),
                    provision_database: true,
                    only: None,
                }
            } else {
                BringUp {
                    init: rendered.added.clone(),
                    provision_database: !had_database,
                    only: Some(rendered.changed.clone()),
                }
            };
            self.bring_up(&composer, &scratch, &plan, log, &mut findings);
            report.redeployed = true;
            self.settle(&mut scratch, findings)?;
            Ok(report)
        });
        match result {
            Ok(report) => Ok((scratch, report)),
            Err(e) => {
                self.record_failure(&mut scratch, &e);
                Err(e)
            }
        }
    }

    // -----------------------------------------------------------------------
    // start / stop / restart / rebuild
    // -----------------------------------------------------------------------

    pub fn start(&self, raw: &str) -> Result<ScratchEnvironment> {
        let identity = Identity::parse(raw)?;
        let (_ticket, mut scratch) = self.begin(&identity, "start")?;
        let composer = self.composer()?;
        let result = self.logged(&identity, "start", |log| {
            self.start_steps(&composer, &mut scratch, Findings::default(), log)
        });
        if let Err(e) = result {
            self.record_failure(&mut scratch, &e);
            return Err(e);
        }
        Ok(scratch)
    }

    /// Tear down containers and bridge sockets; files and volumes stay.
    pub fn stop(&self, raw: &str) -> Result<ScratchEnvironment> {
        let identity = Identity::parse(raw)?;
        let (_ticket, mut scratch) = self.begin(&identity, "stop")?;
        self.logged(&identity, "stop", |log| self.stop_steps(&mut scratch, log))?;
        Ok(scratch)
    }

    pub fn restart(&self, raw: &str) -> Result<ScratchEnvironment> {
        let identity = Identity::parse(raw)?;
        let (_ticket, mut scratch) = self.begin(&identity, "restart")?;
        let composer = self.composer()?;
        let result = self.logged(&identity, "restart", |log| {
            self.stop_steps(&mut scratch, log)?;
            self.start_steps(&composer, &mut scratch, Findings::default(), log)
        });
        if let Err(e) = result {
            self.record_failure(&mut scratch, &e);
            return Err(e);
        }
        Ok(scratch)
    }

    /// Stop, rebuild every per-scratch service with a build context without
    /// cache, and start again.
    pub fn rebuild(&self, raw: &str) -> Result<ScratchEnvironment> {
        let identity = Identity::parse(raw)?;
        let (_ticket, mut scratch) = self.begin(&identity, "rebuild")?;
        let composer = self.composer()?;
        let result = self.logged(&identity, "rebuild", |log| {
            self.stop_steps(&mut scratch, log)?;
            let mut findings = Findings::default();
            let buildable: Vec<String> = self
                .per_scratch(&scratch)
                .into_iter()
                .filter(|f| f.build.is_some())
                .map(|f| f.name.clone())
                .collect();
            if buildable.is_empty() {
                log.step("no service has a build context");
            } else {
                log.step(&format!("build {}", buildable.join(", ")));
                if let Err(e) = self.project(&identity).build(&buildable, true, Some(log)) {
                    findings.record(log, "build", e);
                }
            }
            self.start_steps(&composer, &mut scratch, findings, log)
        });
        if let Err(e) = result {
            self.record_failure(&mut scratch, &e);
            return Err(e);
        }
        Ok(scratch)
    }

    // -----------------------------------------------------------------------
    // wipe database / delete
    // -----------------------------------------------------------------------

    /// Drop and recreate the scratch database, then re-run the initializers
    /// of the data-consuming services. The shared service itself is never
    /// restarted.
    pub fn wipe_database(&self, raw: &str) -> Result<ScratchEnvironment> {
        let identity = Identity::parse(raw)?;
        if self.config.database.is_none() {
            return Err(ScratchError::NoDatabase);
        }
        let (_ticket, mut scratch) = self.begin(&identity, "wipe-db")?;
        let database = scratch.database.clone().ok_or(ScratchError::NoDatabase)?;
        let composer = self.composer()?;
        let id = identity.as_str().to_string();

        let result = self.logged(&identity, "wipe-db", |log| {
            let consumers: Vec<String> = self
                .per_scratch(&scratch)
                .into_iter()
                .filter(|f| f.data)
                .map(|f| f.name.clone())
                .collect();
            let project = self.project(&identity);
            let running = matches!(scratch.state, ScratchState::Running | ScratchState::Degraded);
            if running && !consumers.is_empty() {
                log.step(&format!("stop {}", consumers.join(", ")));
                project.stop(&consumers, Some(log))?;
            }

            let mut findings = Findings::default();
            {
                let _shared = lock(&self.shared_lock);
                let shared = self.shared(&composer);
                log.step(&format!("recreate database {database}"));
                let reset = shared
                    .drop_database(&id, &database, Some(log))
                    .and_then(|_| shared.create_database(&id, &database, Some(log)));
                if let Err(e) = reset {
                    findings.record(log, "database", e);
                }
            }

            if !running {
                for f in self.per_scratch(&scratch) {
                    if let (true, Some(init)) = (f.data, &f.init) {
                        if let Err(e) = project.run_once(&f.name, init, Some(log)) {
                            findings.record(log, &format!("initializer for '{}'", f.name), e);
                        }
                    }
                }
                if findings.is_clean() {
                    return Ok(());
                }
                scratch.transition(ScratchState::Initializing)?;
                return self.settle(&mut scratch, findings);
            }

            scratch.transition(ScratchState::Initializing)?;
            self.save(&scratch)?;
            let plan = BringUp {
                init: if findings.is_clean() { consumers.clone() } else { Vec::new() },
                provision_database: false,
                only: Some(consumers),
            };
            self.bring_up(&composer, &scratch, &plan, log, &mut findings);
            self.settle(&mut scratch, findings)
        });
        if let Err(e) = result {
            self.record_failure(&mut scratch, &e);
            return Err(e);
        }
        Ok(scratch)
    }

    /// Remove containers, volumes, bridge sockets and the scratch directory.
    /// The database is dropped best-effort.
    pub fn delete(&self, raw: &str) -> Result<()> {
        let identity = Identity::parse(raw)?;
        let (_ticket, mut scratch) = self.begin(&identity, "delete")?;
        let id = identity.as_str();
        let log = OpLog::open(&self.releases, id, "delete");
        info!(identity = %identity, "deleting scratch");

        // A create that died before rendering leaves no descriptor and so
        // nothing for the runtime to tear down.
        if paths::descriptor_path(&self.releases, id).exists() {
            let teardown = self.project(&identity).down(true, Some(&log));
            if let Err(e) = &teardown {
                log.finish(&teardown);
                warn!(identity = %identity, error = %e, "delete aborted; files kept");
                self.record_failure(&mut scratch, e);
                return teardown;
            }
        } else {
            log.step("no descriptor rendered; skipping teardown");
        }

        if let Some(db) = &scratch.database {
            let dropped = self.composer().and_then(|composer| {
                let _shared = lock(&self.shared_lock);
                self.shared(&composer).drop_database(id, db, Some(&log))
            });
            if let Err(e) = dropped {
                log.failure(&format!("database: {e}"));
                warn!(identity = %identity, database = %db, error = %e, "database drop failed; continuing");
            }
        }

        routing::reap(&self.releases, id)?;
        scratch.transition(ScratchState::Deleted)?;
        log.step("remove scratch directory");
        std::fs::remove_dir_all(paths::scratch_dir(&self.releases, id))?;
        self.status_cache.invalidate(&id.to_string());
        info!(identity = %identity, "scratch deleted");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // list / status
    // -----------------------------------------------------------------------

    /// Every scratch in the registry, plus creates still in flight.
    pub fn list(&self) -> Result<Vec<ScratchStatus>> {
        let mut ids = ScratchEnvironment::identities(&self.releases)?;
        for (id, op) in self.guard.snapshot() {
            if op == "create" {
                if let Ok(identity) = Identity::parse(&id) {
                    ids.push(identity);
                }
            }
        }
        ids.sort();
        ids.dedup();
        let mut out = Vec::with_capacity(ids.len());
        for id in &ids {
            match self.describe(id) {
                Ok(s) => out.push(s),
                // Deleted between listing and reading.
                Err(ScratchError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    pub fn status(&self, raw: &str) -> Result<ScratchStatus> {
        self.describe(&Identity::parse(raw)?)
    }

    fn describe(&self, identity: &Identity) -> Result<ScratchStatus> {
        // Read the manifest under the guard so an operation cannot start or
        // finish between the in-flight check and the read.
        let (in_flight, loaded) = self.guard.observe(identity.as_str(), |op| {
            (
                op.map(str::to_string),
                ScratchEnvironment::load_in(&self.releases, identity),
            )
        });
        let scratch = match loaded {
            Ok(s) => Some(s),
            Err(ScratchError::NotFound(_)) if in_flight.is_some() => None,
            Err(e) => return Err(e),
        };
        let state = scratch
            .as_ref()
            .map(|s| s.state)
            .unwrap_or(ScratchState::Materializing);

        let (services, runtime_error) = if in_flight.is_some() || scratch.is_none() {
            (Vec::new(), None)
        } else {
            match self.live_services(identity) {
                Ok(s) => (s, None),
                Err(e) => (Vec::new(), Some(e.to_string())),
            }
        };
        let live = match (&scratch, &runtime_error) {
            (Some(s), None) if in_flight.is_none() => self.live_state(s, &services),
            _ => LiveState::Unknown,
        };
        Ok(ScratchStatus {
            identity: identity.clone(),
            state,
            in_flight,
            live,
            url: routing::public_url(&self.config.ingress, identity.as_str()),
            scratch,
            services,
            runtime_error,
        })
    }

    /// `compose ps` for a scratch, through the expiring cache.
    pub fn live_services(&self, identity: &Identity) -> Result<Vec<ServiceStatus>> {
        if !paths::descriptor_path(&self.releases, identity.as_str()).exists() {
            return Ok(Vec::new());
        }
        self.status_cache
            .get_or_fetch(&identity.to_string(), || self.project(identity).ps(None))
    }

    fn live_state(&self, scratch: &ScratchEnvironment, services: &[ServiceStatus]) -> LiveState {
        let expected = self.per_scratch_names(scratch);
        if expected.is_empty() {
            return LiveState::Unknown;
        }
        let running = expected
            .iter()
            .filter(|name| services.iter().any(|s| &s.service == *name && s.is_running()))
            .count();
        match running {
            0 => LiveState::Stopped,
            n if n == expected.len() => LiveState::Running,
            _ => LiveState::Partial,
        }
    }

    // -----------------------------------------------------------------------
    // env files
    // -----------------------------------------------------------------------

    pub fn read_env(&self, raw: &str) -> Result<BTreeMap<String, EnvFile>> {
        let identity = Identity::parse(raw)?;
        ScratchEnvironment::load_in(&self.releases, &identity)?;
        envfile::read_all(&self.releases, identity.as_str())
    }

    /// Replace env file contents and recreate the running services that
    /// load a changed file. Every name is validated before anything is
    /// written.
    pub fn write_env(&self, raw: &str, files: &BTreeMap<String, String>) -> Result<EnvReport> {
        let identity = Identity::parse(raw)?;
        let names = files
            .keys()
            .map(|n| envfile::validate_name(n))
            .collect::<Result<Vec<_>>>()?;
        let (_ticket, scratch) = self.begin(&identity, "write-env")?;
        let id = identity.as_str();
        self.logged(&identity, "write-env", |log| {
            let mut changed = Vec::new();
            for ((raw_name, content), name) in files.iter().zip(&names) {
                if envfile::write(&self.releases, id, raw_name, content)? {
                    log.step(&format!("wrote env/{name}.env"));
                    changed.push(name.clone());
                }
            }
            let redeployed = self.redeploy_dependents(&scratch, &changed, log)?;
            Ok(EnvReport {
                files: names.clone(),
                changed,
                redeployed,
            })
        })
    }

    /// Re-render env files from their templates: the named ones, or every
    /// template when `files` is `None`. Siblings are untouched.
    pub fn reset_env(&self, raw: &str, files: Option<&[String]>) -> Result<EnvReport> {
        let identity = Identity::parse(raw)?;
        let names = files
            .map(|f| {
                f.iter()
                    .map(|n| envfile::validate_name(n))
                    .collect::<Result<Vec<_>>>()
            })
            .transpose()?;
        let (_ticket, scratch) = self.begin(&identity, "reset-env")?;
        let composer = self.composer()?;
        let targets = match names {
            Some(names) => {
                if let Some(missing) = names.iter().find(|n| composer.template(n).is_none()) {
                    return Err(ScratchError::NotFound(format!("env template '{missing}'")));
                }
                names
            }
            None => composer.templates().iter().map(|t| t.name.clone()).collect(),
        };
        self.logged(&identity, "reset-env", |log| {
            let vars = composer.vars(&scratch);
            let changed =
                composer.write_env_files(identity.as_str(), &vars, Some(targets.as_slice()), true)?;
            log.step(&format!("reset {}", targets.join(", ")));
            let redeployed = self.redeploy_dependents(&scratch, &changed, log)?;
            Ok(EnvReport {
                files: targets.clone(),
                changed,
                redeployed,
            })
        })
    }

    fn redeploy_dependents(
        &self,
        scratch: &ScratchEnvironment,
        changed: &[String],
        log: &OpLog,
    ) -> Result<Vec<String>> {
        if changed.is_empty()
            || !matches!(scratch.state, ScratchState::Running | ScratchState::Degraded)
        {
            return Ok(Vec::new());
        }
        let dependents: Vec<String> = self
            .per_scratch(scratch)
            .into_iter()
            .filter(|f| changed.iter().any(|c| f.uses_env_file(c)))
            .map(|f| f.name.clone())
            .collect();
        if !dependents.is_empty() {
            log.step(&format!("recreate {}", dependents.join(", ")));
            self.project(&scratch.identity).up(&dependents, true, Some(log))?;
        }
        Ok(dependents)
    }

    // -----------------------------------------------------------------------
    // logs
    // -----------------------------------------------------------------------

    /// Recent container output of the scratch, or of one of its services.
    pub fn logs(&self, raw: &str, service: Option<&str>, tail: Option<usize>) -> Result<String> {
        let identity = Identity::parse(raw)?;
        let scratch = ScratchEnvironment::load_in(&self.releases, &identity)?;
        if let Some(s) = service {
            let known = self.per_scratch_names(&scratch);
            if !known.iter().any(|k| k == s) && s != BRIDGE_SERVICE && s != LOG_SERVICE {
                return Err(ScratchError::UnknownService(s.to_string()));
            }
        }
        self.project(&identity)
            .logs(service, tail.unwrap_or(DEFAULT_LOG_TAIL))
    }

    pub fn oplogs(&self, raw: &str) -> Result<Vec<OpLogEntry>> {
        let identity = Identity::parse(raw)?;
        ScratchEnvironment::load_in(&self.releases, &identity)?;
        oplog::list(&self.releases, identity.as_str())
    }

    pub fn oplog(&self, raw: &str, file: &str) -> Result<String> {
        let identity = Identity::parse(raw)?;
        ScratchEnvironment::load_in(&self.releases, &identity)?;
        oplog::read(&self.releases, identity.as_str(), file)
    }

    // -----------------------------------------------------------------------
    // webhook / shared / routing
    // -----------------------------------------------------------------------

    pub fn webhook(&self, payload: &serde_json::Value) -> Result<WebhookOutcome> {
        match webhook::interpret(payload) {
            WebhookIntent::Deploy { branch } => {
                info!(branch = %branch, "webhook deploy");
                Ok(WebhookOutcome::Deployed(self.create(&branch, None, None)?))
            }
            WebhookIntent::Ignore { reason } => {
                info!(reason = %reason, "webhook ignored");
                Ok(WebhookOutcome::Ignored { reason })
            }
        }
    }

    pub fn list_shared(&self) -> Result<Vec<ServiceStatus>> {
        let composer = self.composer()?;
        self.shared(&composer).status()
    }

    /// Start shared services (all when `services` is empty).
    pub fn start_shared(&self, services: &[String]) -> Result<()> {
        let composer = self.composer()?;
        let shared = self.shared(&composer);
        let targets = if services.is_empty() {
            shared.names()
        } else {
            services.to_vec()
        };
        let _shared = lock(&self.shared_lock);
        shared.ensure_up(&targets, None)
    }

    pub fn stop_shared(&self, services: &[String]) -> Result<()> {
        let composer = self.composer()?;
        let _shared = lock(&self.shared_lock);
        self.shared(&composer).stop(services, None)
    }

    /// Resolve the forward target for a dispatched request.
    pub fn route(&self, identity: &Identity, service: &str) -> Result<RouteBinding> {
        routing::bind(&self.releases, identity, service)
    }

    /// The static nginx rule for this project.
    pub fn ingress_rule(&self, control_upstream: &str) -> String {
        let socket_root = self
            .config
            .ingress
            .socket_root
            .clone()
            .unwrap_or_else(|| self.releases.clone());
        routing::render_nginx_rule(
            &self.config.ingress,
            &socket_root,
            control_upstream,
            &routing::fallback_template(&self.config, &self.root),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DEFAULT_CONFIG, DEFAULT_ENV_TEMPLATE};
    use crate::exec::{CancelToken, CommandOutput, Invocation};
    use crate::routing::{Dispatch, RoutingMode};
    use std::sync::Barrier;
    use tempfile::TempDir;

    const PS_HEALTHY: &str = "{\"Service\":\"redis\",\"State\":\"running\",\"Health\":\"healthy\"}\n\
                              {\"Service\":\"api\",\"State\":\"running\",\"Health\":\"\"}\n";

    /// Scripted container runtime. `up` in a scratch directory binds the
    /// bridge sockets the way the bridge container would.
    struct FakeRunner {
        calls: Mutex<Vec<Invocation>>,
        failures: Mutex<Vec<(String, CommandOutput)>>,
        ps: Mutex<String>,
        sockets: Vec<String>,
        up_gate: Mutex<Option<Arc<Barrier>>>,
    }

    impl FakeRunner {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                failures: Mutex::new(vec![(
                    "grep -q 1".to_string(),
                    CommandOutput::failed(1, ""),
                )]),
                ps: Mutex::new(PS_HEALTHY.to_string()),
                sockets: vec!["api".to_string()],
                up_gate: Mutex::new(None),
            }
        }

        fn fail(&self, pattern: &str, exit_code: i32, stderr: &str) {
            self.failures
                .lock()
                .unwrap()
                .push((pattern.to_string(), CommandOutput::failed(exit_code, stderr)));
        }

        fn clear_failures(&self) {
            self.failures.lock().unwrap().retain(|(p, _)| p == "grep -q 1");
        }

        fn set_ps(&self, ps: &str) {
            *self.ps.lock().unwrap() = ps.to_string();
        }

        fn lines(&self) -> Vec<String> {
            self.calls.lock().unwrap().iter().map(|i| i.display()).collect()
        }

        fn count(&self, needle: &str) -> usize {
            self.lines().iter().filter(|l| l.contains(needle)).count()
        }
    }

    impl CommandRunner for FakeRunner {
        fn run(&self, inv: &Invocation, _cancel: &CancelToken) -> Result<CommandOutput> {
            let line = inv.display();
            self.calls.lock().unwrap().push(inv.clone());

            let scratch_dir = inv
                .cwd
                .clone()
                .filter(|d| !d.ends_with(paths::SHARED_DIR));
            let is_up = inv.args.first().map(String::as_str) == Some("compose")
                && inv.args.iter().any(|a| a == "up");

            if is_up && scratch_dir.is_some() {
                let gate = self.up_gate.lock().unwrap().take();
                if let Some(gate) = gate {
                    gate.wait();
                    gate.wait();
                }
            }
            for (pattern, out) in self.failures.lock().unwrap().iter() {
                if line.contains(pattern.as_str()) {
                    return Ok(out.clone());
                }
            }
            if is_up {
                if let Some(dir) = scratch_dir {
                    for svc in &self.sockets {
                        let sock = dir.join(paths::SOCKETS_DIR).join(format!("{svc}.sock"));
                        std::fs::write(sock, b"").unwrap();
                    }
                }
            }
            if inv.args.iter().any(|a| a == "ps") {
                return Ok(CommandOutput::ok(self.ps.lock().unwrap().clone()));
            }
            Ok(CommandOutput::ok(""))
        }
    }

    fn config() -> Config {
        let mut config = Config::parse(DEFAULT_CONFIG).unwrap();
        config.runtime.health_timeout_secs = 0;
        config.runtime.bridge_wait_ms = 0;
        config.runtime.uid = Some(1000);
        config.runtime.gid = Some(1000);
        config
    }

    fn setup_with(config: Config) -> (TempDir, Arc<FakeRunner>, Controller) {
        let dir = TempDir::new().unwrap();
        let templates = dir.path().join("templates/env");
        std::fs::create_dir_all(&templates).unwrap();
        std::fs::write(templates.join("backend.env"), DEFAULT_ENV_TEMPLATE).unwrap();
        std::fs::write(templates.join("frontend.env"), "PUBLIC_URL={{url}}\n").unwrap();
        let runner = Arc::new(FakeRunner::new());
        let ctl = Controller::new(dir.path(), config, runner.clone());
        (dir, runner, ctl)
    }

    fn setup() -> (TempDir, Arc<FakeRunner>, Controller) {
        setup_with(config())
    }

    fn releases(dir: &TempDir) -> PathBuf {
        dir.path().join("releases")
    }

    #[test]
    fn create_materializes_layout() {
        let (dir, runner, ctl) = setup();
        let res = ctl.create("feature/Foo Bar!!", None, None).unwrap();
        assert_eq!(res.outcome, CreateOutcome::Created);
        assert_eq!(res.scratch.identity.as_str(), "featurefoobar");
        assert_eq!(res.scratch.state, ScratchState::Running);
        assert_eq!(res.scratch.database.as_deref(), Some("scratch_featurefoobar"));
        assert_eq!(res.url, "http://featurefoobar.scratches.localhost");

        let root = releases(&dir).join("featurefoobar");
        for p in ["compose.yaml", ".scratch.yaml", "env/backend.env", "env/frontend.env", "logs", "sockets/api.sock"] {
            assert!(root.join(p).exists(), "missing {p}");
        }
        let backend = std::fs::read_to_string(root.join("env/backend.env")).unwrap();
        assert!(backend.contains("/scratch_featurefoobar"));

        assert_eq!(runner.count("exec scratch-shared-postgres psql"), 1);
        assert_eq!(runner.count("compose -p scratch-featurefoobar"), 2, "{:#?}", runner.lines());
        assert_eq!(runner.count("compose -p scratch-shared"), 1);
        assert!(!oplog::list(&releases(&dir), "featurefoobar").unwrap().is_empty());
    }

    #[test]
    fn create_twice_is_an_update() {
        let (dir, runner, ctl) = setup();
        ctl.create("feature/foo", None, None).unwrap();
        let again = ctl.create("feature/foo", None, None).unwrap();
        assert_eq!(again.outcome, CreateOutcome::Updated);
        assert_eq!(again.update, Some(UpdateReport::default()));
        assert_eq!(ScratchEnvironment::identities(&releases(&dir)).unwrap().len(), 1);
        assert_eq!(runner.count("up -d --remove-orphans"), 2, "shared + first scratch up only");
    }

    #[test]
    fn colliding_branch_updates_existing_scratch() {
        let (_dir, _runner, ctl) = setup();
        ctl.create("feature/foo", None, None).unwrap();
        let res = ctl.create("Feature/Foo", None, None).unwrap();
        assert_eq!(res.outcome, CreateOutcome::Updated);
        assert_eq!(res.scratch.branch, "feature/foo");
    }

    #[test]
    fn precondition_failures_touch_nothing() {
        let (dir, runner, ctl) = setup();
        assert!(matches!(
            ctl.create("!!!", None, None),
            Err(ScratchError::InvalidIdentity(_))
        ));
        assert!(matches!(
            ctl.create("x", None, Some("nope")),
            Err(ScratchError::UnknownProfile(_))
        ));
        assert!(matches!(
            ctl.delete("doesnotexist"),
            Err(ScratchError::NotFound(_))
        ));
        assert!(matches!(ctl.stop("Bad Name"), Err(ScratchError::InvalidIdentity(_))));
        assert!(!releases(&dir).exists());
        assert!(runner.lines().is_empty());
    }

    #[test]
    fn control_plane_names_cannot_be_scratches() {
        for mode in [RoutingMode::Subdomain, RoutingMode::Path] {
            let mut cfg = config();
            cfg.ingress.routing = mode;
            let (dir, runner, ctl) = setup_with(cfg);
            for branch in ["scratch", "Scratch", "_scratch"] {
                assert!(
                    matches!(
                        ctl.create(branch, None, None),
                        Err(ScratchError::ReservedIdentity(_))
                    ),
                    "{mode}: {branch}"
                );
            }
            assert!(matches!(
                ctl.create("feature/x", Some("_scratch"), None),
                Err(ScratchError::ReservedIdentity(_))
            ));
            assert!(!releases(&dir).exists());
            assert!(runner.lines().is_empty());

            let res = ctl.create("scratchpad", None, None).unwrap();
            let (host, path) = match mode {
                RoutingMode::Subdomain => ("scratchpad.scratches.localhost", "/"),
                RoutingMode::Path => ("scratches.localhost", "/scratchpad/"),
            };
            assert!(matches!(
                routing::dispatch(&ctl.config().ingress, host, path),
                Dispatch::Scratch { identity, .. } if identity == res.scratch.identity
            ));
        }
    }

    #[test]
    fn profile_limits_services() {
        let (dir, _runner, ctl) = setup();
        let res = ctl.create("slim", None, Some("minimal")).unwrap();
        assert_eq!(res.scratch.services, vec!["postgres", "api"]);
        let d = DeploymentDescriptor::load(&paths::descriptor_path(&releases(&dir), "slim")).unwrap();
        assert!(d.service("redis").is_none());
        assert!(d.service("api").unwrap().depends_on.is_empty());
    }

    #[test]
    fn delete_removes_everything() {
        let (dir, runner, ctl) = setup();
        ctl.create("gone", None, None).unwrap();
        ctl.delete("gone").unwrap();
        assert!(!releases(&dir).join("gone").exists());
        assert_eq!(runner.count("down --remove-orphans --volumes"), 1);
        assert_eq!(runner.count("DROP DATABASE"), 1);
        assert!(matches!(ctl.status("gone"), Err(ScratchError::NotFound(_))));
    }

    #[test]
    fn failed_teardown_keeps_files() {
        let (dir, runner, ctl) = setup();
        ctl.create("sticky", None, None).unwrap();
        runner.fail(" down ", 1, "daemon unreachable");
        assert!(matches!(ctl.delete("sticky"), Err(ScratchError::ScriptFailure { .. })));
        let scratch = ScratchEnvironment::load_in(&releases(&dir), &Identity::parse("sticky").unwrap()).unwrap();
        assert_eq!(scratch.state, ScratchState::Degraded);
        assert!(scratch.failures[0].contains("daemon unreachable"));
    }

    #[test]
    fn delete_of_unrendered_scratch_skips_teardown() {
        let (dir, runner, ctl) = setup();
        let identity = Identity::parse("half").unwrap();
        let mut scratch = ScratchEnvironment::new(identity, "half", None, vec!["api".into()]);
        scratch.state = ScratchState::Degraded;
        scratch.database = Some("scratch_half".into());
        scratch
            .save(&paths::manifest_path(&releases(&dir), "half"))
            .unwrap();
        runner.fail(" down ", 14, "open compose.yaml: no such file or directory");

        ctl.delete("half").unwrap();
        assert_eq!(runner.count(" down "), 0, "{:#?}", runner.lines());
        assert_eq!(runner.count("DROP DATABASE"), 1);
        assert!(!releases(&dir).join("half").exists());
    }

    #[test]
    fn database_drop_failure_does_not_block_delete() {
        let (dir, runner, ctl) = setup();
        ctl.create("dbfail", None, None).unwrap();
        runner.fail("DROP DATABASE", 2, "connection refused");
        ctl.delete("dbfail").unwrap();
        assert!(!releases(&dir).join("dbfail").exists());
    }

    #[test]
    fn stop_then_start_restores_routing() {
        let (dir, runner, ctl) = setup();
        ctl.create("cycle", None, None).unwrap();
        let id = Identity::parse("cycle").unwrap();
        assert!(ctl.route(&id, "api").is_ok());

        let stopped = ctl.stop("cycle").unwrap();
        assert_eq!(stopped.state, ScratchState::Stopped);
        assert_eq!(runner.count("down --remove-orphans --volumes"), 0);
        assert!(!paths::socket_path(&releases(&dir), "cycle", "api").exists());
        assert!(matches!(
            ctl.route(&id, "api"),
            Err(ScratchError::RoutingUnavailable { .. })
        ));
        assert!(releases(&dir).join("cycle/env/backend.env").exists());

        let started = ctl.start("cycle").unwrap();
        assert_eq!(started.state, ScratchState::Running);
        let binding = ctl.route(&id, "api").unwrap();
        assert!(binding.socket.exists());
    }

    #[test]
    fn concurrent_create_and_delete_one_is_busy() {
        let (_dir, runner, ctl) = setup();
        let ctl = Arc::new(ctl);
        let gate = Arc::new(Barrier::new(2));
        *runner.up_gate.lock().unwrap() = Some(Arc::clone(&gate));

        let creator = {
            let ctl = Arc::clone(&ctl);
            std::thread::spawn(move || ctl.create("x", None, None))
        };
        gate.wait();
        let status = ctl.status("x").unwrap();
        assert_eq!(status.in_flight.as_deref(), Some("create"));
        assert_eq!(ctl.list().unwrap().len(), 1);
        match ctl.delete("x") {
            Err(ScratchError::Busy { identity, operation }) => {
                assert_eq!(identity, "x");
                assert_eq!(operation, "create");
            }
            other => panic!("expected Busy, got {other:?}"),
        }
        gate.wait();
        let created = creator.join().unwrap().unwrap();
        assert_eq!(created.outcome, CreateOutcome::Created);
        ctl.delete("x").unwrap();
    }

    #[test]
    fn distinct_identities_run_in_parallel() {
        let (_dir, runner, ctl) = setup();
        let ctl = Arc::new(ctl);
        let gate = Arc::new(Barrier::new(2));
        *runner.up_gate.lock().unwrap() = Some(Arc::clone(&gate));
        let slow = {
            let ctl = Arc::clone(&ctl);
            std::thread::spawn(move || ctl.create("slow", None, None))
        };
        gate.wait();
        ctl.create("fast", None, None).unwrap();
        gate.wait();
        slow.join().unwrap().unwrap();
        assert_eq!(ctl.list().unwrap().len(), 2);
    }

    #[test]
    fn failing_initializer_degrades_and_update_heals() {
        let mut cfg = config();
        cfg.services
            .iter_mut()
            .find(|f| f.name == "api")
            .unwrap()
            .init = Some(vec!["./bin/migrate".to_string()]);
        let (dir, runner, ctl) = setup_with(cfg);
        runner.fail("run --rm", 3, "migration 0042 failed");

        match ctl.create("broken", None, None) {
            Err(ScratchError::Degraded { identity, reasons }) => {
                assert_eq!(identity, "broken");
                assert!(reasons.iter().any(|r| r.contains("initializer for 'api'")));
            }
            other => panic!("expected Degraded, got {other:?}"),
        }
        let scratch = ScratchEnvironment::load_in(&releases(&dir), &Identity::parse("broken").unwrap()).unwrap();
        assert_eq!(scratch.state, ScratchState::Degraded);
        assert!(releases(&dir).join("broken/compose.yaml").exists());
        // Initializer failure does not stop the services from starting.
        assert!(paths::socket_path(&releases(&dir), "broken", "api").exists());

        runner.clear_failures();
        ctl.update("broken").unwrap();
        let healed = ScratchEnvironment::load_in(&releases(&dir), &Identity::parse("broken").unwrap()).unwrap();
        assert_eq!(healed.state, ScratchState::Running);
        assert!(healed.failures.is_empty());
    }

    #[test]
    fn unhealthy_required_service_degrades() {
        let (_dir, runner, ctl) = setup();
        runner.set_ps(
            "{\"Service\":\"redis\",\"State\":\"running\",\"Health\":\"healthy\"}\n\
             {\"Service\":\"api\",\"State\":\"running\",\"Health\":\"unhealthy\"}\n",
        );
        match ctl.create("sick", None, None) {
            Err(ScratchError::Degraded { reasons, .. }) => {
                assert_eq!(reasons, vec!["service 'api' is not healthy"]);
            }
            other => panic!("expected Degraded, got {other:?}"),
        }
        let status = ctl.status("sick").unwrap();
        assert_eq!(status.state, ScratchState::Degraded);
        assert_eq!(status.scratch.unwrap().unhealthy, vec!["api"]);
    }

    #[test]
    fn update_redeploys_only_changed_services() {
        let (dir, runner, ctl) = setup();
        ctl.create("upd", None, None).unwrap();

        let mut cfg = config();
        cfg.services
            .iter_mut()
            .find(|f| f.name == "redis")
            .unwrap()
            .image = "redis:8-alpine".into();
        let ctl2 = Controller::new(dir.path(), cfg, runner.clone());
        let report = ctl2.update("upd").unwrap();
        assert_eq!(report.changed, vec!["redis"]);
        assert!(report.removed.is_empty());
        assert!(report.redeployed);
        let last_up = runner
            .lines()
            .into_iter()
            .filter(|l| l.contains(" up -d"))
            .last()
            .unwrap();
        assert!(last_up.ends_with("--no-deps redis"), "{last_up}");
    }

    #[test]
    fn update_keeps_edited_env_files() {
        let (dir, _runner, ctl) = setup();
        ctl.create("keep", None, None).unwrap();
        let backend = releases(&dir).join("keep/env/backend.env");
        std::fs::write(&backend, "EDITED=1\n").unwrap();
        ctl.update("keep").unwrap();
        assert_eq!(std::fs::read_to_string(&backend).unwrap(), "EDITED=1\n");
    }

    #[test]
    fn reset_single_env_file_leaves_siblings() {
        let (_dir, runner, ctl) = setup();
        ctl.create("envs", None, None).unwrap();
        let mut files = BTreeMap::new();
        files.insert("backend".to_string(), "EDITED=1\n".to_string());
        files.insert("frontend.env".to_string(), "EDITED=2\n".to_string());
        let written = ctl.write_env("envs", &files).unwrap();
        assert_eq!(written.changed, vec!["backend", "frontend"]);
        assert_eq!(written.redeployed, vec!["api"]);

        let report = ctl.reset_env("envs", Some(&["backend".to_string()])).unwrap();
        assert_eq!(report.changed, vec!["backend"]);
        assert_eq!(report.redeployed, vec!["api"]);
        let env = ctl.read_env("envs").unwrap();
        assert!(env["backend"].content.contains("DATABASE_URL="));
        assert_eq!(env["frontend"].content, "EDITED=2\n");
        assert!(runner.count("up -d --remove-orphans --no-deps api") >= 2);

        let all = ctl.reset_env("envs", None).unwrap();
        assert_eq!(all.files, vec!["backend", "frontend"]);
        assert_eq!(all.changed, vec!["frontend"]);
    }

    #[test]
    fn env_paths_cannot_escape() {
        let (dir, _runner, ctl) = setup();
        ctl.create("safe", None, None).unwrap();
        let mut files = BTreeMap::new();
        files.insert("ok".to_string(), "A=1\n".to_string());
        files.insert("../../../etc/evil".to_string(), "A=1\n".to_string());
        assert!(matches!(
            ctl.write_env("safe", &files),
            Err(ScratchError::InvalidPath(_))
        ));
        assert!(!releases(&dir).join("safe/env/ok.env").exists());
        assert!(matches!(
            ctl.reset_env("safe", Some(&["../x".to_string()])),
            Err(ScratchError::InvalidPath(_))
        ));
        assert!(matches!(
            ctl.reset_env("safe", Some(&["unknown".to_string()])),
            Err(ScratchError::NotFound(_))
        ));
    }

    #[test]
    fn wipe_database_recreates_and_reinitializes() {
        let mut cfg = config();
        cfg.services
            .iter_mut()
            .find(|f| f.name == "api")
            .unwrap()
            .init = Some(vec!["./bin/seed".to_string()]);
        let (_dir, runner, ctl) = setup_with(cfg);
        ctl.create("wipe", None, None).unwrap();
        let before = runner.lines().len();

        let scratch = ctl.wipe_database("wipe").unwrap();
        assert_eq!(scratch.state, ScratchState::Running);
        let after: Vec<String> = runner.lines().split_off(before);
        let pos = |needle: &str| after.iter().position(|l| l.contains(needle)).unwrap();
        assert!(pos(" stop api") < pos("DROP DATABASE"));
        assert!(pos("DROP DATABASE") < pos("CREATE DATABASE"));
        assert!(pos("CREATE DATABASE") < pos("run --rm --no-deps -T api ./bin/seed"));
        assert!(pos("run --rm") < pos("--no-deps api"));
        assert!(!after.iter().any(|l| l.contains("compose -p scratch-shared") && l.contains(" stop")));
    }

    #[test]
    fn wipe_database_without_database_is_rejected() {
        let mut cfg = config();
        cfg.database = None;
        let (_dir, _runner, ctl) = setup_with(cfg);
        ctl.create("nodb", None, None).unwrap();
        assert!(matches!(ctl.wipe_database("nodb"), Err(ScratchError::NoDatabase)));
    }

    #[test]
    fn rebuild_builds_without_cache() {
        let mut cfg = config();
        cfg.services
            .iter_mut()
            .find(|f| f.name == "api")
            .unwrap()
            .build = Some("./api".to_string());
        let (_dir, runner, ctl) = setup_with(cfg);
        ctl.create("rb", None, None).unwrap();
        let scratch = ctl.rebuild("rb").unwrap();
        assert_eq!(scratch.state, ScratchState::Running);
        assert_eq!(runner.count("build --no-cache api"), 1);
    }

    #[test]
    fn list_uses_status_cache() {
        let (_dir, runner, ctl) = setup();
        ctl.create("a", None, None).unwrap();
        ctl.create("b", None, None).unwrap();
        let before = runner.count(" ps ");
        let first = ctl.list().unwrap();
        let second = ctl.list().unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 2);
        assert!(first.iter().all(|s| s.live == LiveState::Running));
        assert_eq!(runner.count(" ps ") - before, 2, "one ps per scratch per ttl");
    }

    #[test]
    fn webhook_push_creates_and_tags_are_ignored() {
        let (_dir, _runner, ctl) = setup();
        let out = ctl
            .webhook(&serde_json::json!({"ref": "refs/heads/feature/hook"}))
            .unwrap();
        match out {
            WebhookOutcome::Deployed(res) => {
                assert_eq!(res.scratch.identity.as_str(), "featurehook");
                assert_eq!(res.outcome, CreateOutcome::Created);
            }
            other => panic!("unexpected {other:?}"),
        }
        let again = ctl
            .webhook(&serde_json::json!({"pull_request": {"head": {"ref": "feature/hook"}}}))
            .unwrap();
        assert!(matches!(again, WebhookOutcome::Deployed(CreateResult { outcome: CreateOutcome::Updated, .. })));
        assert!(matches!(
            ctl.webhook(&serde_json::json!({"ref": "refs/tags/v1"})).unwrap(),
            WebhookOutcome::Ignored { .. }
        ));
    }

    #[test]
    fn shared_services_are_rendered_once() {
        let (dir, runner, ctl) = setup();
        ctl.create("one", None, None).unwrap();
        ctl.create("two", None, None).unwrap();
        assert!(paths::shared_descriptor_path(&releases(&dir)).exists());
        for id in ["one", "two"] {
            let d = DeploymentDescriptor::load(&paths::descriptor_path(&releases(&dir), id)).unwrap();
            assert!(d.service("postgres").is_none());
        }
        ctl.stop_shared(&[]).unwrap();
        assert_eq!(runner.count("compose -p scratch-shared"), 3);
        assert!(matches!(
            ctl.start_shared(&["redis".to_string()]),
            Err(ScratchError::UnknownService(_))
        ));
    }

    #[test]
    fn logs_validate_service() {
        let (_dir, _runner, ctl) = setup();
        ctl.create("lg", None, None).unwrap();
        assert!(ctl.logs("lg", Some("api"), Some(10)).is_ok());
        assert!(ctl.logs("lg", Some(BRIDGE_SERVICE), None).is_ok());
        assert!(matches!(
            ctl.logs("lg", Some("postgres"), None),
            Err(ScratchError::UnknownService(_))
        ));
        let ops: Vec<String> = ctl.oplogs("lg").unwrap().into_iter().map(|e| e.operation).collect();
        assert!(ops.contains(&"create".to_string()));
    }

    #[test]
    fn ingress_rule_uses_releases_dir() {
        let (dir, _runner, ctl) = setup();
        let rule = ctl.ingress_rule("127.0.0.1:3456");
        let expected = format!(
            "http://unix:{}/$scratch_id/sockets/api.sock:",
            releases(&dir).display()
        );
        assert!(rule.contains(&expected), "{rule}");
    }
}

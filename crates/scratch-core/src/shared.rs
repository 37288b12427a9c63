//! Shared services and the per-scratch database they host.
//!
//! Shared fragments live in one compose project under `<releases>/.shared/`.
//! Callers serialize access through the controller's shared-service lock;
//! nothing here ever stops or removes a shared service on behalf of a
//! single scratch.

use crate::composer::{self, Composer, Vars};
use crate::compose::{Project, Runtime, ServiceStatus};
use crate::config::{Config, DatabaseConfig};
use crate::error::{Result, ScratchError};
use crate::oplog::OpLog;
use crate::paths;
use std::path::Path;

pub struct SharedServices<'a> {
    config: &'a Config,
    composer: &'a Composer<'a>,
    runtime: &'a Runtime,
    releases: &'a Path,
}

impl<'a> SharedServices<'a> {
    pub fn new(
        config: &'a Config,
        composer: &'a Composer<'a>,
        runtime: &'a Runtime,
        releases: &'a Path,
    ) -> Self {
        Self {
            config,
            composer,
            runtime,
            releases,
        }
    }

    /// Names of every shared fragment, in declaration order.
    pub fn names(&self) -> Vec<String> {
        self.config
            .services
            .iter()
            .filter(|f| f.shared)
            .map(|f| f.name.clone())
            .collect()
    }

    /// Shared members of a scratch's selected service set.
    pub fn selected(&self, selected: &[String]) -> Vec<String> {
        self.names()
            .into_iter()
            .filter(|n| selected.contains(n))
            .collect()
    }

    fn project(&self) -> Result<Project<'a>> {
        let descriptor = self.composer.shared_descriptor();
        if descriptor.services.is_empty() {
            return Err(ScratchError::UnknownService("no shared services configured".into()));
        }
        let path = paths::shared_descriptor_path(self.releases);
        if descriptor.save(&path)? {
            tracing::info!(path = %path.display(), "shared descriptor updated");
        }
        Ok(self.runtime.project(
            descriptor.name.clone(),
            &paths::shared_dir(self.releases),
            &path,
        ))
    }

    fn check_known(&self, services: &[String]) -> Result<()> {
        let known = self.names();
        for s in services {
            if !known.contains(s) {
                return Err(ScratchError::UnknownService(s.clone()));
            }
        }
        Ok(())
    }

    /// Bring `services` up; already-running containers are left alone.
    pub fn ensure_up(&self, services: &[String], log: Option<&OpLog>) -> Result<()> {
        if services.is_empty() {
            return Ok(());
        }
        self.check_known(services)?;
        self.runtime.ensure_network(&self.config.runtime.network, log)?;
        self.project()?.up(services, false, log)
    }

    pub fn stop(&self, services: &[String], log: Option<&OpLog>) -> Result<()> {
        self.check_known(services)?;
        let targets = if services.is_empty() {
            self.names()
        } else {
            services.to_vec()
        };
        if targets.is_empty() {
            return Ok(());
        }
        self.project()?.stop(&targets, log)
    }

    pub fn status(&self) -> Result<Vec<ServiceStatus>> {
        if self.names().is_empty() {
            return Ok(Vec::new());
        }
        self.project()?.ps(None)
    }

    // -----------------------------------------------------------------------
    // Per-scratch database
    // -----------------------------------------------------------------------

    fn database(&self) -> Result<&'a DatabaseConfig> {
        self.config.database.as_ref().ok_or(ScratchError::NoDatabase)
    }

    fn db_vars(&self, identity: &str, database: &str) -> Vars {
        let mut vars = Vars::new();
        vars.set("identity", identity).set("database", database);
        vars
    }

    fn db_exec(&self, argv: &[String], vars: &Vars, log: Option<&OpLog>) -> Result<()> {
        let db = self.database()?;
        let argv: Vec<String> = argv.iter().map(|a| composer::substitute(a, vars)).collect();
        let container = self.composer.shared_container_name(&db.service);
        self.runtime.exec(&container, &argv, log)?;
        Ok(())
    }

    /// Create the scratch database unless the probe says it exists.
    pub fn create_database(&self, identity: &str, database: &str, log: Option<&OpLog>) -> Result<()> {
        let db = self.database()?;
        let vars = self.db_vars(identity, database);
        if !db.exists.is_empty() && self.db_exec(&db.exists, &vars, log).is_ok() {
            tracing::debug!(identity, database, "database already exists");
            return Ok(());
        }
        self.db_exec(&db.create, &vars, log)?;
        tracing::info!(identity, database, "database created");
        Ok(())
    }

    pub fn drop_database(&self, identity: &str, database: &str, log: Option<&OpLog>) -> Result<()> {
        let db = self.database()?;
        self.db_exec(&db.drop, &self.db_vars(identity, database), log)?;
        tracing::info!(identity, database, "database dropped");
        Ok(())
    }
}

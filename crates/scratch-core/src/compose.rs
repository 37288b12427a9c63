//! Container runtime contract: `<command> compose ...`, `<command> exec ...`
//! and `<command> network ...`, all through a [`CommandRunner`].

use crate::error::Result;
use crate::exec::{CancelToken, CommandOutput, CommandRunner, Invocation};
use crate::oplog::OpLog;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Clone)]
pub struct Runtime {
    runner: Arc<dyn CommandRunner>,
    command: String,
    cancel: CancelToken,
}

impl Runtime {
    pub fn new(runner: Arc<dyn CommandRunner>, command: impl Into<String>) -> Self {
        Self {
            runner,
            command: command.into(),
            cancel: CancelToken::new(),
        }
    }

    /// Token shared by every invocation; cancelling it kills running
    /// children (used on shutdown).
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn invocation(&self) -> Invocation {
        Invocation::new(&self.command)
    }

    /// Run and record in `log`; a non-zero exit is not an error here.
    pub fn invoke(&self, inv: &Invocation, log: Option<&OpLog>) -> Result<CommandOutput> {
        let out = self.runner.run(inv, &self.cancel);
        if let Some(log) = log {
            log.invocation(inv, &out);
        }
        out
    }

    /// Run, record, and turn a non-zero exit into `ScriptFailure`.
    pub fn invoke_checked(&self, inv: &Invocation, log: Option<&OpLog>) -> Result<CommandOutput> {
        self.invoke(inv, log)?.check()
    }

    pub fn ensure_network(&self, network: &str, log: Option<&OpLog>) -> Result<()> {
        let inspect = self.invocation().args(["network", "inspect", network]);
        if self.invoke(&inspect, log)?.success() {
            return Ok(());
        }
        tracing::info!(network, "creating network");
        let create = self.invocation().args(["network", "create", network]);
        self.invoke_checked(&create, log)?;
        Ok(())
    }

    /// `exec` into a running container by name.
    pub fn exec(&self, container: &str, argv: &[String], log: Option<&OpLog>) -> Result<CommandOutput> {
        let inv = self
            .invocation()
            .args(["exec", container])
            .args(argv.iter().cloned());
        self.invoke_checked(&inv, log)
    }

    pub fn project(&self, name: impl Into<String>, dir: &Path, file: &Path) -> Project<'_> {
        Project {
            runtime: self,
            name: name.into(),
            dir: dir.to_path_buf(),
            file: file.to_path_buf(),
        }
    }
}

// ---------------------------------------------------------------------------
// Project
// ---------------------------------------------------------------------------

pub struct Project<'a> {
    runtime: &'a Runtime,
    name: String,
    dir: PathBuf,
    file: PathBuf,
}

impl Project<'_> {
    pub fn name(&self) -> &str {
        &self.name
    }

    fn compose(&self) -> Invocation {
        self.runtime
            .invocation()
            .cwd(&self.dir)
            .args(["compose", "-p", self.name.as_str(), "-f"])
            .arg(self.file.display().to_string())
    }

    fn run(&self, inv: Invocation, log: Option<&OpLog>) -> Result<CommandOutput> {
        self.runtime.invoke_checked(&inv, log)
    }

    pub fn up(&self, services: &[String], no_deps: bool, log: Option<&OpLog>) -> Result<()> {
        let mut inv = self.compose().args(["up", "-d", "--remove-orphans"]);
        if no_deps {
            inv = inv.arg("--no-deps");
        }
        self.run(inv.args(services.iter().cloned()), log)?;
        Ok(())
    }

    /// Remove containers (and named volumes with `volumes`); files stay.
    pub fn down(&self, volumes: bool, log: Option<&OpLog>) -> Result<()> {
        let mut inv = self.compose().args(["down", "--remove-orphans"]);
        if volumes {
            inv = inv.arg("--volumes");
        }
        self.run(inv, log)?;
        Ok(())
    }

    pub fn stop(&self, services: &[String], log: Option<&OpLog>) -> Result<()> {
        self.run(self.compose().arg("stop").args(services.iter().cloned()), log)?;
        Ok(())
    }

    pub fn rm(&self, services: &[String], log: Option<&OpLog>) -> Result<()> {
        let inv = self
            .compose()
            .args(["rm", "--force", "--stop"])
            .args(services.iter().cloned());
        self.run(inv, log)?;
        Ok(())
    }

    pub fn build(&self, services: &[String], no_cache: bool, log: Option<&OpLog>) -> Result<()> {
        let mut inv = self.compose().arg("build");
        if no_cache {
            inv = inv.arg("--no-cache");
        }
        self.run(inv.args(services.iter().cloned()), log)?;
        Ok(())
    }

    /// One-shot container of `service` running `argv`.
    pub fn run_once(&self, service: &str, argv: &[String], log: Option<&OpLog>) -> Result<CommandOutput> {
        let inv = self
            .compose()
            .args(["run", "--rm", "--no-deps", "-T", service])
            .args(argv.iter().cloned());
        self.run(inv, log)
    }

    pub fn ps(&self, log: Option<&OpLog>) -> Result<Vec<ServiceStatus>> {
        let inv = self.compose().args(["ps", "--all", "--format", "json"]);
        let out = self.run(inv, log)?;
        parse_ps(&out.stdout)
    }

    pub fn logs(&self, service: Option<&str>, tail: usize) -> Result<String> {
        let inv = self
            .compose()
            .args(["logs", "--no-color", "--tail"])
            .arg(tail.to_string())
            .args(service.map(str::to_string));
        Ok(self.run(inv, None)?.stdout)
    }
}

// ---------------------------------------------------------------------------
// compose ps
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    #[serde(rename = "Service")]
    pub service: String,
    #[serde(rename = "Name", default)]
    pub container: String,
    #[serde(rename = "State", default)]
    pub state: String,
    #[serde(rename = "Health", default)]
    pub health: String,
    #[serde(rename = "ExitCode", default)]
    pub exit_code: i32,
}

impl ServiceStatus {
    pub fn is_running(&self) -> bool {
        self.state == "running"
    }

    /// Running and either without a healthcheck or reporting healthy.
    pub fn is_healthy(&self) -> bool {
        self.is_running() && (self.health.is_empty() || self.health == "healthy")
    }

    /// Health not settled yet.
    pub fn is_starting(&self) -> bool {
        self.state == "created" || self.state == "restarting" || self.health == "starting"
    }
}

/// Parse `compose ps --format json`: a JSON array (older compose) or one
/// object per line.
pub fn parse_ps(stdout: &str) -> Result<Vec<ServiceStatus>> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    if trimmed.starts_with('[') {
        return Ok(serde_json::from_str(trimmed)?);
    }
    trimmed
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).map_err(Into::into))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_array_and_ndjson() {
        let array = r#"[{"Service":"api","Name":"p-api-1","State":"running","Health":"healthy"},
                        {"Service":"redis","Name":"p-redis-1","State":"exited","ExitCode":1}]"#;
        let ndjson = "{\"Service\":\"api\",\"Name\":\"p-api-1\",\"State\":\"running\",\"Health\":\"healthy\"}\n\
                      {\"Service\":\"redis\",\"Name\":\"p-redis-1\",\"State\":\"exited\",\"ExitCode\":1}\n";
        for raw in [array, ndjson] {
            let ps = parse_ps(raw).unwrap();
            assert_eq!(ps.len(), 2);
            assert!(ps[0].is_healthy());
            assert!(!ps[1].is_running());
            assert_eq!(ps[1].exit_code, 1);
        }
        assert!(parse_ps("  \n").unwrap().is_empty());
    }

    #[test]
    fn health_classification() {
        let s = |state: &str, health: &str| ServiceStatus {
            service: "x".into(),
            container: String::new(),
            state: state.into(),
            health: health.into(),
            exit_code: 0,
        };
        assert!(s("running", "").is_healthy());
        assert!(!s("running", "unhealthy").is_healthy());
        assert!(s("running", "starting").is_starting());
        assert!(!s("exited", "").is_starting());
    }

    #[test]
    fn compose_invocation_shape() {
        use crate::exec::SystemRunner;
        let rt = Runtime::new(Arc::new(SystemRunner), "docker");
        let p = rt.project("scratch-x", Path::new("/r/x"), Path::new("/r/x/compose.yaml"));
        let inv = p.compose().args(["up", "-d"]);
        assert_eq!(
            inv.display(),
            "docker compose -p scratch-x -f /r/x/compose.yaml up -d"
        );
        assert_eq!(inv.cwd.as_deref(), Some(Path::new("/r/x")));
    }
}

//! Structured subprocess execution.
//!
//! Every external invocation (container runtime, initializers, database
//! commands) goes through a [`CommandRunner`] and comes back as a typed
//! [`CommandOutput`]. A non-zero exit becomes `ScratchError::ScriptFailure`
//! only when the caller asks for it with [`CommandOutput::check`].

use crate::error::{Result, ScratchError};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(25);
const STDERR_HINT_LEN: usize = 2000;

// ---------------------------------------------------------------------------
// Invocation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub stdin: Option<String>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            stdin: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: &Path) -> Self {
        self.cwd = Some(dir.to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Single-line rendering for logs.
    pub fn display(&self) -> String {
        let mut out = self.program.clone();
        for a in &self.args {
            out.push(' ');
            if a.is_empty() || a.contains(char::is_whitespace) {
                out.push('\'');
                out.push_str(a);
                out.push('\'');
            } else {
                out.push_str(a);
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// CommandOutput
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
            duration: Duration::ZERO,
        }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
            duration: Duration::ZERO,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Turn a non-zero exit into `ScriptFailure`.
    pub fn check(self) -> Result<Self> {
        if self.success() {
            return Ok(self);
        }
        let stderr = if self.stderr.trim().is_empty() {
            self.stdout.trim().to_string()
        } else {
            self.stderr.trim().to_string()
        };
        Err(ScratchError::ScriptFailure {
            exit_code: self.exit_code,
            stderr: stderr.chars().take(STDERR_HINT_LEN).collect(),
        })
    }
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Shared flag checked while a child runs; cancelling kills the child.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// CommandRunner
// ---------------------------------------------------------------------------

pub trait CommandRunner: Send + Sync {
    fn run(&self, invocation: &Invocation, cancel: &CancelToken) -> Result<CommandOutput>;
}

/// Runs invocations as real child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, invocation: &Invocation, cancel: &CancelToken) -> Result<CommandOutput> {
        tracing::debug!(command = %invocation.display(), "exec");
        let start = Instant::now();

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args);
        if let Some(dir) = &invocation.cwd {
            cmd.current_dir(dir);
        }
        for (k, v) in &invocation.env {
            cmd.env(k, v);
        }
        cmd.stdin(if invocation.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| ScratchError::SpawnFailed {
            program: invocation.program.clone(),
            message: e.to_string(),
        })?;

        // Every pipe gets its own thread so neither side can block the other
        // on a full buffer, and cancellation stays responsive while input is
        // still being fed.
        let stdout_reader = child.stdout.take().map(spawn_reader);
        let stderr_reader = child.stderr.take().map(spawn_reader);
        let stdin_writer = match (&invocation.stdin, child.stdin.take()) {
            (Some(input), Some(pipe)) => Some(spawn_writer(pipe, input.clone().into_bytes())),
            _ => None,
        };

        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if cancel.is_cancelled() {
                let _ = child.kill();
                let _ = child.wait();
                return Err(ScratchError::Cancelled(invocation.display()));
            }
            std::thread::sleep(POLL_INTERVAL);
        };

        if let Some(writer) = stdin_writer {
            match writer.join() {
                Ok(Err(e)) if e.kind() != std::io::ErrorKind::BrokenPipe => return Err(e.into()),
                _ => {}
            }
        }
        let stdout = stdout_reader.map(join_reader).unwrap_or_default();
        let stderr = stderr_reader.map(join_reader).unwrap_or_default();

        Ok(CommandOutput {
            exit_code: status.code().unwrap_or(-1),
            stdout,
            stderr,
            duration: start.elapsed(),
        })
    }
}

fn spawn_reader<R: Read + Send + 'static>(mut pipe: R) -> std::thread::JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn spawn_writer<W: Write + Send + 'static>(
    mut pipe: W,
    input: Vec<u8>,
) -> std::thread::JoinHandle<std::io::Result<()>> {
    // The pipe closes when `pipe` drops at the end of the thread.
    std::thread::spawn(move || pipe.write_all(&input))
}

fn join_reader(handle: std::thread::JoinHandle<String>) -> String {
    handle.join().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_stdout_and_exit_code() {
        let out = SystemRunner
            .run(
                &Invocation::new("sh").args(["-c", "echo hello; echo oops >&2; exit 3"]),
                &CancelToken::new(),
            )
            .unwrap();
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.stderr.trim(), "oops");
    }

    #[test]
    fn check_maps_nonzero_to_script_failure() {
        let err = CommandOutput::failed(2, "no such service\n").check().unwrap_err();
        match err {
            ScratchError::ScriptFailure { exit_code, stderr } => {
                assert_eq!(exit_code, 2);
                assert_eq!(stderr, "no such service");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn missing_program_is_spawn_failed() {
        let err = SystemRunner
            .run(&Invocation::new("__no_such_binary__"), &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, ScratchError::SpawnFailed { .. }));
    }

    #[test]
    fn stdin_is_forwarded() {
        let mut inv = Invocation::new("cat");
        inv.stdin = Some("piped".into());
        let out = SystemRunner.run(&inv, &CancelToken::new()).unwrap();
        assert_eq!(out.stdout, "piped");
    }

    #[test]
    fn large_stdin_with_echoing_child_completes() {
        // Well past a pipe buffer in both directions.
        let input = "0123456789abcdef\n".repeat(64 * 1024);
        let mut inv = Invocation::new("sh").args(["-c", "tee /dev/stderr"]);
        inv.stdin = Some(input.clone());
        let out = SystemRunner.run(&inv, &CancelToken::new()).unwrap();
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.stdout.len(), input.len());
        assert_eq!(out.stderr.len(), input.len());
    }

    #[test]
    fn child_ignoring_stdin_is_not_an_error() {
        let mut inv = Invocation::new("true");
        inv.stdin = Some("x".repeat(1 << 20));
        let out = SystemRunner.run(&inv, &CancelToken::new()).unwrap();
        assert_eq!(out.exit_code, 0);
    }

    #[test]
    fn cancel_kills_the_child() {
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            trigger.cancel();
        });
        let started = Instant::now();
        let err = SystemRunner
            .run(&Invocation::new("sleep").arg("30"), &cancel)
            .unwrap_err();
        assert!(matches!(err, ScratchError::Cancelled(_)));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn display_quotes_whitespace() {
        let inv = Invocation::new("psql").args(["-c", "CREATE DATABASE x"]);
        assert_eq!(inv.display(), "psql -c 'CREATE DATABASE x'");
    }
}

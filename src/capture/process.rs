//! Lifecycle of the capture-source and frame-producer subprocesses

use std::fmt;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, info, warn};

/// How long `stop` waits for a graceful exit before SIGKILL
pub const STOP_GRACE: Duration = Duration::from_secs(2);
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessKind {
    /// AirPlay receiver feeding the local transport socket
    CaptureSource,
    /// Pipeline turning the socket stream into raw RGB on stdout
    FrameProducer,
}

impl ProcessKind {
    pub fn name(&self) -> &'static str {
        match self {
            ProcessKind::CaptureSource => "uxplay",
            ProcessKind::FrameProducer => "gst-reader",
        }
    }
}

impl fmt::Display for ProcessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdoutMode {
    /// Share the daemon's stdout/stderr so diagnostics land in its log
    Inherit,
    /// Pipe stdout back to us, discard stderr
    Piped,
}

/// A program invocation, kept separate from spawning so it can be logged
/// and swapped out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub stdout: StdoutMode,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, stdout: StdoutMode) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdout,
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
}

impl fmt::Display for CommandSpec {
    /// Shell-quoted command line
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let words = std::iter::once(self.program.as_str()).chain(self.args.iter().map(String::as_str));
        match shlex::try_join(words) {
            Ok(line) => f.write_str(&line),
            // only fails on interior NUL bytes
            Err(_) => write!(f, "{} {:?}", self.program, self.args),
        }
    }
}

#[derive(Debug, Error)]
enum StopError {
    #[error("failed to signal process: {0}")]
    Signal(#[from] nix::Error),
    #[error("failed to kill process: {0}")]
    Kill(#[from] io::Error),
}

/// One running child process.
pub struct ManagedProcess {
    kind: ProcessKind,
    child: Child,
    stdout: Option<ChildStdout>,
    status: Option<ExitStatus>,
}

impl ManagedProcess {
    pub fn start(kind: ProcessKind, spec: &CommandSpec) -> io::Result<Self> {
        info!("Starting {}: {}", kind, spec);

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args).stdin(Stdio::null()).kill_on_drop(true);
        match spec.stdout {
            StdoutMode::Inherit => {
                cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
            }
            StdoutMode::Piped => {
                cmd.stdout(Stdio::piped()).stderr(Stdio::null());
            }
        }

        let mut child = cmd.spawn()?;
        let stdout = child.stdout.take();
        debug!("{} running as pid {:?}", kind, child.id());

        Ok(Self {
            kind,
            child,
            stdout,
            status: None,
        })
    }

    pub fn kind(&self) -> ProcessKind {
        self.kind
    }

    /// Poll without blocking; records the exit status on the transition to dead.
    pub fn is_alive(&mut self) -> bool {
        if self.status.is_some() {
            return false;
        }
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                debug!("{} exited: {}", self.kind, status);
                self.status = Some(status);
                false
            }
            Err(e) => {
                warn!("Unable to poll {}: {}", self.kind, e);
                false
            }
        }
    }

    /// Exit code once dead. Signal deaths map to `128 + signo` like a shell.
    pub fn exit_code(&self) -> Option<i32> {
        let status = self.status?;
        status.code().or_else(|| status.signal().map(|sig| 128 + sig))
    }

    pub fn stdout_mut(&mut self) -> Option<&mut ChildStdout> {
        self.stdout.as_mut()
    }

    /// SIGTERM, wait up to `STOP_GRACE`, then SIGKILL.
    ///
    /// Errors are logged, not returned.
    pub async fn stop(mut self) {
        if let Err(e) = self.terminate().await {
            warn!("Error stopping {}: {}", self.kind, e);
        }
    }

    async fn terminate(&mut self) -> Result<(), StopError> {
        if !self.is_alive() {
            return Ok(());
        }

        if let Some(pid) = self.child.id() {
            kill(Pid::from_raw(pid as i32), Signal::SIGTERM)?;
        }

        let polls = STOP_GRACE.as_millis() / STOP_POLL_INTERVAL.as_millis();
        for _ in 0..polls {
            if !self.is_alive() {
                debug!("{} stopped", self.kind);
                return Ok(());
            }
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }

        if self.is_alive() {
            warn!("{} ignored SIGTERM, killing", self.kind);
            self.child.kill().await?;
            self.status = self.child.try_wait()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn sh(script: &str, stdout: StdoutMode) -> CommandSpec {
        CommandSpec::new("/bin/sh", stdout).arg("-c").arg(script)
    }

    #[test]
    fn command_line_is_shell_quoted() {
        let spec = CommandSpec::new("uxplay", StdoutMode::Inherit).args(["-n", "My TV"]);
        let line = spec.to_string();
        assert!(line.starts_with("uxplay -n "), "{}", line);
        assert_eq!(shlex::split(&line).unwrap(), vec!["uxplay", "-n", "My TV"]);
    }

    #[tokio::test]
    async fn captures_exit_code() {
        let mut p = ManagedProcess::start(ProcessKind::CaptureSource, &sh("exit 137", StdoutMode::Inherit)).unwrap();
        for _ in 0..50 {
            if !p.is_alive() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!p.is_alive());
        assert_eq!(p.exit_code(), Some(137));
    }

    #[tokio::test]
    async fn piped_stdout_is_readable() {
        let mut p = ManagedProcess::start(ProcessKind::FrameProducer, &sh("printf abc", StdoutMode::Piped)).unwrap();
        let mut out = Vec::new();
        p.stdout_mut().unwrap().read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"abc");
        p.stop().await;
    }

    #[tokio::test]
    async fn stop_terminates_gracefully() {
        let mut p = ManagedProcess::start(ProcessKind::FrameProducer, &sh("exec sleep 30", StdoutMode::Piped)).unwrap();
        assert!(p.is_alive());
        let started = std::time::Instant::now();
        p.stop().await;
        assert!(started.elapsed() < STOP_GRACE);
    }

    #[tokio::test]
    async fn stop_kills_when_sigterm_is_ignored() {
        let mut p = ManagedProcess::start(
            ProcessKind::FrameProducer,
            &sh("trap '' TERM; while :; do sleep 0.05; done", StdoutMode::Piped),
        )
        .unwrap();
        // give the shell time to install the trap
        tokio::time::sleep(Duration::from_millis(200)).await;
        p.terminate().await.unwrap();
        assert!(!p.is_alive());
        // SIGKILL
        assert_eq!(p.exit_code(), Some(128 + 9));
    }

    #[tokio::test]
    async fn stop_after_exit_is_a_no_op() {
        let mut p = ManagedProcess::start(ProcessKind::FrameProducer, &sh("true", StdoutMode::Piped)).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!p.is_alive());
        p.terminate().await.unwrap();
        assert_eq!(p.exit_code(), Some(0));
    }

    #[tokio::test]
    async fn missing_binary_fails_to_start() {
        let spec = CommandSpec::new("/nonexistent/airplay-bin", StdoutMode::Piped);
        assert!(ManagedProcess::start(ProcessKind::CaptureSource, &spec).is_err());
    }
}

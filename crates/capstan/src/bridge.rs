//! Parent-side proxy for the backend child: spawns `capstand` with its
//! stdin/stdout as the command pipes, marshals token-matched JSON frames,
//! and tears the child down with a bounded kill sequence.
//!
//! Signals are never acted on inside handlers: [`SignalFlag`] only flips
//! a flag, and [`DriverBridge::run_until_signal`] is the loop that
//! observes it, stops the VM and the child, marks the run failed, and
//! hands back the non-zero exit code the runner terminates with.

use async_trait::async_trait;
use capstan_core::{Error, Result, RuntimeFlags, VmConfig};
use capstan_ipc::{Command, CommandFrame, ControlPipe, Outcome, ResponseFrame};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tokio::time::timeout;

const PIPE_CLOSE_WAIT: Duration = Duration::from_secs(10);
const TERM_WAIT: Duration = Duration::from_secs(15);

/// The seam the test runner drives a virtualization backend through.
#[async_trait]
pub trait TestBackend: Send {
    fn name(&self) -> &'static str;
    async fn command(&mut self, command: Command) -> Result<Outcome>;
    async fn stop(&mut self) -> Result<()>;
}

#[derive(Debug)]
pub struct DriverBridge {
    child: Child,
    pipe: Option<ControlPipe<ChildStdout, ChildStdin>>,
    next_token: u64,
    failed: bool,
}

impl DriverBridge {
    /// Spawn the backend child and hand it the VM configuration as the
    /// first command.
    pub async fn start(config: VmConfig, flags: RuntimeFlags) -> Result<Self> {
        let mut bridge = Self::spawn_backend().await?;
        let outcome = bridge.send(Command::StartVm { config, flags }).await?;
        if let Outcome::Err { error, message } = &outcome {
            let _ = bridge.stop_child().await;
            return Err(Error::Spawn(format!("{error}: {message}")));
        }
        Ok(bridge)
    }

    /// Spawn the child without starting a VM; commands are forwarded
    /// as-is. Used by runners that drive `start_vm` themselves.
    pub async fn spawn_backend() -> Result<Self> {
        let binary = locate_backend()
            .ok_or_else(|| Error::Spawn("capstand binary not found".into()))?;
        let mut child = tokio::process::Command::new(&binary)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| Error::Spawn(format!("{}: {e}", binary.display())))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Spawn("backend child has no stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Spawn("backend child has no stdout".into()))?;

        Ok(DriverBridge {
            child,
            pipe: Some(ControlPipe::new(stdout, stdin)),
            next_token: 0,
            failed: false,
        })
    }

    /// Send one command and block on the response carrying its token.
    /// Responses for other tokens are logged and discarded.
    pub async fn send(&mut self, command: Command) -> Result<Outcome> {
        let pipe = self.pipe.as_mut().ok_or(Error::Disconnected)?;
        self.next_token += 1;
        let token = self.next_token;
        let frame = CommandFrame { command, token };
        pipe.send_line(serde_json::to_string(&frame)?)
            .await
            .map_err(|_| Error::Disconnected)?;

        loop {
            let line = match pipe.recv_line().await {
                Some(Ok(line)) => line,
                Some(Err(_)) | None => return Err(Error::Disconnected),
            };
            let response: ResponseFrame = match serde_json::from_str(&line) {
                Ok(response) => response,
                Err(e) => {
                    tracing::warn!(error = %e, "unparseable response frame");
                    continue;
                }
            };
            if response.token == token {
                return Ok(response.rsp);
            }
            tracing::warn!(
                expected = token,
                got = response.token,
                "discarding response for stale token"
            );
        }
    }

    /// Park on the signal flag. When INT/TERM/HUP/ALRM arrives: stop the
    /// VM and the child, mark the current run failed, and return the
    /// exit code (1) for the runner to terminate with. Runners race this
    /// against their test loop with `select!`.
    pub async fn run_until_signal(&mut self, signals: &mut SignalFlag) -> i32 {
        let signal = signals.wait().await;
        tracing::error!(signal, "termination signal in the parent, aborting the run");
        self.failed = true;
        if let Err(e) = self.stop().await {
            tracing::warn!(error = %e, "teardown after signal failed");
        }
        self.exit_code()
    }

    /// Record that the current test cannot pass anymore.
    pub fn mark_failed(&mut self) {
        self.failed = true;
    }

    pub fn run_failed(&self) -> bool {
        self.failed
    }

    /// Exit code propagated to the runner: 0 on success, 1 after a
    /// signal or a failed run.
    pub fn exit_code(&self) -> i32 {
        if self.failed { 1 } else { 0 }
    }

    /// Orderly shutdown: `stop_vm`, close the pipes, then stop the child
    /// with bounded escalation (pipe close, SIGTERM, SIGKILL).
    pub async fn stop(&mut self) -> Result<()> {
        if self.pipe.is_some() {
            let _ = timeout(Duration::from_secs(60), self.send(Command::StopVm)).await;
        }
        self.stop_child().await
    }

    async fn stop_child(&mut self) -> Result<()> {
        if let Some(mut pipe) = self.pipe.take() {
            let _ = pipe.close().await;
        }
        if timeout(PIPE_CLOSE_WAIT, self.child.wait()).await.is_ok() {
            return Ok(());
        }
        if let Some(pid) = self.child.id() {
            tracing::warn!(pid, "backend ignored pipe close, sending SIGTERM");
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
        if timeout(TERM_WAIT, self.child.wait()).await.is_ok() {
            return Ok(());
        }
        tracing::warn!("backend ignored SIGTERM, killing");
        self.child.kill().await?;
        Ok(())
    }
}

#[async_trait]
impl TestBackend for DriverBridge {
    fn name(&self) -> &'static str {
        "qemu"
    }

    async fn command(&mut self, command: Command) -> Result<Outcome> {
        self.send(command).await
    }

    async fn stop(&mut self) -> Result<()> {
        DriverBridge::stop(self).await
    }
}

/// Resolution order: explicit override, sibling of the current
/// executable, PATH.
fn locate_backend() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("CAPSTAN_BACKEND_PATH") {
        let path = PathBuf::from(path);
        if path.exists() {
            return Some(path);
        }
    }
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let sibling = dir.join("capstand");
            if sibling.exists() {
                return Some(sibling);
            }
        }
    }
    which::which("capstand").ok()
}

/// Async-signal-safe signal observation: the handlers only feed a watch
/// channel, everything else happens on the event loop.
pub struct SignalFlag {
    rx: watch::Receiver<Option<&'static str>>,
}

impl SignalFlag {
    pub fn install() -> Result<Self> {
        let (tx, rx) = watch::channel(None);
        let tx = std::sync::Arc::new(tx);
        let hooks = [
            (SignalKind::interrupt(), "INT"),
            (SignalKind::terminate(), "TERM"),
            (SignalKind::hangup(), "HUP"),
            (SignalKind::alarm(), "ALRM"),
        ];
        for (kind, name) in hooks {
            let mut stream = signal(kind)?;
            let tx = tx.clone();
            tokio::spawn(async move {
                while stream.recv().await.is_some() {
                    let _ = tx.send(Some(name));
                }
            });
        }
        Ok(SignalFlag { rx })
    }

    /// The first signal observed so far, if any.
    pub fn triggered(&self) -> Option<&'static str> {
        *self.rx.borrow()
    }

    /// Suspend until a signal arrives.
    pub async fn wait(&mut self) -> &'static str {
        match self.rx.wait_for(|s| s.is_some()).await {
            Ok(value) => value.unwrap_or("TERM"),
            Err(_) => "TERM",
        }
    }
}

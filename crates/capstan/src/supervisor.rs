//! Ownership of the QEMU child process: spawn with a merged stdout/stderr
//! pipe, pid-file bookkeeping, exit notification, and signal escalation.

use capstan_core::{AsyncOwnedFd, Error, Result};
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tokio::time::timeout;

/// Window after SIGKILL in which the child must be reaped before the stop
/// is reported as failed.
const FORCE_REAP_WINDOW: Duration = Duration::from_secs(1);

/// Line reader over the child's merged stdout/stderr.
#[derive(Debug)]
pub struct LogReader {
    lines: tokio::io::Lines<BufReader<AsyncOwnedFd>>,
}

impl LogReader {
    pub async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        self.lines.next_line().await
    }
}

#[derive(Debug)]
pub struct Supervisor {
    pid: Pid,
    pid_file: PathBuf,
    exit_rx: watch::Receiver<Option<ExitStatus>>,
    log: Option<LogReader>,
}

impl Supervisor {
    /// Spawn `argv` with stderr merged into stdout through a shared pipe.
    /// The pid file is written atomically before this returns, so it is on
    /// disk before any QMP traffic.
    pub async fn spawn(
        argv: &[String],
        env: &[(String, String)],
        cwd: &Path,
        pid_file: &Path,
    ) -> Result<Self> {
        let (binary, args) = argv
            .split_first()
            .ok_or_else(|| Error::Spawn("empty argv".into()))?;

        let (log_rx, log_tx) = nix::unistd::pipe().map_err(std::io::Error::from)?;
        let stderr_tx = log_tx.try_clone().map_err(std::io::Error::from)?;

        let mut cmd = Command::new(binary);
        cmd.args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_tx))
            .stderr(Stdio::from(stderr_tx))
            .kill_on_drop(true);
        for (key, value) in env {
            cmd.env(key, value);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Spawn(format!("{}: {e}", binary)))?;
        let pid = Pid::from_raw(
            child
                .id()
                .ok_or_else(|| Error::Spawn("child exited before it was tracked".into()))?
                as i32,
        );

        write_pid_file(pid_file, pid)?;
        tracing::info!(%pid, binary, "spawned qemu");

        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => {
                    tracing::info!(%pid, %status, "qemu exited");
                    let _ = exit_tx.send(Some(status));
                }
                Err(e) => {
                    use std::os::unix::process::ExitStatusExt;
                    tracing::warn!(%pid, error = %e, "failed to reap qemu");
                    let _ = exit_tx.send(Some(ExitStatus::from_raw(0)));
                }
            }
        });

        let log = LogReader {
            lines: BufReader::new(AsyncOwnedFd::new(log_rx)?).lines(),
        };

        Ok(Supervisor {
            pid,
            pid_file: pid_file.to_path_buf(),
            exit_rx,
            log: Some(log),
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// The merged stdout/stderr reader; available once.
    pub fn take_log_reader(&mut self) -> Option<LogReader> {
        self.log.take()
    }

    /// Resolves when the child has been reaped.
    pub fn exit_watch(&self) -> watch::Receiver<Option<ExitStatus>> {
        self.exit_rx.clone()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    /// A `kill(pid, 0)` probe combined with the reap state.
    pub fn is_running(&self) -> bool {
        !self.has_exited() && kill(self.pid, None).is_ok()
    }

    /// Graceful termination with bounded escalation: SIGTERM, wait up to
    /// `graceful`, then SIGKILL and wait one more reap window.
    pub async fn stop(&mut self, graceful: Duration) -> Result<()> {
        if !self.has_exited() {
            tracing::debug!(pid = %self.pid, "sending SIGTERM to qemu");
            let _ = kill(self.pid, Signal::SIGTERM);
            if self.wait_exit(graceful).await.is_none() {
                tracing::warn!(pid = %self.pid, "qemu ignored SIGTERM, sending SIGKILL");
                let _ = kill(self.pid, Signal::SIGKILL);
                if self.wait_exit(FORCE_REAP_WINDOW).await.is_none() {
                    return Err(Error::StillRunning);
                }
            }
        }
        self.remove_pid_file();
        Ok(())
    }

    /// Wait for the exit notification, up to `limit`.
    pub async fn wait_exit(&mut self, limit: Duration) -> Option<ExitStatus> {
        let result = timeout(limit, self.exit_rx.wait_for(|status| status.is_some())).await;
        match result {
            Ok(Ok(status)) => *status,
            _ => None,
        }
    }

    pub fn remove_pid_file(&self) {
        if let Err(e) = std::fs::remove_file(&self.pid_file) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.pid_file.display(), error = %e, "could not remove pid file");
            }
        }
    }
}

fn write_pid_file(path: &Path, pid: Pid) -> Result<()> {
    let tmp = path.with_extension("pid.tmp");
    std::fs::write(&tmp, format!("{pid}\n"))?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Reap any children the process has inherited or lost track of, logging
/// each. Pids in `known` are left for their own reapers.
pub fn collect_orphans(known: &[Pid]) {
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(pid, code)) => {
                if !known.contains(&pid) {
                    tracing::info!(%pid, code, "collected orphaned child");
                }
            }
            Ok(WaitStatus::Signaled(pid, signal, _)) => {
                if !known.contains(&pid) {
                    tracing::info!(%pid, %signal, "collected signaled orphan");
                }
            }
            Ok(WaitStatus::StillAlive) => break,
            Ok(_) => continue,
            Err(_) => break,
        }
    }
}

//! Backend child process: hosts the QEMU driver and serves line-delimited
//! JSON command frames on stdin/stdout. Logging goes to stderr, which the
//! parent leaves attached to its own.
//!
//! INT and TERM get a null disposition here: teardown is driven by the
//! parent closing the command pipe, never from inside a signal handler.

use capstan::QemuDriver;
use capstan_core::Error;
use capstan_ipc::{Command, CommandFrame, ControlPipe, Outcome, ResponseFrame};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::info;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    ignore_termination_signals();
    info!("capstand starting");

    serve(ControlPipe::new(tokio::io::stdin(), tokio::io::stdout())).await;

    info!("capstand shutting down");
}

fn ignore_termination_signals() {
    use nix::sys::signal::{SigHandler, Signal, signal};
    // SAFETY: SigIgn installs no handler code, only the ignore disposition
    unsafe {
        let _ = signal(Signal::SIGINT, SigHandler::SigIgn);
        let _ = signal(Signal::SIGTERM, SigHandler::SigIgn);
    }
}

async fn serve<R, W>(mut pipe: ControlPipe<R, W>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut driver: Option<QemuDriver> = None;

    while let Some(line) = pipe.recv_line().await {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "command pipe read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let (rsp, token) = match serde_json::from_str::<CommandFrame>(&line) {
            Ok(frame) => {
                let token = frame.token;
                (handle_command(&mut driver, frame.command).await, token)
            }
            Err(e) => {
                let token = recover_token(&line);
                let error = Error::Protocol(format!("bad command frame: {e}"));
                (Outcome::error(&error), token)
            }
        };

        let frame = ResponseFrame { rsp, token };
        let encoded = match serde_json::to_string(&frame) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::error!(error = %e, "response frame not serializable");
                continue;
            }
        };
        if pipe.send_line(encoded).await.is_err() {
            break;
        }
    }

    // Parent went away or closed the pipe: tear down whatever is live.
    if let Some(mut driver) = driver {
        driver.shutdown().await;
    }
}

async fn handle_command(driver: &mut Option<QemuDriver>, command: Command) -> Outcome {
    match (&mut *driver, command) {
        (None, Command::StartVm { config, flags }) => {
            let mut fresh = match QemuDriver::new(config, flags) {
                Ok(fresh) => fresh,
                Err(e) => return Outcome::error(&e),
            };
            let rsp = match fresh.start_vm().await {
                Ok(value) => Outcome::ok(value),
                Err(e) => Outcome::error(&e),
            };
            *driver = Some(fresh);
            rsp
        }
        (Some(driver), command) => driver.dispatch(command).await,
        (None, command) => {
            tracing::warn!(command = command.name(), "command before start_vm");
            Outcome::error(&Error::NotRunning)
        }
    }
}

/// Best-effort token recovery from an unparseable frame so the parent
/// does not hang on a missing response.
fn recover_token(line: &str) -> u64 {
    serde_json::from_str::<serde_json::Value>(line)
        .ok()
        .and_then(|v| v.get("token").and_then(serde_json::Value::as_u64))
        .unwrap_or(0)
}

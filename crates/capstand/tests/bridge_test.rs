//! End-to-end exercise of the control pipe: the real `capstand` binary
//! behind a `DriverBridge`, without booting a VM.

use capstan::{DriverBridge, SignalFlag};
use capstan_ipc::{Command, Outcome, PowerAction};
use std::time::Duration;

fn use_built_backend() {
    // SAFETY: set before the bridge spawns anything and only read there
    unsafe { std::env::set_var("CAPSTAN_BACKEND_PATH", env!("CARGO_BIN_EXE_capstand")) };
}

#[tokio::test]
async fn commands_before_start_vm_are_refused_with_matching_tokens() {
    use_built_backend();
    let mut bridge = DriverBridge::spawn_backend().await.unwrap();

    for command in [
        Command::CpuStat,
        Command::IsShutdown,
        Command::Power {
            action: PowerAction::Acpi,
        },
    ] {
        let outcome = bridge.send(command).await.unwrap();
        match outcome {
            Outcome::Err { error, .. } => assert_eq!(error, "not-running"),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    bridge.stop().await.unwrap();
}

#[tokio::test]
async fn stop_terminates_the_child_cleanly() {
    use_built_backend();
    let mut bridge = DriverBridge::spawn_backend().await.unwrap();

    let outcome = bridge.send(Command::StopAudiocapture).await.unwrap();
    assert!(!outcome.is_ok());

    // closing the pipe is enough; no signals should be needed
    bridge.stop().await.unwrap();

    // a stopped bridge refuses further traffic instead of hanging
    let err = bridge.send(Command::CpuStat).await.unwrap_err();
    assert!(matches!(err, capstan::Error::Disconnected));
}

#[tokio::test]
async fn signal_during_run_fails_the_run_and_reaps_the_backend() {
    use_built_backend();
    let mut signals = SignalFlag::install().unwrap();
    let mut bridge = DriverBridge::spawn_backend().await.unwrap();
    assert_eq!(bridge.exit_code(), 0);
    assert!(!bridge.run_failed());

    let killer = tokio::spawn(async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        nix::sys::signal::kill(nix::unistd::getpid(), nix::sys::signal::Signal::SIGHUP).unwrap();
    });

    // the whole teardown has to finish inside the shutdown budget
    let code = tokio::time::timeout(
        Duration::from_secs(30),
        bridge.run_until_signal(&mut signals),
    )
    .await
    .unwrap();
    killer.await.unwrap();

    assert_eq!(code, 1);
    assert!(bridge.run_failed());

    // the child is gone: the pipe is closed and stays closed
    let err = bridge.send(Command::CpuStat).await.unwrap_err();
    assert!(matches!(err, capstan::Error::Disconnected));
}

#[tokio::test]
async fn invalid_config_surfaces_as_a_start_error() {
    use_built_backend();
    let dir = tempfile::tempdir().unwrap();
    let mut config =
        capstan_core::VmConfig::new(capstan_core::Arch::X86_64, dir.path());
    config.cpus = 0;

    let err = DriverBridge::start(config, capstan_core::RuntimeFlags::default())
        .await
        .unwrap_err();
    assert!(matches!(err, capstan::Error::Spawn(_)));
}

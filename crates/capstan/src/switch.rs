//! Tap/VLAN wiring through the host's switch daemon, reached over the
//! system bus. Failures are fatal unless QEMU_NON_FATAL_DBUS_CALL turned
//! them into warnings.

use capstan_core::{Error, Result};

const SWITCH_SERVICE: &str = "org.opensuse.os_autoinst.switch";
const SWITCH_OBJECT: &str = "/switch";

pub async fn set_vlan(tap: &str, vlan: u16, non_fatal: bool) -> Result<()> {
    call(
        "set_vlan",
        &[format!("string:{tap}"), format!("uint16:{vlan}")],
        non_fatal,
    )
    .await
}

pub async fn unset_vlan(tap: &str, non_fatal: bool) -> Result<()> {
    call("unset_vlan", &[format!("string:{tap}")], non_fatal).await
}

async fn call(method: &str, arguments: &[String], non_fatal: bool) -> Result<()> {
    let mut command = tokio::process::Command::new("dbus-send");
    command
        .arg("--system")
        .arg("--print-reply")
        .arg(format!("--dest={SWITCH_SERVICE}"))
        .arg(SWITCH_OBJECT)
        .arg(format!("{SWITCH_SERVICE}.{method}"))
        .args(arguments);

    let failure = match command.output().await {
        Ok(output) if output.status.success() => return Ok(()),
        Ok(output) => String::from_utf8_lossy(&output.stderr).trim().to_string(),
        Err(e) => e.to_string(),
    };

    if non_fatal {
        tracing::warn!(method, error = %failure, "switch daemon call failed, continuing");
        Ok(())
    } else {
        Err(Error::Config(format!(
            "switch daemon {method} failed: {failure}"
        )))
    }
}

//! Wire protocol for the backend control pipe.
//!
//! Frames are newline-delimited JSON. The parent sends
//! `{"cmd": "<name>", "arguments": {...}, "token": N}` and the child
//! answers `{"rsp": {...}, "token": N}` with the same token. Tokens are
//! monotonically increasing per sender; responses for unknown tokens are
//! the receiver's to discard.

mod transport;

pub use transport::ControlPipe;

use capstan_core::{Error, RuntimeFlags, VmConfig};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerAction {
    Acpi,
    Reset,
    Off,
}

/// Commands accepted by the backend child, tagged exactly as they appear
/// on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", content = "arguments", rename_all = "snake_case")]
pub enum Command {
    StartVm {
        config: VmConfig,
        flags: RuntimeFlags,
    },
    StopVm,
    Power {
        action: PowerAction,
    },
    EjectCd,
    SaveSnapshot {
        name: String,
    },
    LoadSnapshot {
        name: String,
    },
    ExtractAssets {
        #[serde(default)]
        hdd_num: Option<u32>,
        #[serde(default)]
        pflash_vars: bool,
        name: String,
        dir: PathBuf,
        format: String,
    },
    StartAudiocapture {
        filename: PathBuf,
    },
    StopAudiocapture,
    CpuStat,
    IsShutdown,
    FreezeVm,
    ContVm,
    MouseHide {
        #[serde(default)]
        border_offset: u32,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::StartVm { .. } => "start_vm",
            Command::StopVm => "stop_vm",
            Command::Power { .. } => "power",
            Command::EjectCd => "eject_cd",
            Command::SaveSnapshot { .. } => "save_snapshot",
            Command::LoadSnapshot { .. } => "load_snapshot",
            Command::ExtractAssets { .. } => "extract_assets",
            Command::StartAudiocapture { .. } => "start_audiocapture",
            Command::StopAudiocapture => "stop_audiocapture",
            Command::CpuStat => "cpu_stat",
            Command::IsShutdown => "is_shutdown",
            Command::FreezeVm => "freeze_vm",
            Command::ContVm => "cont_vm",
            Command::MouseHide { .. } => "mouse_hide",
        }
    }
}

/// One request frame: a command plus the sender's token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandFrame {
    #[serde(flatten)]
    pub command: Command,
    pub token: u64,
}

/// Command outcome as serialized inside the `rsp` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Outcome {
    Ok { ok: Value },
    Err { error: String, message: String },
}

impl Outcome {
    pub fn ok(value: Value) -> Self {
        Outcome::Ok { ok: value }
    }

    pub fn error(error: &Error) -> Self {
        Outcome::Err {
            error: error.code().to_string(),
            message: error.to_string(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Outcome::Ok { .. })
    }

    pub fn into_result(self) -> Result<Value, (String, String)> {
        match self {
            Outcome::Ok { ok } => Ok(ok),
            Outcome::Err { error, message } => Err((error, message)),
        }
    }
}

impl<T: Into<Value>> From<capstan_core::Result<T>> for Outcome {
    fn from(result: capstan_core::Result<T>) -> Self {
        match result {
            Ok(value) => Outcome::ok(value.into()),
            Err(e) => Outcome::error(&e),
        }
    }
}

/// One response frame, echoing the request token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub rsp: Outcome,
    pub token: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use capstan_core::Arch;
    use serde_json::json;

    mod command_frame {
        use super::*;

        #[test]
        fn unit_command_wire_shape() {
            let frame = CommandFrame {
                command: Command::StopVm,
                token: 7,
            };
            let json = serde_json::to_value(&frame).unwrap();
            assert_eq!(json, json!({"cmd": "stop_vm", "token": 7}));
        }

        #[test]
        fn arguments_wire_shape() {
            let frame = CommandFrame {
                command: Command::SaveSnapshot { name: "s1".into() },
                token: 3,
            };
            let json = serde_json::to_value(&frame).unwrap();
            assert_eq!(
                json,
                json!({"cmd": "save_snapshot", "arguments": {"name": "s1"}, "token": 3})
            );
        }

        #[test]
        fn roundtrip_with_config() {
            let frame = CommandFrame {
                command: Command::StartVm {
                    config: VmConfig::new(Arch::X86_64, "/tmp/w1"),
                    flags: RuntimeFlags::default(),
                },
                token: 1,
            };
            let line = serde_json::to_string(&frame).unwrap();
            let back: CommandFrame = serde_json::from_str(&line).unwrap();
            assert_eq!(back, frame);
        }

        #[test]
        fn parses_wire_text() {
            let frame: CommandFrame = serde_json::from_str(
                r#"{"cmd":"power","arguments":{"action":"acpi"},"token":12}"#,
            )
            .unwrap();
            assert_eq!(
                frame.command,
                Command::Power {
                    action: PowerAction::Acpi
                }
            );
            assert_eq!(frame.token, 12);
        }

        #[test]
        fn extract_assets_defaults() {
            let frame: CommandFrame = serde_json::from_str(
                r#"{"cmd":"extract_assets","arguments":{"hdd_num":0,"name":"disk","dir":"/out","format":"qcow2"},"token":4}"#,
            )
            .unwrap();
            match frame.command {
                Command::ExtractAssets {
                    hdd_num,
                    pflash_vars,
                    ..
                } => {
                    assert_eq!(hdd_num, Some(0));
                    assert!(!pflash_vars);
                }
                other => panic!("unexpected command {other:?}"),
            }
        }
    }

    mod response_frame {
        use super::*;

        #[test]
        fn ok_wire_shape() {
            let frame = ResponseFrame {
                rsp: Outcome::ok(json!({"pid": 1234})),
                token: 7,
            };
            let json = serde_json::to_value(&frame).unwrap();
            assert_eq!(json, json!({"rsp": {"ok": {"pid": 1234}}, "token": 7}));
        }

        #[test]
        fn error_wire_shape() {
            let frame = ResponseFrame {
                rsp: Outcome::error(&Error::Unsupported("nvme".into())),
                token: 9,
            };
            let json = serde_json::to_value(&frame).unwrap();
            assert_eq!(
                json,
                json!({
                    "rsp": {"error": "unsupported", "message": "not supported: nvme"},
                    "token": 9
                })
            );
        }

        #[test]
        fn roundtrip_distinguishes_variants() {
            let ok = ResponseFrame {
                rsp: Outcome::ok(json!(true)),
                token: 1,
            };
            let line = serde_json::to_string(&ok).unwrap();
            let back: ResponseFrame = serde_json::from_str(&line).unwrap();
            assert!(back.rsp.is_ok());

            let err = ResponseFrame {
                rsp: Outcome::error(&Error::Disconnected),
                token: 2,
            };
            let line = serde_json::to_string(&err).unwrap();
            let back: ResponseFrame = serde_json::from_str(&line).unwrap();
            assert!(!back.rsp.is_ok());
            assert_eq!(
                back.rsp.into_result().unwrap_err().0,
                "disconnected".to_string()
            );
        }
    }

    mod command_names {
        use super::*;

        #[test]
        fn names_match_wire_tags() {
            let cases = [
                (Command::StopVm, "stop_vm"),
                (Command::EjectCd, "eject_cd"),
                (Command::CpuStat, "cpu_stat"),
                (Command::IsShutdown, "is_shutdown"),
                (Command::FreezeVm, "freeze_vm"),
                (Command::ContVm, "cont_vm"),
                (Command::StopAudiocapture, "stop_audiocapture"),
            ];
            for (command, name) in cases {
                assert_eq!(command.name(), name);
                let json = serde_json::to_value(&command).unwrap();
                assert_eq!(json, json!({"cmd": name}));
            }
        }
    }
}

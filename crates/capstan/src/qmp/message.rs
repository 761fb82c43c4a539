use capstan_core::{Error, Result};
use serde::Deserialize;
use serde_json::Value;

/// The server greeting sent on connect, before capability negotiation.
#[derive(Debug, Clone, Deserialize)]
pub struct Greeting {
    #[serde(rename = "QMP")]
    pub qmp: GreetingBody,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GreetingBody {
    #[serde(default)]
    pub version: Value,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl Greeting {
    /// (major, minor) from the greeting's version block, if present.
    pub fn qemu_version(&self) -> Option<(u32, u32)> {
        let qemu = self.qmp.version.get("qemu")?;
        Some((
            qemu.get("major")?.as_u64()? as u32,
            qemu.get("minor")?.as_u64()? as u32,
        ))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QmpErrorBody {
    pub class: String,
    pub desc: String,
}

/// A command response: `return` on success, `error` otherwise. QMP matches
/// responses to requests strictly by order, so this carries no id.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum QmpResponse {
    Return {
        #[serde(rename = "return")]
        ret: Value,
    },
    Error {
        error: QmpErrorBody,
    },
}

impl QmpResponse {
    pub fn is_error(&self) -> bool {
        matches!(self, QmpResponse::Error { .. })
    }

    /// Unwrap into the `return` payload, mapping an error response to
    /// [`Error::Qmp`].
    pub fn into_result(self) -> Result<Value> {
        match self {
            QmpResponse::Return { ret } => Ok(ret),
            QmpResponse::Error { error } => Err(Error::Qmp {
                class: error.class,
                desc: error.desc,
            }),
        }
    }
}

/// An asynchronous event, delivered at any point in the stream.
#[derive(Debug, Clone, Deserialize)]
pub struct QmpEvent {
    pub event: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub timestamp: Value,
}

/// Any line the monitor can send after the greeting.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum QmpMessage {
    Event(QmpEvent),
    Response(QmpResponse),
}

impl QmpMessage {
    pub fn parse(line: &str) -> Result<Self> {
        serde_json::from_str(line).map_err(|e| Error::Protocol(format!("{e}: {line}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greeting_version_extraction() {
        let greeting: Greeting = serde_json::from_str(
            r#"{"QMP": {"version": {"qemu": {"micro": 0, "minor": 2, "major": 8}}, "capabilities": ["oob"]}}"#,
        )
        .unwrap();
        assert_eq!(greeting.qemu_version(), Some((8, 2)));
        assert_eq!(greeting.qmp.capabilities, vec!["oob"]);
    }

    #[test]
    fn response_return_parses() {
        let msg = QmpMessage::parse(r#"{"return": {"status": "running", "running": true}}"#).unwrap();
        match msg {
            QmpMessage::Response(QmpResponse::Return { ret }) => {
                assert_eq!(ret["status"], "running");
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn response_error_parses() {
        let msg = QmpMessage::parse(
            r#"{"error": {"class": "GenericError", "desc": "Device 'cd0' not found"}}"#,
        )
        .unwrap();
        match msg {
            QmpMessage::Response(response) => {
                let err = response.into_result().unwrap_err();
                assert!(matches!(err, Error::Qmp { ref class, .. } if class == "GenericError"));
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn event_parses_before_response() {
        let msg = QmpMessage::parse(
            r#"{"event": "STOP", "timestamp": {"seconds": 1, "microseconds": 2}}"#,
        )
        .unwrap();
        assert!(matches!(msg, QmpMessage::Event(ref e) if e.event == "STOP"));
    }

    #[test]
    fn malformed_line_is_a_protocol_error() {
        assert!(matches!(
            QmpMessage::parse("not json"),
            Err(Error::Protocol(_))
        ));
    }
}

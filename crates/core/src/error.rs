#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to spawn qemu: {0}")]
    Spawn(String),

    #[error("qmp connection closed")]
    Disconnected,

    #[error("malformed qmp message: {0}")]
    Protocol(String),

    #[error("qemu error [{class}]: {desc}")]
    Qmp { class: String, desc: String },

    #[error("{0} exceeded its time budget")]
    Timeout(String),

    #[error("not supported: {0}")]
    Unsupported(String),

    #[error("vm is not running")]
    NotRunning,

    #[error("vm is already running")]
    AlreadyRunning,

    #[error("qemu still running after kill escalation")]
    StillRunning,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Short code carried in the `error` field of a response frame.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) => "config",
            Error::Spawn(_) => "spawn",
            Error::Disconnected => "disconnected",
            Error::Protocol(_) => "protocol",
            Error::Qmp { .. } => "qmp",
            Error::Timeout(_) => "timeout",
            Error::Unsupported(_) => "unsupported",
            Error::NotRunning => "not-running",
            Error::AlreadyRunning => "already-running",
            Error::StillRunning => "still-running",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
        }
    }

    pub fn qmp(class: impl Into<String>, desc: impl Into<String>) -> Self {
        Error::Qmp {
            class: class.into(),
            desc: desc.into(),
        }
    }

    pub fn timeout(what: impl Into<String>) -> Self {
        Error::Timeout(what.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

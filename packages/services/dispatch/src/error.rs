#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CmdError {
    /// Routing failed: `missing` is the first segment of `path` that did not resolve.
    #[error("no path {}: {missing} not found", .path.join("."))]
    NoPath { path: Vec<String>, missing: String },
    #[error("empty command")]
    ShortCommand,
    #[error("call timed out")]
    Timeout,
    #[error("channel closed")]
    ChannelClosed,
    #[error("{0} not ready")]
    NotReady(String),
    #[error("{0} stopped")]
    Stopped(String),
    #[error("cancelled")]
    Cancelled,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("failed: {0}")]
    Failed(String),
    /// An error kind the local registry does not know.
    #[error("remote {kind}: {text}")]
    Remote { kind: String, text: String },
}

pub const KIND_NO_PATH: &str = "NoPath";
pub const KIND_SHORT_COMMAND: &str = "ShortCommand";
pub const KIND_TIMEOUT: &str = "Timeout";
pub const KIND_CHANNEL_CLOSED: &str = "ChannelClosed";
pub const KIND_NOT_READY: &str = "NotReady";
pub const KIND_STOPPED: &str = "Stopped";
pub const KIND_CANCELLED: &str = "Cancelled";
pub const KIND_INVALID_ARGUMENT: &str = "InvalidArgument";
pub const KIND_FAILED: &str = "Failed";

impl CmdError {
    pub fn kind(&self) -> &str {
        match self {
            CmdError::NoPath { .. } => KIND_NO_PATH,
            CmdError::ShortCommand => KIND_SHORT_COMMAND,
            CmdError::Timeout => KIND_TIMEOUT,
            CmdError::ChannelClosed => KIND_CHANNEL_CLOSED,
            CmdError::NotReady(_) => KIND_NOT_READY,
            CmdError::Stopped(_) => KIND_STOPPED,
            CmdError::Cancelled => KIND_CANCELLED,
            CmdError::InvalidArgument(_) => KIND_INVALID_ARGUMENT,
            CmdError::Failed(_) => KIND_FAILED,
            CmdError::Remote { kind, .. } => kind,
        }
    }

    /// Text part of the wire form, without the kind.
    pub fn text(&self) -> String {
        match self {
            CmdError::NotReady(s) | CmdError::Stopped(s) | CmdError::InvalidArgument(s) | CmdError::Failed(s) => s.clone(),
            CmdError::Remote { text, .. } => text.clone(),
            other => other.to_string(),
        }
    }

    pub fn no_path(path: &[String], missing: &str) -> Self {
        CmdError::NoPath {
            path: path.to_vec(),
            missing: missing.to_string(),
        }
    }

    pub fn is_routing(&self) -> bool {
        matches!(self, CmdError::NoPath { .. } | CmdError::ShortCommand)
    }
}

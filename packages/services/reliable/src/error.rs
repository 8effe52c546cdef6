use satlink_codec::LinkError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReliableError {
    #[error("channel closed")]
    ChannelClosed,
    #[error("end of channel")]
    EndOfChannel,
    #[error("fatal: {0}")]
    Fatal(String),
    #[error("timeout")]
    Timeout,
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

impl From<ReliableError> for LinkError {
    fn from(e: ReliableError) -> Self {
        match e {
            ReliableError::ChannelClosed | ReliableError::EndOfChannel => LinkError::Closed,
            ReliableError::Fatal(reason) => LinkError::Fatal(reason),
            ReliableError::Timeout => LinkError::Io("timeout".to_string()),
            ReliableError::Protocol(reason) => LinkError::Codec(reason),
            ReliableError::InvalidConfig(reason) => LinkError::Fatal(reason),
        }
    }
}

use satlink_codec::LinkError;
use satlink_dispatch::CmdError;
use satlink_reliable::ReliableError;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MplexError {
    #[error("link: {0}")]
    Link(#[from] LinkError),
    #[error("reliable: {0}")]
    Reliable(#[from] ReliableError),
    #[error("command: {0}")]
    Cmd(#[from] CmdError),
    #[error("io: {0}")]
    Io(String),
    #[error("socket {0} is served by a live multiplexer")]
    SocketInUse(String),
    #[error("gave up after {0} failed attempts")]
    RetriesExhausted(u32),
    #[error("timeout waiting for {0}")]
    Timeout(String),
}

impl From<std::io::Error> for MplexError {
    fn from(e: std::io::Error) -> Self {
        MplexError::Io(e.to_string())
    }
}

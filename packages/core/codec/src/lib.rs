pub mod frame;
pub mod link;
pub mod msg;
pub mod value;

pub use frame::{crc16, encode_frame, FrameDecoder, FrameError, FrameEvent, DEFAULT_MAX_FRAME};
pub use link::{DirectChannel, LinkConnector, LinkError, MsgChannel, PacketLink, PacketReceiver, PacketSender};
pub use msg::{ErrorReply, Message, MsgError};
pub use value::Value;

mod connection;
mod connector;

pub use connection::{stream_link, StreamConfig, StreamReceiver, StreamSender, BUFFER_LEN};
pub use connector::{TcpConnector, UnixConnector};

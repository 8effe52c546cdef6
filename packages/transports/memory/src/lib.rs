mod connection;
mod connector;

pub use connection::{memory_pair, ImpairConfig, LinkBreaker, MemoryPair, MemoryReceiver, MemorySender};
pub use connector::{memory_connector, MemoryConnector, MemoryListener};

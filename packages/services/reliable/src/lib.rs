mod config;
mod error;
pub mod frame;
mod logic;
mod transport;

pub use config::{negotiate, ReliableConfig, MIN_TIMEOUT_MS, MIN_WINDOW};
pub use error::ReliableError;
pub use logic::{Phase, ReliableLogic, ReliableOutput};
pub use transport::{LinkState, ReliableTransport};

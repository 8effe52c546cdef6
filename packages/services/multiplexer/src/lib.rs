mod client;
mod config;
mod error;
pub mod json;
mod mplex;
mod server;
mod supervisor;
#[cfg(test)]
mod testing;
mod watchdog;

pub use client::MplexClient;
pub use config::{BackoffConfig, MplexConfig};
pub use error::MplexError;
pub use mplex::Multiplexer;
pub use server::{MplexServer, LOCAL_PREFIX};
pub use supervisor::{LinkSupervisor, UplinkState};

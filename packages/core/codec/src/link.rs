use async_std::sync::Mutex;

use crate::value::Value;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    #[error("link closed")]
    Closed,
    #[error("io error: {0}")]
    Io(String),
    #[error("codec error: {0}")]
    Codec(String),
    #[error("fatal: {0}")]
    Fatal(String),
}

/// Sending half of a packet-oriented link. Packets may be lost, never corrupted.
#[async_trait::async_trait]
pub trait PacketSender: Send {
    async fn send(&mut self, packet: Value) -> Result<(), LinkError>;
    async fn close(&mut self);
}

#[async_trait::async_trait]
pub trait PacketReceiver: Send {
    /// `Err(LinkError::Closed)` once the peer is gone.
    async fn recv(&mut self) -> Result<Value, LinkError>;
}

pub struct PacketLink {
    pub sender: Box<dyn PacketSender>,
    pub receiver: Box<dyn PacketReceiver>,
}

impl PacketLink {
    pub fn new(sender: Box<dyn PacketSender>, receiver: Box<dyn PacketReceiver>) -> Self {
        Self { sender, receiver }
    }
}

/// Produces a fresh link every time the owner (re)connects.
#[async_trait::async_trait]
pub trait LinkConnector: Send + Sync {
    async fn connect(&self) -> Result<PacketLink, LinkError>;
    /// Human readable target, for logs.
    fn describe(&self) -> String;
}

/// Message-level channel a command session runs over.
///
/// Implementations serialize concurrent `send`s. Only one task calls `recv`.
#[async_trait::async_trait]
pub trait MsgChannel: Send + Sync {
    async fn send(&self, msg: Value) -> Result<(), LinkError>;
    /// Hand `msg` over in order without waiting for delivery. Channels that
    /// cannot queue just send.
    async fn post(&self, msg: Value) -> Result<(), LinkError> {
        self.send(msg).await
    }
    async fn recv(&self) -> Result<Value, LinkError>;
    async fn close(&self);
}

/// Channel straight over a packet link, for links that are already reliable.
pub struct DirectChannel {
    sender: Mutex<Box<dyn PacketSender>>,
    receiver: Mutex<Box<dyn PacketReceiver>>,
}

impl DirectChannel {
    pub fn new(link: PacketLink) -> Self {
        Self {
            sender: Mutex::new(link.sender),
            receiver: Mutex::new(link.receiver),
        }
    }
}

#[async_trait::async_trait]
impl MsgChannel for DirectChannel {
    async fn send(&self, msg: Value) -> Result<(), LinkError> {
        self.sender.lock().await.send(msg).await
    }

    async fn recv(&self) -> Result<Value, LinkError> {
        self.receiver.lock().await.recv().await
    }

    async fn close(&self) {
        self.sender.lock().await.close().await;
    }
}

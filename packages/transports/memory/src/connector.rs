use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_std::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use satlink_codec::{LinkConnector, LinkError, PacketLink};

use crate::connection::{memory_pair, ImpairConfig, LinkBreaker};

/// Connector whose far ends show up on a [`MemoryListener`].
///
/// Clones share state, so a test can keep one to flip availability or cut
/// live links while the other drives reconnects.
#[derive(Clone)]
pub struct MemoryConnector {
    config: ImpairConfig,
    incoming: Sender<PacketLink>,
    available: Arc<AtomicBool>,
    breakers: Arc<Mutex<Vec<LinkBreaker>>>,
}

pub struct MemoryListener {
    incoming: Receiver<PacketLink>,
}

pub fn memory_connector(config: ImpairConfig) -> (MemoryConnector, MemoryListener) {
    let (tx, rx) = unbounded();
    let connector = MemoryConnector {
        config,
        incoming: tx,
        available: Arc::new(AtomicBool::new(true)),
        breakers: Default::default(),
    };
    (connector, MemoryListener { incoming: rx })
}

impl MemoryConnector {
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Break every link handed out so far.
    pub fn break_all(&self) {
        for breaker in self.breakers.lock().drain(..) {
            breaker.break_link();
        }
    }

    pub fn live_links(&self) -> usize {
        self.breakers.lock().iter().filter(|b| !b.is_broken()).count()
    }
}

#[async_trait::async_trait]
impl LinkConnector for MemoryConnector {
    async fn connect(&self) -> Result<PacketLink, LinkError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(LinkError::Io("memory peer unavailable".to_string()));
        }
        let mut config = self.config.clone();
        config.seed = config.seed.wrapping_add(self.breakers.lock().len() as u64 * 2);
        let pair = memory_pair(config);
        self.incoming.send(pair.b).await.map_err(|_| LinkError::Io("memory listener gone".to_string()))?;
        self.breakers.lock().push(pair.breaker);
        Ok(pair.a)
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

impl MemoryListener {
    pub async fn accept(&self) -> Result<PacketLink, LinkError> {
        self.incoming.recv().await.map_err(|_| LinkError::Closed)
    }
}

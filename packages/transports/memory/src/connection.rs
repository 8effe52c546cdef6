use async_std::channel::{bounded, Receiver, Sender};
use rand::{rngs::StdRng, Rng, SeedableRng};
use satlink_codec::{LinkError, PacketLink, PacketReceiver, PacketSender, Value};

/// Wire impairment applied by the sending side of a memory link.
#[derive(Debug, Clone)]
pub struct ImpairConfig {
    /// Probability of dropping a packet.
    pub loss: f64,
    /// Probability of delivering a packet twice.
    pub duplicate: f64,
    /// Probability of holding a packet back behind the next one.
    pub reorder: f64,
    /// Depth of each direction's queue; a full queue blocks the sender.
    pub qlen: usize,
    /// Depth of the b to a queue when it differs from `qlen`.
    pub qlen_back: Option<usize>,
    pub seed: u64,
}

impl Default for ImpairConfig {
    fn default() -> Self {
        Self {
            loss: 0.0,
            duplicate: 0.0,
            reorder: 0.0,
            qlen: 64,
            qlen_back: None,
            seed: 0,
        }
    }
}

impl ImpairConfig {
    pub fn with_qlen(mut self, qlen: usize) -> Self {
        self.qlen = qlen;
        self
    }

    pub fn with_qlens(mut self, a_to_b: usize, b_to_a: usize) -> Self {
        self.qlen = a_to_b;
        self.qlen_back = Some(b_to_a);
        self
    }
}

pub struct MemorySender {
    tx: Sender<Value>,
    config: ImpairConfig,
    rng: StdRng,
    held: Option<Value>,
}

impl MemorySender {
    async fn push(&mut self, packet: Value) -> Result<(), LinkError> {
        self.tx.send(packet).await.map_err(|_| LinkError::Closed)
    }
}

#[async_trait::async_trait]
impl PacketSender for MemorySender {
    async fn send(&mut self, packet: Value) -> Result<(), LinkError> {
        if self.tx.is_closed() {
            return Err(LinkError::Closed);
        }
        if self.config.loss > 0.0 && self.rng.gen_bool(self.config.loss) {
            log::trace!("[MemorySender] drop packet");
            return Ok(());
        }
        if self.held.is_none() && self.config.reorder > 0.0 && self.rng.gen_bool(self.config.reorder) {
            self.held = Some(packet);
            return Ok(());
        }
        let twice = self.config.duplicate > 0.0 && self.rng.gen_bool(self.config.duplicate);
        if twice {
            self.push(packet.clone()).await?;
        }
        self.push(packet).await?;
        if let Some(held) = self.held.take() {
            self.push(held).await?;
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.tx.close();
    }
}

impl Drop for MemorySender {
    fn drop(&mut self) {
        self.tx.close();
    }
}

pub struct MemoryReceiver {
    rx: Receiver<Value>,
}

#[async_trait::async_trait]
impl PacketReceiver for MemoryReceiver {
    async fn recv(&mut self) -> Result<Value, LinkError> {
        self.rx.recv().await.map_err(|_| LinkError::Closed)
    }
}

/// Cuts both directions of a memory link, as if the cable was pulled.
#[derive(Clone)]
pub struct LinkBreaker {
    a_to_b: Sender<Value>,
    b_to_a: Sender<Value>,
}

impl LinkBreaker {
    pub fn break_link(&self) {
        log::info!("[LinkBreaker] break memory link");
        self.a_to_b.close();
        self.b_to_a.close();
    }

    pub fn is_broken(&self) -> bool {
        self.a_to_b.is_closed()
    }
}

pub struct MemoryPair {
    pub a: PacketLink,
    pub b: PacketLink,
    pub breaker: LinkBreaker,
}

pub fn memory_pair(config: ImpairConfig) -> MemoryPair {
    let (a_tx, b_rx) = bounded(config.qlen.max(1));
    let (b_tx, a_rx) = bounded(config.qlen_back.unwrap_or(config.qlen).max(1));
    let breaker = LinkBreaker {
        a_to_b: a_tx.clone(),
        b_to_a: b_tx.clone(),
    };
    let a_sender = MemorySender {
        tx: a_tx,
        rng: StdRng::seed_from_u64(config.seed),
        config: config.clone(),
        held: None,
    };
    let b_sender = MemorySender {
        tx: b_tx,
        rng: StdRng::seed_from_u64(config.seed.wrapping_add(1)),
        config,
        held: None,
    };
    MemoryPair {
        a: PacketLink::new(Box::new(a_sender), Box::new(MemoryReceiver { rx: a_rx })),
        b: PacketLink::new(Box::new(b_sender), Box::new(MemoryReceiver { rx: b_rx })),
        breaker,
    }
}

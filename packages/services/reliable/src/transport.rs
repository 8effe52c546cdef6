use std::{sync::Arc, time::Duration};

use async_std::channel::{bounded, unbounded, Receiver, Sender};
use futures_util::{select, FutureExt};
use satlink_codec::{LinkError, MsgChannel, PacketLink, PacketReceiver, PacketSender, Value};
use satlink_utils::{error_handle::ErrorUtils, state::StateCell, SystemTimer, Timer};

use crate::{
    config::ReliableConfig,
    error::ReliableError,
    logic::{Phase, ReliableLogic, ReliableOutput},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Up,
    Resetting,
    Closed,
    Fatal(String),
}

impl LinkState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LinkState::Closed | LinkState::Fatal(_))
    }
}

type Done = Sender<Result<(), ReliableError>>;

enum Command {
    Send(Value, Done),
    Post(Value),
    Ephemeral(u32, Value),
    Frame(Value),
    ReadClosed(LinkError),
    Close(Option<String>),
}

/// Ordered, duplicate-free delivery over a lossy packet link.
///
/// A maintenance task owns the window state and the sending half of the
/// link. A reader task feeds it incoming frames. Every public method talks
/// to the maintenance task through a channel.
pub struct ReliableTransport {
    cmd_tx: Sender<Command>,
    deliver_rx: Receiver<Value>,
    state: Arc<StateCell<LinkState>>,
}

impl ReliableTransport {
    pub fn new(link: PacketLink, config: ReliableConfig) -> Result<Self, ReliableError> {
        Self::new_with_timer(link, config, Arc::new(SystemTimer()))
    }

    pub fn new_with_timer(link: PacketLink, config: ReliableConfig, timer: Arc<dyn Timer>) -> Result<Self, ReliableError> {
        config.validate()?;
        let (cmd_tx, cmd_rx) = unbounded();
        let (deliver_tx, deliver_rx) = unbounded();
        let state = Arc::new(StateCell::new(LinkState::Connecting));
        let logic = ReliableLogic::new(config, timer.now_ms());

        let reader = async_std::task::spawn(run_reader(link.receiver, cmd_tx.clone()));
        let task_state = state.clone();
        async_std::task::spawn(async move {
            run_maintenance(logic, link.sender, cmd_rx, deliver_tx, task_state, timer).await;
            reader.cancel().await;
        });

        Ok(Self { cmd_tx, deliver_rx, state })
    }

    pub fn state(&self) -> LinkState {
        self.state.get()
    }

    pub fn is_up(&self) -> bool {
        self.state.get() == LinkState::Up
    }

    /// Wait until the handshake completed, or the transport is gone for good.
    pub async fn wait_up(&self) -> Result<(), ReliableError> {
        match self.state.wait_for(|s| *s == LinkState::Up || s.is_terminal()).await {
            LinkState::Up => Ok(()),
            LinkState::Fatal(reason) => Err(ReliableError::Fatal(reason)),
            _ => Err(ReliableError::ChannelClosed),
        }
    }

    /// Resolves once the peer acknowledged `value`. Dropping the future only
    /// stops waiting, the message may still be delivered.
    pub async fn send(&self, value: Value) -> Result<(), ReliableError> {
        let (tx, rx) = bounded(1);
        self.cmd_tx.send(Command::Send(value, tx)).await.map_err(|_| ReliableError::ChannelClosed)?;
        rx.recv().await.map_err(|_| ReliableError::ChannelClosed)?
    }

    pub async fn send_timeout(&self, value: Value, timeout: Duration) -> Result<(), ReliableError> {
        async_std::future::timeout(timeout, self.send(value)).await.map_err(|_| ReliableError::Timeout)?
    }

    /// Queue `value` in order with the other sends without waiting for the ack.
    pub fn post(&self, value: Value) -> Result<(), ReliableError> {
        self.cmd_tx.try_send(Command::Post(value)).map_err(|_| ReliableError::ChannelClosed)
    }

    /// Queue a "latest value wins" message on `channel` without waiting for it.
    pub fn send_ephemeral(&self, channel: u32, value: Value) -> Result<(), ReliableError> {
        self.cmd_tx.try_send(Command::Ephemeral(channel, value)).map_err(|_| ReliableError::ChannelClosed)
    }

    pub async fn recv(&self) -> Result<Value, ReliableError> {
        match self.deliver_rx.recv().await {
            Ok(value) => Ok(value),
            Err(_) => match self.state.get() {
                LinkState::Fatal(reason) => Err(ReliableError::Fatal(reason)),
                _ => Err(ReliableError::EndOfChannel),
            },
        }
    }

    /// Tell the peer, fail every waiter and stop the tasks.
    pub async fn close(&self) {
        if self.cmd_tx.try_send(Command::Close(None)).is_err() {
            log::debug!("[ReliableTransport] already closed");
        }
        self.state.wait_for(LinkState::is_terminal).await;
    }
}

impl Drop for ReliableTransport {
    fn drop(&mut self) {
        self.cmd_tx.try_send(Command::Close(None)).ok();
    }
}

#[async_trait::async_trait]
impl MsgChannel for ReliableTransport {
    async fn send(&self, msg: Value) -> Result<(), LinkError> {
        ReliableTransport::send(self, msg).await.map_err(Into::into)
    }

    async fn post(&self, msg: Value) -> Result<(), LinkError> {
        ReliableTransport::post(self, msg).map_err(Into::into)
    }

    async fn recv(&self) -> Result<Value, LinkError> {
        ReliableTransport::recv(self).await.map_err(Into::into)
    }

    async fn close(&self) {
        ReliableTransport::close(self).await
    }
}

async fn run_reader(mut receiver: Box<dyn PacketReceiver>, cmd_tx: Sender<Command>) {
    loop {
        match receiver.recv().await {
            Ok(value) => {
                if cmd_tx.send(Command::Frame(value)).await.is_err() {
                    break;
                }
            }
            Err(LinkError::Codec(e)) => log::warn!("[ReliableTransport] drop undecodable packet: {}", e),
            Err(e) => {
                log::info!("[ReliableTransport] link read ended: {}", e);
                cmd_tx.send(Command::ReadClosed(e)).await.ok();
                break;
            }
        }
    }
}

async fn run_maintenance(
    mut logic: ReliableLogic<Done>,
    mut sender: Box<dyn PacketSender>,
    cmd_rx: Receiver<Command>,
    deliver_tx: Sender<Value>,
    state: Arc<StateCell<LinkState>>,
    timer: Arc<dyn Timer>,
) {
    log::info!("[ReliableTransport] start maintenance loop");
    loop {
        let mut link_err = None;
        while let Some(out) = logic.pop_output() {
            match out {
                ReliableOutput::Transmit(frame) => {
                    if link_err.is_none() {
                        if let Err(e) = sender.send(frame).await {
                            link_err = Some(e);
                        }
                    }
                }
                ReliableOutput::Deliver(value) => deliver_tx.try_send(value).print_error("[ReliableTransport] deliver"),
                ReliableOutput::Acked(done) => {
                    done.try_send(Ok(())).ok();
                }
                ReliableOutput::Failed(done) => {
                    done.try_send(Err(ReliableError::ChannelClosed)).ok();
                }
                ReliableOutput::Up => {
                    state.set(LinkState::Up);
                }
                ReliableOutput::Down => {
                    state.set(LinkState::Resetting);
                }
                ReliableOutput::Closed(_) => {
                    state.set(LinkState::Closed);
                }
                ReliableOutput::Fatal(reason) => {
                    state.set(LinkState::Fatal(reason));
                }
            }
        }
        if let Some(e) = link_err {
            log::warn!("[ReliableTransport] link write error {}", e);
            logic.on_link_error(timer.now_ms(), &e.to_string());
            continue;
        }
        if logic.phase() == Phase::Closed {
            break;
        }

        let wait_ms = logic.next_deadline().map(|d| d.saturating_sub(timer.now_ms()));
        let sleep = async move {
            match wait_ms {
                Some(ms) => async_std::task::sleep(Duration::from_millis(ms)).await,
                None => futures_util::future::pending::<()>().await,
            }
        };
        select! {
            cmd = cmd_rx.recv().fuse() => {
                let now = timer.now_ms();
                match cmd {
                    Ok(Command::Send(value, done)) => logic.push_msg(now, value, done),
                    Ok(Command::Post(value)) => logic.push_detached(now, value),
                    Ok(Command::Ephemeral(channel, value)) => logic.push_ephemeral(now, channel, value),
                    Ok(Command::Frame(frame)) => logic.on_frame(now, frame),
                    Ok(Command::ReadClosed(e)) => logic.close(Some(e.to_string())),
                    Ok(Command::Close(reason)) => logic.close(reason),
                    Err(_) => logic.close(None),
                }
            }
            _ = sleep.fuse() => logic.on_tick(timer.now_ms()),
        }
    }
    cmd_rx.close();
    while let Ok(cmd) = cmd_rx.try_recv() {
        if let Command::Send(_, done) = cmd {
            done.try_send(Err(ReliableError::ChannelClosed)).ok();
        }
    }
    sender.close().await;
    log::info!("[ReliableTransport] stop maintenance loop");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_std::prelude::FutureExt;
    use futures_util::future::join_all;
    use satlink_codec::Value;
    use satlink_transport_memory::{memory_pair, ImpairConfig};

    use super::{LinkState, ReliableTransport};
    use crate::{config::ReliableConfig, error::ReliableError};

    fn config() -> ReliableConfig {
        ReliableConfig {
            window: 8,
            timeout_ms: 50,
            retries: 5,
            ack_delay_ms: 5,
        }
    }

    fn pair(impair: ImpairConfig, config: ReliableConfig) -> (ReliableTransport, ReliableTransport, satlink_transport_memory::LinkBreaker) {
        let pair = memory_pair(impair);
        let a = ReliableTransport::new(pair.a, config.clone()).expect("should create");
        let b = ReliableTransport::new(pair.b, config).expect("should create");
        (a, b, pair.breaker)
    }

    #[async_std::test]
    async fn concurrent_sends_arrive_in_order() {
        let (a, b, _breaker) = pair(ImpairConfig::default(), config());
        a.wait_up().timeout(Duration::from_secs(2)).await.expect("should not timeout").expect("should be up");

        let sends = join_all((0..10).map(|i| a.send(Value::from(i))));
        let receives = async {
            let mut got = vec![];
            for _ in 0..10 {
                got.push(b.recv().await);
            }
            got
        };
        let (sent, got) = sends.join(receives).timeout(Duration::from_secs(5)).await.expect("should not timeout");
        assert!(sent.iter().all(|r| r.is_ok()));
        assert_eq!(got, (0..10).map(|i| Ok(Value::from(i))).collect::<Vec<_>>());
    }

    #[async_std::test]
    async fn lossy_link_still_delivers() {
        let impair = ImpairConfig {
            loss: 0.2,
            duplicate: 0.1,
            seed: 3,
            ..Default::default()
        };
        let (a, b, _breaker) = pair(impair, ReliableConfig { retries: 30, ..config() });
        for i in 0..20 {
            a.send_ephemeral(i, Value::from(i)).expect("should queue");
        }
        for i in 0..20 {
            assert_eq!(b.recv().timeout(Duration::from_secs(10)).await, Ok(Ok(Value::from(i))));
        }
    }

    #[async_std::test]
    async fn post_queues_without_waiting_for_acks() {
        let (a, b, _breaker) = pair(ImpairConfig::default(), config());
        // nothing can be acked before the handshake, posts still return at once
        for i in 0..20 {
            a.post(Value::from(i)).expect("should queue");
        }
        a.send(Value::from(20)).timeout(Duration::from_secs(5)).await.expect("should not timeout").expect("should send");
        for i in 0..21 {
            assert_eq!(b.recv().timeout(Duration::from_secs(5)).await, Ok(Ok(Value::from(i))));
        }
    }

    #[async_std::test]
    async fn close_ends_peer() {
        let (a, b, _breaker) = pair(ImpairConfig::default(), config());
        a.wait_up().await.expect("should be up");
        a.send(Value::from("last")).await.expect("should send");
        a.close().await;
        assert_eq!(a.state(), LinkState::Closed);
        assert_eq!(b.recv().await, Ok(Value::from("last")));
        assert_eq!(b.recv().timeout(Duration::from_secs(2)).await, Ok(Err(ReliableError::EndOfChannel)));
        assert_eq!(a.send(Value::Nil).await, Err(ReliableError::ChannelClosed));
        assert_eq!(b.wait_up().await, Err(ReliableError::ChannelClosed));
    }

    #[async_std::test]
    async fn broken_link_fails_pending_send() {
        let (a, b, breaker) = pair(ImpairConfig::default(), config());
        a.wait_up().await.expect("should be up");
        b.wait_up().await.expect("should be up");
        breaker.break_link();
        let res = a.send(Value::from(1)).timeout(Duration::from_secs(2)).await.expect("should not timeout");
        assert_eq!(res, Err(ReliableError::ChannelClosed));
        assert!(a.state().is_terminal());
    }

    #[async_std::test]
    async fn silent_peer_is_fatal() {
        let pair = memory_pair(ImpairConfig { loss: 1.0, ..Default::default() });
        let a = ReliableTransport::new(
            pair.a,
            ReliableConfig {
                timeout_ms: 10,
                retries: 2,
                ..config()
            },
        )
        .expect("should create");
        let res = a.wait_up().timeout(Duration::from_secs(2)).await.expect("should not timeout");
        assert!(matches!(res, Err(ReliableError::Fatal(_))));
        assert!(matches!(a.recv().await, Err(ReliableError::Fatal(_))));
    }

    #[async_std::test]
    async fn send_timeout_reports_timeout() {
        let pair = memory_pair(ImpairConfig { loss: 1.0, ..Default::default() });
        let a = ReliableTransport::new(pair.a, config()).expect("should create");
        assert_eq!(a.send_timeout(Value::Nil, Duration::from_millis(20)).await, Err(ReliableError::Timeout));
    }

    #[test]
    fn rejects_bad_config() {
        let pair = memory_pair(ImpairConfig::default());
        let res = ReliableTransport::new(pair.a, ReliableConfig { window: 2, ..config() });
        assert!(matches!(res, Err(ReliableError::InvalidConfig(_))));
    }
}

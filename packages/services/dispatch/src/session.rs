use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_std::{
    channel::{bounded, unbounded, Receiver, Sender},
    task::{self, JoinHandle},
};
use futures_util::StreamExt;
use parking_lot::Mutex;
use satlink_codec::{LinkError, Message, MsgChannel, Value};
use satlink_utils::{error_handle::ErrorUtils, state::StateCell};
use serde::Deserialize;

use crate::{
    iter::{Pacer, RemoteIter},
    node::{CallCtx, Node, Reply, ValueStream},
    registry::ErrorRegistry,
    request::{IterEvent, Pending, PendingCalls, Role},
    CmdError,
};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Used in log lines.
    pub name: String,
    /// Cap for `call` and for the first reply of `subscribe`.
    pub call_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            name: "session".to_string(),
            call_timeout_ms: 10_000,
        }
    }
}

impl SessionConfig {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }
}

struct Served {
    id: Option<u32>,
    handle: JoinHandle<()>,
}

struct Request {
    action: Vec<String>,
    id: Option<u32>,
    data: Value,
    repeat: Option<u32>,
    quiet: bool,
}

/// Session state shared with its tasks and with open iterators.
pub(crate) struct Shared {
    name: String,
    role: Role,
    channel: Arc<dyn MsgChannel>,
    root: Arc<dyn Node>,
    errors: Arc<ErrorRegistry>,
    pending: Mutex<PendingCalls>,
    serving: Mutex<HashMap<u64, Served>>,
    serve_seq: AtomicU64,
    out_tx: Sender<Value>,
    closed: StateCell<bool>,
}

impl Shared {
    /// Drop the pending record of a finished subscription.
    pub(crate) fn forget(&self, id: u32) {
        self.pending.lock().remove(id);
    }

    /// Drop the pending record and tell the peer to stop.
    pub(crate) fn cancel_remote(&self, id: u32) {
        if self.pending.lock().remove(id).is_some() {
            self.enqueue(Message::end(id));
        }
    }

    fn enqueue(&self, msg: Message) {
        if !self.closed.get() {
            self.out_tx.try_send(msg.to_value()).print_error("Should queue outgoing message");
        }
    }

    async fn send(&self, msg: Message) {
        if let Err(e) = self.channel.send(msg.to_value()).await {
            log::debug!("[CmdSession {}] send failed: {}", self.name, e);
        }
    }

    fn on_message(self: &Arc<Self>, msg: Message) {
        if msg.is_request() {
            self.serve(msg);
            return;
        }
        let id = match msg.id {
            Some(id) => id,
            None => {
                log::debug!("[CmdSession {}] drop message without id", self.name);
                return;
            }
        };
        if self.role.owns(id) {
            self.on_reply(id, msg);
        } else if msg.is_end() {
            self.cancel_served(id);
        } else {
            log::debug!("[CmdSession {}] drop stray message for {}", self.name, id);
        }
    }

    fn on_reply(&self, id: u32, msg: Message) {
        let pending = self.pending.lock();
        match pending.get(id) {
            Some(Pending::Call(tx)) => {
                let res = match &msg.error {
                    Some(err) => Err(self.errors.decode(err)),
                    None => Ok(msg.data.unwrap_or_default()),
                };
                if tx.try_send(res).is_err() {
                    log::debug!("[CmdSession {}] duplicate reply for {}", self.name, id);
                }
            }
            Some(Pending::Iter(tx)) => {
                let event = if let Some(err) = &msg.error {
                    IterEvent::Error(self.errors.decode(err))
                } else if let Some(seq) = msg.seq {
                    IterEvent::Item(seq, msg.data.unwrap_or_default())
                } else if let Some(cadence_ms) = msg.repeat {
                    IterEvent::Started(cadence_ms)
                } else if msg.is_end() {
                    IterEvent::End
                } else {
                    IterEvent::Single(msg.data.unwrap_or_default())
                };
                tx.try_send(event).ok();
            }
            None => log::debug!("[CmdSession {}] reply for unknown call {}", self.name, id),
        }
    }

    fn serve(self: &Arc<Self>, msg: Message) {
        let req = Request {
            action: msg.action.unwrap_or_default(),
            id: msg.id,
            data: msg.data.unwrap_or_default(),
            repeat: msg.repeat,
            quiet: msg.quiet,
        };
        let seq = self.serve_seq.fetch_add(1, Ordering::Relaxed);
        let mut serving = self.serving.lock();
        let prev = req.id.and_then(|id| take_served(&mut serving, id));
        if prev.is_some() {
            log::warn!("[CmdSession {}] request id {:?} reused, cancelling the previous call", self.name, req.id);
        }
        let id = req.id;
        let handle = task::spawn(run_request(self.clone(), prev, req, seq));
        serving.insert(seq, Served { id, handle });
    }

    fn cancel_served(&self, id: u32) {
        let served = take_served(&mut self.serving.lock(), id);
        if let Some(handle) = served {
            log::debug!("[CmdSession {}] peer cancelled {}", self.name, id);
            task::spawn(handle.cancel());
        }
    }

    async fn stream_out(&self, id: u32, cadence_ms: u32, mut items: ValueStream) {
        self.send(Message::end(id).with_repeat(cadence_ms)).await;
        let mut pacer = Pacer::new(cadence_ms);
        let mut seq = 0u32;
        loop {
            pacer.tick().await;
            match items.next().await {
                Some(Ok(value)) => {
                    if let Err(e) = self.channel.send(Message::stream_item(id, seq, value).to_value()).await {
                        log::debug!("[CmdSession {}] stream {} stopped: {}", self.name, id, e);
                        return;
                    }
                    seq = seq.wrapping_add(1);
                }
                Some(Err(err)) => {
                    self.send(Message::error_reply(id, self.errors.encode(&err))).await;
                    return;
                }
                None => {
                    self.send(Message::end(id)).await;
                    return;
                }
            }
        }
    }

    /// Fail every pending call and stop every served request.
    async fn shutdown(&self) {
        if !self.closed.set(true) {
            return;
        }
        self.pending.lock().fail_all(CmdError::ChannelClosed);
        let served: Vec<_> = self.serving.lock().drain().map(|(_, s)| s.handle).collect();
        for handle in served {
            handle.cancel().await;
        }
        log::info!("[CmdSession {}] closed", self.name);
    }
}

fn take_served(serving: &mut HashMap<u64, Served>, id: u32) -> Option<JoinHandle<()>> {
    let seq = serving.iter().find(|(_, s)| s.id == Some(id)).map(|(seq, _)| *seq)?;
    serving.remove(&seq).map(|s| s.handle)
}

async fn run_request(shared: Arc<Shared>, prev: Option<JoinHandle<()>>, req: Request, seq: u64) {
    if let Some(prev) = prev {
        prev.cancel().await;
    }
    let ctx = CallCtx::default().with_repeat(req.repeat);
    let res = shared.root.dispatch(ctx, &req.action, req.data).await;
    if let Err(err) = &res {
        if !req.quiet {
            log::warn!("[CmdSession {}] {} failed: {}", shared.name, req.action.join("."), err);
        }
    }
    match (req.id, res) {
        (None, _) => {}
        (Some(id), Ok(Reply::Value(value))) => shared.send(Message::reply(id, value)).await,
        (Some(id), Ok(Reply::Stream { cadence_ms, items })) => shared.stream_out(id, cadence_ms, items).await,
        (Some(id), Err(err)) => shared.send(Message::error_reply(id, shared.errors.encode(&err))).await,
    }
    shared.serving.lock().remove(&seq);
}

async fn run_reader(shared: Arc<Shared>) {
    loop {
        let value = match shared.channel.recv().await {
            Ok(value) => value,
            Err(LinkError::Codec(e)) => {
                log::warn!("[CmdSession {}] drop undecodable packet: {}", shared.name, e);
                continue;
            }
            Err(e) => {
                log::info!("[CmdSession {}] channel ended: {}", shared.name, e);
                break;
            }
        };
        match Message::from_value(value) {
            Ok(msg) => shared.on_message(msg),
            Err(e) => log::warn!("[CmdSession {}] drop undecodable message: {}", shared.name, e),
        }
    }
    shared.shutdown().await;
}

async fn run_writer(name: String, channel: Arc<dyn MsgChannel>, out_rx: Receiver<Value>) {
    while let Ok(value) = out_rx.recv().await {
        if let Err(e) = channel.post(value).await {
            log::debug!("[CmdSession {}] queued send failed: {}", name, e);
        }
    }
}

/// Removes a call's pending record however the call ends.
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: u32,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.pending.lock().remove(self.id);
    }
}

/// One command tree served over one message channel, plus the calls this
/// side makes to the peer.
pub struct CmdSession {
    shared: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    call_timeout: Duration,
}

impl CmdSession {
    pub fn new(role: Role, channel: Arc<dyn MsgChannel>, root: Arc<dyn Node>, errors: Arc<ErrorRegistry>, config: SessionConfig) -> Self {
        let (out_tx, out_rx) = unbounded();
        let shared = Arc::new(Shared {
            name: format!("{} {}", config.name, role.as_str()),
            role,
            channel: channel.clone(),
            root,
            errors,
            pending: Mutex::new(PendingCalls::new(role)),
            serving: Mutex::new(HashMap::new()),
            serve_seq: AtomicU64::new(0),
            out_tx,
            closed: StateCell::new(false),
        });
        let reader = task::spawn(run_reader(shared.clone()));
        let writer = task::spawn(run_writer(shared.name.clone(), channel, out_rx));
        log::info!("[CmdSession {}] started", shared.name);
        Self {
            shared,
            tasks: Mutex::new(vec![reader, writer]),
            call_timeout: Duration::from_millis(config.call_timeout_ms),
        }
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    pub fn root(&self) -> Arc<dyn Node> {
        self.shared.root.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.get()
    }

    pub async fn wait_closed(&self) {
        self.shared.closed.wait_for(|closed| *closed).await;
    }

    /// Number of calls and subscriptions waiting on the peer.
    pub fn pending_calls(&self) -> usize {
        self.shared.pending.lock().len()
    }

    /// Number of peer requests being served.
    pub fn serving(&self) -> usize {
        self.shared.serving.lock().len()
    }

    pub async fn call<S: AsRef<str>>(&self, action: &[S], data: Value) -> Result<Value, CmdError> {
        self.exchange(Message::request(action, data), self.call_timeout).await
    }

    pub async fn call_timeout<S: AsRef<str>>(&self, action: &[S], data: Value, timeout: Duration) -> Result<Value, CmdError> {
        self.exchange(Message::request(action, data), timeout).await
    }

    /// Like [`CmdSession::call`], but the peer does not log a failure.
    pub async fn call_quiet<S: AsRef<str>>(&self, action: &[S], data: Value, timeout: Duration) -> Result<Value, CmdError> {
        self.exchange(Message::request(action, data).with_quiet(), timeout).await
    }

    async fn exchange(&self, msg: Message, timeout: Duration) -> Result<Value, CmdError> {
        let (tx, rx) = bounded(1);
        let id = self.shared.pending.lock().alloc(Pending::Call(tx))?;
        let _guard = PendingGuard { shared: &self.shared, id };
        let msg = msg.with_id(id);
        let exchange = async {
            if let Err(e) = self.shared.channel.send(msg.to_value()).await {
                log::debug!("[CmdSession {}] call {} not sent: {}", self.shared.name, id, e);
                return Err(CmdError::ChannelClosed);
            }
            rx.recv().await.unwrap_or(Err(CmdError::ChannelClosed))
        };
        match async_std::future::timeout(timeout, exchange).await {
            Ok(res) => res,
            Err(_) => {
                log::info!("[CmdSession {}] call {} timeout", self.shared.name, id);
                self.shared.cancel_remote(id);
                Err(CmdError::Timeout)
            }
        }
    }

    /// Fire-and-forget. Never waits for the peer and leaves no pending record.
    pub fn notify<S: AsRef<str>>(&self, action: &[S], data: Value) -> Result<(), CmdError> {
        if self.shared.closed.get() {
            return Err(CmdError::ChannelClosed);
        }
        self.shared.out_tx.try_send(Message::request(action, data).to_value()).map_err(|_| CmdError::ChannelClosed)
    }

    /// Ask the peer to stream `action` every `cadence_ms`.
    pub async fn subscribe<S: AsRef<str>>(&self, action: &[S], data: Value, cadence_ms: u32) -> Result<RemoteIter, CmdError> {
        let (tx, rx) = unbounded();
        let id = self.shared.pending.lock().alloc(Pending::Iter(tx))?;
        let mut iter = RemoteIter::new(id, cadence_ms, rx, self.shared.clone());
        let msg = Message::request(action, data).with_id(id).with_repeat(cadence_ms);
        if let Err(e) = self.shared.channel.send(msg.to_value()).await {
            log::debug!("[CmdSession {}] subscribe {} not sent: {}", self.shared.name, id, e);
            return Err(CmdError::ChannelClosed);
        }
        iter.await_start(self.call_timeout).await?;
        Ok(iter)
    }

    /// Fail pending calls, stop served requests and close the channel.
    pub async fn close(&self) {
        self.shared.shutdown().await;
        self.shared.channel.close().await;
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            task.cancel().await;
        }
    }
}

impl Drop for CmdSession {
    fn drop(&mut self) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        if tasks.is_empty() {
            return;
        }
        let shared = self.shared.clone();
        task::spawn(async move {
            shared.shutdown().await;
            shared.channel.close().await;
            for task in tasks {
                task.cancel().await;
            }
        });
    }
}

use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use async_std::{
    channel::{bounded, unbounded, Receiver, Sender},
    task::{self, JoinHandle},
};
use futures_util::{select, FutureExt};
use parking_lot::{Mutex, RwLock};
use satlink_codec::{LinkConnector, Value};
use satlink_dispatch::{AppRegistry, CmdError, CmdSession, DirNode, ErrorRegistry, ForwardNode, Node, Role, SessionConfig, VerbTable};
use satlink_reliable::ReliableTransport;
use satlink_utils::state::StateCell;

use crate::{
    config::{merge_config, MplexConfig},
    error::MplexError,
    watchdog::run_watchdog,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UplinkState {
    Disconnected,
    Connecting,
    Configuring,
    Running,
    /// Terminal: `max_retries` consecutive failures.
    RetriesExhausted,
    /// Terminal: stopped by the owner.
    Stopped,
}

impl UplinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            UplinkState::Disconnected => "disconnected",
            UplinkState::Connecting => "connecting",
            UplinkState::Configuring => "configuring",
            UplinkState::Running => "running",
            UplinkState::RetriesExhausted => "retries_exhausted",
            UplinkState::Stopped => "stopped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, UplinkState::RetriesExhausted | UplinkState::Stopped)
    }
}

/// Verbs of the multiplexer's own directory.
struct Control {
    supervisor: Weak<LinkSupervisor>,
}

impl Control {
    fn supervisor(&self) -> Result<Arc<LinkSupervisor>, CmdError> {
        self.supervisor.upgrade().ok_or_else(|| CmdError::Stopped("mplex".to_string()))
    }
}

fn control_verbs() -> VerbTable<Control> {
    VerbTable::new()
        .call("state", |me: Arc<Control>, _| async move { Ok(me.supervisor()?.describe()) })
        .call("cfg", |me: Arc<Control>, _| async move { Ok(me.supervisor()?.effective_config()) })
        .call("reconnect", |me: Arc<Control>, _| async move {
            me.supervisor()?.reconnect();
            Ok(Value::Bool(true))
        })
}

/// Keeps the uplink to the satellite alive.
///
/// A single task connects, runs the reliable handshake, opens the uplink
/// command session, configures local apps and then watches the session.
/// When it dies everything is torn down and the task retries after a
/// backoff. Requests reach the satellite through [`LinkSupervisor::upstream`],
/// which fails `ChannelClosed` while the link is down.
pub struct LinkSupervisor {
    config: MplexConfig,
    connector: Arc<dyn LinkConnector>,
    errors: Arc<ErrorRegistry>,
    apps: Arc<AppRegistry>,
    local: Arc<DirNode>,
    upstream: Arc<ForwardNode>,
    state: StateCell<UplinkState>,
    session: RwLock<Option<Arc<CmdSession>>>,
    effective_config: RwLock<Value>,
    last_error: RwLock<Option<String>>,
    listeners: Mutex<Vec<Sender<bool>>>,
    reconnect_tx: Sender<()>,
    reconnect_rx: Receiver<()>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LinkSupervisor {
    pub fn new(config: MplexConfig, connector: Arc<dyn LinkConnector>, errors: Arc<ErrorRegistry>, apps: Arc<AppRegistry>) -> Arc<Self> {
        let (reconnect_tx, reconnect_rx) = bounded(1);
        Arc::new_cyclic(|me| {
            let control = Arc::new(Control { supervisor: me.clone() });
            Self {
                config,
                connector,
                errors,
                apps,
                local: DirNode::with_verbs("mplex", Value::Nil, control_verbs().bind(control)),
                upstream: Arc::new(ForwardNode::new("upstream", vec![])),
                state: StateCell::new(UplinkState::Disconnected),
                session: RwLock::new(None),
                effective_config: RwLock::new(Value::Nil),
                last_error: RwLock::new(None),
                listeners: Mutex::new(vec![]),
                reconnect_tx,
                reconnect_rx,
                task: Mutex::new(None),
            }
        })
    }

    /// Start the local directory and the connect loop.
    pub async fn start(self: &Arc<Self>) -> Result<(), MplexError> {
        self.local.start().await?;
        self.upstream.start().await?;
        let mut task = self.task.lock();
        if task.is_none() {
            *task = Some(task::spawn(run(self.clone())));
        }
        Ok(())
    }

    pub async fn stop(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.cancel().await;
        }
        if self.session.read().is_some() {
            self.teardown("stopped").await;
        }
        self.local.stop().await;
        self.upstream.stop().await;
        self.state.set(UplinkState::Stopped);
        log::info!("[LinkSupervisor] stopped");
    }

    pub fn state(&self) -> UplinkState {
        self.state.get()
    }

    /// Wait for `target`. Fails early if the supervisor ends in another terminal state.
    pub async fn wait_state(&self, target: UplinkState, timeout: Duration) -> Result<(), MplexError> {
        let wait = self.state.wait_for(|s| *s == target || s.is_terminal());
        match async_std::future::timeout(timeout, wait).await {
            Ok(state) if state == target => Ok(()),
            Ok(UplinkState::RetriesExhausted) => Err(self.exhausted()),
            Ok(_) => Err(MplexError::Cmd(CmdError::Stopped("mplex".to_string()))),
            Err(_) => Err(MplexError::Timeout(target.as_str().to_string())),
        }
    }

    /// Wait until the connect loop has ended for good. Fails
    /// `RetriesExhausted` when it gave up, succeeds when it was stopped.
    pub async fn wait_end(&self) -> Result<(), MplexError> {
        match self.state.wait_for(UplinkState::is_terminal).await {
            UplinkState::RetriesExhausted => Err(self.exhausted()),
            _ => Ok(()),
        }
    }

    fn exhausted(&self) -> MplexError {
        MplexError::RetriesExhausted(self.config.backoff.max_retries.unwrap_or_default())
    }

    /// The multiplexer's own directory: control verbs plus configured apps.
    pub fn local(&self) -> Arc<DirNode> {
        self.local.clone()
    }

    /// Forwards to the satellite's root while the link runs.
    pub fn upstream(&self) -> Arc<ForwardNode> {
        self.upstream.clone()
    }

    pub fn session(&self) -> Option<Arc<CmdSession>> {
        self.session.read().clone()
    }

    /// Config the apps were built from: fetched satellite config overlaid with the local one.
    pub fn effective_config(&self) -> Value {
        self.effective_config.read().clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    pub fn describe(&self) -> Value {
        Value::map([
            ("s", Value::from(self.state().as_str())),
            ("e", Value::from(self.last_error())),
            ("r", Value::from(self.connector.describe())),
        ])
    }

    /// Every link up/down transition, in order, from now on.
    pub fn subscribe_link(&self) -> Receiver<bool> {
        let (tx, rx) = unbounded();
        self.listeners.lock().push(tx);
        rx
    }

    /// Drop the current link and connect again. Requests made while one is
    /// still pending are merged into it.
    pub fn reconnect(&self) {
        if self.reconnect_tx.try_send(()).is_err() {
            log::debug!("[LinkSupervisor] reconnect already requested");
        }
    }

    fn broadcast(&self, up: bool) {
        self.listeners.lock().retain(|tx| tx.try_send(up).is_ok());
    }

    async fn establish(&self) -> Result<Arc<CmdSession>, MplexError> {
        let link = self.connector.connect().await?;
        let transport = Arc::new(ReliableTransport::new(link, self.config.reliable.clone())?);
        let handshake = async_std::future::timeout(Duration::from_millis(self.config.connect_timeout_ms), transport.wait_up()).await;
        match handshake {
            Ok(res) => res?,
            Err(_) => {
                transport.close().await;
                return Err(MplexError::Timeout("link handshake".to_string()));
            }
        }
        log::info!("[LinkSupervisor] link to {} up", self.connector.describe());

        self.state.set(UplinkState::Configuring);
        let session_cfg = SessionConfig {
            name: "uplink".to_string(),
            call_timeout_ms: self.config.call_timeout_ms,
        };
        let session = Arc::new(CmdSession::new(Role::Host, transport, self.local.clone(), self.errors.clone(), session_cfg));
        if let Err(e) = self.configure(&session).await {
            session.close().await;
            return Err(e);
        }
        Ok(session)
    }

    async fn configure(&self, session: &CmdSession) -> Result<(), MplexError> {
        let remote = if self.config.fetch_config {
            session.call(&["sys", "cfg"], Value::Nil).await?
        } else {
            Value::Nil
        };
        let cfg = merge_config(remote, &self.config.apps);
        *self.effective_config.write() = cfg.clone();
        self.local.configure(cfg, self.apps.clone()).await?;
        Ok(())
    }

    fn go_running(&self, session: Arc<CmdSession>) {
        self.upstream.set_remote(Some(session.clone()));
        *self.session.write() = Some(session);
        *self.last_error.write() = None;
        self.state.set(UplinkState::Running);
        self.broadcast(true);
        log::info!("[LinkSupervisor] running");
    }

    async fn teardown(&self, reason: &str) {
        log::warn!("[LinkSupervisor] link down: {}", reason);
        self.upstream.set_remote(None);
        if let Err(e) = self.local.configure(Value::Nil, self.apps.clone()).await {
            log::warn!("[LinkSupervisor] app teardown failed: {}", e);
        }
        let session = self.session.write().take();
        if let Some(session) = session {
            session.close().await;
        }
        *self.last_error.write() = Some(reason.to_string());
        self.state.set(UplinkState::Disconnected);
        self.broadcast(false);
    }
}

async fn run(supervisor: Arc<LinkSupervisor>) {
    let mut backoff = supervisor.config.backoff.build();
    loop {
        // a pending reconnect request is satisfied by this attempt
        while supervisor.reconnect_rx.try_recv().is_ok() {}
        supervisor.state.set(UplinkState::Connecting);
        log::info!("[LinkSupervisor] connecting to {}", supervisor.connector.describe());

        match supervisor.establish().await {
            Ok(session) => {
                backoff.reset();
                let watchdog = match supervisor.config.watchdog_ms {
                    0 => None,
                    interval_ms => Some(task::spawn(run_watchdog(
                        session.clone(),
                        Duration::from_millis(interval_ms),
                        Duration::from_millis(supervisor.config.watchdog_timeout_ms),
                        supervisor.reconnect_tx.clone(),
                    ))),
                };
                supervisor.go_running(session.clone());
                let requested = select! {
                    _ = session.wait_closed().fuse() => false,
                    _ = supervisor.reconnect_rx.recv().fuse() => true,
                };
                if let Some(watchdog) = watchdog {
                    watchdog.cancel().await;
                }
                supervisor.teardown(if requested { "reconnect requested" } else { "link lost" }).await;
                if requested {
                    continue;
                }
            }
            Err(e) => {
                log::warn!("[LinkSupervisor] connect to {} failed: {}", supervisor.connector.describe(), e);
                *supervisor.last_error.write() = Some(e.to_string());
                supervisor.state.set(UplinkState::Disconnected);
            }
        }

        let delay = backoff.next_delay();
        if let Some(max) = supervisor.config.backoff.max_retries {
            if backoff.attempts() > max {
                log::error!("[LinkSupervisor] giving up after {} failed attempts", backoff.attempts());
                supervisor.state.set(UplinkState::RetriesExhausted);
                return;
            }
        }
        log::info!("[LinkSupervisor] backoff {} ms", delay.as_millis());
        select! {
            _ = task::sleep(delay).fuse() => {}
            _ = supervisor.reconnect_rx.recv().fuse() => log::info!("[LinkSupervisor] reconnect requested, skip backoff"),
        }
    }
}

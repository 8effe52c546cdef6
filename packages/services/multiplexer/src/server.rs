use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
};

use async_std::{
    os::unix::net::{UnixListener, UnixStream},
    task::{self, JoinHandle},
};
use parking_lot::Mutex;
use satlink_codec::{DirectChannel, PacketLink, Value};
use satlink_dispatch::{dir_value, BoundVerbs, CallCtx, CmdError, CmdSession, DirNode, ErrorRegistry, ForwardNode, Node, NodeState, Reply, Role, SessionConfig};
use satlink_transport_stream::{stream_link, StreamConfig};
use satlink_utils::error_handle::ErrorUtils;

use crate::{
    error::MplexError,
    supervisor::{LinkSupervisor, UplinkState},
};

/// First path segment that stays inside the multiplexer.
pub const LOCAL_PREFIX: &str = "mplex";

/// Root node of every client session.
struct ClientRoot {
    local: Arc<DirNode>,
    upstream: Arc<ForwardNode>,
}

#[async_trait::async_trait]
impl Node for ClientRoot {
    fn name(&self) -> String {
        String::new()
    }

    fn path(&self) -> Vec<String> {
        vec![]
    }

    fn state(&self) -> NodeState {
        NodeState::Ready
    }

    async fn wait_ready(&self) -> Result<(), CmdError> {
        Ok(())
    }

    async fn dispatch(&self, ctx: CallCtx, action: &[String], args: Value) -> Result<Reply, CmdError> {
        match action.split_first() {
            None => Err(CmdError::ShortCommand),
            Some((head, rest)) if head == LOCAL_PREFIX => self.local.dispatch(ctx.enter(head), rest, args).await,
            Some(_) => self.upstream.dispatch(ctx, action, args).await,
        }
    }

    fn dir(&self) -> Value {
        dir_value(&BoundVerbs::default(), vec![LOCAL_PREFIX.to_string()])
    }

    async fn start(&self) -> Result<(), CmdError> {
        Ok(())
    }

    async fn stop(&self) {}

    async fn reload(&self, _cfg: Value) -> Result<(), CmdError> {
        Ok(())
    }

    fn attached(&self, _parent: Weak<dyn Node>, _name: &str) {}
}

type Clients = Arc<Mutex<HashMap<u64, Arc<CmdSession>>>>;

/// Accepts local clients and gives each its own command session.
///
/// Sessions share nothing but the uplink: ids, pending calls and served
/// requests are per client. Link changes are pushed to every client as a
/// `link` notification.
pub struct MplexServer {
    supervisor: Arc<LinkSupervisor>,
    root: Arc<dyn Node>,
    errors: Arc<ErrorRegistry>,
    call_timeout_ms: u64,
    clients: Clients,
    next_client: AtomicU64,
    broadcaster: Mutex<Option<JoinHandle<()>>>,
}

impl MplexServer {
    pub fn new(supervisor: Arc<LinkSupervisor>, errors: Arc<ErrorRegistry>, call_timeout_ms: u64) -> Arc<Self> {
        let root = Arc::new(ClientRoot {
            local: supervisor.local(),
            upstream: supervisor.upstream(),
        });
        let clients: Clients = Default::default();
        let link_rx = supervisor.subscribe_link();
        let broadcast_to = clients.clone();
        let broadcaster = task::spawn(async move {
            while let Ok(up) = link_rx.recv().await {
                let sessions: Vec<_> = broadcast_to.lock().values().cloned().collect();
                log::info!("[MplexServer] link {} to {} clients", if up { "up" } else { "down" }, sessions.len());
                for session in sessions {
                    session.notify(&["link"], Value::Bool(up)).print_error("Should notify client of link change");
                }
            }
        });
        Arc::new(Self {
            supervisor,
            root,
            errors,
            call_timeout_ms,
            clients,
            next_client: AtomicU64::new(1),
            broadcaster: Mutex::new(Some(broadcaster)),
        })
    }

    pub fn clients(&self) -> usize {
        self.clients.lock().len()
    }

    /// Serve one client over an already framed link. Returns its id.
    pub fn serve_link(&self, link: PacketLink) -> u64 {
        let id = self.next_client.fetch_add(1, Ordering::Relaxed);
        let config = SessionConfig {
            name: format!("client{}", id),
            call_timeout_ms: self.call_timeout_ms,
        };
        let session = Arc::new(CmdSession::new(Role::Satellite, Arc::new(DirectChannel::new(link)), self.root.clone(), self.errors.clone(), config));
        if self.supervisor.state() == UplinkState::Running {
            session.notify(&["link"], Value::Bool(true)).print_error("Should notify new client");
        }
        self.clients.lock().insert(id, session.clone());

        let clients = self.clients.clone();
        task::spawn(async move {
            session.wait_closed().await;
            clients.lock().remove(&id);
            log::info!("[MplexServer] client {} gone", id);
        });
        id
    }

    /// Accept clients on a unix socket until accepting fails.
    pub async fn listen(self: Arc<Self>, path: PathBuf) -> Result<(), MplexError> {
        let listener = bind_unix(&path).await?;
        log::info!("[MplexServer] listening on {}", path.display());
        loop {
            let (stream, _) = listener.accept().await?;
            let id = self.serve_link(stream_link(stream, StreamConfig::default(), None));
            log::info!("[MplexServer] client {} connected", id);
        }
    }

    /// Close every client session and stop broadcasting.
    pub async fn close(&self) {
        let broadcaster = self.broadcaster.lock().take();
        if let Some(broadcaster) = broadcaster {
            broadcaster.cancel().await;
        }
        let sessions: Vec<_> = self.clients.lock().drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.close().await;
        }
    }
}

/// Bind `path`, removing a socket file nobody listens on anymore.
async fn bind_unix(path: &Path) -> Result<UnixListener, MplexError> {
    let async_path = async_std::path::Path::new(path.as_os_str());
    if path.exists() {
        if UnixStream::connect(async_path).await.is_ok() {
            return Err(MplexError::SocketInUse(path.display().to_string()));
        }
        log::warn!("[MplexServer] removing stale socket {}", path.display());
        async_std::fs::remove_file(async_path).await?;
    }
    Ok(UnixListener::bind(async_path).await?)
}

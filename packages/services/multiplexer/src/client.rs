use std::{path::Path, sync::Arc, time::Duration};

use async_std::os::unix::net::UnixStream;
use satlink_codec::{DirectChannel, PacketLink, Value};
use satlink_dispatch::{CmdError, CmdSession, ErrorRegistry, Node, RemoteIter, Role, SessionConfig, VerbNode, VerbTable};
use satlink_transport_stream::{stream_link, StreamConfig};
use satlink_utils::state::StateCell;

use crate::error::MplexError;

struct LinkWatch {
    up: StateCell<Option<bool>>,
}

/// A local program's connection to a running multiplexer.
///
/// Paths go to the satellite unless they start with `mplex`. The
/// multiplexer's `link` notifications are tracked in [`MplexClient::link_up`].
pub struct MplexClient {
    session: CmdSession,
    watch: Arc<LinkWatch>,
}

impl MplexClient {
    pub async fn connect<P: AsRef<Path>>(path: P) -> Result<Self, MplexError> {
        let path = path.as_ref();
        let stream = UnixStream::connect(async_std::path::Path::new(path.as_os_str())).await?;
        log::info!("[MplexClient] connected to {}", path.display());
        Self::over_link(stream_link(stream, StreamConfig::default(), None), Arc::new(ErrorRegistry::new())).await
    }

    pub async fn over_link(link: PacketLink, errors: Arc<ErrorRegistry>) -> Result<Self, MplexError> {
        let watch = Arc::new(LinkWatch { up: StateCell::new(None) });
        let verbs = VerbTable::new()
            .call("link", |me: Arc<LinkWatch>, args: Value| async move {
                let up = args.as_bool().ok_or_else(|| CmdError::InvalidArgument("link state must be a bool".into()))?;
                log::info!("[MplexClient] link {}", if up { "up" } else { "down" });
                me.up.set(Some(up));
                Ok(Value::Nil)
            })
            .bind(watch.clone());
        let root = VerbNode::new("", Value::Nil, verbs).into_node();
        root.start().await?;
        let session = CmdSession::new(Role::Host, Arc::new(DirectChannel::new(link)), root, errors, SessionConfig::named("mplex-client"));
        Ok(Self { session, watch })
    }

    /// Last link state the multiplexer reported, `None` before the first report.
    pub fn link_up(&self) -> Option<bool> {
        self.watch.up.get()
    }

    pub async fn wait_link(&self, up: bool, timeout: Duration) -> Result<(), MplexError> {
        async_std::future::timeout(timeout, self.watch.up.wait_for(|s| *s == Some(up)))
            .await
            .map(|_| ())
            .map_err(|_| MplexError::Timeout(format!("link {}", up)))
    }

    pub fn session(&self) -> &CmdSession {
        &self.session
    }

    pub async fn call<S: AsRef<str>>(&self, action: &[S], data: Value) -> Result<Value, CmdError> {
        self.session.call(action, data).await
    }

    pub async fn call_timeout<S: AsRef<str>>(&self, action: &[S], data: Value, timeout: Duration) -> Result<Value, CmdError> {
        self.session.call_timeout(action, data, timeout).await
    }

    pub fn notify<S: AsRef<str>>(&self, action: &[S], data: Value) -> Result<(), CmdError> {
        self.session.notify(action, data)
    }

    pub async fn subscribe<S: AsRef<str>>(&self, action: &[S], data: Value, cadence_ms: u32) -> Result<RemoteIter, CmdError> {
        self.session.subscribe(action, data, cadence_ms).await
    }

    pub async fn close(&self) {
        self.session.close().await;
    }
}

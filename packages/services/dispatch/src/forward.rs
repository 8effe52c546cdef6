use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use satlink_codec::Value;

use crate::{
    node::{CallCtx, Node, NodeCore, NodeState, Reply},
    session::CmdSession,
    CmdError,
};

/// Sends every request below it to a remote command tree.
///
/// Paths are rewritten to `prefix + rest`. While no session is attached,
/// or the attached one has closed, requests fail `ChannelClosed`.
pub struct ForwardNode {
    core: NodeCore,
    prefix: Vec<String>,
    remote: RwLock<Option<Arc<CmdSession>>>,
}

impl ForwardNode {
    pub fn new(name: &str, prefix: Vec<String>) -> Self {
        Self {
            core: NodeCore::new(name, Value::Nil),
            prefix,
            remote: RwLock::new(None),
        }
    }

    pub fn set_remote(&self, remote: Option<Arc<CmdSession>>) {
        *self.remote.write() = remote;
    }

    pub fn remote(&self) -> Option<Arc<CmdSession>> {
        self.remote.read().clone()
    }

    fn target(&self, action: &[String]) -> Vec<String> {
        let mut path = self.prefix.clone();
        path.extend_from_slice(action);
        path
    }
}

#[async_trait::async_trait]
impl Node for ForwardNode {
    fn name(&self) -> String {
        self.core.name()
    }

    fn path(&self) -> Vec<String> {
        self.core.path()
    }

    fn state(&self) -> NodeState {
        self.core.state()
    }

    async fn wait_ready(&self) -> Result<(), CmdError> {
        self.core.wait_ready().await
    }

    async fn dispatch(&self, ctx: CallCtx, action: &[String], args: Value) -> Result<Reply, CmdError> {
        if self.core.state() == NodeState::Stopped {
            return Err(CmdError::Stopped(self.core.path().join(".")));
        }
        let target = self.target(action);
        if target.is_empty() {
            return Err(CmdError::ShortCommand);
        }
        let remote = match self.remote() {
            Some(remote) if !remote.is_closed() => remote,
            _ => return Err(CmdError::ChannelClosed),
        };
        match ctx.repeat_ms {
            Some(cadence_ms) => {
                let iter = remote.subscribe(target.as_slice(), args, cadence_ms).await?;
                Ok(Reply::Stream {
                    cadence_ms: iter.cadence_ms(),
                    items: iter.into_stream(),
                })
            }
            None => remote.call(target.as_slice(), args).await.map(Reply::Value),
        }
    }

    fn dir(&self) -> Value {
        Value::Nil
    }

    async fn start(&self) -> Result<(), CmdError> {
        match self.core.state() {
            NodeState::Stopped => Err(CmdError::Stopped(self.core.path().join("."))),
            _ => {
                self.core.set_state(NodeState::Ready);
                Ok(())
            }
        }
    }

    async fn stop(&self) {
        self.core.set_state(NodeState::Stopped);
    }

    async fn reload(&self, cfg: Value) -> Result<(), CmdError> {
        self.core.set_config(cfg);
        Ok(())
    }

    fn attached(&self, parent: Weak<dyn Node>, name: &str) {
        self.core.attached(parent, name)
    }
}

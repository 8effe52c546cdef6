use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use futures_util::stream::BoxStream;
use parking_lot::RwLock;
use satlink_codec::Value;
use satlink_utils::{state::StateCell, wait::wait_complain};

use crate::{verbs::BoundVerbs, CmdError};

pub type ValueStream = BoxStream<'static, Result<Value, CmdError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Created,
    Starting,
    Ready,
    Stopped,
}

impl NodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Created => "created",
            NodeState::Starting => "starting",
            NodeState::Ready => "ready",
            NodeState::Stopped => "stopped",
        }
    }
}

/// Per-request routing context.
#[derive(Debug, Clone, Default)]
pub struct CallCtx {
    /// Segments consumed so far.
    pub prefix: Vec<String>,
    /// Requested cadence when the caller subscribes.
    pub repeat_ms: Option<u32>,
}

impl CallCtx {
    pub fn with_repeat(mut self, repeat_ms: Option<u32>) -> Self {
        self.repeat_ms = repeat_ms;
        self
    }

    pub fn enter(&self, segment: &str) -> Self {
        let mut prefix = self.prefix.clone();
        prefix.push(segment.to_string());
        Self {
            prefix,
            repeat_ms: self.repeat_ms,
        }
    }

    /// Full path of `rest` below the current position.
    pub fn full_path(&self, rest: &[String]) -> Vec<String> {
        let mut path = self.prefix.clone();
        path.extend_from_slice(rest);
        path
    }
}

pub enum Reply {
    Value(Value),
    Stream { cadence_ms: u32, items: ValueStream },
}

impl Reply {
    /// Collapse to a single value, taking the first item of a stream.
    pub async fn into_value(self) -> Result<Value, CmdError> {
        use futures_util::StreamExt;
        match self {
            Reply::Value(v) => Ok(v),
            Reply::Stream { mut items, .. } => items.next().await.unwrap_or(Ok(Value::Nil)),
        }
    }
}

#[async_trait::async_trait]
pub trait Node: Send + Sync {
    fn name(&self) -> String;
    fn path(&self) -> Vec<String>;
    fn state(&self) -> NodeState;
    /// Wait until ready. Fails `NotReady` when that takes too long and
    /// `Stopped` once stopped.
    async fn wait_ready(&self) -> Result<(), CmdError>;
    async fn dispatch(&self, ctx: CallCtx, action: &[String], args: Value) -> Result<Reply, CmdError>;
    /// `{c: [call verbs], i: [iterator verbs], d: [children]}`
    fn dir(&self) -> Value;
    async fn start(&self) -> Result<(), CmdError>;
    async fn stop(&self);
    async fn reload(&self, cfg: Value) -> Result<(), CmdError>;
    fn attached(&self, parent: Weak<dyn Node>, name: &str);
}

const READY_WARN: Duration = Duration::from_millis(250);
const READY_LIMIT: Duration = Duration::from_secs(10);

/// State every node variant shares: name, parent, lifecycle and config snapshot.
pub struct NodeCore {
    name: RwLock<String>,
    parent: RwLock<Option<Weak<dyn Node>>>,
    state: StateCell<NodeState>,
    config: RwLock<Value>,
    ready_warn: Duration,
    ready_limit: Duration,
}

impl NodeCore {
    pub fn new(name: &str, config: Value) -> Self {
        Self {
            name: RwLock::new(name.to_string()),
            parent: RwLock::new(None),
            state: StateCell::new(NodeState::Created),
            config: RwLock::new(config),
            ready_warn: READY_WARN,
            ready_limit: READY_LIMIT,
        }
    }

    pub fn with_ready_wait(mut self, warn_after: Duration, limit: Duration) -> Self {
        self.ready_warn = warn_after;
        self.ready_limit = limit;
        self
    }

    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    pub fn path(&self) -> Vec<String> {
        let parent = self.parent.read().as_ref().and_then(Weak::upgrade);
        match parent {
            Some(parent) => {
                let mut path = parent.path();
                path.push(self.name());
                path
            }
            None => vec![],
        }
    }

    pub fn state(&self) -> NodeState {
        self.state.get()
    }

    pub fn set_state(&self, state: NodeState) {
        if self.state.set(state) {
            log::debug!("[Node {}] {}", self.path().join("."), state.as_str());
        }
    }

    pub fn config(&self) -> Value {
        self.config.read().clone()
    }

    pub fn set_config(&self, config: Value) {
        *self.config.write() = config;
    }

    pub fn attached(&self, parent: Weak<dyn Node>, name: &str) {
        *self.parent.write() = Some(parent);
        *self.name.write() = name.to_string();
    }

    pub async fn wait_ready(&self) -> Result<(), CmdError> {
        let label = format!("ready {}", self.path().join("."));
        let state = wait_complain(&label, self.ready_warn, Some(self.ready_limit), self.state.wait_for(|s| matches!(s, NodeState::Ready | NodeState::Stopped)))
            .await
            .map_err(|_| CmdError::NotReady(self.path().join(".")))?;
        match state {
            NodeState::Stopped => Err(CmdError::Stopped(self.path().join("."))),
            _ => Ok(()),
        }
    }

    /// Run `verb` from `verbs` or the built-ins. Returns `None` if neither has it.
    ///
    /// Built-ins answer in any state; own verbs wait for readiness first.
    pub async fn invoke(&self, ctx: &CallCtx, verbs: &BoundVerbs, verb: &str, args: Value, dir: impl FnOnce() -> Value) -> Option<Result<Reply, CmdError>> {
        match verb {
            "dir_" => Some(Ok(Reply::Value(dir()))),
            "rdy_" => Some(self.rdy(args).await.map(Reply::Value)),
            "cfg_" => Some(self.cfg(args).map(Reply::Value)),
            _ if verbs.contains(verb) => {
                if let Err(e) = self.wait_ready().await {
                    return Some(Err(e));
                }
                verbs.invoke(ctx, verb, args).await
            }
            _ => None,
        }
    }

    async fn rdy(&self, args: Value) -> Result<Value, CmdError> {
        let wait = args.get("w").and_then(Value::as_bool).unwrap_or(false);
        if wait {
            match self.wait_ready().await {
                Ok(()) | Err(CmdError::Stopped(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(Value::from(self.state().as_str()))
    }

    fn cfg(&self, args: Value) -> Result<Value, CmdError> {
        let path: Vec<String> = match args.get("p").or(args.as_list().map(|_| &args)) {
            Some(p) => p
                .as_list()
                .ok_or_else(|| CmdError::InvalidArgument("cfg_ path must be a list".into()))?
                .iter()
                .map(|s| s.as_str().map(str::to_string).ok_or_else(|| CmdError::InvalidArgument("cfg_ path segment must be a string".into())))
                .collect::<Result<_, _>>()?,
            None => vec![],
        };
        let config = self.config.read();
        config
            .lookup(path.as_slice())
            .cloned()
            .ok_or_else(|| CmdError::InvalidArgument(format!("no config at {}", path.join("."))))
    }
}

pub fn dir_value(verbs: &BoundVerbs, children: Vec<String>) -> Value {
    let (calls, iters) = verbs.names();
    let mut entries = vec![];
    if !calls.is_empty() {
        entries.push(("c", Value::list(calls.into_iter().map(Value::from))));
    }
    if !iters.is_empty() {
        entries.push(("i", Value::list(iters.into_iter().map(Value::from))));
    }
    if !children.is_empty() {
        entries.push(("d", Value::list(children.into_iter().map(Value::from))));
    }
    Value::map(entries)
}

/// Leaf node: a verb table plus lifecycle.
pub struct VerbNode {
    core: NodeCore,
    verbs: BoundVerbs,
    manual_ready: bool,
}

impl VerbNode {
    pub fn new(name: &str, config: Value, verbs: BoundVerbs) -> Self {
        Self {
            core: NodeCore::new(name, config),
            verbs,
            manual_ready: false,
        }
    }

    /// `start` leaves the node in `Starting`; the owner calls [`VerbNode::set_ready`].
    pub fn with_manual_ready(mut self) -> Self {
        self.manual_ready = true;
        self
    }

    pub fn with_ready_wait(mut self, warn_after: Duration, limit: Duration) -> Self {
        self.core = self.core.with_ready_wait(warn_after, limit);
        self
    }

    pub fn set_ready(&self) {
        if self.core.state() == NodeState::Starting {
            self.core.set_state(NodeState::Ready);
        }
    }

    pub fn into_node(self) -> Arc<dyn Node> {
        Arc::new(self)
    }
}

#[async_trait::async_trait]
impl Node for VerbNode {
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
        match action {
            [] => Err(CmdError::ShortCommand),
            [verb] => match self.core.invoke(&ctx, &self.verbs, verb, args, || self.dir()).await {
                Some(res) => res,
                None => Err(CmdError::no_path(&ctx.full_path(action), verb)),
            },
            [child, ..] => Err(CmdError::no_path(&ctx.full_path(action), child)),
        }
    }

    fn dir(&self) -> Value {
        dir_value(&self.verbs, vec![])
    }

    async fn start(&self) -> Result<(), CmdError> {
        match self.core.state() {
            NodeState::Created => {
                self.core.set_state(NodeState::Starting);
                if !self.manual_ready {
                    self.core.set_state(NodeState::Ready);
                }
                Ok(())
            }
            NodeState::Stopped => Err(CmdError::Stopped(self.core.path().join("."))),
            _ => Ok(()),
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

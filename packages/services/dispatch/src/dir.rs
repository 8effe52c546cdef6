use std::{
    collections::BTreeMap,
    sync::{Arc, Weak},
};

use async_std::sync::Mutex;
use parking_lot::RwLock;
use satlink_codec::Value;

use crate::{
    node::{dir_value, CallCtx, Node, NodeCore, NodeState, Reply},
    registry::AppRegistry,
    verbs::BoundVerbs,
    CmdError,
};

#[derive(Clone)]
struct Child {
    node: Arc<dyn Node>,
    /// App type when the child was built from configuration.
    kind: Option<String>,
}

type Children = Arc<BTreeMap<String, Child>>;

/// Directory node: named children plus its own verbs.
///
/// Requests see a snapshot of the children map. Changes build a new map
/// and swap it in whole, so a request in flight never sees half of a
/// reconfiguration.
pub struct DirNode {
    core: NodeCore,
    me: Weak<DirNode>,
    verbs: BoundVerbs,
    children: RwLock<Children>,
    apps: RwLock<Option<Arc<AppRegistry>>>,
    changing: Mutex<()>,
}

impl DirNode {
    pub fn new(name: &str, config: Value) -> Arc<Self> {
        Self::with_verbs(name, config, BoundVerbs::default())
    }

    pub fn with_verbs(name: &str, config: Value, verbs: BoundVerbs) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            core: NodeCore::new(name, config),
            me: me.clone(),
            verbs,
            children: RwLock::new(Arc::new(BTreeMap::new())),
            apps: RwLock::new(None),
            changing: Mutex::new(()),
        })
    }

    pub fn child(&self, name: &str) -> Option<Arc<dyn Node>> {
        self.children.read().get(name).map(|c| c.node.clone())
    }

    pub fn child_names(&self) -> Vec<String> {
        self.children.read().keys().cloned().collect()
    }

    fn parent_ref(&self) -> Weak<dyn Node> {
        self.me.clone()
    }

    fn is_running(&self) -> bool {
        matches!(self.core.state(), NodeState::Starting | NodeState::Ready)
    }

    /// Attach `node` as `name`, stopping any child it replaces. The child is
    /// started when this directory is already running.
    pub async fn attach(&self, name: &str, node: Arc<dyn Node>) -> Result<(), CmdError> {
        let _guard = self.changing.lock().await;
        node.attached(self.parent_ref(), name);
        if self.is_running() {
            node.start().await?;
        }
        let old = {
            let mut children = self.children.write();
            let mut next = (**children).clone();
            let old = next.insert(name.to_string(), Child { node, kind: None });
            *children = Arc::new(next);
            old
        };
        if let Some(old) = old {
            old.node.stop().await;
        }
        Ok(())
    }

    /// Remove and stop a child.
    pub async fn detach(&self, name: &str) -> Option<Arc<dyn Node>> {
        let _guard = self.changing.lock().await;
        let old = {
            let mut children = self.children.write();
            let mut next = (**children).clone();
            let old = next.remove(name);
            *children = Arc::new(next);
            old
        }?;
        old.node.stop().await;
        Some(old.node)
    }

    /// Build children from `cfg`.
    ///
    /// `cfg.apps` maps child name to app type; each child's config is
    /// `cfg.<name>`. Children of the same type are kept and reloaded,
    /// everything else is created through `apps`. New children must reach
    /// ready (unless their config sets `wait: false`) before the new set
    /// becomes visible. On any failure nothing changes.
    pub async fn configure(&self, cfg: Value, apps: Arc<AppRegistry>) -> Result<(), CmdError> {
        let _guard = self.changing.lock().await;
        *self.apps.write() = Some(apps.clone());
        self.configure_locked(cfg, &apps).await
    }

    async fn configure_locked(&self, cfg: Value, apps: &AppRegistry) -> Result<(), CmdError> {
        let wanted = match cfg.get("apps") {
            None | Some(Value::Nil) => BTreeMap::new(),
            Some(Value::Map(map)) => map.clone(),
            Some(_) => return Err(CmdError::InvalidArgument("apps must be a map".into())),
        };
        let current = self.children.read().clone();

        let mut next: BTreeMap<String, Child> = current.iter().filter(|(_, c)| c.kind.is_none()).map(|(k, c)| (k.clone(), c.clone())).collect();
        let mut created = vec![];
        let mut kept = vec![];
        for (name, kind) in &wanted {
            let kind = match kind.as_str() {
                Some(kind) => kind,
                None => {
                    Self::discard(created).await;
                    return Err(CmdError::InvalidArgument(format!("app type of {} must be a string", name)));
                }
            };
            let app_cfg = cfg.get(name).cloned().unwrap_or_else(|| Value::Map(Default::default()));
            match current.get(name) {
                Some(child) if child.kind.as_deref() == Some(kind) => {
                    kept.push((child.node.clone(), app_cfg));
                    next.insert(name.clone(), child.clone());
                }
                _ => {
                    let node = match apps.create(kind, name, app_cfg.clone()) {
                        Ok(node) => node,
                        Err(e) => {
                            Self::discard(created).await;
                            return Err(e);
                        }
                    };
                    node.attached(self.parent_ref(), name);
                    created.push((node.clone(), app_cfg));
                    next.insert(
                        name.clone(),
                        Child {
                            node,
                            kind: Some(kind.to_string()),
                        },
                    );
                }
            }
        }

        let mut failed = None;
        if self.is_running() {
            for (node, app_cfg) in &created {
                let res = match node.start().await {
                    Ok(()) if app_cfg.get("wait").and_then(Value::as_bool).unwrap_or(true) => node.wait_ready().await,
                    other => other,
                };
                if let Err(e) = res {
                    log::warn!("[DirNode {}] app {} failed to start: {}", self.core.path().join("."), node.name(), e);
                    failed = Some(e);
                    break;
                }
            }
        }
        if failed.is_none() {
            for (node, app_cfg) in kept {
                if let Err(e) = node.reload(app_cfg).await {
                    log::warn!("[DirNode {}] app {} failed to reload: {}", self.core.path().join("."), node.name(), e);
                    failed = Some(e);
                    break;
                }
            }
        }
        if let Some(e) = failed {
            Self::discard(created).await;
            return Err(e);
        }

        let removed: Vec<Arc<dyn Node>> = current
            .iter()
            .filter(|(name, child)| child.kind.is_some() && next.get(*name).map(|n| !Arc::ptr_eq(&n.node, &child.node)).unwrap_or(true))
            .map(|(_, child)| child.node.clone())
            .collect();
        *self.children.write() = Arc::new(next);
        self.core.set_config(cfg);
        log::info!("[DirNode {}] configured: {} new, {} removed", self.core.path().join("."), created.len(), removed.len());
        for node in removed {
            node.stop().await;
        }
        Ok(())
    }

    async fn discard(created: Vec<(Arc<dyn Node>, Value)>) {
        for (node, _) in created {
            node.stop().await;
        }
    }
}

#[async_trait::async_trait]
impl Node for DirNode {
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
            [first, rest @ ..] => {
                let child = self.child(first).ok_or_else(|| CmdError::no_path(&ctx.full_path(action), first))?;
                child.dispatch(ctx.enter(first), rest, args).await
            }
        }
    }

    fn dir(&self) -> Value {
        dir_value(&self.verbs, self.child_names())
    }

    async fn start(&self) -> Result<(), CmdError> {
        match self.core.state() {
            NodeState::Created => {}
            NodeState::Stopped => return Err(CmdError::Stopped(self.core.path().join("."))),
            _ => return Ok(()),
        }
        self.core.set_state(NodeState::Starting);
        let children = self.children.read().clone();
        for child in children.values() {
            child.node.start().await?;
        }
        self.core.set_state(NodeState::Ready);
        Ok(())
    }

    async fn stop(&self) {
        self.core.set_state(NodeState::Stopped);
        let children = self.children.read().clone();
        for child in children.values().rev() {
            child.node.stop().await;
        }
    }

    async fn reload(&self, cfg: Value) -> Result<(), CmdError> {
        let _guard = self.changing.lock().await;
        let apps = self.apps.read().clone();
        match apps {
            Some(apps) => self.configure_locked(cfg, &apps).await,
            None => {
                let children = self.children.read().clone();
                for (name, child) in children.iter() {
                    if let Some(child_cfg) = cfg.get(name) {
                        child.node.reload(child_cfg.clone()).await?;
                    }
                }
                self.core.set_config(cfg);
                Ok(())
            }
        }
    }

    fn attached(&self, parent: Weak<dyn Node>, name: &str) {
        self.core.attached(parent, name)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use satlink_codec::Value;

    use super::DirNode;
    use crate::{
        node::{CallCtx, Node, NodeState, VerbNode},
        registry::AppRegistry,
        verbs::VerbTable,
        CmdError,
    };

    struct Tag(String);

    fn tag_node(name: &str, cfg: Value) -> Arc<dyn Node> {
        let tag = cfg.get("tag").and_then(Value::as_str).unwrap_or("none").to_string();
        let verbs = VerbTable::new().call("tag", |me: Arc<Tag>, _| async move { Ok(Value::from(me.0.as_str())) }).bind(Arc::new(Tag(tag)));
        VerbNode::new(name, cfg, verbs).into_node()
    }

    fn action(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    async fn call(node: &dyn Node, parts: &[&str]) -> Result<Value, CmdError> {
        node.dispatch(CallCtx::default(), &action(parts), Value::Nil).await?.into_value().await
    }

    fn apps(created: Arc<AtomicUsize>) -> Arc<AppRegistry> {
        let apps = AppRegistry::new();
        apps.register("tag", move |name, cfg| {
            created.fetch_add(1, Ordering::SeqCst);
            Ok(tag_node(name, cfg))
        });
        Arc::new(apps)
    }

    #[async_std::test]
    async fn routes_through_children() {
        let root = DirNode::new("", Value::Nil);
        let sys = DirNode::new("sys", Value::Nil);
        root.attach("sys", sys.clone()).await.expect("should attach");
        sys.attach("cfg", tag_node("cfg", Value::map([("tag", Value::from("c"))]))).await.expect("should attach");
        root.start().await.expect("should start");

        assert_eq!(call(root.as_ref(), &["sys", "cfg", "tag"]).await, Ok(Value::from("c")));
        assert_eq!(sys.child("cfg").map(|c| c.path()), Some(action(&["sys", "cfg"])));
        assert_eq!(call(root.as_ref(), &["sys", "dir_"]).await, Ok(Value::map([("d", Value::list([Value::from("cfg")]))])));

        match call(root.as_ref(), &["sys", "nonexistent", "x"]).await {
            Err(CmdError::NoPath { path, missing }) => {
                assert_eq!(path, action(&["sys", "nonexistent", "x"]));
                assert_eq!(missing, "nonexistent");
            }
            other => panic!("expected routing error, got {:?}", other),
        }
        assert!(matches!(call(root.as_ref(), &["sys", "nonexistent"]).await, Err(CmdError::NoPath { .. })));
    }

    #[async_std::test]
    async fn attach_replaces_and_stops_old_child() {
        let root = DirNode::new("", Value::Nil);
        root.start().await.expect("should start");
        let old = tag_node("a", Value::Nil);
        root.attach("a", old.clone()).await.expect("should attach");
        assert_eq!(old.state(), NodeState::Ready);
        root.attach("a", tag_node("a", Value::map([("tag", Value::from("new"))]))).await.expect("should attach");
        assert_eq!(old.state(), NodeState::Stopped);
        assert_eq!(call(root.as_ref(), &["a", "tag"]).await, Ok(Value::from("new")));
        let gone = root.detach("a").await.expect("should detach");
        assert_eq!(gone.state(), NodeState::Stopped);
        assert!(root.detach("a").await.is_none());
    }

    #[async_std::test]
    async fn configure_builds_keeps_and_removes() {
        let created = Arc::new(AtomicUsize::new(0));
        let registry = apps(created.clone());
        let root = DirNode::new("", Value::Nil);
        root.start().await.expect("should start");

        let cfg = Value::map([
            ("apps", Value::map([("a", Value::from("tag")), ("b", Value::from("tag"))])),
            ("a", Value::map([("tag", Value::from("first"))])),
        ]);
        root.configure(cfg, registry.clone()).await.expect("should configure");
        assert_eq!(root.child_names(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(created.load(Ordering::SeqCst), 2);
        assert_eq!(call(root.as_ref(), &["a", "tag"]).await, Ok(Value::from("first")));
        let b = root.child("b").expect("b exists");

        let cfg = Value::map([("apps", Value::map([("a", Value::from("tag"))])), ("a", Value::map([("tag", Value::from("second"))]))]);
        root.reload(cfg).await.expect("should reload");
        assert_eq!(root.child_names(), vec!["a".to_string()]);
        assert_eq!(created.load(Ordering::SeqCst), 2, "a is kept");
        assert_eq!(b.state(), NodeState::Stopped);
        assert_eq!(call(root.as_ref(), &["a", "cfg_"]).await, Ok(Value::map([("tag", Value::from("second"))])));
    }

    #[async_std::test]
    async fn failed_configure_changes_nothing() {
        let created = Arc::new(AtomicUsize::new(0));
        let registry = apps(created.clone());
        let root = DirNode::new("", Value::Nil);
        root.start().await.expect("should start");
        root.configure(Value::map([("apps", Value::map([("a", Value::from("tag"))]))]), registry.clone()).await.expect("should configure");

        let bad = Value::map([("apps", Value::map([("a", Value::from("tag")), ("z", Value::from("missing"))]))]);
        assert!(matches!(root.configure(bad, registry).await, Err(CmdError::InvalidArgument(_))));
        assert_eq!(root.child_names(), vec!["a".to_string()]);
        assert_eq!(call(root.as_ref(), &["a", "tag"]).await, Ok(Value::from("none")));
    }

    #[async_std::test]
    async fn stop_cascades() {
        let root = DirNode::new("", Value::Nil);
        let child = tag_node("a", Value::Nil);
        root.attach("a", child.clone()).await.expect("should attach");
        assert_eq!(child.state(), NodeState::Created);
        root.start().await.expect("should start");
        assert_eq!(child.state(), NodeState::Ready);
        root.stop().await;
        assert_eq!(child.state(), NodeState::Stopped);
        assert!(matches!(call(root.as_ref(), &["a", "tag"]).await, Err(CmdError::Stopped(_))));
    }
}

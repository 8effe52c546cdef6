use std::{
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_std::task::{self, JoinHandle};
use satlink_codec::Value;
use satlink_dispatch::{CallCtx, CmdError, CmdSession, DirNode, ErrorRegistry, Node, Role, SessionConfig, VerbNode, VerbTable};
use satlink_reliable::{ReliableConfig, ReliableTransport};
use satlink_transport_memory::MemoryListener;

use crate::config::{BackoffConfig, MplexConfig};

pub fn reliable_config() -> ReliableConfig {
    ReliableConfig {
        window: 8,
        timeout_ms: 100,
        retries: 5,
        ack_delay_ms: 10,
    }
}

pub fn test_config() -> MplexConfig {
    MplexConfig {
        reliable: reliable_config(),
        backoff: BackoffConfig {
            initial_ms: 20,
            max_ms: 100,
            ..Default::default()
        },
        connect_timeout_ms: 2000,
        call_timeout_ms: 2000,
        ..Default::default()
    }
}

/// Fake satellite: `sys.{cfg, wdg, echo, slow}`.
pub struct Satellite {
    cfg: Value,
    pub links: AtomicUsize,
    pub pings: AtomicUsize,
    /// The next watchdog ping never answers.
    pub hang_watchdog: AtomicBool,
}

impl Satellite {
    pub fn new(cfg: Value) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            links: AtomicUsize::new(0),
            pings: AtomicUsize::new(0),
            hang_watchdog: AtomicBool::new(false),
        })
    }
}

fn satellite_verbs() -> VerbTable<Satellite> {
    VerbTable::new()
        .call("cfg", |me: Arc<Satellite>, _| async move { Ok(me.cfg.clone()) })
        .call("wdg", |me: Arc<Satellite>, _| async move {
            me.pings.fetch_add(1, Ordering::SeqCst);
            if me.hang_watchdog.swap(false, Ordering::SeqCst) {
                futures_util::future::pending::<()>().await;
            }
            Ok(Value::Nil)
        })
        .call("echo", |_me: Arc<Satellite>, args| async move { Ok(args) })
        .call("slow", |_me: Arc<Satellite>, args| async move {
            task::sleep(Duration::from_millis(300)).await;
            Ok(args)
        })
}

/// Serve every link the listener accepts until it closes.
pub fn spawn_satellite(listener: MemoryListener, sat: Arc<Satellite>) -> JoinHandle<()> {
    task::spawn(async move {
        while let Ok(link) = listener.accept().await {
            sat.links.fetch_add(1, Ordering::SeqCst);
            let sat = sat.clone();
            task::spawn(async move {
                let transport = ReliableTransport::new(link, reliable_config()).expect("should create transport");
                let root = DirNode::new("", Value::Nil);
                root.attach("sys", VerbNode::new("sys", Value::Nil, satellite_verbs().bind(sat)).into_node()).await.expect("should attach");
                root.start().await.expect("should start");
                let session = CmdSession::new(Role::Satellite, Arc::new(transport), root, Arc::new(ErrorRegistry::new()), SessionConfig::named("sat"));
                session.wait_closed().await;
            });
        }
    })
}

struct Counter(AtomicI64);

/// App type "counter": verb `get`, starting at `cfg.start`.
pub fn counter_app(name: &str, cfg: Value) -> Result<Arc<dyn Node>, CmdError> {
    let start = cfg.get("start").and_then(Value::as_int).unwrap_or_default();
    let verbs = VerbTable::new()
        .call("get", |me: Arc<Counter>, _| async move { Ok(Value::from(me.0.load(Ordering::SeqCst))) })
        .bind(Arc::new(Counter(AtomicI64::new(start))));
    Ok(VerbNode::new(name, cfg, verbs).into_node())
}

pub async fn call(node: &Arc<dyn Node>, parts: &[&str], args: Value) -> Result<Value, CmdError> {
    let action: Vec<String> = parts.iter().map(|s| s.to_string()).collect();
    node.dispatch(CallCtx::default(), &action, args).await?.into_value().await
}

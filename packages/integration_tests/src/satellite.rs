use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_std::task::{self, JoinHandle};
use futures::{stream, StreamExt};
use satlink_codec::{MsgChannel, Value};
use satlink_dispatch::{CmdError, CmdSession, DirNode, ErrorRegistry, Node, Role, SessionConfig, VerbNode, VerbTable};
use satlink_reliable::{ReliableConfig, ReliableTransport};
use satlink_transport_memory::MemoryListener;

pub fn init_log() {
    env_logger::builder().is_test(true).format_timestamp_millis().try_init().ok();
}

pub fn reliable_config() -> ReliableConfig {
    ReliableConfig {
        window: 8,
        timeout_ms: 100,
        retries: 10,
        ack_delay_ms: 10,
    }
}

/// Device side used by the scenarios: `sys.{cfg, echo, slow, ticks}`.
#[derive(Default)]
pub struct Satellite {
    pub calls: AtomicUsize,
    pub links: AtomicUsize,
}

fn satellite_verbs() -> VerbTable<Satellite> {
    VerbTable::new()
        .call("cfg", |_me: Arc<Satellite>, args| async move { Ok(Value::map([("name", Value::from("sat")), ("req", args)])) })
        .call("echo", |me: Arc<Satellite>, args| async move {
            me.calls.fetch_add(1, Ordering::SeqCst);
            Ok(args)
        })
        .call("slow", |_me: Arc<Satellite>, args| async move {
            task::sleep(Duration::from_millis(500)).await;
            Ok(args)
        })
        .iter("ticks", 10, |_me: Arc<Satellite>, args| async move {
            let n = args.as_int().unwrap_or(3);
            Ok(stream::iter((0..n).map(|i| Ok::<_, CmdError>(Value::from(i)))).boxed())
        })
}

pub async fn satellite_root(sat: Arc<Satellite>) -> Arc<DirNode> {
    let root = DirNode::new("", Value::Nil);
    root.attach("sys", VerbNode::new("sys", Value::Nil, satellite_verbs().bind(sat)).into_node()).await.expect("should attach sys");
    root.start().await.expect("should start root");
    root
}

/// Serve the satellite tree on `channel` until it closes.
pub async fn serve(channel: Arc<dyn MsgChannel>, sat: Arc<Satellite>) {
    let root = satellite_root(sat).await;
    let session = CmdSession::new(Role::Satellite, channel, root, Arc::new(ErrorRegistry::new()), SessionConfig::named("sat"));
    session.wait_closed().await;
}

/// Accept reliable links from a memory connector and serve each one.
pub fn spawn_satellite(listener: MemoryListener, sat: Arc<Satellite>) -> JoinHandle<()> {
    task::spawn(async move {
        while let Ok(link) = listener.accept().await {
            sat.links.fetch_add(1, Ordering::SeqCst);
            let transport = ReliableTransport::new(link, reliable_config()).expect("should create transport");
            task::spawn(serve(Arc::new(transport), sat.clone()));
        }
    })
}

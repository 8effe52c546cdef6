use std::{path::PathBuf, sync::Arc};

use futures_util::{select, FutureExt};
use satlink_codec::LinkConnector;
use satlink_dispatch::{AppRegistry, ErrorRegistry};

use crate::{config::MplexConfig, error::MplexError, server::MplexServer, supervisor::LinkSupervisor};

/// Supervisor plus rendezvous socket, wired from one config.
pub struct Multiplexer {
    supervisor: Arc<LinkSupervisor>,
    server: Arc<MplexServer>,
    socket: PathBuf,
}

impl Multiplexer {
    pub fn new(config: MplexConfig, connector: Arc<dyn LinkConnector>, errors: Arc<ErrorRegistry>, apps: Arc<AppRegistry>) -> Self {
        let socket = config.socket_path();
        let call_timeout_ms = config.call_timeout_ms;
        let supervisor = LinkSupervisor::new(config, connector, errors.clone(), apps);
        let server = MplexServer::new(supervisor.clone(), errors, call_timeout_ms);
        Self { supervisor, server, socket }
    }

    pub fn supervisor(&self) -> &Arc<LinkSupervisor> {
        &self.supervisor
    }

    pub fn server(&self) -> &Arc<MplexServer> {
        &self.server
    }

    pub fn socket(&self) -> &PathBuf {
        &self.socket
    }

    /// Start the uplink and serve clients until the socket fails or the
    /// uplink ends. Fails `RetriesExhausted` when the supervisor gave up.
    pub async fn run(&self) -> Result<(), MplexError> {
        self.supervisor.start().await?;
        let res = select! {
            res = self.server.clone().listen(self.socket.clone()).fuse() => res,
            res = self.supervisor.wait_end().fuse() => res,
        };
        if let Err(e) = &res {
            log::error!("[Multiplexer] serving {} failed: {}", self.socket.display(), e);
        }
        self.shutdown().await;
        match &res {
            Err(MplexError::SocketInUse(_)) => {}
            _ => {
                if let Err(e) = async_std::fs::remove_file(async_std::path::Path::new(self.socket.as_os_str())).await {
                    log::debug!("[Multiplexer] socket cleanup: {}", e);
                }
            }
        }
        res
    }

    pub async fn shutdown(&self) {
        self.server.close().await;
        self.supervisor.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use std::{path::PathBuf, sync::Arc, time::Duration};

    use async_std::prelude::FutureExt;
    use satlink_codec::Value;
    use satlink_dispatch::{AppRegistry, ErrorRegistry};
    use satlink_transport_memory::{memory_connector, ImpairConfig};

    use super::Multiplexer;
    use crate::{
        client::MplexClient,
        config::{BackoffConfig, MplexConfig},
        error::MplexError,
        testing::{spawn_satellite, test_config, Satellite},
    };

    fn socket(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("satlink-{}-{}.sock", name, std::process::id()))
    }

    #[async_std::test]
    async fn run_fails_once_retries_are_exhausted() {
        let (connector, _listener) = memory_connector(ImpairConfig::default());
        connector.set_available(false);
        let path = socket("exhausted");
        let config = MplexConfig {
            socket: path.clone(),
            backoff: BackoffConfig {
                initial_ms: 5,
                max_ms: 10,
                max_retries: Some(1),
                ..Default::default()
            },
            ..test_config()
        };
        let mplex = Multiplexer::new(config, Arc::new(connector), Arc::new(ErrorRegistry::new()), Arc::new(AppRegistry::new()));
        let res = mplex.run().timeout(Duration::from_secs(3)).await.expect("run should return");
        assert_eq!(res, Err(MplexError::RetriesExhausted(1)));
        assert!(!path.exists(), "socket should be removed");
    }

    #[async_std::test]
    async fn run_serves_socket_until_shutdown() {
        let (connector, listener) = memory_connector(ImpairConfig::default());
        let _sat = spawn_satellite(listener, Satellite::new(Value::Nil));
        let path = socket("serve");
        let config = MplexConfig {
            socket: path.clone(),
            ..test_config()
        };
        let mplex = Arc::new(Multiplexer::new(config, Arc::new(connector), Arc::new(ErrorRegistry::new()), Arc::new(AppRegistry::new())));
        let running = {
            let mplex = mplex.clone();
            async_std::task::spawn(async move { mplex.run().await })
        };

        let mut client = None;
        for _ in 0..50 {
            if let Ok(c) = MplexClient::connect(&path).await {
                client = Some(c);
                break;
            }
            async_std::task::sleep(Duration::from_millis(20)).await;
        }
        let client = client.expect("should connect over the socket");
        client.wait_link(true, Duration::from_secs(5)).await.expect("should see link up");
        assert_eq!(client.call(&["sys", "echo"], Value::from("hi")).await, Ok(Value::from("hi")));

        mplex.shutdown().await;
        let res = running.timeout(Duration::from_secs(3)).await.expect("run should return");
        assert_eq!(res, Ok(()));
        assert!(!path.exists(), "socket should be removed");
        client.close().await;
    }
}

#[cfg(test)]
mod test {
    use std::{
        sync::{atomic::Ordering, Arc},
        time::Duration,
    };

    use satlink_codec::Value;
    use satlink_dispatch::{AppRegistry, CmdError, ErrorRegistry};
    use satlink_multiplexer::{BackoffConfig, LinkSupervisor, MplexClient, MplexConfig, MplexServer, UplinkState};
    use satlink_transport_memory::{memory_connector, memory_pair, ImpairConfig, MemoryConnector};

    use crate::satellite::{init_log, reliable_config, spawn_satellite, Satellite};

    const WAIT: Duration = Duration::from_secs(5);

    fn config() -> MplexConfig {
        MplexConfig {
            reliable: reliable_config(),
            backoff: BackoffConfig {
                initial_ms: 20,
                max_ms: 200,
                ..Default::default()
            },
            connect_timeout_ms: 2000,
            call_timeout_ms: 3000,
            fetch_config: true,
            ..Default::default()
        }
    }

    async fn start(connector: MemoryConnector) -> (Arc<LinkSupervisor>, Arc<MplexServer>) {
        let supervisor = LinkSupervisor::new(config(), Arc::new(connector), Arc::new(ErrorRegistry::new()), Arc::new(AppRegistry::new()));
        let server = MplexServer::new(supervisor.clone(), Arc::new(ErrorRegistry::new()), 3000);
        supervisor.start().await.expect("should start");
        supervisor.wait_state(UplinkState::Running, WAIT).await.expect("should run");
        (supervisor, server)
    }

    async fn client(server: &MplexServer) -> MplexClient {
        let pair = memory_pair(ImpairConfig::default());
        server.serve_link(pair.b);
        let client = MplexClient::over_link(pair.a, Arc::new(ErrorRegistry::new())).await.expect("should connect");
        client.wait_link(true, WAIT).await.expect("should see link up");
        client
    }

    #[async_std::test]
    async fn upstream_drop_fails_every_session_then_recovers() {
        init_log();
        let (connector, listener) = memory_connector(ImpairConfig::default());
        let sat = Arc::new(Satellite::default());
        let _sat = spawn_satellite(listener, sat.clone());
        let (supervisor, server) = start(connector.clone()).await;
        let a = client(&server).await;
        let b = client(&server).await;

        let (res_a, res_b, _) = futures::join!(a.call(&["sys", "slow"], Value::from("a")), b.call(&["sys", "slow"], Value::from("b")), async {
            async_std::task::sleep(Duration::from_millis(100)).await;
            connector.break_all();
        });
        assert_eq!(res_a, Err(CmdError::ChannelClosed));
        assert_eq!(res_b, Err(CmdError::ChannelClosed));

        a.wait_link(true, WAIT).await.expect("a should see link again");
        b.wait_link(true, WAIT).await.expect("b should see link again");
        assert_eq!(a.call(&["sys", "echo"], Value::from(1)).await, Ok(Value::from(1)));
        assert_eq!(b.call(&["sys", "echo"], Value::from(2)).await, Ok(Value::from(2)));
        assert_eq!(sat.links.load(Ordering::SeqCst), 2);
        assert_eq!(server.clients(), 2);

        a.close().await;
        b.close().await;
        server.close().await;
        supervisor.stop().await;
    }

    #[async_std::test]
    async fn sessions_do_not_see_each_other() {
        let (connector, listener) = memory_connector(ImpairConfig::default());
        let _sat = spawn_satellite(listener, Arc::new(Satellite::default()));
        let (supervisor, server) = start(connector).await;
        let a = client(&server).await;
        let b = client(&server).await;

        let mut ticks = a.subscribe(&["sys", "ticks"], Value::from(50), 10).await.expect("should subscribe");
        assert_eq!(ticks.next().await, Some(Ok(Value::from(0))));

        // b's traffic and b going away leave a's subscription alone
        assert_eq!(b.call(&["sys", "echo"], Value::from("b")).await, Ok(Value::from("b")));
        b.close().await;
        assert_eq!(ticks.next().await, Some(Ok(Value::from(1))));
        ticks.close();
        assert_eq!(ticks.next().await, None);

        let cfg = a.call(&["mplex", "cfg"], Value::Nil).await.expect("should read fetched config");
        assert_eq!(cfg.get("name"), Some(&Value::from("sat")));
        assert_eq!(a.session().pending_calls(), 0);
        a.close().await;
        server.close().await;
        supervisor.stop().await;
    }
}

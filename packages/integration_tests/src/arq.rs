#[cfg(test)]
mod test {
    use std::time::Duration;

    use async_std::prelude::FutureExt;
    use futures::future::join_all;
    use satlink_codec::Value;
    use satlink_reliable::{ReliableConfig, ReliableTransport};
    use satlink_transport_memory::{memory_pair, ImpairConfig};

    use crate::satellite::init_log;

    async fn send_ten(impair: ImpairConfig, config: ReliableConfig) {
        let pair = memory_pair(impair);
        let a = ReliableTransport::new(pair.a, config.clone()).expect("should create a");
        let b = ReliableTransport::new(pair.b, config).expect("should create b");

        let sends = join_all((0..10).map(|i| a.send(Value::from(i))));
        let recvs = async {
            let mut got = vec![];
            for _ in 0..10 {
                got.push(b.recv().await.expect("should receive"));
            }
            got
        };
        let (sent, got) = futures::future::join(sends, recvs).timeout(Duration::from_secs(10)).await.expect("should finish in time");
        assert!(sent.iter().all(Result::is_ok), "sends failed: {:?}", sent);
        assert_eq!(got, (0..10).map(Value::from).collect::<Vec<_>>());
        assert!(b.recv().timeout(Duration::from_millis(300)).await.is_err(), "nothing more should arrive");
        a.close().await;
    }

    fn scenario_config() -> ReliableConfig {
        ReliableConfig {
            window: 4,
            timeout_ms: 100,
            ..Default::default()
        }
    }

    #[async_std::test]
    async fn ten_sends_over_short_queues() {
        init_log();
        send_ten(ImpairConfig::default().with_qlens(2, 2), scenario_config()).await;
    }

    #[async_std::test]
    async fn ten_sends_short_forward_long_back() {
        send_ten(ImpairConfig::default().with_qlens(2, 20), scenario_config()).await;
    }

    #[async_std::test]
    async fn ten_sends_long_forward_short_back() {
        send_ten(ImpairConfig::default().with_qlens(20, 2), scenario_config()).await;
    }

    #[async_std::test]
    async fn ten_sends_over_long_queues() {
        send_ten(ImpairConfig::default().with_qlens(20, 20), scenario_config()).await;
    }

    #[async_std::test]
    async fn impaired_link_delivers_once_in_order() {
        for (window, seed) in [(4, 11), (8, 12), (20, 13)] {
            let impair = ImpairConfig {
                loss: 0.1,
                duplicate: 0.1,
                reorder: 0.1,
                seed,
                ..Default::default()
            };
            let config = ReliableConfig {
                window,
                timeout_ms: 50,
                retries: 40,
                ack_delay_ms: 5,
            };
            send_ten(impair, config).await;
        }
    }
}

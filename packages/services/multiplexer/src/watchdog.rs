use std::{sync::Arc, time::Duration};

use async_std::channel::Sender;
use satlink_codec::Value;
use satlink_dispatch::CmdSession;

/// Ping `sys.wdg` on the satellite until a ping fails, then ask for a reconnect.
///
/// The first ping carries the satellite-side timeout, a bit over twice the
/// interval, which arms its own watchdog.
pub(crate) async fn run_watchdog(session: Arc<CmdSession>, interval: Duration, timeout: Duration, reconnect: Sender<()>) {
    log::info!("[Watchdog] every {} ms", interval.as_millis());
    let mut data = Value::Int(interval.as_millis() as i64 * 22 / 10);
    loop {
        match session.call_quiet(&["sys", "wdg"], data, timeout).await {
            Ok(_) => log::trace!("[Watchdog] ping ok"),
            Err(e) => {
                log::warn!("[Watchdog] ping failed: {}", e);
                if reconnect.try_send(()).is_err() {
                    log::debug!("[Watchdog] reconnect already requested");
                }
                return;
            }
        }
        data = Value::Nil;
        async_std::task::sleep(interval).await;
    }
}

use std::{sync::Arc, time::Duration};

use async_std::channel::Receiver;
use futures_util::{stream, StreamExt};
use satlink_codec::Value;

use crate::{node::ValueStream, request::IterEvent, session::Shared, CmdError};

/// Consumer side of a subscription.
///
/// Values arrive in producer order. After [`RemoteIter::close`], drop, an
/// end marker or an error, `next` only returns `None`. Closing early sends a
/// best-effort cancel so the producer stops.
pub struct RemoteIter {
    id: u32,
    cadence_ms: u32,
    rx: Receiver<IterEvent>,
    shared: Arc<Shared>,
    next_seq: u32,
    peeked: Option<IterEvent>,
    done: bool,
}

impl RemoteIter {
    pub(crate) fn new(id: u32, cadence_ms: u32, rx: Receiver<IterEvent>, shared: Arc<Shared>) -> Self {
        Self {
            id,
            cadence_ms,
            rx,
            shared,
            next_seq: 0,
            peeked: None,
            done: false,
        }
    }

    /// Wait for the producer to accept the subscription.
    pub(crate) async fn await_start(&mut self, timeout: Duration) -> Result<(), CmdError> {
        match async_std::future::timeout(timeout, self.rx.recv()).await {
            Err(_) => {
                self.close();
                Err(CmdError::Timeout)
            }
            Ok(Err(_)) => {
                self.done = true;
                Err(CmdError::ChannelClosed)
            }
            Ok(Ok(IterEvent::Started(cadence_ms))) => {
                self.cadence_ms = cadence_ms;
                Ok(())
            }
            Ok(Ok(IterEvent::Error(err))) => {
                self.finish();
                Err(err)
            }
            Ok(Ok(other)) => {
                self.peeked = Some(other);
                Ok(())
            }
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Cadence the producer accepted, may be slower than requested.
    pub fn cadence_ms(&self) -> u32 {
        self.cadence_ms
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub async fn next(&mut self) -> Option<Result<Value, CmdError>> {
        if self.done {
            return None;
        }
        loop {
            let event = match self.peeked.take() {
                Some(event) => event,
                None => match self.rx.recv().await {
                    Ok(event) => event,
                    Err(_) => {
                        self.done = true;
                        return Some(Err(CmdError::ChannelClosed));
                    }
                },
            };
            match event {
                IterEvent::Item(seq, value) => {
                    if seq < self.next_seq {
                        log::debug!("[RemoteIter {}] drop repeated item {}", self.id, seq);
                        continue;
                    }
                    if seq > self.next_seq {
                        log::warn!("[RemoteIter {}] items {}..{} missing", self.id, self.next_seq, seq);
                    }
                    self.next_seq = seq.wrapping_add(1);
                    return Some(Ok(value));
                }
                IterEvent::Single(value) => {
                    self.finish();
                    return Some(Ok(value));
                }
                IterEvent::Started(_) => continue,
                IterEvent::End => {
                    self.finish();
                    return None;
                }
                IterEvent::Error(err) => {
                    self.finish();
                    return Some(Err(err));
                }
            }
        }
    }

    /// Stop consuming. Nothing is yielded afterwards.
    pub fn close(&mut self) {
        if !self.done {
            self.done = true;
            self.shared.cancel_remote(self.id);
        }
    }

    fn finish(&mut self) {
        self.done = true;
        self.shared.forget(self.id);
    }

    pub fn into_stream(self) -> ValueStream {
        stream::unfold(self, |mut iter| async move { iter.next().await.map(|item| (item, iter)) }).boxed()
    }
}

impl Drop for RemoteIter {
    fn drop(&mut self) {
        self.close();
    }
}

/// Keeps a producer on a fixed schedule.
///
/// Ticks are spaced `cadence` apart. A consumer that falls behind by more
/// than a little slack restarts the schedule instead of bursting to catch up.
pub struct Pacer {
    cadence: Duration,
    next: Option<std::time::Instant>,
    late: u32,
}

const PACER_SLACK: Duration = Duration::from_millis(10);

impl Pacer {
    pub fn new(cadence_ms: u32) -> Self {
        Self {
            cadence: Duration::from_millis(cadence_ms as u64),
            next: None,
            late: 2,
        }
    }

    /// Wait for the next tick. The first tick is immediate.
    pub async fn tick(&mut self) {
        let now = std::time::Instant::now();
        let next = match self.next {
            None => {
                self.next = Some(now + self.cadence);
                return;
            }
            Some(next) => next,
        };
        if now <= next + PACER_SLACK {
            self.next = Some(next + self.cadence);
            if next > now {
                async_std::task::sleep(next - now).await;
            }
        } else {
            self.late += 1;
            // warn on the 2nd, 6th, 14th... late tick
            if self.cadence > PACER_SLACK && self.late.is_power_of_two() {
                log::warn!("[Pacer] producer late by {:?}", now - next);
            }
            self.next = Some(now + self.cadence);
        }
    }
}

use async_std::channel::{bounded, Sender};
use parking_lot::Mutex;

struct Inner<S> {
    state: S,
    waiters: Vec<Sender<()>>,
}

/// A value that tasks can wait on.
///
/// Every `set` that changes the value wakes all waiters, which then
/// re-check their predicate. Registration happens under the lock, so a
/// change between checking and waiting is never lost.
pub struct StateCell<S> {
    inner: Mutex<Inner<S>>,
}

impl<S: Clone + PartialEq + Send> StateCell<S> {
    pub fn new(state: S) -> Self {
        Self {
            inner: Mutex::new(Inner { state, waiters: vec![] }),
        }
    }

    pub fn get(&self) -> S {
        self.inner.lock().state.clone()
    }

    /// Returns true if the value changed.
    pub fn set(&self, state: S) -> bool {
        let waiters = {
            let mut inner = self.inner.lock();
            if inner.state == state {
                return false;
            }
            inner.state = state;
            std::mem::take(&mut inner.waiters)
        };
        for waiter in waiters {
            waiter.try_send(()).ok();
        }
        true
    }

    /// Wait until `pred` holds and return the state that satisfied it.
    pub async fn wait_for<F: Fn(&S) -> bool>(&self, pred: F) -> S {
        loop {
            let rx = {
                let mut inner = self.inner.lock();
                if pred(&inner.state) {
                    return inner.state.clone();
                }
                // waiters whose future was dropped
                inner.waiters.retain(|tx| !tx.is_closed());
                let (tx, rx) = bounded(1);
                inner.waiters.push(tx);
                rx
            };
            rx.recv().await.ok();
        }
    }

    /// Wait for the next change away from the current value.
    pub async fn changed(&self) -> S {
        let current = self.get();
        self.wait_for(move |s| *s != current).await
    }
}

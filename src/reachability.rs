// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The reachability oracle: a dependency-injected signal for "is the network up".
//!
//! Nothing in this crate consults OS-level connectivity state directly. Instead, callers hand
//! in a [`Reachability`] implementation, so embedders that already track link state (mobile
//! radio status, a VPN tunnel, a container network namespace) can feed it straight in rather
//! than have this crate duplicate that detection.

use std::future::Future;
use std::pin::Pin;

use tokio::sync::broadcast;

/// A boxed future, for trait methods that can't use `async fn` directly (this crate avoids
/// adding `async-trait` purely for object-safety; see [`Transport`](crate::transport::Transport)
/// for the same pattern).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A reachability transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    /// The network became reachable.
    Up,
    /// The network became unreachable.
    Down,
}

/// A source of truth for network reachability.
///
/// Implementations must be cheap to query: [`Socket`](crate::socket::Socket) calls
/// [`is_up`](Reachability::is_up) on every connect attempt.
pub trait Reachability: Send + Sync + 'static {
    /// Return the current reachability state without blocking.
    fn is_up(&self) -> bool;

    /// Subscribe to future transitions. Implementations should not buffer transitions
    /// indefinitely for a lagging subscriber; a `broadcast` channel's usual lag semantics
    /// (the receiver observing [`broadcast::error::RecvError::Lagged`] and resynchronizing)
    /// are acceptable, since callers only care about the most recent edge.
    fn subscribe(&self) -> broadcast::Receiver<Edge>;

    /// Resolve once the network is up, returning immediately if it already is.
    fn await_up(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if self.is_up() {
                return;
            }
            let mut rx = self.subscribe();
            loop {
                match rx.recv().await {
                    Ok(Edge::Up) => return,
                    Ok(Edge::Down) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        if self.is_up() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        })
    }

    /// Resolve once the network is down, returning immediately if it already is.
    fn await_down(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if !self.is_up() {
                return;
            }
            let mut rx = self.subscribe();
            loop {
                match rx.recv().await {
                    Ok(Edge::Down) => return,
                    Ok(Edge::Up) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        if !self.is_up() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        })
    }
}

/// A [`Reachability`] oracle that reports the network as permanently up.
///
/// This is the default used when a caller has no better source of truth; it makes the
/// reachability gate a no-op, so retry/backoff behavior is driven purely by connect failures.
pub struct AlwaysOnline {
    // Kept around only so `subscribe` has something to hand out receivers from; nothing is
    // ever sent on it.
    tx: broadcast::Sender<Edge>,
}

impl Default for AlwaysOnline {
    fn default() -> Self {
        let (tx, _rx) = broadcast::channel(1);
        AlwaysOnline { tx }
    }
}

impl Reachability for AlwaysOnline {
    fn is_up(&self) -> bool {
        true
    }

    fn subscribe(&self) -> broadcast::Receiver<Edge> {
        self.tx.subscribe()
    }
}

#[cfg(any(test, feature = "test-support"))]
pub mod toggle {
    //! A [`Reachability`] test double, gated behind `#[cfg(test)]` for this crate's own suite
    //! and behind the `test-support` feature for embedders writing theirs.

    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// A [`Reachability`] whose state a test can flip at will.
    pub struct Toggle {
        up: AtomicBool,
        tx: broadcast::Sender<Edge>,
    }

    impl Toggle {
        /// Construct a toggle starting in the given state.
        pub fn new(initially_up: bool) -> Self {
            let (tx, _rx) = broadcast::channel(16);
            Toggle { up: AtomicBool::new(initially_up), tx }
        }

        /// Flip the toggle, firing an edge event if the state actually changed.
        pub fn set_up(&self, up: bool) {
            let changed = self.up.swap(up, Ordering::SeqCst) != up;
            if changed {
                let _ = self.tx.send(if up { Edge::Up } else { Edge::Down });
            }
        }
    }

    impl Reachability for Toggle {
        fn is_up(&self) -> bool {
            self.up.load(Ordering::SeqCst)
        }

        fn subscribe(&self) -> broadcast::Receiver<Edge> {
            self.tx.subscribe()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::toggle::Toggle;
    use super::*;

    #[tokio::test]
    async fn always_online_await_up_resolves_immediately() {
        let oracle = AlwaysOnline::default();
        oracle.await_up().await;
    }

    #[tokio::test]
    async fn toggle_await_up_waits_for_edge() {
        let oracle = std::sync::Arc::new(Toggle::new(false));
        let flipper = oracle.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            flipper.set_up(true);
        });
        oracle.await_up().await;
        handle.await.unwrap();
    }
}

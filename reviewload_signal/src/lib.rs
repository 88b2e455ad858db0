//! One-shot phase signal for reviewload.
//!
//! A reviewload run has a single moment every simulated session cares about:
//! the moment the run stops. The `Broadcaster` announces that moment and any
//! number of `Watcher` instances observe it.
//!
//! The `Broadcaster` counts live watchers and `Broadcaster::signal_and_wait`
//! only returns once each of them has either observed the signal or been
//! dropped. Sessions only poll their watcher between actions, so waiting on
//! the broadcaster is the same as waiting for every in-flight action to
//! finish.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(clippy::unwrap_used)]
#![deny(unused_extern_crates)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]

use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};

use tokio::sync::{
    Notify,
    broadcast::{self, error},
};
use tracing::debug;

/// Construct a `Watcher` and `Broadcaster` pair.
///
/// The `Broadcaster` waits on the returned `Watcher` and on every `Watcher`
/// registered from it.
#[must_use]
pub fn signal() -> (Watcher, Broadcaster) {
    // Nothing is ever sent on the channel. Dropping the sender closes it and
    // closure is the signal.
    let (sender, receiver) = broadcast::channel(1);
    let peers = Arc::new(AtomicU32::new(1));
    let notify = Arc::new(Notify::new());

    let watcher = Watcher {
        receiver,
        peers: Arc::clone(&peers),
        notify: Arc::clone(&notify),
        released: false,
    };
    let broadcaster = Broadcaster {
        sender,
        peers,
        notify,
    };

    (watcher, broadcaster)
}

#[derive(Debug)]
/// Announces the signal to every `Watcher` derived from the same pair.
pub struct Broadcaster {
    sender: broadcast::Sender<()>,
    /// Watchers that have not yet observed the signal or dropped.
    peers: Arc<AtomicU32>,
    notify: Arc<Notify>,
}

impl Broadcaster {
    /// Send the signal without waiting on any `Watcher`.
    pub fn signal(self) {
        drop(self.sender);
    }

    /// Send the signal and wait until every `Watcher` has observed it or been
    /// dropped.
    pub async fn signal_and_wait(self) {
        drop(self.sender);

        loop {
            // Register interest before reading the count, otherwise a peer
            // releasing between the load and the await is a lost wakeup.
            let notified = self.notify.notified();
            let peers = self.peers.load(Ordering::SeqCst);
            if peers == 0 {
                break;
            }
            debug!("waiting on {peers} peers to observe the signal");
            notified.await;
        }
    }
}

#[derive(Debug)]
/// Observes the signal sent by a `Broadcaster`.
pub struct Watcher {
    receiver: broadcast::Receiver<()>,
    peers: Arc<AtomicU32>,
    notify: Arc<Notify>,
    /// Set once this instance no longer counts toward `peers`.
    released: bool,
}

impl Watcher {
    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        // Saturate at zero rather than wrap.
        let mut current = self.peers.load(Ordering::Relaxed);
        while current > 0 {
            match self.peers.compare_exchange_weak(
                current,
                current - 1,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    self.notify.notify_waiters();
                    break;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Wait for the signal. Returns immediately if the signal was already
    /// sent.
    ///
    /// # Panics
    ///
    /// Panics if the underlying channel reports lag, which is impossible as
    /// nothing is ever sent on it.
    pub async fn recv(mut self) {
        match self.receiver.recv().await {
            Ok(()) | Err(error::RecvError::Closed) => self.release(),
            Err(error::RecvError::Lagged(_)) => {
                panic!("signal channel lagged, nothing should ever be sent on it");
            }
        }
    }

    /// Create another `Watcher`. The `Broadcaster` will wait on it in
    /// `signal_and_wait`.
    #[must_use]
    pub fn register(&self) -> Self {
        self.peers.fetch_add(1, Ordering::SeqCst);
        Self {
            receiver: self.receiver.resubscribe(),
            peers: Arc::clone(&self.peers),
            notify: Arc::clone(&self.notify),
            released: false,
        }
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    #[tokio::test]
    async fn watcher_observes_signal() {
        let (watcher, broadcaster) = signal();
        let handle = tokio::spawn(watcher.recv());

        broadcaster.signal_and_wait().await;
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn recv_after_signal_returns() {
        let (watcher, broadcaster) = signal();
        broadcaster.signal();

        timeout(Duration::from_secs(1), watcher.recv())
            .await
            .expect("recv must not block once signalled");
    }

    #[tokio::test]
    async fn signal_and_wait_with_dropped_watcher() {
        let (watcher, broadcaster) = signal();
        drop(watcher);

        timeout(Duration::from_secs(1), broadcaster.signal_and_wait())
            .await
            .expect("dropped watchers must not be waited on");
    }

    #[tokio::test(start_paused = true)]
    async fn signal_and_wait_blocks_until_every_peer_observes() {
        let (root, broadcaster) = signal();
        let busy = root.register();
        drop(root);

        let (done_tx, mut done_rx) = tokio::sync::oneshot::channel::<()>();
        let peer = tokio::spawn(async move {
            // Stand-in for an in-flight action: the watcher is not polled
            // until the work completes.
            tokio::time::sleep(Duration::from_secs(5)).await;
            done_tx.send(()).unwrap();
            busy.recv().await;
        });

        broadcaster.signal_and_wait().await;
        assert!(done_rx.try_recv().is_ok(), "broadcaster returned early");
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn many_registered_watchers() {
        let (root, broadcaster) = signal();
        let mut handles = Vec::new();
        for _ in 0..16 {
            let watcher = root.register();
            handles.push(tokio::spawn(watcher.recv()));
        }
        drop(root);

        broadcaster.signal_and_wait().await;
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn register_before_recv_after_signal() {
        let (root, broadcaster) = signal();
        broadcaster.signal();

        // The signal is sent but `root` has not observed it yet.
        let late = root.register();
        late.recv().await;
        root.recv().await;
    }
}

//! Cooperative shutdown signalling for background tasks.
//!
//! A [`ShutdownSender`] is held by whoever owns a set of background tasks;
//! each task holds a [`ShutdownReceiver`] clone and selects on
//! [`ShutdownReceiver::recv`] at its loop boundary. Dropping the sender also
//! signals shutdown, so a panicking owner still tears its tasks down.

use tokio::sync::watch;

/// Create a connected shutdown channel pair.
pub fn channel() -> (ShutdownSender, ShutdownReceiver) {
    let (tx, rx) = watch::channel(false);
    (ShutdownSender { tx }, ShutdownReceiver { rx })
}

/// The owning half of a shutdown channel.
#[derive(Debug)]
pub struct ShutdownSender {
    tx: watch::Sender<bool>,
}

impl ShutdownSender {
    /// Signal all receivers and wait for every receiver clone to be dropped,
    /// i.e. for every background task to have observed the signal and
    /// finished.
    pub async fn shutdown(self) {
        // send_replace rather than send: we don't care whether any receiver
        // is still listening.
        self.tx.send_replace(true);
        self.tx.closed().await;
    }

    /// Signal receivers without waiting for them to finish.
    pub fn signal(&self) {
        self.tx.send_replace(true);
    }

    /// Create an additional receiver connected to this sender.
    pub fn subscribe(&self) -> ShutdownReceiver {
        ShutdownReceiver {
            rx: self.tx.subscribe(),
        }
    }
}

/// The task-side half of a shutdown channel.
#[derive(Debug, Clone)]
pub struct ShutdownReceiver {
    rx: watch::Receiver<bool>,
}

impl ShutdownReceiver {
    /// Completes when shutdown has been signalled (or the sender dropped).
    pub async fn recv(&mut self) {
        // An Err means the sender is gone, which we treat as shutdown.
        while !*self.rx.borrow() {
            if self.rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Non-blocking check, for use inside tight non-async loops.
    pub fn signalled(&self) -> bool {
        *self.rx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn receivers_observe_signal() {
        let (tx, mut rx) = channel();
        let task = tokio::spawn(async move {
            rx.recv().await;
        });
        tx.shutdown().await;
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("task did not observe shutdown")
            .unwrap();
    }

    #[tokio::test]
    async fn dropped_sender_counts_as_shutdown() {
        let (tx, mut rx) = channel();
        drop(tx);
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("receiver did not observe sender drop");
    }
}

//! Fire-and-forget handoff of TXT records to the name-server updater.
//!
//! The pipeline never waits for confirmation: records are queued onto a
//! background task that forwards them to the authoritative server. The
//! transport to that server lives behind this adapter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use log::{debug, info};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// Queues TXT record updates for the authoritative name server.
pub struct NsUpdater {
    tx: StdMutex<Option<mpsc::UnboundedSender<(String, String)>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    queued: Arc<AtomicU64>,
}

impl NsUpdater {
    /// Spawns the updater task targeting `server`.
    pub fn spawn(server: String) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<(String, String)>();
        let forwarded = Arc::new(AtomicU64::new(0));
        let forwarded_in_task = Arc::clone(&forwarded);

        let task = tokio::spawn(async move {
            let mut count: u64 = 0;
            while let Some((hostname, txt)) = rx.recv().await {
                debug!("NS update to {server}: {hostname} TXT {txt}");
                count += 1;
                forwarded_in_task.store(count, Ordering::Relaxed);
            }
            info!("Name-server updater for {server} finished after {count} updates");
        });

        Self {
            tx: StdMutex::new(Some(tx)),
            task: Mutex::new(Some(task)),
            queued: forwarded,
        }
    }

    /// Queues one update. Never blocks and never reports failure back.
    pub fn add(&self, hostname: &str, txt: &str) {
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = tx.as_ref() {
            let _ = tx.send((hostname.to_string(), txt.to_string()));
        }
    }

    /// Number of updates handed to the updater task so far.
    pub fn queued(&self) -> u64 {
        self.queued.load(Ordering::Relaxed)
    }

    /// Stops accepting updates and drains the queue. Idempotent.
    pub async fn close(&self) {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_updates_drain_on_close() {
        let updater = NsUpdater::spawn("ns1.example.com:53".to_string());
        updater.add("mx1.example.com", "mx1.example.com [addr=192.0.2.1 status=ok starttls=yes]");
        updater.add("mx2.example.com", "mx2.example.com");
        updater.close().await;

        assert_eq!(updater.queued(), 2);

        // Adding after close is a silent no-op.
        updater.add("late.example.com", "late.example.com");
        updater.close().await;
        assert_eq!(updater.queued(), 2);
    }
}

//! Deduplicated, ordered notification list with independent seen/read bits.

use shared::protocol::Notification;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Default)]
pub struct NotificationAggregator {
    entries: Mutex<Vec<Notification>>,
}

impl NotificationAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a live notification at the front unless its id is already
    /// held. Returns whether the list changed.
    pub async fn ingest(&self, notification: Notification) -> bool {
        let mut entries = self.entries.lock().await;
        if entries.iter().any(|n| n.id == notification.id) {
            debug!(id = notification.id, "duplicate notification discarded");
            return false;
        }
        entries.insert(0, notification);
        true
    }

    /// Seeds the list from the REST listing, preserving server order and
    /// skipping ids already held.
    pub async fn fill(&self, existing: Vec<Notification>) {
        let mut entries = self.entries.lock().await;
        for notification in existing {
            if !entries.iter().any(|n| n.id == notification.id) {
                entries.push(notification);
            }
        }
    }

    /// Marks every notification seen. Read bits are untouched.
    pub async fn mark_all_seen(&self) {
        for notification in self.entries.lock().await.iter_mut() {
            notification.is_seen = true;
        }
    }

    /// Marks exactly one notification read; idempotent; seen is untouched.
    pub async fn mark_read(&self, id: i64) -> bool {
        let mut entries = self.entries.lock().await;
        match entries.iter_mut().find(|n| n.id == id) {
            Some(notification) => {
                notification.is_read = true;
                true
            }
            None => false,
        }
    }

    pub async fn unseen_count(&self) -> usize {
        self.entries
            .lock()
            .await
            .iter()
            .filter(|n| !n.is_seen)
            .count()
    }

    pub async fn snapshot(&self) -> Vec<Notification> {
        self.entries.lock().await.clone()
    }

    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }
}

//! Deferred change notifications.
//!
//! Mutations collect their changes while the transaction is open and flush
//! them only after COMMIT succeeds. A listener therefore never observes a
//! change that was rolled back, and never reads the database mid-write.

use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// One committed change, addressed by the abstract resource path.
#[derive(Debug, Clone)]
pub struct Change {
    pub volume: String,
    pub path: String,
    pub kind: ChangeKind,
}

pub trait ChangeListener: Send + Sync {
    fn on_change(&self, change: &Change);
}

/// Changes accumulated by an open transaction. Dropped without flushing on
/// rollback.
#[derive(Debug, Default)]
pub struct PendingChanges {
    changes: Vec<Change>,
}

impl PendingChanges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, volume: &str, path: String, kind: ChangeKind) {
        self.changes.push(Change {
            volume: volume.to_string(),
            path,
            kind,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Deliver everything to the listeners. Call strictly after COMMIT.
    pub fn flush(self, listeners: &[std::sync::Arc<dyn ChangeListener>]) {
        for change in &self.changes {
            debug!("Notifying {:?} {}", change.kind, change.path);
            for listener in listeners {
                listener.on_change(change);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    pub(crate) struct RecordingListener {
        pub seen: Mutex<Vec<(String, ChangeKind)>>,
    }

    impl ChangeListener for RecordingListener {
        fn on_change(&self, change: &Change) {
            self.seen
                .lock()
                .unwrap()
                .push((change.path.clone(), change.kind));
        }
    }

    #[test]
    fn flush_delivers_in_order() {
        let listener = Arc::new(RecordingListener {
            seen: Mutex::new(Vec::new()),
        });
        let mut pending = PendingChanges::new();
        pending.push("external", "external/images/media/1".to_string(), ChangeKind::Insert);
        pending.push("external", "external/images/media/1".to_string(), ChangeKind::Update);

        let listeners: Vec<Arc<dyn ChangeListener>> = vec![listener.clone()];
        pending.flush(&listeners);

        let seen = listener.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].1, ChangeKind::Insert);
        assert_eq!(seen[1].1, ChangeKind::Update);
    }

    #[test]
    fn dropped_pending_changes_notify_nothing() {
        let listener = Arc::new(RecordingListener {
            seen: Mutex::new(Vec::new()),
        });
        let mut pending = PendingChanges::new();
        pending.push("external", "external/files/9".to_string(), ChangeKind::Delete);
        drop(pending);
        assert!(listener.seen.lock().unwrap().is_empty());
    }
}

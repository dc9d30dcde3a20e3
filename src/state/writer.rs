use chrono::Utc;
use tokio::sync::Mutex;

use super::{LifecycleRecord, StateError, StateStore};

/// The single serialized writer for one cluster's record.
///
/// Every mutation runs under one lock against a copy of the record; the copy
/// is persisted before it replaces the in-memory snapshot, so memory never runs
/// ahead of disk.
pub struct StateWriter {
    store: StateStore,
    record: Mutex<LifecycleRecord>,
}

impl StateWriter {
    pub fn new(store: StateStore, record: LifecycleRecord) -> Self {
        Self {
            store,
            record: Mutex::new(record),
        }
    }

    /// Apply `mutate` and persist the result atomically
    pub async fn commit<F, R>(&self, mutate: F) -> Result<R, StateError>
    where
        F: FnOnce(&mut LifecycleRecord) -> R,
    {
        let mut guard = self.record.lock().await;
        let mut next = guard.clone();
        let out = mutate(&mut next);
        next.updated_at = Utc::now();
        self.store.save(&next)?;
        *guard = next;
        Ok(out)
    }

    /// Current committed state
    pub async fn snapshot(&self) -> LifecycleRecord {
        self.record.lock().await.clone()
    }

    /// Delete the record file once no resources remain
    pub async fn remove_if_empty(&self) -> Result<bool, StateError> {
        let guard = self.record.lock().await;
        if !guard.resources.is_empty() {
            return Ok(false);
        }
        self.store.remove(&guard.cluster)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::testing::network_node;
    use crate::state::{ResourceRecord, ResourceStatus};
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_commit_persists_before_returning() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        let writer = StateWriter::new(store.clone(), LifecycleRecord::new("lab", "h"));

        let node = network_node("mgmt");
        writer
            .commit(|r| {
                r.resources
                    .insert(node.id.clone(), ResourceRecord::pending(&node));
            })
            .await
            .unwrap();

        let on_disk = store.load("lab").unwrap().unwrap();
        assert_eq!(on_disk, writer.snapshot().await);
    }

    #[tokio::test]
    async fn test_concurrent_commits_are_serialized() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        let writer = Arc::new(StateWriter::new(store.clone(), LifecycleRecord::new("lab", "h")));

        let mut handles = Vec::new();
        for i in 0..16 {
            let writer = Arc::clone(&writer);
            handles.push(tokio::spawn(async move {
                let node = network_node(&format!("net{}", i));
                writer
                    .commit(move |r| {
                        r.resources
                            .insert(node.id.clone(), ResourceRecord::pending(&node));
                    })
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let on_disk = store.load("lab").unwrap().unwrap();
        assert_eq!(on_disk.resources.len(), 16);
        assert!(on_disk
            .resources
            .values()
            .all(|r| r.status == ResourceStatus::Pending));
    }

    #[tokio::test]
    async fn test_remove_if_empty() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        let writer = StateWriter::new(store.clone(), LifecycleRecord::new("lab", "h"));
        let node = network_node("mgmt");
        writer
            .commit(|r| {
                r.resources
                    .insert(node.id.clone(), ResourceRecord::pending(&node));
            })
            .await
            .unwrap();
        assert!(!writer.remove_if_empty().await.unwrap());

        writer.commit(|r| r.resources.clear()).await.unwrap();
        assert!(writer.remove_if_empty().await.unwrap());
        assert!(store.load("lab").unwrap().is_none());
    }
}

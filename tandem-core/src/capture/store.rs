//! Durable storage for captured entries.
//!
//! ```text
//!  capture hook ──► PersistQueue ──(mpsc, in order)──► persistence task ──► OpStore
//!                        │                                    │
//!                        └──── EntryId → StoreKey map ◄───────┘ (filled when appends land)
//! ```
//!
//! Commands are handled strictly in order. A removal queued while the
//! entry's append is still in flight runs after the append and uses the
//! key it produced, so no record is orphaned.

use futures_util::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use super::entry::EntryId;
use crate::error::{CaptureError, StoreError};

/// Key of one persisted entry, assigned by the store on append.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StoreKey(pub u64);

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Keyed append/update/remove storage for serialized entries.
///
/// Keys must increase with append order so `load_all` can return entries
/// in log order.
pub trait OpStore: Send + Sync + 'static {
    fn append(&self, entry: Vec<u8>) -> BoxFuture<'static, Result<StoreKey, StoreError>>;
    fn update(&self, key: StoreKey, entry: Vec<u8>) -> BoxFuture<'static, Result<(), StoreError>>;
    fn remove(&self, keys: Vec<StoreKey>) -> BoxFuture<'static, Result<(), StoreError>>;
    fn clear(&self) -> BoxFuture<'static, Result<(), StoreError>>;
    /// Every record, ordered by key.
    fn load_all(&self) -> BoxFuture<'static, Result<Vec<(StoreKey, Vec<u8>)>, StoreError>>;
}

/// In-memory `OpStore`. Cloning shares the records.
#[derive(Debug, Clone, Default)]
pub struct MemoryOpStore {
    inner: Arc<Mutex<MemoryRecords>>,
}

#[derive(Debug, Default)]
struct MemoryRecords {
    next_key: u64,
    records: BTreeMap<StoreKey, Vec<u8>>,
}

impl MemoryOpStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().records.is_empty()
    }

    pub fn get(&self, key: StoreKey) -> Option<Vec<u8>> {
        self.inner.lock().records.get(&key).cloned()
    }
}

impl OpStore for MemoryOpStore {
    fn append(&self, entry: Vec<u8>) -> BoxFuture<'static, Result<StoreKey, StoreError>> {
        let inner = self.inner.clone();
        async move {
            let mut records = inner.lock();
            let key = StoreKey(records.next_key);
            records.next_key += 1;
            records.records.insert(key, entry);
            Ok(key)
        }
        .boxed()
    }

    fn update(&self, key: StoreKey, entry: Vec<u8>) -> BoxFuture<'static, Result<(), StoreError>> {
        let inner = self.inner.clone();
        async move {
            let mut records = inner.lock();
            match records.records.get_mut(&key) {
                Some(slot) => {
                    *slot = entry;
                    Ok(())
                }
                None => Err(StoreError::NotFound(key.0)),
            }
        }
        .boxed()
    }

    fn remove(&self, keys: Vec<StoreKey>) -> BoxFuture<'static, Result<(), StoreError>> {
        let inner = self.inner.clone();
        async move {
            let mut records = inner.lock();
            for key in keys {
                records.records.remove(&key);
            }
            Ok(())
        }
        .boxed()
    }

    fn clear(&self) -> BoxFuture<'static, Result<(), StoreError>> {
        let inner = self.inner.clone();
        async move {
            inner.lock().records.clear();
            Ok(())
        }
        .boxed()
    }

    fn load_all(&self) -> BoxFuture<'static, Result<Vec<(StoreKey, Vec<u8>)>, StoreError>> {
        let inner = self.inner.clone();
        async move {
            Ok(inner
                .lock()
                .records
                .iter()
                .map(|(k, v)| (*k, v.clone()))
                .collect())
        }
        .boxed()
    }
}

enum PersistCommand {
    Append { id: EntryId, bytes: Vec<u8> },
    Update { id: EntryId, bytes: Vec<u8> },
    Remove { ids: Vec<EntryId> },
    Clear,
    Flush(oneshot::Sender<()>),
}

type KeyMap = Arc<Mutex<HashMap<EntryId, StoreKey>>>;

/// Handle to the persistence task.
pub(crate) struct PersistQueue {
    tx: mpsc::UnboundedSender<PersistCommand>,
    keys: KeyMap,
    store: Arc<dyn OpStore>,
}

impl PersistQueue {
    /// Spawn the persistence task on the current tokio runtime.
    pub(crate) fn spawn(store: Arc<dyn OpStore>) -> Result<Self, CaptureError> {
        let handle = tokio::runtime::Handle::try_current().map_err(|_| CaptureError::NoRuntime)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let keys: KeyMap = Arc::new(Mutex::new(HashMap::new()));
        handle.spawn(run_persistence(store.clone(), rx, keys.clone()));
        Ok(Self { tx, keys, store })
    }

    pub(crate) fn store(&self) -> &Arc<dyn OpStore> {
        &self.store
    }

    pub(crate) fn append(&self, id: EntryId, bytes: Vec<u8>) {
        self.send(PersistCommand::Append { id, bytes });
    }

    pub(crate) fn update(&self, id: EntryId, bytes: Vec<u8>) {
        self.send(PersistCommand::Update { id, bytes });
    }

    pub(crate) fn remove(&self, ids: Vec<EntryId>) {
        if !ids.is_empty() {
            self.send(PersistCommand::Remove { ids });
        }
    }

    pub(crate) fn clear(&self) {
        self.send(PersistCommand::Clear);
    }

    /// Wait until every command queued so far has been handled.
    pub(crate) async fn flush(&self) -> Result<(), CaptureError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(PersistCommand::Flush(done_tx))
            .map_err(|_| CaptureError::PersistenceClosed)?;
        done_rx.await.map_err(|_| CaptureError::PersistenceClosed)
    }

    pub(crate) fn key(&self, id: EntryId) -> Option<StoreKey> {
        self.keys.lock().get(&id).copied()
    }

    /// Bind an entry restored from the store to its existing record.
    pub(crate) fn adopt(&self, id: EntryId, key: StoreKey) {
        self.keys.lock().insert(id, key);
    }

    fn send(&self, command: PersistCommand) {
        if self.tx.send(command).is_err() {
            log::error!("Persistence task stopped; dropping write");
        }
    }
}

async fn run_persistence(
    store: Arc<dyn OpStore>,
    mut rx: mpsc::UnboundedReceiver<PersistCommand>,
    keys: KeyMap,
) {
    while let Some(command) = rx.recv().await {
        match command {
            PersistCommand::Append { id, bytes } => append(&store, &keys, id, bytes).await,
            PersistCommand::Update { id, bytes } => {
                let key = keys.lock().get(&id).copied();
                match key {
                    Some(key) => {
                        if let Err(e) = store.update(key, bytes).await {
                            log::error!("Failed to update {id} at key {key}: {e}");
                        }
                    }
                    // The append failed earlier; try again with the newer content.
                    None => append(&store, &keys, id, bytes).await,
                }
            }
            PersistCommand::Remove { ids } => {
                let removed: Vec<StoreKey> = {
                    let mut keys = keys.lock();
                    ids.iter().filter_map(|id| keys.remove(id)).collect()
                };
                if removed.is_empty() {
                    continue;
                }
                if let Err(e) = store.remove(removed).await {
                    log::error!("Failed to remove persisted entries: {e}");
                }
            }
            PersistCommand::Clear => {
                keys.lock().clear();
                if let Err(e) = store.clear().await {
                    log::error!("Failed to clear persisted entries: {e}");
                }
            }
            PersistCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    log::debug!("Persistence queue closed");
}

async fn append(store: &Arc<dyn OpStore>, keys: &KeyMap, id: EntryId, bytes: Vec<u8>) {
    match store.append(bytes).await {
        Ok(key) => {
            log::trace!("Persisted {id} at key {key}");
            keys.lock().insert(id, key);
        }
        Err(e) => log::error!("Failed to persist {id}: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_remove_waits_for_pending_append() {
        let store = MemoryOpStore::new();
        let queue = PersistQueue::spawn(Arc::new(store.clone())).unwrap();

        queue.append(EntryId(1), vec![1]);
        queue.remove(vec![EntryId(1)]);
        queue.flush().await.unwrap();

        assert!(store.is_empty());
        assert_eq!(queue.key(EntryId(1)), None);
    }

    #[tokio::test]
    async fn test_update_rewrites_record() {
        let store = MemoryOpStore::new();
        let queue = PersistQueue::spawn(Arc::new(store.clone())).unwrap();

        queue.append(EntryId(3), vec![1]);
        queue.update(EntryId(3), vec![2, 2]);
        queue.flush().await.unwrap();

        let key = queue.key(EntryId(3)).unwrap();
        assert_eq!(store.get(key), Some(vec![2, 2]));
    }

    #[tokio::test]
    async fn test_clear_and_load_all_order() {
        let store = MemoryOpStore::new();
        let queue = PersistQueue::spawn(Arc::new(store.clone())).unwrap();
        for i in 0..3 {
            queue.append(EntryId(i), vec![i as u8]);
        }
        queue.flush().await.unwrap();

        let all = store.load_all().await.unwrap();
        let bodies: Vec<_> = all.into_iter().map(|(_, v)| v).collect();
        assert_eq!(bodies, vec![vec![0], vec![1], vec![2]]);

        queue.clear();
        queue.flush().await.unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_spawn_outside_runtime_fails() {
        let result = PersistQueue::spawn(Arc::new(MemoryOpStore::new()));
        assert!(matches!(result, Err(CaptureError::NoRuntime)));
    }
}

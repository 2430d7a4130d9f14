//! Deferred persistence for `persist.media.*` criteria.
//!
//! Writes are debounced: the first scheduled change arms a timer and every
//! change landing inside the window is coalesced, keyed per criterion so
//! concurrent updates to different criteria all reach the store.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Key-value backend holding persisted criterion values.
pub trait KvStore: Send + Sync {
    fn load(&self, key: &str) -> Option<i32>;
    fn store(&self, key: &str, value: i32);
}

/// In-memory store for tests and diskless deployments.
#[derive(Default)]
pub struct MemoryStore {
    map: Mutex<HashMap<String, i32>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryStore {
    fn load(&self, key: &str) -> Option<i32> {
        self.map.lock().get(key).copied()
    }

    fn store(&self, key: &str, value: i32) {
        self.map.lock().insert(key.to_string(), value);
    }
}

/// JSON-file backed store. The whole map is rewritten on every store; the
/// debounce layer keeps that cheap.
pub struct JsonFileStore {
    path: PathBuf,
    map: Mutex<HashMap<String, i32>>,
}

impl JsonFileStore {
    pub fn open(path: PathBuf) -> Self {
        let map = std::fs::read_to_string(&path)
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or_default();
        Self { path, map: Mutex::new(map) }
    }
}

impl KvStore for JsonFileStore {
    fn load(&self, key: &str) -> Option<i32> {
        self.map.lock().get(key).copied()
    }

    fn store(&self, key: &str, value: i32) {
        let snapshot = {
            let mut map = self.map.lock();
            map.insert(key.to_string(), value);
            map.clone()
        };
        match serde_json::to_string_pretty(&snapshot) {
            Ok(text) => {
                if let Err(err) = std::fs::write(&self.path, text) {
                    log::warn!("[Policy] persist write failed: {err}");
                }
            }
            Err(err) => log::warn!("[Policy] persist encode failed: {err}"),
        }
    }
}

/// Debounced writer in front of a [`KvStore`].
pub struct PersistScheduler {
    store: Arc<dyn KvStore>,
    pending: Arc<Mutex<HashMap<String, i32>>>,
    kick: Option<mpsc::UnboundedSender<()>>,
}

impl PersistScheduler {
    /// Spawns the debounce task. Must run inside a tokio runtime.
    pub fn new(store: Arc<dyn KvStore>, delay: Duration) -> Self {
        let pending: Arc<Mutex<HashMap<String, i32>>> = Arc::new(Mutex::new(HashMap::new()));
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        let task_store = store.clone();
        let task_pending = pending.clone();
        tokio::spawn(async move {
            while rx.recv().await.is_some() {
                tokio::time::sleep(delay).await;
                // Collapse kicks that accumulated inside the window.
                while rx.try_recv().is_ok() {}
                let drained: Vec<(String, i32)> =
                    task_pending.lock().drain().collect();
                for (key, value) in drained {
                    task_store.store(&key, value);
                }
            }
        });
        Self { store, pending, kick: Some(tx) }
    }

    /// Scheduler without a background task; writes happen on [`flush`].
    /// Used by tests and by synchronous shutdown paths.
    ///
    /// [`flush`]: Self::flush
    pub fn new_inline(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            pending: Arc::new(Mutex::new(HashMap::new())),
            kick: None,
        }
    }

    /// Records a pending save for `key`, arming the debounce timer.
    pub fn schedule(&self, key: &str, value: i32) {
        self.pending.lock().insert(key.to_string(), value);
        if let Some(kick) = &self.kick {
            let _ = kick.send(());
        }
    }

    /// Synchronously writes out everything still pending.
    pub fn flush(&self) {
        let drained: Vec<(String, i32)> = self.pending.lock().drain().collect();
        for (key, value) in drained {
            self.store.store(&key, value);
        }
    }

    /// The backing store, for startup reloads.
    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_round_trips() {
        let store = MemoryStore::new();
        assert_eq!(store.load("persist.media.x"), None);
        store.store("persist.media.x", 4);
        assert_eq!(store.load("persist.media.x"), Some(4));
    }

    #[test]
    fn json_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("persist.json");
        {
            let store = JsonFileStore::open(path.clone());
            store.store("persist.media.Volume", 7);
            store.store("persist.media.MuteMode", 1);
        }
        let store = JsonFileStore::open(path);
        assert_eq!(store.load("persist.media.Volume"), Some(7));
        assert_eq!(store.load("persist.media.MuteMode"), Some(1));
    }

    #[test]
    fn json_file_store_ignores_corrupt_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("persist.json");
        std::fs::write(&path, "{{ not json").unwrap();
        let store = JsonFileStore::open(path);
        assert_eq!(store.load("anything"), None);
    }

    #[test]
    fn two_criteria_in_one_window_both_land() {
        let store = Arc::new(MemoryStore::new());
        let scheduler = PersistScheduler::new_inline(store.clone());
        scheduler.schedule("persist.media.Volume", 3);
        scheduler.schedule("persist.media.MuteMode", 1);
        scheduler.schedule("persist.media.Volume", 4);
        scheduler.flush();
        assert_eq!(store.load("persist.media.Volume"), Some(4));
        assert_eq!(store.load("persist.media.MuteMode"), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn background_task_writes_after_the_delay() {
        let store = Arc::new(MemoryStore::new());
        let scheduler = PersistScheduler::new(store.clone(), Duration::from_secs(1));

        scheduler.schedule("persist.media.Volume", 6);
        // Nothing lands before the debounce window elapses.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.load("persist.media.Volume"), None);

        tokio::time::sleep(Duration::from_millis(1200)).await;
        tokio::task::yield_now().await;
        assert_eq!(store.load("persist.media.Volume"), Some(6));
    }
}

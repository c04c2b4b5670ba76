//! Batch bookkeeping for transfers that share a destination directory.
//!
//! Every task writing into the same destination joins one group. The group's
//! side effects run once, after its last member reports back: the directory
//! listing cache is invalidated, refresh payloads are honored, and move
//! sources are removed, but only if every member succeeded.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use ahash::{AHashMap, AHashSet};
use tracing::{debug, info, warn};

use crate::core::Context;
use crate::driver::{CacheInvalidator, StorageManager, clean_path, parent_path};

const SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);
const STALE_AFTER: Duration = Duration::from_secs(60 * 60);

/// Side effect attached to a batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    /// Removed once the whole batch succeeded.
    SrcPathToRemove(String),
    /// Listing refreshed when the batch settles, whatever the outcome.
    DstPathToRefresh(String),
}

struct Batch {
    pending: AHashSet<String>,
    payloads: Vec<Payload>,
    failed: bool,
    last_activity: Instant,
}

impl Batch {
    fn new(now: Instant) -> Self {
        Self {
            pending: AHashSet::new(),
            payloads: Vec::new(),
            failed: false,
            last_activity: now,
        }
    }
}

struct Inner {
    groups: AHashMap<String, Batch>,
    last_sweep: Instant,
}

pub struct TransferCoordinator {
    name: String,
    storages: Arc<StorageManager>,
    invalidator: Arc<dyn CacheInvalidator>,
    inner: Mutex<Inner>,
}

impl TransferCoordinator {
    pub fn new(
        name: impl Into<String>,
        storages: Arc<StorageManager>,
        invalidator: Arc<dyn CacheInvalidator>,
    ) -> Self {
        Self {
            name: name.into(),
            storages,
            invalidator,
            inner: Mutex::new(Inner {
                groups: AHashMap::new(),
                last_sweep: Instant::now(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers `task_id` as a pending member of `group`. Registering the same
    /// task twice is a no-op, payload included.
    pub fn add_task(&self, group: &str, task_id: &str, payload: Option<Payload>) {
        let now = Instant::now();
        let group = clean_path(group);
        let mut inner = self.lock();
        self.sweep_if_due(&mut inner, now);

        let batch = inner
            .groups
            .entry(group.clone())
            .or_insert_with(|| Batch::new(now));
        batch.last_activity = now;
        if !batch.pending.insert(task_id.to_string()) {
            debug!(coordinator = %self.name, group = %group, task_id, "task already registered");
            return;
        }
        if let Some(payload) = payload {
            batch.payloads.push(payload);
        }
    }

    /// Attaches a payload to a live group. Payloads for unknown groups are dropped.
    pub fn append_payload(&self, group: &str, payload: Payload) {
        let group = clean_path(group);
        let mut inner = self.lock();
        match inner.groups.get_mut(&group) {
            Some(batch) => {
                batch.payloads.push(payload);
                batch.last_activity = Instant::now();
            }
            None => warn!(coordinator = %self.name, group = %group, ?payload, "payload for unknown batch dropped"),
        }
    }

    /// Reports a member's final outcome. The last report settles the batch.
    pub fn done(&self, group: &str, task_id: &str, success: bool) {
        let group = clean_path(group);
        let settled = {
            let mut inner = self.lock();
            let Some(batch) = inner.groups.get_mut(&group) else {
                return;
            };
            if !batch.pending.remove(task_id) {
                return;
            }
            batch.failed |= !success;
            batch.last_activity = Instant::now();
            if !batch.pending.is_empty() {
                return;
            }
            inner.groups.remove(&group)
        };

        if let Some(batch) = settled {
            self.settle(&group, batch);
        }
    }

    fn settle(&self, group: &str, batch: Batch) {
        let success = !batch.failed;
        info!(coordinator = %self.name, group, success, payloads = batch.payloads.len(), "transfer batch settled");
        self.invalidate(group);
        for payload in batch.payloads {
            match payload {
                Payload::DstPathToRefresh(path) => self.invalidate(&path),
                Payload::SrcPathToRemove(path) if success => self.remove(&path),
                Payload::SrcPathToRemove(path) => {
                    debug!(coordinator = %self.name, path = %path, "batch failed, keeping move source");
                }
            }
        }
    }

    fn invalidate(&self, path: &str) {
        match self.storages.get_storage_and_actual_path(path) {
            Ok((storage, actual)) => self.invalidator.clear_cache(storage.as_ref(), &actual),
            Err(e) => debug!(coordinator = %self.name, path, error = %e, "skip cache refresh"),
        }
    }

    fn remove(&self, path: &str) {
        let (storage, actual) = match self.storages.get_storage_and_actual_path(path) {
            Ok(found) => found,
            Err(e) => {
                warn!(coordinator = %self.name, path, error = %e, "failed to resolve move source");
                return;
            }
        };
        if let Err(e) = storage.remove(&Context::new(), &actual) {
            warn!(coordinator = %self.name, path, error = %e, "failed to remove move source");
        }
        self.invalidator.clear_cache(storage.as_ref(), &parent_path(&actual));
    }

    fn sweep_if_due(&self, inner: &mut Inner, now: Instant) {
        if now.saturating_duration_since(inner.last_sweep) > SWEEP_INTERVAL {
            self.sweep_locked(inner, now);
            inner.last_sweep = now;
        }
    }

    fn sweep_locked(&self, inner: &mut Inner, now: Instant) -> usize {
        let before = inner.groups.len();
        inner.groups.retain(|group, batch| {
            let stale = now.saturating_duration_since(batch.last_activity) > STALE_AFTER;
            if stale {
                warn!(
                    coordinator = %self.name,
                    group = %group,
                    pending = batch.pending.len(),
                    "dropping stale transfer batch"
                );
            }
            !stale
        });
        before - inner.groups.len()
    }

    /// Drops groups idle for over an hour as of `now`. Returns how many were dropped.
    pub fn sweep_stale(&self, now: Instant) -> usize {
        let mut inner = self.lock();
        let dropped = self.sweep_locked(&mut inner, now);
        inner.last_sweep = now;
        dropped
    }

    pub fn pending_task_count(&self) -> usize {
        self.lock().groups.values().map(|b| b.pending.len()).sum()
    }

    pub fn group_count(&self) -> usize {
        self.lock().groups.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::core::{FsError, Result};
    use crate::driver::Driver;
    use crate::model::{Link, LinkArgs, Obj};
    use crate::stream::FileStreamer;

    #[derive(Default)]
    struct Recorder {
        cleared: Mutex<Vec<String>>,
    }

    impl CacheInvalidator for Recorder {
        fn clear_cache(&self, storage: &dyn Driver, dir: &str) {
            self.cleared
                .lock()
                .unwrap()
                .push(format!("{}:{}", storage.mount_path(), dir));
        }
    }

    #[derive(Default)]
    struct Removals {
        removed: Mutex<Vec<String>>,
    }

    impl Driver for Removals {
        fn mount_path(&self) -> &str {
            "/src"
        }

        fn get(&self, _: &Context, path: &str) -> Result<Arc<dyn Obj>> {
            Err(FsError::ObjectNotFound(path.into()))
        }

        fn list(&self, _: &Context, _: &str) -> Result<Vec<Arc<dyn Obj>>> {
            Ok(Vec::new())
        }

        fn link(&self, _: &Context, _: &str, _: &LinkArgs) -> Result<Link> {
            Err(FsError::NotSupport)
        }

        fn make_dir(&self, _: &Context, _: &str) -> Result<()> {
            Ok(())
        }

        fn put(&self, _: &Context, _: &str, _: &mut dyn FileStreamer, _: &mut dyn FnMut(f64)) -> Result<()> {
            Err(FsError::NotSupport)
        }

        fn remove(&self, _: &Context, path: &str) -> Result<()> {
            self.removed.lock().unwrap().push(path.into());
            Ok(())
        }
    }

    struct DstDriver;

    impl Driver for DstDriver {
        fn mount_path(&self) -> &str {
            "/dst"
        }

        fn get(&self, _: &Context, path: &str) -> Result<Arc<dyn Obj>> {
            Err(FsError::ObjectNotFound(path.into()))
        }

        fn list(&self, _: &Context, _: &str) -> Result<Vec<Arc<dyn Obj>>> {
            Ok(Vec::new())
        }

        fn link(&self, _: &Context, _: &str, _: &LinkArgs) -> Result<Link> {
            Err(FsError::NotSupport)
        }

        fn make_dir(&self, _: &Context, _: &str) -> Result<()> {
            Ok(())
        }

        fn put(&self, _: &Context, _: &str, _: &mut dyn FileStreamer, _: &mut dyn FnMut(f64)) -> Result<()> {
            Ok(())
        }

        fn remove(&self, _: &Context, _: &str) -> Result<()> {
            Ok(())
        }
    }

    fn setup() -> (TransferCoordinator, Arc<Recorder>, Arc<Removals>) {
        let storages = Arc::new(StorageManager::new());
        let src = Arc::new(Removals::default());
        storages.register(src.clone());
        storages.register(Arc::new(DstDriver));
        let recorder = Arc::new(Recorder::default());
        let coordinator = TransferCoordinator::new("test", storages, recorder.clone());
        (coordinator, recorder, src)
    }

    #[test]
    fn refresh_fires_once_after_last_member() {
        let (coordinator, recorder, _) = setup();
        for id in ["a", "b", "c"] {
            coordinator.add_task("/dst/dir", id, None);
        }
        coordinator.done("/dst/dir", "b", true);
        coordinator.done("/dst/dir", "a", true);
        assert!(recorder.cleared.lock().unwrap().is_empty());

        coordinator.done("/dst/dir", "c", true);
        assert_eq!(*recorder.cleared.lock().unwrap(), vec!["/dst:/dir".to_string()]);
        assert_eq!(coordinator.group_count(), 0);

        coordinator.done("/dst/dir", "c", true);
        assert_eq!(recorder.cleared.lock().unwrap().len(), 1);
    }

    #[test]
    fn duplicate_registration_is_idempotent() {
        let (coordinator, _, src) = setup();
        coordinator.add_task("/dst/dir", "a", Some(Payload::SrcPathToRemove("/src/x".into())));
        coordinator.add_task("/dst/dir", "a", Some(Payload::SrcPathToRemove("/src/x".into())));
        assert_eq!(coordinator.pending_task_count(), 1);
        coordinator.done("/dst/dir", "a", true);
        assert_eq!(*src.removed.lock().unwrap(), vec!["/x".to_string()]);
    }

    #[test]
    fn failed_member_keeps_sources_but_refreshes() {
        let (coordinator, recorder, src) = setup();
        coordinator.add_task("/dst/dir", "a", Some(Payload::SrcPathToRemove("/src/a".into())));
        coordinator.add_task("/dst/dir", "b", Some(Payload::SrcPathToRemove("/src/b".into())));
        coordinator.append_payload("/dst/dir", Payload::DstPathToRefresh("/dst/dir/sub".into()));
        coordinator.done("/dst/dir", "a", false);
        coordinator.done("/dst/dir", "b", true);

        assert!(src.removed.lock().unwrap().is_empty());
        assert_eq!(
            *recorder.cleared.lock().unwrap(),
            vec!["/dst:/dir".to_string(), "/dst:/dir/sub".to_string()]
        );
    }

    #[test]
    fn stale_groups_are_swept() {
        let (coordinator, recorder, _) = setup();
        coordinator.add_task("/dst/old", "a", None);
        assert_eq!(coordinator.sweep_stale(Instant::now()), 0);
        assert_eq!(coordinator.sweep_stale(Instant::now() + Duration::from_secs(2 * 3600)), 1);
        assert_eq!(coordinator.group_count(), 0);
        assert_eq!(coordinator.pending_task_count(), 0);

        coordinator.done("/dst/old", "a", true);
        assert!(recorder.cleared.lock().unwrap().is_empty());
    }
}

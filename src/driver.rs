use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::core::{Context, FsError, Result};
use crate::model::{Link, LinkArgs, Obj};
use crate::stream::FileStreamer;

/// A mounted storage backend. Paths handed to a driver are actual paths,
/// relative to its own root and always starting with `/`.
pub trait Driver: Send + Sync {
    fn mount_path(&self) -> &str;

    fn get(&self, ctx: &Context, path: &str) -> Result<Arc<dyn Obj>>;

    fn list(&self, ctx: &Context, dir: &str) -> Result<Vec<Arc<dyn Obj>>>;

    fn link(&self, ctx: &Context, path: &str, args: &LinkArgs) -> Result<Link>;

    /// Creates `path` and any missing parents.
    fn make_dir(&self, ctx: &Context, path: &str) -> Result<()>;

    /// Uploads `stream` as `<dst_dir>/<stream obj name>`, creating `dst_dir`
    /// when missing. `progress` receives percentages in `0..=100`.
    fn put(
        &self,
        ctx: &Context,
        dst_dir: &str,
        stream: &mut dyn FileStreamer,
        progress: &mut dyn FnMut(f64),
    ) -> Result<()>;

    fn remove(&self, ctx: &Context, path: &str) -> Result<()>;

    /// Same-storage copy/move, for backends that can do it without streaming.
    fn native_transfer(&self) -> Option<&dyn NativeTransfer> {
        None
    }
}

/// Optional capability; return `FsError::NotImplement` or `FsError::NotSupport`
/// to fall back to a streamed transfer.
pub trait NativeTransfer: Send + Sync {
    fn copy(&self, ctx: &Context, src: &str, dst_dir: &str) -> Result<()>;

    fn move_to(&self, ctx: &Context, src: &str, dst_dir: &str) -> Result<()>;
}

/// Invalidates cached directory listings after writes land.
pub trait CacheInvalidator: Send + Sync {
    fn clear_cache(&self, storage: &dyn Driver, dir: &str);
}

/// Mounted storages keyed by their mount path.
#[derive(Default)]
pub struct StorageManager {
    storages: DashMap<String, Arc<dyn Driver>>,
}

impl StorageManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mounts `driver`, replacing any storage already at its mount path.
    pub fn register(&self, driver: Arc<dyn Driver>) {
        let mount_path = clean_path(driver.mount_path());
        debug!(mount_path = %mount_path, "storage registered");
        self.storages.insert(mount_path, driver);
    }

    pub fn unregister(&self, mount_path: &str) -> Option<Arc<dyn Driver>> {
        self.storages.remove(&clean_path(mount_path)).map(|(_, d)| d)
    }

    pub fn len(&self) -> usize {
        self.storages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storages.is_empty()
    }

    pub fn get_by_mount_path(&self, mount_path: &str) -> Result<Arc<dyn Driver>> {
        let mount_path = clean_path(mount_path);
        self.storages
            .get(&mount_path)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(FsError::StorageNotFound(mount_path))
    }

    /// Resolves a virtual path to the storage with the longest matching mount
    /// path and the path relative to that storage.
    pub fn get_storage_and_actual_path(&self, raw_path: &str) -> Result<(Arc<dyn Driver>, String)> {
        let path = clean_path(raw_path);
        let mut best: Option<(usize, Arc<dyn Driver>)> = None;
        for entry in self.storages.iter() {
            let mount_path = entry.key();
            if !is_under(&path, mount_path) {
                continue;
            }
            if best.as_ref().is_none_or(|(len, _)| mount_path.len() > *len) {
                best = Some((mount_path.len(), Arc::clone(entry.value())));
            }
        }
        let (len, driver) = best.ok_or_else(|| FsError::StorageNotFound(path.clone()))?;
        let actual = if len == 1 {
            path
        } else {
            clean_path(&path[len..])
        };
        Ok((driver, actual))
    }
}

fn is_under(path: &str, mount_path: &str) -> bool {
    if mount_path == "/" {
        return true;
    }
    match path.strip_prefix(mount_path) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Normalizes to an absolute path: duplicate and trailing slashes are removed,
/// `.` and `..` segments resolved.
pub fn clean_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            part => parts.push(part),
        }
    }
    format!("/{}", parts.join("/"))
}

pub fn join_path(base: &str, name: &str) -> String {
    clean_path(&format!("{base}/{name}"))
}

/// Parent directory of a cleaned path; `/` is its own parent.
pub fn parent_path(path: &str) -> String {
    let path = clean_path(path);
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
    }
}

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::core::{Closer, FsError, ReadAt, Result};
use crate::range::RangeReader;

/// Content digests keyed by hash type name (`"md5"`, `"sha1"`, ...).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HashInfo {
    hashes: BTreeMap<String, String>,
}

impl HashInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, kind: impl Into<String>, digest: impl Into<String>) -> Self {
        self.hashes.insert(kind.into(), digest.into());
        self
    }

    pub fn get(&self, kind: &str) -> Option<&str> {
        self.hashes.get(kind).map(String::as_str)
    }

    pub fn export(&self) -> &BTreeMap<String, String> {
        &self.hashes
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }
}

/// Metadata handle for a remote file or directory.
pub trait Obj: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;
    fn size(&self) -> u64;
    fn mod_time(&self) -> SystemTime;
    fn hash(&self) -> &HashInfo;
    fn id(&self) -> &str;
    fn is_dir(&self) -> bool;
}

/// Plain listing snapshot; drivers return these.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjInfo {
    pub id: String,
    pub name: String,
    pub size: u64,
    pub modified: SystemTime,
    pub hash: HashInfo,
    pub is_dir: bool,
}

impl ObjInfo {
    pub fn file(name: impl Into<String>, size: u64) -> Self {
        Self {
            id: String::new(),
            name: name.into(),
            size,
            modified: UNIX_EPOCH,
            hash: HashInfo::default(),
            is_dir: false,
        }
    }

    pub fn dir(name: impl Into<String>) -> Self {
        Self {
            is_dir: true,
            ..Self::file(name, 0)
        }
    }
}

impl Obj for ObjInfo {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn mod_time(&self) -> SystemTime {
        self.modified
    }

    fn hash(&self) -> &HashInfo {
        &self.hash
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn is_dir(&self) -> bool {
        self.is_dir
    }
}

/// Entity tag for an object: its largest digest, else `"<mtime hex>-<size hex>"`.
pub fn etag(obj: &dyn Obj) -> String {
    let best = obj.hash().export().values().max().filter(|v| !v.is_empty());
    if let Some(hash) = best {
        return format!("\"{hash}\"");
    }
    let secs = obj
        .mod_time()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    format!("\"{:x}-{:x}\"", secs, obj.size())
}

#[derive(Clone, Debug, Default)]
pub struct LinkArgs {
    pub ip: Option<String>,
    pub header: Vec<(String, String)>,
    pub redirect: bool,
}

type CloseHook = Box<dyn FnOnce() -> Result<()> + Send>;

/// Reference-counted close hook; the hook runs once, when the last owner closes.
pub struct SyncCloser {
    refs: AtomicUsize,
    hook: Mutex<Option<CloseHook>>,
}

impl SyncCloser {
    pub fn new<F>(hook: F) -> Arc<Self>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        Arc::new(Self {
            refs: AtomicUsize::new(1),
            hook: Mutex::new(Some(Box::new(hook))),
        })
    }

    pub fn acquire(&self) -> bool {
        let mut current = self.refs.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return false;
            }
            match self.refs.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn release(&self) -> Result<()> {
        let mut current = self.refs.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return Ok(());
            }
            match self.refs.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(1) => break,
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
        let hook = self
            .hook
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match hook {
            Some(hook) => hook(),
            None => Ok(()),
        }
    }

    pub fn refs(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }
}

/// Positional handle on local bytes attached to a link.
#[derive(Clone)]
pub struct MFile {
    pub reader: Arc<dyn ReadAt>,
    pub size: u64,
}

impl fmt::Debug for MFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MFile").field("size", &self.size).finish()
    }
}

/// Resolved access handle to an object's bytes.
#[derive(Default)]
pub struct Link {
    pub url: Option<String>,
    pub header: Vec<(String, String)>,
    pub range_reader: Option<Arc<dyn RangeReader>>,
    pub mfile: Option<MFile>,
    pub concurrency: usize,
    pub part_size: u64,
    pub content_length: Option<u64>,
    pub expiration: Option<Duration>,
    closer: Option<Arc<SyncCloser>>,
    closed: bool,
}

impl Link {
    pub fn from_url(url: impl Into<String>) -> Self {
        let mut link = Self::default();
        link.url = Some(url.into());
        link
    }

    pub fn from_range_reader(reader: Arc<dyn RangeReader>) -> Self {
        let mut link = Self::default();
        link.range_reader = Some(reader);
        link
    }

    pub fn from_mfile(reader: Arc<dyn ReadAt>, size: u64) -> Self {
        let mut link = Self::default();
        link.mfile = Some(MFile { reader, size });
        link.content_length = Some(size);
        link
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.header.push((name.into(), value.into()));
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize, part_size: u64) -> Self {
        self.concurrency = concurrency;
        self.part_size = part_size;
        self
    }

    pub fn with_content_length(mut self, size: u64) -> Self {
        self.content_length = Some(size);
        self
    }

    pub fn with_closer(mut self, closer: Arc<SyncCloser>) -> Self {
        self.closer = Some(closer);
        self
    }

    /// Another owner of the same underlying connection. `None` once it was released.
    pub fn acquire(&self) -> Option<Link> {
        if let Some(closer) = &self.closer
            && !closer.acquire()
        {
            return None;
        }
        Some(Link {
            url: self.url.clone(),
            header: self.header.clone(),
            range_reader: self.range_reader.clone(),
            mfile: self.mfile.clone(),
            concurrency: self.concurrency,
            part_size: self.part_size,
            content_length: self.content_length,
            expiration: self.expiration,
            closer: self.closer.clone(),
            closed: false,
        })
    }

    pub fn wants_concurrency(&self) -> bool {
        self.concurrency > 0 || self.part_size > 0
    }

    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        match &self.closer {
            Some(closer) => closer.release(),
            None => Ok(()),
        }
    }
}

impl Closer for Link {
    fn close(&mut self) -> Result<()> {
        Link::close(self)
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("url", &self.url)
            .field("range_reader", &self.range_reader.is_some())
            .field("mfile", &self.mfile)
            .field("concurrency", &self.concurrency)
            .field("part_size", &self.part_size)
            .field("content_length", &self.content_length)
            .finish()
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

pub(crate) fn invalid_link(reason: &str) -> FsError {
    FsError::Protocol(format!("invalid link: {reason}"))
}

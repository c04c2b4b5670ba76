use std::io::{self, Read, Write};
use std::thread;
use std::time::Duration;

use sha2::Digest;
use tracing::debug;

use crate::core::{Context, Result};
use crate::stream::{CacheFile, FileStreamer};

// pause between polls of a source that is not ready yet
const WOULD_BLOCK_BACKOFF: Duration = Duration::from_millis(5);

/// Forward reader that stops as soon as its context is canceled.
///
/// A read that times out is retried for as long as the context stays live, so
/// slow sources are bounded by the caller's deadline rather than the socket's.
pub struct ReaderWithCtx<R> {
    inner: R,
    ctx: Context,
}

impl<R: Read> ReaderWithCtx<R> {
    pub fn new(inner: R, ctx: Context) -> Self {
        Self { inner, ctx }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for ReaderWithCtx<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            self.ctx.check()?;
            match self.inner.read(buf) {
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                    debug!(error = %e, "read timed out, retrying within context deadline");
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(WOULD_BLOCK_BACKOFF),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                other => return other,
            }
        }
    }
}

/// Reports percent progress of the wrapped reader against a known size.
pub struct ReaderUpdatingProgress<R, F> {
    inner: R,
    size: u64,
    offset: u64,
    last: f64,
    up: F,
}

impl<R, F> ReaderUpdatingProgress<R, F>
where
    R: Read,
    F: FnMut(f64),
{
    pub fn new(inner: R, size: u64, up: F) -> Self {
        Self {
            inner,
            size,
            offset: 0,
            last: 0.0,
            up,
        }
    }
}

impl<R, F> Read for ReaderUpdatingProgress<R, F>
where
    R: Read,
    F: FnMut(f64),
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.offset += n as u64;
        let percent = if self.size == 0 {
            100.0
        } else {
            (self.offset as f64 / self.size as f64 * 100.0).min(100.0)
        };
        // never report a step backwards
        if percent > self.last {
            self.last = percent;
            (self.up)(percent);
        }
        Ok(n)
    }
}

/// Forward reader that also knows the total size it will yield.
pub struct SimpleReaderWithSize<R> {
    inner: R,
    size: u64,
}

impl<R: Read> SimpleReaderWithSize<R> {
    pub fn new(inner: R, size: u64) -> Self {
        Self { inner, size }
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

impl<R: Read> Read for SimpleReaderWithSize<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

/// Writer adapter feeding a digest.
struct HashWriter<'a, D>(&'a mut D);

impl<D: Digest> Write for HashWriter<'_, D> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Caches the stream to a file and hashes it on the way through.
///
/// Returns the cache plus the lowercase hex digest. A stream that is already
/// cached is hashed from its file.
pub fn cache_full_and_hash<D: Digest>(
    stream: &mut dyn FileStreamer,
    progress: Option<&mut dyn FnMut(f64)>,
) -> Result<(CacheFile, String)> {
    let mut hasher = D::new();
    let file = {
        let mut writer = HashWriter(&mut hasher);
        stream.cache_full_and_writer(progress, Some(&mut writer))?
    };
    Ok((file, hex::encode(hasher.finalize())))
}

use std::fmt;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub const KB: u64 = 1024;
pub const MB: u64 = 1024 * KB;

const COPY_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum FsError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP status {0}")]
    HttpStatus(u16),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(io::Error),

    #[error("context canceled")]
    Canceled,

    #[error("context deadline exceeded")]
    DeadlineExceeded,

    #[error("not supported")]
    NotSupport,

    #[error("not implemented")]
    NotImplement,

    #[error("storage not found: {0}")]
    StorageNotFound(String),

    #[error("object not found: {0}")]
    ObjectNotFound(String),

    #[error("{}", join_messages(.0))]
    Multiple(Vec<FsError>),

    #[error("{message}: {source}")]
    WithMessage {
        message: String,
        #[source]
        source: Box<FsError>,
    },
}

fn join_messages(errors: &[FsError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

impl FsError {
    pub fn with_message(self, message: impl Into<String>) -> Self {
        FsError::WithMessage {
            message: message.into(),
            source: Box::new(self),
        }
    }

    /// Collapses a list of errors into `None`, the single error, or `Multiple`.
    pub fn join(mut errors: Vec<FsError>) -> Option<FsError> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(FsError::Multiple(errors)),
        }
    }

    pub fn is_canceled(&self) -> bool {
        match self {
            FsError::Canceled | FsError::DeadlineExceeded => true,
            FsError::WithMessage { source, .. } => source.is_canceled(),
            FsError::Multiple(errors) => errors.iter().any(FsError::is_canceled),
            _ => false,
        }
    }

    /// Errors the task layer may retry: remote failures and plain I/O.
    pub fn is_transient(&self) -> bool {
        match self {
            FsError::Network(_) | FsError::Io(_) => true,
            FsError::HttpStatus(code) => *code >= 500 || *code == 408 || *code == 429,
            FsError::WithMessage { source, .. } => source.is_transient(),
            _ => false,
        }
    }
}

impl From<io::Error> for FsError {
    fn from(err: io::Error) -> Self {
        if err.get_ref().is_some_and(|inner| inner.is::<FsError>()) {
            if let Some(inner) = err.into_inner()
                && let Ok(fs_err) = inner.downcast::<FsError>()
            {
                return *fs_err;
            }
            return FsError::Protocol("lost wrapped error".into());
        }
        FsError::Io(err)
    }
}

impl From<FsError> for io::Error {
    fn from(err: FsError) -> Self {
        match err {
            FsError::Io(e) => e,
            other => io::Error::other(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, FsError>;

/// Owned forward reader handed out by range readers and streams.
pub type BoxReader = Box<dyn Read + Send>;

/// Byte window of an object. `length == None` reads to the end.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct HttpRange {
    pub start: u64,
    pub length: Option<u64>,
}

impl HttpRange {
    pub fn new(start: u64, length: u64) -> Self {
        Self {
            start,
            length: Some(length),
        }
    }

    pub fn from_offset(start: u64) -> Self {
        Self {
            start,
            length: None,
        }
    }

    pub fn full() -> Self {
        Self::default()
    }

    /// Clamps the window so that `start + length` never exceeds `size`.
    pub fn clamp(self, size: u64) -> Self {
        let start = self.start.min(size);
        let max = size - start;
        let length = match self.length {
            Some(len) if len <= max => len,
            _ => max,
        };
        Self {
            start,
            length: Some(length),
        }
    }

    pub fn is_full(&self, size: u64) -> bool {
        self.start == 0 && self.length.is_none_or(|len| len >= size)
    }

    /// End offset (exclusive) if the window is bounded.
    pub fn end(&self) -> Option<u64> {
        self.length.map(|len| self.start.saturating_add(len))
    }

    /// Renders the value of a `Range` request header.
    pub fn header_value(&self) -> String {
        match self.length {
            Some(0) | None => format!("bytes={}-", self.start),
            Some(len) => format!("bytes={}-{}", self.start, self.start + len - 1),
        }
    }
}

/// Cancellation scope carried alongside every stream.
#[derive(Clone, Debug, Default)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(current) => current.min(deadline),
            None => deadline,
        });
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// A scope that is canceled with its parent but can be canceled on its own.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_done(&self) -> bool {
        self.check().is_err()
    }

    pub fn check(&self) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(FsError::Canceled);
        }
        if let Some(deadline) = self.deadline
            && Instant::now() >= deadline
        {
            return Err(FsError::DeadlineExceeded);
        }
        Ok(())
    }
}

/// Positional reads that never touch a shared cursor.
pub trait ReadAt: Send + Sync {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;
}

impl ReadAt for std::fs::File {
    #[cfg(unix)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        std::os::unix::fs::FileExt::read_at(self, buf, offset)
    }

    #[cfg(windows)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        std::os::windows::fs::FileExt::seek_read(self, buf, offset)
    }
}

impl ReadAt for [u8] {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let len = self.len() as u64;
        if offset >= len {
            return Ok(0);
        }
        let start = offset as usize;
        let n = buf.len().min(self.len() - start);
        buf[..n].copy_from_slice(&self[start..start + n]);
        Ok(n)
    }
}

impl ReadAt for Vec<u8> {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        self.as_slice().read_at(buf, offset)
    }
}

impl<T: ReadAt + ?Sized> ReadAt for Arc<T> {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        (**self).read_at(buf, offset)
    }
}

impl<T: ReadAt + ?Sized> ReadAt for Box<T> {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        (**self).read_at(buf, offset)
    }
}

pub(crate) fn write_all_at(file: &std::fs::File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    while !buf.is_empty() {
        #[cfg(unix)]
        let n = std::os::unix::fs::FileExt::write_at(file, buf, offset)?;
        #[cfg(windows)]
        let n = std::os::windows::fs::FileExt::seek_write(file, buf, offset)?;
        if n == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }
        buf = &buf[n..];
        offset += n as u64;
    }
    Ok(())
}

/// Bounded `Read + Seek` window over a positional reader.
pub struct SectionReader<R> {
    inner: R,
    base: u64,
    len: u64,
    pos: u64,
}

impl<R: ReadAt> SectionReader<R> {
    pub fn new(inner: R, base: u64, len: u64) -> Self {
        Self {
            inner,
            base,
            len,
            pos: 0,
        }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: ReadAt> ReadAt for SectionReader<R> {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        if offset >= self.len {
            return Ok(0);
        }
        let max = (self.len - offset).min(buf.len() as u64) as usize;
        self.inner.read_at(&mut buf[..max], self.base + offset)
    }
}

impl<R: ReadAt> Read for SectionReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = ReadAt::read_at(self, buf, self.pos)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl<R: ReadAt> Seek for SectionReader<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
            SeekFrom::End(delta) => self.len.checked_add_signed(delta),
        };
        let target = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "invalid seek: negative position")
        })?;
        self.pos = target;
        Ok(target)
    }
}

/// A release hook attached to a stream.
pub trait Closer: Send {
    fn close(&mut self) -> Result<()>;
}

struct CloseFn<F>(Option<F>);

impl<F> Closer for CloseFn<F>
where
    F: FnOnce() -> Result<()> + Send,
{
    fn close(&mut self) -> Result<()> {
        match self.0.take() {
            Some(f) => f(),
            None => Ok(()),
        }
    }
}

pub fn close_fn<F>(f: F) -> Box<dyn Closer>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    Box::new(CloseFn(Some(f)))
}

/// Ordered list of release hooks. Every hook runs on close even if an earlier one fails.
#[derive(Default)]
pub struct Closers {
    closers: Vec<Box<dyn Closer>>,
}

impl Closers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, closer: Box<dyn Closer>) {
        self.closers.push(closer);
    }

    pub fn len(&self) -> usize {
        self.closers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.closers.is_empty()
    }

    pub fn close(&mut self) -> Result<()> {
        let mut errors = Vec::new();
        for mut closer in self.closers.drain(..) {
            match closer.close() {
                Ok(()) => {}
                Err(FsError::Io(e)) if is_already_closed(&e) => {}
                Err(e) => errors.push(e),
            }
        }
        match FsError::join(errors) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Closers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Closers")
            .field("len", &self.closers.len())
            .finish()
    }
}

fn is_already_closed(err: &io::Error) -> bool {
    #[cfg(unix)]
    if err.raw_os_error() == Some(libc::EBADF) {
        return true;
    }
    err.kind() == io::ErrorKind::NotFound
}

/// Copies at most `limit` bytes (all remaining when `None`), checking `ctx` between chunks.
pub fn copy_with_ctx<R, W>(ctx: &Context, reader: &mut R, writer: &mut W, limit: Option<u64>) -> Result<u64>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut copied = 0u64;
    loop {
        ctx.check()?;
        let want = match limit {
            Some(limit) if copied >= limit => break,
            Some(limit) => ((limit - copied) as usize).min(buf.len()),
            None => buf.len(),
        };
        let n = match reader.read(&mut buf[..want]) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        writer.write_all(&buf[..n])?;
        copied += n as u64;
    }
    Ok(copied)
}

/// Reads into `buf` until at least `min` bytes arrived or the reader hit EOF.
pub fn read_at_least<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8], min: usize) -> io::Result<usize> {
    let min = min.min(buf.len());
    let mut n = 0;
    while n < min {
        match reader.read(&mut buf[n..]) {
            Ok(0) => break,
            Ok(read) => n += read,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(n)
}

pub(crate) fn retry_delay(base: Duration, max: Duration, attempt: usize) -> Duration {
    let shift = attempt.min(20);
    let mult = 1u32.checked_shl(shift as u32).unwrap_or(u32::MAX);
    let delay = base.checked_mul(mult).unwrap_or(max);
    if delay > max { max } else { delay }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_clamps_to_size() {
        assert_eq!(HttpRange::new(10, 100).clamp(50), HttpRange::new(10, 40));
        assert_eq!(HttpRange::from_offset(5).clamp(20), HttpRange::new(5, 15));
        assert_eq!(HttpRange::new(60, 10).clamp(50), HttpRange::new(50, 0));
        assert!(HttpRange::full().is_full(10));
        assert!(!HttpRange::new(0, 5).is_full(10));
    }

    #[test]
    fn range_header_value() {
        assert_eq!(HttpRange::new(0, 10).header_value(), "bytes=0-9");
        assert_eq!(HttpRange::from_offset(42).header_value(), "bytes=42-");
    }

    #[test]
    fn canceled_error_survives_io_round_trip() {
        let io_err: io::Error = FsError::Canceled.into();
        let back: FsError = io_err.into();
        assert!(back.is_canceled());

        let plain: FsError = io::Error::other("boom").into();
        assert!(matches!(plain, FsError::Io(_)));
        assert!(!plain.is_canceled());
    }

    #[test]
    fn context_cancel_and_deadline() {
        let ctx = Context::new();
        assert!(ctx.check().is_ok());
        let child = ctx.child();
        ctx.cancel();
        assert!(matches!(child.check(), Err(FsError::Canceled)));

        let expired = Context::new().with_deadline(Instant::now());
        assert!(matches!(expired.check(), Err(FsError::DeadlineExceeded)));
    }

    #[test]
    fn section_reader_bounds() {
        let data: Vec<u8> = (0..100u8).collect();
        let mut section = SectionReader::new(data, 10, 20);
        let mut out = Vec::new();
        section.read_to_end(&mut out).unwrap();
        assert_eq!(out, (10..30u8).collect::<Vec<_>>());

        section.seek(SeekFrom::Start(15)).unwrap();
        let mut tail = Vec::new();
        section.read_to_end(&mut tail).unwrap();
        assert_eq!(tail, (25..30u8).collect::<Vec<_>>());
        assert!(section.seek(SeekFrom::Current(-100)).is_err());
    }

    #[test]
    fn closers_run_all_and_join_errors() {
        let ran = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut closers = Closers::new();
        for fail in [true, false, true] {
            let ran = Arc::clone(&ran);
            closers.add(close_fn(move || {
                ran.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                if fail {
                    Err(FsError::Network("close failed".into()))
                } else {
                    Ok(())
                }
            }));
        }
        let err = closers.close().unwrap_err();
        assert!(matches!(err, FsError::Multiple(ref v) if v.len() == 2));
        assert_eq!(ran.load(std::sync::atomic::Ordering::SeqCst), 3);
        assert!(closers.close().is_ok());
    }

    #[test]
    fn copy_stops_on_cancel() {
        let ctx = Context::new();
        ctx.cancel();
        let mut src = io::Cursor::new(vec![1u8; 10]);
        let mut dst = Vec::new();
        let err = copy_with_ctx(&ctx, &mut src, &mut dst, None).unwrap_err();
        assert!(err.is_canceled());
    }

    #[test]
    fn copy_respects_limit() {
        let ctx = Context::new();
        let mut src = io::Cursor::new((0..200u8).collect::<Vec<_>>());
        let mut dst = Vec::new();
        assert_eq!(copy_with_ctx(&ctx, &mut src, &mut dst, Some(50)).unwrap(), 50);
        assert_eq!(dst.len(), 50);
    }
}

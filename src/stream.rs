//! Seekable, re-readable streams over one-shot readers and remote links.
//!
//! A [`FileStream`] wraps a forward reader and promotes itself through three
//! caching states as random access is requested:
//!
//! - no cache: reads go straight to the forward reader
//! - peek buffer: a bounded in-memory prefix (up to `max_buffer_limit`)
//! - full file: the whole object spooled to a temp file
//!
//! Promotion is monotonic. Once a temp file exists it answers every later range
//! read and is removed when the stream is closed.
//!
//! [`SeekableStream`] layers a [`RangeReader`] on top, so range reads hit the
//! remote object directly until a full file cache exists.
//!
//! Both types take `&mut self` for `read`, `range_read` and the caching calls:
//! a stream has one reader at a time. Use
//! [`RangeReadReadAtSeeker`](crate::read_at::RangeReadReadAtSeeker) for
//! concurrent positional reads.

use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;

use tempfile::TempPath;
use tracing::debug;

use crate::config::StreamEnv;
use crate::core::{BoxReader, Closer, Closers, Context, FsError, HttpRange, ReadAt, Result, SectionReader};
use crate::model::{Link, Obj};
use crate::range::{RangeReader, get_range_reader_from_link};
use crate::util::ReaderWithCtx;

const SPOOL_BUFFER_SIZE: usize = 64 * 1024;

/// Positional handle on a fully cached object.
#[derive(Clone)]
pub struct CacheFile {
    file: Arc<dyn ReadAt>,
    size: u64,
}

impl CacheFile {
    pub fn new(file: Arc<dyn ReadAt>, size: u64) -> Self {
        Self { file, size }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Sequential reader from offset 0.
    pub fn reader(&self) -> SectionReader<CacheFile> {
        SectionReader::new(self.clone(), 0, self.size)
    }

    pub fn section(&self, start: u64, length: u64) -> SectionReader<CacheFile> {
        SectionReader::new(self.clone(), start, length)
    }

    /// Whether both handles share the same backing storage.
    pub fn same(&self, other: &CacheFile) -> bool {
        Arc::ptr_eq(&self.file, &other.file)
    }
}

impl ReadAt for CacheFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        if offset >= self.size {
            return Ok(0);
        }
        let max = (self.size - offset).min(buf.len() as u64) as usize;
        self.file.read_at(&mut buf[..max], offset)
    }
}

impl fmt::Debug for CacheFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheFile").field("size", &self.size).finish()
    }
}

/// The single authoritative store for repeat reads.
enum Cache {
    None,
    Peek(Arc<[u8]>),
    File {
        file: CacheFile,
        // temp files are removed on close; supplied files are left alone
        temp: Option<TempPath>,
    },
}

/// Common surface of [`FileStream`] and [`SeekableStream`], consumed by drivers.
pub trait FileStreamer: Read + Send {
    fn obj(&self) -> &dyn Obj;
    fn ctx(&self) -> &Context;
    fn env(&self) -> &Arc<StreamEnv>;
    fn get_size(&self) -> u64;
    /// The full cache, if the stream has one.
    fn get_file(&self) -> Option<CacheFile>;
    fn range_read(&mut self, range: HttpRange) -> Result<BoxReader>;
    fn cache_full_and_writer(
        &mut self,
        progress: Option<&mut dyn FnMut(f64)>,
        writer: Option<&mut dyn Write>,
    ) -> Result<CacheFile>;
    fn add_closer(&mut self, closer: Box<dyn Closer>);
    fn close(&mut self) -> Result<()>;

    fn cache_full_in_temp_file(&mut self) -> Result<CacheFile> {
        self.cache_full_and_writer(None, None)
    }
}

pub struct FileStream {
    env: Arc<StreamEnv>,
    ctx: Context,
    obj: Arc<dyn Obj>,
    /// Object already present at the destination, if the upload overwrites one.
    pub exist: Option<Arc<dyn Obj>>,
    reader: Option<BoxReader>,
    // bytes consumed from `reader` since it last pointed at offset 0
    pos: u64,
    cache: Cache,
    closers: Closers,
}

impl FileStream {
    pub fn new(env: Arc<StreamEnv>, ctx: Context, obj: Arc<dyn Obj>) -> Self {
        Self {
            env,
            ctx,
            obj,
            exist: None,
            reader: None,
            pos: 0,
            cache: Cache::None,
            closers: Closers::new(),
        }
    }

    pub fn with_reader<R>(mut self, reader: R) -> Self
    where
        R: Read + Send + 'static,
    {
        self.reader = Some(Box::new(ReaderWithCtx::new(reader, self.ctx.clone())));
        self.pos = 0;
        self
    }

    /// Uses an already complete local copy as the stream's full cache.
    pub fn with_file(mut self, file: CacheFile) -> Self {
        self.reader = Some(Box::new(file.reader()));
        self.pos = 0;
        self.cache = Cache::File { file, temp: None };
        self
    }

    pub fn has_reader(&self) -> bool {
        self.reader.is_some()
    }

    pub fn is_peeked(&self) -> bool {
        matches!(self.cache, Cache::Peek(_))
    }

    fn set_reader(&mut self, reader: BoxReader) {
        self.reader = Some(reader);
        self.pos = 0;
    }

    fn forward_reader(&mut self) -> Result<&mut BoxReader> {
        if self.pos != 0 {
            return Err(FsError::Protocol(format!(
                "stream already consumed {} bytes, cannot buffer from start",
                self.pos
            )));
        }
        self.reader
            .as_mut()
            .ok_or_else(|| FsError::Protocol("stream has no reader".into()))
    }

    /// Buffers the first `len` bytes and splices them back in front of the reader.
    fn peek(&mut self, len: u64) -> Result<Arc<[u8]>> {
        let ctx = self.ctx.clone();
        let reader = self.forward_reader()?;
        let mut buf = vec![0u8; len as usize];
        let n = read_full(&ctx, reader, &mut buf)?;
        if n != buf.len() {
            return Err(FsError::Protocol(format!(
                "failed to read all data: (expect ={}, actual ={})",
                buf.len(),
                n
            )));
        }

        let peek: Arc<[u8]> = Arc::from(buf);
        let rest = self.reader.take().unwrap_or_else(crate::range::empty_reader);
        let head = io::Cursor::new(Arc::clone(&peek));
        self.set_reader(Box::new(head.chain(rest)));
        self.cache = Cache::Peek(Arc::clone(&peek));
        Ok(peek)
    }

    fn materialize(
        &mut self,
        expected: u64,
        progress: Option<&mut dyn FnMut(f64)>,
        writer: Option<&mut dyn Write>,
    ) -> Result<CacheFile> {
        let ctx = self.ctx.clone();
        let temp_dir = self.env.config().temp_dir.clone();
        let reader = self.forward_reader()?;

        let mut temp = tempfile::Builder::new()
            .prefix("file-")
            .tempfile_in(&temp_dir)?;
        let written = spool(&ctx, reader, temp.as_file_mut(), expected, progress, writer)?;
        if expected > 0 && written != expected {
            return Err(FsError::Protocol(format!(
                "create temp file failed, incoming stream actual size= {written}, expect = {expected}"
            )));
        }
        debug!(path = %temp.path().display(), size = written, "stream cached in temp file");

        let (file, path) = temp.into_parts();
        let cache = CacheFile::new(Arc::new(file), written);
        self.set_reader(Box::new(cache.reader()));
        self.cache = Cache::File {
            file: cache.clone(),
            temp: Some(path),
        };
        Ok(cache)
    }

    fn file_cache(&self) -> Option<CacheFile> {
        match &self.cache {
            Cache::File { file, .. } => Some(file.clone()),
            _ => None,
        }
    }

    fn replay_cache(
        &self,
        file: &CacheFile,
        progress: Option<&mut dyn FnMut(f64)>,
        writer: Option<&mut dyn Write>,
    ) -> Result<()> {
        if writer.is_none() && progress.is_none() {
            return Ok(());
        }
        let mut reader = file.reader();
        spool(&self.ctx, &mut reader, &mut io::sink(), file.size(), progress, writer)?;
        Ok(())
    }
}

impl Read for FileStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| FsError::Protocol("stream has no reader".into()))?;
        let n = reader.read(buf)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl FileStreamer for FileStream {
    fn obj(&self) -> &dyn Obj {
        self.obj.as_ref()
    }

    fn ctx(&self) -> &Context {
        &self.ctx
    }

    fn env(&self) -> &Arc<StreamEnv> {
        &self.env
    }

    /// On-disk size once materialized, the declared size before.
    fn get_size(&self) -> u64 {
        match &self.cache {
            Cache::File { file, .. } => file.size(),
            _ => self.obj.size(),
        }
    }

    fn get_file(&self) -> Option<CacheFile> {
        self.file_cache()
    }

    /// Serves a window from the cheapest store able to answer it: the full
    /// file, the current peek buffer, a freshly grown peek buffer while the
    /// window ends under the buffer limit, or a newly materialized temp file.
    fn range_read(&mut self, range: HttpRange) -> Result<BoxReader> {
        let size = self.get_size();
        let range = range.clamp(size);
        let (start, length) = (range.start, range.length.unwrap_or(0));

        if let Some(file) = self.file_cache() {
            return Ok(Box::new(file.section(start, length)));
        }

        let end = start + length;
        if let Cache::Peek(buf) = &self.cache
            && end <= buf.len() as u64
        {
            return Ok(Box::new(SectionReader::new(Arc::clone(buf), start, length)));
        }

        if end <= self.env.config().max_buffer_limit as u64 {
            let buf = self.peek(end.min(size))?;
            return Ok(Box::new(SectionReader::new(buf, start, length)));
        }

        let file = self.cache_full_in_temp_file()?;
        Ok(Box::new(file.section(start, length)))
    }

    /// Idempotent. Spools whatever the forward reader yields into a temp file,
    /// teeing into `writer` and reporting progress on the way.
    fn cache_full_and_writer(
        &mut self,
        progress: Option<&mut dyn FnMut(f64)>,
        writer: Option<&mut dyn Write>,
    ) -> Result<CacheFile> {
        if let Some(file) = self.file_cache() {
            self.replay_cache(&file, progress, writer)?;
            return Ok(file);
        }
        let expected = self.obj.size();
        self.materialize(expected, progress, writer)
    }

    fn add_closer(&mut self, closer: Box<dyn Closer>) {
        self.closers.add(closer);
    }

    /// Releases every attached closer and removes the temp file. Both are
    /// attempted; failures are joined.
    fn close(&mut self) -> Result<()> {
        let mut errors = Vec::new();
        self.reader = None;
        if let Err(e) = self.closers.close() {
            errors.push(e);
        }
        if let Cache::File {
            temp: Some(path), ..
        } = std::mem::replace(&mut self.cache, Cache::None)
        {
            let display = path.display().to_string();
            if let Err(e) = path.close()
                && e.kind() != io::ErrorKind::NotFound
            {
                errors.push(FsError::from(e).with_message(format!("failed to remove tmpFile [{display}]")));
            }
        }
        match FsError::join(errors) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for FileStream {
    fn drop(&mut self) {
        let _ = FileStreamer::close(self);
    }
}

impl fmt::Debug for FileStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cache = match &self.cache {
            Cache::None => "none",
            Cache::Peek(_) => "peek",
            Cache::File { .. } => "file",
        };
        f.debug_struct("FileStream")
            .field("obj", &self.obj)
            .field("pos", &self.pos)
            .field("cache", &cache)
            .field("closers", &self.closers)
            .finish_non_exhaustive()
    }
}

/// A [`FileStream`] with random access backed by a range reader or a cache file.
pub struct SeekableStream {
    fs: FileStream,
    range_reader: Option<Arc<dyn RangeReader>>,
    // snapshot taken from the link; its content length may disagree with the obj
    size: u64,
}

impl SeekableStream {
    /// Streams that already carry a reader are used as is; otherwise the link
    /// provides the bytes. Local links become the full cache right away; remote
    /// ones are opened on first read.
    ///
    /// The link is owned by the stream from here on and released on close.
    pub fn new(mut fs: FileStream, link: Option<Link>) -> Result<Self> {
        if fs.has_reader() {
            if let Some(link) = link {
                fs.add_closer(Box::new(link));
            }
            return Ok(Self {
                fs,
                range_reader: None,
                size: 0,
            });
        }

        let Some(link) = link else {
            return Err(FsError::Protocol(
                "illegal seekable stream: neither reader nor link".into(),
            ));
        };

        let size = link
            .content_length
            .filter(|&len| len > 0)
            .unwrap_or_else(|| fs.get_size());
        let range_reader = get_range_reader_from_link(&fs.env, size, &link)?;
        fs.add_closer(Box::new(link));

        if let Some(local) = range_reader.as_local() {
            fs = fs.with_file(local);
            return Ok(Self {
                fs,
                range_reader: None,
                size,
            });
        }

        Ok(Self {
            fs,
            range_reader: Some(range_reader),
            size,
        })
    }

    pub fn file_stream(&self) -> &FileStream {
        &self.fs
    }

    pub fn file_stream_mut(&mut self) -> &mut FileStream {
        &mut self.fs
    }

    /// Offset the next sequential `read` will return bytes from.
    pub fn position(&self) -> u64 {
        self.fs.pos
    }

    /// Range reader to use for positional reads that can bypass the stream, if
    /// no full cache exists yet.
    pub(crate) fn remote_range_reader(&self) -> Option<Arc<dyn RangeReader>> {
        if self.fs.file_cache().is_some() {
            return None;
        }
        self.range_reader.clone()
    }

    fn ensure_reader(&mut self) -> Result<()> {
        if self.fs.has_reader() {
            return Ok(());
        }
        let Some(range_reader) = &self.range_reader else {
            return Err(FsError::Protocol("illegal seekable stream".into()));
        };
        let reader = range_reader.range_read(&self.fs.ctx, HttpRange::full())?;
        self.fs.set_reader(reader);
        Ok(())
    }
}

impl Read for SeekableStream {
    /// Opens the full range on first use.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.ensure_reader()?;
        self.fs.read(buf)
    }
}

impl FileStreamer for SeekableStream {
    fn obj(&self) -> &dyn Obj {
        self.fs.obj()
    }

    fn ctx(&self) -> &Context {
        self.fs.ctx()
    }

    fn env(&self) -> &Arc<StreamEnv> {
        self.fs.env()
    }

    fn get_size(&self) -> u64 {
        if self.size > 0 {
            return self.size;
        }
        self.fs.get_size()
    }

    fn get_file(&self) -> Option<CacheFile> {
        self.fs.get_file()
    }

    fn range_read(&mut self, range: HttpRange) -> Result<BoxReader> {
        if let Some(range_reader) = self.remote_range_reader() {
            return range_reader.range_read(&self.fs.ctx, range);
        }
        self.fs.range_read(range)
    }

    fn cache_full_and_writer(
        &mut self,
        progress: Option<&mut dyn FnMut(f64)>,
        writer: Option<&mut dyn Write>,
    ) -> Result<CacheFile> {
        if let Some(file) = self.fs.file_cache() {
            self.fs.replay_cache(&file, progress, writer)?;
            return Ok(file);
        }
        self.ensure_reader()?;
        let expected = self.get_size();
        self.fs.materialize(expected, progress, writer)
    }

    fn add_closer(&mut self, closer: Box<dyn Closer>) {
        self.fs.add_closer(closer);
    }

    fn close(&mut self) -> Result<()> {
        self.range_reader = None;
        self.fs.close()
    }
}

impl fmt::Debug for SeekableStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SeekableStream")
            .field("fs", &self.fs)
            .field("remote", &self.range_reader.is_some())
            .field("size", &self.size)
            .finish()
    }
}

fn read_full<R: Read + ?Sized>(ctx: &Context, reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut n = 0;
    while n < buf.len() {
        ctx.check()?;
        match reader.read(&mut buf[n..]) {
            Ok(0) => break,
            Ok(read) => n += read,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(n)
}

/// Copies `reader` into `sink`, teeing into `writer` and reporting percent progress.
fn spool<R, W>(
    ctx: &Context,
    reader: &mut R,
    sink: &mut W,
    expected: u64,
    mut progress: Option<&mut dyn FnMut(f64)>,
    mut writer: Option<&mut dyn Write>,
) -> Result<u64>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let mut buf = vec![0u8; SPOOL_BUFFER_SIZE];
    let mut written = 0u64;
    loop {
        ctx.check()?;
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        sink.write_all(&buf[..n])?;
        if let Some(w) = writer.as_mut() {
            w.write_all(&buf[..n])?;
        }
        written += n as u64;
        if let Some(up) = progress.as_mut()
            && expected > 0
        {
            up((written as f64 / expected as f64 * 100.0).min(100.0));
        }
    }
    sink.flush()?;
    if let Some(up) = progress.as_mut() {
        up(100.0);
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::core::{MB, close_fn};
    use crate::model::ObjInfo;
    use crate::plug::{BlockingHttp, HttpResponse};
    use crate::range::range_reader_fn;

    struct NoHttp;

    impl BlockingHttp for NoHttp {
        fn get(&self, _: &str, _: &[(String, String)], _: Option<HttpRange>) -> Result<HttpResponse> {
            Err(FsError::Network("offline".into()))
        }
    }

    fn env(dir: &std::path::Path, limit: usize) -> Arc<StreamEnv> {
        StreamEnv::builder()
            .transport(Arc::new(NoHttp))
            .temp_dir(dir)
            .max_buffer_limit(limit)
            .build()
            .unwrap()
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    /// Counts bytes pulled out of the wrapped reader.
    struct CountingReader {
        inner: io::Cursor<Vec<u8>>,
        pulled: Arc<AtomicUsize>,
    }

    impl Read for CountingReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.inner.read(buf)?;
            self.pulled.fetch_add(n, Ordering::SeqCst);
            Ok(n)
        }
    }

    fn read_all(mut r: BoxReader) -> Vec<u8> {
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        out
    }

    fn temp_files(dir: &std::path::Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    #[test]
    fn graduated_range_reads() {
        let dir = tempfile::tempdir().unwrap();
        let size = 10 * MB as usize;
        let data = pattern(size);
        let pulled = Arc::new(AtomicUsize::new(0));
        let reader = CountingReader {
            inner: io::Cursor::new(data.clone()),
            pulled: Arc::clone(&pulled),
        };
        let mut fs = FileStream::new(
            env(dir.path(), MB as usize),
            Context::new(),
            Arc::new(ObjInfo::file("big.bin", size as u64)),
        )
        .with_reader(reader);

        let half = 512 * 1024;
        let out = read_all(fs.range_read(HttpRange::new(0, half)).unwrap());
        assert_eq!(out, data[..half as usize]);
        assert!(fs.is_peeked());
        assert_eq!(pulled.load(Ordering::SeqCst), half as usize);
        assert_eq!(temp_files(dir.path()), 0);

        let out = read_all(fs.range_read(HttpRange::new(0, 2 * MB)).unwrap());
        assert_eq!(out, data[..2 * MB as usize]);
        assert!(fs.get_file().is_some());
        assert_eq!(temp_files(dir.path()), 1);
        assert_eq!(pulled.load(Ordering::SeqCst), size);

        let out = read_all(fs.range_read(HttpRange::new(5 * MB, MB)).unwrap());
        assert_eq!(out, data[5 * MB as usize..6 * MB as usize]);
        assert_eq!(pulled.load(Ordering::SeqCst), size);

        FileStreamer::close(&mut fs).unwrap();
        assert_eq!(temp_files(dir.path()), 0);
    }

    #[test]
    fn peek_keeps_sequential_read_intact() {
        let dir = tempfile::tempdir().unwrap();
        let data = pattern(4096);
        let mut fs = FileStream::new(
            env(dir.path(), 1024),
            Context::new(),
            Arc::new(ObjInfo::file("a", 4096)),
        )
        .with_reader(io::Cursor::new(data.clone()));

        assert_eq!(read_all(fs.range_read(HttpRange::new(10, 20)).unwrap()), data[10..30]);
        assert_eq!(read_all(fs.range_read(HttpRange::new(0, 500)).unwrap()), data[..500]);

        let mut all = Vec::new();
        fs.read_to_end(&mut all).unwrap();
        assert_eq!(all, data);
    }

    #[test]
    fn cache_full_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let data = pattern(3000);
        let mut fs = FileStream::new(
            env(dir.path(), 1024),
            Context::new(),
            Arc::new(ObjInfo::file("a", 3000)),
        )
        .with_reader(io::Cursor::new(data.clone()));

        let first = fs.cache_full_in_temp_file().unwrap();
        let second = fs.cache_full_in_temp_file().unwrap();
        assert!(first.same(&second));
        assert_eq!(first.size(), 3000);
        assert_eq!(temp_files(dir.path()), 1);
        assert_eq!(fs.get_size(), 3000);
    }

    #[test]
    fn size_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut fs = FileStream::new(
            env(dir.path(), 16),
            Context::new(),
            Arc::new(ObjInfo::file("a", 100)),
        )
        .with_reader(io::Cursor::new(pattern(60)));
        assert!(fs.cache_full_in_temp_file().is_err());
        assert_eq!(temp_files(dir.path()), 0);
    }

    #[test]
    fn buffering_after_consumption_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut fs = FileStream::new(
            env(dir.path(), 1024),
            Context::new(),
            Arc::new(ObjInfo::file("a", 100)),
        )
        .with_reader(io::Cursor::new(pattern(100)));
        let mut head = [0u8; 10];
        fs.read_exact(&mut head).unwrap();
        assert!(matches!(fs.range_read(HttpRange::new(0, 50)), Err(FsError::Protocol(_))));
    }

    #[test]
    fn close_runs_closers_and_tolerates_repeat() {
        let dir = tempfile::tempdir().unwrap();
        let closed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&closed);
        let mut fs = FileStream::new(
            env(dir.path(), 16),
            Context::new(),
            Arc::new(ObjInfo::file("a", 64)),
        )
        .with_reader(io::Cursor::new(pattern(64)));
        fs.add_closer(close_fn(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(FsError::Network("connection reset".into()))
        }));
        fs.cache_full_in_temp_file().unwrap();
        assert_eq!(temp_files(dir.path()), 1);

        assert!(FileStreamer::close(&mut fs).is_err());
        assert_eq!(temp_files(dir.path()), 0);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert!(FileStreamer::close(&mut fs).is_ok());
    }

    fn counting_link(data: Arc<Vec<u8>>, calls: Arc<AtomicUsize>) -> Link {
        Link::from_range_reader(range_reader_fn(move |_ctx, range| {
            calls.fetch_add(1, Ordering::SeqCst);
            let r = range.clamp(data.len() as u64);
            let start = r.start as usize;
            let end = start + r.length.unwrap_or(0) as usize;
            Ok(Box::new(io::Cursor::new(data[start..end].to_vec())) as BoxReader)
        }))
    }

    #[test]
    fn seekable_stream_stops_fetching_once_cached() {
        let dir = tempfile::tempdir().unwrap();
        let data = Arc::new(pattern(8192));
        let calls = Arc::new(AtomicUsize::new(0));
        let fs = FileStream::new(
            env(dir.path(), 1024),
            Context::new(),
            Arc::new(ObjInfo::file("remote", 8192)),
        );
        let mut ss = SeekableStream::new(fs, Some(counting_link(data.clone(), calls.clone()))).unwrap();

        assert_eq!(read_all(ss.range_read(HttpRange::new(100, 10)).unwrap()), data[100..110]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        ss.cache_full_in_temp_file().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        for start in [0u64, 4000, 8000] {
            let out = read_all(ss.range_read(HttpRange::new(start, 100)).unwrap());
            let end = (start as usize + 100).min(8192);
            assert_eq!(out, data[start as usize..end]);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn seekable_stream_reads_lazily() {
        let dir = tempfile::tempdir().unwrap();
        let data = Arc::new(pattern(5000));
        let calls = Arc::new(AtomicUsize::new(0));
        let fs = FileStream::new(
            env(dir.path(), 1024),
            Context::new(),
            Arc::new(ObjInfo::file("remote", 5000)),
        );
        let mut ss = SeekableStream::new(fs, Some(counting_link(data.clone(), calls.clone()))).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let mut out = Vec::new();
        ss.read_to_end(&mut out).unwrap();
        assert_eq!(out, *data);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn local_link_is_served_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let data: Arc<Vec<u8>> = Arc::new(pattern(2048));
        let fs = FileStream::new(
            env(dir.path(), 16),
            Context::new(),
            Arc::new(ObjInfo::file("local", 2048)),
        );
        let link = Link::from_mfile(data.clone(), 2048);
        let mut ss = SeekableStream::new(fs, Some(link)).unwrap();
        assert!(ss.get_file().is_some());
        assert_eq!(read_all(ss.range_read(HttpRange::new(1000, 48)).unwrap()), data[1000..1048]);
        assert_eq!(temp_files(dir.path()), 0);
    }

    #[test]
    fn stream_without_reader_or_link_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let fs = FileStream::new(
            env(dir.path(), 16),
            Context::new(),
            Arc::new(ObjInfo::file("x", 1)),
        );
        assert!(matches!(SeekableStream::new(fs, None), Err(FsError::Protocol(_))));
    }

    #[test]
    fn cache_full_and_writer_tees_and_reports_progress() {
        let dir = tempfile::tempdir().unwrap();
        let data = pattern(300_000);
        let mut fs = FileStream::new(
            env(dir.path(), 16),
            Context::new(),
            Arc::new(ObjInfo::file("a", data.len() as u64)),
        )
        .with_reader(io::Cursor::new(data.clone()));

        let mut seen = Vec::new();
        let mut copy = Vec::new();
        let mut up = |p: f64| seen.push(p);
        fs.cache_full_and_writer(Some(&mut up), Some(&mut copy)).unwrap();
        assert_eq!(copy, data);
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(seen.last().copied(), Some(100.0));
    }
}

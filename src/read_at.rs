//! Random-access views over [`SeekableStream`]s.
//!
//! [`RangeReadReadAtSeeker`] answers positional reads by keeping a small set of
//! forward readers keyed by the offset each one will yield next. A read picks
//! the reader closest below its offset and skips ahead when the gap is small;
//! otherwise it opens a new range. Readers are evicted least recently used.

use std::io::{self, Read, Seek, SeekFrom};
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard, PoisonError};

use lru::LruCache;
use tracing::trace;

use crate::core::{BoxReader, Context, FsError, HttpRange, ReadAt, Result, copy_with_ctx, read_at_least};
use crate::flight::Flight;
use crate::stream::{CacheFile, FileStreamer, SeekableStream};

enum Source {
    /// The stream's own forward reader.
    Stream,
    Reader(BoxReader),
}

struct Readers {
    lru: LruCache<u64, BoxReader>,
    // position of the stream's forward reader while nobody is using it
    stream_at: Option<u64>,
}

/// Bytes read from offset 0. Growth is keyed by the current length, so
/// concurrent probes of the same missing span share one fetch.
struct HeadCache {
    buf: Mutex<Vec<u8>>,
    limit: usize,
    growth: Flight<usize, usize>,
}

impl HeadCache {
    fn len(&self) -> usize {
        self.buf.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

pub struct RangeReadReadAtSeeker {
    stream: Mutex<SeekableStream>,
    ctx: Context,
    size: u64,
    file: Option<CacheFile>,
    readers: Mutex<Readers>,
    head: Option<HeadCache>,
    skip_tolerance: u64,
    master_off: u64,
}

impl RangeReadReadAtSeeker {
    pub fn new(stream: SeekableStream, offset: u64) -> Result<Self> {
        let size = stream.get_size();
        if offset > size {
            return Err(FsError::Protocol(format!(
                "offset {offset} is beyond object size {size}"
            )));
        }
        let config = stream.env().config();
        let capacity = NonZeroUsize::new(config.max_live_readers).unwrap_or(NonZeroUsize::MIN);
        let skip_tolerance = config.reader_skip_tolerance;
        let ctx = stream.ctx().clone();
        let file = stream.get_file();
        let stream_at = Some(stream.position());

        Ok(Self {
            stream: Mutex::new(stream),
            ctx,
            size,
            file,
            readers: Mutex::new(Readers {
                lru: LruCache::new(capacity),
                stream_at,
            }),
            head: None,
            skip_tolerance,
            master_off: offset,
        })
    }

    /// Keeps bytes read from offset 0 in memory, up to `head_cache_limit`, so
    /// repeated probes of the head never reopen the source. Larger reads at 0
    /// bypass the cache.
    pub fn init_head_cache(&mut self) {
        if self.file.is_some() || self.head.is_some() {
            return;
        }
        let limit = self.lock_stream().env().config().head_cache_limit;
        self.head = Some(HeadCache {
            buf: Mutex::new(Vec::new()),
            limit,
            growth: Flight::new(),
        });
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn into_inner(self) -> SeekableStream {
        self.stream.into_inner().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drops every live reader and closes the underlying stream.
    pub fn close(self) -> Result<()> {
        let Self { stream, readers, .. } = self;
        drop(readers);
        let mut stream = stream.into_inner().unwrap_or_else(PoisonError::into_inner);
        stream.close()
    }

    fn lock_stream(&self) -> MutexGuard<'_, SeekableStream> {
        self.stream.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_readers(&self) -> MutexGuard<'_, Readers> {
        self.readers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes the reader closest below `off` within the skip tolerance.
    fn take_source(&self, off: u64) -> Option<(Source, u64)> {
        let mut readers = self.lock_readers();
        let within = |at: u64| at <= off && off - at <= self.skip_tolerance;

        let best = readers
            .lru
            .iter()
            .map(|(&at, _)| at)
            .filter(|&at| within(at))
            .max();
        let stream = readers.stream_at.filter(|&at| within(at));

        match (best, stream) {
            (Some(at), Some(s)) if s > at => {
                readers.stream_at = None;
                Some((Source::Stream, s))
            }
            (Some(at), _) => readers.lru.pop(&at).map(|r| (Source::Reader(r), at)),
            (None, Some(s)) => {
                readers.stream_at = None;
                Some((Source::Stream, s))
            }
            (None, None) => None,
        }
    }

    fn put_source(&self, source: Source, at: u64) {
        let mut readers = self.lock_readers();
        match source {
            Source::Stream => readers.stream_at = Some(at),
            Source::Reader(reader) => {
                readers.lru.put(at, reader);
            }
        }
    }

    fn open(&self, off: u64) -> Result<Source> {
        trace!(offset = off, "opening reader");
        let remote = self.lock_stream().remote_range_reader();
        let reader = match remote {
            // fetch outside the stream lock so other offsets keep flowing
            Some(remote) => remote.range_read(&self.ctx, HttpRange::from_offset(off))?,
            None => self.lock_stream().range_read(HttpRange::from_offset(off))?,
        };
        Ok(Source::Reader(reader))
    }

    fn fill(&self, source: &mut Source, skip: u64, buf: &mut [u8]) -> Result<usize> {
        match source {
            Source::Stream => {
                let mut stream = self.lock_stream();
                fill_from(&self.ctx, &mut *stream, skip, buf)
            }
            Source::Reader(reader) => fill_from(&self.ctx, reader, skip, buf),
        }
    }

    fn read_uncached(&self, buf: &mut [u8], off: u64) -> Result<usize> {
        if let Some(file) = &self.file {
            return Ok(file.read_at(buf, off)?);
        }

        let (mut source, at) = match self.take_source(off) {
            Some(found) => found,
            None => (self.open(off)?, off),
        };
        let n = self.fill(&mut source, off - at, buf)?;
        // a short fill means the reader hit EOF; it is useless from here on
        if n == buf.len() {
            self.put_source(source, off + n as u64);
        }
        Ok(n)
    }

    fn read_head(&self, head: &HeadCache, buf: &mut [u8]) -> Result<Option<usize>> {
        let want = buf.len().min(self.size as usize);
        if want > head.limit {
            return Ok(None);
        }
        loop {
            let have = head.len();
            if have >= want {
                break;
            }
            let grown = head.growth.work(&have, || {
                // another span may have landed between the length check and this call
                let current = head.len();
                if current > have {
                    return Ok(current - have);
                }
                let mut more = vec![0u8; want - have];
                let n = self.read_uncached(&mut more, have as u64)?;
                let mut cached = head.buf.lock().unwrap_or_else(PoisonError::into_inner);
                if cached.len() == have {
                    cached.extend_from_slice(&more[..n]);
                }
                Ok(n)
            })?;
            if grown == 0 {
                break;
            }
        }
        let cached = head.buf.lock().unwrap_or_else(PoisonError::into_inner);
        let n = want.min(cached.len());
        buf[..n].copy_from_slice(&cached[..n]);
        Ok(Some(n))
    }
}

fn fill_from<R: Read + ?Sized>(ctx: &Context, reader: &mut R, skip: u64, buf: &mut [u8]) -> Result<usize> {
    if skip > 0 {
        let skipped = copy_with_ctx(ctx, reader, &mut io::sink(), Some(skip))?;
        if skipped < skip {
            return Ok(0);
        }
    }
    ctx.check()?;
    Ok(read_at_least(reader, buf, buf.len())?)
}

impl ReadAt for RangeReadReadAtSeeker {
    fn read_at(&self, buf: &mut [u8], off: u64) -> io::Result<usize> {
        if buf.is_empty() || off >= self.size {
            return Ok(0);
        }
        if off == 0
            && let Some(head) = &self.head
            && let Some(n) = self.read_head(head, buf)?
        {
            return Ok(n);
        }
        Ok(self.read_uncached(buf, off)?)
    }
}

impl Read for RangeReadReadAtSeeker {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.read_at(buf, self.master_off)?;
        self.master_off += n as u64;
        Ok(n)
    }
}

impl Seek for RangeReadReadAtSeeker {
    /// Only moves the cursor; readers are opened on the next read.
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::Current(delta) => self.master_off.checked_add_signed(delta),
            SeekFrom::End(delta) => self.size.checked_add_signed(delta),
        };
        let target = target
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid seek: negative position"))?
            .min(self.size);
        self.master_off = target;
        Ok(target)
    }
}

/// Concatenates several streams into a single positional reader.
pub struct MultiReaderAt {
    parts: Vec<(u64, RangeReadReadAtSeeker)>,
    size: u64,
}

impl MultiReaderAt {
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn close(self) -> Result<()> {
        let errors = self
            .parts
            .into_iter()
            .filter_map(|(_, part)| part.close().err())
            .collect();
        match FsError::join(errors) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

pub fn new_multi_reader_at(streams: Vec<SeekableStream>) -> Result<MultiReaderAt> {
    let mut parts = Vec::with_capacity(streams.len());
    let mut size = 0;
    for stream in streams {
        let part = RangeReadReadAtSeeker::new(stream, 0)?;
        let len = part.size();
        parts.push((size, part));
        size += len;
    }
    Ok(MultiReaderAt { parts, size })
}

impl ReadAt for MultiReaderAt {
    fn read_at(&self, buf: &mut [u8], off: u64) -> io::Result<usize> {
        let mut index = self.parts.partition_point(|(start, _)| *start <= off);
        if index == 0 {
            return Ok(0);
        }
        index -= 1;

        let mut done = 0;
        let mut off = off;
        while done < buf.len() && index < self.parts.len() {
            let (start, part) = &self.parts[index];
            let n = part.read_at(&mut buf[done..], off - start)?;
            done += n;
            off += n as u64;
            if off >= start + part.size() {
                index += 1;
            } else if n == 0 {
                break;
            }
        }
        Ok(done)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use super::*;
    use crate::config::StreamEnv;
    use crate::model::{Link, ObjInfo};
    use crate::plug::{BlockingHttp, HttpResponse};
    use crate::range::range_reader_fn;
    use crate::stream::FileStream;

    struct NoHttp;

    impl BlockingHttp for NoHttp {
        fn get(&self, _: &str, _: &[(String, String)], _: Option<HttpRange>) -> Result<HttpResponse> {
            Err(FsError::Network("offline".into()))
        }
    }

    fn pattern(len: usize) -> Arc<Vec<u8>> {
        Arc::new((0..len).map(|i| (i * 7 % 256) as u8).collect())
    }

    fn remote(data: Arc<Vec<u8>>, calls: Arc<AtomicUsize>, tolerance: u64) -> SeekableStream {
        let env = StreamEnv::builder()
            .transport(Arc::new(NoHttp))
            .reader_skip_tolerance(tolerance)
            .max_live_readers(4)
            .build()
            .unwrap();
        remote_in(env, data, calls)
    }

    fn remote_in(env: Arc<StreamEnv>, data: Arc<Vec<u8>>, calls: Arc<AtomicUsize>) -> SeekableStream {
        let size = data.len() as u64;
        let link = Link::from_range_reader(range_reader_fn(move |_ctx, range| {
            calls.fetch_add(1, Ordering::SeqCst);
            let r = range.clamp(data.len() as u64);
            let start = r.start as usize;
            let end = start + r.length.unwrap_or(0) as usize;
            Ok(Box::new(io::Cursor::new(data[start..end].to_vec())) as BoxReader)
        }));
        let fs = FileStream::new(env, Context::new(), Arc::new(ObjInfo::file("remote", size)));
        SeekableStream::new(fs, Some(link)).unwrap()
    }

    #[test]
    fn sequential_reads_reuse_one_reader() {
        let data = pattern(10_000);
        let calls = Arc::new(AtomicUsize::new(0));
        let rs = RangeReadReadAtSeeker::new(remote(data.clone(), calls.clone(), 100), 0).unwrap();

        let mut buf = [0u8; 1000];
        for i in 0..10u64 {
            assert_eq!(rs.read_at(&mut buf, i * 1000).unwrap(), 1000);
            assert_eq!(buf[..], data[(i * 1000) as usize..((i + 1) * 1000) as usize]);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn small_gaps_are_skipped_large_gaps_reopen() {
        let data = pattern(10_000);
        let calls = Arc::new(AtomicUsize::new(0));
        let rs = RangeReadReadAtSeeker::new(remote(data.clone(), calls.clone(), 100), 0).unwrap();

        let mut buf = [0u8; 10];
        rs.read_at(&mut buf, 0).unwrap();
        rs.read_at(&mut buf, 60).unwrap();
        assert_eq!(buf[..], data[60..70]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        rs.read_at(&mut buf, 5000).unwrap();
        assert_eq!(buf[..], data[5000..5010]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // the reader left at 70 is still live
        rs.read_at(&mut buf, 70).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn read_and_seek_follow_cursor() {
        let data = pattern(3000);
        let calls = Arc::new(AtomicUsize::new(0));
        let mut rs = RangeReadReadAtSeeker::new(remote(data.clone(), calls, 0), 0).unwrap();

        rs.seek(SeekFrom::End(-100)).unwrap();
        let mut tail = Vec::new();
        rs.read_to_end(&mut tail).unwrap();
        assert_eq!(tail, data[2900..]);

        assert!(rs.seek(SeekFrom::Current(-5000)).is_err());
        assert_eq!(rs.seek(SeekFrom::Start(10)).unwrap(), 10);
        let mut buf = [0u8; 5];
        rs.read_exact(&mut buf).unwrap();
        assert_eq!(buf[..], data[10..15]);

        assert_eq!(rs.seek(SeekFrom::Start(3500)).unwrap(), 3000);
        assert_eq!(rs.seek(SeekFrom::End(50)).unwrap(), 3000);
        assert_eq!(rs.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn head_cache_is_capped() {
        let data = pattern(8192);
        let calls = Arc::new(AtomicUsize::new(0));
        let env = StreamEnv::builder()
            .transport(Arc::new(NoHttp))
            .reader_skip_tolerance(0)
            .head_cache_limit(1024)
            .build()
            .unwrap();
        let mut rs = RangeReadReadAtSeeker::new(remote_in(env, data.clone(), calls.clone()), 0).unwrap();
        rs.init_head_cache();

        let mut small = [0u8; 512];
        rs.read_at(&mut small, 0).unwrap();
        rs.read_at(&mut small, 0).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // past the cap: served straight from the source, head left as is
        let mut big = vec![0u8; 4096];
        assert_eq!(rs.read_at(&mut big, 0).unwrap(), 4096);
        assert_eq!(big[..], data[..4096]);
        assert_eq!(rs.head.as_ref().unwrap().len(), 512);
    }

    #[test]
    fn head_cache_serves_repeat_probes() {
        let data = pattern(4096);
        let calls = Arc::new(AtomicUsize::new(0));
        let mut rs = RangeReadReadAtSeeker::new(remote(data.clone(), calls.clone(), 0), 0).unwrap();
        rs.init_head_cache();

        let mut buf = [0u8; 512];
        for _ in 0..3 {
            assert_eq!(rs.read_at(&mut buf, 0).unwrap(), 512);
            assert_eq!(buf[..], data[..512]);
        }
        let mut wider = [0u8; 1024];
        rs.read_at(&mut wider, 0).unwrap();
        assert_eq!(wider[..], data[..1024]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_head_probes_share_one_fetch() {
        let data = pattern(4096);
        let calls = Arc::new(AtomicUsize::new(0));
        let mut rs = RangeReadReadAtSeeker::new(remote(data.clone(), calls.clone(), 0), 0).unwrap();
        rs.init_head_cache();
        let barrier = std::sync::Barrier::new(8);

        thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    barrier.wait();
                    let mut buf = [0u8; 512];
                    assert_eq!(rs.read_at(&mut buf, 0).unwrap(), 512);
                    assert_eq!(buf[..], data[..512]);
                });
            }
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_reads_are_consistent() {
        let data = pattern(64 * 1024);
        let calls = Arc::new(AtomicUsize::new(0));
        let rs = Arc::new(RangeReadReadAtSeeker::new(remote(data.clone(), calls, 1024), 0).unwrap());

        let handles: Vec<_> = (0..4u64)
            .map(|t| {
                let rs = Arc::clone(&rs);
                let data = Arc::clone(&data);
                thread::spawn(move || {
                    let mut buf = vec![0u8; 4096];
                    for i in 0..4u64 {
                        let off = (t * 4 + i) * 4096;
                        assert_eq!(rs.read_at(&mut buf, off).unwrap(), 4096);
                        assert_eq!(buf[..], data[off as usize..off as usize + 4096]);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn multi_reader_spans_parts() {
        let a = pattern(100);
        let b = Arc::new(vec![9u8; 50]);
        let parts = vec![
            remote(a.clone(), Arc::new(AtomicUsize::new(0)), 0),
            remote(b.clone(), Arc::new(AtomicUsize::new(0)), 0),
        ];
        let multi = new_multi_reader_at(parts).unwrap();
        assert_eq!(multi.size(), 150);

        let mut buf = [0u8; 20];
        assert_eq!(multi.read_at(&mut buf, 90).unwrap(), 20);
        assert_eq!(buf[..10], a[90..]);
        assert_eq!(buf[10..], b[..10]);
        assert_eq!(multi.read_at(&mut buf, 145).unwrap(), 5);
        multi.close().unwrap();
    }
}

//! Bounded section readers for chunked uploads.
//!
//! Drivers that upload in parts pull consecutive sections out of a forward
//! stream. Each section is staged in a reusable slot so it can be re-read (for
//! hashing, then upload, then retries) while memory stays bounded by the number
//! of sections in flight.
//!
//! Three strategies, picked once per stream:
//!
//! - cached: the stream already has a full file cache; sections are file views
//! - file: sections larger than the in-memory limit are staged in fixed slots of
//!   a sparse temp file
//! - direct: sections are staged in pooled memory buffers
//!
//! Sections must be requested in stream order.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::buffer::{Pool, PooledBuf};
use crate::core::{Context, FsError, ReadAt, Result, write_all_at};
use crate::stream::{CacheFile, FileStreamer};

const STAGE_BUFFER_SIZE: usize = 64 * 1024;

pub trait StreamSectionReader: Send {
    /// Stages `length` bytes at `off` and returns a re-readable view of them.
    fn get_section_reader(&mut self, off: u64, length: u64) -> Result<Section>;

    /// Returns the section's slot to the pool.
    fn free_section_reader(&mut self, section: Section);

    /// Skips `length` bytes at `off` without staging them.
    fn discard_section(&mut self, off: u64, length: u64) -> Result<()>;
}

enum Backing {
    Cache(CacheFile),
    Slot { file: Arc<File>, slot: u64 },
    Buf(PooledBuf),
}

/// A staged section. Reading and seeking never touch the source stream.
pub struct Section {
    backing: Backing,
    base: u64,
    len: u64,
    pos: u64,
}

impl Section {
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn read_inner(&self, buf: &mut [u8], off: u64) -> io::Result<usize> {
        if off >= self.len {
            return Ok(0);
        }
        let max = (self.len - off).min(buf.len() as u64) as usize;
        let buf = &mut buf[..max];
        match &self.backing {
            Backing::Cache(file) => file.read_at(buf, self.base + off),
            Backing::Slot { file, slot } => file.read_at(buf, slot + off),
            Backing::Buf(data) => {
                let start = off as usize;
                buf.copy_from_slice(&data[start..start + max]);
                Ok(max)
            }
        }
    }
}

impl ReadAt for Section {
    fn read_at(&self, buf: &mut [u8], off: u64) -> io::Result<usize> {
        self.read_inner(buf, off)
    }
}

impl Read for Section {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.read_inner(buf, self.pos)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for Section {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => Some(n),
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

/// Picks the section strategy for `file`.
///
/// `max_buffer_size` is the largest section the caller will request. When the
/// sparse temp file cannot be sized, the whole stream is cached instead.
pub fn new_stream_section_reader<'a>(
    file: &'a mut dyn FileStreamer,
    max_buffer_size: usize,
    progress: Option<&mut dyn FnMut(f64)>,
) -> Result<Box<dyn StreamSectionReader + 'a>> {
    if let Some(cache) = file.get_file() {
        return Ok(Box::new(CachedSectionReader { cache }));
    }

    let size = file.get_size();
    let max_buffer_size = max_buffer_size.min(size as usize).max(1);
    let config = file.env().config().clone();

    if max_buffer_size > config.max_buffer_limit {
        let temp = tempfile::Builder::new()
            .prefix("file-")
            .tempfile_in(&config.temp_dir)?;
        let chunk = max_buffer_size as u64;
        let sparse_len = size.div_ceil(chunk) * chunk;
        if let Err(e) = temp.as_file().set_len(sparse_len) {
            warn!(error = %e, size = sparse_len, "failed to size section file, caching whole stream");
            drop(temp);
            let cache = file.cache_full_and_writer(progress, None)?;
            return Ok(Box::new(CachedSectionReader { cache }));
        }
        debug!(path = %temp.path().display(), chunk, "staging sections in temp file");
        let (handle, path) = temp.into_parts();
        return Ok(Box::new(FileSectionReader {
            ctx: file.ctx().clone(),
            file,
            offset: 0,
            temp: Arc::new(handle),
            _path: path,
            next_slot: 0,
            chunk,
            slots: Pool::new(),
        }));
    }

    Ok(Box::new(DirectSectionReader {
        ctx: file.ctx().clone(),
        file,
        offset: 0,
        capacity: max_buffer_size,
        mmap_threshold: config.mmap_threshold,
        bufs: Pool::new(),
    }))
}

fn check_offset(expected: u64, off: u64) -> Result<()> {
    if off != expected {
        return Err(FsError::Protocol(format!(
            "stream not cached: request offset {off} != current offset {expected}"
        )));
    }
    Ok(())
}

fn discard<R: Read + ?Sized>(ctx: &Context, reader: &mut R, length: u64) -> Result<()> {
    let skipped = crate::core::copy_with_ctx(ctx, reader, &mut io::sink(), Some(length))?;
    if skipped != length {
        return Err(FsError::Protocol(format!(
            "failed to skip data: (expect ={length}, actual ={skipped})"
        )));
    }
    Ok(())
}

struct CachedSectionReader {
    cache: CacheFile,
}

impl StreamSectionReader for CachedSectionReader {
    fn get_section_reader(&mut self, off: u64, length: u64) -> Result<Section> {
        Ok(Section {
            backing: Backing::Cache(self.cache.clone()),
            base: off,
            len: length.min(self.cache.size().saturating_sub(off)),
            pos: 0,
        })
    }

    fn free_section_reader(&mut self, _section: Section) {}

    fn discard_section(&mut self, _off: u64, _length: u64) -> Result<()> {
        Ok(())
    }
}

struct FileSectionReader<'a> {
    file: &'a mut dyn FileStreamer,
    ctx: Context,
    offset: u64,
    temp: Arc<File>,
    // removes the temp file on drop
    _path: tempfile::TempPath,
    next_slot: u64,
    chunk: u64,
    slots: Pool<u64>,
}

impl FileSectionReader<'_> {
    fn stage(&mut self, slot: u64, length: u64) -> Result<u64> {
        let mut buf = vec![0u8; STAGE_BUFFER_SIZE];
        let mut written = 0u64;
        while written < length {
            self.ctx.check()?;
            let want = ((length - written) as usize).min(buf.len());
            let n = match self.file.read(&mut buf[..want]) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            write_all_at(&self.temp, &buf[..n], slot + written)?;
            written += n as u64;
        }
        Ok(written)
    }
}

impl StreamSectionReader for FileSectionReader<'_> {
    fn get_section_reader(&mut self, off: u64, length: u64) -> Result<Section> {
        check_offset(self.offset, off)?;
        if length > self.chunk {
            return Err(FsError::Protocol(format!(
                "section of {length} bytes exceeds slot size {}",
                self.chunk
            )));
        }
        let slot = self.slots.get_or(|| {
            let slot = self.next_slot;
            self.next_slot += self.chunk;
            slot
        });
        let written = match self.stage(slot, length) {
            Ok(written) => written,
            Err(e) => {
                self.slots.put(slot);
                return Err(e.with_message(format!("failed to read all data: (expect ={length})")));
            }
        };
        self.offset += written;
        if written != length {
            self.slots.put(slot);
            return Err(FsError::Protocol(format!(
                "failed to read all data: (expect ={length}, actual ={written})"
            )));
        }
        Ok(Section {
            backing: Backing::Slot {
                file: Arc::clone(&self.temp),
                slot,
            },
            base: 0,
            len: length,
            pos: 0,
        })
    }

    fn free_section_reader(&mut self, section: Section) {
        if let Backing::Slot { slot, .. } = section.backing {
            self.slots.put(slot);
        }
    }

    fn discard_section(&mut self, off: u64, length: u64) -> Result<()> {
        check_offset(self.offset, off)?;
        discard(&self.ctx, &mut *self.file, length)?;
        self.offset += length;
        Ok(())
    }
}

struct DirectSectionReader<'a> {
    file: &'a mut dyn FileStreamer,
    ctx: Context,
    offset: u64,
    capacity: usize,
    mmap_threshold: usize,
    bufs: Pool<PooledBuf>,
}

impl StreamSectionReader for DirectSectionReader<'_> {
    fn get_section_reader(&mut self, off: u64, length: u64) -> Result<Section> {
        check_offset(self.offset, off)?;
        if length > self.capacity as u64 {
            return Err(FsError::Protocol(format!(
                "section of {length} bytes exceeds buffer size {}",
                self.capacity
            )));
        }
        let (capacity, threshold) = (self.capacity, self.mmap_threshold);
        let mut buf = self.bufs.get_or(|| PooledBuf::alloc(capacity, threshold));

        let want = length as usize;
        let mut n = 0;
        while n < want {
            if let Err(e) = self.ctx.check() {
                self.bufs.put(buf);
                return Err(e);
            }
            match self.file.read(&mut buf[n..want]) {
                Ok(0) => break,
                Ok(read) => n += read,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    self.offset += n as u64;
                    self.bufs.put(buf);
                    return Err(FsError::from(e).with_message("failed to read section"));
                }
            }
        }
        self.offset += n as u64;
        if n != want {
            self.bufs.put(buf);
            return Err(FsError::Protocol(format!(
                "failed to read all data: (expect ={want}, actual ={n})"
            )));
        }
        Ok(Section {
            backing: Backing::Buf(buf),
            base: 0,
            len: length,
            pos: 0,
        })
    }

    fn free_section_reader(&mut self, section: Section) {
        if let Backing::Buf(buf) = section.backing {
            self.bufs.put(buf);
        }
    }

    fn discard_section(&mut self, off: u64, length: u64) -> Result<()> {
        check_offset(self.offset, off)?;
        discard(&self.ctx, &mut *self.file, length)?;
        self.offset += length;
        Ok(())
    }
}

use std::io;
use std::sync::Arc;

use crate::config::StreamEnv;
use crate::core::{BoxReader, Context, HttpRange, ReadAt, Result, SectionReader};
use crate::downloader::Downloader;
use crate::http::HttpRangeReader;
use crate::model::{Link, invalid_link};
use crate::stream::CacheFile;

/// Fetches an arbitrary byte window of one object.
///
/// Implementations hold no shared cursor, so different windows may be fetched
/// concurrently from several threads.
pub trait RangeReader: Send + Sync {
    fn range_read(&self, ctx: &Context, range: HttpRange) -> Result<BoxReader>;

    /// Positional handle for readers backed by local storage. Streams use it
    /// as their full cache instead of copying the bytes.
    fn as_local(&self) -> Option<CacheFile> {
        None
    }

    fn is_local(&self) -> bool {
        self.as_local().is_some()
    }
}

/// Adapts a closure into a [`RangeReader`].
pub struct RangeReaderFunc<F>(pub F);

impl<F> RangeReader for RangeReaderFunc<F>
where
    F: Fn(&Context, HttpRange) -> Result<BoxReader> + Send + Sync,
{
    fn range_read(&self, ctx: &Context, range: HttpRange) -> Result<BoxReader> {
        (self.0)(ctx, range)
    }
}

pub fn range_reader_fn<F>(f: F) -> Arc<dyn RangeReader>
where
    F: Fn(&Context, HttpRange) -> Result<BoxReader> + Send + Sync + 'static,
{
    Arc::new(RangeReaderFunc(f))
}

/// Serves windows straight from a positional reader; no network involved.
pub struct FileRangeReader {
    file: Arc<dyn ReadAt>,
    size: u64,
}

impl FileRangeReader {
    pub fn new(file: Arc<dyn ReadAt>, size: u64) -> Self {
        Self { file, size }
    }
}

impl RangeReader for FileRangeReader {
    fn range_read(&self, _ctx: &Context, range: HttpRange) -> Result<BoxReader> {
        let range = range.clamp(self.size);
        Ok(Box::new(SectionReader::new(
            Arc::clone(&self.file),
            range.start,
            range.length.unwrap_or(0),
        )))
    }

    fn as_local(&self) -> Option<CacheFile> {
        Some(CacheFile::new(Arc::clone(&self.file), self.size))
    }
}

pub(crate) fn empty_reader() -> BoxReader {
    Box::new(io::empty())
}

/// Picks the range reader a link calls for.
///
/// Concurrency hints win and route through the multi-part [`Downloader`], fetching
/// each part with the link's own range reader or a ranged GET against its URL.
/// Otherwise a local handle, the link's range reader, or a direct ranged GET is used.
pub fn get_range_reader_from_link(
    env: &Arc<StreamEnv>,
    size: u64,
    link: &Link,
) -> Result<Arc<dyn RangeReader>> {
    if link.wants_concurrency() {
        let fetcher: Arc<dyn RangeReader> = match (&link.range_reader, &link.url) {
            (Some(reader), _) => Arc::clone(reader),
            (None, Some(url)) => Arc::new(HttpRangeReader::new(
                Arc::clone(env.transport()),
                url.clone(),
                link.header.clone(),
                size,
            )),
            (None, None) => return Err(invalid_link("must have at least one of URL or RangeReader")),
        };
        let config = env.config();
        let concurrency = match link.concurrency {
            0 => config.download_concurrency,
            n => n,
        };
        let part_size = match link.part_size {
            0 => config.download_part_size,
            n => n,
        };
        return Ok(Arc::new(Downloader::new(
            fetcher,
            size,
            concurrency,
            part_size,
            config,
        )));
    }

    if let Some(mfile) = &link.mfile {
        return Ok(Arc::new(FileRangeReader::new(
            Arc::clone(&mfile.reader),
            mfile.size,
        )));
    }

    if let Some(reader) = &link.range_reader {
        return Ok(Arc::clone(reader));
    }

    match &link.url {
        Some(url) if !url.is_empty() => Ok(Arc::new(HttpRangeReader::new(
            Arc::clone(env.transport()),
            url.clone(),
            link.header.clone(),
            size,
        ))),
        _ => Err(invalid_link("must have at least one of URL or RangeReader")),
    }
}

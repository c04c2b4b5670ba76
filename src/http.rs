use std::io::{self, Read};
use std::sync::Arc;

use tracing::warn;

use crate::core::{BoxReader, Context, FsError, HttpRange, Result, copy_with_ctx};
use crate::plug::BlockingHttp;
use crate::range::{RangeReader, empty_reader};
use crate::util::ReaderWithCtx;

/// Single-shot ranged GET against a URL.
pub struct HttpRangeReader {
    transport: Arc<dyn BlockingHttp>,
    url: String,
    header: Vec<(String, String)>,
    size: u64,
}

impl HttpRangeReader {
    pub fn new(
        transport: Arc<dyn BlockingHttp>,
        url: String,
        header: Vec<(String, String)>,
        size: u64,
    ) -> Self {
        Self {
            transport,
            url,
            header,
            size,
        }
    }
}

impl RangeReader for HttpRangeReader {
    fn range_read(&self, ctx: &Context, range: HttpRange) -> Result<BoxReader> {
        ctx.check()?;
        // size 0 means unknown: the window is sent as asked
        let (range, full) = if self.size > 0 {
            (range.clamp(self.size), range.is_full(self.size))
        } else {
            (range, range.start == 0 && range.length.is_none())
        };
        if range.length == Some(0) && !full {
            return Ok(empty_reader());
        }
        let length = range.length.unwrap_or(u64::MAX);

        let response = self
            .transport
            .get(&self.url, &self.header, (!full).then_some(range))
            .map_err(|e| match e {
                FsError::HttpStatus(_) => e,
                other => other.with_message("http request failure"),
            })?;

        let body = ReaderWithCtx::new(response.body, ctx.clone());
        if full {
            return Ok(Box::new(body));
        }

        let honored = response.status == 206
            || response
                .content_range
                .is_some_and(|(start, _)| start == range.start);
        if honored {
            return Ok(Box::new(body.take(length)));
        }

        if response.status == 200 {
            warn!(
                url = %self.url,
                start = range.start,
                "remote http server not supporting range request, expect low performance"
            );
            return ranged_body(ctx, body, range.start, length);
        }

        Ok(Box::new(body.take(length)))
    }
}

/// Skips `start` bytes of a full-body response and bounds it to `length`.
fn ranged_body<R>(ctx: &Context, mut body: R, start: u64, length: u64) -> Result<BoxReader>
where
    R: Read + Send + 'static,
{
    let skipped = copy_with_ctx(ctx, &mut body, &mut io::sink(), Some(start))?;
    if skipped != start {
        return Err(FsError::Protocol(format!(
            "response ended after {skipped} bytes, before range start {start}"
        )));
    }
    Ok(Box::new(body.take(length)))
}

use std::collections::BTreeMap;
use std::io::{self, Cursor, Read};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::StreamConfig;
use crate::core::{BoxReader, Context, FsError, HttpRange, Result, read_at_least, retry_delay};
use crate::range::{RangeReader, empty_reader};

const WAIT_SLICE: Duration = Duration::from_millis(50);

/// Splits a window into fixed-size parts fetched by a bounded set of worker
/// threads and hands them back strictly in order.
///
/// At most `concurrency` parts are buffered ahead of the consumer.
pub struct Downloader {
    fetcher: Arc<dyn RangeReader>,
    size: u64,
    concurrency: usize,
    part_size: u64,
    retry_max_attempts: usize,
    retry_base_delay: Duration,
    retry_max_delay: Duration,
}

impl Downloader {
    pub fn new(
        fetcher: Arc<dyn RangeReader>,
        size: u64,
        concurrency: usize,
        part_size: u64,
        config: &StreamConfig,
    ) -> Self {
        Self {
            fetcher,
            size,
            concurrency: concurrency.max(1),
            part_size: part_size.max(1),
            retry_max_attempts: config.retry_max_attempts,
            retry_base_delay: config.retry_base_delay,
            retry_max_delay: config.retry_max_delay,
        }
    }

    fn plan(&self, range: HttpRange) -> Plan {
        let length = range.length.unwrap_or(0);
        Plan {
            fetcher: Arc::clone(&self.fetcher),
            start: range.start,
            end: range.start + length,
            part_size: self.part_size,
            parts: length.div_ceil(self.part_size),
            window: self.concurrency as u64,
            retry_max_attempts: self.retry_max_attempts,
            retry_base_delay: self.retry_base_delay,
            retry_max_delay: self.retry_max_delay,
        }
    }
}

impl RangeReader for Downloader {
    fn range_read(&self, ctx: &Context, range: HttpRange) -> Result<BoxReader> {
        ctx.check()?;
        // size 0 means unknown: nothing to split, so fetch the window whole
        if self.size == 0 {
            return self.fetcher.range_read(ctx, range);
        }
        let range = range.clamp(self.size);
        let length = range.length.unwrap_or(0);
        if length == 0 {
            return Ok(empty_reader());
        }

        let plan = Arc::new(self.plan(range));
        if plan.parts <= 1 || self.concurrency <= 1 {
            return self.fetcher.range_read(ctx, range);
        }

        let ctx = ctx.child();
        let shared = Arc::new(Shared {
            state: Mutex::new(PartState::default()),
            cond: Condvar::new(),
        });
        let workers = (self.concurrency as u64).min(plan.parts);
        debug!(
            start = range.start,
            length,
            parts = plan.parts,
            workers,
            "starting multi-part download"
        );
        for _ in 0..workers {
            let plan = Arc::clone(&plan);
            let shared = Arc::clone(&shared);
            let ctx = ctx.clone();
            thread::spawn(move || worker(&plan, &shared, &ctx));
        }

        Ok(Box::new(PartReader {
            plan,
            shared,
            ctx,
            current: Cursor::new(Vec::new()),
            next: 0,
        }))
    }
}

struct Plan {
    fetcher: Arc<dyn RangeReader>,
    start: u64,
    end: u64,
    part_size: u64,
    parts: u64,
    window: u64,
    retry_max_attempts: usize,
    retry_base_delay: Duration,
    retry_max_delay: Duration,
}

impl Plan {
    fn part_range(&self, index: u64) -> HttpRange {
        let start = self.start + index * self.part_size;
        HttpRange::new(start, self.part_size.min(self.end - start))
    }

    fn fetch_once(&self, ctx: &Context, range: HttpRange) -> Result<Vec<u8>> {
        let mut reader = self.fetcher.range_read(ctx, range)?;
        let len = range.length.unwrap_or(0) as usize;
        let mut buf = vec![0u8; len];
        let n = read_at_least(&mut reader, &mut buf, len)?;
        if n != len {
            return Err(FsError::Network(format!(
                "part at {} ended after {} of {} bytes",
                range.start,
                n,
                len
            )));
        }
        Ok(buf)
    }

    fn fetch(&self, ctx: &Context, index: u64) -> Result<Vec<u8>> {
        let range = self.part_range(index);
        let mut attempt = 0;
        loop {
            ctx.check()?;
            match self.fetch_once(ctx, range) {
                Ok(buf) => return Ok(buf),
                Err(e) if e.is_transient() && attempt < self.retry_max_attempts => {
                    warn!(part = index, attempt, error = %e, "part download failed, retrying");
                }
                Err(e) => return Err(e),
            }
            let delay = retry_delay(self.retry_base_delay, self.retry_max_delay, attempt);
            thread::sleep(delay);
            attempt += 1;
        }
    }
}

#[derive(Default)]
struct PartState {
    next_claim: u64,
    next_consume: u64,
    done: BTreeMap<u64, Result<Vec<u8>>>,
    closed: bool,
}

struct Shared {
    state: Mutex<PartState>,
    cond: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PartState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, PartState>) -> MutexGuard<'a, PartState> {
        match self.cond.wait_timeout(guard, WAIT_SLICE) {
            Ok((guard, _)) => guard,
            Err(poisoned) => poisoned.into_inner().0,
        }
    }
}

fn worker(plan: &Plan, shared: &Shared, ctx: &Context) {
    loop {
        let index = {
            let mut state = shared.lock();
            loop {
                if state.closed || ctx.is_done() || state.next_claim >= plan.parts {
                    return;
                }
                if state.next_claim < state.next_consume + plan.window {
                    break;
                }
                state = shared.wait(state);
            }
            let index = state.next_claim;
            state.next_claim += 1;
            index
        };

        let result = plan.fetch(ctx, index);
        let failed = result.is_err();
        let mut state = shared.lock();
        state.done.insert(index, result);
        shared.cond.notify_all();
        if failed {
            return;
        }
    }
}

/// Consumer side: yields parts in index order.
struct PartReader {
    plan: Arc<Plan>,
    shared: Arc<Shared>,
    ctx: Context,
    current: Cursor<Vec<u8>>,
    next: u64,
}

impl PartReader {
    fn wait_part(&self, index: u64) -> Result<Vec<u8>> {
        let mut state = self.shared.lock();
        loop {
            if let Some(result) = state.done.remove(&index) {
                state.next_consume = index + 1;
                if result.is_err() {
                    state.closed = true;
                }
                self.shared.cond.notify_all();
                return result;
            }
            self.ctx.check()?;
            state = self.shared.wait(state);
        }
    }
}

impl Read for PartReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let n = self.current.read(buf)?;
            if n > 0 || buf.is_empty() {
                return Ok(n);
            }
            if self.next >= self.plan.parts {
                return Ok(0);
            }
            let part = self.wait_part(self.next)?;
            self.current = Cursor::new(part);
            self.next += 1;
        }
    }
}

impl Drop for PartReader {
    fn drop(&mut self) {
        self.shared.lock().closed = true;
        self.shared.cond.notify_all();
        self.ctx.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::range::range_reader_fn;

    fn data() -> Arc<Vec<u8>> {
        Arc::new((0..1000u32).map(|i| (i % 256) as u8).collect())
    }

    fn config() -> StreamConfig {
        StreamConfig {
            retry_base_delay: Duration::from_millis(1),
            retry_max_delay: Duration::from_millis(5),
            ..StreamConfig::default()
        }
    }

    fn serving(data: Arc<Vec<u8>>, calls: Arc<AtomicUsize>, fail_first: usize) -> Arc<dyn RangeReader> {
        range_reader_fn(move |_ctx, range| {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            if call < fail_first {
                return Err(FsError::Network("connection reset".into()));
            }
            let r = range.clamp(data.len() as u64);
            let start = r.start as usize;
            let end = start + r.length.unwrap_or(0) as usize;
            Ok(Box::new(Cursor::new(data[start..end].to_vec())) as BoxReader)
        })
    }

    fn read_all(mut r: BoxReader) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        r.read_to_end(&mut out)?;
        Ok(out)
    }

    #[test]
    fn parts_arrive_in_order() {
        let data = data();
        let calls = Arc::new(AtomicUsize::new(0));
        let dl = Downloader::new(serving(data.clone(), calls.clone(), 0), 1000, 3, 64, &config());
        let out = read_all(dl.range_read(&Context::new(), HttpRange::new(10, 900)).unwrap()).unwrap();
        assert_eq!(out, data[10..910]);
        assert_eq!(calls.load(Ordering::SeqCst), 900usize.div_ceil(64));
    }

    #[test]
    fn single_part_goes_straight_to_fetcher() {
        let data = data();
        let calls = Arc::new(AtomicUsize::new(0));
        let dl = Downloader::new(serving(data.clone(), calls.clone(), 0), 1000, 4, 4096, &config());
        let out = read_all(dl.range_read(&Context::new(), HttpRange::full()).unwrap()).unwrap();
        assert_eq!(out, *data);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unknown_size_streams_every_byte() {
        let data = data();
        let calls = Arc::new(AtomicUsize::new(0));
        let dl = Downloader::new(serving(data.clone(), calls.clone(), 0), 0, 4, 100, &config());
        let out = read_all(dl.range_read(&Context::new(), HttpRange::full()).unwrap()).unwrap();
        assert_eq!(out, *data);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn transient_failures_are_retried() {
        let data = data();
        let calls = Arc::new(AtomicUsize::new(0));
        let dl = Downloader::new(serving(data.clone(), calls, 2), 1000, 2, 100, &config());
        let out = read_all(dl.range_read(&Context::new(), HttpRange::full()).unwrap()).unwrap();
        assert_eq!(out, *data);
    }

    #[test]
    fn permanent_failure_surfaces_to_reader() {
        let fetcher = range_reader_fn(|_ctx, _range| Err(FsError::HttpStatus(403)));
        let dl = Downloader::new(fetcher, 1000, 2, 100, &config());
        let err = read_all(dl.range_read(&Context::new(), HttpRange::full()).unwrap()).unwrap_err();
        assert!(matches!(FsError::from(err), FsError::HttpStatus(403)));
    }
}

use std::io::{Cursor, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use linkstream::{
    BoxReader, Context, FileStream, FileStreamer, HttpRange, Link, MB, ObjInfo, RangeReadReadAtSeeker, ReadAt,
    SeekableStream, StreamEnv, new_stream_section_reader, range_reader_fn,
};

fn pattern(len: u64) -> Arc<Vec<u8>> {
    Arc::new((0..len).map(|i| (i % 251) as u8).collect())
}

/// A link over `data` that counts how many windows were requested.
fn counted_link(data: Arc<Vec<u8>>, calls: Arc<AtomicUsize>) -> Link {
    Link::from_range_reader(range_reader_fn(move |_ctx, range| {
        calls.fetch_add(1, Ordering::SeqCst);
        let r = range.clamp(data.len() as u64);
        let start = r.start as usize;
        let end = start + r.length.unwrap_or(0) as usize;
        Ok(Box::new(Cursor::new(data[start..end].to_vec())) as BoxReader)
    }))
}

fn open(env: &Arc<StreamEnv>, data: &Arc<Vec<u8>>, link: Link) -> SeekableStream {
    let obj = Arc::new(ObjInfo::file("blob.bin", data.len() as u64));
    let fs = FileStream::new(Arc::clone(env), Context::new(), obj);
    SeekableStream::new(fs, Some(link)).unwrap()
}

#[test]
fn concurrent_download_matches_single_get() {
    let env = StreamEnv::builder().build().unwrap();
    let data = pattern(20 * MB);

    let calls = Arc::new(AtomicUsize::new(0));
    let link = counted_link(data.clone(), calls.clone()).with_concurrency(4, 4 * MB);
    let mut stream = open(&env, &data, link);
    let mut parted = Vec::new();
    stream.read_to_end(&mut parted).unwrap();
    stream.close().unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 5);

    let single = Arc::new(AtomicUsize::new(0));
    let mut stream = open(&env, &data, counted_link(data.clone(), single.clone()));
    let mut whole = Vec::new();
    stream.read_to_end(&mut whole).unwrap();
    stream.close().unwrap();
    assert_eq!(single.load(Ordering::SeqCst), 1);

    assert_eq!(parted.len(), data.len());
    assert!(parted == whole);
    assert!(parted == *data);
}

#[test]
fn concurrent_download_serves_sub_ranges() {
    let env = StreamEnv::builder().build().unwrap();
    let data = pattern(9 * MB + 17);
    let calls = Arc::new(AtomicUsize::new(0));
    let link = counted_link(data.clone(), calls.clone()).with_concurrency(3, 2 * MB);
    let mut stream = open(&env, &data, link);

    let start = MB + 5;
    let len = 5 * MB;
    let mut window = Vec::new();
    stream
        .range_read(HttpRange::new(start, len))
        .unwrap()
        .read_to_end(&mut window)
        .unwrap();
    assert_eq!(window.len() as u64, len);
    assert!(window[..] == data[start as usize..(start + len) as usize]);
    stream.close().unwrap();
}

#[test]
fn positional_reads_from_many_threads() {
    let env = StreamEnv::builder().build().unwrap();
    let data = pattern(12 * MB);
    let calls = Arc::new(AtomicUsize::new(0));
    let link = counted_link(data.clone(), calls.clone()).with_concurrency(4, 4 * MB);
    let reader = RangeReadReadAtSeeker::new(open(&env, &data, link), 0).unwrap();
    assert_eq!(reader.size(), data.len() as u64);

    std::thread::scope(|s| {
        for t in 0..4u64 {
            let reader = &reader;
            let data = &data;
            s.spawn(move || {
                let mut buf = vec![0u8; 256 * 1024];
                let mut off = t * 3 * MB;
                let end = off + 3 * MB;
                while off < end {
                    let n = reader.read_at(&mut buf, off).unwrap();
                    assert!(n > 0);
                    assert!(buf[..n] == data[off as usize..off as usize + n]);
                    off += n as u64;
                }
            });
        }
    });
    reader.close().unwrap();
}

#[test]
fn sections_stage_in_memory_or_temp_file() {
    let data = pattern(10 * MB + 3);
    for limit in [64 * MB, MB] {
        let env = StreamEnv::builder().max_buffer_limit(limit as usize).build().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut stream = open(&env, &data, counted_link(data.clone(), calls.clone()));
        let section_size = 3 * MB;
        {
            let mut sections = new_stream_section_reader(&mut stream, section_size as usize, None).unwrap();
            let mut off = 0u64;
            while off < data.len() as u64 {
                let len = section_size.min(data.len() as u64 - off);
                let mut section = sections.get_section_reader(off, len).unwrap();
                assert_eq!(section.len(), len);

                // hashed once, then read again for the upload
                for _ in 0..2 {
                    let mut got = Vec::new();
                    std::io::Seek::rewind(&mut section).unwrap();
                    section.read_to_end(&mut got).unwrap();
                    assert!(got[..] == data[off as usize..(off + len) as usize]);
                }
                sections.free_section_reader(section);
                off += len;
            }
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1, "limit {limit}");
        stream.close().unwrap();
    }
}

//! # linkstream
//!
//! linkstream turns "a link to some bytes somewhere" into a stream you can read sequentially,
//! jump around in, and hand to an uploader that wants fixed-size parts. On top of that it moves
//! files between storages in batches, refreshing destination listings once per batch.
//!
//! A link can be a plain URL, a custom range-reader closure, or a local positional handle. The
//! stream figures out how to serve each read: straight from the link, from a bounded in-memory
//! head buffer, or from a temp file once random access outgrows memory.
//!
//! ## Basic usage
//!
//! ```rust
//! use std::io::Read;
//! use std::sync::Arc;
//!
//! use linkstream::{Context, FileStream, FileStreamer, HttpRange, Link, ObjInfo, SeekableStream, StreamEnv};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let env = StreamEnv::builder().build()?;
//!
//! let data = Arc::new(b"hello, linkstream".to_vec());
//! let obj = Arc::new(ObjInfo::file("hello.txt", data.len() as u64));
//! let link = Link::from_mfile(data.clone(), data.len() as u64);
//!
//! let fs = FileStream::new(env, Context::new(), obj);
//! let mut stream = SeekableStream::new(fs, Some(link))?;
//!
//! let mut word = String::new();
//! stream.range_read(HttpRange::new(7, 10))?.read_to_string(&mut word)?;
//! assert_eq!(word, "linkstream");
//!
//! stream.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## How range reads are served
//!
//! A [`FileStream`] wraps a one-shot reader. Asking it for a byte window:
//! - uses the temp file if the stream was already spooled to disk
//! - uses the in-memory head buffer if the window fits inside it
//! - grows the head buffer if the window ends below `max_buffer_limit`
//! - otherwise spools the whole stream into a temp file
//!
//! A [`SeekableStream`] adds a [`RangeReader`] from the link, so windows go straight to the
//! source until the stream is spooled. Links with concurrency hints are fetched by a
//! multi-part [`Downloader`] that keeps parts in order.
//!
//! Streams take `&mut self` for reads. For positional reads from several threads (a multipart
//! uploader hashing parts in parallel, say) wrap the stream in a [`RangeReadReadAtSeeker`]: it
//! keeps a few forward readers around keyed by offset and reuses the nearest one.
//!
//! ## Chunked uploads
//!
//! [`new_stream_section_reader`] hands out fixed-size sections of a stream, each re-readable until
//! freed. Small sections live in pooled buffers (anonymous mmap above `mmap_threshold`), large
//! ones in slots of a sparse temp file.
//!
//! ## Transfers
//!
//! [`TransferService::transfer`] copies or moves an object between mounted storages. Directories
//! fan out into one task per child. Tasks writing into the same destination directory form a
//! batch in the [`TransferCoordinator`]: when the last one finishes the listing cache is
//! invalidated once, and move sources are deleted only if the whole batch succeeded.
//!
//! ## Tuning the behavior
//!
//! ```rust
//! use linkstream::StreamEnv;
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let env = StreamEnv::builder()
//!     .max_buffer_limit(8 * 1024 * 1024)   // keep at most 8MB of head in memory
//!     .temp_dir(std::env::temp_dir())       // where spooled streams go
//!     .download_concurrency(4)              // default parallelism for hinted links
//!     .retry_max_attempts(5)                // per part, before giving up
//!     .connect_timeout(Duration::from_secs(10))
//!     .build()?;
//! # let _ = env;
//! # Ok(())
//! # }
//! ```
//!
//! ## Errors
//!
//! Everything returns [`FsError`]. Cancellation (`Canceled`, `DeadlineExceeded`) survives a trip
//! through `std::io::Error`, so `FsError::is_canceled()` stays truthful after a `Read` call.
//! Out-of-order section requests, a stream with neither reader nor link, and negative seeks are
//! `Protocol` errors and never worth retrying.
//!
//! ## Feature flags
//!
//! - `curl` (default): use libcurl for HTTP
//! - `reqwest`: use reqwest instead of curl (don't enable both)

pub mod buffer;
pub mod config;
pub mod coordinator;
pub mod core;
pub mod downloader;
pub mod driver;
pub mod flight;
pub mod http;
pub mod model;
pub mod plug;
pub mod range;
pub mod read_at;
pub mod section;
pub mod stream;
pub mod transfer;
pub mod util;

pub use crate::buffer::PooledBuf;
pub use crate::config::*;
pub use crate::coordinator::*;
pub use crate::core::*;
pub use crate::downloader::*;
pub use crate::driver::*;
pub use crate::flight::Flight;
pub use crate::http::*;
pub use crate::model::*;
pub use crate::plug::*;
pub use crate::range::*;
pub use crate::read_at::*;
pub use crate::section::*;
pub use crate::stream::*;
pub use crate::transfer::*;
pub use crate::util::*;

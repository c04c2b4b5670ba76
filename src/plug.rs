use std::fmt;
use std::sync::Arc;

use crate::config::StreamConfig;
#[cfg(feature = "reqwest")]
use crate::core::FsError;
use crate::core::{BoxReader, HttpRange, Result};

/// Response head plus a streaming body.
pub struct HttpResponse {
    pub status: u16,
    pub content_length: Option<u64>,
    pub content_range: Option<(u64, u64)>,
    pub body: BoxReader,
}

impl HttpResponse {
    pub fn new(status: u16, body: BoxReader) -> Self {
        Self {
            status,
            content_length: None,
            content_range: None,
            body,
        }
    }
}

impl fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("content_length", &self.content_length)
            .field("content_range", &self.content_range)
            .finish_non_exhaustive()
    }
}

/// Blocking HTTP transport. Status codes >= 400 are returned as `FsError::HttpStatus`.
pub trait BlockingHttp: Send + Sync {
    fn get(
        &self,
        url: &str,
        headers: &[(String, String)],
        range: Option<HttpRange>,
    ) -> Result<HttpResponse>;
}

#[cfg(all(not(feature = "reqwest"), not(feature = "curl")))]
compile_error!("Enable either `curl` (default) or `reqwest` feature.");

pub(crate) fn build_default_transport(config: &StreamConfig) -> Result<Arc<dyn BlockingHttp>> {
    #[cfg(feature = "reqwest")]
    {
        Ok(Arc::new(ReqwestBlockingTransport::new(config)?))
    }
    #[cfg(all(not(feature = "reqwest"), feature = "curl"))]
    {
        Ok(Arc::new(CurlBlockingTransport::new(config)))
    }
}

/// Parses `bytes <start>-<end>/<total>` into `(start, end)`.
pub fn parse_content_range(header: &str) -> Option<(u64, u64)> {
    let parts: Vec<&str> = header.split_whitespace().collect();
    if parts.len() < 2 || parts[0] != "bytes" {
        return None;
    }

    let range_part = parts[1].split('/').next()?;
    let mut range_iter = range_part.split('-');

    let start = range_iter.next()?.parse::<u64>().ok()?;
    let end = range_iter.next()?.parse::<u64>().ok()?;

    Some((start, end))
}

#[cfg(feature = "reqwest")]
struct ReqwestBlockingTransport {
    client: reqwest::blocking::Client,
}

#[cfg(feature = "reqwest")]
impl ReqwestBlockingTransport {
    fn new(config: &StreamConfig) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(None::<std::time::Duration>)
            .connect_timeout(config.connect_timeout)
            .pool_idle_timeout(config.idle_timeout)
            .build()
            .map_err(|e| FsError::Network(e.to_string()))?;

        Ok(Self { client })
    }
}

#[cfg(feature = "reqwest")]
impl BlockingHttp for ReqwestBlockingTransport {
    fn get(
        &self,
        url: &str,
        headers: &[(String, String)],
        range: Option<HttpRange>,
    ) -> Result<HttpResponse> {
        let mut request = self.client.get(url);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(range) = range {
            request = request.header("Range", range.header_value());
        }

        let response = request
            .send()
            .map_err(|e| FsError::Network(e.to_string()))?;

        let status = response.status().as_u16();
        if status >= 400 {
            return Err(FsError::HttpStatus(status));
        }

        let content_length = response.content_length();
        let content_range = response
            .headers()
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range);

        Ok(HttpResponse {
            status,
            content_length,
            content_range,
            body: Box::new(response),
        })
    }
}

#[cfg(all(not(feature = "reqwest"), feature = "curl"))]
pub(crate) use curl_transport::CurlBlockingTransport;

#[cfg(all(not(feature = "reqwest"), feature = "curl"))]
mod curl_transport {
    use std::io::{self, Read};
    use std::sync::mpsc::{self, Receiver, SyncSender};
    use std::thread;
    use std::time::Duration;

    use ahash::AHashMap as HashMap;
    use curl::easy::{Easy2, Handler, List, WriteError};

    use super::{BlockingHttp, HttpResponse, parse_content_range};
    use crate::config::StreamConfig;
    use crate::core::{FsError, HttpRange, Result};

    // Chunks buffered between the transfer thread and the reader.
    const CHANNEL_DEPTH: usize = 16;

    enum CurlEvent {
        Head {
            status: u16,
            headers: HashMap<String, String>,
        },
        Data(Vec<u8>),
        Done(std::result::Result<(), String>),
    }

    struct StreamingCollector {
        tx: SyncSender<CurlEvent>,
        status: u16,
        headers: HashMap<String, String>,
        head_sent: bool,
    }

    impl StreamingCollector {
        fn send_head(&mut self) -> bool {
            if self.head_sent {
                return true;
            }
            self.head_sent = true;
            self.tx
                .send(CurlEvent::Head {
                    status: self.status,
                    headers: std::mem::take(&mut self.headers),
                })
                .is_ok()
        }
    }

    impl Handler for StreamingCollector {
        fn write(&mut self, data: &[u8]) -> std::result::Result<usize, WriteError> {
            // a short write aborts the transfer once the reader is gone
            if !self.send_head() {
                return Ok(0);
            }
            match self.tx.send(CurlEvent::Data(data.to_vec())) {
                Ok(()) => Ok(data.len()),
                Err(_) => Ok(0),
            }
        }

        fn header(&mut self, data: &[u8]) -> bool {
            if let Ok(line) = std::str::from_utf8(data) {
                let line = line.trim();
                if line.starts_with("HTTP/") {
                    self.status = line
                        .split_whitespace()
                        .nth(1)
                        .and_then(|code| code.parse().ok())
                        .unwrap_or(0);
                    self.headers.clear();
                } else if let Some((name, value)) = line.split_once(':') {
                    self.headers
                        .insert(name.trim().to_ascii_lowercase(), value.trim().into());
                }
            }
            true
        }
    }

    struct CurlBody {
        rx: Receiver<CurlEvent>,
        buf: Vec<u8>,
        pos: usize,
        finished: bool,
    }

    impl Read for CurlBody {
        fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
            loop {
                if self.pos < self.buf.len() {
                    let n = out.len().min(self.buf.len() - self.pos);
                    out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
                    self.pos += n;
                    return Ok(n);
                }
                if self.finished || out.is_empty() {
                    return Ok(0);
                }
                match self.rx.recv() {
                    Ok(CurlEvent::Data(data)) => {
                        self.buf = data;
                        self.pos = 0;
                    }
                    Ok(CurlEvent::Head { .. }) => {}
                    Ok(CurlEvent::Done(Ok(()))) => self.finished = true,
                    Ok(CurlEvent::Done(Err(e))) => {
                        self.finished = true;
                        return Err(FsError::Network(e).into());
                    }
                    Err(_) => {
                        self.finished = true;
                        return Err(FsError::Network("transfer thread exited".into()).into());
                    }
                }
            }
        }
    }

    pub(crate) struct CurlBlockingTransport {
        connect_timeout: Duration,
        read_timeout: Duration,
    }

    impl CurlBlockingTransport {
        pub(crate) fn new(config: &StreamConfig) -> Self {
            Self {
                connect_timeout: config.connect_timeout,
                read_timeout: config.read_timeout,
            }
        }

        fn prepare(
            &self,
            url: &str,
            headers: &[(String, String)],
            range: Option<HttpRange>,
            tx: SyncSender<CurlEvent>,
        ) -> Result<Easy2<StreamingCollector>> {
            let mut easy = Easy2::new(StreamingCollector {
                tx,
                status: 0,
                headers: HashMap::new(),
                head_sent: false,
            });
            easy.url(url).map_err(|e| FsError::Network(e.to_string()))?;
            easy.connect_timeout(self.connect_timeout)
                .map_err(|e| FsError::Network(e.to_string()))?;
            // abort stalled transfers instead of capping the total duration
            easy.low_speed_limit(1)
                .map_err(|e| FsError::Network(e.to_string()))?;
            easy.low_speed_time(self.read_timeout)
                .map_err(|e| FsError::Network(e.to_string()))?;
            easy.follow_location(true)
                .map_err(|e| FsError::Network(e.to_string()))?;

            let mut list = List::new();
            for (name, value) in headers {
                list.append(&format!("{name}: {value}"))
                    .map_err(|e| FsError::Network(e.to_string()))?;
            }
            if let Some(range) = range {
                list.append(&format!("Range: {}", range.header_value()))
                    .map_err(|e| FsError::Network(e.to_string()))?;
            }
            easy.http_headers(list)
                .map_err(|e| FsError::Network(e.to_string()))?;
            Ok(easy)
        }
    }

    impl BlockingHttp for CurlBlockingTransport {
        fn get(
            &self,
            url: &str,
            headers: &[(String, String)],
            range: Option<HttpRange>,
        ) -> Result<HttpResponse> {
            let (tx, rx) = mpsc::sync_channel(CHANNEL_DEPTH);
            let easy = self.prepare(url, headers, range, tx)?;

            thread::spawn(move || {
                let result = easy.perform().map_err(|e| e.to_string());
                let mut easy = easy;
                let collector = easy.get_mut();
                if collector.send_head() {
                    let _ = collector.tx.send(CurlEvent::Done(result));
                }
            });

            let (status, headers) = loop {
                match rx.recv() {
                    Ok(CurlEvent::Head { status, headers }) => break (status, headers),
                    Ok(CurlEvent::Done(Err(e))) => return Err(FsError::Network(e)),
                    Ok(_) => {}
                    Err(_) => return Err(FsError::Network("transfer thread exited".into())),
                }
            };

            if status == 0 {
                // no status line: the transfer failed before any response arrived
                return Err(match rx.recv() {
                    Ok(CurlEvent::Done(Err(e))) => FsError::Network(e),
                    _ => FsError::Network("empty response".into()),
                });
            }
            if status >= 400 {
                return Err(FsError::HttpStatus(status));
            }

            let content_length = headers
                .get("content-length")
                .and_then(|v| v.parse::<u64>().ok());
            let content_range = headers
                .get("content-range")
                .and_then(|value| parse_content_range(value));

            Ok(HttpResponse {
                status,
                content_length,
                content_range,
                body: Box::new(CurlBody {
                    rx,
                    buf: Vec::new(),
                    pos: 0,
                    finished: false,
                }),
            })
        }
    }
}

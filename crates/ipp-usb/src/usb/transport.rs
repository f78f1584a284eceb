//! The multiplexed HTTP-over-USB round-tripper. The hardest module in the
//! crate.
//!
//! libusb calls are blocking, so every actual bulk transfer here runs
//! inside `tokio::task::spawn_blocking`, while channel bookkeeping (the
//! idle pool, cancellation, deadlines) stays on the async side.
//! `spawn_blocking` already gives a thread per request, so the
//! `common::channel` bridge is reserved for hotplug events only (see
//! `usb::worker`).

use std::io::Write as _;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::{Duration, Instant};

use http::{HeaderMap, HeaderValue, Request, Response, StatusCode};
use hyper::body::{Bytes, HttpBody};
use rusb::{Context, Device, DeviceHandle};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::ipp;
use crate::quirks::{BuggyIppResponses, Quirks, QuirksDb};
use crate::usb::descriptors::UsbDeviceDesc;
use crate::usb::device::{self, OpenedDevice};
use crate::usb::io::{read_with_backoff, write_request};
use crate::usb::pool::{ChannelPool, PooledConn};

/// Request bodies under this size are fully buffered so that caller
/// cancellation mid-send can never strand bytes on the wire.
const SMALL_BODY_LIMIT: usize = 16 * 1024;

const HEAD_READ_CHUNK: usize = 1024;
const MAX_HEAD_BYTES: usize = 64 * 1024;

pub struct UsbTransport {
    pool: ChannelPool,
    quirks: Quirks,
    timeout: Duration,
    did_hard_reset: std::sync::atomic::AtomicBool,
    timed_out: std::sync::atomic::AtomicBool,
    handle: Arc<DeviceHandle<Context>>,
}

impl UsbTransport {
    /// Run the open sequence and build a transport ready to serve round-trips.
    pub fn open(
        device: &Device<Context>,
        desc: &UsbDeviceDesc,
        quirks_db: &QuirksDb,
        port_number: u8,
        timeout: Duration,
    ) -> Result<(Self, crate::usb::descriptors::UsbDeviceInfo)> {
        let OpenedDevice {
            handle,
            info,
            quirks,
            channels,
            did_hard_reset,
        } = device::open(device, desc, quirks_db, port_number)?;

        let pool = ChannelPool::new(handle.clone(), channels, quirks.init_delay);
        let transport = UsbTransport {
            pool,
            quirks,
            timeout,
            did_hard_reset: std::sync::atomic::AtomicBool::new(did_hard_reset),
            timed_out: std::sync::atomic::AtomicBool::new(false),
            handle,
        };
        Ok((transport, info))
    }

    /// Whether the open-time hard reset already happened, so a retrying
    /// caller within this instance knows not to reset again.
    pub fn did_hard_reset(&self) -> bool {
        self.did_hard_reset.load(std::sync::atomic::Ordering::Acquire)
    }

    /// Whether a deadline has ever expired on this transport; latched so
    /// the device-instance layer can decide to force a reset.
    pub fn timeout_expired(&self) -> bool {
        self.timed_out.load(std::sync::atomic::Ordering::Acquire)
    }

    /// The effective quirks set resolved for this device, for callers that
    /// need to branch on it outside the round-trip path (e.g. the
    /// device-instance init sequence's `disable-fax`/`init-timeout`/
    /// `init-retry-partial` checks).
    pub fn quirks(&self) -> &Quirks {
        &self.quirks
    }

    pub fn idle_channels(&self) -> usize {
        self.pool.idle_count()
    }

    pub fn channel_count(&self) -> usize {
        self.pool.capacity()
    }

    /// The HTTP round-trip contract: check out a channel, send the request,
    /// read back the response.
    pub async fn round_trip(
        &self,
        mut request: Request<hyper::Body>,
        cancel: &CancellationToken,
    ) -> Result<Response<ChannelBody>> {
        apply_request_adjustments(request.headers_mut(), &self.quirks);

        let body_bytes = buffer_body(request.body_mut()).await?;
        let wire_body = frame_body(&body_bytes);
        let head_bytes = encode_request_head(&request, &wire_body);

        let pooled = match self.pool.checkout(cancel).await {
            Ok(p) => p,
            Err(e) => return Err(e),
        };

        if let Some(delay_until) = *pooled.next_earliest_send.lock().unwrap() {
            let now = Instant::now();
            if delay_until > now {
                tokio::time::sleep(delay_until - now).await;
            }
        }

        let deadline = if self.timeout.is_zero() {
            None
        } else {
            Some(Instant::now() + self.timeout)
        };

        let quirks = self.quirks.clone();
        let pooled = Arc::new(pooled);
        let write_pooled = pooled.clone();
        let write_deadline = deadline;
        let write_timeout = self.timeout;

        let send_delay_threshold = quirks.usb_send_delay_threshold;
        let send_delay = quirks.usb_send_delay;
        let zlp_send = quirks.zlp_send;
        let head_result = tokio::task::spawn_blocking(move || -> Result<ResponseHead> {
            write_request(
                &write_pooled.handle,
                write_pooled.if_addr.out_endpoint,
                &head_bytes,
                write_timeout,
                send_delay_threshold,
                send_delay,
                zlp_send,
            )?;
            *write_pooled.next_earliest_send.lock().unwrap() =
                Some(Instant::now() + quirks.request_delay);
            read_response_head(&write_pooled, write_timeout, write_deadline, &quirks)
        })
        .await;

        let head = match head_result {
            Ok(Ok(head)) => head,
            Ok(Err(e)) => {
                if matches!(e, Error::DeadlineExceeded) {
                    self.timed_out.store(true, std::sync::atomic::Ordering::Release);
                }
                return Err(e);
            }
            Err(_) => return Err(Error::Io("response-head read task panicked".into())),
        };

        let body_mode = head.body_mode;
        let (tx, rx) = mpsc::channel(4);
        let drain_timeout = self.timeout;
        let drain_quirks = self.quirks.clone();
        let prefetched = head.prefetched_body.clone();
        tokio::task::spawn_blocking(move || {
            drain_body(pooled, body_mode, prefetched, drain_timeout, deadline, &drain_quirks, tx);
        });

        let status = head.status;
        let headers = head.headers;
        let mut builder = Response::builder().status(status);
        *builder.headers_mut().unwrap() = headers;
        Ok(builder.body(ChannelBody { rx }).expect("valid response head"))
    }

    /// Stop accepting new checkouts, wait for in-flight channels to return.
    pub async fn shutdown(&self, cancel: &CancellationToken) {
        self.pool.begin_shutdown();
        let capacity = self.pool.capacity();
        loop {
            if self.pool.idle_count() >= capacity {
                return;
            }
            if cancel.is_cancelled() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Optionally reset the device, shut down, and drop all channels.
    pub async fn close(&self, reset: bool) {
        let force_reset = reset || self.pool.idle_count() < self.pool.capacity();
        self.shutdown(&CancellationToken::new()).await;
        if force_reset {
            if let Err(e) = self.handle.reset() {
                tracing::debug!("device reset on close failed: {e}");
            }
        }
    }
}

fn apply_request_adjustments(headers: &mut HeaderMap, quirks: &Quirks) {
    headers.remove(http::header::EXPECT);
    headers.remove(http::header::CONNECTION);
    if !headers.contains_key(http::header::USER_AGENT) {
        headers.insert(
            http::header::USER_AGENT,
            HeaderValue::from_static("ipp-usb"),
        );
    }
    for (name, value) in &quirks.http_headers {
        if let (Ok(name), Ok(value)) = (
            http::header::HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.insert(name, value);
        }
    }
}

async fn buffer_body(body: &mut hyper::Body) -> Result<Vec<u8>> {
    let mut buffered = Vec::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk.map_err(|e| Error::Io(format!("reading request body: {e}")))?;
        buffered.extend_from_slice(&chunk);
    }
    Ok(buffered)
}

enum WireBody {
    /// Empty or small-enough-to-buffer body, sent with an explicit
    /// Content-Length.
    Identity(Vec<u8>),
    /// Large body, reframed as chunked transfer encoding so a caller that
    /// closes mid-send cannot leave a dangling Content-Length promise.
    Chunked(Vec<u8>),
}

fn frame_body(body: &[u8]) -> WireBody {
    if body.len() < SMALL_BODY_LIMIT {
        WireBody::Identity(body.to_vec())
    } else {
        let mut framed = Vec::with_capacity(body.len() + 32);
        write!(framed, "{:x}\r\n", body.len()).unwrap();
        framed.extend_from_slice(body);
        framed.extend_from_slice(b"\r\n0\r\n\r\n");
        WireBody::Chunked(framed)
    }
}

fn encode_request_head(request: &Request<hyper::Body>, body: &WireBody) -> Vec<u8> {
    let mut head = Vec::with_capacity(512);
    let path = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    write!(head, "{} {} HTTP/1.1\r\n", request.method(), path).unwrap();

    for (name, value) in request.headers() {
        if name == http::header::CONTENT_LENGTH || name == http::header::TRANSFER_ENCODING {
            continue;
        }
        if let Ok(v) = value.to_str() {
            write!(head, "{name}: {v}\r\n").unwrap();
        }
    }

    match body {
        WireBody::Identity(bytes) => {
            write!(head, "content-length: {}\r\n\r\n", bytes.len()).unwrap();
            head.extend_from_slice(bytes);
        }
        WireBody::Chunked(framed) => {
            write!(head, "transfer-encoding: chunked\r\n\r\n").unwrap();
            head.extend_from_slice(framed);
        }
    }
    head
}

#[derive(Clone, Copy, Debug)]
enum BodyMode {
    ContentLength(u64),
    Chunked,
    /// Neither header present: read until the channel stalls (this is
    /// HTTP/1.1 traffic, so it should not normally happen).
    ReadUntilClose,
}

struct ResponseHead {
    status: StatusCode,
    headers: HeaderMap,
    body_mode: BodyMode,
    /// Bytes of the response that were already pulled off the wire while
    /// scanning for the head/body boundary, or prefetched for sanitization.
    prefetched_body: Vec<u8>,
}

fn read_response_head(
    conn: &crate::usb::pool::UsbConn,
    timeout: Duration,
    deadline: Option<Instant>,
    quirks: &Quirks,
) -> Result<ResponseHead> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = vec![0u8; HEAD_READ_CHUNK];
    let boundary = loop {
        if let Some(pos) = find_header_boundary(&buf) {
            break pos;
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(Error::BadResponse("response head too large".into()));
        }
        let n = read_with_backoff(conn, &mut chunk, timeout, deadline, quirks.zlp_recv_hack)?;
        if n == 0 {
            return Err(Error::BadResponse("device closed channel before headers completed".into()));
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let (head_bytes, rest) = buf.split_at(boundary);
    let rest = rest[4..].to_vec(); // skip the terminating CRLFCRLF

    let head_str = String::from_utf8_lossy(head_bytes);
    let mut lines = head_str.split("\r\n");
    let status_line = lines.next().unwrap_or("");
    let status = parse_status_line(status_line)?;

    let mut headers = HeaderMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            if let (Ok(name), Ok(value)) = (
                http::header::HeaderName::from_bytes(name.trim().as_bytes()),
                HeaderValue::from_str(value.trim()),
            ) {
                headers.append(name, value);
            }
        }
    }

    let body_mode = if headers
        .get(http::header::TRANSFER_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("chunked"))
    {
        BodyMode::Chunked
    } else if let Some(len) = headers
        .get(http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
    {
        BodyMode::ContentLength(len)
    } else {
        BodyMode::ReadUntilClose
    };

    let is_ipp = headers
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/ipp"));

    if is_ipp && quirks.buggy_ipp_responses == BuggyIppResponses::Sanitize {
        let full = read_full_body(conn, body_mode, rest, timeout, deadline, quirks.zlp_recv_hack)?;
        let sanitized = sanitize_ipp_body(&full, quirks.buggy_ipp_responses);
        headers.remove(http::header::TRANSFER_ENCODING);
        headers.insert(
            http::header::CONTENT_LENGTH,
            HeaderValue::from_str(&sanitized.len().to_string()).expect("digits are valid header value"),
        );
        return Ok(ResponseHead {
            status,
            headers,
            body_mode: BodyMode::ContentLength(sanitized.len() as u64),
            prefetched_body: sanitized,
        });
    }

    Ok(ResponseHead {
        status,
        headers,
        body_mode,
        prefetched_body: rest,
    })
}

/// Fully drain a response body of known framing into a single buffer, used
/// only by the `buggy-ipp-responses = sanitize` path (spec.md §4.1): the
/// re-encoded message must be spliced in before any bytes reach the caller,
/// so the whole body has to be in hand before the response head is built.
fn read_full_body(
    conn: &crate::usb::pool::UsbConn,
    mode: BodyMode,
    mut buffered: Vec<u8>,
    timeout: Duration,
    deadline: Option<Instant>,
    zlp_recv_hack: bool,
) -> Result<Vec<u8>> {
    match mode {
        BodyMode::ContentLength(len) => {
            let mut chunk = vec![0u8; HEAD_READ_CHUNK];
            while (buffered.len() as u64) < len {
                let n = read_with_backoff(conn, &mut chunk, timeout, deadline, zlp_recv_hack)?;
                if n == 0 {
                    break;
                }
                buffered.extend_from_slice(&chunk[..n]);
            }
            buffered.truncate(len as usize);
            Ok(buffered)
        }
        BodyMode::Chunked => dechunk_all(conn, buffered, timeout, deadline, zlp_recv_hack),
        BodyMode::ReadUntilClose => {
            let mut chunk = vec![0u8; HEAD_READ_CHUNK];
            loop {
                match read_with_backoff(conn, &mut chunk, timeout, deadline, zlp_recv_hack) {
                    Ok(0) => break,
                    Ok(n) => buffered.extend_from_slice(&chunk[..n]),
                    Err(Error::DeadlineExceeded) => break,
                    Err(e) => return Err(e),
                }
            }
            Ok(buffered)
        }
    }
}

/// Same chunked-transfer-encoding walk as `drain_chunked`, but collecting
/// the decoded bytes into one buffer instead of forwarding them to a
/// streaming channel as they arrive.
fn dechunk_all(
    conn: &crate::usb::pool::UsbConn,
    mut buffered: Vec<u8>,
    timeout: Duration,
    deadline: Option<Instant>,
    zlp_recv_hack: bool,
) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut read_more = |buffered: &mut Vec<u8>| -> Result<usize> {
        let mut chunk = vec![0u8; HEAD_READ_CHUNK];
        let n = read_with_backoff(conn, &mut chunk, timeout, deadline, zlp_recv_hack)?;
        buffered.extend_from_slice(&chunk[..n]);
        Ok(n)
    };

    loop {
        while find_header_boundary_crlf(&buffered).is_none() {
            if read_more(&mut buffered)? == 0 {
                return Err(Error::BadResponse("device closed channel mid-chunk-size".into()));
            }
        }
        let line_end = find_header_boundary_crlf(&buffered).unwrap();
        let size_line: String = buffered
            .drain(..line_end + 2)
            .collect::<Vec<u8>>()
            .iter()
            .map(|&b| b as char)
            .collect();
        let size_str = size_line.trim().split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_str, 16)
            .map_err(|_| Error::BadResponse(format!("invalid chunk size {size_str:?}")))?;

        if size == 0 {
            return Ok(out);
        }

        while buffered.len() < size + 2 {
            if read_more(&mut buffered)? == 0 {
                return Err(Error::BadResponse("device closed channel mid-chunk".into()));
            }
        }
        out.extend(buffered.drain(..size));
        buffered.drain(..2);
    }
}

fn find_header_boundary(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_status_line(line: &str) -> Result<StatusCode> {
    let mut parts = line.split_whitespace();
    let _version = parts.next();
    let code = parts
        .next()
        .ok_or_else(|| Error::BadResponse(format!("malformed status line {line:?}")))?;
    StatusCode::from_bytes(code.as_bytes())
        .map_err(|_| Error::BadResponse(format!("invalid status code {code:?}")))
}

/// Runs on a blocking thread for the lifetime of one response body: reads
/// the remaining bytes (content-length, chunked, or until-stall), forwards
/// them to the caller, then drops `pooled` which returns the channel to
/// the idle pool.
fn drain_body(
    pooled: Arc<PooledConn>,
    mode: BodyMode,
    prefetched: Vec<u8>,
    timeout: Duration,
    deadline: Option<Instant>,
    quirks: &Quirks,
    tx: mpsc::Sender<std::result::Result<Bytes, Error>>,
) {
    let result = (|| -> Result<()> {
        match mode {
            BodyMode::ContentLength(len) => {
                let mut remaining = len.saturating_sub(prefetched.len() as u64);
                if !prefetched.is_empty() {
                    forward(&tx, prefetched.clone());
                }
                let mut buf = vec![0u8; HEAD_READ_CHUNK];
                while remaining > 0 {
                    let n = read_with_backoff(&pooled, &mut buf, timeout, deadline, quirks.zlp_recv_hack)?;
                    if n == 0 {
                        break;
                    }
                    let take = (n as u64).min(remaining) as usize;
                    forward(&tx, buf[..take].to_vec());
                    remaining -= take as u64;
                }
            }
            BodyMode::Chunked => {
                drain_chunked(&pooled, prefetched, timeout, deadline, quirks, &tx)?;
            }
            BodyMode::ReadUntilClose => {
                if !prefetched.is_empty() {
                    forward(&tx, prefetched.clone());
                }
                let mut buf = vec![0u8; HEAD_READ_CHUNK];
                loop {
                    match read_with_backoff(&pooled, &mut buf, timeout, deadline, quirks.zlp_recv_hack) {
                        Ok(0) => break,
                        Ok(n) => forward(&tx, buf[..n].to_vec()),
                        Err(Error::DeadlineExceeded) => break,
                        Err(e) => return Err(e),
                    }
                }
            }
        }
        Ok(())
    })();

    if let Err(e) = result {
        let _ = tx.blocking_send(Err(e));
    }
    drop(pooled);
}

fn drain_chunked(
    conn: &crate::usb::pool::UsbConn,
    mut buffered: Vec<u8>,
    timeout: Duration,
    deadline: Option<Instant>,
    quirks: &Quirks,
    tx: &mpsc::Sender<std::result::Result<Bytes, Error>>,
) -> Result<()> {
    let mut read_more = |buffered: &mut Vec<u8>| -> Result<usize> {
        let mut chunk = vec![0u8; HEAD_READ_CHUNK];
        let n = read_with_backoff(conn, &mut chunk, timeout, deadline, quirks.zlp_recv_hack)?;
        buffered.extend_from_slice(&chunk[..n]);
        Ok(n)
    };

    loop {
        while find_header_boundary_crlf(&buffered).is_none() {
            if read_more(&mut buffered)? == 0 {
                return Err(Error::BadResponse("device closed channel mid-chunk-size".into()));
            }
        }
        let line_end = find_header_boundary_crlf(&buffered).unwrap();
        let size_line: String = buffered.drain(..line_end + 2).collect::<Vec<u8>>().iter().map(|&b| b as char).collect();
        let size_str = size_line.trim().split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_str, 16)
            .map_err(|_| Error::BadResponse(format!("invalid chunk size {size_str:?}")))?;

        if size == 0 {
            while buffered.len() < 2 {
                if read_more(&mut buffered)? == 0 {
                    break;
                }
            }
            return Ok(());
        }

        while buffered.len() < size + 2 {
            if read_more(&mut buffered)? == 0 {
                return Err(Error::BadResponse("device closed channel mid-chunk".into()));
            }
        }
        let chunk_data: Vec<u8> = buffered.drain(..size).collect();
        buffered.drain(..2); // trailing CRLF after chunk data
        forward(tx, chunk_data);
    }
}

fn find_header_boundary_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn forward(tx: &mpsc::Sender<std::result::Result<Bytes, Error>>, data: Vec<u8>) {
    if data.is_empty() {
        return;
    }
    let _ = tx.blocking_send(Ok(Bytes::from(data)));
}

/// Re-encode an `application/ipp` response when `buggy-ipp-responses =
/// sanitize`. Pass-through on anything that doesn't even lenient-decode.
pub fn sanitize_ipp_body(raw: &[u8], mode: BuggyIppResponses) -> Vec<u8> {
    match mode {
        BuggyIppResponses::Allow | BuggyIppResponses::Reject => raw.to_vec(),
        BuggyIppResponses::Sanitize => match ipp::decode_lenient(raw) {
            Some(message) => ipp::encode_strict(&message),
            None => raw.to_vec(),
        },
    }
}

/// The lazily-consumed response body handed back to HTTP callers. Backed by
/// an mpsc channel fed by the background drain task; dropping it before
/// exhaustion still lets the drain task finish and release the channel.
pub struct ChannelBody {
    rx: mpsc::Receiver<std::result::Result<Bytes, Error>>,
}

impl HttpBody for ChannelBody {
    type Data = Bytes;
    type Error = Error;

    fn poll_data(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<Option<std::result::Result<Self::Data, Self::Error>>> {
        self.rx.poll_recv(cx)
    }

    fn poll_trailers(
        self: Pin<&mut Self>,
        _cx: &mut TaskContext<'_>,
    ) -> Poll<std::result::Result<Option<HeaderMap>, Self::Error>> {
        Poll::Ready(Ok(None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_body_is_identity_framed() {
        match frame_body(b"hello") {
            WireBody::Identity(b) => assert_eq!(b, b"hello"),
            WireBody::Chunked(_) => panic!("expected identity framing"),
        }
    }

    #[test]
    fn large_body_is_chunk_framed() {
        let body = vec![b'x'; SMALL_BODY_LIMIT + 1];
        match frame_body(&body) {
            WireBody::Chunked(framed) => {
                assert!(framed.starts_with(format!("{:x}\r\n", body.len()).as_bytes()));
                assert!(framed.ends_with(b"\r\n0\r\n\r\n"));
            }
            WireBody::Identity(_) => panic!("expected chunked framing"),
        }
    }

    #[test]
    fn status_line_parses() {
        assert_eq!(parse_status_line("HTTP/1.1 200 OK").unwrap(), StatusCode::OK);
        assert!(parse_status_line("garbage").is_err());
    }

    #[test]
    fn header_boundary_detection() {
        assert_eq!(find_header_boundary(b"HTTP/1.1 200 OK\r\n\r\nbody"), Some(17));
        assert_eq!(find_header_boundary(b"no boundary here"), None);
    }
}

//! The HTTP reverse-proxy shim: a standard HTTP server whose round-tripper
//! is the USB transport, copying headers and bodies between a normal
//! `hyper` HTTP/1.1 listener and `UsbTransport`.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use http::{HeaderValue, Request, Response, StatusCode};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Server};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Error;
use crate::usb::UsbTransport;

/// Headers that must not be forwarded between hops (RFC 7230 §6.1), plus
/// `Host` which we rewrite rather than drop outright.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Runs the proxy on an already-bound listener until `cancel` fires.
/// `device_host` is what `Host` gets rewritten to before forwarding.
pub async fn serve(
    listener: std::net::TcpListener,
    transport: Arc<UsbTransport>,
    device_host: String,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    listener.set_nonblocking(true)?;
    let listener = TcpListener::from_std(listener)?;
    let local_addr = listener.local_addr()?;

    let make_svc = make_service_fn(move |_conn| {
        let transport = transport.clone();
        let device_host = device_host.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                handle(transport.clone(), device_host.clone(), req)
            }))
        }
    });

    let server = Server::from_tcp(listener.into_std()?)
        .map_err(std::io::Error::other)?
        .serve(make_svc);

    debug!("HTTP proxy listening on {local_addr}");

    tokio::select! {
        result = server => result.map_err(std::io::Error::other),
        _ = cancel.cancelled() => Ok(()),
    }
}

/// Find a free port in `[min, max]`, skipping any already claimed by
/// another device's state file. Tries the previously-persisted port first.
pub fn allocate_port(min: u16, max: u16, preferred: Option<u16>, taken: &[u16]) -> Option<(u16, std::net::TcpListener)> {
    let candidates = preferred.into_iter().chain(min..=max);
    for port in candidates {
        if taken.contains(&port) {
            continue;
        }
        if let Ok(listener) = std::net::TcpListener::bind(("127.0.0.1", port)) {
            return Some((port, listener));
        }
    }
    None
}

async fn handle(
    transport: Arc<UsbTransport>,
    device_host: String,
    mut request: Request<Body>,
) -> Result<Response<Body>, Infallible> {
    strip_hop_by_hop(request.headers_mut());
    if let Ok(value) = HeaderValue::from_str(&device_host) {
        request.headers_mut().insert(http::header::HOST, value);
    }

    let cancel = CancellationToken::new();
    match transport.round_trip(request, &cancel).await {
        Ok(response) => {
            let (parts, body) = response.into_parts();
            let (sender, out_body) = Body::channel();
            tokio::spawn(forward_body(body, sender));
            Ok(Response::from_parts(parts, out_body))
        }
        Err(e) => Ok(error_response(e)),
    }
}

/// Pumps `transport::ChannelBody` (an `HttpBody`, not a `Stream`) into a
/// `hyper::Body` sender one chunk at a time. Plain `poll_fn` avoids pulling
/// in a `futures`/`futures-core` dependency for a single adaptor.
async fn forward_body(mut body: crate::usb::ChannelBody, sender: hyper::body::Sender) {
    let mut sender = sender;
    loop {
        let chunk = std::future::poll_fn(|cx| {
            hyper::body::HttpBody::poll_data(std::pin::Pin::new(&mut body), cx)
        })
        .await;

        match chunk {
            Some(Ok(bytes)) => {
                if sender.send_data(bytes).await.is_err() {
                    break;
                }
            }
            Some(Err(e)) => {
                warn!("error draining device response body: {e}");
                sender.abort();
                break;
            }
            None => break,
        }
    }
}

fn strip_hop_by_hop(headers: &mut http::HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

fn error_response(error: Error) -> Response<Body> {
    let status = match error {
        Error::Io(_) | Error::Shutdown => StatusCode::SERVICE_UNAVAILABLE,
        Error::DeadlineExceeded | Error::Canceled => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    warn!("proxy round-trip failed: {error}");
    Response::builder()
        .status(status)
        .body(Body::from(error.to_string()))
        .expect("valid error response")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_allocation_prefers_previous_port() {
        let (port, _listener) = allocate_port(60000, 60010, Some(60005), &[]).unwrap();
        assert_eq!(port, 60005);
    }

    #[test]
    fn port_allocation_skips_taken_ports() {
        let (port, _listener) = allocate_port(60000, 60002, None, &[60000, 60001]).unwrap();
        assert_eq!(port, 60002);
    }

    #[test]
    fn port_allocation_fails_when_min_equals_max_and_taken() {
        assert!(allocate_port(60000, 60000, None, &[60000]).is_none());
    }

    #[test]
    fn error_status_mapping() {
        assert_eq!(error_response(Error::Shutdown).status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(error_response(Error::DeadlineExceeded).status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(error_response(Error::BadResponse("x".into())).status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}

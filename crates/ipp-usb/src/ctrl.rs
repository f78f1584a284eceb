//! The control socket: a UNIX-domain HTTP/1.1 listener with exactly one
//! handler, `GET /status`, returning plain-text daemon and per-device
//! status. A hand-rolled minimal responder, since the socket only ever
//! answers one request shape and doesn't warrant a general HTTP server.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Shared snapshot of per-device status lines, refreshed by the PnP
/// controller after every reconcile and read by every `/status` request
/// without touching the controller's own state.
pub type StatusHandle = Arc<Mutex<Vec<String>>>;

pub fn new_status_handle() -> StatusHandle {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn default_path() -> PathBuf {
    PathBuf::from("/var/ipp-usb/ctrl")
}

/// Accepts connections on `path` until `cancel` fires, answering every
/// request with the current `/status` snapshot regardless of the request
/// line (the only documented handler).
pub async fn serve(path: &Path, status: StatusHandle, cancel: CancellationToken) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let _ = std::fs::remove_file(path);
    let listener = UnixListener::bind(path)?;
    debug!("control socket listening on {}", path.display());

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _) = accepted?;
                let status = status.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, status).await {
                        debug!("control socket connection error: {e}");
                    }
                });
            }
            _ = cancel.cancelled() => {
                let _ = std::fs::remove_file(path);
                return Ok(());
            }
        }
    }
}

async fn handle_connection(
    mut stream: tokio::net::UnixStream,
    status: StatusHandle,
) -> std::io::Result<()> {
    // Only the request line matters (there is exactly one handler); read
    // and discard whatever the client sends up to the blank line.
    let mut buf = [0u8; 4096];
    let mut total = Vec::new();
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        total.extend_from_slice(&buf[..n]);
        if total.windows(4).any(|w| w == b"\r\n\r\n") || total.len() > 64 * 1024 {
            break;
        }
    }

    let lines = status.lock().map(|g| g.clone()).unwrap_or_default();
    let body = render_status(&lines);
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

fn render_status(device_lines: &[String]) -> String {
    if device_lines.is_empty() {
        "ipp-usb: running, no devices\n".to_string()
    } else {
        let mut out = format!("ipp-usb: running, {} device(s)\n", device_lines.len());
        for line in device_lines {
            out.push_str(line);
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_body_lists_every_device() {
        let body = render_status(&["printer-a 127.0.0.1:60001".to_string()]);
        assert!(body.contains("running, 1 device"));
        assert!(body.contains("printer-a"));
    }

    #[test]
    fn status_body_handles_idle_daemon() {
        let body = render_status(&[]);
        assert!(body.contains("no devices"));
    }
}

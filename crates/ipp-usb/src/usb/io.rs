//! Low-level bulk transfer primitives: the two operations IPP-USB
//! actually needs, aligned bulk writes and backed-off bulk reads on a
//! fixed endpoint pair.

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use rusb::{Context, DeviceHandle};

use crate::error::{Error, Result};
use crate::usb::pool::UsbConn;

/// USB 2.0/3.0 max-packet-size alignment libusb's bulk transfers require to
/// avoid buffer-overflow errors on some host controllers.
const READ_ALIGN: usize = 1024;

const BACKOFF_INITIAL: Duration = Duration::from_millis(10);
const BACKOFF_MULTIPLIER: f64 = 1.25;
const BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Round `requested` down to a multiple of 1024 when it is already ≥1024;
/// pass shorter requests through unchanged.
pub fn aligned_read_len(requested: usize) -> usize {
    if requested >= READ_ALIGN {
        (requested / READ_ALIGN) * READ_ALIGN
    } else {
        requested
    }
}

pub fn map_usb_error(e: rusb::Error) -> Error {
    match e {
        rusb::Error::Timeout => Error::DeadlineExceeded,
        other => Error::Io(other.to_string()),
    }
}

pub fn blocking_bulk_write(
    handle: &DeviceHandle<Context>,
    endpoint: u8,
    data: &[u8],
    timeout: Duration,
) -> Result<usize> {
    handle
        .write_bulk(endpoint, data, timeout)
        .map_err(map_usb_error)
}

/// Write the whole buffer, looping over short writes (libusb may split a
/// large transfer across several bulk packets internally, but callers of
/// `write_bulk` still see single calls return less than requested under
/// some backends).
pub fn write_all(
    handle: &DeviceHandle<Context>,
    endpoint: u8,
    mut data: &[u8],
    timeout: Duration,
) -> Result<()> {
    while !data.is_empty() {
        let n = blocking_bulk_write(handle, endpoint, data, timeout)?;
        if n == 0 {
            return Err(Error::Io("bulk write made no progress".into()));
        }
        data = &data[n..];
    }
    Ok(())
}

/// `write_all`, plus the `usb-send-delay`/`usb-send-delay-threshold` and
/// `zlp-send` quirks: a handful of devices misbehave when a large request
/// lands faster than they can drain their OUT fifo, or need an explicit
/// zero-length packet to notice the request is complete.
pub fn write_request(
    handle: &DeviceHandle<Context>,
    endpoint: u8,
    data: &[u8],
    timeout: Duration,
    send_delay_threshold: u64,
    send_delay: Duration,
    zlp_send: bool,
) -> Result<()> {
    if !send_delay.is_zero() && data.len() as u64 >= send_delay_threshold {
        std::thread::sleep(send_delay);
    }
    write_all(handle, endpoint, data, timeout)?;
    if zlp_send {
        blocking_bulk_write(handle, endpoint, &[], timeout)?;
    }
    Ok(())
}

/// One bulk read respecting the 1024-byte alignment rule.
fn blocking_bulk_read(
    handle: &DeviceHandle<Context>,
    endpoint: u8,
    buf: &mut [u8],
    timeout: Duration,
) -> Result<usize> {
    let len = aligned_read_len(buf.len());
    handle
        .read_bulk(endpoint, &mut buf[..len], timeout)
        .map_err(map_usb_error)
}

/// Read at least one byte, retrying zero-length reads with exponential
/// backoff and applying the `zlp-recv-hack` quirk.
///
/// `deadline`, if set, bounds the whole retry loop; once past it the loop
/// gives up with `DeadlineExceeded` (or `Ok(0)` if the hack applies and the
/// channel already saw a zero-length read in this response).
pub fn read_with_backoff(
    conn: &UsbConn,
    buf: &mut [u8],
    timeout: Duration,
    deadline: Option<Instant>,
    zlp_recv_hack: bool,
) -> Result<usize> {
    let mut backoff = BACKOFF_INITIAL;
    loop {
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                if zlp_recv_hack && conn.saw_zero_length_read.load(Ordering::Acquire) {
                    return Ok(0);
                }
                return Err(Error::DeadlineExceeded);
            }
        }

        match blocking_bulk_read(&conn.handle, conn.if_addr.in_endpoint, buf, timeout) {
            Ok(0) => {
                conn.saw_zero_length_read.store(true, Ordering::Release);
                tracing::trace!(channel = conn.index, ?backoff, "zero-length bulk read, retrying");
                std::thread::sleep(backoff);
                backoff = backoff.mul_f64(BACKOFF_MULTIPLIER).min(BACKOFF_MAX);
            }
            Ok(n) => {
                conn.saw_zero_length_read.store(false, Ordering::Release);
                return Ok(n);
            }
            Err(Error::DeadlineExceeded) if zlp_recv_hack && conn.saw_zero_length_read.load(Ordering::Acquire) => {
                return Ok(0);
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_rounds_down_at_or_above_1024() {
        assert_eq!(aligned_read_len(1023), 1023);
        assert_eq!(aligned_read_len(1024), 1024);
        assert_eq!(aligned_read_len(1025), 1024);
        assert_eq!(aligned_read_len(2048), 2048);
        assert_eq!(aligned_read_len(2049), 2048);
    }

    #[test]
    fn backoff_schedule_grows_and_caps() {
        let mut b = BACKOFF_INITIAL;
        for _ in 0..50 {
            b = b.mul_f64(BACKOFF_MULTIPLIER).min(BACKOFF_MAX);
        }
        assert_eq!(b, BACKOFF_MAX);
    }
}

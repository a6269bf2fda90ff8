//! ## Transaction engine
//!
//! Sequences multi-packet writes and reads over the bulk endpoints: bTag
//! allocation, EOM handling, short-packet and bTag-mismatch tolerance
//!. Every function here is a leaf with respect to recovery —
//! on an unrecoverable condition (timeout, a second bTag mismatch, a
//! cancellation) it returns the matching [`Error`] and leaves deciding what
//! to do about it to the device state machine in `state.rs`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::capabilities::Capabilities;
use crate::constants::misc;
use crate::error::Error;
use crate::frame::{decode_response, encode_dev_dep_msg_out, encode_request_dev_dep_msg_in};
use crate::quirks::{HookDeviceInfo, HookOutcome, QuirksRecord};
use crate::transport::UsbTransport;
use crate::types::{BTagCounter, Endpoints};

/// A cooperative cancellation flag shared between a caller and an
/// in-progress `read`/`query`/`write`.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        CancellationToken(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The mutable data a `before_*`/`after_*` hook may inspect or replace
///.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransactionSnapshot {
    pub bytes: Vec<u8>,
    pub eom: bool,
    pub term_char: Option<u8>,
}

/// Bookkeeping for one live write-then-read, write-only, or read-only
/// operation. `device.rs`'s state machine owns
/// the single live instance per direction; this crate enforces "at most one
/// transaction per direction per device may be live" there, not here.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub b_tag: u8,
    pub direction: rusb::Direction,
    pub bytes_total: usize,
    pub bytes_done: usize,
    pub deadline: Instant,
}

fn run_hook_transaction(
    hook: &Option<Arc<dyn Fn(&HookDeviceInfo, &TransactionSnapshot) -> HookOutcome<TransactionSnapshot> + Send + Sync>>,
    device_info: &HookDeviceInfo,
    snapshot: TransactionSnapshot,
) -> Result<TransactionSnapshot, Error> {
    match hook {
        None => Ok(snapshot),
        Some(hook) => match hook(device_info, &snapshot) {
            HookOutcome::Continue => Ok(snapshot),
            HookOutcome::Replace(replacement) => Ok(replacement),
            HookOutcome::Fail(err) => Err(err),
        },
    }
}

/// Cap a single segment's TransferSize. `wmax_packet_size` must be the
/// *direction-matching* endpoint's wMaxPacketSize (spec.md §3 lists
/// bulk-in's wMaxPacketSize as its own device-handle attribute, distinct
/// from bulk-out's) since the two can differ.
fn max_transfer_size(quirks: &QuirksRecord, wmax_packet_size: u16) -> u32 {
    quirks.max_transfer_size.unwrap_or_else(|| {
        (wmax_packet_size as u32 * misc::DEFAULT_PACKET_MULTIPLE).min(misc::DEFAULT_MAX_TRANSFER_SIZE)
    })
}

/// Write `bytes` to the bulk-out endpoint, splitting into
/// `min(max_transfer_size, wMaxPacketSize*K)`-sized segments. Returns the
/// number of payload bytes written.
#[allow(clippy::too_many_arguments)]
pub fn write_message(
    transport: &mut dyn UsbTransport,
    b_tag: &mut BTagCounter,
    endpoints: &Endpoints,
    quirks: &QuirksRecord,
    device_info: &HookDeviceInfo,
    bytes: &[u8],
    eom: bool,
    timeout: Duration,
    cancel: Option<&CancellationToken>,
) -> Result<usize, Error> {
    let snapshot = run_hook_transaction(
        &quirks.hooks.before_write,
        device_info,
        TransactionSnapshot {
            bytes: bytes.to_vec(),
            eom,
            term_char: None,
        },
    )?;

    let segment_size = max_transfer_size(quirks, endpoints.bulk_out.max_packet_size).max(1) as usize;
    let chunks: Vec<&[u8]> = if snapshot.bytes.is_empty() {
        vec![&snapshot.bytes[..]]
    } else {
        snapshot.bytes.chunks(segment_size).collect()
    };
    let n_chunks = chunks.len();

    let mut written = 0usize;
    for (i, chunk) in chunks.iter().enumerate() {
        if let Some(token) = cancel {
            if token.is_cancelled() {
                return Err(Error::Cancelled);
            }
        }

        let segment_eom = snapshot.eom && i + 1 == n_chunks;
        let tag = b_tag.next();
        let frame = encode_dev_dep_msg_out(tag, chunk, segment_eom);

        tracing::debug!(b_tag = tag, len = chunk.len(), eom = segment_eom, "bulk-out write");

        let result = transport.write_bulk(endpoints.bulk_out.address, &frame, timeout);
        let result = match result {
            Err(Error::IoTimeout) => {
                tracing::warn!(b_tag = tag, "bulk-out write timed out, retrying once");
                transport.write_bulk(endpoints.bulk_out.address, &frame, timeout)
            }
            other => other,
        };

        let n_written = result?;
        if n_written < frame.len() {
            return Err(Error::ProtocolViolation(format!(
                "bulk-out transfer truncated: wrote {n_written} of {} bytes",
                frame.len()
            )));
        }
        written += chunk.len();
    }

    if snapshot.eom && quirks.post_write_settle_us > 0 {
        std::thread::sleep(Duration::from_micros(quirks.post_write_settle_us));
    }

    run_hook_transaction(
        &quirks.hooks.after_write,
        device_info,
        TransactionSnapshot {
            bytes: snapshot.bytes,
            eom: snapshot.eom,
            term_char: None,
        },
    )?;

    Ok(written)
}

/// Read a response message from the bulk-in endpoint, issuing one
/// REQUEST_DEV_DEP_MSG_IN per segment.
/// Returns `(bytes, eom_seen)`.
#[allow(clippy::too_many_arguments)]
pub fn read_message(
    transport: &mut dyn UsbTransport,
    b_tag: &mut BTagCounter,
    endpoints: &Endpoints,
    capabilities: &Capabilities,
    quirks: &QuirksRecord,
    device_info: &HookDeviceInfo,
    max_bytes: usize,
    term_char_override: Option<u8>,
    timeout: Duration,
    cancel: Option<&CancellationToken>,
) -> Result<(Vec<u8>, bool), Error> {
    run_hook_transaction(
        &quirks.hooks.before_read,
        device_info,
        TransactionSnapshot {
            bytes: Vec::new(),
            eom: false,
            term_char: term_char_override,
        },
    )?;

    let cap = max_transfer_size(quirks, endpoints.bulk_in.max_packet_size) as usize;
    let term_char = term_char_override.or(if capabilities.usbtmc.accepts_term_char {
        Some(misc::DEFAULT_TERM_CHAR)
    } else {
        None
    });

    let mut output = Vec::new();
    let mut eom_seen = false;

    loop {
        if let Some(token) = cancel {
            if token.is_cancelled() {
                return Err(Error::Cancelled);
            }
        }

        let remaining = max_bytes.saturating_sub(output.len());
        let transfer_size = remaining.min(cap) as u32;

        let tag = b_tag.next();
        let request = encode_request_dev_dep_msg_in(tag, transfer_size, term_char);
        transport.write_bulk(endpoints.bulk_out.address, &request, timeout)?;

        let buf_capacity = misc::USBTMC_HEADER_SIZE + transfer_size as usize + 3;
        let mut buf = vec![0u8; buf_capacity];
        let n = transport.read_bulk(endpoints.bulk_in.address, &mut buf, timeout)?;
        buf.truncate(n);

        let (header, payload) = match decode_response(&buf, quirks.read_extra_alignment_padding) {
            Ok((header, payload)) if header.b_tag() == tag => (header, payload.to_vec()),
            Ok((header, _)) => {
                tracing::warn!(
                    expected = tag,
                    got = header.b_tag(),
                    "bTag mismatch on bulk-in response, retrying once"
                );
                // Fresh, full-sized buffer: the first (discarded) frame may
                // have been shorter than the real response, and `read_bulk`
                // can only ever fill up to the buffer's current length.
                let mut buf = vec![0u8; buf_capacity];
                let n = transport.read_bulk(endpoints.bulk_in.address, &mut buf, timeout)?;
                buf.truncate(n);
                let (header, payload) = decode_response(&buf, quirks.read_extra_alignment_padding)?;
                if header.b_tag() != tag {
                    return Err(Error::ProtocolViolation(format!(
                        "bTag mismatch persisted after retry: expected {tag}, got {}",
                        header.b_tag()
                    )));
                }
                (header, payload.to_vec())
            }
            Err(err) => return Err(err),
        };

        let short_packet = (payload.len() as u32) < transfer_size;
        eom_seen = header.eom() || (quirks.accept_short_read_as_eom && short_packet);

        output.extend_from_slice(&payload);

        if transfer_size == 0 {
            // Zero-length probe read: a single round trip always completes it.
            break;
        }
        if eom_seen || output.len() >= max_bytes {
            break;
        }
    }

    let snapshot = run_hook_transaction(
        &quirks.hooks.after_read,
        device_info,
        TransactionSnapshot {
            bytes: output,
            eom: eom_seen,
            term_char,
        },
    )?;

    Ok((snapshot.bytes, snapshot.eom))
}

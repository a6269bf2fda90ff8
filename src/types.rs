//! ## Types
//!
//! Plain data types shared across the crate: USB addressing, endpoints,
//! messages, and the bTag counter.
//!

use rusb::{Direction, TransferType};

/// USB bus/device address, as reported by libusb.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceAddr {
    /// USB bus number.
    pub bus: u8,
    /// USB device number on that bus.
    pub device: u8,
}

/// USB vendor/product identifier pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DeviceId {
    pub vendor_id: u16,
    pub product_id: u16,
}

/// Everything `devices()` can report about a USBTMC device without opening it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub address: DeviceAddr,
    pub serial: Option<String>,
}

/// The configuration/interface/setting triple identifying the claimed
/// USBTMC interface, plus enough bookkeeping to undo kernel-driver detach on
/// close.
#[derive(Debug, Clone, Default)]
pub struct DeviceMode {
    pub config_number: u8,
    pub interface_number: u8,
    pub setting_number: u8,
    pub protocol_code: u8,
    pub had_kernel_driver: bool,
}

/// Properties of a single endpoint relevant to USBTMC framing.
#[derive(Clone, Debug)]
pub struct Endpoint {
    pub address: u8,
    pub max_packet_size: u16,
    pub transfer_type: TransferType,
    pub direction: Direction,
}

/// The endpoint set spec.md §3 requires on a device handle: mandatory bulk
/// in/out, optional interrupt-in.
#[derive(Clone, Debug)]
pub struct Endpoints {
    pub bulk_out: Endpoint,
    pub bulk_in: Endpoint,
    pub interrupt_in: Option<Endpoint>,
}

/// A byte sequence with an End-Of-Message flag and optional TermChar hint
///.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Message {
    pub bytes: Vec<u8>,
    pub eom: bool,
    pub term_char: Option<u8>,
}

impl Message {
    pub fn new(bytes: Vec<u8>) -> Self {
        Message {
            bytes,
            eom: true,
            term_char: None,
        }
    }
}

/// A 1-255 transaction tag that skips 0, per spec.md invariant 1 and §4.2
/// ("the bTag counter starts at 1 after open and after every successful
/// INITIATE_CLEAR").
#[derive(Debug, Clone, Copy)]
pub struct BTagCounter {
    next: u8,
    last_issued: Option<u8>,
}

impl BTagCounter {
    pub fn new() -> Self {
        BTagCounter {
            next: 1,
            last_issued: None,
        }
    }

    /// Return the next tag and advance the counter, wrapping 255 -> 1.
    pub fn next(&mut self) -> u8 {
        let tag = self.next;
        self.next = if self.next == 255 { 1 } else { self.next + 1 };
        self.last_issued = Some(tag);
        tag
    }

    /// Reset to 1, as required after a successful `clear()`.
    pub fn reset(&mut self) {
        self.next = 1;
        self.last_issued = None;
    }

    /// The tag that will be handed out by the next call to `next()`. Not
    /// the tag of any live transaction; callers that need the bTag of a
    /// transaction already in flight want `last()`.
    pub fn current(&self) -> u8 {
        self.next
    }

    /// The tag most recently returned by `next()`, i.e. the bTag of the
    /// transaction still outstanding on the wire. `None` if no tag has been
    /// issued since construction or the last `reset()`.
    pub fn last(&self) -> Option<u8> {
        self.last_issued
    }
}

impl Default for BTagCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn btag_wraps_skipping_zero() {
        let mut tag = BTagCounter::new();
        assert_eq!(tag.next(), 1);
        for expected in 2..=255u16 {
            assert_eq!(tag.next() as u16, expected);
        }
        // wrapped past 255 back to 1, never emitting 0
        assert_eq!(tag.next(), 1);
    }

    #[test]
    fn btag_reset_returns_to_one() {
        let mut tag = BTagCounter::new();
        tag.next();
        tag.next();
        tag.reset();
        assert_eq!(tag.current(), 1);
        assert_eq!(tag.last(), None);
    }

    #[test]
    fn last_reports_the_issued_tag_not_the_next_one() {
        let mut tag = BTagCounter::new();
        assert_eq!(tag.last(), None);
        assert_eq!(tag.next(), 1);
        assert_eq!(tag.last(), Some(1));
        // `current()` already points at the *next* tag to hand out, which
        // is what a caller must not mistake for the live, outstanding tag.
        assert_eq!(tag.current(), 2);
        assert_eq!(tag.next(), 2);
        assert_eq!(tag.last(), Some(2));
    }

    #[test]
    fn last_tracks_the_wraparound() {
        let mut tag = BTagCounter::new();
        for _ in 1..=255u16 {
            tag.next();
        }
        assert_eq!(tag.last(), Some(255));
        assert_eq!(tag.next(), 1);
        assert_eq!(tag.last(), Some(1));
    }
}

//! ## Constants
//!
//! Wire-level constants used throughout the crate: USB class/subclass codes,
//! bulk header layout, USBTMC/USB488 control request numbers and status
//! codes.
//!

#[allow(unused)]
pub mod usb {
    /// The class code for USBTMC interfaces.
    pub const USBTMC_CLASS_CODE: u8 = 0xFE;
    /// The subclass code for USBTMC interfaces.
    pub const USBTMC_SUBCLASS_CODE: u8 = 0x03;
    /// Interface protocol code for a plain USBTMC interface (no USB488).
    pub const USBTMC_PROTOCOL_NONE: u8 = 0x00;
    /// Interface protocol code for the USB488 subclass.
    pub const USBTMC_PROTOCOL_USB488: u8 = 0x01;
}

#[allow(unused)]
pub mod misc {
    use std::time::Duration;

    /// The default logical I/O timeout applied to a freshly opened handle.
    pub const DEFAULT_TIMEOUT_DURATION: Duration = Duration::from_secs(2);
    /// The size in bytes of a USBTMC bulk header.
    pub const USBTMC_HEADER_SIZE: usize = 12;
    /// Default termination character used when a device advertises TermChar support
    /// and the caller has not overridden it (NI-VISA convention, `'\n'`).
    pub const DEFAULT_TERM_CHAR: u8 = b'\n';
    /// Default cap on a single BULK TransferSize field absent a quirks override.
    pub const DEFAULT_MAX_TRANSFER_SIZE: u32 = 1024 * 1024;
    /// Multiplier `K` applied to wMaxPacketSize when no quirks cap is present,
    /// bounding a single transaction engine segment to `wMaxPacketSize * K`.
    pub const DEFAULT_PACKET_MULTIPLE: u32 = 256;
    /// Backoff floor for polling a PENDING class-request status.
    pub const POLL_BACKOFF_FLOOR: Duration = Duration::from_millis(1);
    /// Backoff ceiling for polling a PENDING class-request status.
    pub const POLL_BACKOFF_CEIL: Duration = Duration::from_millis(100);
    /// Multiplier of the handle's I/O timeout used as the upper bound on how
    /// long CHECK_CLEAR_STATUS may return PENDING before the clear is treated
    /// as failed).
    pub const CLEAR_STATUS_TIMEOUT_MULTIPLE: u32 = 10;
}

#[allow(unused)]
pub mod usbtmc_status {
    /// Success.
    pub const STATUS_SUCCESS: u8 = 0x01;
    /// The device received a split-transaction CHECK_STATUS request and is still processing it.
    pub const STATUS_PENDING: u8 = 0x02;
    /// Failure for an unspecified or undefined reason.
    pub const STATUS_FAILED: u8 = 0x80;
    /// The device received an INITIATE_ABORT request but no transfer was in progress.
    pub const STATUS_TRANSFER_NOT_IN_PROGRESS: u8 = 0x81;
    /// The device received a CHECK_STATUS request with no INITIATE request outstanding.
    pub const STATUS_SPLIT_NOT_IN_PROGRESS: u8 = 0x82;
    /// The device received an INITIATE request while another was already in progress.
    pub const STATUS_SPLIT_IN_PROGRESS: u8 = 0x83;
}

#[allow(unused)]
pub mod control_requests {
    pub const INITIATE_ABORT_BULK_OUT: u8 = 1;
    pub const CHECK_ABORT_BULK_OUT_STATUS: u8 = 2;
    pub const INITIATE_ABORT_BULK_IN: u8 = 3;
    pub const CHECK_ABORT_BULK_IN_STATUS: u8 = 4;
    pub const INITIATE_CLEAR: u8 = 5;
    pub const CHECK_CLEAR_STATUS: u8 = 6;
    pub const GET_CAPABILITIES: u8 = 7;
    pub const INDICATOR_PULSE: u8 = 64;

    // USB488 subclass (USBTMC USB488 §4.3). bRequest space 64-66 named in
    // spec.md §6; 128 is the USB488 READ_STATUS_BYTE defined by the class.
    pub const READ_STATUS_BYTE: u8 = 128;
    pub const REN_CONTROL: u8 = 160;
    pub const GO_TO_LOCAL: u8 = 161;
    pub const LOCAL_LOCKOUT: u8 = 162;
}

#[allow(unused)]
pub mod bulk_msg_id {
    pub const DEVICE_DEPENDENT_MSG_OUT: u8 = 1;
    pub const REQUEST_DEVICE_DEPENDENT_MSG_IN: u8 = 2;
    pub const DEVICE_DEPENDENT_MSG_IN: u8 = 2;
    pub const VENDOR_SPECIFIC_MSG_OUT: u8 = 126;
    pub const REQUEST_VENDOR_SPECIFIC_MSG_IN: u8 = 127;
    pub const VENDOR_SPECIFIC_MSG_IN: u8 = 127;
    /// USB488 TRIGGER message: its own MsgID, a bulk-OUT frame with an
    /// empty payload (USB488 §3.2).
    pub const TRIGGER: u8 = 128;
}

//! ## Frame codec
//!
//! Encodes and decodes the 12-byte USBTMC bulk header. Pure
//! leaf module: no I/O, no locking, no knowledge of endpoints or bTag
//! allocation policy — the transaction engine owns those.
//!
//! Header layout (offsets in bytes):
//! `[0]=MsgID [1]=bTag [2]=bTagInverse [3]=0x00 [4..8]=TransferSize (LE u32)
//! [8]=bmTransferAttributes [9..12]=0x00` (with MsgID-specific use of byte 9
//! for TermChar on `RequestDevDepMsgIn`).

use crate::constants::{bulk_msg_id, misc};
use crate::error::Error;

/// One parsed (or about-to-be-serialized) USBTMC bulk header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Header {
    /// DEV_DEP_MSG_OUT (MsgID=1): a caller message segment.
    DevDepMsgOut { b_tag: u8, transfer_size: u32, eom: bool },
    /// REQUEST_DEV_DEP_MSG_IN (MsgID=2): a request for a response segment.
    RequestDevDepMsgIn {
        b_tag: u8,
        transfer_size: u32,
        term_char: Option<u8>,
    },
    /// DEV_DEP_MSG_IN (MsgID=2 response): a device response segment.
    DevDepMsgIn { b_tag: u8, transfer_size: u32, eom: bool },
    /// VENDOR_SPECIFIC_MSG_OUT (MsgID=126).
    VendorSpecificMsgOut { b_tag: u8, transfer_size: u32 },
    /// REQUEST_VENDOR_SPECIFIC_MSG_IN (MsgID=127).
    RequestVendorSpecificMsgIn { b_tag: u8, transfer_size: u32 },
    /// VENDOR_SPECIFIC_MSG_IN (MsgID=127 response).
    VendorSpecificMsgIn { b_tag: u8, transfer_size: u32 },
}

impl Header {
    pub fn b_tag(&self) -> u8 {
        match *self {
            Header::DevDepMsgOut { b_tag, .. }
            | Header::RequestDevDepMsgIn { b_tag, .. }
            | Header::DevDepMsgIn { b_tag, .. }
            | Header::VendorSpecificMsgOut { b_tag, .. }
            | Header::RequestVendorSpecificMsgIn { b_tag, .. }
            | Header::VendorSpecificMsgIn { b_tag, .. } => b_tag,
        }
    }

    pub fn transfer_size(&self) -> u32 {
        match *self {
            Header::DevDepMsgOut { transfer_size, .. }
            | Header::RequestDevDepMsgIn { transfer_size, .. }
            | Header::DevDepMsgIn { transfer_size, .. }
            | Header::VendorSpecificMsgOut { transfer_size, .. }
            | Header::RequestVendorSpecificMsgIn { transfer_size, .. }
            | Header::VendorSpecificMsgIn { transfer_size, .. } => transfer_size,
        }
    }

    /// `true` for response-shaped headers whose `eom` bit is set.
    pub fn eom(&self) -> bool {
        match *self {
            Header::DevDepMsgOut { eom, .. } | Header::DevDepMsgIn { eom, .. } => eom,
            _ => false,
        }
    }

    /// Serialize into a fresh 12-byte header.
    pub fn encode(&self) -> [u8; misc::USBTMC_HEADER_SIZE] {
        let mut header = [0u8; misc::USBTMC_HEADER_SIZE];
        let b_tag = self.b_tag();
        header[1] = b_tag;
        header[2] = !b_tag;
        header[4..8].copy_from_slice(&self.transfer_size().to_le_bytes());

        match *self {
            Header::DevDepMsgOut { eom, .. } => {
                header[0] = bulk_msg_id::DEVICE_DEPENDENT_MSG_OUT;
                if eom {
                    header[8] = 0b0000_0001;
                }
            }
            Header::RequestDevDepMsgIn { term_char, .. } => {
                header[0] = bulk_msg_id::REQUEST_DEVICE_DEPENDENT_MSG_IN;
                if let Some(tc) = term_char {
                    header[8] = 0b0000_0010;
                    header[9] = tc;
                }
            }
            Header::DevDepMsgIn { eom, .. } => {
                header[0] = bulk_msg_id::DEVICE_DEPENDENT_MSG_IN;
                if eom {
                    header[8] = 0b0000_0001;
                }
            }
            Header::VendorSpecificMsgOut { .. } => {
                header[0] = bulk_msg_id::VENDOR_SPECIFIC_MSG_OUT;
            }
            Header::RequestVendorSpecificMsgIn { .. } => {
                header[0] = bulk_msg_id::REQUEST_VENDOR_SPECIFIC_MSG_IN;
            }
            Header::VendorSpecificMsgIn { .. } => {
                header[0] = bulk_msg_id::VENDOR_SPECIFIC_MSG_IN;
            }
        }

        header
    }

    /// Decode a header found at the start of `buf`. `tolerate_reserved` (set
    /// by `QuirksRecord` overrides) relaxes the "reserved bytes are zero"
    /// check for devices known to misuse them.
    pub fn decode(buf: &[u8], tolerate_reserved: bool) -> Result<Header, Error> {
        if buf.len() < misc::USBTMC_HEADER_SIZE {
            return Err(Error::ProtocolViolation(format!(
                "header truncated: got {} bytes, need {}",
                buf.len(),
                misc::USBTMC_HEADER_SIZE
            )));
        }

        let msg_id = buf[0];
        let b_tag = buf[1];
        let b_tag_inverse = buf[2];
        if b_tag_inverse != !b_tag {
            return Err(Error::ProtocolViolation(format!(
                "bTagInverse {b_tag_inverse:#04x} does not complement bTag {b_tag:#04x}"
            )));
        }
        if !tolerate_reserved && buf[3] != 0x00 {
            return Err(Error::ProtocolViolation(
                "reserved byte 3 is nonzero".into(),
            ));
        }

        let transfer_size = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let attributes = buf[8];

        // Bytes 9..12 are reserved on every *response*-shaped header this
        // function ever sees (it never decodes a host-built
        // RequestDevDepMsgIn, which is the one header that legitimately
        // uses byte 9 for TermChar).
        if !tolerate_reserved && buf[9..12].iter().any(|&b| b != 0x00) {
            return Err(Error::ProtocolViolation(
                "reserved bytes 9..12 are nonzero".into(),
            ));
        }

        let header = match msg_id {
            bulk_msg_id::DEVICE_DEPENDENT_MSG_OUT => Header::DevDepMsgOut {
                b_tag,
                transfer_size,
                eom: attributes & 0b0000_0001 != 0,
            },
            // MsgID 2 is ambiguous between request and response shape; the
            // caller (transaction engine) always knows which it expects and
            // calls `decode_as_response`/`decode_as_request` instead. Plain
            // `decode` treats 2 as a response since that is the far more
            // common direction to parse off the wire (bulk-IN replies).
            bulk_msg_id::DEVICE_DEPENDENT_MSG_IN => Header::DevDepMsgIn {
                b_tag,
                transfer_size,
                eom: attributes & 0b0000_0001 != 0,
            },
            bulk_msg_id::VENDOR_SPECIFIC_MSG_OUT => {
                Header::VendorSpecificMsgOut { b_tag, transfer_size }
            }
            bulk_msg_id::VENDOR_SPECIFIC_MSG_IN => {
                Header::VendorSpecificMsgIn { b_tag, transfer_size }
            }
            other => {
                return Err(Error::ProtocolViolation(format!(
                    "unrecognized MsgID {other:#04x}"
                )))
            }
        };

        Ok(header)
    }
}

/// Pad `buf` with zero bytes until its length is a multiple of 4 (every bulk
/// payload must end on a 4-byte boundary).
pub fn pad_to_alignment(buf: &mut Vec<u8>) {
    let remainder = buf.len() % 4;
    if remainder != 0 {
        buf.resize(buf.len() + (4 - remainder), 0x00);
    }
}

/// Build a complete DEV_DEP_MSG_OUT frame (header + payload + padding).
pub fn encode_dev_dep_msg_out(b_tag: u8, payload: &[u8], eom: bool) -> Vec<u8> {
    let header = Header::DevDepMsgOut {
        b_tag,
        transfer_size: payload.len() as u32,
        eom,
    };
    let mut frame = Vec::with_capacity(misc::USBTMC_HEADER_SIZE + payload.len() + 3);
    frame.extend_from_slice(&header.encode());
    frame.extend_from_slice(payload);
    pad_to_alignment(&mut frame);
    frame
}

/// Build a REQUEST_DEV_DEP_MSG_IN frame (header only, no payload).
pub fn encode_request_dev_dep_msg_in(
    b_tag: u8,
    transfer_size: u32,
    term_char: Option<u8>,
) -> [u8; misc::USBTMC_HEADER_SIZE] {
    Header::RequestDevDepMsgIn {
        b_tag,
        transfer_size,
        term_char,
    }
    .encode()
}

/// Build the USB488 TRIGGER frame: MsgID 128, no payload (USB488 §3.2). This
/// is its own MsgID, not a VENDOR_SPECIFIC_MSG_OUT; the wire layout is
/// otherwise identical to a zero-length `DevDepMsgOut`.
pub fn encode_vendor_specific_trigger(b_tag: u8) -> Vec<u8> {
    let mut header = [0u8; misc::USBTMC_HEADER_SIZE];
    header[0] = bulk_msg_id::TRIGGER;
    header[1] = b_tag;
    header[2] = !b_tag;
    let mut frame = Vec::with_capacity(misc::USBTMC_HEADER_SIZE);
    frame.extend_from_slice(&header);
    frame
}

/// Split a decoded DEV_DEP_MSG_IN frame into its header and payload slice,
/// validating that `TransferSize` does not exceed the bytes actually
/// present in the response buffer.
pub fn decode_response(buf: &[u8], tolerate_reserved: bool) -> Result<(Header, &[u8]), Error> {
    let header = Header::decode(buf, tolerate_reserved)?;
    let available = buf.len() - misc::USBTMC_HEADER_SIZE;
    let transfer_size = header.transfer_size() as usize;
    if transfer_size > available {
        return Err(Error::ProtocolViolation(format!(
            "TransferSize {transfer_size} exceeds {available} bytes available in response"
        )));
    }
    let payload = &buf[misc::USBTMC_HEADER_SIZE..misc::USBTMC_HEADER_SIZE + transfer_size];
    Ok((header, payload))
}

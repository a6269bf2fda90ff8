//! ## Control-request layer
//!
//! USBTMC and USB488 class-specific control requests. Every
//! operation here is a single control transfer (or, for the ones that may
//! return `PENDING`, a bounded sequence of them) over [`UsbTransport`] — no
//! bulk-endpoint I/O, no state-machine recovery policy. `state.rs` decides
//! what a `FAILED`/timeout outcome from this layer means for the handle;
//! this module only ever reports what the device said.

use std::time::{Duration, Instant};

use crate::constants::{control_requests, misc, usbtmc_status};
use crate::error::{Error, Result};
use crate::transport::UsbTransport;

/// The parsed first byte (`USBTMC_status`) of every class-request response
///.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Success,
    Pending,
    TransferNotInProgress,
    SplitNotInProgress,
    SplitInProgress,
    Failed,
    Other(u8),
}

impl Status {
    fn from_byte(b: u8) -> Status {
        match b {
            usbtmc_status::STATUS_SUCCESS => Status::Success,
            usbtmc_status::STATUS_PENDING => Status::Pending,
            usbtmc_status::STATUS_TRANSFER_NOT_IN_PROGRESS => Status::TransferNotInProgress,
            usbtmc_status::STATUS_SPLIT_NOT_IN_PROGRESS => Status::SplitNotInProgress,
            usbtmc_status::STATUS_SPLIT_IN_PROGRESS => Status::SplitInProgress,
            usbtmc_status::STATUS_FAILED => Status::Failed,
            other => Status::Other(other),
        }
    }
}

fn interface_request_type(dir: rusb::Direction) -> u8 {
    rusb::request_type(dir, rusb::RequestType::Class, rusb::Recipient::Interface)
}

fn endpoint_request_type(dir: rusb::Direction) -> u8 {
    rusb::request_type(dir, rusb::RequestType::Class, rusb::Recipient::Endpoint)
}

/// Poll `check` (a `CHECK_*_STATUS` request) until it stops returning
/// `PENDING`, with the exponential backoff spec.md §4.3 describes: starts at
/// 1ms, doubles, caps at 100ms, bounded by `budget`.
fn poll_until_not_pending(
    mut check: impl FnMut() -> Result<(Status, Vec<u8>)>,
    budget: Duration,
    name: &'static str,
) -> Result<(Status, Vec<u8>)> {
    let deadline = Instant::now() + budget;
    let mut backoff = misc::POLL_BACKOFF_FLOOR;
    loop {
        let (status, payload) = check()?;
        if status != Status::Pending {
            return Ok((status, payload));
        }
        if Instant::now() >= deadline {
            tracing::error!(request = name, "exhausted PENDING poll budget");
            return Err(Error::DeviceStatusFailed(name));
        }
        tracing::debug!(request = name, backoff_ms = backoff.as_millis(), "PENDING, backing off");
        std::thread::sleep(backoff);
        backoff = (backoff * 2).min(misc::POLL_BACKOFF_CEIL);
    }
}

/// Read the GET_CAPABILITIES class request and return the raw 24-byte
/// response for [`crate::capabilities::Capabilities::parse`] to interpret.
pub fn get_capabilities(
    transport: &mut dyn UsbTransport,
    interface_number: u8,
    timeout: Duration,
) -> Result<[u8; 24]> {
    let mut buf = [0u8; 24];
    transport.read_control(
        interface_request_type(rusb::Direction::In),
        control_requests::GET_CAPABILITIES,
        0x0000,
        interface_number as u16,
        &mut buf,
        timeout,
    )?;
    tracing::debug!(status = buf[0], "GET_CAPABILITIES");
    Ok(buf)
}

/// INITIATE_ABORT_BULK_OUT for the transfer tagged `b_tag`.
pub fn initiate_abort_bulk_out(
    transport: &mut dyn UsbTransport,
    endpoint: u8,
    b_tag: u8,
    timeout: Duration,
) -> Result<Status> {
    let mut buf = [0u8; 2];
    transport.read_control(
        endpoint_request_type(rusb::Direction::In),
        control_requests::INITIATE_ABORT_BULK_OUT,
        b_tag as u16,
        endpoint as u16,
        &mut buf,
        timeout,
    )?;
    let status = Status::from_byte(buf[0]);
    tracing::debug!(b_tag, ?status, "INITIATE_ABORT_BULK_OUT");
    Ok(status)
}

/// CHECK_ABORT_BULK_OUT_STATUS, polled to completion. Returns the number of
/// bytes the device had already consumed before the abort took effect.
pub fn check_abort_bulk_out_status(
    transport: &mut dyn UsbTransport,
    endpoint: u8,
    budget: Duration,
    timeout: Duration,
) -> Result<usize> {
    let (_, payload) = poll_until_not_pending(
        || {
            let mut buf = [0u8; 8];
            transport.read_control(
                endpoint_request_type(rusb::Direction::In),
                control_requests::CHECK_ABORT_BULK_OUT_STATUS,
                0x0000,
                endpoint as u16,
                &mut buf,
                timeout,
            )?;
            Ok((Status::from_byte(buf[0]), buf.to_vec()))
        },
        budget,
        "CHECK_ABORT_BULK_OUT_STATUS",
    )?;
    Ok(u32::from_le_bytes([payload[4], payload[5], payload[6], payload[7]]) as usize)
}

/// INITIATE_ABORT_BULK_IN for the transfer tagged `b_tag`.
pub fn initiate_abort_bulk_in(
    transport: &mut dyn UsbTransport,
    endpoint: u8,
    b_tag: u8,
    timeout: Duration,
) -> Result<Status> {
    let mut buf = [0u8; 2];
    transport.read_control(
        endpoint_request_type(rusb::Direction::In),
        control_requests::INITIATE_ABORT_BULK_IN,
        b_tag as u16,
        endpoint as u16,
        &mut buf,
        timeout,
    )?;
    let status = Status::from_byte(buf[0]);
    tracing::debug!(b_tag, ?status, "INITIATE_ABORT_BULK_IN");
    Ok(status)
}

/// CHECK_ABORT_BULK_IN_STATUS, polled to completion. Returns the number of
/// bytes the device had transferred before the abort took effect.
pub fn check_abort_bulk_in_status(
    transport: &mut dyn UsbTransport,
    endpoint: u8,
    budget: Duration,
    timeout: Duration,
) -> Result<usize> {
    let (_, payload) = poll_until_not_pending(
        || {
            let mut buf = [0u8; 8];
            transport.read_control(
                endpoint_request_type(rusb::Direction::In),
                control_requests::CHECK_ABORT_BULK_IN_STATUS,
                0x0000,
                endpoint as u16,
                &mut buf,
                timeout,
            )?;
            Ok((Status::from_byte(buf[0]), buf.to_vec()))
        },
        budget,
        "CHECK_ABORT_BULK_IN_STATUS",
    )?;
    Ok(u32::from_le_bytes([payload[4], payload[5], payload[6], payload[7]]) as usize)
}

/// INITIATE_CLEAR followed by CHECK_CLEAR_STATUS polled to completion
///. `poll_budget` bounds the indefinite
/// `PENDING` case per SPEC_FULL.md §F.2 (10x the handle's I/O timeout).
pub fn initiate_clear(
    transport: &mut dyn UsbTransport,
    interface_number: u8,
    poll_budget: Duration,
    timeout: Duration,
) -> Result<()> {
    let mut buf = [0u8; 1];
    transport.read_control(
        interface_request_type(rusb::Direction::In),
        control_requests::INITIATE_CLEAR,
        0x0000,
        interface_number as u16,
        &mut buf,
        timeout,
    )?;
    if Status::from_byte(buf[0]) == Status::Failed {
        return Err(Error::DeviceStatusFailed("INITIATE_CLEAR"));
    }

    let (status, _) = poll_until_not_pending(
        || {
            let mut buf = [0u8; 2];
            transport.read_control(
                interface_request_type(rusb::Direction::In),
                control_requests::CHECK_CLEAR_STATUS,
                0x0000,
                interface_number as u16,
                &mut buf,
                timeout,
            )?;
            Ok((Status::from_byte(buf[0]), buf.to_vec()))
        },
        poll_budget,
        "CHECK_CLEAR_STATUS",
    )?;

    match status {
        Status::Success => Ok(()),
        other => {
            tracing::error!(?other, "CHECK_CLEAR_STATUS did not resolve to SUCCESS");
            Err(Error::DeviceStatusFailed("CHECK_CLEAR_STATUS"))
        }
    }
}

/// INDICATOR_PULSE: ask the device to flash a front-panel light.
pub fn indicator_pulse(
    transport: &mut dyn UsbTransport,
    interface_number: u8,
    timeout: Duration,
) -> Result<()> {
    let mut buf = [0u8; 1];
    transport.read_control(
        interface_request_type(rusb::Direction::In),
        control_requests::INDICATOR_PULSE,
        0x0000,
        interface_number as u16,
        &mut buf,
        timeout,
    )?;
    match Status::from_byte(buf[0]) {
        Status::Success => Ok(()),
        _ => Err(Error::DeviceStatusFailed("INDICATOR_PULSE")),
    }
}

/// USB488 READ_STATUS_BYTE via the control endpoint. `b_tag` is the USB488
/// status-byte bTag, a counter independent of the bulk transaction bTag.
pub fn read_status_byte(
    transport: &mut dyn UsbTransport,
    interface_number: u8,
    b_tag: u8,
    timeout: Duration,
) -> Result<u8> {
    let mut buf = [0u8; 3];
    transport.read_control(
        interface_request_type(rusb::Direction::In),
        control_requests::READ_STATUS_BYTE,
        b_tag as u16,
        interface_number as u16,
        &mut buf,
        timeout,
    )?;
    match Status::from_byte(buf[0]) {
        Status::Success => Ok(buf[2]),
        _ => Err(Error::DeviceStatusFailed("READ_STATUS_BYTE")),
    }
}

/// USB488 REN_CONTROL: assert or release Remote Enable.
pub fn ren_control(
    transport: &mut dyn UsbTransport,
    interface_number: u8,
    enable: bool,
    timeout: Duration,
) -> Result<()> {
    let mut buf = [0u8; 1];
    transport.read_control(
        interface_request_type(rusb::Direction::In),
        control_requests::REN_CONTROL,
        enable as u16,
        interface_number as u16,
        &mut buf,
        timeout,
    )?;
    match Status::from_byte(buf[0]) {
        Status::Success => Ok(()),
        _ => Err(Error::DeviceStatusFailed("REN_CONTROL")),
    }
}

/// USB488 GO_TO_LOCAL: return the device to front-panel control.
pub fn go_to_local(
    transport: &mut dyn UsbTransport,
    interface_number: u8,
    timeout: Duration,
) -> Result<()> {
    let mut buf = [0u8; 1];
    transport.read_control(
        interface_request_type(rusb::Direction::In),
        control_requests::GO_TO_LOCAL,
        0x0000,
        interface_number as u16,
        &mut buf,
        timeout,
    )?;
    match Status::from_byte(buf[0]) {
        Status::Success => Ok(()),
        _ => Err(Error::DeviceStatusFailed("GO_TO_LOCAL")),
    }
}

/// USB488 LOCAL_LOCKOUT: disable the device's front panel until REN drops.
pub fn local_lockout(
    transport: &mut dyn UsbTransport,
    interface_number: u8,
    timeout: Duration,
) -> Result<()> {
    let mut buf = [0u8; 1];
    transport.read_control(
        interface_request_type(rusb::Direction::In),
        control_requests::LOCAL_LOCKOUT,
        0x0000,
        interface_number as u16,
        &mut buf,
        timeout,
    )?;
    match Status::from_byte(buf[0]) {
        Status::Success => Ok(()),
        _ => Err(Error::DeviceStatusFailed("LOCAL_LOCKOUT")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_decodes_known_bytes() {
        assert_eq!(Status::from_byte(0x01), Status::Success);
        assert_eq!(Status::from_byte(0x02), Status::Pending);
        assert_eq!(Status::from_byte(0x80), Status::Failed);
        assert_eq!(Status::from_byte(0x81), Status::TransferNotInProgress);
        assert_eq!(Status::from_byte(0x82), Status::SplitNotInProgress);
        assert_eq!(Status::from_byte(0x83), Status::SplitInProgress);
        assert_eq!(Status::from_byte(0xEE), Status::Other(0xEE));
    }

    #[test]
    fn poll_until_not_pending_backs_off_then_succeeds() {
        let mut calls = 0;
        let result = poll_until_not_pending(
            || {
                calls += 1;
                if calls < 3 {
                    Ok((Status::Pending, vec![0u8; 8]))
                } else {
                    Ok((Status::Success, vec![0u8; 8]))
                }
            },
            Duration::from_secs(1),
            "TEST",
        );
        assert!(result.is_ok());
        assert_eq!(calls, 3);
    }

    #[test]
    fn poll_until_not_pending_times_out() {
        let result = poll_until_not_pending(
            || Ok((Status::Pending, vec![0u8; 8])),
            Duration::from_millis(5),
            "TEST",
        );
        assert!(matches!(result, Err(Error::DeviceStatusFailed("TEST"))));
    }
}

//! ## Capabilities
//!
//! The parsed GET_CAPABILITIES response.
//! Immutable after `open`.

use crate::constants::usbtmc_status;
use crate::error::Error;

/// USBTMC interface/device-level capability flags (GET_CAPABILITIES bytes
/// 4-5 of a 0x18-byte response).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UsbtmcCapabilities {
    /// Device accepts INDICATOR_PULSE.
    pub accepts_indicator_pulse: bool,
    /// Device only ever talks (sends data), never listens.
    pub is_talk_only: bool,
    /// Device only ever listens (accepts data), never talks.
    pub is_listen_only: bool,
    /// Device honors a TermChar byte during bulk-in reads.
    pub accepts_term_char: bool,
}

/// USB488 subclass capability flags (GET_CAPABILITIES bytes 14-15, present
/// only when the interface's protocol code is `USBTMC_PROTOCOL_USB488`).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Usb488Capabilities {
    /// Device is fully IEEE-488.2 compliant.
    pub is_488_2: bool,
    /// Device accepts REN_CONTROL / GO_TO_LOCAL / LOCAL_LOCKOUT.
    pub accepts_ren_control: bool,
    /// Device accepts the TRIGGER message.
    pub accepts_trigger: bool,
    /// Device implements the mandatory SCPI command subset.
    pub supports_mandatory_scpi: bool,
    /// Device implements SCPI commands beyond the mandatory subset.
    pub supports_optional_scpi: bool,
}

/// The full parsed capabilities record for an opened device.
#[derive(Clone, Copy, Debug, Default)]
pub struct Capabilities {
    pub bcd_usbtmc: u16,
    pub usbtmc: UsbtmcCapabilities,
    pub bcd_usb488: Option<u16>,
    pub usb488: Option<Usb488Capabilities>,
}

impl Capabilities {
    /// Parse a GET_CAPABILITIES response buffer. `is_usb488` reflects
    /// whether the interface's protocol byte identified it as USB488; the
    /// response only carries meaningful bytes at offsets 12-15 in that
    /// case. `ignore_capabilities_flags` (a quirks override) causes every
    /// flag to decode as `false`/`None` rather than failing — some devices
    /// report capabilities unreliably.
    pub fn parse(buf: &[u8], is_usb488: bool, ignore_capabilities_flags: bool) -> Result<Self, Error> {
        if buf.len() < 24 {
            return Err(Error::ProtocolViolation(format!(
                "GET_CAPABILITIES response truncated: got {} bytes, need 24",
                buf.len()
            )));
        }

        match buf[0] {
            usbtmc_status::STATUS_SUCCESS => {}
            _ => return Err(Error::DeviceStatusFailed("GET_CAPABILITIES")),
        }

        if ignore_capabilities_flags {
            return Ok(Capabilities::default());
        }

        let bcd_usbtmc = u16::from_le_bytes([buf[2], buf[3]]);
        let interface_caps = buf[4];
        let device_caps = buf[5];

        let usbtmc = UsbtmcCapabilities {
            accepts_indicator_pulse: interface_caps & 0b0000_0100 != 0,
            is_talk_only: interface_caps & 0b0000_0010 != 0,
            is_listen_only: interface_caps & 0b0000_0001 != 0,
            accepts_term_char: device_caps & 0b0000_0001 != 0,
        };

        if !is_usb488 {
            return Ok(Capabilities {
                bcd_usbtmc,
                usbtmc,
                bcd_usb488: None,
                usb488: None,
            });
        }

        let bcd_usb488 = u16::from_le_bytes([buf[12], buf[13]]);
        let usb488_interface_caps = buf[14];
        let usb488_device_caps = buf[15];

        let usb488 = Usb488Capabilities {
            is_488_2: usb488_interface_caps & 0b0000_0100 != 0,
            accepts_ren_control: usb488_interface_caps & 0b0000_0010 != 0,
            accepts_trigger: usb488_interface_caps & 0b0000_0001 != 0,
            supports_mandatory_scpi: usb488_device_caps & 0b0000_0001 != 0,
            supports_optional_scpi: usb488_device_caps & 0b0000_0010 != 0,
        };

        Ok(Capabilities {
            bcd_usbtmc,
            usbtmc,
            bcd_usb488: Some(bcd_usb488),
            usb488: Some(usb488),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_buf() -> Vec<u8> {
        let mut buf = vec![0u8; 24];
        buf[0] = usbtmc_status::STATUS_SUCCESS;
        buf[2..4].copy_from_slice(&0x0100u16.to_le_bytes());
        buf[4] = 0b0000_0111; // all interface flags set
        buf[5] = 0b0000_0001; // term char supported
        buf[12..14].copy_from_slice(&0x0100u16.to_le_bytes());
        buf[14] = 0b0000_0111;
        buf[15] = 0b0000_0011;
        buf
    }

    #[test]
    fn parses_usbtmc_only_capabilities() {
        let caps = Capabilities::parse(&sample_buf(), false, false).unwrap();
        assert!(caps.usbtmc.accepts_indicator_pulse);
        assert!(caps.usbtmc.is_talk_only);
        assert!(caps.usbtmc.is_listen_only);
        assert!(caps.usbtmc.accepts_term_char);
        assert!(caps.usb488.is_none());
    }

    #[test]
    fn parses_usb488_capabilities_when_requested() {
        let caps = Capabilities::parse(&sample_buf(), true, false).unwrap();
        let usb488 = caps.usb488.unwrap();
        assert!(usb488.is_488_2);
        assert!(usb488.accepts_ren_control);
        assert!(usb488.accepts_trigger);
        assert!(usb488.supports_mandatory_scpi);
        assert!(usb488.supports_optional_scpi);
    }

    #[test]
    fn ignore_capabilities_flags_quirk_yields_defaults() {
        let caps = Capabilities::parse(&sample_buf(), true, true).unwrap();
        assert_eq!(caps.bcd_usbtmc, 0);
        assert!(!caps.usbtmc.accepts_indicator_pulse);
        assert!(caps.usb488.is_none());
    }

    #[test]
    fn rejects_non_success_status() {
        let mut buf = sample_buf();
        buf[0] = usbtmc_status::STATUS_FAILED;
        let err = Capabilities::parse(&buf, false, false).unwrap_err();
        assert!(matches!(err, Error::DeviceStatusFailed(_)));
    }
}

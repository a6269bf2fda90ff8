//! ## Selector
//!
//! Device selection forms spec.md §4.6 lists: by VID/PID, by serial, by USB
//! bus+address, or by a `USB::<vid>::<pid>::<serial>::INSTR` resource
//! string. Generalizes the teacher's `DeviceFilter` trait (`src/init.rs`),
//! which is kept as the extensibility point callers may still implement
//! directly for bespoke filters.

use crate::error::Error;
use crate::types::{DeviceAddr, DeviceId, DeviceInfo};

/// A predicate over an enumerated USB device's descriptor, used by
/// [`crate::Device::open`]. Callers may implement this directly for
/// filters [`Selector`] doesn't express.
pub trait DeviceFilter {
    fn matches(&self, info: &DeviceInfo) -> bool;
}

impl DeviceFilter for () {
    fn matches(&self, _info: &DeviceInfo) -> bool {
        true
    }
}

impl DeviceFilter for DeviceId {
    fn matches(&self, info: &DeviceInfo) -> bool {
        *self == info.id
    }
}

impl DeviceFilter for (u16, u16) {
    fn matches(&self, info: &DeviceInfo) -> bool {
        self.0 == info.id.vendor_id && self.1 == info.id.product_id
    }
}

impl DeviceFilter for DeviceAddr {
    fn matches(&self, info: &DeviceInfo) -> bool {
        *self == info.address
    }
}

impl DeviceFilter for (u8, u8) {
    fn matches(&self, info: &DeviceInfo) -> bool {
        self.0 == info.address.bus && self.1 == info.address.device
    }
}

impl DeviceFilter for DeviceInfo {
    fn matches(&self, info: &DeviceInfo) -> bool {
        self == info
    }
}

impl<T: DeviceFilter + ?Sized> DeviceFilter for &T {
    fn matches(&self, info: &DeviceInfo) -> bool {
        (**self).matches(info)
    }
}

/// A concrete selector covering every form spec.md §4.6 names.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Selector {
    /// First USBTMC device found, in enumeration order.
    First,
    /// By vendor/product identifier.
    Id(DeviceId),
    /// By the device's iSerialNumber string descriptor.
    Serial(String),
    /// By USB bus number and device address.
    Address(DeviceAddr),
    /// By vendor/product identifier and serial together.
    IdAndSerial(DeviceId, String),
}

impl Selector {
    /// Parse a VISA-style `USB::<vid>::<pid>::<serial>::INSTR` resource
    /// string. `vid`/`pid` may be decimal or `0x`-prefixed hex; `serial` may
    /// be omitted (`USB::<vid>::<pid>::INSTR`) to select by identifier only.
    pub fn parse_resource_string(s: &str) -> Result<Selector, Error> {
        let parts: Vec<&str> = s.split("::").collect();
        let malformed = || {
            Error::ProtocolViolation(format!(
                "malformed USBTMC resource string: {s:?}"
            ))
        };

        if parts.len() < 4 || !parts[0].eq_ignore_ascii_case("USB") {
            return Err(malformed());
        }
        if !parts.last().unwrap().eq_ignore_ascii_case("INSTR") {
            return Err(malformed());
        }

        let vid = parse_numeric(parts[1]).ok_or_else(malformed)?;
        let pid = parse_numeric(parts[2]).ok_or_else(malformed)?;
        let id = DeviceId {
            vendor_id: vid,
            product_id: pid,
        };

        match parts.len() {
            4 => Ok(Selector::Id(id)),
            5 => Ok(Selector::IdAndSerial(id, parts[3].to_string())),
            _ => Err(malformed()),
        }
    }
}

fn parse_numeric(s: &str) -> Option<u16> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u16::from_str_radix(hex, 16).ok()
    } else {
        s.parse::<u16>().ok()
    }
}

impl DeviceFilter for Selector {
    fn matches(&self, info: &DeviceInfo) -> bool {
        match self {
            Selector::First => true,
            Selector::Id(id) => *id == info.id,
            Selector::Serial(serial) => info.serial.as_deref() == Some(serial.as_str()),
            Selector::Address(addr) => *addr == info.address,
            Selector::IdAndSerial(id, serial) => {
                *id == info.id && info.serial.as_deref() == Some(serial.as_str())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_decimal_resource_string() {
        let sel = Selector::parse_resource_string("USB::1689::867::A12345::INSTR").unwrap();
        assert_eq!(
            sel,
            Selector::IdAndSerial(
                DeviceId {
                    vendor_id: 1689,
                    product_id: 867
                },
                "A12345".to_string()
            )
        );
    }

    #[test]
    fn parses_hex_resource_string_without_serial() {
        let sel = Selector::parse_resource_string("USB::0x0699::0x0363::INSTR").unwrap();
        assert_eq!(
            sel,
            Selector::Id(DeviceId {
                vendor_id: 0x0699,
                product_id: 0x0363
            })
        );
    }

    #[test]
    fn rejects_malformed_resource_string() {
        assert!(Selector::parse_resource_string("USB::1689::INSTR").is_err());
        assert!(Selector::parse_resource_string("GPIB::1689::867::INSTR").is_err());
    }

    #[test]
    fn id_and_serial_selector_requires_both() {
        let sel = Selector::IdAndSerial(
            DeviceId {
                vendor_id: 1,
                product_id: 2,
            },
            "SN1".to_string(),
        );
        let matching = DeviceInfo {
            id: DeviceId {
                vendor_id: 1,
                product_id: 2,
            },
            address: DeviceAddr { bus: 1, device: 1 },
            serial: Some("SN1".to_string()),
        };
        let wrong_serial = DeviceInfo {
            serial: Some("SN2".to_string()),
            ..matching.clone()
        };
        assert!(sel.matches(&matching));
        assert!(!sel.matches(&wrong_serial));
    }
}

//! ## Device / endpoint discovery
//!
//! USB enumeration and descriptor parsing, narrowly scoped to "locate the
//! USBTMC interface and its endpoints" (spec.md §1 Non-goals: nothing
//! beyond that). Generalizes the teacher's `src/init.rs`, widened to also
//! resolve the optional interrupt-in endpoint and the USB488 protocol byte
//! the way `tmc`'s discovery does.
//!
//! This module is the one place in the crate that still talks to `rusb`
//! descriptors directly — everything past `claim_interface` goes through
//! [`crate::transport::UsbTransport`] instead.

use rusb::{Context, Device, DeviceDescriptor, DeviceHandle, Direction as RusbDirection, TransferType, UsbContext};

use crate::constants::usb::{USBTMC_CLASS_CODE, USBTMC_SUBCLASS_CODE, USBTMC_PROTOCOL_USB488};
use crate::error::{Error, Result};
use crate::selector::DeviceFilter;
use crate::types::{DeviceAddr, DeviceId, DeviceInfo, DeviceMode, Endpoint, Endpoints};

fn usbtmc_interface<T: UsbContext>(
    device: &Device<T>,
    device_desc: &DeviceDescriptor,
) -> Option<(u8, u8, u8, u8)> {
    for config_no in 0..device_desc.num_configurations() {
        let Ok(config_desc) = device.config_descriptor(config_no) else {
            continue;
        };
        for interface in config_desc.interfaces() {
            for interface_desc in interface.descriptors() {
                if interface_desc.class_code() == USBTMC_CLASS_CODE
                    && interface_desc.sub_class_code() == USBTMC_SUBCLASS_CODE
                {
                    return Some((
                        config_desc.number(),
                        interface_desc.interface_number(),
                        interface_desc.setting_number(),
                        interface_desc.protocol_code(),
                    ));
                }
            }
        }
    }
    None
}

fn read_serial<T: UsbContext>(
    device: &Device<T>,
    device_desc: &DeviceDescriptor,
) -> Option<String> {
    let handle = device.open().ok()?;
    let languages = handle.read_languages(std::time::Duration::from_millis(200)).ok()?;
    let language = *languages.first()?;
    handle
        .read_serial_number_string(
            language,
            device_desc,
            std::time::Duration::from_millis(200),
        )
        .ok()
}

/// Enumerate every USBTMC device currently attached, per spec.md §4.6
/// "by serial"/"by bus+address" selector forms.
pub fn list_devices(context: &Context) -> Result<Vec<DeviceInfo>> {
    let devices = context.devices()?;
    Ok(devices
        .iter()
        .filter_map(|device| {
            let device_desc = device.device_descriptor().ok()?;
            usbtmc_interface(&device, &device_desc)?;
            Some(DeviceInfo {
                id: DeviceId {
                    vendor_id: device_desc.vendor_id(),
                    product_id: device_desc.product_id(),
                },
                address: DeviceAddr {
                    bus: device.bus_number(),
                    device: device.address(),
                },
                serial: read_serial(&device, &device_desc),
            })
        })
        .collect())
}

/// The result of successfully locating and opening a USBTMC device: the
/// open handle, its claimed-interface mode, its resolved endpoint set, and
/// the bcdDevice firmware revision the quirks registry keys on.
pub struct OpenedDevice {
    pub handle: DeviceHandle<Context>,
    pub info: DeviceInfo,
    pub mode: DeviceMode,
    pub endpoints: Endpoints,
    pub bcd_device: u16,
}

/// Find the first device matching `filter`, open it, locate its USBTMC
/// interface and endpoints, and detach a kernel driver if one is attached.
/// Does not claim the interface or select the alternate setting — the
/// caller (`device.rs`) does that once it has decided to commit to opening.
pub fn find_and_open(context: &Context, filter: &dyn DeviceFilter) -> Result<OpenedDevice> {
    let devices = context.devices()?;

    for device in devices.iter() {
        let Ok(device_desc) = device.device_descriptor() else {
            continue;
        };
        let Some((config_number, interface_number, setting_number, protocol_code)) =
            usbtmc_interface(&device, &device_desc)
        else {
            continue;
        };

        let serial = read_serial(&device, &device_desc);
        let info = DeviceInfo {
            id: DeviceId {
                vendor_id: device_desc.vendor_id(),
                product_id: device_desc.product_id(),
            },
            address: DeviceAddr {
                bus: device.bus_number(),
                device: device.address(),
            },
            serial,
        };

        if !filter.matches(&info) {
            continue;
        }

        let handle = device.open().map_err(|e| match e {
            rusb::Error::Access => Error::AccessDenied(e),
            other => Error::Transport(other),
        })?;

        let endpoints = resolve_endpoints(&device, config_number, interface_number, setting_number)?;

        return Ok(OpenedDevice {
            handle,
            info,
            mode: DeviceMode {
                config_number,
                interface_number,
                setting_number,
                protocol_code,
                had_kernel_driver: false,
            },
            endpoints,
            bcd_device: bcd_from_version(device_desc.device_version()),
        });
    }

    Err(Error::NotFound)
}

fn resolve_endpoints(
    device: &Device<Context>,
    config_number: u8,
    interface_number: u8,
    setting_number: u8,
) -> Result<Endpoints> {
    let config_desc = device
        .config_descriptor(config_number.saturating_sub(1))
        .map_err(|_| Error::ConfigurationNotFound)?;
    let interface = config_desc
        .interfaces()
        .find(|i| i.number() == interface_number)
        .ok_or(Error::InterfaceNotFound)?;
    let interface_desc = interface
        .descriptors()
        .find(|d| d.setting_number() == setting_number)
        .ok_or(Error::InterfaceSettingNotFound)?;

    let endpoints: Vec<Endpoint> = interface_desc
        .endpoint_descriptors()
        .map(|ep| Endpoint {
            address: ep.address(),
            max_packet_size: ep.max_packet_size(),
            transfer_type: ep.transfer_type(),
            direction: ep.direction(),
        })
        .collect();

    let bulk_out = endpoints
        .iter()
        .find(|ep| ep.transfer_type == TransferType::Bulk && ep.direction == RusbDirection::Out)
        .cloned()
        .ok_or(Error::BulkOutEndpointNotFound)?;
    let bulk_in = endpoints
        .iter()
        .find(|ep| ep.transfer_type == TransferType::Bulk && ep.direction == RusbDirection::In)
        .cloned()
        .ok_or(Error::BulkInEndpointNotFound)?;
    let interrupt_in = endpoints
        .iter()
        .find(|ep| ep.transfer_type == TransferType::Interrupt && ep.direction == RusbDirection::In)
        .cloned();

    Ok(Endpoints {
        bulk_out,
        bulk_in,
        interrupt_in,
    })
}

/// Pack a libusb `Version` (major.minor.sub_minor) back into the bcdDevice
/// field's BCD encoding, so the quirks registry can match a firmware
/// revision string against it.
fn bcd_from_version(version: rusb::Version) -> u16 {
    ((version.major() as u16) << 8) | ((version.minor() as u16) << 4) | (version.sub_minor() as u16)
}

/// Format a bcdDevice value as the `"MAJOR.MINOR"`-shaped string the quirks
/// registry's revision regex is matched against.
pub fn bcd_device_to_revision_string(bcd: u16) -> String {
    let major = (bcd >> 8) & 0xFF;
    let minor = (bcd >> 4) & 0x0F;
    let sub_minor = bcd & 0x0F;
    format!("{major}.{minor}{sub_minor}")
}

/// Whether the device's protocol byte marks it as a USB488 subclass
/// instrument.
pub fn is_usb488(mode: &DeviceMode) -> bool {
    mode.protocol_code == USBTMC_PROTOCOL_USB488
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usb488_protocol_code_detected() {
        let mode = DeviceMode {
            protocol_code: USBTMC_PROTOCOL_USB488,
            ..Default::default()
        };
        assert!(is_usb488(&mode));

        let mode = DeviceMode {
            protocol_code: 0,
            ..Default::default()
        };
        assert!(!is_usb488(&mode));
    }
}

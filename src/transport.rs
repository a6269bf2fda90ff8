//! ## USB transport adapter
//!
//! The narrow interface the rest of the crate needs from libusb (spec.md
//! §6). Every other component — discovery, control-request layer,
//! transaction engine, state machine — talks to a device only through this
//! trait, never through `rusb` directly. That seam is what lets §8's
//! property and scenario tests drive the whole engine against an in-memory
//! mock instead of real hardware.
//!
//! Every method takes `&mut self`: the caller (`Device`, in `device.rs`)
//! holds the transport behind its single exclusive device mutex (spec.md
//! §5) for the duration of a public operation, so the trait can demand
//! exclusive access instead of requiring interior mutability here.
//!
//! [`RusbTransport`] is the only production implementation, and is a thin
//! wrapper over `rusb::DeviceHandle<rusb::Context>` calling exactly the
//! functions the teacher (`rs-usbtmc`) and `tmc` already call.

use std::time::Duration;

use crate::error::{Error, Result};

/// Minimal synchronous USB operations the engine needs from a claimed
/// interface on an open device.
pub trait UsbTransport: Send {
    /// Issue an IN control transfer and return the number of bytes copied
    /// into `buf`. USBTMC/USB488 class requests are always read/IN
    /// transfers even for operations that conceptually mutate device state
    /// (e.g. INITIATE_CLEAR): every class request returns a status byte.
    fn read_control(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize>;

    /// Issue a bulk OUT transfer.
    fn write_bulk(&mut self, endpoint: u8, buf: &[u8], timeout: Duration) -> Result<usize>;

    /// Issue a bulk IN transfer.
    fn read_bulk(&mut self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Issue an interrupt IN transfer (USB488 notification endpoint).
    fn read_interrupt(&mut self, endpoint: u8, buf: &mut [u8], timeout: Duration)
        -> Result<usize>;

    /// Clear a halt/stall condition on an endpoint.
    fn clear_halt(&mut self, endpoint: u8) -> Result<()>;

    /// Claim an interface for exclusive use.
    fn claim_interface(&mut self, interface_number: u8) -> Result<()>;

    /// Release a previously claimed interface.
    fn release_interface(&mut self, interface_number: u8) -> Result<()>;

    /// Select the device's active configuration.
    fn set_active_configuration(&mut self, config: u8) -> Result<()>;

    /// Select an alternate setting on a claimed interface.
    fn set_alternate_setting(&mut self, interface_number: u8, setting: u8) -> Result<()>;

    /// Perform a USB port reset on the device.
    fn reset_device(&mut self) -> Result<()>;

    /// Whether the OS kernel currently owns a driver for this interface.
    fn kernel_driver_active(&mut self, interface_number: u8) -> Result<bool>;

    /// Detach the kernel driver so the interface can be claimed.
    fn detach_kernel_driver(&mut self, interface_number: u8) -> Result<()>;

    /// Reattach the kernel driver (used on close/drop).
    fn attach_kernel_driver(&mut self, interface_number: u8) -> Result<()>;
}

fn map_rusb_err(err: rusb::Error) -> Error {
    match err {
        rusb::Error::Timeout => Error::IoTimeout,
        rusb::Error::Access => Error::AccessDenied(err),
        rusb::Error::NoDevice | rusb::Error::NotFound => Error::NotFound,
        other => Error::Transport(other),
    }
}

/// Production transport: a claimed `rusb` device handle on the default
/// libusb context.
pub struct RusbTransport {
    handle: rusb::DeviceHandle<rusb::Context>,
}

impl RusbTransport {
    pub fn new(handle: rusb::DeviceHandle<rusb::Context>) -> Self {
        RusbTransport { handle }
    }

    pub fn inner(&self) -> &rusb::DeviceHandle<rusb::Context> {
        &self.handle
    }

    pub fn inner_mut(&mut self) -> &mut rusb::DeviceHandle<rusb::Context> {
        &mut self.handle
    }

    pub fn into_inner(self) -> rusb::DeviceHandle<rusb::Context> {
        self.handle
    }
}

impl UsbTransport for RusbTransport {
    fn read_control(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        self.handle
            .read_control(request_type, request, value, index, buf, timeout)
            .map_err(map_rusb_err)
    }

    fn write_bulk(&mut self, endpoint: u8, buf: &[u8], timeout: Duration) -> Result<usize> {
        self.handle
            .write_bulk(endpoint, buf, timeout)
            .map_err(map_rusb_err)
    }

    fn read_bulk(&mut self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        self.handle
            .read_bulk(endpoint, buf, timeout)
            .map_err(map_rusb_err)
    }

    fn read_interrupt(
        &mut self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        self.handle
            .read_interrupt(endpoint, buf, timeout)
            .map_err(map_rusb_err)
    }

    fn clear_halt(&mut self, endpoint: u8) -> Result<()> {
        self.handle.clear_halt(endpoint).map_err(map_rusb_err)
    }

    fn claim_interface(&mut self, interface_number: u8) -> Result<()> {
        self.handle
            .claim_interface(interface_number)
            .map_err(map_rusb_err)
    }

    fn release_interface(&mut self, interface_number: u8) -> Result<()> {
        self.handle
            .release_interface(interface_number)
            .map_err(map_rusb_err)
    }

    fn set_active_configuration(&mut self, config: u8) -> Result<()> {
        self.handle
            .set_active_configuration(config)
            .map_err(map_rusb_err)
    }

    fn set_alternate_setting(&mut self, interface_number: u8, setting: u8) -> Result<()> {
        self.handle
            .set_alternate_setting(interface_number, setting)
            .map_err(map_rusb_err)
    }

    fn reset_device(&mut self) -> Result<()> {
        self.handle.reset().map_err(map_rusb_err)
    }

    fn kernel_driver_active(&mut self, interface_number: u8) -> Result<bool> {
        self.handle
            .kernel_driver_active(interface_number)
            .map_err(map_rusb_err)
    }

    fn detach_kernel_driver(&mut self, interface_number: u8) -> Result<()> {
        self.handle
            .detach_kernel_driver(interface_number)
            .map_err(map_rusb_err)
    }

    fn attach_kernel_driver(&mut self, interface_number: u8) -> Result<()> {
        self.handle
            .attach_kernel_driver(interface_number)
            .map_err(map_rusb_err)
    }
}

//! # usbtmc-core
//!
//! A user-space message-transfer engine for the USB Test & Measurement
//! Class (USBTMC) protocol and its USB488 subclass extension, built on
//! [`rusb`]. This crate owns framing (BULK-OUT/BULK-IN headers, alignment,
//! EOM, bTag sequencing), the write/read transaction engine, the USBTMC and
//! USB488 control-request layer, the device lifecycle state machine
//! (including abort/clear recovery), and a quirks registry for devices that
//! deviate from the standard. It does not implement the SCPI text protocol,
//! GPIB/VXI-11 transports, or USB enumeration beyond what is needed to find
//! a USBTMC interface and its endpoints.
//!
//! ## Example
//!
//! ```no_run
//! use usbtmc_core::{Device, OpenOptions, QuirksRegistry, Selector};
//!
//! fn main() -> usbtmc_core::Result<()> {
//!     let context = rusb::Context::new().expect("libusb init failed");
//!     let registry = QuirksRegistry::builtin();
//!     let selector = Selector::Id(usbtmc_core::DeviceId { vendor_id: 0x0957, product_id: 0x1796 });
//!
//!     let device = Device::open(&context, &selector, &registry, OpenOptions::default())?;
//!     let reply = device.query(b"*IDN?\n", 256)?;
//!     println!("{}", String::from_utf8_lossy(&reply));
//!     Ok(())
//! }
//! ```

mod capabilities;
mod constants;
mod context;
mod control;
mod device;
mod discovery;
mod error;
mod frame;
mod quirks;
mod selector;
mod state;
mod transaction;
mod transport;
mod types;

pub use capabilities::{Capabilities, Usb488Capabilities, UsbtmcCapabilities};
pub use device::{Device, OpenOptions};
pub use discovery::list_devices;
pub use error::{Error, Result};
pub use quirks::{
    AbortRecoveryPolicy, HookDeviceInfo, HookOutcome, Hooks, QuirksKey, QuirksRecord,
    QuirksRegistry, ReadStatusByteVia,
};
pub use selector::{DeviceFilter, Selector};
pub use transaction::{CancellationToken, TransactionSnapshot};
pub use transport::UsbTransport;
pub use types::{DeviceAddr, DeviceId, DeviceInfo, DeviceMode, Endpoint, Endpoints, Message};

/// Enumerate every USBTMC device currently attached to the host, opening a
/// fresh libusb context for the scan so callers can list candidates before
/// choosing one.
pub fn devices() -> Result<Vec<DeviceInfo>> {
    let context = context::shared()?;
    list_devices(&context)
}

/// Open a USBTMC device matching `filter` using the process-wide libusb
/// context and the crate's built-in (empty) quirks table. Callers who need
/// quirks overrides should
/// build a [`QuirksRegistry`], register entries, and call [`Device::open`]
/// directly with their own `rusb::Context`.
pub fn open(filter: &dyn DeviceFilter) -> Result<Device> {
    let context = context::shared()?;
    let registry = QuirksRegistry::builtin();
    Device::open(&context, filter, &registry, OpenOptions::default())
}

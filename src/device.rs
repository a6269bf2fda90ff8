//! ## Public device façade
//!
//! The operations spec.md §4.6 surfaces to callers, built over the device
//! state machine (`state.rs`), transaction engine (`transaction.rs`), and
//! control-request layer (`control.rs`). A [`Device`] owns one exclusive
//! "device mutex" guarding everything that touches bulk
//! endpoints or the bTag counter; public methods take it with `try_lock`
//! rather than blocking, so a second caller racing an in-flight operation
//! observes `Busy` instead of queueing behind it.

use std::collections::HashSet;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use crate::capabilities::Capabilities;
use crate::constants::misc;
use crate::control;
use crate::discovery::{self, OpenedDevice};
use crate::error::{Error, Result};
use crate::quirks::{HookDeviceInfo, QuirksRecord, QuirksRegistry, ReadStatusByteVia};
use crate::selector::DeviceFilter;
use crate::state::{self, Direction as AbortDirection, State};
use crate::transaction::{self, CancellationToken};
use crate::transport::{RusbTransport, UsbTransport};
use crate::types::{BTagCounter, DeviceInfo, DeviceMode, Endpoints};

/// Behavior toggles for [`Device::open`], beyond what a bare selector
/// expresses.
#[derive(Clone, Copy, Debug, Default)]
pub struct OpenOptions {
    /// Opportunistically send `*IDN?` on open and discard the reply, purely
    /// to surface a dead/misbehaving device early. Defaults to `false`:
    /// spec.md §4.4 says `open` lands in `Idle` having performed no
    /// operation, and this keeps that the default.
    pub probe_idn: bool,
}

struct Inner {
    transport: Box<dyn UsbTransport>,
    state: State,
    b_tag: BTagCounter,
    status_b_tag: BTagCounter,
    timeout: Duration,
}

/// One opened USBTMC interface. Owned
/// exclusively by the caller; every internal reference point back into
/// `self`, never the other way around.
pub struct Device {
    inner: Mutex<Inner>,
    info: DeviceInfo,
    mode: DeviceMode,
    endpoints: Endpoints,
    capabilities: Capabilities,
    quirks: QuirksRecord,
    hook_info: HookDeviceInfo,
    resource_key: String,
}

fn busy_guard(inner: &Mutex<Inner>) -> Result<std::sync::MutexGuard<'_, Inner>> {
    inner.try_lock().map_err(|_| Error::Busy)
}

/// Process-local advisory lock registry backing [`Device::lock`]/
/// [`Device::unlock`] (SPEC_FULL.md §D: USBTMC has no device-side lock
/// request, so this is a host-side reservation keyed by resource string,
/// matching VISA/IVI "lock" semantics rather than a wire command).
fn lock_registry() -> &'static Mutex<HashSet<String>> {
    static REGISTRY: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashSet::new()))
}

/// The resource string a `Device`'s advisory lock is keyed on: serial when
/// available, otherwise bus+address (both are stable for the life of a
/// single `open`, unlike an ephemeral handle pointer).
fn resource_key(info: &DeviceInfo) -> String {
    match &info.serial {
        Some(serial) => format!("{:04x}:{:04x}:{serial}", info.id.vendor_id, info.id.product_id),
        None => format!(
            "{:04x}:{:04x}:bus{}-addr{}",
            info.id.vendor_id, info.id.product_id, info.address.bus, info.address.device
        ),
    }
}

impl Device {
    /// `open(selector) -> Handle`. Locates the USBTMC
    /// interface matching `filter`, claims it, consults the quirks
    /// registry, reads capabilities, and (if the matched quirk requires it)
    /// issues an initial clear before returning in the `Idle` state.
    pub fn open(
        context: &rusb::Context,
        filter: &dyn DeviceFilter,
        registry: &QuirksRegistry,
        options: OpenOptions,
    ) -> Result<Device> {
        let OpenedDevice {
            handle,
            info,
            mode,
            endpoints,
            bcd_device,
        } = discovery::find_and_open(context, filter)?;

        let revision = discovery::bcd_device_to_revision_string(bcd_device);
        let quirks = registry.lookup(info.id.vendor_id, info.id.product_id, Some(&revision));
        let transport: Box<dyn UsbTransport> = Box::new(RusbTransport::new(handle));

        Device::assemble(transport, info, mode, endpoints, quirks, options, true)
    }

    /// Assemble a `Device` from an already-connected [`UsbTransport`],
    /// skipping real USB discovery (spec.md §8: "the whole engine [must be]
    /// drivable against a mock transport for property and scenario tests").
    /// `mode`/`endpoints`/`quirks` are supplied directly rather than looked
    /// up, since a mock has no libusb descriptors to parse.
    pub fn open_with_transport(
        transport: Box<dyn UsbTransport>,
        info: DeviceInfo,
        mode: DeviceMode,
        endpoints: Endpoints,
        quirks: QuirksRecord,
        options: OpenOptions,
    ) -> Result<Device> {
        Device::assemble(transport, info, mode, endpoints, quirks, options, false)
    }

    fn assemble(
        mut transport: Box<dyn UsbTransport>,
        info: DeviceInfo,
        mut mode: DeviceMode,
        endpoints: Endpoints,
        quirks: QuirksRecord,
        options: OpenOptions,
        claim_interface: bool,
    ) -> Result<Device> {
        let hook_info = HookDeviceInfo {
            vendor_id: info.id.vendor_id,
            product_id: info.id.product_id,
            serial: info.serial.clone(),
            interface_number: mode.interface_number,
        };

        if let Some(hook) = &quirks.hooks.pre_open {
            if let crate::quirks::HookOutcome::Fail(err) = hook(&hook_info) {
                return Err(err);
            }
        }

        if claim_interface {
            mode.had_kernel_driver = transport
                .kernel_driver_active(mode.interface_number)
                .unwrap_or(false);
            if mode.had_kernel_driver {
                transport.detach_kernel_driver(mode.interface_number)?;
            }
            transport.set_active_configuration(mode.config_number)?;
            transport.claim_interface(mode.interface_number)?;
            transport.set_alternate_setting(mode.interface_number, mode.setting_number)?;
        }

        let timeout = misc::DEFAULT_TIMEOUT_DURATION;
        let is_usb488 = discovery::is_usb488(&mode);

        let capabilities = {
            let raw = control::get_capabilities(transport.as_mut(), mode.interface_number, timeout)?;
            Capabilities::parse(&raw, is_usb488, quirks.ignore_capabilities_flags)?
        };

        if quirks.requires_clear_before_first_io {
            tracing::info!("quirk requires_clear_before_first_io: clearing before first I/O");
            state::recover_clear(transport.as_mut(), &endpoints, mode.interface_number, timeout)?;
        }

        let resource_key = resource_key(&info);

        let device = Device {
            inner: Mutex::new(Inner {
                transport,
                state: State::Idle,
                b_tag: BTagCounter::new(),
                status_b_tag: BTagCounter::new(),
                timeout,
            }),
            info,
            mode,
            endpoints,
            capabilities,
            quirks,
            hook_info,
            resource_key,
        };

        if let Some(hook) = &device.quirks.hooks.post_open {
            if let crate::quirks::HookOutcome::Fail(err) = hook(&device.hook_info) {
                return Err(err);
            }
        }

        if options.probe_idn {
            let _ = device.write(b"*IDN?\n");
            let _ = device.read(64);
        }

        Ok(device)
    }

    /// The identity this handle was opened against.
    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// The device's parsed GET_CAPABILITIES record.
    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// `set_timeout(duration)`.
    pub fn set_timeout(&self, duration: Duration) -> Result<()> {
        let mut inner = busy_guard(&self.inner)?;
        inner.timeout = duration;
        Ok(())
    }

    /// `write(bytes)`: a write-only operation, `eom=true`.
    pub fn write(&self, bytes: &[u8]) -> Result<usize> {
        self.write_cancellable(bytes, None)
    }

    /// `write`, honoring a [`CancellationToken`] at segment boundaries
    /// (spec.md §5 "Cancellation during a `write` is honoured at segment
    /// boundaries").
    pub fn write_cancellable(&self, bytes: &[u8], cancel: Option<&CancellationToken>) -> Result<usize> {
        let mut inner = busy_guard(&self.inner)?;
        if inner.state == State::Halted {
            return Err(Error::Halted);
        }
        inner.state = State::Writing;
        let timeout = inner.timeout;
        let Inner { transport, b_tag, .. } = &mut *inner;

        let result = transaction::write_message(
            transport.as_mut(),
            b_tag,
            &self.endpoints,
            &self.quirks,
            &self.hook_info,
            bytes,
            true,
            timeout,
            cancel,
        );

        self.settle(&mut inner, result)
    }

    /// `read(max_bytes) -> bytes`.
    pub fn read(&self, max_bytes: usize) -> Result<Vec<u8>> {
        Ok(self.read_cancellable(max_bytes, None)?.0)
    }

    /// `read`, honoring a [`CancellationToken`] at the next USB operation
    /// boundary. Returns `(bytes, eom_seen)`.
    pub fn read_cancellable(
        &self,
        max_bytes: usize,
        cancel: Option<&CancellationToken>,
    ) -> Result<(Vec<u8>, bool)> {
        let mut inner = busy_guard(&self.inner)?;
        if inner.state == State::Halted {
            return Err(Error::Halted);
        }
        inner.state = State::Reading;
        let timeout = inner.timeout;
        let Inner { transport, b_tag, .. } = &mut *inner;

        let result = transaction::read_message(
            transport.as_mut(),
            b_tag,
            &self.endpoints,
            &self.capabilities,
            &self.quirks,
            &self.hook_info,
            max_bytes,
            None,
            timeout,
            cancel,
        );

        match result {
            Ok((bytes, eom)) => {
                inner.state = State::Idle;
                Ok((bytes, eom))
            }
            Err(err) => {
                let recovered = self.recover_from_mut(&mut inner, &err, AbortDirection::In);
                recovered?;
                Err(err)
            }
        }
    }

    /// `query(bytes, max_bytes) -> bytes`: write then read,
    /// holding the device mutex across both.
    pub fn query(&self, bytes: &[u8], max_bytes: usize) -> Result<Vec<u8>> {
        let mut inner = busy_guard(&self.inner)?;
        if inner.state == State::Halted {
            return Err(Error::Halted);
        }

        inner.state = State::Writing;
        let timeout = inner.timeout;
        {
            let Inner { transport, b_tag, .. } = &mut *inner;
            let write_result = transaction::write_message(
                transport.as_mut(),
                b_tag,
                &self.endpoints,
                &self.quirks,
                &self.hook_info,
                bytes,
                true,
                timeout,
                None,
            );
            if let Err(err) = write_result {
                let recovered = self.recover_from_mut(&mut inner, &err, AbortDirection::Out);
                recovered?;
                return Err(err);
            }
        }

        inner.state = State::Reading;
        let read_result = {
            let Inner { transport, b_tag, .. } = &mut *inner;
            transaction::read_message(
                transport.as_mut(),
                b_tag,
                &self.endpoints,
                &self.capabilities,
                &self.quirks,
                &self.hook_info,
                max_bytes,
                None,
                timeout,
                None,
            )
        };

        match read_result {
            Ok((out, _eom)) => {
                inner.state = State::Idle;
                Ok(out)
            }
            Err(err) => {
                let recovered = self.recover_from_mut(&mut inner, &err, AbortDirection::In);
                recovered?;
                Err(err)
            }
        }
    }

    /// `trigger()`: USB488 vendor message 128, no payload.
    /// Requires `Capabilities::usb488.accepts_trigger`.
    pub fn trigger(&self) -> Result<()> {
        if !self
            .capabilities
            .usb488
            .map(|c| c.accepts_trigger)
            .unwrap_or(false)
        {
            return Err(Error::Unsupported("device does not accept TRIGGER"));
        }

        let mut inner = busy_guard(&self.inner)?;
        if inner.state == State::Halted {
            return Err(Error::Halted);
        }
        inner.state = State::Writing;
        let timeout = inner.timeout;
        let tag = inner.b_tag.next();
        let frame = crate::frame::encode_vendor_specific_trigger(tag);
        let result = inner
            .transport
            .write_bulk(self.endpoints.bulk_out.address, &frame, timeout)
            .map(|_| ());
        self.settle(&mut inner, result)
    }

    /// `read_stb() -> u8`: USB488 status byte, sourced
    /// per the quirks record's `read_status_byte_via`.
    pub fn read_stb(&self) -> Result<u8> {
        if self.capabilities.usb488.is_none() {
            return Err(Error::Unsupported("device is not USB488"));
        }

        let mut inner = busy_guard(&self.inner)?;
        if inner.state == State::Halted {
            return Err(Error::Halted);
        }
        let timeout = inner.timeout;
        let tag = inner.status_b_tag.next();

        fn via_control(inner: &mut Inner, interface_number: u8, tag: u8, timeout: Duration) -> Result<u8> {
            control::read_status_byte(inner.transport.as_mut(), interface_number, tag, timeout)
        }
        fn via_interrupt(inner: &mut Inner, endpoints: &Endpoints, timeout: Duration) -> Result<u8> {
            let ep = endpoints
                .interrupt_in
                .as_ref()
                .ok_or(Error::Unsupported("device has no interrupt-in endpoint"))?;
            let mut buf = [0u8; 2];
            inner.transport.read_interrupt(ep.address, &mut buf, timeout)?;
            Ok(buf[1])
        }

        match self.quirks.read_status_byte_via {
            ReadStatusByteVia::Control => via_control(&mut inner, self.mode.interface_number, tag, timeout),
            ReadStatusByteVia::Interrupt => via_interrupt(&mut inner, &self.endpoints, timeout),
            ReadStatusByteVia::Both => {
                let control_value = via_control(&mut inner, self.mode.interface_number, tag, timeout)?;
                let interrupt_value = via_interrupt(&mut inner, &self.endpoints, timeout)?;
                if control_value != interrupt_value {
                    return Err(Error::ProtocolViolation(format!(
                        "status byte disagreement: control={control_value:#04x} interrupt={interrupt_value:#04x}"
                    )));
                }
                Ok(control_value)
            }
        }
    }

    /// `clear()`: full clear recovery, resetting the bTag
    /// counter and returning the handle to `Idle` even from `Halted`.
    pub fn clear(&self) -> Result<()> {
        let mut inner = busy_guard(&self.inner)?;
        inner.state = State::Clearing;
        let timeout = inner.timeout;
        let Inner { transport, b_tag, .. } = &mut *inner;

        let result = state::recover_clear(
            transport.as_mut(),
            &self.endpoints,
            self.mode.interface_number,
            timeout,
        );
        match result {
            Ok(()) => {
                state::reset_b_tag(b_tag);
                inner.state = State::Idle;
                Ok(())
            }
            Err(err) => {
                inner.state = State::Halted;
                Err(err)
            }
        }
    }

    /// `remote()`: USB488 `REN_CONTROL(true)` then
    /// nothing further — devices enter remote mode on their own once REN is
    /// asserted and a command arrives.
    pub fn remote(&self) -> Result<()> {
        self.require_ren_control()?;
        let mut inner = busy_guard(&self.inner)?;
        let timeout = inner.timeout;
        control::ren_control(inner_transport(&mut inner), self.mode.interface_number, true, timeout)
    }

    /// `local()`: USB488 `GO_TO_LOCAL`.
    pub fn local(&self) -> Result<()> {
        self.require_ren_control()?;
        let mut inner = busy_guard(&self.inner)?;
        let timeout = inner.timeout;
        control::go_to_local(inner_transport(&mut inner), self.mode.interface_number, timeout)
    }

    /// USB488 `LOCAL_LOCKOUT`, used by [`crate::lock`].
    pub fn local_lockout(&self) -> Result<()> {
        self.require_ren_control()?;
        let mut inner = busy_guard(&self.inner)?;
        let timeout = inner.timeout;
        control::local_lockout(inner_transport(&mut inner), self.mode.interface_number, timeout)
    }

    /// `indicator_pulse()`, gated on the capability flag.
    pub fn indicator_pulse(&self) -> Result<()> {
        if !self.capabilities.usbtmc.accepts_indicator_pulse {
            return Err(Error::Unsupported("device does not accept INDICATOR_PULSE"));
        }
        let mut inner = busy_guard(&self.inner)?;
        let timeout = inner.timeout;
        control::indicator_pulse(inner_transport(&mut inner), self.mode.interface_number, timeout)
    }

    /// `lock()`: take an advisory, process-local exclusive
    /// reservation on this resource string. No USBTMC wire request backs
    /// this — see the module-level note on [`resource_key`].
    pub fn lock(&self) -> Result<()> {
        let mut held = lock_registry().lock().unwrap();
        if held.contains(&self.resource_key) {
            return Err(Error::Busy);
        }
        held.insert(self.resource_key.clone());
        Ok(())
    }

    /// `unlock()`: release a reservation taken by [`lock`].
    /// Unlocking a resource this handle never locked is a no-op, matching
    /// the idempotence spec.md §8 requires of `clear()`.
    pub fn unlock(&self) -> Result<()> {
        lock_registry().lock().unwrap().remove(&self.resource_key);
        Ok(())
    }

    fn require_ren_control(&self) -> Result<()> {
        if !self
            .capabilities
            .usb488
            .map(|c| c.accepts_ren_control)
            .unwrap_or(false)
        {
            return Err(Error::Unsupported("device does not accept REN_CONTROL"));
        }
        Ok(())
    }

    /// Shared settle path for write-only operations (`write`, `trigger`):
    /// `Idle` on success, abort-recovery-on-the-bulk-out-endpoint on
    /// failure.
    fn settle<T>(&self, inner: &mut Inner, result: Result<T>) -> Result<T> {
        match result {
            Ok(v) => {
                inner.state = State::Idle;
                Ok(v)
            }
            Err(err) => {
                let _ = self.recover_from_mut(inner, &err, AbortDirection::Out);
                Err(err)
            }
        }
    }

    /// Shared abort-recovery entry point for a failed transaction
    ///. Takes `&mut Inner` through the already-held guard so
    /// it never tries to re-lock the device mutex.
    fn recover_from_mut(&self, inner: &mut Inner, err: &Error, direction: AbortDirection) -> Result<()> {
        if !matches!(err, Error::IoTimeout | Error::ProtocolViolation(_) | Error::Cancelled) {
            inner.state = State::Idle;
            return Ok(());
        }

        inner.state = State::Aborting;
        // `last()` is the tag actually outstanding on the wire; `current()`
        // already points at the next, unallocated tag and would target an
        // abort request at a bTag the device never saw.
        let b_tag = inner.b_tag.last().unwrap_or_else(|| inner.b_tag.current());
        let timeout = inner.timeout;
        let recovered = state::recover_abort(
            inner.transport.as_mut(),
            &self.endpoints,
            b_tag,
            direction,
            &self.quirks,
            self.mode.interface_number,
            timeout,
        );

        match recovered {
            Ok(outcome) => {
                if outcome.reset_b_tag {
                    state::reset_b_tag(&mut inner.b_tag);
                }
                inner.state = outcome.state;
                Ok(())
            }
            Err(recovery_err) => {
                inner.state = State::Halted;
                Err(recovery_err)
            }
        }
    }

    /// Whether the handle's last known state is `Halted`.
    pub fn is_halted(&self) -> Result<bool> {
        let inner = busy_guard(&self.inner)?;
        Ok(inner.state == State::Halted)
    }

    fn release(&mut self) {
        if let Ok(mut inner) = self.inner.lock() {
            let _ = inner.transport.release_interface(self.mode.interface_number);
            if self.mode.had_kernel_driver {
                let _ = inner.transport.attach_kernel_driver(self.mode.interface_number);
            }
        }
        lock_registry().lock().unwrap().remove(&self.resource_key);
    }
}

fn inner_transport(inner: &mut std::sync::MutexGuard<'_, Inner>) -> &mut dyn UsbTransport {
    inner.transport.as_mut()
}

impl Drop for Device {
    fn drop(&mut self) {
        self.release();
    }
}

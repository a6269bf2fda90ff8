//! An in-memory [`UsbTransport`] double used to drive the engine through
//! spec.md §8's end-to-end scenarios without real hardware. Canned control
//! responses are queued per `bRequest`; bulk-in responses are queued as a
//! plain FIFO of frames (or induced timeouts/corruption), since the engine
//! always drains them in the order it issues requests.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use usbtmc_core::{
    DeviceAddr, DeviceId, DeviceInfo, DeviceMode, Endpoint, Endpoints, Error, Result, UsbTransport,
};

/// One queued bulk-IN response: a real frame, an induced timeout, or a
/// frame whose bTag has been deliberately corrupted.
pub enum BulkIn {
    Frame(Vec<u8>),
    Timeout,
}

#[derive(Default)]
pub struct MockTransport {
    pub bulk_out_log: Vec<Vec<u8>>,
    pub bulk_in_queue: VecDeque<BulkIn>,
    pub interrupt_queue: VecDeque<Vec<u8>>,
    pub control_queue: HashMap<u8, VecDeque<Vec<u8>>>,
    pub cleared_halts: Vec<u8>,
    pub claimed_interfaces: Vec<u8>,
    pub abort_bulk_in_calls: usize,
}

impl MockTransport {
    pub fn new() -> Self {
        MockTransport::default()
    }

    /// Queue a canned response for every occurrence of `request` (a
    /// `bRequest` value from `control_requests`), consumed FIFO.
    pub fn expect_control(&mut self, request: u8, response: Vec<u8>) {
        self.control_queue.entry(request).or_default().push_back(response);
    }

    pub fn push_bulk_in(&mut self, frame: Vec<u8>) {
        self.bulk_in_queue.push_back(BulkIn::Frame(frame));
    }

    pub fn push_bulk_in_timeout(&mut self) {
        self.bulk_in_queue.push_back(BulkIn::Timeout);
    }
}

impl UsbTransport for MockTransport {
    fn read_control(
        &mut self,
        _request_type: u8,
        request: u8,
        _value: u16,
        _index: u16,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize> {
        if request == 3 {
            self.abort_bulk_in_calls += 1;
        }
        if let Some(resp) = self.control_queue.get_mut(&request).and_then(VecDeque::pop_front) {
            let n = resp.len().min(buf.len());
            buf[..n].copy_from_slice(&resp[..n]);
            return Ok(n);
        }
        // No canned response queued: default to an unconditional SUCCESS
        // status with an otherwise zeroed payload, which is enough for
        // GET_CAPABILITIES and the common-path class requests tests don't
        // care to script explicitly.
        if !buf.is_empty() {
            buf[0] = 0x01;
        }
        Ok(buf.len())
    }

    fn write_bulk(&mut self, _endpoint: u8, buf: &[u8], _timeout: Duration) -> Result<usize> {
        self.bulk_out_log.push(buf.to_vec());
        Ok(buf.len())
    }

    fn read_bulk(&mut self, _endpoint: u8, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
        match self.bulk_in_queue.pop_front() {
            Some(BulkIn::Frame(frame)) => {
                let n = frame.len().min(buf.len());
                buf[..n].copy_from_slice(&frame[..n]);
                Ok(n)
            }
            Some(BulkIn::Timeout) | None => Err(Error::IoTimeout),
        }
    }

    fn read_interrupt(&mut self, _endpoint: u8, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
        match self.interrupt_queue.pop_front() {
            Some(frame) => {
                let n = frame.len().min(buf.len());
                buf[..n].copy_from_slice(&frame[..n]);
                Ok(n)
            }
            None => Err(Error::IoTimeout),
        }
    }

    fn clear_halt(&mut self, endpoint: u8) -> Result<()> {
        self.cleared_halts.push(endpoint);
        Ok(())
    }

    fn claim_interface(&mut self, interface_number: u8) -> Result<()> {
        self.claimed_interfaces.push(interface_number);
        Ok(())
    }

    fn release_interface(&mut self, _interface_number: u8) -> Result<()> {
        Ok(())
    }

    fn set_active_configuration(&mut self, _config: u8) -> Result<()> {
        Ok(())
    }

    fn set_alternate_setting(&mut self, _interface_number: u8, _setting: u8) -> Result<()> {
        Ok(())
    }

    fn reset_device(&mut self) -> Result<()> {
        Ok(())
    }

    fn kernel_driver_active(&mut self, _interface_number: u8) -> Result<bool> {
        Ok(false)
    }

    fn detach_kernel_driver(&mut self, _interface_number: u8) -> Result<()> {
        Ok(())
    }

    fn attach_kernel_driver(&mut self, _interface_number: u8) -> Result<()> {
        Ok(())
    }
}

pub const BULK_OUT_ADDR: u8 = 0x02;
pub const BULK_IN_ADDR: u8 = 0x81;
pub const INTERRUPT_IN_ADDR: u8 = 0x83;

pub fn sample_info() -> DeviceInfo {
    DeviceInfo {
        id: DeviceId {
            vendor_id: 0x1689,
            product_id: 0x0363,
        },
        address: DeviceAddr { bus: 1, device: 5 },
        serial: Some("MY-SERIAL-0001".to_string()),
    }
}

pub fn sample_mode(protocol_code: u8) -> DeviceMode {
    DeviceMode {
        config_number: 1,
        interface_number: 0,
        setting_number: 0,
        protocol_code,
        had_kernel_driver: false,
    }
}

pub fn sample_endpoints(with_interrupt: bool) -> Endpoints {
    Endpoints {
        bulk_out: Endpoint {
            address: BULK_OUT_ADDR,
            max_packet_size: 64,
            transfer_type: rusb::TransferType::Bulk,
            direction: rusb::Direction::Out,
        },
        bulk_in: Endpoint {
            address: BULK_IN_ADDR,
            max_packet_size: 64,
            transfer_type: rusb::TransferType::Bulk,
            direction: rusb::Direction::In,
        },
        interrupt_in: with_interrupt.then(|| Endpoint {
            address: INTERRUPT_IN_ADDR,
            max_packet_size: 8,
            transfer_type: rusb::TransferType::Interrupt,
            direction: rusb::Direction::In,
        }),
    }
}

/// Build a 24-byte GET_CAPABILITIES response with the given flag bits, for
/// seeding `MockTransport::expect_control(7, ...)`.
pub fn capabilities_buffer(
    usbtmc_interface_caps: u8,
    usbtmc_device_caps: u8,
    usb488_interface_caps: u8,
    usb488_device_caps: u8,
) -> Vec<u8> {
    let mut buf = vec![0u8; 24];
    buf[0] = 0x01; // STATUS_SUCCESS
    buf[2..4].copy_from_slice(&0x0100u16.to_le_bytes());
    buf[4] = usbtmc_interface_caps;
    buf[5] = usbtmc_device_caps;
    buf[12..14].copy_from_slice(&0x0100u16.to_le_bytes());
    buf[14] = usb488_interface_caps;
    buf[15] = usb488_device_caps;
    buf
}

/// Build a DEV_DEP_MSG_IN (MsgID=2 response) bulk-in frame by hand, the way
/// a real device would emit it, for scripting into `MockTransport`.
pub fn dev_dep_msg_in_frame(b_tag: u8, payload: &[u8], eom: bool) -> Vec<u8> {
    let mut frame = vec![0u8; 12];
    frame[0] = 2; // DEVICE_DEPENDENT_MSG_IN
    frame[1] = b_tag;
    frame[2] = !b_tag;
    frame[4..8].copy_from_slice(&(payload.len() as u32).to_le_bytes());
    if eom {
        frame[8] = 0b0000_0001;
    }
    frame.extend_from_slice(payload);
    frame
}

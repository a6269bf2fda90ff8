//! End-to-end scenarios driven against [`support::mock::MockTransport`]
//! instead of real hardware: identify query, split reads, abort recovery,
//! bTag-mismatch retry, the `accept_short_read_as_eom` quirk, and the three
//! `read_stb` sourcing modes.

mod support;

use support::mock::{
    capabilities_buffer, dev_dep_msg_in_frame, sample_endpoints, sample_info, sample_mode,
    MockTransport,
};
use usbtmc_core::{AbortRecoveryPolicy, Device, Error, OpenOptions, QuirksRecord, ReadStatusByteVia};

const USB488_PROTOCOL: u8 = 1;
const USBTMC_ONLY_PROTOCOL: u8 = 0;

fn open_with(transport: MockTransport, protocol_code: u8, quirks: QuirksRecord) -> Device {
    Device::open_with_transport(
        Box::new(transport),
        sample_info(),
        sample_mode(protocol_code),
        sample_endpoints(true),
        quirks,
        OpenOptions::default(),
    )
    .expect("open_with_transport should succeed")
}

#[test]
fn s1_identify_query_round_trips() {
    let mut transport = MockTransport::new();
    transport.expect_control(
        7,
        capabilities_buffer(0b0000_0111, 0b0000_0001, 0b0000_0111, 0b0000_0011),
    );
    transport.push_bulk_in(dev_dep_msg_in_frame(2, b"ACME,MODEL,12345,1.0\n", true));

    let device = open_with(transport, USB488_PROTOCOL, QuirksRecord::default());

    let reply = device.query(b"*IDN?\n", 256).expect("query should succeed");
    assert_eq!(reply, b"ACME,MODEL,12345,1.0\n");
}

#[test]
fn s2_split_read_capped_at_segment_size() {
    let mut transport = MockTransport::new();
    transport.expect_control(7, capabilities_buffer(0, 0, 0, 0));
    transport.push_bulk_in(dev_dep_msg_in_frame(1, &[b'a'; 64], false));
    transport.push_bulk_in(dev_dep_msg_in_frame(2, &[b'b'; 64], false));
    transport.push_bulk_in(dev_dep_msg_in_frame(3, &[b'c'; 64], false));
    transport.push_bulk_in(dev_dep_msg_in_frame(4, &[b'd'; 8], true));

    let quirks = QuirksRecord {
        max_transfer_size: Some(64),
        ..Default::default()
    };
    let device = open_with(transport, USBTMC_ONLY_PROTOCOL, quirks);

    let bytes = device.read(200).expect("read should succeed across 4 segments");
    assert_eq!(bytes.len(), 200);
    assert_eq!(&bytes[0..64], &[b'a'; 64][..]);
    assert_eq!(&bytes[64..128], &[b'b'; 64][..]);
    assert_eq!(&bytes[128..192], &[b'c'; 64][..]);
    assert_eq!(&bytes[192..200], &[b'd'; 8][..]);
}

#[test]
fn s3_bulk_in_timeout_triggers_abort_recovery_and_settles_idle() {
    let mut transport = MockTransport::new();
    transport.expect_control(7, capabilities_buffer(0, 0, 0, 0));
    transport.push_bulk_in_timeout();
    // INITIATE_ABORT_BULK_IN (3) and CHECK_ABORT_BULK_IN_STATUS (4) both SUCCEED.
    transport.expect_control(3, vec![0x01, 0x00]);
    transport.expect_control(4, vec![0x01, 0x00, 0x00, 0x00, 0, 0, 0, 0]);

    let device = open_with(transport, USBTMC_ONLY_PROTOCOL, QuirksRecord::default());

    let err = device.read(64).expect_err("bulk-in timeout should surface as an error");
    assert!(matches!(err, Error::IoTimeout));
    // INITIATE_ABORT_BULK_IN and its CHECK_*_STATUS both reported success,
    // so recovery settles the handle back into Idle, not Halted.
    assert!(!device.is_halted().unwrap());
}

#[test]
fn s3_abort_recovery_failure_under_spec_policy_halts_the_handle() {
    let mut transport = MockTransport::new();
    transport.expect_control(7, capabilities_buffer(0, 0, 0, 0));
    transport.push_bulk_in_timeout();
    // INITIATE_ABORT_BULK_IN itself reports FAILED.
    transport.expect_control(3, vec![0x80, 0x00]);

    let quirks = QuirksRecord {
        abort_recovery_policy: AbortRecoveryPolicy::Spec,
        ..Default::default()
    };
    let device = open_with(transport, USBTMC_ONLY_PROTOCOL, quirks);

    let err = device.read(64).expect_err("read should fail");
    assert!(matches!(err, Error::IoTimeout));
    assert!(device.is_halted().unwrap(), "failed abort recovery under Spec policy halts the handle");

    let second = device.read(64).expect_err("a halted handle rejects further I/O");
    assert!(matches!(second, Error::Halted));
}

#[test]
fn s4_btag_mismatch_retries_once_then_succeeds() {
    let mut transport = MockTransport::new();
    transport.expect_control(7, capabilities_buffer(0, 0, 0, 0));
    // Wrong bTag (echo of a stale response) followed by the correct one.
    transport.push_bulk_in(dev_dep_msg_in_frame(99, b"stale", true));
    transport.push_bulk_in(dev_dep_msg_in_frame(1, b"fresh", true));

    let device = open_with(transport, USBTMC_ONLY_PROTOCOL, QuirksRecord::default());

    let bytes = device.read(64).expect("read should recover via the one-shot retry");
    assert_eq!(bytes, b"fresh");
}

#[test]
fn s4_btag_mismatch_persisting_after_retry_is_a_protocol_violation() {
    let mut transport = MockTransport::new();
    transport.expect_control(7, capabilities_buffer(0, 0, 0, 0));
    transport.push_bulk_in(dev_dep_msg_in_frame(99, b"stale", true));
    transport.push_bulk_in(dev_dep_msg_in_frame(98, b"still stale", true));
    transport.expect_control(3, vec![0x01, 0x00]);
    transport.expect_control(4, vec![0x01, 0x00, 0x00, 0x00, 0, 0, 0, 0]);

    let device = open_with(transport, USBTMC_ONLY_PROTOCOL, QuirksRecord::default());

    let err = device.read(64).expect_err("persisted mismatch should fail");
    assert!(matches!(err, Error::ProtocolViolation(_)));
}

#[test]
fn s5_accept_short_read_as_eom_quirk_stops_early() {
    let mut transport = MockTransport::new();
    transport.expect_control(7, capabilities_buffer(0, 0, 0, 0));
    // Short packet (32 of a requested-up-to-64 transfer), EOM bit unset.
    transport.push_bulk_in(dev_dep_msg_in_frame(1, &[b'x'; 32], false));

    let quirks = QuirksRecord {
        accept_short_read_as_eom: true,
        ..Default::default()
    };
    let device = open_with(transport, USBTMC_ONLY_PROTOCOL, quirks);

    let (bytes, eom) = device.read_cancellable(64, None).expect("short read should complete");
    assert_eq!(bytes.len(), 32);
    assert!(eom, "quirk should treat the short packet as EOM");
}

#[test]
fn s5_without_the_quirk_a_short_non_eom_packet_keeps_reading() {
    let mut transport = MockTransport::new();
    transport.expect_control(7, capabilities_buffer(0, 0, 0, 0));
    transport.push_bulk_in(dev_dep_msg_in_frame(1, &[b'x'; 32], false));
    transport.push_bulk_in(dev_dep_msg_in_frame(2, &[b'y'; 10], true));

    let device = open_with(transport, USBTMC_ONLY_PROTOCOL, QuirksRecord::default());

    let (bytes, eom) = device.read_cancellable(64, None).expect("read should continue past the short packet");
    assert_eq!(bytes.len(), 42);
    assert!(eom);
}

#[test]
fn s6_read_stb_via_control() {
    let mut transport = MockTransport::new();
    transport.expect_control(
        7,
        capabilities_buffer(0, 0, 0b0000_0111, 0b0000_0011),
    );
    // READ_STATUS_BYTE (128): status SUCCESS, bTag echo, status byte 0x42.
    transport.expect_control(128, vec![0x01, 0x01, 0x42]);

    let quirks = QuirksRecord {
        read_status_byte_via: ReadStatusByteVia::Control,
        ..Default::default()
    };
    let device = open_with(transport, USB488_PROTOCOL, quirks);

    assert_eq!(device.read_stb().unwrap(), 0x42);
}

#[test]
fn s6_read_stb_via_interrupt() {
    let mut transport = MockTransport::new();
    transport.expect_control(7, capabilities_buffer(0, 0, 0b0000_0111, 0b0000_0011));
    transport.interrupt_queue.push_back(vec![0x01, 0x42]);

    let quirks = QuirksRecord {
        read_status_byte_via: ReadStatusByteVia::Interrupt,
        ..Default::default()
    };
    let device = open_with(transport, USB488_PROTOCOL, quirks);

    assert_eq!(device.read_stb().unwrap(), 0x42);
}

#[test]
fn s6_read_stb_via_both_requires_agreement() {
    let mut transport = MockTransport::new();
    transport.expect_control(7, capabilities_buffer(0, 0, 0b0000_0111, 0b0000_0011));
    transport.expect_control(128, vec![0x01, 0x01, 0x42]);
    transport.interrupt_queue.push_back(vec![0x01, 0x43]); // disagrees

    let quirks = QuirksRecord {
        read_status_byte_via: ReadStatusByteVia::Both,
        ..Default::default()
    };
    let device = open_with(transport, USB488_PROTOCOL, quirks);

    let err = device.read_stb().expect_err("disagreeing sources should error");
    assert!(matches!(err, Error::ProtocolViolation(_)));
}

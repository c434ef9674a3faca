//! Engine scenarios driven end-to-end: a guest-side codec talks to a
//! [`Host`] wrapped around a scripted mock backend, and the tests assert
//! on both the wire traffic the guest observes and the calls the backend
//! records.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use usbredir::backend::{
    BackendError, TransferCompletion, TransferKind, TransferRequest, TransferStatus, UsbBackend,
};
use usbredir::descriptors::DeviceDescriptor;
use usbredir::filter::{self, CheckFlags, Rule};
use usbredir::proto::{
    AltSettingStatusHeader, BulkPacketHeader, ConfigurationStatusHeader, ControlPacketHeader,
    DeviceConnectHeader, EpInfoHeader, InterfaceInfoHeader, InterruptPacketHeader,
    InterruptReceivingStatusHeader, IsoPacketHeader, IsoStreamStatusHeader,
    SetAltSettingHeader, SetConfigurationHeader, StartIsoStreamHeader,
    StartInterruptReceivingHeader, StopIsoStreamHeader,
};
use usbredir::{Cap, CapSet, Host, PacketHandler, Parser, ParserFlags, Speed, Status, Transport};

const DEVICE_DESCRIPTOR: [u8; 18] = [
    0x12, 0x01, 0x00, 0x02, // bcdUSB 2.0
    0x00, 0x00, 0x00, // class/subclass/protocol: per interface
    0x40, // max packet size 0
    0x34, 0x12, // idVendor 0x1234
    0x78, 0x56, // idProduct 0x5678
    0x00, 0x01, // bcdDevice 1.00
    0x00, 0x00, 0x00, // no strings
    0x02, // two configurations
];

#[rustfmt::skip]
const CONFIG_1: [u8; 39] = [
    // configuration 1: one interface
    0x09, 0x02, 0x27, 0x00, 0x01, 0x01, 0x00, 0x80, 0x32,
    // interface 0 alt 0, vendor class, three endpoints
    0x09, 0x04, 0x00, 0x00, 0x03, 0xff, 0x00, 0x00, 0x00,
    // ep 0x01: iso OUT, 64 bytes
    0x07, 0x05, 0x01, 0x01, 0x40, 0x00, 0x01,
    // ep 0x81: interrupt IN, 8 bytes, interval 10
    0x07, 0x05, 0x81, 0x03, 0x08, 0x00, 0x0a,
    // ep 0x02: bulk OUT, 64 bytes
    0x07, 0x05, 0x02, 0x02, 0x40, 0x00, 0x00,
];

#[rustfmt::skip]
const CONFIG_2: [u8; 18] = [
    // configuration 2: one interface, no endpoints
    0x09, 0x02, 0x12, 0x00, 0x01, 0x02, 0x00, 0x80, 0x32,
    0x09, 0x04, 0x00, 0x00, 0x00, 0xff, 0x00, 0x00, 0x00,
];

#[derive(Default)]
struct MockState {
    active_config: u8,
    in_flight: Vec<TransferRequest>,
    cancelled: Vec<usize>,
    claims: Vec<u8>,
    releases: Vec<u8>,
    resets: usize,
    clear_halts: Vec<u8>,
    set_configurations: Vec<u8>,
    set_alt_settings: Vec<(u8, u8)>,
}

#[derive(Clone)]
struct MockBackend(Arc<Mutex<MockState>>);

impl MockBackend {
    fn new() -> MockBackend {
        MockBackend(Arc::new(Mutex::new(MockState {
            active_config: 1,
            ..Default::default()
        })))
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.0.lock().unwrap()
    }

    /// Pull a submitted transfer out of the in-flight list by token.
    fn take_in_flight(&self, token: usize) -> TransferRequest {
        let mut st = self.state();
        let pos = st
            .in_flight
            .iter()
            .position(|r| r.token == token)
            .expect("transfer not in flight");
        st.in_flight.remove(pos)
    }
}

impl UsbBackend for MockBackend {
    fn speed(&self) -> Speed {
        Speed::High
    }

    fn device_descriptor(&self) -> Result<DeviceDescriptor, BackendError> {
        Ok(DeviceDescriptor::new(&DEVICE_DESCRIPTOR).unwrap())
    }

    fn active_config_descriptor(&self) -> Result<Option<Vec<u8>>, BackendError> {
        match self.state().active_config {
            1 => Ok(Some(CONFIG_1.to_vec())),
            2 => Ok(Some(CONFIG_2.to_vec())),
            _ => Ok(None),
        }
    }

    fn config_descriptor_by_index(&self, index: u8) -> Result<Vec<u8>, BackendError> {
        match index {
            0 => Ok(CONFIG_1.to_vec()),
            1 => Ok(CONFIG_2.to_vec()),
            _ => Err(BackendError::NotFound),
        }
    }

    fn set_configuration(&self, configuration: u8) -> Result<(), BackendError> {
        let mut st = self.state();
        st.set_configurations.push(configuration);
        st.active_config = configuration;
        Ok(())
    }

    fn claim_interface(&self, number: u8) -> Result<(), BackendError> {
        self.state().claims.push(number);
        Ok(())
    }

    fn release_interface(&self, number: u8) -> Result<(), BackendError> {
        self.state().releases.push(number);
        Ok(())
    }

    fn set_interface_alt_setting(&self, number: u8, alt: u8) -> Result<(), BackendError> {
        self.state().set_alt_settings.push((number, alt));
        Ok(())
    }

    fn reset_device(&self) -> Result<(), BackendError> {
        self.state().resets += 1;
        Ok(())
    }

    fn clear_halt(&self, endpoint: u8) -> Result<(), BackendError> {
        self.state().clear_halts.push(endpoint);
        Ok(())
    }

    fn set_auto_detach_kernel_driver(&self, _enabled: bool) {}

    fn attach_kernel_driver(&self, _number: u8) -> Result<(), BackendError> {
        Ok(())
    }

    fn alloc_streams(&self, _endpoints: &[u8], count: u32) -> Result<u32, BackendError> {
        Ok(count)
    }

    fn free_streams(&self, _endpoints: &[u8]) -> Result<(), BackendError> {
        Ok(())
    }

    fn submit(&self, transfer: TransferRequest) -> Result<(), BackendError> {
        self.state().in_flight.push(transfer);
        Ok(())
    }

    fn cancel(&self, token: usize) {
        self.state().cancelled.push(token);
    }

    fn poll_completions(&self, _timeout: Duration, sink: &mut dyn FnMut(TransferCompletion)) {
        // Resolve every cancelled in-flight transfer; collect first so the
        // sink can call back into the backend.
        let done: Vec<TransferRequest> = {
            let mut st = self.state();
            let cancelled = std::mem::take(&mut st.cancelled);
            let mut done = Vec::new();
            let mut kept = Vec::new();
            for req in st.in_flight.drain(..) {
                if cancelled.contains(&req.token) {
                    done.push(req);
                } else {
                    kept.push(req);
                }
            }
            st.in_flight = kept;
            done
        };
        for req in done {
            sink(TransferCompletion {
                token: req.token,
                status: TransferStatus::Cancelled,
                buffer: req.buffer,
                actual_len: 0,
                iso_packets: Vec::new(),
            });
        }
    }
}

struct Pipe {
    input: VecDeque<u8>,
    output: Vec<u8>,
}

impl Pipe {
    fn new() -> Pipe {
        Pipe {
            input: VecDeque::new(),
            output: Vec::new(),
        }
    }
}

impl Transport for Pipe {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.input.is_empty() {
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "dry"));
        }
        let n = buf.len().min(self.input.len());
        for b in buf[..n].iter_mut() {
            *b = self.input.pop_front().unwrap();
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.output.extend_from_slice(buf);
        Ok(buf.len())
    }
}

/// Wire events as seen by the guest, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Hello,
    DeviceConnect { vendor_id: u16, product_id: u16, speed: Speed },
    DeviceDisconnect,
    EpInfo { types: Vec<u8>, max_packet_size: Vec<u16> },
    InterfaceInfo { count: u32 },
    ConfigurationStatus { status: u8, configuration: u8 },
    AltSettingStatus { status: u8, interface: u8, alt: u8 },
    IsoStreamStatus { status: u8, endpoint: u8 },
    InterruptReceivingStatus { status: u8, endpoint: u8 },
    ControlPacket { id: u64, status: u8, data: Vec<u8> },
    BulkPacket { id: u64, status: u8 },
    InterruptPacket { id: u64, status: u8, data: Vec<u8> },
}

#[derive(Default)]
struct GuestRecorder {
    events: Vec<Event>,
}

impl GuestRecorder {
    fn drain(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }
}

impl PacketHandler for GuestRecorder {
    fn hello(&mut self, _parser: &Parser, _version: &str) {
        self.events.push(Event::Hello);
    }

    fn device_connect(&mut self, _parser: &Parser, header: &DeviceConnectHeader) {
        self.events.push(Event::DeviceConnect {
            vendor_id: header.vendor_id,
            product_id: header.product_id,
            speed: header.speed,
        });
    }

    fn device_disconnect(&mut self, _parser: &Parser) {
        self.events.push(Event::DeviceDisconnect);
    }

    fn ep_info(&mut self, _parser: &Parser, header: &EpInfoHeader) {
        self.events.push(Event::EpInfo {
            types: header.ep_type.to_vec(),
            max_packet_size: header.max_packet_size.to_vec(),
        });
    }

    fn interface_info(&mut self, _parser: &Parser, header: &InterfaceInfoHeader) {
        self.events.push(Event::InterfaceInfo {
            count: header.interface_count,
        });
    }

    fn configuration_status(
        &mut self,
        _parser: &Parser,
        _id: u64,
        header: &ConfigurationStatusHeader,
    ) {
        self.events.push(Event::ConfigurationStatus {
            status: header.status,
            configuration: header.configuration,
        });
    }

    fn alt_setting_status(&mut self, _parser: &Parser, _id: u64, header: &AltSettingStatusHeader) {
        self.events.push(Event::AltSettingStatus {
            status: header.status,
            interface: header.interface,
            alt: header.alt,
        });
    }

    fn iso_stream_status(&mut self, _parser: &Parser, _id: u64, header: &IsoStreamStatusHeader) {
        self.events.push(Event::IsoStreamStatus {
            status: header.status,
            endpoint: header.endpoint,
        });
    }

    fn interrupt_receiving_status(
        &mut self,
        _parser: &Parser,
        _id: u64,
        header: &InterruptReceivingStatusHeader,
    ) {
        self.events.push(Event::InterruptReceivingStatus {
            status: header.status,
            endpoint: header.endpoint,
        });
    }

    fn control_packet(
        &mut self,
        _parser: &Parser,
        id: u64,
        header: ControlPacketHeader,
        data: Vec<u8>,
    ) {
        self.events.push(Event::ControlPacket {
            id,
            status: header.status,
            data,
        });
    }

    fn bulk_packet(&mut self, _parser: &Parser, id: u64, header: BulkPacketHeader, _data: Vec<u8>) {
        self.events.push(Event::BulkPacket {
            id,
            status: header.status,
        });
    }

    fn interrupt_packet(
        &mut self,
        _parser: &Parser,
        id: u64,
        header: InterruptPacketHeader,
        data: Vec<u8>,
    ) {
        self.events.push(Event::InterruptPacket {
            id,
            status: header.status,
            data,
        });
    }
}

struct Harness {
    backend: MockBackend,
    host: Host<MockBackend>,
    guest: Parser,
    guest_seen: GuestRecorder,
}

impl Harness {
    fn new() -> Harness {
        let backend = MockBackend::new();
        let host = Host::open(backend.clone(), "usbredir test host").unwrap();
        let guest = Parser::new(
            "usbredir test guest",
            CapSet::from_caps(&[
                Cap::BulkStreams,
                Cap::ConnectDeviceVersion,
                Cap::Filter,
                Cap::EpInfoMaxPacketSize,
                Cap::Ids64Bits,
                Cap::BulkLength32Bits,
                Cap::BulkReceiving,
            ]),
            ParserFlags::default(),
        );
        let mut h = Harness {
            backend,
            host,
            guest,
            guest_seen: GuestRecorder::default(),
        };
        h.pump();
        h
    }

    /// Shuttle bytes both ways until neither side has anything queued.
    fn pump(&mut self) {
        loop {
            let mut moved = false;

            let mut t = Pipe::new();
            self.guest.do_write(&mut t).unwrap();
            if !t.output.is_empty() {
                moved = true;
                let mut p = Pipe::new();
                p.input.extend(t.output);
                self.host.read_guest_data(&mut p).unwrap();
            }

            let mut t = Pipe::new();
            self.host.write_guest_data(&mut t).unwrap();
            if !t.output.is_empty() {
                moved = true;
                let mut p = Pipe::new();
                p.input.extend(t.output);
                self.guest.do_read(&mut p, &mut self.guest_seen).unwrap();
            }

            if !moved {
                return;
            }
        }
    }

    fn send_iso_out_packet(&mut self, id: u64, data: &[u8]) {
        self.guest.send_iso_packet(
            id,
            &IsoPacketHeader {
                endpoint: 0x01,
                status: Status::Success as u8,
                length: data.len() as u16,
            },
            data,
        );
        self.pump();
    }
}

/// Connect handshake: the device is announced as endpoint table, then
/// interface list, then `device_connect`, and never before the hello.
#[test]
fn connect_sequencing() {
    let mut h = Harness::new();
    let events = h.guest_seen.drain();

    assert_eq!(events[0], Event::Hello);
    match &events[1] {
        Event::EpInfo {
            types,
            max_packet_size,
        } => {
            // Slot 1 = ep 0x01 iso, slot 2 = ep 0x02 bulk, slot 17 = ep 0x81
            // interrupt; slots 0/16 are the default control pipe.
            assert_eq!(types[0], 0);
            assert_eq!(types[1], 1);
            assert_eq!(types[2], 2);
            assert_eq!(types[16], 0);
            assert_eq!(types[17], 3);
            assert_eq!(types[3], 255);
            assert_eq!(max_packet_size[1], 64);
            assert_eq!(max_packet_size[17], 8);
        }
        other => panic!("expected ep_info, got {other:?}"),
    }
    assert_eq!(events[2], Event::InterfaceInfo { count: 1 });
    assert_eq!(
        events[3],
        Event::DeviceConnect {
            vendor_id: 0x1234,
            product_id: 0x5678,
            speed: Speed::High,
        }
    );
    assert_eq!(events.len(), 4);

    // The initial device reset happened at open, before the guest asked
    // for anything.
    assert_eq!(h.backend.state().resets, 1);
    assert_eq!(h.backend.state().claims, vec![0]);
}

/// Invariant: a configuration change ends with exactly
/// `ep_info, interface_info, configuration_status` on the wire.
#[test]
fn set_configuration_packet_order() {
    let mut h = Harness::new();
    h.guest_seen.drain();

    h.guest
        .send_set_configuration(7, &SetConfigurationHeader { configuration: 2 });
    h.pump();

    let events = h.guest_seen.drain();
    assert_eq!(events.len(), 3);
    match &events[0] {
        Event::EpInfo { types, .. } => {
            // Config 2 has no endpoints: only the control slots remain.
            assert_eq!(types[0], 0);
            assert_eq!(types[16], 0);
            assert!(types[1..16].iter().all(|&t| t == 255));
        }
        other => panic!("expected ep_info, got {other:?}"),
    }
    assert_eq!(events[1], Event::InterfaceInfo { count: 1 });
    assert_eq!(
        events[2],
        Event::ConfigurationStatus {
            status: Status::Success as u8,
            configuration: 2,
        }
    );

    let st = h.backend.state();
    assert_eq!(st.set_configurations, vec![2]);
    // Interface 0 was released for the switch and re-claimed after it.
    assert_eq!(st.releases, vec![0]);
    assert_eq!(st.claims, vec![0, 0]);
}

#[test]
fn set_alt_setting_unknown_interface() {
    let mut h = Harness::new();
    h.guest_seen.drain();

    h.guest.send_set_alt_setting(
        3,
        &SetAltSettingHeader {
            interface: 9,
            alt: 1,
        },
    );
    h.pump();

    assert_eq!(
        h.guest_seen.drain(),
        vec![Event::AltSettingStatus {
            status: Status::Inval as u8,
            interface: 9,
            alt: 0xff,
        }]
    );
    assert!(h.backend.state().set_alt_settings.is_empty());
}

/// S4: an output iso stream submits nothing until half the ring is
/// buffered; the 16th packet (8 pkts x 4 transfers / 2) starts it.
#[test]
fn iso_out_deferred_start() {
    let mut h = Harness::new();
    h.guest_seen.drain();

    h.guest.send_start_iso_stream(
        1,
        &StartIsoStreamHeader {
            endpoint: 0x01,
            pkts_per_urb: 8,
            no_urbs: 4,
        },
    );
    h.pump();
    assert_eq!(
        h.guest_seen.drain(),
        vec![Event::IsoStreamStatus {
            status: Status::Success as u8,
            endpoint: 0x01,
        }]
    );

    for n in 0..15 {
        h.send_iso_out_packet(100 + n, &[n as u8; 64]);
        assert!(h.backend.state().in_flight.is_empty());
    }

    h.send_iso_out_packet(115, &[0xee; 64]);
    {
        let st = h.backend.state();
        // Half the ring (2 of 4 transfers) went in flight, 8 packets each.
        assert_eq!(st.in_flight.len(), 2);
        for req in &st.in_flight {
            assert_eq!(req.endpoint, 0x01);
            match &req.kind {
                TransferKind::Iso { packet_lengths } => {
                    assert_eq!(packet_lengths, &vec![64u32; 8]);
                }
                other => panic!("expected iso transfer, got {other:?}"),
            }
        }
    }

    // No unsolicited status while the stream runs.
    h.pump();
    assert_eq!(h.guest_seen.drain(), vec![]);

    // Stopping reports success and cancels the in-flight transfers.
    h.guest
        .send_stop_iso_stream(2, &StopIsoStreamHeader { endpoint: 0x01 });
    h.pump();
    assert_eq!(
        h.guest_seen.drain(),
        vec![Event::IsoStreamStatus {
            status: Status::Success as u8,
            endpoint: 0x01,
        }]
    );
    assert_eq!(h.backend.state().cancelled.len(), 2);
}

/// Stream parameter boundaries: 1 and 32 packets per transfer are
/// accepted, 0 and 33 are rejected with a stall status.
#[test]
fn iso_stream_parameter_boundaries() {
    for (pkts, expect) in [
        (1u8, Status::Success),
        (32, Status::Success),
        (0, Status::Stall),
        (33, Status::Stall),
    ] {
        let mut h = Harness::new();
        h.guest_seen.drain();

        h.guest.send_start_iso_stream(
            1,
            &StartIsoStreamHeader {
                endpoint: 0x01,
                pkts_per_urb: pkts,
                no_urbs: 4,
            },
        );
        h.pump();
        assert_eq!(
            h.guest_seen.drain(),
            vec![Event::IsoStreamStatus {
                status: expect as u8,
                endpoint: 0x01,
            }],
            "pkts_per_urb = {pkts}"
        );
    }
}

#[test]
fn iso_stream_double_start_is_inval() {
    let mut h = Harness::new();
    h.guest_seen.drain();

    let start = StartIsoStreamHeader {
        endpoint: 0x01,
        pkts_per_urb: 8,
        no_urbs: 4,
    };
    h.guest.send_start_iso_stream(1, &start);
    h.pump();
    h.guest_seen.drain();

    h.guest.send_start_iso_stream(2, &start);
    h.pump();
    assert_eq!(
        h.guest_seen.drain(),
        vec![Event::IsoStreamStatus {
            status: Status::Inval as u8,
            endpoint: 0x01,
        }]
    );
}

/// S5: a cancelled control transfer is answered exactly once, with
/// `cancelled`, even when the native completion races in later.
#[test]
fn cancel_race_reports_once() {
    let mut h = Harness::new();
    h.guest_seen.drain();

    h.guest.send_control_packet(
        42,
        &ControlPacketHeader {
            endpoint: 0x00,
            request: 0x01,
            request_type: 0x40, // vendor, host-to-device
            status: 0,
            value: 0,
            index: 0,
            length: 4,
        },
        &[1, 2, 3, 4],
    );
    h.pump();
    let token = {
        let st = h.backend.state();
        assert_eq!(st.in_flight.len(), 1);
        st.in_flight[0].token
    };

    h.guest.send_cancel_data_packet(42);
    h.pump();
    assert_eq!(
        h.guest_seen.drain(),
        vec![Event::ControlPacket {
            id: 42,
            status: Status::Cancelled as u8,
            data: vec![],
        }]
    );
    assert_eq!(h.backend.state().cancelled, vec![token]);

    // A late native completion with success must be discarded.
    let req = h.backend.take_in_flight(token);
    h.backend.state().cancelled.clear();
    h.host.handle_completion(TransferCompletion {
        token,
        status: TransferStatus::Completed,
        buffer: req.buffer,
        actual_len: 4,
        iso_packets: Vec::new(),
    });
    h.pump();
    assert_eq!(h.guest_seen.drain(), vec![]);
}

/// A control IN completion carries the device's data back to the guest.
#[test]
fn control_in_roundtrip() {
    let mut h = Harness::new();
    h.guest_seen.drain();

    h.guest.send_control_packet(
        7,
        &ControlPacketHeader {
            endpoint: 0x80,
            request: 0x06, // GET_DESCRIPTOR
            request_type: 0x80,
            status: 0,
            value: 0x0100,
            index: 0,
            length: 18,
        },
        &[],
    );
    h.pump();

    let req = {
        let st = h.backend.state();
        assert_eq!(st.in_flight.len(), 1);
        match &st.in_flight[0].kind {
            TransferKind::Control { setup } => {
                assert_eq!(setup.request, 0x06);
                assert_eq!(setup.value, 0x0100);
                assert_eq!(setup.length, 18);
            }
            other => panic!("expected control transfer, got {other:?}"),
        }
        st.in_flight[0].token
    };
    let mut req = h.backend.take_in_flight(req);
    req.buffer[..18].copy_from_slice(&DEVICE_DESCRIPTOR);
    h.host.handle_completion(TransferCompletion {
        token: req.token,
        status: TransferStatus::Completed,
        buffer: req.buffer,
        actual_len: 18,
        iso_packets: Vec::new(),
    });
    h.pump();

    assert_eq!(
        h.guest_seen.drain(),
        vec![Event::ControlPacket {
            id: 7,
            status: Status::Success as u8,
            data: DEVICE_DESCRIPTOR.to_vec(),
        }]
    );
}

/// A clear-stall control request is not forwarded: the engine clears the
/// halt at the device and synthesizes the reply.
#[test]
fn clear_feature_passthrough() {
    let mut h = Harness::new();
    h.guest_seen.drain();

    h.guest.send_control_packet(
        9,
        &ControlPacketHeader {
            endpoint: 0x00,
            request: 0x01,      // CLEAR_FEATURE
            request_type: 0x02, // endpoint recipient
            status: 0,
            value: 0, // ENDPOINT_HALT
            index: 0x81,
            length: 0,
        },
        &[],
    );
    h.pump();

    assert_eq!(h.backend.state().clear_halts, vec![0x81]);
    assert!(h.backend.state().in_flight.is_empty());
    assert_eq!(
        h.guest_seen.drain(),
        vec![Event::ControlPacket {
            id: 9,
            status: Status::Success as u8,
            data: vec![],
        }]
    );
}

/// Interrupt receiving: five transfers pump immediately; a completion is
/// forwarded and the transfer resubmitted; a stall completion rebuilds the
/// stream after clearing the halt, with no status sent to the guest.
#[test]
fn interrupt_receiving_and_stall_recovery() {
    let mut h = Harness::new();
    h.guest_seen.drain();

    h.guest.send_start_interrupt_receiving(
        5,
        &StartInterruptReceivingHeader { endpoint: 0x81 },
    );
    h.pump();
    assert_eq!(
        h.guest_seen.drain(),
        vec![Event::InterruptReceivingStatus {
            status: Status::Success as u8,
            endpoint: 0x81,
        }]
    );
    assert_eq!(h.backend.state().in_flight.len(), 5);

    // Complete the first transfer with 4 bytes of data.
    let token = h.backend.state().in_flight[0].token;
    let mut req = h.backend.take_in_flight(token);
    req.buffer[..4].copy_from_slice(&[0xca, 0xfe, 0xba, 0xbe]);
    h.host.handle_completion(TransferCompletion {
        token,
        status: TransferStatus::Completed,
        buffer: req.buffer,
        actual_len: 4,
        iso_packets: Vec::new(),
    });
    h.pump();

    assert_eq!(
        h.guest_seen.drain(),
        vec![Event::InterruptPacket {
            id: 0,
            status: Status::Success as u8,
            data: vec![0xca, 0xfe, 0xba, 0xbe],
        }]
    );
    // Resubmitted: still five in flight.
    assert_eq!(h.backend.state().in_flight.len(), 5);

    // Now stall one: the engine cancels the stream, clears the halt and
    // reallocates silently.
    let token = h.backend.state().in_flight[0].token;
    let req = h.backend.take_in_flight(token);
    h.host.handle_completion(TransferCompletion {
        token,
        status: TransferStatus::Stall,
        buffer: req.buffer,
        actual_len: 0,
        iso_packets: Vec::new(),
    });

    assert_eq!(h.backend.state().clear_halts, vec![0x81]);
    // Four cancelled from the old ring, five fresh submissions.
    assert_eq!(h.backend.state().cancelled.len(), 4);
    assert_eq!(h.backend.state().in_flight.len(), 4 + 5);

    // Drain the cancelled ones and make sure the guest saw nothing.
    h.backend
        .poll_completions(Duration::ZERO, &mut |c| h.host.handle_completion(c));
    h.pump();
    assert_eq!(h.guest_seen.drain(), vec![]);
    assert_eq!(h.backend.state().in_flight.len(), 5);
}

/// A transfer completing with NO_DEVICE starts the disconnect sequence,
/// and the codec-level ack clears the way for a future connect.
#[test]
fn no_device_completion_disconnects() {
    let mut h = Harness::new();
    h.guest_seen.drain();

    h.guest.send_start_interrupt_receiving(
        5,
        &StartInterruptReceivingHeader { endpoint: 0x81 },
    );
    h.pump();
    h.guest_seen.drain();

    let token = h.backend.state().in_flight[0].token;
    let req = h.backend.take_in_flight(token);
    h.host.handle_completion(TransferCompletion {
        token,
        status: TransferStatus::NoDevice,
        buffer: req.buffer,
        actual_len: 0,
        iso_packets: Vec::new(),
    });
    h.pump();

    // The guest observed the disconnect; its codec acked it internally.
    assert_eq!(h.guest_seen.drain(), vec![Event::DeviceDisconnect]);
}

/// S3: filter decisions for the mock device (class 0x00 with one vendor
/// interface), plus the plain rule matching cases.
#[test]
fn filter_decisions() {
    let deny_hid: Vec<Rule> = filter::string_to_rules("0x03,-1,-1,-1,0", ",", "|").unwrap();

    let backend = MockBackend::new();
    // The vendor interface matches no rule: the default decides.
    assert!(usbredir::check_device_filter(
        &deny_hid,
        &backend,
        CheckFlags {
            default_allow: true,
            ..Default::default()
        }
    )
    .is_ok());
    assert!(usbredir::check_device_filter(&deny_hid, &backend, CheckFlags::default()).is_err());

    // An allow-everything rule admits the device regardless of default.
    let allow_all: Vec<Rule> = filter::string_to_rules("-1,-1,-1,-1,1", ",", "|").unwrap();
    assert!(
        usbredir::check_device_filter(&allow_all, &backend, CheckFlags::default()).is_ok()
    );
}

/// The guest's filter announcement is parsed and stored by the engine.
#[test]
fn guest_filter_stored() {
    let mut h = Harness::new();
    h.guest_seen.drain();

    let rules = filter::string_to_rules("0x03,-1,-1,-1,0|-1,-1,-1,-1,1", ",", "|").unwrap();
    h.guest.send_filter_filter(&rules);
    h.pump();

    assert_eq!(h.host.guest_filter(), Some(rules));
}

//! Device-side engine: owns a USB device through a [`UsbBackend`] and
//! exposes it over the redirection protocol.
//!
//! The engine is wired between a [`Parser`] (whose packet callbacks it
//! implements) and the backend's asynchronous transfers. Guest commands
//! come in on the reader thread via [`Host::read_guest_data`]; transfer
//! completions come in on the application's USB event thread via
//! [`Host::handle_completion`]. The two meet at the internal transfer
//! lock; a separate disconnect lock keeps the disconnect path from needing
//! nested locking when a completion observes a vanished device.
//!
//! Lock order, outermost first: device state, transfer state, disconnect
//! state, parser write queue.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use log::{debug, error, info, trace, warn};
use slab::Slab;

use crate::backend::{
    BackendError, SetupPacket, TransferCompletion, TransferKind, TransferRequest, TransferStatus,
    UsbBackend, BULK_TIMEOUT, CTRL_TIMEOUT, INTERRUPT_TIMEOUT, ISO_TIMEOUT,
};
use crate::caps::{Cap, CapSet};
use crate::descriptors::{Configuration, DeviceDescriptor};
use crate::filter::{self, CheckError, CheckFlags, InterfaceClass, Rule};
use crate::parser::{
    PacketHandler, Parser, ParserFlags, ReadError, Transport, WriteError,
};
use crate::proto::{
    AllocBulkStreamsHeader, AltSettingStatusHeader, BufferedBulkPacketHeader, BulkPacketHeader,
    BulkReceivingStatusHeader, BulkStreamsStatusHeader, ConfigurationStatusHeader,
    ControlPacketHeader, DeviceConnectHeader, EpInfoHeader, EpType, FreeBulkStreamsHeader,
    GetAltSettingHeader, InterfaceInfoHeader, InterruptPacketHeader,
    InterruptReceivingStatusHeader, IsoPacketHeader, IsoStreamStatusHeader,
    SetAltSettingHeader, SetConfigurationHeader, StartBulkReceivingHeader, StartIsoStreamHeader,
    StartInterruptReceivingHeader, Status, StopBulkReceivingHeader, StopIsoStreamHeader,
    StopInterruptReceivingHeader, MAX_ENDPOINTS, MAX_INTERFACES,
};

const MAX_TRANSFER_COUNT: usize = 16;
const MAX_PACKETS_PER_TRANSFER: usize = 32;
const INTERRUPT_TRANSFER_COUNT: usize = 5;

/// Devices that hang when reset; reset requests become no-ops for these.
const RESET_BLACKLIST: &[(u16, u16)] = &[(0x1210, 0x001c), (0x2798, 0x0001)];

/// Fold the direction bit into a 5-bit endpoint table index.
fn ep_index(ep: u8) -> usize {
    (((ep & 0x80) >> 3) | (ep & 0x0f)) as usize
}

fn index_to_ep(i: usize) -> u8 {
    (((i & 0x10) << 3) | (i & 0x0f)) as u8
}

/// Engine configuration flags.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostFlags {
    /// See [`crate::ParserFlags::write_cb_owns_buffer`]. The application
    /// should also install a buffered-output-size callback so isochronous
    /// back-pressure keeps working.
    pub write_cb_owns_buffer: bool,
}

/// Error from [`Host::open`].
#[derive(Debug)]
pub enum OpenError {
    /// The device's descriptors could not be read or its interfaces could
    /// not be claimed.
    Claim(BackendError),
    /// The initial device reset failed.
    Reset(BackendError),
}

impl std::fmt::Display for OpenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpenError::Claim(e) => write!(f, "could not claim device: {e}"),
            OpenError::Reset(e) => write!(f, "could not reset device: {e}"),
        }
    }
}

impl std::error::Error for OpenError {}

/// Error from [`Host::read_guest_data`].
#[derive(Debug)]
pub enum HostReadError {
    /// A malformed frame was skipped; the connection survives.
    Parse,
    /// The guest closed the connection.
    Closed,
    /// Fatal transport error.
    Io(io::Error),
    /// The guest's filter rejected our device.
    DeviceRejected,
    /// The device was lost (reset or reconfiguration failed).
    DeviceLost,
}

impl std::fmt::Display for HostReadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostReadError::Parse => write!(f, "protocol parse error"),
            HostReadError::Closed => write!(f, "guest closed the connection"),
            HostReadError::Io(e) => write!(f, "transport error: {e}"),
            HostReadError::DeviceRejected => write!(f, "device rejected by guest filter"),
            HostReadError::DeviceLost => write!(f, "device lost"),
        }
    }
}

impl std::error::Error for HostReadError {}

impl From<ReadError> for HostReadError {
    fn from(e: ReadError) -> HostReadError {
        match e {
            ReadError::Parse => HostReadError::Parse,
            ReadError::Closed => HostReadError::Closed,
            ReadError::Io(e) => HostReadError::Io(e),
        }
    }
}

/// Error from [`check_device_filter`].
#[derive(Debug)]
pub enum DeviceFilterError {
    /// Descriptors could not be read.
    Io(BackendError),
    /// The filter rejected the device (or the rules were invalid).
    Check(CheckError),
}

impl std::fmt::Display for DeviceFilterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceFilterError::Io(e) => write!(f, "could not read descriptors: {e}"),
            DeviceFilterError::Check(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for DeviceFilterError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadFate {
    DeviceRejected,
    DeviceLost,
}

#[derive(Default)]
struct DeviceState {
    desc: Option<DeviceDescriptor>,
    /// Raw descriptors of the active configuration.
    config: Option<Vec<u8>>,
    alt_setting: [u8; MAX_INTERFACES],
    restore_config: Option<u8>,
    claimed: bool,
    do_not_reset: bool,
    device_gone: bool,
    read_fate: Option<ReadFate>,
    filter_rules: Option<Vec<Rule>>,
}

fn parsed_config(dev: &DeviceState) -> Option<Configuration<'_>> {
    dev.config.as_deref().and_then(Configuration::new)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    /// Not in flight; for output iso streams, the number of packets
    /// buffered so far.
    Filled(usize),
    Submitted,
}

struct StreamSlot {
    state: SlotState,
    id: u64,
    /// Present while not submitted; the backend holds it in flight.
    buffer: Option<Vec<u8>>,
    /// Per-packet lengths for output iso fills.
    iso_lengths: Vec<u32>,
    token: Option<usize>,
}

struct Stream {
    kind: EpType,
    pkts_per_transfer: usize,
    transfer_count: usize,
    pkt_size: usize,
    started: bool,
    /// Next slot to fill with guest data (output streams).
    out_idx: usize,
    drop_packets: usize,
    slots: Vec<StreamSlot>,
}

struct EndpointState {
    ty: EpType,
    interval: u8,
    interface: u8,
    max_packet_size: usize,
    max_streams: u32,
    warn_on_drop: bool,
    stream: Option<Stream>,
}

impl Default for EndpointState {
    fn default() -> EndpointState {
        EndpointState {
            ty: EpType::Invalid,
            interval: 0,
            interface: 0,
            max_packet_size: 0,
            max_streams: 0,
            warn_on_drop: false,
            stream: None,
        }
    }
}

#[derive(Clone, Copy)]
enum OneShotHeader {
    Control(ControlPacketHeader),
    Bulk(BulkPacketHeader),
    Interrupt(InterruptPacketHeader),
}

impl OneShotHeader {
    fn endpoint(&self) -> u8 {
        match self {
            OneShotHeader::Control(h) => h.endpoint,
            OneShotHeader::Bulk(h) => h.endpoint,
            OneShotHeader::Interrupt(h) => h.endpoint,
        }
    }
}

enum TransferEntry {
    OneShot {
        id: u64,
        cancelled: bool,
        header: OneShotHeader,
    },
    Stream {
        ep_idx: usize,
        slot_idx: usize,
        cancelled: bool,
    },
}

#[derive(Default)]
struct IsoThreshold {
    higher: u64,
    lower: u64,
    dropping: bool,
}

struct TransferState {
    endpoints: [EndpointState; MAX_ENDPOINTS],
    transfers: Slab<TransferEntry>,
    cancels_pending: usize,
    iso_threshold: IsoThreshold,
}

impl Default for TransferState {
    fn default() -> TransferState {
        TransferState {
            endpoints: std::array::from_fn(|_| EndpointState::default()),
            transfers: Slab::new(),
            cancels_pending: 0,
            iso_threshold: IsoThreshold::default(),
        }
    }
}

struct DisconnectState {
    disconnected: bool,
    wait_disconnect: bool,
    connect_pending: bool,
}

enum IsoDisposition {
    /// Packet / transfer fine, keep going.
    Ok,
    /// This packet is borked, continue with the next.
    PacketError,
    /// The whole stream is gone (cancelled, stalled, device lost).
    StreamGone,
}

/// The device-side engine.
pub struct Host<B: UsbBackend> {
    parser: Parser,
    backend: B,
    dev: Mutex<DeviceState>,
    xfer: Mutex<TransferState>,
    disconnect: Mutex<DisconnectState>,
    /// Set by a successful reset, cleared by the next submission, so a
    /// guest reset right after connect can be skipped.
    reset_latch: AtomicBool,
    flush_writes: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
    buffered_output_size: Mutex<Option<Box<dyn Fn() -> u64 + Send + Sync>>>,
    owns_buffer: bool,
}

/// Borrow wrapper implementing the parser callbacks against the engine.
struct HostHandler<'a, B: UsbBackend> {
    host: &'a Host<B>,
}

impl<B: UsbBackend> Host<B> {
    /// Take ownership of a device and announce it to the guest.
    pub fn open(backend: B, version: &str) -> Result<Host<B>, OpenError> {
        Self::open_with_flags(backend, version, HostFlags::default())
    }

    pub fn open_with_flags(
        backend: B,
        version: &str,
        flags: HostFlags,
    ) -> Result<Host<B>, OpenError> {
        let caps = CapSet::from_caps(&[
            Cap::BulkStreams,
            Cap::ConnectDeviceVersion,
            Cap::Filter,
            Cap::DeviceDisconnectAck,
            Cap::EpInfoMaxPacketSize,
            Cap::Ids64Bits,
            Cap::BulkLength32Bits,
            Cap::BulkReceiving,
        ]);
        let parser = Parser::new(
            version,
            caps,
            ParserFlags {
                usb_host: true,
                write_cb_owns_buffer: flags.write_cb_owns_buffer,
                ..Default::default()
            },
        );

        let host = Host {
            parser,
            backend,
            dev: Mutex::new(DeviceState::default()),
            xfer: Mutex::new(TransferState::default()),
            disconnect: Mutex::new(DisconnectState {
                disconnected: true, // no device announced yet
                wait_disconnect: false,
                connect_pending: false,
            }),
            reset_latch: AtomicBool::new(false),
            flush_writes: Mutex::new(None),
            buffered_output_size: Mutex::new(None),
            owns_buffer: flags.write_cb_owns_buffer,
        };

        {
            let mut dev = host.dev.lock().unwrap();
            if let Err(e) = host.claim(&mut dev, true) {
                host.clear_device_locked(&mut dev);
                return Err(OpenError::Claim(e));
            }
            if let Some(desc) = &dev.desc {
                let ids = (desc.vendor_id(), desc.product_id());
                if RESET_BLACKLIST.contains(&ids) {
                    dev.do_not_reset = true;
                }
            }
        }

        // Most guests reset the device first thing; do the slow reset up
        // front and latch it.
        if let Err(e) = host.reset_device() {
            return Err(OpenError::Reset(e));
        }

        host.send_device_connect();
        host.flush();
        Ok(host)
    }

    /// Feed guest bytes into the engine. Call when the transport has data.
    pub fn read_guest_data(&self, transport: &mut dyn Transport) -> Result<(), HostReadError> {
        let mut handler = HostHandler { host: self };
        let r = self.parser.do_read(transport, &mut handler);
        // A rejection or device loss raised by a handler overrides the
        // plain read result.
        if let Some(fate) = self.dev.lock().unwrap().read_fate.take() {
            return Err(match fate {
                ReadFate::DeviceRejected => HostReadError::DeviceRejected,
                ReadFate::DeviceLost => HostReadError::DeviceLost,
            });
        }
        Ok(r?)
    }

    /// Number of queued outbound buffers.
    pub fn has_data_to_write(&self) -> usize {
        self.parser.has_data_to_write()
    }

    /// Drain queued outbound data into the transport.
    pub fn write_guest_data(&self, transport: &mut dyn Transport) -> Result<(), WriteError> {
        self.parser.do_write(transport)
    }

    /// Install a callback invoked whenever the engine queues data outside
    /// of a `read_guest_data` cycle (completions, disconnects).
    pub fn set_flush_writes_fn(&self, f: impl Fn() + Send + Sync + 'static) {
        *self.flush_writes.lock().unwrap() = Some(Box::new(f));
    }

    /// Install the outbound-buffer size query used for isochronous
    /// back-pressure when the application owns the write buffers.
    pub fn set_buffered_output_size_fn(&self, f: impl Fn() -> u64 + Send + Sync + 'static) {
        if !self.owns_buffer {
            warn!("buffered-output-size callback ignored: the engine owns the output buffer");
            return;
        }
        *self.buffered_output_size.lock().unwrap() = Some(Box::new(f));
    }

    /// The most recent filter rules announced by the guest.
    pub fn guest_filter(&self) -> Option<Vec<Rule>> {
        self.dev.lock().unwrap().filter_rules.clone()
    }

    fn flush(&self) {
        if let Some(f) = &*self.flush_writes.lock().unwrap() {
            f();
        }
    }

    fn is_disconnected(&self) -> bool {
        self.disconnect.lock().unwrap().disconnected
    }

    /// Can be reached from both parser callbacks and completion handlers;
    /// uses its own lock so neither path needs a nesting-capable lock.
    fn handle_disconnect(&self) {
        let mut d = self.disconnect.lock().unwrap();
        if !d.disconnected {
            info!("device disconnected");
            self.parser.send_device_disconnect();
            if self.parser.peer_has_cap(Cap::DeviceDisconnectAck) {
                d.wait_disconnect = true;
            }
            d.disconnected = true;
        }
    }

    /// One conversion for both completion statuses and submission errors,
    /// so submission failures can be reported through the same reply path
    /// as completions. `NoDevice` additionally starts the disconnect.
    fn transfer_status_to_wire(&self, status: TransferStatus) -> Status {
        match status {
            TransferStatus::Completed => Status::Success,
            TransferStatus::Error => Status::Ioerror,
            TransferStatus::TimedOut => Status::Timeout,
            TransferStatus::Cancelled => Status::Cancelled,
            TransferStatus::Stall => Status::Stall,
            TransferStatus::NoDevice => {
                self.handle_disconnect();
                Status::Ioerror
            }
            TransferStatus::Overflow => Status::Babble,
        }
    }

    fn backend_error_to_wire(&self, err: BackendError) -> Status {
        match err {
            BackendError::InvalidParam => Status::Inval,
            BackendError::Timeout => Status::Timeout,
            BackendError::NoDevice => {
                self.handle_disconnect();
                Status::Ioerror
            }
            _ => Status::Ioerror,
        }
    }

    fn log_data(&self, desc: &str, data: &[u8]) {
        if log::log_enabled!(log::Level::Trace) {
            for chunk in data.chunks(8) {
                let mut line = String::from(desc);
                for b in chunk {
                    line.push_str(&format!(" {b:02X}"));
                }
                trace!("{line}");
            }
        }
    }

    /// Read descriptors and claim every interface of the active config.
    fn claim(&self, dev: &mut DeviceState, initial: bool) -> Result<(), BackendError> {
        dev.config = None;

        let desc = self.backend.device_descriptor().map_err(|e| {
            error!("could not get device descriptor: {e}");
            e
        })?;

        let config = match self.backend.active_config_descriptor() {
            Ok(c) => c,
            Err(BackendError::NotFound) => None,
            Err(e) => {
                error!("could not get descriptors for active configuration: {e}");
                return Err(e);
            }
        };

        if let Some(bytes) = &config {
            let Some(cfg) = Configuration::new(bytes) else {
                error!("active configuration descriptor is malformed");
                return Err(BackendError::Io);
            };
            let count = cfg.interfaces().count();
            if count > MAX_INTERFACES {
                error!("usb descriptor has too many interfaces ({count} > {MAX_INTERFACES})");
                return Err(BackendError::Io);
            }
        }

        if initial {
            dev.restore_config = config
                .as_deref()
                .and_then(Configuration::new)
                .map(|c| c.configuration_value());

            // An unconfigured single-config device is usually the result
            // of "safely remove hardware"; remember that config so release
            // makes the device usable again.
            if dev.restore_config.is_none() && desc.num_configurations() == 1 {
                if let Ok(bytes) = self.backend.config_descriptor_by_index(0) {
                    dev.restore_config =
                        Configuration::new(&bytes).map(|c| c.configuration_value());
                }
            }
        }

        // All interfaces begin at alt setting 0 when (re)claimed.
        dev.alt_setting = [0; MAX_INTERFACES];

        dev.desc = Some(desc);
        dev.config = config;
        dev.claimed = true;
        self.backend.set_auto_detach_kernel_driver(true);
        if let Some(cfg) = parsed_config(dev) {
            for group in cfg.interfaces() {
                let n = group.interface_number();
                if let Err(e) = self.backend.claim_interface(n) {
                    if e == BackendError::Busy {
                        error!("device is in use by another application");
                    } else {
                        error!("could not claim interface {n}: {e}");
                    }
                    return Err(e);
                }
            }
        }

        self.parse_config(dev);
        Ok(())
    }

    /// Release all claimed interfaces, then optionally reset and rebind
    /// kernel drivers. Skipping the reattach is used on the way into
    /// `set_configuration`, which rebinds via the config change itself.
    fn release(&self, dev: &mut DeviceState, attach_drivers: bool) {
        if !dev.claimed {
            return;
        }

        // Reattach is done explicitly below: compound interfaces must all
        // be released before any driver binds, and before set_configuration
        // no driver should bind at all.
        self.backend.set_auto_detach_kernel_driver(false);

        if let Some(cfg) = parsed_config(dev) {
            for group in cfg.interfaces() {
                let n = group.interface_number();
                if let Err(e) = self.backend.release_interface(n) {
                    if e != BackendError::NotFound && e != BackendError::NoDevice {
                        error!("could not release interface {n}: {e}");
                    }
                }
            }
        }

        if !attach_drivers {
            return;
        }

        dev.claimed = false;

        // Reset before re-binding kernel drivers so they see a clean
        // device.
        if !dev.do_not_reset {
            if let Err(e) = self.backend.reset_device() {
                if e != BackendError::NoDevice {
                    error!("error resetting device: {e}");
                }
                return;
            }
        }

        let current = parsed_config(dev).map(|c| c.configuration_value());
        if current != dev.restore_config {
            if let Some(restore) = dev.restore_config {
                if let Err(e) = self.backend.set_configuration(restore) {
                    error!("could not restore configuration to {restore}: {e}");
                }
            }
            // set_configuration binds drivers for the new config itself.
            return;
        }

        if let Some(cfg) = parsed_config(dev) {
            for group in cfg.interfaces() {
                let n = group.interface_number();
                if let Err(e) = self.backend.attach_kernel_driver(n) {
                    if e != BackendError::NotFound
                        && e != BackendError::NoDevice
                        && e != BackendError::NotSupported
                        && e != BackendError::Busy
                    {
                        error!("could not re-attach driver to interface {n}: {e}");
                    }
                }
            }
        }
    }

    /// Rebuild the endpoint table from the active configuration.
    fn parse_config(&self, dev: &DeviceState) {
        let mut xfer = self.xfer.lock().unwrap();
        for (i, ep) in xfer.endpoints.iter_mut().enumerate() {
            ep.ty = if i & 0x0f == 0 {
                EpType::Control
            } else {
                EpType::Invalid
            };
            ep.interval = 0;
            ep.interface = 0;
            ep.max_packet_size = 0;
            ep.max_streams = 0;
        }
        if let Some(cfg) = parsed_config(dev) {
            for i in 0..cfg.interfaces().count() {
                self.parse_interface_locked(dev, &mut xfer, i);
            }
        }
    }

    /// Populate endpoint slots from interface `i`'s current alt setting.
    fn parse_interface_locked(&self, dev: &DeviceState, xfer: &mut TransferState, i: usize) {
        let Some(cfg) = parsed_config(dev) else { return };
        let Some(group) = cfg.interfaces().nth(i) else { return };
        let alt = group.alt_setting(dev.alt_setting[i]);
        let speed = self.backend.speed();

        for ep in alt.endpoints() {
            let slot = &mut xfer.endpoints[ep_index(ep.address())];
            slot.ty = ep.transfer_type();
            slot.interval = ep.interval();
            slot.interface = group.interface_number();
            slot.max_packet_size = ep.effective_max_packet_size(speed) as usize;
            slot.max_streams = ep.max_streams();
            slot.warn_on_drop = true;
        }
    }

    /// Announce the endpoint table and interface list. Ordered so the
    /// guest always sees `ep_info`, `interface_info`, then any status.
    fn send_ep_and_interface_info(&self, dev: &DeviceState) {
        let mut ep_info = EpInfoHeader::default();
        {
            let xfer = self.xfer.lock().unwrap();
            for (i, ep) in xfer.endpoints.iter().enumerate() {
                ep_info.ep_type[i] = ep.ty as u8;
                ep_info.interval[i] = ep.interval;
                ep_info.interface[i] = ep.interface;
                ep_info.max_packet_size[i] = ep.max_packet_size as u16;
                ep_info.max_streams[i] = ep.max_streams;
            }
        }
        self.parser.send_ep_info(&ep_info);

        let mut intf_info = InterfaceInfoHeader::default();
        if let Some(cfg) = parsed_config(dev) {
            for (i, group) in cfg.interfaces().take(MAX_INTERFACES).enumerate() {
                let alt = group.alt_setting(dev.alt_setting[i]);
                intf_info.interface[i] = group.interface_number();
                intf_info.interface_class[i] = alt.class();
                intf_info.interface_subclass[i] = alt.subclass();
                intf_info.interface_protocol[i] = alt.protocol();
                intf_info.interface_count = (i + 1) as u32;
            }
        }
        self.parser.send_interface_info(&intf_info);
    }

    fn send_device_connect(&self) {
        {
            let mut d = self.disconnect.lock().unwrap();
            if !d.disconnected {
                error!("internal error: sending device_connect while already connected");
                return;
            }
            // Peer caps unknown or a disconnect ack outstanding: defer.
            if !self.parser.have_peer_caps() || d.wait_disconnect {
                d.connect_pending = true;
                return;
            }
        }

        let connect = {
            let dev = self.dev.lock().unwrap();
            let Some(desc) = &dev.desc else { return };
            let connect = DeviceConnectHeader {
                speed: self.backend.speed(),
                device_class: desc.class(),
                device_subclass: desc.subclass(),
                device_protocol: desc.protocol(),
                vendor_id: desc.vendor_id(),
                product_id: desc.product_id(),
                device_version_bcd: desc.device_version(),
            };
            self.send_ep_and_interface_info(&dev);
            connect
        };
        self.parser.send_device_connect(&connect);

        {
            let mut d = self.disconnect.lock().unwrap();
            d.connect_pending = false;
            // The guest may now use the device.
            d.disconnected = false;
        }
        self.flush();
    }

    fn reset_device(&self) -> Result<(), BackendError> {
        if self.dev.lock().unwrap().do_not_reset {
            return Ok(());
        }

        if let Err(e) = self.backend.reset_device() {
            error!("error resetting device: {e}");
            let mut dev = self.dev.lock().unwrap();
            self.clear_device_locked(&mut dev);
            return Err(e);
        }

        self.reset_latch.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn clear_device_locked(&self, dev: &mut DeviceState) {
        if dev.device_gone {
            return;
        }
        dev.device_gone = true;

        if self.cancel_pending_urbs(false) {
            self.wait_for_cancel_completion();
        }

        self.release(dev, true);
        dev.config = None;
        dev.desc = None;
        dev.do_not_reset = false;
        self.disconnect.lock().unwrap().connect_pending = false;

        self.handle_disconnect();
        self.flush();
    }

    /// Cancel every stream and one-shot. Returns whether any cancellation
    /// is now in flight and must be drained.
    fn cancel_pending_urbs(&self, notify_guest: bool) -> bool {
        let mut xfer = self.xfer.lock().unwrap();
        for i in 0..MAX_ENDPOINTS {
            if notify_guest && xfer.endpoints[i].stream.is_some() {
                let ty = xfer.endpoints[i].ty;
                self.send_stream_status(ty, 0, index_to_ep(i), Status::Stall);
            }
            self.cancel_stream_locked(&mut xfer, index_to_ep(i));
        }

        let mut wait = xfer.cancels_pending > 0;
        let one_shots: Vec<usize> = xfer
            .transfers
            .iter()
            .filter(|(_, e)| matches!(e, TransferEntry::OneShot { .. }))
            .map(|(tok, _)| tok)
            .collect();
        for tok in one_shots {
            self.backend.cancel(tok);
            wait = true;
        }
        drop(xfer);

        if notify_guest {
            self.flush();
        }
        wait
    }

    /// Pump the backend event loop until no cancellation or one-shot is
    /// outstanding.
    fn wait_for_cancel_completion(&self) {
        loop {
            {
                let xfer = self.xfer.lock().unwrap();
                let busy = xfer.cancels_pending > 0
                    || xfer
                        .transfers
                        .iter()
                        .any(|(_, e)| matches!(e, TransferEntry::OneShot { .. }));
                if !busy {
                    return;
                }
            }
            self.backend
                .poll_completions(Duration::from_micros(2500), &mut |c| {
                    self.handle_completion(c)
                });
        }
    }

    fn cancel_pending_urbs_on_interface(&self, dev: &DeviceState, i: usize) {
        let mut xfer = self.xfer.lock().unwrap();
        let Some(cfg) = parsed_config(dev) else { return };
        let Some(group) = cfg.interfaces().nth(i) else { return };
        let alt = group.alt_setting(dev.alt_setting[i]);

        for ep in alt.endpoints() {
            let addr = ep.address();
            self.cancel_stream_locked(&mut xfer, addr);

            let matching: Vec<usize> = xfer
                .transfers
                .iter()
                .filter(|(_, e)| {
                    matches!(e, TransferEntry::OneShot { header, .. } if header.endpoint() == addr)
                })
                .map(|(tok, _)| tok)
                .collect();
            for tok in matching {
                self.backend.cancel(tok);
            }
        }
    }

    /// Tear down an endpoint's stream: cancel submitted transfers (their
    /// completions free the bookkeeping), drop the rest.
    fn cancel_stream_locked(&self, xfer: &mut TransferState, ep: u8) {
        let idx = ep_index(ep);
        if let Some(stream) = xfer.endpoints[idx].stream.take() {
            for slot in stream.slots {
                if slot.state == SlotState::Submitted {
                    if let Some(tok) = slot.token {
                        if let Some(TransferEntry::Stream { cancelled, .. }) =
                            xfer.transfers.get_mut(tok)
                        {
                            *cancelled = true;
                        }
                        self.backend.cancel(tok);
                        xfer.cancels_pending += 1;
                    }
                }
            }
        }
    }

    fn send_stream_status(&self, ep_type: EpType, id: u64, ep: u8, status: Status) {
        match ep_type {
            EpType::Iso => self.parser.send_iso_stream_status(
                id,
                &IsoStreamStatusHeader {
                    status: status as u8,
                    endpoint: ep,
                },
            ),
            EpType::Bulk => self.parser.send_bulk_receiving_status(
                id,
                &BulkReceivingStatusHeader {
                    stream_id: 0,
                    endpoint: ep,
                    status: status as u8,
                },
            ),
            EpType::Interrupt => self.parser.send_interrupt_receiving_status(
                id,
                &InterruptReceivingStatusHeader {
                    status: status as u8,
                    endpoint: ep,
                },
            ),
            _ => {}
        }
    }

    /// Isochronous back-pressure: start dropping above the high-water
    /// mark, resume below the low-water mark.
    fn can_write_iso_package(&self, xfer: &mut TransferState) -> bool {
        let size = if self.owns_buffer {
            match &*self.buffered_output_size.lock().unwrap() {
                Some(f) => f(),
                // Application did not install the query: it is not
                // dropping isoc packets.
                None => return true,
            }
        } else {
            self.parser.buffered_output_size()
        };

        let th = &mut xfer.iso_threshold;
        if size >= th.higher {
            if !th.dropping {
                debug!(
                    "START dropping isoc packets: {size} buffered > {} hi threshold",
                    th.higher
                );
            }
            th.dropping = true;
        } else if size < th.lower {
            if th.dropping {
                debug!(
                    "STOP dropping isoc packets: {size} buffered < {} low threshold",
                    th.lower
                );
            }
            th.dropping = false;
        }

        !th.dropping
    }

    fn send_stream_data(
        &self,
        xfer: &mut TransferState,
        id: u64,
        ep: u8,
        status: Status,
        data: &[u8],
    ) {
        // USB 2 is at most 8000 packets/sec; over 800 queued frames means
        // more than 0.1 sec of backlog, so the connection is not keeping
        // up. Drop.
        if self.parser.has_data_to_write() > 800 {
            let idx = ep_index(ep);
            if xfer.endpoints[idx].warn_on_drop {
                warn!(
                    "buffered stream on endpoint {ep:02X}, connection too slow, dropping packets"
                );
                xfer.endpoints[idx].warn_on_drop = false;
            }
            debug!(
                "buffered complete ep {ep:02X} dropping packet status {status:?} len {}",
                data.len()
            );
            return;
        }

        debug!(
            "buffered complete ep {ep:02X} status {status:?} len {}",
            data.len()
        );

        match xfer.endpoints[ep_index(ep)].ty {
            EpType::Iso => {
                let header = IsoPacketHeader {
                    endpoint: ep,
                    status: status as u8,
                    length: data.len() as u16,
                };
                if self.can_write_iso_package(xfer) {
                    self.parser.send_iso_packet(id, &header, data);
                }
            }
            EpType::Bulk => {
                let header = BufferedBulkPacketHeader {
                    stream_id: 0,
                    length: data.len() as u32,
                    endpoint: ep,
                    status: status as u8,
                };
                self.parser.send_buffered_bulk_packet(id, &header, data);
            }
            EpType::Interrupt => {
                let header = InterruptPacketHeader {
                    endpoint: ep,
                    status: status as u8,
                    length: data.len() as u16,
                };
                self.parser.send_interrupt_packet(id, &header, data);
            }
            _ => {}
        }
    }

    fn submit_stream_transfer_locked(
        &self,
        xfer: &mut TransferState,
        ep: u8,
        slot_idx: usize,
    ) -> Status {
        self.reset_latch.store(false, Ordering::Relaxed);
        let ep_idx = ep_index(ep);

        let (kind, buffer, timeout, id) = {
            let Some(stream) = xfer.endpoints[ep_idx].stream.as_mut() else {
                return Status::Stall;
            };
            let slot = &mut stream.slots[slot_idx];
            let filled = match slot.state {
                SlotState::Filled(n) => n,
                SlotState::Submitted => return Status::Success,
            };
            let Some(buffer) = slot.buffer.take() else {
                return Status::Stall;
            };
            let kind = match stream.kind {
                EpType::Iso => {
                    let packet_lengths = if ep & 0x80 != 0 {
                        vec![stream.pkt_size as u32; stream.pkts_per_transfer]
                    } else {
                        slot.iso_lengths[..filled].to_vec()
                    };
                    TransferKind::Iso { packet_lengths }
                }
                EpType::Bulk => TransferKind::Bulk { stream_id: 0 },
                _ => TransferKind::Interrupt,
            };
            let timeout = match stream.kind {
                EpType::Iso => ISO_TIMEOUT,
                EpType::Bulk => BULK_TIMEOUT,
                _ => INTERRUPT_TIMEOUT,
            };
            (kind, buffer, timeout, slot.id)
        };

        let token = xfer.transfers.insert(TransferEntry::Stream {
            ep_idx,
            slot_idx,
            cancelled: false,
        });

        match self.backend.submit(TransferRequest {
            token,
            endpoint: ep,
            kind,
            buffer,
            timeout,
        }) {
            Ok(()) => {
                if let Some(stream) = xfer.endpoints[ep_idx].stream.as_mut() {
                    stream.slots[slot_idx].state = SlotState::Submitted;
                    stream.slots[slot_idx].token = Some(token);
                }
                Status::Success
            }
            Err(e) => {
                xfer.transfers.remove(token);
                if e == BackendError::NoDevice {
                    self.handle_disconnect();
                } else {
                    error!("error submitting transfer on ep {ep:02X}: {e}, stopping stream");
                    let ty = xfer.endpoints[ep_idx].ty;
                    self.cancel_stream_locked(xfer, ep);
                    self.send_stream_status(ty, id, ep, Status::Stall);
                }
                Status::Stall
            }
        }
    }

    fn start_stream_locked(&self, xfer: &mut TransferState, ep: u8) -> Status {
        let ep_idx = ep_index(ep);
        let input = ep & 0x80 != 0;

        let (count, pkts) = match xfer.endpoints[ep_idx].stream.as_ref() {
            Some(s) => (s.transfer_count, s.pkts_per_transfer),
            None => return Status::Stall,
        };
        // For output endpoints half the transfers stay back as a buffer
        // for guest data.
        let submit_count = if input { count } else { count / 2 };

        for i in 0..submit_count {
            if input {
                if let Some(stream) = xfer.endpoints[ep_idx].stream.as_mut() {
                    stream.slots[i].id = (i * pkts) as u64;
                }
            }
            let status = self.submit_stream_transfer_locked(xfer, ep, i);
            if status != Status::Success {
                return status;
            }
        }
        if let Some(stream) = xfer.endpoints[ep_idx].stream.as_mut() {
            stream.started = true;
        }
        Status::Success
    }

    /// One allocator behind `start_iso_stream`, `start_interrupt_receiving`
    /// and `start_bulk_receiving`.
    fn alloc_stream_locked(
        &self,
        xfer: &mut TransferState,
        id: u64,
        ep: u8,
        ty: EpType,
        pkts_per_transfer: usize,
        pkt_size: usize,
        transfer_count: usize,
        send_success: bool,
    ) {
        let ep_idx = ep_index(ep);
        let recorded_ty = xfer.endpoints[ep_idx].ty;
        let max_packet_size = xfer.endpoints[ep_idx].max_packet_size;

        let invalid = if self.is_disconnected() {
            true
        } else if recorded_ty != ty {
            error!("start stream type {ty:?} on type {recorded_ty:?} endpoint");
            true
        } else if !(1..=MAX_PACKETS_PER_TRANSFER).contains(&pkts_per_transfer)
            || !(1..=MAX_TRANSFER_COUNT).contains(&transfer_count)
            || max_packet_size == 0
            || pkt_size % max_packet_size != 0
        {
            error!("start stream type {ty:?} invalid parameters");
            true
        } else {
            false
        };
        if invalid {
            self.send_stream_status(recorded_ty, id, ep, Status::Stall);
            return;
        }

        if xfer.endpoints[ep_idx].stream.is_some() {
            error!("received start type {ty:?} for already started stream");
            self.send_stream_status(recorded_ty, id, ep, Status::Inval);
            return;
        }

        debug!(
            "allocating stream ep {ep:02X} type {ty:?} packet-size {pkt_size} \
             pkts {pkts_per_transfer} transfers {transfer_count}"
        );

        let slots = (0..transfer_count)
            .map(|_| StreamSlot {
                state: SlotState::Filled(0),
                id: 0,
                buffer: Some(vec![0; pkt_size * pkts_per_transfer]),
                iso_lengths: vec![0; pkts_per_transfer],
                token: None,
            })
            .collect();

        if ty == EpType::Iso {
            let reference = (pkts_per_transfer * transfer_count * max_packet_size) as u64;
            xfer.iso_threshold.lower = reference / 2;
            xfer.iso_threshold.higher = reference * 3;
            debug!(
                "iso thresholds: higher {} bytes, lower {} bytes",
                xfer.iso_threshold.higher, xfer.iso_threshold.lower
            );
        }

        xfer.endpoints[ep_idx].stream = Some(Stream {
            kind: ty,
            pkts_per_transfer,
            transfer_count,
            pkt_size,
            started: false,
            out_idx: 0,
            drop_packets: 0,
            slots,
        });

        // Input streams pump immediately; output iso streams wait until
        // half the ring is buffered with guest data.
        let mut status = Status::Success;
        if ep & 0x80 != 0 {
            status = self.start_stream_locked(xfer, ep);
        }

        if send_success && status == Status::Success {
            self.send_stream_status(ty, id, ep, Status::Success);
        }
    }

    fn stop_stream(&self, id: u64, ep: u8) {
        if self.is_disconnected() {
            return;
        }
        let ty = {
            let mut xfer = self.xfer.lock().unwrap();
            let ty = xfer.endpoints[ep_index(ep)].ty;
            self.cancel_stream_locked(&mut xfer, ep);
            ty
        };
        self.send_stream_status(ty, id, ep, Status::Success);
        self.flush();
    }

    /// Stalled stream: remember its shape, tear it down, clear the halt at
    /// the device and bring it back up with the same parameters. No status
    /// is sent on success; the guest never notices.
    fn clear_stream_stall_locked(&self, xfer: &mut TransferState, id: u64, ep: u8) {
        warn!("buffered stream on endpoint {ep:02X} stalled, clearing stall");
        let ep_idx = ep_index(ep);
        let Some(stream) = xfer.endpoints[ep_idx].stream.as_ref() else {
            return;
        };
        let (ty, pkts, count, pkt_size) = (
            stream.kind,
            stream.pkts_per_transfer,
            stream.transfer_count,
            stream.pkt_size,
        );

        self.cancel_stream_locked(xfer, ep);
        if self.backend.clear_halt(ep).is_err() {
            self.send_stream_status(ty, id, ep, Status::Stall);
            return;
        }
        self.alloc_stream_locked(xfer, id, ep, ty, pkts, pkt_size, count, false);
    }

    /// Deliver a finished backend transfer. Call this from the USB event
    /// loop for every completion.
    pub fn handle_completion(&self, completion: TransferCompletion) {
        let mut xfer = self.xfer.lock().unwrap();
        let Some(entry) = xfer.transfers.try_remove(completion.token) else {
            warn!("completion for unknown transfer token {}", completion.token);
            return;
        };

        match entry {
            TransferEntry::Stream {
                ep_idx,
                slot_idx,
                cancelled,
            } => {
                if cancelled {
                    xfer.cancels_pending -= 1;
                } else {
                    let kind = xfer.endpoints[ep_idx]
                        .stream
                        .as_ref()
                        .map(|s| s.kind);
                    match kind {
                        Some(EpType::Iso) => {
                            self.iso_packet_complete(&mut xfer, ep_idx, slot_idx, completion)
                        }
                        Some(EpType::Bulk) | Some(EpType::Interrupt) => {
                            self.buffered_packet_complete(&mut xfer, ep_idx, slot_idx, completion)
                        }
                        _ => warn!("stream completion for endpoint without stream"),
                    }
                }
            }
            TransferEntry::OneShot {
                id,
                cancelled,
                header,
            } => {
                if !cancelled {
                    self.one_shot_complete(id, header, completion);
                }
            }
        }
        drop(xfer);
        self.flush();
    }

    fn handle_iso_status(
        &self,
        xfer: &mut TransferState,
        id: u64,
        ep: u8,
        status: TransferStatus,
    ) -> IsoDisposition {
        match status {
            TransferStatus::Completed => IsoDisposition::Ok,
            // The stream was intentionally stopped.
            TransferStatus::Cancelled => IsoDisposition::StreamGone,
            TransferStatus::Stall => {
                self.clear_stream_stall_locked(xfer, id, ep);
                IsoDisposition::StreamGone
            }
            TransferStatus::NoDevice => {
                self.handle_disconnect();
                IsoDisposition::StreamGone
            }
            TransferStatus::Overflow | TransferStatus::Error | TransferStatus::TimedOut => {
                error!("iso stream error on endpoint {ep:02X}: {status:?}");
                IsoDisposition::PacketError
            }
        }
    }

    fn iso_packet_complete(
        &self,
        xfer: &mut TransferState,
        ep_idx: usize,
        slot_idx: usize,
        completion: TransferCompletion,
    ) {
        let ep = index_to_ep(ep_idx);
        let input = ep & 0x80 != 0;

        let (mut tid, pkt_size, pkts_per_transfer, transfer_count) = {
            let Some(stream) = xfer.endpoints[ep_idx].stream.as_mut() else {
                return;
            };
            let slot = &mut stream.slots[slot_idx];
            slot.state = SlotState::Filled(0);
            slot.token = None;
            slot.buffer = Some(completion.buffer);
            (
                slot.id,
                stream.pkt_size,
                stream.pkts_per_transfer,
                stream.transfer_count,
            )
        };

        match self.handle_iso_status(xfer, tid, ep, completion.status) {
            IsoDisposition::Ok => {}
            IsoDisposition::PacketError => {
                let status = self.transfer_status_to_wire(completion.status);
                if input {
                    let header = IsoPacketHeader {
                        endpoint: ep,
                        status: status as u8,
                        length: 0,
                    };
                    self.parser.send_iso_packet(tid, &header, &[]);
                    tid += completion.iso_packets.len() as u64;
                    let new_id = tid + ((transfer_count - 1) * pkts_per_transfer) as u64;
                    if let Some(stream) = xfer.endpoints[ep_idx].stream.as_mut() {
                        stream.slots[slot_idx].id = new_id;
                    }
                    self.submit_stream_transfer_locked(xfer, ep, slot_idx);
                } else {
                    self.send_stream_status(EpType::Iso, tid, ep, status);
                }
                return;
            }
            IsoDisposition::StreamGone => return,
        }

        // Per-packet status; good input packets go to the guest.
        for (i, pkt) in completion.iso_packets.iter().enumerate() {
            let status = self.transfer_status_to_wire(pkt.status);
            let mut len = pkt.actual_len;
            match self.handle_iso_status(xfer, tid, ep, pkt.status) {
                IsoDisposition::Ok => {}
                IsoDisposition::PacketError => {
                    if input {
                        len = 0;
                    } else {
                        // At most one stream status message per transfer.
                        self.send_stream_status(EpType::Iso, tid, ep, status);
                        return;
                    }
                }
                IsoDisposition::StreamGone => return,
            }

            if input {
                let data = {
                    let Some(stream) = xfer.endpoints[ep_idx].stream.as_ref() else {
                        return;
                    };
                    let Some(buffer) = stream.slots[slot_idx].buffer.as_ref() else {
                        return;
                    };
                    let off = i * pkt_size;
                    let end = (off + len).min(buffer.len());
                    buffer[off.min(end)..end].to_vec()
                };
                self.send_stream_data(xfer, tid, ep, status, &data);
                tid += 1;
            } else {
                debug!("iso-out complete ep {ep:02X} pkt {i} len {len} id {tid}");
            }
        }

        if input {
            // Ids number packets across the whole ring.
            let new_id = tid + ((transfer_count - 1) * pkts_per_transfer) as u64;
            if let Some(stream) = xfer.endpoints[ep_idx].stream.as_mut() {
                stream.slots[slot_idx].id = new_id;
            }
            self.submit_stream_transfer_locked(xfer, ep, slot_idx);
        } else if let Some(stream) = xfer.endpoints[ep_idx].stream.as_mut() {
            let any_submitted = stream
                .slots
                .iter()
                .any(|s| s.state == SlotState::Submitted);
            if !any_submitted {
                debug!("underflow of iso out queue on ep {ep:02X}");
                // Refill half the ring before submitting again.
                for slot in &mut stream.slots {
                    slot.state = SlotState::Filled(0);
                }
                stream.out_idx = 0;
                stream.started = false;
                stream.drop_packets = 0;
            }
        }
    }

    fn buffered_packet_complete(
        &self,
        xfer: &mut TransferState,
        ep_idx: usize,
        slot_idx: usize,
        completion: TransferCompletion,
    ) {
        let ep = index_to_ep(ep_idx);

        let (tid, transfer_count) = {
            let Some(stream) = xfer.endpoints[ep_idx].stream.as_mut() else {
                return;
            };
            let slot = &mut stream.slots[slot_idx];
            slot.state = SlotState::Filled(0);
            slot.token = None;
            slot.buffer = Some(completion.buffer);
            (slot.id, stream.transfer_count)
        };

        let mut len = completion.actual_len;
        match completion.status {
            TransferStatus::Completed => {}
            TransferStatus::Stall => {
                self.clear_stream_stall_locked(xfer, tid, ep);
                return;
            }
            TransferStatus::NoDevice => {
                self.handle_disconnect();
                return;
            }
            other => {
                error!("buffered in error on endpoint {ep:02X}: {other:?}");
                len = 0;
            }
        }

        let status = self.transfer_status_to_wire(completion.status);
        let data = {
            let Some(stream) = xfer.endpoints[ep_idx].stream.as_ref() else {
                return;
            };
            let Some(buffer) = stream.slots[slot_idx].buffer.as_ref() else {
                return;
            };
            buffer[..len.min(buffer.len())].to_vec()
        };
        self.send_stream_data(xfer, tid, ep, status, &data);
        self.log_data("buffered data in:", &data);

        if let Some(stream) = xfer.endpoints[ep_idx].stream.as_mut() {
            stream.slots[slot_idx].id = tid + transfer_count as u64;
        }
        self.submit_stream_transfer_locked(xfer, ep, slot_idx);
    }

    fn one_shot_complete(
        &self,
        id: u64,
        header: OneShotHeader,
        completion: TransferCompletion,
    ) {
        let status = self.transfer_status_to_wire(completion.status);
        match header {
            OneShotHeader::Control(mut h) => {
                h.status = status as u8;
                h.length = completion.actual_len as u16;
                debug!(
                    "control complete ep {:02X} status {status:?} len {} id {id}",
                    h.endpoint, h.length
                );
                if h.endpoint & 0x80 != 0 {
                    let data = &completion.buffer[..completion.actual_len.min(completion.buffer.len())];
                    self.log_data("ctrl data in:", data);
                    self.parser.send_control_packet(id, &h, data);
                } else {
                    self.parser.send_control_packet(id, &h, &[]);
                }
            }
            OneShotHeader::Bulk(mut h) => {
                h.status = status as u8;
                h.length = completion.actual_len as u16;
                h.length_high = (completion.actual_len >> 16) as u16;
                debug!(
                    "bulk complete ep {:02X} status {status:?} len {} id {id}",
                    h.endpoint, completion.actual_len
                );
                if h.endpoint & 0x80 != 0 {
                    let data = &completion.buffer[..completion.actual_len.min(completion.buffer.len())];
                    self.log_data("bulk data in:", data);
                    self.parser.send_bulk_packet(id, &h, data);
                } else {
                    self.parser.send_bulk_packet(id, &h, &[]);
                }
            }
            OneShotHeader::Interrupt(mut h) => {
                h.status = status as u8;
                h.length = completion.actual_len as u16;
                debug!(
                    "interrupt out complete ep {:02X} status {status:?} len {} id {id}",
                    h.endpoint, h.length
                );
                self.parser.send_interrupt_packet(id, &h, &[]);
            }
        }
    }

    fn interface_index(&self, dev: &DeviceState, interface: u8) -> Option<usize> {
        let cfg = parsed_config(dev)?;
        let idx = cfg
            .interfaces()
            .position(|g| g.interface_number() == interface);
        if idx.is_none() {
            error!("invalid interface number {interface}");
        }
        idx
    }

    // Parser callback bodies follow; they run on the reader thread.

    fn on_hello(&self) {
        if self.disconnect.lock().unwrap().connect_pending {
            self.send_device_connect();
        }
    }

    fn on_reset(&self) {
        if self.is_disconnected() || self.reset_latch.load(Ordering::Relaxed) {
            return;
        }

        // The guest should have cancelled its urbs already, but the
        // cancellations may still be in flight; drain them so they do not
        // complete with NO_DEVICE after the reset. Streams are shut down
        // with notification so the guest restarts them afterwards.
        if self.cancel_pending_urbs(true) {
            self.wait_for_cancel_completion();
        }

        if self.reset_device().is_err() {
            self.dev.lock().unwrap().read_fate = Some(ReadFate::DeviceLost);
        }
    }

    fn on_set_configuration(&self, id: u64, h: &SetConfigurationHeader) {
        let mut status = ConfigurationStatusHeader {
            status: Status::Success as u8,
            configuration: 0,
        };

        let mut dev = self.dev.lock().unwrap();
        'done: {
            if self.is_disconnected() {
                status.status = Status::Ioerror as u8;
                break 'done;
            }

            if parsed_config(&dev).map(|c| c.configuration_value()) == Some(h.configuration) {
                break 'done;
            }

            self.reset_latch.store(false, Ordering::Relaxed);

            self.cancel_pending_urbs(false);
            self.release(&mut dev, false);

            if let Err(e) = self.backend.set_configuration(h.configuration) {
                error!(
                    "could not set active configuration to {}: {e}",
                    h.configuration
                );
                status.status = Status::Ioerror as u8;
            }

            if self.claim(&mut dev, false).is_err() {
                self.clear_device_locked(&mut dev);
                dev.read_fate = Some(ReadFate::DeviceLost);
                status.status = Status::Ioerror as u8;
                break 'done;
            }

            self.send_ep_and_interface_info(&dev);
        }

        status.configuration = parsed_config(&dev)
            .map(|c| c.configuration_value())
            .unwrap_or(0);
        drop(dev);
        self.parser.send_configuration_status(id, &status);
        self.flush();
    }

    fn on_get_configuration(&self, id: u64) {
        let status = ConfigurationStatusHeader {
            status: if self.is_disconnected() {
                Status::Ioerror as u8
            } else {
                Status::Success as u8
            },
            configuration: {
                let dev = self.dev.lock().unwrap();
                parsed_config(&dev)
                    .map(|c| c.configuration_value())
                    .unwrap_or(0)
            },
        };
        self.parser.send_configuration_status(id, &status);
        self.flush();
    }

    fn on_set_alt_setting(&self, id: u64, h: &SetAltSettingHeader) {
        let mut status = AltSettingStatusHeader {
            status: Status::Success as u8,
            interface: h.interface,
            alt: 0,
        };

        if self.is_disconnected() {
            status.status = Status::Ioerror as u8;
            status.alt = 0xff;
            self.parser.send_alt_setting_status(id, &status);
            self.flush();
            return;
        }

        let mut dev = self.dev.lock().unwrap();
        let Some(i) = self.interface_index(&dev, h.interface) else {
            status.status = Status::Inval as u8;
            status.alt = 0xff;
            drop(dev);
            self.parser.send_alt_setting_status(id, &status);
            self.flush();
            return;
        };

        self.reset_latch.store(false, Ordering::Relaxed);
        self.cancel_pending_urbs_on_interface(&dev, i);

        match self
            .backend
            .set_interface_alt_setting(h.interface, h.alt)
        {
            Err(e) => {
                error!(
                    "could not set alt setting for interface {} to {}: {e}",
                    h.interface, h.alt
                );
                status.status = self.backend_error_to_wire(e) as u8;
            }
            Ok(()) => {
                // The new alt setting may have lost endpoints compared to
                // the old one; wipe every slot the interface used to own.
                {
                    let mut xfer = self.xfer.lock().unwrap();
                    for (j, ep) in xfer.endpoints.iter_mut().enumerate() {
                        if ep.interface != h.interface {
                            continue;
                        }
                        ep.ty = if j & 0x0f == 0 {
                            EpType::Control
                        } else {
                            EpType::Invalid
                        };
                        ep.interval = 0;
                        ep.interface = 0;
                        ep.max_packet_size = 0;
                    }
                    dev.alt_setting[i] = h.alt;
                    self.parse_interface_locked(&dev, &mut xfer, i);
                }
                self.send_ep_and_interface_info(&dev);
            }
        }

        status.alt = dev.alt_setting[i];
        drop(dev);
        self.parser.send_alt_setting_status(id, &status);
        self.flush();
    }

    fn on_get_alt_setting(&self, id: u64, h: &GetAltSettingHeader) {
        let mut status = AltSettingStatusHeader {
            status: Status::Success as u8,
            interface: h.interface,
            alt: 0,
        };

        if self.is_disconnected() {
            status.status = Status::Ioerror as u8;
            status.alt = 0xff;
        } else {
            let dev = self.dev.lock().unwrap();
            match self.interface_index(&dev, h.interface) {
                Some(i) => status.alt = dev.alt_setting[i],
                None => {
                    status.status = Status::Inval as u8;
                    status.alt = 0xff;
                }
            }
        }

        self.parser.send_alt_setting_status(id, &status);
        self.flush();
    }

    fn on_start_iso_stream(&self, id: u64, h: &StartIsoStreamHeader) {
        let mut xfer = self.xfer.lock().unwrap();
        let pkt_size = xfer.endpoints[ep_index(h.endpoint)].max_packet_size;
        self.alloc_stream_locked(
            &mut xfer,
            id,
            h.endpoint,
            EpType::Iso,
            h.pkts_per_urb as usize,
            pkt_size,
            h.no_urbs as usize,
            true,
        );
        drop(xfer);
        self.flush();
    }

    fn on_stop_iso_stream(&self, id: u64, h: &StopIsoStreamHeader) {
        self.stop_stream(id, h.endpoint);
    }

    fn on_start_interrupt_receiving(&self, id: u64, h: &StartInterruptReceivingHeader) {
        let mut xfer = self.xfer.lock().unwrap();
        let pkt_size = xfer.endpoints[ep_index(h.endpoint)].max_packet_size;
        self.alloc_stream_locked(
            &mut xfer,
            id,
            h.endpoint,
            EpType::Interrupt,
            1,
            pkt_size,
            INTERRUPT_TRANSFER_COUNT,
            true,
        );
        drop(xfer);
        self.flush();
    }

    fn on_stop_interrupt_receiving(&self, id: u64, h: &StopInterruptReceivingHeader) {
        self.stop_stream(id, h.endpoint);
    }

    fn on_start_bulk_receiving(&self, id: u64, h: &StartBulkReceivingHeader) {
        let mut xfer = self.xfer.lock().unwrap();
        self.alloc_stream_locked(
            &mut xfer,
            id,
            h.endpoint,
            EpType::Bulk,
            1,
            h.bytes_per_transfer as usize,
            h.no_transfers as usize,
            true,
        );
        drop(xfer);
        self.flush();
    }

    fn on_stop_bulk_receiving(&self, id: u64, h: &StopBulkReceivingHeader) {
        self.stop_stream(id, h.endpoint);
    }

    fn on_alloc_bulk_streams(&self, id: u64, h: &AllocBulkStreamsHeader) {
        let mut status = BulkStreamsStatusHeader {
            endpoints: h.endpoints,
            no_streams: h.no_streams,
            status: Status::Success as u8,
        };

        let eps: Vec<u8> = (0..MAX_ENDPOINTS)
            .filter(|i| h.endpoints & (1 << i) != 0)
            .map(index_to_ep)
            .collect();
        match self.backend.alloc_streams(&eps, h.no_streams) {
            Ok(n) if n < h.no_streams => {
                error!("tried to alloc {} bulk streams but got only {n}", h.no_streams);
                status.status = Status::Ioerror as u8;
            }
            Ok(_) => {}
            Err(e) => {
                error!("could not alloc bulk streams: {e}");
                status.status = self.backend_error_to_wire(e) as u8;
            }
        }

        self.parser.send_bulk_streams_status(id, &status);
        self.flush();
    }

    fn on_free_bulk_streams(&self, id: u64, h: &FreeBulkStreamsHeader) {
        let mut status = BulkStreamsStatusHeader {
            endpoints: h.endpoints,
            no_streams: 0,
            status: Status::Success as u8,
        };

        let eps: Vec<u8> = (0..MAX_ENDPOINTS)
            .filter(|i| h.endpoints & (1 << i) != 0)
            .map(index_to_ep)
            .collect();
        if let Err(e) = self.backend.free_streams(&eps) {
            error!("could not free bulk streams: {e}");
            status.status = self.backend_error_to_wire(e) as u8;
        }

        self.parser.send_bulk_streams_status(id, &status);
        self.flush();
    }

    fn on_cancel_data_packet(&self, id: u64) {
        // The completion handler may be running concurrently on the event
        // thread; the transfer lock keeps the entry alive while we mark it
        // and synthesize the reply, so the guest sees exactly one response
        // per submission regardless of how the race goes.
        let mut xfer = self.xfer.lock().unwrap();
        let mut found = None;
        for (tok, entry) in xfer.transfers.iter_mut() {
            if let TransferEntry::OneShot {
                id: tid,
                cancelled,
                header,
            } = entry
            {
                // The guest may re-use ids after cancellation; skip
                // transfers already cancelled.
                if !*cancelled && *tid == id {
                    *cancelled = true;
                    found = Some((tok, *header));
                    break;
                }
            }
        }

        match found {
            Some((token, header)) => {
                self.backend.cancel(token);
                match header {
                    OneShotHeader::Control(mut h) => {
                        h.status = Status::Cancelled as u8;
                        h.length = 0;
                        self.parser.send_control_packet(id, &h, &[]);
                        debug!("cancelled control packet ep {:02x} id {id}", h.endpoint);
                    }
                    OneShotHeader::Bulk(mut h) => {
                        h.status = Status::Cancelled as u8;
                        h.length = 0;
                        h.length_high = 0;
                        self.parser.send_bulk_packet(id, &h, &[]);
                        debug!("cancelled bulk packet ep {:02x} id {id}", h.endpoint);
                    }
                    OneShotHeader::Interrupt(mut h) => {
                        h.status = Status::Cancelled as u8;
                        h.length = 0;
                        self.parser.send_interrupt_packet(id, &h, &[]);
                        debug!("cancelled interrupt packet ep {:02x} id {id}", h.endpoint);
                    }
                }
            }
            // Not an error: the transfer may have completed before the
            // cancel arrived.
            None => debug!("cancel packet id {id} not found"),
        }
        drop(xfer);
        self.flush();
    }

    fn on_filter_reject(&self) {
        if self.is_disconnected() {
            return;
        }
        info!("device rejected");
        self.dev.lock().unwrap().read_fate = Some(ReadFate::DeviceRejected);
    }

    fn on_filter_filter(&self, rules: Vec<Rule>) {
        self.dev.lock().unwrap().filter_rules = Some(rules);
    }

    fn on_device_disconnect_ack(&self) {
        let pending = {
            let mut d = self.disconnect.lock().unwrap();
            if !d.wait_disconnect {
                error!("received disconnect ack without sending a disconnect");
                return;
            }
            d.wait_disconnect = false;
            d.connect_pending
        };
        if pending {
            self.send_device_connect();
        }
    }

    fn send_control_status(&self, id: u64, mut h: ControlPacketHeader, status: Status) {
        h.status = status as u8;
        h.length = 0;
        self.parser.send_control_packet(id, &h, &[]);
    }

    fn on_control_packet(&self, id: u64, h: &ControlPacketHeader, data: Vec<u8>) {
        let h = *h;
        debug!(
            "control submit ep {:02X} len {} id {id}",
            h.endpoint, h.length
        );

        if self.is_disconnected() {
            self.send_control_status(id, h, Status::Ioerror);
            self.flush();
            return;
        }

        {
            let xfer = self.xfer.lock().unwrap();
            if xfer.endpoints[ep_index(h.endpoint)].ty != EpType::Control {
                error!("control packet on non control ep {:02X}", h.endpoint);
                drop(xfer);
                self.send_control_status(id, h, Status::Inval);
                self.flush();
                return;
            }
        }

        self.reset_latch.store(false, Ordering::Relaxed);

        // A clear-stall must actually clear the halt at the device rather
        // than travel as a control transfer, so the host OS stack's stall
        // bookkeeping stays coherent.
        const RECIPIENT_ENDPOINT: u8 = 0x02;
        const REQUEST_CLEAR_FEATURE: u8 = 0x01;
        if h.request_type == RECIPIENT_ENDPOINT
            && h.request == REQUEST_CLEAR_FEATURE
            && h.value == 0
            && data.is_empty()
        {
            let status = match self.backend.clear_halt(h.index as u8) {
                Ok(()) => Status::Success,
                Err(e) => self.backend_error_to_wire(e),
            };
            debug!("clear halt ep {:02X} status {status:?}", h.index);
            self.send_control_status(id, h, status);
            self.flush();
            return;
        }

        let buffer = if h.endpoint & 0x80 != 0 {
            vec![0; h.length as usize]
        } else {
            self.log_data("ctrl data out:", &data);
            data
        };
        let setup = SetupPacket {
            request_type: h.request_type,
            request: h.request,
            value: h.value,
            index: h.index,
            length: h.length,
        };

        let mut xfer = self.xfer.lock().unwrap();
        let token = xfer.transfers.insert(TransferEntry::OneShot {
            id,
            cancelled: false,
            header: OneShotHeader::Control(h),
        });
        if let Err(e) = self.backend.submit(TransferRequest {
            token,
            endpoint: h.endpoint,
            kind: TransferKind::Control { setup },
            buffer,
            timeout: CTRL_TIMEOUT,
        }) {
            xfer.transfers.remove(token);
            error!(
                "error submitting control transfer on ep {:02X}: {e}",
                h.endpoint
            );
            let status = self.backend_error_to_wire(e);
            drop(xfer);
            self.send_control_status(id, h, status);
            self.flush();
        }
    }

    fn on_bulk_packet(&self, id: u64, h: &BulkPacketHeader, data: Vec<u8>) {
        let h = *h;
        let len = h.total_length();
        debug!("bulk submit ep {:02X} len {len} id {id}", h.endpoint);

        let send_bulk_status = |status: Status| {
            let mut reply = h;
            reply.status = status as u8;
            reply.length = 0;
            reply.length_high = 0;
            self.parser.send_bulk_packet(id, &reply, &[]);
        };

        if self.is_disconnected() {
            send_bulk_status(Status::Ioerror);
            self.flush();
            return;
        }

        {
            let xfer = self.xfer.lock().unwrap();
            if xfer.endpoints[ep_index(h.endpoint)].ty != EpType::Bulk {
                error!("bulk packet on non bulk ep {:02X}", h.endpoint);
                drop(xfer);
                send_bulk_status(Status::Inval);
                self.flush();
                return;
            }
        }

        self.reset_latch.store(false, Ordering::Relaxed);

        let buffer = if h.endpoint & 0x80 != 0 {
            vec![0; len as usize]
        } else {
            self.log_data("bulk data out:", &data);
            data
        };

        let mut xfer = self.xfer.lock().unwrap();
        let token = xfer.transfers.insert(TransferEntry::OneShot {
            id,
            cancelled: false,
            header: OneShotHeader::Bulk(h),
        });
        if let Err(e) = self.backend.submit(TransferRequest {
            token,
            endpoint: h.endpoint,
            kind: TransferKind::Bulk {
                stream_id: h.stream_id,
            },
            buffer,
            timeout: BULK_TIMEOUT,
        }) {
            xfer.transfers.remove(token);
            error!(
                "error submitting bulk transfer on ep {:02X}: {e}",
                h.endpoint
            );
            let status = self.backend_error_to_wire(e);
            drop(xfer);
            send_bulk_status(status);
            self.flush();
        }
    }

    fn on_iso_packet(&self, id: u64, h: &IsoPacketHeader, data: Vec<u8>) {
        let ep = h.endpoint;
        let ep_idx = ep_index(ep);

        enum Action {
            None,
            Submit(usize),
            StartStream,
        }

        let mut status = Status::Success;
        let recorded_ty;
        {
            let mut xfer = self.xfer.lock().unwrap();
            recorded_ty = xfer.endpoints[ep_idx].ty;

            let action = 'fill: {
                if self.is_disconnected() {
                    status = Status::Ioerror;
                    break 'fill Action::None;
                }
                if xfer.endpoints[ep_idx].ty != EpType::Iso {
                    error!("received iso packet for non iso ep {ep:02X}");
                    status = Status::Inval;
                    break 'fill Action::None;
                }
                let max_packet_size = xfer.endpoints[ep_idx].max_packet_size;
                let Some(stream) = xfer.endpoints[ep_idx].stream.as_mut() else {
                    error!("received iso out packet for non started iso stream");
                    status = Status::Inval;
                    break 'fill Action::None;
                };
                if data.len() > max_packet_size {
                    error!("received iso out packet is larger than wMaxPacketSize");
                    status = Status::Inval;
                    break 'fill Action::None;
                }

                if stream.drop_packets > 0 {
                    stream.drop_packets -= 1;
                    break 'fill Action::None;
                }

                let i = stream.out_idx;
                let pkts = stream.pkts_per_transfer;
                let count = stream.transfer_count;
                let j = match stream.slots[i].state {
                    SlotState::Submitted => {
                        debug!("overflow of iso out queue on ep {ep:02X}, dropping packet");
                        // The stream is interrupted anyway; drop enough to
                        // get back to the target buffer size.
                        stream.drop_packets = pkts * count / 2;
                        break 'fill Action::None;
                    }
                    SlotState::Filled(j) => j,
                };

                // The id of the first packet names the whole transfer.
                if j == 0 {
                    stream.slots[i].id = id;
                }
                if let Some(buffer) = stream.slots[i].buffer.as_mut() {
                    let off = j * stream.pkt_size;
                    buffer[off..off + data.len()].copy_from_slice(&data);
                }
                stream.slots[i].iso_lengths[j] = data.len() as u32;
                debug!(
                    "iso-out queue ep {ep:02X} transfer {i} pkt {j} len {} id {}",
                    data.len(),
                    stream.slots[i].id
                );

                let j = j + 1;
                stream.slots[i].state = SlotState::Filled(j);
                let (ni, nj) = if j == pkts { ((i + 1) % count, 0) } else { (i, j) };
                stream.out_idx = ni;

                if stream.started {
                    if j == pkts {
                        break 'fill Action::Submit(i);
                    }
                    Action::None
                } else {
                    // Wait for half the ring before submitting anything:
                    // latency against underruns.
                    let available = ni * pkts + nj;
                    let needed = pkts * count / 2;
                    if available == needed {
                        debug!("iso-out starting stream on ep {ep:02X}");
                        break 'fill Action::StartStream;
                    }
                    Action::None
                }
            };

            match action {
                Action::None => {}
                Action::Submit(slot_idx) => {
                    self.submit_stream_transfer_locked(&mut xfer, ep, slot_idx);
                }
                Action::StartStream => {
                    self.start_stream_locked(&mut xfer, ep);
                }
            }
        }

        if status != Status::Success {
            self.send_stream_status(recorded_ty, id, ep, status);
        }
        self.flush();
    }

    fn on_interrupt_packet(&self, id: u64, h: &InterruptPacketHeader, data: Vec<u8>) {
        let h = *h;
        debug!(
            "interrupt submit ep {:02X} len {} id {id}",
            h.endpoint, h.length
        );

        let send_interrupt_status = |status: Status| {
            let mut reply = h;
            reply.status = status as u8;
            reply.length = 0;
            self.parser.send_interrupt_packet(id, &reply, &[]);
        };

        if self.is_disconnected() {
            send_interrupt_status(Status::Ioerror);
            self.flush();
            return;
        }

        {
            let xfer = self.xfer.lock().unwrap();
            let slot = &xfer.endpoints[ep_index(h.endpoint)];
            if slot.ty != EpType::Interrupt {
                error!("received interrupt packet for non interrupt ep {:02X}", h.endpoint);
                drop(xfer);
                send_interrupt_status(Status::Inval);
                self.flush();
                return;
            }
            if data.len() > slot.max_packet_size {
                error!("received interrupt out packet is larger than wMaxPacketSize");
                drop(xfer);
                send_interrupt_status(Status::Inval);
                self.flush();
                return;
            }
        }

        self.log_data("interrupt data out:", &data);
        self.reset_latch.store(false, Ordering::Relaxed);

        let mut xfer = self.xfer.lock().unwrap();
        let token = xfer.transfers.insert(TransferEntry::OneShot {
            id,
            cancelled: false,
            header: OneShotHeader::Interrupt(h),
        });
        if let Err(e) = self.backend.submit(TransferRequest {
            token,
            endpoint: h.endpoint,
            kind: TransferKind::Interrupt,
            buffer: data,
            timeout: INTERRUPT_TIMEOUT,
        }) {
            xfer.transfers.remove(token);
            error!(
                "error submitting interrupt transfer on ep {:02X}: {e}",
                h.endpoint
            );
            let status = self.backend_error_to_wire(e);
            drop(xfer);
            send_interrupt_status(status);
            self.flush();
        }
    }
}

impl<B: UsbBackend> Drop for Host<B> {
    fn drop(&mut self) {
        let mut dev = self.dev.lock().unwrap();
        self.clear_device_locked(&mut dev);
    }
}

impl<'a, B: UsbBackend> PacketHandler for HostHandler<'a, B> {
    fn hello(&mut self, _parser: &Parser, _version: &str) {
        self.host.on_hello();
    }

    fn reset(&mut self, _parser: &Parser) {
        self.host.on_reset();
    }

    fn set_configuration(&mut self, _parser: &Parser, id: u64, header: &SetConfigurationHeader) {
        self.host.on_set_configuration(id, header);
    }

    fn get_configuration(&mut self, _parser: &Parser, id: u64) {
        self.host.on_get_configuration(id);
    }

    fn set_alt_setting(&mut self, _parser: &Parser, id: u64, header: &SetAltSettingHeader) {
        self.host.on_set_alt_setting(id, header);
    }

    fn get_alt_setting(&mut self, _parser: &Parser, id: u64, header: &GetAltSettingHeader) {
        self.host.on_get_alt_setting(id, header);
    }

    fn start_iso_stream(&mut self, _parser: &Parser, id: u64, header: &StartIsoStreamHeader) {
        self.host.on_start_iso_stream(id, header);
    }

    fn stop_iso_stream(&mut self, _parser: &Parser, id: u64, header: &StopIsoStreamHeader) {
        self.host.on_stop_iso_stream(id, header);
    }

    fn start_interrupt_receiving(
        &mut self,
        _parser: &Parser,
        id: u64,
        header: &StartInterruptReceivingHeader,
    ) {
        self.host.on_start_interrupt_receiving(id, header);
    }

    fn stop_interrupt_receiving(
        &mut self,
        _parser: &Parser,
        id: u64,
        header: &StopInterruptReceivingHeader,
    ) {
        self.host.on_stop_interrupt_receiving(id, header);
    }

    fn alloc_bulk_streams(&mut self, _parser: &Parser, id: u64, header: &AllocBulkStreamsHeader) {
        self.host.on_alloc_bulk_streams(id, header);
    }

    fn free_bulk_streams(&mut self, _parser: &Parser, id: u64, header: &FreeBulkStreamsHeader) {
        self.host.on_free_bulk_streams(id, header);
    }

    fn cancel_data_packet(&mut self, _parser: &Parser, id: u64) {
        self.host.on_cancel_data_packet(id);
    }

    fn filter_reject(&mut self, _parser: &Parser) {
        self.host.on_filter_reject();
    }

    fn filter_filter(&mut self, _parser: &Parser, rules: Vec<Rule>) {
        self.host.on_filter_filter(rules);
    }

    fn device_disconnect_ack(&mut self, _parser: &Parser) {
        self.host.on_device_disconnect_ack();
    }

    fn start_bulk_receiving(
        &mut self,
        _parser: &Parser,
        id: u64,
        header: &StartBulkReceivingHeader,
    ) {
        self.host.on_start_bulk_receiving(id, header);
    }

    fn stop_bulk_receiving(
        &mut self,
        _parser: &Parser,
        id: u64,
        header: &StopBulkReceivingHeader,
    ) {
        self.host.on_stop_bulk_receiving(id, header);
    }

    fn control_packet(
        &mut self,
        _parser: &Parser,
        id: u64,
        header: ControlPacketHeader,
        data: Vec<u8>,
    ) {
        self.host.on_control_packet(id, &header, data);
    }

    fn bulk_packet(&mut self, _parser: &Parser, id: u64, header: BulkPacketHeader, data: Vec<u8>) {
        self.host.on_bulk_packet(id, &header, data);
    }

    fn iso_packet(&mut self, _parser: &Parser, id: u64, header: IsoPacketHeader, data: Vec<u8>) {
        self.host.on_iso_packet(id, &header, data);
    }

    fn interrupt_packet(
        &mut self,
        _parser: &Parser,
        id: u64,
        header: InterruptPacketHeader,
        data: Vec<u8>,
    ) {
        self.host.on_interrupt_packet(id, &header, data);
    }
}

/// Match a device (not yet opened by a [`Host`]) against filter rules,
/// reading its descriptors through the backend.
pub fn check_device_filter<B: UsbBackend>(
    rules: &[Rule],
    backend: &B,
    flags: CheckFlags,
) -> Result<(), DeviceFilterError> {
    let desc = backend
        .device_descriptor()
        .map_err(DeviceFilterError::Io)?;

    let config = match backend.active_config_descriptor() {
        Ok(c) => c,
        Err(BackendError::NotFound) => None,
        Err(e) => return Err(DeviceFilterError::Io(e)),
    };

    let mut interfaces = Vec::new();
    if let Some(cfg) = config.as_deref().and_then(Configuration::new) {
        for group in cfg.interfaces() {
            let alt = group.alt_setting(0);
            interfaces.push(InterfaceClass {
                class: alt.class(),
                subclass: alt.subclass(),
                protocol: alt.protocol(),
            });
        }
    }

    filter::check(
        rules,
        desc.class(),
        &interfaces,
        desc.vendor_id(),
        desc.product_id(),
        desc.device_version(),
        flags,
    )
    .map_err(DeviceFilterError::Check)
}

//! Protocol codec: framing state machine, dispatch and write queue.
//!
//! A [`Parser`] turns the byte stream of a transport into typed packet
//! callbacks on a [`PacketHandler`], and serializes outbound packets into a
//! FIFO of write buffers drained by [`Parser::do_write`].
//!
//! Threading: at most one thread may call [`Parser::do_read`] at a time
//! (and it must not be re-entered from handler callbacks). The `send_*`
//! operations, [`Parser::do_write`] and the queue accessors may be called
//! concurrently from any thread.

use std::collections::VecDeque;
use std::io;
use std::sync::Mutex;

use log::{error, info, warn};

use crate::caps::{Cap, CapSet, EffectiveCaps, PeerCaps, CAPS_WORDS};
use crate::filter::{self, Rule};
use crate::proto::{
    type_header_len, AllocBulkStreamsHeader, AltSettingStatusHeader, BufferedBulkPacketHeader,
    BulkPacketHeader, BulkReceivingStatusHeader, BulkStreamsStatusHeader,
    ConfigurationStatusHeader, ControlPacketHeader, DeviceConnectHeader, EpInfoHeader,
    FreeBulkStreamsHeader, GetAltSettingHeader, Header, InterfaceInfoHeader, InterruptPacketHeader,
    InterruptReceivingStatusHeader, IsoPacketHeader, IsoStreamStatusHeader, PacketType, Role,
    SetAltSettingHeader, SetConfigurationHeader, StartBulkReceivingHeader, StartIsoStreamHeader,
    StartInterruptReceivingHeader, StopBulkReceivingHeader, StopIsoStreamHeader,
    StopInterruptReceivingHeader, TypeHeader, HEADER_LEN_32, HEADER_LEN_64, HELLO_VERSION_LEN,
    MAX_BULK_TRANSFER_SIZE, MAX_PACKET_SIZE,
};

/// Largest type header on the wire (`ep_info` with bulk streams).
const TYPE_HEADER_BUF_LEN: usize = 288;

/// The byte transport the codec reads from and writes to.
///
/// Both directions are non-blocking: `ErrorKind::WouldBlock` means "no
/// progress now, poll again later". `Ok(0)` from `read` means the peer
/// closed the stream. Any other error is fatal to the connection.
pub trait Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;
}

/// Error from [`Parser::do_read`].
#[derive(Debug)]
pub enum ReadError {
    /// A malformed frame was skipped. The connection survives; call
    /// `do_read` again to continue with the next packet.
    Parse,
    /// The peer closed the stream.
    Closed,
    /// Fatal transport error.
    Io(io::Error),
}

impl std::fmt::Display for ReadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadError::Parse => write!(f, "protocol parse error"),
            ReadError::Closed => write!(f, "peer closed the connection"),
            ReadError::Io(e) => write!(f, "transport error: {e}"),
        }
    }
}

impl std::error::Error for ReadError {}

/// Error from [`Parser::do_write`].
#[derive(Debug)]
pub enum WriteError {
    /// Fatal transport error.
    Io(io::Error),
}

impl std::fmt::Display for WriteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriteError::Io(e) => write!(f, "transport error: {e}"),
        }
    }
}

impl std::error::Error for WriteError {}

/// Codec configuration flags.
#[derive(Debug, Default, Clone, Copy)]
pub struct ParserFlags {
    /// This side owns the physical device.
    pub usb_host: bool,
    /// Do not queue the initial `hello` (used when restoring serialized
    /// state into a fresh codec).
    pub no_hello: bool,
    /// Every write buffer must be consumed by a single transport write;
    /// the application meters outbound buffering itself.
    pub write_cb_owns_buffer: bool,
}

/// Consumer of decoded packets.
///
/// One method per packet type. Methods for packet types a consumer does not
/// expect have default bodies that log and ignore, matching the treatment
/// of other protocol misuse. Handlers may call any `send_*` operation on
/// the parser they are passed, but must not re-enter `do_read`.
#[allow(unused_variables)]
pub trait PacketHandler {
    fn hello(&mut self, parser: &Parser, version: &str) {}

    fn device_connect(&mut self, parser: &Parser, header: &DeviceConnectHeader) {
        warn!("unhandled device_connect packet");
    }

    fn device_disconnect(&mut self, parser: &Parser) {
        warn!("unhandled device_disconnect packet");
    }

    fn reset(&mut self, parser: &Parser) {
        warn!("unhandled reset packet");
    }

    fn interface_info(&mut self, parser: &Parser, header: &InterfaceInfoHeader) {
        warn!("unhandled interface_info packet");
    }

    fn ep_info(&mut self, parser: &Parser, header: &EpInfoHeader) {
        warn!("unhandled ep_info packet");
    }

    fn set_configuration(&mut self, parser: &Parser, id: u64, header: &SetConfigurationHeader) {
        warn!("unhandled set_configuration packet");
    }

    fn get_configuration(&mut self, parser: &Parser, id: u64) {
        warn!("unhandled get_configuration packet");
    }

    fn configuration_status(
        &mut self,
        parser: &Parser,
        id: u64,
        header: &ConfigurationStatusHeader,
    ) {
        warn!("unhandled configuration_status packet");
    }

    fn set_alt_setting(&mut self, parser: &Parser, id: u64, header: &SetAltSettingHeader) {
        warn!("unhandled set_alt_setting packet");
    }

    fn get_alt_setting(&mut self, parser: &Parser, id: u64, header: &GetAltSettingHeader) {
        warn!("unhandled get_alt_setting packet");
    }

    fn alt_setting_status(&mut self, parser: &Parser, id: u64, header: &AltSettingStatusHeader) {
        warn!("unhandled alt_setting_status packet");
    }

    fn start_iso_stream(&mut self, parser: &Parser, id: u64, header: &StartIsoStreamHeader) {
        warn!("unhandled start_iso_stream packet");
    }

    fn stop_iso_stream(&mut self, parser: &Parser, id: u64, header: &StopIsoStreamHeader) {
        warn!("unhandled stop_iso_stream packet");
    }

    fn iso_stream_status(&mut self, parser: &Parser, id: u64, header: &IsoStreamStatusHeader) {
        warn!("unhandled iso_stream_status packet");
    }

    fn start_interrupt_receiving(
        &mut self,
        parser: &Parser,
        id: u64,
        header: &StartInterruptReceivingHeader,
    ) {
        warn!("unhandled start_interrupt_receiving packet");
    }

    fn stop_interrupt_receiving(
        &mut self,
        parser: &Parser,
        id: u64,
        header: &StopInterruptReceivingHeader,
    ) {
        warn!("unhandled stop_interrupt_receiving packet");
    }

    fn interrupt_receiving_status(
        &mut self,
        parser: &Parser,
        id: u64,
        header: &InterruptReceivingStatusHeader,
    ) {
        warn!("unhandled interrupt_receiving_status packet");
    }

    fn alloc_bulk_streams(&mut self, parser: &Parser, id: u64, header: &AllocBulkStreamsHeader) {
        warn!("unhandled alloc_bulk_streams packet");
    }

    fn free_bulk_streams(&mut self, parser: &Parser, id: u64, header: &FreeBulkStreamsHeader) {
        warn!("unhandled free_bulk_streams packet");
    }

    fn bulk_streams_status(&mut self, parser: &Parser, id: u64, header: &BulkStreamsStatusHeader) {
        warn!("unhandled bulk_streams_status packet");
    }

    fn cancel_data_packet(&mut self, parser: &Parser, id: u64) {
        warn!("unhandled cancel_data_packet packet");
    }

    fn filter_reject(&mut self, parser: &Parser) {
        warn!("unhandled filter_reject packet");
    }

    fn filter_filter(&mut self, parser: &Parser, rules: Vec<Rule>) {
        warn!("unhandled filter_filter packet");
    }

    fn device_disconnect_ack(&mut self, parser: &Parser) {
        warn!("unhandled device_disconnect_ack packet");
    }

    fn start_bulk_receiving(
        &mut self,
        parser: &Parser,
        id: u64,
        header: &StartBulkReceivingHeader,
    ) {
        warn!("unhandled start_bulk_receiving packet");
    }

    fn stop_bulk_receiving(
        &mut self,
        parser: &Parser,
        id: u64,
        header: &StopBulkReceivingHeader,
    ) {
        warn!("unhandled stop_bulk_receiving packet");
    }

    fn bulk_receiving_status(
        &mut self,
        parser: &Parser,
        id: u64,
        header: &BulkReceivingStatusHeader,
    ) {
        warn!("unhandled bulk_receiving_status packet");
    }

    fn control_packet(
        &mut self,
        parser: &Parser,
        id: u64,
        header: ControlPacketHeader,
        data: Vec<u8>,
    ) {
        warn!("unhandled control_packet packet");
    }

    fn bulk_packet(&mut self, parser: &Parser, id: u64, header: BulkPacketHeader, data: Vec<u8>) {
        warn!("unhandled bulk_packet packet");
    }

    fn iso_packet(&mut self, parser: &Parser, id: u64, header: IsoPacketHeader, data: Vec<u8>) {
        warn!("unhandled iso_packet packet");
    }

    fn interrupt_packet(
        &mut self,
        parser: &Parser,
        id: u64,
        header: InterruptPacketHeader,
        data: Vec<u8>,
    ) {
        warn!("unhandled interrupt_packet packet");
    }

    fn buffered_bulk_packet(
        &mut self,
        parser: &Parser,
        id: u64,
        header: BufferedBulkPacketHeader,
        data: Vec<u8>,
    ) {
        warn!("unhandled buffered_bulk_packet packet");
    }
}

pub(crate) struct Reader {
    pub(crate) header: [u8; HEADER_LEN_64],
    pub(crate) header_read: usize,
    pub(crate) type_header: [u8; TYPE_HEADER_BUF_LEN],
    pub(crate) type_header_len: usize,
    pub(crate) type_header_read: usize,
    pub(crate) data: Vec<u8>,
    pub(crate) data_read: usize,
    pub(crate) to_skip: u64,
}

impl Reader {
    pub(crate) fn new() -> Reader {
        Reader {
            header: [0; HEADER_LEN_64],
            header_read: 0,
            type_header: [0; TYPE_HEADER_BUF_LEN],
            type_header_len: 0,
            type_header_read: 0,
            data: Vec::new(),
            data_read: 0,
            to_skip: 0,
        }
    }

    pub(crate) fn is_pristine(&self) -> bool {
        self.header_read == 0
            && self.type_header_read == 0
            && self.data.is_empty()
            && self.data_read == 0
    }

    fn reset_packet(&mut self) {
        self.header_read = 0;
        self.type_header_len = 0;
        self.type_header_read = 0;
        self.data = Vec::new();
        self.data_read = 0;
    }

    fn assert_invariants(&self) {
        debug_assert!(self.header_read <= self.header.len());
        debug_assert!(self.type_header_len <= self.type_header.len());
        debug_assert!(self.type_header_read <= self.type_header_len);
        debug_assert!(self.data.len() <= MAX_PACKET_SIZE as usize);
        debug_assert!(self.data_read <= self.data.len());
    }
}

pub(crate) struct WriteBuf {
    pub(crate) buf: Vec<u8>,
    pub(crate) pos: usize,
}

#[derive(Default)]
pub(crate) struct WriteQueue {
    pub(crate) bufs: VecDeque<WriteBuf>,
    pub(crate) total_size: u64,
}

impl WriteQueue {
    pub(crate) fn push(&mut self, buf: Vec<u8>) {
        self.total_size += buf.len() as u64;
        self.bufs.push_back(WriteBuf { buf, pos: 0 });
    }

    fn assert_invariants(&self) {
        debug_assert_eq!(
            self.total_size,
            self.bufs.iter().map(|b| b.buf.len() as u64).sum::<u64>()
        );
        debug_assert!(self.bufs.iter().all(|b| b.pos <= b.buf.len()));
    }
}

/// The protocol codec.
pub struct Parser {
    pub(crate) role: Role,
    owns_buffer: bool,
    pub(crate) our_caps: CapSet,
    pub(crate) peer_caps: PeerCaps,
    pub(crate) reader: Mutex<Reader>,
    pub(crate) queue: Mutex<WriteQueue>,
}

impl Parser {
    /// Create a codec. Unless `flags.no_hello` is set, a `hello` carrying
    /// `version` and `caps` is queued immediately.
    ///
    /// Guest-side codecs get `cap_device_disconnect_ack` added: the codec
    /// acks disconnects internally.
    pub fn new(version: &str, caps: CapSet, flags: ParserFlags) -> Parser {
        let mut our_caps = caps;
        if !flags.usb_host {
            our_caps.set(Cap::DeviceDisconnectAck);
        }
        our_caps.verify("our");

        let parser = Parser {
            role: if flags.usb_host { Role::Host } else { Role::Guest },
            owns_buffer: flags.write_cb_owns_buffer,
            our_caps,
            peer_caps: PeerCaps::default(),
            reader: Mutex::new(Reader::new()),
            queue: Mutex::new(WriteQueue::default()),
        };

        if !flags.no_hello {
            let mut version_buf = [0u8; HELLO_VERSION_LEN];
            let bytes = version.as_bytes();
            let n = bytes.len().min(HELLO_VERSION_LEN - 1);
            version_buf[..n].copy_from_slice(&bytes[..n]);

            let mut caps_data = Vec::with_capacity(CAPS_WORDS * 4);
            for word in parser.our_caps.words() {
                caps_data.extend_from_slice(&word.to_le_bytes());
            }
            parser.queue_packet(
                PacketType::Hello,
                0,
                TypeHeader::Hello {
                    version: version_buf,
                },
                &caps_data,
            );
        }

        parser
    }

    pub fn have_peer_caps(&self) -> bool {
        self.peer_caps.is_valid()
    }

    pub fn peer_has_cap(&self, cap: Cap) -> bool {
        self.peer_caps.has(cap)
    }

    pub fn have_cap(&self, cap: Cap) -> bool {
        self.our_caps.has(cap)
    }

    pub(crate) fn using_64bit_ids(&self) -> bool {
        self.have_cap(Cap::Ids64Bits) && self.peer_has_cap(Cap::Ids64Bits)
    }

    pub(crate) fn header_len(&self) -> usize {
        if self.using_64bit_ids() {
            HEADER_LEN_64
        } else {
            HEADER_LEN_32
        }
    }

    pub(crate) fn effective_caps(&self) -> EffectiveCaps {
        EffectiveCaps::new(&self.our_caps, &self.peer_caps)
    }

    /// Number of queued write buffers.
    pub fn has_data_to_write(&self) -> usize {
        self.queue.lock().unwrap().bufs.len()
    }

    /// Total bytes queued for output.
    pub fn buffered_output_size(&self) -> u64 {
        self.queue.lock().unwrap().total_size
    }

    /// Consume bytes from `transport` until it would block, dispatching
    /// every complete packet to `handler`.
    ///
    /// `Err(ReadError::Parse)` reports one skipped malformed frame; the
    /// framer stays synchronized and the next call continues normally.
    pub fn do_read(
        &self,
        transport: &mut dyn Transport,
        handler: &mut dyn PacketHandler,
    ) -> Result<(), ReadError> {
        let mut r = self.reader.lock().unwrap();
        r.assert_invariants();

        // Skip forward to the next packet (only used in error conditions).
        while r.to_skip > 0 {
            let mut scratch = [0u8; 65536];
            let want = (r.to_skip as usize).min(scratch.len());
            let n = match transport.read(&mut scratch[..want]) {
                Ok(0) => return Err(ReadError::Closed),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(ReadError::Io(e)),
            };
            r.to_skip -= n as u64;
        }

        // Consume data until the transport would block.
        loop {
            let header_len = self.header_len();

            if r.header_read < header_len {
                let Reader {
                    header,
                    header_read,
                    ..
                } = &mut *r;
                let n = match transport.read(&mut header[*header_read..header_len]) {
                    Ok(0) => return Err(ReadError::Closed),
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                    Err(e) => return Err(ReadError::Io(e)),
                };
                r.header_read += n;
                if r.header_read == header_len {
                    self.begin_packet(&mut r, header_len)?;
                }
                continue;
            }

            if r.type_header_read < r.type_header_len {
                let Reader {
                    type_header,
                    type_header_read,
                    type_header_len,
                    ..
                } = &mut *r;
                let n = match transport.read(&mut type_header[*type_header_read..*type_header_len])
                {
                    Ok(0) => return Err(ReadError::Closed),
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                    Err(e) => return Err(ReadError::Io(e)),
                };
                r.type_header_read += n;
                continue;
            }

            if r.data_read < r.data.len() {
                let Reader {
                    data, data_read, ..
                } = &mut *r;
                let n = match transport.read(&mut data[*data_read..]) {
                    Ok(0) => return Err(ReadError::Closed),
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                    Err(e) => return Err(ReadError::Io(e)),
                };
                r.data_read += n;
                if r.data_read < r.data.len() {
                    continue;
                }
            }

            let ok = self.finish_packet(&mut r, header_len, handler);
            r.assert_invariants();
            if !ok {
                return Err(ReadError::Parse);
            }
        }
    }

    /// Validate the freshly completed main header and size the rest of the
    /// frame. On failure arms skip mode and reports a parse error.
    fn begin_packet(&self, r: &mut Reader, header_len: usize) -> Result<(), ReadError> {
        let header = Header::parse(&r.header[..header_len]);

        let invalid = |r: &mut Reader| {
            r.to_skip = header.length as u64;
            r.header_read = 0;
            Err(ReadError::Parse)
        };

        let Some(ptype) = PacketType::from_u32(header.ptype) else {
            error!("invalid packet type: {}", header.ptype);
            return invalid(r);
        };
        let for_host = self.role == Role::Host;
        let Some(type_header_len) = type_header_len(ptype, for_host, self.effective_caps()) else {
            error!("packet type {ptype:?} not valid in this direction");
            return invalid(r);
        };
        if header.length > MAX_PACKET_SIZE {
            error!(
                "packet length of {} larger than permitted {} bytes",
                header.length, MAX_PACKET_SIZE
            );
            return invalid(r);
        }
        if (header.length as usize) < type_header_len
            || (header.length as usize > type_header_len && !ptype.may_carry_payload())
        {
            error!(
                "invalid packet type {:?} length: {}",
                ptype, header.length
            );
            return invalid(r);
        }

        let data_len = header.length as usize - type_header_len;
        r.type_header_len = type_header_len;
        r.type_header_read = 0;
        r.data = vec![0; data_len];
        r.data_read = 0;
        Ok(())
    }

    /// Validate and dispatch a fully read packet, then reset for the next
    /// frame. Returns false on a validation failure (parse error).
    fn finish_packet(
        &self,
        r: &mut Reader,
        header_len: usize,
        handler: &mut dyn PacketHandler,
    ) -> bool {
        let header = Header::parse(&r.header[..header_len]);
        // The type was validated when the header completed.
        let ptype = PacketType::from_u32(header.ptype).unwrap();

        let mut th = TypeHeader::parse(ptype, &r.type_header[..r.type_header_len]);
        let data = std::mem::take(&mut r.data);
        let data_read = r.data_read;
        r.reset_packet();
        debug_assert_eq!(data_read, data.len());

        if !self.verify_type_header(&mut th, &data, false) {
            return false;
        }

        self.dispatch(header.id, th, data, handler);
        true
    }

    fn dispatch(&self, id: u64, th: TypeHeader, data: Vec<u8>, handler: &mut dyn PacketHandler) {
        match th {
            TypeHeader::Hello { version } => self.handle_hello(&version, &data, handler),
            TypeHeader::DeviceConnect(h) => handler.device_connect(self, &h),
            TypeHeader::DeviceDisconnect => {
                handler.device_disconnect(self);
                if self.peer_has_cap(Cap::DeviceDisconnectAck) {
                    self.queue_packet(
                        PacketType::DeviceDisconnectAck,
                        0,
                        TypeHeader::DeviceDisconnectAck,
                        &[],
                    );
                }
            }
            TypeHeader::Reset => handler.reset(self),
            TypeHeader::InterfaceInfo(h) => handler.interface_info(self, &h),
            TypeHeader::EpInfo(h) => handler.ep_info(self, &h),
            TypeHeader::SetConfiguration(h) => handler.set_configuration(self, id, &h),
            TypeHeader::GetConfiguration => handler.get_configuration(self, id),
            TypeHeader::ConfigurationStatus(h) => handler.configuration_status(self, id, &h),
            TypeHeader::SetAltSetting(h) => handler.set_alt_setting(self, id, &h),
            TypeHeader::GetAltSetting(h) => handler.get_alt_setting(self, id, &h),
            TypeHeader::AltSettingStatus(h) => handler.alt_setting_status(self, id, &h),
            TypeHeader::StartIsoStream(h) => handler.start_iso_stream(self, id, &h),
            TypeHeader::StopIsoStream(h) => handler.stop_iso_stream(self, id, &h),
            TypeHeader::IsoStreamStatus(h) => handler.iso_stream_status(self, id, &h),
            TypeHeader::StartInterruptReceiving(h) => {
                handler.start_interrupt_receiving(self, id, &h)
            }
            TypeHeader::StopInterruptReceiving(h) => {
                handler.stop_interrupt_receiving(self, id, &h)
            }
            TypeHeader::InterruptReceivingStatus(h) => {
                handler.interrupt_receiving_status(self, id, &h)
            }
            TypeHeader::AllocBulkStreams(h) => handler.alloc_bulk_streams(self, id, &h),
            TypeHeader::FreeBulkStreams(h) => handler.free_bulk_streams(self, id, &h),
            TypeHeader::BulkStreamsStatus(h) => handler.bulk_streams_status(self, id, &h),
            TypeHeader::CancelDataPacket => handler.cancel_data_packet(self, id),
            TypeHeader::FilterReject => handler.filter_reject(self),
            TypeHeader::FilterFilter => {
                // Validation guarantees a non-empty NUL-terminated payload.
                let text = String::from_utf8_lossy(&data[..data.len() - 1]);
                match filter::string_to_rules(&text, ",", "|") {
                    Ok(rules) => handler.filter_filter(self, rules),
                    Err(e) => error!("error parsing filter ({e}), ignoring filter message"),
                }
            }
            TypeHeader::DeviceDisconnectAck => handler.device_disconnect_ack(self),
            TypeHeader::StartBulkReceiving(h) => handler.start_bulk_receiving(self, id, &h),
            TypeHeader::StopBulkReceiving(h) => handler.stop_bulk_receiving(self, id, &h),
            TypeHeader::BulkReceivingStatus(h) => handler.bulk_receiving_status(self, id, &h),
            TypeHeader::ControlPacket(h) => handler.control_packet(self, id, h, data),
            TypeHeader::BulkPacket(h) => handler.bulk_packet(self, id, h, data),
            TypeHeader::IsoPacket(h) => handler.iso_packet(self, id, h, data),
            TypeHeader::InterruptPacket(h) => handler.interrupt_packet(self, id, h, data),
            TypeHeader::BufferedBulkPacket(h) => handler.buffered_bulk_packet(self, id, h, data),
        }
    }

    fn handle_hello(&self, version: &[u8], data: &[u8], handler: &mut dyn PacketHandler) {
        // Truncate at the first NUL; a missing terminator would be a
        // protocol violation but must not run off the banner.
        let end = version.iter().position(|&b| b == 0).unwrap_or(version.len());
        let version_str = String::from_utf8_lossy(&version[..end]).into_owned();

        let mut words = [0u32; CAPS_WORDS];
        for (i, chunk) in data.chunks_exact(4).take(CAPS_WORDS).enumerate() {
            words[i] = u32::from_le_bytes(chunk.try_into().unwrap());
        }
        let mut set = CapSet::from_words(&words);
        set.verify("peer");
        if !self.peer_caps.install(set) {
            return;
        }

        info!(
            "peer version: {}, using {}-bit ids",
            version_str,
            if self.using_64bit_ids() { 64 } else { 32 }
        );

        handler.hello(self, &version_str);
    }

    /// Validate a type header, either received (`send == false`) or about
    /// to be sent. May normalize fields (`bulk_packet.length_high` is
    /// masked when 32-bit bulk lengths are not negotiated).
    fn verify_type_header(&self, th: &mut TypeHeader, data: &[u8], send: bool) -> bool {
        let data_len = data.len();
        let for_host = (self.role == Role::Host) != send;
        let caps = self.effective_caps();

        // (length, endpoint) of data-carrying packets for the direction
        // checks below.
        let mut ep_and_len: Option<(u8, u32)> = None;

        match th {
            TypeHeader::InterfaceInfo(h) => {
                if h.interface_count > 32 {
                    error!("interface_count > 32");
                    return false;
                }
            }
            TypeHeader::StartInterruptReceiving(h) => {
                if h.endpoint & 0x80 == 0 {
                    error!("start interrupt receiving on non input ep {:02x}", h.endpoint);
                    return false;
                }
            }
            TypeHeader::StopInterruptReceiving(h) => {
                if h.endpoint & 0x80 == 0 {
                    error!("stop interrupt receiving on non input ep {:02x}", h.endpoint);
                    return false;
                }
            }
            TypeHeader::InterruptReceivingStatus(h) => {
                if h.endpoint & 0x80 == 0 {
                    error!(
                        "interrupt receiving status for non input ep {:02x}",
                        h.endpoint
                    );
                    return false;
                }
            }
            TypeHeader::FilterReject => {
                if !self.check_cap_for(Cap::Filter, send) {
                    error!("filter_reject without cap_filter");
                    return false;
                }
            }
            TypeHeader::FilterFilter => {
                if !self.check_cap_for(Cap::Filter, send) {
                    error!("filter_filter without cap_filter");
                    return false;
                }
                if data_len < 1 {
                    error!("filter_filter without data");
                    return false;
                }
                if data[data_len - 1] != 0 {
                    error!("non NUL terminated filter_filter data");
                    return false;
                }
            }
            TypeHeader::DeviceDisconnectAck => {
                if !self.check_cap_for(Cap::DeviceDisconnectAck, send) {
                    error!("device_disconnect_ack without cap_device_disconnect_ack");
                    return false;
                }
            }
            TypeHeader::StartBulkReceiving(h) => {
                if !self.check_cap_for(Cap::BulkReceiving, send) {
                    error!("bulk_receiving without cap_bulk_receiving");
                    return false;
                }
                if h.bytes_per_transfer > MAX_BULK_TRANSFER_SIZE {
                    error!(
                        "start bulk receiving length exceeds limits {} > {}",
                        h.bytes_per_transfer, MAX_BULK_TRANSFER_SIZE
                    );
                    return false;
                }
                if h.endpoint & 0x80 == 0 {
                    error!("start bulk receiving on non input ep {:02x}", h.endpoint);
                    return false;
                }
            }
            TypeHeader::StopBulkReceiving(h) => {
                if !self.check_cap_for(Cap::BulkReceiving, send) {
                    error!("bulk_receiving without cap_bulk_receiving");
                    return false;
                }
                if h.endpoint & 0x80 == 0 {
                    error!("stop bulk receiving on non input ep {:02x}", h.endpoint);
                    return false;
                }
            }
            TypeHeader::BulkReceivingStatus(h) => {
                if !self.check_cap_for(Cap::BulkReceiving, send) {
                    error!("bulk_receiving without cap_bulk_receiving");
                    return false;
                }
                if h.endpoint & 0x80 == 0 {
                    error!("bulk receiving status for non input ep {:02x}", h.endpoint);
                    return false;
                }
            }
            TypeHeader::ControlPacket(h) => {
                ep_and_len = Some((h.endpoint, h.length as u32));
            }
            TypeHeader::BulkPacket(h) => {
                let length = if caps.bulk_length_32 {
                    h.total_length()
                } else {
                    if !send {
                        h.length_high = 0;
                    }
                    h.length as u32
                };
                if length > MAX_BULK_TRANSFER_SIZE {
                    error!(
                        "bulk transfer length exceeds limits {} > {}",
                        length, MAX_BULK_TRANSFER_SIZE
                    );
                    return false;
                }
                ep_and_len = Some((h.endpoint, length));
            }
            TypeHeader::IsoPacket(h) => {
                ep_and_len = Some((h.endpoint, h.length as u32));
            }
            TypeHeader::InterruptPacket(h) => {
                ep_and_len = Some((h.endpoint, h.length as u32));
            }
            TypeHeader::BufferedBulkPacket(h) => {
                if !self.check_cap_for(Cap::BulkReceiving, send) {
                    error!("bulk_receiving without cap_bulk_receiving");
                    return false;
                }
                if h.length > MAX_BULK_TRANSFER_SIZE {
                    error!(
                        "buffered bulk transfer length exceeds limits {} > {}",
                        h.length, MAX_BULK_TRANSFER_SIZE
                    );
                    return false;
                }
                ep_and_len = Some((h.endpoint, h.length));
            }
            _ => {}
        }

        if let Some((ep, length)) = ep_and_len {
            // Payload travels with the packet only when it goes the same
            // way as the endpoint's data.
            let expect_payload = (ep & 0x80 != 0) != for_host;
            if expect_payload {
                if data_len != length as usize {
                    error!(
                        "data len {} != header len {} ep {:02X}",
                        data_len, length, ep
                    );
                    return false;
                }
            } else {
                if data_len != 0 {
                    error!("unexpected extra data ep {:02X}", ep);
                    return false;
                }
                match th {
                    TypeHeader::IsoPacket(_) => {
                        error!("iso packet sent in wrong direction");
                        return false;
                    }
                    TypeHeader::InterruptPacket(_) if for_host => {
                        error!("interrupt packet sent in wrong direction");
                        return false;
                    }
                    TypeHeader::BufferedBulkPacket(_) => {
                        error!("buffered bulk packet sent in wrong direction");
                        return false;
                    }
                    _ => {}
                }
            }
        }

        true
    }

    /// Capability gate for packets that need one: outbound packets check
    /// the peer's set, inbound packets check ours.
    fn check_cap_for(&self, cap: Cap, send: bool) -> bool {
        if send {
            self.peer_has_cap(cap)
        } else {
            self.have_cap(cap)
        }
    }

    /// Serialize a packet and append it to the write queue.
    fn queue_packet(&self, ptype: PacketType, id: u64, mut th: TypeHeader, data: &[u8]) {
        let caps = self.effective_caps();
        let for_host = self.role != Role::Host;
        let Some(thl) = type_header_len(ptype, for_host, caps) else {
            error!("attempt to queue {ptype:?} in the wrong direction, dropping");
            return;
        };
        if !self.verify_type_header(&mut th, data, true) {
            error!("send called with invalid parameters, dropping packet");
            return;
        }

        let header_len = self.header_len();
        let mut buf = Vec::with_capacity(header_len + thl + data.len());
        Header {
            ptype: ptype as u32,
            length: (thl + data.len()) as u32,
            id,
        }
        .encode(self.using_64bit_ids(), &mut buf);
        th.encode(caps, &mut buf);
        buf.extend_from_slice(data);
        debug_assert_eq!(buf.len(), header_len + thl + data.len());

        let mut q = self.queue.lock().unwrap();
        q.push(buf);
        q.assert_invariants();
    }

    /// Drain the write queue into `transport` until it would block or the
    /// queue is empty.
    pub fn do_write(&self, transport: &mut dyn Transport) -> Result<(), WriteError> {
        let mut q = self.queue.lock().unwrap();
        q.assert_invariants();

        while let Some(front) = q.bufs.front_mut() {
            let n = match transport.write(&front.buf[front.pos..]) {
                Ok(0) => return Ok(()),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(WriteError::Io(e)),
            };

            if self.owns_buffer && n != front.buf.len() {
                // See ParserFlags::write_cb_owns_buffer: the transport
                // promised to consume whole buffers.
                panic!("write_cb_owns_buffer transport consumed a partial buffer");
            }

            front.pos += n;
            if front.pos == front.buf.len() {
                let len = front.buf.len() as u64;
                q.bufs.pop_front();
                q.total_size -= len;
            }
        }
        Ok(())
    }

    pub fn send_device_connect(&self, header: &DeviceConnectHeader) {
        self.queue_packet(
            PacketType::DeviceConnect,
            0,
            TypeHeader::DeviceConnect(*header),
            &[],
        );
    }

    pub fn send_device_disconnect(&self) {
        self.queue_packet(
            PacketType::DeviceDisconnect,
            0,
            TypeHeader::DeviceDisconnect,
            &[],
        );
    }

    pub fn send_reset(&self) {
        self.queue_packet(PacketType::Reset, 0, TypeHeader::Reset, &[]);
    }

    pub fn send_interface_info(&self, header: &InterfaceInfoHeader) {
        self.queue_packet(
            PacketType::InterfaceInfo,
            0,
            TypeHeader::InterfaceInfo(Box::new(header.clone())),
            &[],
        );
    }

    pub fn send_ep_info(&self, header: &EpInfoHeader) {
        self.queue_packet(
            PacketType::EpInfo,
            0,
            TypeHeader::EpInfo(Box::new(header.clone())),
            &[],
        );
    }

    pub fn send_set_configuration(&self, id: u64, header: &SetConfigurationHeader) {
        self.queue_packet(
            PacketType::SetConfiguration,
            id,
            TypeHeader::SetConfiguration(*header),
            &[],
        );
    }

    pub fn send_get_configuration(&self, id: u64) {
        self.queue_packet(PacketType::GetConfiguration, id, TypeHeader::GetConfiguration, &[]);
    }

    pub fn send_configuration_status(&self, id: u64, header: &ConfigurationStatusHeader) {
        self.queue_packet(
            PacketType::ConfigurationStatus,
            id,
            TypeHeader::ConfigurationStatus(*header),
            &[],
        );
    }

    pub fn send_set_alt_setting(&self, id: u64, header: &SetAltSettingHeader) {
        self.queue_packet(
            PacketType::SetAltSetting,
            id,
            TypeHeader::SetAltSetting(*header),
            &[],
        );
    }

    pub fn send_get_alt_setting(&self, id: u64, header: &GetAltSettingHeader) {
        self.queue_packet(
            PacketType::GetAltSetting,
            id,
            TypeHeader::GetAltSetting(*header),
            &[],
        );
    }

    pub fn send_alt_setting_status(&self, id: u64, header: &AltSettingStatusHeader) {
        self.queue_packet(
            PacketType::AltSettingStatus,
            id,
            TypeHeader::AltSettingStatus(*header),
            &[],
        );
    }

    pub fn send_start_iso_stream(&self, id: u64, header: &StartIsoStreamHeader) {
        self.queue_packet(
            PacketType::StartIsoStream,
            id,
            TypeHeader::StartIsoStream(*header),
            &[],
        );
    }

    pub fn send_stop_iso_stream(&self, id: u64, header: &StopIsoStreamHeader) {
        self.queue_packet(
            PacketType::StopIsoStream,
            id,
            TypeHeader::StopIsoStream(*header),
            &[],
        );
    }

    pub fn send_iso_stream_status(&self, id: u64, header: &IsoStreamStatusHeader) {
        self.queue_packet(
            PacketType::IsoStreamStatus,
            id,
            TypeHeader::IsoStreamStatus(*header),
            &[],
        );
    }

    pub fn send_start_interrupt_receiving(&self, id: u64, header: &StartInterruptReceivingHeader) {
        self.queue_packet(
            PacketType::StartInterruptReceiving,
            id,
            TypeHeader::StartInterruptReceiving(*header),
            &[],
        );
    }

    pub fn send_stop_interrupt_receiving(&self, id: u64, header: &StopInterruptReceivingHeader) {
        self.queue_packet(
            PacketType::StopInterruptReceiving,
            id,
            TypeHeader::StopInterruptReceiving(*header),
            &[],
        );
    }

    pub fn send_interrupt_receiving_status(
        &self,
        id: u64,
        header: &InterruptReceivingStatusHeader,
    ) {
        self.queue_packet(
            PacketType::InterruptReceivingStatus,
            id,
            TypeHeader::InterruptReceivingStatus(*header),
            &[],
        );
    }

    pub fn send_alloc_bulk_streams(&self, id: u64, header: &AllocBulkStreamsHeader) {
        self.queue_packet(
            PacketType::AllocBulkStreams,
            id,
            TypeHeader::AllocBulkStreams(*header),
            &[],
        );
    }

    pub fn send_free_bulk_streams(&self, id: u64, header: &FreeBulkStreamsHeader) {
        self.queue_packet(
            PacketType::FreeBulkStreams,
            id,
            TypeHeader::FreeBulkStreams(*header),
            &[],
        );
    }

    pub fn send_bulk_streams_status(&self, id: u64, header: &BulkStreamsStatusHeader) {
        self.queue_packet(
            PacketType::BulkStreamsStatus,
            id,
            TypeHeader::BulkStreamsStatus(*header),
            &[],
        );
    }

    pub fn send_cancel_data_packet(&self, id: u64) {
        self.queue_packet(PacketType::CancelDataPacket, id, TypeHeader::CancelDataPacket, &[]);
    }

    /// No-op when the peer lacks `cap_filter`.
    pub fn send_filter_reject(&self) {
        if !self.peer_has_cap(Cap::Filter) {
            return;
        }
        self.queue_packet(PacketType::FilterReject, 0, TypeHeader::FilterReject, &[]);
    }

    /// No-op when the peer lacks `cap_filter`.
    pub fn send_filter_filter(&self, rules: &[Rule]) {
        if !self.peer_has_cap(Cap::Filter) {
            return;
        }
        let string = match filter::rules_to_string(rules, ",", "|") {
            Ok(s) => s,
            Err(e) => {
                error!("error creating filter string ({e}), not sending filter");
                return;
            }
        };
        let mut data = string.into_bytes();
        data.push(0);
        self.queue_packet(PacketType::FilterFilter, 0, TypeHeader::FilterFilter, &data);
    }

    pub fn send_start_bulk_receiving(&self, id: u64, header: &StartBulkReceivingHeader) {
        self.queue_packet(
            PacketType::StartBulkReceiving,
            id,
            TypeHeader::StartBulkReceiving(*header),
            &[],
        );
    }

    pub fn send_stop_bulk_receiving(&self, id: u64, header: &StopBulkReceivingHeader) {
        self.queue_packet(
            PacketType::StopBulkReceiving,
            id,
            TypeHeader::StopBulkReceiving(*header),
            &[],
        );
    }

    pub fn send_bulk_receiving_status(&self, id: u64, header: &BulkReceivingStatusHeader) {
        self.queue_packet(
            PacketType::BulkReceivingStatus,
            id,
            TypeHeader::BulkReceivingStatus(*header),
            &[],
        );
    }

    pub fn send_control_packet(&self, id: u64, header: &ControlPacketHeader, data: &[u8]) {
        self.queue_packet(
            PacketType::ControlPacket,
            id,
            TypeHeader::ControlPacket(*header),
            data,
        );
    }

    pub fn send_bulk_packet(&self, id: u64, header: &BulkPacketHeader, data: &[u8]) {
        self.queue_packet(PacketType::BulkPacket, id, TypeHeader::BulkPacket(*header), data);
    }

    pub fn send_iso_packet(&self, id: u64, header: &IsoPacketHeader, data: &[u8]) {
        self.queue_packet(PacketType::IsoPacket, id, TypeHeader::IsoPacket(*header), data);
    }

    pub fn send_interrupt_packet(&self, id: u64, header: &InterruptPacketHeader, data: &[u8]) {
        self.queue_packet(
            PacketType::InterruptPacket,
            id,
            TypeHeader::InterruptPacket(*header),
            data,
        );
    }

    pub fn send_buffered_bulk_packet(&self, id: u64, header: &BufferedBulkPacketHeader, data: &[u8]) {
        self.queue_packet(
            PacketType::BufferedBulkPacket,
            id,
            TypeHeader::BufferedBulkPacket(*header),
            data,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// In-memory transport: reads from one buffer, appends writes to
    /// another, reports WouldBlock when the read side runs dry.
    pub(crate) struct PipeTransport {
        pub input: VecDeque<u8>,
        pub output: Vec<u8>,
    }

    impl PipeTransport {
        pub fn new() -> PipeTransport {
            PipeTransport {
                input: VecDeque::new(),
                output: Vec::new(),
            }
        }
    }

    impl Transport for PipeTransport {
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

    #[derive(Default)]
    struct RecordingHandler {
        hellos: Vec<String>,
        resets: usize,
        control_packets: Vec<(u64, ControlPacketHeader, Vec<u8>)>,
    }

    impl PacketHandler for RecordingHandler {
        fn hello(&mut self, _parser: &Parser, version: &str) {
            self.hellos.push(version.to_owned());
        }

        fn reset(&mut self, _parser: &Parser) {
            self.resets += 1;
        }

        fn control_packet(
            &mut self,
            _parser: &Parser,
            id: u64,
            header: ControlPacketHeader,
            data: Vec<u8>,
        ) {
            self.control_packets.push((id, header, data));
        }
    }

    fn host_caps() -> CapSet {
        CapSet::from_caps(&[Cap::EpInfoMaxPacketSize, Cap::Ids64Bits])
    }

    fn pipe(from: &Parser, to_input: &mut PipeTransport) {
        let mut t = PipeTransport::new();
        from.do_write(&mut t).unwrap();
        to_input.input.extend(t.output);
    }

    #[test]
    fn hello_handshake_switches_to_wide_ids() {
        let host = Parser::new(
            "usbredir 0.1",
            host_caps(),
            ParserFlags {
                usb_host: true,
                ..Default::default()
            },
        );
        let guest = Parser::new("usbredir 0.1-guest", host_caps(), ParserFlags::default());

        assert_eq!(host.header_len(), HEADER_LEN_32);

        let mut host_in = PipeTransport::new();
        let mut guest_in = PipeTransport::new();
        pipe(&host, &mut guest_in);
        pipe(&guest, &mut host_in);

        let mut h = RecordingHandler::default();
        let mut g = RecordingHandler::default();
        host.do_read(&mut host_in, &mut h).unwrap();
        guest.do_read(&mut guest_in, &mut g).unwrap();

        assert!(host.have_peer_caps());
        assert!(guest.have_peer_caps());
        assert_eq!(h.hellos, ["usbredir 0.1-guest"]);
        assert_eq!(g.hellos, ["usbredir 0.1"]);
        assert_eq!(host.header_len(), HEADER_LEN_64);
        assert_eq!(guest.header_len(), HEADER_LEN_64);
    }

    #[test]
    fn second_hello_is_ignored() {
        let host = Parser::new(
            "host",
            host_caps(),
            ParserFlags {
                usb_host: true,
                ..Default::default()
            },
        );
        let guest = Parser::new("guest", host_caps(), ParserFlags::default());
        let guest2 = Parser::new("guest2", CapSet::new(), ParserFlags::default());

        let mut host_in = PipeTransport::new();
        pipe(&guest, &mut host_in);
        pipe(&guest2, &mut host_in);

        let mut h = RecordingHandler::default();
        host.do_read(&mut host_in, &mut h).unwrap();
        assert_eq!(h.hellos, ["guest"]);
        assert!(host.peer_has_cap(Cap::Ids64Bits));
    }

    #[test]
    fn skip_mode_recovers_framing() {
        let host = Parser::new(
            "host",
            CapSet::new(),
            ParserFlags {
                usb_host: true,
                no_hello: true,
                ..Default::default()
            },
        );

        let mut t = PipeTransport::new();
        // Bogus packet type with a 10 byte payload to skip.
        t.input.extend(0x7fffffffu32.to_le_bytes());
        t.input.extend(10u32.to_le_bytes());
        t.input.extend(0u32.to_le_bytes());
        t.input.extend([0xddu8; 10]);
        // Then a valid reset frame.
        t.input.extend(3u32.to_le_bytes());
        t.input.extend(0u32.to_le_bytes());
        t.input.extend(0u32.to_le_bytes());

        let mut h = RecordingHandler::default();
        assert!(matches!(
            host.do_read(&mut t, &mut h),
            Err(ReadError::Parse)
        ));
        assert_eq!(h.resets, 0);

        host.do_read(&mut t, &mut h).unwrap();
        assert_eq!(h.resets, 1);
    }

    #[test]
    fn oversized_length_rejected_at_boundary() {
        let host = Parser::new(
            "host",
            CapSet::new(),
            ParserFlags {
                usb_host: true,
                no_hello: true,
                ..Default::default()
            },
        );

        let mut t = PipeTransport::new();
        t.input.extend(100u32.to_le_bytes()); // control_packet
        t.input.extend((MAX_PACKET_SIZE + 1).to_le_bytes());
        t.input.extend(0u32.to_le_bytes());

        let mut h = RecordingHandler::default();
        assert!(matches!(
            host.do_read(&mut t, &mut h),
            Err(ReadError::Parse)
        ));
        assert_eq!(
            host.reader.lock().unwrap().to_skip,
            (MAX_PACKET_SIZE + 1) as u64
        );
    }

    #[test]
    fn control_packet_dispatch_with_payload() {
        let host = Parser::new(
            "host",
            CapSet::new(),
            ParserFlags {
                usb_host: true,
                no_hello: true,
                ..Default::default()
            },
        );

        // Guest sends control OUT (ep 0x00) with 4 bytes of data.
        let mut t = PipeTransport::new();
        t.input.extend(100u32.to_le_bytes());
        t.input.extend(14u32.to_le_bytes()); // 10 header + 4 data
        t.input.extend(42u32.to_le_bytes()); // id
        t.input.extend([
            0x00, // endpoint
            0x09, // request (SET_CONFIGURATION)
            0x00, // request_type
            0x00, // status
            0x01, 0x00, // value
            0x00, 0x00, // index
            0x04, 0x00, // length
        ]);
        t.input.extend([1, 2, 3, 4]);

        let mut h = RecordingHandler::default();
        host.do_read(&mut t, &mut h).unwrap();
        assert_eq!(h.control_packets.len(), 1);
        let (id, hdr, data) = &h.control_packets[0];
        assert_eq!(*id, 42);
        assert_eq!(hdr.length, 4);
        assert_eq!(data, &[1, 2, 3, 4]);
    }

    #[test]
    fn payload_in_wrong_direction_is_parse_error() {
        let host = Parser::new(
            "host",
            CapSet::new(),
            ParserFlags {
                usb_host: true,
                no_hello: true,
                ..Default::default()
            },
        );

        // Control packet on an IN endpoint with payload: the data travels
        // the wrong way for a command directed at the host.
        let mut t = PipeTransport::new();
        t.input.extend(100u32.to_le_bytes());
        t.input.extend(12u32.to_le_bytes());
        t.input.extend(1u32.to_le_bytes());
        t.input.extend([
            0x80, 0x06, 0x80, 0x00, 0x00, 0x01, 0x00, 0x00, 0x02, 0x00,
        ]);
        t.input.extend([0xaa, 0xbb]);

        let mut h = RecordingHandler::default();
        assert!(matches!(
            host.do_read(&mut t, &mut h),
            Err(ReadError::Parse)
        ));
        assert!(h.control_packets.is_empty());
    }

    #[test]
    fn queue_accounting() {
        let host = Parser::new(
            "host",
            CapSet::new(),
            ParserFlags {
                usb_host: true,
                no_hello: true,
                ..Default::default()
            },
        );
        assert_eq!(host.has_data_to_write(), 0);

        host.send_reset(); // guest-only direction: dropped
        assert_eq!(host.has_data_to_write(), 0);

        host.send_interface_info(&InterfaceInfoHeader::default());
        host.send_ep_info(&EpInfoHeader::default());
        assert_eq!(host.has_data_to_write(), 2);
        assert_eq!(
            host.buffered_output_size(),
            (12 + InterfaceInfoHeader::WIRE_LEN + 12 + EpInfoHeader::WIRE_LEN_BASE) as u64
        );

        let mut t = PipeTransport::new();
        host.do_write(&mut t).unwrap();
        assert_eq!(host.has_data_to_write(), 0);
        assert_eq!(host.buffered_output_size(), 0);
    }

    #[test]
    fn interface_count_boundary() {
        let host = Parser::new(
            "host",
            CapSet::new(),
            ParserFlags {
                usb_host: true,
                no_hello: true,
                ..Default::default()
            },
        );

        let mut ok = InterfaceInfoHeader::default();
        ok.interface_count = 32;
        host.send_interface_info(&ok);
        assert_eq!(host.has_data_to_write(), 1);

        let mut bad = InterfaceInfoHeader::default();
        bad.interface_count = 33;
        host.send_interface_info(&bad);
        assert_eq!(host.has_data_to_write(), 1);
    }
}

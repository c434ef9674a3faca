//! Wire protocol definitions.
//!
//! Everything on the wire is packed little-endian. The main header is
//! followed by a packet-type specific header whose size depends on the
//! negotiated capabilities and the direction of travel, followed by an
//! optional payload.

use crate::caps::EffectiveCaps;

/// Upper limit on bulk transfer payloads.
pub const MAX_BULK_TRANSFER_SIZE: u32 = 128 * 1024 * 1024;

/// Upper limit for accepted packet sizes including the type header; assumes
/// no type header is longer than 1 kB.
pub const MAX_PACKET_SIZE: u32 = 1024 + MAX_BULK_TRANSFER_SIZE;

/// Main header size when 64-bit ids are in effect.
pub const HEADER_LEN_64: usize = 16;
/// Main header size before/without the `cap_64bits_ids` handshake.
pub const HEADER_LEN_32: usize = 12;

/// Length of the version banner in a `hello` packet.
pub const HELLO_VERSION_LEN: usize = 64;

/// Maximum number of interfaces (and endpoint slots per direction).
pub const MAX_INTERFACES: usize = 32;
pub const MAX_ENDPOINTS: usize = 32;

/// Packet type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PacketType {
    Hello = 0,
    DeviceConnect = 1,
    DeviceDisconnect = 2,
    Reset = 3,
    InterfaceInfo = 4,
    EpInfo = 5,
    SetConfiguration = 6,
    GetConfiguration = 7,
    ConfigurationStatus = 8,
    SetAltSetting = 9,
    GetAltSetting = 10,
    AltSettingStatus = 11,
    StartIsoStream = 12,
    StopIsoStream = 13,
    IsoStreamStatus = 14,
    StartInterruptReceiving = 15,
    StopInterruptReceiving = 16,
    InterruptReceivingStatus = 17,
    AllocBulkStreams = 18,
    FreeBulkStreams = 19,
    BulkStreamsStatus = 20,
    CancelDataPacket = 21,
    FilterReject = 22,
    FilterFilter = 23,
    DeviceDisconnectAck = 24,
    StartBulkReceiving = 25,
    StopBulkReceiving = 26,
    BulkReceivingStatus = 27,

    ControlPacket = 100,
    BulkPacket = 101,
    IsoPacket = 102,
    InterruptPacket = 103,
    BufferedBulkPacket = 104,
}

impl PacketType {
    pub fn from_u32(v: u32) -> Option<PacketType> {
        use PacketType::*;
        Some(match v {
            0 => Hello,
            1 => DeviceConnect,
            2 => DeviceDisconnect,
            3 => Reset,
            4 => InterfaceInfo,
            5 => EpInfo,
            6 => SetConfiguration,
            7 => GetConfiguration,
            8 => ConfigurationStatus,
            9 => SetAltSetting,
            10 => GetAltSetting,
            11 => AltSettingStatus,
            12 => StartIsoStream,
            13 => StopIsoStream,
            14 => IsoStreamStatus,
            15 => StartInterruptReceiving,
            16 => StopInterruptReceiving,
            17 => InterruptReceivingStatus,
            18 => AllocBulkStreams,
            19 => FreeBulkStreams,
            20 => BulkStreamsStatus,
            21 => CancelDataPacket,
            22 => FilterReject,
            23 => FilterFilter,
            24 => DeviceDisconnectAck,
            25 => StartBulkReceiving,
            26 => StopBulkReceiving,
            27 => BulkReceivingStatus,
            100 => ControlPacket,
            101 => BulkPacket,
            102 => IsoPacket,
            103 => InterruptPacket,
            104 => BufferedBulkPacket,
            _ => return None,
        })
    }

    /// Whether this packet type may carry payload beyond its type header.
    ///
    /// Whether payload is actually allowed for a given instance also depends
    /// on the endpoint direction; that is checked during header validation.
    pub(crate) fn may_carry_payload(self) -> bool {
        use PacketType::*;
        matches!(
            self,
            Hello | FilterFilter | ControlPacket | BulkPacket | IsoPacket | InterruptPacket
                | BufferedBulkPacket
        )
    }
}

/// Transfer status codes.
///
/// Unknown status codes received from the peer are to be treated as an
/// error by consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Success = 0,
    Cancelled = 1,
    Inval = 2,
    Ioerror = 3,
    Stall = 4,
    Timeout = 5,
    Babble = 6,
}

impl Status {
    pub fn from_u8(v: u8) -> Option<Status> {
        use Status::*;
        Some(match v {
            0 => Success,
            1 => Cancelled,
            2 => Inval,
            3 => Ioerror,
            4 => Stall,
            5 => Timeout,
            6 => Babble,
            _ => return None,
        })
    }
}

/// Device speed as carried in `device_connect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Speed {
    Low = 0,
    Full = 1,
    High = 2,
    Super = 3,
    Unknown = 255,
}

/// Endpoint transfer type. The first four values match the USB spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EpType {
    Control = 0,
    Iso = 1,
    Bulk = 2,
    Interrupt = 3,
    Invalid = 255,
}

impl EpType {
    pub fn from_attributes(bm_attributes: u8) -> EpType {
        match bm_attributes & 0x03 {
            0 => EpType::Control,
            1 => EpType::Iso,
            2 => EpType::Bulk,
            3 => EpType::Interrupt,
            _ => unreachable!(),
        }
    }
}

/// Which end of the connection this codec instance speaks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Owns the physical device; receives commands, emits data and status.
    Host,
    /// Drives the remote device as if directly attached.
    Guest,
}

fn u16_at(buf: &[u8], pos: usize) -> u16 {
    u16::from_le_bytes(buf[pos..pos + 2].try_into().unwrap())
}

fn u32_at(buf: &[u8], pos: usize) -> u32 {
    u32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap())
}

/// The main wire header. The id is 32 bits wide until both sides have
/// `cap_64bits_ids`; the in-memory form is always the widest layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub ptype: u32,
    pub length: u32,
    pub id: u64,
}

impl Header {
    pub fn parse(buf: &[u8]) -> Header {
        debug_assert!(buf.len() == HEADER_LEN_32 || buf.len() == HEADER_LEN_64);
        let id = if buf.len() == HEADER_LEN_64 {
            u64::from_le_bytes(buf[8..16].try_into().unwrap())
        } else {
            u32_at(buf, 8) as u64
        };
        Header {
            ptype: u32_at(buf, 0),
            length: u32_at(buf, 4),
            id,
        }
    }

    pub fn encode(&self, wide_ids: bool, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.ptype.to_le_bytes());
        out.extend_from_slice(&self.length.to_le_bytes());
        if wide_ids {
            out.extend_from_slice(&self.id.to_le_bytes());
        } else {
            out.extend_from_slice(&(self.id as u32).to_le_bytes());
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceConnectHeader {
    pub speed: Speed,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    /// Only on the wire when `cap_connect_device_version` is mutual.
    pub device_version_bcd: u16,
}

impl DeviceConnectHeader {
    pub(crate) fn parse(buf: &[u8]) -> DeviceConnectHeader {
        DeviceConnectHeader {
            speed: match buf[0] {
                0 => Speed::Low,
                1 => Speed::Full,
                2 => Speed::High,
                3 => Speed::Super,
                _ => Speed::Unknown,
            },
            device_class: buf[1],
            device_subclass: buf[2],
            device_protocol: buf[3],
            vendor_id: u16_at(buf, 4),
            product_id: u16_at(buf, 6),
            device_version_bcd: if buf.len() >= 10 { u16_at(buf, 8) } else { 0 },
        }
    }

    pub(crate) fn encode(&self, with_version: bool, out: &mut Vec<u8>) {
        out.push(self.speed as u8);
        out.push(self.device_class);
        out.push(self.device_subclass);
        out.push(self.device_protocol);
        out.extend_from_slice(&self.vendor_id.to_le_bytes());
        out.extend_from_slice(&self.product_id.to_le_bytes());
        if with_version {
            out.extend_from_slice(&self.device_version_bcd.to_le_bytes());
        }
    }
}

#[derive(Clone)]
pub struct InterfaceInfoHeader {
    pub interface_count: u32,
    pub interface: [u8; MAX_INTERFACES],
    pub interface_class: [u8; MAX_INTERFACES],
    pub interface_subclass: [u8; MAX_INTERFACES],
    pub interface_protocol: [u8; MAX_INTERFACES],
}

impl Default for InterfaceInfoHeader {
    fn default() -> Self {
        InterfaceInfoHeader {
            interface_count: 0,
            interface: [0; MAX_INTERFACES],
            interface_class: [0; MAX_INTERFACES],
            interface_subclass: [0; MAX_INTERFACES],
            interface_protocol: [0; MAX_INTERFACES],
        }
    }
}

impl std::fmt::Debug for InterfaceInfoHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let n = self.interface_count.min(MAX_INTERFACES as u32) as usize;
        f.debug_struct("InterfaceInfoHeader")
            .field("interface_count", &self.interface_count)
            .field("interface", &&self.interface[..n])
            .field("interface_class", &&self.interface_class[..n])
            .finish()
    }
}

impl InterfaceInfoHeader {
    pub(crate) const WIRE_LEN: usize = 4 + 4 * MAX_INTERFACES;

    pub(crate) fn parse(buf: &[u8]) -> InterfaceInfoHeader {
        let mut hdr = InterfaceInfoHeader {
            interface_count: u32_at(buf, 0),
            ..Default::default()
        };
        hdr.interface.copy_from_slice(&buf[4..36]);
        hdr.interface_class.copy_from_slice(&buf[36..68]);
        hdr.interface_subclass.copy_from_slice(&buf[68..100]);
        hdr.interface_protocol.copy_from_slice(&buf[100..132]);
        hdr
    }

    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.interface_count.to_le_bytes());
        out.extend_from_slice(&self.interface);
        out.extend_from_slice(&self.interface_class);
        out.extend_from_slice(&self.interface_subclass);
        out.extend_from_slice(&self.interface_protocol);
    }
}

#[derive(Clone)]
pub struct EpInfoHeader {
    pub ep_type: [u8; MAX_ENDPOINTS],
    pub interval: [u8; MAX_ENDPOINTS],
    pub interface: [u8; MAX_ENDPOINTS],
    /// Only on the wire with `cap_ep_info_max_packet_size`.
    pub max_packet_size: [u16; MAX_ENDPOINTS],
    /// Only on the wire with `cap_bulk_streams`.
    pub max_streams: [u32; MAX_ENDPOINTS],
}

impl Default for EpInfoHeader {
    fn default() -> Self {
        EpInfoHeader {
            ep_type: [EpType::Invalid as u8; MAX_ENDPOINTS],
            interval: [0; MAX_ENDPOINTS],
            interface: [0; MAX_ENDPOINTS],
            max_packet_size: [0; MAX_ENDPOINTS],
            max_streams: [0; MAX_ENDPOINTS],
        }
    }
}

impl std::fmt::Debug for EpInfoHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpInfoHeader")
            .field("ep_type", &self.ep_type)
            .finish()
    }
}

impl EpInfoHeader {
    pub(crate) const WIRE_LEN_BASE: usize = 3 * MAX_ENDPOINTS;
    pub(crate) const WIRE_LEN_PKTSZ: usize = Self::WIRE_LEN_BASE + 2 * MAX_ENDPOINTS;
    pub(crate) const WIRE_LEN_STREAMS: usize = Self::WIRE_LEN_PKTSZ + 4 * MAX_ENDPOINTS;

    pub(crate) fn parse(buf: &[u8]) -> EpInfoHeader {
        let mut hdr = EpInfoHeader::default();
        hdr.ep_type.copy_from_slice(&buf[0..32]);
        hdr.interval.copy_from_slice(&buf[32..64]);
        hdr.interface.copy_from_slice(&buf[64..96]);
        if buf.len() >= Self::WIRE_LEN_PKTSZ {
            for i in 0..MAX_ENDPOINTS {
                hdr.max_packet_size[i] = u16_at(buf, 96 + 2 * i);
            }
        }
        if buf.len() >= Self::WIRE_LEN_STREAMS {
            for i in 0..MAX_ENDPOINTS {
                hdr.max_streams[i] = u32_at(buf, 160 + 4 * i);
            }
        }
        hdr
    }

    pub(crate) fn encode(&self, wire_len: usize, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.ep_type);
        out.extend_from_slice(&self.interval);
        out.extend_from_slice(&self.interface);
        if wire_len >= Self::WIRE_LEN_PKTSZ {
            for v in self.max_packet_size {
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
        if wire_len >= Self::WIRE_LEN_STREAMS {
            for v in self.max_streams {
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetConfigurationHeader {
    pub configuration: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigurationStatusHeader {
    pub status: u8,
    pub configuration: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetAltSettingHeader {
    pub interface: u8,
    pub alt: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetAltSettingHeader {
    pub interface: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AltSettingStatusHeader {
    pub status: u8,
    pub interface: u8,
    pub alt: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartIsoStreamHeader {
    pub endpoint: u8,
    pub pkts_per_urb: u8,
    pub no_urbs: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopIsoStreamHeader {
    pub endpoint: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsoStreamStatusHeader {
    pub status: u8,
    pub endpoint: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartInterruptReceivingHeader {
    pub endpoint: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopInterruptReceivingHeader {
    pub endpoint: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptReceivingStatusHeader {
    pub status: u8,
    pub endpoint: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocBulkStreamsHeader {
    /// Bitmask of endpoint slots to allocate streams on.
    pub endpoints: u32,
    pub no_streams: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeBulkStreamsHeader {
    pub endpoints: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkStreamsStatusHeader {
    pub endpoints: u32,
    pub no_streams: u32,
    pub status: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartBulkReceivingHeader {
    pub stream_id: u32,
    pub bytes_per_transfer: u32,
    pub endpoint: u8,
    pub no_transfers: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopBulkReceivingHeader {
    pub stream_id: u32,
    pub endpoint: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkReceivingStatusHeader {
    pub stream_id: u32,
    pub endpoint: u8,
    pub status: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlPacketHeader {
    pub endpoint: u8,
    pub request: u8,
    pub request_type: u8,
    pub status: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkPacketHeader {
    pub endpoint: u8,
    pub status: u8,
    pub length: u16,
    pub stream_id: u32,
    /// High 16 bits of the length; only on the wire with
    /// `cap_32bits_bulk_length`.
    pub length_high: u16,
}

impl BulkPacketHeader {
    pub fn total_length(&self) -> u32 {
        ((self.length_high as u32) << 16) | self.length as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsoPacketHeader {
    pub endpoint: u8,
    pub status: u8,
    pub length: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptPacketHeader {
    pub endpoint: u8,
    pub status: u8,
    pub length: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferedBulkPacketHeader {
    pub stream_id: u32,
    pub length: u32,
    pub endpoint: u8,
    pub status: u8,
}

/// Compute the on-wire type header length for a packet travelling towards
/// `for_host` (true when the packet is a command directed at the device
/// side). Returns `None` when the type may not travel in that direction.
pub(crate) fn type_header_len(
    ptype: PacketType,
    for_host: bool,
    caps: EffectiveCaps,
) -> Option<usize> {
    use PacketType::*;
    let host_only = |len| if for_host { Some(len) } else { None };
    let guest_only = |len| if for_host { None } else { Some(len) };

    match ptype {
        Hello => Some(HELLO_VERSION_LEN),
        DeviceConnect => guest_only(if caps.connect_device_version { 10 } else { 8 }),
        DeviceDisconnect => guest_only(0),
        Reset => host_only(0),
        InterfaceInfo => guest_only(InterfaceInfoHeader::WIRE_LEN),
        EpInfo => guest_only(if caps.bulk_streams {
            EpInfoHeader::WIRE_LEN_STREAMS
        } else if caps.ep_info_max_packet_size {
            EpInfoHeader::WIRE_LEN_PKTSZ
        } else {
            EpInfoHeader::WIRE_LEN_BASE
        }),
        SetConfiguration => host_only(1),
        GetConfiguration => host_only(0),
        ConfigurationStatus => guest_only(2),
        SetAltSetting => host_only(2),
        GetAltSetting => host_only(1),
        AltSettingStatus => guest_only(3),
        StartIsoStream => host_only(3),
        StopIsoStream => host_only(1),
        IsoStreamStatus => guest_only(2),
        StartInterruptReceiving => host_only(1),
        StopInterruptReceiving => host_only(1),
        InterruptReceivingStatus => guest_only(2),
        AllocBulkStreams => host_only(8),
        FreeBulkStreams => host_only(4),
        BulkStreamsStatus => guest_only(9),
        CancelDataPacket => host_only(0),
        FilterReject => host_only(0),
        FilterFilter => Some(0),
        DeviceDisconnectAck => host_only(0),
        StartBulkReceiving => host_only(10),
        StopBulkReceiving => host_only(5),
        BulkReceivingStatus => guest_only(6),
        ControlPacket => Some(10),
        BulkPacket => Some(if caps.bulk_length_32 { 10 } else { 8 }),
        IsoPacket => Some(4),
        InterruptPacket => Some(4),
        BufferedBulkPacket => guest_only(10),
    }
}

/// A parsed type header, the widest in-memory layout of every variant.
#[derive(Debug, Clone)]
pub(crate) enum TypeHeader {
    Hello { version: [u8; HELLO_VERSION_LEN] },
    DeviceConnect(DeviceConnectHeader),
    DeviceDisconnect,
    Reset,
    InterfaceInfo(Box<InterfaceInfoHeader>),
    EpInfo(Box<EpInfoHeader>),
    SetConfiguration(SetConfigurationHeader),
    GetConfiguration,
    ConfigurationStatus(ConfigurationStatusHeader),
    SetAltSetting(SetAltSettingHeader),
    GetAltSetting(GetAltSettingHeader),
    AltSettingStatus(AltSettingStatusHeader),
    StartIsoStream(StartIsoStreamHeader),
    StopIsoStream(StopIsoStreamHeader),
    IsoStreamStatus(IsoStreamStatusHeader),
    StartInterruptReceiving(StartInterruptReceivingHeader),
    StopInterruptReceiving(StopInterruptReceivingHeader),
    InterruptReceivingStatus(InterruptReceivingStatusHeader),
    AllocBulkStreams(AllocBulkStreamsHeader),
    FreeBulkStreams(FreeBulkStreamsHeader),
    BulkStreamsStatus(BulkStreamsStatusHeader),
    CancelDataPacket,
    FilterReject,
    FilterFilter,
    DeviceDisconnectAck,
    StartBulkReceiving(StartBulkReceivingHeader),
    StopBulkReceiving(StopBulkReceivingHeader),
    BulkReceivingStatus(BulkReceivingStatusHeader),
    ControlPacket(ControlPacketHeader),
    BulkPacket(BulkPacketHeader),
    IsoPacket(IsoPacketHeader),
    InterruptPacket(InterruptPacketHeader),
    BufferedBulkPacket(BufferedBulkPacketHeader),
}

impl TypeHeader {
    /// Decode the raw type header bytes; `buf` has exactly the length
    /// previously computed by [`type_header_len`].
    pub(crate) fn parse(ptype: PacketType, buf: &[u8]) -> TypeHeader {
        use PacketType::*;
        match ptype {
            Hello => {
                let mut version = [0u8; HELLO_VERSION_LEN];
                version.copy_from_slice(buf);
                TypeHeader::Hello { version }
            }
            DeviceConnect => TypeHeader::DeviceConnect(DeviceConnectHeader::parse(buf)),
            DeviceDisconnect => TypeHeader::DeviceDisconnect,
            Reset => TypeHeader::Reset,
            InterfaceInfo => {
                TypeHeader::InterfaceInfo(Box::new(InterfaceInfoHeader::parse(buf)))
            }
            EpInfo => TypeHeader::EpInfo(Box::new(EpInfoHeader::parse(buf))),
            SetConfiguration => TypeHeader::SetConfiguration(SetConfigurationHeader {
                configuration: buf[0],
            }),
            GetConfiguration => TypeHeader::GetConfiguration,
            ConfigurationStatus => TypeHeader::ConfigurationStatus(ConfigurationStatusHeader {
                status: buf[0],
                configuration: buf[1],
            }),
            SetAltSetting => TypeHeader::SetAltSetting(SetAltSettingHeader {
                interface: buf[0],
                alt: buf[1],
            }),
            GetAltSetting => TypeHeader::GetAltSetting(GetAltSettingHeader { interface: buf[0] }),
            AltSettingStatus => TypeHeader::AltSettingStatus(AltSettingStatusHeader {
                status: buf[0],
                interface: buf[1],
                alt: buf[2],
            }),
            StartIsoStream => TypeHeader::StartIsoStream(StartIsoStreamHeader {
                endpoint: buf[0],
                pkts_per_urb: buf[1],
                no_urbs: buf[2],
            }),
            StopIsoStream => TypeHeader::StopIsoStream(StopIsoStreamHeader { endpoint: buf[0] }),
            IsoStreamStatus => TypeHeader::IsoStreamStatus(IsoStreamStatusHeader {
                status: buf[0],
                endpoint: buf[1],
            }),
            StartInterruptReceiving => {
                TypeHeader::StartInterruptReceiving(StartInterruptReceivingHeader {
                    endpoint: buf[0],
                })
            }
            StopInterruptReceiving => {
                TypeHeader::StopInterruptReceiving(StopInterruptReceivingHeader {
                    endpoint: buf[0],
                })
            }
            InterruptReceivingStatus => {
                TypeHeader::InterruptReceivingStatus(InterruptReceivingStatusHeader {
                    status: buf[0],
                    endpoint: buf[1],
                })
            }
            AllocBulkStreams => TypeHeader::AllocBulkStreams(AllocBulkStreamsHeader {
                endpoints: u32_at(buf, 0),
                no_streams: u32_at(buf, 4),
            }),
            FreeBulkStreams => TypeHeader::FreeBulkStreams(FreeBulkStreamsHeader {
                endpoints: u32_at(buf, 0),
            }),
            BulkStreamsStatus => TypeHeader::BulkStreamsStatus(BulkStreamsStatusHeader {
                endpoints: u32_at(buf, 0),
                no_streams: u32_at(buf, 4),
                status: buf[8],
            }),
            CancelDataPacket => TypeHeader::CancelDataPacket,
            FilterReject => TypeHeader::FilterReject,
            FilterFilter => TypeHeader::FilterFilter,
            DeviceDisconnectAck => TypeHeader::DeviceDisconnectAck,
            StartBulkReceiving => TypeHeader::StartBulkReceiving(StartBulkReceivingHeader {
                stream_id: u32_at(buf, 0),
                bytes_per_transfer: u32_at(buf, 4),
                endpoint: buf[8],
                no_transfers: buf[9],
            }),
            StopBulkReceiving => TypeHeader::StopBulkReceiving(StopBulkReceivingHeader {
                stream_id: u32_at(buf, 0),
                endpoint: buf[4],
            }),
            BulkReceivingStatus => TypeHeader::BulkReceivingStatus(BulkReceivingStatusHeader {
                stream_id: u32_at(buf, 0),
                endpoint: buf[4],
                status: buf[5],
            }),
            ControlPacket => TypeHeader::ControlPacket(ControlPacketHeader {
                endpoint: buf[0],
                request: buf[1],
                request_type: buf[2],
                status: buf[3],
                value: u16_at(buf, 4),
                index: u16_at(buf, 6),
                length: u16_at(buf, 8),
            }),
            BulkPacket => TypeHeader::BulkPacket(BulkPacketHeader {
                endpoint: buf[0],
                status: buf[1],
                length: u16_at(buf, 2),
                stream_id: u32_at(buf, 4),
                length_high: if buf.len() >= 10 { u16_at(buf, 8) } else { 0 },
            }),
            IsoPacket => TypeHeader::IsoPacket(IsoPacketHeader {
                endpoint: buf[0],
                status: buf[1],
                length: u16_at(buf, 2),
            }),
            InterruptPacket => TypeHeader::InterruptPacket(InterruptPacketHeader {
                endpoint: buf[0],
                status: buf[1],
                length: u16_at(buf, 2),
            }),
            BufferedBulkPacket => TypeHeader::BufferedBulkPacket(BufferedBulkPacketHeader {
                stream_id: u32_at(buf, 0),
                length: u32_at(buf, 4),
                endpoint: buf[8],
                status: buf[9],
            }),
        }
    }

    /// Serialize into `out`, producing exactly `type_header_len` bytes for
    /// the given capabilities and direction.
    pub(crate) fn encode(&self, caps: EffectiveCaps, out: &mut Vec<u8>) {
        match self {
            TypeHeader::Hello { version } => out.extend_from_slice(version),
            TypeHeader::DeviceConnect(h) => h.encode(caps.connect_device_version, out),
            TypeHeader::DeviceDisconnect
            | TypeHeader::Reset
            | TypeHeader::GetConfiguration
            | TypeHeader::CancelDataPacket
            | TypeHeader::FilterReject
            | TypeHeader::FilterFilter
            | TypeHeader::DeviceDisconnectAck => {}
            TypeHeader::InterfaceInfo(h) => h.encode(out),
            TypeHeader::EpInfo(h) => {
                let len = if caps.bulk_streams {
                    EpInfoHeader::WIRE_LEN_STREAMS
                } else if caps.ep_info_max_packet_size {
                    EpInfoHeader::WIRE_LEN_PKTSZ
                } else {
                    EpInfoHeader::WIRE_LEN_BASE
                };
                h.encode(len, out);
            }
            TypeHeader::SetConfiguration(h) => out.push(h.configuration),
            TypeHeader::ConfigurationStatus(h) => {
                out.push(h.status);
                out.push(h.configuration);
            }
            TypeHeader::SetAltSetting(h) => {
                out.push(h.interface);
                out.push(h.alt);
            }
            TypeHeader::GetAltSetting(h) => out.push(h.interface),
            TypeHeader::AltSettingStatus(h) => {
                out.push(h.status);
                out.push(h.interface);
                out.push(h.alt);
            }
            TypeHeader::StartIsoStream(h) => {
                out.push(h.endpoint);
                out.push(h.pkts_per_urb);
                out.push(h.no_urbs);
            }
            TypeHeader::StopIsoStream(h) => out.push(h.endpoint),
            TypeHeader::IsoStreamStatus(h) => {
                out.push(h.status);
                out.push(h.endpoint);
            }
            TypeHeader::StartInterruptReceiving(h) => out.push(h.endpoint),
            TypeHeader::StopInterruptReceiving(h) => out.push(h.endpoint),
            TypeHeader::InterruptReceivingStatus(h) => {
                out.push(h.status);
                out.push(h.endpoint);
            }
            TypeHeader::AllocBulkStreams(h) => {
                out.extend_from_slice(&h.endpoints.to_le_bytes());
                out.extend_from_slice(&h.no_streams.to_le_bytes());
            }
            TypeHeader::FreeBulkStreams(h) => out.extend_from_slice(&h.endpoints.to_le_bytes()),
            TypeHeader::BulkStreamsStatus(h) => {
                out.extend_from_slice(&h.endpoints.to_le_bytes());
                out.extend_from_slice(&h.no_streams.to_le_bytes());
                out.push(h.status);
            }
            TypeHeader::StartBulkReceiving(h) => {
                out.extend_from_slice(&h.stream_id.to_le_bytes());
                out.extend_from_slice(&h.bytes_per_transfer.to_le_bytes());
                out.push(h.endpoint);
                out.push(h.no_transfers);
            }
            TypeHeader::StopBulkReceiving(h) => {
                out.extend_from_slice(&h.stream_id.to_le_bytes());
                out.push(h.endpoint);
            }
            TypeHeader::BulkReceivingStatus(h) => {
                out.extend_from_slice(&h.stream_id.to_le_bytes());
                out.push(h.endpoint);
                out.push(h.status);
            }
            TypeHeader::ControlPacket(h) => {
                out.push(h.endpoint);
                out.push(h.request);
                out.push(h.request_type);
                out.push(h.status);
                out.extend_from_slice(&h.value.to_le_bytes());
                out.extend_from_slice(&h.index.to_le_bytes());
                out.extend_from_slice(&h.length.to_le_bytes());
            }
            TypeHeader::BulkPacket(h) => {
                out.push(h.endpoint);
                out.push(h.status);
                out.extend_from_slice(&h.length.to_le_bytes());
                out.extend_from_slice(&h.stream_id.to_le_bytes());
                if caps.bulk_length_32 {
                    out.extend_from_slice(&h.length_high.to_le_bytes());
                }
            }
            TypeHeader::IsoPacket(h) => {
                out.push(h.endpoint);
                out.push(h.status);
                out.extend_from_slice(&h.length.to_le_bytes());
            }
            TypeHeader::InterruptPacket(h) => {
                out.push(h.endpoint);
                out.push(h.status);
                out.extend_from_slice(&h.length.to_le_bytes());
            }
            TypeHeader::BufferedBulkPacket(h) => {
                out.extend_from_slice(&h.stream_id.to_le_bytes());
                out.extend_from_slice(&h.length.to_le_bytes());
                out.push(h.endpoint);
                out.push(h.status);
            }
        }
    }
}

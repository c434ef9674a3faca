//! Abstract native-USB surface consumed by the device-side engine.
//!
//! The engine does not talk to an OS USB stack directly; it drives a
//! [`UsbBackend`], which an application implements on top of whatever
//! asynchronous USB primitives it has. Transfers are submitted with an
//! engine-chosen token and complete through [`UsbBackend::poll_completions`]
//! or whatever event loop the application wires to
//! [`crate::Host::handle_completion`].

use std::fmt::Display;
use std::time::Duration;

use crate::descriptors::DeviceDescriptor;
use crate::proto::Speed;

/// Engine-chosen key identifying a submitted transfer.
pub type TransferToken = usize;

/// Error from backend control-plane calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendError {
    /// The device is gone.
    NoDevice,
    /// Device or interface is in use by another driver or application.
    Busy,
    /// Requested entity not found.
    NotFound,
    /// Operation not supported by the platform or driver.
    NotSupported,
    /// Invalid argument.
    InvalidParam,
    /// Request timed out.
    Timeout,
    /// Out of memory.
    NoMem,
    /// I/O error.
    Io,
    /// Anything else.
    Other,
}

impl Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BackendError::NoDevice => "no device",
            BackendError::Busy => "resource busy",
            BackendError::NotFound => "not found",
            BackendError::NotSupported => "not supported",
            BackendError::InvalidParam => "invalid parameter",
            BackendError::Timeout => "timed out",
            BackendError::NoMem => "out of memory",
            BackendError::Io => "input/output error",
            BackendError::Other => "backend error",
        };
        f.write_str(s)
    }
}

impl std::error::Error for BackendError {}

/// Final status of a submitted transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    /// Hardware or protocol error.
    Error,
    TimedOut,
    Cancelled,
    /// Endpoint halted.
    Stall,
    /// The device is gone.
    NoDevice,
    /// The device sent more data than the endpoint permits.
    Overflow,
}

/// The first 8 bytes of a control transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

/// Kind-specific parameters of a transfer submission.
#[derive(Debug, Clone)]
pub enum TransferKind {
    Control { setup: SetupPacket },
    Bulk { stream_id: u32 },
    Interrupt,
    /// Isochronous, with per-packet lengths; packets are laid out in the
    /// buffer at fixed strides of the largest packet length.
    Iso { packet_lengths: Vec<u32> },
}

/// A transfer handed to the backend.
///
/// For OUT endpoints `buffer` holds the data to send; for IN endpoints its
/// length is the requested read size. The backend hands the buffer back in
/// the [`TransferCompletion`].
#[derive(Debug)]
pub struct TransferRequest {
    pub token: TransferToken,
    pub endpoint: u8,
    pub kind: TransferKind,
    pub buffer: Vec<u8>,
    /// Zero means no timeout.
    pub timeout: Duration,
}

/// Per-packet result of an isochronous transfer.
#[derive(Debug, Clone, Copy)]
pub struct IsoPacketStatus {
    pub status: TransferStatus,
    pub actual_len: usize,
}

/// A finished transfer, delivered to
/// [`crate::Host::handle_completion`].
#[derive(Debug)]
pub struct TransferCompletion {
    pub token: TransferToken,
    pub status: TransferStatus,
    /// The request's buffer. For iso IN transfers packet `i`'s data sits at
    /// offset `i * pkt_size` with `iso_packets[i].actual_len` valid bytes.
    pub buffer: Vec<u8>,
    pub actual_len: usize,
    /// Empty for non-isochronous transfers.
    pub iso_packets: Vec<IsoPacketStatus>,
}

/// Asynchronous USB primitives the engine drives.
///
/// All methods take `&self`: a backend handle is internally synchronized
/// the way an OS USB device handle is. The backend must never invoke
/// engine code while holding its own transfer bookkeeping locks.
pub trait UsbBackend: Send + Sync {
    fn speed(&self) -> Speed;

    fn device_descriptor(&self) -> Result<DeviceDescriptor, BackendError>;

    /// Raw descriptors of the active configuration, `None` when the device
    /// is unconfigured.
    fn active_config_descriptor(&self) -> Result<Option<Vec<u8>>, BackendError>;

    /// Raw descriptors of the configuration at `index` (not its value).
    fn config_descriptor_by_index(&self, index: u8) -> Result<Vec<u8>, BackendError>;

    fn set_configuration(&self, configuration: u8) -> Result<(), BackendError>;

    fn claim_interface(&self, number: u8) -> Result<(), BackendError>;

    fn release_interface(&self, number: u8) -> Result<(), BackendError>;

    fn set_interface_alt_setting(&self, number: u8, alt: u8) -> Result<(), BackendError>;

    fn reset_device(&self) -> Result<(), BackendError>;

    fn clear_halt(&self, endpoint: u8) -> Result<(), BackendError>;

    /// Ask the platform to detach/reattach kernel drivers automatically
    /// around claim/release. May be a no-op.
    fn set_auto_detach_kernel_driver(&self, enabled: bool);

    /// Reattach the kernel driver to one interface. May be a no-op.
    fn attach_kernel_driver(&self, number: u8) -> Result<(), BackendError>;

    /// Allocate `count` bulk streams on the given endpoints; returns how
    /// many were actually allocated.
    fn alloc_streams(&self, endpoints: &[u8], count: u32) -> Result<u32, BackendError>;

    fn free_streams(&self, endpoints: &[u8]) -> Result<(), BackendError>;

    fn submit(&self, transfer: TransferRequest) -> Result<(), BackendError>;

    /// Request cancellation of a submitted transfer. The transfer still
    /// completes (with [`TransferStatus::Cancelled`]) through the normal
    /// completion path.
    fn cancel(&self, token: TransferToken);

    /// Drive the backend event loop for at most `timeout`, handing each
    /// finished transfer to `sink`.
    fn poll_completions(&self, timeout: Duration, sink: &mut dyn FnMut(TransferCompletion));
}

/// USB request timeouts fixed by the protocol engine.
pub(crate) const CTRL_TIMEOUT: Duration = Duration::from_millis(5000);
pub(crate) const BULK_TIMEOUT: Duration = Duration::ZERO;
pub(crate) const ISO_TIMEOUT: Duration = Duration::from_millis(1000);
pub(crate) const INTERRUPT_TIMEOUT: Duration = Duration::ZERO;

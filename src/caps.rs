//! Capability negotiation.
//!
//! Each side announces a fixed-width bitmask in its `hello`; a protocol
//! extension is in effect only when both sides have its bit set.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use log::{error, warn};

/// Number of `u32` words needed to hold all known capabilities.
pub const CAPS_WORDS: usize = 1;

/// Negotiable protocol extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cap {
    /// Supports USB 3 bulk streams.
    BulkStreams = 0,
    /// `device_connect` carries the `device_version_bcd` field.
    ConnectDeviceVersion = 1,
    /// Supports `filter_reject` and `filter_filter`.
    Filter = 2,
    /// Supports the `device_disconnect_ack` packet.
    DeviceDisconnectAck = 3,
    /// `ep_info` carries the `max_packet_size` field.
    EpInfoMaxPacketSize = 4,
    /// 64-bit ids in the main header.
    Ids64Bits = 5,
    /// 32-bit length in `bulk_packet` headers.
    BulkLength32Bits = 6,
    /// Supports bulk receiving / buffered bulk input.
    BulkReceiving = 7,
}

/// A fixed-width capability bitmask.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CapSet(pub(crate) [u32; CAPS_WORDS]);

impl CapSet {
    pub fn new() -> CapSet {
        CapSet::default()
    }

    pub fn from_caps(caps: &[Cap]) -> CapSet {
        let mut set = CapSet::default();
        for &cap in caps {
            set.set(cap);
        }
        set
    }

    /// Build from raw wire words; excess words are ignored, missing words
    /// read as zero.
    pub fn from_words(words: &[u32]) -> CapSet {
        let mut set = CapSet::default();
        for (dst, src) in set.0.iter_mut().zip(words) {
            *dst = *src;
        }
        set
    }

    pub fn words(&self) -> &[u32; CAPS_WORDS] {
        &self.0
    }

    pub fn set(&mut self, cap: Cap) {
        self.0[cap as usize / 32] |= 1 << (cap as usize % 32);
    }

    pub fn clear(&mut self, cap: Cap) {
        self.0[cap as usize / 32] &= !(1 << (cap as usize % 32));
    }

    pub fn has(&self, cap: Cap) -> bool {
        self.0[cap as usize / 32] & (1 << (cap as usize % 32)) != 0
    }

    /// Sanity-check a capability set: `bulk_streams` requires
    /// `ep_info_max_packet_size`; violating sets have `bulk_streams`
    /// masked off.
    pub(crate) fn verify(&mut self, whose: &str) {
        if self.has(Cap::BulkStreams) && !self.has(Cap::EpInfoMaxPacketSize) {
            error!("{whose} caps contain cap_bulk_streams without cap_ep_info_max_packet_size");
            self.clear(Cap::BulkStreams);
        }
    }
}

/// The peer's capability set: absent until the first `hello`, immutable
/// afterwards. Written once by the reader thread, read by senders, so the
/// words are atomics rather than a lock.
#[derive(Debug, Default)]
pub(crate) struct PeerCaps {
    words: [AtomicU32; CAPS_WORDS],
    valid: AtomicBool,
}

impl PeerCaps {
    pub(crate) fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub(crate) fn get(&self) -> Option<CapSet> {
        if !self.is_valid() {
            return None;
        }
        let mut set = CapSet::default();
        for (dst, src) in set.0.iter_mut().zip(&self.words) {
            *dst = src.load(Ordering::Relaxed);
        }
        Some(set)
    }

    pub(crate) fn has(&self, cap: Cap) -> bool {
        self.is_valid()
            && self.words[cap as usize / 32].load(Ordering::Relaxed) & (1 << (cap as usize % 32))
                != 0
    }

    /// Install the peer's set. Returns false (and logs) on a second hello.
    pub(crate) fn install(&self, set: CapSet) -> bool {
        if self.is_valid() {
            warn!("received second hello message, ignoring");
            return false;
        }
        for (dst, src) in self.words.iter().zip(set.0) {
            dst.store(src, Ordering::Relaxed);
        }
        self.valid.store(true, Ordering::Release);
        true
    }
}

/// The subset of mutual capabilities that change wire layouts, captured as
/// plain bools so sizing code need not consult both sets repeatedly.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct EffectiveCaps {
    pub connect_device_version: bool,
    pub ep_info_max_packet_size: bool,
    pub bulk_streams: bool,
    pub bulk_length_32: bool,
}

impl EffectiveCaps {
    pub(crate) fn new(ours: &CapSet, peer: &PeerCaps) -> EffectiveCaps {
        Self::from_sets(ours, peer.get().as_ref())
    }

    pub(crate) fn from_sets(ours: &CapSet, peer: Option<&CapSet>) -> EffectiveCaps {
        let both = |cap| ours.has(cap) && peer.is_some_and(|p| p.has(cap));
        EffectiveCaps {
            connect_device_version: both(Cap::ConnectDeviceVersion),
            ep_info_max_packet_size: both(Cap::EpInfoMaxPacketSize),
            bulk_streams: both(Cap::BulkStreams),
            bulk_length_32: both(Cap::BulkLength32Bits),
        }
    }
}

//! Mid-stream codec state serialization.
//!
//! Captures the complete reader and write-queue state of a [`Parser`] as a
//! little-endian byte blob, and restores it into a pristine codec. This is
//! what makes live migration / connection handoff possible without dropping
//! an in-flight packet or losing queued sends.
//!
//! Blob layout (all integers little-endian):
//!
//! ```text
//! u32 magic "URP1"
//! u32 total length (including magic)
//! u32 our_caps byte length,  our_caps words
//! u32 peer_caps byte length, peer_caps words (length 0 while unknown)
//! u32 to_skip
//! u32 header bytes read,      partial main header
//! u32 type header bytes read, partial type header
//! u32 data bytes read,        partial payload
//! u32 write buffer count, then per buffer: u32 length, bytes
//! ```
//!
//! Partially written buffers are serialized as their unwritten tail.

use log::{debug, error, warn};

use crate::caps::{Cap, CapSet, EffectiveCaps, CAPS_WORDS};
use crate::parser::{Parser, Reader, WriteQueue};
use crate::proto::{
    type_header_len, Header, PacketType, Role, HEADER_LEN_32, HEADER_LEN_64, MAX_PACKET_SIZE,
};

/// `"URP1"`: UsbRedirParser state version 1.
pub const SERIALIZE_MAGIC: u32 = 0x5552_5031;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnserializeError {
    /// The blob does not start with the `URP1` magic.
    BadMagic,
    /// The target codec has queued writes or a partial frame.
    NotPristine,
    /// The recorded total length does not match the blob.
    LengthMismatch,
    /// The serializing side had a capability this codec does not have.
    CapsMismatch,
    /// Truncated, oversized or internally inconsistent state.
    Malformed,
}

impl std::fmt::Display for UnserializeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnserializeError::BadMagic => write!(f, "serialized state magic mismatch"),
            UnserializeError::NotPristine => {
                write!(f, "unserialization requires a pristine codec")
            }
            UnserializeError::LengthMismatch => write!(f, "serialized state length mismatch"),
            UnserializeError::CapsMismatch => {
                write!(f, "serialized state has capabilities this codec lacks")
            }
            UnserializeError::Malformed => write!(f, "malformed serialized state"),
        }
    }
}

impl std::error::Error for UnserializeError {}

fn push_u32(out: &mut Vec<u8>, val: u32) {
    out.extend_from_slice(&val.to_le_bytes());
}

fn push_data(out: &mut Vec<u8>, data: &[u8]) {
    push_u32(out, data.len() as u32);
    out.extend_from_slice(data);
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn u32(&mut self) -> Result<u32, UnserializeError> {
        let end = self.pos.checked_add(4).ok_or(UnserializeError::Malformed)?;
        let bytes = self
            .buf
            .get(self.pos..end)
            .ok_or(UnserializeError::Malformed)?;
        self.pos = end;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn data(&mut self) -> Result<&'a [u8], UnserializeError> {
        let len = self.u32()? as usize;
        let end = self
            .pos
            .checked_add(len)
            .ok_or(UnserializeError::Malformed)?;
        let bytes = self
            .buf
            .get(self.pos..end)
            .ok_or(UnserializeError::Malformed)?;
        self.pos = end;
        Ok(bytes)
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

fn caps_bytes(set: &CapSet) -> Vec<u8> {
    let mut out = Vec::with_capacity(CAPS_WORDS * 4);
    for word in set.words() {
        out.extend_from_slice(&word.to_le_bytes());
    }
    out
}

fn caps_from_bytes(current: &CapSet, stored: &[u8]) -> Result<CapSet, UnserializeError> {
    if stored.len() > CAPS_WORDS * 4 {
        return Err(UnserializeError::Malformed);
    }
    // A short stored set leaves the tail of the current words in place,
    // so state from an older build with fewer capability words restores.
    let mut bytes = caps_bytes(current);
    bytes[..stored.len()].copy_from_slice(stored);
    let mut words = [0u32; CAPS_WORDS];
    for (i, chunk) in bytes.chunks_exact(4).enumerate() {
        words[i] = u32::from_le_bytes(chunk.try_into().unwrap());
    }
    Ok(CapSet::from_words(&words))
}

impl Parser {
    /// Snapshot the full codec state: capabilities, skip counter, the
    /// partial inbound frame and all queued outbound buffers.
    pub fn serialize(&self) -> Vec<u8> {
        let r = self.reader.lock().unwrap();
        let q = self.queue.lock().unwrap();

        let mut out = Vec::new();
        push_u32(&mut out, SERIALIZE_MAGIC);
        push_u32(&mut out, 0); // total length, patched below

        push_data(&mut out, &caps_bytes(&self.our_caps));
        match self.peer_caps.get() {
            Some(peer) => push_data(&mut out, &caps_bytes(&peer)),
            None => push_u32(&mut out, 0),
        }

        push_u32(&mut out, r.to_skip as u32);
        push_data(&mut out, &r.header[..r.header_read]);
        push_data(&mut out, &r.type_header[..r.type_header_read]);
        push_data(&mut out, &r.data[..r.data_read]);

        push_u32(&mut out, q.bufs.len() as u32);
        for wbuf in &q.bufs {
            push_data(&mut out, &wbuf.buf[wbuf.pos..]);
        }

        let total = out.len() as u32;
        out[4..8].copy_from_slice(&total.to_le_bytes());
        debug!("serialized {} bytes of codec state", total);
        out
    }

    /// Restore a snapshot into this codec.
    ///
    /// The codec must be pristine: freshly created with `no_hello`, no
    /// queued writes, no partial frame, no established peer caps. A
    /// serializing side that lacked some of our capabilities restores with
    /// a warning; one that had capabilities we lack is rejected. On error
    /// the codec is left unchanged.
    pub fn unserialize(&mut self, blob: &[u8]) -> Result<(), UnserializeError> {
        let mut c = Cursor { buf: blob, pos: 0 };

        if c.u32()? != SERIALIZE_MAGIC {
            error!("unserialize magic mismatch");
            return Err(UnserializeError::BadMagic);
        }

        {
            let r = self.reader.lock().unwrap();
            let q = self.queue.lock().unwrap();
            if !r.is_pristine()
                || r.to_skip != 0
                || !q.bufs.is_empty()
                || q.total_size != 0
                || self.peer_caps.is_valid()
            {
                error!("unserialization must use a pristine codec");
                return Err(UnserializeError::NotPristine);
            }
        }

        if c.u32()? as usize != blob.len() {
            error!("unserialize length mismatch");
            return Err(UnserializeError::LengthMismatch);
        }

        let our_caps = caps_from_bytes(&self.our_caps, c.data()?)?;
        for (restored, ours) in our_caps.words().iter().zip(self.our_caps.words()) {
            if restored != ours {
                if restored & !ours != 0 {
                    // The serializing side had a capability we don't.
                    error!(
                        "unserialize caps mismatch ours: {:x} recv: {:x}",
                        ours, restored
                    );
                    return Err(UnserializeError::CapsMismatch);
                }
                warn!(
                    "unserialize missing some caps; ours: {:x} recv: {:x}",
                    ours, restored
                );
            }
        }

        let peer_bytes = c.data()?;
        let peer_caps = if peer_bytes.is_empty() {
            None
        } else {
            Some(caps_from_bytes(&CapSet::new(), peer_bytes)?)
        };

        // Everything below is staged and committed only on success, so a
        // failed restore leaves the codec untouched.
        let caps = EffectiveCaps::from_sets(&our_caps, peer_caps.as_ref());
        let wide_ids = {
            let both =
                |cap| our_caps.has(cap) && peer_caps.as_ref().is_some_and(|p| p.has(cap));
            both(Cap::Ids64Bits)
        };
        let header_len = if wide_ids { HEADER_LEN_64 } else { HEADER_LEN_32 };

        let mut staged = Reader::new();
        staged.to_skip = c.u32()? as u64;

        let header_bytes = c.data()?;
        if header_bytes.len() > header_len {
            return Err(UnserializeError::Malformed);
        }
        staged.header[..header_bytes.len()].copy_from_slice(header_bytes);
        staged.header_read = header_bytes.len();

        if staged.header_read == header_len {
            let header = Header::parse(&staged.header[..header_len]);
            if header.length > MAX_PACKET_SIZE {
                error!(
                    "packet length of {} larger than permitted {} bytes",
                    header.length, MAX_PACKET_SIZE
                );
                return Err(UnserializeError::Malformed);
            }
            let for_host = self.role == Role::Host;
            let thl = PacketType::from_u32(header.ptype)
                .and_then(|t| type_header_len(t, for_host, caps).map(|l| (t, l)));
            let Some((ptype, thl)) = thl else {
                error!("unserialize packet header invalid");
                return Err(UnserializeError::Malformed);
            };
            if (header.length as usize) < thl
                || (header.length as usize > thl && !ptype.may_carry_payload())
            {
                error!("unserialize packet header invalid");
                return Err(UnserializeError::Malformed);
            }
            staged.type_header_len = thl;
        }

        let type_header_bytes = c.data()?;
        if type_header_bytes.len() > staged.type_header_len {
            return Err(UnserializeError::Malformed);
        }
        staged.type_header[..type_header_bytes.len()].copy_from_slice(type_header_bytes);
        staged.type_header_read = type_header_bytes.len();

        let data_bytes = c.data()?;
        if staged.header_read == header_len && staged.type_header_read == staged.type_header_len {
            let header = Header::parse(&staged.header[..header_len]);
            let data_len = header.length as usize - staged.type_header_len;
            if data_bytes.len() > data_len {
                return Err(UnserializeError::Malformed);
            }
            staged.data = vec![0; data_len];
            staged.data[..data_bytes.len()].copy_from_slice(data_bytes);
            staged.data_read = data_bytes.len();
        } else if !data_bytes.is_empty() {
            return Err(UnserializeError::Malformed);
        }

        let mut staged_queue = WriteQueue::default();
        let count = c.u32()?;
        for i in 0..count {
            let wbuf = c.data()?;
            if wbuf.is_empty() {
                error!("write buffer {i} is empty");
                return Err(UnserializeError::Malformed);
            }
            staged_queue.push(wbuf.to_vec());
        }

        if c.remaining() != 0 {
            error!(
                "unserialize: {} bytes of extraneous state data",
                c.remaining()
            );
            return Err(UnserializeError::Malformed);
        }

        self.our_caps = our_caps;
        if let Some(peer) = peer_caps {
            self.peer_caps.install(peer);
        }
        *self.reader.lock().unwrap() = staged;
        *self.queue.lock().unwrap() = staged_queue;
        debug!("restored {} bytes of codec state", blob.len());
        Ok(())
    }
}

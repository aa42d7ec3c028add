//! Request/response protocol shared by the system servers
//!
//! Control frames travel over mailboxes. All multi-byte fields are
//! little-endian on the wire. Every server uses the same control header and
//! a closed, server-specific opcode enum; requests whose arguments do not
//! fit one frame (a name plus a mode) are split into a two-part exchange
//! reassembled by [`RequestBuffer`].
//!
//! Control header layout (8 bytes):
//!
//! ```text
//! opcode:u8 | reserved:u8 | source:u16 | seq:u16 | reserved:u16
//! ```

use noctua_core::error::{NoctuaError, NoctuaResult};
use noctua_core::fabric::Frame;
use noctua_core::node::NodeRuntime;
use noctua_core::topology::NodeId;

/// Offset of the first body byte in a control frame.
pub const CONTROL_BODY: usize = 8;

/// Common header of every control frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlHeader {
    pub opcode: u8,
    pub source: NodeId,
    pub seq: u16,
}

impl ControlHeader {
    pub fn new(opcode: u8, source: NodeId, seq: u16) -> Self {
        Self {
            opcode,
            source,
            seq,
        }
    }

    pub fn encode(&self, frame: &mut Frame) {
        frame[0] = self.opcode;
        frame[1] = 0;
        frame[2..4].copy_from_slice(&(self.source as u16).to_le_bytes());
        frame[4..6].copy_from_slice(&self.seq.to_le_bytes());
        frame[6] = 0;
        frame[7] = 0;
    }

    pub fn decode(frame: &Frame) -> Self {
        Self {
            opcode: frame[0],
            source: u16::from_le_bytes([frame[2], frame[3]]) as NodeId,
            seq: u16::from_le_bytes([frame[4], frame[5]]),
        }
    }
}

/// Sequence tag of the first half of a two-part request.
pub fn seq_first(source: NodeId) -> u16 {
    (source as u16) << 4
}

/// Sequence tag of the second half of a two-part request.
pub fn seq_second(source: NodeId) -> u16 {
    ((source as u16) << 4) | 1
}

/// Is this the second half of a two-part request?
pub fn seq_is_second(seq: u16) -> bool {
    seq & 1 != 0
}

/// Two-part request reassembly, keyed by source node.
///
/// At most one two-part request may be in flight per source. Both a slot
/// collision and a retrieval from an empty slot are protocol violations and
/// abort the server.
pub struct RequestBuffer {
    slots: Vec<Option<Frame>>,
}

impl RequestBuffer {
    pub fn new(nnodes: usize) -> Self {
        Self {
            slots: vec![None; nnodes],
        }
    }

    /// Persists the first half of a request.
    ///
    /// # Panics
    ///
    /// Panics if the source already has a half-request pending.
    pub fn put(&mut self, source: NodeId, frame: Frame) {
        assert!(
            self.slots[source].is_none(),
            "request buffer slot collision for source {source}: protocol violation"
        );
        self.slots[source] = Some(frame);
    }

    /// Retrieves the persisted first half, clearing the slot.
    ///
    /// # Panics
    ///
    /// Panics if no half-request is pending for the source.
    pub fn take(&mut self, source: NodeId) -> Frame {
        self.slots[source]
            .take()
            .unwrap_or_else(|| panic!("no pending request for source {source}: protocol desync"))
    }

    pub fn is_pending(&self, source: NodeId) -> bool {
        self.slots[source].is_some()
    }

    pub fn pending_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Drops every pending half-request (server reset).
    pub fn reset(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
    }
}

// ============================================================================
// Field codecs
// ============================================================================

pub fn put_u32(frame: &mut Frame, off: usize, value: u32) {
    frame[off..off + 4].copy_from_slice(&value.to_le_bytes());
}

pub fn get_u32(frame: &Frame, off: usize) -> u32 {
    u32::from_le_bytes(frame[off..off + 4].try_into().expect("in-bounds field"))
}

pub fn put_i32(frame: &mut Frame, off: usize, value: i32) {
    frame[off..off + 4].copy_from_slice(&value.to_le_bytes());
}

pub fn get_i32(frame: &Frame, off: usize) -> i32 {
    i32::from_le_bytes(frame[off..off + 4].try_into().expect("in-bounds field"))
}

pub fn put_u64(frame: &mut Frame, off: usize, value: u64) {
    frame[off..off + 8].copy_from_slice(&value.to_le_bytes());
}

pub fn get_u64(frame: &Frame, off: usize) -> u64 {
    u64::from_le_bytes(frame[off..off + 8].try_into().expect("in-bounds field"))
}

/// Encodes a NUL-padded name field.
pub fn put_name(frame: &mut Frame, off: usize, name: &str, max: usize) -> NoctuaResult<()> {
    let bytes = name.as_bytes();
    if name.is_empty() {
        return Err(NoctuaError::invalid("empty name"));
    }
    if bytes.len() >= max {
        return Err(NoctuaError::NameTooLong(name.to_string()));
    }
    frame[off..off + bytes.len()].copy_from_slice(bytes);
    frame[off + bytes.len()..off + max].fill(0);
    Ok(())
}

/// Decodes a NUL-padded name field.
pub fn get_name(frame: &Frame, off: usize, max: usize) -> String {
    let field = &frame[off..off + max];
    let len = field.iter().position(|&b| b == 0).unwrap_or(max);
    String::from_utf8_lossy(&field[..len]).into_owned()
}

// ============================================================================
// Frame delivery
// ============================================================================

/// Sends one control frame to `dest` through a transient output mailbox.
pub fn send_to(runtime: &NodeRuntime, dest: NodeId, frame: &Frame) -> NoctuaResult<()> {
    let outbox = runtime.mailboxes().open(dest)?;
    let result = runtime.mailboxes().write(outbox, frame);
    runtime.mailboxes().close(outbox)?;
    result.map(|_| ())
}

/// Reads one control frame from the node's input mailbox.
pub fn recv_from_inbox(runtime: &NodeRuntime) -> NoctuaResult<Frame> {
    let mut frame = [0u8; noctua_core::fabric::MAILBOX_MSG_SIZE];
    runtime.mailboxes().read(runtime.inbox(), &mut frame)?;
    Ok(frame)
}

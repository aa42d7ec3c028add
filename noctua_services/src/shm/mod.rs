//! Named shared memory regions
//!
//! Regions live on the shared memory server and are mapped into node address
//! spaces by `map`. The server keeps the global region table and one open
//! table per node; clients refer to regions through per-node open ids.
//!
//! Create, exclusive-create, and open requests carry a name and a mode, so
//! they travel as two-part requests; everything else fits one frame.

mod client;
mod server;

pub use client::ShmClient;
pub use server::ShmServer;

pub(crate) use client::send_exit;

use crate::protocol::{self, ControlHeader, CONTROL_BODY};
use noctua_core::error::{NoctuaError, NoctuaResult};
use noctua_core::fabric::{Frame, MAILBOX_MSG_SIZE};
use noctua_core::topology::NodeId;

/// Maximum number of shared memory regions.
pub const SHM_MAX: usize = 128;

/// Maximum length of a region name, including the terminator.
pub const SHM_NAME_MAX: usize = 64;

/// Maximum number of open regions per node.
pub const SHM_OPEN_MAX: usize = 8;

/// Base of the flat virtual window regions are mapped from.
pub const SHM_BASE_ADDR: u64 = 0x1000_0000;

/// Size of the virtual window reserved per region slot.
pub const SHM_MAP_WINDOW: u64 = crate::rmem::RMEM_SIZE as u64;

/// Requests understood by the shared memory server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ShmOpcode {
    Create = 1,
    CreateExcl = 2,
    Open = 3,
    Unlink = 4,
    Map = 5,
    Unmap = 6,
    Truncate = 7,
    Close = 8,
    Exit = 9,
    Reply = 10,
}

impl TryFrom<u8> for ShmOpcode {
    type Error = NoctuaError;

    fn try_from(value: u8) -> NoctuaResult<Self> {
        Ok(match value {
            1 => ShmOpcode::Create,
            2 => ShmOpcode::CreateExcl,
            3 => ShmOpcode::Open,
            4 => ShmOpcode::Unlink,
            5 => ShmOpcode::Map,
            6 => ShmOpcode::Unmap,
            7 => ShmOpcode::Truncate,
            8 => ShmOpcode::Close,
            9 => ShmOpcode::Exit,
            10 => ShmOpcode::Reply,
            _ => return Err(NoctuaError::invalid(format!("bad shm opcode {value}"))),
        })
    }
}

// Body field offsets.
const OFF_NAME: usize = CONTROL_BODY;
const OFF_MODE: usize = CONTROL_BODY;
const OFF_RW: usize = CONTROL_BODY + 4;
const OFF_TRUNC: usize = CONTROL_BODY + 5;
const OFF_OSHMID: usize = CONTROL_BODY;
const OFF_SIZE: usize = CONTROL_BODY + 8;
const OFF_MAP_OFF: usize = CONTROL_BODY + 16;
const OFF_WRITABLE: usize = CONTROL_BODY + 24;
const OFF_SHARED: usize = CONTROL_BODY + 25;
const OFF_RET: usize = CONTROL_BODY;
const OFF_MAPBLK: usize = CONTROL_BODY + 8;

/// First half of a create/open exchange: the region name.
pub fn encode_name_frame(
    opcode: ShmOpcode,
    source: NodeId,
    seq: u16,
    name: &str,
) -> NoctuaResult<Frame> {
    let mut frame = [0u8; MAILBOX_MSG_SIZE];
    ControlHeader::new(opcode as u8, source, seq).encode(&mut frame);
    protocol::put_name(&mut frame, OFF_NAME, name, SHM_NAME_MAX)?;
    Ok(frame)
}

pub fn decode_name(frame: &Frame) -> String {
    protocol::get_name(frame, OFF_NAME, SHM_NAME_MAX)
}

/// Second half of a create/open exchange: access mode and flags.
pub fn encode_attr_frame(
    opcode: ShmOpcode,
    source: NodeId,
    seq: u16,
    mode: u32,
    rw: bool,
    trunc: bool,
) -> Frame {
    let mut frame = [0u8; MAILBOX_MSG_SIZE];
    ControlHeader::new(opcode as u8, source, seq).encode(&mut frame);
    protocol::put_u32(&mut frame, OFF_MODE, mode);
    frame[OFF_RW] = rw as u8;
    frame[OFF_TRUNC] = trunc as u8;
    frame
}

pub fn decode_attr(frame: &Frame) -> (u32, bool, bool) {
    (
        protocol::get_u32(frame, OFF_MODE),
        frame[OFF_RW] != 0,
        frame[OFF_TRUNC] != 0,
    )
}

pub fn encode_map_frame(
    source: NodeId,
    oshmid: u32,
    size: u64,
    off: u64,
    writable: bool,
    shared: bool,
) -> Frame {
    let mut frame = [0u8; MAILBOX_MSG_SIZE];
    ControlHeader::new(ShmOpcode::Map as u8, source, 0).encode(&mut frame);
    protocol::put_u32(&mut frame, OFF_OSHMID, oshmid);
    protocol::put_u64(&mut frame, OFF_SIZE, size);
    protocol::put_u64(&mut frame, OFF_MAP_OFF, off);
    frame[OFF_WRITABLE] = writable as u8;
    frame[OFF_SHARED] = shared as u8;
    frame
}

pub fn decode_map(frame: &Frame) -> (u32, u64, u64, bool, bool) {
    (
        protocol::get_u32(frame, OFF_OSHMID),
        protocol::get_u64(frame, OFF_SIZE),
        protocol::get_u64(frame, OFF_MAP_OFF),
        frame[OFF_WRITABLE] != 0,
        frame[OFF_SHARED] != 0,
    )
}

pub fn encode_oshmid_frame(opcode: ShmOpcode, source: NodeId, oshmid: u32) -> Frame {
    let mut frame = [0u8; MAILBOX_MSG_SIZE];
    ControlHeader::new(opcode as u8, source, 0).encode(&mut frame);
    protocol::put_u32(&mut frame, OFF_OSHMID, oshmid);
    frame
}

pub fn encode_truncate_frame(source: NodeId, oshmid: u32, size: u64) -> Frame {
    let mut frame = [0u8; MAILBOX_MSG_SIZE];
    ControlHeader::new(ShmOpcode::Truncate as u8, source, 0).encode(&mut frame);
    protocol::put_u32(&mut frame, OFF_OSHMID, oshmid);
    protocol::put_u64(&mut frame, OFF_SIZE, size);
    frame
}

pub fn decode_truncate(frame: &Frame) -> (u32, u64) {
    (
        protocol::get_u32(frame, OFF_OSHMID),
        protocol::get_u64(frame, OFF_SIZE),
    )
}

pub fn decode_oshmid(frame: &Frame) -> u32 {
    protocol::get_u32(frame, OFF_OSHMID)
}

pub fn encode_reply(source: NodeId, ret: i32, mapblk: u64) -> Frame {
    let mut frame = [0u8; MAILBOX_MSG_SIZE];
    ControlHeader::new(ShmOpcode::Reply as u8, source, 0).encode(&mut frame);
    protocol::put_i32(&mut frame, OFF_RET, ret);
    protocol::put_u64(&mut frame, OFF_MAPBLK, mapblk);
    frame
}

pub fn decode_reply(frame: &Frame) -> (i32, u64) {
    (
        protocol::get_i32(frame, OFF_RET),
        protocol::get_u64(frame, OFF_MAPBLK),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_frame_round_trip() {
        let frame = encode_name_frame(ShmOpcode::Create, 9, 0x90, "buffer").unwrap();
        let header = ControlHeader::decode(&frame);
        assert_eq!(header.opcode, ShmOpcode::Create as u8);
        assert_eq!(header.source, 9);
        assert_eq!(decode_name(&frame), "buffer");
    }

    #[test]
    fn test_map_frame_round_trip() {
        let frame = encode_map_frame(10, 3, 4096, 512, true, false);
        assert_eq!(decode_map(&frame), (3, 4096, 512, true, false));
    }

    #[test]
    fn test_reply_round_trip() {
        let frame = encode_reply(1, -14, 0xdead_beef);
        assert_eq!(decode_reply(&frame), (-14, 0xdead_beef));
    }

    #[test]
    fn test_opcode_round_trip() {
        for raw in 1..=10u8 {
            let opcode = ShmOpcode::try_from(raw).unwrap();
            assert_eq!(opcode as u8, raw);
        }
        assert!(ShmOpcode::try_from(0).is_err());
        assert!(ShmOpcode::try_from(11).is_err());
    }
}

//! Remote memory
//!
//! A small number of dedicated nodes each export a block store of
//! [`RMEM_NUM_BLOCKS`] fixed-size blocks. Clients address pages through
//! [`RPage`] handles that pack the server index with the block number, and
//! normally go through the client-side page cache ([`RemoteCache`]) rather
//! than the raw [`RmemClient`].
//!
//! Block 0 of every server is reserved: reads and writes of unallocated
//! blocks are served fail-soft through it, with `EFAULT` in the reply.

mod cache;
mod client;
mod server;

pub use cache::{CacheConfig, CacheStats, LineInfo, RemoteCache, ReplacementPolicy, WritePolicy};
pub use client::RmemClient;
pub use server::RmemServer;

pub(crate) use client::send_exit;

use noctua_core::error::{NoctuaError, NoctuaResult};
use noctua_core::fabric::{Frame, MAILBOX_MSG_SIZE};
use noctua_core::topology::NodeId;

/// Size of a remote memory block (one page), in bytes.
pub const RMEM_BLOCK_SIZE: usize = 4096;

/// Number of blocks per remote memory server.
pub const RMEM_NUM_BLOCKS: usize = 1024;

/// Total memory exported by one server, in bytes.
pub const RMEM_SIZE: usize = RMEM_NUM_BLOCKS * RMEM_BLOCK_SIZE;

/// Payload carried by one chunked-mailbox data frame, in bytes.
pub const RMEM_PAYLOAD_SIZE: usize = 64;

/// Number of mailbox chunks needed to move one block.
pub const RMEM_CHUNKS_PER_BLOCK: usize = RMEM_BLOCK_SIZE / RMEM_PAYLOAD_SIZE;

/// Remote page handle: server index in the high byte, block number below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RPage(pub u32);

impl RPage {
    /// The null page: block 0 of server 0, never handed out.
    pub const NULL: RPage = RPage(0);

    pub fn new(server: usize, block: u32) -> Self {
        debug_assert!(server < 256 && block < (1 << 24));
        RPage(((server as u32) << 24) | block)
    }

    pub fn server(self) -> usize {
        (self.0 >> 24) as usize
    }

    pub fn block(self) -> u32 {
        self.0 & 0x00ff_ffff
    }

    pub fn is_null(self) -> bool {
        self == Self::NULL
    }

    /// The page `delta` blocks after this one, on the same server.
    pub fn offset(self, delta: u32) -> RPage {
        RPage::new(self.server(), self.block() + delta)
    }
}

/// Requests understood by a remote memory server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RmemOpcode {
    Alloc = 1,
    Free = 2,
    Read = 3,
    Write = 4,
    Exit = 5,
    Reply = 6,
}

impl TryFrom<u8> for RmemOpcode {
    type Error = NoctuaError;

    fn try_from(value: u8) -> NoctuaResult<Self> {
        Ok(match value {
            1 => RmemOpcode::Alloc,
            2 => RmemOpcode::Free,
            3 => RmemOpcode::Read,
            4 => RmemOpcode::Write,
            5 => RmemOpcode::Exit,
            6 => RmemOpcode::Reply,
            _ => {
                return Err(NoctuaError::invalid(format!(
                    "bad remote memory opcode {value}"
                )))
            }
        })
    }
}

// Frame layout (little-endian, 128 bytes reserved):
//
//   source:u16 | mailbox_port:u8 | portal_port:u8 | opcode:u8 | pad:3
//   blknum:u32 | offset:u32 | errcode:i32
//   payload:[u8; RMEM_PAYLOAD_SIZE]
const OFF_SOURCE: usize = 0;
const OFF_MAILBOX_PORT: usize = 2;
const OFF_PORTAL_PORT: usize = 3;
const OFF_OPCODE: usize = 4;
const OFF_BLKNUM: usize = 8;
const OFF_OFFSET: usize = 12;
const OFF_ERRCODE: usize = 16;
const OFF_PAYLOAD: usize = 20;

/// One remote memory request or reply frame.
#[derive(Clone, Copy)]
pub struct RmemMessage {
    pub source: NodeId,
    /// Reserved: this substrate has one mailbox port per node.
    pub mailbox_port: u8,
    /// Reserved: this substrate has one portal port per node.
    pub portal_port: u8,
    pub opcode: u8,
    pub blknum: u32,
    pub offset: u32,
    pub errcode: i32,
    pub payload: [u8; RMEM_PAYLOAD_SIZE],
}

impl RmemMessage {
    pub fn request(opcode: RmemOpcode, source: NodeId, page: RPage) -> Self {
        Self {
            source,
            mailbox_port: 0,
            portal_port: 0,
            opcode: opcode as u8,
            blknum: page.0,
            offset: 0,
            errcode: 0,
            payload: [0; RMEM_PAYLOAD_SIZE],
        }
    }

    pub fn opcode(&self) -> NoctuaResult<RmemOpcode> {
        RmemOpcode::try_from(self.opcode)
    }

    pub fn page(&self) -> RPage {
        RPage(self.blknum)
    }

    pub fn encode(&self) -> Frame {
        let mut frame = [0u8; MAILBOX_MSG_SIZE];
        frame[OFF_SOURCE..OFF_SOURCE + 2].copy_from_slice(&(self.source as u16).to_le_bytes());
        frame[OFF_MAILBOX_PORT] = self.mailbox_port;
        frame[OFF_PORTAL_PORT] = self.portal_port;
        frame[OFF_OPCODE] = self.opcode;
        frame[OFF_BLKNUM..OFF_BLKNUM + 4].copy_from_slice(&self.blknum.to_le_bytes());
        frame[OFF_OFFSET..OFF_OFFSET + 4].copy_from_slice(&self.offset.to_le_bytes());
        frame[OFF_ERRCODE..OFF_ERRCODE + 4].copy_from_slice(&self.errcode.to_le_bytes());
        frame[OFF_PAYLOAD..OFF_PAYLOAD + RMEM_PAYLOAD_SIZE].copy_from_slice(&self.payload);
        frame
    }

    pub fn decode(frame: &Frame) -> Self {
        let mut payload = [0u8; RMEM_PAYLOAD_SIZE];
        payload.copy_from_slice(&frame[OFF_PAYLOAD..OFF_PAYLOAD + RMEM_PAYLOAD_SIZE]);
        Self {
            source: u16::from_le_bytes([frame[OFF_SOURCE], frame[OFF_SOURCE + 1]]) as NodeId,
            mailbox_port: frame[OFF_MAILBOX_PORT],
            portal_port: frame[OFF_PORTAL_PORT],
            opcode: frame[OFF_OPCODE],
            blknum: u32::from_le_bytes(
                frame[OFF_BLKNUM..OFF_BLKNUM + 4].try_into().expect("field"),
            ),
            offset: u32::from_le_bytes(
                frame[OFF_OFFSET..OFF_OFFSET + 4].try_into().expect("field"),
            ),
            errcode: i32::from_le_bytes(
                frame[OFF_ERRCODE..OFF_ERRCODE + 4].try_into().expect("field"),
            ),
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_packing() {
        let page = RPage::new(3, 777);
        assert_eq!(page.server(), 3);
        assert_eq!(page.block(), 777);
        assert_eq!(page.offset(2).block(), 779);
        assert_eq!(page.offset(2).server(), 3);
        assert!(RPage::NULL.is_null());
        assert!(!page.is_null());
    }

    #[test]
    fn test_message_round_trip() {
        let mut msg = RmemMessage::request(RmemOpcode::Write, 17, RPage::new(1, 42));
        msg.offset = 256;
        msg.errcode = -14;
        msg.payload[0] = 0xAB;
        msg.payload[RMEM_PAYLOAD_SIZE - 1] = 0xCD;

        let decoded = RmemMessage::decode(&msg.encode());
        assert_eq!(decoded.source, 17);
        assert_eq!(decoded.opcode().unwrap(), RmemOpcode::Write);
        assert_eq!(decoded.page(), RPage::new(1, 42));
        assert_eq!(decoded.offset, 256);
        assert_eq!(decoded.errcode, -14);
        assert_eq!(decoded.payload[0], 0xAB);
        assert_eq!(decoded.payload[RMEM_PAYLOAD_SIZE - 1], 0xCD);
    }

    #[test]
    fn test_geometry_is_chunkable() {
        assert_eq!(RMEM_BLOCK_SIZE % RMEM_PAYLOAD_SIZE, 0);
        assert_eq!(
            RMEM_NUM_BLOCKS % noctua_core::bitmap::BITMAP_WORD_LENGTH,
            0
        );
    }
}

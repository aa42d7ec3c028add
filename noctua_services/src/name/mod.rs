//! Name service
//!
//! A flat mapping between node ids and process names, kept on the name
//! server node. One name per node, one node per name. Requests fit a single
//! frame.

mod client;
mod server;

pub use client::NameClient;
pub use server::NameServer;

pub(crate) use client::send_exit;

use crate::protocol::{self, ControlHeader, CONTROL_BODY};
use noctua_core::error::{NoctuaError, NoctuaResult};
use noctua_core::fabric::{Frame, MAILBOX_MSG_SIZE};
use noctua_core::topology::NodeId;

/// Maximum length of a process name, including the terminator.
pub const PROC_NAME_MAX: usize = 64;

/// Requests understood by the name server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NameOpcode {
    Link = 1,
    Lookup = 2,
    Unlink = 3,
    Exit = 4,
    Reply = 5,
}

impl TryFrom<u8> for NameOpcode {
    type Error = NoctuaError;

    fn try_from(value: u8) -> NoctuaResult<Self> {
        Ok(match value {
            1 => NameOpcode::Link,
            2 => NameOpcode::Lookup,
            3 => NameOpcode::Unlink,
            4 => NameOpcode::Exit,
            5 => NameOpcode::Reply,
            _ => return Err(NoctuaError::invalid(format!("bad name opcode {value}"))),
        })
    }
}

// Body field offsets.
const OFF_NAME: usize = CONTROL_BODY;
const OFF_NODE: usize = CONTROL_BODY + PROC_NAME_MAX;
const OFF_RET: usize = CONTROL_BODY;
const OFF_REPLY_NODE: usize = CONTROL_BODY + 4;

pub fn encode_link_frame(source: NodeId, node: NodeId, name: &str) -> NoctuaResult<Frame> {
    let mut frame = [0u8; MAILBOX_MSG_SIZE];
    ControlHeader::new(NameOpcode::Link as u8, source, 0).encode(&mut frame);
    protocol::put_name(&mut frame, OFF_NAME, name, PROC_NAME_MAX)?;
    protocol::put_u32(&mut frame, OFF_NODE, node as u32);
    Ok(frame)
}

pub fn decode_link(frame: &Frame) -> (String, NodeId) {
    (
        protocol::get_name(frame, OFF_NAME, PROC_NAME_MAX),
        protocol::get_u32(frame, OFF_NODE) as NodeId,
    )
}

pub fn encode_name_frame(opcode: NameOpcode, source: NodeId, name: &str) -> NoctuaResult<Frame> {
    let mut frame = [0u8; MAILBOX_MSG_SIZE];
    ControlHeader::new(opcode as u8, source, 0).encode(&mut frame);
    protocol::put_name(&mut frame, OFF_NAME, name, PROC_NAME_MAX)?;
    Ok(frame)
}

pub fn decode_name(frame: &Frame) -> String {
    protocol::get_name(frame, OFF_NAME, PROC_NAME_MAX)
}

pub fn encode_reply(source: NodeId, ret: i32, node: NodeId) -> Frame {
    let mut frame = [0u8; MAILBOX_MSG_SIZE];
    ControlHeader::new(NameOpcode::Reply as u8, source, 0).encode(&mut frame);
    protocol::put_i32(&mut frame, OFF_RET, ret);
    protocol::put_u32(&mut frame, OFF_REPLY_NODE, node as u32);
    frame
}

pub fn decode_reply(frame: &Frame) -> (i32, NodeId) {
    (
        protocol::get_i32(frame, OFF_RET),
        protocol::get_u32(frame, OFF_REPLY_NODE) as NodeId,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_frame_round_trip() {
        let frame = encode_link_frame(0, 9, "worker-a").unwrap();
        assert_eq!(decode_link(&frame), ("worker-a".to_string(), 9));
    }

    #[test]
    fn test_reply_round_trip() {
        let frame = encode_reply(0, 0, 17);
        assert_eq!(decode_reply(&frame), (0, 17));
    }
}

//! Named message queues
//!
//! Priority-ordered, fixed-capacity queues hosted on the message queue
//! server. Control requests travel on mailboxes; message payloads move over
//! portals in a three-phase exchange (request, permission, transfer).
//!
//! A send to a full queue and a receive from an empty queue both return
//! `Again`: the server never blocks on behalf of a client.

mod client;
mod server;

pub use client::MqueueClient;
pub use server::MqueueServer;

pub(crate) use client::send_exit;

use crate::protocol::{self, ControlHeader, CONTROL_BODY};
use noctua_core::error::{NoctuaError, NoctuaResult};
use noctua_core::fabric::{Frame, MAILBOX_MSG_SIZE};
use noctua_core::topology::NodeId;

/// Maximum number of message queues.
pub const MQUEUE_MAX: usize = 64;

/// Maximum length of a queue name, including the terminator.
pub const MQUEUE_NAME_MAX: usize = 64;

/// Maximum message payload, in bytes.
pub const MQUEUE_MESSAGE_SIZE: usize = 1024;

/// Maximum number of stored messages per queue.
pub const MQUEUE_MESSAGE_MAX: usize = 32;

/// Priorities range over `0..MQUEUE_PRIO_MAX`.
pub const MQUEUE_PRIO_MAX: u32 = 32;

/// Requests understood by the message queue server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MqueueOpcode {
    Create = 1,
    CreateExcl = 2,
    Open = 3,
    Close = 4,
    Unlink = 5,
    Send = 6,
    Receive = 7,
    Exit = 8,
    Reply = 9,
}

impl TryFrom<u8> for MqueueOpcode {
    type Error = NoctuaError;

    fn try_from(value: u8) -> NoctuaResult<Self> {
        Ok(match value {
            1 => MqueueOpcode::Create,
            2 => MqueueOpcode::CreateExcl,
            3 => MqueueOpcode::Open,
            4 => MqueueOpcode::Close,
            5 => MqueueOpcode::Unlink,
            6 => MqueueOpcode::Send,
            7 => MqueueOpcode::Receive,
            8 => MqueueOpcode::Exit,
            9 => MqueueOpcode::Reply,
            _ => {
                return Err(NoctuaError::invalid(format!(
                    "bad message queue opcode {value}"
                )))
            }
        })
    }
}

// Body field offsets.
const OFF_NAME: usize = CONTROL_BODY;
const OFF_READ: usize = CONTROL_BODY + MQUEUE_NAME_MAX;
const OFF_WRITE: usize = CONTROL_BODY + MQUEUE_NAME_MAX + 1;
const OFF_MODE: usize = CONTROL_BODY;
const OFF_MQUEUEID: usize = CONTROL_BODY;
const OFF_LEN: usize = CONTROL_BODY + 4;
const OFF_PRIO: usize = CONTROL_BODY + 8;
const OFF_RET: usize = CONTROL_BODY;

/// First half of a create exchange, or a whole unlink request.
pub fn encode_name_frame(
    opcode: MqueueOpcode,
    source: NodeId,
    seq: u16,
    name: &str,
) -> NoctuaResult<Frame> {
    let mut frame = [0u8; MAILBOX_MSG_SIZE];
    ControlHeader::new(opcode as u8, source, seq).encode(&mut frame);
    protocol::put_name(&mut frame, OFF_NAME, name, MQUEUE_NAME_MAX)?;
    Ok(frame)
}

pub fn decode_name(frame: &Frame) -> String {
    protocol::get_name(frame, OFF_NAME, MQUEUE_NAME_MAX)
}

/// Second half of a create exchange: the queue mode.
pub fn encode_attr_frame(opcode: MqueueOpcode, source: NodeId, seq: u16, mode: u32) -> Frame {
    let mut frame = [0u8; MAILBOX_MSG_SIZE];
    ControlHeader::new(opcode as u8, source, seq).encode(&mut frame);
    protocol::put_u32(&mut frame, OFF_MODE, mode);
    frame
}

pub fn decode_attr(frame: &Frame) -> u32 {
    protocol::get_u32(frame, OFF_MODE)
}

/// Open request: name plus access flags, one frame.
pub fn encode_open_frame(source: NodeId, name: &str, read: bool, write: bool) -> NoctuaResult<Frame> {
    let mut frame = [0u8; MAILBOX_MSG_SIZE];
    ControlHeader::new(MqueueOpcode::Open as u8, source, 0).encode(&mut frame);
    protocol::put_name(&mut frame, OFF_NAME, name, MQUEUE_NAME_MAX)?;
    frame[OFF_READ] = read as u8;
    frame[OFF_WRITE] = write as u8;
    Ok(frame)
}

pub fn decode_open(frame: &Frame) -> (String, bool, bool) {
    (
        decode_name(frame),
        frame[OFF_READ] != 0,
        frame[OFF_WRITE] != 0,
    )
}

pub fn encode_mqueueid_frame(opcode: MqueueOpcode, source: NodeId, mqueueid: u32) -> Frame {
    let mut frame = [0u8; MAILBOX_MSG_SIZE];
    ControlHeader::new(opcode as u8, source, 0).encode(&mut frame);
    protocol::put_u32(&mut frame, OFF_MQUEUEID, mqueueid);
    frame
}

pub fn decode_mqueueid(frame: &Frame) -> u32 {
    protocol::get_u32(frame, OFF_MQUEUEID)
}

/// Send request: queue id, payload length, and priority.
pub fn encode_send_frame(source: NodeId, mqueueid: u32, len: u32, prio: u32) -> Frame {
    let mut frame = [0u8; MAILBOX_MSG_SIZE];
    ControlHeader::new(MqueueOpcode::Send as u8, source, 0).encode(&mut frame);
    protocol::put_u32(&mut frame, OFF_MQUEUEID, mqueueid);
    protocol::put_u32(&mut frame, OFF_LEN, len);
    protocol::put_u32(&mut frame, OFF_PRIO, prio);
    frame
}

pub fn decode_send(frame: &Frame) -> (u32, u32, u32) {
    (
        protocol::get_u32(frame, OFF_MQUEUEID),
        protocol::get_u32(frame, OFF_LEN),
        protocol::get_u32(frame, OFF_PRIO),
    )
}

/// Reply: status plus, for receives, the payload length and priority.
pub fn encode_reply(source: NodeId, ret: i32, len: u32, prio: u32) -> Frame {
    let mut frame = [0u8; MAILBOX_MSG_SIZE];
    ControlHeader::new(MqueueOpcode::Reply as u8, source, 0).encode(&mut frame);
    protocol::put_i32(&mut frame, OFF_RET, ret);
    protocol::put_u32(&mut frame, OFF_LEN, len);
    protocol::put_u32(&mut frame, OFF_PRIO, prio);
    frame
}

pub fn decode_reply(frame: &Frame) -> (i32, u32, u32) {
    (
        protocol::get_i32(frame, OFF_RET),
        protocol::get_u32(frame, OFF_LEN),
        protocol::get_u32(frame, OFF_PRIO),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_frame_round_trip() {
        let frame = encode_send_frame(11, 2, 512, 7);
        assert_eq!(decode_send(&frame), (2, 512, 7));
    }

    #[test]
    fn test_open_frame_round_trip() {
        let frame = encode_open_frame(11, "inbox", true, false).unwrap();
        assert_eq!(decode_open(&frame), ("inbox".to_string(), true, false));
    }

    #[test]
    fn test_reply_round_trip() {
        let frame = encode_reply(3, -11, 0, 0);
        assert_eq!(decode_reply(&frame), (-11, 0, 0));
    }
}

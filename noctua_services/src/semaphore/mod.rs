//! Named counting semaphores
//!
//! Semaphores live on the semaphore server. A `wait` that drives the count
//! negative parks the caller on a strict FIFO queue: the server simply does
//! not reply until a `post` releases the head of the queue, so the client
//! stays blocked on its input mailbox.

mod client;
mod server;

pub use client::SemaphoreClient;
pub use server::SemaphoreServer;

pub(crate) use client::send_exit;

use crate::protocol::{self, ControlHeader, CONTROL_BODY};
use noctua_core::error::{NoctuaError, NoctuaResult};
use noctua_core::fabric::{Frame, MAILBOX_MSG_SIZE};
use noctua_core::topology::NodeId;

/// Maximum number of semaphores.
pub const SEM_MAX: usize = 128;

/// Maximum length of a semaphore name, including the terminator.
pub const SEM_NAME_MAX: usize = 64;

/// Maximum initial value of a semaphore.
pub const SEM_VALUE_MAX: u32 = 32767;

/// Requests understood by the semaphore server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SemOpcode {
    Create = 1,
    CreateExcl = 2,
    Open = 3,
    Close = 4,
    Unlink = 5,
    Wait = 6,
    Post = 7,
    Exit = 8,
    Reply = 9,
}

impl TryFrom<u8> for SemOpcode {
    type Error = NoctuaError;

    fn try_from(value: u8) -> NoctuaResult<Self> {
        Ok(match value {
            1 => SemOpcode::Create,
            2 => SemOpcode::CreateExcl,
            3 => SemOpcode::Open,
            4 => SemOpcode::Close,
            5 => SemOpcode::Unlink,
            6 => SemOpcode::Wait,
            7 => SemOpcode::Post,
            8 => SemOpcode::Exit,
            9 => SemOpcode::Reply,
            _ => return Err(NoctuaError::invalid(format!("bad semaphore opcode {value}"))),
        })
    }
}

// Body field offsets.
const OFF_NAME: usize = CONTROL_BODY;
const OFF_MODE: usize = CONTROL_BODY;
const OFF_VALUE: usize = CONTROL_BODY + 4;
const OFF_SEMID: usize = CONTROL_BODY;
const OFF_RET: usize = CONTROL_BODY;

/// First half of a create exchange, or a whole open/unlink request.
pub fn encode_name_frame(
    opcode: SemOpcode,
    source: NodeId,
    seq: u16,
    name: &str,
) -> NoctuaResult<Frame> {
    let mut frame = [0u8; MAILBOX_MSG_SIZE];
    ControlHeader::new(opcode as u8, source, seq).encode(&mut frame);
    protocol::put_name(&mut frame, OFF_NAME, name, SEM_NAME_MAX)?;
    Ok(frame)
}

pub fn decode_name(frame: &Frame) -> String {
    protocol::get_name(frame, OFF_NAME, SEM_NAME_MAX)
}

/// Second half of a create exchange: mode and initial value.
pub fn encode_attr_frame(
    opcode: SemOpcode,
    source: NodeId,
    seq: u16,
    mode: u32,
    value: u32,
) -> Frame {
    let mut frame = [0u8; MAILBOX_MSG_SIZE];
    ControlHeader::new(opcode as u8, source, seq).encode(&mut frame);
    protocol::put_u32(&mut frame, OFF_MODE, mode);
    protocol::put_u32(&mut frame, OFF_VALUE, value);
    frame
}

pub fn decode_attr(frame: &Frame) -> (u32, u32) {
    (
        protocol::get_u32(frame, OFF_MODE),
        protocol::get_u32(frame, OFF_VALUE),
    )
}

pub fn encode_semid_frame(opcode: SemOpcode, source: NodeId, semid: u32) -> Frame {
    let mut frame = [0u8; MAILBOX_MSG_SIZE];
    ControlHeader::new(opcode as u8, source, 0).encode(&mut frame);
    protocol::put_u32(&mut frame, OFF_SEMID, semid);
    frame
}

pub fn decode_semid(frame: &Frame) -> u32 {
    protocol::get_u32(frame, OFF_SEMID)
}

pub fn encode_reply(source: NodeId, ret: i32) -> Frame {
    let mut frame = [0u8; MAILBOX_MSG_SIZE];
    ControlHeader::new(SemOpcode::Reply as u8, source, 0).encode(&mut frame);
    protocol::put_i32(&mut frame, OFF_RET, ret);
    frame
}

pub fn decode_reply(frame: &Frame) -> i32 {
    protocol::get_i32(frame, OFF_RET)
}

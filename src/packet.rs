use crate::error::DecodeError;
use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt::{Debug, Formatter};

bitflags! {
    #[derive(Debug, PartialEq, Eq, Copy, Clone)]
    pub struct Flags: u8 {
        /// never set, ignored on receipt
        const RESERVED = 0b1000_0000;
        const OBSERVED = 0b0001_0000;
        const SESSION  = 0b0000_1000;
        const MISSED   = 0b0000_0100;
        const NEXT     = 0b0000_0010;
        /// defined by the protocol but without semantics: never set, ignored on receipt
        const INTERVAL = 0b0000_0001;
    }
}

/// default upper bound for the size of a datagram, including all headers
pub const MAX_PACKET_SIZE: usize = 1450;

/// flags + ack echo + sequence number
pub const FIXED_HEADER_LEN: usize = 4;

/// The length prefix of a message stores `len - 1` in a single byte. Messages are limited to
///  255 bytes at the API level.
pub const MAX_MESSAGE_LEN: usize = 255;

/// The count byte of the MISSED field stores `count - 1`
pub const MAX_MISSED_LEN: usize = 256;

/// A single datagram in structured form.
///
/// Optional fields are present on the wire iff they are `Some` (or non-empty for `missed`), and
///  the flags byte is derived from that on serialization. `messages` are only transmitted if
///  `next_msg_num` is present.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Packet {
    /// low byte of the last sequence number the sender received from its peer
    pub ack_echo: u8,
    pub seq: u16,
    /// the receiver's session id as seen by the sender
    pub observed_session: Option<u32>,
    /// the sender's own session id
    pub session_id: Option<u32>,
    /// message number of the first message in this packet, or of the next message to be sent
    ///  if the packet carries no messages
    pub next_msg_num: Option<u8>,
    /// message numbers the sender did not receive
    pub missed: Vec<u8>,
    pub messages: Vec<Bytes>,
}

impl Debug for Packet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "AH{{#{}/{}", self.seq, self.ack_echo)?;
        if let Some(observed) = self.observed_session {
            write!(f, " O:{:08x}", observed)?;
        }
        if let Some(session) = self.session_id {
            write!(f, " S:{:08x}", session)?;
        }
        if let Some(next) = self.next_msg_num {
            write!(f, " N:{}", next)?;
        }
        if !self.missed.is_empty() {
            write!(f, " M:{:?}", self.missed)?;
        }
        if !self.messages.is_empty() {
            write!(f, " msgs:{}", self.messages.len())?;
        }
        write!(f, "}}")
    }
}

impl Packet {
    pub fn flags(&self) -> Flags {
        let mut flags = Flags::empty();
        flags.set(Flags::OBSERVED, self.observed_session.is_some());
        flags.set(Flags::SESSION, self.session_id.is_some());
        flags.set(Flags::NEXT, self.next_msg_num.is_some());
        flags.set(Flags::MISSED, !self.missed.is_empty());
        flags
    }

    /// the number of bytes [Packet::ser] writes for this packet
    pub fn serialized_len(&self) -> usize {
        let mut result = FIXED_HEADER_LEN;
        if self.observed_session.is_some() {
            result += std::mem::size_of::<u32>();
        }
        if self.session_id.is_some() {
            result += std::mem::size_of::<u32>();
        }
        if self.next_msg_num.is_some() {
            result += std::mem::size_of::<u8>();
            result += self.messages.iter()
                .map(|msg| 1 + msg.len())
                .sum::<usize>();
        }
        if !self.missed.is_empty() {
            result += 1 + self.missed.len();
        }
        result
    }

    /// NB: It is the caller's responsibility to keep messages and the MISSED list within their
    ///      wire limits and the total length within the maximum packet size
    pub fn ser(&self, buf: &mut impl BufMut) {
        debug_assert!(self.missed.len() <= MAX_MISSED_LEN);
        debug_assert!(self.messages.is_empty() || self.next_msg_num.is_some());

        buf.put_u8(self.flags().bits());
        buf.put_u8(self.ack_echo);
        buf.put_u16(self.seq);

        if let Some(observed) = self.observed_session {
            buf.put_u32(observed);
        }
        if let Some(session) = self.session_id {
            buf.put_u32(session);
        }
        if let Some(next) = self.next_msg_num {
            buf.put_u8(next);
        }
        if !self.missed.is_empty() {
            buf.put_u8((self.missed.len() - 1) as u8);
            buf.put_slice(&self.missed);
        }
        if self.next_msg_num.is_some() {
            for msg in &self.messages {
                debug_assert!(!msg.is_empty() && msg.len() <= MAX_MESSAGE_LEN + 1);
                buf.put_u8((msg.len() - 1) as u8);
                buf.put_slice(msg);
            }
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.serialized_len());
        self.ser(&mut buf);
        buf.freeze()
    }

    /// Parse a datagram. Fields are read in their fixed order, each only if its flag is set;
    ///  unknown flag bits are ignored. All bytes after the MISSED list are messages if NEXT is
    ///  set and are ignored otherwise.
    pub fn deser(mut buf: &[u8]) -> Result<Packet, DecodeError> {
        let flags = Flags::from_bits_truncate(get_u8(&mut buf, "flags")?);
        let ack_echo = get_u8(&mut buf, "ack echo")?;
        let seq = buf.try_get_u16()
            .map_err(|_| DecodeError::Truncated { field: "sequence number" })?;

        let observed_session = if flags.contains(Flags::OBSERVED) {
            Some(get_u32(&mut buf, "observed session")?)
        }
        else {
            None
        };
        let session_id = if flags.contains(Flags::SESSION) {
            Some(get_u32(&mut buf, "session id")?)
        }
        else {
            None
        };
        let next_msg_num = if flags.contains(Flags::NEXT) {
            Some(get_u8(&mut buf, "next message number")?)
        }
        else {
            None
        };

        let missed = if flags.contains(Flags::MISSED) {
            let num_missed = get_u8(&mut buf, "missed count")? as usize + 1;
            take(&mut buf, num_missed, "missed list")?.to_vec()
        }
        else {
            Vec::new()
        };

        let mut messages = Vec::new();
        if next_msg_num.is_some() {
            while buf.has_remaining() {
                let len = get_u8(&mut buf, "message length")? as usize + 1;
                messages.push(Bytes::copy_from_slice(take(&mut buf, len, "message")?));
            }
        }

        Ok(Packet {
            ack_echo,
            seq,
            observed_session,
            session_id,
            next_msg_num,
            missed,
            messages,
        })
    }
}

fn get_u8(buf: &mut &[u8], field: &'static str) -> Result<u8, DecodeError> {
    buf.try_get_u8()
        .map_err(|_| DecodeError::Truncated { field })
}

fn get_u32(buf: &mut &[u8], field: &'static str) -> Result<u32, DecodeError> {
    buf.try_get_u32()
        .map_err(|_| DecodeError::Truncated { field })
}

fn take<'a>(buf: &mut &'a [u8], len: usize, field: &'static str) -> Result<&'a [u8], DecodeError> {
    if buf.len() < len {
        return Err(DecodeError::Truncated { field });
    }
    let (result, rest) = buf.split_at(len);
    *buf = rest;
    Ok(result)
}

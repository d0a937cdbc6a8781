use thiserror::Error;

/// Failure to parse a datagram. The only way parsing can fail is a field that is declared by
///  the flags byte but whose bytes are not there.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("truncated packet: not enough bytes for {field}")]
    Truncated { field: &'static str },
}

/// Inbound packets that parse fine but must not be applied to connection state
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolViolation {
    #[error("handshake confirmation for session {observed:#010x}, expected {own:#010x}")]
    SessionMismatchUnconfirmed { observed: u32, own: u32 },
    #[error("sequence number {seq} is outside the receive window starting at {in_seq}")]
    SequenceOutOfWindow { seq: u16, in_seq: u16 },
}

/// Everything that makes a connection drop an inbound datagram
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Violation(#[from] ProtocolViolation),
}

/// Rejected outgoing data. Message mode never truncates or splits.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteError {
    #[error("message of length {len} exceeds the maximum of {max} bytes")]
    MessageTooLong { len: usize, max: usize },
    #[error("empty messages can not be sent")]
    EmptyMessage,
}

//! Airhook is a reliable transport protocol on top of UDP. It is designed for links with loss,
//!  reordering and long outages, and it tolerates peers that restart at any time.
//!
//! ## Design goals
//!
//! * The protocol is peer-to-peer without a dedicated server vs. client
//!   * each node has a single UDP socket that handles all 'connections'
//! * No explicit handshake packets: session ids piggyback on regular packets until both sides
//!   saw their own session id echoed by the peer
//! * A peer that restarts is detected by its new session id, and message state is reset
//!   transparently
//! * The abstraction is sending / receiving *messages* of up to 255 bytes. Messages are
//!   delivered reliably but not necessarily in order
//!   * there is an optional stream layer on top that reassembles an ordered byte stream
//! * Selective repeat: the receiver reports missing message numbers, and only those are resent
//! * Flow control is a fixed window of 255 unacknowledged messages - there is no congestion
//!   control
//! * Every packet carries the receiver's complete state, so a single packet that gets through
//!   after an outage is enough to resynchronize
//!
//! ## Packet format
//!
//! All numbers in network byte order (BE):
//! ```ascii
//! 0:  flags (8 bits):
//!     * bit 7: reserved
//!     * bit 4: OBSERVED - the packet contains the peer's session id as observed by the sender
//!     * bit 3: SESSION - the packet contains the sender's session id
//!     * bit 2: MISSED - the packet contains a list of missing message numbers
//!     * bit 1: NEXT - the packet contains a message number and (optionally) messages
//!     * bit 0: unused
//! 1:  low byte of the last sequence number received from the peer (u8)
//! 2:  sequence number of this packet (u16)
//!
//! *  observed session id (u32) - if OBSERVED
//! *  session id (u32) - if SESSION
//! *  message number of the first message in this packet, or the next message number to be
//!     assigned if there are none (u8) - if NEXT
//! *  number of missed message numbers minus 1 (u8), followed by the message numbers (u8 each)
//!     - if MISSED
//! *  messages, each as its length minus 1 (u8) followed by the message's bytes, filling the
//!     rest of the packet - if NEXT
//! ```
//!
//! Packets are at most 1450 bytes (configurable), which avoids IP fragmentation on typical
//!  links.
//!
//! ## Sequence numbers
//!
//! Every packet has a 16 bit sequence number, and every packet echoes the low byte of the last
//!  sequence number received from the peer. Sequence numbers are compared modulo 2^16 within a
//!  window of 256: a packet is accepted only if it is 1 to 255 steps ahead of the last received
//!  one. The echo is reconstructed to a full sequence number based on the sender's own
//!  sequence number, and this 'acknowledged' sequence number drives flow control and the
//!  expiry of missed lists and session announcements.
//!
//! ## Message numbers
//!
//! Messages get 8 bit message numbers in the order they are first sent; resent messages get a
//!  new number. A gap between the expected message number and the one in NEXT means messages
//!  were lost, and their numbers are reported back in MISSED until the peer acknowledged a
//!  packet containing the report.
//!
//! ## Stream layer
//!
//! The stream layer cuts data into chunks of up to 253 bytes, each prefixed with a 16 bit chunk
//!  sequence number (u16), and sends each chunk as a message. Received chunks are buffered
//!  until they are contiguous.

pub mod config;
pub mod connection;
pub mod connection_table;
pub mod data_handler;
pub mod end_point;
pub mod error;
pub mod packet;
pub mod reliable;
pub mod scheduler;
pub mod send_socket;
pub mod sequence;
pub mod session;
pub mod stream;
pub mod test_util;

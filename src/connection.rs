use crate::config::AirhookConfig;
use crate::error::{ProtocolViolation, ReceiveError, WriteError};
use crate::packet::{Packet, MAX_MESSAGE_LEN};
use crate::reliable::ReliableDelivery;
use crate::scheduler::Scheduler;
use crate::sequence;
use crate::session::{ConnectionState, Session, Transition};
use bytes::Bytes;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// The protocol state for a single peer, independent of sockets and timers. The host feeds it
///  datagrams and timer expiries, and sends whatever [AirhookConnection::send_next] produces.
///
/// After each call to `datagram_received`, `write` or `send_next`, the host must call
///  `poll_schedule` and arm a timer if it returns a delay.
pub trait AirhookConnection: Send + Sync + 'static {
    fn create(config: &AirhookConfig) -> Self where Self: Sized;

    /// Returns payloads to be delivered to the application
    fn datagram_received(&mut self, datagram: &[u8], now: Instant) -> Result<Vec<Bytes>, ReceiveError>;

    fn write(&mut self, data: Bytes) -> Result<(), WriteError>;

    /// Build the next outgoing datagram
    fn send_next(&mut self, now: Instant) -> Bytes;

    fn poll_schedule(&mut self, now: Instant) -> Option<Duration>;

    /// the later of the last receive and the last transmit
    fn last_activity(&self) -> Option<Instant>;
}

/// Message-mode connection: each write is delivered to the peer as a separate message, in no
///  particular order relative to other messages.
pub struct Connection {
    session: Session,
    reliable: ReliableDelivery,
    scheduler: Scheduler,

    out_seq: u16,
    in_seq: u16,
    acked_seq: u16,
    has_received: bool,
    last_receive: Option<Instant>,
}

impl Connection {
    pub fn new(config: &AirhookConfig) -> Connection {
        Connection::with_session_id(config, rand::random())
    }

    pub fn with_session_id(config: &AirhookConfig, own_session_id: u32) -> Connection {
        Connection {
            session: Session::new(own_session_id),
            reliable: ReliableDelivery::new(config.max_packet_size),
            scheduler: Scheduler::new(config.keep_alive_interval),
            out_seq: 0,
            in_seq: 0,
            acked_seq: 0,
            has_received: false,
            last_receive: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.session.state()
    }

    pub fn own_session_id(&self) -> u32 {
        self.session.own_session_id()
    }

    pub fn peer_session_id(&self) -> Option<u32> {
        self.session.peer_session_id()
    }

    pub fn out_seq(&self) -> u16 {
        self.out_seq
    }

    pub fn in_seq(&self) -> u16 {
        self.in_seq
    }

    pub fn acked_seq(&self) -> u16 {
        self.acked_seq
    }

    pub fn reliable(&self) -> &ReliableDelivery {
        &self.reliable
    }

    fn check_admission(&self, seq: u16) -> Result<(), ProtocolViolation> {
        let is_duplicate = self.has_received && seq == self.in_seq;
        if is_duplicate || !sequence::in_window(seq, self.in_seq) {
            return Err(ProtocolViolation::SequenceOutOfWindow { seq, in_seq: self.in_seq });
        }
        Ok(())
    }

    fn can_send_messages(&self) -> bool {
        self.reliable.has_outgoing()
            && self.reliable.is_window_open(self.acked_seq, self.out_seq)
    }
}

impl AirhookConnection for Connection {
    fn create(config: &AirhookConfig) -> Connection {
        Connection::new(config)
    }

    fn datagram_received(&mut self, datagram: &[u8], now: Instant) -> Result<Vec<Bytes>, ReceiveError> {
        let packet = Packet::deser(datagram)?;
        trace!("received {:?}", packet);
        self.check_admission(packet.seq)?;

        match self.session.on_packet(packet.observed_session, packet.session_id, self.out_seq)? {
            Transition::Accept { response_required } => {
                if response_required {
                    self.scheduler.request_response();
                }
            }
            Transition::Reset => {
                self.reliable.reset();
                self.in_seq = packet.seq;
            }
        }

        let mut delivered = Vec::new();
        if self.session.state() != ConnectionState::Pending {
            self.reliable.on_missed(&packet.missed);
            if let Some(next_msg_num) = packet.next_msg_num {
                if self.reliable.on_next(next_msg_num, packet.messages.len(), self.out_seq) {
                    self.scheduler.request_response();
                }
            }
            delivered = packet.messages;
        }

        if self.session.state() == ConnectionState::Confirmed {
            self.acked_seq = sequence::reconstruct(self.out_seq, packet.ack_echo);
        }

        self.in_seq = packet.seq;
        self.has_received = true;
        self.last_receive = Some(now);
        Ok(delivered)
    }

    fn write(&mut self, data: Bytes) -> Result<(), WriteError> {
        if data.is_empty() {
            return Err(WriteError::EmptyMessage);
        }
        if data.len() > MAX_MESSAGE_LEN {
            return Err(WriteError::MessageTooLong { len: data.len(), max: MAX_MESSAGE_LEN });
        }
        self.reliable.enqueue(data);
        Ok(())
    }

    fn send_next(&mut self, now: Instant) -> Bytes {
        let (observed_session, session_id) = self.session.outgoing_ids(self.acked_seq);
        let mut packet = Packet {
            ack_echo: self.in_seq as u8,
            seq: self.out_seq,
            observed_session,
            session_id,
            ..Packet::default()
        };
        let may_send_messages = self.session.state() == ConnectionState::Confirmed;
        self.reliable.fill_packet(&mut packet, may_send_messages, self.acked_seq, self.out_seq);

        trace!("sending {:?}", packet);
        if packet.session_id.is_some() && self.session.state() != ConnectionState::Confirmed {
            debug!("announcing session {:08x}", self.session.own_session_id());
        }

        self.out_seq = self.out_seq.wrapping_add(1);
        self.scheduler.on_sent(now);
        packet.encode()
    }

    fn poll_schedule(&mut self, now: Instant) -> Option<Duration> {
        let can_send_messages = self.can_send_messages();
        self.scheduler.poll(can_send_messages, self.session.state(), now)
    }

    fn last_activity(&self) -> Option<Instant> {
        self.last_receive.max(self.scheduler.last_transmit())
    }
}

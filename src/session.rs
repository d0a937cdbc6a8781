//! The handshake / session part of a connection.
//!
//! Each side of a connection picks a random 32 bit session id when the connection is created.
//!  A side announces its own id in the SESSION field, and confirms the peer's id by echoing it
//!  in the OBSERVED field. There is no dedicated SYN / ACK exchange: session fields piggyback on
//!  regular packets until both sides have seen their own id echoed by the peer.
//!
//! A peer presenting a different session id than before (or echoing a session id that is not
//!  ours) has restarted, and message level state is reset.

use crate::error::ProtocolViolation;
use crate::sequence;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// initial state, or after a session change: we have not announced our session yet
    Pending,
    /// we announced our session and wait for the peer to confirm it
    Sent,
    /// the peer confirmed our session
    Confirmed,
}

/// What the receiving side of a connection needs to do after a packet's session fields were
///  applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Accept { response_required: bool },
    /// the peer's session changed: message state must be reset, and the receive sequence
    ///  re-synchronized to the packet
    Reset,
}

pub struct Session {
    state: ConnectionState,
    own_session_id: u32,
    peer_session_id: Option<u32>,
    /// keep sending session fields until the peer acknowledged this sequence number
    send_session_until: Option<u16>,
}

impl Session {
    pub fn new(own_session_id: u32) -> Session {
        Session {
            state: ConnectionState::Pending,
            own_session_id,
            peer_session_id: None,
            send_session_until: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn own_session_id(&self) -> u32 {
        self.own_session_id
    }

    pub fn peer_session_id(&self) -> Option<u32> {
        self.peer_session_id
    }

    pub fn send_session_until(&self) -> Option<u16> {
        self.send_session_until
    }

    /// Apply the session fields of a received packet. `out_seq` is the sequence number of the
    ///  next packet we are going to send.
    pub fn on_packet(&mut self, observed: Option<u32>, session: Option<u32>, out_seq: u16) -> Result<Transition, ProtocolViolation> {
        match self.state {
            ConnectionState::Pending => {
                match (observed, session) {
                    (Some(observed), Some(session)) => {
                        if observed != self.own_session_id {
                            return Err(ProtocolViolation::SessionMismatchUnconfirmed { observed, own: self.own_session_id });
                        }
                        debug!("session {:08x} confirmed by peer {:08x}", self.own_session_id, session);
                        self.peer_session_id = Some(session);
                        // the peer may still be waiting for our confirmation of its session
                        self.send_session_until = Some(out_seq);
                        self.state = ConnectionState::Confirmed;
                    }
                    (None, Some(session)) => {
                        debug!("peer announced session {:08x}", session);
                        self.peer_session_id = Some(session);
                        self.state = ConnectionState::Sent;
                        return Ok(Transition::Accept { response_required: true });
                    }
                    _ => {}
                }
            }
            ConnectionState::Sent => {
                if let (Some(observed), Some(session)) = (observed, session) {
                    if observed == self.own_session_id {
                        debug!("session {:08x} confirmed by peer {:08x}", self.own_session_id, session);
                        self.peer_session_id = Some(session);
                        self.send_session_until = Some(out_seq);
                        self.state = ConnectionState::Confirmed;
                    }
                }
                if let Some(session) = session {
                    match self.peer_session_id {
                        None => self.peer_session_id = Some(session),
                        Some(peer) if peer != session => {
                            debug!("peer session changed from {:08x} to {:08x} during handshake", peer, session);
                            return Ok(self.reset());
                        }
                        Some(_) => {}
                    }
                }
            }
            ConnectionState::Confirmed => {
                let session_changed = session.is_some() && session != self.peer_session_id;
                let observed_changed = observed.is_some_and(|o| o != self.own_session_id);
                if session_changed || observed_changed {
                    debug!("session change detected (peer session {:?}, observed {:?}) - resetting", session, observed);
                    return Ok(self.reset());
                }
            }
        }
        Ok(Transition::Accept { response_required: false })
    }

    fn reset(&mut self) -> Transition {
        self.state = ConnectionState::Pending;
        Transition::Reset
    }

    /// The (observed, session) fields for the next outgoing packet. Sending from `Pending`
    ///  announces our session and moves to `Sent`.
    pub fn outgoing_ids(&mut self, acked_seq: u16) -> (Option<u32>, Option<u32>) {
        match self.state {
            ConnectionState::Pending => {
                self.state = ConnectionState::Sent;
                (None, Some(self.own_session_id))
            }
            ConnectionState::Sent => (self.peer_session_id, Some(self.own_session_id)),
            ConnectionState::Confirmed => {
                match (self.send_session_until, self.peer_session_id) {
                    (Some(until), Some(peer)) => {
                        if sequence::in_window(acked_seq, until) {
                            self.send_session_until = None;
                            (None, None)
                        }
                        else {
                            (Some(peer), Some(self.own_session_id))
                        }
                    }
                    _ => (None, None),
                }
            }
        }
    }
}

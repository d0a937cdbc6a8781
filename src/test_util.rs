//! An in-memory 'network' connecting two connections, for testing protocol behavior without
//!  sockets or timers. Datagrams are handed over synchronously, and losing one is a matter of
//!  sending it nowhere.
//!
//! This is part of the regular code rather than #[cfg(test)] so applications can use it to test
//!  their own [AirhookConnection] based code.

use crate::connection::AirhookConnection;
use bytes::Bytes;
use std::time::{Duration, Instant};

pub struct Link<C: AirhookConnection> {
    pub a: C,
    pub b: C,
    pub now: Instant,
}

impl<C: AirhookConnection> Link<C> {
    pub fn new(a: C, b: C) -> Link<C> {
        Link {
            a,
            b,
            now: Instant::now(),
        }
    }

    pub fn advance(&mut self, duration: Duration) {
        self.now += duration;
    }

    /// Send a packet from a to b, returning what b delivers. Panics if b rejects the datagram.
    pub fn a_to_b(&mut self) -> Vec<Bytes> {
        let datagram = self.a.send_next(self.now);
        self.b.datagram_received(&datagram, self.now)
            .expect("datagram should be accepted")
    }

    /// Send a packet from b to a, returning what a delivers. Panics if a rejects the datagram.
    pub fn b_to_a(&mut self) -> Vec<Bytes> {
        let datagram = self.b.send_next(self.now);
        self.a.datagram_received(&datagram, self.now)
            .expect("datagram should be accepted")
    }

    /// a sends a packet that is lost
    pub fn a_to_nowhere(&mut self) -> Bytes {
        self.a.send_next(self.now)
    }

    /// b sends a packet that is lost
    pub fn b_to_nowhere(&mut self) -> Bytes {
        self.b.send_next(self.now)
    }

    /// Let both sides send whatever their schedulers want sent immediately, delivering
    ///  everything, until neither has an immediate send or `max_rounds` is exhausted. Keep-alive
    ///  timers are left armed. Returns everything delivered to a and to b respectively.
    pub fn exchange(&mut self, max_rounds: usize) -> (Vec<Bytes>, Vec<Bytes>) {
        let mut to_a = Vec::new();
        let mut to_b = Vec::new();
        for _ in 0..max_rounds {
            let a_due = self.a.poll_schedule(self.now);
            if a_due == Some(Duration::ZERO) {
                to_b.extend(self.a_to_b());
            }
            let b_due = self.b.poll_schedule(self.now);
            if b_due == Some(Duration::ZERO) {
                to_a.extend(self.b_to_a());
            }
            if a_due != Some(Duration::ZERO) && b_due != Some(Duration::ZERO) {
                break;
            }
        }
        (to_a, to_b)
    }
}

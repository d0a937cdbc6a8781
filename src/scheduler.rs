use crate::session::ConnectionState;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendDecision {
    Immediately,
    After(Duration),
    Idle,
}

/// Decides when the next packet should be sent. The scheduler only tracks timing; it has no
///  notion of timers, the host arms one when [Scheduler::poll] returns a delay.
pub struct Scheduler {
    keep_alive_interval: Duration,
    response_pending: bool,
    send_scheduled: bool,
    last_transmit: Option<Instant>,
}

impl Scheduler {
    pub fn new(keep_alive_interval: Duration) -> Scheduler {
        Scheduler {
            keep_alive_interval,
            response_pending: false,
            send_scheduled: false,
            last_transmit: None,
        }
    }

    pub fn last_transmit(&self) -> Option<Instant> {
        self.last_transmit
    }

    pub fn is_send_scheduled(&self) -> bool {
        self.send_scheduled
    }

    /// the peer should hear from us without waiting for the keep-alive interval
    pub fn request_response(&mut self) {
        self.response_pending = true;
    }

    pub fn on_sent(&mut self, now: Instant) {
        self.last_transmit = Some(now);
        self.send_scheduled = false;
    }

    pub fn decide(&mut self, can_send_messages: bool, state: ConnectionState, now: Instant) -> SendDecision {
        if can_send_messages && state != ConnectionState::Sent {
            return SendDecision::Immediately;
        }
        if self.response_pending {
            self.response_pending = false;
            return SendDecision::Immediately;
        }

        let keep_alive_due = match self.last_transmit {
            None => true,
            Some(t) => now.saturating_duration_since(t) > self.keep_alive_interval,
        };
        if keep_alive_due || state == ConnectionState::Pending {
            return SendDecision::After(self.keep_alive_interval);
        }
        SendDecision::Idle
    }

    /// Returns the delay after which the host should call `send_next`, or `None` if no send is
    ///  needed or one is already scheduled.
    pub fn poll(&mut self, can_send_messages: bool, state: ConnectionState, now: Instant) -> Option<Duration> {
        if self.send_scheduled {
            return None;
        }
        let delay = match self.decide(can_send_messages, state, now) {
            SendDecision::Immediately => Duration::ZERO,
            SendDecision::After(delay) => delay,
            SendDecision::Idle => return None,
        };
        self.send_scheduled = true;
        Some(delay)
    }
}

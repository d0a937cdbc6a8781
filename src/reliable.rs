//! Selective-repeat bookkeeping for messages.
//!
//! Messages get an 8 bit message number when they are put into a packet for the first time.
//!  Every packet that carries messages has the number of its first message in the NEXT field,
//!  and packets without messages still carry NEXT while messages are unacknowledged, so the
//!  receiver can detect gaps in the message numbers. Missing message numbers are reported back
//!  in the MISSED field of the receiver's packets, and the sender re-queues the corresponding
//!  payloads - only those.
//!
//! There is no per-message acknowledgement. Flow control works on packet sequence numbers
//!  instead: for each sent packet we record the highest message number it covered, and the
//!  peer's echo of our sequence number tells us how many messages may still be in flight.

use crate::packet::{Packet, MAX_MISSED_LEN};
use crate::sequence;
use bytes::Bytes;
use std::collections::VecDeque;
use tracing::{debug, trace};

/// the maximum number of messages that may be unacknowledged at any time
pub const MAX_IN_FLIGHT: u8 = 255;

const NUM_SLOTS: usize = 256;

pub struct ReliableDelivery {
    max_packet_size: usize,

    /// sent messages by message number, retained for resending
    retransmit_buffer: Vec<Option<Bytes>>,
    /// messages waiting for a message number, front is sent first
    outgoing: VecDeque<Bytes>,

    next_out_msg_num: u8,
    next_in_msg_num: u8,

    /// indexed by outgoing sequence number mod 256: the last message number that was assigned
    ///  when the packet was sent
    outstanding_at_seq: [u8; NUM_SLOTS],

    /// incoming message numbers we did not receive, with the outgoing sequence number at the
    ///  time the gap was detected. They are reported in every packet until the peer
    ///  acknowledged a packet sent after detection.
    missing_incoming: VecDeque<(u16, u8)>,
}

impl ReliableDelivery {
    pub fn new(max_packet_size: usize) -> ReliableDelivery {
        ReliableDelivery {
            max_packet_size,
            retransmit_buffer: vec![None; NUM_SLOTS],
            outgoing: VecDeque::new(),
            next_out_msg_num: 0,
            next_in_msg_num: 0,
            outstanding_at_seq: [u8::MAX; NUM_SLOTS],
            missing_incoming: VecDeque::new(),
        }
    }

    /// Discard all message numbering state, e.g. after the peer's session changed. Messages
    ///  that were not sent yet stay queued for the new session.
    pub fn reset(&mut self) {
        self.retransmit_buffer.fill(None);
        self.missing_incoming.clear();
        self.next_out_msg_num = 0;
        self.next_in_msg_num = 0;
        // 'last assigned' is one before the next message number, i.e. nothing outstanding
        self.outstanding_at_seq = [self.next_out_msg_num.wrapping_sub(1); NUM_SLOTS];
    }

    pub fn enqueue(&mut self, message: Bytes) {
        self.outgoing.push_back(message);
    }

    pub fn has_outgoing(&self) -> bool {
        !self.outgoing.is_empty()
    }

    pub fn num_outgoing(&self) -> usize {
        self.outgoing.len()
    }

    pub fn next_out_msg_num(&self) -> u8 {
        self.next_out_msg_num
    }

    pub fn next_in_msg_num(&self) -> u8 {
        self.next_in_msg_num
    }

    pub fn missing_incoming(&self) -> impl Iterator<Item = u8> + '_ {
        self.missing_incoming.iter().map(|&(_, msg_num)| msg_num)
    }

    /// The number of messages sent after the packet the peer acknowledged last
    pub fn in_flight(&self, acked_seq: u16) -> u8 {
        self.next_out_msg_num
            .wrapping_sub(1)
            .wrapping_sub(self.outstanding_at_seq[slot(acked_seq)])
    }

    /// Sending messages requires room in the in-flight window, and that we are not too far ahead
    ///  of the peer's acknowledgement for the outstanding counters to be valid
    pub fn is_window_open(&self, acked_seq: u16, out_seq: u16) -> bool {
        self.in_flight(acked_seq) < MAX_IN_FLIGHT
            && sequence::in_window(out_seq, acked_seq)
    }

    /// The peer reports these message numbers as missing: move them to the front of the queue
    ///  for resending. Numbers with no retained payload were resent before and are ignored.
    pub fn on_missed(&mut self, missed: &[u8]) {
        for &msg_num in missed.iter().rev() {
            if let Some(message) = self.retransmit_buffer[msg_num as usize].take() {
                trace!("peer missed message #{} - re-queueing", msg_num);
                self.outgoing.push_front(message);
            }
        }
    }

    /// Gap detection based on a received packet's NEXT field. Returns true if messages are
    ///  missing, which warrants an immediate response.
    pub fn on_next(&mut self, next_msg_num: u8, num_messages: usize, out_seq: u16) -> bool {
        let missed_count = next_msg_num.wrapping_sub(self.next_in_msg_num);
        if missed_count > 0 {
            debug!("missing {} incoming messages starting at #{}", missed_count, self.next_in_msg_num);
            for i in 0..missed_count {
                self.missing_incoming.push_back((out_seq, self.next_in_msg_num.wrapping_add(i)));
            }
        }
        self.next_in_msg_num = next_msg_num.wrapping_add(num_messages as u8);
        missed_count > 0
    }

    /// Add the MISSED list and as many queued messages as fit to a packet that is about to be
    ///  sent with sequence number `out_seq`.
    pub fn fill_packet(&mut self, packet: &mut Packet, may_send_messages: bool, acked_seq: u16, out_seq: u16) {
        // the peer acknowledged a packet that carried these, so it knows
        self.missing_incoming
            .retain(|&(detected_at, _)| !sequence::in_window(acked_seq, detected_at));
        packet.missed = self.missing_incoming.iter()
            .take(MAX_MISSED_LEN)
            .map(|&(_, msg_num)| msg_num)
            .collect();

        if may_send_messages && sequence::in_window(out_seq, acked_seq) {
            let first_msg_num = self.next_out_msg_num;
            let mut packet_len = packet.serialized_len();

            while let Some(message_len) = self.outgoing.front().map(Bytes::len) {
                if self.in_flight(acked_seq) >= MAX_IN_FLIGHT {
                    trace!("in-flight window is full");
                    break;
                }
                let next_field_len = if packet.next_msg_num.is_none() { 1 } else { 0 };
                let added_len = next_field_len + 1 + message_len;
                if packet_len + added_len > self.max_packet_size {
                    break;
                }

                let Some(message) = self.outgoing.pop_front() else { break };
                packet.next_msg_num.get_or_insert(first_msg_num);
                self.retransmit_buffer[self.next_out_msg_num as usize] = Some(message.clone());
                packet.messages.push(message);
                packet_len += added_len;
                self.next_out_msg_num = self.next_out_msg_num.wrapping_add(1);
            }
        }

        self.outstanding_at_seq[slot(out_seq)] = self.next_out_msg_num.wrapping_sub(1);

        if packet.next_msg_num.is_none() && self.in_flight(acked_seq) > 0 {
            // no new messages, but the peer needs to know how far we got to detect losses
            packet.next_msg_num = Some(self.next_out_msg_num);
        }
    }
}

fn slot(seq: u16) -> usize {
    (seq as u8) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::MAX_PACKET_SIZE;
    use rstest::rstest;

    fn msg(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    fn send(reliable: &mut ReliableDelivery, acked_seq: u16, out_seq: u16) -> Packet {
        let mut packet = Packet { seq: out_seq, ..Packet::default() };
        reliable.fill_packet(&mut packet, true, acked_seq, out_seq);
        packet
    }

    #[test]
    fn test_fill_packet_assigns_message_numbers() {
        let mut reliable = ReliableDelivery::new(MAX_PACKET_SIZE);
        reliable.enqueue(msg("a"));
        reliable.enqueue(msg("b"));

        let packet = send(&mut reliable, 0, 1);
        assert_eq!(packet.next_msg_num, Some(0));
        assert_eq!(packet.messages, vec![msg("a"), msg("b")]);
        assert_eq!(reliable.next_out_msg_num(), 2);
        assert_eq!(reliable.in_flight(0), 2);
        assert_eq!(reliable.in_flight(1), 0);

        reliable.enqueue(msg("c"));
        let packet = send(&mut reliable, 0, 2);
        assert_eq!(packet.next_msg_num, Some(2));
        assert_eq!(packet.messages, vec![msg("c")]);
    }

    #[test]
    fn test_fill_packet_without_messages() {
        let mut reliable = ReliableDelivery::new(MAX_PACKET_SIZE);
        let packet = send(&mut reliable, 0, 1);
        assert_eq!(packet.next_msg_num, None);
        assert!(packet.messages.is_empty());
    }

    #[test]
    fn test_fill_packet_announces_next_while_unacknowledged() {
        let mut reliable = ReliableDelivery::new(MAX_PACKET_SIZE);
        reliable.enqueue(msg("a"));
        send(&mut reliable, 0, 1);

        // packet #1 is not acknowledged yet
        let packet = send(&mut reliable, 0, 2);
        assert_eq!(packet.next_msg_num, Some(1));
        assert!(packet.messages.is_empty());

        // packet #1 was acknowledged
        let packet = send(&mut reliable, 1, 3);
        assert_eq!(packet.next_msg_num, None);
    }

    #[test]
    fn test_fill_packet_respects_may_send_messages() {
        let mut reliable = ReliableDelivery::new(MAX_PACKET_SIZE);
        reliable.enqueue(msg("a"));
        let mut packet = Packet::default();
        reliable.fill_packet(&mut packet, false, 0, 1);
        assert!(packet.messages.is_empty());
        assert_eq!(reliable.num_outgoing(), 1);
    }

    #[test]
    fn test_fill_packet_respects_max_packet_size() {
        let mut reliable = ReliableDelivery::new(MAX_PACKET_SIZE);
        for _ in 0..10 {
            reliable.enqueue(Bytes::from(vec![7u8; 255]));
        }
        let packet = send(&mut reliable, 0, 1);
        // 4 header + 1 next + 5 * 256 = 1285, a sixth message would exceed 1450
        assert_eq!(packet.messages.len(), 5);
        assert!(packet.encode().len() <= MAX_PACKET_SIZE);
        assert_eq!(reliable.num_outgoing(), 5);
    }

    #[test]
    fn test_window_enforcement() {
        let mut reliable = ReliableDelivery::new(MAX_PACKET_SIZE);
        for i in 0..300 {
            reliable.enqueue(Bytes::from(vec![(i % 256) as u8]));
        }

        let mut total = 0;
        for out_seq in 1..=10 {
            total += send(&mut reliable, 0, out_seq).messages.len();
            assert!(reliable.in_flight(0) <= MAX_IN_FLIGHT);
        }
        assert_eq!(total, 255);
        assert!(!reliable.is_window_open(0, 11));
        assert_eq!(reliable.num_outgoing(), 45);

        // acknowledging packet #1 frees all messages sent up to and including it
        let freed = send(&mut reliable, 1, 11).messages.len();
        assert!(freed > 0);
        assert!(reliable.in_flight(1) <= MAX_IN_FLIGHT);
    }

    #[test]
    fn test_window_closed_when_too_far_ahead_of_ack() {
        let reliable = ReliableDelivery::new(MAX_PACKET_SIZE);
        assert!(reliable.is_window_open(0, 255));
        assert!(!reliable.is_window_open(0, 256));
    }

    #[test]
    fn test_on_missed_requeues_only_retained_messages() {
        let mut reliable = ReliableDelivery::new(MAX_PACKET_SIZE);
        for s in ["a", "b", "c"] {
            reliable.enqueue(msg(s));
        }
        send(&mut reliable, 0, 1);
        reliable.enqueue(msg("d"));

        reliable.on_missed(&[0, 2, 9]);
        assert_eq!(reliable.outgoing, vec![msg("a"), msg("c"), msg("d")]);

        // re-requesting does not resend again
        reliable.on_missed(&[0, 2]);
        assert_eq!(reliable.num_outgoing(), 3);

        let packet = send(&mut reliable, 0, 2);
        assert_eq!(packet.next_msg_num, Some(3));
        assert_eq!(packet.messages, vec![msg("a"), msg("c"), msg("d")]);
    }

    #[rstest]
    #[case::no_gap(0, 0, 2, vec![], 2)]
    #[case::gap(5, 8, 1, vec![5, 6, 7], 9)]
    #[case::gap_wrap_around(254, 1, 0, vec![254, 255, 0], 1)]
    #[case::next_without_messages(3, 3, 0, vec![], 3)]
    fn test_on_next(#[case] next_in: u8, #[case] next: u8, #[case] num_messages: usize, #[case] expected_missing: Vec<u8>, #[case] expected_next_in: u8) {
        let mut reliable = ReliableDelivery::new(MAX_PACKET_SIZE);
        reliable.next_in_msg_num = next_in;
        let response = reliable.on_next(next, num_messages, 17);
        assert_eq!(response, !expected_missing.is_empty());
        assert_eq!(reliable.missing_incoming().collect::<Vec<_>>(), expected_missing);
        assert_eq!(reliable.next_in_msg_num(), expected_next_in);
    }

    #[rstest]
    #[case::not_acked(20, 19, vec![5, 6])]
    #[case::acked(20, 20, vec![])]
    #[case::acked_later(20, 30, vec![])]
    #[case::wrap_around_not_acked(1, 0xffff, vec![5, 6])]
    #[case::wrap_around_acked(0xffff, 1, vec![])]
    fn test_missed_list_pruned_by_ack(#[case] detected_at: u16, #[case] acked_seq: u16, #[case] expected: Vec<u8>) {
        let mut reliable = ReliableDelivery::new(MAX_PACKET_SIZE);
        reliable.next_in_msg_num = 5;
        reliable.on_next(7, 0, detected_at);

        let mut packet = Packet::default();
        reliable.fill_packet(&mut packet, false, acked_seq, acked_seq.wrapping_add(1));
        assert_eq!(packet.missed, expected);
    }

    #[test]
    fn test_missed_list_truncated_on_the_wire() {
        let mut reliable = ReliableDelivery::new(MAX_PACKET_SIZE);
        reliable.on_next(200, 0, 10);
        reliable.on_next(150, 0, 10);
        assert_eq!(reliable.missing_incoming().count(), 200 + 206);

        let mut packet = Packet::default();
        reliable.fill_packet(&mut packet, false, 0, 1);
        assert_eq!(packet.missed.len(), MAX_MISSED_LEN);
        assert_eq!(packet.missed[0], 0);
    }

    #[test]
    fn test_reset() {
        let mut reliable = ReliableDelivery::new(MAX_PACKET_SIZE);
        reliable.enqueue(msg("a"));
        send(&mut reliable, 0, 1);
        reliable.on_next(4, 0, 1);
        reliable.enqueue(msg("b"));

        reliable.reset();

        assert_eq!(reliable.next_out_msg_num(), 0);
        assert_eq!(reliable.next_in_msg_num(), 0);
        assert_eq!(reliable.missing_incoming().count(), 0);
        assert_eq!(reliable.in_flight(1), 0);
        assert!(reliable.retransmit_buffer.iter().all(Option::is_none));
        assert_eq!(reliable.outgoing, vec![msg("b")]);
    }
}

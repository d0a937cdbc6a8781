//! Modular arithmetic for 16 bit packet sequence numbers.
//!
//! Sequence numbers live on a ring of 2^16 values. Everything in the protocol that compares
//!  sequence numbers does so relative to some reference, accepting values that are less than
//!  [WINDOW_SIZE] steps ahead of it.

/// number of consecutive sequence numbers that are considered 'in window' of a reference
pub const WINDOW_SIZE: u16 = 256;

/// forward distance from `b` to `a`, i.e. `(a - b) mod 2^16`
pub fn distance(a: u16, b: u16) -> u16 {
    a.wrapping_sub(b)
}

/// true iff `seq` is at most 255 steps ahead of `reference`
pub fn in_window(seq: u16, reference: u16) -> bool {
    distance(seq, reference) < WINDOW_SIZE
}

/// Reconstruct a full sequence number from its low byte, given a reference value that is known
///  to be at most 255 steps *ahead* of the sequence number in question.
///
/// The peer echoes the low byte of the last sequence number it received from us, and our own
///  `out_seq` is the reference: the echoed packet was sent before `out_seq`, and we never get
///  more than 255 packets ahead of the peer's acknowledgement.
pub fn reconstruct(reference: u16, low_byte: u8) -> u16 {
    let [high, _] = reference.to_be_bytes();
    let candidate = u16::from_be_bytes([high, low_byte]);
    if distance(reference, candidate) < WINDOW_SIZE {
        candidate
    }
    else {
        u16::from_be_bytes([high.wrapping_sub(1), low_byte])
    }
}

/// true iff `seq` lies in the half of the ring that is behind `reference`. Unlike
///  [in_window], this splits the whole ring, so it stays meaningful for values that are more
///  than a window apart.
pub fn is_behind(seq: u16, reference: u16) -> bool {
    distance(seq, reference) > u16::MAX / 2
}

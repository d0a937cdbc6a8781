//! Byte stream presentation on top of message-mode connections.
//!
//! Outgoing data is cut into chunks that fit into a message, each prefixed with a 16 bit chunk
//!  sequence number. The receiving side holds back chunks that arrive ahead of a gap until the
//!  gap is filled by retransmission, and delivers contiguous data.

use crate::config::AirhookConfig;
use crate::connection::{AirhookConnection, Connection};
use crate::error::{ReceiveError, WriteError};
use crate::packet::MAX_MESSAGE_LEN;
use crate::sequence;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

const CHUNK_HEADER_LEN: usize = 2;
pub const MAX_CHUNK_PAYLOAD: usize = MAX_MESSAGE_LEN - CHUNK_HEADER_LEN;

pub struct StreamConnection {
    connection: Connection,
    out_chunk_seq: u16,
    in_chunk_seq: u16,
    /// chunks received ahead of `in_chunk_seq`, ordered by their distance from it
    reorder_buffer: VecDeque<(u16, Bytes)>,
}

impl StreamConnection {
    pub fn new(connection: Connection) -> StreamConnection {
        StreamConnection {
            connection,
            out_chunk_seq: 0,
            in_chunk_seq: 0,
            reorder_buffer: VecDeque::new(),
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn num_buffered_chunks(&self) -> usize {
        self.reorder_buffer.len()
    }

    /// Write several buffers as one contiguous piece of the stream
    pub fn write_sequence(&mut self, data: impl IntoIterator<Item = Bytes>) -> Result<(), WriteError> {
        for buf in data {
            self.write(buf)?;
        }
        Ok(())
    }

    fn reassemble(&mut self, messages: Vec<Bytes>) -> Option<Bytes> {
        for mut message in messages {
            let Ok(chunk_seq) = message.try_get_u16() else {
                debug!("received a message that is too short for a stream chunk - dropping");
                continue;
            };

            let in_chunk_seq = self.in_chunk_seq;
            if sequence::is_behind(chunk_seq, in_chunk_seq) {
                trace!("chunk #{} was delivered before - dropping", chunk_seq);
                continue;
            }
            let offset = sequence::distance(chunk_seq, in_chunk_seq);
            match self.reorder_buffer.binary_search_by_key(&offset, |(seq, _)| sequence::distance(*seq, in_chunk_seq)) {
                Ok(_) => trace!("chunk #{} is buffered already - dropping", chunk_seq),
                Err(pos) => self.reorder_buffer.insert(pos, (chunk_seq, message)),
            }
        }

        let mut delivered = BytesMut::new();
        while let Some((chunk_seq, payload)) = self.reorder_buffer.pop_front() {
            if chunk_seq != self.in_chunk_seq {
                self.reorder_buffer.push_front((chunk_seq, payload));
                break;
            }
            delivered.put(payload);
            self.in_chunk_seq = self.in_chunk_seq.wrapping_add(1);
        }

        if self.reorder_buffer.is_empty() {
            trace!("stream is contiguous up to chunk #{}", self.in_chunk_seq);
        }
        else {
            trace!("{} chunks are waiting for chunk #{}", self.reorder_buffer.len(), self.in_chunk_seq);
        }

        if delivered.is_empty() {
            None
        }
        else {
            Some(delivered.freeze())
        }
    }
}

impl AirhookConnection for StreamConnection {
    fn create(config: &AirhookConfig) -> StreamConnection {
        StreamConnection::new(Connection::new(config))
    }

    fn datagram_received(&mut self, datagram: &[u8], now: Instant) -> Result<Vec<Bytes>, ReceiveError> {
        let messages = self.connection.datagram_received(datagram, now)?;
        Ok(self.reassemble(messages).into_iter().collect())
    }

    /// Writing an empty buffer does nothing
    fn write(&mut self, mut data: Bytes) -> Result<(), WriteError> {
        while data.has_remaining() {
            let payload = data.split_to(data.len().min(MAX_CHUNK_PAYLOAD));

            let mut chunk = BytesMut::with_capacity(CHUNK_HEADER_LEN + payload.len());
            chunk.put_u16(self.out_chunk_seq);
            chunk.put(payload);
            self.connection.write(chunk.freeze())?;

            self.out_chunk_seq = self.out_chunk_seq.wrapping_add(1);
        }
        Ok(())
    }

    fn send_next(&mut self, now: Instant) -> Bytes {
        self.connection.send_next(now)
    }

    fn poll_schedule(&mut self, now: Instant) -> Option<Duration> {
        self.connection.poll_schedule(now)
    }

    fn last_activity(&self) -> Option<Instant> {
        self.connection.last_activity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::Link;
    use rstest::rstest;
    use std::net::SocketAddr;

    fn config() -> AirhookConfig {
        AirhookConfig::default_for(SocketAddr::from(([127, 0, 0, 1], 0)))
    }

    fn stream() -> StreamConnection {
        StreamConnection::create(&config())
    }

    fn chunk(seq: u16, payload: &str) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u16(seq);
        buf.put_slice(payload.as_bytes());
        buf.freeze()
    }

    fn confirmed_link() -> Link<StreamConnection> {
        let mut link = Link::new(stream(), stream());
        link.a_to_b();
        link.b_to_a();
        link.a_to_b();
        link.b_to_a();
        link
    }

    fn data(len: usize) -> Bytes {
        (0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>().into()
    }

    #[rstest]
    #[case::in_order(vec![0, 1, 2])]
    #[case::out_of_order(vec![2, 0, 1])]
    #[case::reversed(vec![2, 1, 0])]
    #[case::duplicates(vec![1, 1, 0, 0, 2, 1])]
    fn test_reassemble_order(#[case] order: Vec<u16>) {
        let mut stream = stream();
        let payloads = ["abc", "def", "gh"];

        let mut received = Vec::new();
        for seq in order {
            if let Some(data) = stream.reassemble(vec![chunk(seq, payloads[seq as usize])]) {
                received.push(data);
            }
        }

        assert_eq!(received.concat(), b"abcdefgh".to_vec());
        assert_eq!(stream.in_chunk_seq, 3);
        assert_eq!(stream.num_buffered_chunks(), 0);
    }

    #[test]
    fn test_reassemble_delivers_contiguous_data_as_one_unit() {
        let mut stream = stream();
        assert_eq!(stream.reassemble(vec![chunk(1, "b"), chunk(2, "c")]), None);
        assert_eq!(stream.num_buffered_chunks(), 2);
        assert_eq!(stream.reassemble(vec![chunk(0, "a")]), Some(Bytes::from_static(b"abc")));
    }

    #[test]
    fn test_reassemble_wrap_around() {
        let mut stream = stream();
        stream.in_chunk_seq = 0xfffe;
        assert_eq!(stream.reassemble(vec![chunk(0, "c"), chunk(0xffff, "b")]), None);
        assert_eq!(stream.reassemble(vec![chunk(0xfffe, "a")]), Some(Bytes::from_static(b"abc")));
        assert_eq!(stream.in_chunk_seq, 1);
    }

    #[rstest]
    #[case::from_zero(0)]
    #[case::across_wrap_around(0xff80)]
    fn test_reassemble_gap_ahead_of_more_than_a_window(#[case] start: u16) {
        let payload = |i: u16| format!("{},", i);
        let mut stream = stream();
        stream.in_chunk_seq = start;

        for i in 1..=300 {
            assert_eq!(stream.reassemble(vec![chunk(start.wrapping_add(i), &payload(i))]), None);
        }
        assert_eq!(stream.reassemble(vec![chunk(start.wrapping_add(150), "again")]), None);
        assert_eq!(stream.num_buffered_chunks(), 300);

        let delivered = stream.reassemble(vec![chunk(start, &payload(0))]);
        let expected = (0..=300).map(payload).collect::<String>();
        assert_eq!(delivered, Some(Bytes::from(expected)));
        assert_eq!(stream.num_buffered_chunks(), 0);
        assert_eq!(stream.in_chunk_seq, start.wrapping_add(301));
    }

    #[test]
    fn test_reassemble_drops_stale_and_short_chunks() {
        let mut stream = stream();
        stream.in_chunk_seq = 10;
        assert_eq!(stream.reassemble(vec![chunk(9, "old"), Bytes::from_static(&[0])]), None);
        assert_eq!(stream.num_buffered_chunks(), 0);
    }

    #[rstest]
    #[case::empty(0, 0)]
    #[case::one_byte(1, 1)]
    #[case::one_chunk(253, 1)]
    #[case::two_chunks(254, 2)]
    #[case::many_chunks(1000, 4)]
    fn test_write_splits_into_chunks(#[case] len: usize, #[case] expected_chunks: usize) {
        let mut stream = stream();
        stream.write(data(len)).unwrap();
        assert_eq!(stream.connection().reliable().num_outgoing(), expected_chunks);
        assert_eq!(stream.out_chunk_seq as usize, expected_chunks);
    }

    #[test]
    fn test_stream_end_to_end() {
        let mut link = confirmed_link();
        let sent = data(2000);
        link.a.write(sent.clone()).unwrap();

        let (_, received) = link.exchange(10);
        assert_eq!(received.concat(), sent.to_vec());
    }

    #[test]
    fn test_stream_reorders_retransmitted_chunk() {
        let mut link = confirmed_link();
        link.a.write(Bytes::from_static(b"first ")).unwrap();
        link.a_to_nowhere();
        link.a.write(Bytes::from_static(b"second ")).unwrap();
        assert!(link.a_to_b().is_empty());
        link.a.write(Bytes::from_static(b"third")).unwrap();
        assert!(link.a_to_b().is_empty());
        assert_eq!(link.b.num_buffered_chunks(), 2);

        // b reports the missing message, a resends it
        link.b_to_a();
        assert_eq!(link.a_to_b(), vec![Bytes::from_static(b"first second third")]);
        assert_eq!(link.b.num_buffered_chunks(), 0);
    }

    #[test]
    fn test_write_sequence() {
        let mut link = confirmed_link();
        link.a.write_sequence([Bytes::from_static(b"ab"), Bytes::new(), Bytes::from_static(b"cd")]).unwrap();
        assert_eq!(link.a_to_b(), vec![Bytes::from_static(b"abcd")]);
    }
}

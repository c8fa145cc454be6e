use std::collections::BTreeMap;

use bytes::Bytes;
#[cfg(test)] use mockall::automock;

use crate::error::HomaError;

/// The application's side of a receive: a buffer that message bytes are copied into. Copying
///  may fail (e.g. for memory that is not writable), and a failed copy must leave the message
///  untouched so that it can be received again.
#[cfg_attr(test, automock)]
pub trait RecvBuffer: Send {
    /// the maximum number of bytes one receive call copies into this buffer
    fn capacity(&self) -> usize;

    /// copies `data` into the buffer, starting at `offset` relative to the start of the buffer
    fn write_at(&mut self, offset: usize, data: &[u8]) -> Result<(), HomaError>;
}

/// A plain heap-allocated [RecvBuffer]
#[derive(Debug, Clone)]
pub struct UserBuffer {
    data: Vec<u8>,
    len: usize,
}
impl UserBuffer {
    pub fn with_capacity(capacity: usize) -> UserBuffer {
        UserBuffer {
            data: vec![0; capacity],
            len: 0,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }
}
impl RecvBuffer for UserBuffer {
    fn capacity(&self) -> usize {
        self.data.len()
    }

    fn write_at(&mut self, offset: usize, data: &[u8]) -> Result<(), HomaError> {
        let end = offset + data.len();
        if end > self.data.len() {
            return Err(HomaError::Fault);
        }
        self.data[offset..end].copy_from_slice(data);
        self.len = self.len.max(end);
        Ok(())
    }
}

/// Reassembly state of a message being received.
///
/// Received data is stored as disjoint pieces keyed by their offset. A segment overlapping data
///  that is already present only contributes its new bytes, so retransmissions and overlapping
///  segments never count twice.
#[derive(Debug)]
pub struct IncomingMessage {
    declared_length: usize,
    pieces: BTreeMap<usize, Bytes>,
    /// all bytes in `0..contiguous_received` were received (some may have been copied out
    ///  already)
    contiguous_received: usize,
    bytes_received: usize,
    /// the number of bytes copied to the application so far; always a prefix
    copied_out: usize,
    /// the number of bytes the sender may transmit without further grants
    incoming: usize,
    scheduled: bool,
}

impl IncomingMessage {
    pub fn new(declared_length: usize, incoming: usize) -> IncomingMessage {
        let incoming = incoming.min(declared_length);
        IncomingMessage {
            declared_length,
            pieces: BTreeMap::new(),
            contiguous_received: 0,
            bytes_received: 0,
            copied_out: 0,
            incoming,
            scheduled: declared_length > incoming,
        }
    }

    pub fn declared_length(&self) -> usize {
        self.declared_length
    }

    pub fn contiguous_received(&self) -> usize {
        self.contiguous_received
    }

    pub fn bytes_received(&self) -> usize {
        self.bytes_received
    }

    pub fn bytes_remaining(&self) -> usize {
        self.declared_length - self.bytes_received
    }

    pub fn incoming(&self) -> usize {
        self.incoming
    }

    /// true if the message needed grants beyond its unscheduled bytes when it first arrived
    pub fn is_scheduled(&self) -> bool {
        self.scheduled
    }

    pub fn is_complete(&self) -> bool {
        self.contiguous_received == self.declared_length
    }

    pub fn needs_grant(&self) -> bool {
        self.incoming < self.declared_length
    }

    /// true if all bytes were copied to the application
    pub fn is_drained(&self) -> bool {
        self.copied_out == self.declared_length
    }

    pub fn copied_out(&self) -> usize {
        self.copied_out
    }

    /// Granted bytes that have not arrived yet. This is this message's share of the process-wide
    ///  incoming counter.
    pub fn outstanding(&self) -> i64 {
        self.incoming.saturating_sub(self.bytes_received) as i64
    }

    /// Raises the grant to `new_incoming` (never lowers it), returning the change of
    ///  [IncomingMessage::outstanding]
    pub fn grant(&mut self, new_incoming: usize) -> i64 {
        let before = self.outstanding();
        self.incoming = self.incoming.max(new_incoming.min(self.declared_length));
        self.outstanding() - before
    }

    /// Gives up on all bytes that were granted but did not arrive, returning the change of
    ///  [IncomingMessage::outstanding] (zero or negative)
    pub fn release_outstanding(&mut self) -> i64 {
        let before = self.outstanding();
        self.incoming = self.incoming.min(self.bytes_received);
        -before
    }

    /// Merges a received segment, returning the number of bytes it added that were not
    ///  received before. Bytes beyond the declared length are ignored.
    pub fn add_segment(&mut self, offset: usize, data: Bytes) -> usize {
        let end = (offset + data.len()).min(self.declared_length);
        // everything below contiguous_received is present, whether it was copied out or not
        let start = offset.max(self.contiguous_received);
        if start >= end {
            return 0;
        }

        let covered: Vec<(usize, usize)> = self.pieces.range(..start).next_back()
            .into_iter()
            .chain(self.pieces.range(start..end))
            .map(|(&s, p)| (s, s + p.len()))
            .filter(|&(_, e)| e > start)
            .collect();

        let mut gaps = Vec::new();
        let mut cursor = start;
        for (s, e) in covered {
            if cursor < s {
                gaps.push((cursor, s.min(end)));
            }
            cursor = cursor.max(e);
        }
        if cursor < end {
            gaps.push((cursor, end));
        }

        let mut added = 0;
        for (s, e) in gaps {
            self.pieces.insert(s, data.slice(s - offset..e - offset));
            added += e - s;
        }
        self.bytes_received += added;

        while let Some(piece) = self.pieces.get(&self.contiguous_received) {
            self.contiguous_received += piece.len();
        }
        added
    }

    /// Copies the next chunk of contiguous, not yet copied bytes into `dest`, limited by the
    ///  buffer's capacity. Nothing is consumed if the copy fails.
    pub fn copy_to(&mut self, dest: &mut dyn RecvBuffer) -> Result<usize, HomaError> {
        let end = self.contiguous_received.min(self.copied_out.saturating_add(dest.capacity()));

        let mut written = 0;
        for (&s, piece) in self.pieces.range(..end) {
            let piece_end = s + piece.len();
            if piece_end <= self.copied_out {
                continue;
            }
            let from = s.max(self.copied_out);
            let to = piece_end.min(end);
            dest.write_at(from - self.copied_out, &piece[from - s..to - s])?;
            written += to - from;
        }

        let consumed: Vec<usize> = self.pieces.range(..end).map(|(&s, _)| s).collect();
        for s in consumed {
            if let Some(piece) = self.pieces.remove(&s) {
                if s + piece.len() > end {
                    self.pieces.insert(end, piece.slice(end - s..));
                }
            }
        }
        self.copied_out = end;
        Ok(written)
    }

    /// The first range of granted bytes that is missing, as `(offset, length)`
    pub fn resend_range(&self) -> Option<(usize, usize)> {
        if self.is_complete() {
            return None;
        }
        let start = self.contiguous_received;
        let end = self.pieces.range(start..).next()
            .map(|(&s, _)| s)
            .unwrap_or(self.declared_length)
            .min(self.incoming);
        if end <= start {
            return None;
        }
        Some((start, end - start))
    }
}

/// A message being sent, split into fixed-size segments. Segments are transmitted in offset
///  order as grants allow; any transmitted range can be retransmitted on request.
#[derive(Debug)]
pub struct OutgoingMessage {
    payload: Bytes,
    segment_size: usize,
    next_xmit_offset: usize,
    granted: usize,
}

impl OutgoingMessage {
    pub fn new(payload: Bytes, segment_size: usize, unscheduled: usize) -> OutgoingMessage {
        let granted = unscheduled.min(payload.len());
        OutgoingMessage {
            payload,
            segment_size,
            next_xmit_offset: 0,
            granted,
        }
    }

    pub fn length(&self) -> usize {
        self.payload.len()
    }

    pub fn granted(&self) -> usize {
        self.granted
    }

    pub fn next_xmit_offset(&self) -> usize {
        self.next_xmit_offset
    }

    pub fn is_fully_transmitted(&self) -> bool {
        self.next_xmit_offset >= self.payload.len()
    }

    /// Raises the granted offset, returning true if that allows more transmission
    pub fn grant(&mut self, offset: usize) -> bool {
        let offset = offset.min(self.payload.len());
        if offset <= self.granted {
            return false;
        }
        self.granted = offset;
        self.next_xmit_offset < self.granted
    }

    /// Takes all segments that are granted but not transmitted yet, as `(offset, data)`.
    pub fn next_segments(&mut self) -> Vec<(usize, Bytes)> {
        let mut result = Vec::new();
        while self.next_xmit_offset < self.granted {
            let end = (self.next_xmit_offset + self.segment_size).min(self.payload.len());
            result.push((self.next_xmit_offset, self.payload.slice(self.next_xmit_offset..end)));
            self.next_xmit_offset = end;
        }
        result
    }

    /// Already transmitted segments overlapping `offset..offset+length`
    pub fn segments_in_range(&self, offset: usize, length: usize) -> Vec<(usize, Bytes)> {
        let end = (offset + length).min(self.next_xmit_offset);
        let mut cursor = offset - offset % self.segment_size;
        let mut result = Vec::new();
        while cursor < end {
            let seg_end = (cursor + self.segment_size).min(self.payload.len());
            result.push((cursor, self.payload.slice(cursor..seg_end)));
            cursor = seg_end;
        }
        result
    }

    /// Marks everything from `offset` on as not transmitted, e.g. after the packet I/O layer ran
    ///  out of buffers
    pub fn rewind_to(&mut self, offset: usize) {
        self.next_xmit_offset = self.next_xmit_offset.min(offset);
    }

    /// Starts transmission over, for a receiver that lost all state for the message
    pub fn restart(&mut self) {
        self.next_xmit_offset = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn payload(len: usize) -> Bytes {
        (0..len).map(|i| i as u8).collect::<Vec<_>>().into()
    }

    fn segment(offset: usize, len: usize) -> Bytes {
        payload(offset + len).slice(offset..)
    }

    #[rstest]
    #[case::in_order(100, vec![(0, 40), (40, 40), (80, 20)], 100, 100)]
    #[case::reversed(100, vec![(80, 20), (40, 40), (0, 40)], 100, 100)]
    #[case::gap(100, vec![(0, 40), (60, 40)], 40, 80)]
    #[case::overlapping(100, vec![(0, 50), (30, 50), (20, 10)], 80, 80)]
    #[case::covering(100, vec![(10, 10), (30, 10), (0, 60)], 60, 60)]
    #[case::duplicate(100, vec![(0, 30), (0, 30), (0, 30)], 30, 30)]
    #[case::beyond_length(50, vec![(0, 40), (40, 40)], 50, 50)]
    #[case::late_start(100, vec![(50, 50)], 0, 50)]
    fn test_add_segment(#[case] length: usize, #[case] segments: Vec<(usize, usize)>, #[case] expected_contiguous: usize, #[case] expected_received: usize) {
        let mut msg = IncomingMessage::new(length, length);
        for (offset, len) in segments {
            msg.add_segment(offset, segment(offset, len));
        }
        assert_eq!(msg.contiguous_received(), expected_contiguous);
        assert_eq!(msg.bytes_received(), expected_received);
        assert_eq!(msg.is_complete(), expected_contiguous == length);
        assert!(msg.contiguous_received() <= msg.declared_length());
    }

    #[test]
    fn test_add_segment_reports_new_bytes() {
        let mut msg = IncomingMessage::new(100, 100);
        assert_eq!(msg.add_segment(20, segment(20, 20)), 20);
        assert_eq!(msg.add_segment(0, segment(0, 50)), 30);
        assert_eq!(msg.add_segment(10, segment(10, 30)), 0);
    }

    #[test]
    fn test_reassembled_content() {
        let mut msg = IncomingMessage::new(100, 100);
        msg.add_segment(60, segment(60, 40));
        msg.add_segment(10, segment(10, 70));
        msg.add_segment(0, segment(0, 20));

        let mut buf = UserBuffer::with_capacity(100);
        assert_eq!(msg.copy_to(&mut buf).unwrap(), 100);
        assert_eq!(buf.as_slice(), payload(100).as_ref());
        assert!(msg.is_drained());
    }

    #[test]
    fn test_partial_copies() {
        let mut msg = IncomingMessage::new(200, 200);
        msg.add_segment(0, segment(0, 120));
        msg.add_segment(120, segment(120, 80));

        let mut first = UserBuffer::with_capacity(150);
        assert_eq!(msg.copy_to(&mut first).unwrap(), 150);
        assert_eq!(first.as_slice(), &payload(200)[..150]);
        assert!(!msg.is_drained());

        // a retransmission of copied data does not count again
        assert_eq!(msg.add_segment(0, segment(0, 120)), 0);

        let mut second = UserBuffer::with_capacity(200);
        assert_eq!(msg.copy_to(&mut second).unwrap(), 50);
        assert_eq!(second.as_slice(), &payload(200)[150..]);
        assert!(msg.is_drained());
    }

    #[test]
    fn test_copy_only_contiguous_prefix() {
        let mut msg = IncomingMessage::new(100, 100);
        msg.add_segment(0, segment(0, 30));
        msg.add_segment(50, segment(50, 30));

        let mut buf = UserBuffer::with_capacity(100);
        assert_eq!(msg.copy_to(&mut buf).unwrap(), 30);
        assert_eq!(msg.copied_out(), 30);
    }

    #[test]
    fn test_failed_copy_consumes_nothing() {
        let mut msg = IncomingMessage::new(100, 100);
        msg.add_segment(0, segment(0, 100));

        let mut failing = MockRecvBuffer::new();
        failing.expect_capacity().return_const(100usize);
        failing.expect_write_at().returning(|_, _| Err(HomaError::Fault));
        assert_eq!(msg.copy_to(&mut failing), Err(HomaError::Fault));
        assert_eq!(msg.copied_out(), 0);

        let mut buf = UserBuffer::with_capacity(100);
        assert_eq!(msg.copy_to(&mut buf).unwrap(), 100);
        assert_eq!(buf.as_slice(), payload(100).as_ref());
    }

    #[test]
    fn test_copy_into_unbounded_buffer() {
        let mut msg = IncomingMessage::new(200, 200);
        msg.add_segment(0, segment(0, 200));

        let mut first = UserBuffer::with_capacity(150);
        assert_eq!(msg.copy_to(&mut first).unwrap(), 150);

        let mut unbounded = MockRecvBuffer::new();
        unbounded.expect_capacity().return_const(usize::MAX);
        unbounded.expect_write_at()
            .withf(|offset, data| *offset == 0 && data == &payload(200)[150..])
            .times(1)
            .returning(|_, _| Ok(()));
        assert_eq!(msg.copy_to(&mut unbounded).unwrap(), 50);
        assert!(msg.is_drained());
    }

    #[rstest]
    #[case::nothing_received(10_000, 5000, vec![], Some((0, 5000)))]
    #[case::gap(10_000, 10_000, vec![(0, 1400), (2800, 1400)], Some((1400, 1400)))]
    #[case::tail(10_000, 5000, vec![(0, 1400)], Some((1400, 3600)))]
    #[case::all_granted_received(10_000, 1400, vec![(0, 1400)], None)]
    #[case::complete(2800, 2800, vec![(0, 1400), (1400, 1400)], None)]
    fn test_resend_range(#[case] length: usize, #[case] incoming: usize, #[case] segments: Vec<(usize, usize)>, #[case] expected: Option<(usize, usize)>) {
        let mut msg = IncomingMessage::new(length, incoming);
        for (offset, len) in segments {
            msg.add_segment(offset, segment(offset, len));
        }
        assert_eq!(msg.resend_range(), expected);
    }

    #[test]
    fn test_outstanding() {
        let mut msg = IncomingMessage::new(10_000, 5000);
        assert!(msg.is_scheduled());
        assert_eq!(msg.outstanding(), 5000);

        msg.add_segment(0, segment(0, 1400));
        assert_eq!(msg.outstanding(), 3600);

        assert_eq!(msg.grant(20_000), 5000);
        assert_eq!(msg.incoming(), 10_000);
        assert_eq!(msg.grant(3000), 0);

        assert_eq!(msg.release_outstanding(), -8600);
        assert_eq!(msg.outstanding(), 0);
    }

    #[test]
    fn test_unscheduled_message() {
        let msg = IncomingMessage::new(500, 10_000);
        assert!(!msg.is_scheduled());
        assert!(!msg.needs_grant());
        assert_eq!(msg.incoming(), 500);
    }

    #[rstest]
    #[case::single(1000, 1400, 10_000, vec![(0, 1000)])]
    #[case::exact_segments(2800, 1400, 10_000, vec![(0, 1400), (1400, 1400)])]
    #[case::unscheduled_limit(10_000, 1400, 5000, vec![(0, 1400), (1400, 1400), (2800, 1400), (4200, 1400)])]
    fn test_next_segments(#[case] length: usize, #[case] segment_size: usize, #[case] unscheduled: usize, #[case] expected: Vec<(usize, usize)>) {
        let mut msg = OutgoingMessage::new(payload(length), segment_size, unscheduled);
        let segments: Vec<(usize, usize)> = msg.next_segments().iter()
            .map(|(offset, data)| (*offset, data.len()))
            .collect();
        assert_eq!(segments, expected);
        assert!(msg.next_segments().is_empty());
    }

    #[test]
    fn test_outgoing_grant() {
        let mut msg = OutgoingMessage::new(payload(10_000), 1400, 5000);
        msg.next_segments();
        assert_eq!(msg.next_xmit_offset(), 5600);

        assert!(!msg.grant(5000));
        assert!(msg.grant(8000));
        assert_eq!(msg.next_segments().iter().map(|(o, _)| *o).collect::<Vec<_>>(), vec![5600, 7000]);
        assert!(!msg.is_fully_transmitted());

        assert!(msg.grant(50_000));
        assert_eq!(msg.granted(), 10_000);
        assert_eq!(msg.next_segments().iter().map(|(o, _)| *o).collect::<Vec<_>>(), vec![8400, 9800]);
        assert!(msg.is_fully_transmitted());
    }

    #[test]
    fn test_segments_in_range() {
        let mut msg = OutgoingMessage::new(payload(10_000), 1400, 5000);
        msg.next_segments();

        let resent: Vec<(usize, usize)> = msg.segments_in_range(1500, 1400).iter()
            .map(|(offset, data)| (*offset, data.len()))
            .collect();
        assert_eq!(resent, vec![(1400, 1400), (2800, 1400)]);

        // nothing that was not transmitted yet
        assert!(msg.segments_in_range(6000, 1000).is_empty());
    }

    #[test]
    fn test_rewind_and_restart() {
        let mut msg = OutgoingMessage::new(payload(4200), 1400, 10_000);
        msg.next_segments();
        msg.rewind_to(1400);
        assert_eq!(msg.next_segments().iter().map(|(o, _)| *o).collect::<Vec<_>>(), vec![1400, 2800]);

        msg.restart();
        assert_eq!(msg.next_segments().len(), 3);
    }
}

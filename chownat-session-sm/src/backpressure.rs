use std::collections::VecDeque;

/// The result of pushing bytes into a [`BackpressureBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PushOutcome {
    /// How many bytes were appended to the buffer.
    pub accepted: usize,

    /// How many bytes didn't fit and were dropped.
    pub dropped: usize,
}

impl PushOutcome {
    pub fn overflowed(&self) -> bool {
        self.dropped != 0
    }
}

/// A bounded FIFO of bytes that arrived from the transport but couldn't yet be written to the
/// local TCP client.
///
/// The buffer never holds more than `max_bytes`. When a push doesn't fit, the bytes that fit are
/// appended and the rest (the newest ones) are dropped and added to [`dropped_bytes`]. Bytes that
/// are already buffered are never touched by an overflow.
///
/// [`dropped_bytes`]: BackpressureBuffer::dropped_bytes
#[derive(Debug)]
pub struct BackpressureBuffer {
    queue: VecDeque<u8>,
    max_bytes: usize,
    dropped_bytes: u64,
}

impl BackpressureBuffer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            max_bytes,
            dropped_bytes: 0,
        }
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// How many more bytes can be pushed before the buffer starts dropping.
    pub fn remaining(&self) -> usize {
        self.max_bytes.saturating_sub(self.queue.len())
    }

    /// The total amount of bytes dropped by overflowing pushes over the buffer's lifetime.
    pub fn dropped_bytes(&self) -> u64 {
        self.dropped_bytes
    }

    pub fn push(&mut self, data: &[u8]) -> PushOutcome {
        let accepted = data.len().min(self.remaining());
        self.queue.extend(&data[..accepted]);

        let dropped = data.len() - accepted;
        self.dropped_bytes += dropped as u64;

        PushOutcome { accepted, dropped }
    }

    /// Returns the longest contiguous run of bytes at the front of the buffer. This may be shorter
    /// than [`len`](Self::len) if the underlying storage wrapped around, in which case the rest is
    /// returned after [`consume`](Self::consume)-ing this part.
    pub fn front(&self) -> &[u8] {
        self.queue.as_slices().0
    }

    /// Removes `count` bytes from the front of the buffer, typically after they were written.
    pub fn consume(&mut self, count: usize) {
        if count > self.queue.len() {
            panic!("consume({count}) called on a buffer with only {} bytes", self.queue.len());
        }

        self.queue.drain(..count);
    }

    /// Empties the buffer, returning how many bytes were discarded. Discarded bytes are not
    /// counted as dropped, since this is an intentional choice and not an overflow.
    pub fn clear(&mut self) -> usize {
        let len = self.queue.len();
        self.queue.clear();
        len
    }
}

#[cfg(test)]
mod tests {
    use super::{BackpressureBuffer, PushOutcome};

    fn drain_all(buffer: &mut BackpressureBuffer) -> Vec<u8> {
        let mut out = Vec::new();
        while !buffer.is_empty() {
            let front = buffer.front().to_vec();
            buffer.consume(front.len());
            out.extend_from_slice(&front);
        }
        out
    }

    #[test]
    fn test_push_within_bound() {
        let mut buffer = BackpressureBuffer::new(8);
        assert!(buffer.is_empty());

        assert_eq!(buffer.push(b"abc"), PushOutcome { accepted: 3, dropped: 0 });
        assert_eq!(buffer.push(b"de"), PushOutcome { accepted: 2, dropped: 0 });
        assert_eq!(buffer.len(), 5);
        assert_eq!(buffer.remaining(), 3);
        assert_eq!(buffer.dropped_bytes(), 0);
        assert_eq!(drain_all(&mut buffer), b"abcde");
    }

    #[test]
    fn test_overflow_drops_newest() {
        let mut buffer = BackpressureBuffer::new(6);

        assert_eq!(buffer.push(b"1234"), PushOutcome { accepted: 4, dropped: 0 });
        let outcome = buffer.push(b"56789");
        assert_eq!(outcome, PushOutcome { accepted: 2, dropped: 3 });
        assert!(outcome.overflowed());

        assert_eq!(buffer.push(b"xyz"), PushOutcome { accepted: 0, dropped: 3 });
        assert_eq!(buffer.dropped_bytes(), 6);
        assert_eq!(buffer.len(), 6);

        // The bytes already in the buffer are untouched by the overflow.
        assert_eq!(drain_all(&mut buffer), b"123456");
    }

    #[test]
    fn test_partial_flush_keeps_order() {
        let mut buffer = BackpressureBuffer::new(10);
        buffer.push(b"hello");

        assert_eq!(buffer.front(), b"hello");
        buffer.consume(2);
        assert_eq!(buffer.front(), b"llo");

        buffer.push(b"world!!");
        assert_eq!(buffer.len(), 10);
        assert_eq!(buffer.dropped_bytes(), 0);
        assert_eq!(buffer.push(b"?"), PushOutcome { accepted: 0, dropped: 1 });

        buffer.consume(3);
        assert_eq!(buffer.push(b"abc"), PushOutcome { accepted: 3, dropped: 0 });
        assert_eq!(drain_all(&mut buffer), b"world!!abc");
    }

    #[test]
    fn test_wrapped_storage_front_is_contiguous_prefix() {
        let mut buffer = BackpressureBuffer::new(16);
        for round in 0u8..20 {
            buffer.push(&[round; 7]);
            let front_len = buffer.front().len();
            assert!(front_len > 0 && front_len <= buffer.len());
            buffer.consume(5);
        }

        let rest = drain_all(&mut buffer);
        assert_eq!(rest.len() as u64 + 20 * 5 + buffer.dropped_bytes(), 20 * 7);
    }

    #[test]
    fn test_clear_is_not_counted_as_drop() {
        let mut buffer = BackpressureBuffer::new(4);
        buffer.push(b"abcdef");
        assert_eq!(buffer.dropped_bytes(), 2);

        assert_eq!(buffer.clear(), 4);
        assert!(buffer.is_empty());
        assert_eq!(buffer.dropped_bytes(), 2);
        assert_eq!(buffer.remaining(), 4);
    }

    #[test]
    #[should_panic]
    fn test_consume_past_end_panics() {
        let mut buffer = BackpressureBuffer::new(4);
        buffer.push(b"ab");
        buffer.consume(3);
    }
}

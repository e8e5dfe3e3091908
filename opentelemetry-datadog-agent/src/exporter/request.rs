//! Per-trace span buffers and the agent request built from them.
//!
//! Spans are encoded as soon as they are added. The array headers around them
//! are only written when the payload is materialized, from the final counts, so
//! sizes can be tracked exactly while the request is still growing.

use indexmap::IndexMap;

use crate::exporter::model::msgpack::{
    array_header_size, write_array_header, MAX_ARRAY_HEADER_SIZE, MSGPACK_MAX_LENGTH,
};
use crate::exporter::model::{v04, Error, Span};

/// Hard limit on the size of a payload accepted by the agent.
pub const PACKET_LIMIT: usize = 10_000_000;

/// Request size past which the bundler uploads before adding more spans.
pub const FLUSH_THRESHOLD: usize = PACKET_LIMIT / 2;

/// Largest accepted encoding of a single span.
///
/// A request is flushed as soon as it grows past [`FLUSH_THRESHOLD`], so it holds at
/// most that many bytes before the next add. Capping one span at the remaining
/// headroom (minus room for both array headers to grow) keeps every upload under
/// [`PACKET_LIMIT`].
pub const MAX_SPAN_SIZE: usize = PACKET_LIMIT - FLUSH_THRESHOLD - 4 * MAX_ARRAY_HEADER_SIZE;

/// Spans of a single trace, encoded back to back without their array header.
#[derive(Debug, Default, Clone)]
pub struct SpanPackets {
    count: u64,
    data: Vec<u8>,
}

impl SpanPackets {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Encodes `span` at the end of the buffer.
    ///
    /// Nothing is changed when an error is returned.
    pub fn add(&mut self, span: &Span) -> Result<(), Error> {
        if self.count >= MSGPACK_MAX_LENGTH {
            return Err(Error::Overflow);
        }

        let start = self.data.len();
        if let Err(err) = v04::encode_span(&mut self.data, span) {
            self.data.truncate(start);
            return Err(err);
        }

        let size = self.data.len() - start;
        if size > MAX_SPAN_SIZE {
            self.data.truncate(start);
            return Err(Error::SpanTooLarge {
                size,
                limit: MAX_SPAN_SIZE,
            });
        }

        self.count += 1;
        Ok(())
    }

    /// Number of spans in the buffer.
    pub fn len(&self) -> u64 {
        self.count
    }

    /// Returns `true` if no span was added since the last reset.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Size of the framed array, header included.
    pub fn size(&self) -> usize {
        self.data.len() + array_header_size(self.count)
    }

    /// Returns the framed array: the header for the current count followed by the
    /// encoded spans.
    pub fn bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.size());
        self.write_to(&mut buf);
        buf
    }

    pub(crate) fn write_to(&self, buf: &mut Vec<u8>) {
        write_array_header(buf, self.count);
        buf.extend_from_slice(&self.data);
    }

    /// Drops every span, keeping the allocation.
    pub fn reset(&mut self) {
        self.count = 0;
        self.data.clear();
    }
}

/// Traces waiting to be sent to the Datadog agent in a single request.
///
/// Packets are kept in first-seen trace order. The agent does not care about the
/// order of traces; spans inside a trace keep the order they were added in.
#[derive(Debug, Clone)]
pub struct TraceAgentRequest {
    packets: IndexMap<u64, SpanPackets>,
    size: usize,
    max_traces: u64,
}

impl Default for TraceAgentRequest {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceAgentRequest {
    /// Creates an empty request.
    pub fn new() -> Self {
        TraceAgentRequest {
            packets: IndexMap::new(),
            size: 0,
            max_traces: MSGPACK_MAX_LENGTH,
        }
    }

    /// Adds a span to the packet of its trace.
    ///
    /// Fails with [`Error::Overflow`] when the span starts a new trace and the
    /// request already holds the maximum number of traces. Nothing is changed when
    /// an error is returned.
    pub fn add(&mut self, span: &Span) -> Result<(), Error> {
        let is_new = !self.packets.contains_key(&span.trace_id);
        if is_new && self.packets.len() as u64 >= self.max_traces {
            return Err(Error::Overflow);
        }

        let packets = self.packets.entry(span.trace_id).or_default();
        let old = packets.size();
        if let Err(err) = packets.add(span) {
            if is_new {
                // a new entry is always the last one
                self.packets.pop();
            }
            return Err(err);
        }
        let new = packets.size();

        self.size = self.size + new - old;

        Ok(())
    }

    /// Number of distinct traces in the request.
    pub fn trace_count(&self) -> usize {
        self.packets.len()
    }

    /// Number of spans across all traces.
    pub fn span_count(&self) -> u64 {
        self.packets.values().map(SpanPackets::len).sum()
    }

    /// Returns `true` if the request holds no span.
    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Size of the payload [`buffer`](Self::buffer) would return.
    pub fn size(&self) -> usize {
        self.size + array_header_size(self.packets.len() as u64)
    }

    /// Returns the msgpack payload: an array of traces, each an array of spans.
    pub fn buffer(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.size());
        write_array_header(&mut buf, self.packets.len() as u64);
        for packet in self.packets.values() {
            packet.write_to(&mut buf);
        }
        buf
    }

    /// Drops every trace.
    pub fn reset(&mut self) {
        self.packets.clear();
        self.size = 0;
    }

    #[cfg(test)]
    fn with_max_traces(max_traces: u64) -> Self {
        TraceAgentRequest {
            max_traces,
            ..Self::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exporter::model::tests::get_span;

    fn encoded(span: &Span) -> Vec<u8> {
        let mut buf = Vec::new();
        v04::encode_span(&mut buf, span).unwrap();
        buf
    }

    fn recomputed_size(request: &TraceAgentRequest) -> usize {
        request.packets.values().map(SpanPackets::size).sum::<usize>()
            + array_header_size(request.packets.len() as u64)
    }

    #[test]
    fn test_packets_size_tracks_adds() {
        let mut packets = SpanPackets::new();
        assert!(packets.is_empty());
        assert_eq!(packets.size(), 0);

        let mut cumulative = 0;
        for i in 0..20u64 {
            let span = get_span(7, 1, 100 + i);
            cumulative += encoded(&span).len();
            packets.add(&span).unwrap();

            assert_eq!(packets.len(), i + 1);
            assert_eq!(
                packets.size(),
                cumulative + array_header_size(packets.len())
            );
            assert_eq!(packets.bytes().len(), packets.size());
        }
    }

    #[test]
    fn test_packets_bytes_keep_insertion_order() {
        let first = get_span(7, 0, 1);
        let second = get_span(7, 1, 2);
        let mut packets = SpanPackets::new();
        packets.add(&first).unwrap();
        packets.add(&second).unwrap();

        let mut expected = vec![0x92];
        expected.extend(encoded(&first));
        expected.extend(encoded(&second));
        assert_eq!(packets.bytes(), expected);
    }

    #[test]
    fn test_packets_reset_is_idempotent() {
        let spans: Vec<Span> = (0..3).map(|i| get_span(7, i, i + 1)).collect();
        let mut packets = SpanPackets::new();
        for span in &spans {
            packets.add(span).unwrap();
        }
        let first = packets.bytes();

        packets.reset();
        assert!(packets.is_empty());
        assert_eq!(packets.size(), 0);
        assert!(packets.bytes().is_empty());

        for span in &spans {
            packets.add(span).unwrap();
        }
        assert_eq!(packets.bytes(), first);
    }

    #[test]
    fn test_packets_overflow_leaves_state_unchanged() {
        let mut packets = SpanPackets::new();
        packets.add(&get_span(7, 0, 1)).unwrap();
        packets.count = MSGPACK_MAX_LENGTH;
        let size = packets.size();
        let data_len = packets.data.len();

        let err = packets.add(&get_span(7, 1, 2)).unwrap_err();
        assert!(matches!(err, Error::Overflow));
        assert_eq!(packets.len(), MSGPACK_MAX_LENGTH);
        assert_eq!(packets.size(), size);
        assert_eq!(packets.data.len(), data_len);
    }

    #[test]
    fn test_packets_reject_oversized_span() {
        let mut packets = SpanPackets::new();
        packets.add(&get_span(7, 0, 1)).unwrap();
        let before = packets.bytes();

        let mut huge = get_span(7, 1, 2);
        huge.meta.insert("payload".to_string(), "x".repeat(MAX_SPAN_SIZE));
        let err = packets.add(&huge).unwrap_err();
        assert!(matches!(err, Error::SpanTooLarge { limit: MAX_SPAN_SIZE, .. }));
        assert_eq!(packets.bytes(), before);
    }

    #[test]
    fn test_request_size_matches_recomputation() {
        let mut request = TraceAgentRequest::new();
        assert!(request.is_empty());
        assert_eq!(request.size(), 0);

        // enough traces and spans to cross the fixarray boundary at both levels
        for i in 0..200u64 {
            let trace_id = i % 17;
            request.add(&get_span(trace_id, i, i + 1)).unwrap();

            assert_eq!(request.size(), recomputed_size(&request));
            assert_eq!(request.buffer().len(), request.size());
        }
        assert_eq!(request.trace_count(), 17);
        assert_eq!(request.span_count(), 200);
    }

    #[test]
    fn test_request_buffer_layout() {
        // two traces, three spans
        let a1 = get_span(1, 0, 10);
        let b1 = get_span(2, 0, 20);
        let a2 = get_span(1, 10, 11);

        let mut request = TraceAgentRequest::new();
        request.add(&a1).unwrap();
        request.add(&b1).unwrap();
        request.add(&a2).unwrap();

        let mut trace_a = vec![0x92];
        trace_a.extend(encoded(&a1));
        trace_a.extend(encoded(&a2));
        let mut trace_b = vec![0x91];
        trace_b.extend(encoded(&b1));

        // trace order is not part of the contract, span order within a trace is
        let mut a_then_b = vec![0x92];
        a_then_b.extend(&trace_a);
        a_then_b.extend(&trace_b);
        let mut b_then_a = vec![0x92];
        b_then_a.extend(&trace_b);
        b_then_a.extend(&trace_a);

        let buffer = request.buffer();
        assert!(buffer == a_then_b || buffer == b_then_a);

        let mut rd = buffer.as_slice();
        assert_eq!(rmp::decode::read_array_len(&mut rd).unwrap(), 2);
    }

    #[test]
    fn test_request_reset_is_idempotent() {
        let spans: Vec<Span> = (0..30u64).map(|i| get_span(i % 4, i, i + 1)).collect();
        let mut request = TraceAgentRequest::new();
        for span in &spans {
            request.add(span).unwrap();
        }
        let first = request.buffer();
        let size = request.size();

        request.reset();
        assert!(request.is_empty());
        assert_eq!(request.size(), 0);
        assert!(request.buffer().is_empty());

        for span in &spans {
            request.add(span).unwrap();
        }
        assert_eq!(request.size(), size);
        assert_eq!(request.buffer(), first);
    }

    #[test]
    fn test_request_overflow_on_new_trace() {
        let mut request = TraceAgentRequest::with_max_traces(2);
        request.add(&get_span(1, 0, 1)).unwrap();
        request.add(&get_span(2, 0, 2)).unwrap();
        let before = request.buffer();
        let size = request.size();

        let err = request.add(&get_span(3, 0, 3)).unwrap_err();
        assert!(matches!(err, Error::Overflow));
        assert_eq!(request.trace_count(), 2);
        assert_eq!(request.size(), size);
        assert_eq!(request.buffer(), before);

        // existing traces still accept spans
        request.add(&get_span(1, 1, 4)).unwrap();
        assert_eq!(request.span_count(), 3);
        assert_eq!(request.size(), recomputed_size(&request));
    }

    #[test]
    fn test_request_failed_add_does_not_leave_empty_trace() {
        let mut request = TraceAgentRequest::new();
        request.add(&get_span(1, 0, 1)).unwrap();

        let mut huge = get_span(2, 0, 2);
        huge.meta.insert("payload".to_string(), "x".repeat(MAX_SPAN_SIZE));
        assert!(request.add(&huge).is_err());

        assert_eq!(request.trace_count(), 1);
        assert_eq!(request.size(), recomputed_size(&request));
    }

    #[test]
    fn test_limits() {
        assert_eq!(FLUSH_THRESHOLD, 5_000_000);
        assert!(FLUSH_THRESHOLD + MAX_SPAN_SIZE + 4 * MAX_ARRAY_HEADER_SIZE <= PACKET_LIMIT);
    }
}

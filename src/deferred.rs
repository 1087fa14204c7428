//! Buffers for events and bytes that cannot yet be delivered.
//!
//! Ingress events are queued while the handler has reception paused (or
//! while earlier events are still queued, to preserve ordering). Egress
//! body bytes are queued whenever the transport, the send window, or the
//! rate limiter is withholding capacity.

use std::collections::VecDeque;

use bytes::{Buf, Bytes, BytesMut};

use crate::message::{Headers, HttpMessage, UpgradeProtocol};

/// An ingress event buffered for later delivery to the handler.
#[derive(Debug)]
pub enum HttpEvent {
    Headers(HttpMessage),
    Body(Bytes),
    ChunkHeader(usize),
    ChunkComplete,
    Trailers(Headers),
    Upgrade(UpgradeProtocol),
    Eom,
}

impl HttpEvent {
    /// Bytes this event counts against the deferred-ingress budget.
    fn byte_size(&self) -> usize {
        match self {
            HttpEvent::Headers(msg) => msg.byte_size(),
            HttpEvent::Body(chain) => chain.len(),
            HttpEvent::Trailers(trailers) => trailers.byte_size(),
            _ => 0,
        }
    }
}

/// Ordered, size-bounded FIFO of buffered ingress events.
///
/// Created lazily by the transaction on first buffered event.
#[derive(Debug, Default)]
pub struct DeferredIngress {
    events: VecDeque<HttpEvent>,
    buffered_bytes: usize,
}

impl DeferredIngress {
    pub fn new() -> Self {
        DeferredIngress::default()
    }

    /// Queue an event. Returns false (and still queues) once the buffered
    /// total exceeds `max_bytes`; the caller decides whether that stalls
    /// the peer or kills the transaction.
    pub fn push(&mut self, event: HttpEvent, max_bytes: usize) -> bool {
        self.buffered_bytes += event.byte_size();
        self.events.push_back(event);
        self.buffered_bytes <= max_bytes
    }

    pub fn pop(&mut self) -> Option<HttpEvent> {
        let event = self.events.pop_front()?;
        self.buffered_bytes -= event.byte_size();
        Some(event)
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes
    }

    pub fn clear(&mut self) {
        self.events.clear();
        self.buffered_bytes = 0;
    }
}

/// Append-only chain of outbound body segments with O(1) length tracking.
///
/// Segments are consumed from the front; a split inside the first segment
/// is zero-copy, a split spanning segments coalesces into one allocation.
#[derive(Debug, Default)]
pub struct EgressBuffer {
    segments: VecDeque<Bytes>,
    len: usize,
}

impl EgressBuffer {
    pub fn new() -> Self {
        EgressBuffer::default()
    }

    pub fn append(&mut self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        self.len += data.len();
        self.segments.push_back(data);
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Remove and return the first `n` bytes (all buffered bytes if fewer).
    pub fn split_to(&mut self, n: usize) -> Bytes {
        let n = n.min(self.len);
        if n == 0 {
            return Bytes::new();
        }
        self.len -= n;

        let first = self.segments.front_mut().expect("len > 0 implies segments");
        if first.len() > n {
            return first.split_to(n);
        }
        if first.len() == n {
            return self.segments.pop_front().unwrap();
        }

        // Spans segments: coalesce.
        let mut out = BytesMut::with_capacity(n);
        let mut remaining = n;
        while remaining > 0 {
            let seg = self.segments.front_mut().unwrap();
            if seg.len() <= remaining {
                remaining -= seg.len();
                out.extend_from_slice(seg);
                self.segments.pop_front();
            } else {
                out.extend_from_slice(&seg.split_to(remaining));
                remaining = 0;
            }
        }
        out.freeze()
    }

    /// Drop the first `n` bytes without yielding them (partial-reliability
    /// skip). Returns the number actually dropped.
    pub fn trim_front(&mut self, n: usize) -> usize {
        let n = n.min(self.len);
        let mut remaining = n;
        while remaining > 0 {
            let seg = self.segments.front_mut().unwrap();
            if seg.len() <= remaining {
                remaining -= seg.len();
                self.segments.pop_front();
            } else {
                seg.advance(remaining);
                remaining = 0;
            }
        }
        self.len -= n;
        n
    }

    pub fn clear(&mut self) {
        self.segments.clear();
        self.len = 0;
    }
}

/// A pending chunk-length marker for non-multiplexed (HTTP/1.1 chunked)
/// egress framing.
#[derive(Debug)]
pub struct Chunk {
    pub length: usize,
    pub header_sent: bool,
}

impl Chunk {
    pub fn new(length: usize) -> Self {
        Chunk {
            length,
            header_sent: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deferred_ingress_fifo_order() {
        let mut q = DeferredIngress::new();
        q.push(HttpEvent::Headers(HttpMessage::request("GET", "/")), 1024);
        q.push(HttpEvent::Body(Bytes::from_static(b"abc")), 1024);
        q.push(HttpEvent::Eom, 1024);
        assert_eq!(q.len(), 3);
        assert!(matches!(q.pop(), Some(HttpEvent::Headers(_))));
        assert!(matches!(q.pop(), Some(HttpEvent::Body(_))));
        assert!(matches!(q.pop(), Some(HttpEvent::Eom)));
        assert!(q.pop().is_none());
    }

    #[test]
    fn deferred_ingress_budget() {
        let mut q = DeferredIngress::new();
        assert!(q.push(HttpEvent::Body(Bytes::from(vec![0u8; 60])), 100));
        assert!(!q.push(HttpEvent::Body(Bytes::from(vec![0u8; 60])), 100));
        assert_eq!(q.buffered_bytes(), 120);
        q.pop();
        assert_eq!(q.buffered_bytes(), 60);
    }

    #[test]
    fn egress_split_within_segment() {
        let mut buf = EgressBuffer::new();
        buf.append(Bytes::from_static(b"hello world"));
        let first = buf.split_to(5);
        assert_eq!(&first[..], b"hello");
        assert_eq!(buf.len(), 6);
        let rest = buf.split_to(100);
        assert_eq!(&rest[..], b" world");
        assert!(buf.is_empty());
    }

    #[test]
    fn egress_split_across_segments() {
        let mut buf = EgressBuffer::new();
        buf.append(Bytes::from_static(b"abc"));
        buf.append(Bytes::from_static(b"def"));
        buf.append(Bytes::from_static(b"ghi"));
        let chunk = buf.split_to(5);
        assert_eq!(&chunk[..], b"abcde");
        assert_eq!(buf.len(), 4);
        assert_eq!(&buf.split_to(4)[..], b"fghi");
    }

    #[test]
    fn egress_trim_front() {
        let mut buf = EgressBuffer::new();
        buf.append(Bytes::from_static(b"abcd"));
        buf.append(Bytes::from_static(b"efgh"));
        assert_eq!(buf.trim_front(6), 6);
        assert_eq!(buf.len(), 2);
        assert_eq!(&buf.split_to(2)[..], b"gh");
        // Trimming more than buffered drops what is there.
        buf.append(Bytes::from_static(b"xy"));
        assert_eq!(buf.trim_front(10), 2);
        assert!(buf.is_empty());
    }

    #[test]
    fn empty_append_ignored() {
        let mut buf = EgressBuffer::new();
        buf.append(Bytes::new());
        assert!(buf.is_empty());
        assert_eq!(buf.split_to(1).len(), 0);
    }
}

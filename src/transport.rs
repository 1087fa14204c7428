//! The transport-facing contract.
//!
//! The transport is the session/codec side of the transaction: it frames
//! and writes egress, delivers ingress, and owns the socket. All methods
//! are non-blocking; `send_*` return the number of bytes handed to the
//! wire layer (zero when the write was absorbed into session buffers).

use std::net::SocketAddr;

use bytes::Bytes;

use crate::error::ErrorCode;
use crate::message::{Headers, HttpMessage};
use crate::priority::Priority;
use crate::StreamId;

/// Static properties of the codec behind the transport.
#[derive(Debug, Clone, Copy)]
pub struct CodecInfo {
    /// Whether the codec multiplexes streams (h2/h3). Non-multiplexed
    /// codecs need explicit chunk framing from the transaction.
    pub multiplexed: bool,
    /// Whether the codec supports server push.
    pub supports_push: bool,
    /// Whether body bytes may be skipped or rejected by offset.
    pub partially_reliable: bool,
}

/// Operations the transaction consumes from its session/codec.
///
/// The `peek`/`consume`/`skip_body_to`/`reject_body_to`/
/// `track_egress_body_delivery` group is optional; codecs that do not
/// implement it return `Err(ErrorCode::InternalError)` and the transaction
/// surfaces a non-fatal unsupported-operation error to its caller.
pub trait Transport {
    fn pause_ingress(&mut self, txn: StreamId);

    fn resume_ingress(&mut self, txn: StreamId);

    /// The transaction's idle timer expired.
    fn transaction_timeout(&mut self, txn: StreamId);

    /// The transaction is finished; it must not be called into after this.
    fn detach(&mut self, txn: StreamId);

    /// Hand the egress headers to the codec. Returns bytes written.
    fn send_headers(&mut self, txn: StreamId, headers: &HttpMessage, eom: bool) -> usize;

    fn send_body(&mut self, txn: StreamId, body: Bytes, eom: bool, track_last_byte: bool)
        -> usize;

    fn send_chunk_header(&mut self, txn: StreamId, length: usize) -> usize;

    fn send_chunk_terminator(&mut self, txn: StreamId) -> usize;

    fn send_eom(&mut self, txn: StreamId, trailers: Option<&Headers>) -> usize;

    fn send_abort(&mut self, txn: StreamId, code: ErrorCode) -> usize;

    /// Abort a dependent (pushed or extended) transaction by id. Used for
    /// cascading aborts; the session routes this to the right stream.
    fn send_abort_dependent(&mut self, txn: StreamId, code: ErrorCode) -> usize;

    fn send_priority(&mut self, txn: StreamId, priority: &Priority) -> usize;

    fn send_window_update(&mut self, txn: StreamId, delta: u32) -> usize;

    /// A transaction has buffered egress; schedule a write pass.
    fn notify_pending_egress(&mut self);

    /// `bytes` of ingress body were delivered to the handler.
    fn notify_ingress_body_processed(&mut self, bytes: u32);

    /// Deferred egress grew (`bytes > 0`) or shrank (`bytes < 0`).
    fn notify_egress_body_buffered(&mut self, bytes: i64);

    /// Open a pushed stream bound to `assoc`. `None` if pushing is not
    /// possible right now (peer disabled it, draining, limits).
    fn new_pushed_transaction(&mut self, assoc: StreamId) -> Option<StreamId>;

    /// Open an extended stream bound to the control stream `control`.
    fn new_ex_transaction(&mut self, control: StreamId, unidirectional: bool)
        -> Option<StreamId>;

    fn codec(&self) -> CodecInfo;

    fn local_address(&self) -> Option<SocketAddr>;

    fn peer_address(&self) -> Option<SocketAddr>;

    fn is_draining(&self) -> bool;

    /// Whether the transport handshake has reached replay safety.
    fn is_replay_safe(&self) -> bool;

    // ── Optional codec operations ────────────────────────────────────

    /// Run `cb` over each contiguous byte range in the codec's read
    /// buffer for this stream, without consuming.
    fn peek(
        &mut self,
        _txn: StreamId,
        _cb: &mut dyn FnMut(u64, &[u8]),
    ) -> Result<(), ErrorCode> {
        Err(ErrorCode::InternalError)
    }

    /// Consume `amount` bytes from the front of the codec's read buffer.
    fn consume(&mut self, _txn: StreamId, _amount: usize) -> Result<(), ErrorCode> {
        Err(ErrorCode::InternalError)
    }

    /// Advertise that body below `offset` will not be sent.
    fn skip_body_to(&mut self, _txn: StreamId, _offset: u64) -> Result<Option<u64>, ErrorCode> {
        Err(ErrorCode::InternalError)
    }

    /// Advertise that body below `offset` is no longer wanted.
    fn reject_body_to(&mut self, _txn: StreamId, _offset: u64) -> Result<Option<u64>, ErrorCode> {
        Err(ErrorCode::InternalError)
    }

    /// Ask the transport to confirm delivery of body up to `offset`.
    fn track_egress_body_delivery(
        &mut self,
        _txn: StreamId,
        _offset: u64,
    ) -> Result<(), ErrorCode> {
        Err(ErrorCode::InternalError)
    }
}

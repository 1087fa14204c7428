//! The handler-facing contract.

use std::time::Duration;

use bytes::Bytes;

use crate::error::{ErrorCode, TxnError};
use crate::message::{Headers, HttpMessage, UpgradeProtocol};
use crate::transaction::{Transaction, TxnCtx};
use crate::StreamId;

/// Application logic attached to one transaction.
///
/// Every callback receives the transaction and a context with the handler
/// slot vacated, so the handler can issue egress, pause/resume, or abort
/// from inside any callback. Ingress callbacks arrive in codec order; if
/// the handler paused ingress they are delayed until it resumes.
///
/// `detach_transaction` is terminal: the transaction must not be used
/// after it returns.
#[allow(unused_variables)]
pub trait Handler {
    /// Reports the stream this handler is bound to. Called once, before
    /// any other callback.
    fn set_transaction(&mut self, txn: StreamId) {}

    /// Usually the first ingress callback; at most once per transaction
    /// (a read error can precede it).
    fn on_headers_complete(&mut self, txn: &mut Transaction, ctx: &mut TxnCtx<'_>, msg: HttpMessage);

    fn on_body(&mut self, txn: &mut Transaction, ctx: &mut TxnCtx<'_>, chain: Bytes);

    /// Body delivery with its stream offset; only invoked in partially
    /// reliable mode. Defaults to plain `on_body`.
    fn on_body_with_offset(
        &mut self,
        txn: &mut Transaction,
        ctx: &mut TxnCtx<'_>,
        offset: u64,
        chain: Bytes,
    ) {
        self.on_body(txn, ctx, chain);
    }

    /// Start of a chunk of `length` bytes; body follows.
    fn on_chunk_header(&mut self, txn: &mut Transaction, ctx: &mut TxnCtx<'_>, length: usize) {}

    fn on_chunk_complete(&mut self, txn: &mut Transaction, ctx: &mut TxnCtx<'_>) {}

    fn on_trailers(&mut self, txn: &mut Transaction, ctx: &mut TxnCtx<'_>, trailers: Headers);

    /// No more normal ingress after this; the transaction remains usable
    /// for egress until detach.
    fn on_eom(&mut self, txn: &mut Transaction, ctx: &mut TxnCtx<'_>);

    fn on_upgrade(&mut self, txn: &mut Transaction, ctx: &mut TxnCtx<'_>, protocol: UpgradeProtocol);

    /// At most one per transaction; later ingress callbacks are
    /// suppressed. Check the error's direction: INGRESS errors may still
    /// permit egress.
    fn on_error(&mut self, txn: &mut Transaction, ctx: &mut TxnCtx<'_>, error: TxnError);

    /// A GOAWAY covering this stream arrived. May repeat (h2 allows it).
    fn on_goaway(&mut self, txn: &mut Transaction, ctx: &mut TxnCtx<'_>, code: ErrorCode) {}

    /// The remote receive buffer, the send window, or the local egress
    /// buffer filled up; stop generating egress if possible.
    fn on_egress_paused(&mut self, txn: &mut Transaction, ctx: &mut TxnCtx<'_>);

    fn on_egress_resumed(&mut self, txn: &mut Transaction, ctx: &mut TxnCtx<'_>);

    /// A pushed transaction arrived; install a handler for `pushed` or the
    /// session aborts it.
    fn on_pushed_transaction(&mut self, txn: &mut Transaction, ctx: &mut TxnCtx<'_>, pushed: StreamId) {
    }

    /// An extended transaction arrived on this control stream.
    fn on_ex_transaction(&mut self, txn: &mut Transaction, ctx: &mut TxnCtx<'_>, ex: StreamId) {}

    /// Unframed (partially reliable) body transfer started at `offset`.
    fn on_unframed_body_started(&mut self, txn: &mut Transaction, ctx: &mut TxnCtx<'_>, offset: u64) {
    }

    /// Bytes are available to peek in the transport read buffer.
    fn on_body_peek(&mut self, txn: &mut Transaction, ctx: &mut TxnCtx<'_>, offset: u64) {}

    /// The sender skipped body below `offset`.
    fn on_body_skipped(&mut self, txn: &mut Transaction, ctx: &mut TxnCtx<'_>, offset: u64) {}

    /// The receiver rejected body below `offset`.
    fn on_body_rejected(&mut self, txn: &mut Transaction, ctx: &mut TxnCtx<'_>, offset: u64) {}

    /// Terminal callback; exactly once per transaction.
    fn detach_transaction(&mut self);
}

/// Observer for byte-level delivery events on the egress stream.
///
/// Attached via
/// [`set_transport_callback`](crate::Transaction::set_transport_callback)
/// by handlers that track latency or delivery.
#[allow(unused_variables)]
pub trait TransportCallback {
    fn first_header_byte_flushed(&mut self) {}

    fn first_byte_flushed(&mut self) {}

    fn last_byte_flushed(&mut self) {}

    /// Time between the last byte leaving and the peer acknowledging it.
    fn last_byte_acked(&mut self, latency: Duration) {}

    /// Size of the generated egress header block.
    fn header_bytes_generated(&mut self, bytes: usize) {}

    fn body_bytes_generated(&mut self, bytes: usize) {}

    fn body_bytes_received(&mut self, bytes: usize) {}

    /// The deferred egress buffer drained to empty.
    fn egress_buffer_empty(&mut self) {}

    /// The peer confirmed delivery of body up to `offset`.
    fn body_bytes_delivered(&mut self, offset: u64) {}

    /// Delivery tracking below `offset` was cancelled.
    fn body_bytes_delivery_cancelled(&mut self, offset: u64) {}
}

//! The transaction core.
//!
//! A [`Transaction`] is one request/response exchange multiplexed onto a
//! shared connection. It validates the sequence of ingress and egress
//! events against two per-direction automata, buffers and flow-controls
//! body bytes, coordinates ingress pause/resume with egress back-pressure,
//! and detaches from handler and transport exactly once when both
//! directions terminate.
//!
//! The transaction performs no I/O and holds no long-lived references.
//! Every externally-entered method takes a [`TxnCtx`]: a short-lived
//! borrow of the transport, the egress scheduler, the handler, and the
//! current time. Handler callbacks receive the transaction plus the same
//! context with the handler slot vacated, so application code can issue
//! egress, pause, resume, or abort from inside any callback.
//!
//! Re-entrancy is handled with an entry-depth guard: notifications that
//! would re-enter the handler while it is already on the stack (pause
//! state changes, errors, detach) are latched and delivered when the
//! outermost entry unwinds.

use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::config::{ExAttributes, TxnConfig};
use crate::deferred::{Chunk, DeferredIngress, EgressBuffer, HttpEvent};
use crate::error::{Direction, ErrorCode, ErrorKind, TxnError};
use crate::handler::{Handler, TransportCallback};
use crate::message::{Headers, HttpMessage, UpgradeProtocol};
use crate::metrics;
use crate::priority::{EgressQueue, Priority, QueueHandle};
use crate::rate::RateLimiter;
use crate::state::{
    egress_transition, ingress_transition, EgressEvent, EgressState, IngressEvent, IngressState,
};
use crate::transport::Transport;
use crate::window::Window;
use crate::StreamId;

/// Which side of the proxy relationship this transaction is on.
///
/// A downstream transaction receives requests and sends responses; an
/// upstream transaction sends requests and receives responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnDirection {
    Upstream,
    Downstream,
}

/// Short-lived borrow of the transaction's collaborators, passed into
/// every externally-entered method.
///
/// Session-driven entries must supply the handler. Inside handler
/// callbacks the `handler` slot is `None` (the handler is the caller);
/// notifications raised there are latched and flushed when the session
/// entry that triggered the callback unwinds.
pub struct TxnCtx<'a> {
    pub transport: &'a mut dyn Transport,
    pub queue: &'a mut dyn EgressQueue,
    pub handler: Option<&'a mut dyn Handler>,
    pub now: Instant,
}

impl<'a> TxnCtx<'a> {
    pub fn new(
        transport: &'a mut dyn Transport,
        queue: &'a mut dyn EgressQueue,
        handler: &'a mut dyn Handler,
        now: Instant,
    ) -> Self {
        TxnCtx {
            transport,
            queue,
            handler: Some(handler),
            now,
        }
    }
}

/// One request/response pair multiplexed on a session.
pub struct Transaction {
    id: StreamId,
    direction: TxnDirection,

    ingress_state: IngressState,
    egress_state: EgressState,

    use_flow_control: bool,
    recv_window: Window,
    send_window: Window,
    /// Delivered ingress bytes not yet acknowledged to the peer.
    recv_to_ack: u32,

    max_deferred_ingress: usize,
    deferred_ingress: Option<Box<DeferredIngress>>,

    egress_buffer_limit: usize,
    deferred_egress: EgressBuffer,
    chunk_headers: VecDeque<Chunk>,
    trailers: Option<Headers>,

    rate_limiter: RateLimiter,

    priority: Priority,
    queue_handle: QueueHandle,
    cumulative_ratio: f64,
    egress_calls: u64,

    assoc_stream_id: Option<StreamId>,
    ex_attributes: Option<ExAttributes>,
    pushed_transactions: HashSet<StreamId>,
    ex_transactions: HashSet<StreamId>,

    expected_ingress_length: Option<u64>,
    ingress_length_remaining: Option<u64>,
    expected_response_length: Option<u64>,
    actual_response_length: u64,
    last_response_status: u16,
    head_request: bool,

    /// Arrival offset of the ingress body stream (includes skipped bytes).
    ingress_body_offset: u64,
    /// Delivery offset handed to the handler (trails the arrival offset by
    /// whatever is queued).
    ingress_body_delivered: u64,
    /// Egress body bytes handed to the transport (or skipped past).
    egress_body_bytes_committed: u64,
    partially_reliable: bool,
    egress_headers_delivered: bool,

    pending_byte_events: u8,

    idle_timeout: Option<Duration>,
    idle_deadline: Option<Instant>,
    rate_wake: Option<Instant>,

    transport_cb: Option<Box<dyn TransportCallback>>,
    enable_last_byte_flushed_tracking: bool,
    enable_body_delivery_tracking: bool,

    // Status flags.
    ingress_paused: bool,
    /// Transport-induced egress pause (remote back-pressure).
    egress_paused: bool,
    /// Send window cannot cover the buffered egress.
    flow_control_paused: bool,
    /// Pause state last delivered to the handler.
    handler_egress_paused: bool,
    egress_rate_limited: bool,
    aborted: bool,
    detached: bool,
    first_byte_sent: bool,
    first_header_byte_sent: bool,
    in_resume: bool,
    in_unwind: bool,
    in_active_set: bool,
    ingress_error_seen: bool,
    error_delivered: bool,

    /// Entry-depth counter; deferred work runs when it returns to zero.
    guard_depth: u32,
    /// Error awaiting delivery once the handler is reachable.
    pending_error: Option<TxnError>,
}

impl Transaction {
    /// Create a transaction and register it with the egress scheduler.
    pub fn new(
        direction: TxnDirection,
        id: StreamId,
        config: TxnConfig,
        queue: &mut dyn EgressQueue,
    ) -> Self {
        debug_assert!(config.validate().is_ok());
        let queue_handle = queue.add(id, config.priority);
        metrics::TXN_OPENED.increment();
        metrics::TXN_ACTIVE.increment();

        let mut txn = Transaction {
            id,
            direction,
            ingress_state: IngressState::Start,
            egress_state: EgressState::Start,
            use_flow_control: config.use_flow_control,
            recv_window: Window::new(config.recv_initial_window),
            send_window: Window::new(config.send_initial_window),
            recv_to_ack: 0,
            max_deferred_ingress: config.max_deferred_ingress,
            deferred_ingress: None,
            egress_buffer_limit: config.egress_buffer_limit,
            deferred_egress: EgressBuffer::new(),
            chunk_headers: VecDeque::new(),
            trailers: None,
            rate_limiter: RateLimiter::new(),
            priority: config.priority,
            queue_handle,
            cumulative_ratio: 0.0,
            egress_calls: 0,
            assoc_stream_id: config.assoc_stream_id,
            ex_attributes: config.ex_attributes,
            pushed_transactions: HashSet::new(),
            ex_transactions: HashSet::new(),
            expected_ingress_length: None,
            ingress_length_remaining: None,
            expected_response_length: None,
            actual_response_length: 0,
            last_response_status: 0,
            head_request: false,
            ingress_body_offset: 0,
            ingress_body_delivered: 0,
            egress_body_bytes_committed: 0,
            partially_reliable: false,
            egress_headers_delivered: false,
            pending_byte_events: 0,
            idle_timeout: config.idle_timeout,
            idle_deadline: None,
            rate_wake: None,
            transport_cb: None,
            enable_last_byte_flushed_tracking: false,
            enable_body_delivery_tracking: false,
            ingress_paused: false,
            egress_paused: false,
            flow_control_paused: false,
            handler_egress_paused: false,
            egress_rate_limited: false,
            aborted: false,
            detached: false,
            first_byte_sent: false,
            first_header_byte_sent: false,
            in_resume: false,
            in_unwind: false,
            in_active_set: false,
            ingress_error_seen: false,
            error_delivered: false,
            guard_depth: 0,
            pending_error: None,
        };

        // A unidirectional extended transaction carries data one way only:
        // remote-initiated means we never send, locally initiated means we
        // never receive.
        if let Some(ex) = txn.ex_attributes {
            if ex.unidirectional {
                if txn.is_remote_initiated() {
                    txn.egress_state = EgressState::SendingDone;
                } else {
                    txn.ingress_state = IngressState::ReceivingDone;
                }
            }
        }

        txn
    }

    // ── Identity and queries ─────────────────────────────────────────

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn direction(&self) -> TxnDirection {
        self.direction
    }

    pub fn is_upstream(&self) -> bool {
        self.direction == TxnDirection::Upstream
    }

    pub fn is_downstream(&self) -> bool {
        self.direction == TxnDirection::Downstream
    }

    /// Whether the remote side opened this stream. Client-initiated
    /// streams carry odd ids, server-initiated streams even ids.
    pub fn is_remote_initiated(&self) -> bool {
        (self.is_downstream() && self.id.0 % 2 == 1)
            || (self.is_upstream() && self.id.0 % 2 == 0)
    }

    pub fn ingress_state(&self) -> IngressState {
        self.ingress_state
    }

    pub fn egress_state(&self) -> EgressState {
        self.egress_state
    }

    pub fn is_ingress_started(&self) -> bool {
        self.ingress_state != IngressState::Start
    }

    pub fn is_ingress_eom_queued(&self) -> bool {
        self.ingress_state == IngressState::EomQueued
    }

    pub fn is_ingress_complete(&self) -> bool {
        self.ingress_state == IngressState::ReceivingDone
    }

    pub fn is_ingress_eom_seen(&self) -> bool {
        self.is_ingress_eom_queued() || self.is_ingress_complete()
    }

    pub fn is_egress_started(&self) -> bool {
        self.egress_state != EgressState::Start
    }

    pub fn is_egress_eom_queued(&self) -> bool {
        self.egress_state == EgressState::EomQueued
    }

    pub fn is_egress_complete(&self) -> bool {
        self.egress_state == EgressState::SendingDone
    }

    pub fn is_egress_eom_seen(&self) -> bool {
        self.is_egress_eom_queued() || self.is_egress_complete()
    }

    pub fn is_ingress_paused(&self) -> bool {
        self.ingress_paused
    }

    /// Pause state as seen by the handler.
    pub fn is_egress_paused(&self) -> bool {
        self.handler_egress_paused
    }

    pub fn is_flow_control_paused(&self) -> bool {
        self.flow_control_paused
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// True once the terminal detach has run; the session should drop the
    /// transaction.
    pub fn is_detached(&self) -> bool {
        self.detached
    }

    pub fn is_pushed(&self) -> bool {
        self.assoc_stream_id.is_some()
    }

    pub fn is_ex_transaction(&self) -> bool {
        self.ex_attributes.is_some()
    }

    pub fn is_unidirectional(&self) -> bool {
        self.ex_attributes.map(|ex| ex.unidirectional).unwrap_or(false)
    }

    pub fn assoc_stream_id(&self) -> Option<StreamId> {
        self.assoc_stream_id
    }

    pub fn control_stream(&self) -> Option<StreamId> {
        self.ex_attributes.map(|ex| ex.control_stream)
    }

    pub fn ex_attributes(&self) -> Option<ExAttributes> {
        self.ex_attributes
    }

    pub fn pushed_transactions(&self) -> &HashSet<StreamId> {
        &self.pushed_transactions
    }

    pub fn ex_transactions(&self) -> &HashSet<StreamId> {
        &self.ex_transactions
    }

    pub fn remove_pushed_transaction(&mut self, pushed: StreamId) {
        self.pushed_transactions.remove(&pushed);
    }

    pub fn remove_ex_transaction(&mut self, ex: StreamId) {
        self.ex_transactions.remove(&ex);
    }

    pub fn has_pending_body(&self) -> bool {
        !self.deferred_egress.is_empty()
    }

    pub fn outstanding_egress_body_bytes(&self) -> usize {
        self.deferred_egress.len()
    }

    pub fn receive_window(&self) -> &Window {
        &self.recv_window
    }

    pub fn send_window(&self) -> &Window {
        &self.send_window
    }

    /// Delivered ingress bytes not yet acknowledged with a window update.
    pub fn recv_to_ack(&self) -> u32 {
        self.recv_to_ack
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Average relative scheduling weight and the number of egress turns.
    pub fn priority_summary(&self) -> (f64, u64) {
        let avg = if self.egress_calls > 0 {
            self.cumulative_ratio / self.egress_calls as f64
        } else {
            0.0
        };
        (avg, self.egress_calls)
    }

    pub fn last_response_status(&self) -> u16 {
        self.last_response_status
    }

    /// Declared ingress content-length, if any.
    pub fn expected_ingress_length(&self) -> Option<u64> {
        self.expected_ingress_length
    }

    /// Egress body bytes produced so far.
    pub fn actual_response_length(&self) -> u64 {
        self.actual_response_length
    }

    /// Arrival offset of the ingress body stream, including skipped
    /// ranges.
    pub fn ingress_body_offset(&self) -> u64 {
        self.ingress_body_offset
    }

    /// Egress body bytes handed to the transport, including skipped
    /// ranges.
    pub fn egress_body_bytes_committed(&self) -> u64 {
        self.egress_body_bytes_committed
    }

    /// One or more 1xx responses can precede the final response; 101 is
    /// handled as an upgrade instead.
    pub fn extra_response_expected(&self) -> bool {
        (100..200).contains(&self.last_response_status) && self.last_response_status != 101
    }

    pub fn is_partially_reliable(&self) -> bool {
        self.partially_reliable
    }

    pub fn has_idle_timeout(&self) -> bool {
        self.idle_timeout.is_some()
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    pub fn set_idle_timeout(&mut self, now: Instant, timeout: Duration) {
        self.idle_timeout = Some(timeout);
        self.update_read_timeout(now);
    }

    /// Earliest pending deadline (idle timer or rate-limit wake). The
    /// session arms its wheel timer from this and calls
    /// [`on_timeout`](Self::on_timeout) when it fires.
    pub fn next_timeout(&self) -> Option<Instant> {
        match (self.idle_deadline, self.rate_wake) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn set_transport_callback(&mut self, cb: Box<dyn TransportCallback>) {
        self.transport_cb = Some(cb);
    }

    pub fn set_last_byte_flushed_tracking(&mut self, enabled: bool) {
        self.enable_last_byte_flushed_tracking = enabled;
    }

    /// Enable per-body delivery confirmation. Legal only in partially
    /// reliable mode.
    pub fn set_body_delivery_tracking(&mut self, enabled: bool) -> Result<(), TxnError> {
        if !self.partially_reliable {
            return Err(TxnError::protocol(
                Direction::Egress,
                "delivery tracking requires partially reliable mode",
            ));
        }
        self.enable_body_delivery_tracking = enabled;
        Ok(())
    }

    /// Session bookkeeping: mark this transaction as counted in the active
    /// set.
    pub fn mark_active(&mut self) {
        self.in_active_set = true;
    }

    /// Session bookkeeping: clear the active mark, reporting whether it
    /// was set.
    pub fn test_and_clear_active(&mut self) -> bool {
        std::mem::replace(&mut self.in_active_set, false)
    }

    // ── Entry guard ──────────────────────────────────────────────────

    fn enter(&mut self) {
        self.guard_depth += 1;
    }

    fn exit(&mut self, ctx: &mut TxnCtx<'_>) {
        debug_assert!(self.guard_depth > 0);
        self.guard_depth -= 1;
        if self.guard_depth == 0 && !self.in_unwind {
            self.unwind(ctx);
        }
    }

    /// Deferred work that must not run while the handler may be on the
    /// stack: draining queued ingress, delivering latched errors and pause
    /// transitions, and the terminal detach.
    fn unwind(&mut self, ctx: &mut TxnCtx<'_>) {
        if ctx.handler.is_none() {
            return;
        }
        self.in_unwind = true;
        if !self.ingress_paused && !self.in_resume {
            self.drain_deferred_ingress(ctx);
        }
        if let Some(error) = self.pending_error.take() {
            self.deliver_error(ctx, error);
        }
        self.update_handler_pause_state(ctx);
        self.in_unwind = false;
        self.maybe_detach(ctx);
    }

    fn with_handler<F>(&mut self, ctx: &mut TxnCtx<'_>, f: F) -> bool
    where
        F: FnOnce(&mut dyn Handler, &mut Transaction, &mut TxnCtx<'_>),
    {
        let Some(handler) = ctx.handler.take() else {
            return false;
        };
        f(&mut *handler, &mut *self, &mut *ctx);
        ctx.handler = Some(handler);
        true
    }

    // ── Ingress path ─────────────────────────────────────────────────

    /// Invoked by the session when the ingress headers are complete.
    pub fn on_ingress_headers_complete(&mut self, ctx: &mut TxnCtx<'_>, msg: HttpMessage) {
        self.enter();
        self.ingress_headers_impl(ctx, msg);
        self.exit(ctx);
    }

    fn ingress_headers_impl(&mut self, ctx: &mut TxnCtx<'_>, msg: HttpMessage) {
        if self.ingress_suppressed() {
            return;
        }
        self.refresh_timeout(ctx.now);

        // 1xx interim responses on an upstream transaction repeat the
        // headers event; the automaton only lists a single transition, so
        // interim headers bypass it and leave the state for the final
        // response.
        let interim = self.is_upstream() && msg.is_interim();
        if interim {
            self.last_response_status = msg.status;
        } else {
            if !self.validate_ingress(ctx, IngressEvent::OnHeaders) {
                return;
            }
            if self.is_upstream() && !msg.is_request() {
                self.last_response_status = msg.status;
            }
            if self.is_downstream() && msg.is_request() {
                self.head_request = msg.is_head_request();
            }
            self.expected_ingress_length = msg.content_length();
            self.ingress_length_remaining = self.expected_ingress_length;
        }

        if self.must_queue(ctx) {
            self.queue_ingress(ctx, HttpEvent::Headers(msg));
        } else {
            self.dispatch_event(ctx, HttpEvent::Headers(msg));
        }
    }

    /// Invoked by the session when some of the ingress body has been
    /// parsed. `padding` is protocol padding that consumes window without
    /// carrying data; it is acknowledged immediately.
    pub fn on_ingress_body(&mut self, ctx: &mut TxnCtx<'_>, chain: Bytes, padding: u16) {
        self.enter();
        self.ingress_body_impl(ctx, chain, padding);
        self.exit(ctx);
    }

    fn ingress_body_impl(&mut self, ctx: &mut TxnCtx<'_>, chain: Bytes, padding: u16) {
        if self.ingress_suppressed() {
            return;
        }
        let len = chain.len() as u64;
        if len == 0 && padding == 0 {
            return;
        }
        self.refresh_timeout(ctx.now);
        if !self.validate_ingress(ctx, IngressEvent::OnBody) {
            return;
        }

        if self.use_flow_control {
            let total = (len + u64::from(padding)).min(u64::from(u32::MAX)) as u32;
            if !self.recv_window.reserve(total) {
                self.fatal_error(
                    ctx,
                    TxnError::new(ErrorKind::FlowControl, Direction::Ingress),
                );
                return;
            }
            if padding > 0 {
                // Padding never reaches the handler; its credit returns
                // with the next window update.
                self.recv_to_ack += u32::from(padding);
            }
        }

        if let Some(remaining) = self.ingress_length_remaining {
            if len > remaining {
                self.fatal_error(
                    ctx,
                    TxnError::protocol(
                        Direction::Ingress,
                        "ingress body exceeds declared content-length",
                    ),
                );
                return;
            }
            self.ingress_length_remaining = Some(remaining - len);
        }

        self.ingress_body_offset += len;
        metrics::INGRESS_BODY_BYTES.add(len);

        if self.must_queue(ctx) {
            self.queue_ingress(ctx, HttpEvent::Body(chain));
        } else {
            self.dispatch_event(ctx, HttpEvent::Body(chain));
        }
    }

    /// Invoked by the session when a chunk header has been parsed.
    pub fn on_ingress_chunk_header(&mut self, ctx: &mut TxnCtx<'_>, length: usize) {
        self.enter();
        if !self.ingress_suppressed() {
            self.refresh_timeout(ctx.now);
            if self.partially_reliable {
                self.fatal_error(
                    ctx,
                    TxnError::protocol(
                        Direction::Ingress,
                        "chunked framing not allowed in partially reliable mode",
                    ),
                );
            } else if self.validate_ingress(ctx, IngressEvent::OnChunkHeader) {
                if self.must_queue(ctx) {
                    self.queue_ingress(ctx, HttpEvent::ChunkHeader(length));
                } else {
                    self.dispatch_event(ctx, HttpEvent::ChunkHeader(length));
                }
            }
        }
        self.exit(ctx);
    }

    /// Invoked by the session when the terminator of a chunk is parsed.
    pub fn on_ingress_chunk_complete(&mut self, ctx: &mut TxnCtx<'_>) {
        self.enter();
        if !self.ingress_suppressed() {
            self.refresh_timeout(ctx.now);
            if self.validate_ingress(ctx, IngressEvent::OnChunkComplete) {
                if self.must_queue(ctx) {
                    self.queue_ingress(ctx, HttpEvent::ChunkComplete);
                } else {
                    self.dispatch_event(ctx, HttpEvent::ChunkComplete);
                }
            }
        }
        self.exit(ctx);
    }

    /// Invoked by the session when the ingress trailers have been parsed.
    pub fn on_ingress_trailers(&mut self, ctx: &mut TxnCtx<'_>, trailers: Headers) {
        self.enter();
        if !self.ingress_suppressed() {
            self.refresh_timeout(ctx.now);
            if self.validate_ingress(ctx, IngressEvent::OnTrailers) {
                if self.must_queue(ctx) {
                    self.queue_ingress(ctx, HttpEvent::Trailers(trailers));
                } else {
                    self.dispatch_event(ctx, HttpEvent::Trailers(trailers));
                }
            }
        }
        self.exit(ctx);
    }

    /// Invoked by the session on a protocol upgrade (CONNECT established,
    /// 101 switching protocols).
    pub fn on_ingress_upgrade(&mut self, ctx: &mut TxnCtx<'_>, protocol: UpgradeProtocol) {
        self.enter();
        if !self.ingress_suppressed() {
            self.refresh_timeout(ctx.now);
            if self.validate_ingress(ctx, IngressEvent::OnUpgrade) {
                if self.must_queue(ctx) {
                    self.queue_ingress(ctx, HttpEvent::Upgrade(protocol));
                } else {
                    self.dispatch_event(ctx, HttpEvent::Upgrade(protocol));
                }
            }
        }
        self.exit(ctx);
    }

    /// Invoked by the session when the ingress message is complete.
    pub fn on_ingress_eom(&mut self, ctx: &mut TxnCtx<'_>) {
        self.enter();
        self.ingress_eom_impl(ctx);
        self.exit(ctx);
    }

    fn ingress_eom_impl(&mut self, ctx: &mut TxnCtx<'_>) {
        if self.ingress_suppressed() {
            return;
        }
        if let Some(remaining) = self.ingress_length_remaining {
            if remaining > 0 {
                self.fatal_error(
                    ctx,
                    TxnError::protocol(
                        Direction::Ingress,
                        "ingress ended short of declared content-length",
                    ),
                );
                return;
            }
        }
        if !self.validate_ingress(ctx, IngressEvent::OnEom) {
            return;
        }
        if self.must_queue(ctx) {
            self.queue_ingress(ctx, HttpEvent::Eom);
        } else {
            self.dispatch_event(ctx, HttpEvent::Eom);
        }
    }

    fn ingress_suppressed(&self) -> bool {
        self.ingress_error_seen || self.aborted || self.detached
    }

    /// Whether this event must go through the deferred queue rather than
    /// straight to the handler: reception paused, a predecessor still
    /// queued, or no handler reachable in this frame.
    fn must_queue(&self, ctx: &TxnCtx<'_>) -> bool {
        self.ingress_paused
            || self
                .deferred_ingress
                .as_ref()
                .map(|q| !q.is_empty())
                .unwrap_or(false)
            || ctx.handler.is_none()
    }

    fn queue_ingress(&mut self, ctx: &mut TxnCtx<'_>, event: HttpEvent) {
        metrics::DEFERRED_INGRESS_EVENTS.increment();
        let max = self.max_deferred_ingress;
        let queue = self
            .deferred_ingress
            .get_or_insert_with(|| Box::new(DeferredIngress::new()));
        let within_budget = queue.push(event, max);
        if !within_budget && !self.use_flow_control {
            // Without flow control there is no window to stall the peer;
            // the only safe outcome is to kill the transaction.
            self.fatal_error(
                ctx,
                TxnError::new(ErrorKind::BufferFull, Direction::Ingress),
            );
        }
        // With flow control on, queued bytes stay unacknowledged, so the
        // peer stalls once the receive window is exhausted.
    }

    /// Deliver one ingress event to the handler and settle its
    /// bookkeeping.
    fn dispatch_event(&mut self, ctx: &mut TxnCtx<'_>, event: HttpEvent) {
        match event {
            HttpEvent::Headers(msg) => {
                self.with_handler(ctx, |h, t, c| h.on_headers_complete(t, c, msg));
            }
            HttpEvent::Body(chain) => {
                let len = chain.len() as u32;
                let offset = self.ingress_body_delivered;
                self.ingress_body_delivered += u64::from(len);
                if let Some(cb) = self.transport_cb.as_mut() {
                    cb.body_bytes_received(len as usize);
                }
                if self.partially_reliable {
                    self.with_handler(ctx, |h, t, c| h.on_body_with_offset(t, c, offset, chain));
                } else {
                    self.with_handler(ctx, |h, t, c| h.on_body(t, c, chain));
                }
                ctx.transport.notify_ingress_body_processed(len);
                if self.use_flow_control && !self.is_ingress_eom_seen() {
                    self.recv_to_ack += len;
                    self.flush_window_update(ctx);
                }
            }
            HttpEvent::ChunkHeader(length) => {
                self.with_handler(ctx, |h, t, c| h.on_chunk_header(t, c, length));
            }
            HttpEvent::ChunkComplete => {
                self.with_handler(ctx, |h, t, c| h.on_chunk_complete(t, c));
            }
            HttpEvent::Trailers(trailers) => {
                self.with_handler(ctx, |h, t, c| h.on_trailers(t, c, trailers));
            }
            HttpEvent::Upgrade(protocol) => {
                self.with_handler(ctx, |h, t, c| h.on_upgrade(t, c, protocol));
            }
            HttpEvent::Eom => {
                let delivered = self.with_handler(ctx, |h, t, c| h.on_eom(t, c));
                debug_assert!(delivered);
                if let Some(next) =
                    ingress_transition(self.ingress_state, IngressEvent::EomFlushed)
                {
                    self.ingress_state = next;
                }
                self.update_read_timeout(ctx.now);
            }
        }
    }

    /// FIFO drain of the deferred ingress queue. The handler may pause,
    /// abort, or error mid-drain; each iteration rechecks.
    fn drain_deferred_ingress(&mut self, ctx: &mut TxnCtx<'_>) {
        if self.deferred_ingress.is_none() {
            return;
        }
        self.in_resume = true;
        loop {
            if self.ingress_paused || self.ingress_suppressed() || ctx.handler.is_none() {
                break;
            }
            let Some(event) = self.deferred_ingress.as_mut().and_then(|q| q.pop()) else {
                break;
            };
            self.dispatch_event(ctx, event);
        }
        self.in_resume = false;
        if self
            .deferred_ingress
            .as_ref()
            .map(|q| q.is_empty())
            .unwrap_or(false)
        {
            self.deferred_ingress = None;
        }
    }

    // ── Ingress pause/resume ─────────────────────────────────────────

    /// Stop delivering ingress to the handler; events queue until resume.
    pub fn pause_ingress(&mut self, ctx: &mut TxnCtx<'_>) {
        if self.ingress_paused || self.detached {
            return;
        }
        self.ingress_paused = true;
        ctx.transport.pause_ingress(self.id);
    }

    /// Resume ingress delivery, draining anything queued. Queued events
    /// reach the handler before this frame's outermost entry returns.
    pub fn resume_ingress(&mut self, ctx: &mut TxnCtx<'_>) {
        if !self.ingress_paused || self.detached {
            return;
        }
        self.enter();
        self.ingress_paused = false;
        ctx.transport.resume_ingress(self.id);
        // Acknowledge everything delivered before the pause.
        self.flush_window_update(ctx);
        self.exit(ctx);
    }

    // ── Flow control (receive side) ──────────────────────────────────

    /// Send any pending window update. Suppressed while paused: withheld
    /// acknowledgements are what stall the peer.
    fn flush_window_update(&mut self, ctx: &mut TxnCtx<'_>) {
        if !self.use_flow_control
            || self.ingress_paused
            || self.recv_to_ack == 0
            || self.is_ingress_complete()
            || self.aborted
        {
            return;
        }
        let delta = self.recv_to_ack;
        self.recv_to_ack = 0;
        self.recv_window.free(delta);
        ctx.transport.send_window_update(self.id, delta);
    }

    /// Change the receive window capacity, advertising any increase to the
    /// peer immediately.
    pub fn set_receive_window(&mut self, ctx: &mut TxnCtx<'_>, capacity: u32) {
        if !self.use_flow_control || self.detached {
            return;
        }
        let prev = self.recv_window.capacity();
        if !self.recv_window.set_capacity(capacity) {
            return;
        }
        if capacity > prev {
            ctx.transport.send_window_update(self.id, capacity - prev);
        }
    }

    // ── Flow control (send side) ─────────────────────────────────────

    /// The peer consumed `amount` bytes; grow the send window.
    pub fn on_ingress_window_update(&mut self, ctx: &mut TxnCtx<'_>, amount: u32) {
        self.enter();
        self.window_update_impl(ctx, amount);
        self.exit(ctx);
    }

    fn window_update_impl(&mut self, ctx: &mut TxnCtx<'_>, amount: u32) {
        if !self.use_flow_control || self.detached || self.aborted {
            return;
        }
        self.refresh_timeout(ctx.now);
        // Credit beyond capacity is capped by the window itself.
        self.send_window.free(amount);
        self.notify_transport_pending_egress(ctx);
        self.update_handler_pause_state(ctx);
    }

    /// The peer changed the initial window size; apply the delta to the
    /// send window.
    pub fn on_set_send_window(&mut self, ctx: &mut TxnCtx<'_>, new_capacity: u32) {
        self.enter();
        if self.use_flow_control && !self.detached && !self.aborted {
            if self.send_window.set_capacity(new_capacity) {
                self.notify_transport_pending_egress(ctx);
                self.update_handler_pause_state(ctx);
            } else {
                self.fatal_error(
                    ctx,
                    TxnError::new(ErrorKind::FlowControl, Direction::Egress),
                );
            }
        }
        self.exit(ctx);
    }

    // ── Egress path (handler-initiated) ──────────────────────────────

    /// Whether headers may be sent now: the automaton allows it, or the
    /// last response sent was interim (1xx) so another block is expected.
    pub fn can_send_headers(&self) -> bool {
        if self.aborted || self.detached {
            return false;
        }
        let sm_ok = egress_transition(self.egress_state, EgressEvent::SendHeaders).is_some();
        let repeat_ok = self.egress_state == EgressState::HeadersSent
            && self.extra_response_expected();
        (sm_ok || repeat_ok)
            && (self.is_upstream() || self.last_response_status == 0
                || self.extra_response_expected())
    }

    pub fn send_headers(&mut self, ctx: &mut TxnCtx<'_>, msg: &HttpMessage) -> Result<(), TxnError> {
        self.send_headers_with_optional_eom(ctx, msg, false)
    }

    pub fn send_headers_with_eom(
        &mut self,
        ctx: &mut TxnCtx<'_>,
        msg: &HttpMessage,
    ) -> Result<(), TxnError> {
        self.send_headers_with_optional_eom(ctx, msg, true)
    }

    fn send_headers_with_optional_eom(
        &mut self,
        ctx: &mut TxnCtx<'_>,
        msg: &HttpMessage,
        eom: bool,
    ) -> Result<(), TxnError> {
        self.enter();
        let result = self.send_headers_impl(ctx, msg, eom);
        self.exit(ctx);
        result
    }

    fn send_headers_impl(
        &mut self,
        ctx: &mut TxnCtx<'_>,
        msg: &HttpMessage,
        eom: bool,
    ) -> Result<(), TxnError> {
        if !self.can_send_headers() {
            let err = TxnError::protocol(Direction::Egress, "headers not allowed now");
            self.fatal_error(ctx, err.clone());
            return Err(err);
        }
        let interim = !msg.is_request() && msg.is_interim();
        if interim && eom {
            let err = TxnError::protocol(Direction::Egress, "interim response cannot carry EOM");
            self.fatal_error(ctx, err.clone());
            return Err(err);
        }

        if let Some(next) = egress_transition(self.egress_state, EgressEvent::SendHeaders) {
            self.egress_state = next;
        }
        // Interim headers leave the state untouched: the final block still
        // owes the automaton its single sendHeaders transition.

        if self.is_downstream() && !msg.is_request() {
            self.last_response_status = msg.status;
            if !interim {
                self.expected_response_length = msg.content_length();
            }
        }
        if eom && !self.head_request {
            if let Some(expected) = self.expected_response_length {
                if expected != 0 {
                    let err = TxnError::protocol(
                        Direction::Egress,
                        "EOM with headers contradicts non-zero content-length",
                    );
                    self.fatal_error(ctx, err.clone());
                    return Err(err);
                }
            }
        }
        if ctx.transport.codec().partially_reliable {
            self.partially_reliable = true;
        }

        // Headers are never flow-controlled.
        let bytes = ctx.transport.send_headers(self.id, msg, eom);
        self.egress_headers_delivered = true;
        if let Some(cb) = self.transport_cb.as_mut() {
            cb.header_bytes_generated(bytes);
            if !self.first_header_byte_sent {
                self.first_header_byte_sent = true;
                cb.first_header_byte_flushed();
            }
        }
        self.refresh_timeout(ctx.now);

        if eom {
            // The EOM left with the header block; fold both transitions.
            if let Some(next) = egress_transition(self.egress_state, EgressEvent::SendEom) {
                self.egress_state = next;
            }
            self.egress_eom_flushed(ctx);
        }
        Ok(())
    }

    /// Queue body for egress. Bytes are never written synchronously; the
    /// scheduler flushes them from [`on_write_ready`](Self::on_write_ready).
    pub fn send_body(&mut self, ctx: &mut TxnCtx<'_>, body: Bytes) -> Result<(), TxnError> {
        self.enter();
        let result = self.send_body_impl(ctx, body);
        self.exit(ctx);
        result
    }

    fn send_body_impl(&mut self, ctx: &mut TxnCtx<'_>, body: Bytes) -> Result<(), TxnError> {
        if self.aborted || self.detached {
            return Err(TxnError::protocol(Direction::Egress, "transaction closed"));
        }
        self.validate_egress(ctx, EgressEvent::SendBody)?;
        let len = body.len();
        self.actual_response_length += len as u64;
        self.deferred_egress.append(body);
        ctx.transport.notify_egress_body_buffered(len as i64);
        self.notify_transport_pending_egress(ctx);
        self.update_handler_pause_state(ctx);
        Ok(())
    }

    /// Record framing for a chunk of `length` bytes of body to follow.
    pub fn send_chunk_header(&mut self, ctx: &mut TxnCtx<'_>, length: usize) -> Result<(), TxnError> {
        self.enter();
        let result = (|| {
            if self.aborted || self.detached {
                return Err(TxnError::protocol(Direction::Egress, "transaction closed"));
            }
            if self.partially_reliable {
                let err = TxnError::protocol(
                    Direction::Egress,
                    "chunked framing not allowed in partially reliable mode",
                );
                self.fatal_error(ctx, err.clone());
                return Err(err);
            }
            self.validate_egress(ctx, EgressEvent::SendChunkHeader)?;
            if !ctx.transport.codec().multiplexed {
                self.chunk_headers.push_back(Chunk::new(length));
            }
            Ok(())
        })();
        self.exit(ctx);
        result
    }

    /// Close the chunk begun by the last `send_chunk_header`.
    pub fn send_chunk_terminator(&mut self, ctx: &mut TxnCtx<'_>) -> Result<(), TxnError> {
        self.enter();
        let result = (|| {
            if self.aborted || self.detached {
                return Err(TxnError::protocol(Direction::Egress, "transaction closed"));
            }
            self.validate_egress(ctx, EgressEvent::SendChunkTerminator)?;
            Ok(())
        })();
        self.exit(ctx);
        result
    }

    /// Store trailers; they leave with the EOM flush.
    pub fn send_trailers(&mut self, ctx: &mut TxnCtx<'_>, trailers: Headers) -> Result<(), TxnError> {
        self.enter();
        let result = (|| {
            if self.aborted || self.detached {
                return Err(TxnError::protocol(Direction::Egress, "transaction closed"));
            }
            if self.partially_reliable {
                let err = TxnError::protocol(
                    Direction::Egress,
                    "trailers not allowed in partially reliable mode",
                );
                self.fatal_error(ctx, err.clone());
                return Err(err);
            }
            self.validate_egress(ctx, EgressEvent::SendTrailers)?;
            self.trailers = Some(trailers);
            Ok(())
        })();
        self.exit(ctx);
        result
    }

    /// Finalize the egress message. The EOM (and any trailers) go out with
    /// the final flush.
    pub fn send_eom(&mut self, ctx: &mut TxnCtx<'_>) -> Result<(), TxnError> {
        self.enter();
        let result = self.send_eom_impl(ctx);
        self.exit(ctx);
        result
    }

    fn send_eom_impl(&mut self, ctx: &mut TxnCtx<'_>) -> Result<(), TxnError> {
        if self.aborted || self.detached {
            return Err(TxnError::protocol(Direction::Egress, "transaction closed"));
        }
        if let Some(expected) = self.expected_response_length {
            if !self.head_request && expected != self.actual_response_length {
                let err = TxnError::protocol(
                    Direction::Egress,
                    format!(
                        "response length {} does not match declared content-length {expected}",
                        self.actual_response_length
                    ),
                );
                self.fatal_error(ctx, err.clone());
                return Err(err);
            }
        }
        self.validate_egress(ctx, EgressEvent::SendEom)?;
        self.notify_transport_pending_egress(ctx);
        Ok(())
    }

    /// Terminate the transaction, resetting the stream with `code` and
    /// cascading to any pushed or extended sub-transactions.
    pub fn send_abort(&mut self, ctx: &mut TxnCtx<'_>, code: ErrorCode) {
        self.enter();
        self.abort_impl(ctx, code);
        self.exit(ctx);
    }

    fn abort_impl(&mut self, ctx: &mut TxnCtx<'_>, code: ErrorCode) {
        if self.aborted || self.detached {
            return;
        }
        self.aborted = true;
        metrics::TXN_ABORTED.increment();
        self.ingress_error_seen = true;
        self.idle_deadline = None;
        self.rate_wake = None;
        self.mark_ingress_complete(ctx);
        self.mark_egress_complete(ctx);
        ctx.transport.send_abort(self.id, code);
        self.cascade_abort(ctx, code);
    }

    fn cascade_abort(&mut self, ctx: &mut TxnCtx<'_>, code: ErrorCode) {
        for id in self.pushed_transactions.drain() {
            ctx.transport.send_abort_dependent(id, code);
        }
        for id in self.ex_transactions.drain() {
            ctx.transport.send_abort_dependent(id, code);
        }
    }

    // ── Egress flush ─────────────────────────────────────────────────

    /// Invoked by the scheduler when this transaction may write. Flushes
    /// up to `max_egress` body bytes within the send window and rate
    /// budget. Returns whether egress work remains; the caller makes the
    /// re-enqueue decision.
    pub fn on_write_ready(&mut self, ctx: &mut TxnCtx<'_>, max_egress: u32, ratio: f64) -> bool {
        self.enter();
        let more = self.write_ready_impl(ctx, max_egress, ratio);
        self.exit(ctx);
        more
    }

    fn write_ready_impl(&mut self, ctx: &mut TxnCtx<'_>, max_egress: u32, ratio: f64) -> bool {
        if self.detached || self.is_egress_complete() {
            ctx.queue.clear_pending_egress(self.queue_handle);
            return false;
        }
        if self.egress_paused {
            return false;
        }
        if let Some(delay) = self.rate_limiter.delay_required(ctx.now) {
            self.egress_rate_limited = true;
            self.rate_wake = Some(ctx.now + delay);
            metrics::RATE_LIMITED_FLUSHES.increment();
            ctx.queue.clear_pending_egress(self.queue_handle);
            return false;
        }
        self.egress_rate_limited = false;

        self.cumulative_ratio += ratio;
        self.egress_calls += 1;

        self.refresh_timeout(ctx.now);
        self.send_deferred_body(ctx, max_egress);
        self.update_handler_pause_state(ctx);

        let more = !self.deferred_egress.is_empty() || self.is_egress_eom_queued();
        if !more {
            ctx.queue.clear_pending_egress(self.queue_handle);
        }
        more
    }

    fn send_deferred_body(&mut self, ctx: &mut TxnCtx<'_>, max_egress: u32) {
        let window_limit = if self.use_flow_control {
            self.send_window.available().max(0) as usize
        } else {
            usize::MAX
        };
        let mut budget = (max_egress as usize)
            .min(window_limit)
            .min(self.deferred_egress.len());

        if self.chunk_headers.is_empty() {
            if budget > 0 {
                let eom_with_body = self.is_egress_eom_queued()
                    && budget == self.deferred_egress.len()
                    && self.trailers.is_none();
                self.send_body_now(ctx, budget, eom_with_body);
            }
        } else {
            while budget > 0 && !self.deferred_egress.is_empty() {
                let (header_sent, chunk_remaining) = match self.chunk_headers.front() {
                    Some(chunk) => (chunk.header_sent, chunk.length),
                    None => break,
                };
                if !header_sent {
                    ctx.transport.send_chunk_header(self.id, chunk_remaining);
                    self.chunk_headers.front_mut().unwrap().header_sent = true;
                }
                let take = budget.min(chunk_remaining).min(self.deferred_egress.len());
                if take == 0 {
                    break;
                }
                self.send_body_now(ctx, take, false);
                budget -= take;
                let front = self.chunk_headers.front_mut().unwrap();
                front.length -= take;
                if front.length == 0 {
                    self.chunk_headers.pop_front();
                    ctx.transport.send_chunk_terminator(self.id);
                }
            }
        }

        if self.deferred_egress.is_empty() && self.is_egress_eom_queued() {
            self.send_eom_now(ctx);
        }
    }

    fn send_body_now(&mut self, ctx: &mut TxnCtx<'_>, len: usize, eom: bool) {
        if self.use_flow_control {
            let reserved = self.send_window.reserve(len as u32);
            debug_assert!(reserved, "flush exceeded the send window");
        }
        let body = self.deferred_egress.split_to(len);
        let track = self.enable_last_byte_flushed_tracking && eom;
        ctx.transport.send_body(self.id, body, eom, track);
        self.egress_body_bytes_committed += len as u64;
        self.rate_limiter.record_egress(len as u64);
        metrics::EGRESS_BODY_BYTES.add(len as u64);
        ctx.transport.notify_egress_body_buffered(-(len as i64));

        if self.enable_body_delivery_tracking {
            let offset = self.egress_body_bytes_committed;
            if ctx.transport.track_egress_body_delivery(self.id, offset).is_ok() {
                self.increment_pending_byte_events();
            }
        }

        if let Some(cb) = self.transport_cb.as_mut() {
            cb.body_bytes_generated(len);
            if !self.first_byte_sent {
                self.first_byte_sent = true;
                cb.first_byte_flushed();
            }
            if self.deferred_egress.is_empty() {
                cb.egress_buffer_empty();
            }
        }

        if eom {
            self.egress_eom_flushed(ctx);
        }
    }

    fn send_eom_now(&mut self, ctx: &mut TxnCtx<'_>) {
        let trailers = self.trailers.take();
        ctx.transport.send_eom(self.id, trailers.as_ref());
        self.egress_eom_flushed(ctx);
    }

    /// The EOM reached the transport: the egress automaton is done.
    fn egress_eom_flushed(&mut self, ctx: &mut TxnCtx<'_>) {
        if let Some(next) = egress_transition(self.egress_state, EgressEvent::EomFlushed) {
            self.egress_state = next;
        }
        if let Some(cb) = self.transport_cb.as_mut() {
            cb.last_byte_flushed();
        }
        self.update_read_timeout(ctx.now);
    }

    // ── Egress pause/resume (transport side) ─────────────────────────

    /// The transport is back-pressured; stop flushing.
    pub fn pause_egress(&mut self, ctx: &mut TxnCtx<'_>) {
        self.enter();
        if !self.egress_paused && !self.detached {
            self.egress_paused = true;
            self.notify_transport_pending_egress(ctx);
            self.update_handler_pause_state(ctx);
        }
        self.exit(ctx);
    }

    /// The transport drained; flushing may continue.
    pub fn resume_egress(&mut self, ctx: &mut TxnCtx<'_>) {
        self.enter();
        if self.egress_paused && !self.detached {
            self.egress_paused = false;
            self.rate_limiter.reset(ctx.now);
            self.notify_transport_pending_egress(ctx);
            self.update_handler_pause_state(ctx);
        }
        self.exit(ctx);
    }

    /// Recompute whether the handler should hold off producing egress and
    /// deliver the transition if it changed. Level-triggered and
    /// debounced: the delivered state strictly alternates, starting with
    /// paused.
    fn update_handler_pause_state(&mut self, ctx: &mut TxnCtx<'_>) {
        self.flow_control_paused = self.use_flow_control
            && self.send_window.available() < self.deferred_egress.len() as i64;
        let desired = !self.detached
            && (self.egress_paused
                || self.flow_control_paused
                || self.deferred_egress.len() >= self.egress_buffer_limit);
        if desired == self.handler_egress_paused || ctx.handler.is_none() {
            // No transition, or mid-callback: the unwind pass will settle it.
            return;
        }
        self.handler_egress_paused = desired;
        if desired {
            metrics::HANDLER_EGRESS_PAUSES.increment();
            self.with_handler(ctx, |h, t, c| h.on_egress_paused(t, c));
        } else {
            self.with_handler(ctx, |h, t, c| h.on_egress_resumed(t, c));
        }
    }

    /// Keep the scheduler's pending-egress bit in sync with whether this
    /// transaction can actually make progress.
    fn notify_transport_pending_egress(&mut self, ctx: &mut TxnCtx<'_>) {
        let has_work = (!self.deferred_egress.is_empty() || self.is_egress_eom_queued())
            && !self.egress_paused
            && !self.egress_rate_limited
            && !self.detached;
        if has_work {
            if !ctx.queue.is_enqueued(self.queue_handle) {
                ctx.queue.set_pending_egress(self.queue_handle);
            }
            ctx.transport.notify_pending_egress();
        } else if ctx.queue.is_enqueued(self.queue_handle) {
            ctx.queue.clear_pending_egress(self.queue_handle);
        }
    }

    // ── Rate limiting ────────────────────────────────────────────────

    /// Cap egress at `bytes_per_ms`. Zero disables pacing.
    pub fn set_egress_rate_limit(&mut self, ctx: &mut TxnCtx<'_>, bytes_per_ms: u64) {
        self.rate_limiter.set_rate(bytes_per_ms, ctx.now);
        if bytes_per_ms == 0 && self.egress_rate_limited {
            self.egress_rate_limited = false;
            self.rate_wake = None;
            self.notify_transport_pending_egress(ctx);
        }
    }

    // ── Timers ───────────────────────────────────────────────────────

    fn refresh_timeout(&mut self, now: Instant) {
        if let Some(timeout) = self.idle_timeout {
            self.idle_deadline = Some(now + timeout);
        }
    }

    fn is_expecting_ingress(&self) -> bool {
        !self.is_ingress_complete()
    }

    fn is_expecting_window_update(&self) -> bool {
        self.use_flow_control
            && !self.deferred_egress.is_empty()
            && self.send_window.available() <= 0
    }

    fn update_read_timeout(&mut self, now: Instant) {
        if self.detached || self.aborted {
            self.idle_deadline = None;
        } else if self.is_expecting_ingress() || self.is_expecting_window_update() {
            self.refresh_timeout(now);
        } else {
            self.idle_deadline = None;
        }
    }

    /// Invoked by the session when a deadline from
    /// [`next_timeout`](Self::next_timeout) fires.
    pub fn on_timeout(&mut self, ctx: &mut TxnCtx<'_>) {
        self.enter();
        self.timeout_impl(ctx);
        self.exit(ctx);
    }

    fn timeout_impl(&mut self, ctx: &mut TxnCtx<'_>) {
        if self.detached {
            return;
        }
        if let Some(wake) = self.rate_wake {
            if wake <= ctx.now {
                self.rate_wake = None;
                self.egress_rate_limited = false;
                self.rate_limiter.reset(ctx.now);
                self.notify_transport_pending_egress(ctx);
            }
        }
        if let Some(deadline) = self.idle_deadline {
            if deadline <= ctx.now {
                self.idle_deadline = None;
                metrics::TIMEOUTS.increment();
                ctx.transport.transaction_timeout(self.id);
                let direction = if self.is_ingress_complete() {
                    Direction::Egress
                } else {
                    Direction::Ingress
                };
                self.fatal_error(ctx, TxnError::new(ErrorKind::Timeout, direction));
            }
        }
    }

    // ── Errors and lifecycle ─────────────────────────────────────────

    /// Invoked by the session on a transport-level or peer-signalled
    /// error. The direction tag decides which halves terminate: an
    /// INGRESS-only error still allows egress flush attempts.
    pub fn on_error(&mut self, ctx: &mut TxnCtx<'_>, error: TxnError) {
        self.enter();
        if !self.detached {
            let notify = !self.is_unidirectional()
                || self.should_notify_ex_txn_error(error.direction);
            if notify {
                self.deliver_error(ctx, error.clone());
            }
            if error.affects_ingress() {
                self.ingress_error_seen = true;
                self.mark_ingress_complete(ctx);
            }
            if error.affects_egress() {
                self.mark_egress_complete(ctx);
            }
        }
        self.exit(ctx);
    }

    /// Invoked by the session when a GOAWAY is received. Informational;
    /// the session reports a covering GOAWAY as a peer-abort error.
    pub fn on_goaway(&mut self, ctx: &mut TxnCtx<'_>, code: ErrorCode) {
        self.enter();
        if !self.detached {
            self.with_handler(ctx, |h, t, c| h.on_goaway(t, c, code));
        }
        self.exit(ctx);
    }

    /// Whether an error with `direction` should reach the handler of a
    /// unidirectional extended transaction: only its active direction
    /// matters.
    pub fn should_notify_ex_txn_error(&self, direction: Direction) -> bool {
        if !self.is_unidirectional() {
            return false;
        }
        if self.is_remote_initiated() {
            direction == Direction::Egress
        } else {
            direction == Direction::Ingress
        }
    }

    /// Internal fatal error: report to the handler, abort on egress unless
    /// egress already finished, pin both automata terminal, and let the
    /// unwind pass detach.
    fn fatal_error(&mut self, ctx: &mut TxnCtx<'_>, error: TxnError) {
        if self.aborted || self.detached {
            return;
        }
        if matches!(error.kind, ErrorKind::Protocol(_)) {
            metrics::PROTOCOL_ERRORS.increment();
        }
        if error.affects_ingress() {
            self.ingress_error_seen = true;
        }
        self.deliver_error(ctx, error.clone());
        let egress_was_done = self.is_egress_complete();
        self.aborted = true;
        metrics::TXN_ABORTED.increment();
        self.idle_deadline = None;
        self.rate_wake = None;
        self.mark_ingress_complete(ctx);
        self.mark_egress_complete(ctx);
        if !egress_was_done {
            ctx.transport.send_abort(self.id, error.code());
        }
        self.cascade_abort(ctx, error.code());
    }

    /// At most one `on_error` per transaction; latched for the unwind pass
    /// if the handler is currently on the stack.
    fn deliver_error(&mut self, ctx: &mut TxnCtx<'_>, error: TxnError) {
        if self.error_delivered || self.detached {
            return;
        }
        if ctx.handler.is_some() {
            self.error_delivered = true;
            self.with_handler(ctx, |h, t, c| h.on_error(t, c, error));
        } else if self.pending_error.is_none() {
            self.pending_error = Some(error);
        }
    }

    fn mark_ingress_complete(&mut self, ctx: &mut TxnCtx<'_>) {
        self.ingress_state = IngressState::ReceivingDone;
        self.deferred_ingress = None;
        self.update_read_timeout(ctx.now);
    }

    fn mark_egress_complete(&mut self, ctx: &mut TxnCtx<'_>) {
        let buffered = self.deferred_egress.len();
        if buffered > 0 {
            ctx.transport.notify_egress_body_buffered(-(buffered as i64));
            self.deferred_egress.clear();
        }
        self.trailers = None;
        self.chunk_headers.clear();
        self.egress_state = EgressState::SendingDone;
        if ctx.queue.is_enqueued(self.queue_handle) {
            ctx.queue.clear_pending_egress(self.queue_handle);
        }
    }

    /// Detach exactly once: both automata terminal, no outstanding byte
    /// events, and no entry frames on the stack.
    fn maybe_detach(&mut self, ctx: &mut TxnCtx<'_>) {
        if self.detached
            || !self.is_ingress_complete()
            || !self.is_egress_complete()
            || self.pending_byte_events > 0
        {
            return;
        }
        debug_assert_eq!(self.guard_depth, 0);
        debug_assert!(self.deferred_egress.is_empty());
        self.detached = true;
        metrics::TXN_ACTIVE.decrement();
        if !self.aborted && !self.error_delivered {
            metrics::TXN_COMPLETED.increment();
        }
        ctx.queue.remove(self.queue_handle);
        if let Some(handler) = ctx.handler.as_deref_mut() {
            handler.detach_transaction();
        }
        ctx.transport.detach(self.id);
    }

    // ── State-machine validation ─────────────────────────────────────

    fn validate_ingress(&mut self, ctx: &mut TxnCtx<'_>, event: IngressEvent) -> bool {
        match ingress_transition(self.ingress_state, event) {
            Some(next) => {
                self.ingress_state = next;
                true
            }
            None => {
                self.fatal_error(
                    ctx,
                    TxnError::protocol(
                        Direction::Ingress,
                        format!("invalid ingress event {event:?} in state {:?}", self.ingress_state),
                    ),
                );
                false
            }
        }
    }

    fn validate_egress(&mut self, ctx: &mut TxnCtx<'_>, event: EgressEvent) -> Result<(), TxnError> {
        match egress_transition(self.egress_state, event) {
            Some(next) => {
                self.egress_state = next;
                Ok(())
            }
            None => {
                let err = TxnError::protocol(
                    Direction::Egress,
                    format!("invalid egress event {event:?} in state {:?}", self.egress_state),
                );
                self.fatal_error(ctx, err.clone());
                Err(err)
            }
        }
    }

    // ── Byte events ──────────────────────────────────────────────────

    /// The transaction will not detach until every pending byte event is
    /// resolved with [`decrement_pending_byte_events`](Self::decrement_pending_byte_events).
    pub fn increment_pending_byte_events(&mut self) {
        debug_assert!(self.pending_byte_events < u8::MAX);
        self.pending_byte_events += 1;
    }

    pub fn decrement_pending_byte_events(&mut self, ctx: &mut TxnCtx<'_>) {
        self.enter();
        debug_assert!(self.pending_byte_events > 0);
        self.pending_byte_events = self.pending_byte_events.saturating_sub(1);
        self.exit(ctx);
    }

    pub fn pending_byte_events(&self) -> u8 {
        self.pending_byte_events
    }

    /// The peer acknowledged the last egress byte.
    pub fn on_egress_last_byte_acked(&mut self, ctx: &mut TxnCtx<'_>, latency: Duration) {
        self.enter();
        if let Some(cb) = self.transport_cb.as_mut() {
            cb.last_byte_acked(latency);
        }
        self.exit(ctx);
    }

    /// The peer confirmed delivery of egress body up to `offset`.
    pub fn on_egress_body_bytes_acked(&mut self, ctx: &mut TxnCtx<'_>, offset: u64) {
        self.enter();
        if let Some(cb) = self.transport_cb.as_mut() {
            cb.body_bytes_delivered(offset);
        }
        if self.pending_byte_events > 0 {
            self.pending_byte_events -= 1;
        }
        self.exit(ctx);
    }

    /// Delivery tracking below `offset` was cancelled.
    pub fn on_egress_body_delivery_canceled(&mut self, ctx: &mut TxnCtx<'_>, offset: u64) {
        self.enter();
        if let Some(cb) = self.transport_cb.as_mut() {
            cb.body_bytes_delivery_cancelled(offset);
        }
        if self.pending_byte_events > 0 {
            self.pending_byte_events -= 1;
        }
        self.exit(ctx);
    }

    // ── Push and extended sub-transactions ───────────────────────────

    /// Open a pushed transaction bound to this one. Legal only downstream,
    /// before the egress EOM, with partial reliability off.
    pub fn new_pushed_transaction(
        &mut self,
        ctx: &mut TxnCtx<'_>,
    ) -> Result<Option<StreamId>, TxnError> {
        self.enter();
        let result = (|| {
            if self.partially_reliable {
                let err = TxnError::protocol(
                    Direction::Egress,
                    "push promises not allowed in partially reliable mode",
                );
                self.fatal_error(ctx, err.clone());
                return Err(err);
            }
            if !self.is_downstream() || !ctx.transport.codec().supports_push {
                return Err(TxnError::protocol(
                    Direction::Egress,
                    "push only legal on a downstream transaction with a pushing codec",
                ));
            }
            if self.is_egress_eom_seen() {
                return Ok(None);
            }
            let pushed = ctx.transport.new_pushed_transaction(self.id);
            if let Some(pushed) = pushed {
                self.pushed_transactions.insert(pushed);
            }
            Ok(pushed)
        })();
        self.exit(ctx);
        result
    }

    /// Open an extended transaction bound to this control stream.
    pub fn new_ex_transaction(
        &mut self,
        ctx: &mut TxnCtx<'_>,
        unidirectional: bool,
    ) -> Option<StreamId> {
        let ex = ctx.transport.new_ex_transaction(self.id, unidirectional);
        if let Some(ex) = ex {
            self.ex_transactions.insert(ex);
        }
        ex
    }

    /// Invoked by the session (upstream only) when a pushed transaction
    /// arrives. Returns false if no handler accepted it; the session then
    /// aborts the push.
    pub fn on_pushed_transaction(&mut self, ctx: &mut TxnCtx<'_>, pushed: StreamId) -> bool {
        self.enter();
        let accepted = if self.detached {
            false
        } else {
            self.refresh_timeout(ctx.now);
            let delivered = self.with_handler(ctx, |h, t, c| h.on_pushed_transaction(t, c, pushed));
            if delivered {
                self.pushed_transactions.insert(pushed);
            }
            delivered
        };
        self.exit(ctx);
        accepted
    }

    /// Invoked by the session when an extended transaction arrives on this
    /// control stream.
    pub fn on_ex_transaction(&mut self, ctx: &mut TxnCtx<'_>, ex: StreamId) -> bool {
        self.enter();
        let accepted = if self.detached {
            false
        } else {
            self.refresh_timeout(ctx.now);
            let delivered = self.with_handler(ctx, |h, t, c| h.on_ex_transaction(t, c, ex));
            if delivered {
                self.ex_transactions.insert(ex);
            }
            delivered
        };
        self.exit(ctx);
        accepted
    }

    // ── Partial reliability ──────────────────────────────────────────

    /// Invoked by the session when the codec starts an unframed body.
    pub fn on_ingress_unframed_body_started(&mut self, ctx: &mut TxnCtx<'_>, offset: u64) {
        self.enter();
        self.partially_reliable = true;
        if !self.detached {
            self.with_handler(ctx, |h, t, c| h.on_unframed_body_started(t, c, offset));
        }
        self.exit(ctx);
    }

    /// Sender side: advertise that body below `new_offset` will not be
    /// sent, excising the not-yet-flushed prefix. Returns the offset the
    /// transport accepted.
    pub fn skip_body_to(
        &mut self,
        ctx: &mut TxnCtx<'_>,
        new_offset: u64,
    ) -> Result<Option<u64>, TxnError> {
        self.enter();
        let result = (|| {
            if !self.partially_reliable {
                return Err(TxnError::protocol(
                    Direction::Egress,
                    "skip requires partially reliable mode",
                ));
            }
            if !self.egress_headers_delivered {
                return Err(TxnError::protocol(
                    Direction::Egress,
                    "cannot skip before egress headers are delivered",
                ));
            }
            if new_offset > self.egress_body_bytes_committed {
                let trim = (new_offset - self.egress_body_bytes_committed)
                    .min(self.deferred_egress.len() as u64) as usize;
                if trim > 0 {
                    self.deferred_egress.trim_front(trim);
                    ctx.transport.notify_egress_body_buffered(-(trim as i64));
                }
                self.egress_body_bytes_committed = new_offset;
            }
            match ctx.transport.skip_body_to(self.id, new_offset) {
                Ok(accepted) => Ok(accepted),
                Err(_) => Err(TxnError::unsupported()),
            }
        })();
        self.exit(ctx);
        result
    }

    /// Receiver side: advertise that body below `new_offset` is no longer
    /// wanted.
    pub fn reject_body_to(
        &mut self,
        ctx: &mut TxnCtx<'_>,
        new_offset: u64,
    ) -> Result<Option<u64>, TxnError> {
        self.enter();
        let result = (|| {
            if !self.partially_reliable {
                return Err(TxnError::protocol(
                    Direction::Ingress,
                    "reject requires partially reliable mode",
                ));
            }
            match ctx.transport.reject_body_to(self.id, new_offset) {
                Ok(accepted) => {
                    self.ingress_body_offset = self.ingress_body_offset.max(new_offset);
                    self.ingress_body_delivered = self.ingress_body_delivered.max(new_offset);
                    Ok(accepted)
                }
                Err(_) => Err(TxnError::unsupported()),
            }
        })();
        self.exit(ctx);
        result
    }

    /// Invoked by the session when the peer skipped body below `offset`.
    pub fn on_ingress_body_skipped(&mut self, ctx: &mut TxnCtx<'_>, offset: u64) {
        self.enter();
        if !self.detached {
            self.ingress_body_offset = self.ingress_body_offset.max(offset);
            self.ingress_body_delivered = self.ingress_body_delivered.max(offset);
            self.with_handler(ctx, |h, t, c| h.on_body_skipped(t, c, offset));
        }
        self.exit(ctx);
    }

    /// Invoked by the session when the peer rejected our body below
    /// `offset`; the not-yet-flushed prefix is dropped.
    pub fn on_ingress_body_rejected(&mut self, ctx: &mut TxnCtx<'_>, offset: u64) {
        self.enter();
        if !self.detached {
            if offset > self.egress_body_bytes_committed {
                let trim = (offset - self.egress_body_bytes_committed)
                    .min(self.deferred_egress.len() as u64) as usize;
                if trim > 0 {
                    self.deferred_egress.trim_front(trim);
                    ctx.transport.notify_egress_body_buffered(-(trim as i64));
                }
                self.egress_body_bytes_committed = offset;
            }
            self.with_handler(ctx, |h, t, c| h.on_body_rejected(t, c, offset));
        }
        self.exit(ctx);
    }

    /// Invoked by the session when peekable bytes arrive in the transport
    /// read buffer.
    pub fn on_ingress_body_peek(&mut self, ctx: &mut TxnCtx<'_>, offset: u64) {
        self.enter();
        if !self.detached {
            self.with_handler(ctx, |h, t, c| h.on_body_peek(t, c, offset));
        }
        self.exit(ctx);
    }

    /// Run `cb` over the codec's buffered ingress without consuming it.
    pub fn peek(
        &mut self,
        ctx: &mut TxnCtx<'_>,
        cb: &mut dyn FnMut(u64, &[u8]),
    ) -> Result<(), TxnError> {
        ctx.transport
            .peek(self.id, cb)
            .map_err(|_| TxnError::unsupported())
    }

    /// Consume `amount` bytes from the front of the codec's read buffer.
    pub fn consume(&mut self, ctx: &mut TxnCtx<'_>, amount: usize) -> Result<(), TxnError> {
        ctx.transport
            .consume(self.id, amount)
            .map_err(|_| TxnError::unsupported())
    }

    // ── Priority ─────────────────────────────────────────────────────

    /// Update this transaction's priority and emit a priority frame. A
    /// call with the current priority is a no-op (no duplicate frame).
    pub fn update_and_send_priority(&mut self, ctx: &mut TxnCtx<'_>, priority: Priority) {
        if priority == self.priority || self.detached {
            return;
        }
        self.priority = priority;
        ctx.queue.update_priority(self.queue_handle, priority);
        ctx.transport.send_priority(self.id, &priority);
    }

    /// The peer changed our priority; apply locally without emitting.
    pub fn on_priority_update(&mut self, ctx: &mut TxnCtx<'_>, priority: Priority) {
        if self.detached {
            return;
        }
        self.priority = priority;
        ctx.queue.update_priority(self.queue_handle, priority);
    }
}

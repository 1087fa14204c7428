//! Integration tests: full transaction round trips over a recording mock
//! transport with a scripted handler.
//!
//! Each test builds a transaction, feeds it ingress the way a session
//! would, drives egress through the scheduler interface, and verifies
//! the exact sequences observed by the transport and the handler.

use std::time::{Duration, Instant};

use bytes::Bytes;

use httptxn::handler::Handler;
use httptxn::transport::{CodecInfo, Transport};
use httptxn::{
    Direction, ErrorCode, ErrorKind, Headers, HttpMessage, Priority, RoundRobinQueue, StreamId,
    Transaction, TxnConfig, TxnCtx, TxnDirection, TxnError, UpgradeProtocol,
};

// -- Recording transport --

#[derive(Debug, Clone, PartialEq)]
enum Wire {
    PauseIngress(u64),
    ResumeIngress(u64),
    TransactionTimeout(u64),
    Detach(u64),
    Headers { status: u16, method: String, eom: bool },
    Body { data: Vec<u8>, eom: bool },
    ChunkHeader(usize),
    ChunkTerminator,
    Eom { trailers: bool },
    Abort(ErrorCode),
    AbortDependent { id: u64, code: ErrorCode },
    Priority,
    WindowUpdate(u32),
    SkipBodyTo(u64),
    RejectBodyTo(u64),
}

struct MockTransport {
    wire: Vec<Wire>,
    codec: CodecInfo,
    next_push_id: Option<u64>,
    next_ex_id: Option<u64>,
    egress_buffered: i64,
    ingress_processed: u64,
    pending_egress_notifies: usize,
}

impl MockTransport {
    fn new() -> Self {
        MockTransport {
            wire: Vec::new(),
            codec: CodecInfo {
                multiplexed: true,
                supports_push: true,
                partially_reliable: false,
            },
            next_push_id: None,
            next_ex_id: None,
            egress_buffered: 0,
            ingress_processed: 0,
            pending_egress_notifies: 0,
        }
    }

    fn bodies(&self) -> Vec<&Wire> {
        self.wire
            .iter()
            .filter(|w| matches!(w, Wire::Body { .. }))
            .collect()
    }
}

impl Transport for MockTransport {
    fn pause_ingress(&mut self, txn: StreamId) {
        self.wire.push(Wire::PauseIngress(txn.0));
    }

    fn resume_ingress(&mut self, txn: StreamId) {
        self.wire.push(Wire::ResumeIngress(txn.0));
    }

    fn transaction_timeout(&mut self, txn: StreamId) {
        self.wire.push(Wire::TransactionTimeout(txn.0));
    }

    fn detach(&mut self, txn: StreamId) {
        self.wire.push(Wire::Detach(txn.0));
    }

    fn send_headers(&mut self, _txn: StreamId, headers: &HttpMessage, eom: bool) -> usize {
        self.wire.push(Wire::Headers {
            status: headers.status,
            method: headers.method.clone(),
            eom,
        });
        headers.byte_size()
    }

    fn send_body(&mut self, _txn: StreamId, body: Bytes, eom: bool, _track: bool) -> usize {
        let len = body.len();
        self.wire.push(Wire::Body {
            data: body.to_vec(),
            eom,
        });
        len
    }

    fn send_chunk_header(&mut self, _txn: StreamId, length: usize) -> usize {
        self.wire.push(Wire::ChunkHeader(length));
        8
    }

    fn send_chunk_terminator(&mut self, _txn: StreamId) -> usize {
        self.wire.push(Wire::ChunkTerminator);
        2
    }

    fn send_eom(&mut self, _txn: StreamId, trailers: Option<&Headers>) -> usize {
        self.wire.push(Wire::Eom {
            trailers: trailers.is_some(),
        });
        0
    }

    fn send_abort(&mut self, _txn: StreamId, code: ErrorCode) -> usize {
        self.wire.push(Wire::Abort(code));
        0
    }

    fn send_abort_dependent(&mut self, txn: StreamId, code: ErrorCode) -> usize {
        self.wire.push(Wire::AbortDependent { id: txn.0, code });
        0
    }

    fn send_priority(&mut self, _txn: StreamId, _priority: &Priority) -> usize {
        self.wire.push(Wire::Priority);
        5
    }

    fn send_window_update(&mut self, _txn: StreamId, delta: u32) -> usize {
        self.wire.push(Wire::WindowUpdate(delta));
        4
    }

    fn notify_pending_egress(&mut self) {
        self.pending_egress_notifies += 1;
    }

    fn notify_ingress_body_processed(&mut self, bytes: u32) {
        self.ingress_processed += u64::from(bytes);
    }

    fn notify_egress_body_buffered(&mut self, bytes: i64) {
        self.egress_buffered += bytes;
    }

    fn new_pushed_transaction(&mut self, _assoc: StreamId) -> Option<StreamId> {
        self.next_push_id.take().map(StreamId)
    }

    fn new_ex_transaction(&mut self, _control: StreamId, _unidirectional: bool) -> Option<StreamId> {
        self.next_ex_id.take().map(StreamId)
    }

    fn codec(&self) -> CodecInfo {
        self.codec
    }

    fn local_address(&self) -> Option<std::net::SocketAddr> {
        None
    }

    fn peer_address(&self) -> Option<std::net::SocketAddr> {
        None
    }

    fn is_draining(&self) -> bool {
        false
    }

    fn is_replay_safe(&self) -> bool {
        true
    }

    fn skip_body_to(&mut self, _txn: StreamId, offset: u64) -> Result<Option<u64>, ErrorCode> {
        if !self.codec.partially_reliable {
            return Err(ErrorCode::InternalError);
        }
        self.wire.push(Wire::SkipBodyTo(offset));
        Ok(Some(offset))
    }

    fn reject_body_to(&mut self, _txn: StreamId, offset: u64) -> Result<Option<u64>, ErrorCode> {
        if !self.codec.partially_reliable {
            return Err(ErrorCode::InternalError);
        }
        self.wire.push(Wire::RejectBodyTo(offset));
        Ok(Some(offset))
    }
}

// -- Scripted handler --

#[derive(Debug, Clone, PartialEq)]
enum Ev {
    Headers(u16, String),
    Body(Vec<u8>),
    BodyWithOffset(u64, Vec<u8>),
    ChunkHeader(usize),
    ChunkComplete,
    Trailers,
    Eom,
    Upgrade(UpgradeProtocol),
    Error(ErrorKind, Direction),
    EgressPaused,
    EgressResumed,
    Pushed(u64),
    Skipped(u64),
    Rejected(u64),
    Detach,
}

#[derive(Default)]
struct TestHandler {
    events: Vec<Ev>,
    pause_on_headers: bool,
}

impl Handler for TestHandler {
    fn on_headers_complete(&mut self, txn: &mut Transaction, ctx: &mut TxnCtx<'_>, msg: HttpMessage) {
        self.events.push(Ev::Headers(msg.status, msg.method.clone()));
        if self.pause_on_headers {
            txn.pause_ingress(ctx);
        }
    }

    fn on_body(&mut self, _txn: &mut Transaction, _ctx: &mut TxnCtx<'_>, chain: Bytes) {
        self.events.push(Ev::Body(chain.to_vec()));
    }

    fn on_body_with_offset(
        &mut self,
        _txn: &mut Transaction,
        _ctx: &mut TxnCtx<'_>,
        offset: u64,
        chain: Bytes,
    ) {
        self.events.push(Ev::BodyWithOffset(offset, chain.to_vec()));
    }

    fn on_chunk_header(&mut self, _txn: &mut Transaction, _ctx: &mut TxnCtx<'_>, length: usize) {
        self.events.push(Ev::ChunkHeader(length));
    }

    fn on_chunk_complete(&mut self, _txn: &mut Transaction, _ctx: &mut TxnCtx<'_>) {
        self.events.push(Ev::ChunkComplete);
    }

    fn on_trailers(&mut self, _txn: &mut Transaction, _ctx: &mut TxnCtx<'_>, _trailers: Headers) {
        self.events.push(Ev::Trailers);
    }

    fn on_eom(&mut self, _txn: &mut Transaction, _ctx: &mut TxnCtx<'_>) {
        self.events.push(Ev::Eom);
    }

    fn on_upgrade(&mut self, _txn: &mut Transaction, _ctx: &mut TxnCtx<'_>, protocol: UpgradeProtocol) {
        self.events.push(Ev::Upgrade(protocol));
    }

    fn on_error(&mut self, _txn: &mut Transaction, _ctx: &mut TxnCtx<'_>, error: TxnError) {
        self.events.push(Ev::Error(error.kind, error.direction));
    }

    fn on_egress_paused(&mut self, _txn: &mut Transaction, _ctx: &mut TxnCtx<'_>) {
        self.events.push(Ev::EgressPaused);
    }

    fn on_egress_resumed(&mut self, _txn: &mut Transaction, _ctx: &mut TxnCtx<'_>) {
        self.events.push(Ev::EgressResumed);
    }

    fn on_pushed_transaction(&mut self, _txn: &mut Transaction, _ctx: &mut TxnCtx<'_>, pushed: StreamId) {
        self.events.push(Ev::Pushed(pushed.0));
    }

    fn on_body_skipped(&mut self, _txn: &mut Transaction, _ctx: &mut TxnCtx<'_>, offset: u64) {
        self.events.push(Ev::Skipped(offset));
    }

    fn on_body_rejected(&mut self, _txn: &mut Transaction, _ctx: &mut TxnCtx<'_>, offset: u64) {
        self.events.push(Ev::Rejected(offset));
    }

    fn detach_transaction(&mut self) {
        self.events.push(Ev::Detach);
    }
}

// -- Helpers --

struct Rig {
    transport: MockTransport,
    queue: RoundRobinQueue,
    handler: TestHandler,
    now: Instant,
}

impl Rig {
    fn new() -> Self {
        Rig {
            transport: MockTransport::new(),
            queue: RoundRobinQueue::new(),
            handler: TestHandler::default(),
            now: Instant::now(),
        }
    }

    fn ctx(&mut self) -> TxnCtx<'_> {
        TxnCtx::new(
            &mut self.transport,
            &mut self.queue,
            &mut self.handler,
            self.now,
        )
    }

    fn advance(&mut self, ms: u64) {
        self.now += Duration::from_millis(ms);
    }
}

fn downstream(config: TxnConfig, queue: &mut RoundRobinQueue) -> Transaction {
    Transaction::new(TxnDirection::Downstream, StreamId(1), config, queue)
}

fn get_request(path: &str) -> HttpMessage {
    HttpMessage::request("GET", path)
}

// -- Scenarios --

#[test]
fn simple_downstream_get_round_trip() {
    let mut rig = Rig::new();
    let mut txn = downstream(TxnConfig::default(), &mut rig.queue);

    txn.on_ingress_headers_complete(&mut rig.ctx(), get_request("/x"));
    txn.on_ingress_eom(&mut rig.ctx());

    txn.send_headers(&mut rig.ctx(), &HttpMessage::response(200)).unwrap();
    txn.send_body(&mut rig.ctx(), Bytes::from_static(b"hello")).unwrap();
    txn.send_eom(&mut rig.ctx()).unwrap();

    let more = txn.on_write_ready(&mut rig.ctx(), 65_536, 1.0);
    assert!(!more);

    assert!(txn.is_ingress_complete());
    assert!(txn.is_egress_complete());
    assert!(txn.is_detached());

    assert_eq!(
        rig.handler.events,
        vec![Ev::Headers(0, "GET".into()), Ev::Eom, Ev::Detach]
    );
    assert_eq!(
        rig.transport.wire,
        vec![
            Wire::Headers {
                status: 200,
                method: String::new(),
                eom: false
            },
            Wire::Body {
                data: b"hello".to_vec(),
                eom: true
            },
            Wire::Detach(1),
        ]
    );
    // Buffered accounting returned to zero.
    assert_eq!(rig.transport.egress_buffered, 0);
}

#[test]
fn chunked_response_with_trailers() {
    let mut rig = Rig::new();
    rig.transport.codec.multiplexed = false;
    let mut txn = downstream(TxnConfig::default(), &mut rig.queue);

    txn.on_ingress_headers_complete(&mut rig.ctx(), get_request("/chunked"));
    txn.on_ingress_eom(&mut rig.ctx());

    txn.send_headers(&mut rig.ctx(), &HttpMessage::response(200)).unwrap();
    for _ in 0..2 {
        txn.send_chunk_header(&mut rig.ctx(), 4).unwrap();
        txn.send_body(&mut rig.ctx(), Bytes::from_static(b"data")).unwrap();
        txn.send_chunk_terminator(&mut rig.ctx()).unwrap();
    }
    let mut trailers = Headers::new();
    trailers.add("X", "1");
    txn.send_trailers(&mut rig.ctx(), trailers).unwrap();
    txn.send_eom(&mut rig.ctx()).unwrap();

    txn.on_write_ready(&mut rig.ctx(), 65_536, 1.0);

    assert_eq!(
        rig.transport.wire,
        vec![
            Wire::Headers {
                status: 200,
                method: String::new(),
                eom: false
            },
            Wire::ChunkHeader(4),
            Wire::Body {
                data: b"data".to_vec(),
                eom: false
            },
            Wire::ChunkTerminator,
            Wire::ChunkHeader(4),
            Wire::Body {
                data: b"data".to_vec(),
                eom: false
            },
            Wire::ChunkTerminator,
            Wire::Eom { trailers: true },
            Wire::Detach(1),
        ]
    );
    assert!(txn.is_detached());
}

#[test]
fn flow_control_stall_and_resume() {
    let mut rig = Rig::new();
    let config = TxnConfig {
        use_flow_control: true,
        send_initial_window: 10,
        ..Default::default()
    };
    let mut txn = downstream(config, &mut rig.queue);

    txn.on_ingress_headers_complete(&mut rig.ctx(), get_request("/big"));
    txn.on_ingress_eom(&mut rig.ctx());

    txn.send_headers(&mut rig.ctx(), &HttpMessage::response(200)).unwrap();
    txn.send_body(&mut rig.ctx(), Bytes::from(vec![0x61; 15])).unwrap();

    // First flush is clamped by the send window.
    let more = txn.on_write_ready(&mut rig.ctx(), 65_536, 1.0);
    assert!(more);
    assert_eq!(
        rig.transport.bodies(),
        vec![&Wire::Body {
            data: vec![0x61; 10],
            eom: false
        }]
    );
    assert_eq!(txn.outstanding_egress_body_bytes(), 5);
    assert!(rig.handler.events.contains(&Ev::EgressPaused));
    assert!(!rig.handler.events.contains(&Ev::EgressResumed));
    assert!(txn.is_flow_control_paused());

    // The peer consumes five bytes; the handler is resumed and the rest
    // flushes.
    txn.on_ingress_window_update(&mut rig.ctx(), 5);
    assert!(rig.handler.events.contains(&Ev::EgressResumed));

    let more = txn.on_write_ready(&mut rig.ctx(), 65_536, 1.0);
    assert!(!more);
    assert_eq!(
        rig.transport.bodies(),
        vec![
            &Wire::Body {
                data: vec![0x61; 10],
                eom: false
            },
            &Wire::Body {
                data: vec![0x61; 5],
                eom: false
            },
        ]
    );

    // Exactly one pause and one resume, in that order.
    let pauses: Vec<&Ev> = rig
        .handler
        .events
        .iter()
        .filter(|e| matches!(e, Ev::EgressPaused | Ev::EgressResumed))
        .collect();
    assert_eq!(pauses, vec![&Ev::EgressPaused, &Ev::EgressResumed]);
}

#[test]
fn body_before_headers_is_protocol_error() {
    let mut rig = Rig::new();
    let mut txn = downstream(TxnConfig::default(), &mut rig.queue);

    txn.on_ingress_body(&mut rig.ctx(), Bytes::from_static(b"x"), 0);

    assert!(matches!(
        rig.handler.events.first(),
        Some(Ev::Error(ErrorKind::Protocol(_), Direction::Ingress))
    ));
    assert!(!rig
        .handler
        .events
        .iter()
        .any(|e| matches!(e, Ev::Headers(..))));
    assert!(rig
        .transport
        .wire
        .contains(&Wire::Abort(ErrorCode::ProtocolError)));
    assert!(txn.is_detached());

    // Later ingress is suppressed without further errors.
    let errors_before = rig.handler.events.len();
    txn.on_ingress_body(&mut rig.ctx(), Bytes::from_static(b"y"), 0);
    assert_eq!(rig.handler.events.len(), errors_before);
}

#[test]
fn idle_timeout_during_ingress_body() {
    let mut rig = Rig::new();
    let config = TxnConfig {
        idle_timeout: Some(Duration::from_millis(100)),
        ..Default::default()
    };
    let mut txn = downstream(config, &mut rig.queue);

    txn.on_ingress_headers_complete(&mut rig.ctx(), get_request("/slow"));
    let deadline = txn.next_timeout().expect("timer armed on ingress start");
    assert_eq!(deadline, rig.now + Duration::from_millis(100));

    rig.advance(100);
    txn.on_timeout(&mut rig.ctx());

    assert!(rig
        .handler
        .events
        .contains(&Ev::Error(ErrorKind::Timeout, Direction::Ingress)));
    assert!(rig.transport.wire.contains(&Wire::TransactionTimeout(1)));
    assert!(rig.transport.wire.iter().any(|w| matches!(w, Wire::Abort(_))));
    assert!(txn.is_detached());
}

#[test]
fn push_cascade_on_abort() {
    let mut rig = Rig::new();
    let mut txn = downstream(TxnConfig::default(), &mut rig.queue);

    txn.on_ingress_headers_complete(&mut rig.ctx(), get_request("/page"));
    txn.on_ingress_eom(&mut rig.ctx());

    rig.transport.next_push_id = Some(2);
    let pushed = txn.new_pushed_transaction(&mut rig.ctx()).unwrap();
    assert_eq!(pushed, Some(StreamId(2)));
    assert!(txn.pushed_transactions().contains(&StreamId(2)));

    txn.send_abort(&mut rig.ctx(), ErrorCode::Cancel);

    assert!(rig.transport.wire.contains(&Wire::Abort(ErrorCode::Cancel)));
    assert!(rig.transport.wire.contains(&Wire::AbortDependent {
        id: 2,
        code: ErrorCode::Cancel
    }));
    assert!(txn.pushed_transactions().is_empty());
    assert!(txn.is_detached());
}

#[test]
fn pause_resume_without_ingress_is_noop() {
    let mut rig = Rig::new();
    let mut txn = downstream(TxnConfig::default(), &mut rig.queue);

    txn.pause_ingress(&mut rig.ctx());
    txn.resume_ingress(&mut rig.ctx());

    assert!(rig.handler.events.is_empty());
    assert_eq!(
        rig.transport.wire,
        vec![Wire::PauseIngress(1), Wire::ResumeIngress(1)]
    );
}

#[test]
fn ingress_queues_while_paused_and_drains_in_order() {
    let mut rig = Rig::new();
    rig.handler.pause_on_headers = true;
    let mut txn = downstream(TxnConfig::default(), &mut rig.queue);

    txn.on_ingress_headers_complete(&mut rig.ctx(), get_request("/q"));
    txn.on_ingress_body(&mut rig.ctx(), Bytes::from_static(b"one"), 0);
    txn.on_ingress_body(&mut rig.ctx(), Bytes::from_static(b"two"), 0);
    txn.on_ingress_eom(&mut rig.ctx());

    // Only the headers reached the handler; the rest is parked.
    assert_eq!(rig.handler.events, vec![Ev::Headers(0, "GET".into())]);
    assert!(txn.is_ingress_eom_queued());

    txn.resume_ingress(&mut rig.ctx());

    assert_eq!(
        rig.handler.events,
        vec![
            Ev::Headers(0, "GET".into()),
            Ev::Body(b"one".to_vec()),
            Ev::Body(b"two".to_vec()),
            Ev::Eom,
        ]
    );
    assert!(txn.is_ingress_complete());
}

#[test]
fn duplicate_priority_update_emits_one_frame() {
    let mut rig = Rig::new();
    let mut txn = downstream(TxnConfig::default(), &mut rig.queue);

    let pri = Priority {
        dependency: 3,
        weight: 100,
        exclusive: false,
    };
    txn.update_and_send_priority(&mut rig.ctx(), pri);
    txn.update_and_send_priority(&mut rig.ctx(), pri);

    let frames = rig
        .transport
        .wire
        .iter()
        .filter(|w| matches!(w, Wire::Priority))
        .count();
    assert_eq!(frames, 1);

    // Peer-driven updates never emit.
    let pri2 = Priority {
        dependency: 5,
        ..pri
    };
    txn.on_priority_update(&mut rig.ctx(), pri2);
    assert_eq!(txn.priority(), pri2);
    let frames = rig
        .transport
        .wire
        .iter()
        .filter(|w| matches!(w, Wire::Priority))
        .count();
    assert_eq!(frames, 1);
}

#[test]
fn upstream_interim_responses_repeat_headers() {
    let mut rig = Rig::new();
    let mut txn = Transaction::new(
        TxnDirection::Upstream,
        StreamId(1),
        TxnConfig::default(),
        &mut rig.queue,
    );

    let mut request = get_request("/upload");
    request.headers.add("Expect", "100-continue");
    txn.send_headers_with_eom(&mut rig.ctx(), &request).unwrap();
    assert!(txn.is_egress_complete());

    txn.on_ingress_headers_complete(&mut rig.ctx(), HttpMessage::response(100));
    assert_eq!(txn.last_response_status(), 100);
    assert!(txn.extra_response_expected());

    txn.on_ingress_headers_complete(&mut rig.ctx(), HttpMessage::response(200));
    assert_eq!(txn.last_response_status(), 200);
    assert!(!txn.extra_response_expected());

    txn.on_ingress_body(&mut rig.ctx(), Bytes::from_static(b"ok"), 0);
    txn.on_ingress_eom(&mut rig.ctx());

    assert_eq!(
        rig.handler.events,
        vec![
            Ev::Headers(100, String::new()),
            Ev::Headers(200, String::new()),
            Ev::Body(b"ok".to_vec()),
            Ev::Eom,
            Ev::Detach,
        ]
    );
}

#[test]
fn egress_content_length_mismatch_fails_eom() {
    let mut rig = Rig::new();
    let mut txn = downstream(TxnConfig::default(), &mut rig.queue);

    txn.on_ingress_headers_complete(&mut rig.ctx(), get_request("/len"));
    txn.on_ingress_eom(&mut rig.ctx());

    let mut response = HttpMessage::response(200);
    response.headers.add("Content-Length", "10");
    txn.send_headers(&mut rig.ctx(), &response).unwrap();
    txn.send_body(&mut rig.ctx(), Bytes::from_static(b"short")).unwrap();

    let err = txn.send_eom(&mut rig.ctx()).unwrap_err();
    assert!(matches!(err.kind, ErrorKind::Protocol(_)));
    assert_eq!(err.direction, Direction::Egress);
    assert!(rig.transport.wire.iter().any(|w| matches!(w, Wire::Abort(_))));
    assert!(txn.is_detached());
}

#[test]
fn egress_buffer_limit_pauses_handler() {
    let mut rig = Rig::new();
    let config = TxnConfig {
        egress_buffer_limit: 8,
        ..Default::default()
    };
    let mut txn = downstream(config, &mut rig.queue);

    txn.on_ingress_headers_complete(&mut rig.ctx(), get_request("/buf"));
    txn.on_ingress_eom(&mut rig.ctx());

    txn.send_headers(&mut rig.ctx(), &HttpMessage::response(200)).unwrap();
    txn.send_body(&mut rig.ctx(), Bytes::from(vec![0x62; 10])).unwrap();
    assert!(rig.handler.events.contains(&Ev::EgressPaused));

    txn.on_write_ready(&mut rig.ctx(), 65_536, 1.0);
    assert!(rig.handler.events.contains(&Ev::EgressResumed));
    assert_eq!(txn.outstanding_egress_body_bytes(), 0);
}

#[test]
fn rate_limited_flush_defers_and_wakes() {
    let mut rig = Rig::new();
    let mut txn = downstream(TxnConfig::default(), &mut rig.queue);

    txn.on_ingress_headers_complete(&mut rig.ctx(), get_request("/paced"));
    txn.on_ingress_eom(&mut rig.ctx());

    txn.set_egress_rate_limit(&mut rig.ctx(), 10); // 10 bytes/ms
    txn.send_headers(&mut rig.ctx(), &HttpMessage::response(200)).unwrap();
    txn.send_body(&mut rig.ctx(), Bytes::from(vec![0x63; 100])).unwrap();

    // The first flush rides on an empty ledger.
    txn.on_write_ready(&mut rig.ctx(), 65_536, 1.0);
    assert_eq!(rig.transport.bodies().len(), 1);

    // A hundred bytes in one millisecond is over budget; the next flush
    // must wait for the pacer.
    txn.send_body(&mut rig.ctx(), Bytes::from(vec![0x64; 50])).unwrap();
    rig.advance(1);
    let more = txn.on_write_ready(&mut rig.ctx(), 65_536, 1.0);
    assert!(!more);
    assert_eq!(rig.transport.bodies().len(), 1, "flush must be deferred");
    let wake = txn.next_timeout().expect("rate-limit wake armed");
    assert_eq!(wake, rig.now + Duration::from_millis(9));

    // The wake-up restores the budget.
    rig.advance(9);
    txn.on_timeout(&mut rig.ctx());
    txn.on_write_ready(&mut rig.ctx(), 65_536, 1.0);
    assert_eq!(rig.transport.bodies().len(), 2);
}

#[test]
fn unidirectional_ex_transaction_premarks_egress() {
    let mut rig = Rig::new();
    let config = TxnConfig {
        ex_attributes: Some(httptxn::ExAttributes {
            control_stream: StreamId(1),
            unidirectional: true,
        }),
        ..Default::default()
    };
    // Remote-initiated for an upstream transaction: even id.
    let mut txn = Transaction::new(TxnDirection::Upstream, StreamId(2), config, &mut rig.queue);

    assert!(txn.is_remote_initiated());
    assert!(txn.is_unidirectional());
    assert!(txn.is_egress_complete());

    // Only egress errors are interesting on this stream.
    assert!(txn.should_notify_ex_txn_error(Direction::Egress));
    assert!(!txn.should_notify_ex_txn_error(Direction::Ingress));

    // An ingress-tagged transport error terminates silently.
    txn.on_error(
        &mut rig.ctx(),
        TxnError::new(ErrorKind::Transport("reset".into()), Direction::Ingress),
    );
    assert!(!rig.handler.events.iter().any(|e| matches!(e, Ev::Error(..))));
    assert!(txn.is_detached());
}

#[test]
fn detach_waits_for_pending_byte_events() {
    let mut rig = Rig::new();
    let mut txn = downstream(TxnConfig::default(), &mut rig.queue);

    txn.on_ingress_headers_complete(&mut rig.ctx(), get_request("/tracked"));
    txn.on_ingress_eom(&mut rig.ctx());

    txn.increment_pending_byte_events();
    txn.increment_pending_byte_events();

    txn.send_headers_with_eom(&mut rig.ctx(), &HttpMessage::response(204)).unwrap();
    assert!(txn.is_ingress_complete());
    assert!(txn.is_egress_complete());
    assert!(!txn.is_detached(), "byte events must gate detach");

    txn.decrement_pending_byte_events(&mut rig.ctx());
    assert!(!txn.is_detached());
    txn.decrement_pending_byte_events(&mut rig.ctx());
    assert!(txn.is_detached());
    assert_eq!(rig.handler.events.last(), Some(&Ev::Detach));
}

#[test]
fn ingress_window_acknowledgement_accounting() {
    let mut rig = Rig::new();
    let config = TxnConfig {
        use_flow_control: true,
        recv_initial_window: 100,
        ..Default::default()
    };
    let mut txn = downstream(config, &mut rig.queue);

    txn.on_ingress_headers_complete(&mut rig.ctx(), get_request("/fc"));
    txn.on_ingress_body(&mut rig.ctx(), Bytes::from(vec![0x65; 30]), 0);

    // Delivered immediately, so acknowledged immediately.
    assert_eq!(rig.transport.wire.last(), Some(&Wire::WindowUpdate(30)));
    assert_eq!(txn.receive_window().outstanding(), 0);
    assert_eq!(rig.transport.ingress_processed, 30);

    // While paused, deliveries stop and so do acknowledgements.
    txn.pause_ingress(&mut rig.ctx());
    txn.on_ingress_body(&mut rig.ctx(), Bytes::from(vec![0x66; 40]), 0);
    assert_eq!(txn.receive_window().outstanding(), 40);
    assert!(!rig.transport.wire.contains(&Wire::WindowUpdate(40)));

    // Resume drains and acknowledges the backlog.
    txn.resume_ingress(&mut rig.ctx());
    assert_eq!(txn.receive_window().outstanding(), 0);
    assert!(rig.transport.wire.contains(&Wire::WindowUpdate(40)));
}

#[test]
fn deferred_ingress_overflow_without_flow_control_is_fatal() {
    let mut rig = Rig::new();
    rig.handler.pause_on_headers = true;
    let config = TxnConfig {
        max_deferred_ingress: 16,
        ..Default::default()
    };
    let mut txn = downstream(config, &mut rig.queue);

    txn.on_ingress_headers_complete(&mut rig.ctx(), get_request("/flood"));
    txn.on_ingress_body(&mut rig.ctx(), Bytes::from(vec![0x67; 12]), 0);
    assert!(!txn.is_aborted());

    txn.on_ingress_body(&mut rig.ctx(), Bytes::from(vec![0x68; 12]), 0);

    assert!(rig
        .handler
        .events
        .contains(&Ev::Error(ErrorKind::BufferFull, Direction::Ingress)));
    assert!(rig.transport.wire.iter().any(|w| matches!(w, Wire::Abort(_))));
    assert!(txn.is_detached());
}

#[test]
fn skip_body_trims_unsent_prefix() {
    let mut rig = Rig::new();
    rig.transport.codec.partially_reliable = true;
    let mut txn = downstream(TxnConfig::default(), &mut rig.queue);

    txn.on_ingress_headers_complete(&mut rig.ctx(), get_request("/pr"));
    txn.on_ingress_eom(&mut rig.ctx());

    txn.send_headers(&mut rig.ctx(), &HttpMessage::response(200)).unwrap();
    assert!(txn.is_partially_reliable());
    txn.send_body(&mut rig.ctx(), Bytes::from_static(b"0123456789")).unwrap();

    let accepted = txn.skip_body_to(&mut rig.ctx(), 4).unwrap();
    assert_eq!(accepted, Some(4));
    assert_eq!(txn.outstanding_egress_body_bytes(), 6);
    assert!(rig.transport.wire.contains(&Wire::SkipBodyTo(4)));

    txn.send_eom(&mut rig.ctx()).unwrap();
    txn.on_write_ready(&mut rig.ctx(), 65_536, 1.0);
    assert_eq!(
        rig.transport.bodies(),
        vec![&Wire::Body {
            data: b"456789".to_vec(),
            eom: true
        }]
    );
}

#[test]
fn peer_reject_trims_egress_and_notifies_handler() {
    let mut rig = Rig::new();
    rig.transport.codec.partially_reliable = true;
    let mut txn = downstream(TxnConfig::default(), &mut rig.queue);

    txn.on_ingress_headers_complete(&mut rig.ctx(), get_request("/pr2"));
    txn.send_headers(&mut rig.ctx(), &HttpMessage::response(200)).unwrap();
    txn.send_body(&mut rig.ctx(), Bytes::from_static(b"abcdefgh")).unwrap();

    txn.on_ingress_body_rejected(&mut rig.ctx(), 5);
    assert_eq!(txn.outstanding_egress_body_bytes(), 3);
    assert!(rig.handler.events.contains(&Ev::Rejected(5)));
}

#[test]
fn skip_requires_partially_reliable_codec() {
    let mut rig = Rig::new();
    let mut txn = downstream(TxnConfig::default(), &mut rig.queue);
    txn.send_headers(&mut rig.ctx(), &HttpMessage::response(200)).unwrap();

    let err = txn.skip_body_to(&mut rig.ctx(), 4).unwrap_err();
    assert!(matches!(err.kind, ErrorKind::Protocol(_)));
    // Non-fatal: the transaction keeps going.
    assert!(!txn.is_aborted());
    assert!(txn.send_body(&mut rig.ctx(), Bytes::from_static(b"ok")).is_ok());
}

#[test]
fn chunking_in_partially_reliable_mode_is_fatal() {
    let mut rig = Rig::new();
    rig.transport.codec.partially_reliable = true;
    let mut txn = downstream(TxnConfig::default(), &mut rig.queue);

    txn.send_headers(&mut rig.ctx(), &HttpMessage::response(200)).unwrap();
    let err = txn.send_chunk_header(&mut rig.ctx(), 4).unwrap_err();
    assert!(matches!(err.kind, ErrorKind::Protocol(_)));
    assert!(txn.is_aborted());
}

#[test]
fn upgrade_flows_through_to_handler() {
    let mut rig = Rig::new();
    let mut txn = downstream(TxnConfig::default(), &mut rig.queue);

    txn.on_ingress_headers_complete(&mut rig.ctx(), HttpMessage::request("CONNECT", "example:443"));
    txn.on_ingress_upgrade(&mut rig.ctx(), UpgradeProtocol::Tcp);
    txn.on_ingress_body(&mut rig.ctx(), Bytes::from_static(b"tunnelled"), 0);
    txn.on_ingress_eom(&mut rig.ctx());

    assert_eq!(
        rig.handler.events,
        vec![
            Ev::Headers(0, "CONNECT".into()),
            Ev::Upgrade(UpgradeProtocol::Tcp),
            Ev::Body(b"tunnelled".to_vec()),
            Ev::Eom,
        ]
    );
}

#[test]
fn ingress_error_still_allows_egress() {
    let mut rig = Rig::new();
    let mut txn = downstream(TxnConfig::default(), &mut rig.queue);

    txn.on_ingress_headers_complete(&mut rig.ctx(), get_request("/half"));
    txn.on_error(
        &mut rig.ctx(),
        TxnError::new(ErrorKind::Transport("read reset".into()), Direction::Ingress),
    );

    assert!(txn.is_ingress_complete());
    assert!(!txn.is_egress_complete());

    // Egress still flows.
    txn.send_headers(&mut rig.ctx(), &HttpMessage::response(200)).unwrap();
    txn.send_body(&mut rig.ctx(), Bytes::from_static(b"bye")).unwrap();
    txn.send_eom(&mut rig.ctx()).unwrap();
    txn.on_write_ready(&mut rig.ctx(), 65_536, 1.0);

    assert!(txn.is_detached());
    assert!(rig
        .transport
        .wire
        .contains(&Wire::Body {
            data: b"bye".to_vec(),
            eom: true
        }));
    // Exactly one error, then a single detach.
    let errors = rig
        .handler
        .events
        .iter()
        .filter(|e| matches!(e, Ev::Error(..)))
        .count();
    assert_eq!(errors, 1);
    let detaches = rig
        .handler
        .events
        .iter()
        .filter(|e| matches!(e, Ev::Detach))
        .count();
    assert_eq!(detaches, 1);
}

#[test]
fn push_refused_after_egress_eom() {
    let mut rig = Rig::new();
    let mut txn = downstream(TxnConfig::default(), &mut rig.queue);

    txn.on_ingress_headers_complete(&mut rig.ctx(), get_request("/done"));
    txn.send_headers(&mut rig.ctx(), &HttpMessage::response(204)).unwrap();
    txn.send_eom(&mut rig.ctx()).unwrap();

    rig.transport.next_push_id = Some(4);
    let pushed = txn.new_pushed_transaction(&mut rig.ctx()).unwrap();
    assert_eq!(pushed, None);
    assert!(txn.pushed_transactions().is_empty());
}

#[test]
fn upstream_cannot_push() {
    let mut rig = Rig::new();
    let mut txn = Transaction::new(
        TxnDirection::Upstream,
        StreamId(1),
        TxnConfig::default(),
        &mut rig.queue,
    );
    rig.transport.next_push_id = Some(4);
    assert!(txn.new_pushed_transaction(&mut rig.ctx()).is_err());
}

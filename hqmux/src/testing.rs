// Copyright (C) 2024, Cloudflare, Inc.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are
// met:
//
//     * Redistributions of source code must retain the above copyright notice,
//       this list of conditions and the following disclaimer.
//
//     * Redistributions in binary form must reproduce the above copyright
//       notice, this list of conditions and the following disclaimer in the
//       documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS
// IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO,
// THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR
// PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR
// CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL,
// EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
// PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
// PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF
// LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING
// NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE OF THIS
// SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

//! Session testing utilities.
//!
//! Provides a scriptable mock transport, a plain header codec whose
//! required-insert-count gating can be driven explicitly, recording
//! callback implementations, and a deterministic event-loop driver with a
//! virtual clock.

use std::cell::RefCell;
use std::collections::HashMap;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;
use std::time::Instant;

use crate::codec::Decoded;
use crate::codec::HeaderDecoder;
use crate::codec::HeaderEncoder;
use crate::frame;
use crate::push::PushId;
use crate::push::PushLifecycleObserver;
use crate::session::ConnectCallback;
use crate::session::InfoCallback;
use crate::session::ReplaySafetyCallback;
use crate::session::Session;
use crate::session::Txn;
use crate::stream;
use crate::transaction::ErrorKind;
use crate::transaction::StreamError;
use crate::transaction::TransactionHandler;
use crate::transport::ConnectionError;
use crate::transport::QuicTransport;
use crate::transport::TransportErrorCode;
use crate::transport::TransportResult;
use crate::Config;
use crate::Header;
use crate::Result;

/// The peer's control stream (first server-initiated unidirectional).
pub const PEER_CONTROL_STREAM_ID: u64 = 3;
/// The peer's QPACK encoder stream.
pub const PEER_QPACK_ENCODER_STREAM_ID: u64 = 7;
/// The peer's QPACK decoder stream.
pub const PEER_QPACK_DECODER_STREAM_ID: u64 = 11;

/// The local QPACK decoder stream allocated by the session (control=2,
/// encoder=6, decoder=10).
pub const LOCAL_QPACK_DECODER_STREAM_ID: u64 = 10;

/// State written by the session into the mock transport.
#[derive(Default)]
pub struct MockStream {
    pub write_buf: Vec<u8>,
    pub fin_sent: bool,
}

/// Shared mock transport state, inspectable from tests.
pub struct MockTransportState {
    pub local: SocketAddr,
    pub peer: SocketAddr,
    pub alpn: Vec<u8>,

    pub sock_good: bool,
    pub replay_safe: bool,

    next_uni_stream_id: u64,

    pub streams: HashMap<u64, MockStream>,

    /// Read offsets per ingress stream, advanced by delivered reads and
    /// `reject_data()`.
    pub read_offsets: HashMap<u64, u64>,

    pub reset_calls: Vec<(u64, u64)>,
    pub stop_sending_calls: Vec<(u64, u64)>,

    pub delivery_registrations: Vec<(u64, u64)>,
    pub cancelled_delivery_streams: Vec<u64>,

    /// When set, delivery callback registration fails on this stream.
    pub fail_delivery_on: Option<u64>,

    /// When set, the first reset per stream is deferred with a write
    /// error, forcing the session to retry.
    pub defer_first_reset: bool,
    deferred_resets: HashSet<u64>,

    pub closed: Option<(u64, Vec<u8>)>,
}

impl MockTransportState {
    fn new() -> MockTransportState {
        MockTransportState {
            local: "0.0.0.0:0".parse().unwrap(),
            peer: "127.0.0.1:4433".parse().unwrap(),
            alpn: b"h3".to_vec(),

            sock_good: true,
            replay_safe: false,

            next_uni_stream_id: 2,

            streams: HashMap::new(),
            read_offsets: HashMap::new(),

            reset_calls: Vec::new(),
            stop_sending_calls: Vec::new(),

            delivery_registrations: Vec::new(),
            cancelled_delivery_streams: Vec::new(),

            fail_delivery_on: None,

            defer_first_reset: false,
            deferred_resets: HashSet::new(),

            closed: None,
        }
    }

    /// Bytes the session wrote on the given stream.
    pub fn written(&self, stream_id: u64) -> &[u8] {
        self.streams
            .get(&stream_id)
            .map(|s| s.write_buf.as_slice())
            .unwrap_or(&[])
    }
}

/// A [`QuicTransport`] backed by shared, test-visible state.
pub struct MockTransport {
    pub state: Rc<RefCell<MockTransportState>>,
}

impl MockTransport {
    pub fn new() -> (MockTransport, Rc<RefCell<MockTransportState>>) {
        let state = Rc::new(RefCell::new(MockTransportState::new()));

        (
            MockTransport {
                state: state.clone(),
            },
            state,
        )
    }
}

impl QuicTransport for MockTransport {
    fn local_addr(&self) -> SocketAddr {
        self.state.borrow().local
    }

    fn peer_addr(&self) -> SocketAddr {
        self.state.borrow().peer
    }

    fn app_protocol(&self) -> Vec<u8> {
        self.state.borrow().alpn.clone()
    }

    fn good(&self) -> bool {
        self.state.borrow().sock_good
    }

    fn replay_safe(&self) -> bool {
        self.state.borrow().replay_safe
    }

    fn open_uni_stream(&mut self) -> TransportResult<u64> {
        let mut state = self.state.borrow_mut();

        let id = state.next_uni_stream_id;
        state.next_uni_stream_id += 4;
        state.streams.insert(id, MockStream::default());

        Ok(id)
    }

    fn stream_send(
        &mut self, stream_id: u64, data: &[u8], fin: bool,
    ) -> TransportResult<usize> {
        let mut state = self.state.borrow_mut();

        if !state.sock_good {
            return Err(TransportErrorCode::WriteError);
        }

        let stream = state.streams.entry(stream_id).or_default();

        stream.write_buf.extend_from_slice(data);
        stream.fin_sent |= fin;

        Ok(data.len())
    }

    fn reset_stream(
        &mut self, stream_id: u64, error_code: u64,
    ) -> TransportResult<()> {
        let mut state = self.state.borrow_mut();

        state.reset_calls.push((stream_id, error_code));

        if state.defer_first_reset &&
            state.deferred_resets.insert(stream_id)
        {
            return Err(TransportErrorCode::WriteError);
        }

        Ok(())
    }

    fn stop_sending(
        &mut self, stream_id: u64, error_code: u64,
    ) -> TransportResult<()> {
        self.state
            .borrow_mut()
            .stop_sending_calls
            .push((stream_id, error_code));

        Ok(())
    }

    fn register_delivery_callback(
        &mut self, stream_id: u64, offset: u64,
    ) -> TransportResult<()> {
        let mut state = self.state.borrow_mut();

        if state.fail_delivery_on == Some(stream_id) {
            return Err(TransportErrorCode::InvalidOperation);
        }

        state.delivery_registrations.push((stream_id, offset));

        Ok(())
    }

    fn cancel_delivery_callbacks(&mut self, stream_id: u64) {
        let mut state = self.state.borrow_mut();

        state.delivery_registrations.retain(|(id, _)| *id != stream_id);
        state.cancelled_delivery_streams.push(stream_id);
    }

    fn reject_data(
        &mut self, stream_id: u64, new_read_offset: u64,
    ) -> TransportResult<()> {
        let mut state = self.state.borrow_mut();

        let off = state.read_offsets.entry(stream_id).or_insert(0);

        if new_read_offset < *off {
            return Err(TransportErrorCode::InvalidOperation);
        }

        *off = new_read_offset;

        Ok(())
    }

    fn close(&mut self, error_code: u64, reason: &[u8]) {
        let mut state = self.state.borrow_mut();

        state.closed = Some((error_code, reason.to_vec()));
        state.sock_good = false;
    }
}

fn encode_block(headers: &[Header], required_insert_count: u64) -> Vec<u8> {
    use crate::NameValue;

    let mut len = octets::varint_len(required_insert_count);

    for h in headers {
        len += octets::varint_len(h.name().len() as u64) + h.name().len();
        len += octets::varint_len(h.value().len() as u64) + h.value().len();
    }

    let mut d = vec![0; len];
    let mut b = octets::OctetsMut::with_slice(&mut d);

    b.put_varint(required_insert_count).unwrap();

    for h in headers {
        b.put_varint(h.name().len() as u64).unwrap();
        b.put_bytes(h.name()).unwrap();
        b.put_varint(h.value().len() as u64).unwrap();
        b.put_bytes(h.value()).unwrap();
    }

    d
}

fn decode_block(block: &[u8]) -> Result<(u64, Vec<Header>)> {
    let mut b = octets::Octets::with_slice(block);

    let required = b.get_varint()?;

    let mut fields = Vec::new();

    while b.cap() > 0 {
        let name_len = b.get_varint()?;
        let name = b.get_bytes(name_len as usize)?.to_vec();
        let value_len = b.get_varint()?;
        let value = b.get_bytes(value_len as usize)?.to_vec();

        fields.push(Header::new(&name, &value));
    }

    Ok((required, fields))
}

/// A static-table-only encoder for egress requests.
#[derive(Default)]
pub struct PlainEncoder;

impl HeaderEncoder for PlainEncoder {
    fn encode(&mut self, headers: &[Header]) -> Result<Vec<u8>> {
        Ok(encode_block(headers, 0))
    }

    fn on_decoder_stream(&mut self, _data: &[u8]) -> Result<()> {
        Ok(())
    }
}

/// A decoder whose dynamic table advances one insert per encoder stream
/// byte, making blocked-stream scenarios scriptable.
#[derive(Default)]
pub struct PlainDecoder {
    known_insert_count: u64,
}

impl HeaderDecoder for PlainDecoder {
    fn decode(&mut self, _stream_id: u64, block: &[u8]) -> Result<Decoded> {
        let (required, fields) = decode_block(block)?;

        if required > self.known_insert_count {
            return Ok(Decoded::Blocked {
                required_insert_count: required,
            });
        }

        Ok(Decoded::Fields {
            fields,
            ack: required > 0,
        })
    }

    fn on_encoder_stream(&mut self, data: &[u8]) -> Result<()> {
        self.known_insert_count += data.len() as u64;

        Ok(())
    }

    fn known_insert_count(&self) -> u64 {
        self.known_insert_count
    }

    fn cancel_stream(&mut self, _stream_id: u64) -> Vec<u8> {
        vec![0x40]
    }

    fn ack_section(&mut self, _stream_id: u64) -> Vec<u8> {
        vec![0x80]
    }
}

/// The peer-side encoder used by the harness to build response blocks.
///
/// Encoding with `dynamic` set inserts one dynamic table entry, raising
/// the block's required insert count and producing one encoder stream
/// byte, which the harness (or the test) forwards when it chooses.
#[derive(Default)]
pub struct PeerEncoder {
    insert_count: u64,
    stream_buf: Vec<u8>,
}

impl PeerEncoder {
    pub fn encode(&mut self, headers: &[Header], dynamic: bool) -> Vec<u8> {
        let required = if dynamic {
            self.insert_count += 1;
            self.stream_buf.push(0x01);

            self.insert_count
        } else {
            0
        };

        encode_block(headers, required)
    }

    /// Takes the pending encoder stream bytes, e.g. to withhold them.
    pub fn take_stream(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.stream_buf)
    }
}

/// A recorded handler callback.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Callback {
    Headers { status: Vec<u8> },
    Body { len: usize },
    BodyWithOffset { offset: u64, len: usize },
    BodySkipped { new_offset: u64 },
    Trailers { count: usize },
    Eom,
    Goaway { last_id: u64 },
    PushedTransaction { push_id: PushId },
    Error { kind: ErrorKind, message: String },
    Detach,
}

type TxnHook = Box<dyn FnMut(&mut Txn)>;
type SessionHook = Box<dyn FnMut(&mut Session)>;

/// A handler that records every callback, with optional reentrancy hooks.
#[derive(Default)]
pub struct RecordingHandler {
    pub calls: Vec<Callback>,

    pub on_headers_hook: Option<TxnHook>,
    pub on_error_hook: Option<TxnHook>,
    pub on_detach_hook: Option<SessionHook>,
    pub on_pushed_hook: Option<Box<dyn FnMut(&mut Txn, PushId)>>,
}

impl RecordingHandler {
    pub fn new() -> Rc<RefCell<RecordingHandler>> {
        Rc::new(RefCell::new(RecordingHandler::default()))
    }

    /// The number of recorded callbacks of each interesting kind.
    pub fn count(&self, matcher: fn(&Callback) -> bool) -> usize {
        self.calls.iter().filter(|c| matcher(c)).count()
    }

    pub fn headers_count(&self) -> usize {
        self.count(|c| matches!(c, Callback::Headers { .. }))
    }

    pub fn body_bytes(&self) -> usize {
        self.calls
            .iter()
            .map(|c| match c {
                Callback::Body { len } => *len,
                Callback::BodyWithOffset { len, .. } => *len,
                _ => 0,
            })
            .sum()
    }

    pub fn eom_count(&self) -> usize {
        self.count(|c| matches!(c, Callback::Eom))
    }

    pub fn detach_count(&self) -> usize {
        self.count(|c| matches!(c, Callback::Detach))
    }

    pub fn goaway_count(&self) -> usize {
        self.count(|c| matches!(c, Callback::Goaway { .. }))
    }

    pub fn errors(&self) -> Vec<(ErrorKind, String)> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                Callback::Error { kind, message } =>
                    Some((*kind, message.clone())),
                _ => None,
            })
            .collect()
    }
}

impl TransactionHandler for RecordingHandler {
    fn on_headers(&mut self, txn: &mut Txn, headers: Vec<Header>) {
        use crate::NameValue;

        let status = headers
            .iter()
            .find(|h| h.name() == b":status")
            .map(|h| h.value().to_vec())
            .unwrap_or_default();

        self.calls.push(Callback::Headers { status });

        if let Some(hook) = self.on_headers_hook.as_mut() {
            hook(txn);
        }
    }

    fn on_body(&mut self, _txn: &mut Txn, data: &[u8]) {
        self.calls.push(Callback::Body { len: data.len() });
    }

    fn on_body_with_offset(&mut self, _txn: &mut Txn, offset: u64, data: &[u8]) {
        self.calls.push(Callback::BodyWithOffset {
            offset,
            len: data.len(),
        });
    }

    fn on_body_skipped(&mut self, _txn: &mut Txn, new_offset: u64) {
        self.calls.push(Callback::BodySkipped { new_offset });
    }

    fn on_trailers(&mut self, _txn: &mut Txn, trailers: Vec<Header>) {
        self.calls.push(Callback::Trailers {
            count: trailers.len(),
        });
    }

    fn on_eom(&mut self, _txn: &mut Txn) {
        self.calls.push(Callback::Eom);
    }

    fn on_error(&mut self, txn: &mut Txn, error: StreamError) {
        self.calls.push(Callback::Error {
            kind: error.kind,
            message: error.message,
        });

        if let Some(hook) = self.on_error_hook.as_mut() {
            hook(txn);
        }
    }

    fn on_goaway(&mut self, _txn: &mut Txn, last_id: u64) {
        self.calls.push(Callback::Goaway { last_id });
    }

    fn on_pushed_transaction(&mut self, txn: &mut Txn, push_id: PushId) {
        self.calls.push(Callback::PushedTransaction { push_id });

        if let Some(hook) = self.on_pushed_hook.as_mut() {
            hook(txn, push_id);
        }
    }

    fn detach_transaction(&mut self, session: &mut Session) {
        self.calls.push(Callback::Detach);

        if let Some(hook) = self.on_detach_hook.as_mut() {
            hook(session);
        }
    }
}

/// A recording connect callback with an optional error-reentrancy hook.
#[derive(Default)]
pub struct RecordingConnectCallback {
    pub successes: usize,
    pub errors: Vec<StreamError>,
    pub replay_safe_count: usize,

    pub on_error_hook: Option<SessionHook>,
}

impl RecordingConnectCallback {
    pub fn new() -> Rc<RefCell<RecordingConnectCallback>> {
        Rc::new(RefCell::new(RecordingConnectCallback::default()))
    }
}

impl ConnectCallback for RecordingConnectCallback {
    fn connect_success(&mut self, _session: &mut Session) {
        self.successes += 1;
    }

    fn connect_error(&mut self, session: &mut Session, error: StreamError) {
        self.errors.push(error);

        if let Some(hook) = self.on_error_hook.as_mut() {
            hook(session);
        }
    }

    fn on_replay_safe(&mut self, _session: &mut Session) {
        self.replay_safe_count += 1;
    }
}

#[derive(Default)]
pub struct RecordingInfoCallback {
    pub destroyed: usize,
}

impl RecordingInfoCallback {
    pub fn new() -> Rc<RefCell<RecordingInfoCallback>> {
        Rc::new(RefCell::new(RecordingInfoCallback::default()))
    }
}

impl InfoCallback for RecordingInfoCallback {
    fn on_destroy(&mut self) {
        self.destroyed += 1;
    }
}

#[derive(Default)]
pub struct RecordingReplayCallback {
    pub fired: usize,
}

impl RecordingReplayCallback {
    pub fn new() -> Rc<RefCell<RecordingReplayCallback>> {
        Rc::new(RefCell::new(RecordingReplayCallback::default()))
    }
}

impl ReplaySafetyCallback for RecordingReplayCallback {
    fn on_replay_safe(&mut self) {
        self.fired += 1;
    }
}

/// A recorded push lifecycle event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PushEvent {
    PromiseBegin {
        assoc_stream_id: u64,
        push_id: PushId,
    },
    Promise {
        assoc_stream_id: u64,
        push_id: PushId,
        header_count: usize,
    },
    NascentBegin {
        stream_id: u64,
        is_eof: bool,
    },
    Nascent {
        stream_id: u64,
        push_id: PushId,
        is_eof: bool,
    },
    NascentEof {
        stream_id: u64,
        push_id: Option<PushId>,
    },
    OrphanedNascent {
        stream_id: u64,
        push_id: Option<PushId>,
    },
    HalfOpen {
        push_id: PushId,
        assoc_stream_id: u64,
    },
    PushedTxn {
        stream_id: u64,
        push_id: PushId,
        assoc_stream_id: u64,
    },
    PushedTxnTimeout {
        push_id: PushId,
    },
    OrphanedHalfOpen {
        push_id: PushId,
    },
}

#[derive(Default)]
pub struct RecordingPushObserver {
    pub events: Vec<PushEvent>,
}

impl RecordingPushObserver {
    pub fn new() -> Rc<RefCell<RecordingPushObserver>> {
        Rc::new(RefCell::new(RecordingPushObserver::default()))
    }
}

impl PushLifecycleObserver for RecordingPushObserver {
    fn push_promise_begin(&mut self, assoc_stream_id: u64, push_id: PushId) {
        self.events.push(PushEvent::PromiseBegin {
            assoc_stream_id,
            push_id,
        });
    }

    fn push_promise(
        &mut self, assoc_stream_id: u64, push_id: PushId, headers: &[Header],
    ) {
        self.events.push(PushEvent::Promise {
            assoc_stream_id,
            push_id,
            header_count: headers.len(),
        });
    }

    fn nascent_push_stream_begin(&mut self, stream_id: u64, is_eof: bool) {
        self.events.push(PushEvent::NascentBegin { stream_id, is_eof });
    }

    fn nascent_push_stream(
        &mut self, stream_id: u64, push_id: PushId, is_eof: bool,
    ) {
        self.events.push(PushEvent::Nascent {
            stream_id,
            push_id,
            is_eof,
        });
    }

    fn nascent_eof(&mut self, stream_id: u64, push_id: Option<PushId>) {
        self.events.push(PushEvent::NascentEof { stream_id, push_id });
    }

    fn orphaned_nascent_stream(
        &mut self, stream_id: u64, push_id: Option<PushId>,
    ) {
        self.events
            .push(PushEvent::OrphanedNascent { stream_id, push_id });
    }

    fn half_open_pushed_txn(&mut self, push_id: PushId, assoc_stream_id: u64) {
        self.events.push(PushEvent::HalfOpen {
            push_id,
            assoc_stream_id,
        });
    }

    fn pushed_txn(
        &mut self, stream_id: u64, push_id: PushId, assoc_stream_id: u64,
    ) {
        self.events.push(PushEvent::PushedTxn {
            stream_id,
            push_id,
            assoc_stream_id,
        });
    }

    fn pushed_txn_timeout(&mut self, push_id: PushId) {
        self.events.push(PushEvent::PushedTxnTimeout { push_id });
    }

    fn orphaned_half_open_pushed_txn(&mut self, push_id: PushId) {
        self.events.push(PushEvent::OrphanedHalfOpen { push_id });
    }
}

enum Event {
    Read { stream_id: u64, data: Vec<u8>, fin: bool },
    DataExpired { stream_id: u64, offset: u64 },
    StopSending { stream_id: u64, code: u64 },
    ConnectionEnd,
}

struct Scheduled {
    due: Instant,
    seq: u64,
    event: Event,
}

/// Peer-side state for one stream the harness writes.
#[derive(Default)]
struct PeerStream {
    buf: Vec<u8>,
    eof: bool,

    /// Total bytes queued on the stream so far, i.e. the peer's write
    /// offset. Skip offsets are computed against this.
    wire_offset: u64,
}

/// A deterministic driver for a session under test.
///
/// Plays the part of both the event loop and the server: read events are
/// queued (optionally with a delay on the virtual clock) and dispatched in
/// order, session timers fire when the clock reaches them, and delivery
/// callbacks registered with the mock transport are acknowledged
/// automatically.
pub struct Harness {
    pub session: Session,
    pub transport: Rc<RefCell<MockTransportState>>,
    pub peer_encoder: PeerEncoder,

    pub now: Instant,

    /// Whether registered delivery callbacks are acknowledged
    /// automatically at each loop iteration.
    pub auto_ack: bool,

    events: Vec<Scheduled>,
    seq: u64,

    peer_streams: HashMap<u64, PeerStream>,
    next_peer_uni_id: u64,
}

impl Harness {
    pub fn new() -> Harness {
        Harness::with_config(&Config::new().unwrap())
    }

    pub fn with_config(config: &Config) -> Harness {
        let (transport, state) = MockTransport::new();

        let session = Session::with_transport(
            Box::new(transport),
            Box::<PlainEncoder>::default(),
            Box::<PlainDecoder>::default(),
            config,
        )
        .unwrap();

        Harness {
            session,
            transport: state,
            peer_encoder: PeerEncoder::default(),

            now: Instant::now(),

            auto_ack: true,

            events: Vec::new(),
            seq: 0,

            peer_streams: HashMap::new(),
            next_peer_uni_id: 15,
        }
    }

    /// Brings the session up: transport ready, peer control stream with
    /// SETTINGS delivered.
    pub fn connect(&mut self) {
        self.session.on_transport_ready();

        self.send_peer_settings();
        self.loop_once();
    }

    /// Queues the peer's control stream preface and SETTINGS frame.
    pub fn send_peer_settings(&mut self) {
        let mut bytes = vec![stream::HTTP3_CONTROL_STREAM_TYPE_ID as u8];

        let settings = frame::Frame::Settings {
            max_field_section_size: None,
            qpack_max_table_capacity: Some(100),
            qpack_blocked_streams: Some(16),
            raw: None,
        };

        bytes.extend_from_slice(&serialize_frame(&settings));

        self.add_read_event(PEER_CONTROL_STREAM_ID, bytes, false, Duration::ZERO);
    }

    pub fn next_push_stream_id(&mut self) -> u64 {
        let id = self.next_peer_uni_id;
        self.next_peer_uni_id += 4;

        id
    }

    /// Queues a GOAWAY on the peer control stream.
    pub fn send_goaway(&mut self, last_id: u64, delay: Duration) {
        let bytes = serialize_frame(&frame::Frame::GoAway { id: last_id });

        self.add_read_event(PEER_CONTROL_STREAM_ID, bytes, false, delay);
    }

    /// Buffers a full response on a request stream.
    pub fn send_response(
        &mut self, stream_id: u64, status: u64, body_len: usize, eom: bool,
        dynamic: bool,
    ) {
        let mut headers = vec![
            Header::new(b":status", status.to_string().as_bytes()),
            Header::new(b"content-length", body_len.to_string().as_bytes()),
        ];

        if dynamic {
            headers.push(Header::new(b"x-dynamic", b"1"));
        }

        let block = self.peer_encoder.encode(&headers, dynamic);

        let stream = self.peer_streams.entry(stream_id).or_default();

        let hdrs = serialize_frame(&frame::Frame::Headers {
            header_block: block,
        });
        stream.buf.extend_from_slice(&hdrs);

        if body_len > 0 {
            let data = serialize_frame(&frame::Frame::Data {
                payload: make_buf(body_len),
            });
            stream.buf.extend_from_slice(&data);
        }

        stream.eof = eom;
    }

    /// Starts a partially-reliable response: final headers only, body to
    /// follow unframed.
    pub fn start_partial_response(
        &mut self, stream_id: u64, status: u64, content_length: usize,
        dynamic: bool,
    ) {
        let mut headers = vec![
            Header::new(b":status", status.to_string().as_bytes()),
            Header::new(
                b"content-length",
                content_length.to_string().as_bytes(),
            ),
        ];

        if dynamic {
            headers.push(Header::new(b"x-dynamic", b"1"));
        }

        let block = self.peer_encoder.encode(&headers, dynamic);

        let stream = self.peer_streams.entry(stream_id).or_default();
        let hdrs = serialize_frame(&frame::Frame::Headers {
            header_block: block,
        });
        stream.buf.extend_from_slice(&hdrs);
    }

    /// Buffers unframed partially-reliable body bytes.
    pub fn send_partial_body(
        &mut self, stream_id: u64, body: &[u8], eom: bool,
    ) {
        let stream = self.peer_streams.entry(stream_id).or_default();

        stream.buf.extend_from_slice(body);
        stream.eof = eom;
    }

    /// Declares `delta` upcoming body bytes as expired (peer-side skip).
    pub fn deliver_data_expired(&mut self, stream_id: u64, delta: u64) {
        let stream = self.peer_streams.entry(stream_id).or_default();

        let offset = stream.wire_offset + delta;
        stream.wire_offset = offset;

        let seq = self.next_seq();
        self.events.push(Scheduled {
            due: self.now,
            seq,
            event: Event::DataExpired { stream_id, offset },
        });
    }

    /// Accounts peer-side for body bytes the receiver rejected.
    pub fn peer_data_rejected(&mut self, stream_id: u64, delta: u64) {
        let stream = self.peer_streams.entry(stream_id).or_default();
        stream.wire_offset += delta;
    }

    /// Buffers a PUSH_PROMISE on a request stream.
    pub fn send_push_promise(
        &mut self, stream_id: u64, push_id: PushId, dynamic: bool,
    ) {
        let headers = get_request();
        let block = self.peer_encoder.encode(&headers, dynamic);

        let pp = serialize_frame(&frame::Frame::PushPromise {
            push_id: push_id.value(),
            header_block: block,
        });

        let stream = self.peer_streams.entry(stream_id).or_default();
        stream.buf.extend_from_slice(&pp);
    }

    /// Creates a full push stream: preface, unframed push ID, response.
    ///
    /// Returns the push stream's ID.
    pub fn create_push_stream(
        &mut self, push_id: PushId, status: u64, body_len: usize, eom: bool,
    ) -> u64 {
        let stream_id = self.create_nascent_push_stream(Some(push_id), false);

        let headers =
            vec![Header::new(b":status", status.to_string().as_bytes())];
        let block = self.peer_encoder.encode(&headers, false);

        let stream = self.peer_streams.entry(stream_id).or_default();

        let hdrs = serialize_frame(&frame::Frame::Headers {
            header_block: block,
        });
        stream.buf.extend_from_slice(&hdrs);

        if body_len > 0 {
            let data = serialize_frame(&frame::Frame::Data {
                payload: make_buf(body_len),
            });
            stream.buf.extend_from_slice(&data);
        }

        stream.eof = eom;

        stream_id
    }

    /// Creates a push stream preface, optionally followed by the unframed
    /// push ID, and nothing else.
    pub fn create_nascent_push_stream(
        &mut self, push_id: Option<PushId>, eom: bool,
    ) -> u64 {
        let stream_id = self.next_push_stream_id();

        let stream = self.peer_streams.entry(stream_id).or_default();

        stream.buf.push(stream::HTTP3_PUSH_STREAM_TYPE_ID as u8);

        if let Some(push_id) = push_id {
            let mut d = [0; 8];
            let mut b = octets::OctetsMut::with_slice(&mut d);
            b.put_varint(push_id.value()).unwrap();
            let off = b.off();
            stream.buf.extend_from_slice(&d[..off]);
        }

        stream.eof = eom;

        stream_id
    }

    /// Queues encoder stream bytes for delivery to the session's decoder.
    pub fn send_encoder_stream_data(&mut self, data: Vec<u8>) {
        let mut bytes = self.encoder_stream_preface();

        bytes.extend_from_slice(&data);

        self.add_read_event(
            PEER_QPACK_ENCODER_STREAM_ID,
            bytes,
            false,
            Duration::ZERO,
        );
    }

    /// The encoder stream type byte, emitted exactly once.
    fn encoder_stream_preface(&mut self) -> Vec<u8> {
        let stream = self
            .peer_streams
            .entry(PEER_QPACK_ENCODER_STREAM_ID)
            .or_default();

        if stream.wire_offset == 0 {
            stream.wire_offset = 1;

            return vec![stream::QPACK_ENCODER_STREAM_TYPE_ID as u8];
        }

        Vec::new()
    }

    /// Moves buffered peer stream bytes into scheduled read events.
    pub fn flush(&mut self) {
        self.flush_with_delay(Duration::ZERO);
    }

    pub fn flush_with_delay(&mut self, delay: Duration) {
        // Encoder stream bytes ride along with every flush, unless the
        // test withheld them.
        let enc = self.peer_encoder.take_stream();
        if !enc.is_empty() {
            let mut bytes = self.encoder_stream_preface();
            bytes.extend_from_slice(&enc);

            self.add_read_event(
                PEER_QPACK_ENCODER_STREAM_ID,
                bytes,
                false,
                delay,
            );
        }

        let ids: Vec<u64> = self.peer_streams.keys().copied().collect();

        for id in ids {
            if id == PEER_QPACK_ENCODER_STREAM_ID {
                continue;
            }

            let (data, fin) = {
                let stream = self.peer_streams.get_mut(&id).unwrap();

                if stream.buf.is_empty() && !stream.eof {
                    continue;
                }

                let data = std::mem::take(&mut stream.buf);
                let fin = stream.eof;
                stream.eof = false;
                stream.wire_offset += data.len() as u64;

                (data, fin)
            };

            if data.is_empty() && !fin {
                continue;
            }

            self.add_read_event(id, data, fin, delay);
        }
    }

    /// Flushes a single peer stream, for tests that need a precise event
    /// order across streams.
    pub fn flush_stream(&mut self, stream_id: u64) {
        let (data, fin) = {
            let stream = match self.peer_streams.get_mut(&stream_id) {
                Some(v) => v,
                None => return,
            };

            let data = std::mem::take(&mut stream.buf);
            let fin = stream.eof;
            stream.eof = false;
            stream.wire_offset += data.len() as u64;

            (data, fin)
        };

        if data.is_empty() && !fin {
            return;
        }

        self.add_read_event(stream_id, data, fin, Duration::ZERO);
    }

    pub fn add_read_event(
        &mut self, stream_id: u64, data: Vec<u8>, fin: bool, delay: Duration,
    ) {
        let seq = self.next_seq();

        self.events.push(Scheduled {
            due: self.now + delay,
            seq,
            event: Event::Read {
                stream_id,
                data,
                fin,
            },
        });
    }

    pub fn deliver_connection_error(&mut self, error: ConnectionError) {
        self.session.on_connection_error(error);
    }

    pub fn deliver_stop_sending(&mut self, stream_id: u64, code: u64) {
        let seq = self.next_seq();

        self.events.push(Scheduled {
            due: self.now,
            seq,
            event: Event::StopSending { stream_id, code },
        });
    }

    pub fn deliver_connection_end(&mut self) {
        let seq = self.next_seq();

        self.events.push(Scheduled {
            due: self.now,
            seq,
            event: Event::ConnectionEnd,
        });
    }

    /// Processes every event due at the current virtual time, without
    /// advancing the clock or firing timers.
    pub fn loop_once(&mut self) {
        loop {
            let idx = self.next_due_event(Some(self.now));

            let Some(idx) = idx else { break };

            let ev = self.events.remove(idx);
            self.dispatch(ev.event);
        }

        self.ack_deliveries();
    }

    /// Runs events and timers to completion, advancing the virtual clock.
    pub fn loop_all(&mut self) {
        loop {
            let next_event_due = self
                .next_due_event(None)
                .map(|i| self.events[i].due);

            let next_timer = self.session.timeout();

            let due = match (next_event_due, next_timer) {
                (Some(e), Some(t)) => e.min(t),
                (Some(e), None) => e,
                (None, Some(t)) => t,
                (None, None) => break,
            };

            self.now = self.now.max(due);

            if let Some(idx) = self.next_due_event(Some(self.now)) {
                let ev = self.events.remove(idx);
                self.dispatch(ev.event);
            } else {
                self.session.on_timeout(self.now);
            }

            self.ack_deliveries();
        }
    }

    pub fn flush_and_loop(&mut self) {
        self.flush();
        self.loop_all();
    }

    pub fn flush_and_loop_once(&mut self) {
        self.flush();
        self.loop_once();
    }

    /// The earliest queued event, optionally bounded by a due time.
    fn next_due_event(&self, not_after: Option<Instant>) -> Option<usize> {
        let mut best: Option<usize> = None;

        for (i, ev) in self.events.iter().enumerate() {
            if let Some(limit) = not_after {
                if ev.due > limit {
                    continue;
                }
            }

            best = match best {
                Some(b)
                    if (self.events[b].due, self.events[b].seq) <=
                        (ev.due, ev.seq) =>
                    Some(b),

                _ => Some(i),
            };
        }

        best
    }

    fn dispatch(&mut self, event: Event) {
        match event {
            Event::Read {
                stream_id,
                data,
                fin,
            } => {
                *self
                    .transport
                    .borrow_mut()
                    .read_offsets
                    .entry(stream_id)
                    .or_insert(0) += data.len() as u64;

                self.session.on_read(self.now, stream_id, &data, fin);
            },

            Event::DataExpired { stream_id, offset } => {
                let mut state = self.transport.borrow_mut();
                let off = state.read_offsets.entry(stream_id).or_insert(0);
                *off = (*off).max(offset);
                drop(state);

                self.session.on_data_expired(self.now, stream_id, offset);
            },

            Event::StopSending { stream_id, code } => {
                self.session.on_stop_sending(stream_id, code);
            },

            Event::ConnectionEnd => {
                self.session.on_connection_end();
            },
        }
    }

    /// Acknowledges delivery callbacks registered with the transport.
    fn ack_deliveries(&mut self) {
        if !self.auto_ack {
            return;
        }

        let regs: Vec<(u64, u64)> = {
            let mut state = self.transport.borrow_mut();
            std::mem::take(&mut state.delivery_registrations)
        };

        for (stream_id, offset) in regs {
            self.session.on_delivery_ack(stream_id, offset);
        }
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }
}

impl Default for Harness {
    fn default() -> Self {
        Harness::new()
    }
}

pub fn serialize_frame(frame: &frame::Frame) -> Vec<u8> {
    let mut d = vec![0; 65535];
    let mut b = octets::OctetsMut::with_slice(&mut d);
    frame.to_bytes(&mut b).unwrap();
    let off = b.off();
    d.truncate(off);

    d
}

pub fn make_buf(len: usize) -> Vec<u8> {
    vec![0x58; len]
}

/// Standard GET request headers.
pub fn get_request() -> Vec<Header> {
    vec![
        Header::new(b":method", b"GET"),
        Header::new(b":scheme", b"https"),
        Header::new(b":authority", b"test.example"),
        Header::new(b":path", b"/"),
    ]
}

/// Standard POST request headers with a body length.
pub fn post_request(body_len: usize) -> Vec<Header> {
    vec![
        Header::new(b":method", b"POST"),
        Header::new(b":scheme", b"https"),
        Header::new(b":authority", b"test.example"),
        Header::new(b":path", b"/upload"),
        Header::new(b"content-length", body_len.to_string().as_bytes()),
    ]
}

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

//! The upstream HTTP/3 session.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Instant;

use smallvec::SmallVec;

use crate::codec::Decoded;
use crate::codec::HeaderDecoder;
use crate::codec::HeaderEncoder;
use crate::frame;
use crate::is_interim_response;
use crate::push::PushCoordinator;
use crate::push::PushId;
use crate::push::PushLifecycleObserver;
use crate::stream;
use crate::stream::Stream;
use crate::stream::StreamIdHashMap;
use crate::transaction::ErrorKind;
use crate::transaction::Pending;
use crate::transaction::PushAttributes;
use crate::transaction::StreamError;
use crate::transaction::Transaction;
use crate::transaction::TransactionHandler;
use crate::transaction::TxnState;
use crate::transport;
use crate::transport::ConnectionError;
use crate::transport::QuicTransport;
use crate::transport::TransportErrorCode;
use crate::Config;
use crate::Error;
use crate::Header;
use crate::Result;

/// The largest value a GOAWAY frame can carry.
pub const MAX_GOAWAY_ID: u64 = (1 << 62) - 1;

/// The session lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the transport to become ready.
    Connecting,

    /// Transactions may be created and driven.
    Open,

    /// No new transactions; existing ones are allowed to finish.
    Draining,

    /// The connection is gone.
    Closed,
}

/// Session-level connect notifications.
///
/// Exactly one of `connect_success()` or `connect_error()` is invoked, and
/// it is invoked before the session can be destroyed.
pub trait ConnectCallback {
    fn connect_success(&mut self, session: &mut Session);

    fn connect_error(&mut self, session: &mut Session, error: StreamError);

    /// The transport left the 0-RTT replay window.
    fn on_replay_safe(&mut self, session: &mut Session) {
        let _ = session;
    }
}

/// Session teardown notification.
pub trait InfoCallback {
    /// Invoked exactly once, in the call stack that destroyed the session.
    fn on_destroy(&mut self);
}

/// A callback waiting for the transport to become replay safe.
pub trait ReplaySafetyCallback {
    fn on_replay_safe(&mut self);
}

/// Settings advertised by one endpoint.
#[derive(Clone, Debug, Default)]
pub struct ConnectionSettings {
    pub max_field_section_size: Option<u64>,
    pub qpack_max_table_capacity: Option<u64>,
    pub qpack_blocked_streams: Option<u64>,
    pub raw: Option<Vec<(u64, u64)>>,
}

/// A header block held back by the QPACK gate.
struct BlockedEntry {
    stream_id: u64,
    required_insert_count: u64,
    deadline: Instant,
}

/// A PUSH_PROMISE header block held back by the QPACK gate.
///
/// Promise blocks are not handler deliveries, so they are gated here
/// rather than in a transaction's pending queue; the promise is only
/// registered once its headers actually decode.
struct BlockedPromise {
    push_id: PushId,
    assoc_stream_id: u64,
    block: Vec<u8>,
    required_insert_count: u64,
    deadline: Instant,
}

/// An upstream HTTP/3 session bound to one QUIC connection.
///
/// The session classifies every incoming unidirectional stream by its
/// preface, drives the control and QPACK streams, maps request streams to
/// transactions, and correlates server push promises with push streams.
///
/// All state lives on one thread. Transport events are pushed in through
/// the `on_*` entry points; handler callbacks are queued internally and
/// drained before each entry point returns, never recursively.
pub struct Session {
    transport: Box<dyn QuicTransport>,
    config: Config,

    state: SessionState,

    /// Whether `close_when_idle()` was requested.
    drained: bool,

    encoder: Box<dyn HeaderEncoder>,
    decoder: Box<dyn HeaderDecoder>,

    connect_cb: Option<Rc<RefCell<dyn ConnectCallback>>>,
    connect_fired: bool,
    info_cb: Option<Rc<RefCell<dyn InfoCallback>>>,
    destroy_fired: bool,
    push_observer: Option<Rc<RefCell<dyn PushLifecycleObserver>>>,

    /// Addresses snapshotted when the transport became ready; they stay
    /// readable after `drop_connection()`.
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,

    control_stream_id: Option<u64>,
    peer_control_stream_id: Option<u64>,
    qpack_encoder_stream_id: Option<u64>,
    qpack_decoder_stream_id: Option<u64>,
    peer_qpack_encoder_stream_id: Option<u64>,
    peer_qpack_decoder_stream_id: Option<u64>,

    sent_settings: bool,
    local_settings: ConnectionSettings,
    peer_settings: Option<ConnectionSettings>,

    local_goaway_id: Option<u64>,
    peer_goaway_id: Option<u64>,

    /// Active transactions, keyed by stream ID (request and push streams).
    transactions: StreamIdHashMap<Transaction>,

    /// Peer unidirectional streams not (yet) bound to a transaction.
    uni_streams: StreamIdHashMap<Stream>,

    /// Nascent push streams whose push ID was read but whose promise has
    /// not arrived.
    unadopted_push_streams: BTreeMap<PushId, u64>,

    push: PushCoordinator,

    next_request_stream_id: u64,
    max_seen_peer_stream_id: u64,

    /// QPACK gate entries, in arrival order.
    blocked_streams: Vec<BlockedEntry>,

    /// Gated PUSH_PROMISE blocks, in arrival order.
    blocked_promises: Vec<BlockedPromise>,

    replay_callbacks: SmallVec<[Rc<RefCell<dyn ReplaySafetyCallback>>; 4]>,

    /// Streams with queued deliveries, in schedule order.
    delivery_order: VecDeque<u64>,
    scheduled: BTreeSet<u64>,
    pumping: bool,

    drain_goaway_deadline: Option<Instant>,

    now: Instant,
}

impl Session {
    /// Creates a session over an established QUIC connection.
    ///
    /// The transport must already carry a negotiated HTTP/3 ALPN; the
    /// session starts in [`SessionState::Connecting`] and becomes usable
    /// once [`on_transport_ready()`](Session::on_transport_ready) fires.
    pub fn with_transport(
        transport: Box<dyn QuicTransport>, encoder: Box<dyn HeaderEncoder>,
        decoder: Box<dyn HeaderDecoder>, config: &Config,
    ) -> Result<Session> {
        Ok(Session {
            transport,
            config: config.clone(),

            state: SessionState::Connecting,
            drained: false,

            encoder,
            decoder,

            connect_cb: None,
            connect_fired: false,
            info_cb: None,
            destroy_fired: false,
            push_observer: None,

            local_addr: None,
            peer_addr: None,

            control_stream_id: None,
            peer_control_stream_id: None,
            qpack_encoder_stream_id: None,
            qpack_decoder_stream_id: None,
            peer_qpack_encoder_stream_id: None,
            peer_qpack_decoder_stream_id: None,

            sent_settings: false,
            local_settings: ConnectionSettings {
                max_field_section_size: config.max_field_section_size,
                qpack_max_table_capacity: config.qpack_max_table_capacity,
                qpack_blocked_streams: config.qpack_blocked_streams,
                raw: Default::default(),
            },
            peer_settings: None,

            local_goaway_id: None,
            peer_goaway_id: None,

            transactions: Default::default(),
            uni_streams: Default::default(),
            unadopted_push_streams: BTreeMap::new(),
            push: PushCoordinator::default(),

            next_request_stream_id: 0,
            max_seen_peer_stream_id: 0,

            blocked_streams: Vec::new(),
            blocked_promises: Vec::new(),

            replay_callbacks: SmallVec::new(),

            delivery_order: VecDeque::new(),
            scheduled: BTreeSet::new(),
            pumping: false,

            drain_goaway_deadline: None,

            now: Instant::now(),
        })
    }

    pub fn set_connect_callback(
        &mut self, cb: Rc<RefCell<dyn ConnectCallback>>,
    ) {
        self.connect_cb = Some(cb);
    }

    pub fn set_info_callback(&mut self, cb: Rc<RefCell<dyn InfoCallback>>) {
        self.info_cb = Some(cb);
    }

    pub fn set_push_lifecycle_observer(
        &mut self, cb: Rc<RefCell<dyn PushLifecycleObserver>>,
    ) {
        self.push_observer = Some(cb);
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    /// The local address, as observed when the transport became ready.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr.unwrap_or_else(|| self.transport.local_addr())
    }

    /// The peer address, as observed when the transport became ready.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr.unwrap_or_else(|| self.transport.peer_addr())
    }

    pub fn app_protocol(&self) -> Vec<u8> {
        self.transport.app_protocol()
    }

    pub fn peer_settings(&self) -> Option<&ConnectionSettings> {
        self.peer_settings.as_ref()
    }

    pub fn peer_goaway_id(&self) -> Option<u64> {
        self.peer_goaway_id
    }

    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }

    /// The transport became ready: snapshot addresses, open the control
    /// and QPACK streams, emit SETTINGS and notify the connect callback.
    pub fn on_transport_ready(&mut self) {
        if self.state != SessionState::Connecting {
            return;
        }

        self.local_addr = Some(self.transport.local_addr());
        self.peer_addr = Some(self.transport.peer_addr());

        self.state = SessionState::Open;

        if let Err(e) = self.open_local_streams() {
            error!("opening control streams failed: {e:?}");

            let err = StreamError::new(
                ErrorKind::ConnectionError,
                format!("opening control streams failed: {e:?}"),
            );
            self.fire_connect_error(err);
            self.destroy();

            return;
        }

        if self.config.send_settings {
            self.send_settings();
        }

        self.fire_connect_success();
    }

    /// The transport left the 0-RTT replay window: fire queued replay
    /// safety callbacks in registration order.
    pub fn on_replay_safe(&mut self) {
        let cbs = std::mem::take(&mut self.replay_callbacks);

        for cb in cbs {
            cb.borrow_mut().on_replay_safe();
        }

        if let Some(cb) = self.connect_cb.clone() {
            cb.borrow_mut().on_replay_safe(self);
        }
    }

    /// Queues a callback for when the transport becomes replay safe.
    ///
    /// If the transport already is, the callback fires before this method
    /// returns.
    pub fn add_waiting_for_replay_safety(
        &mut self, cb: Rc<RefCell<dyn ReplaySafetyCallback>>,
    ) {
        if self.transport.replay_safe() {
            cb.borrow_mut().on_replay_safe();

            return;
        }

        self.replay_callbacks.push(cb);
    }

    /// Removes a queued replay safety callback by identity.
    pub fn remove_waiting_for_replay_safety(
        &mut self, cb: &Rc<RefCell<dyn ReplaySafetyCallback>>,
    ) {
        self.replay_callbacks.retain(|c| !Rc::ptr_eq(c, cb));
    }

    /// Opens a new transaction.
    ///
    /// Returns the allocated request stream ID, or `None` when the socket
    /// is not usable or the session is draining or closed.
    pub fn new_transaction(
        &mut self, handler: Rc<RefCell<dyn TransactionHandler>>,
    ) -> Option<u64> {
        if self.state != SessionState::Open || !self.transport.good() {
            return None;
        }

        let stream_id = self.next_request_stream_id;
        self.next_request_stream_id =
            self.next_request_stream_id.checked_add(4)?;

        let wire = Stream::new(stream_id, true);
        let deadline = self.now + self.config.transaction_timeout;
        let txn =
            Transaction::new(stream_id, Some(handler), wire, Some(deadline));

        self.transactions.insert(stream_id, txn);

        trace!("new transaction on stream {stream_id}");

        Some(stream_id)
    }

    /// Emits the SETTINGS frame on the egress control stream.
    ///
    /// Normally driven by [`on_transport_ready()`](Session::on_transport_ready);
    /// calling it twice is a programming error.
    pub fn send_settings(&mut self) {
        assert!(!self.sent_settings, "settings already sent");

        self.sent_settings = true;

        let frame = frame::Frame::Settings {
            max_field_section_size: self.local_settings.max_field_section_size,
            qpack_max_table_capacity: self
                .local_settings
                .qpack_max_table_capacity,
            qpack_blocked_streams: self.local_settings.qpack_blocked_streams,
            raw: Default::default(),
        };

        if let Some(id) = self.control_stream_id {
            let mut d = [42; 128];
            let mut b = octets::OctetsMut::with_slice(&mut d);

            if frame.to_bytes(&mut b).is_ok() {
                let off = b.off();
                let _ = self.transport.stream_send(id, &d[..off], false);

                trace!("tx frm SETTINGS stream={id} len={off}");
            }
        }
    }

    /// Sends request headers on a transaction's stream.
    pub fn send_headers(
        &mut self, stream_id: u64, headers: &[Header], fin: bool,
    ) -> Result<()> {
        let header_block = self.encoder.encode(headers)?;
        self.flush_encoder_stream();

        let txn = self
            .transactions
            .get_mut(&stream_id)
            .ok_or(Error::FrameUnexpected)?;

        if txn.egress != TxnState::Idle {
            return Err(Error::FrameUnexpected);
        }

        let mut d = [42; 10];
        let mut b = octets::OctetsMut::with_slice(&mut d);

        b.put_varint(frame::HEADERS_FRAME_TYPE_ID)?;
        b.put_varint(header_block.len() as u64)?;
        let off = b.off();

        let partially_reliable = txn.partially_reliable;

        if let Err(e) = self
            .transport
            .stream_send(stream_id, &d[..off], false)
            .and_then(|_| self.transport.stream_send(stream_id, &header_block, fin))
        {
            self.handle_write_error(stream_id, e);

            return Err(Error::TransportError);
        }

        trace!(
            "tx frm HEADERS stream={} len={} fin={}",
            stream_id,
            header_block.len(),
            fin
        );

        let txn = match self.transactions.get_mut(&stream_id) {
            Some(v) => v,
            None => return Err(Error::FrameUnexpected),
        };

        txn.headers_sent = true;
        txn.egress_offset += (off + header_block.len()) as u64;
        txn.egress = if fin {
            txn.eom_sent = true;

            TxnState::EomSeen
        } else {
            TxnState::ExpectBody
        };

        if partially_reliable {
            let offset = txn.egress_offset;

            match self.transport.register_delivery_callback(stream_id, offset)
            {
                Ok(()) => {
                    if let Some(txn) = self.transactions.get_mut(&stream_id) {
                        txn.pending_byte_events += 1;
                    }
                },

                Err(_) => {
                    self.stream_error(
                        stream_id,
                        StreamError::new(
                            ErrorKind::Write,
                            format!(
                                "failed to register delivery callback on stream {stream_id}"
                            ),
                        ),
                    );
                },
            }
        }

        self.maybe_queue_detach(stream_id);
        self.pump();

        Ok(())
    }

    /// Sends a chunk of request body.
    pub fn send_body(
        &mut self, stream_id: u64, body: &[u8], fin: bool,
    ) -> Result<usize> {
        let txn = self
            .transactions
            .get_mut(&stream_id)
            .ok_or(Error::FrameUnexpected)?;

        if txn.egress != TxnState::ExpectBody || !txn.headers_sent {
            return Err(Error::FrameUnexpected);
        }

        // Avoid sending 0-length DATA frames when the fin flag is false.
        if body.is_empty() && !fin {
            return Err(Error::Done);
        }

        let mut d = [42; 10];
        let mut b = octets::OctetsMut::with_slice(&mut d);

        b.put_varint(frame::DATA_FRAME_TYPE_ID)?;
        b.put_varint(body.len() as u64)?;
        let off = b.off();

        if let Err(e) = self
            .transport
            .stream_send(stream_id, &d[..off], false)
            .and_then(|_| self.transport.stream_send(stream_id, body, fin))
        {
            self.handle_write_error(stream_id, e);

            return Err(Error::TransportError);
        }

        trace!("tx frm DATA stream={} len={} fin={}", stream_id, body.len(), fin);

        if let Some(txn) = self.transactions.get_mut(&stream_id) {
            txn.egress_offset += (off + body.len()) as u64;

            if fin {
                txn.eom_sent = true;
                txn.egress = TxnState::EomSeen;
            }
        }

        self.maybe_queue_detach(stream_id);
        self.pump();

        Ok(body.len())
    }

    /// Sends trailing headers, leaving the stream open for the final EOM.
    pub fn send_trailers(
        &mut self, stream_id: u64, trailers: &[Header],
    ) -> Result<()> {
        let header_block = self.encoder.encode(trailers)?;
        self.flush_encoder_stream();

        let txn = self
            .transactions
            .get_mut(&stream_id)
            .ok_or(Error::FrameUnexpected)?;

        if txn.egress != TxnState::ExpectBody {
            return Err(Error::FrameUnexpected);
        }

        txn.egress = TxnState::ExpectTrailers;

        let mut d = [42; 10];
        let mut b = octets::OctetsMut::with_slice(&mut d);

        b.put_varint(frame::HEADERS_FRAME_TYPE_ID)?;
        b.put_varint(header_block.len() as u64)?;
        let off = b.off();

        if let Err(e) = self
            .transport
            .stream_send(stream_id, &d[..off], false)
            .and_then(|_| self.transport.stream_send(stream_id, &header_block, false))
        {
            self.handle_write_error(stream_id, e);

            return Err(Error::TransportError);
        }

        if let Some(txn) = self.transactions.get_mut(&stream_id) {
            txn.egress_offset += (off + header_block.len()) as u64;
        }

        Ok(())
    }

    /// Finishes the egress side of a transaction.
    pub fn send_eom(&mut self, stream_id: u64) -> Result<()> {
        let txn = self
            .transactions
            .get_mut(&stream_id)
            .ok_or(Error::FrameUnexpected)?;

        if !txn.headers_sent || txn.egress.is_terminal() {
            return Err(Error::FrameUnexpected);
        }

        if let Err(e) = self.transport.stream_send(stream_id, b"", true) {
            self.handle_write_error(stream_id, e);

            return Err(Error::TransportError);
        }

        if let Some(txn) = self.transactions.get_mut(&stream_id) {
            txn.eom_sent = true;
            txn.egress = TxnState::EomSeen;
        }

        self.maybe_queue_detach(stream_id);
        self.pump();

        Ok(())
    }

    /// Aborts a transaction.
    ///
    /// Idempotent: aborting an unknown or already-aborted transaction is a
    /// no-op. The stream is reset with `HTTP_REQUEST_CANCELLED`, queued
    /// deliveries are dropped and the handler sees only
    /// `detach_transaction()`.
    pub fn send_abort(&mut self, stream_id: u64) {
        let txn = match self.transactions.get_mut(&stream_id) {
            Some(v) => v,
            None => return,
        };

        if txn.ingress == TxnState::Aborted && txn.egress == TxnState::Aborted {
            return;
        }

        txn.ingress = TxnState::Aborted;
        txn.egress = TxnState::Aborted;
        txn.read_deadline = None;
        txn.pending.clear();

        let is_push = txn.is_push();

        if let Some(p) = txn.push {
            debug!(
                "aborting pushed transaction push_id={} assoc={}",
                p.push_id, p.assoc_stream_id
            );
        }

        self.cancel_byte_events(stream_id);

        if !is_push {
            self.send_reset(stream_id, transport::HTTP_REQUEST_CANCELLED);
        } else {
            let _ = self
                .transport
                .stop_sending(stream_id, transport::HTTP_REQUEST_CANCELLED);
        }

        self.cancel_blocked(stream_id);

        self.maybe_queue_detach(stream_id);
        self.pump();
    }

    /// Switches a transaction to partially-reliable body handling.
    ///
    /// Must be called before the request headers are sent.
    pub fn enable_partial_reliability(&mut self, stream_id: u64) -> Result<()> {
        let txn = self
            .transactions
            .get_mut(&stream_id)
            .ok_or(Error::FrameUnexpected)?;

        if txn.headers_sent {
            return Err(Error::InvalidState);
        }

        txn.partially_reliable = true;

        Ok(())
    }

    /// Rejects response body up to `new_body_offset`, advancing the
    /// transport read offset and informing the peer.
    pub fn reject_body_to(
        &mut self, stream_id: u64, new_body_offset: u64,
    ) -> Result<u64> {
        let txn = self
            .transactions
            .get_mut(&stream_id)
            .ok_or(Error::FrameUnexpected)?;

        if !txn.partially_reliable {
            return Err(Error::InvalidState);
        }

        let base = match txn.wire.pr_body_base() {
            Some(v) => v,
            None => return Err(Error::InvalidState),
        };

        let new_wire_off = base + new_body_offset;

        if self
            .transport
            .reject_data(stream_id, new_wire_off)
            .is_err()
        {
            return Err(Error::InvalidOperation);
        }

        let txn = match self.transactions.get_mut(&stream_id) {
            Some(v) => v,
            None => return Err(Error::FrameUnexpected),
        };

        match txn.wire.advance_to(new_wire_off) {
            Ok(off) => Ok(off),

            // Not advancing is the caller's bug, not the peer's.
            Err(Error::Done) => Err(Error::InvalidState),

            Err(e) => Err(e),
        }
    }

    /// Defers ingress deliveries for a transaction.
    pub fn pause_ingress(&mut self, stream_id: u64) {
        if let Some(txn) = self.transactions.get_mut(&stream_id) {
            txn.ingress_paused = true;
        }
    }

    /// Resumes ingress deliveries for a transaction.
    pub fn resume_ingress(&mut self, stream_id: u64) {
        if let Some(txn) = self.transactions.get_mut(&stream_id) {
            txn.ingress_paused = false;
        }

        self.schedule_delivery(stream_id);
        self.pump();
    }

    /// Attaches a handler for a promised pushed transaction.
    pub fn set_push_handler(
        &mut self, push_id: PushId, handler: Rc<RefCell<dyn TransactionHandler>>,
    ) -> Result<()> {
        let promise =
            self.push.promise_mut(push_id).ok_or(Error::IdError)?;

        match promise.bound_stream_id {
            Some(stream_id) => {
                if let Some(txn) = self.transactions.get_mut(&stream_id) {
                    txn.handler = Some(handler);
                }

                self.schedule_delivery(stream_id);
                self.pump();
            },

            None => promise.handler = Some(handler),
        }

        Ok(())
    }

    /// Starts draining: no new transactions, and the connection closes
    /// once the last one detaches.
    pub fn close_when_idle(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }

        self.drained = true;

        if self.transactions.is_empty() {
            self.close_now(transport::HTTP_NO_ERROR, b"idle close");

            return;
        }

        if self.state == SessionState::Open {
            self.state = SessionState::Draining;
        }

        // Drain announcement: an unbounded GOAWAY now, the precise one
        // after a short delay.
        self.send_goaway(MAX_GOAWAY_ID);
        self.drain_goaway_deadline =
            Some(self.now + self.config.drain_goaway_delay);
    }

    /// Synchronously tears the session down.
    ///
    /// Every live transaction fails with [`ErrorKind::Shutdown`] and the
    /// info callback's `on_destroy()` fires before this method returns.
    pub fn drop_connection(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }

        debug!("dropping connection");

        self.teardown(StreamError::new(
            ErrorKind::Shutdown,
            "connection dropped".to_string(),
        ));

        self.close_now(transport::HTTP_NO_ERROR, b"dropped");
    }

    /// The earliest internal deadline, if any timer is armed.
    pub fn timeout(&self) -> Option<Instant> {
        let blocked = self
            .blocked_streams
            .iter()
            .map(|e| e.deadline)
            .min();

        let blocked_promises = self
            .blocked_promises
            .iter()
            .map(|e| e.deadline)
            .min();

        let txns = self
            .transactions
            .values()
            .filter_map(|t| t.read_deadline)
            .min();

        let push = self.push.next_deadline();

        [
            blocked,
            blocked_promises,
            txns,
            push,
            self.drain_goaway_deadline,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Fires every timer whose deadline passed.
    pub fn on_timeout(&mut self, now: Instant) {
        if self.state == SessionState::Closed {
            return;
        }

        self.now = now;

        // QPACK gate timeouts.
        let expired: Vec<u64> = self
            .blocked_streams
            .iter()
            .filter(|e| e.deadline <= now)
            .map(|e| e.stream_id)
            .collect();

        for stream_id in expired {
            warn!("qpack blocked timeout on stream {stream_id}");

            self.stream_error(
                stream_id,
                StreamError::new(
                    ErrorKind::HeaderDecode,
                    format!("qpack decode timeout on stream {stream_id}"),
                ),
            );
        }

        // Transaction idle timeouts.
        let idle: Vec<u64> = self
            .transactions
            .iter()
            .filter(|(_, t)| {
                t.read_deadline.map(|d| d <= now).unwrap_or(false)
            })
            .map(|(id, _)| *id)
            .collect();

        for stream_id in idle {
            self.stream_error(
                stream_id,
                StreamError::new(
                    ErrorKind::Timeout,
                    format!("ingress timeout on stream {stream_id}"),
                ),
            );
        }

        // Promise blocks that never unblocked are dropped; the associated
        // transaction's own timeout covers the fallout.
        for entry in &self.blocked_promises {
            if entry.deadline <= now {
                warn!(
                    "qpack blocked timeout on push promise {}",
                    entry.push_id
                );
            }
        }

        self.blocked_promises.retain(|e| e.deadline > now);

        // Half-open pushed transactions whose stream never came.
        for push_id in self.push.expired_half_open(now) {
            debug!("pushed transaction {push_id} timed out half-open");

            self.push.remove(push_id);

            if let Some(obs) = self.push_observer.clone() {
                obs.borrow_mut().pushed_txn_timeout(push_id);
            }
        }

        // Second drain GOAWAY.
        if let Some(deadline) = self.drain_goaway_deadline {
            if deadline <= now {
                self.drain_goaway_deadline = None;

                let id = self.max_seen_peer_stream_id;
                self.send_goaway(id);
            }
        }

        self.pump();
    }

    /// Feeds stream bytes received from the transport.
    pub fn on_read(
        &mut self, now: Instant, stream_id: u64, data: &[u8], fin: bool,
    ) {
        if self.state == SessionState::Closed {
            return;
        }

        self.now = now;

        if stream::is_server_initiated(stream_id) {
            self.max_seen_peer_stream_id =
                self.max_seen_peer_stream_id.max(stream_id);
        }

        let res = if self.transactions.contains_key(&stream_id) {
            self.read_transaction_stream(stream_id, data, fin)
        } else if stream::is_bidi(stream_id) {
            // Data for a request stream with no live transaction: either it
            // detached earlier in this loop, or it never existed. Drop it.
            trace!("dropping {} bytes for dead stream {stream_id}", data.len());

            Ok(())
        } else {
            self.read_uni_stream(stream_id, data, fin)
        };

        if let Err(e) = res {
            self.connection_protocol_error(e);

            return;
        }

        self.pump();
    }

    /// The peer reset one of our streams.
    pub fn on_stream_reset(&mut self, stream_id: u64, error_code: u64) {
        debug!("stream {stream_id} reset by peer, code={error_code:#x}");

        if self.transactions.contains_key(&stream_id) {
            self.stream_error(
                stream_id,
                StreamError::stream_unacknowledged(stream_id),
            );
            self.pump();
        }
    }

    /// The peer asked us to stop sending on a stream.
    pub fn on_stop_sending(&mut self, stream_id: u64, error_code: u64) {
        debug!("stop sending on stream {stream_id}, code={error_code:#x}");

        let txn = match self.transactions.get_mut(&stream_id) {
            Some(v) => v,
            None => return,
        };

        txn.egress = TxnState::Aborted;

        self.send_reset(stream_id, transport::HTTP_REQUEST_CANCELLED);
        self.cancel_byte_events(stream_id);

        self.stream_error(
            stream_id,
            StreamError::stream_unacknowledged(stream_id),
        );
        self.pump();
    }

    /// The transport failed at the connection level.
    pub fn on_connection_error(&mut self, error: ConnectionError) {
        if self.state == SessionState::Closed {
            return;
        }

        let kind = match error.code {
            TransportErrorCode::GiveupZeroRtt => ErrorKind::EarlyDataFailed,
            _ => ErrorKind::ConnectionError,
        };

        let err = StreamError::new(kind, error.reason.clone());

        error!("connection error: {}", error.reason);

        self.fire_connect_error(err.clone());
        self.teardown(err);
        self.destroy();
    }

    /// The transport reported the end of the connection.
    pub fn on_connection_end(&mut self) {
        self.on_connection_error(ConnectionError::new(
            TransportErrorCode::ConnectionReset,
            "connection ended",
        ));
    }

    /// A delivery callback registered on `stream_id` fired.
    pub fn on_delivery_ack(&mut self, stream_id: u64, offset: u64) {
        trace!("delivery ack stream={stream_id} offset={offset}");

        if let Some(txn) = self.transactions.get_mut(&stream_id) {
            txn.pending_byte_events = txn.pending_byte_events.saturating_sub(1);
        }

        self.maybe_queue_detach(stream_id);
        self.pump();
    }

    /// A delivery callback registered on `stream_id` was cancelled.
    pub fn on_delivery_cancel(&mut self, stream_id: u64) {
        if let Some(txn) = self.transactions.get_mut(&stream_id) {
            txn.pending_byte_events = txn.pending_byte_events.saturating_sub(1);
        }

        self.maybe_queue_detach(stream_id);
        self.pump();
    }

    /// The peer declared stream data up to `new_offset` as expired
    /// (partial reliability skip).
    pub fn on_data_expired(
        &mut self, now: Instant, stream_id: u64, new_offset: u64,
    ) {
        self.now = now;

        let txn = match self.transactions.get_mut(&stream_id) {
            Some(v) => v,
            None => return,
        };

        if !txn.partially_reliable {
            warn!("data expired on non-PR stream {stream_id}, ignoring");

            return;
        }

        match txn.wire.skip_ahead(new_offset) {
            Ok(new_body_offset) => {
                txn.queue(Pending::BodySkipped {
                    new_offset: new_body_offset,
                });
                self.schedule_delivery(stream_id);
                self.pump();
            },

            // A stale or out-of-range offset from a corrupt peer is a soft
            // error: log it and keep the exchange alive.
            Err(Error::Done) => {
                warn!(
                    "ignoring bogus expired offset {new_offset} on stream {stream_id}"
                );
            },

            Err(e) => {
                warn!("data expired on stream {stream_id} failed: {e:?}");
            },
        }
    }

    fn open_local_streams(&mut self) -> Result<()> {
        let control = self.open_uni_stream(stream::HTTP3_CONTROL_STREAM_TYPE_ID)?;
        self.control_stream_id = Some(control);

        let enc = self.open_uni_stream(stream::QPACK_ENCODER_STREAM_TYPE_ID)?;
        self.qpack_encoder_stream_id = Some(enc);

        let dec = self.open_uni_stream(stream::QPACK_DECODER_STREAM_TYPE_ID)?;
        self.qpack_decoder_stream_id = Some(dec);

        Ok(())
    }

    fn open_uni_stream(&mut self, ty: u64) -> Result<u64> {
        let stream_id = self
            .transport
            .open_uni_stream()
            .map_err(|_| Error::TransportError)?;

        let mut d = [0; 8];
        let mut b = octets::OctetsMut::with_slice(&mut d);
        b.put_varint(ty)?;
        let off = b.off();

        self.transport
            .stream_send(stream_id, &d[..off], false)
            .map_err(|_| Error::TransportError)?;

        Ok(stream_id)
    }

    fn send_goaway(&mut self, id: u64) {
        // GOAWAY may not increase.
        if let Some(sent) = self.local_goaway_id {
            if id > sent {
                return;
            }
        }

        if let Some(stream_id) = self.control_stream_id {
            let mut d = [42; 10];
            let mut b = octets::OctetsMut::with_slice(&mut d);

            let frame = frame::Frame::GoAway { id };

            if frame.to_bytes(&mut b).is_ok() {
                let off = b.off();
                let _ = self.transport.stream_send(stream_id, &d[..off], false);

                trace!("tx frm {frame:?}");

                self.local_goaway_id = Some(id);
            }
        }
    }

    fn read_transaction_stream(
        &mut self, stream_id: u64, data: &[u8], fin: bool,
    ) -> Result<()> {
        {
            let txn = match self.transactions.get_mut(&stream_id) {
                Some(v) => v,
                None => return Ok(()),
            };

            txn.wire.push_data(data, fin)?;

            if !txn.ingress.is_terminal() {
                txn.read_deadline =
                    Some(self.now + self.config.transaction_timeout);
            }
        }

        self.process_transaction_stream(stream_id)
    }

    fn process_transaction_stream(&mut self, stream_id: u64) -> Result<()> {
        loop {
            let txn = match self.transactions.get_mut(&stream_id) {
                Some(v) => v,
                None => return Ok(()),
            };

            // A partially reliable exchange cannot be parsed past a gated
            // header block: whether the bytes that follow are framed
            // depends on what the block decodes to.
            if txn.partially_reliable && txn.is_blocked() {
                break;
            }

            match txn.wire.state() {
                stream::State::FrameType => {
                    if txn.wire.try_fill_buffer() == Err(Error::Done) {
                        break;
                    }

                    let varint = match txn.wire.try_consume_varint() {
                        Ok(v) => v,
                        Err(Error::Done) => break,
                        Err(e) => return Err(e),
                    };

                    txn.wire.set_frame_type(varint)?;
                },

                stream::State::FramePayloadLen => {
                    if txn.wire.try_fill_buffer() == Err(Error::Done) {
                        break;
                    }

                    let varint = match txn.wire.try_consume_varint() {
                        Ok(v) => v,
                        Err(Error::Done) => break,
                        Err(e) => return Err(e),
                    };

                    txn.wire.set_frame_payload_len(varint)?;
                },

                stream::State::FramePayload => {
                    if txn.wire.try_fill_buffer() == Err(Error::Done) {
                        break;
                    }

                    let (frame, _len) = match txn.wire.try_consume_frame() {
                        Ok(v) => v,
                        Err(Error::Done) => break,
                        Err(e) => return Err(e),
                    };

                    self.process_transaction_frame(stream_id, frame)?;
                },

                stream::State::Data => {
                    let mut chunk = vec![0; 4096];

                    let len = match txn.wire.try_consume_data(&mut chunk) {
                        Ok(v) => v,
                        Err(Error::Done) => break,
                        Err(e) => return Err(e),
                    };

                    chunk.truncate(len);

                    txn.body_offset += len as u64;

                    trace!(
                        "rx body stream={} len={} offset={}",
                        stream_id,
                        len,
                        txn.body_offset
                    );

                    txn.queue(Pending::Body { data: chunk });
                    self.schedule_delivery(stream_id);
                },

                stream::State::PrBody => {
                    let mut chunk = vec![0; 4096];

                    let offset = txn.wire.pr_body_offset();

                    let len = match txn.wire.try_consume_pr_body(&mut chunk) {
                        Ok(v) => v,
                        Err(Error::Done) => break,
                        Err(e) => return Err(e),
                    };

                    chunk.truncate(len);

                    txn.body_offset = offset + len as u64;
                    txn.queue(Pending::BodyWithOffset {
                        offset,
                        data: chunk,
                    });
                    self.schedule_delivery(stream_id);
                },

                stream::State::Finished => break,

                _ => return Err(Error::InternalError),
            }
        }

        // End of stream closes ingress once everything is consumed.
        let txn = match self.transactions.get_mut(&stream_id) {
            Some(v) => v,
            None => return Ok(()),
        };

        if txn.wire.is_drained() &&
            txn.wire.state() != stream::State::Finished &&
            !txn.ingress.is_terminal()
        {
            txn.wire.finished();
            txn.read_deadline = None;
            txn.queue(Pending::Eom);
            self.schedule_delivery(stream_id);
        }

        Ok(())
    }

    fn process_transaction_frame(
        &mut self, stream_id: u64, frame: frame::Frame,
    ) -> Result<()> {
        match frame {
            frame::Frame::Headers { header_block } => {
                trace!(
                    "rx frm HEADERS stream={} len={}",
                    stream_id,
                    header_block.len()
                );

                self.process_header_block(stream_id, header_block)?;
            },

            frame::Frame::PushPromise {
                push_id,
                header_block,
            } => {
                trace!("rx frm PUSH_PROMISE stream={stream_id} push_id={push_id}");

                self.process_push_promise(
                    stream_id,
                    PushId::new(push_id),
                    header_block,
                )?;
            },

            frame::Frame::Unknown { raw_type, .. } => {
                trace!("rx frm UNKNOWN type={raw_type} stream={stream_id}");
            },

            f => {
                trace!("ignoring frame {f:?} on stream {stream_id}");
            },
        }

        Ok(())
    }

    fn process_header_block(
        &mut self, stream_id: u64, header_block: Vec<u8>,
    ) -> Result<()> {
        let decoded = self.decoder.decode(stream_id, &header_block)?;

        match decoded {
            Decoded::Fields { fields, ack } => {
                if ack {
                    let bytes = self.decoder.ack_section(stream_id);
                    self.write_decoder_stream(&bytes);
                }

                let txn = match self.transactions.get_mut(&stream_id) {
                    Some(v) => v,
                    None => return Ok(()),
                };

                if txn.final_headers_received {
                    txn.queue(Pending::Trailers { fields });
                } else {
                    let interim = is_interim_response(&fields);

                    if !interim {
                        txn.final_headers_received = true;

                        if txn.partially_reliable {
                            txn.wire.enter_pr_body()?;
                        }
                    }

                    txn.queue(Pending::Headers { fields, interim });
                }

                self.schedule_delivery(stream_id);
            },

            Decoded::Blocked {
                required_insert_count,
            } => {
                trace!(
                    "stream {stream_id} blocked on insert count {required_insert_count}"
                );

                let deadline = self.now + self.config.qpack_blocked_timeout;

                let txn = match self.transactions.get_mut(&stream_id) {
                    Some(v) => v,
                    None => return Ok(()),
                };

                let trailer = txn.final_headers_received;

                txn.queue(Pending::BlockedHeaders {
                    block: header_block,
                    required_insert_count,
                    trailer,
                });

                self.blocked_streams.push(BlockedEntry {
                    stream_id,
                    required_insert_count,
                    deadline,
                });
            },
        }

        Ok(())
    }

    fn process_push_promise(
        &mut self, stream_id: u64, push_id: PushId, header_block: Vec<u8>,
    ) -> Result<()> {
        if let Some(obs) = self.push_observer.clone() {
            obs.borrow_mut().push_promise_begin(stream_id, push_id);
        }

        match self.decoder.decode(stream_id, &header_block)? {
            Decoded::Fields { fields, ack } => {
                if ack {
                    let bytes = self.decoder.ack_section(stream_id);
                    self.write_decoder_stream(&bytes);
                }

                self.register_push_promise(stream_id, push_id, fields)?;
            },

            // A promise block is a header block like any other: gate it
            // until the encoder stream catches up.
            Decoded::Blocked {
                required_insert_count,
            } => {
                trace!(
                    "push promise {push_id} blocked on insert count {required_insert_count}"
                );

                self.blocked_promises.push(BlockedPromise {
                    push_id,
                    assoc_stream_id: stream_id,
                    block: header_block,
                    required_insert_count,
                    deadline: self.now + self.config.qpack_blocked_timeout,
                });
            },
        }

        Ok(())
    }

    /// Registers a fully decoded PUSH_PROMISE: correlation table entry,
    /// observer notifications, parent delivery, and adoption of a push
    /// stream that may have arrived first.
    fn register_push_promise(
        &mut self, assoc_stream_id: u64, push_id: PushId, fields: Vec<Header>,
    ) -> Result<()> {
        let deadline = self.now + self.config.transaction_timeout;

        self.push
            .on_promise(push_id, assoc_stream_id, fields.clone(), deadline)?;

        if let Some(obs) = self.push_observer.clone() {
            obs.borrow_mut().push_promise(assoc_stream_id, push_id, &fields);
        }

        // Surface the promise on the parent, half-open or not.
        if let Some(txn) = self.transactions.get_mut(&assoc_stream_id) {
            txn.queue(Pending::PushedTransaction { push_id });
            self.schedule_delivery(assoc_stream_id);
        }

        // The push stream may have arrived first.
        if let Some(push_stream_id) =
            self.unadopted_push_streams.remove(&push_id)
        {
            self.push.bind_stream(push_id, push_stream_id)?;
            self.materialize_pushed_txn(
                push_stream_id,
                push_id,
                assoc_stream_id,
            )?;
        } else if let Some(obs) = self.push_observer.clone() {
            obs.borrow_mut().half_open_pushed_txn(push_id, assoc_stream_id);
        }

        Ok(())
    }

    fn read_uni_stream(
        &mut self, stream_id: u64, data: &[u8], fin: bool,
    ) -> Result<()> {
        let stream = self
            .uni_streams
            .entry(stream_id)
            .or_insert_with(|| Stream::new(stream_id, false));

        stream.push_data(data, fin)?;

        self.process_uni_stream(stream_id)
    }

    fn process_uni_stream(&mut self, stream_id: u64) -> Result<()> {
        loop {
            let stream = match self.uni_streams.get_mut(&stream_id) {
                Some(v) => v,
                None => return Ok(()),
            };

            match stream.state() {
                stream::State::StreamType => {
                    if stream.try_fill_buffer() == Err(Error::Done) {
                        break;
                    }

                    let varint = match stream.try_consume_varint() {
                        Ok(v) => v,
                        Err(Error::Done) => break,
                        Err(e) => return Err(e),
                    };

                    let ty = stream::Type::deserialize(varint);

                    stream.set_ty(ty)?;

                    match ty {
                        stream::Type::Control => {
                            // Only one control stream allowed.
                            if self.peer_control_stream_id.is_some() {
                                return Err(Error::StreamCreationError);
                            }

                            trace!("open peer control stream {stream_id}");

                            self.peer_control_stream_id = Some(stream_id);
                        },

                        stream::Type::QpackEncoder => {
                            if self.peer_qpack_encoder_stream_id.is_some() {
                                return Err(Error::StreamCreationError);
                            }

                            self.peer_qpack_encoder_stream_id =
                                Some(stream_id);
                        },

                        stream::Type::QpackDecoder => {
                            if self.peer_qpack_decoder_stream_id.is_some() {
                                return Err(Error::StreamCreationError);
                            }

                            self.peer_qpack_decoder_stream_id =
                                Some(stream_id);
                        },

                        stream::Type::Push => {
                            let is_eof = stream.fin_received();

                            if let Some(obs) = self.push_observer.clone() {
                                obs.borrow_mut()
                                    .nascent_push_stream_begin(stream_id, is_eof);
                            }
                        },

                        stream::Type::Unknown => {
                            // Unknown stream types are a stream-local
                            // problem, not a connection error.
                            debug!(
                                "unknown stream type {varint} on stream {stream_id}"
                            );

                            let _ = self.transport.stop_sending(
                                stream_id,
                                transport::HTTP_STREAM_CREATION_ERROR,
                            );
                        },

                        stream::Type::Request => unreachable!(),
                    }
                },

                stream::State::PushId => {
                    if stream.try_fill_buffer() == Err(Error::Done) {
                        break;
                    }

                    let varint = match stream.try_consume_varint() {
                        Ok(v) => v,
                        Err(Error::Done) => break,
                        Err(e) => return Err(e),
                    };

                    stream.set_push_id(varint)?;

                    let push_id = PushId::new(varint);
                    let is_eof = stream.fin_received();

                    trace!("nascent push stream {stream_id} push_id={push_id}");

                    if let Some(obs) = self.push_observer.clone() {
                        obs.borrow_mut()
                            .nascent_push_stream(stream_id, push_id, is_eof);
                    }

                    match self.push.bind_stream(push_id, stream_id)? {
                        Some(assoc_stream_id) => {
                            self.materialize_pushed_txn(
                                stream_id,
                                push_id,
                                assoc_stream_id,
                            )?;

                            return Ok(());
                        },

                        None => {
                            // No promise yet; hold the stream nascent.
                            self.unadopted_push_streams
                                .insert(push_id, stream_id);

                            break;
                        },
                    }
                },

                stream::State::FrameType |
                stream::State::FramePayloadLen |
                stream::State::FramePayload => {
                    match stream.ty() {
                        Some(stream::Type::Control) => {
                            if !self.process_control_frame_step(stream_id)? {
                                break;
                            }
                        },

                        // An unadopted push stream buffers its frames until
                        // the promise adopts it.
                        Some(stream::Type::Push) => break,

                        _ => return Err(Error::InternalError),
                    }
                },

                stream::State::QpackInstruction => {
                    let data = stream.drain_pending();

                    if data.is_empty() {
                        break;
                    }

                    match stream.ty() {
                        Some(stream::Type::QpackEncoder) => {
                            self.decoder
                                .on_encoder_stream(&data)
                                .map_err(|_| Error::QpackDecompressionFailed)?;

                            self.release_blocked_streams()?;
                        },

                        Some(stream::Type::QpackDecoder) => {
                            self.encoder
                                .on_decoder_stream(&data)
                                .map_err(|_| Error::QpackDecompressionFailed)?;
                        },

                        _ => return Err(Error::InternalError),
                    }
                },

                stream::State::Drain => {
                    stream.drain_pending();

                    break;
                },

                stream::State::Finished => break,

                _ => return Err(Error::InternalError),
            }
        }

        // A critical stream must never be closed.
        let stream = match self.uni_streams.get_mut(&stream_id) {
            Some(v) => v,
            None => return Ok(()),
        };

        if stream.is_drained() {
            match stream.ty() {
                Some(stream::Type::Control) |
                Some(stream::Type::QpackEncoder) |
                Some(stream::Type::QpackDecoder) => {
                    return Err(Error::ClosedCriticalStream);
                },

                Some(stream::Type::Push) => {
                    // A finished nascent stream stays correlatable, but the
                    // EOF is observable.
                    let push_id = stream.push_id().map(PushId::new);

                    if let Some(obs) = self.push_observer.clone() {
                        obs.borrow_mut().nascent_eof(stream_id, push_id);
                    }
                },

                _ => {
                    self.uni_streams.remove(&stream_id);
                },
            }
        }

        Ok(())
    }

    /// Parses at most one control frame step; returns false when starved.
    fn process_control_frame_step(&mut self, stream_id: u64) -> Result<bool> {
        let stream = match self.uni_streams.get_mut(&stream_id) {
            Some(v) => v,
            None => return Ok(false),
        };

        match stream.state() {
            stream::State::FrameType => {
                if stream.try_fill_buffer() == Err(Error::Done) {
                    return Ok(false);
                }

                let varint = match stream.try_consume_varint() {
                    Ok(v) => v,
                    Err(Error::Done) => return Ok(false),
                    Err(e) => return Err(e),
                };

                stream.set_frame_type(varint)?;
            },

            stream::State::FramePayloadLen => {
                if stream.try_fill_buffer() == Err(Error::Done) {
                    return Ok(false);
                }

                let varint = match stream.try_consume_varint() {
                    Ok(v) => v,
                    Err(Error::Done) => return Ok(false),
                    Err(e) => return Err(e),
                };

                stream.set_frame_payload_len(varint)?;
            },

            stream::State::FramePayload => {
                if stream.try_fill_buffer() == Err(Error::Done) {
                    return Ok(false);
                }

                let (frame, _len) = match stream.try_consume_frame() {
                    Ok(v) => v,
                    Err(Error::Done) => return Ok(false),
                    Err(e) => return Err(e),
                };

                self.process_control_frame(frame)?;
            },

            _ => return Ok(false),
        }

        Ok(true)
    }

    fn process_control_frame(&mut self, frame: frame::Frame) -> Result<()> {
        trace!("rx frm {frame:?} on control stream");

        match frame {
            frame::Frame::Settings {
                max_field_section_size,
                qpack_max_table_capacity,
                qpack_blocked_streams,
                raw,
            } => {
                self.peer_settings = Some(ConnectionSettings {
                    max_field_section_size,
                    qpack_max_table_capacity,
                    qpack_blocked_streams,
                    raw,
                });
            },

            frame::Frame::GoAway { id } => {
                self.process_peer_goaway(id)?;
            },

            frame::Frame::CancelPush { push_id } => {
                debug!("peer cancelled push {push_id}");

                self.push.remove(PushId::new(push_id));
            },

            frame::Frame::Unknown { raw_type, .. } => {
                trace!("ignoring unknown control frame type {raw_type}");
            },

            f => {
                trace!("ignoring control frame {f:?}");
            },
        }

        Ok(())
    }

    fn process_peer_goaway(&mut self, last_id: u64) -> Result<()> {
        // The wire layer guarantees SETTINGS came first on the control
        // stream, so reaching this point without peer settings is
        // impossible; the check stays as the protocol-level statement.
        if self.peer_settings.is_none() {
            return Err(Error::MissingSettings);
        }

        // GOAWAY may not increase.
        if let Some(prev) = self.peer_goaway_id {
            if last_id > prev {
                return Err(Error::IdError);
            }
        }

        info!("peer goaway last_id={last_id}");

        self.peer_goaway_id = Some(last_id);

        if self.state == SessionState::Open {
            self.state = SessionState::Draining;
        }

        let ids: Vec<u64> = {
            let mut v: Vec<u64> = self.transactions.keys().copied().collect();
            v.sort_unstable();
            v
        };

        // Deliver the GOAWAY notification before failing anything, so
        // every handler observes one notification per received frame.
        for id in &ids {
            if let Some(txn) = self.transactions.get_mut(id) {
                txn.queue(Pending::Goaway { last_id });
                self.schedule_delivery(*id);
            }
        }

        self.pump();

        // Streams above the cut-off will never be processed by the peer.
        for id in ids {
            let is_push = match self.transactions.get(&id) {
                Some(t) => t.is_push(),
                None => continue,
            };

            if !is_push && id > last_id {
                self.send_reset(id, transport::HTTP_REQUEST_CANCELLED);
                self.stream_error(id, StreamError::stream_unacknowledged(id));
            }
        }

        Ok(())
    }

    fn materialize_pushed_txn(
        &mut self, stream_id: u64, push_id: PushId, assoc_stream_id: u64,
    ) -> Result<()> {
        let wire = match self.uni_streams.remove(&stream_id) {
            Some(v) => v,
            None => return Err(Error::InternalError),
        };

        let (handler, promised_headers) = match self.push.promise_mut(push_id)
        {
            Some(p) => (p.handler.take(), p.headers.len()),
            None => (None, 0),
        };

        trace!(
            "adopting push stream {stream_id} with {promised_headers} promised headers"
        );

        let deadline = self.now + self.config.transaction_timeout;
        let mut txn =
            Transaction::new(stream_id, handler, wire, Some(deadline));

        // A pushed transaction is ingress only.
        txn.egress = TxnState::EomSeen;
        txn.push = Some(PushAttributes {
            push_id,
            assoc_stream_id,
        });

        self.transactions.insert(stream_id, txn);

        info!(
            "pushed transaction on stream {stream_id} push_id={push_id} assoc={assoc_stream_id}"
        );

        if let Some(obs) = self.push_observer.clone() {
            obs.borrow_mut()
                .pushed_txn(stream_id, push_id, assoc_stream_id);
        }

        self.process_transaction_stream(stream_id)
    }

    /// Re-attempts decoding of gate-held header blocks after the decoder
    /// advanced.
    fn release_blocked_streams(&mut self) -> Result<()> {
        let known = self.decoder.known_insert_count();

        // Gated promises resolve first: they only register state, and a
        // waiting push stream may be adopted by them.
        let mut ready_promises = Vec::new();
        let mut still_blocked = Vec::new();

        for entry in self.blocked_promises.drain(..) {
            if entry.required_insert_count <= known {
                ready_promises.push(entry);
            } else {
                still_blocked.push(entry);
            }
        }

        self.blocked_promises = still_blocked;

        for entry in ready_promises {
            self.resolve_blocked_promise(entry)?;
        }

        let ready: Vec<u64> = self
            .blocked_streams
            .iter()
            .filter(|e| e.required_insert_count <= known)
            .map(|e| e.stream_id)
            .collect();

        self.blocked_streams
            .retain(|e| e.required_insert_count > known);

        for stream_id in ready {
            self.resolve_blocked(stream_id, known)?;
        }

        Ok(())
    }

    fn resolve_blocked_promise(&mut self, entry: BlockedPromise) -> Result<()> {
        let decoded = match self
            .decoder
            .decode(entry.assoc_stream_id, &entry.block)
        {
            Ok(v) => v,

            Err(e) => {
                // The promise is lost; the associated transaction's own
                // timeout covers the fallout.
                warn!(
                    "decoding gated push promise {} failed: {e:?}",
                    entry.push_id
                );

                return Ok(());
            },
        };

        match decoded {
            Decoded::Fields { fields, ack } => {
                if ack {
                    let bytes =
                        self.decoder.ack_section(entry.assoc_stream_id);
                    self.write_decoder_stream(&bytes);
                }

                self.register_push_promise(
                    entry.assoc_stream_id,
                    entry.push_id,
                    fields,
                )?;
            },

            // Still blocked; put the entry back.
            Decoded::Blocked { .. } => {
                self.blocked_promises.push(entry);
            },
        }

        Ok(())
    }

    fn resolve_blocked(&mut self, stream_id: u64, known: u64) -> Result<()> {
        // The transaction may be long gone; releasing QPACK data for a
        // destroyed stream is a no-op.
        let pending_blocks: Vec<(usize, Vec<u8>, bool)> = {
            let txn = match self.transactions.get_mut(&stream_id) {
                Some(v) => v,
                None => return Ok(()),
            };

            txn.pending
                .iter()
                .enumerate()
                .filter_map(|(i, ev)| match ev {
                    Pending::BlockedHeaders {
                        block,
                        required_insert_count,
                        trailer,
                    } if *required_insert_count <= known =>
                        Some((i, block.clone(), *trailer)),

                    _ => None,
                })
                .collect()
        };

        for (idx, block, trailer) in pending_blocks {
            let decoded = match self.decoder.decode(stream_id, &block) {
                Ok(v) => v,

                Err(_) => {
                    self.stream_error(
                        stream_id,
                        StreamError::new(
                            ErrorKind::HeaderDecode,
                            format!("header decode failed on stream {stream_id}"),
                        ),
                    );

                    return Ok(());
                },
            };

            let (fields, ack) = match decoded {
                Decoded::Fields { fields, ack } => (fields, ack),

                // Still blocked; leave the entry in place.
                Decoded::Blocked { .. } => continue,
            };

            if ack {
                let bytes = self.decoder.ack_section(stream_id);
                self.write_decoder_stream(&bytes);
            }

            let txn = match self.transactions.get_mut(&stream_id) {
                Some(v) => v,
                None => return Ok(()),
            };

            let ev = if trailer {
                Pending::Trailers { fields }
            } else {
                let interim = is_interim_response(&fields);

                if !interim {
                    txn.final_headers_received = true;

                    if txn.partially_reliable {
                        txn.wire.enter_pr_body()?;
                    }
                }

                Pending::Headers { fields, interim }
            };

            if let Some(slot) = txn.pending.get_mut(idx) {
                *slot = ev;
            }
        }

        self.schedule_delivery(stream_id);

        // Parsing of a partially reliable stream stops at a gated block;
        // continue it now that the parser is in the right state.
        self.process_transaction_stream(stream_id)
    }

    /// Issues a stream reset, retrying once when the transport defers the
    /// first attempt.
    fn send_reset(&mut self, stream_id: u64, error_code: u64) {
        let already_reset = self
            .transactions
            .get(&stream_id)
            .map(|t| t.reset_sent)
            .unwrap_or(false);

        if already_reset {
            return;
        }

        if self.transport.reset_stream(stream_id, error_code).is_err() {
            let _ = self.transport.reset_stream(stream_id, error_code);
        }

        if let Some(txn) = self.transactions.get_mut(&stream_id) {
            txn.reset_sent = true;
        }
    }

    /// Cancels outstanding delivery callbacks, settling byte events once.
    fn cancel_byte_events(&mut self, stream_id: u64) {
        self.transport.cancel_delivery_callbacks(stream_id);

        if let Some(txn) = self.transactions.get_mut(&stream_id) {
            txn.pending_byte_events = 0;
        }
    }

    /// Drops gate entries for a stream and emits the QPACK cancel record.
    fn cancel_blocked(&mut self, stream_id: u64) {
        self.blocked_streams.retain(|e| e.stream_id != stream_id);

        let bytes = self.decoder.cancel_stream(stream_id);
        self.write_decoder_stream(&bytes);
    }

    /// Forwards pending QPACK encoder instructions to the encoder stream.
    fn flush_encoder_stream(&mut self) {
        let bytes = self.encoder.take_stream_bytes();

        if bytes.is_empty() {
            return;
        }

        if let Some(id) = self.qpack_encoder_stream_id {
            let _ = self.transport.stream_send(id, &bytes, false);
        }
    }

    fn write_decoder_stream(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }

        if let Some(id) = self.qpack_decoder_stream_id {
            let _ = self.transport.stream_send(id, bytes, false);
        }
    }

    fn handle_write_error(&mut self, stream_id: u64, e: TransportErrorCode) {
        warn!("write error on stream {stream_id}: {e:?}");

        self.send_reset(stream_id, transport::HTTP_REQUEST_CANCELLED);
        self.cancel_byte_events(stream_id);

        self.stream_error(
            stream_id,
            StreamError::new(
                ErrorKind::Write,
                format!("write failed on stream {stream_id}"),
            ),
        );
    }

    /// Fails a single transaction: one `on_error`, then one detach.
    fn stream_error(&mut self, stream_id: u64, error: StreamError) {
        let txn = match self.transactions.get_mut(&stream_id) {
            Some(v) => v,
            None => return,
        };

        txn.queue_error(error);

        self.cancel_blocked(stream_id);
        self.cancel_byte_events(stream_id);

        self.schedule_delivery(stream_id);
        self.maybe_queue_detach(stream_id);
    }

    /// Fails every live transaction, in ascending stream ID order.
    fn teardown(&mut self, error: StreamError) {
        let mut ids: Vec<u64> = self.transactions.keys().copied().collect();
        ids.sort_unstable();

        for id in ids {
            self.stream_error(id, error.clone());
        }

        // Anything half-correlated is now an orphan.
        for push_id in self.push.drain_half_open() {
            if let Some(obs) = self.push_observer.clone() {
                obs.borrow_mut().orphaned_half_open_pushed_txn(push_id);
            }
        }

        let nascent: Vec<(u64, Option<u64>)> = self
            .uni_streams
            .values()
            .filter(|s| s.ty() == Some(stream::Type::Push))
            .map(|s| (s.id(), s.push_id()))
            .collect();

        for (stream_id, push_id) in nascent {
            if let Some(obs) = self.push_observer.clone() {
                obs.borrow_mut()
                    .orphaned_nascent_stream(stream_id, push_id.map(PushId::new));
            }

            let _ = self
                .transport
                .stop_sending(stream_id, transport::HTTP_REQUEST_CANCELLED);

            self.uni_streams.remove(&stream_id);
            if let Some(pid) = push_id {
                self.unadopted_push_streams.remove(&PushId::new(pid));
            }
        }

        self.drain_goaway_deadline = None;

        self.pump();
    }

    /// Escalates a protocol violation to a connection error.
    fn connection_protocol_error(&mut self, e: Error) {
        if self.state == SessionState::Closed {
            return;
        }

        error!("connection protocol error: {e:?}");

        self.transport.close(e.to_wire(), b"protocol error");

        let err = StreamError::new(
            ErrorKind::ConnectionError,
            format!("connection error: {e:?}"),
        );

        self.fire_connect_error(err.clone());
        self.teardown(err);
        self.destroy();
    }

    fn close_now(&mut self, error_code: u64, reason: &[u8]) {
        if self.state == SessionState::Closed {
            return;
        }

        // Report stragglers before the connection goes away.
        let nascent: Vec<(u64, Option<u64>)> = self
            .uni_streams
            .values()
            .filter(|s| s.ty() == Some(stream::Type::Push))
            .map(|s| (s.id(), s.push_id()))
            .collect();

        for (stream_id, push_id) in nascent {
            if let Some(obs) = self.push_observer.clone() {
                obs.borrow_mut()
                    .orphaned_nascent_stream(stream_id, push_id.map(PushId::new));
            }

            let _ = self
                .transport
                .stop_sending(stream_id, transport::HTTP_REQUEST_CANCELLED);
        }

        for push_id in self.push.drain_half_open() {
            if let Some(obs) = self.push_observer.clone() {
                obs.borrow_mut().orphaned_half_open_pushed_txn(push_id);
            }
        }

        self.transport.close(error_code, reason);

        self.destroy();
    }

    fn destroy(&mut self) {
        self.state = SessionState::Closed;
        self.drain_goaway_deadline = None;
        self.blocked_streams.clear();
        self.blocked_promises.clear();

        if self.destroy_fired {
            return;
        }

        self.destroy_fired = true;

        if let Some(cb) = self.info_cb.clone() {
            cb.borrow_mut().on_destroy();
        }
    }

    fn fire_connect_success(&mut self) {
        if self.connect_fired {
            return;
        }

        self.connect_fired = true;

        if let Some(cb) = self.connect_cb.clone() {
            cb.borrow_mut().connect_success(self);
        }
    }

    fn fire_connect_error(&mut self, error: StreamError) {
        if self.connect_fired {
            return;
        }

        self.connect_fired = true;

        if let Some(cb) = self.connect_cb.clone() {
            cb.borrow_mut().connect_error(self, error);
        }
    }

    /// Draining finishes when the last transaction goes away.
    fn check_drained(&mut self) {
        if self.transactions.is_empty() &&
            (self.drained || self.state == SessionState::Draining)
        {
            self.close_now(transport::HTTP_NO_ERROR, b"drained");
        }
    }

    fn schedule_delivery(&mut self, stream_id: u64) {
        if self.scheduled.insert(stream_id) {
            self.delivery_order.push_back(stream_id);
        }
    }

    fn maybe_queue_detach(&mut self, stream_id: u64) {
        let txn = match self.transactions.get_mut(&stream_id) {
            Some(v) => v,
            None => return,
        };

        if txn.can_detach() && !txn.detach_queued {
            txn.detach_queued = true;
            txn.queue(Pending::Detach);
            self.schedule_delivery(stream_id);
        }
    }

    /// Drains queued handler deliveries.
    ///
    /// Never reentered: a handler calling back into the session queues
    /// more work, which the outer pump picks up.
    fn pump(&mut self) {
        if self.pumping {
            return;
        }

        self.pumping = true;

        enum Step {
            Deliver(Rc<RefCell<dyn TransactionHandler>>, Pending),
            Skip,
            RemoveOrphan,
        }

        while let Some(stream_id) = self.delivery_order.pop_front() {
            self.scheduled.remove(&stream_id);

            loop {
                let step = {
                    let txn = match self.transactions.get_mut(&stream_id) {
                        Some(v) => v,
                        None => break,
                    };

                    if txn.is_blocked() {
                        break;
                    }

                    // Terminal deliveries go through even when paused.
                    if txn.ingress_paused &&
                        !matches!(
                            txn.pending.front(),
                            Some(Pending::Error { .. }) |
                                Some(Pending::Detach)
                        )
                    {
                        break;
                    }

                    match txn.handler.clone() {
                        Some(handler) => match txn.pending.pop_front() {
                            Some(ev) => Step::Deliver(handler, ev),
                            None => break,
                        },

                        // A pushed child awaiting adoption buffers its
                        // events, but terminal ones dissolve it silently.
                        None => match txn.pending.front() {
                            Some(Pending::Error { .. }) => {
                                txn.pending.pop_front();

                                Step::Skip
                            },

                            Some(Pending::Detach) => Step::RemoveOrphan,

                            _ => break,
                        },
                    }
                };

                match step {
                    Step::Deliver(handler, ev) =>
                        self.deliver(stream_id, handler, ev),

                    Step::Skip => continue,

                    Step::RemoveOrphan => {
                        self.transactions.remove(&stream_id);
                        self.check_drained();

                        break;
                    },
                }
            }
        }

        self.pumping = false;
    }

    fn deliver(
        &mut self, stream_id: u64,
        handler: Rc<RefCell<dyn TransactionHandler>>, ev: Pending,
    ) {
        match ev {
            Pending::Headers { fields, interim } => {
                if let Some(txn) = self.transactions.get_mut(&stream_id) {
                    if !interim {
                        txn.ingress = TxnState::ExpectBody;
                    }
                }

                let mut txn = Txn {
                    session: self,
                    stream_id,
                };

                handler.borrow_mut().on_headers(&mut txn, fields);
            },

            Pending::Body { data } => {
                let mut txn = Txn {
                    session: self,
                    stream_id,
                };

                handler.borrow_mut().on_body(&mut txn, &data);
            },

            Pending::BodyWithOffset { offset, data } => {
                let mut txn = Txn {
                    session: self,
                    stream_id,
                };

                handler
                    .borrow_mut()
                    .on_body_with_offset(&mut txn, offset, &data);
            },

            Pending::BodySkipped { new_offset } => {
                let mut txn = Txn {
                    session: self,
                    stream_id,
                };

                handler.borrow_mut().on_body_skipped(&mut txn, new_offset);
            },

            Pending::Trailers { fields } => {
                if let Some(txn) = self.transactions.get_mut(&stream_id) {
                    txn.ingress = TxnState::ExpectTrailers;
                }

                let mut txn = Txn {
                    session: self,
                    stream_id,
                };

                handler.borrow_mut().on_trailers(&mut txn, fields);
            },

            Pending::Eom => {
                if let Some(txn) = self.transactions.get_mut(&stream_id) {
                    txn.ingress = TxnState::EomSeen;
                    txn.read_deadline = None;
                }

                let mut txn = Txn {
                    session: self,
                    stream_id,
                };

                handler.borrow_mut().on_eom(&mut txn);

                self.maybe_queue_detach(stream_id);
            },

            Pending::Goaway { last_id } => {
                let mut txn = Txn {
                    session: self,
                    stream_id,
                };

                handler.borrow_mut().on_goaway(&mut txn, last_id);
            },

            Pending::PushedTransaction { push_id } => {
                let mut txn = Txn {
                    session: self,
                    stream_id,
                };

                handler.borrow_mut().on_pushed_transaction(&mut txn, push_id);
            },

            Pending::Error { error } => {
                let mut txn = Txn {
                    session: self,
                    stream_id,
                };

                handler.borrow_mut().on_error(&mut txn, error);

                self.maybe_queue_detach(stream_id);
            },

            Pending::Detach => {
                self.transactions.remove(&stream_id);
                self.blocked_streams.retain(|e| e.stream_id != stream_id);

                trace!("detaching transaction on stream {stream_id}");

                handler.borrow_mut().detach_transaction(self);

                self.check_drained();
            },

            Pending::BlockedHeaders { .. } => unreachable!(),
        }
    }
}

/// A borrowed view of one transaction, handed to handler callbacks.
///
/// All operations proxy to the owning [`Session`], so a handler may also
/// reach other transactions through [`session()`](Txn::session).
pub struct Txn<'a> {
    session: &'a mut Session,
    stream_id: u64,
}

impl Txn<'_> {
    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }

    pub fn session(&mut self) -> &mut Session {
        self.session
    }

    pub fn send_headers(&mut self, headers: &[Header], fin: bool) -> Result<()> {
        self.session.send_headers(self.stream_id, headers, fin)
    }

    pub fn send_body(&mut self, body: &[u8], fin: bool) -> Result<usize> {
        self.session.send_body(self.stream_id, body, fin)
    }

    pub fn send_eom(&mut self) -> Result<()> {
        self.session.send_eom(self.stream_id)
    }

    pub fn send_abort(&mut self) {
        self.session.send_abort(self.stream_id)
    }

    pub fn reject_body_to(&mut self, new_body_offset: u64) -> Result<u64> {
        self.session.reject_body_to(self.stream_id, new_body_offset)
    }

    pub fn pause_ingress(&mut self) {
        self.session.pause_ingress(self.stream_id)
    }

    pub fn resume_ingress(&mut self) {
        self.session.resume_ingress(self.stream_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use rstest::rstest;

    use crate::testing::*;

    /// Parses the HTTP/3 frames written on a unidirectional stream,
    /// skipping the stream type preface.
    fn parse_uni_frames(buf: &[u8]) -> Vec<frame::Frame> {
        let mut b = octets::Octets::with_slice(&buf[1..]);
        let mut frames = Vec::new();

        while b.cap() > 0 {
            let ty = b.get_varint().unwrap();
            let len = b.get_varint().unwrap();
            let payload = b.get_bytes(len as usize).unwrap();

            frames
                .push(frame::Frame::from_bytes(ty, len, payload.buf()).unwrap());
        }

        frames
    }

    fn open_transaction(h: &mut Harness) -> (u64, Rc<RefCell<RecordingHandler>>) {
        let handler = RecordingHandler::new();
        let id = h.session.new_transaction(handler.clone()).unwrap();

        (id, handler)
    }

    #[test]
    /// Open a transaction, get a 200 with body, close when idle.
    fn simple_get() {
        let mut h = Harness::new();
        h.connect();

        assert!(h.session.peer_settings().is_some());

        let (id, handler) = open_transaction(&mut h);
        assert_eq!(id, 0);

        h.session.send_headers(id, &get_request(), false).unwrap();
        h.session.send_eom(id).unwrap();

        h.send_response(id, 200, 100, true, false);
        h.flush_and_loop();

        let handler = handler.borrow();
        assert_eq!(handler.headers_count(), 1);
        assert_eq!(handler.body_bytes(), 100);
        assert_eq!(handler.eom_count(), 1);
        assert_eq!(handler.detach_count(), 1);
        assert!(handler.errors().is_empty());

        h.session.close_when_idle();
        assert!(h.session.is_closed());
        assert!(h.transport.borrow().closed.is_some());
    }

    #[test]
    /// Request stream IDs are client bidirectional: 0, 4, 8, ...
    fn request_stream_id_allocation() {
        let mut h = Harness::new();
        h.connect();

        for expected in [0, 4, 8, 12] {
            let (id, _) = open_transaction(&mut h);
            assert_eq!(id, expected);
        }
    }

    #[test]
    /// No transaction is handed out when the socket is unusable.
    fn no_new_transaction_if_sock_is_not_good() {
        let mut h = Harness::new();
        h.connect();

        h.transport.borrow_mut().sock_good = false;

        let handler = RecordingHandler::new();
        assert_eq!(h.session.new_transaction(handler), None);

        h.session.close_when_idle();
    }

    #[test]
    /// An interim 100 response is a separate header event preceding the
    /// final response.
    fn test_100_continue() {
        let mut h = Harness::new();
        h.connect();

        let (id, handler) = open_transaction(&mut h);

        let mut req = post_request(10);
        req.push(Header::new(b"expect", b"100-continue"));
        h.session.send_headers(id, &req, false).unwrap();
        h.session.send_body(id, &make_buf(10), false).unwrap();
        h.session.send_eom(id).unwrap();

        h.send_response(id, 100, 0, false, false);
        h.send_response(id, 200, 100, true, false);
        h.flush_and_loop();

        let handler = handler.borrow();
        assert_eq!(handler.headers_count(), 2);
        assert_eq!(
            handler.calls[0],
            Callback::Headers {
                status: b"100".to_vec()
            }
        );
        assert_eq!(
            handler.calls[1],
            Callback::Headers {
                status: b"200".to_vec()
            }
        );
        assert_eq!(handler.body_bytes(), 100);
        assert_eq!(handler.eom_count(), 1);
        assert_eq!(handler.detach_count(), 1);

        h.session.close_when_idle();
    }

    #[test]
    /// Trailing headers surface through their own callback.
    fn response_with_trailers() {
        let mut h = Harness::new();
        h.connect();

        let (id, handler) = open_transaction(&mut h);
        h.session.send_headers(id, &get_request(), true).unwrap();

        h.send_response(id, 200, 100, false, false);

        let trailer_block = h
            .peer_encoder
            .encode(&[Header::new(b"x-checksum", b"aa12")], false);
        let trailers = serialize_frame(&frame::Frame::Headers {
            header_block: trailer_block,
        });
        h.send_partial_body(id, &trailers, true);

        h.flush_and_loop();

        let handler = handler.borrow();
        assert_eq!(handler.headers_count(), 1);
        assert_eq!(handler.body_bytes(), 100);
        assert_eq!(handler.count(|c| matches!(c, Callback::Trailers { .. })), 1);
        assert_eq!(handler.eom_count(), 1);
        assert_eq!(handler.detach_count(), 1);

        h.session.close_when_idle();
    }

    #[test]
    /// Addresses are snapshotted at connect and survive a drop.
    fn get_addresses_after_drop_connection() {
        let mut h = Harness::new();
        h.connect();

        let local = h.session.local_addr();
        let peer = h.session.peer_addr();

        h.session.drop_connection();

        // Even if the transport's view changes, the session's does not.
        h.transport.borrow_mut().local = "10.0.0.1:1".parse().unwrap();
        h.transport.borrow_mut().peer = "10.0.0.2:2".parse().unwrap();

        assert_eq!(h.session.local_addr(), local);
        assert_eq!(h.session.peer_addr(), peer);
    }

    #[test]
    /// Dropping after an idle close is a harmless no-op.
    fn drop_connection_twice() {
        let mut h = Harness::new();

        let info = RecordingInfoCallback::new();
        h.session.set_info_callback(info.clone());

        h.connect();

        h.session.close_when_idle();
        h.session.drop_connection();

        assert_eq!(info.borrow().destroyed, 1);
    }

    #[test]
    /// A drop with a live transaction fails it with Shutdown, and the
    /// info callback fires in the same call stack.
    fn drop_connection_with_stream_after_close_when_idle() {
        let mut h = Harness::new();

        let info = RecordingInfoCallback::new();
        h.session.set_info_callback(info.clone());

        h.connect();

        let (id, handler) = open_transaction(&mut h);
        h.session.send_headers(id, &get_request(), false).unwrap();

        h.session.close_when_idle();
        h.loop_once();

        h.session.drop_connection();

        let calls = handler.borrow();
        let errors = calls.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, ErrorKind::Shutdown);
        assert_eq!(calls.detach_count(), 1);

        assert_eq!(info.borrow().destroyed, 1);
        assert!(h.session.is_closed());
    }

    #[test]
    /// The connect callback hears about a connection error before the
    /// session is destroyed.
    fn notify_connect_callback_before_destruct() {
        let mut h = Harness::new();

        let connect_cb = RecordingConnectCallback::new();
        let info = RecordingInfoCallback::new();
        h.session.set_connect_callback(connect_cb.clone());
        h.session.set_info_callback(info.clone());

        h.deliver_connection_end();
        h.loop_once();

        assert_eq!(connect_cb.borrow().successes, 0);
        assert_eq!(connect_cb.borrow().errors.len(), 1);
        assert_eq!(info.borrow().destroyed, 1);
    }

    #[test]
    /// Dropping the connection from inside connect_error is safe.
    fn drop_from_connect_error() {
        let mut h = Harness::new();

        let connect_cb = RecordingConnectCallback::new();
        connect_cb.borrow_mut().on_error_hook =
            Some(Box::new(|session: &mut Session| {
                session.drop_connection();
            }));

        let info = RecordingInfoCallback::new();
        h.session.set_connect_callback(connect_cb.clone());
        h.session.set_info_callback(info.clone());

        h.deliver_connection_end();
        h.loop_once();

        assert_eq!(connect_cb.borrow().errors.len(), 1);
        assert_eq!(info.borrow().destroyed, 1);
        assert!(h.session.is_closed());
    }

    #[test]
    /// A lost 0-RTT race surfaces EarlyDataFailed with the transport
    /// reason embedded.
    fn drop_connection_with_early_data_failed_error() {
        let mut h = Harness::new();
        h.connect();

        let (id, handler) = open_transaction(&mut h);
        h.session.send_headers(id, &get_request(), false).unwrap();
        h.session.send_eom(id).unwrap();

        h.deliver_connection_error(ConnectionError::new(
            TransportErrorCode::GiveupZeroRtt,
            "quic loses race",
        ));

        let calls = handler.borrow();
        let errors = calls.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, ErrorKind::EarlyDataFailed);
        assert!(errors[0].1.contains("quic loses race"));
        assert_eq!(calls.detach_count(), 1);
    }

    #[test]
    /// A connection error fans out to every open transaction.
    fn on_connection_error_with_open_streams() {
        let mut h = Harness::new();
        h.connect();

        let (_, handler) = open_transaction(&mut h);

        h.deliver_connection_error(ConnectionError::new(
            TransportErrorCode::ConnectFailed,
            "Connect Failure with Open streams",
        ));

        let calls = handler.borrow();
        assert_eq!(calls.errors().len(), 1);
        assert_eq!(calls.detach_count(), 1);
        assert!(h.session.is_closed());
    }

    #[test]
    /// A handler may pause another transaction from inside its own
    /// on_error during connection teardown.
    fn on_connection_error_with_open_streams_pause() {
        let mut h = Harness::new();
        h.connect();

        let (id1, handler1) = open_transaction(&mut h);
        let (id2, handler2) = open_transaction(&mut h);
        assert!(id1 < id2);

        h.session.send_headers(id1, &get_request(), true).unwrap();
        h.session.send_headers(id2, &get_request(), true).unwrap();

        handler1.borrow_mut().on_error_hook =
            Some(Box::new(move |txn: &mut Txn| {
                txn.session().pause_ingress(id2);
            }));

        h.deliver_connection_error(ConnectionError::new(
            TransportErrorCode::ConnectFailed,
            "Connect Failure with Open streams",
        ));

        // Terminal events bypass the pause: both handlers fail and detach.
        assert_eq!(handler1.borrow().errors().len(), 1);
        assert_eq!(handler1.borrow().detach_count(), 1);
        assert_eq!(handler2.borrow().errors().len(), 1);
        assert_eq!(handler2.borrow().detach_count(), 1);
    }

    #[test]
    /// Replay safety callbacks fire in registration order, and removal by
    /// identity works.
    fn wait_for_replay_safe_callback() {
        let mut h = Harness::new();
        h.connect();

        let cb1 = RecordingReplayCallback::new();
        let cb2 = RecordingReplayCallback::new();
        let cb3 = RecordingReplayCallback::new();

        h.session.add_waiting_for_replay_safety(cb1.clone());
        h.session.add_waiting_for_replay_safety(cb2.clone());
        h.session.add_waiting_for_replay_safety(cb3.clone());

        let cb2_dyn: Rc<RefCell<dyn ReplaySafetyCallback>> = cb2.clone();
        h.session.remove_waiting_for_replay_safety(&cb2_dyn);

        h.session.on_replay_safe();

        assert_eq!(cb1.borrow().fired, 1);
        assert_eq!(cb2.borrow().fired, 0);
        assert_eq!(cb3.borrow().fired, 1);

        h.session.close_when_idle();
    }

    #[test]
    /// A callback added after the transport is already replay safe fires
    /// immediately.
    fn already_replay_safe() {
        let mut h = Harness::new();
        h.connect();

        h.transport.borrow_mut().replay_safe = true;

        let cb = RecordingReplayCallback::new();
        h.session.add_waiting_for_replay_safety(cb.clone());

        assert_eq!(cb.borrow().fired, 1);

        h.session.close_when_idle();
    }

    #[test]
    /// The connect callback is told about replay safety too.
    fn notify_replay_safe_after_transport_ready() {
        let mut h = Harness::new();

        let connect_cb = RecordingConnectCallback::new();
        h.session.set_connect_callback(connect_cb.clone());

        h.connect();
        assert_eq!(connect_cb.borrow().successes, 1);

        h.session.on_replay_safe();
        assert_eq!(connect_cb.borrow().replay_safe_count, 1);

        h.session.close_when_idle();
    }

    #[test]
    /// GOAWAY: streams above the cut-off fail with StreamUnacknowledged,
    /// streams at or below it complete, and each received GOAWAY frame is
    /// announced once.
    fn goaway_streams_unacknowledged() {
        let mut h = Harness::new();
        h.connect();

        let goaway_id = 8;

        let mut handlers = Vec::new();

        for _ in 0..4 {
            let (id, handler) = open_transaction(&mut h);
            h.session.send_headers(id, &get_request(), false).unwrap();
            h.session.send_eom(id).unwrap();
            handlers.push((id, handler));
        }

        h.send_goaway(MAX_GOAWAY_ID, Duration::from_millis(50));
        h.send_goaway(goaway_id, Duration::from_millis(100));

        // Responses for the acknowledged streams arrive after the second
        // GOAWAY.
        for (id, _) in &handlers {
            if *id <= goaway_id {
                h.send_response(*id, 200, 100, true, false);
            }
        }
        h.flush_with_delay(Duration::from_millis(150));

        h.loop_all();

        for (id, handler) in &handlers {
            let calls = handler.borrow();

            assert_eq!(calls.goaway_count(), 2, "stream {id}");
            assert_eq!(calls.detach_count(), 1, "stream {id}");

            if *id > goaway_id {
                let errors = calls.errors();
                assert_eq!(errors.len(), 1);
                assert_eq!(errors[0].0, ErrorKind::StreamUnacknowledged);
                assert_eq!(
                    errors[0].1,
                    format!("StreamUnacknowledged on transaction id: {id}")
                );
                assert_eq!(calls.headers_count(), 0);
            } else {
                assert!(calls.errors().is_empty(), "stream {id}");
                assert_eq!(calls.headers_count(), 1);
                assert_eq!(calls.body_bytes(), 100);
                assert_eq!(calls.eom_count(), 1);
            }
        }

        // Draining finished with the last detach; nothing new can start.
        assert!(h.session.is_closed());
        let extra = RecordingHandler::new();
        assert_eq!(h.session.new_transaction(extra), None);
    }

    #[test]
    /// A second GOAWAY with a larger ID is a connection error.
    fn goaway_cannot_increase() {
        let mut h = Harness::new();
        h.connect();

        h.send_goaway(4, Duration::ZERO);
        h.send_goaway(8, Duration::ZERO);
        h.flush_and_loop();

        assert!(h.session.is_closed());
        assert_eq!(
            h.transport.borrow().closed.as_ref().unwrap().0,
            transport::HTTP_ID_ERROR
        );
    }

    #[test]
    /// Headers blocked on QPACK dynamic table state are held until the
    /// encoder stream catches up, preserving order.
    fn delayed_qpack() {
        let mut h = Harness::new();
        h.connect();

        let (id, handler) = open_transaction(&mut h);
        h.session.send_headers(id, &get_request(), true).unwrap();

        h.send_response(id, 100, 0, false, true);
        h.send_response(id, 200, 100, true, true);

        // Withhold the encoder stream bytes the blocks depend on.
        let withheld = h.peer_encoder.take_stream();
        assert_eq!(withheld.len(), 2);

        h.flush_and_loop_once();
        assert_eq!(handler.borrow().headers_count(), 0);

        h.send_encoder_stream_data(withheld);
        h.loop_all();

        let calls = handler.borrow();
        assert_eq!(calls.headers_count(), 2);
        assert_eq!(
            calls.calls[0],
            Callback::Headers {
                status: b"100".to_vec()
            }
        );
        assert_eq!(
            calls.calls[1],
            Callback::Headers {
                status: b"200".to_vec()
            }
        );
        assert_eq!(calls.body_bytes(), 100);
        assert_eq!(calls.eom_count(), 1);
        assert_eq!(calls.detach_count(), 1);

        h.session.close_when_idle();
    }

    #[test]
    /// A block that never unblocks times out with a decode error, and
    /// late encoder data is a no-op.
    fn delayed_qpack_timeout() {
        let mut h = Harness::new();
        h.connect();

        let (id, handler) = open_transaction(&mut h);
        h.session.send_headers(id, &get_request(), true).unwrap();

        h.send_response(id, 200, 100, true, true);
        let withheld = h.peer_encoder.take_stream();

        h.flush_and_loop();

        {
            let calls = handler.borrow();
            let errors = calls.errors();
            assert_eq!(errors.len(), 1);
            assert_eq!(errors[0].0, ErrorKind::HeaderDecode);
            assert_eq!(calls.detach_count(), 1);
            assert_eq!(calls.headers_count(), 0);
        }

        // The header block arrives after destruction: nothing happens.
        h.send_encoder_stream_data(withheld);
        h.loop_all();

        let calls = handler.borrow();
        assert_eq!(calls.headers_count(), 0);
        assert_eq!(calls.detach_count(), 1);

        h.session.close_when_idle();
    }

    #[test]
    /// The QPACK decoder stream carries a cancel for an aborted stream
    /// and an ack for a dynamic section.
    fn qpack_decoder_stream_flushed() {
        let mut h = Harness::new();
        h.connect();

        let (id, handler) = open_transaction(&mut h);
        h.session.send_headers(id, &get_request(), true).unwrap();
        h.flush_and_loop_once();

        h.session.send_abort(id);
        assert_eq!(handler.borrow().detach_count(), 1);

        // Stream type byte plus cancel.
        assert_eq!(
            h.transport.borrow().written(LOCAL_QPACK_DECODER_STREAM_ID).len(),
            2
        );

        let (id2, handler2) = open_transaction(&mut h);
        h.session.send_headers(id2, &get_request(), true).unwrap();

        h.send_response(id2, 200, 100, true, true);
        let withheld = h.peer_encoder.take_stream();
        h.flush_and_loop_once();

        h.send_encoder_stream_data(withheld);
        h.loop_once();

        assert_eq!(handler2.borrow().headers_count(), 1);
        assert_eq!(handler2.borrow().eom_count(), 1);

        // Stream type byte plus cancel plus ack.
        assert_eq!(
            h.transport.borrow().written(LOCAL_QPACK_DECODER_STREAM_ID).len(),
            3
        );

        h.session.close_when_idle();
    }

    #[test]
    /// Data arriving in the same loop as an abort must not reach the
    /// detached transaction, and late QPACK data is a no-op.
    fn delayed_qpack_after_reset() {
        let mut h = Harness::new();
        h.connect();

        let (id1, handler1) = open_transaction(&mut h);
        let (id2, handler2) = open_transaction(&mut h);

        h.session.send_headers(id1, &get_request(), true).unwrap();
        h.session.send_headers(id2, &get_request(), true).unwrap();

        // Response to txn1 blocks on the first insert.
        h.send_response(id1, 302, 0, true, true);
        let qpack_data1 = h.peer_encoder.take_stream();

        // Response to txn2 blocks on a *different* insert.
        h.send_response(id2, 302, 0, false, true);
        let qpack_data2 = h.peer_encoder.take_stream();

        // When txn1 finally gets its headers, abort both transactions.
        handler1.borrow_mut().on_headers_hook =
            Some(Box::new(move |txn: &mut Txn| {
                txn.send_abort();
                txn.session().send_abort(id2);
            }));

        // All events land in the same loop: txn2's data first, then
        // txn1's, then the QPACK data unblocking only txn1.
        h.flush_stream(id2);
        h.flush_stream(id1);
        h.send_encoder_stream_data(qpack_data1);
        h.loop_once();

        assert_eq!(handler1.borrow().headers_count(), 1);
        assert_eq!(handler1.borrow().detach_count(), 1);

        // txn2 was aborted with data still queued: only the detach.
        assert_eq!(handler2.borrow().headers_count(), 0);
        assert_eq!(handler2.borrow().detach_count(), 1);

        // The data that would unblock txn2 is long stale.
        h.send_encoder_stream_data(qpack_data2);
        h.loop_once();

        assert_eq!(handler2.borrow().headers_count(), 0);
        assert_eq!(handler2.borrow().detach_count(), 1);

        h.session.close_when_idle();
    }

    #[test]
    /// drop_connection destroys synchronously: the info callback fires
    /// within the same call.
    fn test_drop_connection_synchronously() {
        let mut h = Harness::new();

        let info = RecordingInfoCallback::new();
        h.session.set_info_callback(info.clone());

        h.connect();

        let (id, handler) = open_transaction(&mut h);
        h.session.send_headers(id, &get_request(), false).unwrap();

        h.session.drop_connection();

        assert_eq!(handler.borrow().errors().len(), 1);
        assert_eq!(handler.borrow().detach_count(), 1);
        assert_eq!(info.borrow().destroyed, 1);
    }

    #[test]
    /// STOP_SENDING with HTTP_REQUEST_REJECTED surfaces
    /// StreamUnacknowledged; the reset is retried when the transport
    /// defers the first attempt.
    fn test_on_stop_sending_http_request_rejected() {
        let mut h = Harness::new();
        h.connect();

        h.transport.borrow_mut().defer_first_reset = true;

        let (id, handler) = open_transaction(&mut h);
        h.session.send_headers(id, &get_request(), false).unwrap();
        h.loop_once();

        h.deliver_stop_sending(id, transport::HTTP_REQUEST_REJECTED);
        h.loop_once();

        let calls = handler.borrow();
        let errors = calls.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, ErrorKind::StreamUnacknowledged);
        assert_eq!(calls.detach_count(), 1);

        let resets = h.transport.borrow().reset_calls.clone();
        assert_eq!(resets, vec![
            (id, transport::HTTP_REQUEST_CANCELLED),
            (id, transport::HTTP_REQUEST_CANCELLED)
        ]);

        h.session.close_when_idle();
    }

    #[test]
    /// A second SETTINGS frame on the control stream is fatal.
    fn extra_settings() {
        let mut h = Harness::new();
        h.connect();

        let (id, handler) = open_transaction(&mut h);
        h.session.send_headers(id, &get_request(), false).unwrap();
        h.session.send_eom(id).unwrap();

        let settings = frame::Frame::Settings {
            max_field_section_size: None,
            qpack_max_table_capacity: Some(100),
            qpack_blocked_streams: Some(16),
            raw: None,
        };
        h.add_read_event(
            PEER_CONTROL_STREAM_ID,
            serialize_frame(&settings),
            false,
            Duration::ZERO,
        );

        h.loop_once();

        assert_eq!(handler.borrow().errors().len(), 1);
        assert_eq!(handler.borrow().detach_count(), 1);
        assert_eq!(
            h.transport.borrow().closed.as_ref().unwrap().0,
            transport::HTTP_UNEXPECTED_FRAME
        );
    }

    #[test]
    #[should_panic(expected = "settings already sent")]
    /// Generating SETTINGS twice is a programming error.
    fn write_extra_settings() {
        let mut h = Harness::new();
        h.connect();

        h.session.send_settings();
    }

    #[test]
    /// With SETTINGS generation disabled, only the stream preface goes
    /// out on the control stream.
    fn no_settings_config() {
        let mut config = Config::new().unwrap();
        config.set_send_settings(false);

        let mut h = Harness::with_config(&config);
        h.session.on_transport_ready();

        // Control stream is 2; it carries the preface and nothing else.
        assert_eq!(h.transport.borrow().written(2), &[0x00]);
    }

    #[test]
    /// A GOAWAY before SETTINGS closes the connection with
    /// HTTP_MISSING_SETTINGS.
    fn goaway_before_settings() {
        let mut h = Harness::new();
        h.session.on_transport_ready();

        let (id, handler) = open_transaction(&mut h);
        h.session.send_headers(id, &get_request(), false).unwrap();
        h.session.send_eom(id).unwrap();

        // The peer's control stream opens directly with GOAWAY.
        let mut bytes = vec![stream::HTTP3_CONTROL_STREAM_TYPE_ID as u8];
        bytes.extend_from_slice(&serialize_frame(&frame::Frame::GoAway {
            id: MAX_GOAWAY_ID,
        }));
        h.add_read_event(PEER_CONTROL_STREAM_ID, bytes, false, Duration::ZERO);

        h.loop_once();

        assert_eq!(handler.borrow().errors().len(), 1);
        assert_eq!(handler.borrow().detach_count(), 1);
        assert_eq!(
            h.transport.borrow().closed.as_ref().unwrap().0,
            transport::HTTP_MISSING_SETTINGS
        );
    }

    #[test]
    /// Draining emits GOAWAY(max) immediately and the precise GOAWAY
    /// after the configured delay.
    fn close_when_idle_sends_goaways() {
        let mut h = Harness::new();
        h.connect();

        let (id, handler) = open_transaction(&mut h);
        h.session.send_headers(id, &get_request(), false).unwrap();
        h.session.send_eom(id).unwrap();

        h.session.close_when_idle();

        // The response only lands after the drain delay elapsed.
        h.send_response(id, 200, 100, true, false);
        h.flush_with_delay(Duration::from_millis(100));
        h.loop_all();

        assert_eq!(handler.borrow().eom_count(), 1);
        assert!(h.session.is_closed());

        let written = h.transport.borrow().written(2).to_vec();
        let frames = parse_uni_frames(&written);

        let goaways: Vec<u64> = frames
            .iter()
            .filter_map(|f| match f {
                frame::Frame::GoAway { id } => Some(*id),
                _ => None,
            })
            .collect();

        assert_eq!(goaways.len(), 2);
        assert_eq!(goaways[0], MAX_GOAWAY_ID);
        assert!(goaways[1] < MAX_GOAWAY_ID);
    }

    #[test]
    /// An unknown unidirectional stream type is drained and rejected
    /// without touching the connection.
    fn unknown_uni_stream_type() {
        let mut h = Harness::new();
        h.connect();

        h.add_read_event(15, vec![33, 1, 2, 3], false, Duration::ZERO);
        h.loop_once();

        assert!(!h.session.is_closed());
        assert!(h
            .transport
            .borrow()
            .stop_sending_calls
            .contains(&(15, transport::HTTP_STREAM_CREATION_ERROR)));

        // The session keeps working.
        let (id, _) = open_transaction(&mut h);
        assert_eq!(id, 0);

        h.session.close_when_idle();
    }

    #[test]
    /// A second control stream is a connection error.
    fn duplicate_control_stream() {
        let mut h = Harness::new();
        h.connect();

        h.add_read_event(
            19,
            vec![stream::HTTP3_CONTROL_STREAM_TYPE_ID as u8],
            false,
            Duration::ZERO,
        );
        h.loop_once();

        assert!(h.session.is_closed());
        assert_eq!(
            h.transport.borrow().closed.as_ref().unwrap().0,
            transport::HTTP_STREAM_CREATION_ERROR
        );
    }

    #[test]
    /// send_abort is idempotent: one reset, one detach.
    fn abort_idempotent() {
        let mut h = Harness::new();
        h.connect();

        let (id, handler) = open_transaction(&mut h);
        h.session.send_headers(id, &get_request(), false).unwrap();

        h.session.send_abort(id);
        h.session.send_abort(id);

        assert_eq!(handler.borrow().detach_count(), 1);
        assert!(handler.borrow().errors().is_empty());

        let resets = h.transport.borrow().reset_calls.clone();
        assert_eq!(resets, vec![(id, transport::HTTP_REQUEST_CANCELLED)]);

        h.session.close_when_idle();
    }

    #[test]
    /// Paused ingress defers deliveries until resume.
    fn pause_and_resume_ingress() {
        let mut h = Harness::new();
        h.connect();

        let (id, handler) = open_transaction(&mut h);
        h.session.send_headers(id, &get_request(), true).unwrap();
        h.session.pause_ingress(id);

        h.send_response(id, 200, 100, true, false);
        h.flush_and_loop_once();

        assert_eq!(handler.borrow().headers_count(), 0);

        h.session.resume_ingress(id);

        assert_eq!(handler.borrow().headers_count(), 1);
        assert_eq!(handler.borrow().eom_count(), 1);
        assert_eq!(handler.borrow().detach_count(), 1);

        h.session.close_when_idle();
    }

    #[test]
    /// Detach waits for outstanding delivery acknowledgements.
    fn detach_gated_on_byte_events() {
        let mut h = Harness::new();
        h.connect();
        h.auto_ack = false;

        let (id, handler) = open_transaction(&mut h);
        h.session.enable_partial_reliability(id).unwrap();
        h.session.send_headers(id, &get_request(), false).unwrap();
        h.session.send_eom(id).unwrap();

        h.start_partial_response(id, 200, 42, false);
        h.send_partial_body(id, &make_buf(42), true);
        h.flush_and_loop_once();

        // Everything delivered, but the byte event still gates detach.
        assert_eq!(handler.borrow().eom_count(), 1);
        assert_eq!(handler.borrow().detach_count(), 0);
        assert_eq!(h.session.transaction_count(), 1);

        h.session.on_delivery_ack(id, 0);

        assert_eq!(handler.borrow().detach_count(), 1);
        assert_eq!(h.session.transaction_count(), 0);

        h.session.close_when_idle();
    }

    /// Sets up a parent transaction ready to receive pushes.
    fn push_setup(
        h: &mut Harness,
    ) -> (u64, Rc<RefCell<RecordingHandler>>, Rc<RefCell<RecordingHandler>>)
    {
        let (id, parent) = open_transaction(h);
        h.session.send_headers(id, &get_request(), false).unwrap();

        let child = RecordingHandler::new();
        let child_for_hook = child.clone();

        parent.borrow_mut().on_pushed_hook =
            Some(Box::new(move |txn: &mut Txn, push_id: PushId| {
                txn.session()
                    .set_push_handler(push_id, child_for_hook.clone())
                    .unwrap();
            }));

        (id, parent, child)
    }

    #[test]
    /// Promise then push stream: the child transaction materializes and
    /// plays its response; the parent, which never gets a response, times
    /// out.
    fn push_promise_followed_by_push_stream() {
        let mut h = Harness::new();
        h.connect();

        let observer = RecordingPushObserver::new();
        h.session.set_push_lifecycle_observer(observer.clone());

        let (id, parent, child) = push_setup(&mut h);

        let push_id = PushId::new(1);

        h.send_push_promise(id, push_id, false);
        let push_stream_id = h.create_push_stream(push_id, 200, 100, true);

        h.session.send_eom(id).unwrap();

        h.session.close_when_idle();
        h.flush_and_loop();

        {
            let calls = parent.borrow();
            assert_eq!(
                calls.count(
                    |c| matches!(c, Callback::PushedTransaction { .. })
                ),
                1
            );
            let errors = calls.errors();
            assert_eq!(errors.len(), 1);
            assert_eq!(errors[0].0, ErrorKind::Timeout);
        }

        {
            let calls = child.borrow();
            assert_eq!(calls.headers_count(), 1);
            assert_eq!(calls.body_bytes(), 100);
            assert_eq!(calls.eom_count(), 1);
            assert_eq!(calls.detach_count(), 1);
        }

        let events = observer.borrow().events.clone();
        assert!(events.contains(&PushEvent::PromiseBegin {
            assoc_stream_id: id,
            push_id
        }));
        assert!(events
            .iter()
            .any(|e| matches!(e, PushEvent::Promise { .. })));
        assert!(events.contains(&PushEvent::NascentBegin {
            stream_id: push_stream_id,
            is_eof: true
        }));
        assert!(events.contains(&PushEvent::Nascent {
            stream_id: push_stream_id,
            push_id,
            is_eof: true
        }));
        assert!(events.contains(&PushEvent::PushedTxn {
            stream_id: push_stream_id,
            push_id,
            assoc_stream_id: id
        }));
    }

    #[test]
    /// Push stream before its promise: correlation works in either order.
    fn pushed_transaction_out_of_order() {
        let mut h = Harness::new();
        h.connect();

        let observer = RecordingPushObserver::new();
        h.session.set_push_lifecycle_observer(observer.clone());

        let (id, _parent, child) = push_setup(&mut h);

        let push_id = PushId::new(1);

        // The push stream (with EOF) arrives first.
        let push_stream_id = h.create_push_stream(push_id, 200, 100, true);
        h.flush_and_loop_once();

        assert!(observer.borrow().events.contains(&PushEvent::Nascent {
            stream_id: push_stream_id,
            push_id,
            is_eof: true
        }));

        // Now the promise adopts it.
        h.send_push_promise(id, push_id, false);
        h.session.send_eom(id).unwrap();
        h.flush_and_loop_once();

        let calls = child.borrow();
        assert_eq!(calls.headers_count(), 1);
        assert_eq!(calls.body_bytes(), 100);
        assert_eq!(calls.eom_count(), 1);
        assert_eq!(calls.detach_count(), 1);

        h.session.send_abort(id);
        h.session.close_when_idle();
    }

    #[test]
    /// A promise whose stream never arrives: the parent times out and the
    /// half-open child is reported.
    fn push_promise_without_stream_times_out() {
        let mut h = Harness::new();
        h.connect();

        let observer = RecordingPushObserver::new();
        h.session.set_push_lifecycle_observer(observer.clone());

        let (id, parent, _child) = push_setup(&mut h);

        let push_id = PushId::new(1);
        h.send_push_promise(id, push_id, false);
        h.session.send_eom(id).unwrap();

        h.flush_and_loop();

        let errors = parent.borrow().errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, ErrorKind::Timeout);

        let events = observer.borrow().events.clone();
        assert!(events.contains(&PushEvent::HalfOpen {
            push_id,
            assoc_stream_id: id
        }));
        assert!(events.contains(&PushEvent::PushedTxnTimeout { push_id }));
    }

    #[test]
    /// A push stream that never gets a promise is orphaned at teardown.
    fn orphaned_push_stream() {
        let mut h = Harness::new();
        h.connect();

        let observer = RecordingPushObserver::new();
        h.session.set_push_lifecycle_observer(observer.clone());

        let (id, parent, _child) = push_setup(&mut h);

        let push_id = PushId::new(1);
        let push_stream_id = h.create_push_stream(push_id, 200, 100, true);

        h.session.send_eom(id).unwrap();
        h.flush_and_loop();

        // Parent timed out; the nascent stream is still waiting.
        assert_eq!(parent.borrow().errors().len(), 1);

        h.session.close_when_idle();

        let events = observer.borrow().events.clone();
        assert!(events.contains(&PushEvent::OrphanedNascent {
            stream_id: push_stream_id,
            push_id: Some(push_id)
        }));
    }

    #[test]
    /// Reusing a push ID for a second promise is a connection error.
    fn push_id_reuse() {
        let mut h = Harness::new();
        h.connect();

        let (id, _parent, _child) = push_setup(&mut h);

        h.send_push_promise(id, PushId::new(1), false);
        h.send_push_promise(id, PushId::new(1), false);
        h.flush_and_loop_once();

        assert!(h.session.is_closed());
        assert_eq!(
            h.transport.borrow().closed.as_ref().unwrap().0,
            transport::HTTP_ID_ERROR
        );
    }

    #[derive(Clone, Copy, Debug, PartialEq)]
    enum PrItem {
        Body,
        Skip,
    }

    const PR_DELTA: u64 = 42;

    fn open_pr_transaction(
        h: &mut Harness, script_len: usize,
    ) -> (u64, Rc<RefCell<RecordingHandler>>) {
        let (id, handler) = open_transaction(h);

        h.session.enable_partial_reliability(id).unwrap();
        h.session.send_headers(id, &get_request(), false).unwrap();
        h.session.send_eom(id).unwrap();

        let response_len = PR_DELTA as usize * script_len;
        h.start_partial_response(id, 200, response_len, false);
        h.flush_and_loop_once();

        assert_eq!(handler.borrow().headers_count(), 1);

        (id, handler)
    }

    #[rstest]
    #[case::body(&[PrItem::Body])]
    #[case::skip(&[PrItem::Skip])]
    #[case::body_skip_body(&[PrItem::Body, PrItem::Skip, PrItem::Body])]
    #[case::skip_body_skip(&[PrItem::Skip, PrItem::Body, PrItem::Skip])]
    #[case::body_body_skip_body(&[PrItem::Body, PrItem::Body, PrItem::Skip, PrItem::Body])]
    #[case::skip_skip_body_skip(&[PrItem::Skip, PrItem::Skip, PrItem::Body, PrItem::Skip])]
    #[case::skip_skip(&[PrItem::Skip, PrItem::Skip])]
    #[case::body_body(&[PrItem::Body, PrItem::Body])]
    /// Peer-driven skips interleave with body chunks at the right
    /// offsets.
    fn pr_body_scripted_expire(#[case] script: &[PrItem]) {
        let mut h = Harness::new();
        h.connect();

        let (id, handler) = open_pr_transaction(&mut h, script.len());

        let mut processed = 0u64;

        for (i, item) in script.iter().enumerate() {
            let eom = i == script.len() - 1;

            match item {
                PrItem::Body => {
                    h.send_partial_body(id, &make_buf(PR_DELTA as usize), eom);
                    h.flush();
                },

                PrItem::Skip => {
                    h.deliver_data_expired(id, PR_DELTA);

                    if eom {
                        h.send_partial_body(id, &[], true);
                        h.flush();
                    }
                },
            }

            if eom {
                h.loop_all();
            } else {
                h.loop_once();
            }

            match item {
                PrItem::Body => {
                    assert!(handler.borrow().calls.contains(
                        &Callback::BodyWithOffset {
                            offset: processed,
                            len: PR_DELTA as usize
                        }
                    ));
                },

                PrItem::Skip => {
                    assert!(handler.borrow().calls.contains(
                        &Callback::BodySkipped {
                            new_offset: processed + PR_DELTA
                        }
                    ));
                },
            }

            processed += PR_DELTA;
        }

        assert_eq!(handler.borrow().eom_count(), 1);
        assert_eq!(handler.borrow().detach_count(), 1);

        h.session.close_when_idle();
    }

    #[rstest]
    #[case::body(&[PrItem::Body])]
    #[case::skip(&[PrItem::Skip])]
    #[case::body_skip_body(&[PrItem::Body, PrItem::Skip, PrItem::Body])]
    #[case::skip_body_skip(&[PrItem::Skip, PrItem::Body, PrItem::Skip])]
    /// Receiver-driven rejects advance the transport read offset by
    /// exactly the body delta.
    fn pr_body_scripted_reject(#[case] script: &[PrItem]) {
        let mut h = Harness::new();
        h.connect();

        let (id, handler) = open_pr_transaction(&mut h, script.len());

        let mut processed = 0u64;

        for (i, item) in script.iter().enumerate() {
            let eom = i == script.len() - 1;

            match item {
                PrItem::Body => {
                    h.send_partial_body(id, &make_buf(PR_DELTA as usize), eom);
                    h.flush();
                },

                PrItem::Skip => {
                    let old_offset = *h
                        .transport
                        .borrow()
                        .read_offsets
                        .get(&id)
                        .unwrap_or(&0);

                    let res =
                        h.session.reject_body_to(id, processed + PR_DELTA);
                    assert_eq!(res, Ok(processed + PR_DELTA));

                    let new_offset = *h
                        .transport
                        .borrow()
                        .read_offsets
                        .get(&id)
                        .unwrap_or(&0);
                    assert_eq!(new_offset, old_offset + PR_DELTA);

                    h.peer_data_rejected(id, PR_DELTA);

                    if eom {
                        h.send_partial_body(id, &[], true);
                        h.flush();
                    }
                },
            }

            if eom {
                h.loop_all();
            } else {
                h.loop_once();
            }

            if *item == PrItem::Body {
                assert!(handler.borrow().calls.contains(
                    &Callback::BodyWithOffset {
                        offset: processed,
                        len: PR_DELTA as usize
                    }
                ));
            }

            processed += PR_DELTA;
        }

        assert_eq!(handler.borrow().eom_count(), 1);
        assert_eq!(handler.borrow().detach_count(), 1);

        h.session.close_when_idle();
    }

    #[test]
    /// A bogus peer skip offset is a soft error: the exchange still
    /// completes.
    fn pr_wrong_offset_error_cleanup() {
        let mut h = Harness::new();
        h.connect();

        let (id, handler) = open_pr_transaction(&mut h, 1);

        h.send_partial_body(id, &make_buf(21), false);
        h.flush_and_loop_once();
        assert_eq!(handler.borrow().body_bytes(), 21);

        // An offset far behind the read position.
        let now = h.now;
        h.session.on_data_expired(now, id, 1);

        h.send_partial_body(id, &make_buf(21), true);
        h.flush_and_loop();

        let calls = handler.borrow();
        assert_eq!(calls.body_bytes(), 42);
        assert_eq!(
            calls.count(|c| matches!(c, Callback::BodySkipped { .. })),
            0
        );
        assert_eq!(calls.eom_count(), 1);
        assert_eq!(calls.detach_count(), 1);
        assert!(calls.errors().is_empty());

        h.session.close_when_idle();
    }

    #[test]
    /// A skip of zero bytes is a no-op.
    fn pr_skip_of_zero_is_noop() {
        let mut h = Harness::new();
        h.connect();

        let (id, handler) = open_pr_transaction(&mut h, 1);

        h.deliver_data_expired(id, 0);
        h.loop_once();

        assert_eq!(
            handler
                .borrow()
                .count(|c| matches!(c, Callback::BodySkipped { .. })),
            0
        );

        h.send_partial_body(id, &make_buf(PR_DELTA as usize), true);
        h.flush_and_loop();

        assert_eq!(handler.borrow().eom_count(), 1);
        assert_eq!(handler.borrow().detach_count(), 1);

        h.session.close_when_idle();
    }

    #[test]
    /// A rejected delivery-callback registration fails the transaction
    /// with a descriptive error.
    fn drop_connection_with_delivery_ack_cb_set_error() {
        let mut h = Harness::new();
        h.connect();

        let (id, handler) = open_transaction(&mut h);
        h.transport.borrow_mut().fail_delivery_on = Some(id);

        h.session.enable_partial_reliability(id).unwrap();
        h.session.send_headers(id, &get_request(), false).unwrap();
        h.flush_and_loop_once();

        let calls = handler.borrow();
        let errors = calls.errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].1.contains("failed to register delivery callback"));
        assert_eq!(calls.detach_count(), 1);

        h.session.close_when_idle();
    }
    #[test]
    /// A PUSH_PROMISE whose header block is gated on QPACK state keeps
    /// its promised headers: the promise only registers once the encoder
    /// stream catches up, and a push stream that arrived early is adopted
    /// at that point.
    fn blocked_push_promise_resolves_with_headers() {
        let mut h = Harness::new();
        h.connect();

        let observer = RecordingPushObserver::new();
        h.session.set_push_lifecycle_observer(observer.clone());

        let (id, parent, child) = push_setup(&mut h);

        let push_id = PushId::new(1);

        h.send_push_promise(id, push_id, true);
        let withheld = h.peer_encoder.take_stream();

        h.flush_and_loop_once();

        // The promise is gated: not registered, not surfaced.
        assert!(!observer
            .borrow()
            .events
            .iter()
            .any(|e| matches!(e, PushEvent::Promise { .. })));
        assert_eq!(
            parent
                .borrow()
                .count(|c| matches!(c, Callback::PushedTransaction { .. })),
            0
        );

        // The push stream arrives first and has to wait unadopted.
        let push_stream_id = h.create_push_stream(push_id, 200, 100, true);
        h.flush_and_loop_once();

        assert_eq!(child.borrow().headers_count(), 0);

        // Releasing the encoder bytes resolves the promise with its real
        // headers and adopts the waiting stream.
        h.send_encoder_stream_data(withheld);
        h.loop_once();

        let events = observer.borrow().events.clone();
        assert!(events.contains(&PushEvent::Promise {
            assoc_stream_id: id,
            push_id,
            header_count: get_request().len()
        }));
        assert!(events.contains(&PushEvent::PushedTxn {
            stream_id: push_stream_id,
            push_id,
            assoc_stream_id: id
        }));

        assert_eq!(
            parent
                .borrow()
                .count(|c| matches!(c, Callback::PushedTransaction { .. })),
            1
        );

        {
            let calls = child.borrow();
            assert_eq!(calls.headers_count(), 1);
            assert_eq!(calls.body_bytes(), 100);
            assert_eq!(calls.eom_count(), 1);
            assert_eq!(calls.detach_count(), 1);
        }

        h.session.send_abort(id);
        h.session.close_when_idle();
    }

    #[test]
    /// A partially reliable response whose final headers are gated: body
    /// bytes that race the encoder stream are held unparsed, then surface
    /// as unframed body at the right offsets once the block resolves.
    fn delayed_qpack_partially_reliable() {
        let mut h = Harness::new();
        h.connect();

        let (id, handler) = open_transaction(&mut h);
        h.session.enable_partial_reliability(id).unwrap();
        h.session.send_headers(id, &get_request(), false).unwrap();
        h.session.send_eom(id).unwrap();

        h.start_partial_response(id, 200, 2 * PR_DELTA as usize, true);
        let withheld = h.peer_encoder.take_stream();

        // The first body chunk lands in the same event as the blocked
        // header block.
        h.send_partial_body(id, &make_buf(PR_DELTA as usize), false);
        h.flush_and_loop_once();

        assert_eq!(handler.borrow().headers_count(), 0);
        assert_eq!(handler.borrow().body_bytes(), 0);

        // Unblocking delivers the headers, switches the parser to
        // unframed body and replays the buffered bytes at offset zero.
        h.send_encoder_stream_data(withheld);
        h.loop_once();

        assert_eq!(handler.borrow().headers_count(), 1);
        assert!(handler.borrow().calls.contains(&Callback::BodyWithOffset {
            offset: 0,
            len: PR_DELTA as usize
        }));

        // Skips keep lining up after the late unblock.
        h.deliver_data_expired(id, PR_DELTA);
        h.send_partial_body(id, &[], true);
        h.flush();
        h.loop_all();

        {
            let calls = handler.borrow();
            assert!(calls.calls.contains(&Callback::BodySkipped {
                new_offset: 2 * PR_DELTA
            }));
            assert_eq!(calls.eom_count(), 1);
            assert_eq!(calls.detach_count(), 1);
            assert!(calls.errors().is_empty());
        }

        h.session.close_when_idle();
    }
}

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

//! Per-exchange transaction state and the handler contract.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Instant;

use crate::push::PushId;
use crate::session::Session;
use crate::session::Txn;
use crate::stream;
use crate::Header;

/// The error kinds surfaced on a transaction handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The connection failed or was torn down by a protocol violation.
    ConnectionError,

    /// The transport lost the 0-RTT race and early data was not accepted.
    EarlyDataFailed,

    /// The peer will not process this stream (GOAWAY cut-off or
    /// STOP_SENDING with HTTP_REQUEST_REJECTED).
    StreamUnacknowledged,

    /// A header block could not be decoded in time.
    HeaderDecode,

    /// The transaction sat idle past its timeout.
    Timeout,

    /// The session was dropped locally.
    Shutdown,

    /// A transport write failed.
    Write,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// An error delivered to a transaction handler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamError {
    pub kind: ErrorKind,
    pub message: String,
}

impl StreamError {
    pub fn new(kind: ErrorKind, message: String) -> Self {
        StreamError { kind, message }
    }

    /// The error delivered when a GOAWAY or peer rejection leaves the
    /// stream unprocessed.
    pub fn stream_unacknowledged(stream_id: u64) -> Self {
        StreamError {
            kind: ErrorKind::StreamUnacknowledged,
            message: format!(
                "StreamUnacknowledged on transaction id: {stream_id}"
            ),
        }
    }
}

impl std::fmt::Display for StreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// The callbacks a transaction surfaces to its application handler.
///
/// Handlers hold a non-owning view of the transaction: the session owns
/// the transaction state, and each callback receives a [`Txn`] handle that
/// is only valid for the duration of the call. After
/// `detach_transaction()` the handler must not retain or use the stream ID
/// it was bound to.
///
/// Callbacks are never reentered: everything is queued inside the session
/// and delivered from its event pump, so a handler may safely operate on
/// other transactions (or open new ones) from within any callback.
pub trait TransactionHandler {
    /// A header block was received. 1xx interim responses are delivered as
    /// separate calls preceding the final response headers.
    fn on_headers(&mut self, txn: &mut Txn, headers: Vec<Header>);

    /// A chunk of response body was received.
    fn on_body(&mut self, txn: &mut Txn, data: &[u8]);

    /// A chunk of response body was received at an explicit body offset.
    ///
    /// Only used by partially-reliable exchanges; the default forwards to
    /// [`on_body()`](Self::on_body).
    fn on_body_with_offset(&mut self, txn: &mut Txn, offset: u64, data: &[u8]) {
        let _ = offset;

        self.on_body(txn, data);
    }

    /// The peer declared body bytes as expired; the body offset advanced
    /// to `new_offset` without data.
    fn on_body_skipped(&mut self, txn: &mut Txn, new_offset: u64) {
        let _ = (txn, new_offset);
    }

    /// Trailing headers were received.
    fn on_trailers(&mut self, txn: &mut Txn, trailers: Vec<Header>) {
        let _ = (txn, trailers);
    }

    /// The peer finished the message.
    fn on_eom(&mut self, txn: &mut Txn);

    /// The transaction failed. Delivered at most once, and always followed
    /// by `detach_transaction()`.
    fn on_error(&mut self, txn: &mut Txn, error: StreamError);

    /// The peer sent a GOAWAY frame; delivered once per received frame.
    fn on_goaway(&mut self, txn: &mut Txn, last_id: u64) {
        let _ = (txn, last_id);
    }

    /// The peer promised a pushed exchange on this transaction. The
    /// handler may attach a handler for the child with
    /// [`Session::set_push_handler()`].
    fn on_pushed_transaction(&mut self, txn: &mut Txn, push_id: PushId) {
        let _ = (txn, push_id);
    }

    /// The transaction is gone. Called exactly once, after both directions
    /// reached a terminal state and all pending byte events settled.
    fn detach_transaction(&mut self, session: &mut Session);
}

/// Per-direction transaction state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxnState {
    Idle,
    ExpectHeaders,
    ExpectBody,
    ExpectTrailers,
    EomSeen,
    Aborted,
}

impl TxnState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TxnState::EomSeen | TxnState::Aborted)
    }
}

/// A queued handler delivery.
///
/// Events are staged here in wire-arrival order and drained by the
/// session's pump; a blocked header block at the front of the queue holds
/// everything behind it.
#[derive(Debug)]
pub(crate) enum Pending {
    Headers {
        fields: Vec<Header>,
        interim: bool,
    },

    BlockedHeaders {
        block: Vec<u8>,
        required_insert_count: u64,
        trailer: bool,
    },

    Body {
        data: Vec<u8>,
    },

    BodyWithOffset {
        offset: u64,
        data: Vec<u8>,
    },

    BodySkipped {
        new_offset: u64,
    },

    Trailers {
        fields: Vec<Header>,
    },

    Eom,

    Goaway {
        last_id: u64,
    },

    PushedTransaction {
        push_id: PushId,
    },

    Error {
        error: StreamError,
    },

    Detach,
}

/// The server-push attributes of a pushed transaction.
#[derive(Clone, Copy, Debug)]
pub(crate) struct PushAttributes {
    pub push_id: PushId,
    pub assoc_stream_id: u64,
}

/// One request/response exchange bound to one QUIC stream.
///
/// The session owns all transactions; handlers only ever see [`Txn`]
/// views.
pub(crate) struct Transaction {
    pub stream_id: u64,

    pub handler: Option<Rc<RefCell<dyn TransactionHandler>>>,

    pub ingress: TxnState,
    pub egress: TxnState,

    pub headers_sent: bool,
    pub eom_sent: bool,

    pub partially_reliable: bool,

    /// Outstanding delivery-ack registrations; gates detach.
    pub pending_byte_events: u32,

    /// Total bytes written on the stream, used as the delivery-callback
    /// registration offset.
    pub egress_offset: u64,

    /// Queued handler deliveries in arrival order.
    pub pending: VecDeque<Pending>,

    pub ingress_paused: bool,

    pub error_delivered: bool,
    pub detach_queued: bool,

    /// Whether a reset was already issued for this stream.
    pub reset_sent: bool,

    /// Whether the final (non-interim) response headers were received.
    pub final_headers_received: bool,

    /// Cumulative ingress body offset for framed bodies.
    pub body_offset: u64,

    /// The wire parser for the stream carrying this exchange's ingress.
    pub wire: stream::Stream,

    /// Set for pushed transactions.
    pub push: Option<PushAttributes>,

    /// Ingress idle deadline; disarmed once ingress is terminal.
    pub read_deadline: Option<Instant>,
}

impl Transaction {
    pub fn new(
        stream_id: u64, handler: Option<Rc<RefCell<dyn TransactionHandler>>>,
        wire: stream::Stream, read_deadline: Option<Instant>,
    ) -> Transaction {
        Transaction {
            stream_id,
            handler,
            ingress: TxnState::ExpectHeaders,
            egress: TxnState::Idle,
            headers_sent: false,
            eom_sent: false,
            partially_reliable: false,
            pending_byte_events: 0,
            egress_offset: 0,
            pending: VecDeque::new(),
            ingress_paused: false,
            error_delivered: false,
            detach_queued: false,
            reset_sent: false,
            final_headers_received: false,
            body_offset: 0,
            wire,
            push: None,
            read_deadline,
        }
    }

    pub fn is_push(&self) -> bool {
        self.push.is_some()
    }

    /// Whether both directions are terminal and no byte events remain.
    pub fn can_detach(&self) -> bool {
        self.ingress.is_terminal() &&
            self.egress.is_terminal() &&
            self.pending_byte_events == 0
    }

    /// Whether the front of the delivery queue is held by the QPACK gate.
    pub fn is_blocked(&self) -> bool {
        matches!(self.pending.front(), Some(Pending::BlockedHeaders { .. }))
    }

    pub fn queue(&mut self, ev: Pending) {
        self.pending.push_back(ev);
    }

    /// Queues a terminal error, dropping everything still undelivered.
    ///
    /// Data that raced the error in the same loop iteration must not reach
    /// the handler, so the queue is purged rather than drained.
    pub fn queue_error(&mut self, error: StreamError) {
        if self.error_delivered {
            return;
        }

        self.error_delivered = true;

        self.pending.clear();
        self.pending.push_back(Pending::Error { error });

        self.ingress = TxnState::Aborted;
        self.egress = TxnState::Aborted;
        self.read_deadline = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_txn() -> Transaction {
        Transaction::new(0, None, stream::Stream::new(0, true), None)
    }

    #[test]
    fn terminal_states() {
        assert!(!TxnState::Idle.is_terminal());
        assert!(!TxnState::ExpectHeaders.is_terminal());
        assert!(!TxnState::ExpectBody.is_terminal());
        assert!(!TxnState::ExpectTrailers.is_terminal());
        assert!(TxnState::EomSeen.is_terminal());
        assert!(TxnState::Aborted.is_terminal());
    }

    #[test]
    /// Detach requires both directions terminal and byte events settled.
    fn detach_gating() {
        let mut txn = test_txn();
        assert!(!txn.can_detach());

        txn.ingress = TxnState::EomSeen;
        txn.egress = TxnState::EomSeen;
        assert!(txn.can_detach());

        txn.pending_byte_events = 1;
        assert!(!txn.can_detach());

        txn.pending_byte_events = 0;
        assert!(txn.can_detach());
    }

    #[test]
    /// A queued error purges undelivered events and is delivered once.
    fn error_purges_queue() {
        let mut txn = test_txn();

        txn.queue(Pending::Body {
            data: vec![1, 2, 3],
        });
        txn.queue(Pending::Eom);

        txn.queue_error(StreamError::stream_unacknowledged(0));
        assert_eq!(txn.pending.len(), 1);
        assert!(matches!(txn.pending.front(), Some(Pending::Error { .. })));

        // A second error is dropped outright.
        txn.queue_error(StreamError::new(
            ErrorKind::Shutdown,
            "dropped".to_string(),
        ));
        assert_eq!(txn.pending.len(), 1);

        assert!(txn.ingress.is_terminal());
        assert!(txn.egress.is_terminal());
    }

    #[test]
    fn unacknowledged_message_format() {
        let err = StreamError::stream_unacknowledged(12);
        assert_eq!(err.kind, ErrorKind::StreamUnacknowledged);
        assert_eq!(err.message, "StreamUnacknowledged on transaction id: 12");
    }
}

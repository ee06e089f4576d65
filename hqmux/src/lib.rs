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

//! Client-side HTTP/3 session multiplexing on top of a QUIC transport.
//!
//! This crate implements the upstream half of an HTTP/3 connection: a
//! [`Session`] owns a single QUIC connection to a server and multiplexes
//! many concurrent request/response exchanges (*transactions*) over it,
//! drives the HTTP/3 control and QPACK streams, and brokers server push.
//!
//! The QUIC transport itself is not part of this crate. The session talks
//! to it through the [`QuicTransport`] trait, and is fed transport events
//! (stream bytes, resets, delivery acknowledgements, connection errors)
//! through its `on_*` entry points. Similarly, the QPACK encoder and
//! decoder are consumed through the [`HeaderEncoder`] and [`HeaderDecoder`]
//! traits; this crate implements the *gating* of header blocks on dynamic
//! table state, not the compression itself.
//!
//! ## Driving a session
//!
//! Everything runs on a single thread and nothing inside the session ever
//! blocks or awaits. The session is pumped externally: transport events are
//! pushed in as they happen, and timers are driven by polling
//! [`Session::timeout()`] and calling [`Session::on_timeout()`] when the
//! deadline is reached.
//!
//! A transaction is opened with [`Session::new_transaction()`], which hands
//! back the request stream ID. Egress flows through [`Session::send_headers()`],
//! [`Session::send_body()`] and [`Session::send_eom()`]; ingress is
//! delivered to the [`TransactionHandler`] the transaction was created
//! with. Each handler sees, in wire order: zero or more interim
//! (1xx) header events, the final header event, body, optional trailers,
//! and end-of-message, or a single terminal error. After either, exactly
//! one `detach_transaction` call follows, and the handler must drop any
//! reference it kept to the transaction.
//!
//! ## Server push
//!
//! A pushed exchange becomes visible in two halves that may arrive in
//! either order: a `PUSH_PROMISE` frame on the request stream that carries
//! the push ID and promised headers, and a unidirectional push stream
//! whose preface is followed by the same push ID, unframed. The session
//! correlates the two and surfaces the child transaction on the parent's
//! handler once the promise has been seen.
//!
//! [`QuicTransport`]: transport::QuicTransport
//! [`HeaderEncoder`]: codec::HeaderEncoder
//! [`HeaderDecoder`]: codec::HeaderDecoder
//! [`TransactionHandler`]: transaction::TransactionHandler

#[macro_use]
extern crate log;

/// A specialized [`Result`] type for session operations.
///
/// [`Result`]: https://doc.rust-lang.org/std/result/enum.Result.html
pub type Result<T> = std::result::Result<T, Error>;

/// A session-level HTTP/3 error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// There is no error or no work to do.
    Done,

    /// The provided buffer is too short.
    BufferTooShort,

    /// Internal error in the HTTP/3 stack.
    InternalError,

    /// The peer is exhibiting behavior that causes excessive load.
    ExcessiveLoad,

    /// A stream ID or push ID was used incorrectly, such as exceeding a
    /// limit or being reused.
    IdError,

    /// The peer created a stream that will not be accepted.
    StreamCreationError,

    /// A required critical stream was closed.
    ClosedCriticalStream,

    /// No SETTINGS frame at the beginning of the control stream.
    MissingSettings,

    /// A frame was received which is not permitted in the current state.
    FrameUnexpected,

    /// Frame violated layout or size rules.
    FrameError,

    /// QPACK header block decompression failure.
    QpackDecompressionFailed,

    /// Error originated from the transport layer.
    TransportError,

    /// The underlying QUIC stream doesn't have enough capacity.
    StreamBlocked,

    /// The operation is not valid in the current state.
    InvalidState,

    /// The requested operation was rejected by the transport.
    InvalidOperation,
}

impl Error {
    /// Converts the error to the matching HTTP/3 application error code,
    /// suitable for a QUIC CONNECTION_CLOSE or stream reset.
    pub fn to_wire(self) -> u64 {
        match self {
            Error::Done => transport::HTTP_NO_ERROR,
            Error::InternalError => transport::HTTP_INTERNAL_ERROR,
            Error::StreamCreationError => transport::HTTP_STREAM_CREATION_ERROR,
            Error::ClosedCriticalStream =>
                transport::HTTP_CLOSED_CRITICAL_STREAM,
            Error::MissingSettings => transport::HTTP_MISSING_SETTINGS,
            Error::FrameUnexpected => transport::HTTP_UNEXPECTED_FRAME,
            Error::FrameError => transport::HTTP_FRAME_ERROR,
            Error::ExcessiveLoad => transport::HTTP_EXCESSIVE_LOAD,
            Error::IdError => transport::HTTP_ID_ERROR,
            Error::QpackDecompressionFailed =>
                transport::HTTP_QPACK_DECOMPRESSION_FAILED,

            _ => transport::HTTP_GENERAL_PROTOCOL_ERROR,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

impl From<octets::BufferTooShortError> for Error {
    fn from(_err: octets::BufferTooShortError) -> Self {
        Error::BufferTooShort
    }
}

/// The session configuration.
#[derive(Clone, Debug)]
pub struct Config {
    pub(crate) max_field_section_size: Option<u64>,
    pub(crate) qpack_max_table_capacity: Option<u64>,
    pub(crate) qpack_blocked_streams: Option<u64>,
    pub(crate) send_settings: bool,
    pub(crate) qpack_blocked_timeout: std::time::Duration,
    pub(crate) transaction_timeout: std::time::Duration,
    pub(crate) drain_goaway_delay: std::time::Duration,
}

impl Config {
    /// Creates a new configuration with default values.
    pub fn new() -> Result<Config> {
        Ok(Config {
            max_field_section_size: None,
            qpack_max_table_capacity: None,
            qpack_blocked_streams: None,
            send_settings: true,
            qpack_blocked_timeout: std::time::Duration::from_millis(500),
            transaction_timeout: std::time::Duration::from_secs(5),
            drain_goaway_delay: std::time::Duration::from_millis(50),
        })
    }

    /// Sets the `SETTINGS_MAX_FIELD_SECTION_SIZE` setting.
    ///
    /// By default no limit is enforced.
    pub fn set_max_field_section_size(&mut self, v: u64) {
        self.max_field_section_size = Some(v);
    }

    /// Sets the `SETTINGS_QPACK_MAX_TABLE_CAPACITY` setting.
    pub fn set_qpack_max_table_capacity(&mut self, v: u64) {
        self.qpack_max_table_capacity = Some(v);
    }

    /// Sets the `SETTINGS_QPACK_BLOCKED_STREAMS` setting.
    pub fn set_qpack_blocked_streams(&mut self, v: u64) {
        self.qpack_blocked_streams = Some(v);
    }

    /// Controls whether a SETTINGS frame is emitted on the egress control
    /// stream when the transport becomes ready.
    ///
    /// Disabling this is only useful for testing peer behavior; a session
    /// that never sends SETTINGS is not a conformant HTTP/3 endpoint.
    pub fn set_send_settings(&mut self, v: bool) {
        self.send_settings = v;
    }

    /// Sets how long a header block may stay blocked on QPACK dynamic
    /// table updates before the transaction fails with a decode error.
    pub fn set_qpack_blocked_timeout(&mut self, v: std::time::Duration) {
        self.qpack_blocked_timeout = v;
    }

    /// Sets the per-transaction idle timeout.
    pub fn set_transaction_timeout(&mut self, v: std::time::Duration) {
        self.transaction_timeout = v;
    }

    /// Sets the delay between the two GOAWAY frames emitted when draining.
    pub fn set_drain_goaway_delay(&mut self, v: std::time::Duration) {
        self.drain_goaway_delay = v;
    }
}

/// A trait for types with associated string name and value.
pub trait NameValue {
    /// Returns the object's name.
    fn name(&self) -> &[u8];

    /// Returns the object's value.
    fn value(&self) -> &[u8];
}

impl NameValue for (&str, &str) {
    fn name(&self) -> &[u8] {
        self.0.as_bytes()
    }

    fn value(&self) -> &[u8] {
        self.1.as_bytes()
    }
}

/// An owned name-value pair representing a raw HTTP header.
#[derive(Clone, PartialEq, Eq)]
pub struct Header(Vec<u8>, Vec<u8>);

fn try_print_as_readable(hdr: &[u8], f: &mut std::fmt::Formatter) -> std::fmt::Result {
    match std::str::from_utf8(hdr) {
        Ok(s) => f.write_fmt(format_args!("{s:?}")),
        Err(_) => f.write_fmt(format_args!("{hdr:?}")),
    }
}

impl std::fmt::Debug for Header {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str("\"")?;
        try_print_as_readable(&self.0, f)?;
        f.write_str(": ")?;
        try_print_as_readable(&self.1, f)?;
        f.write_str("\"")
    }
}

impl Header {
    /// Creates a new header from the given name and value.
    pub fn new(name: &[u8], value: &[u8]) -> Self {
        Self(name.to_vec(), value.to_vec())
    }
}

impl NameValue for Header {
    fn name(&self) -> &[u8] {
        &self.0
    }

    fn value(&self) -> &[u8] {
        &self.1
    }
}

/// Returns whether a header list is an interim (1xx) response.
///
/// A response without a `:status` pseudo-header is treated as final.
pub fn is_interim_response(headers: &[Header]) -> bool {
    headers
        .iter()
        .find(|h| h.name() == b":status")
        .map(|h| h.value().first() == Some(&b'1'))
        .unwrap_or(false)
}

pub mod codec;
pub mod frame;
pub mod push;
pub mod testing;
pub mod transaction;
pub mod transport;

mod session;
mod stream;

pub use crate::codec::Decoded;
pub use crate::codec::HeaderDecoder;
pub use crate::codec::HeaderEncoder;
pub use crate::push::PushId;
pub use crate::push::PushLifecycleObserver;
pub use crate::session::ConnectCallback;
pub use crate::session::ConnectionSettings;
pub use crate::session::InfoCallback;
pub use crate::session::ReplaySafetyCallback;
pub use crate::session::Session;
pub use crate::session::SessionState;
pub use crate::session::Txn;
pub use crate::session::MAX_GOAWAY_ID;
pub use crate::transaction::ErrorKind;
pub use crate::transaction::StreamError;
pub use crate::transaction::TransactionHandler;
pub use crate::transport::ConnectionError;
pub use crate::transport::QuicTransport;
pub use crate::transport::TransportErrorCode;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    /// Interim responses are keyed off the `:status` pseudo-header alone.
    fn interim_classification() {
        let cont = vec![Header::new(b":status", b"100")];
        let ok = vec![Header::new(b":status", b"200")];
        let no_status = vec![Header::new(b"x-custom", b"1")];

        assert!(is_interim_response(&cont));
        assert!(!is_interim_response(&ok));
        assert!(!is_interim_response(&no_status));
    }

    #[test]
    /// Every protocol violation maps to its HTTP/3 wire code.
    fn error_to_wire() {
        assert_eq!(
            Error::FrameUnexpected.to_wire(),
            transport::HTTP_UNEXPECTED_FRAME
        );
        assert_eq!(
            Error::MissingSettings.to_wire(),
            transport::HTTP_MISSING_SETTINGS
        );
        assert_eq!(Error::IdError.to_wire(), transport::HTTP_ID_ERROR);
        assert_eq!(
            Error::StreamCreationError.to_wire(),
            transport::HTTP_STREAM_CREATION_ERROR
        );
    }
}

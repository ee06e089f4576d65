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

//! The QUIC transport interface consumed by the session.
//!
//! The session never touches a socket. Everything it needs from QUIC is
//! behind the [`QuicTransport`] trait: opening unidirectional streams,
//! writing stream data, issuing resets, registering delivery callbacks and
//! closing the connection. Transport-originated events flow the other way,
//! into the session's `on_*` entry points.

use std::net::SocketAddr;

// HTTP/3 application error codes, as carried in CONNECTION_CLOSE frames and
// stream resets.
pub const HTTP_NO_ERROR: u64 = 0x100;
pub const HTTP_GENERAL_PROTOCOL_ERROR: u64 = 0x101;
pub const HTTP_INTERNAL_ERROR: u64 = 0x102;
pub const HTTP_STREAM_CREATION_ERROR: u64 = 0x103;
pub const HTTP_CLOSED_CRITICAL_STREAM: u64 = 0x104;
pub const HTTP_UNEXPECTED_FRAME: u64 = 0x105;
pub const HTTP_FRAME_ERROR: u64 = 0x106;
pub const HTTP_EXCESSIVE_LOAD: u64 = 0x107;
pub const HTTP_ID_ERROR: u64 = 0x108;
pub const HTTP_SETTINGS_ERROR: u64 = 0x109;
pub const HTTP_MISSING_SETTINGS: u64 = 0x10A;
pub const HTTP_REQUEST_REJECTED: u64 = 0x10B;
pub const HTTP_REQUEST_CANCELLED: u64 = 0x10C;
pub const HTTP_QPACK_DECOMPRESSION_FAILED: u64 = 0x200;

/// Local error codes reported by the transport for connection-level
/// failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportErrorCode {
    /// The connection attempt failed.
    ConnectFailed,

    /// The transport gave up on 0-RTT and the early data was lost.
    GiveupZeroRtt,

    /// The peer reset the connection.
    ConnectionReset,

    /// The connection sat idle past the negotiated timeout.
    IdleTimeout,

    /// A stream operation failed because the stream does not exist.
    StreamNotExists,

    /// The requested operation is not valid in the current state.
    InvalidOperation,

    /// The write side of a stream entered an error state.
    WriteError,
}

/// A connection-level error reported by the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionError {
    pub code: TransportErrorCode,
    pub reason: String,
}

impl ConnectionError {
    pub fn new(code: TransportErrorCode, reason: &str) -> Self {
        ConnectionError {
            code,
            reason: reason.to_string(),
        }
    }
}

/// The result type for transport operations.
pub type TransportResult<T> = std::result::Result<T, TransportErrorCode>;

/// The QUIC connection surface the session drives.
///
/// Implementations must tolerate duplicate `reset_stream()` calls for the
/// same stream; the session retries a reset once when the first attempt is
/// deferred by write backpressure.
pub trait QuicTransport {
    /// The local address the connection is bound to.
    fn local_addr(&self) -> SocketAddr;

    /// The peer's address.
    fn peer_addr(&self) -> SocketAddr;

    /// The negotiated ALPN protocol.
    fn app_protocol(&self) -> Vec<u8>;

    /// Whether the underlying socket is usable.
    fn good(&self) -> bool;

    /// Whether the transport is past the 0-RTT replay window.
    fn replay_safe(&self) -> bool;

    /// Opens a new locally-initiated unidirectional stream and returns its
    /// ID.
    fn open_uni_stream(&mut self) -> TransportResult<u64>;

    /// Writes data on a stream, optionally finishing it.
    fn stream_send(
        &mut self, stream_id: u64, data: &[u8], fin: bool,
    ) -> TransportResult<usize>;

    /// Resets the sending side of a stream with the given application
    /// error code.
    fn reset_stream(
        &mut self, stream_id: u64, error_code: u64,
    ) -> TransportResult<()>;

    /// Asks the peer to stop sending on a stream.
    fn stop_sending(
        &mut self, stream_id: u64, error_code: u64,
    ) -> TransportResult<()>;

    /// Registers for a delivery acknowledgement once all stream data up to
    /// `offset` has been acknowledged by the peer.
    fn register_delivery_callback(
        &mut self, stream_id: u64, offset: u64,
    ) -> TransportResult<()>;

    /// Cancels all delivery callbacks registered on a stream.
    fn cancel_delivery_callbacks(&mut self, stream_id: u64);

    /// Advances the receive offset of a stream past rejected body bytes,
    /// informing the peer.
    fn reject_data(
        &mut self, stream_id: u64, new_read_offset: u64,
    ) -> TransportResult<()>;

    /// Closes the connection with an application error code and reason.
    fn close(&mut self, error_code: u64, reason: &[u8]);
}

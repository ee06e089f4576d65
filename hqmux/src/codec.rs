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

//! QPACK encoder and decoder interfaces.
//!
//! Header compression itself is not implemented here; the session consumes
//! an encoder and a decoder through these traits and takes care of the
//! *gating*: header blocks whose required insert count is ahead of the
//! decoder's dynamic table state are held back until encoder stream bytes
//! catch up, or a timeout fires.

use crate::Header;
use crate::Result;

/// The outcome of decoding a header block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decoded {
    /// The block decoded into a header list.
    ///
    /// When `ack` is set the block referenced the dynamic table and the
    /// session must emit a section acknowledgement on the QPACK decoder
    /// stream.
    Fields { fields: Vec<Header>, ack: bool },

    /// The block requires dynamic table state the decoder does not have
    /// yet.
    Blocked { required_insert_count: u64 },
}

/// The QPACK encoder half, used for egress header blocks.
pub trait HeaderEncoder {
    /// Encodes a header list into a header block.
    fn encode(&mut self, headers: &[Header]) -> Result<Vec<u8>>;

    /// Takes encoder stream instructions produced by preceding
    /// [`encode()`](Self::encode) calls, to be written on the local QPACK
    /// encoder stream.
    fn take_stream_bytes(&mut self) -> Vec<u8> {
        Vec::new()
    }

    /// Feeds bytes arriving on the peer's QPACK decoder stream (section
    /// acknowledgements and stream cancellations).
    fn on_decoder_stream(&mut self, data: &[u8]) -> Result<()>;
}

/// The QPACK decoder half, used for ingress header blocks.
pub trait HeaderDecoder {
    /// Decodes a header block received on `stream_id`.
    fn decode(&mut self, stream_id: u64, block: &[u8]) -> Result<Decoded>;

    /// Feeds bytes arriving on the peer's QPACK encoder stream, advancing
    /// the dynamic table.
    fn on_encoder_stream(&mut self, data: &[u8]) -> Result<()>;

    /// The number of dynamic table insertions known to the decoder.
    fn known_insert_count(&self) -> u64;

    /// Produces the decoder stream record cancelling a blocked stream.
    fn cancel_stream(&mut self, stream_id: u64) -> Vec<u8>;

    /// Produces the decoder stream record acknowledging a decoded section.
    fn ack_section(&mut self, stream_id: u64) -> Vec<u8>;
}

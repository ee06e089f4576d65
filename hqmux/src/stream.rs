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

use std::collections::HashMap;
use std::collections::VecDeque;

use crate::frame;
use crate::Error;
use crate::Result;

pub const HTTP3_CONTROL_STREAM_TYPE_ID: u64 = 0x0;
pub const HTTP3_PUSH_STREAM_TYPE_ID: u64 = 0x1;
pub const QPACK_ENCODER_STREAM_TYPE_ID: u64 = 0x2;
pub const QPACK_DECODER_STREAM_TYPE_ID: u64 = 0x3;

const MAX_STATE_BUF_SIZE: usize = (1 << 24) - 1;

/// Returns whether the stream ID belongs to a bidirectional stream.
pub fn is_bidi(stream_id: u64) -> bool {
    (stream_id & 0x2) == 0
}

/// Returns whether the stream was initiated by the server.
pub fn is_server_initiated(stream_id: u64) -> bool {
    (stream_id & 0x1) == 1
}

/// A no-op hasher for stream IDs.
///
/// The QUIC transport guarantees stream ID uniqueness, so we can save
/// effort by avoiding a real hashing algorithm.
#[derive(Default)]
pub struct StreamIdHasher {
    id: u64,
}

impl std::hash::Hasher for StreamIdHasher {
    #[inline]
    fn finish(&self) -> u64 {
        self.id
    }

    #[inline]
    fn write_u64(&mut self, id: u64) {
        self.id = id;
    }

    #[inline]
    fn write(&mut self, _: &[u8]) {
        // We need a default write() for the trait but stream IDs will always
        // be a u64 so we just delegate to write_u64.
        unimplemented!()
    }
}

type BuildStreamIdHasher = std::hash::BuildHasherDefault<StreamIdHasher>;

pub type StreamIdHashMap<V> = HashMap<u64, V, BuildStreamIdHasher>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Type {
    Control,
    Request,
    Push,
    QpackEncoder,
    QpackDecoder,
    Unknown,
}

impl Type {
    pub fn deserialize(v: u64) -> Type {
        match v {
            HTTP3_CONTROL_STREAM_TYPE_ID => Type::Control,
            HTTP3_PUSH_STREAM_TYPE_ID => Type::Push,
            QPACK_ENCODER_STREAM_TYPE_ID => Type::QpackEncoder,
            QPACK_DECODER_STREAM_TYPE_ID => Type::QpackDecoder,

            _ => Type::Unknown,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// Reading the stream's type.
    StreamType,

    /// Reading the unframed push ID.
    PushId,

    /// Reading the stream's current frame's type.
    FrameType,

    /// Reading the stream's current frame's payload length.
    FramePayloadLen,

    /// Reading the stream's current frame's payload.
    FramePayload,

    /// Reading DATA payload.
    Data,

    /// Reading unframed body bytes of a partially reliable exchange.
    PrBody,

    /// Reading QPACK instructions.
    QpackInstruction,

    /// Reading and discarding data.
    Drain,

    /// All data has been read.
    Finished,
}

/// The HTTP/3 wire state of a single transport stream.
///
/// Bytes delivered by the transport are buffered in an internal queue, and
/// a number of them, depending on the current state, is moved into a "state
/// buffer". This intermediate buffering is required because data arriving
/// from the transport might not be complete (e.g. a varint might be split
/// across multiple read events).
///
/// When enough data to complete the current state has been buffered, it is
/// consumed from the state buffer and the stream transitions to the next
/// state (see `State` for the list of possible states).
#[derive(Debug)]
pub struct Stream {
    /// The corresponding transport stream's ID.
    id: u64,

    /// The stream's type (if known).
    ty: Option<Type>,

    /// The current stream state.
    state: State,

    /// Bytes received from the transport and not yet consumed.
    recv: VecDeque<u8>,

    /// Whether the transport stream was finished by the peer.
    fin_received: bool,

    /// The buffer holding partial data for the current state.
    state_buf: Vec<u8>,

    /// The expected amount of bytes required to complete the state.
    state_len: usize,

    /// The write offset in the state buffer, that is, how many bytes have
    /// already been consumed from the transport for the current state.
    state_off: usize,

    /// The type of the frame currently being parsed.
    frame_type: Option<u64>,

    /// Whether the stream was created locally, or by the peer.
    is_local: bool,

    /// Whether the stream has been remotely initialized (first SETTINGS on
    /// control streams, first HEADERS on request streams).
    remote_initialized: bool,

    /// The push ID decoded from the stream preface, if any.
    push_id: Option<u64>,

    /// Total bytes consumed from the wire start of the stream, including
    /// bytes declared skipped by the peer.
    consumed: u64,

    /// The wire offset where the unframed partially-reliable body starts.
    pr_body_base: Option<u64>,
}

impl Stream {
    /// Creates a new HTTP/3 stream.
    ///
    /// The `is_local` parameter indicates whether the stream was created by
    /// the local endpoint, or by the peer.
    pub fn new(id: u64, is_local: bool) -> Stream {
        let (ty, state) = if is_bidi(id) {
            // All bidirectional streams are "request" streams, so we don't
            // need to read the stream type.
            (Some(Type::Request), State::FrameType)
        } else {
            // The stream's type is yet to be determined.
            (None, State::StreamType)
        };

        Stream {
            id,
            ty,

            state,

            recv: VecDeque::new(),
            fin_received: false,

            // Pre-allocate a buffer to avoid multiple tiny early allocations.
            state_buf: vec![0; 16],

            // Expect one byte for the initial state, to parse the initial
            // varint length.
            state_len: 1,
            state_off: 0,

            frame_type: None,

            is_local,
            remote_initialized: false,

            push_id: None,

            consumed: 0,
            pr_body_base: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn ty(&self) -> Option<Type> {
        self.ty
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn push_id(&self) -> Option<u64> {
        self.push_id
    }

    /// Buffers bytes received from the transport.
    pub fn push_data(&mut self, data: &[u8], fin: bool) -> Result<()> {
        // A peer can stall parsing forever by never completing a state, so
        // bound the amount of data buffered for a single state.
        if self.recv.len() + data.len() > MAX_STATE_BUF_SIZE {
            return Err(Error::ExcessiveLoad);
        }

        self.recv.extend(data.iter().copied());

        if fin {
            self.fin_received = true;
        }

        Ok(())
    }

    /// Whether the peer finished the stream.
    pub fn fin_received(&self) -> bool {
        self.fin_received
    }

    /// Whether the stream is finished and all buffered bytes are consumed.
    pub fn is_drained(&self) -> bool {
        self.fin_received && self.recv.is_empty()
    }

    /// Empties the receive queue, accounting the bytes as consumed.
    ///
    /// Used for QPACK and unknown stream types, whose payload is not framed
    /// at the HTTP/3 layer.
    pub fn drain_pending(&mut self) -> Vec<u8> {
        self.consumed += self.recv.len() as u64;
        self.recv.drain(..).collect()
    }

    /// Sets the stream's type and transitions to the next state.
    pub fn set_ty(&mut self, ty: Type) -> Result<()> {
        assert_eq!(self.state, State::StreamType);

        self.ty = Some(ty);

        let state = match ty {
            Type::Control | Type::Request => State::FrameType,

            Type::Push => State::PushId,

            Type::QpackEncoder | Type::QpackDecoder => {
                self.remote_initialized = true;

                State::QpackInstruction
            },

            Type::Unknown => State::Drain,
        };

        self.state_transition(state, 1, true)?;

        Ok(())
    }

    /// Sets the push ID and transitions to the next state.
    pub fn set_push_id(&mut self, id: u64) -> Result<()> {
        assert_eq!(self.state, State::PushId);

        self.push_id = Some(id);

        self.state_transition(State::FrameType, 1, true)?;

        Ok(())
    }

    /// Sets the frame type and transitions to the next state.
    pub fn set_frame_type(&mut self, ty: u64) -> Result<()> {
        assert_eq!(self.state, State::FrameType);

        // Only expect frames on Control, Request and Push streams.
        match self.ty {
            Some(Type::Control) => {
                // Control stream starts uninitialized and only SETTINGS is
                // accepted in that state. Other frames cause an error. Once
                // initialized, no more SETTINGS are permitted.
                match (ty, self.remote_initialized) {
                    // Initialize control stream.
                    (frame::SETTINGS_FRAME_TYPE_ID, false) =>
                        self.remote_initialized = true,

                    // Non-SETTINGS frames not allowed on control stream
                    // before initialization.
                    (_, false) => return Err(Error::MissingSettings),

                    // Additional SETTINGS frame.
                    (frame::SETTINGS_FRAME_TYPE_ID, true) =>
                        return Err(Error::FrameUnexpected),

                    // Frames that can't be received on control stream
                    // after initialization.
                    (frame::DATA_FRAME_TYPE_ID, true) =>
                        return Err(Error::FrameUnexpected),

                    (frame::HEADERS_FRAME_TYPE_ID, true) =>
                        return Err(Error::FrameUnexpected),

                    (frame::PUSH_PROMISE_FRAME_TYPE_ID, true) =>
                        return Err(Error::FrameUnexpected),

                    // All other frames are ignored after initialization.
                    (_, true) => (),
                }
            },

            Some(Type::Request) if self.is_local => {
                // Response starts uninitialized and only HEADERS is
                // accepted. Other frames cause an error.
                match (ty, self.remote_initialized) {
                    (frame::HEADERS_FRAME_TYPE_ID, false) =>
                        self.remote_initialized = true,

                    (frame::DATA_FRAME_TYPE_ID, false) =>
                        return Err(Error::FrameUnexpected),

                    (frame::CANCEL_PUSH_FRAME_TYPE_ID, _) =>
                        return Err(Error::FrameUnexpected),

                    (frame::SETTINGS_FRAME_TYPE_ID, _) =>
                        return Err(Error::FrameUnexpected),

                    (frame::GOAWAY_FRAME_TYPE_ID, _) =>
                        return Err(Error::FrameUnexpected),

                    (frame::MAX_PUSH_FRAME_TYPE_ID, _) =>
                        return Err(Error::FrameUnexpected),

                    // All other frames can be ignored regardless of stream
                    // state.
                    _ => (),
                }
            },

            Some(Type::Push) => {
                match ty {
                    // Frames that can never be received on push streams.
                    frame::CANCEL_PUSH_FRAME_TYPE_ID =>
                        return Err(Error::FrameUnexpected),

                    frame::SETTINGS_FRAME_TYPE_ID =>
                        return Err(Error::FrameUnexpected),

                    frame::PUSH_PROMISE_FRAME_TYPE_ID =>
                        return Err(Error::FrameUnexpected),

                    frame::GOAWAY_FRAME_TYPE_ID =>
                        return Err(Error::FrameUnexpected),

                    frame::MAX_PUSH_FRAME_TYPE_ID =>
                        return Err(Error::FrameUnexpected),

                    _ => (),
                }
            },

            _ => return Err(Error::FrameUnexpected),
        }

        self.frame_type = Some(ty);

        self.state_transition(State::FramePayloadLen, 1, true)?;

        Ok(())
    }

    /// Sets the frame's payload length and transitions to the next state.
    pub fn set_frame_payload_len(&mut self, len: u64) -> Result<()> {
        assert_eq!(self.state, State::FramePayloadLen);

        // Only expect frames on Control, Request and Push streams.
        if matches!(self.ty, Some(Type::Control | Type::Request | Type::Push)) {
            let (state, resize) = match self.frame_type {
                Some(frame::DATA_FRAME_TYPE_ID) => (State::Data, false),

                // These frame types can never have 0 payload length because
                // they always have fields that must be populated.
                Some(
                    frame::GOAWAY_FRAME_TYPE_ID |
                    frame::PUSH_PROMISE_FRAME_TYPE_ID |
                    frame::CANCEL_PUSH_FRAME_TYPE_ID |
                    frame::MAX_PUSH_FRAME_TYPE_ID,
                ) => {
                    if len == 0 {
                        return Err(Error::FrameError);
                    }

                    (State::FramePayload, true)
                },

                _ => (State::FramePayload, true),
            };

            self.state_transition(state, len as usize, resize)?;

            return Ok(());
        }

        Err(Error::InternalError)
    }

    /// Tries to fill the state buffer from the receive queue.
    ///
    /// When not enough data is buffered to complete the state, this returns
    /// `Error::Done`.
    pub fn try_fill_buffer(&mut self) -> Result<()> {
        // If no bytes are required to be read, return early.
        if self.state_buffer_complete() {
            return Ok(());
        }

        let needed = self.state_len - self.state_off;
        let take = std::cmp::min(needed, self.recv.len());

        for i in 0..take {
            self.state_buf[self.state_off + i] =
                self.recv.pop_front().unwrap();
        }

        self.state_off += take;
        self.consumed += take as u64;

        if !self.state_buffer_complete() {
            return Err(Error::Done);
        }

        Ok(())
    }

    /// Tries to parse a varint (including length) from the state buffer.
    pub fn try_consume_varint(&mut self) -> Result<u64> {
        if self.state_off == 1 {
            self.state_len = octets::varint_parse_len(self.state_buf[0]);
            self.state_buf.resize(self.state_len, 0);
        }

        // Return early if we don't have enough data in the state buffer to
        // parse the whole varint.
        if !self.state_buffer_complete() {
            self.try_fill_buffer()?;
        }

        let varint = octets::Octets::with_slice(&self.state_buf).get_varint()?;

        Ok(varint)
    }

    /// Tries to parse a frame from the state buffer.
    ///
    /// If successful, returns the `frame::Frame` and the payload length.
    pub fn try_consume_frame(&mut self) -> Result<(frame::Frame, u64)> {
        let payload_len = self.state_len as u64;

        let frame = frame::Frame::from_bytes(
            self.frame_type.ok_or(Error::InternalError)?,
            payload_len,
            &self.state_buf,
        )?;

        self.state_transition(State::FrameType, 1, true)?;

        Ok((frame, payload_len))
    }

    /// Tries to read DATA payload from the receive queue.
    pub fn try_consume_data(&mut self, out: &mut [u8]) -> Result<usize> {
        if self.state != State::Data {
            return Err(Error::InternalError);
        }

        let left = std::cmp::min(out.len(), self.state_len - self.state_off);
        let take = std::cmp::min(left, self.recv.len());

        if take == 0 {
            return Err(Error::Done);
        }

        for b in out.iter_mut().take(take) {
            *b = self.recv.pop_front().unwrap();
        }

        self.state_off += take;
        self.consumed += take as u64;

        if self.state_buffer_complete() {
            self.state_transition(State::FrameType, 1, true)?;
        }

        Ok(take)
    }

    /// Switches the stream to unframed partially-reliable body parsing.
    ///
    /// From this point QUIC stream offsets and body offsets advance in
    /// lockstep past the recorded base.
    pub fn enter_pr_body(&mut self) -> Result<()> {
        assert_eq!(self.ty, Some(Type::Request));

        self.pr_body_base = Some(self.consumed);
        self.state_transition(State::PrBody, 0, false)?;

        Ok(())
    }

    /// The current body offset of a partially-reliable exchange.
    pub fn pr_body_offset(&self) -> u64 {
        self.consumed - self.pr_body_base.unwrap_or(self.consumed)
    }

    /// The wire offset where the partially-reliable body starts.
    pub fn pr_body_base(&self) -> Option<u64> {
        self.pr_body_base
    }

    /// The wire offset of the next byte expected from the peer.
    pub fn wire_offset(&self) -> u64 {
        self.consumed + self.recv.len() as u64
    }

    /// Tries to read unframed partially-reliable body bytes.
    pub fn try_consume_pr_body(&mut self, out: &mut [u8]) -> Result<usize> {
        if self.state != State::PrBody {
            return Err(Error::InternalError);
        }

        let take = std::cmp::min(out.len(), self.recv.len());

        if take == 0 {
            return Err(Error::Done);
        }

        for b in out.iter_mut().take(take) {
            *b = self.recv.pop_front().unwrap();
        }

        self.consumed += take as u64;

        Ok(take)
    }

    /// Declares the wire range up to `new_wire_off` as never arriving.
    ///
    /// Returns the new body offset on success, or `Error::Done` when the
    /// offset does not advance past the data already received (a stale or
    /// corrupt peer offset, which the caller treats as a soft error).
    pub fn skip_ahead(&mut self, new_wire_off: u64) -> Result<u64> {
        if self.state != State::PrBody {
            return Err(Error::InternalError);
        }

        if new_wire_off <= self.wire_offset() {
            return Err(Error::Done);
        }

        let delta = new_wire_off - self.wire_offset();
        self.consumed += delta;

        Ok(self.pr_body_offset())
    }

    /// Advances past rejected body bytes on the receiver side.
    pub fn advance_to(&mut self, new_wire_off: u64) -> Result<u64> {
        self.skip_ahead(new_wire_off)
    }

    /// Marks the stream as finished.
    pub fn finished(&mut self) {
        let _ = self.state_transition(State::Finished, 0, false);
    }

    /// Returns true if the state buffer has enough data to complete the
    /// state.
    fn state_buffer_complete(&self) -> bool {
        self.state_off == self.state_len
    }

    /// Transitions the stream to a new state, and optionally resets the
    /// state buffer.
    fn state_transition(
        &mut self, new_state: State, expected_len: usize, resize: bool,
    ) -> Result<()> {
        // Some states don't need the state buffer, so don't resize it if not
        // necessary.
        if resize {
            // A peer can influence the size of the state buffer (e.g. with
            // the payload size of an unknown frame), so we need to limit the
            // maximum size to avoid DoS.
            if expected_len > MAX_STATE_BUF_SIZE {
                return Err(Error::ExcessiveLoad);
            }

            self.state_buf.resize(expected_len, 0);
        }

        self.state = new_state;
        self.state_off = 0;
        self.state_len = expected_len;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::*;

    fn open_uni(ty: u64) -> (Stream, Vec<u8>) {
        let stream = Stream::new(3, false);
        assert_eq!(stream.state, State::StreamType);

        let mut d = vec![0; 8];
        let mut b = octets::OctetsMut::with_slice(&mut d);
        b.put_varint(ty).unwrap();
        let off = b.off();
        d.truncate(off);

        (stream, d)
    }

    fn parse_uni(stream: &mut Stream, ty: u64) {
        stream.try_fill_buffer().unwrap();

        let stream_ty = stream.try_consume_varint().unwrap();
        assert_eq!(stream_ty, ty);
        stream.set_ty(Type::deserialize(stream_ty)).unwrap();
    }

    fn parse_skip_frame(stream: &mut Stream) {
        stream.try_fill_buffer().unwrap();

        let frame_ty = stream.try_consume_varint().unwrap();
        stream.set_frame_type(frame_ty).unwrap();
        assert_eq!(stream.state, State::FramePayloadLen);

        stream.try_fill_buffer().unwrap();

        let frame_payload_len = stream.try_consume_varint().unwrap();
        stream.set_frame_payload_len(frame_payload_len).unwrap();

        stream.try_fill_buffer().unwrap();
        stream.try_consume_frame().unwrap();
        assert_eq!(stream.state, State::FrameType);
    }

    fn settings_frame() -> Frame {
        Frame::Settings {
            max_field_section_size: Some(0),
            qpack_max_table_capacity: Some(0),
            qpack_blocked_streams: Some(0),
            raw: Some(vec![
                (SETTINGS_MAX_FIELD_SECTION_SIZE, 0),
                (SETTINGS_QPACK_MAX_TABLE_CAPACITY, 0),
                (SETTINGS_QPACK_BLOCKED_STREAMS, 0),
            ]),
        }
    }

    fn serialize(frame: &Frame) -> Vec<u8> {
        let mut d = vec![0; 128];
        let mut b = octets::OctetsMut::with_slice(&mut d);
        frame.to_bytes(&mut b).unwrap();
        let off = b.off();
        d.truncate(off);
        d
    }

    #[test]
    /// Process incoming SETTINGS frame on control stream.
    fn control_good() {
        let frame = settings_frame();

        let (mut stream, preface) = open_uni(HTTP3_CONTROL_STREAM_TYPE_ID);
        stream.push_data(&preface, false).unwrap();
        stream.push_data(&serialize(&frame), false).unwrap();

        parse_uni(&mut stream, HTTP3_CONTROL_STREAM_TYPE_ID);
        assert_eq!(stream.state, State::FrameType);

        stream.try_fill_buffer().unwrap();
        let frame_ty = stream.try_consume_varint().unwrap();
        assert_eq!(frame_ty, SETTINGS_FRAME_TYPE_ID);

        stream.set_frame_type(frame_ty).unwrap();
        assert_eq!(stream.state, State::FramePayloadLen);

        stream.try_fill_buffer().unwrap();
        let frame_payload_len = stream.try_consume_varint().unwrap();
        stream.set_frame_payload_len(frame_payload_len).unwrap();
        assert_eq!(stream.state, State::FramePayload);

        stream.try_fill_buffer().unwrap();
        assert_eq!(stream.try_consume_frame(), Ok((frame, 6)));
        assert_eq!(stream.state, State::FrameType);
    }

    #[test]
    /// Process duplicate SETTINGS frame on control stream.
    fn control_bad_multiple_settings() {
        let frame = settings_frame();

        let (mut stream, preface) = open_uni(HTTP3_CONTROL_STREAM_TYPE_ID);
        stream.push_data(&preface, false).unwrap();
        stream.push_data(&serialize(&frame), false).unwrap();
        stream.push_data(&serialize(&frame), false).unwrap();

        parse_uni(&mut stream, HTTP3_CONTROL_STREAM_TYPE_ID);
        parse_skip_frame(&mut stream);

        stream.try_fill_buffer().unwrap();
        let frame_ty = stream.try_consume_varint().unwrap();
        assert_eq!(stream.set_frame_type(frame_ty), Err(Error::FrameUnexpected));
    }

    #[test]
    /// Process other frame before SETTINGS frame on control stream.
    fn control_bad_late_settings() {
        let goaway = Frame::GoAway { id: 0 };

        let (mut stream, preface) = open_uni(HTTP3_CONTROL_STREAM_TYPE_ID);
        stream.push_data(&preface, false).unwrap();
        stream.push_data(&serialize(&goaway), false).unwrap();
        stream
            .push_data(&serialize(&settings_frame()), false)
            .unwrap();

        parse_uni(&mut stream, HTTP3_CONTROL_STREAM_TYPE_ID);

        stream.try_fill_buffer().unwrap();
        let frame_ty = stream.try_consume_varint().unwrap();
        assert_eq!(stream.set_frame_type(frame_ty), Err(Error::MissingSettings));
    }

    #[test]
    fn request_no_data() {
        let mut stream = Stream::new(0, true);

        assert_eq!(stream.ty, Some(Type::Request));
        assert_eq!(stream.state, State::FrameType);

        assert_eq!(stream.try_consume_varint(), Err(Error::Done));
    }

    #[test]
    fn request_good() {
        let mut stream = Stream::new(0, true);

        let payload = vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12];
        let hdrs = Frame::Headers {
            header_block: vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12],
        };
        let data = Frame::Data {
            payload: payload.clone(),
        };

        stream.push_data(&serialize(&hdrs), false).unwrap();
        stream.push_data(&serialize(&data), false).unwrap();

        stream.try_fill_buffer().unwrap();
        let frame_ty = stream.try_consume_varint().unwrap();
        assert_eq!(frame_ty, HEADERS_FRAME_TYPE_ID);

        stream.set_frame_type(frame_ty).unwrap();

        stream.try_fill_buffer().unwrap();
        let frame_payload_len = stream.try_consume_varint().unwrap();
        stream.set_frame_payload_len(frame_payload_len).unwrap();

        stream.try_fill_buffer().unwrap();
        assert_eq!(stream.try_consume_frame(), Ok((hdrs, 12)));

        stream.try_fill_buffer().unwrap();
        let frame_ty = stream.try_consume_varint().unwrap();
        assert_eq!(frame_ty, DATA_FRAME_TYPE_ID);

        stream.set_frame_type(frame_ty).unwrap();

        stream.try_fill_buffer().unwrap();
        let frame_payload_len = stream.try_consume_varint().unwrap();
        stream.set_frame_payload_len(frame_payload_len).unwrap();
        assert_eq!(stream.state, State::Data);

        let mut recv_buf = vec![0; payload.len()];
        assert_eq!(stream.try_consume_data(&mut recv_buf), Ok(payload.len()));
        assert_eq!(payload, recv_buf);

        assert_eq!(stream.state, State::FrameType);
    }

    #[test]
    /// DATA before HEADERS on a response is rejected.
    fn data_before_headers() {
        let mut stream = Stream::new(0, true);

        let data = Frame::Data {
            payload: vec![1, 2, 3, 4],
        };

        stream.push_data(&serialize(&data), false).unwrap();

        stream.try_fill_buffer().unwrap();
        let frame_ty = stream.try_consume_varint().unwrap();
        assert_eq!(frame_ty, DATA_FRAME_TYPE_ID);

        assert_eq!(stream.set_frame_type(frame_ty), Err(Error::FrameUnexpected));
    }

    #[test]
    /// A push stream preface is followed by the unframed push ID, in any
    /// valid varint encoding.
    fn push_id_encodings() {
        for (encoded, expected) in [
            (vec![0x05], 5u64),
            (vec![0x40, 0x05], 5u64),
            (vec![0x80, 0x00, 0x00, 0x05], 5u64),
            (vec![0xc0, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x05], 5u64),
        ] {
            let (mut stream, preface) = open_uni(HTTP3_PUSH_STREAM_TYPE_ID);
            stream.push_data(&preface, false).unwrap();

            // Split the push id across two read events to exercise partial
            // varint buffering.
            stream.push_data(&encoded[..1], false).unwrap();

            parse_uni(&mut stream, HTTP3_PUSH_STREAM_TYPE_ID);
            assert_eq!(stream.state, State::PushId);

            if encoded.len() > 1 {
                assert_eq!(stream.try_fill_buffer(), Ok(()));
                assert_eq!(stream.try_consume_varint(), Err(Error::Done));
                stream.push_data(&encoded[1..], false).unwrap();
            }

            stream.try_fill_buffer().unwrap();
            let push_id = stream.try_consume_varint().unwrap();
            assert_eq!(push_id, expected);

            stream.set_push_id(push_id).unwrap();
            assert_eq!(stream.state, State::FrameType);
            assert_eq!(stream.push_id(), Some(expected));
        }
    }

    #[test]
    /// Unknown stream types transition to the drain state.
    fn unknown_stream_type() {
        let (mut stream, preface) = open_uni(33);
        stream.push_data(&preface, false).unwrap();

        stream.try_fill_buffer().unwrap();
        let stream_ty = stream.try_consume_varint().unwrap();
        assert_eq!(stream_ty, 33);
        stream.set_ty(Type::deserialize(stream_ty)).unwrap();
        assert_eq!(stream.state, State::Drain);
    }

    #[test]
    /// A zero-length GOAWAY payload is a frame error.
    fn zero_length_goaway() {
        let (mut stream, preface) = open_uni(HTTP3_CONTROL_STREAM_TYPE_ID);
        stream.push_data(&preface, false).unwrap();
        stream
            .push_data(&serialize(&settings_frame()), false)
            .unwrap();

        // A 0-length payload frame.
        stream
            .push_data(&[GOAWAY_FRAME_TYPE_ID as u8, 0], false)
            .unwrap();

        parse_uni(&mut stream, HTTP3_CONTROL_STREAM_TYPE_ID);
        parse_skip_frame(&mut stream);

        stream.try_fill_buffer().unwrap();
        let frame_ty = stream.try_consume_varint().unwrap();
        assert_eq!(frame_ty, GOAWAY_FRAME_TYPE_ID);

        stream.set_frame_type(frame_ty).unwrap();

        stream.try_fill_buffer().unwrap();
        let frame_payload_len = stream.try_consume_varint().unwrap();
        assert_eq!(
            Err(Error::FrameError),
            stream.set_frame_payload_len(frame_payload_len)
        );
    }

    #[test]
    /// Skipping advances the body offset of a partially reliable stream,
    /// and stale offsets do not.
    fn pr_skip() {
        let mut stream = Stream::new(0, true);

        let hdrs = Frame::Headers {
            header_block: vec![7; 10],
        };
        let wire = serialize(&hdrs);
        let base = wire.len() as u64;
        stream.push_data(&wire, false).unwrap();

        stream.try_fill_buffer().unwrap();
        let frame_ty = stream.try_consume_varint().unwrap();
        stream.set_frame_type(frame_ty).unwrap();
        stream.try_fill_buffer().unwrap();
        let len = stream.try_consume_varint().unwrap();
        stream.set_frame_payload_len(len).unwrap();
        stream.try_fill_buffer().unwrap();
        stream.try_consume_frame().unwrap();

        stream.enter_pr_body().unwrap();
        assert_eq!(stream.pr_body_base(), Some(base));
        assert_eq!(stream.pr_body_offset(), 0);

        stream.push_data(&[0; 42], false).unwrap();
        let mut out = vec![0; 64];
        assert_eq!(stream.try_consume_pr_body(&mut out), Ok(42));
        assert_eq!(stream.pr_body_offset(), 42);

        // Skip the next 42 bytes.
        assert_eq!(stream.skip_ahead(base + 84), Ok(84));
        assert_eq!(stream.pr_body_offset(), 84);

        // A stale offset is reported as no-op.
        assert_eq!(stream.skip_ahead(base + 10), Err(Error::Done));
        assert_eq!(stream.pr_body_offset(), 84);
    }
}

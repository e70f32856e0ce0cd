//! A minimal length-delimited multiplexed wire protocol.
//!
//! Every frame starts with a fixed 10 byte header:
//!
//! ```text
//! +-----------------+--------+---------+------------------+
//! | stream id (u32) | type u8| flags u8| payload len (u32)|
//! +-----------------+--------+---------+------------------+
//! | payload ...                                           |
//! +-------------------------------------------------------+
//! ```
//!
//! Header blocks (HEADERS, TRAILERS) are a sequence of
//! `[u16 name len][name][u16 value len][value]`. RESET carries one byte,
//! the reset reason code. GOAWAY uses stream id 0 and no payload.

use bytes::{Buf, BufMut, BytesMut};

use crate::connection::{Codec, CodecError, WireFrame};
use crate::stream::{Frame, HeaderMap, Protocol, StreamId, StreamResetReason};

pub const HEADER_LEN: usize = 10;
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

const TYPE_HEADERS: u8 = 0x1;
const TYPE_DATA: u8 = 0x2;
const TYPE_TRAILERS: u8 = 0x3;
const TYPE_RESET: u8 = 0x4;
const TYPE_GOAWAY: u8 = 0x5;

const FLAG_END_STREAM: u8 = 0x1;

/// Codec for the framed protocol.
#[derive(Debug, Clone)]
pub struct FramedCodec {
    max_frame_size: usize,
}

impl FramedCodec {
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Limit the payload size accepted and produced.
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    fn check_len(&self, len: usize) -> Result<(), CodecError> {
        if len > self.max_frame_size {
            return Err(CodecError::FrameTooLarge {
                len,
                max: self.max_frame_size,
            });
        }
        Ok(())
    }
}

impl Default for FramedCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec for FramedCodec {
    fn protocol(&self) -> Protocol {
        Protocol::FRAMED
    }

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<WireFrame>, CodecError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut header = &src[..HEADER_LEN];
        let raw_id = header.get_u32();
        let frame_type = header.get_u8();
        let flags = header.get_u8();
        let len = header.get_u32() as usize;
        self.check_len(len)?;

        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }
        src.advance(HEADER_LEN);
        let mut payload = src.split_to(len);

        let id = StreamId::new(u64::from(raw_id));
        let end_stream = flags & FLAG_END_STREAM != 0;
        if frame_type != TYPE_GOAWAY && raw_id == 0 {
            return Err(CodecError::ReservedStreamId);
        }

        let frame = match frame_type {
            TYPE_HEADERS => WireFrame::Stream {
                id,
                frame: Frame::Headers {
                    headers: decode_header_block(&mut payload, "headers")?,
                    end_stream,
                },
            },
            TYPE_DATA => WireFrame::Stream {
                id,
                frame: Frame::Data { data: payload, end_stream },
            },
            TYPE_TRAILERS => WireFrame::Stream {
                id,
                frame: Frame::Trailers(decode_header_block(&mut payload, "trailers")?),
            },
            TYPE_RESET => {
                if payload.len() != 1 {
                    return Err(CodecError::Malformed("reset"));
                }
                let reason = StreamResetReason::from_code(payload[0]).ok_or(CodecError::Malformed("reset"))?;
                WireFrame::Reset { id, reason }
            }
            TYPE_GOAWAY => WireFrame::GoAway,
            other => return Err(CodecError::UnknownFrameType(other)),
        };
        Ok(Some(frame))
    }

    fn encode(&mut self, frame: &WireFrame, dst: &mut BytesMut) -> Result<(), CodecError> {
        match frame {
            WireFrame::Stream { id, frame } => {
                let raw_id = wire_id(*id)?;
                match frame {
                    Frame::Headers { headers, end_stream } => {
                        let block = encode_header_block(headers)?;
                        self.put_frame(dst, raw_id, TYPE_HEADERS, *end_stream, &block)
                    }
                    Frame::Data { data, end_stream } => self.put_data(dst, raw_id, *end_stream, data),
                    Frame::Trailers(trailers) => {
                        let block = encode_header_block(trailers)?;
                        self.put_frame(dst, raw_id, TYPE_TRAILERS, true, &block)
                    }
                }
            }
            WireFrame::Reset { id, reason } => {
                let raw_id = wire_id(*id)?;
                self.put_frame(dst, raw_id, TYPE_RESET, false, &[reason.code()])
            }
            WireFrame::GoAway => self.put_frame(dst, 0, TYPE_GOAWAY, false, &[]),
        }
    }
}

impl FramedCodec {
    /// Data larger than one frame goes out as several frames. Only the last
    /// one carries the end-of-stream flag.
    fn put_data(&self, dst: &mut BytesMut, raw_id: u32, end_stream: bool, data: &[u8]) -> Result<(), CodecError> {
        if data.len() <= self.max_frame_size || self.max_frame_size == 0 {
            return self.put_frame(dst, raw_id, TYPE_DATA, end_stream, data);
        }
        let mut chunks = data.chunks(self.max_frame_size).peekable();
        while let Some(chunk) = chunks.next() {
            let last = chunks.peek().is_none();
            self.put_frame(dst, raw_id, TYPE_DATA, end_stream && last, chunk)?;
        }
        Ok(())
    }

    fn put_frame(
        &self,
        dst: &mut BytesMut,
        raw_id: u32,
        frame_type: u8,
        end_stream: bool,
        payload: &[u8],
    ) -> Result<(), CodecError> {
        self.check_len(payload.len())?;
        let len = u32::try_from(payload.len()).map_err(|_| CodecError::FrameTooLarge {
            len: payload.len(),
            max: self.max_frame_size,
        })?;

        dst.reserve(HEADER_LEN + payload.len());
        dst.put_u32(raw_id);
        dst.put_u8(frame_type);
        dst.put_u8(if end_stream { FLAG_END_STREAM } else { 0 });
        dst.put_u32(len);
        dst.put_slice(payload);
        Ok(())
    }
}

fn wire_id(id: StreamId) -> Result<u32, CodecError> {
    match u32::try_from(id.as_u64()) {
        Ok(0) => Err(CodecError::ReservedStreamId),
        Ok(raw) => Ok(raw),
        Err(_) => Err(CodecError::StreamIdOutOfRange(id.as_u64())),
    }
}

fn encode_header_block(headers: &HeaderMap) -> Result<BytesMut, CodecError> {
    let mut block = BytesMut::new();
    for (name, value) in headers {
        for part in [name, value] {
            let len = u16::try_from(part.len()).map_err(|_| CodecError::Malformed("headers"))?;
            block.put_u16(len);
            block.put_slice(part.as_bytes());
        }
    }
    Ok(block)
}

fn decode_header_block(payload: &mut BytesMut, what: &'static str) -> Result<HeaderMap, CodecError> {
    let mut headers = HeaderMap::new();
    while payload.has_remaining() {
        let name = read_string(payload, what)?;
        let value = read_string(payload, what)?;
        headers.insert(name, value);
    }
    Ok(headers)
}

fn read_string(payload: &mut BytesMut, what: &'static str) -> Result<String, CodecError> {
    if payload.remaining() < 2 {
        return Err(CodecError::Malformed(what));
    }
    let len = payload.get_u16() as usize;
    if payload.remaining() < len {
        return Err(CodecError::Malformed(what));
    }
    let raw = payload.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| CodecError::Malformed(what))
}

//! Frame codec for the gateway transport.
//!
//! Text frames are complete JSON payloads. Binary frames carry a zlib stream
//! shared by the whole connection: a message may span several frames and is
//! complete only when the buffered bytes end with the sync-flush marker
//! `00 00 FF FF`. The inflate context is never reset between messages, so a
//! decoder must live exactly as long as its connection.

use flate2::{Compress, Compression as Level, Decompress, FlushCompress, FlushDecompress, Status};

use crate::error::DecodeError;
use crate::gateway::protocol::GatewayPayload;

/// Trailer of every complete zlib-stream message.
pub const ZLIB_SUFFIX: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

const MIN_GROWTH: usize = 4096;

/// Reassembles and decodes inbound frames for one connection.
pub struct FrameDecoder {
    buffer: Vec<u8>,
    inflater: Decompress,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            inflater: Decompress::new(true),
        }
    }

    /// Bytes held for an incomplete binary message.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Feed one frame. Returns `Ok(None)` while a binary message is still incomplete.
    pub fn feed(&mut self, chunk: &[u8], is_binary: bool) -> Result<Option<GatewayPayload>, DecodeError> {
        if !is_binary {
            return Ok(Some(serde_json::from_slice(chunk)?));
        }
        self.buffer.extend_from_slice(chunk);
        if !self.buffer.ends_with(&ZLIB_SUFFIX) {
            return Ok(None);
        }
        let inflated = self.inflate();
        self.buffer.clear();
        let inflated = inflated?;
        Ok(Some(serde_json::from_slice(&inflated)?))
    }

    fn inflate(&mut self) -> Result<Vec<u8>, DecodeError> {
        let mut out = Vec::with_capacity(self.buffer.len().saturating_mul(4).max(MIN_GROWTH));
        let mut offset = 0;
        loop {
            if out.len() == out.capacity() {
                out.reserve(out.capacity().max(MIN_GROWTH));
            }
            let in_before = self.inflater.total_in();
            let out_before = self.inflater.total_out();
            let status =
                self.inflater
                    .decompress_vec(&self.buffer[offset..], &mut out, FlushDecompress::Sync)?;
            let consumed = (self.inflater.total_in() - in_before) as usize;
            let produced = self.inflater.total_out() - out_before;
            offset += consumed;

            let input_done = offset >= self.buffer.len();
            if input_done && out.len() < out.capacity() {
                break;
            }
            if status == Status::StreamEnd {
                break;
            }
            if consumed == 0 && produced == 0 && out.len() < out.capacity() {
                return Err(DecodeError::Stalled);
            }
        }
        Ok(out)
    }
}

/// Outbound counterpart of [`FrameDecoder`]. Binary output is a continuation of
/// one zlib stream, each message sync-flushed so it ends with [`ZLIB_SUFFIX`].
pub struct FrameEncoder {
    deflater: Compress,
}

impl Default for FrameEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameEncoder {
    pub fn new() -> Self {
        Self {
            deflater: Compress::new(Level::default(), true),
        }
    }

    pub fn encode_text(&self, payload: &GatewayPayload) -> Result<String, DecodeError> {
        Ok(serde_json::to_string(payload)?)
    }

    pub fn encode_binary(&mut self, payload: &GatewayPayload) -> Result<Vec<u8>, DecodeError> {
        let input = serde_json::to_vec(payload)?;
        self.deflate(&input)
    }

    fn deflate(&mut self, input: &[u8]) -> Result<Vec<u8>, DecodeError> {
        let mut out = Vec::with_capacity(input.len() / 2 + 64);
        let mut offset = 0;
        loop {
            if out.len() == out.capacity() {
                out.reserve(out.capacity().max(MIN_GROWTH));
            }
            let in_before = self.deflater.total_in();
            self.deflater
                .compress_vec(&input[offset..], &mut out, FlushCompress::Sync)?;
            offset += (self.deflater.total_in() - in_before) as usize;
            // a sync flush is complete once all input is taken and output space is left over
            if offset >= input.len() && out.len() < out.capacity() {
                break;
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::protocol::OpCode;
    use serde_json::json;

    fn dispatch(seq: u64) -> GatewayPayload {
        GatewayPayload {
            op: OpCode::Dispatch as u8,
            d: json!({ "content": "hello".repeat(40), "id": seq.to_string() }),
            s: Some(seq),
            t: Some("MESSAGE_CREATE".into()),
        }
    }

    #[test]
    fn text_frames_decode_directly() {
        let mut dec = FrameDecoder::new();
        let p = dec
            .feed(br#"{"op":10,"d":{"heartbeat_interval":41250}}"#, false)
            .expect("decode")
            .expect("complete");
        assert_eq!(p.opcode(), Some(OpCode::Hello));
        assert_eq!(p.d["heartbeat_interval"], 41250);
    }

    #[test]
    fn compressed_frame_ends_with_flush_marker() {
        let mut enc = FrameEncoder::new();
        let bytes = enc.encode_binary(&dispatch(1)).expect("encode");
        assert!(bytes.ends_with(&ZLIB_SUFFIX));
    }

    #[test]
    fn splitting_a_frame_does_not_change_the_result() {
        let mut enc = FrameEncoder::new();
        let bytes = enc.encode_binary(&dispatch(1)).expect("encode");

        let mut whole = FrameDecoder::new();
        let expected = whole.feed(&bytes, true).expect("decode").expect("complete");

        for n in [2, 3, 7, bytes.len()] {
            let mut dec = FrameDecoder::new();
            let size = bytes.len().div_ceil(n);
            let chunks: Vec<&[u8]> = bytes.chunks(size).collect();
            let (last, head) = chunks.split_last().expect("chunks");
            for c in head {
                assert!(dec.feed(c, true).expect("partial").is_none());
            }
            let got = dec.feed(last, true).expect("decode").expect("complete");
            assert_eq!(got, expected, "split into {} chunks", n);
            assert_eq!(dec.pending(), 0);
        }
    }

    #[test]
    fn partial_frame_is_retained() {
        let mut enc = FrameEncoder::new();
        let bytes = enc.encode_binary(&dispatch(1)).expect("encode");
        let mut dec = FrameDecoder::new();
        assert!(dec.feed(&bytes[..bytes.len() - 4], true).expect("partial").is_none());
        assert_eq!(dec.pending(), bytes.len() - 4);
        let p = dec.feed(&bytes[bytes.len() - 4..], true).expect("decode");
        assert_eq!(p, Some(dispatch(1)));
    }

    #[test]
    fn inflate_context_persists_across_messages() {
        let mut enc = FrameEncoder::new();
        let first = enc.encode_binary(&dispatch(1)).expect("encode");
        let second = enc.encode_binary(&dispatch(2)).expect("encode");

        let mut dec = FrameDecoder::new();
        assert_eq!(dec.feed(&first, true).expect("first"), Some(dispatch(1)));
        assert_eq!(dec.feed(&second, true).expect("second"), Some(dispatch(2)));

        // the second message back-references the first, so a fresh context cannot read it
        let mut fresh = FrameDecoder::new();
        assert!(fresh.feed(&second, true).is_err());
    }

    #[test]
    fn malformed_payload_is_an_error() {
        let mut dec = FrameDecoder::new();
        assert!(matches!(dec.feed(b"{\"op\":", false), Err(DecodeError::Json(_))));

        let mut dec = FrameDecoder::new();
        let garbage = [0x12, 0x34, 0x56, 0x00, 0x00, 0xFF, 0xFF];
        assert!(dec.feed(&garbage, true).is_err());
        assert_eq!(dec.pending(), 0);
    }

    #[test]
    fn text_round_trip_is_exact() {
        let original = r#"{"op":0,"d":{"z":1,"a":[true,null],"m":"x"},"s":5,"t":"READY"}"#;
        let mut dec = FrameDecoder::new();
        let p = dec.feed(original.as_bytes(), false).expect("decode").expect("complete");
        assert_eq!(FrameEncoder::new().encode_text(&p).expect("encode"), original);
    }

    #[test]
    fn binary_round_trip_is_exact() {
        let mut enc = FrameEncoder::new();
        let frames: Vec<Vec<u8>> = (1..=3).map(|s| enc.encode_binary(&dispatch(s)).expect("encode")).collect();

        let mut dec = FrameDecoder::new();
        let mut again = FrameEncoder::new();
        for frame in &frames {
            let p = dec.feed(frame, true).expect("decode").expect("complete");
            assert_eq!(&again.encode_binary(&p).expect("re-encode"), frame);
        }
    }
}

// ABOUTME: Newline framing over raw bytes with a per-line size cap.
// ABOUTME: Bad lines become per-frame errors so the stream keeps going after them.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtoError;

/// Splits a byte stream on `\n` without trusting its contents.
///
/// Unlike `LinesCodec`, an overlong line or one that is not UTF-8 is reported
/// as `Ok(Some(Err(..)))`. The decoder itself only fails on I/O, so a
/// `FramedRead` over it keeps yielding frames after malformed input.
#[derive(Debug, Clone)]
pub struct LineCodec {
    max_length: usize,
    /// Bytes already scanned for a newline.
    next_index: usize,
    /// Dropping the rest of an overlong line.
    discarding: bool,
}

impl LineCodec {
    pub fn new(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
            discarding: false,
        }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }
}

fn to_line(bytes: &[u8]) -> Result<String, ProtoError> {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8(bytes.to_vec()).map_err(|e| ProtoError::InvalidEncoding(e.utf8_error()))
}

impl Decoder for LineCodec {
    type Item = Result<String, ProtoError>;
    type Error = std::io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let read_to = buf.len().min(self.max_length.saturating_add(1));
            let newline = buf[self.next_index..read_to]
                .iter()
                .position(|b| *b == b'\n');

            match (self.discarding, newline) {
                (true, Some(offset)) => {
                    buf.advance(self.next_index + offset + 1);
                    self.discarding = false;
                    self.next_index = 0;
                }
                (true, None) => {
                    buf.advance(read_to);
                    self.next_index = 0;
                    if buf.is_empty() {
                        return Ok(None);
                    }
                }
                (false, Some(offset)) => {
                    let end = self.next_index + offset;
                    self.next_index = 0;
                    let line = buf.split_to(end + 1);
                    return Ok(Some(to_line(&line[..end])));
                }
                (false, None) if buf.len() > self.max_length => {
                    self.discarding = true;
                    return Ok(Some(Err(ProtoError::LineTooLong(self.max_length))));
                }
                (false, None) => {
                    self.next_index = read_to;
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }
        self.next_index = 0;
        if self.discarding || buf.is_empty() {
            buf.clear();
            return Ok(None);
        }
        let rest = buf.split_to(buf.len());
        Ok(Some(to_line(&rest)))
    }
}

impl Encoder<String> for LineCodec {
    type Error = std::io::Error;

    fn encode(&mut self, line: String, buf: &mut BytesMut) -> Result<(), Self::Error> {
        buf.reserve(line.len() + 1);
        buf.put_slice(line.as_bytes());
        buf.put_u8(b'\n');
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(codec: &mut LineCodec, buf: &mut BytesMut) -> Vec<Result<String, ProtoError>> {
        let mut out = Vec::new();
        while let Some(frame) = codec.decode(buf).unwrap() {
            out.push(frame);
        }
        out
    }

    #[test]
    fn splits_lines_and_strips_carriage_return() {
        let mut codec = LineCodec::new(64);
        let mut buf = BytesMut::from(&b"one\r\ntwo\nthr"[..]);
        let got = frames(&mut codec, &mut buf);
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].as_ref().unwrap(), "one");
        assert_eq!(got[1].as_ref().unwrap(), "two");

        buf.extend_from_slice(b"ee\n");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().unwrap(), "three");
    }

    #[test]
    fn invalid_utf8_is_a_frame_error() {
        let mut codec = LineCodec::new(64);
        let mut buf = BytesMut::from(&b"\xff\xfe\nok\n"[..]);
        let got = frames(&mut codec, &mut buf);
        assert!(matches!(got[0], Err(ProtoError::InvalidEncoding(_))));
        assert_eq!(got[1].as_ref().unwrap(), "ok");
    }

    #[test]
    fn overlong_line_is_discarded_once() {
        let mut codec = LineCodec::new(4);
        let mut buf = BytesMut::from(&b"abcdefgh"[..]);
        let got = frames(&mut codec, &mut buf);
        assert_eq!(got.len(), 1);
        assert!(matches!(got[0], Err(ProtoError::LineTooLong(4))));

        buf.extend_from_slice(b"ijk\nok\n");
        let got = frames(&mut codec, &mut buf);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].as_ref().unwrap(), "ok");
    }

    #[test]
    fn eof_flushes_unterminated_line() {
        let mut codec = LineCodec::new(64);
        let mut buf = BytesMut::from(&b"tail"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(codec.decode_eof(&mut buf).unwrap().unwrap().unwrap(), "tail");
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }

    #[test]
    fn encode_appends_newline() {
        let mut codec = LineCodec::new(64);
        let mut buf = BytesMut::new();
        codec.encode("{}".to_string(), &mut buf).unwrap();
        assert_eq!(&buf[..], b"{}\n");
    }
}

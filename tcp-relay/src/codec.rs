use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::{config::Framing, error::CodecError};

const HEADER_LEN: usize = 2;

/// Frames relay messages according to the configured [`Framing`].
///
/// Every decoded frame is a freshly split-off buffer of at most `max_len` bytes; nothing from a
/// previous frame can leak into the next one.
#[derive(Debug)]
pub struct RelayCodec {
    framing: Framing,
    max_len: usize,
    length_delimited: LengthDelimitedCodec,
    /// Set once the inner codec has consumed a header and is waiting for its payload.
    mid_frame: bool,
}

impl RelayCodec {
    pub fn new(framing: Framing, max_len: usize) -> Self {
        Self {
            framing,
            max_len,
            length_delimited: LengthDelimitedCodec::builder()
                .length_field_length(HEADER_LEN)
                .max_frame_length(max_len)
                .new_codec(),
            mid_frame: false,
        }
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    fn too_long(&self, len: usize) -> CodecError {
        CodecError::FrameTooLong {
            len,
            max: self.max_len,
        }
    }

    fn decode_length_prefixed(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, CodecError> {
        if !self.mid_frame {
            if src.len() < HEADER_LEN {
                return Ok(None);
            }

            // Only a fresh header is checked here, so the error carries the offending length.
            let len = u16::from_be_bytes([src[0], src[1]]) as usize;
            if len > self.max_len {
                return Err(self.too_long(len));
            }
        }

        // The inner codec advances past the header even when the payload is still in flight.
        let frame = self.length_delimited.decode(src)?;
        self.mid_frame = frame.is_none();
        Ok(frame.map(BytesMut::freeze))
    }

    fn decode_line(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, CodecError> {
        // Room for the payload, an optional '\r' and the '\n'.
        let window = src.len().min(self.max_len + 2);

        match src[..window].iter().position(|b| *b == b'\n') {
            Some(pos) => {
                let mut line = src.split_to(pos + 1);
                line.truncate(pos);
                self.finish_line(line).map(Some)
            }
            None if src.len() > self.max_len + 1 => Err(self.too_long(src.len())),
            None => Ok(None),
        }
    }

    fn finish_line(&self, mut line: BytesMut) -> Result<Bytes, CodecError> {
        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }
        if line.len() > self.max_len {
            return Err(self.too_long(line.len()));
        }
        Ok(line.freeze())
    }

    fn decode_raw(&mut self, src: &mut BytesMut) -> Option<Bytes> {
        if src.is_empty() {
            return None;
        }

        let mut chunk = src.split_to(src.len().min(self.max_len));
        // Legacy peers send C strings; the message ends at the first NUL.
        if let Some(nul) = chunk.iter().position(|b| *b == 0) {
            chunk.truncate(nul);
        }
        Some(chunk.freeze())
    }
}

impl Decoder for RelayCodec {
    type Item = Bytes;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.framing {
            Framing::LengthPrefixed => self.decode_length_prefixed(src),
            Framing::Lines => self.decode_line(src),
            Framing::Raw => Ok(self.decode_raw(src)),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }

        match self.framing {
            // An unterminated final line is still a message.
            Framing::Lines if !src.is_empty() => {
                let line = src.split_to(src.len());
                self.finish_line(line).map(Some)
            }
            Framing::LengthPrefixed if self.mid_frame || !src.is_empty() => Err(CodecError::Io(
                std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("connection closed with {} bytes of a partial frame", src.len()),
                ),
            )),
            _ => Ok(None),
        }
    }
}

impl Encoder<Bytes> for RelayCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > self.max_len {
            return Err(self.too_long(item.len()));
        }

        match self.framing {
            Framing::LengthPrefixed => self.length_delimited.encode(item, dst)?,
            Framing::Lines => {
                dst.reserve(item.len() + 1);
                dst.put_slice(&item);
                dst.put_u8(b'\n');
            }
            Framing::Raw => dst.put_slice(&item),
        }

        Ok(())
    }
}

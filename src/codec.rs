//! Explicit length-prefixed TCP framing for `ClientMessage`.
//!
//! A fixed-size single `read()` call truncates large or fragmented frames,
//! so frames here are self-delimiting instead: a 4-byte big-endian `u32`
//! length prefix followed by that many bytes of `speedy`-encoded payload,
//! read via `Read::read_exact` so a frame split across several TCP
//! segments is still reassembled whole.

use std::io::{self, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use speedy::{Readable, Writable};

use crate::message::ClientMessage;

/// Frames larger than this are rejected as malformed rather than causing an
/// unbounded allocation from a corrupt or hostile length prefix.
pub const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
  #[error("io error: {0}")]
  Io(#[from] io::Error),
  #[error("frame of {0} bytes exceeds the {MAX_FRAME_BYTES} byte limit")]
  TooLarge(u32),
  #[error("speedy decode error: {0}")]
  Decode(#[from] speedy::Error),
}

/// Read one length-prefixed `ClientMessage` frame from `reader`.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<ClientMessage, FrameError> {
  let len = reader.read_u32::<BigEndian>()?;
  if len > MAX_FRAME_BYTES {
    return Err(FrameError::TooLarge(len));
  }
  let mut buf = vec![0u8; len as usize];
  reader.read_exact(&mut buf)?;
  let msg = ClientMessage::read_from_buffer(&buf)?;
  Ok(msg)
}

/// Encode and write one length-prefixed `ClientMessage` frame to `writer`.
pub fn write_frame<W: Write>(writer: &mut W, msg: &ClientMessage) -> Result<(), FrameError> {
  let encoded = msg.write_to_vec()?;
  let len = u32::try_from(encoded.len()).map_err(|_| FrameError::TooLarge(u32::MAX))?;
  writer.write_u32::<BigEndian>(len)?;
  writer.write_all(&encoded)?;
  writer.flush()?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::hlc::HlcTimestamp;
  use crate::message::HlcMessage;
  use std::io::Cursor;
  use uuid::Uuid;

  #[test]
  fn round_trips_producer_handshake() {
    let msg = ClientMessage::producer_handshake(
      "topic",
      "tok",
      HlcMessage::new(Uuid::new_v4(), b"payload".to_vec(), HlcTimestamp::new(42, 1)),
    );

    let mut buf = Vec::new();
    write_frame(&mut buf, &msg).unwrap();

    let mut cursor = Cursor::new(buf);
    let decoded = read_frame(&mut cursor).unwrap();
    assert_eq!(decoded, msg);
  }

  #[test]
  fn reassembles_a_frame_split_across_reads() {
    let msg = ClientMessage::consumer_handshake("t", "", true);
    let mut buf = Vec::new();
    write_frame(&mut buf, &msg).unwrap();

    // Simulate a fragmented TCP stream: a reader that only ever yields a
    // handful of bytes per `read()` call.
    struct Chunked {
      data: Vec<u8>,
      pos: usize,
    }
    impl Read for Chunked {
      fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let n = out.len().min(3).min(self.data.len() - self.pos);
        out[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
      }
    }

    let mut reader = Chunked { data: buf, pos: 0 };
    let decoded = read_frame(&mut reader).unwrap();
    assert_eq!(decoded, msg);
  }

  #[test]
  fn oversized_length_prefix_is_rejected() {
    let mut buf = Vec::new();
    buf.write_u32::<BigEndian>(MAX_FRAME_BYTES + 1).unwrap();
    let mut cursor = Cursor::new(buf);
    let err = read_frame(&mut cursor).unwrap_err();
    assert!(matches!(err, FrameError::TooLarge(_)));
  }
}

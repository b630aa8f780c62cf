//! Length-prefixed message framing over a byte stream.
//!
//! # Wire Format
//!
//! ```text
//! +----------------------------+-----------+-----------+-----+----------------+
//! | Length (4 bytes, BE)       | Frame 0   | Frame 1   | ... | Frame n (<= N) |
//! +----------------------------+-----------+-----------+-----+----------------+
//! ```
//!
//! Every frame but the last is exactly `packet_bytes_length` (N) bytes. The length
//! prefix carries the payload size, so payloads may contain any byte values. The
//! frame size is fixed per connection and must be configured identically on both
//! ends.

use crate::error::{CertificateManagerError, Result};
use std::io::{ErrorKind, Read, Write};

/// Largest logical message either side will send or accept.
pub const MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;

const LENGTH_PREFIX_BYTES: usize = 4;

/// Frames logical messages over `S`.
#[derive(Debug)]
pub struct PacketTransport<S> {
    stream: S,
    packet_bytes_length: usize,
}

impl<S> PacketTransport<S> {
    pub fn new(stream: S, packet_bytes_length: usize) -> Result<Self> {
        if packet_bytes_length == 0 {
            return Err(CertificateManagerError::Configuration(
                "packet_bytes_length must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            stream,
            packet_bytes_length,
        })
    }

    pub fn packet_bytes_length(&self) -> usize {
        self.packet_bytes_length
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S: Write> PacketTransport<S> {
    /// Send `message` as a length prefix followed by fixed-size frames.
    pub fn write_message(&mut self, message: &[u8]) -> Result<()> {
        if message.len() > MAX_MESSAGE_BYTES {
            return Err(CertificateManagerError::Transport(format!(
                "Message of {} bytes exceeds the {} byte limit",
                message.len(),
                MAX_MESSAGE_BYTES
            )));
        }
        let length = message.len() as u32;
        self.stream
            .write_all(&length.to_be_bytes())
            .map_err(|e| CertificateManagerError::transport("Failed to write length prefix", e))?;
        for frame in message.chunks(self.packet_bytes_length) {
            self.stream
                .write_all(frame)
                .map_err(|e| CertificateManagerError::transport("Failed to write frame", e))?;
        }
        self.stream
            .flush()
            .map_err(|e| CertificateManagerError::transport("Failed to flush stream", e))
    }
}

impl<S: Read> PacketTransport<S> {
    /// Read the next complete message.
    ///
    /// Returns `Ok(None)` when the peer closed the stream on a message boundary.
    pub fn try_read_message(&mut self) -> Result<Option<Vec<u8>>> {
        let mut length_buf = [0u8; LENGTH_PREFIX_BYTES];
        let mut filled = 0;
        while filled < LENGTH_PREFIX_BYTES {
            match self.stream.read(&mut length_buf[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => {
                    return Err(CertificateManagerError::Transport(
                        "Stream closed inside length prefix".to_string(),
                    ))
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(CertificateManagerError::transport(
                        "Failed to read length prefix",
                        e,
                    ))
                }
            }
        }

        let length = u32::from_be_bytes(length_buf) as usize;
        if length > MAX_MESSAGE_BYTES {
            return Err(CertificateManagerError::Transport(format!(
                "Declared message length {} exceeds the {} byte limit",
                length, MAX_MESSAGE_BYTES
            )));
        }

        let mut message = vec![0u8; length];
        for frame in message.chunks_mut(self.packet_bytes_length) {
            self.stream.read_exact(frame).map_err(|e| {
                if e.kind() == ErrorKind::UnexpectedEof {
                    CertificateManagerError::Transport(format!(
                        "Stream closed before {} byte message was complete",
                        length
                    ))
                } else {
                    CertificateManagerError::transport("Failed to read frame", e)
                }
            })?;
        }
        Ok(Some(message))
    }

    /// Read the next complete message, treating end-of-stream as an error.
    pub fn read_message(&mut self) -> Result<Vec<u8>> {
        self.try_read_message()?.ok_or_else(|| {
            CertificateManagerError::Transport("Connection closed by peer".to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Records the size of every `write` call.
    #[derive(Default)]
    struct RecordingWriter {
        bytes: Vec<u8>,
        writes: Vec<usize>,
    }

    impl Write for RecordingWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.writes.push(buf.len());
            self.bytes.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn written(messages: &[&[u8]], packet_bytes_length: usize) -> Vec<u8> {
        let mut transport = PacketTransport::new(Vec::new(), packet_bytes_length).unwrap();
        for message in messages {
            transport.write_message(message).unwrap();
        }
        transport.into_inner()
    }

    #[test]
    fn test_zero_packet_length_rejected() {
        assert!(PacketTransport::new(Vec::<u8>::new(), 0).is_err());
    }

    #[test]
    fn test_length_prefix_is_big_endian() {
        let bytes = written(&[&b"abc"[..]], 4096);
        assert_eq!(&bytes[..4], &[0, 0, 0, 3]);
        assert_eq!(&bytes[4..], b"abc");
    }

    #[test]
    fn test_message_is_split_into_fixed_frames() {
        let mut transport = PacketTransport::new(RecordingWriter::default(), 4).unwrap();
        transport.write_message(b"0123456789").unwrap();
        let writer = transport.into_inner();
        // length prefix, then frames of 4, 4 and 2 bytes
        assert_eq!(writer.writes, vec![4, 4, 4, 2]);
        assert_eq!(&writer.bytes[..4], &[0, 0, 0, 10]);
        assert_eq!(&writer.bytes[4..], b"0123456789");
    }

    #[test]
    fn test_exact_multiple_of_frame_size() {
        let mut transport = PacketTransport::new(RecordingWriter::default(), 4).unwrap();
        transport.write_message(b"01234567").unwrap();
        let writer = transport.into_inner();
        assert_eq!(writer.writes, vec![4, 4, 4]);

        let mut reader = PacketTransport::new(Cursor::new(writer.bytes), 4).unwrap();
        assert_eq!(reader.read_message().unwrap(), b"01234567");
        assert!(reader.try_read_message().unwrap().is_none());
    }

    #[test]
    fn test_messages_are_read_in_order() {
        let payload: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let messages: [&[u8]; 3] = [b"first", &payload, b""];
        let bytes = written(&messages, 7);

        let mut reader = PacketTransport::new(Cursor::new(bytes), 7).unwrap();
        assert_eq!(reader.read_message().unwrap(), b"first");
        assert_eq!(reader.read_message().unwrap(), payload);
        assert_eq!(reader.read_message().unwrap(), b"");
        assert!(reader.try_read_message().unwrap().is_none());
    }

    #[test]
    fn test_payload_with_embedded_length_like_bytes() {
        let payload = [0u8, 0, 0, 0, 0xff, 0, 0, 0, 0];
        let bytes = written(&[&payload[..]], 3);
        let mut reader = PacketTransport::new(Cursor::new(bytes), 3).unwrap();
        assert_eq!(reader.read_message().unwrap(), payload);
    }

    #[test]
    fn test_truncated_message_is_transport_error() {
        let mut bytes = written(&[&b"0123456789"[..]], 4);
        bytes.truncate(bytes.len() - 3);
        let mut reader = PacketTransport::new(Cursor::new(bytes), 4).unwrap();
        assert!(matches!(
            reader.read_message(),
            Err(CertificateManagerError::Transport(_))
        ));
    }

    #[test]
    fn test_truncated_length_prefix_is_transport_error() {
        let mut reader = PacketTransport::new(Cursor::new(vec![0u8, 0]), 4).unwrap();
        assert!(matches!(
            reader.try_read_message(),
            Err(CertificateManagerError::Transport(_))
        ));
    }

    #[test]
    fn test_oversized_declared_length_is_rejected() {
        let length = (MAX_MESSAGE_BYTES as u32 + 1).to_be_bytes();
        let mut reader = PacketTransport::new(Cursor::new(length.to_vec()), 4096).unwrap();
        assert!(matches!(
            reader.read_message(),
            Err(CertificateManagerError::Transport(_))
        ));
    }

    #[test]
    fn test_read_on_closed_stream() {
        let mut reader = PacketTransport::new(Cursor::new(Vec::new()), 16).unwrap();
        assert!(reader.try_read_message().unwrap().is_none());
        assert!(reader.read_message().is_err());
    }
}

//! Wire framing. Every frame is a 2-byte little-endian length followed by
//! the packet body (opcode plus payload); the length covers the length
//! field itself. Decoding is incremental: bytes accumulate in a receive
//! buffer and a frame is only consumed once it is complete, so reads may
//! be split at arbitrary points without loss.

use crate::net::cipher::SessionCipher;

pub const FRAME_HEADER_BYTES: usize = 2;
/// A frame must carry at least an opcode byte after the header.
pub const MIN_FRAME_BYTES: usize = FRAME_HEADER_BYTES + 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Length field below the minimum (zero or header-only).
    Runt { len: usize },
    /// Length field exceeds the configured maximum frame size.
    Oversize { len: usize, max: usize },
    /// Encode-side: body does not fit the 16-bit length field or the
    /// configured maximum.
    BodyTooLarge { len: usize, max: usize },
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::Runt { len } => write!(f, "frame length {} below minimum", len),
            FrameError::Oversize { len, max } => {
                write!(f, "frame length {} exceeds max {}", len, max)
            }
            FrameError::BodyTooLarge { len, max } => {
                write!(f, "frame body {} exceeds max {}", len, max)
            }
        }
    }
}

#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_frame: usize,
}

impl FrameDecoder {
    pub fn new(max_frame: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_frame,
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Yields the next complete frame body, deciphering it in place when a
    /// cipher is armed. `Ok(None)` means more bytes are needed; nothing is
    /// consumed until a whole frame is present. A malformed length is
    /// fatal for the connection and leaves the buffer untouched.
    pub fn next_frame(
        &mut self,
        cipher: Option<&mut SessionCipher>,
    ) -> Result<Option<Vec<u8>>, FrameError> {
        if self.buf.len() < FRAME_HEADER_BYTES {
            return Ok(None);
        }
        let len = u16::from_le_bytes([self.buf[0], self.buf[1]]) as usize;
        if len < MIN_FRAME_BYTES {
            return Err(FrameError::Runt { len });
        }
        if len > self.max_frame {
            return Err(FrameError::Oversize {
                len,
                max: self.max_frame,
            });
        }
        if self.buf.len() < len {
            return Ok(None);
        }
        let mut body: Vec<u8> = self.buf[FRAME_HEADER_BYTES..len].to_vec();
        self.buf.drain(..len);
        if let Some(cipher) = cipher {
            cipher.decrypt_in_place(&mut body);
        }
        Ok(Some(body))
    }
}

/// Builds the on-wire bytes for one packet body, enciphering first when a
/// cipher is armed. Encoding order must match wire order: the cipher key
/// evolves with every packet.
pub fn encode_frame(
    body: &[u8],
    cipher: Option<&mut SessionCipher>,
    max_frame: usize,
) -> Result<Vec<u8>, FrameError> {
    let total = body.len() + FRAME_HEADER_BYTES;
    if total > max_frame || total > u16::MAX as usize || body.is_empty() {
        return Err(FrameError::BodyTooLarge {
            len: body.len(),
            max: max_frame.saturating_sub(FRAME_HEADER_BYTES),
        });
    }
    let mut wire = Vec::with_capacity(total);
    wire.extend_from_slice(&(total as u16).to_le_bytes());
    wire.extend_from_slice(body);
    if let Some(cipher) = cipher {
        cipher.encrypt_in_place(&mut wire[FRAME_HEADER_BYTES..]);
    }
    Ok(wire)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::cipher::SessionCipher;

    const MAX: usize = 1024;

    fn decode_all(decoder: &mut FrameDecoder) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        while let Ok(Some(frame)) = decoder.next_frame(None) {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn roundtrip_without_cipher() {
        let body = vec![0x0e, 0x01, 0x02, 0x03];
        let wire = encode_frame(&body, None, MAX).expect("encode");
        assert_eq!(wire.len(), body.len() + FRAME_HEADER_BYTES);
        let mut decoder = FrameDecoder::new(MAX);
        decoder.feed(&wire);
        let decoded = decoder.next_frame(None).expect("decode").expect("frame");
        assert_eq!(decoded, body);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn fragmentation_is_transparent() {
        let bodies: Vec<Vec<u8>> = (1..24)
            .map(|n| (0..n).map(|i| (i * 3 + n) as u8).collect())
            .collect();
        let mut wire = Vec::new();
        for body in &bodies {
            wire.extend_from_slice(&encode_frame(body, None, MAX).expect("encode"));
        }

        // whole-stream decode as the reference
        let mut whole = FrameDecoder::new(MAX);
        whole.feed(&wire);
        let reference = decode_all(&mut whole);
        assert_eq!(reference, bodies);

        // every split point must yield the identical frame sequence
        for split in 0..=wire.len() {
            let mut decoder = FrameDecoder::new(MAX);
            let mut frames = Vec::new();
            decoder.feed(&wire[..split]);
            frames.extend(decode_all(&mut decoder));
            decoder.feed(&wire[split..]);
            frames.extend(decode_all(&mut decoder));
            assert_eq!(frames, bodies, "split at {split}");
        }
    }

    #[test]
    fn partial_frame_consumes_nothing() {
        let body = vec![0x7f; 10];
        let wire = encode_frame(&body, None, MAX).expect("encode");
        let mut decoder = FrameDecoder::new(MAX);
        decoder.feed(&wire[..wire.len() - 1]);
        assert_eq!(decoder.next_frame(None).expect("decode"), None);
        assert_eq!(decoder.buffered(), wire.len() - 1);
        decoder.feed(&wire[wire.len() - 1..]);
        assert_eq!(decoder.next_frame(None).expect("decode"), Some(body));
    }

    #[test]
    fn zero_length_is_malformed() {
        let mut decoder = FrameDecoder::new(MAX);
        decoder.feed(&[0x00, 0x00, 0xff]);
        assert_eq!(
            decoder.next_frame(None),
            Err(FrameError::Runt { len: 0 })
        );
    }

    #[test]
    fn header_only_length_is_malformed() {
        let mut decoder = FrameDecoder::new(MAX);
        decoder.feed(&[0x02, 0x00]);
        assert_eq!(
            decoder.next_frame(None),
            Err(FrameError::Runt { len: 2 })
        );
    }

    #[test]
    fn oversize_length_is_malformed() {
        let mut decoder = FrameDecoder::new(64);
        decoder.feed(&[0xff, 0xff]);
        assert_eq!(
            decoder.next_frame(None),
            Err(FrameError::Oversize {
                len: 0xffff,
                max: 64
            })
        );
    }

    #[test]
    fn encode_rejects_oversize_body() {
        let body = vec![0u8; 128];
        assert!(matches!(
            encode_frame(&body, None, 64),
            Err(FrameError::BodyTooLarge { .. })
        ));
    }

    #[test]
    fn enciphered_roundtrip_across_frames() {
        let half = SessionCipher::derive_handshake_half(0xfeed);
        let mut send = SessionCipher::from_handshake(&half);
        let mut recv = SessionCipher::from_handshake(&half);
        let mut decoder = FrameDecoder::new(MAX);
        let bodies = [b"alpha".to_vec(), b"beta-beta".to_vec(), b"g".to_vec()];
        for body in &bodies {
            let wire = encode_frame(body, Some(&mut send), MAX).expect("encode");
            assert_ne!(&wire[FRAME_HEADER_BYTES..], &body[..]);
            decoder.feed(&wire);
            let decoded = decoder
                .next_frame(Some(&mut recv))
                .expect("decode")
                .expect("frame");
            assert_eq!(&decoded, body);
        }
    }

    #[test]
    fn length_field_covers_whole_frame() {
        let body = vec![0x0e, 0xaa];
        let wire = encode_frame(&body, None, MAX).expect("encode");
        let declared = u16::from_le_bytes([wire[0], wire[1]]) as usize;
        assert_eq!(declared, wire.len());
    }
}

use sha1::{Digest, Sha1};

pub const CIPHER_KEY_BYTES: usize = 16;
pub const HANDSHAKE_KEY_BYTES: usize = 8;

/// Static tail of every traffic key. The client ships the same constant;
/// only the first eight bytes travel on the wire during the handshake.
const KEY_TAIL: [u8; 8] = [0xc8, 0x27, 0x93, 0x01, 0xa1, 0x6c, 0x31, 0x97];

/// Salt mixed into the nonce digest so key material is not a bare SHA-1
/// of a guessable counter.
const NONCE_SALT: &[u8] = b"ashfall-traffic-key";

/// One direction of the per-connection traffic cipher: a byte-chained XOR
/// over a 16-byte key whose low half advances by the processed length
/// after every packet. Both directions start from the same key and evolve
/// independently, so each side of the connection keeps two instances.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCipher {
    key: [u8; CIPHER_KEY_BYTES],
}

impl SessionCipher {
    pub fn from_key(key: [u8; CIPHER_KEY_BYTES]) -> Self {
        Self { key }
    }

    /// Rebuilds the full key from the eight bytes carried by the key-init
    /// packet, as the client does.
    pub fn from_handshake(half: &[u8; HANDSHAKE_KEY_BYTES]) -> Self {
        let mut key = [0u8; CIPHER_KEY_BYTES];
        key[..HANDSHAKE_KEY_BYTES].copy_from_slice(half);
        key[HANDSHAKE_KEY_BYTES..].copy_from_slice(&KEY_TAIL);
        Self { key }
    }

    /// Derives the wire half of a fresh key from a per-connection nonce.
    pub fn derive_handshake_half(nonce: u64) -> [u8; HANDSHAKE_KEY_BYTES] {
        let mut sha1 = Sha1::new();
        sha1.update(nonce.to_le_bytes());
        sha1.update(NONCE_SALT);
        let digest = sha1.finalize();
        let mut half = [0u8; HANDSHAKE_KEY_BYTES];
        half.copy_from_slice(&digest[..HANDSHAKE_KEY_BYTES]);
        half
    }

    /// Deciphers a payload received from the peer. The chain value is the
    /// previous ciphertext byte, so decryption must read it before the
    /// byte is overwritten.
    pub fn decrypt_in_place(&mut self, data: &mut [u8]) {
        let mut prev = 0u8;
        for (idx, byte) in data.iter_mut().enumerate() {
            let enciphered = *byte;
            *byte = enciphered ^ self.key[idx & 15] ^ prev;
            prev = enciphered;
        }
        self.advance(data.len());
    }

    /// Enciphers a payload before it is framed for the peer.
    pub fn encrypt_in_place(&mut self, data: &mut [u8]) {
        let mut prev = 0u8;
        for (idx, byte) in data.iter_mut().enumerate() {
            *byte ^= self.key[idx & 15] ^ prev;
            prev = *byte;
        }
        self.advance(data.len());
    }

    fn advance(&mut self, len: usize) {
        let mut counter = u32::from_le_bytes([
            self.key[8],
            self.key[9],
            self.key[10],
            self.key[11],
        ]);
        counter = counter.wrapping_add(len as u32);
        self.key[8..12].copy_from_slice(&counter.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_preserves_payload() {
        let half = SessionCipher::derive_handshake_half(0x1122_3344_5566_7788);
        let mut sender = SessionCipher::from_handshake(&half);
        let mut receiver = SessionCipher::from_handshake(&half);
        let payload = b"the quick brown fox".to_vec();
        let mut wire = payload.clone();
        sender.encrypt_in_place(&mut wire);
        assert_ne!(wire, payload);
        receiver.decrypt_in_place(&mut wire);
        assert_eq!(wire, payload);
    }

    #[test]
    fn key_evolution_stays_in_sync_across_packets() {
        let half = SessionCipher::derive_handshake_half(7);
        let mut sender = SessionCipher::from_handshake(&half);
        let mut receiver = SessionCipher::from_handshake(&half);
        for len in [1usize, 5, 16, 17, 200, 3] {
            let payload: Vec<u8> = (0..len).map(|i| (i * 7 + len) as u8).collect();
            let mut wire = payload.clone();
            sender.encrypt_in_place(&mut wire);
            receiver.decrypt_in_place(&mut wire);
            assert_eq!(wire, payload, "length {len}");
        }
    }

    #[test]
    fn stale_key_state_does_not_decrypt() {
        let half = SessionCipher::derive_handshake_half(9);
        let mut sender = SessionCipher::from_handshake(&half);
        let mut receiver = SessionCipher::from_handshake(&half);
        let mut first = vec![0xaa; 24];
        sender.encrypt_in_place(&mut first);
        receiver.decrypt_in_place(&mut first);

        // A receiver that missed the first packet has an un-advanced key.
        let mut stale = SessionCipher::from_handshake(&half);
        let mut second = b"hello again".to_vec();
        let clear = second.clone();
        sender.encrypt_in_place(&mut second);
        let mut copy = second.clone();
        stale.decrypt_in_place(&mut copy);
        assert_ne!(copy, clear);
        receiver.decrypt_in_place(&mut second);
        assert_eq!(second, clear);
    }

    #[test]
    fn derived_halves_differ_by_nonce() {
        assert_ne!(
            SessionCipher::derive_handshake_half(1),
            SessionCipher::derive_handshake_half(2)
        );
    }

    #[test]
    fn empty_payload_is_a_noop_but_advances_nothing() {
        let mut cipher = SessionCipher::from_handshake(&[0x11; 8]);
        let before = cipher.clone();
        let mut empty: Vec<u8> = Vec::new();
        cipher.encrypt_in_place(&mut empty);
        assert_eq!(cipher, before);
    }
}

//! Cryptographic primitives for peer sessions
//!
//! The mesh PSK is hashed into an HMAC-SHA256 key. Handshake proofs and
//! per-direction record keys are derived from it together with both
//! sides' randoms. Records are sealed with ChaCha20-Poly1305.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Length of handshake randoms and MACs
pub const RANDOM_LEN: usize = 32;
pub const MAC_LEN: usize = 32;

const CLIENT_WRITE_LABEL: &[u8] = b"wolfmesh client write";
const SERVER_WRITE_LABEL: &[u8] = b"wolfmesh server write";

/// Mesh pre-shared key, stored only as its SHA-256 digest
#[derive(Clone)]
pub struct PreSharedKey {
    key: [u8; 32],
}

impl PreSharedKey {
    pub fn new(secret: &[u8]) -> Self {
        let digest = Sha256::digest(secret);
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Self { key }
    }

    /// Short fingerprint for logs (never the key itself)
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.key);
        hex::encode(&digest[..4])
    }

    fn hmac(&self) -> HmacSha256 {
        // HMAC accepts keys of any length
        <HmacSha256 as Mac>::new_from_slice(&self.key).unwrap_or_else(|_| unreachable!())
    }

    /// MAC over length-prefixed parts
    pub fn mac(&self, parts: &[&[u8]]) -> [u8; MAC_LEN] {
        let mut mac = self.hmac();
        for part in parts {
            mac.update(&(part.len() as u32).to_be_bytes());
            mac.update(part);
        }
        let mut out = [0u8; MAC_LEN];
        out.copy_from_slice(&mac.finalize().into_bytes());
        out
    }

    /// Constant-time check of a MAC produced by `mac`
    pub fn verify(&self, parts: &[&[u8]], tag: &[u8]) -> bool {
        let mut mac = self.hmac();
        for part in parts {
            mac.update(&(part.len() as u32).to_be_bytes());
            mac.update(part);
        }
        mac.verify_slice(tag).is_ok()
    }
}

impl std::fmt::Debug for PreSharedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PreSharedKey({})", self.fingerprint())
    }
}

/// Record keys for both directions of one session
pub struct SessionKeys {
    pub client_write: [u8; 32],
    pub server_write: [u8; 32],
}

impl SessionKeys {
    pub fn derive(psk: &PreSharedKey, client_random: &[u8], server_random: &[u8]) -> Self {
        Self {
            client_write: psk.mac(&[CLIENT_WRITE_LABEL, client_random, server_random]),
            server_write: psk.mac(&[SERVER_WRITE_LABEL, client_random, server_random]),
        }
    }
}

/// AEAD for one direction of a session
pub struct RecordCipher {
    cipher: ChaCha20Poly1305,
}

impl RecordCipher {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    /// Nonce from the record sequence number; keys are per direction so
    /// the sequence alone never repeats under one key
    fn nonce(sequence: u64) -> Nonce {
        let mut nonce_bytes = [0u8; 12];
        nonce_bytes[4..].copy_from_slice(&sequence.to_be_bytes());
        *Nonce::from_slice(&nonce_bytes)
    }

    pub fn seal(&self, sequence: u64, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        self.cipher
            .encrypt(&Self::nonce(sequence), Payload { msg: plaintext, aad })
            .map_err(|_| Error::Record("encryption failed".into()))
    }

    pub fn open(&self, sequence: u64, aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.cipher
            .decrypt(&Self::nonce(sequence), Payload { msg: ciphertext, aad })
            .map_err(|_| Error::Record("decryption failed (wrong key or corrupted data)".into()))
    }
}

/// Sliding 64-record anti-replay window
#[derive(Debug, Default)]
pub struct ReplayWindow {
    latest: u64,
    bitmap: u64,
    initialized: bool,
}

impl ReplayWindow {
    const SIZE: u64 = 64;

    pub fn new() -> Self {
        Self::default()
    }

    /// Would `sequence` be accepted? Does not record it.
    pub fn check(&self, sequence: u64) -> bool {
        if !self.initialized || sequence > self.latest {
            return true;
        }
        let offset = self.latest - sequence;
        if offset >= Self::SIZE {
            return false;
        }
        self.bitmap & (1 << offset) == 0
    }

    /// Record an authenticated sequence number
    pub fn update(&mut self, sequence: u64) {
        if !self.initialized {
            self.initialized = true;
            self.latest = sequence;
            self.bitmap = 1;
            return;
        }

        if sequence > self.latest {
            let shift = sequence - self.latest;
            self.bitmap = if shift >= Self::SIZE { 0 } else { self.bitmap << shift };
            self.bitmap |= 1;
            self.latest = sequence;
        } else {
            let offset = self.latest - sequence;
            if offset < Self::SIZE {
                self.bitmap |= 1 << offset;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_psk_mac_depends_on_key() {
        let a = PreSharedKey::new(b"correct horse");
        let b = PreSharedKey::new(b"battery staple");

        let tag = a.mac(&[b"label", b"data"]);
        assert!(a.verify(&[b"label", b"data"], &tag));
        assert!(!b.verify(&[b"label", b"data"], &tag));
        // Length prefixes keep part boundaries significant
        assert!(!a.verify(&[b"labeld", b"ata"], &tag));
    }

    #[test]
    fn test_direction_keys_differ() {
        let psk = PreSharedKey::new(b"secret");
        let keys = SessionKeys::derive(&psk, &[1u8; 32], &[2u8; 32]);
        assert_ne!(keys.client_write, keys.server_write);

        let other = SessionKeys::derive(&psk, &[1u8; 32], &[3u8; 32]);
        assert_ne!(keys.client_write, other.client_write);
    }

    #[test]
    fn test_seal_open() {
        let cipher = RecordCipher::new(&[7u8; 32]);
        let sealed = cipher.seal(42, b"header", b"an ip packet").unwrap();

        assert_eq!(cipher.open(42, b"header", &sealed).unwrap(), b"an ip packet");
        assert!(cipher.open(43, b"header", &sealed).is_err());
        assert!(cipher.open(42, b"tampered", &sealed).is_err());

        let wrong = RecordCipher::new(&[8u8; 32]);
        assert!(wrong.open(42, b"header", &sealed).is_err());
    }

    #[test]
    fn test_replay_window() {
        let mut window = ReplayWindow::new();
        assert!(window.check(5));
        window.update(5);
        assert!(!window.check(5));

        // Reordered but inside the window
        assert!(window.check(3));
        window.update(3);
        assert!(!window.check(3));

        // Jump ahead, old entries slide out
        window.update(100);
        assert!(!window.check(5));
        assert!(window.check(99));
        assert!(window.check(40));
        assert!(!window.check(36));
        assert!(window.check(101));
    }

    #[test]
    fn test_fingerprint_hides_key() {
        let psk = PreSharedKey::new(b"secret");
        let debug = format!("{:?}", psk);
        assert!(!debug.contains("secret"));
        assert_eq!(psk.fingerprint().len(), 8);
    }
}

//! Packet sealing.
//!
//! Every tunnel frame is sealed with ChaCha20-Poly1305 under a key derived
//! from the configured passphrase. The cipher is treated as a black box by
//! the rest of the pipeline: `seal` prepends a random nonce, `open` strips
//! and verifies it.

use chacha20poly1305::{
    aead::{Aead as AeadTrait, AeadCore, KeyInit, OsRng},
    ChaCha20Poly1305,
};
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};

/// Size of the symmetric key in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

/// Size of the per-packet nonce in bytes (96 bits)
pub const NONCE_SIZE: usize = 12;

/// Size of the authentication tag in bytes (128 bits)
pub const TAG_SIZE: usize = 16;

/// Total bytes `seal` adds to a plaintext.
pub const SEAL_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

/// HKDF context string binding derived keys to this protocol.
const KDF_INFO: &[u8] = b"veiltun packet key v1";

/// A symmetric packet key, zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PacketKey([u8; KEY_SIZE]);

impl PacketKey {
    /// Create a key from raw bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Derive a key from the configured passphrase via HKDF-SHA256.
    pub fn derive(passphrase: &str) -> Self {
        let hk = Hkdf::<Sha256>::new(None, passphrase.as_bytes());
        let mut okm = [0u8; KEY_SIZE];
        hk.expand(KDF_INFO, &mut okm)
            .expect("32 bytes is a valid HKDF-SHA256 output length");
        Self(okm)
    }

    fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for PacketKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PacketKey(..)")
    }
}

/// Authenticated packet cipher.
pub struct PacketCipher {
    cipher: ChaCha20Poly1305,
}

impl PacketCipher {
    /// Create a cipher instance with the given key.
    pub fn new(key: &PacketKey) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(key.as_bytes().into()),
        }
    }

    /// Seal a plaintext frame.
    ///
    /// Returns `[nonce:12][ciphertext][tag:16]`.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| Error::crypto("seal failed"))?;

        let mut packet = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        packet.extend_from_slice(&nonce);
        packet.extend_from_slice(&ciphertext);
        Ok(packet)
    }

    /// Open a sealed packet, verifying the tag.
    pub fn open(&self, packet: &[u8]) -> Result<Vec<u8>> {
        if packet.len() < SEAL_OVERHEAD {
            return Err(Error::parse(format!(
                "sealed packet too short: {} bytes",
                packet.len()
            )));
        }

        let (nonce, ciphertext) = packet.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(chacha20poly1305::Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| Error::crypto("authentication failed"))
    }
}

pub mod key;

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use crypto_box::{PublicKey, SecretKey};
use rand::RngCore;

use cairn_types::error::{CairnError, Result};

/// Nonce size of the repokey AEAD.
pub const SECRET_NONCE_SIZE: usize = 12;
/// Expansion of `SecretCipher::encrypt`: prepended nonce + tag.
pub const SECRET_OVERHEAD: usize = SECRET_NONCE_SIZE + 16;
/// Expansion of a sealed box: ephemeral public key + tag.
pub const SEALED_OVERHEAD: usize = 48;
/// Expansion of a detached-nonce block: just the tag.
pub const BLOCK_TAG_SIZE: usize = 16;

/// Symmetric authenticated encryption under the repokey
/// (ChaCha20-Poly1305). Idx files, refs, and configuration go through
/// this; pack bodies use per-pack file keys with derived nonces.
pub struct SecretCipher {
    cipher: ChaCha20Poly1305,
}

impl SecretCipher {
    pub fn new(key: &[u8; 32]) -> Self {
        SecretCipher {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    /// Encrypt with a fresh random nonce. Returns `[nonce][ct+tag]`.
    pub fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; SECRET_NONCE_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        let ct = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| CairnError::AuthFailure("encryption failed".into()))?;
        let mut out = Vec::with_capacity(SECRET_NONCE_SIZE + ct.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ct);
        Ok(out)
    }

    /// Decrypt data produced by `encrypt`; `aad` must match.
    pub fn decrypt(&self, data: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        if data.len() < SECRET_OVERHEAD {
            return Err(CairnError::AuthFailure("ciphertext too short".into()));
        }
        let (nonce, ct) = data.split_at(SECRET_NONCE_SIZE);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), Payload { msg: ct, aad })
            .map_err(|_| CairnError::AuthFailure("ciphertext failed authentication".into()))
    }

    /// Encrypt with a caller-derived nonce (storage blocks, where the
    /// nonce is a function of block index and pack salt and therefore
    /// not stored). Returns `ct+tag` only.
    pub fn encrypt_with_nonce(
        &self,
        nonce: &[u8; SECRET_NONCE_SIZE],
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>> {
        self.cipher
            .encrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| CairnError::AuthFailure("block encryption failed".into()))
    }

    pub fn decrypt_with_nonce(
        &self,
        nonce: &[u8; SECRET_NONCE_SIZE],
        ciphertext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>> {
        self.cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| CairnError::AuthFailure("storage block failed authentication".into()))
    }
}

/// Nonce for storage block `index` inside one pack: the block index
/// XORed into the pack-scoped salt, so every block of every pack gets a
/// distinct nonce without storing any.
pub fn derive_block_nonce(salt: &[u8; 16], index: u64) -> [u8; SECRET_NONCE_SIZE] {
    let salt_word = u64::from_le_bytes(salt[..8].try_into().expect("8 bytes"));
    let mut nonce = [0u8; SECRET_NONCE_SIZE];
    nonce[..8].copy_from_slice(&(salt_word ^ index).to_le_bytes());
    nonce[8..].copy_from_slice(&salt[8..12]);
    nonce
}

/// Encrypt to the repository's writekey; only the readkey holder can
/// open the result.
pub fn seal_to(writekey: &PublicKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    writekey
        .seal(&mut crypto_box::aead::OsRng, plaintext)
        .map_err(|_| CairnError::AuthFailure("sealing to writekey failed".into()))
}

pub fn seal_open(readkey: &SecretKey, ciphertext: &[u8]) -> Result<Vec<u8>> {
    readkey
        .unseal(ciphertext)
        .map_err(|_| CairnError::AuthFailure("sealed box failed authentication".into()))
}

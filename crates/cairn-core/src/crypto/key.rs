use argon2::Argon2;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use cairn_types::error::{CairnError, Result};

use super::SecretCipher;

/// The repository's key material, held in memory only while a session
/// runs and zeroized on drop.
///
/// - `repokey`: symmetric; encrypts idx files, refs, and config.
/// - `writekey`: X25519 public half; data packs are sealed to it.
/// - `readkey`: X25519 secret half; required only to read data back.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MasterKeys {
    pub repokey: [u8; 32],
    pub writekey: [u8; 32],
    pub readkey: [u8; 32],
}

impl MasterKeys {
    pub fn generate() -> Self {
        let readkey = crypto_box::SecretKey::generate(&mut crypto_box::aead::OsRng);
        let writekey = readkey.public_key();
        let mut repokey = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut repokey);
        MasterKeys {
            repokey,
            writekey: *writekey.as_bytes(),
            readkey: readkey.to_bytes(),
        }
    }

    pub fn write_public(&self) -> crypto_box::PublicKey {
        crypto_box::PublicKey::from(self.writekey)
    }

    pub fn read_secret(&self) -> crypto_box::SecretKey {
        crypto_box::SecretKey::from(self.readkey)
    }
}

/// Serialized payload inside the wrapped key blob; zeroized on drop.
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct KeyPayload {
    repokey: Vec<u8>,
    writekey: Vec<u8>,
    readkey: Vec<u8>,
}

/// KDF parameters stored alongside the wrapped keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KdfParams {
    pub algorithm: String,
    pub time_cost: u32,
    pub memory_cost: u32,
    pub parallelism: u32,
    pub salt: Vec<u8>,
}

/// On-disk format stored at `keys/repokey`.
#[derive(Serialize, Deserialize)]
pub struct WrappedKeys {
    pub kdf: KdfParams,
    pub blob: Vec<u8>,
}

// Bounds rejecting maliciously crafted key blobs.
const MAX_TIME_COST: u32 = 10;
const MAX_PARALLELISM: u32 = 16;
const MAX_MEMORY_KIB: u32 = 524_288; // 512 MiB
const MIN_SALT_LEN: usize = 16;
const MAX_SALT_LEN: usize = 64;

fn validate_kdf_params(kdf: &KdfParams) -> Result<()> {
    let bad = || CairnError::AuthFailure("key file rejected".into());
    if kdf.algorithm != "argon2id" {
        return Err(bad());
    }
    if kdf.time_cost == 0 || kdf.time_cost > MAX_TIME_COST {
        return Err(bad());
    }
    if kdf.parallelism == 0 || kdf.parallelism > MAX_PARALLELISM {
        return Err(bad());
    }
    if kdf.memory_cost == 0 || kdf.memory_cost > MAX_MEMORY_KIB {
        return Err(bad());
    }
    if kdf.salt.len() < MIN_SALT_LEN || kdf.salt.len() > MAX_SALT_LEN {
        return Err(bad());
    }
    Ok(())
}

/// Stable AAD binding the KDF parameters to the wrapped blob, so they
/// cannot be substituted to weaken unwrapping.
fn kdf_params_aad(kdf: &KdfParams) -> Vec<u8> {
    let prefix = b"cairn:kdf-aad:v1\0";
    let algo = kdf.algorithm.as_bytes();
    let mut buf = Vec::with_capacity(prefix.len() + 20 + algo.len() + kdf.salt.len());
    buf.extend_from_slice(prefix);
    buf.extend_from_slice(&(algo.len() as u32).to_le_bytes());
    buf.extend_from_slice(algo);
    buf.extend_from_slice(&kdf.time_cost.to_le_bytes());
    buf.extend_from_slice(&kdf.memory_cost.to_le_bytes());
    buf.extend_from_slice(&kdf.parallelism.to_le_bytes());
    buf.extend_from_slice(&(kdf.salt.len() as u32).to_le_bytes());
    buf.extend_from_slice(&kdf.salt);
    buf
}

fn derive_wrapping_key(passphrase: &str, kdf: &KdfParams) -> Result<Zeroizing<[u8; 32]>> {
    let params = argon2::Params::new(kdf.memory_cost, kdf.time_cost, kdf.parallelism, Some(32))
        .map_err(|e| CairnError::KeyDerivation(format!("argon2 params: {e}")))?;
    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);
    let mut output = Zeroizing::new([0u8; 32]);
    argon2
        .hash_password_into(passphrase.as_bytes(), &kdf.salt, output.as_mut())
        .map_err(|e| CairnError::KeyDerivation(format!("argon2 hash: {e}")))?;
    Ok(output)
}

impl MasterKeys {
    /// Wrap the keys with a passphrase: Argon2id to derive the
    /// wrapping key, then the repokey AEAD with the KDF parameters as
    /// AAD.
    pub fn to_wrapped(&self, passphrase: &str) -> Result<WrappedKeys> {
        let mut salt = vec![0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        let kdf = KdfParams {
            algorithm: "argon2id".to_string(),
            time_cost: 3,
            memory_cost: 65536, // 64 MiB
            parallelism: 4,
            salt,
        };
        let wrapping_key = derive_wrapping_key(passphrase, &kdf)?;

        let payload = KeyPayload {
            repokey: self.repokey.to_vec(),
            writekey: self.writekey.to_vec(),
            readkey: self.readkey.to_vec(),
        };
        let plaintext = Zeroizing::new(rmp_serde::to_vec(&payload)?);

        let cipher = SecretCipher::new(&wrapping_key);
        let blob = cipher.encrypt(&plaintext, &kdf_params_aad(&kdf))?;
        Ok(WrappedKeys { kdf, blob })
    }

    /// Unwrap the key file. Wrong passphrase, tampered blob, and
    /// out-of-bounds KDF parameters all report the same way.
    pub fn from_wrapped(wrapped: &WrappedKeys, passphrase: &str) -> Result<Self> {
        validate_kdf_params(&wrapped.kdf)?;
        let wrapping_key = derive_wrapping_key(passphrase, &wrapped.kdf)?;
        let cipher = SecretCipher::new(&wrapping_key);
        let plaintext = Zeroizing::new(
            cipher
                .decrypt(&wrapped.blob, &kdf_params_aad(&wrapped.kdf))
                .map_err(|_| {
                    CairnError::AuthFailure("wrong passphrase or corrupted key file".into())
                })?,
        );

        let payload: KeyPayload = rmp_serde::from_slice(&plaintext)
            .map_err(|_| CairnError::AuthFailure("wrong passphrase or corrupted key file".into()))?;
        if payload.repokey.len() != 32 || payload.writekey.len() != 32 || payload.readkey.len() != 32
        {
            return Err(CairnError::AuthFailure("malformed key payload".into()));
        }

        let mut keys = MasterKeys {
            repokey: [0; 32],
            writekey: [0; 32],
            readkey: [0; 32],
        };
        keys.repokey.copy_from_slice(&payload.repokey);
        keys.writekey.copy_from_slice(&payload.writekey);
        keys.readkey.copy_from_slice(&payload.readkey);
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_PASSPHRASE: &str = "correct horse battery";

    fn quick_kdf() -> KdfParams {
        KdfParams {
            algorithm: "argon2id".into(),
            time_cost: 1,
            memory_cost: 8192,
            parallelism: 1,
            salt: vec![9u8; 32],
        }
    }

    #[test]
    fn wrap_unwrap_roundtrip() {
        let keys = MasterKeys::generate();
        let wrapped = keys.to_wrapped(TEST_PASSPHRASE).unwrap();
        let unwrapped = MasterKeys::from_wrapped(&wrapped, TEST_PASSPHRASE).unwrap();
        assert_eq!(keys.repokey, unwrapped.repokey);
        assert_eq!(keys.writekey, unwrapped.writekey);
        assert_eq!(keys.readkey, unwrapped.readkey);
    }

    #[test]
    fn wrong_passphrase_is_auth_failure() {
        let keys = MasterKeys::generate();
        let wrapped = keys.to_wrapped(TEST_PASSPHRASE).unwrap();
        let err = MasterKeys::from_wrapped(&wrapped, "wrong").unwrap_err();
        assert!(matches!(err, CairnError::AuthFailure(_)));
    }

    #[test]
    fn writekey_matches_readkey() {
        let keys = MasterKeys::generate();
        assert_eq!(
            keys.read_secret().public_key().as_bytes(),
            &keys.writekey
        );
    }

    #[test]
    fn kdf_bounds_are_enforced() {
        let mut kdf = quick_kdf();
        kdf.memory_cost = MAX_MEMORY_KIB + 1;
        assert!(validate_kdf_params(&kdf).is_err());

        let mut kdf = quick_kdf();
        kdf.algorithm = "scrypt".into();
        assert!(validate_kdf_params(&kdf).is_err());

        let mut kdf = quick_kdf();
        kdf.salt = vec![0u8; 8];
        assert!(validate_kdf_params(&kdf).is_err());

        assert!(validate_kdf_params(&quick_kdf()).is_ok());
    }

    #[test]
    fn tampered_kdf_params_break_unwrapping() {
        let keys = MasterKeys::generate();
        let mut wrapped = keys.to_wrapped(TEST_PASSPHRASE).unwrap();
        // Weakening time_cost changes the AAD, so authentication fails
        // even though the blob itself is untouched.
        wrapped.kdf.time_cost = 1;
        assert!(MasterKeys::from_wrapped(&wrapped, TEST_PASSPHRASE).is_err());
    }
}

//! Per-store authenticated encryption, layered over compressed bytes.
//!
//! A password-derived key via argon2id and AES-256-GCM (already pulled in
//! through the `openssl` dependency, so no new AEAD crate is needed beyond
//! the KDF).

use anyhow::{bail, Error};
use argon2::password_hash::SaltString;
use openssl::symm::{Cipher, Crypter, Mode};

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Fixed argon2id parameters shared by a store; part of the on-disk
/// contract the same way the rolling hash table is.
const ARGON2_M_COST: u32 = 19 * 1024; // KiB
const ARGON2_T_COST: u32 = 2;
const ARGON2_P_COST: u32 = 1;

/// A store-wide salt, fixed once per store (analogous to how `StoreOptions`
/// is per-store-URL). Generated at store-creation time and persisted
/// alongside the store configuration by the caller.
#[derive(Clone)]
pub struct CryptConfig {
    key: [u8; KEY_LEN],
}

impl CryptConfig {
    /// Derive a store key from a password and a stable per-store salt.
    pub fn derive(password: &[u8], salt: &[u8]) -> Result<Self, Error> {
        let salt_string = SaltString::b64_encode(salt)
            .map_err(|e| anyhow::anyhow!("invalid salt: {}", e))?;
        let params = argon2::Params::new(ARGON2_M_COST, ARGON2_T_COST, ARGON2_P_COST, Some(KEY_LEN))
            .map_err(|e| anyhow::anyhow!("invalid argon2 params: {}", e))?;
        let argon2 =
            argon2::Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);

        let mut key = [0u8; KEY_LEN];
        argon2
            .hash_password_into(password, salt_string.as_bytes(), &mut key)
            .map_err(|e| anyhow::anyhow!("argon2id derivation failed: {}", e))?;

        Ok(CryptConfig { key })
    }

    /// Encrypt `plain` with a fresh random nonce. Returns `nonce || ciphertext || tag`.
    pub fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>, Error> {
        let mut nonce = [0u8; NONCE_LEN];
        openssl::rand::rand_bytes(&mut nonce)?;

        let cipher = Cipher::aes_256_gcm();
        let mut tag = [0u8; TAG_LEN];
        let mut crypter = Crypter::new(cipher, Mode::Encrypt, &self.key, Some(&nonce))?;

        let mut out = vec![0u8; plain.len() + cipher.block_size()];
        let mut count = crypter.update(plain, &mut out)?;
        count += crypter.finalize(&mut out[count..])?;
        out.truncate(count);
        crypter.get_tag(&mut tag)?;

        let mut result = Vec::with_capacity(NONCE_LEN + out.len() + TAG_LEN);
        result.extend_from_slice(&nonce);
        result.extend_from_slice(&out);
        result.extend_from_slice(&tag);
        Ok(result)
    }

    /// Decrypt bytes produced by `encrypt`. Authentication failure is a
    /// fatal `ChunkInvalid`-class error, surfaced here as a plain `Error`
    /// that callers wrap appropriately.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, Error> {
        if data.len() < NONCE_LEN + TAG_LEN {
            bail!("encrypted chunk too short ({} bytes)", data.len());
        }
        let nonce = &data[..NONCE_LEN];
        let tag = &data[data.len() - TAG_LEN..];
        let ciphertext = &data[NONCE_LEN..data.len() - TAG_LEN];

        let cipher = Cipher::aes_256_gcm();
        let mut crypter = Crypter::new(cipher, Mode::Decrypt, &self.key, Some(nonce))?;
        crypter.set_tag(tag)?;

        let mut out = vec![0u8; ciphertext.len() + cipher.block_size()];
        let mut count = crypter.update(ciphertext, &mut out)?;
        count += crypter
            .finalize(&mut out[count..])
            .map_err(|_| anyhow::anyhow!("authentication failed decrypting chunk"))?;
        out.truncate(count);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let cfg = CryptConfig::derive(b"hunter2", b"some-fixed-salt-").unwrap();
        let plain = b"the quick brown fox jumps over the lazy dog";
        let enc = cfg.encrypt(plain).unwrap();
        let dec = cfg.decrypt(&enc).unwrap();
        assert_eq!(dec, plain);
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let cfg = CryptConfig::derive(b"hunter2", b"some-fixed-salt-").unwrap();
        let mut enc = cfg.encrypt(b"payload").unwrap();
        let last = enc.len() - 1;
        enc[last] ^= 0xff;
        assert!(cfg.decrypt(&enc).is_err());
    }
}

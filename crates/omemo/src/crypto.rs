//! Cryptographic primitives behind a swappable provider.
//!
//! `RustCryptoProvider` is the production implementation. `SeededCryptoProvider`
//! draws its "random" bytes from a seeded generator so tests are reproducible;
//! every other primitive is the real one.
//!
//! libsignal key pairs and ratchet steps draw from [`CryptoProvider::rng`].
//! Kyber pre-keys are the exception: libsignal generates them from its own
//! system source.

use std::io::{Read, Write};

use aes::cipher::{
    block_padding::Pkcs7, BlockDecryptMut, BlockEncrypt, BlockEncryptMut, KeyInit, KeyIvInit,
    StreamCipher,
};
use aes_gcm::aead::Aead;
use aes_gcm::{Aes128Gcm, Nonce};
use ghash::universal_hash::UniversalHash;
use ghash::GHash;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use rand::rngs::{OsRng, StdRng};
use rand::{RngCore, SeedableRng, TryRngCore};
use sha2::{Digest, Sha256, Sha512};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::error::CryptoError;

const GCM_TAG_SIZE: usize = 16;
const GCM_NONCE_SIZE: usize = 12;
const CBC_IV_SIZE: usize = 16;
/// Stream chunk size; a multiple of the AES block size.
const STREAM_CHUNK: usize = 4096;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type Aes256Ctr = ctr::Ctr32BE<aes::Aes256>;

/// Primitive operations used by the OMEMO layers.
pub trait CryptoProvider: Send + Sync {
    fn random_bytes(&self, len: usize) -> Result<Vec<u8>, CryptoError>;

    /// Generator seeded from [`random_bytes`](Self::random_bytes), for APIs
    /// that take an `Rng`.
    fn rng(&self) -> Result<StdRng, CryptoError> {
        let bytes = Zeroizing::new(self.random_bytes(32)?);
        let mut seed = Zeroizing::new([0u8; 32]);
        if bytes.len() != seed.len() {
            return Err(CryptoError::RandomUnavailable(format!(
                "expected 32 seed bytes, got {}",
                bytes.len()
            )));
        }
        seed.copy_from_slice(&bytes);
        Ok(StdRng::from_seed(*seed))
    }

    fn hmac_sha256(&self, key: &[u8], data: &[u8]) -> Result<[u8; 32], CryptoError> {
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key)
            .map_err(|e| CryptoError::InvalidKeyMaterial(format!("hmac key: {e}")))?;
        mac.update(data);
        let mut out = [0u8; 32];
        out.copy_from_slice(&mac.finalize().into_bytes());
        Ok(out)
    }

    fn sha512(&self, data: &[u8]) -> [u8; 64] {
        let mut out = [0u8; 64];
        out.copy_from_slice(&Sha512::digest(data));
        out
    }

    /// AES-256-CBC with PKCS#5/7 padding.
    fn aes_cbc_pkcs5_encrypt(
        &self,
        key: &[u8],
        iv: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        check_len("cbc key", key, 32)?;
        check_len("cbc iv", iv, CBC_IV_SIZE)?;
        let cipher = Aes256CbcEnc::new_from_slices(key, iv)
            .map_err(|e| CryptoError::InvalidKeyMaterial(format!("cbc: {e}")))?;
        Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
    }

    fn aes_cbc_pkcs5_decrypt(
        &self,
        key: &[u8],
        iv: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        check_len("cbc key", key, 32)?;
        check_len("cbc iv", iv, CBC_IV_SIZE)?;
        let cipher = Aes256CbcDec::new_from_slices(key, iv)
            .map_err(|e| CryptoError::InvalidKeyMaterial(format!("cbc: {e}")))?;
        cipher
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| CryptoError::Padding)
    }

    /// AES-128-GCM without associated data. Returns `(ciphertext, tag)`.
    fn aes128_gcm_encrypt(
        &self,
        key: &[u8],
        iv: &[u8],
        plaintext: &[u8],
    ) -> Result<(Vec<u8>, [u8; GCM_TAG_SIZE]), CryptoError> {
        check_len("gcm key", key, 16)?;
        check_len("gcm iv", iv, GCM_NONCE_SIZE)?;
        let cipher = Aes128Gcm::new_from_slice(key)
            .map_err(|e| CryptoError::InvalidKeyMaterial(format!("gcm: {e}")))?;
        let mut sealed = cipher
            .encrypt(Nonce::from_slice(iv), plaintext)
            .map_err(|_| CryptoError::InvalidKeyMaterial("gcm encryption failed".into()))?;

        let split = sealed.len() - GCM_TAG_SIZE;
        let mut tag = [0u8; GCM_TAG_SIZE];
        tag.copy_from_slice(&sealed[split..]);
        sealed.truncate(split);
        Ok((sealed, tag))
    }

    fn aes128_gcm_decrypt(
        &self,
        key: &[u8],
        iv: &[u8],
        ciphertext: &[u8],
        tag: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        check_len("gcm key", key, 16)?;
        check_len("gcm iv", iv, GCM_NONCE_SIZE)?;
        check_len("gcm tag", tag, GCM_TAG_SIZE)?;
        let cipher = Aes128Gcm::new_from_slice(key)
            .map_err(|e| CryptoError::InvalidKeyMaterial(format!("gcm: {e}")))?;

        let mut sealed = Vec::with_capacity(ciphertext.len() + GCM_TAG_SIZE);
        sealed.extend_from_slice(ciphertext);
        sealed.extend_from_slice(tag);
        cipher
            .decrypt(Nonce::from_slice(iv), sealed.as_slice())
            .map_err(|_| CryptoError::AuthenticationFailure)
    }

    /// AES-256-GCM over a whole stream. Writes `ciphertext || tag`.
    fn aes256_gcm_stream_encrypt(
        &self,
        key: &[u8],
        nonce: &[u8],
        input: &mut dyn Read,
        output: &mut dyn Write,
    ) -> Result<(), CryptoError> {
        let mut gcm = StreamingGcm::new(key, nonce)?;
        let mut buf = vec![0u8; STREAM_CHUNK];
        loop {
            let n = read_full(input, &mut buf)?;
            if n == 0 {
                break;
            }
            let chunk = &mut buf[..n];
            gcm.apply_keystream(chunk)?;
            gcm.absorb(chunk);
            output.write_all(chunk)?;
            if n < STREAM_CHUNK {
                break;
            }
        }
        output.write_all(&gcm.finish())?;
        output.flush()?;
        Ok(())
    }

    /// Reverse of [`aes256_gcm_stream_encrypt`](Self::aes256_gcm_stream_encrypt).
    ///
    /// Plaintext is written as it is recovered; on `AuthenticationFailure` the
    /// caller must discard everything written to `output`.
    fn aes256_gcm_stream_decrypt(
        &self,
        key: &[u8],
        nonce: &[u8],
        input: &mut dyn Read,
        output: &mut dyn Write,
    ) -> Result<(), CryptoError> {
        let mut gcm = StreamingGcm::new(key, nonce)?;
        let mut pending: Vec<u8> = Vec::with_capacity(STREAM_CHUNK + GCM_TAG_SIZE);
        let mut buf = vec![0u8; STREAM_CHUNK];
        loop {
            let n = read_full(input, &mut buf)?;
            pending.extend_from_slice(&buf[..n]);
            // The trailing tag is held back until end of stream.
            while pending.len() >= STREAM_CHUNK + GCM_TAG_SIZE {
                let mut chunk: Vec<u8> = pending.drain(..STREAM_CHUNK).collect();
                gcm.absorb(&chunk);
                gcm.apply_keystream(&mut chunk)?;
                output.write_all(&chunk)?;
            }
            if n < STREAM_CHUNK {
                break;
            }
        }

        if pending.len() < GCM_TAG_SIZE {
            return Err(CryptoError::AuthenticationFailure);
        }
        let tag = pending.split_off(pending.len() - GCM_TAG_SIZE);
        if !pending.is_empty() {
            gcm.absorb(&pending);
            gcm.apply_keystream(&mut pending)?;
            output.write_all(&pending)?;
        }

        let expected = gcm.finish();
        if !bool::from(expected.as_slice().ct_eq(tag.as_slice())) {
            return Err(CryptoError::AuthenticationFailure);
        }
        output.flush()?;
        Ok(())
    }
}

fn check_len(what: &str, bytes: &[u8], expected: usize) -> Result<(), CryptoError> {
    if bytes.len() != expected {
        return Err(CryptoError::InvalidKeyMaterial(format!(
            "{what}: expected {expected} bytes, got {}",
            bytes.len()
        )));
    }
    Ok(())
}

/// Fill `buf` from `reader` until full or end of stream.
fn read_full(reader: &mut dyn Read, buf: &mut [u8]) -> Result<usize, CryptoError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

/// Incremental AES-256-GCM (96-bit nonce, no associated data).
///
/// Every chunk passed to `absorb` except the last must be a multiple of 16 bytes.
struct StreamingGcm {
    ctr: Aes256Ctr,
    ghash: GHash,
    tag_mask: aes::Block,
    ciphertext_len: u64,
}

impl StreamingGcm {
    fn new(key: &[u8], nonce: &[u8]) -> Result<Self, CryptoError> {
        check_len("file key", key, 32)?;
        check_len("file nonce", nonce, GCM_NONCE_SIZE)?;
        let block_cipher = <aes::Aes256 as KeyInit>::new_from_slice(key)
            .map_err(|e| CryptoError::InvalidKeyMaterial(format!("aes: {e}")))?;

        let mut hash_key = aes::Block::default();
        block_cipher.encrypt_block(&mut hash_key);

        let mut counter = [0u8; 16];
        counter[..GCM_NONCE_SIZE].copy_from_slice(nonce);
        counter[15] = 1;
        let mut tag_mask = aes::Block::clone_from_slice(&counter);
        block_cipher.encrypt_block(&mut tag_mask);

        counter[15] = 2;
        let ctr = Aes256Ctr::new_from_slices(key, &counter)
            .map_err(|e| CryptoError::InvalidKeyMaterial(format!("ctr: {e}")))?;
        let ghash = <GHash as ghash::universal_hash::KeyInit>::new(&hash_key);

        Ok(Self {
            ctr,
            ghash,
            tag_mask,
            ciphertext_len: 0,
        })
    }

    fn apply_keystream(&mut self, data: &mut [u8]) -> Result<(), CryptoError> {
        self.ctr
            .try_apply_keystream(data)
            .map_err(|_| CryptoError::Io("stream exceeds GCM length limit".into()))
    }

    fn absorb(&mut self, ciphertext: &[u8]) {
        self.ghash.update_padded(ciphertext);
        self.ciphertext_len += ciphertext.len() as u64;
    }

    fn finish(mut self) -> [u8; GCM_TAG_SIZE] {
        let mut lengths = ghash::Block::default();
        lengths[8..].copy_from_slice(&(self.ciphertext_len * 8).to_be_bytes());
        self.ghash.update(&[lengths]);

        let mut tag = [0u8; GCM_TAG_SIZE];
        for (out, (s, m)) in tag
            .iter_mut()
            .zip(self.ghash.finalize().iter().zip(self.tag_mask.iter()))
        {
            *out = s ^ m;
        }
        tag
    }
}

/// Provider backed by the RustCrypto crates and the operating system RNG.
#[derive(Debug)]
pub struct RustCryptoProvider {
    _private: (),
}

impl RustCryptoProvider {
    /// Create the provider, drawing once from the system RNG so an
    /// unusable random source fails here rather than at first use.
    pub fn new() -> Result<Self, CryptoError> {
        let mut canary = Zeroizing::new([0u8; 32]);
        OsRng
            .try_fill_bytes(canary.as_mut())
            .map_err(|e| CryptoError::RandomUnavailable(e.to_string()))?;
        tracing::debug!("system random source initialised");
        Ok(Self { _private: () })
    }
}

impl CryptoProvider for RustCryptoProvider {
    fn random_bytes(&self, len: usize) -> Result<Vec<u8>, CryptoError> {
        let mut out = vec![0u8; len];
        OsRng
            .try_fill_bytes(&mut out)
            .map_err(|e| CryptoError::RandomUnavailable(e.to_string()))?;
        Ok(out)
    }
}

/// Deterministic provider for reproducible tests.
pub struct SeededCryptoProvider {
    rng: Mutex<StdRng>,
}

impl SeededCryptoProvider {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl CryptoProvider for SeededCryptoProvider {
    fn random_bytes(&self, len: usize) -> Result<Vec<u8>, CryptoError> {
        let mut out = vec![0u8; len];
        self.rng.lock().fill_bytes(&mut out);
        Ok(out)
    }
}

//! Optional, composable byte-to-byte transforms with inverses, applied
//! between the transcoder and the recorder: `transcode -> compress? ->
//! encrypt?` at write, the inverse at read.
use crate::Result;

/// A byte-to-byte compression stage.
pub trait Compressor: Send + Sync {
    /// Compresses a byte payload.
    fn compress(&self, bytes: &[u8]) -> Result<Vec<u8>>;
    /// Decompresses a byte payload produced by [`Compressor::compress`].
    fn decompress(&self, bytes: &[u8]) -> Result<Vec<u8>>;
}

/// A byte-to-byte encryption stage.
///
/// Decryption failures (authentication mismatch, wrong key) must surface as
/// `Error::Cipher`; implementations must never silently return partial or
/// unauthenticated plaintext.
pub trait Cipher: Send + Sync {
    /// Encrypts a byte payload.
    fn encrypt(&self, bytes: &[u8]) -> Result<Vec<u8>>;
    /// Decrypts a byte payload produced by [`Cipher::encrypt`].
    fn decrypt(&self, bytes: &[u8]) -> Result<Vec<u8>>;
}

/// A no-op compressor. The default when no `Compressor` is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityCompressor;

impl Compressor for IdentityCompressor {
    fn compress(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        Ok(bytes.to_vec())
    }

    fn decompress(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        Ok(bytes.to_vec())
    }
}

/// A gzip-based [`Compressor`], enabled via the `gzip-compression` feature.
#[cfg(feature = "gzip-compression")]
#[derive(Debug, Default, Clone, Copy)]
pub struct GzipCompressor;

#[cfg(feature = "gzip-compression")]
impl Compressor for GzipCompressor {
    fn compress(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        use std::io::Write;

        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder
            .write_all(bytes)
            .map_err(|e| Error::Encoding(e.to_string()))?;
        encoder.finish().map_err(|e| Error::Encoding(e.to_string()))
    }

    fn decompress(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        use std::io::Read;

        let mut decoder = flate2::read::GzDecoder::new(bytes);
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| Error::Decoding(e.to_string()))?;
        Ok(out)
    }
}

/// An AES-256-GCM [`Cipher`], enabled via the `aes-gcm-cipher` feature.
///
/// Each call to [`AesGcmCipher::encrypt`] generates a fresh random 96-bit
/// nonce and prepends it to the ciphertext; [`AesGcmCipher::decrypt`] reads
/// it back off the front. Authentication-tag failure (wrong key, tampered
/// state) surfaces as `Error::Cipher`, never partial plaintext.
#[cfg(feature = "aes-gcm-cipher")]
pub struct AesGcmCipher {
    key: aes_gcm::Key<aes_gcm::Aes256Gcm>,
}

#[cfg(feature = "aes-gcm-cipher")]
impl AesGcmCipher {
    /// Creates a cipher from a 32-byte key.
    pub fn new(key: [u8; 32]) -> Self {
        Self {
            key: key.into(),
        }
    }
}

#[cfg(feature = "aes-gcm-cipher")]
impl Cipher for AesGcmCipher {
    fn encrypt(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
        use aes_gcm::Aes256Gcm;

        let cipher = Aes256Gcm::new(&self.key);
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, bytes)
            .map_err(|e| Error::Cipher(e.to_string()))?;

        let mut out = Vec::with_capacity(nonce.len() + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        use aes_gcm::aead::{Aead, KeyInit};
        use aes_gcm::{Aes256Gcm, Nonce};

        const NONCE_LEN: usize = 12;
        if bytes.len() < NONCE_LEN {
            return Err(Error::Cipher("ciphertext too short".to_string()));
        }
        let (nonce_bytes, ciphertext) = bytes.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        let cipher = Aes256Gcm::new(&self.key);
        cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| Error::Cipher(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_compressor_round_trips() {
        let c = IdentityCompressor;
        let data = b"dinosaurs";
        let compressed = c.compress(data).expect("compress");
        let decompressed = c.decompress(&compressed).expect("decompress");
        assert_eq!(decompressed, data);
    }

    #[cfg(feature = "gzip-compression")]
    #[test]
    fn gzip_compressor_round_trips() {
        let c = GzipCompressor;
        let data = b"trucks trucks trucks trucks trucks";
        let compressed = c.compress(data).expect("compress");
        assert!(compressed.len() < data.len() * 2);
        let decompressed = c.decompress(&compressed).expect("decompress");
        assert_eq!(decompressed, data);
    }

    #[cfg(feature = "aes-gcm-cipher")]
    #[test]
    fn aes_gcm_cipher_round_trips_and_rejects_wrong_key() {
        let key1 = [1u8; 32];
        let key2 = [2u8; 32];
        let cipher1 = AesGcmCipher::new(key1);
        let cipher2 = AesGcmCipher::new(key2);

        let plaintext = b"internet";
        let ciphertext = cipher1.encrypt(plaintext).expect("encrypt");

        assert!(!ciphertext
            .windows(plaintext.len())
            .any(|w| w == plaintext));

        let decrypted = cipher1.decrypt(&ciphertext).expect("decrypt with right key");
        assert_eq!(decrypted, plaintext);

        let err = cipher2
            .decrypt(&ciphertext)
            .expect_err("decrypt with wrong key must fail");
        assert!(matches!(err, Error::Cipher(_)));
    }
}

//! Chunk decryption and bounded reads
//!
//! A content blob is AES-CBC ciphertext of one plaintext chunk, PKCS#7
//! padded. The cipher width follows the stream key length: legacy streams
//! carry 16-byte keys (AES-128), newer ones 32-byte keys (AES-256).

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyIvInit};
use bytes::Bytes;

use crate::error::{PlayerError, Result};
use crate::stream::descriptor::MAX_CHUNK_SIZE;

type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Decrypt one content blob into its plaintext chunk.
pub fn decrypt_chunk(key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Bytes> {
    if iv.len() != 16 {
        return Err(PlayerError::Decryption(format!(
            "iv must be 16 bytes, got {}",
            iv.len()
        )));
    }
    if ciphertext.is_empty() || ciphertext.len() % 16 != 0 {
        return Err(PlayerError::Decryption(format!(
            "ciphertext length {} is not a positive multiple of the block size",
            ciphertext.len()
        )));
    }

    let plaintext = match key.len() {
        16 => Aes128CbcDec::new_from_slices(key, iv)
            .map_err(|e| PlayerError::Decryption(e.to_string()))?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext),
        32 => Aes256CbcDec::new_from_slices(key, iv)
            .map_err(|e| PlayerError::Decryption(e.to_string()))?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext),
        n => {
            return Err(PlayerError::Decryption(format!(
                "unsupported key length {n}"
            )))
        }
    }
    .map_err(|_| PlayerError::Decryption("bad PKCS#7 padding".into()))?;

    if plaintext.len() > MAX_CHUNK_SIZE {
        return Err(PlayerError::Decryption(format!(
            "plaintext of {} bytes exceeds the chunk limit",
            plaintext.len()
        )));
    }

    Ok(Bytes::from(plaintext))
}

/// A decrypted chunk positioned for random-access reads.
#[derive(Debug, Clone)]
pub struct ReadableChunk {
    data: Bytes,
}

impl ReadableChunk {
    pub fn new(data: Bytes) -> Self {
        Self { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Copy at most `min(max_len, len - offset)` bytes into the front of
    /// `dest`, returning how many were written.
    pub fn read(&self, offset: usize, max_len: usize, dest: &mut [u8]) -> Result<usize> {
        if offset >= self.data.len() {
            return Err(PlayerError::OutOfBounds);
        }
        let n = max_len.min(self.data.len() - offset).min(dest.len());
        dest[..n].copy_from_slice(&self.data[offset..offset + n]);
        Ok(n)
    }
}

#[cfg(test)]
pub(crate) fn encrypt_chunk(key: &[u8], iv: &[u8], plaintext: &[u8]) -> Vec<u8> {
    use aes::cipher::BlockEncryptMut;
    match key.len() {
        16 => cbc::Encryptor::<aes::Aes128>::new_from_slices(key, iv)
            .unwrap()
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
        32 => cbc::Encryptor::<aes::Aes256>::new_from_slices(key, iv)
            .unwrap()
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
        n => panic!("unsupported key length {n}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 32] = [7u8; 32];
    const IV: [u8; 16] = [9u8; 16];

    #[test]
    fn decrypts_what_it_encrypted() {
        let plaintext = b"twenty bytes of song".to_vec();
        let ciphertext = encrypt_chunk(&KEY, &IV, &plaintext);
        assert_eq!(ciphertext.len() % 16, 0);

        let decrypted = decrypt_chunk(&KEY, &IV, &ciphertext).unwrap();
        assert_eq!(&decrypted[..], &plaintext[..]);
    }

    #[test]
    fn supports_legacy_short_keys() {
        let key = [3u8; 16];
        let ciphertext = encrypt_chunk(&key, &IV, b"legacy");
        assert_eq!(&decrypt_chunk(&key, &IV, &ciphertext).unwrap()[..], b"legacy");
    }

    #[test]
    fn wrong_key_fails_padding() {
        let ciphertext = encrypt_chunk(&KEY, &IV, &[0x55u8; 1000]);
        let wrong = [8u8; 32];
        assert!(matches!(
            decrypt_chunk(&wrong, &IV, &ciphertext),
            Err(PlayerError::Decryption(_))
        ));
    }

    #[test]
    fn rejects_unaligned_ciphertext() {
        assert!(decrypt_chunk(&KEY, &IV, &[0u8; 15]).is_err());
        assert!(decrypt_chunk(&KEY, &IV, &[]).is_err());
    }

    #[test]
    fn readable_chunk_bounds() {
        let chunk = ReadableChunk::new(Bytes::from_static(b"0123456789"));
        let mut dest = [0u8; 4];

        assert_eq!(chunk.read(0, 4, &mut dest).unwrap(), 4);
        assert_eq!(&dest, b"0123");

        assert_eq!(chunk.read(8, 10, &mut dest).unwrap(), 2);
        assert_eq!(&dest[..2], b"89");

        assert!(matches!(
            chunk.read(10, 1, &mut dest),
            Err(PlayerError::OutOfBounds)
        ));
    }
}

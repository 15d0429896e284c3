//! AES-128 primitives used by the Tuya LAN protocol.
//! ECB with PKCS7 padding (v3.1 - v3.4 payloads, UDP announcements) and
//! GCM (v3.5 frames, 6699 announcements).

use crate::error::{Result, TuyaError};
use aes::Aes128;
use aes_gcm::{
    Aes128Gcm, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use cipher::{BlockDecryptMut, BlockEncryptMut};
use ecb::{Decryptor, Encryptor};
use md5::{Digest, Md5};
use std::sync::OnceLock;

const BLOCK: usize = 16;
const GCM_NONCE_LEN: usize = 12;
const UDP_KEY_SEED: &[u8] = b"yGAdlopoPVldABfn";

static UDP_KEY: OnceLock<[u8; 16]> = OnceLock::new();

/// Key used by devices to encrypt their UDP presence announcements.
pub fn udp_key() -> &'static [u8; 16] {
    UDP_KEY.get_or_init(|| {
        let digest = Md5::digest(UDP_KEY_SEED);
        let mut key = [0u8; 16];
        key.copy_from_slice(&digest);
        key
    })
}

/// TuyaCipher wraps one 16-byte key for both ECB and GCM use.
pub struct TuyaCipher {
    key: [u8; 16],
    gcm: Aes128Gcm,
}

impl TuyaCipher {
    pub fn new(key: &[u8]) -> Result<Self> {
        let key: [u8; 16] = key.try_into().map_err(|_| TuyaError::EncryptionFailed)?;
        let gcm = Aes128Gcm::new(&key.into());
        Ok(Self { key, gcm })
    }

    /// AES-ECB encrypt. With `padding` the input is PKCS7 padded, otherwise it
    /// must already be block aligned.
    pub fn encrypt_ecb(&self, data: &[u8], padding: bool) -> Result<Vec<u8>> {
        let mut buf = data.to_vec();
        if padding {
            let pad = BLOCK - data.len() % BLOCK;
            buf.resize(data.len() + pad, pad as u8);
        } else if !buf.len().is_multiple_of(BLOCK) {
            return Err(TuyaError::EncryptionFailed);
        }

        let mut encryptor = Encryptor::<Aes128>::new(&self.key.into());
        for chunk in buf.chunks_mut(BLOCK) {
            encryptor.encrypt_block_mut(cipher::generic_array::GenericArray::from_mut_slice(chunk));
        }
        Ok(buf)
    }

    /// AES-ECB decrypt and strip PKCS7 padding.
    pub fn decrypt_ecb(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.is_empty() || !data.len().is_multiple_of(BLOCK) {
            return Err(TuyaError::DecryptionFailed);
        }

        let mut buf = data.to_vec();
        let mut decryptor = Decryptor::<Aes128>::new(&self.key.into());
        for chunk in buf.chunks_mut(BLOCK) {
            decryptor.decrypt_block_mut(cipher::generic_array::GenericArray::from_mut_slice(chunk));
        }

        let pad = buf[buf.len() - 1] as usize;
        if pad == 0 || pad > BLOCK || buf[buf.len() - pad..].iter().any(|&b| b as usize != pad) {
            return Err(TuyaError::DecryptionFailed);
        }
        buf.truncate(buf.len() - pad);
        Ok(buf)
    }

    /// AES-GCM encrypt. Output is `iv || ciphertext || tag`.
    pub fn encrypt_gcm(&self, data: &[u8], iv: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        if iv.len() < GCM_NONCE_LEN {
            return Err(TuyaError::EncryptionFailed);
        }
        let iv = &iv[..GCM_NONCE_LEN];
        let sealed = self
            .gcm
            .encrypt(Nonce::from_slice(iv), Payload { msg: data, aad })
            .map_err(|_| TuyaError::EncryptionFailed)?;

        let mut out = Vec::with_capacity(iv.len() + sealed.len());
        out.extend_from_slice(iv);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// AES-GCM decrypt of `ciphertext || tag` with an explicit IV.
    pub fn decrypt_gcm(&self, data: &[u8], iv: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        if iv.len() < GCM_NONCE_LEN {
            return Err(TuyaError::DecryptionFailed);
        }
        self.gcm
            .decrypt(Nonce::from_slice(&iv[..GCM_NONCE_LEN]), Payload { msg: data, aad })
            .map_err(|_| TuyaError::DecryptionFailed)
    }
}

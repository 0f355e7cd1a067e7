//! AES-CBC-then-HMAC authenticated encryption.
//!
//! Wire shape: `IV (16 bytes) || ciphertext || HMAC-SHA256(IV || ciphertext) (32 bytes)`.
//! HMAC is verified first, in constant time, before any attempt to decrypt —
//! a failing tag never reaches the cipher.

use aes::Aes256;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::{AgentError, Result};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;
type HmacSha256 = Hmac<Sha256>;

const IV_LEN: usize = 16;
const TAG_LEN: usize = 32;

/// Derive a fixed 32-byte AES key and a fixed 32-byte HMAC key from a raw
/// key of arbitrary length, the way every call site in this crate expects
/// a single opaque key (`session_key` / `staging_key`) to serve both roles.
fn split_key(key: &[u8]) -> ([u8; 32], [u8; 32]) {
    use sha2::Digest;
    let mut enc_hasher = Sha256::new();
    enc_hasher.update(b"empire-core:enc");
    enc_hasher.update(key);
    let enc_key: [u8; 32] = enc_hasher.finalize().into();

    let mut mac_hasher = Sha256::new();
    mac_hasher.update(b"empire-core:mac");
    mac_hasher.update(key);
    let mac_key: [u8; 32] = mac_hasher.finalize().into();

    (enc_key, mac_key)
}

/// `aes_encrypt_then_hmac(key, plaintext) -> ciphertext`.
pub fn aes_encrypt_then_hmac(key: &[u8], plaintext: &[u8]) -> Vec<u8> {
    let (enc_key, mac_key) = split_key(key);

    let mut iv = [0u8; IV_LEN];
    rand::rngs::OsRng.fill_bytes(&mut iv);

    let ct = Aes256CbcEnc::new(&enc_key.into(), &iv.into())
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut out = Vec::with_capacity(IV_LEN + ct.len() + TAG_LEN);
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ct);

    let mut mac = HmacSha256::new_from_slice(&mac_key).expect("HMAC accepts any key length");
    mac.update(&out);
    out.extend_from_slice(&mac.finalize().into_bytes());

    out
}

/// Verify the HMAC in constant time, then decrypt. A failing tag or a
/// padding error both collapse to [`AgentError::HmacFail`] — the caller
/// must never be able to distinguish "bad MAC" from "bad padding"
/// (a classic CBC padding oracle), so both fold into one error kind.
pub fn aes_decrypt_and_verify(key: &[u8], sealed: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < IV_LEN + TAG_LEN {
        return Err(AgentError::HmacFail);
    }

    let (enc_key, mac_key) = split_key(key);
    let (body, tag) = sealed.split_at(sealed.len() - TAG_LEN);

    let mut mac = HmacSha256::new_from_slice(&mac_key).expect("HMAC accepts any key length");
    mac.update(body);
    let expected = mac.finalize().into_bytes();

    if expected.ct_eq(tag).unwrap_u8() != 1 {
        return Err(AgentError::HmacFail);
    }

    let (iv, ct) = body.split_at(IV_LEN);
    Aes256CbcDec::new(&enc_key.into(), iv.try_into().expect("16 bytes"))
        .decrypt_padded_vec_mut::<Pkcs7>(ct)
        .map_err(|_| AgentError::HmacFail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let key = b"a staging key of arbitrary length";
        let msg = b"nonce+1|http|WORKGROUP|alice|box|10.0.0.5|Windows 10|True|powershell|1|powershell|5.1";
        let sealed = aes_encrypt_then_hmac(key, msg);
        let opened = aes_decrypt_and_verify(key, &sealed).unwrap();
        assert_eq!(opened, msg);
    }

    #[test]
    fn tampered_tag_is_rejected() {
        let key = b"key";
        let mut sealed = aes_encrypt_then_hmac(key, b"hello world");
        let last = sealed.len() - 1;
        sealed[last] ^= 0xFF;
        assert!(matches!(
            aes_decrypt_and_verify(key, &sealed),
            Err(AgentError::HmacFail)
        ));
    }

    #[test]
    fn wrong_key_is_rejected() {
        let sealed = aes_encrypt_then_hmac(b"key-a", b"hello world");
        assert!(aes_decrypt_and_verify(b"key-b", &sealed).is_err());
    }

    #[test]
    fn short_input_is_rejected() {
        assert!(matches!(
            aes_decrypt_and_verify(b"key", &[0u8; 10]),
            Err(AgentError::HmacFail)
        ));
    }
}

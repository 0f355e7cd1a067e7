//! PowerShell-compatible RSA: parsing `.NET`'s `<RSAKeyValue>` XML export
//! and PKCS#1 v1.5 encryption against it.

use regex::Regex;
use rsa::{BigUint, Pkcs1v15Encrypt, RsaPublicKey};

use crate::error::{AgentError, Result};

const MIN_MODULUS_BITS: usize = 1024;

/// Parse a `<RSAKeyValue><Modulus>…</Modulus><Exponent>…</Exponent></RSAKeyValue>`
/// document (the format `RSACryptoServiceProvider.ToXmlString(false)`
/// produces) into an [`RsaPublicKey`].
///
/// This is a two-field extraction, not a general XML document — a small
/// regex is enough and avoids pulling in a full XML parser for a format
/// with no nesting, attributes, or namespaces to speak of.
pub fn rsa_xml_to_key(xml: &str) -> Result<RsaPublicKey> {
    let modulus_re = Regex::new(r"<Modulus>([^<]+)</Modulus>").expect("valid regex");
    let exponent_re = Regex::new(r"<Exponent>([^<]+)</Exponent>").expect("valid regex");

    let modulus_b64 = modulus_re
        .captures(xml)
        .and_then(|c| c.get(1))
        .ok_or(AgentError::InvalidKeyFormat)?
        .as_str();
    let exponent_b64 = exponent_re
        .captures(xml)
        .and_then(|c| c.get(1))
        .ok_or(AgentError::InvalidKeyFormat)?
        .as_str();

    let modulus_bytes = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, modulus_b64)
        .map_err(|_| AgentError::InvalidKeyFormat)?;
    let exponent_bytes = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, exponent_b64)
        .map_err(|_| AgentError::InvalidKeyFormat)?;

    if modulus_bytes.len() * 8 < MIN_MODULUS_BITS {
        return Err(AgentError::InvalidKeyFormat);
    }

    let n = BigUint::from_bytes_be(&modulus_bytes);
    let e = BigUint::from_bytes_be(&exponent_bytes);

    RsaPublicKey::new(n, e).map_err(|_| AgentError::InvalidKeyFormat)
}

/// `rsa_encrypt(pub, plaintext) -> ct`, PKCS#1 v1.5 padding.
pub fn rsa_encrypt(key: &RsaPublicKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    key.encrypt(&mut rand::rngs::OsRng, Pkcs1v15Encrypt, plaintext)
        .map_err(|_| AgentError::InvalidKeyFormat)
}

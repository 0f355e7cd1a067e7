//! Cryptographic primitives: AES-CBC-then-HMAC authenticated encryption,
//! RSA (PowerShell handshake), Diffie-Hellman (Python handshake), and
//! nonce generation.

pub mod aes;
pub mod dh;
pub mod nonce;
pub mod rsa_xml;

pub use aes::{aes_decrypt_and_verify, aes_encrypt_then_hmac};
pub use dh::{dh_derive, dh_generate, DhKeyPair};
pub use nonce::random_nonce;
pub use rsa_xml::{rsa_encrypt, rsa_xml_to_key};

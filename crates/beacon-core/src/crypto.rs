//! Cryptographic utilities for Beacon
//!
//! Provides:
//! - Peer id generation from the OS entropy source
//! - Salted BLAKE3 password digests for the credential store

pub use getrandom::Error as RngError;

/// Bytes of entropy in a peer id
pub const PEER_ID_BYTES: usize = 8;

/// Bytes of salt per stored password
pub const SALT_BYTES: usize = 16;

/// Domain separation for password digests
const PASSWORD_CONTEXT: &str = "beacon 2024-01 credential store password digest";

/// Generate a random peer id (16 lowercase hex characters)
pub fn try_generate_peer_id() -> Result<String, RngError> {
    let mut bytes = [0u8; PEER_ID_BYTES];
    getrandom::getrandom(&mut bytes)?;
    Ok(hex::encode(bytes))
}

/// Check that a string has the shape of a server-issued peer id
pub fn is_valid_peer_id(id: &str) -> bool {
    id.len() == PEER_ID_BYTES * 2 && id.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Generate a random hex-encoded salt
pub fn generate_salt() -> Result<String, RngError> {
    let mut bytes = [0u8; SALT_BYTES];
    getrandom::getrandom(&mut bytes)?;
    Ok(hex::encode(bytes))
}

/// Digest a password with its salt, hex-encoded
pub fn hash_password(salt: &str, password: &str) -> String {
    let mut hasher = blake3::Hasher::new_derive_key(PASSWORD_CONTEXT);
    hasher.update(salt.as_bytes());
    hasher.update(&[0]);
    hasher.update(password.as_bytes());
    hasher.finalize().to_hex().to_string()
}

/// Verify a password against a stored digest.
///
/// The comparison runs on `blake3::Hash`, whose equality is constant-time.
pub fn verify_password(salt: &str, password: &str, expected_hex: &str) -> bool {
    let Ok(expected) = blake3::Hash::from_hex(expected_hex) else {
        return false;
    };
    match blake3::Hash::from_hex(hash_password(salt, password)) {
        Ok(actual) => actual == expected,
        Err(_) => false,
    }
}

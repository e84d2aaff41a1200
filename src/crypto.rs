// src/crypto.rs
use rand::distributions::Alphanumeric;
use rand::{Rng, RngCore};

/// A random alphanumeric string of `size` characters.
pub fn random_string(size: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(size)
        .map(char::from)
        .collect()
}

/// `size` random bytes, hex encoded.
pub fn random_hex_string(size: usize) -> String {
    let mut bytes = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub fn new_object_id(size: usize) -> String {
    random_string(size)
}

/// A session token: `r:` followed by 32 hex characters.
pub fn new_token() -> String {
    format!("r:{}", random_hex_string(16))
}

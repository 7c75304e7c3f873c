//! Bearer token generation and comparison.

use rand::RngCore;

/// Random bytes per token (hex-encoded to twice as many characters).
const TOKEN_BYTES: usize = 24;

/// Generates a random bearer token: 48 lowercase hex characters.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Compares a presented token with the configured one.
///
/// The running time depends only on the lengths, not on where the first
/// differing byte is.
pub fn tokens_match(presented: &str, expected: &str) -> bool {
    let presented = presented.as_bytes();
    let expected = expected.as_bytes();
    let diff = presented
        .iter()
        .zip(expected)
        .fold(0u8, |acc, (a, b)| acc | (a ^ b));
    diff == 0 && presented.len() == expected.len()
}

//! Short opaque identifiers: machine IDs and API key secrets are both
//! random base62 strings, never sequential or guessable.

use rand::Rng;

const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Generates a random base62 token of `len` characters (<= 16 per spec).
pub fn generate(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| {
            let idx = rng.gen_range(0..ALPHABET.len());
            ALPHABET[idx] as char
        })
        .collect()
}

/// A new machine ID: a 12-character base62 token.
pub fn new_machine_id() -> String {
    generate(12)
}

/// A new API key secret and its public prefix (the first 8 characters,
/// safe to log and to use for non-authenticating lookup hints).
pub fn new_api_key_secret() -> (String, String) {
    let secret = generate(16);
    let prefix = secret[..8].to_string();
    (secret, prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_respects_length_and_alphabet() {
        let token = generate(16);
        assert_eq!(token.len(), 16);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn machine_ids_are_not_trivially_repeated() {
        let a = new_machine_id();
        let b = new_machine_id();
        assert_eq!(a.len(), 12);
        assert_ne!(a, b);
    }

    #[test]
    fn api_key_prefix_is_a_true_prefix_of_the_secret() {
        let (secret, prefix) = new_api_key_secret();
        assert!(secret.starts_with(&prefix));
        assert_eq!(prefix.len(), 8);
    }
}

//! Generators produce the random material of the protocol.
//!
//! Two kinds of output are needed:
//!     - Raw bytes, for association secrets, Diffie-Hellman private keys and handles.
//!     - Short alphanumeric tokens, for the nonces of replay protected messages. The entropy of
//!     these is expressed as the size of the keyspace they are drawn from.
use base64::encode;
use rand::rngs::OsRng;
use rand::{Rng, RngCore};

/// Characters a nonce token is drawn from.
pub const NONCE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Generates random bytes and tokens from the operating system source.
///
/// Each byte is chosen randomly from `rand::rngs::OsRng`. This generator will always succeed.
#[derive(Clone, Copy, Debug, Default)]
pub struct RandomGenerator {
    random: OsRng,
}

impl RandomGenerator {
    /// Create a generator backed by the operating system.
    pub fn new() -> RandomGenerator {
        RandomGenerator { random: OsRng }
    }

    /// Fill a fresh buffer of `len` random bytes.
    pub fn bytes(&self, len: usize) -> Vec<u8> {
        let mut result = vec![0; len];
        let mut rnd = self.random;
        rnd.fill_bytes(result.as_mut_slice());
        result
    }

    /// A base64 encoded token of `len` random bytes.
    pub fn token(&self, len: usize) -> String {
        encode(&self.bytes(len))
    }

    /// A string of `len` characters drawn uniformly from `alphabet`.
    pub fn string(&self, len: usize, alphabet: &[u8]) -> String {
        let mut rnd = self.random;
        (0..len)
            .map(|_| alphabet[rnd.gen_range(0..alphabet.len())] as char)
            .collect()
    }
}

/// Generates the nonce tokens attached to replay protected messages.
#[derive(Clone, Copy, Debug)]
pub struct NonceGenerator {
    random: RandomGenerator,
    len: usize,
}

impl NonceGenerator {
    /// Generate nonces of exactly `length` characters.
    pub fn new(length: usize) -> NonceGenerator {
        NonceGenerator {
            random: RandomGenerator::new(),
            len: length,
        }
    }

    /// Generate nonces from a keyspace at least as large as `strength`.
    ///
    /// The length is rounded up: asking for a keyspace between two powers of the alphabet size
    /// yields the longer nonce, never a weaker one. The length is at least one.
    pub fn with_strength(strength: f64) -> NonceGenerator {
        let base = NONCE_ALPHABET.len() as f64;
        let mut len = 1;
        let mut keyspace = base;
        while keyspace < strength {
            keyspace *= base;
            len += 1;
        }

        NonceGenerator::new(len)
    }

    /// The length of generated nonces.
    pub fn len(&self) -> usize {
        self.len
    }

    /// The size of the keyspace nonces are drawn from.
    pub fn strength(&self) -> f64 {
        (NONCE_ALPHABET.len() as f64).powi(self.len as i32)
    }

    /// Draw a fresh nonce.
    pub fn generate(&self) -> String {
        self.random.string(self.len, NONCE_ALPHABET)
    }
}

impl Default for NonceGenerator {
    fn default() -> Self {
        NonceGenerator::new(8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[allow(dead_code, unused)]
    fn assert_send_sync_static() {
        fn uses<T: Send + Sync + 'static>(arg: T) {}
        let _ = uses(RandomGenerator::new());
        let _ = uses(NonceGenerator::new(8));
    }

    #[test]
    fn strength_rounds_up() {
        assert_eq!(NonceGenerator::with_strength(1.0).len(), 1);
        assert_eq!(NonceGenerator::with_strength(62.0).len(), 1);
        assert_eq!(NonceGenerator::with_strength(63.0).len(), 2);
        assert_eq!(NonceGenerator::with_strength(62f64.powi(8)).len(), 8);
        assert_eq!(NonceGenerator::with_strength(62f64.powi(8) + 1e6).len(), 9);
    }

    #[test]
    fn nonces_use_alphabet() {
        let generator = NonceGenerator::new(32);
        let nonce = generator.generate();
        assert_eq!(nonce.len(), 32);
        assert!(nonce.bytes().all(|b| NONCE_ALPHABET.contains(&b)));
        assert_ne!(nonce, generator.generate());
    }

    #[test]
    fn bytes_have_length() {
        let random = RandomGenerator::new();
        assert_eq!(random.bytes(20).len(), 20);
        assert_ne!(random.bytes(20), random.bytes(20));
    }
}

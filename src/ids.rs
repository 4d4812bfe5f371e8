//! Opaque token generation for dedup keys and lease tokens.

use rand::Rng;

/// Source of globally-unique opaque tokens.
///
/// Used for generated dedup keys and for every lease token handed out by
/// `get`. Collisions between lease tokens would let one consumer observe
/// another's claim, so implementations must not repeat values.
pub trait IdGenerator: Send + Sync + 'static {
    fn generate(&self) -> String;
}

/// Default generator: 16 random bytes, base58 encoded.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomTokens;

impl IdGenerator for RandomTokens {
    fn generate(&self) -> String {
        generate_token::<16>(rand::thread_rng())
    }
}

/// Generates a random token of size N bytes, encoded in base58.
pub fn generate_token<const N: usize>(mut rng: impl Rng) -> String {
    let mut token = [0u8; N];
    rng.fill(&mut token[..]);
    bs58::encode(token).into_string()
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn tokens_are_distinct() {
        let ids = RandomTokens;
        let tokens: HashSet<String> = (0..1000).map(|_| ids.generate()).collect();
        assert_eq!(tokens.len(), 1000);
    }

    #[test]
    fn token_is_base58() {
        let token = generate_token::<16>(rand::thread_rng());
        let decoded = bs58::decode(&token).into_vec().unwrap();
        assert_eq!(decoded.len(), 16);
    }
}

use rand_chacha::ChaCha8Rng;
use rand_core::{RngCore, SeedableRng};

/// Source of collision-resistant names for snapshots and reproducer directories.
///
/// Seeded from entropy by default. A fixed seed makes the generated names
/// reproducible across runs, which is handy in tests and when replaying a session.
#[derive(Debug, Clone)]
pub struct IdGenerator {
    rng: ChaCha8Rng,
}

impl IdGenerator {
    pub fn from_entropy() -> Self {
        Self::seeded(rand::random())
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    pub fn from_optional_seed(seed: Option<u64>) -> Self {
        match seed {
            Some(seed) => Self::seeded(seed),
            None => Self::from_entropy(),
        }
    }

    /// 16 lowercase hex characters.
    pub fn next_id(&mut self) -> String {
        format!("{:016x}", self.rng.next_u64())
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::from_entropy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn ids_are_fixed_width_hex() {
        let mut ids = IdGenerator::seeded(7);
        let id = ids.next_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn same_seed_yields_same_sequence() {
        let mut a = IdGenerator::seeded(42);
        let mut b = IdGenerator::seeded(42);
        for _ in 0..8 {
            assert_eq!(a.next_id(), b.next_id());
        }
    }

    #[test]
    fn ids_do_not_repeat_within_a_session() {
        let mut ids = IdGenerator::from_entropy();
        let seen: HashSet<String> = (0..1000).map(|_| ids.next_id()).collect();
        assert_eq!(seen.len(), 1000);
    }
}

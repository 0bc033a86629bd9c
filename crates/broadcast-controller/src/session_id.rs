//! Human-readable session identifiers of the form `adjective-noun-NNN`.
//!
//! Uniqueness is enforced by the store (`PutMode::IfAbsent`); this module
//! only generates candidates and validates the shape of client input.

use rand::seq::SliceRandom;
use rand::Rng;

/// Candidates tried before session creation gives up.
pub const MAX_SESSION_ID_ATTEMPTS: usize = 10;

const ADJECTIVES: &[&str] = &[
    "amber", "bold", "brave", "bright", "calm", "clever", "cosmic", "crisp", "daring", "eager",
    "gentle", "golden", "grand", "happy", "humble", "jolly", "keen", "kind", "lively", "lucky",
    "mellow", "merry", "mighty", "noble", "quick", "quiet", "rapid", "silver", "steady", "sunny",
    "swift", "tidy", "vivid", "warm", "wise", "zesty",
];

const NOUNS: &[&str] = &[
    "badger", "beacon", "breeze", "canyon", "cedar", "comet", "coral", "crane", "delta", "falcon",
    "forest", "harbor", "heron", "island", "lagoon", "maple", "meadow", "glacier", "orbit", "otter",
    "panda", "pebble", "pine", "river", "robin", "summit", "thunder", "tiger", "valley", "willow",
];

/// Generate one candidate id.
pub fn generate<R: Rng + ?Sized>(rng: &mut R) -> String {
    let adjective = ADJECTIVES.choose(rng).copied().unwrap_or("calm");
    let noun = NOUNS.choose(rng).copied().unwrap_or("otter");
    let number: u16 = rng.gen_range(0..1000);
    format!("{adjective}-{noun}-{number:03}")
}

/// Whether `candidate` has the shape of a generated id.
pub fn is_well_formed(candidate: &str) -> bool {
    let mut parts = candidate.split('-');
    let (Some(adjective), Some(noun), Some(number), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    let is_word = |w: &str| !w.is_empty() && w.len() <= 20 && w.bytes().all(|b| b.is_ascii_lowercase());
    is_word(adjective) && is_word(noun) && number.len() == 3 && number.bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_generated_ids_are_well_formed() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..500 {
            let id = generate(&mut rng);
            assert!(is_well_formed(&id), "{id}");
        }
    }

    #[test]
    fn test_shape_validation() {
        assert!(is_well_formed("calm-otter-042"));
        assert!(!is_well_formed("calm-otter-42"));
        assert!(!is_well_formed("Calm-otter-042"));
        assert!(!is_well_formed("calm-otter-042-x"));
        assert!(!is_well_formed("calm--042"));
        assert!(!is_well_formed("session:calm-otter-042"));
        assert!(!is_well_formed(""));
    }
}

//! Human-friendly subdomain labels.

use rand::Rng;

const ADJECTIVES: &[&str] = &[
    "happy", "sunny", "bright", "swift", "calm", "cool", "warm", "quick", "smart", "fresh",
    "clear", "light", "smooth", "sharp", "clean", "brave", "quiet", "gentle",
];

const NOUNS: &[&str] = &[
    "cloud", "wave", "star", "moon", "wind", "rain", "snow", "fire", "lake", "tree", "river",
    "mountain", "valley", "ocean", "forest", "meadow", "stone", "ember",
];

/// Generate a label of the form `adjective-noun-NNNN`.
pub fn generate() -> String {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES[rng.gen_range(0..ADJECTIVES.len())];
    let noun = NOUNS[rng.gen_range(0..NOUNS.len())];
    let number: u16 = rng.gen_range(0..10000);
    format!("{adjective}-{noun}-{number:04}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_expected_shape() {
        for _ in 0..100 {
            let name = generate();
            let parts: Vec<&str> = name.split('-').collect();
            assert_eq!(parts.len(), 3, "{name}");
            assert!(parts[0].chars().all(|c| c.is_ascii_lowercase()));
            assert!(parts[1].chars().all(|c| c.is_ascii_lowercase()));
            assert_eq!(parts[2].len(), 4);
            assert!(parts[2].chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn word_lists_are_large_enough() {
        assert!(ADJECTIVES.len() >= 15);
        assert!(NOUNS.len() >= 15);
    }
}

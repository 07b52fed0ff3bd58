//! Two-word kebab-case project names.

use rand::seq::SliceRandom;
use rand::Rng;

const ADJECTIVES: &[&str] = &[
    "amber", "ancient", "bold", "brave", "bright", "calm", "clever", "cosmic", "crimson", "curly",
    "dapper", "eager", "electric", "fancy", "fluffy", "gentle", "golden", "happy", "hidden",
    "humble", "icy", "jolly", "kind", "lively", "lucky", "mellow", "misty", "nimble", "noble",
    "odd", "polite", "proud", "quiet", "rapid", "rustic", "shiny", "silent", "silly", "sleepy",
    "snowy", "sunny", "swift", "tidy", "tiny", "vivid", "wandering", "witty", "young", "zesty",
];

const NOUNS: &[&str] = &[
    "apple", "badger", "beacon", "breeze", "canyon", "castle", "cloud", "comet", "coral",
    "dragon", "falcon", "forest", "garden", "glacier", "harbor", "island", "jungle", "kitten",
    "lagoon", "lantern", "meadow", "meteor", "mountain", "nebula", "ocean", "orchid", "otter",
    "panda", "pebble", "pepper", "planet", "puffin", "quartz", "rabbit", "river", "rocket",
    "sparrow", "spruce", "summit", "tiger", "tulip", "valley", "violet", "walrus", "willow",
    "window", "wizard", "yak", "zebra",
];

/// Random slug like `brave-otter`.
pub fn generate() -> String {
    generate_with(&mut rand::thread_rng())
}

pub fn generate_with<R: Rng + ?Sized>(rng: &mut R) -> String {
    let adjective = ADJECTIVES.choose(rng).copied().unwrap_or("bright");
    let noun = NOUNS.choose(rng).copied().unwrap_or("comet");
    format!("{adjective}-{noun}")
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    #[test]
    fn slugs_are_two_lowercase_words() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let slug = generate_with(&mut rng);
            let parts: Vec<_> = slug.split('-').collect();
            assert_eq!(parts.len(), 2, "{slug}");
            assert!(ADJECTIVES.contains(&parts[0]));
            assert!(NOUNS.contains(&parts[1]));
            assert!(slug.chars().all(|c| c.is_ascii_lowercase() || c == '-'));
        }
    }

    #[test]
    fn seeded_generation_is_deterministic() {
        let a = generate_with(&mut StdRng::seed_from_u64(42));
        let b = generate_with(&mut StdRng::seed_from_u64(42));
        assert_eq!(a, b);
    }
}

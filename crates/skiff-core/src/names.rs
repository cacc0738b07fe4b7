//! Default instance name generation.

use crate::hypervisor::NameGenerator;
use rand::seq::SliceRandom;

const ADJECTIVES: [&str; 24] = [
    "able", "brave", "calm", "daring", "eager", "fond", "gentle", "handy", "ideal", "jolly",
    "keen", "lively", "merry", "nimble", "polite", "quick", "rapid", "sturdy", "tidy", "upbeat",
    "vivid", "warm", "young", "zesty",
];

const ANIMALS: [&str; 24] = [
    "auk", "bat", "crane", "dingo", "eel", "finch", "gecko", "heron", "ibis", "jay", "koala",
    "lemur", "mole", "newt", "otter", "pika", "quail", "raven", "stoat", "tapir", "urchin",
    "vole", "wren", "yak",
];

/// Generates adjective-animal names like `brave-otter`.
#[derive(Debug, Default)]
pub struct DefaultNameGenerator;

impl NameGenerator for DefaultNameGenerator {
    fn make_name(&self) -> String {
        let mut rng = rand::thread_rng();
        let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("brave");
        let animal = ANIMALS.choose(&mut rng).copied().unwrap_or("otter");
        format!("{adjective}-{animal}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::valid_hostname;

    #[test]
    fn test_generated_names_are_valid_hostnames() {
        let generator = DefaultNameGenerator;
        for _ in 0..32 {
            assert!(valid_hostname(&generator.make_name()));
        }
    }
}

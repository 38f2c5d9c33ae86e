//! Message composition: variant selection and the greeting composite.

use rand::{rngs::StdRng, seq::IndexedRandom, Rng};

/// Openers for the greeting composite.
const GREETINGS: &[&str] = &[
    "Hello everyone",
    "Hey there",
    "Hi all",
    "Greetings",
    "Good day folks",
    "Hey guys",
];

/// Tails appended to the opener.
const FLOURISHES: &[&str] = &["!", "! 👋", " :)", "!!", "! 🙌"];

/// Pick one template variant uniformly from the channel's allowed set.
/// An empty set falls back to the universal variant `"0"`.
pub fn pick_variant(available: &[String], rng: &mut StdRng) -> String {
    available
        .choose(rng)
        .cloned()
        .unwrap_or_else(|| "0".to_string())
}

/// Build the outgoing text. Unrestricted channels get a randomized
/// greeting composite on a coin flip; everything else gets the raw
/// template.
pub fn compose_message(template: &str, word_restriction: u32, rng: &mut StdRng) -> String {
    if word_restriction == 0 && rng.random_bool(0.5) {
        let greeting = GREETINGS.choose(rng).unwrap_or(&GREETINGS[0]);
        let flourish = FLOURISHES.choose(rng).unwrap_or(&FLOURISHES[0]);
        format!("{greeting}{flourish}\n\n{template}")
    } else {
        template.to_string()
    }
}

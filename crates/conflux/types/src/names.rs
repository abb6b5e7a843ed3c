//! Human-readable run names
//!
//! Every flow run gets an `adjective-noun` name in addition to its id so
//! observers can tell runs apart at a glance.

use rand::seq::SliceRandom;
use rand::Rng;

const ADJECTIVES: &[&str] = &[
    "amber", "bold", "brisk", "calm", "clever", "crimson", "dapper", "eager", "fuzzy", "gentle",
    "golden", "hidden", "humble", "jolly", "keen", "lively", "lucky", "mellow", "nimble", "olive",
    "patient", "quiet", "rapid", "rustic", "silent", "silver", "steady", "swift", "tidy", "vivid",
    "wandering", "witty",
];

const NOUNS: &[&str] = &[
    "badger", "beaver", "bison", "crane", "falcon", "ferret", "gecko", "heron", "ibis", "jackal",
    "kestrel", "lemur", "lynx", "marmot", "mole", "newt", "ocelot", "otter", "owl", "panda",
    "pelican", "puffin", "quail", "raven", "salamander", "seal", "stork", "tapir", "toucan",
    "walrus", "wombat", "yak",
];

/// Generate a run name using the supplied random source
pub fn generate_run_name<R: Rng + ?Sized>(rng: &mut R) -> String {
    let adjective = ADJECTIVES.choose(rng).copied().unwrap_or("nameless");
    let noun = NOUNS.choose(rng).copied().unwrap_or("run");
    format!("{}-{}", adjective, noun)
}

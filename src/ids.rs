//! Tunnel id validation and human-readable id generation.

use std::sync::LazyLock;

use rand::seq::SliceRandom;
use regex_lite::Regex;

/// Message returned with `403` when a requested tunnel name is rejected.
pub const INVALID_SUBDOMAIN_MESSAGE: &str =
    "Invalid subdomain. Subdomains must be lowercase and between 4 and 63 alphanumeric characters.";

/// Named tunnels: 4-63 lowercase alphanumerics, or a hyphenated name that
/// starts and ends with one.
const SUBDOMAIN_PATTERN: &str = r"^([a-z0-9][a-z0-9-]{4,63}[a-z0-9]|[a-z0-9]{4,63})$";

static SUBDOMAIN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(SUBDOMAIN_PATTERN).expect("subdomain pattern compiles"));

/// Check a requested tunnel name.
pub fn is_valid_subdomain(name: &str) -> bool {
    SUBDOMAIN.is_match(name)
}

const ADJECTIVES: &[&str] = &[
    "brave", "calm", "clever", "cozy", "crisp", "eager", "fancy", "gentle", "happy", "honest",
    "jolly", "kind", "lazy", "lucky", "mighty", "nice", "odd", "proud", "quick", "quiet", "rare",
    "shy", "silly", "smart", "solid", "sour", "swift", "tall", "tender", "tidy", "vast", "warm",
    "wet", "wise", "young", "zany",
];

const NOUNS: &[&str] = &[
    "apple", "badger", "bear", "bird", "bottle", "cactus", "camel", "cat", "cloud", "comet",
    "crab", "dolphin", "donkey", "dragon", "eagle", "falcon", "fox", "frog", "goat", "hornet",
    "kiwi", "lamp", "lemon", "lion", "mango", "moose", "newt", "otter", "owl", "panda", "parrot",
    "pear", "penguin", "rabbit", "river", "seal", "shark", "snake", "tiger", "walrus", "wolf",
];

const VERBS: &[&str] = &[
    "argue", "bake", "beam", "bow", "brake", "call", "care", "chew", "clap", "cough", "cry",
    "dance", "dream", "drum", "fly", "glow", "grin", "hide", "hope", "hug", "jam", "joke",
    "jump", "kick", "knit", "laugh", "leap", "look", "melt", "nod", "paint", "play", "pull",
    "push", "read", "relax", "rest", "roll", "run", "sing", "sink", "sit", "skip", "smile",
    "speak", "swim", "talk", "tell", "think", "wait", "wave", "wink", "yawn",
];

fn pick(words: &[&'static str], rng: &mut impl rand::Rng) -> &'static str {
    words.choose(rng).copied().unwrap_or("tunnel")
}

/// Generate a random `adjective-noun-verb` tunnel id, e.g. `brave-otter-sing`.
pub fn random_id() -> String {
    let mut rng = rand::thread_rng();
    let adjective = pick(ADJECTIVES, &mut rng);
    let noun = pick(NOUNS, &mut rng);
    let verb = pick(VERBS, &mut rng);
    format!("{adjective}-{noun}-{verb}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_plain_names() {
        assert!(is_valid_subdomain("abcd"));
        assert!(is_valid_subdomain("myname"));
        assert!(is_valid_subdomain("foobar123"));
        assert!(is_valid_subdomain(&"a".repeat(63)));
        // The hyphenated form also admits plain names up to 65 characters.
        assert!(is_valid_subdomain(&"a".repeat(65)));
    }

    #[test]
    fn test_valid_hyphenated_names() {
        assert!(is_valid_subdomain("foobar-test"));
        assert!(is_valid_subdomain("websocket-test"));
        assert!(is_valid_subdomain("a----b"));
        assert!(is_valid_subdomain(&format!("a{}b", "-".repeat(63))));
    }

    #[test]
    fn test_rejects_invalid_names() {
        assert!(!is_valid_subdomain(""));
        assert!(!is_valid_subdomain("abc"));
        assert!(!is_valid_subdomain("ab-c"));
        assert!(!is_valid_subdomain("a-b-c"));
        assert!(!is_valid_subdomain("MyName"));
        assert!(!is_valid_subdomain("-abcdef"));
        assert!(!is_valid_subdomain("abcdef-"));
        assert!(!is_valid_subdomain("abc_def"));
        assert!(!is_valid_subdomain("abc.def"));
        assert!(!is_valid_subdomain("abcde\n"));
        assert!(!is_valid_subdomain(" abcde"));
        assert!(!is_valid_subdomain("ünïcode"));
        assert!(!is_valid_subdomain(&"a".repeat(66)));
        assert!(!is_valid_subdomain(&format!("a{}b", "-".repeat(64))));
        assert!(!is_valid_subdomain(
            "thisdomainisoutsidethesizeofwhatweallowwhichissixtythreecharacters"
        ));
    }

    #[test]
    fn test_random_id_is_valid() {
        for _ in 0..100 {
            let id = random_id();
            assert!(is_valid_subdomain(&id), "{id}");
            assert_eq!(id.split('-').count(), 3);
        }
    }
}

//! Out-of-band identity verification.
//!
//! Two room members compare a safety number (60 decimal digits) over a trusted
//! channel; it is symmetric, so each side computes the same value regardless
//! of which key is "local". The emoji fingerprint is a per-key glance value:
//! each member has their own.

use std::fmt;

use crate::x25519::PublicKey;

/// Number of five-digit groups in a safety number.
pub const SAFETY_NUMBER_GROUPS: usize = 12;

const BYTES_PER_GROUP: usize = 5;

/// Alphabet for emoji fingerprints.
pub const EMOJI_ALPHABET: [&str; 32] = [
    "🔐", "🔑", "🛡️", "⚡", "🌟", "🎯", "🚀", "💎", "🔮", "🌈", "🎪", "🎭", "🎨", "🎸", "🎺",
    "🎻", "🌺", "🌸", "🌼", "🌻", "🍀", "🌴", "🌵", "🎄", "🦊", "🦁", "🐯", "🦄", "🐲", "🦅",
    "🦋", "🐙",
];

/// Symbols in an emoji fingerprint.
pub const EMOJI_FINGERPRINT_LEN: usize = 8;

/// A 60-digit safety number shown as 12 groups of 5 digits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SafetyNumber([u32; SAFETY_NUMBER_GROUPS]);

impl SafetyNumber {
    /// The individual groups, each in `0..100000`.
    #[must_use]
    pub fn groups(&self) -> &[u32; SAFETY_NUMBER_GROUPS] {
        &self.0
    }

    /// Digits only, without separators.
    #[must_use]
    pub fn digits(&self) -> String {
        self.0.iter().map(|g| format!("{g:05}")).collect()
    }
}

impl fmt::Display for SafetyNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, group) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{group:05}")?;
        }
        Ok(())
    }
}

fn ordered<'a>(a: &'a PublicKey, b: &'a PublicKey) -> (&'a PublicKey, &'a PublicKey) {
    if a.as_bytes() <= b.as_bytes() {
        (a, b)
    } else {
        (b, a)
    }
}

/// Compute the safety number for a pair of public keys.
///
/// Keys are sorted bytewise before hashing so the result does not depend on
/// argument order.
#[must_use]
pub fn safety_number(local: &PublicKey, remote: &PublicKey) -> SafetyNumber {
    let (first, second) = ordered(local, remote);

    let mut hasher = blake3::Hasher::new();
    hasher.update(first.as_bytes());
    hasher.update(second.as_bytes());

    let mut material = [0u8; SAFETY_NUMBER_GROUPS * BYTES_PER_GROUP];
    hasher.finalize_xof().fill(&mut material);

    let mut groups = [0u32; SAFETY_NUMBER_GROUPS];
    for (group, bytes) in groups.iter_mut().zip(material.chunks_exact(BYTES_PER_GROUP)) {
        let value = bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
        // value < 2^40, result < 100000
        *group = (value % 100_000) as u32;
    }
    SafetyNumber(groups)
}

/// Compute the 8-symbol emoji fingerprint of a single public key.
#[must_use]
pub fn emoji_fingerprint(key: &PublicKey) -> [&'static str; EMOJI_FINGERPRINT_LEN] {
    let digest = blake3::hash(key.as_bytes());
    let bytes = digest.as_bytes();
    std::array::from_fn(|i| EMOJI_ALPHABET[usize::from(bytes[i]) % EMOJI_ALPHABET.len()])
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn key(byte: u8) -> PublicKey {
        PublicKey::from_bytes([byte; 32])
    }

    #[test]
    fn test_safety_number_format() {
        let rendered = safety_number(&key(1), &key(2)).to_string();
        let groups: Vec<&str> = rendered.split(' ').collect();
        assert_eq!(groups.len(), SAFETY_NUMBER_GROUPS);
        assert!(groups.iter().all(|g| g.len() == 5 && g.bytes().all(|c| c.is_ascii_digit())));
    }

    #[test]
    fn test_safety_number_digits() {
        let number = safety_number(&key(3), &key(4));
        assert_eq!(number.digits().len(), 60);
        assert_eq!(number.digits(), number.to_string().replace(' ', ""));
    }

    #[test]
    fn test_safety_number_changes_with_key() {
        assert_ne!(safety_number(&key(1), &key(2)), safety_number(&key(1), &key(3)));
    }

    #[test]
    fn test_emoji_fingerprint_per_key() {
        let fp = emoji_fingerprint(&key(1));
        assert_eq!(fp.len(), EMOJI_FINGERPRINT_LEN);
        assert_eq!(fp, emoji_fingerprint(&key(1)));
        assert_ne!(fp, emoji_fingerprint(&key(2)));
        assert!(fp.iter().all(|e| EMOJI_ALPHABET.contains(e)));
    }

    proptest! {
        #[test]
        fn prop_safety_number_symmetric(a in any::<[u8; 32]>(), b in any::<[u8; 32]>()) {
            let (a, b) = (PublicKey::from_bytes(a), PublicKey::from_bytes(b));
            prop_assert_eq!(safety_number(&a, &b), safety_number(&b, &a));
        }

        #[test]
        fn prop_groups_in_range(a in any::<[u8; 32]>(), b in any::<[u8; 32]>()) {
            let number = safety_number(&PublicKey::from_bytes(a), &PublicKey::from_bytes(b));
            prop_assert!(number.groups().iter().all(|g| *g < 100_000));
        }
    }
}

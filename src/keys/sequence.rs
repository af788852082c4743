//! Named sequences of deterministic keys: a parent expression, a
//! derivation rule, and the next index to hand out.

use bitcoin::bip32::ChildNumber;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::keys::derivation::Derivation;
use crate::keys::expression::KeyExpr;

/// A deterministic key sequence.
///
/// Invoking the sequence applies the rule to `next` and advances it. The
/// rule path must be non-hardened so that watching-only parents can follow
/// the sequence.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySequence {
    /// The parent key, stored in public form.
    pub key: KeyExpr,
    /// The derivation rule applied before the sequence index.
    #[serde(with = "path_text")]
    pub path: Vec<ChildNumber>,
    /// The next unused index.
    pub next: u32,
}

mod path_text {
    use bitcoin::bip32::ChildNumber;
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::keys::derivation::{parse_path, render_path};

    pub fn serialize<S: Serializer>(
        path: &[ChildNumber],
        s: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(&render_path(path))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> std::result::Result<Vec<ChildNumber>, D::Error> {
        let text = String::deserialize(d)?;
        parse_path(&text).map_err(serde::de::Error::custom)
    }
}

impl KeySequence {
    /// Create a sequence starting at index 0.
    pub fn new(key: KeyExpr, path: Vec<ChildNumber>) -> Result<Self> {
        KeySequence::with_next(key, path, 0)
    }

    /// Create a sequence with an explicit next index.
    pub fn with_next(key: KeyExpr, path: Vec<ChildNumber>, next: u32) -> Result<Self> {
        if path.iter().any(|c| c.is_hardened()) {
            return Err(Error::HardenedRequiresSecret);
        }
        Ok(KeySequence { key, path, next })
    }

    /// The derivation this sequence produces at a given index.
    pub fn derivation_at(&self, index: u32) -> Result<Derivation> {
        let child =
            ChildNumber::from_normal_idx(index).map_err(|_| Error::OutOfRangeIndex(index as u64))?;
        let mut path = self.path.clone();
        path.push(child);
        Ok(Derivation::new(self.key.clone(), path))
    }

    /// The key expression at a given index, in the symbolic application
    /// form `(parent) / rule… / index`.
    pub fn expression_at(&self, index: u32) -> Result<KeyExpr> {
        let derivation = self.derivation_at(index)?;
        Ok(KeyExpr::Apply {
            parent: Box::new(derivation.parent),
            path: derivation.path,
        })
    }

    /// Produce the current key and advance. The caller persists the new
    /// index; the two must happen under the same wallet lock.
    pub fn advance(&mut self) -> Result<(KeyExpr, Derivation)> {
        let derivation = self.derivation_at(self.next)?;
        let key = derivation.derive()?;
        self.next = self
            .next
            .checked_add(1)
            .ok_or(Error::OutOfRangeIndex(u64::from(u32::MAX) + 1))?;
        Ok((key, derivation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::parse_path;

    const XPUB: &str = "xpub661MyMwAqRbcGU4rfEbR1EHqFdDyxraiXeZiFPkaiDqGbv4ToJp7C5YuLQkTBtRxL8oqjPHwWJuXUTENqLF2i7j8Bit8HqKLhEzcm6uZPPA";

    fn parent() -> KeyExpr {
        KeyExpr::parse(&format!("HD.pubkey \"{XPUB}\"")).unwrap()
    }

    #[test]
    fn advance_walks_the_rule() {
        let mut seq = KeySequence::new(parent(), parse_path("0").unwrap()).unwrap();
        let (first, first_derivation) = seq.advance().unwrap();
        let (second, _) = seq.advance().unwrap();
        assert_eq!(seq.next, 2);
        assert_ne!(first, second);
        assert_eq!(first_derivation.path, parse_path("0/0").unwrap());

        // The same key falls out of direct derivation.
        let direct = parent().derive(&parse_path("0/0").unwrap()).unwrap();
        assert_eq!(first, direct);
    }

    #[test]
    fn expression_form_evaluates_to_the_same_key() {
        let seq = KeySequence::new(parent(), parse_path("0").unwrap()).unwrap();
        let symbolic = seq.expression_at(7).unwrap();
        let direct = parent().derive(&parse_path("0/7").unwrap()).unwrap();
        assert_eq!(symbolic.evaluate().unwrap(), direct);
    }

    #[test]
    fn hardened_rules_are_rejected() {
        assert!(KeySequence::new(parent(), parse_path("0'").unwrap()).is_err());
    }
}

//! Derivations: how to get from a stored parent key to the key that
//! redeems a particular output, plus the metadata needed to build the
//! input script once the signatures exist.

use bitcoin::bip32::ChildNumber;
use bitcoin::ScriptBuf;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::keys::expression::KeyExpr;

/// A parent key expression and the path from it to a concrete key.
///
/// The parent is always stored in public form; signing walks it back to a
/// private expression through the `to_private` map. A derivation with a
/// hardened segment can only be evaluated against a secret ancestor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Derivation {
    pub parent: KeyExpr,
    pub path: Vec<ChildNumber>,
}

impl Derivation {
    pub fn new(parent: KeyExpr, path: Vec<ChildNumber>) -> Self {
        Derivation { parent, path }
    }

    /// Evaluate against the stored parent.
    pub fn derive(&self) -> Result<KeyExpr> {
        self.parent.derive(&self.path)
    }
}

impl Serialize for Derivation {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct Repr<'a> {
            parent: String,
            path: &'a str,
        }
        Repr {
            parent: self.parent.to_string(),
            path: &render_path(&self.path),
        }
        .serialize(s)
    }
}

impl<'de> Deserialize<'de> for Derivation {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Repr {
            parent: String,
            path: String,
        }
        let repr = Repr::deserialize(d)?;
        Ok(Derivation {
            parent: repr.parent.parse().map_err(serde::de::Error::custom)?,
            path: parse_path(&repr.path).map_err(serde::de::Error::custom)?,
        })
    }
}

/// Render a path as `0/1'/5`. An empty path renders empty.
pub fn render_path(path: &[ChildNumber]) -> String {
    let mut out = String::new();
    for (i, child) in path.iter().enumerate() {
        if i > 0 {
            out.push('/');
        }
        match child {
            ChildNumber::Normal { index } => out.push_str(&index.to_string()),
            ChildNumber::Hardened { index } => {
                out.push_str(&index.to_string());
                out.push('\'');
            }
        }
    }
    out
}

/// Parse a `0/1'/5` path. A leading `m/` is tolerated; an empty string is
/// the empty path.
pub fn parse_path(text: &str) -> Result<Vec<ChildNumber>> {
    let text = text.trim();
    let text = text.strip_prefix("m/").unwrap_or(text);
    if text.is_empty() || text == "m" {
        return Ok(Vec::new());
    }
    let mut path = Vec::new();
    for segment in text.split('/') {
        let (digits, hardened) = match segment.strip_suffix('\'').or(segment.strip_suffix('h')) {
            Some(d) => (d, true),
            None => (segment, false),
        };
        let index: u32 = digits
            .parse()
            .map_err(|_| Error::InvalidSyntax(format!("bad path segment {segment}")))?;
        let child = if hardened {
            ChildNumber::from_hardened_idx(index).map_err(|_| Error::OutOfRangeIndex(index as u64))?
        } else {
            ChildNumber::from_normal_idx(index).map_err(|_| Error::OutOfRangeIndex(index as u64))?
        };
        path.push(child);
    }
    Ok(path)
}

/// What it takes to redeem an output: the derivations of the needed keys,
/// the size the finished input script will have, and any partially
/// completed unlock script.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signing {
    pub derivations: Vec<Derivation>,
    pub expected_script_size: u64,
    #[serde(default, skip_serializing_if = "scriptbuf_is_empty")]
    pub unlock_so_far: ScriptBuf,
}

fn scriptbuf_is_empty(s: &ScriptBuf) -> bool {
    s.as_script().is_empty()
}

impl Signing {
    pub fn new(derivations: Vec<Derivation>, expected_script_size: u64) -> Self {
        Signing {
            derivations,
            expected_script_size,
            unlock_so_far: ScriptBuf::new(),
        }
    }

    /// Expected size of the whole serialized input: script plus its length
    /// prefix plus the 36-byte outpoint and 4-byte sequence.
    pub fn expected_input_size(&self) -> u64 {
        self.expected_script_size + var_int_size(self.expected_script_size) + 40
    }
}

/// Serialized size of a Bitcoin variable-length integer.
pub fn var_int_size(n: u64) -> u64 {
    match n {
        0..=0xFC => 1,
        0xFD..=0xFFFF => 3,
        0x1_0000..=0xFFFF_FFFF => 5,
        _ => 9,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_round_trip() {
        for text in ["", "0", "0/1", "44'/0'/0'/0/5", "2147483647'"] {
            let path = parse_path(text).unwrap();
            assert_eq!(render_path(&path), text);
        }
    }

    #[test]
    fn hardened_marker_variants() {
        assert_eq!(parse_path("1h").unwrap(), parse_path("1'").unwrap());
        assert_eq!(parse_path("m/1/2").unwrap(), parse_path("1/2").unwrap());
    }

    #[test]
    fn rejects_out_of_range() {
        assert!(parse_path("2147483648").is_err());
        assert!(parse_path("x").is_err());
    }

    #[test]
    fn expected_input_size_includes_framing() {
        let signing = Signing::new(vec![], 107);
        assert_eq!(signing.expected_input_size(), 107 + 1 + 40);
    }
}

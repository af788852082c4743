//! Key material: the key-expression algebra, derivations, and named
//! deterministic sequences.

pub mod derivation;
pub mod expression;
pub mod sequence;

pub use self::derivation::{parse_path, render_path, Derivation, Signing};
pub use self::expression::{Kind, KeyExpr};
pub use self::sequence::KeySequence;

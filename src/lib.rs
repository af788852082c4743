//! Non-custodial Bitcoin SV wallet core.
//!
//! Four subsystems make up the wallet: the key-expression algebra and
//! keystore ([`keys`]), the SPV-backed transaction store ([`txdb`] over
//! [`db`]), the wallet model with its HD key sequences ([`wallet`]), and
//! the spend pipeline ([`wallet::spend`] through [`network`] broadcast).
//! The HTTP transport, UI, and concrete service endpoints live outside
//! this crate and consume it through [`wallet::Wallets`] and the
//! [`network`] traits.

pub mod beef;
pub mod config;
pub mod db;
pub mod error;
pub mod extended;
pub mod keys;
pub mod merkle;
pub mod network;
pub mod pay;
pub mod random;
pub mod script;
pub mod sighash;
pub mod spv;
pub mod tax;
pub mod txdb;
pub mod wallet;

mod wire;

pub use error::{Error, Result};
pub use wallet::Wallets;

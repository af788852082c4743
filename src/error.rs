use thiserror::Error;

use crate::network::NetworkError;

/// Shorthand for `std::result::Result` with the crate-wide [`Error`] type.
pub type Result<T> = std::result::Result<T, Error>;

/// Every failure the wallet core distinguishes.
///
/// Expected structural failures are values of this type; no exceptional
/// control flow crosses component boundaries. Network failures are folded
/// into broadcast results before they reach a caller of the spend pipeline.
#[derive(Debug, Error)]
pub enum Error {
    /// A key expression (or other textual form) could not be parsed.
    #[error("invalid syntax: {0}")]
    InvalidSyntax(String),

    /// A key expression does not carry enough information for the requested
    /// conversion.
    #[error("incompatible kind: cannot read expression as {0}")]
    IncompatibleKind(&'static str),

    /// A hardened derivation step was requested against an expression with
    /// no secret ancestor.
    #[error("hardened derivation requires a secret key")]
    HardenedRequiresSecret,

    /// A child index outside the valid range for its derivation form.
    #[error("derivation index out of range: {0}")]
    OutOfRangeIndex(u64),

    /// A Merkle branch does not rehash to the root it was inserted under.
    #[error("merkle branch does not match block merkle root")]
    MerkleMismatch,

    /// A proof references a block this store has never seen.
    #[error("unknown block {0}")]
    UnknownBlock(String),

    /// An account diff removes an outpoint that is not present.
    #[error("account diff conflicts with account state")]
    DiffConflict,

    /// No subset of the account covers the payment plus fees.
    #[error("insufficient funds: {available} available, {required} required")]
    InsufficientFunds { available: u64, required: u64 },

    /// The change parameters admit no valid set of change outputs.
    #[error("unsatisfiable change constraints: {0}")]
    UnsatisfiableChange(String),

    /// The assembled transaction pays below the target fee rate.
    #[error("fee rate regression: generated transaction pays below the target rate")]
    FeeRateRegression,

    /// A transaction processor rejected the transaction for paying too little.
    #[error("broadcast rejected: insufficient fee")]
    BroadcastInsufficientFee,

    /// A transaction processor rejected the transaction as invalid.
    #[error("broadcast rejected: invalid transaction")]
    BroadcastInvalid,

    /// The provider could not be reached, or timed out.
    #[error("network connection failed: {0}")]
    NetworkConnectionFail(String),

    /// The provider refused our credentials.
    #[error("not authenticated with provider")]
    Inauthenticated,

    /// Attempt to create a wallet under a name that is taken.
    #[error("wallet already exists: {0}")]
    WalletExists(String),

    /// No wallet under the given name.
    #[error("no such wallet: {0}")]
    WalletMissing(String),

    /// No key sequence under the given name.
    #[error("no such key sequence: {0}")]
    SequenceMissing(String),

    /// No key under the given name.
    #[error("no such key: {0}")]
    KeyMissing(String),

    /// The secure random stream has not been seeded with enough entropy.
    #[error("more entropy required before generating keys")]
    NeedEntropy,

    /// A code path that is declared but not built.
    #[error("unimplemented: {0}")]
    Unimplemented(&'static str),

    /// An underlying SQL failure.
    #[error("database: {0}")]
    Database(#[from] rusqlite::Error),

    /// An I/O failure outside the database.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Process exit code for this failure.
    ///
    /// `0` success, `1` operator action required, `2` programmer action
    /// required, `3` insufficient funds, `5` invalid parameter.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::InsufficientFunds { .. } => 3,
            Error::Unimplemented(_) => 2,
            Error::InvalidSyntax(_)
            | Error::IncompatibleKind(_)
            | Error::HardenedRequiresSecret
            | Error::OutOfRangeIndex(_)
            | Error::WalletExists(_)
            | Error::WalletMissing(_)
            | Error::SequenceMissing(_)
            | Error::KeyMissing(_) => 5,
            _ => 1,
        }
    }
}

impl From<NetworkError> for Error {
    fn from(e: NetworkError) -> Self {
        match e {
            NetworkError::Inauthenticated => Error::Inauthenticated,
            other => Error::NetworkConnectionFail(other.to_string()),
        }
    }
}

impl From<bitcoin::bip32::Error> for Error {
    fn from(e: bitcoin::bip32::Error) -> Self {
        Error::InvalidSyntax(e.to_string())
    }
}

impl From<secp256k1::Error> for Error {
    fn from(e: secp256k1::Error) -> Self {
        Error::InvalidSyntax(e.to_string())
    }
}

impl From<bitcoin::consensus::encode::Error> for Error {
    fn from(e: bitcoin::consensus::encode::Error) -> Self {
        Error::InvalidSyntax(e.to_string())
    }
}

//! Wallet generation: a mnemonic from secure entropy, the BIP-44 account
//! layout, and the keystore entries a working wallet needs.

use bip39::Mnemonic;
use bitcoin::bip32::{ChildNumber, Xpriv, Xpub};
use bitcoin::NetworkKind;
use rand::RngCore;
use tracing::info;

use crate::db::Database;
use crate::error::{Error, Result};
use crate::keys::{KeyExpr, KeySequence};
use crate::random::SecureRandom;
use crate::wallet::{GeneratedKeyKind, Wallets, CHANGE_SEQUENCE, RECEIVE_SEQUENCE};

/// Styles of mnemonic generation. Only BIP-39 exists today; the
/// parameter stays so restores can name what they were made with.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MnemonicStyle {
    #[default]
    Bip39,
}

/// Styles of key layout within the wallet.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WalletStyle {
    #[default]
    Bip44,
}

/// Parameters for `generate`.
#[derive(Clone, Copy, Debug)]
pub struct GenerateParams {
    pub mnemonic_style: MnemonicStyle,
    pub number_of_words: usize,
    pub wallet_style: WalletStyle,
    /// BIP-44 coin type; 0 for Bitcoin.
    pub coin_type: u32,
}

impl Default for GenerateParams {
    fn default() -> Self {
        GenerateParams {
            mnemonic_style: MnemonicStyle::Bip39,
            number_of_words: 12,
            wallet_style: WalletStyle::Bip44,
            coin_type: 0,
        }
    }
}

/// What generation hands back to the user, exactly once.
#[derive(Clone, Debug)]
pub struct Generated {
    /// The recovery words. Never persisted.
    pub mnemonic: String,
    /// The account-level public key others can derive receive keys from.
    pub account_xpub: KeyExpr,
}

/// Derive the BIP-32 master from recovery words.
pub fn master_from_words(words: &str, passphrase: &str) -> Result<Xpriv> {
    let mnemonic = Mnemonic::parse_normalized(words)
        .map_err(|e| Error::InvalidSyntax(format!("bad mnemonic: {e}")))?;
    let seed = mnemonic.to_seed(passphrase);
    Ok(Xpriv::new_master(NetworkKind::Main, &seed)?)
}

fn bip44_account_path(coin_type: u32) -> Result<Vec<ChildNumber>> {
    Ok(vec![
        ChildNumber::from_hardened_idx(44).expect("44 is in range"),
        ChildNumber::from_hardened_idx(coin_type)
            .map_err(|_| Error::OutOfRangeIndex(coin_type as u64))?,
        ChildNumber::from_hardened_idx(0).expect("0 is in range"),
    ])
}

/// Install a master key and the BIP-44 account layout into a fresh
/// wallet: keystore entries, `to_private` associations, and the receive
/// and change sequences.
pub fn install_master<D: Database>(
    wallets: &mut Wallets<D>,
    name: &str,
    master: Xpriv,
    coin_type: u32,
) -> Result<KeyExpr> {
    wallets.make_wallet(name)?;

    let master_expr = KeyExpr::HdSecret(master);
    wallets.set_key(name, "master", &master_expr)?;
    wallets.set_to_private(&master_expr.to_public()?, &master_expr)?;

    let account_path = bip44_account_path(coin_type)?;
    let account_expr = master_expr.derive(&account_path)?;
    let account_public = account_expr.to_public()?;
    wallets.set_key(name, "account", &account_public)?;
    wallets.set_to_private(&account_public, &account_expr)?;

    wallets.set_sequence(
        name,
        RECEIVE_SEQUENCE,
        &KeySequence::new(
            account_public.clone(),
            vec![ChildNumber::from_normal_idx(0).expect("0 is in range")],
        )?,
    )?;
    wallets.set_sequence(
        name,
        CHANGE_SEQUENCE,
        &KeySequence::new(
            account_public.clone(),
            vec![ChildNumber::from_normal_idx(1).expect("1 is in range")],
        )?,
    )?;

    info!(wallet = name, coin_type, "installed account layout");
    Ok(account_public)
}

/// Generate a fresh wallet: words from secure entropy, then the account
/// layout.
pub fn generate_wallet<D: Database>(
    wallets: &mut Wallets<D>,
    name: &str,
    params: &GenerateParams,
) -> Result<Generated> {
    let MnemonicStyle::Bip39 = params.mnemonic_style;
    let WalletStyle::Bip44 = params.wallet_style;

    let entropy_len = match params.number_of_words {
        12 => 16,
        24 => 32,
        n => {
            return Err(Error::InvalidSyntax(format!(
                "mnemonics have 12 or 24 words, not {n}"
            )))
        }
    };
    let mut entropy = vec![0u8; entropy_len];
    {
        let random = wallets.random().clone();
        let mut guard = random.lock();
        guard.secure.fill_bytes(&mut entropy);
    }
    let mnemonic = Mnemonic::from_entropy(&entropy)
        .map_err(|e| Error::InvalidSyntax(format!("mnemonic: {e}")))?;
    let seed = mnemonic.to_seed("");
    let master = Xpriv::new_master(NetworkKind::Main, &seed)?;

    let account_xpub = install_master(wallets, name, master, params.coin_type)?;
    Ok(Generated {
        mnemonic: mnemonic.to_string(),
        account_xpub,
    })
}

/// One random key of the requested kind, drawn from the secure stream.
pub fn random_key(
    secure: &mut SecureRandom,
    kind: GeneratedKeyKind,
    net: NetworkKind,
    compressed: bool,
) -> Result<KeyExpr> {
    let mut scalar = [0u8; 32];
    let secret = loop {
        secure.fill_bytes(&mut scalar);
        if let Ok(secret) = bitcoin::secp256k1::SecretKey::from_slice(&scalar) {
            break secret;
        }
        // A draw outside the curve order is astronomically rare; just
        // draw again.
    };
    match kind {
        GeneratedKeyKind::Secp256k1 => Ok(KeyExpr::Secret(secret)),
        GeneratedKeyKind::Wif => Ok(KeyExpr::Wif(bitcoin::PrivateKey {
            compressed,
            network: net,
            inner: secret,
        })),
        GeneratedKeyKind::Xpriv => {
            let mut seed = [0u8; 64];
            secure.fill_bytes(&mut seed);
            Ok(KeyExpr::HdSecret(Xpriv::new_master(net, &seed)?))
        }
    }
}

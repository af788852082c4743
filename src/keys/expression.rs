//! The key-expression algebra: a closed grammar over Bitcoin key forms
//! with lossless encode/decode and total conversions wherever the
//! information is present.
//!
//! An expression is polymorphic: a WIF can be read as a secret scalar, a
//! pubkey, or an address; an HD secret reads as all of those plus its own
//! public form. Conversions that would require information the expression
//! does not carry fail with `incompatible-kind`.

use std::fmt;
use std::str::FromStr;

use bitcoin::base58;
use bitcoin::bip32::{ChainCode, ChildNumber, Fingerprint, Xpriv, Xpub};
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::SecretKey;
use bitcoin::{NetworkKind, PrivateKey, PubkeyHash, PublicKey};
use hex::{DisplayHex, FromHex};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::keys::derivation::render_path;

/// Base58 version byte for a mainnet pay-to-address hash.
const P2PKH_VERSION_MAIN: u8 = 0x00;
/// Base58 version byte for a testnet pay-to-address hash.
const P2PKH_VERSION_TEST: u8 = 0x6F;

/// The kinds an expression can be rendered as.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    Secret,
    Pubkey,
    Address,
    Wif,
    HdSecret,
    HdPubkey,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Kind::Secret => write!(f, "secret"),
            Kind::Pubkey => write!(f, "pubkey"),
            Kind::Address => write!(f, "address"),
            Kind::Wif => write!(f, "WIF"),
            Kind::HdSecret => write!(f, "HD.secret"),
            Kind::HdPubkey => write!(f, "HD.pubkey"),
        }
    }
}

/// One term of the algebra.
///
/// Parsing returns the richest variant the text supports; the application
/// form `(parent) / i` is kept symbolic until evaluated, so a key sequence
/// can be expressed without special cases.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeyExpr {
    Secret(SecretKey),
    Pubkey(PublicKey),
    Address { net: NetworkKind, hash: PubkeyHash },
    Wif(PrivateKey),
    HdSecret(Xpriv),
    HdPubkey(Xpub),
    Apply {
        parent: Box<KeyExpr>,
        path: Vec<ChildNumber>,
    },
}

impl KeyExpr {
    /// The kind this expression renders as by default.
    pub fn kind(&self) -> Kind {
        match self {
            KeyExpr::Secret(_) => Kind::Secret,
            KeyExpr::Pubkey(_) => Kind::Pubkey,
            KeyExpr::Address { .. } => Kind::Address,
            KeyExpr::Wif(_) => Kind::Wif,
            KeyExpr::HdSecret(_) => Kind::HdSecret,
            KeyExpr::HdPubkey(_) => Kind::HdPubkey,
            KeyExpr::Apply { parent, .. } => parent.kind(),
        }
    }

    /// Whether the expression carries a secret.
    pub fn is_private(&self) -> bool {
        match self {
            KeyExpr::Secret(_) | KeyExpr::Wif(_) | KeyExpr::HdSecret(_) => true,
            KeyExpr::Apply { parent, .. } => parent.is_private(),
            _ => false,
        }
    }

    /// Resolve the application form, leaving a concrete key.
    pub fn evaluate(&self) -> Result<KeyExpr> {
        match self {
            KeyExpr::Apply { parent, path } => parent.derive(path),
            other => Ok(other.clone()),
        }
    }

    /// Walk `path` applying child-key derivation. Hardened segments require
    /// a secret in the expression.
    pub fn derive(&self, path: &[ChildNumber]) -> Result<KeyExpr> {
        if path.is_empty() {
            return self.evaluate();
        }
        match self {
            KeyExpr::HdSecret(x) => Ok(KeyExpr::HdSecret(
                x.derive_priv(secp256k1::SECP256K1, &path.to_vec())?,
            )),
            KeyExpr::HdPubkey(x) => {
                if path.iter().any(|c| c.is_hardened()) {
                    return Err(Error::HardenedRequiresSecret);
                }
                Ok(KeyExpr::HdPubkey(
                    x.derive_pub(secp256k1::SECP256K1, &path.to_vec())?,
                ))
            }
            KeyExpr::Apply { .. } => self.evaluate()?.derive(path),
            _ => Err(Error::IncompatibleKind("an HD key")),
        }
    }

    /// The secp256k1 scalar, if the expression carries one.
    pub fn as_scalar(&self) -> Result<SecretKey> {
        match self {
            KeyExpr::Secret(k) => Ok(*k),
            KeyExpr::Wif(p) => Ok(p.inner),
            KeyExpr::HdSecret(x) => Ok(x.private_key),
            KeyExpr::Apply { .. } => self.evaluate()?.as_scalar(),
            _ => Err(Error::IncompatibleKind("a secret scalar")),
        }
    }

    /// The secp256k1 point: present in every form except a bare address.
    pub fn as_point(&self) -> Result<secp256k1::PublicKey> {
        match self {
            KeyExpr::Pubkey(p) => Ok(p.inner),
            KeyExpr::HdPubkey(x) => Ok(x.public_key),
            KeyExpr::Secret(_) | KeyExpr::Wif(_) | KeyExpr::HdSecret(_) => Ok(
                secp256k1::PublicKey::from_secret_key(secp256k1::SECP256K1, &self.as_scalar()?),
            ),
            KeyExpr::Apply { .. } => self.evaluate()?.as_point(),
            KeyExpr::Address { .. } => Err(Error::IncompatibleKind("a public key")),
        }
    }

    /// The Bitcoin secret: the scalar tagged with a network and
    /// compression, as a WIF encodes it.
    pub fn as_secret(&self) -> Result<PrivateKey> {
        match self {
            KeyExpr::Secret(k) => Ok(PrivateKey::new(*k, NetworkKind::Main)),
            KeyExpr::Wif(p) => Ok(*p),
            KeyExpr::HdSecret(x) => Ok(x.to_priv()),
            KeyExpr::Apply { .. } => self.evaluate()?.as_secret(),
            _ => Err(Error::IncompatibleKind("a secret key")),
        }
    }

    /// The Bitcoin public key, compression preserved where the expression
    /// declares it.
    pub fn as_pubkey(&self) -> Result<PublicKey> {
        match self {
            KeyExpr::Pubkey(p) => Ok(*p),
            KeyExpr::Wif(p) => Ok(p.public_key(secp256k1::SECP256K1)),
            KeyExpr::HdPubkey(x) => Ok(PublicKey::new(x.public_key)),
            KeyExpr::Secret(_) | KeyExpr::HdSecret(_) => Ok(PublicKey::new(self.as_point()?)),
            KeyExpr::Apply { .. } => self.evaluate()?.as_pubkey(),
            KeyExpr::Address { .. } => Err(Error::IncompatibleKind("a public key")),
        }
    }

    /// The WIF encoding of the secret.
    pub fn as_wif(&self) -> Result<String> {
        Ok(self.as_secret()?.to_wif())
    }

    pub fn as_hd_secret(&self) -> Result<Xpriv> {
        match self {
            KeyExpr::HdSecret(x) => Ok(*x),
            KeyExpr::Apply { .. } => self.evaluate()?.as_hd_secret(),
            _ => Err(Error::IncompatibleKind("an HD secret")),
        }
    }

    pub fn as_hd_pubkey(&self) -> Result<Xpub> {
        match self {
            KeyExpr::HdSecret(x) => Ok(Xpub::from_priv(secp256k1::SECP256K1, x)),
            KeyExpr::HdPubkey(x) => Ok(*x),
            KeyExpr::Apply { .. } => self.evaluate()?.as_hd_pubkey(),
            _ => Err(Error::IncompatibleKind("an HD pubkey")),
        }
    }

    /// The network-tagged address hash.
    pub fn as_address(&self) -> Result<(NetworkKind, PubkeyHash)> {
        match self {
            KeyExpr::Address { net, hash } => Ok((*net, *hash)),
            KeyExpr::Wif(p) => Ok((p.network, p.public_key(secp256k1::SECP256K1).pubkey_hash())),
            KeyExpr::HdSecret(x) => Ok((x.network, self.as_pubkey()?.pubkey_hash())),
            KeyExpr::HdPubkey(x) => Ok((x.network, self.as_pubkey()?.pubkey_hash())),
            KeyExpr::Secret(_) | KeyExpr::Pubkey(_) => {
                Ok((NetworkKind::Main, self.as_pubkey()?.pubkey_hash()))
            }
            KeyExpr::Apply { .. } => self.evaluate()?.as_address(),
        }
    }

    /// Canonicalize to the public form when possible.
    pub fn to_public(&self) -> Result<KeyExpr> {
        match self {
            KeyExpr::Secret(_) => Ok(KeyExpr::Pubkey(self.as_pubkey()?)),
            KeyExpr::Wif(_) => Ok(KeyExpr::Pubkey(self.as_pubkey()?)),
            KeyExpr::HdSecret(_) => Ok(KeyExpr::HdPubkey(self.as_hd_pubkey()?)),
            KeyExpr::Pubkey(_) | KeyExpr::HdPubkey(_) | KeyExpr::Address { .. } => {
                Ok(self.clone())
            }
            KeyExpr::Apply { .. } => self.evaluate()?.to_public(),
        }
    }

    /// Parse an expression. Leading and trailing whitespace is
    /// insignificant; kind markers are case-sensitive.
    pub fn parse(text: &str) -> Result<KeyExpr> {
        let mut parser = Parser::new(text);
        let expr = parser.expression()?;
        parser.skip_ws();
        if !parser.done() {
            return Err(Error::InvalidSyntax(format!(
                "unexpected trailing input in key expression: {:?}",
                parser.rest()
            )));
        }
        Ok(expr)
    }

    /// The canonical form for the requested kind.
    pub fn render_as(&self, kind: Kind) -> Result<String> {
        match kind {
            Kind::Secret => {
                // Scalars are numbers stored little-endian; displaying one
                // in ordinary hex notation means reversing the storage.
                let mut bytes = self.as_scalar()?.secret_bytes();
                bytes.reverse();
                Ok(format!("secret 0x{}", bytes.to_lower_hex_string()))
            }
            Kind::Pubkey => Ok(format!("pubkey `{}`", self.as_pubkey()?)),
            Kind::Address => {
                let (net, hash) = self.as_address()?;
                Ok(format!("address `{}`", encode_address(net, &hash)))
            }
            Kind::Wif => Ok(format!("WIF \"{}\"", self.as_wif()?)),
            Kind::HdSecret => Ok(format!("HD.secret \"{}\"", self.as_hd_secret()?)),
            Kind::HdPubkey => Ok(format!("HD.pubkey \"{}\"", self.as_hd_pubkey()?)),
        }
    }
}

/// Base58check encoding of a network-tagged hash160.
pub fn encode_address(net: NetworkKind, hash: &PubkeyHash) -> String {
    let version = match net {
        NetworkKind::Main => P2PKH_VERSION_MAIN,
        NetworkKind::Test => P2PKH_VERSION_TEST,
    };
    let mut data = Vec::with_capacity(21);
    data.push(version);
    data.extend_from_slice(hash.as_byte_array());
    base58::encode_check(&data)
}

/// Decode a base58check address into its network tag and hash160.
pub fn decode_address(text: &str) -> Result<(NetworkKind, PubkeyHash)> {
    let data = base58::decode_check(text)
        .map_err(|e| Error::InvalidSyntax(format!("bad address {text}: {e}")))?;
    if data.len() != 21 {
        return Err(Error::InvalidSyntax(format!("bad address length {text}")));
    }
    let net = match data[0] {
        P2PKH_VERSION_MAIN => NetworkKind::Main,
        P2PKH_VERSION_TEST => NetworkKind::Test,
        v => return Err(Error::InvalidSyntax(format!("unknown address version {v}"))),
    };
    let hash = PubkeyHash::from_slice(&data[1..])
        .map_err(|_| Error::InvalidSyntax(format!("bad address hash {text}")))?;
    Ok((net, hash))
}

impl fmt::Display for KeyExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyExpr::Apply { parent, path } => {
                write!(f, "({parent})")?;
                for child in path {
                    match child {
                        ChildNumber::Normal { index } => write!(f, " / {index}")?,
                        ChildNumber::Hardened { index } => write!(f, " / {index}'")?,
                    }
                }
                Ok(())
            }
            other => {
                // Every concrete variant renders as its own kind, and
                // carries the information that kind needs.
                let text = other
                    .render_as(other.kind())
                    .expect("own kind always renders");
                write!(f, "{text}")
            }
        }
    }
}

impl FromStr for KeyExpr {
    type Err = Error;

    fn from_str(s: &str) -> Result<KeyExpr> {
        KeyExpr::parse(s)
    }
}

impl Serialize for KeyExpr {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for KeyExpr {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(d)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

struct Parser<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Parser { text, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.text[self.pos..]
    }

    fn done(&self) -> bool {
        self.pos >= self.text.len()
    }

    fn skip_ws(&mut self) {
        while let Some(c) = self.rest().chars().next() {
            if c.is_whitespace() {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn eat(&mut self, c: char) -> bool {
        if self.peek() == Some(c) {
            self.pos += c.len_utf8();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, c: char) -> Result<()> {
        if self.eat(c) {
            Ok(())
        } else {
            Err(Error::InvalidSyntax(format!(
                "expected {c:?} at {:?}",
                self.rest()
            )))
        }
    }

    fn eat_keyword(&mut self, word: &str) -> bool {
        if self.rest().starts_with(word) {
            // The marker must end the token: `secretx` is not `secret`.
            let after = self.rest()[word.len()..].chars().next();
            if after.map_or(true, |c| !c.is_alphanumeric() && c != '_') || word.ends_with('.') {
                self.pos += word.len();
                return true;
            }
        }
        false
    }

    fn expression(&mut self) -> Result<KeyExpr> {
        self.skip_ws();
        let mut expr = self.primary()?;
        let mut path = Vec::new();
        loop {
            self.skip_ws();
            if !self.eat('/') {
                break;
            }
            self.skip_ws();
            path.push(self.child_number()?);
        }
        if !path.is_empty() {
            expr = KeyExpr::Apply {
                parent: Box::new(expr),
                path,
            };
        }
        Ok(expr)
    }

    fn primary(&mut self) -> Result<KeyExpr> {
        self.skip_ws();
        if self.eat('(') {
            let inner = self.expression()?;
            self.skip_ws();
            self.expect(')')?;
            return Ok(inner);
        }
        // HD markers first: `HD.secret` would otherwise never match after
        // a failed `secret` attempt.
        if self.eat_keyword("HD.secret") {
            return self.hd_secret();
        }
        if self.eat_keyword("HD.pubkey") {
            return self.hd_pubkey();
        }
        if self.eat_keyword("secret") {
            return self.secret();
        }
        if self.eat_keyword("pubkey") {
            return self.pubkey();
        }
        if self.eat_keyword("address") {
            return self.address();
        }
        if self.eat_keyword("WIF") {
            return self.wif();
        }
        Err(Error::InvalidSyntax(format!(
            "expected a key expression at {:?}",
            self.rest()
        )))
    }

    fn secret(&mut self) -> Result<KeyExpr> {
        self.skip_ws();
        let bytes = self.scalar_number()?;
        let key = SecretKey::from_slice(&bytes)
            .map_err(|_| Error::InvalidSyntax("secret scalar out of range".into()))?;
        Ok(KeyExpr::Secret(key))
    }

    fn pubkey(&mut self) -> Result<KeyExpr> {
        self.skip_ws();
        let bytes = self.quoted_hex()?;
        let key = PublicKey::from_slice(&bytes)
            .map_err(|e| Error::InvalidSyntax(format!("bad public key: {e}")))?;
        Ok(KeyExpr::Pubkey(key))
    }

    fn address(&mut self) -> Result<KeyExpr> {
        self.skip_ws();
        if self.eat('[') {
            self.skip_ws();
            let bytes = self.quoted_hex()?;
            if bytes.len() != 20 {
                return Err(Error::InvalidSyntax("address hash must be 20 bytes".into()));
            }
            let hash = PubkeyHash::from_slice(&bytes)
                .map_err(|_| Error::InvalidSyntax("bad address hash".into()))?;
            self.skip_ws();
            self.expect(',')?;
            self.skip_ws();
            let net = self.net_token()?;
            self.skip_ws();
            self.expect(']')?;
            return Ok(KeyExpr::Address { net, hash });
        }
        let text = self.quoted_text()?;
        let (net, hash) = decode_address(&text)?;
        Ok(KeyExpr::Address { net, hash })
    }

    fn wif(&mut self) -> Result<KeyExpr> {
        self.skip_ws();
        if self.eat('[') {
            self.skip_ws();
            let inner = self.expression()?;
            let scalar = inner.as_scalar()?;
            let mut net = NetworkKind::Main;
            let mut compressed = true;
            loop {
                self.skip_ws();
                if !self.eat(',') {
                    break;
                }
                self.skip_ws();
                if self.rest().starts_with("net.") {
                    net = self.net_token()?;
                } else if self.eat_keyword("compressed") {
                    compressed = true;
                } else if self.eat_keyword("uncompressed") {
                    compressed = false;
                } else {
                    return Err(Error::InvalidSyntax(format!(
                        "unexpected WIF attribute at {:?}",
                        self.rest()
                    )));
                }
            }
            self.skip_ws();
            self.expect(']')?;
            return Ok(KeyExpr::Wif(PrivateKey {
                compressed,
                network: net,
                inner: scalar,
            }));
        }
        let text = self.quoted_text()?;
        let key = PrivateKey::from_wif(&text)
            .map_err(|e| Error::InvalidSyntax(format!("bad WIF: {e}")))?;
        Ok(KeyExpr::Wif(key))
    }

    fn hd_secret(&mut self) -> Result<KeyExpr> {
        self.skip_ws();
        if self.eat('[') {
            self.skip_ws();
            let inner = self.expression()?;
            let scalar = inner.as_scalar()?;
            self.skip_ws();
            self.expect(',')?;
            self.skip_ws();
            let chain_code = self.chain_code()?;
            let tail = self.hd_tail()?;
            self.expect(']')?;
            return Ok(KeyExpr::HdSecret(Xpriv {
                network: tail.net,
                depth: tail.depth,
                parent_fingerprint: tail.parent,
                child_number: tail.sequence,
                private_key: scalar,
                chain_code,
            }));
        }
        let text = self.quoted_text()?;
        let key = Xpriv::from_str(&text)
            .map_err(|e| Error::InvalidSyntax(format!("bad xprv: {e}")))?;
        Ok(KeyExpr::HdSecret(key))
    }

    fn hd_pubkey(&mut self) -> Result<KeyExpr> {
        self.skip_ws();
        if self.eat('[') {
            self.skip_ws();
            let inner = self.expression()?;
            let point = inner.as_point()?;
            self.skip_ws();
            self.expect(',')?;
            self.skip_ws();
            let chain_code = self.chain_code()?;
            let tail = self.hd_tail()?;
            self.expect(']')?;
            return Ok(KeyExpr::HdPubkey(Xpub {
                network: tail.net,
                depth: tail.depth,
                parent_fingerprint: tail.parent,
                child_number: tail.sequence,
                public_key: point,
                chain_code,
            }));
        }
        let text = self.quoted_text()?;
        let key = Xpub::from_str(&text)
            .map_err(|e| Error::InvalidSyntax(format!("bad xpub: {e}")))?;
        Ok(KeyExpr::HdPubkey(key))
    }

    fn hd_tail(&mut self) -> Result<HdTail> {
        let mut tail = HdTail::default();
        let mut depth_seen = false;
        loop {
            self.skip_ws();
            if !self.eat(',') {
                break;
            }
            self.skip_ws();
            match self.peek() {
                Some('n') => tail.net = self.net_token()?,
                Some('`') | Some('\'') => {
                    let bytes = self.quoted_hex()?;
                    if bytes.len() != 4 {
                        return Err(Error::InvalidSyntax(
                            "parent fingerprint must be 4 bytes".into(),
                        ));
                    }
                    tail.parent = Fingerprint::from_str(&bytes.to_lower_hex_string())
                        .map_err(|_| Error::InvalidSyntax("bad fingerprint".into()))?;
                }
                Some(c) if c.is_ascii_digit() => {
                    if !depth_seen {
                        let depth = self.decimal_u32()?;
                        tail.depth = u8::try_from(depth)
                            .map_err(|_| Error::OutOfRangeIndex(depth as u64))?;
                        depth_seen = true;
                    } else {
                        tail.sequence = self.child_number()?;
                    }
                }
                _ => {
                    return Err(Error::InvalidSyntax(format!(
                        "unexpected HD attribute at {:?}",
                        self.rest()
                    )))
                }
            }
        }
        self.skip_ws();
        Ok(tail)
    }

    fn chain_code(&mut self) -> Result<ChainCode> {
        let bytes = self.quoted_hex()?;
        if bytes.len() != 32 {
            return Err(Error::InvalidSyntax("chain code must be 32 bytes".into()));
        }
        ChainCode::from_str(&bytes.to_lower_hex_string())
            .map_err(|_| Error::InvalidSyntax("bad chain code".into()))
    }

    fn net_token(&mut self) -> Result<NetworkKind> {
        if self.eat_keyword("net.") {
            if self.eat_keyword("Main") {
                return Ok(NetworkKind::Main);
            }
            if self.eat_keyword("Test") {
                return Ok(NetworkKind::Test);
            }
        }
        Err(Error::InvalidSyntax(format!(
            "expected net.Main or net.Test at {:?}",
            self.rest()
        )))
    }

    fn child_number(&mut self) -> Result<ChildNumber> {
        let index = self.decimal_u32()?;
        let hardened = self.eat('\'') || self.eat('h');
        if hardened {
            ChildNumber::from_hardened_idx(index).map_err(|_| Error::OutOfRangeIndex(index as u64))
        } else {
            ChildNumber::from_normal_idx(index).map_err(|_| Error::OutOfRangeIndex(index as u64))
        }
    }

    fn decimal_u32(&mut self) -> Result<u32> {
        let digits = self.take_while(|c| c.is_ascii_digit());
        if digits.is_empty() {
            return Err(Error::InvalidSyntax(format!(
                "expected a number at {:?}",
                self.rest()
            )));
        }
        let value: u64 = digits
            .parse()
            .map_err(|_| Error::InvalidSyntax(format!("bad number {digits}")))?;
        u32::try_from(value).map_err(|_| Error::OutOfRangeIndex(value))
    }

    fn take_while(&mut self, pred: impl Fn(char) -> bool) -> &'a str {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if pred(c) {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }
        &self.text[start..self.pos]
    }

    /// A 256-bit scalar written in decimal or `0x` hex.
    ///
    /// Scalars are numbers stored little-endian, so the textual value
    /// `123` and the storage bytes `7b00…00` denote the same key.
    fn scalar_number(&mut self) -> Result<[u8; 32]> {
        if self.rest().starts_with("0x") || self.rest().starts_with("0X") {
            self.pos += 2;
            let digits = self.take_while(|c| c.is_ascii_hexdigit());
            if digits.is_empty() || digits.len() > 64 {
                return Err(Error::InvalidSyntax("bad hex scalar".into()));
            }
            let padded = format!("{digits:0>64}");
            let bytes = Vec::<u8>::from_hex(&padded)
                .map_err(|_| Error::InvalidSyntax("bad hex scalar".into()))?;
            let mut out = [0u8; 32];
            out.copy_from_slice(&bytes);
            out.reverse();
            return Ok(out);
        }
        let digits = self.take_while(|c| c.is_ascii_digit());
        if digits.is_empty() {
            return Err(Error::InvalidSyntax(format!(
                "expected a scalar at {:?}",
                self.rest()
            )));
        }
        decimal_to_scalar(digits)
    }

    /// Hex content delimited by backticks (canonical) or single quotes.
    fn quoted_hex(&mut self) -> Result<Vec<u8>> {
        let delim = match self.peek() {
            Some('`') => '`',
            Some('\'') => '\'',
            _ => {
                return Err(Error::InvalidSyntax(format!(
                    "expected quoted hex at {:?}",
                    self.rest()
                )))
            }
        };
        self.expect(delim)?;
        let content = self.take_while(|c| c != delim);
        let content = content.to_owned();
        self.expect(delim)?;
        Vec::<u8>::from_hex(&content)
            .map_err(|_| Error::InvalidSyntax(format!("bad hex {content:?}")))
    }

    /// A double-quoted string, or backtick-quoted text for base58 bodies.
    fn quoted_text(&mut self) -> Result<String> {
        let delim = match self.peek() {
            Some('"') => '"',
            Some('`') => '`',
            _ => {
                return Err(Error::InvalidSyntax(format!(
                    "expected quoted text at {:?}",
                    self.rest()
                )))
            }
        };
        self.expect(delim)?;
        let content = self.take_while(|c| c != delim).to_owned();
        self.expect(delim)?;
        Ok(content)
    }
}

#[derive(Debug)]
struct HdTail {
    net: NetworkKind,
    depth: u8,
    parent: Fingerprint,
    sequence: ChildNumber,
}

impl Default for HdTail {
    fn default() -> Self {
        HdTail {
            net: NetworkKind::Main,
            depth: 0,
            parent: Fingerprint::default(),
            sequence: ChildNumber::Normal { index: 0 },
        }
    }
}

/// Little-endian 32 bytes from an unbounded decimal string, failing on
/// overflow past 2^256.
fn decimal_to_scalar(digits: &str) -> Result<[u8; 32]> {
    let mut out = [0u8; 32];
    for c in digits.chars() {
        let digit = c as u32 - '0' as u32;
        let mut carry = digit;
        for byte in out.iter_mut() {
            let v = *byte as u32 * 10 + carry;
            *byte = (v & 0xFF) as u8;
            carry = v >> 8;
        }
        if carry != 0 {
            return Err(Error::InvalidSyntax("decimal scalar overflows".into()));
        }
    }
    Ok(out)
}

//! Two random streams: a *secure* one for anything that becomes key
//! material, and a *casual* one for shuffles and value sampling.
//!
//! The secure stream is an HMAC-SHA256 DRBG seeded from the OS, a nonce,
//! and a personalization string. User entropy submitted over the wire is
//! hashed into the next reseed rather than used directly. A deterministic
//! mode exists for replay tests: seeded from configuration, it never
//! touches the OS.

use std::sync::{Arc, Mutex, MutexGuard};

use bitcoin::hashes::{hmac, sha256, Hash, HashEngine, HmacEngine};
use rand::rngs::{OsRng, StdRng};
use rand::{RngCore, SeedableRng};

use crate::error::{Error, Result};

/// Bytes the casual stream may emit before it is reseeded from secure.
const CASUAL_RESEED_BYTES: u64 = 1 << 30;

/// Generate requests between mandatory reseeds of the DRBG.
const DRBG_RESEED_INTERVAL: u64 = 1 << 20;

fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> [u8; 32] {
    let mut engine = HmacEngine::<sha256::Hash>::new(key);
    for part in parts {
        engine.input(part);
    }
    hmac::Hmac::<sha256::Hash>::from_engine(engine).to_byte_array()
}

/// HMAC-SHA256 deterministic random bit generator (NIST SP 800-90A shape).
struct HmacDrbg {
    key: [u8; 32],
    value: [u8; 32],
    generated: u64,
}

impl HmacDrbg {
    fn new(seed_material: &[&[u8]]) -> Self {
        let mut drbg = HmacDrbg {
            key: [0u8; 32],
            value: [1u8; 32],
            generated: 0,
        };
        drbg.update(seed_material);
        drbg
    }

    fn update(&mut self, provided: &[&[u8]]) {
        let mut message: Vec<&[u8]> = vec![&self.value, &[0x00]];
        message.extend_from_slice(provided);
        self.key = hmac_sha256(&self.key, &message);
        self.value = hmac_sha256(&self.key, &[&self.value]);
        if !provided.is_empty() {
            let mut message: Vec<&[u8]> = vec![&self.value, &[0x01]];
            message.extend_from_slice(provided);
            self.key = hmac_sha256(&self.key, &message);
            self.value = hmac_sha256(&self.key, &[&self.value]);
        }
    }

    fn reseed(&mut self, entropy: &[&[u8]]) {
        self.update(entropy);
        self.generated = 0;
    }

    fn generate(&mut self, out: &mut [u8]) {
        let mut written = 0;
        while written < out.len() {
            self.value = hmac_sha256(&self.key, &[&self.value]);
            let take = (out.len() - written).min(32);
            out[written..written + take].copy_from_slice(&self.value[..take]);
            written += take;
        }
        self.update(&[]);
        self.generated += 1;
    }
}

/// The secure stream. Implements [`RngCore`] so it can drive the `rand`
/// toolkit wherever key scalars or nonces are produced.
pub struct SecureRandom {
    drbg: HmacDrbg,
    /// User entropy queued for the next reseed.
    pending: Vec<u8>,
    deterministic: bool,
}

impl SecureRandom {
    /// Instantiate from OS entropy, a nonce, and a personalization string.
    pub fn from_os(nonce: &[u8], personalization: &str) -> Result<Self> {
        let mut entropy = [0u8; 48];
        OsRng
            .try_fill_bytes(&mut entropy)
            .map_err(|_| Error::NeedEntropy)?;
        Ok(SecureRandom {
            drbg: HmacDrbg::new(&[&entropy, nonce, personalization.as_bytes()]),
            pending: Vec::new(),
            deterministic: false,
        })
    }

    /// Replay mode: all output is a function of the seed and nonce.
    pub fn deterministic(seed: &[u8], nonce: &[u8]) -> Self {
        SecureRandom {
            drbg: HmacDrbg::new(&[seed, nonce]),
            pending: Vec::new(),
            deterministic: true,
        }
    }

    /// Hash user-supplied entropy into the DRBG's next reseed input.
    ///
    /// Ignored in deterministic mode so a replay stays a pure function of
    /// the configured seed.
    pub fn add_entropy(&mut self, data: &[u8]) {
        if self.deterministic {
            return;
        }
        let digest = sha256::Hash::hash(data);
        self.pending.extend_from_slice(digest.as_byte_array());
    }

    fn reseed_if_due(&mut self) {
        if self.drbg.generated >= DRBG_RESEED_INTERVAL || !self.pending.is_empty() {
            if self.deterministic {
                return;
            }
            let mut entropy = [0u8; 32];
            // A failed OS read leaves the previous state in place, which is
            // still unpredictable; the pending user entropy goes in anyway.
            let _ = OsRng.try_fill_bytes(&mut entropy);
            let pending = std::mem::take(&mut self.pending);
            self.drbg.reseed(&[&entropy, &pending]);
        }
    }
}

impl RngCore for SecureRandom {
    fn next_u32(&mut self) -> u32 {
        let mut buf = [0u8; 4];
        self.fill_bytes(&mut buf);
        u32::from_le_bytes(buf)
    }

    fn next_u64(&mut self) -> u64 {
        let mut buf = [0u8; 8];
        self.fill_bytes(&mut buf);
        u64::from_le_bytes(buf)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.reseed_if_due();
        self.drbg.generate(dest);
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> std::result::Result<(), rand::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

/// The casual stream: a cheap generator for shuffles, weighted sampling,
/// and change-value draws. Tracks output volume so its owner can reseed it
/// from the secure stream on schedule.
pub struct CasualRandom {
    rng: StdRng,
    emitted: u64,
}

impl RngCore for CasualRandom {
    fn next_u32(&mut self) -> u32 {
        self.emitted += 4;
        self.rng.next_u32()
    }

    fn next_u64(&mut self) -> u64 {
        self.emitted += 8;
        self.rng.next_u64()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.emitted += dest.len() as u64;
        self.rng.fill_bytes(dest)
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> std::result::Result<(), rand::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

/// Both streams under one owner, threaded through the wallet as a value
/// rather than reached for as a global.
pub struct Random {
    pub secure: SecureRandom,
    casual: CasualRandom,
}

impl Random {
    /// Production instantiation.
    pub fn from_os(nonce: &[u8], personalization: &str) -> Result<Self> {
        let secure = SecureRandom::from_os(nonce, personalization)?;
        Ok(Random::with_secure(secure))
    }

    /// Replay instantiation: both streams derive from the seed.
    pub fn deterministic(seed: &[u8], nonce: &[u8]) -> Self {
        Random::with_secure(SecureRandom::deterministic(seed, nonce))
    }

    fn with_secure(mut secure: SecureRandom) -> Self {
        let mut seed = [0u8; 32];
        secure.fill_bytes(&mut seed);
        Random {
            secure,
            casual: CasualRandom {
                rng: StdRng::from_seed(seed),
                emitted: 0,
            },
        }
    }

    /// Access the casual stream, reseeding it from secure when it has
    /// emitted its quota.
    pub fn casual(&mut self) -> &mut CasualRandom {
        if self.casual.emitted >= CASUAL_RESEED_BYTES {
            let mut seed = [0u8; 32];
            self.secure.fill_bytes(&mut seed);
            self.casual.rng = StdRng::from_seed(seed);
            self.casual.emitted = 0;
        }
        &mut self.casual
    }

    /// Queue user entropy for the secure stream's next reseed.
    pub fn add_entropy(&mut self, data: &[u8]) {
        self.secure.add_entropy(data);
    }
}

/// The shared, thread-safe handle components receive.
#[derive(Clone)]
pub struct SharedRandom(Arc<Mutex<Random>>);

impl SharedRandom {
    pub fn new(random: Random) -> Self {
        SharedRandom(Arc::new(Mutex::new(random)))
    }

    pub fn lock(&self) -> MutexGuard<'_, Random> {
        self.0.lock().expect("random mutex poisoned")
    }

    pub fn add_entropy(&self, data: &[u8]) {
        self.lock().add_entropy(data);
    }
}

/// A permutation of `0..n`, used to place change among target outputs.
pub fn random_ordering<R: RngCore>(n: usize, rng: &mut R) -> Vec<usize> {
    use rand::seq::SliceRandom;
    let mut ordering: Vec<usize> = (0..n).collect();
    ordering.shuffle(rng);
    ordering
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_mode_replays() {
        let mut a = Random::deterministic(b"seed", b"nonce");
        let mut b = Random::deterministic(b"seed", b"nonce");
        let mut buf_a = [0u8; 64];
        let mut buf_b = [0u8; 64];
        a.secure.fill_bytes(&mut buf_a);
        b.secure.fill_bytes(&mut buf_b);
        assert_eq!(buf_a, buf_b);
        assert_eq!(a.casual().next_u64(), b.casual().next_u64());
    }

    #[test]
    fn different_seeds_diverge() {
        let mut a = Random::deterministic(b"seed-a", b"nonce");
        let mut b = Random::deterministic(b"seed-b", b"nonce");
        let mut buf_a = [0u8; 32];
        let mut buf_b = [0u8; 32];
        a.secure.fill_bytes(&mut buf_a);
        b.secure.fill_bytes(&mut buf_b);
        assert_ne!(buf_a, buf_b);
    }

    #[test]
    fn entropy_changes_the_stream() {
        let mut plain = SecureRandom::deterministic(b"seed", b"nonce");
        // Deterministic mode ignores user entropy entirely.
        let mut with_entropy = SecureRandom::deterministic(b"seed", b"nonce");
        with_entropy.add_entropy(b"user input");
        let mut buf_a = [0u8; 32];
        let mut buf_b = [0u8; 32];
        plain.fill_bytes(&mut buf_a);
        with_entropy.fill_bytes(&mut buf_b);
        assert_eq!(buf_a, buf_b);
    }

    #[test]
    fn ordering_is_a_permutation() {
        let mut random = Random::deterministic(b"seed", b"nonce");
        let ordering = random_ordering(10, random.casual());
        let mut sorted = ordering.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..10).collect::<Vec<_>>());
    }
}

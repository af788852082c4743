//! Change construction: draw output values from a log-triangular
//! distribution and pair each with a freshly advanced change key.

use bitcoin::{Amount, TxOut};
use rand::Rng;

use crate::error::{Error, Result};
use crate::extended::SatsPerByte;
use crate::keys::derivation::var_int_size;
use crate::keys::{KeySequence, Signing};
use crate::script;
use crate::wallet::account::Redeemable;

/// Serialized size of one pay-to-address output: value, script length,
/// 25-byte script.
const OUTPUT_SIZE: u64 = 34;

/// A triangular distribution over the logarithm of the output value.
///
/// The mode is found by bisection on the closed-form expectation, so the
/// caller specifies the arithmetic mean in satoshis directly.
#[derive(Clone, Copy, Debug)]
pub struct LogTriangular {
    /// ln(min), ln(max), and the mode in ln-space; a constant
    /// distribution is represented by a degenerate triangle.
    a: f64,
    b: f64,
    mode: f64,
    constant: Option<f64>,
}

/// Closed-form mean of exp(X) where X is triangular on [a, b] with mode m.
fn log_triangular_mean(a: f64, b: f64, m: f64) -> f64 {
    let e_a = a.exp();
    let e_b = b.exp();
    let e_m = m.exp();
    (((e_m * (a - m + 1.0) - e_a) / (a - m)) + ((e_m * (m - b - 1.0) + e_b) / (b - m))) * 2.0
        / (b - a)
}

/// The limit of the mean as the mode approaches a (the smallest mean this
/// interval can produce).
fn min_log_triangular_mean(a: f64, b: f64) -> f64 {
    let e_a = a.exp();
    let e_b = b.exp();
    (e_a * (a - b - 1.0) + e_b) * 2.0 / ((b - a) * (b - a))
}

/// The limit as the mode approaches b.
fn max_log_triangular_mean(a: f64, b: f64) -> f64 {
    let e_a = a.exp();
    let e_b = b.exp();
    (e_b * (a - b + 1.0) - e_a) * 2.0 / ((a - b) * (b - a))
}

/// Bisect for the mode whose mean is within one satoshi of the request.
/// The mean is increasing in the mode.
fn find_mode(a: f64, b: f64, mean: f64) -> f64 {
    let mut low = a;
    let mut high = b;
    loop {
        let mode = (high - low) / 2.0 + low;
        let guess = log_triangular_mean(a, b, mode);
        if (guess - mean).abs() <= 1.0 {
            return mode;
        }
        if guess > mean {
            high = mode;
        } else {
            low = mode;
        }
    }
}

impl LogTriangular {
    /// Parameters in satoshis. `mean == min` or `mean == max` degenerate
    /// to a constant; a mean the interval cannot produce fails.
    pub fn new(min: u64, max: u64, mean: u64) -> Result<Self> {
        if min == 0 || max < min {
            return Err(Error::UnsatisfiableChange(format!(
                "bad output value interval [{min}, {max}]"
            )));
        }
        if mean < min || mean > max {
            return Err(Error::UnsatisfiableChange(format!(
                "mean {mean} outside [{min}, {max}]"
            )));
        }
        let a = (min as f64).ln();
        let b = (max as f64).ln();
        if mean == min || mean == max || min == max {
            return Ok(LogTriangular {
                a,
                b,
                mode: a,
                constant: Some(mean as f64),
            });
        }
        let min_mean = min_log_triangular_mean(a, b);
        let max_mean = max_log_triangular_mean(a, b);
        if (mean as f64) < min_mean {
            return Err(Error::UnsatisfiableChange(format!(
                "smallest possible mean for [{min}, {max}] is {min_mean:.0}"
            )));
        }
        if (mean as f64) > max_mean {
            return Err(Error::UnsatisfiableChange(format!(
                "largest possible mean for [{min}, {max}] is {max_mean:.0}"
            )));
        }
        Ok(LogTriangular {
            a,
            b,
            mode: find_mode(a, b, mean as f64),
            constant: None,
        })
    }

    /// Draw one output value in satoshis.
    pub fn sample<R: Rng>(&self, rng: &mut R) -> f64 {
        if let Some(value) = self.constant {
            return value;
        }
        // Inverse CDF of the triangular distribution, then exponentiate.
        let u: f64 = rng.gen_range(0.0..1.0);
        let span = self.b - self.a;
        let cut = (self.mode - self.a) / span;
        let x = if u < cut {
            self.a + (u * span * (self.mode - self.a)).sqrt()
        } else {
            self.b - ((1.0 - u) * span * (self.b - self.mode)).sqrt()
        };
        x.exp()
    }
}

/// Tunables for change construction.
#[derive(Clone, Copy, Debug)]
pub struct ChangeParams {
    /// Below this amount no change output is created at all; the residue
    /// goes to fees.
    pub minimum_create_value: u64,
    pub min_sats_per_output: u64,
    pub max_sats_per_output: u64,
    pub mean_sats_per_output: u64,
}

impl Default for ChangeParams {
    fn default() -> Self {
        ChangeParams {
            minimum_create_value: 546,
            min_sats_per_output: 1_000,
            max_sats_per_output: 1_000_000,
            mean_sats_per_output: 100_000,
        }
    }
}

/// Freshly constructed change outputs and the sequence index after them.
#[derive(Clone, Debug)]
pub struct Change {
    pub outputs: Vec<Redeemable>,
    /// The change sequence's next index after these outputs.
    pub next_index: u32,
}

impl Change {
    pub fn tx_outputs(&self) -> Vec<TxOut> {
        self.outputs.iter().map(|r| r.prevout.clone()).collect()
    }
}

fn change_output(sequence: &KeySequence, index: u32, value: u64) -> Result<Redeemable> {
    let derivation = sequence.derivation_at(index)?;
    let key = derivation.derive()?;
    let hash = key.as_pubkey()?.pubkey_hash();
    Ok(Redeemable::new(
        TxOut {
            value: Amount::from_sat(value),
            script_pubkey: script::pay_to_address(&hash),
        },
        Signing::new(vec![derivation], script::redeem_expected_size(true)),
    ))
}

/// Construct change outputs worth `amount` less the fees their own bytes
/// cost, advancing keys from `sequence` starting at its next index.
pub fn make_change<R: Rng>(
    sequence: &KeySequence,
    amount: u64,
    fees: SatsPerByte,
    params: &ChangeParams,
    rng: &mut R,
) -> Result<Change> {
    if amount < params.minimum_create_value {
        return Ok(Change {
            outputs: Vec::new(),
            next_index: sequence.next,
        });
    }

    if amount < params.min_sats_per_output {
        // A single output taking everything, less what its own bytes
        // cost.
        let value = amount.saturating_sub(fees.fee_for(OUTPUT_SIZE));
        if value == 0 {
            return Ok(Change {
                outputs: Vec::new(),
                next_index: sequence.next,
            });
        }
        return Ok(Change {
            outputs: vec![change_output(sequence, sequence.next, value)?],
            next_index: sequence.next + 1,
        });
    }

    let distribution = LogTriangular::new(
        params.min_sats_per_output,
        params.max_sats_per_output,
        params.mean_sats_per_output,
    )?;

    let mut outputs: Vec<Redeemable> = Vec::new();
    let mut index = sequence.next;
    let mut remaining = amount as i64;

    loop {
        let outputs_next = outputs.len() as u64 + 1;
        let expected_fees_next =
            fees.fee_for(var_int_size(outputs_next) + outputs_next * OUTPUT_SIZE) as i64;
        let expected_remainder = remaining - expected_fees_next;

        if expected_remainder < params.min_sats_per_output as i64 {
            return Err(Error::UnsatisfiableChange(format!(
                "{remaining} sats cannot fund another output of at least {}",
                params.min_sats_per_output
            )));
        }

        let drawn = (distribution.sample(rng) + 0.5) as i64;
        let done = expected_remainder - drawn < params.min_sats_per_output as i64;
        let value = if done { expected_remainder } else { drawn };

        outputs.push(change_output(sequence, index, value as u64)?);
        index += 1;

        if done {
            return Ok(Change {
                outputs,
                next_index: index,
            });
        }
        remaining -= value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{parse_path, KeyExpr};
    use crate::random::Random;

    const XPUB: &str = "xpub661MyMwAqRbcGU4rfEbR1EHqFdDyxraiXeZiFPkaiDqGbv4ToJp7C5YuLQkTBtRxL8oqjPHwWJuXUTENqLF2i7j8Bit8HqKLhEzcm6uZPPA";

    fn sequence() -> KeySequence {
        KeySequence::new(
            KeyExpr::parse(&format!("HD.pubkey \"{XPUB}\"")).unwrap(),
            parse_path("1").unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn mean_outside_the_interval_is_rejected() {
        assert!(LogTriangular::new(100, 1000, 50).is_err());
        assert!(LogTriangular::new(100, 1000, 2000).is_err());
        assert!(LogTriangular::new(100, 1000, 101).is_err()); // below the floor mean
    }

    #[test]
    fn samples_stay_inside_the_interval() {
        let distribution = LogTriangular::new(1_000, 100_000, 20_000).unwrap();
        let mut random = Random::deterministic(b"seed", b"nonce");
        for _ in 0..200 {
            let v = distribution.sample(random.casual());
            assert!(v >= 999.0 && v <= 100_001.0, "sample {v} escaped");
        }
    }

    #[test]
    fn sample_mean_approaches_the_requested_mean() {
        let distribution = LogTriangular::new(1_000, 100_000, 20_000).unwrap();
        let mut random = Random::deterministic(b"seed", b"nonce");
        let n = 4_000;
        let total: f64 = (0..n).map(|_| distribution.sample(random.casual())).sum();
        let mean = total / n as f64;
        assert!(
            (mean - 20_000.0).abs() < 2_000.0,
            "sample mean {mean} is far from 20000"
        );
    }

    #[test]
    fn mean_equal_to_min_emits_min_valued_outputs() {
        let params = ChangeParams {
            minimum_create_value: 500,
            min_sats_per_output: 1_000,
            max_sats_per_output: 100_000,
            mean_sats_per_output: 1_000,
        };
        let mut random = Random::deterministic(b"seed", b"nonce");
        let change = make_change(
            &sequence(),
            10_000,
            SatsPerByte::new(0, 1),
            &params,
            random.casual(),
        )
        .unwrap();
        assert!(change.outputs.len() > 1);
        for output in &change.outputs[..change.outputs.len() - 1] {
            assert_eq!(output.value(), 1_000);
        }
        // The residue merges into the final output.
        let total: u64 = change.outputs.iter().map(Redeemable::value).sum();
        assert_eq!(total, 10_000);
    }

    #[test]
    fn small_amounts_become_one_output() {
        let fees = SatsPerByte::new(1, 20);
        let amount = 600 + fees.fee_for(34);
        let mut random = Random::deterministic(b"seed", b"nonce");
        let change = make_change(
            &sequence(),
            amount,
            fees,
            &ChangeParams::default(),
            random.casual(),
        )
        .unwrap();
        assert_eq!(change.outputs.len(), 1);
        assert_eq!(change.outputs[0].value(), 600);
        assert_eq!(change.next_index, 1);
    }

    #[test]
    fn below_create_threshold_makes_no_output() {
        let mut random = Random::deterministic(b"seed", b"nonce");
        let change = make_change(
            &sequence(),
            100,
            SatsPerByte::new(1, 2),
            &ChangeParams::default(),
            random.casual(),
        )
        .unwrap();
        assert!(change.outputs.is_empty());
        assert_eq!(change.next_index, 0);
    }

    #[test]
    fn change_keys_advance_monotonically() {
        let params = ChangeParams {
            minimum_create_value: 500,
            min_sats_per_output: 1_000,
            max_sats_per_output: 5_000,
            mean_sats_per_output: 2_000,
        };
        let mut random = Random::deterministic(b"seed", b"nonce");
        let change = make_change(
            &sequence(),
            20_000,
            SatsPerByte::new(1, 2),
            &params,
            random.casual(),
        )
        .unwrap();
        assert_eq!(change.next_index as usize, change.outputs.len());
        // Every output pays a distinct derived key.
        let mut scripts: Vec<_> = change
            .outputs
            .iter()
            .map(|o| o.prevout.script_pubkey.clone())
            .collect();
        scripts.sort();
        scripts.dedup();
        assert_eq!(scripts.len(), change.outputs.len());
    }

    #[test]
    fn fees_come_out_of_the_change() {
        let params = ChangeParams {
            minimum_create_value: 500,
            min_sats_per_output: 1_000,
            max_sats_per_output: 5_000,
            mean_sats_per_output: 2_000,
        };
        let mut random = Random::deterministic(b"seed", b"nonce");
        let fees = SatsPerByte::new(1, 1);
        let amount = 20_000;
        let change = make_change(&sequence(), amount, fees, &params, random.casual()).unwrap();
        let total: u64 = change.outputs.iter().map(Redeemable::value).sum();
        let n = change.outputs.len() as u64;
        let output_bytes = var_int_size(n) + n * OUTPUT_SIZE;
        assert_eq!(total + fees.fee_for(output_bytes), amount);
    }
}

//! Drop-down UTXO selection: start with everything, randomly remove
//! outputs until no removal can still cover the payment, its fees, and
//! the change constraints.
//!
//! Finding outputs we don't want to spend is easier than finding outputs
//! we do, which is why selection runs backwards.

use bitcoin::OutPoint;
use rand::distributions::{Distribution, Uniform, WeightedIndex};
use rand::Rng;

use crate::error::{Error, Result};
use crate::extended::SatsPerByte;
use crate::wallet::account::{Account, Redeemable};

/// Tunables for drop-down selection.
#[derive(Clone, Copy, Debug)]
pub struct SelectParams {
    /// How many outputs a spend should ideally consume.
    pub optimal_outputs_per_spend: u32,
    /// The minimum amount that can go in a change output.
    pub min_change_value: u64,
    /// How much of the amount spent should be change, as a range; a value
    /// is drawn per selection.
    pub min_change_fraction: f64,
    pub max_change_fraction: f64,
}

impl Default for SelectParams {
    fn default() -> Self {
        SelectParams {
            optimal_outputs_per_spend: 2,
            min_change_value: 546,
            min_change_fraction: 0.1,
            max_change_fraction: 0.5,
        }
    }
}

/// The chosen inputs, in randomized order.
#[derive(Clone, Debug)]
pub struct Selected {
    pub outputs: Vec<(OutPoint, Redeemable)>,
}

impl Selected {
    /// Total value of the chosen inputs.
    pub fn spent_value(&self) -> u64 {
        self.outputs.iter().map(|(_, r)| r.value()).sum()
    }

    /// Expected serialized size of all chosen inputs.
    pub fn expected_input_size(&self) -> u64 {
        self.outputs
            .iter()
            .map(|(_, r)| r.expected_input_size())
            .sum()
    }
}

struct DropDown {
    chosen: Vec<(OutPoint, Redeemable)>,
    spent_value: u64,
    inputs_expected_size: u64,
}

impl DropDown {
    fn admissible_removals(
        &self,
        value_to_spend: u64,
        fees: SatsPerByte,
        optimal_outputs_per_spend: f64,
        min_change_value: f64,
        min_change_fraction: f64,
    ) -> Vec<(usize, f64)> {
        let mut removable = Vec::new();
        for (position, (_, entry)) in self.chosen.iter().enumerate() {
            let removed_inputs_size = self.inputs_expected_size - entry.expected_input_size();
            let output_value = entry.value() as f64;
            let removed_spent_value = self.spent_value as f64 - output_value;
            let removed_value_with_fee =
                value_to_spend as f64 + fees.as_f64() * removed_inputs_size as f64;

            if removed_spent_value <= removed_value_with_fee + min_change_value
                || removed_spent_value <= removed_value_with_fee * (min_change_fraction + 1.0)
            {
                continue;
            }

            let optimal_value_per_output = removed_value_with_fee / optimal_outputs_per_spend;
            let weight = if output_value > optimal_value_per_output {
                output_value / optimal_value_per_output
            } else {
                optimal_value_per_output / output_value
            };
            removable.push((position, weight));
        }
        removable
    }

    fn reduce<R: Rng>(
        &mut self,
        value_to_spend: u64,
        fees: SatsPerByte,
        params: &SelectParams,
        min_change_fraction: f64,
        rng: &mut R,
    ) {
        loop {
            let removable = self.admissible_removals(
                value_to_spend,
                fees,
                params.optimal_outputs_per_spend as f64,
                params.min_change_value as f64,
                min_change_fraction,
            );
            if removable.is_empty() {
                return;
            }

            let weights: Vec<f64> = removable.iter().map(|(_, w)| *w).collect();
            let index = WeightedIndex::new(&weights)
                .expect("weights are positive and non-empty")
                .sample(rng);
            let (position, _) = removable[index];
            let (_, removed) = self.chosen.remove(position);
            self.inputs_expected_size -= removed.expected_input_size();
            self.spent_value -= removed.value();
        }
    }
}

/// Select outputs sufficient for `value_to_spend` plus the fees of the
/// inputs themselves.
pub fn select_down<R: Rng>(
    account: &Account,
    value_to_spend: u64,
    fees: SatsPerByte,
    params: &SelectParams,
    rng: &mut R,
) -> Result<Selected> {
    let available = account.value();
    if available <= value_to_spend {
        return Err(Error::InsufficientFunds {
            available,
            required: value_to_spend,
        });
    }

    let mut state = DropDown {
        chosen: account
            .entries
            .iter()
            .map(|(op, entry)| (*op, entry.clone()))
            .collect(),
        spent_value: available,
        inputs_expected_size: account
            .entries
            .values()
            .map(Redeemable::expected_input_size)
            .sum(),
    };

    let min_change_fraction = if params.min_change_fraction >= params.max_change_fraction {
        params.min_change_fraction
    } else {
        Uniform::new(params.min_change_fraction, params.max_change_fraction).sample(rng)
    };

    // When the whole account cannot satisfy the change constraints,
    // everything stays selected.
    if state.spent_value > value_to_spend + params.min_change_value
        && state.spent_value as f64 > value_to_spend as f64 * (min_change_fraction + 1.0)
    {
        state.reduce(value_to_spend, fees, params, min_change_fraction, rng);
    }

    let spend_value_with_fee =
        value_to_spend as f64 + fees.as_f64() * state.inputs_expected_size as f64;
    if spend_value_with_fee > state.spent_value as f64 {
        return Err(Error::InsufficientFunds {
            available: state.spent_value,
            required: spend_value_with_fee.ceil() as u64,
        });
    }

    // Shuffle so input order leaks nothing about the account layout.
    use rand::seq::SliceRandom;
    state.chosen.shuffle(rng);

    Ok(Selected {
        outputs: state.chosen,
    })
}

#[cfg(test)]
mod tests {
    use bitcoin::hashes::{sha256d, Hash};
    use bitcoin::{Amount, ScriptBuf, TxOut, Txid};

    use super::*;
    use crate::keys::Signing;
    use crate::random::Random;

    fn account_of(values: &[u64]) -> Account {
        let mut account = Account::new();
        for (i, value) in values.iter().enumerate() {
            let txid = Txid::from_raw_hash(sha256d::Hash::hash(&[i as u8]));
            account.entries.insert(
                OutPoint::new(txid, 0),
                Redeemable::new(
                    TxOut {
                        value: Amount::from_sat(*value),
                        script_pubkey: ScriptBuf::new(),
                    },
                    Signing::new(vec![], 107),
                ),
            );
        }
        account
    }

    #[test]
    fn insufficient_funds_is_detected_up_front() {
        let account = account_of(&[100, 200]);
        let mut random = Random::deterministic(b"seed", b"nonce");
        let result = select_down(
            &account,
            500,
            SatsPerByte::new(1, 2),
            &SelectParams::default(),
            random.casual(),
        );
        assert!(matches!(result, Err(Error::InsufficientFunds { .. })));
    }

    #[test]
    fn selection_covers_value_plus_input_fees() {
        let account = account_of(&[100, 200, 400, 800]);
        let mut random = Random::deterministic(b"seed", b"nonce");
        let selected = select_down(
            &account,
            500,
            SatsPerByte::new(1, 2),
            &SelectParams {
                optimal_outputs_per_spend: 2,
                ..SelectParams::default()
            },
            random.casual(),
        )
        .unwrap();
        let fee = SatsPerByte::new(1, 2).fee_for(selected.expected_input_size());
        assert!(selected.spent_value() >= 500 + fee);
    }

    #[test]
    fn selection_is_deterministic_under_a_fixed_seed() {
        let account = account_of(&[100, 200, 400, 800]);
        let params = SelectParams {
            optimal_outputs_per_spend: 2,
            ..SelectParams::default()
        };
        let run = || {
            let mut random = Random::deterministic(&0xdeadbeefu32.to_be_bytes(), b"nonce");
            let selected = select_down(
                &account,
                500,
                SatsPerByte::new(1, 2),
                &params,
                random.casual(),
            )
            .unwrap();
            let mut points: Vec<OutPoint> = selected.outputs.iter().map(|(op, _)| *op).collect();
            points.sort();
            points
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn whole_account_stays_selected_when_change_cannot_be_satisfied() {
        // 1000 total against 900: no removal can leave min change.
        let account = account_of(&[600, 400]);
        let mut random = Random::deterministic(b"seed", b"nonce");
        let selected = select_down(
            &account,
            900,
            SatsPerByte::new(0, 1),
            &SelectParams::default(),
            random.casual(),
        )
        .unwrap();
        assert_eq!(selected.outputs.len(), 2);
    }
}

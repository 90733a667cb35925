use std::collections::HashMap;

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

use crate::address::Address;
use crate::numeric::{self, amount_serde};

/// Bonding status as reported by the staking module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum ValidatorStatus {
    Unbonded,
    Unbonding,
    Bonded,
    Unknown,
}

impl From<i64> for ValidatorStatus {
    fn from(code: i64) -> Self {
        match code {
            1 => ValidatorStatus::Unbonded,
            2 => ValidatorStatus::Unbonding,
            3 => ValidatorStatus::Bonded,
            _ => ValidatorStatus::Unknown,
        }
    }
}

impl From<ValidatorStatus> for i64 {
    fn from(status: ValidatorStatus) -> Self {
        match status {
            ValidatorStatus::Unbonded => 1,
            ValidatorStatus::Unbonding => 2,
            ValidatorStatus::Bonded => 3,
            ValidatorStatus::Unknown => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Commission {
    #[serde(default)]
    pub rate: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatorRecord {
    pub validator_address: Address,
    #[serde(default)]
    pub moniker: String,
    #[serde(default, with = "amount_serde")]
    pub tokens: BigUint,
    #[serde(default)]
    pub commission: Commission,
    pub status: ValidatorStatus,
    #[serde(default)]
    pub jailed: bool,
    /// Annual percentage rate as a decimal string.
    #[serde(default)]
    pub apr: String,
}

impl ValidatorRecord {
    pub fn is_active(&self) -> bool {
        self.status == ValidatorStatus::Bonded && !self.jailed
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichedValidator {
    pub record: ValidatorRecord,
    pub display_name: String,
    pub staked_amount: f64,
    /// Share of the stake bonded to active validators; zero when inactive.
    pub voting_power_percent: f64,
    pub commission_percent: f64,
    pub apr_percent: f64,
    pub is_active: bool,
}

/// A delegator's position with one validator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegationRecord {
    pub validator_address: Address,
    #[serde(default, with = "amount_serde")]
    pub amount: BigUint,
    #[serde(default, with = "amount_serde")]
    pub rewards: BigUint,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichedDelegation {
    pub record: DelegationRecord,
    pub validator_name: String,
    pub amount: f64,
    pub rewards: f64,
    pub validator_active: bool,
}

fn display_name(moniker: &str, address: &Address) -> String {
    if moniker.trim().is_empty() {
        address.short()
    } else {
        moniker.trim().to_string()
    }
}

/// Derive display and share fields, ordered by stake descending.
pub fn enrich_validators(records: Vec<ValidatorRecord>, decimals: u8) -> Vec<EnrichedValidator> {
    let total_bonded = records
        .iter()
        .filter(|v| v.is_active())
        .fold(BigUint::from(0u8), |acc, v| acc + &v.tokens);

    let mut enriched: Vec<EnrichedValidator> = records
        .into_iter()
        .map(|record| {
            let is_active = record.is_active();
            let voting_power_percent = if is_active {
                numeric::percent(&record.tokens, &total_bonded)
            } else {
                0.0
            };
            EnrichedValidator {
                display_name: display_name(&record.moniker, &record.validator_address),
                staked_amount: numeric::to_decimal(&record.tokens, decimals),
                voting_power_percent,
                commission_percent: numeric::parse_decimal(&record.commission.rate) * 100.0,
                apr_percent: numeric::parse_decimal(&record.apr),
                is_active,
                record,
            }
        })
        .collect();

    enriched.sort_by(|a, b| b.record.tokens.cmp(&a.record.tokens));
    enriched
}

/// Join delegations with validator names. A delegation to an unknown
/// validator keeps its shortened address as a name.
pub fn enrich_delegations(
    delegations: Vec<DelegationRecord>,
    validators: &[ValidatorRecord],
    decimals: u8,
) -> Vec<EnrichedDelegation> {
    let by_address: HashMap<Address, &ValidatorRecord> = validators
        .iter()
        .map(|v| (v.validator_address, v))
        .collect();

    delegations
        .into_iter()
        .map(|record| {
            let validator = by_address.get(&record.validator_address);
            EnrichedDelegation {
                validator_name: validator
                    .map(|v| display_name(&v.moniker, &v.validator_address))
                    .unwrap_or_else(|| record.validator_address.short()),
                validator_active: validator.map(|v| v.is_active()).unwrap_or(false),
                amount: numeric::to_decimal(&record.amount, decimals),
                rewards: numeric::to_decimal(&record.rewards, decimals),
                record,
            }
        })
        .collect()
}

use std::collections::HashMap;

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

use crate::numeric::{self, amount_serde};
use crate::storage::votes::VotedProposal;

/// A governance vote option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteOption {
    Yes,
    No,
    Abstain,
    NoWithVeto,
}

impl VoteOption {
    /// Numeric option as used by the governance module.
    pub fn code(self) -> u8 {
        match self {
            VoteOption::Yes => 1,
            VoteOption::Abstain => 2,
            VoteOption::No => 3,
            VoteOption::NoWithVeto => 4,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(VoteOption::Yes),
            2 => Some(VoteOption::Abstain),
            3 => Some(VoteOption::No),
            4 => Some(VoteOption::NoWithVeto),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String")]
pub enum ProposalStatus {
    DepositPeriod,
    VotingPeriod,
    Passed,
    Rejected,
    Failed,
    Unknown,
}

impl From<String> for ProposalStatus {
    fn from(raw: String) -> Self {
        let normalized = raw.to_uppercase();
        let normalized = normalized
            .strip_prefix("PROPOSAL_STATUS_")
            .unwrap_or(&normalized);
        match normalized {
            "DEPOSIT_PERIOD" => ProposalStatus::DepositPeriod,
            "VOTING_PERIOD" => ProposalStatus::VotingPeriod,
            "PASSED" => ProposalStatus::Passed,
            "REJECTED" => ProposalStatus::Rejected,
            "FAILED" => ProposalStatus::Failed,
            _ => ProposalStatus::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Tally {
    #[serde(default, with = "amount_serde")]
    pub yes: BigUint,
    #[serde(default, with = "amount_serde")]
    pub no: BigUint,
    #[serde(default, with = "amount_serde")]
    pub abstain: BigUint,
    #[serde(default, with = "amount_serde")]
    pub no_with_veto: BigUint,
}

impl Tally {
    pub fn total(&self) -> BigUint {
        &self.yes + &self.no + &self.abstain + &self.no_with_veto
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposalRecord {
    pub id: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub proposer: String,
    pub status: ProposalStatus,
    #[serde(default)]
    pub voting_end_time: Option<String>,
    #[serde(default, rename = "currentTallyResult")]
    pub tally: Tally,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TallyPercentages {
    pub yes: f64,
    pub no: f64,
    pub abstain: f64,
    pub no_with_veto: f64,
}

/// Where the user's displayed vote came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteSource {
    Local,
    Server,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichedProposal {
    pub record: ProposalRecord,
    pub tally_percent: TallyPercentages,
    pub user_vote: Option<VoteOption>,
    pub vote_source: Option<VoteSource>,
}

impl EnrichedProposal {
    pub fn is_open(&self) -> bool {
        self.record.status == ProposalStatus::VotingPeriod
    }
}

pub fn tally_percentages(tally: &Tally) -> TallyPercentages {
    let total = tally.total();
    TallyPercentages {
        yes: numeric::percent(&tally.yes, &total),
        no: numeric::percent(&tally.no, &total),
        abstain: numeric::percent(&tally.abstain, &total),
        no_with_veto: numeric::percent(&tally.no_with_veto, &total),
    }
}

/// Merge server proposals with the user's votes.
///
/// A local vote recorded after `last_server_sync` (unix millis) overrides the
/// server's answer; older local votes yield to the server.
pub fn enrich_proposals(
    records: Vec<ProposalRecord>,
    server_votes: &HashMap<u64, VoteOption>,
    local_votes: &[VotedProposal],
    last_server_sync: Option<i64>,
) -> Vec<EnrichedProposal> {
    let local: HashMap<u64, &VotedProposal> =
        local_votes.iter().map(|v| (v.proposal_id, v)).collect();

    records
        .into_iter()
        .map(|record| {
            let fresh_local = local.get(&record.id).filter(|v| match last_server_sync {
                Some(synced_at) => v.timestamp > synced_at,
                None => true,
            });

            let (user_vote, vote_source) = match (fresh_local, server_votes.get(&record.id)) {
                (Some(local), _) => (Some(local.option), Some(VoteSource::Local)),
                (None, Some(server)) => (Some(*server), Some(VoteSource::Server)),
                (None, None) => (None, None),
            };

            EnrichedProposal {
                tally_percent: tally_percentages(&record.tally),
                user_vote,
                vote_source,
                record,
            }
        })
        .collect()
}

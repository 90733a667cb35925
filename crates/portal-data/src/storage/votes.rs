use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::enrich::proposal::VoteOption;
use crate::storage::backend::{read_json, write_json, TieredStorage, VOTING_HISTORY_KEY};
use crate::storage::now_millis;

/// Lifecycle of a vote transaction as the user last saw it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteStatus {
    Pending,
    Confirmed,
    Failed,
}

/// A vote cast from this device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VotedProposal {
    pub proposal_id: u64,
    pub option: VoteOption,
    /// Unix milliseconds.
    pub timestamp: i64,
    pub status: VoteStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Locally remembered votes, newest first.
pub struct VotingHistory {
    storage: Arc<TieredStorage>,
    votes: Mutex<Vec<VotedProposal>>,
    capacity: usize,
}

impl VotingHistory {
    /// Load history from the active storage tier.
    pub fn load(storage: Arc<TieredStorage>, capacity: usize) -> Self {
        let mut votes: Vec<VotedProposal> =
            read_json(storage.active().as_ref(), VOTING_HISTORY_KEY).unwrap_or_default();
        votes.truncate(capacity);
        Self {
            storage,
            votes: Mutex::new(votes),
            capacity,
        }
    }

    /// Record a vote, replacing any earlier vote on the same proposal.
    pub fn add_vote(
        &self,
        proposal_id: u64,
        option: VoteOption,
        status: VoteStatus,
        metadata: Option<Value>,
    ) -> VotedProposal {
        let vote = VotedProposal {
            proposal_id,
            option,
            timestamp: now_millis(),
            status,
            metadata,
        };
        let mut votes = self.votes.lock();
        votes.retain(|v| v.proposal_id != proposal_id);
        votes.insert(0, vote.clone());
        votes.truncate(self.capacity);
        // Written under the lock so stored snapshots follow update order.
        self.persist(&votes);
        vote
    }

    /// Update the status of a recorded vote. Returns false if there is none.
    pub fn set_status(&self, proposal_id: u64, status: VoteStatus) -> bool {
        let mut votes = self.votes.lock();
        match votes.iter_mut().find(|v| v.proposal_id == proposal_id) {
            Some(vote) => vote.status = status,
            None => return false,
        }
        self.persist(&votes);
        true
    }

    pub fn clear_history(&self) {
        let mut votes = self.votes.lock();
        votes.clear();
        if let Err(e) = self.storage.active().remove(VOTING_HISTORY_KEY) {
            tracing::warn!(error = %e, "failed to clear stored voting history");
        }
    }

    pub fn votes(&self) -> Vec<VotedProposal> {
        self.votes.lock().clone()
    }

    pub fn vote_for(&self, proposal_id: u64) -> Option<VotedProposal> {
        self.votes
            .lock()
            .iter()
            .find(|v| v.proposal_id == proposal_id)
            .cloned()
    }

    fn persist(&self, votes: &[VotedProposal]) {
        if let Err(e) = write_json(self.storage.active().as_ref(), VOTING_HISTORY_KEY, votes) {
            tracing::warn!(error = %e, count = votes.len(), "failed to persist voting history");
        }
    }
}

//! Per-address Paxos: the pure state machine, free of I/O.
//!
//! Every mutable address is one independent instance. A proposal is
//! `(round, proposer id)`, ordered lexicographically. A value is either a
//! sealed block or a new quorum (membership change); both compete in the
//! same proposal order, so a rebalance can win over a pending write and
//! vice versa. Confirmation is the commit barrier: a value is observable
//! through fetch only once a replica saw `confirm`.
//!
//! The acceptor enforces two local guards on top of classic Paxos: the
//! proposal order per promise, and block-version monotonicity against the
//! last chosen block.

use crate::address::NodeId;
use crate::blocks::Block;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

/// The set of node ids owning one mutable block.
pub type Quorum = BTreeSet<NodeId>;

/// Smallest majority of `n` acceptors.
pub fn majority(n: usize) -> usize {
    n / 2 + 1
}

/// Totally ordered proposal number: round first, proposer id breaks ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Proposal {
    pub round: u64,
    pub proposer: NodeId,
}

impl Proposal {
    pub fn new(round: u64, proposer: NodeId) -> Self {
        Self { round, proposer }
    }
}

impl std::fmt::Display for Proposal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{:?}", self.round, self.proposer)
    }
}

/// What a round decides: new block contents or new membership.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Block(Block),
    Quorum(Quorum),
}

impl Value {
    pub fn as_block(&self) -> Option<&Block> {
        match self {
            Value::Block(b) => Some(b),
            Value::Quorum(_) => None,
        }
    }
}

/// An accepted proposal with its value and chosen flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Accepted {
    pub proposal: Proposal,
    pub value: Value,
    pub confirmed: bool,
}

/// Reply to a successful propose.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromiseResponse {
    /// Highest accepted proposal this acceptor has seen, if any.
    pub accepted: Option<Accepted>,
    /// The acceptor's current view of the quorum.
    pub quorum: Quorum,
}

/// Reply to a get.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetResponse {
    pub accepted: Option<Accepted>,
    /// Last confirmed block value; survives later quorum-change rounds.
    pub chosen: Option<(Proposal, Block)>,
    pub quorum: Quorum,
    /// Set when the caller's local version is already current; `chosen`
    /// is omitted to save bandwidth.
    pub not_modified: bool,
}

#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
pub enum PaxosError {
    /// Proposal below this acceptor's promise.
    #[error("proposal outdated, promised {promised}")]
    Outdated { promised: Proposal },
    /// The request named a quorum this acceptor does not agree with.
    #[error("quorum mismatch")]
    WrongQuorum { actual: Quorum },
    /// Block version does not exceed the last chosen version.
    #[error("version {version} already chosen")]
    VersionConflict { version: u64 },
    /// No instance for this address.
    #[error("no paxos state")]
    NotFound,
    /// Insert on an address whose instance already chose a value.
    #[error("address already holds a chosen value")]
    AlreadyExists,
}

// =============================================================================
// ACCEPTOR
// =============================================================================

/// One acceptor's durable state for one address. The consensus server
/// persists this whole record through the silo after every mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Acceptor {
    quorum: Quorum,
    promised: Option<Proposal>,
    accepted: Option<Accepted>,
    /// Last confirmed block value, kept across quorum-change rounds.
    chosen: Option<(Proposal, Block)>,
}

impl Acceptor {
    pub fn new(quorum: Quorum) -> Self {
        Self { quorum, promised: None, accepted: None, chosen: None }
    }

    pub fn quorum(&self) -> &Quorum {
        &self.quorum
    }

    pub fn chosen_block(&self) -> Option<&Block> {
        self.chosen.as_ref().map(|(_, b)| b)
    }

    pub fn chosen_version(&self) -> Option<u64> {
        self.chosen.as_ref().map(|(_, b)| b.version())
    }

    pub fn has_chosen(&self) -> bool {
        self.chosen.is_some()
    }

    fn check_quorum(&self, q: &Quorum) -> Result<(), PaxosError> {
        if q != &self.quorum {
            return Err(PaxosError::WrongQuorum { actual: self.quorum.clone() });
        }
        Ok(())
    }

    /// Phase 1. Promise not to accept anything below `proposal` and report
    /// the highest accepted value so far.
    pub fn propose(
        &mut self,
        quorum: &Quorum,
        proposal: Proposal,
    ) -> Result<PromiseResponse, PaxosError> {
        self.check_quorum(quorum)?;
        if let Some(promised) = self.promised {
            if proposal < promised {
                return Err(PaxosError::Outdated { promised });
            }
        }
        self.promised = Some(proposal);
        Ok(PromiseResponse { accepted: self.accepted.clone(), quorum: self.quorum.clone() })
    }

    /// Phase 2. Accept the value unless a higher promise supersedes it.
    pub fn accept(
        &mut self,
        quorum: &Quorum,
        proposal: Proposal,
        value: Value,
    ) -> Result<(), PaxosError> {
        self.check_quorum(quorum)?;
        if let Some(promised) = self.promised {
            if proposal < promised {
                return Err(PaxosError::Outdated { promised });
            }
        }
        // Version monotonicity: a block value must supersede the last
        // chosen version at this acceptor.
        if let Value::Block(block) = &value {
            if let Some(chosen) = self.chosen_version() {
                if block.version() <= chosen {
                    return Err(PaxosError::VersionConflict { version: chosen });
                }
            }
        }
        self.promised = Some(proposal);
        self.accepted = Some(Accepted { proposal, value, confirmed: false });
        Ok(())
    }

    /// Phase 3. Mark the value chosen; apply quorum changes.
    pub fn confirm(&mut self, quorum: &Quorum, proposal: Proposal) -> Result<(), PaxosError> {
        self.check_quorum(quorum)?;
        let accepted = match &mut self.accepted {
            Some(a) if a.proposal == proposal => a,
            // Confirm for a proposal we never accepted (lost message):
            // nothing to do, the value will reach us via reconcile.
            _ => return Err(PaxosError::NotFound),
        };
        accepted.confirmed = true;
        match accepted.value.clone() {
            Value::Block(block) => {
                self.chosen = Some((proposal, block));
            }
            Value::Quorum(new_quorum) => {
                self.quorum = new_quorum;
            }
        }
        Ok(())
    }

    /// Read the acceptor state; `local_version` enables the not-modified
    /// short path.
    pub fn get(&self, local_version: Option<u64>) -> GetResponse {
        if let (Some(local), Some(chosen)) = (local_version, self.chosen_version()) {
            if chosen <= local {
                return GetResponse {
                    accepted: self.accepted.clone(),
                    chosen: None,
                    quorum: self.quorum.clone(),
                    not_modified: true,
                };
            }
        }
        GetResponse {
            accepted: self.accepted.clone(),
            chosen: self.chosen.clone(),
            quorum: self.quorum.clone(),
            not_modified: false,
        }
    }

    /// Adopt a chosen value pushed by a quorum member (propagate after a
    /// membership change, or reconcile for a returning replica).
    pub fn learn(&mut self, quorum: Quorum, block: Block, proposal: Proposal) {
        let newer = match (&self.chosen, block.version()) {
            (Some((_, current)), incoming) => incoming > current.version(),
            (None, _) => true,
        };
        if newer {
            self.chosen = Some((proposal, block.clone()));
            self.accepted =
                Some(Accepted { proposal, value: Value::Block(block), confirmed: true });
        }
        self.quorum = quorum;
    }
}

//! Access policy: scope masks and the policy evaluator.
//!
//! A manifest carries a directory tree of scopes, each with an explicit
//! `policy_mask` and an inheritable `cone_policy`. The evaluator walks
//! that tree with a lexically normalized path and produces a
//! [`PolicyResult`] for one requested operation.

pub mod evaluator;

pub use evaluator::{evaluate, normalize_components};

use crate::types::{Operation, ReasonCode};
use serde::{Deserialize, Serialize};

/// Bit set describing what a scope permits and what it reports.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyMask(pub u16);

impl PolicyMask {
    pub const EMPTY: PolicyMask = PolicyMask(0);
    pub const ALLOW_READ: PolicyMask = PolicyMask(1);
    pub const ALLOW_WRITE: PolicyMask = PolicyMask(2);
    pub const ALLOW_PROBE: PolicyMask = PolicyMask(4);
    pub const ALLOW_ENUMERATE: PolicyMask = PolicyMask(8);
    pub const REPORT_ACCESS: PolicyMask = PolicyMask(16);
    pub const REPORT_EXPLICIT_EXPECTED: PolicyMask = PolicyMask(32);
    pub const DENY: PolicyMask = PolicyMask(64);

    /// Every allow bit set, nothing reported.
    pub const ALLOW_ALL: PolicyMask = PolicyMask(1 | 2 | 4 | 8);

    pub fn bits(self) -> u16 {
        self.0
    }

    pub fn from_bits(bits: u16) -> PolicyMask {
        PolicyMask(bits)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: PolicyMask) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn union(self, other: PolicyMask) -> PolicyMask {
        PolicyMask(self.0 | other.0)
    }

    /// The allow bit an operation needs. Exec and readlink resolve
    /// through read permission; create resolves through write.
    pub fn required_for(op: Operation) -> PolicyMask {
        match op {
            Operation::Probe => PolicyMask::ALLOW_PROBE,
            Operation::Read | Operation::Exec | Operation::Readlink => PolicyMask::ALLOW_READ,
            Operation::Write | Operation::Create => PolicyMask::ALLOW_WRITE,
            Operation::Enumerate => PolicyMask::ALLOW_ENUMERATE,
            _ => PolicyMask::EMPTY,
        }
    }
}

/// Effective policy verdict for one (path, operation) pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyResult {
    pub allowed: bool,
    pub report: bool,
    pub expected: bool,
    pub reason: ReasonCode,
}

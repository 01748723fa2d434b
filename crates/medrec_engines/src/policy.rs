#![forbid(unsafe_code)]

use medrec_kernel_contracts::roster::{Actor, AuthorityId, SubjectId};
use medrec_kernel_contracts::ReasonCodeId;

pub mod reason_codes {
    use medrec_kernel_contracts::ReasonCodeId;

    pub const POLICY_OK_AUTHORITY: ReasonCodeId = ReasonCodeId(0x4D52_0001);
    pub const POLICY_OK_SELF: ReasonCodeId = ReasonCodeId(0x4D52_0002);

    pub const POLICY_DENY_OTHER_SUBJECT: ReasonCodeId = ReasonCodeId(0x4D52_0010);
    pub const POLICY_DENY_FOREIGN_AUTHORITY: ReasonCodeId = ReasonCodeId(0x4D52_0011);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Write,
    Read,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyDecision {
    pub mode: AccessMode,
    pub allowed: bool,
    pub reason_code: ReasonCodeId,
}

/// Pure authorization rules over (actor, subject). Read and write follow the
/// same rule: the configured authority may act on any subject, a subject only
/// on itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationPolicy {
    authority: AuthorityId,
}

impl AuthorizationPolicy {
    pub fn new(authority: AuthorityId) -> Self {
        Self { authority }
    }

    pub fn authority(&self) -> &AuthorityId {
        &self.authority
    }

    pub fn can_write(&self, actor: &Actor, subject: &SubjectId) -> bool {
        self.decide(AccessMode::Write, actor, subject).allowed
    }

    pub fn can_read(&self, actor: &Actor, subject: &SubjectId) -> bool {
        self.decide(AccessMode::Read, actor, subject).allowed
    }

    pub fn decide(&self, mode: AccessMode, actor: &Actor, subject: &SubjectId) -> PolicyDecision {
        let (allowed, reason_code) = match actor {
            Actor::Authority(id) if *id == self.authority => {
                (true, reason_codes::POLICY_OK_AUTHORITY)
            }
            Actor::Authority(_) => (false, reason_codes::POLICY_DENY_FOREIGN_AUTHORITY),
            Actor::Subject(id) if id == subject => (true, reason_codes::POLICY_OK_SELF),
            Actor::Subject(_) => (false, reason_codes::POLICY_DENY_OTHER_SUBJECT),
        };
        PolicyDecision {
            mode,
            allowed,
            reason_code,
        }
    }
}

#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::common::validate_token_ascii;
use crate::{ContractViolation, SchemaVersion, Validate};

pub const ROSTER_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);
pub const ROSTER_MAX_SUBJECTS: usize = 4096;

const PRINCIPAL_ID_MAX_LEN: usize = 128;

/// Opaque subject (patient) identity. Position in the roster is a transport
/// concern only; storage and policy key on this value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String")]
pub struct SubjectId(String);

impl SubjectId {
    pub fn new(id: impl Into<String>) -> Result<Self, ContractViolation> {
        let id = id.into();
        validate_token_ascii("subject_id", &id, PRINCIPAL_ID_MAX_LEN)?;
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for SubjectId {
    type Error = ContractViolation;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String")]
pub struct AuthorityId(String);

impl AuthorityId {
    pub fn new(id: impl Into<String>) -> Result<Self, ContractViolation> {
        let id = id.into();
        validate_token_ascii("authority_id", &id, PRINCIPAL_ID_MAX_LEN)?;
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for AuthorityId {
    type Error = ContractViolation;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Actor {
    Authority(AuthorityId),
    Subject(SubjectId),
}

impl Actor {
    pub fn as_str(&self) -> &str {
        match self {
            Actor::Authority(id) => id.as_str(),
            Actor::Subject(id) => id.as_str(),
        }
    }

    pub fn is_authority(&self) -> bool {
        matches!(self, Actor::Authority(_))
    }
}

/// Fixed principal set, resolved once at process start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Roster {
    pub schema_version: SchemaVersion,
    authority: AuthorityId,
    subjects: Vec<SubjectId>,
}

impl Roster {
    pub fn v1(authority: AuthorityId, subjects: Vec<SubjectId>) -> Result<Self, ContractViolation> {
        let r = Self {
            schema_version: ROSTER_CONTRACT_VERSION,
            authority,
            subjects,
        };
        r.validate()?;
        Ok(r)
    }

    pub fn authority(&self) -> &AuthorityId {
        &self.authority
    }

    pub fn subjects(&self) -> &[SubjectId] {
        &self.subjects
    }

    pub fn len(&self) -> usize {
        self.subjects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subjects.is_empty()
    }

    pub fn contains(&self, subject_id: &SubjectId) -> bool {
        self.subjects.iter().any(|s| s == subject_id)
    }

    pub fn subject_at(&self, index: usize) -> Option<&SubjectId> {
        self.subjects.get(index)
    }

    /// Maps a raw principal id onto an actor. Unknown ids resolve to `None`.
    pub fn resolve_actor(&self, raw: &str) -> Option<Actor> {
        if raw == self.authority.as_str() {
            return Some(Actor::Authority(self.authority.clone()));
        }
        self.subjects
            .iter()
            .find(|s| s.as_str() == raw)
            .map(|s| Actor::Subject(s.clone()))
    }
}

impl Validate for Roster {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != ROSTER_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "roster.schema_version",
                reason: "must match ROSTER_CONTRACT_VERSION",
            });
        }
        if self.subjects.is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "roster.subjects",
                reason: "must not be empty",
            });
        }
        if self.subjects.len() > ROSTER_MAX_SUBJECTS {
            return Err(ContractViolation::InvalidValue {
                field: "roster.subjects",
                reason: "exceeds ROSTER_MAX_SUBJECTS",
            });
        }
        let mut seen = BTreeSet::new();
        for s in &self.subjects {
            if !seen.insert(s.as_str()) {
                return Err(ContractViolation::InvalidValue {
                    field: "roster.subjects",
                    reason: "must not contain duplicates",
                });
            }
            if s.as_str() == self.authority.as_str() {
                return Err(ContractViolation::InvalidValue {
                    field: "roster.authority",
                    reason: "must not also be a subject",
                });
            }
        }
        Ok(())
    }
}

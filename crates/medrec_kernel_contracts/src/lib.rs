#![forbid(unsafe_code)]

pub mod common;
pub mod derived;
pub mod evidence;
pub mod observation;
pub mod roster;

pub use common::{ContractViolation, MonotonicTimeNs, ReasonCodeId, SchemaVersion, Validate};

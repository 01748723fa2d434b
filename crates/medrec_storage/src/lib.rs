#![forbid(unsafe_code)]

pub mod derived_jobs;
pub mod ledger;
pub mod repo;

#![forbid(unsafe_code)]

pub mod access_service;
pub mod derived_symptom_worker;
pub mod retry;

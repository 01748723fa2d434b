#![forbid(unsafe_code)]

pub mod codec;
pub mod gateway;
pub mod policy;

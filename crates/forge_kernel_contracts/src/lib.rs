#![forbid(unsafe_code)]

pub mod build;
pub mod common;
pub mod deletion;
pub mod deploy;
pub mod namespace;
pub mod quota;
pub mod registry;
pub mod status;

pub use common::{ContractViolation, MonotonicTimeNs, SchemaVersion, Validate};

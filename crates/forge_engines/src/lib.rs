#![forbid(unsafe_code)]

pub mod backend;
pub mod context;
pub mod deletion;
pub mod deploy_script;
pub mod gcp;
pub mod http;
pub mod identity;
pub mod memory;
pub mod namespace;
pub mod quota;

//! Data models for warden

pub mod action;
pub mod audit;
pub mod configuration;
pub mod execution;
pub mod playbook;
pub mod role;

pub use action::*;
pub use audit::*;
pub use configuration::*;
pub use execution::*;
pub use playbook::*;
pub use role::*;

//! CLI command handling

pub mod audit;
pub mod context;
pub mod handlers;
pub mod output;

pub mod api;
pub mod core;

pub use api::create_api_routes;
pub use core::WardenServer;

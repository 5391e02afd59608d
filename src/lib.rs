#![recursion_limit = "512"] // Needed for the select! macros

pub mod api;
pub mod bgp;
pub mod config;
pub mod handler;
pub mod kernel;
pub mod ospf;
pub mod utils;

pub use config::ServerConfig;
pub use handler::serve;

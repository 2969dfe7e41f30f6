//! Resolution and handle internals

pub mod api;
pub mod arch;
pub mod cache;
pub mod config;
pub mod fingerprint;
pub mod handle;
pub mod loader;
pub mod resolver;
pub mod resources;
pub mod search;

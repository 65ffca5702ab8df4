//! toolsmith: an agent runtime that synthesizes, sandboxes and catalogs
//! its own tools.
//!
//! This library crate re-exports modules so integration tests
//! (under `tests/`) can access them.

pub mod agent;
pub mod builder;
pub mod capabilities;
pub mod cli;
pub mod config;
pub mod gateway;
pub mod logs;
pub mod memory;
pub mod models;
pub mod relay;
pub mod runtime;
pub mod sandbox;
pub mod store;
pub mod tools;
pub mod utils;

/// Return the toolsmith home directory.
///
/// Resolution order:
/// 1. `TOOLSMITH_HOME` environment variable
/// 2. `$HOME/.toolsmith`
pub fn toolsmith_home() -> std::path::PathBuf {
    if let Ok(p) = std::env::var("TOOLSMITH_HOME") {
        std::path::PathBuf::from(p)
    } else {
        dirs::home_dir()
            .unwrap_or_else(|| std::path::PathBuf::from("."))
            .join(".toolsmith")
    }
}

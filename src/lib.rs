pub mod cli;
pub mod config;
pub mod engine;
mod logging;

pub use engine::Session;
pub use logging::{BackgroundLog, MultiLogger};

/// blkplan version as provided by environment variables at build time
pub const BLKPLAN_VERSION: &str = match option_env!("BLKPLAN_VERSION") {
    Some(v) => v,
    None => env!("CARGO_PKG_VERSION"),
};

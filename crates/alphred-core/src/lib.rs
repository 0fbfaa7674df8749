pub mod config;
pub mod events;
pub mod skills;
pub mod types;

pub use config::Config;
pub use types::*;

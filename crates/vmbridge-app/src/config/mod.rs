//! Configuration file parsing for the VM bridge
//!
//! Supports `.vmbridge/config.toml` in the project directory.

pub mod settings;
pub mod types;

pub use settings::{config_path, init_config_dir, load_settings, load_settings_file};
pub use types::*;

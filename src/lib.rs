//! Flutter VM bridge
//!
//! Command-line front end for the supervised Dart VM Service connection.

pub mod headless;

// Re-export main entry points
pub use headless::runner::{run_call, run_extension, run_watch};

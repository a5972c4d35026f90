//! # vmbridge-core - Core Domain Types
//!
//! Foundation crate for the Flutter VM Service bridge. Provides the error
//! type, logging setup and the small set of domain types shared by the
//! protocol client, the connection supervisor and the CLI.
//!
//! This crate has **zero internal dependencies**.
//!
//! ## Public API
//!
//! ### Domain Types (`types`)
//! - [`Endpoint`] - Host, port and optional auth token of a VM Service
//! - [`ConnectionStatus`] - Coarse liveness reported to outer layers
//! - [`MemoryUsage`] - Heap snapshot from `getMemoryUsage`
//!
//! ### Error Handling (`error`)
//! - [`Error`] - Error enum with `fatal` / `recoverable` / `transport` classification
//! - [`Result`] - Type alias for `std::result::Result<T, Error>`
//! - [`ResultExt`] - Extension trait for adding error context
//!
//! ## Prelude
//!
//! ```rust
//! use vmbridge_core::prelude::*;
//! ```

pub mod error;
pub mod logging;
pub mod prelude;
pub mod types;

pub use error::{Error, Result, ResultExt};
pub use types::{ConnectionStatus, Endpoint, MemoryUsage};

//! vmbridge-app - Connection supervision for the Flutter VM bridge
//!
//! This crate keeps a [`VmServiceClient`](vmbridge_client::VmServiceClient)
//! alive across app restarts and socket drops: the [`Supervisor`] reconnects
//! with exponential backoff and the [`RecoveryGovernor`] caps how many
//! outages are recovered automatically. Settings come from
//! `.vmbridge/config.toml`.

pub mod config;
pub mod governor;
pub mod supervisor;

// Re-export primary types
pub use config::{load_settings, Settings};
pub use governor::{GovernorPolicy, RecoveryGovernor, RecoveryRecord};
pub use supervisor::{
    ReconnectPolicy, Supervisor, SupervisorEvent, SupervisorOptions, SupervisorState,
};

//! Logging configuration using tracing

use std::path::PathBuf;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::error::Result;

/// Filter used when `VMBRIDGE_LOG` is unset: info for every workspace
/// crate (the `vmbridge` binary and the `flutter_vm_bridge` library
/// included), warn for dependencies.
const DEFAULT_FILTER: &str = "vmbridge=info,flutter_vm_bridge=info,vmbridge_core=info,\
vmbridge_client=info,vmbridge_app=info,warn";

/// Initialize the logging subsystem
///
/// Logs are written to `~/.local/share/flutter-vm-bridge/logs/`.
/// Log level is controlled by the `VMBRIDGE_LOG` environment variable.
///
/// Stdout is left alone: the CLI prints NDJSON events there.
///
/// # Examples
/// ```bash
/// VMBRIDGE_LOG=debug vmbridge watch ws://127.0.0.1:8181/ws
/// VMBRIDGE_LOG=vmbridge_client=trace vmbridge call getVM --uri ws://127.0.0.1:8181/ws
/// ```
pub fn init() -> Result<()> {
    let log_dir = get_log_directory();
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, "vmbridge.log");

    // Default to info for our crates, allow override via VMBRIDGE_LOG
    let env_filter = EnvFilter::try_from_env("VMBRIDGE_LOG")
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(file_appender)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(true)
                .with_line_number(true)
                .with_timer(fmt::time::ChronoLocal::new(
                    "%Y-%m-%d %H:%M:%S%.3f".to_string(),
                )),
        )
        .init();

    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("Flutter VM bridge starting");
    tracing::info!("Log directory: {}", log_dir.display());
    tracing::info!("═══════════════════════════════════════════════════════");

    Ok(())
}

/// Get the log directory path
fn get_log_directory() -> PathBuf {
    let base = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
    base.join("flutter-vm-bridge").join("logs")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_covers_workspace_crates() {
        for target in [
            "vmbridge=",
            "flutter_vm_bridge=",
            "vmbridge_core=",
            "vmbridge_client=",
            "vmbridge_app=",
        ] {
            assert!(
                DEFAULT_FILTER.split(',').any(|d| d.starts_with(target)),
                "missing {target}"
            );
        }
        assert!(EnvFilter::try_new(DEFAULT_FILTER).is_ok());
    }
}

//! Flutter VM bridge - supervised Dart VM Service connection
//!
//! This is the binary entry point. All logic lives in the library crates.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args as ClapArgs, Parser, Subcommand};
use serde_json::Value;

use vmbridge_app::config::{init_config_dir, load_settings, load_settings_file};
use vmbridge_app::Settings;
use vmbridge_core::prelude::*;
use vmbridge_core::Endpoint;

/// Flutter VM bridge - talk to a running Flutter app's VM Service
#[derive(Parser, Debug)]
#[command(name = "vmbridge")]
#[command(about = "Supervised Dart VM Service connection for Flutter apps", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Project directory holding `.vmbridge/config.toml`
    #[arg(long, global = true, value_name = "DIR")]
    project: Option<PathBuf>,

    /// Explicit config file (errors instead of falling back to defaults)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Per-request timeout in milliseconds
    #[arg(long, global = true, value_name = "MS")]
    request_timeout_ms: Option<u64>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Supervise the app and print NDJSON events until Ctrl+C
    Watch(WatchArgs),

    /// Issue one raw VM Service RPC and print the result
    Call {
        /// VM Service URI, e.g. ws://127.0.0.1:8181/abc=/ws
        uri: String,

        /// RPC method, e.g. getVM
        method: String,

        /// JSON object of params
        #[arg(long)]
        params: Option<String>,
    },

    /// Call a Flutter service extension on the main isolate
    Ext {
        /// VM Service URI
        uri: String,

        /// Extension method, e.g. ext.flutter.debugPaint
        method: String,

        /// Arguments as key=value
        #[arg(value_name = "KEY=VALUE")]
        args: Vec<String>,
    },

    /// Write a default `.vmbridge/config.toml` into the project directory
    Init,
}

#[derive(ClapArgs, Debug)]
struct WatchArgs {
    /// VM Service URI
    uri: String,

    /// Stream to subscribe (repeatable; replaces the configured list)
    #[arg(long = "stream", value_name = "STREAM")]
    streams: Vec<String>,

    /// Memory poll interval in milliseconds
    #[arg(long, value_name = "MS")]
    poll_interval_ms: Option<u64>,

    /// Reconnect attempts per outage
    #[arg(long, value_name = "N")]
    max_attempts: Option<u32>,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    // Logging goes to a file; a failure here must not stop the CLI.
    if let Err(e) = vmbridge_core::logging::init() {
        eprintln!("Warning: logging disabled: {e}");
    }

    if let Command::Init = cli.command {
        let path = init_config_dir(&project_dir(&cli))?;
        println!("{}", path.display());
        return Ok(());
    }

    let mut settings = resolve_settings(&cli)?;
    if let Some(ms) = cli.request_timeout_ms {
        settings.connection.request_timeout_ms = ms;
    }

    match cli.command {
        Command::Watch(args) => {
            apply_watch_overrides(&mut settings, &args);
            let endpoint = Endpoint::from_uri(&args.uri)?;
            flutter_vm_bridge::run_watch(endpoint, &settings).await?;
        }
        Command::Call {
            uri,
            method,
            params,
        } => {
            let endpoint = Endpoint::from_uri(&uri)?;
            let params = params
                .as_deref()
                .map(|p| serde_json::from_str::<Value>(p))
                .transpose()
                .map_err(Error::from)?;
            let result = flutter_vm_bridge::run_call(
                endpoint,
                settings.connection.client_options(),
                &method,
                params,
            )
            .await?;
            print_json(&result)?;
        }
        Command::Ext { uri, method, args } => {
            let endpoint = Endpoint::from_uri(&uri)?;
            let result = flutter_vm_bridge::run_extension(
                endpoint,
                settings.connection.client_options(),
                &method,
                &args,
            )
            .await?;
            print_json(&result)?;
        }
        // Handled before settings are loaded.
        Command::Init => {}
    }

    Ok(())
}

fn resolve_settings(cli: &Cli) -> Result<Settings> {
    if let Some(path) = &cli.config {
        return load_settings_file(path);
    }
    Ok(load_settings(&project_dir(cli)))
}

fn project_dir(cli: &Cli) -> PathBuf {
    cli.project
        .clone()
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
}

fn apply_watch_overrides(settings: &mut Settings, args: &WatchArgs) {
    if !args.streams.is_empty() {
        settings.monitor.streams = args.streams.clone();
    }
    if let Some(ms) = args.poll_interval_ms {
        settings.monitor.poll_interval_ms = ms;
    }
    if let Some(n) = args.max_attempts {
        settings.reconnect.max_attempts = n;
    }
    debug!(
        "Watch settings: poll every {:?}, streams {:?}, {} reconnect attempts, request timeout {:?}",
        settings.monitor.poll_interval(),
        settings.monitor.streams,
        settings.reconnect.max_attempts,
        Duration::from_millis(settings.connection.request_timeout_ms)
    );
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

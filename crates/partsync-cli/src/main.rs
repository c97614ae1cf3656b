//! `partsync-cli` – partsync Command Line Interface
//!
//! Drives a fleet of parts from the terminal.  It:
//!
//! 1. Loads `~/.partsync/config.toml`, writing a starter config with one
//!    simulated machine when the file is absent.
//! 2. Reconciles the configured parts against the connection registry and
//!    starts machine-status polling and resource-name tracking.
//! 3. Drops the user into an **interactive shell** with slash-commands
//!    (`/status`, `/connect`, `/poll`, `/toggle`, `/help`, …).
//! 4. Intercepts **Ctrl-C** and tears down every connection before exiting.

mod config;
mod repl;
mod telemetry;

use colored::Colorize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info, warn};

fn main() {
    // Before the runtime exists; see `telemetry::build_provider`.
    let telemetry = telemetry::init_tracing("partsync");
    if telemetry.is_exporting() {
        info!("exporting spans over OTLP");
    }

    print_banner();

    // ── Shared shutdown flag ──────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – disconnecting parts …".yellow().bold());
        shutdown_clone.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; graceful shutdown on Ctrl-C will not be available");
    }

    // ── Configuration ─────────────────────────────────────────────────────
    let cfg = match config::load() {
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Ok(None) => write_starter_config(),
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            config::Config::default()
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to start async runtime");
            return;
        }
    };

    let shell = {
        let _guard = runtime.enter();
        match repl::Shell::start(cfg) {
            Ok(shell) => shell,
            Err(e) => {
                error!(error = %e, "failed to start fleet context");
                return;
            }
        }
    };

    println!();
    println!("  Connecting configured parts …");
    if let Err(e) = runtime.block_on(shell.sync()) {
        println!("{}: {}", "Reconcile error".red(), e);
    }

    println!();
    println!("  Type {} for a list of commands.\n", "/help".bold().cyan());

    // ── Interactive shell ─────────────────────────────────────────────────
    repl::run(&runtime, shell, shutdown);
}

fn write_starter_config() -> config::Config {
    let cfg = config::Config::starter();
    match config::save(&cfg) {
        Ok(()) => println!(
            "  {} Starter config written to {}",
            "✓".green().bold(),
            config::config_path().display().to_string().bold()
        ),
        Err(e) => println!("{}: {}", "Error saving config".red(), e),
    }
    cfg
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"                 __                         "#.bold().cyan());
    println!("{}", r#"    ____  ____ _/ /_ ___ __  ______  _____ "#.bold().cyan());
    println!("{}", r#"   / __ \/ __ `/ __/(_-</ / / / __ \/ ___/ "#.bold().cyan());
    println!("{}", r#"  / /_/ / /_/ / /_ /___/ /_/ / / / / /__   "#.bold().cyan());
    println!("{}", r#" / .___/\__,_/\__/     \__, /_/ /_/\___/   "#.bold().cyan());
    println!("{}", r#"/_/                   /____/               "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "partsync".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Fleet connection and query manager");
    println!();
}

//! REPL – the `partsync` interactive shell.
//!
//! Supported slash-commands:
//!   /help                      – show this list
//!   /status                    – connection state, config revision and resources per part
//!   /connect <part> <host>     – add (or re-point) a part and reconcile
//!   /remove <part>             – drop a part and reconcile
//!   /reload                    – re-read `~/.partsync/config.toml` and reconcile
//!   /poll <ms|off>             – change the machine-status polling interval
//!   /logging on|off            – query logging
//!   /verbose on|off            – verbose query logging
//!   /toggle <query-kind> on|off – enable or disable a query family
//!   /quit | /exit              – disconnect everything and exit

use colored::Colorize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use partsync_connect::SimConnector;
use partsync_query::{
    FleetContext, Interval, LoggingToggles, MachineStatusProvider, QueryKind, ResourceNamesProvider,
};
use partsync_types::{ConnectionConfig, ConnectionState, PartId, PartSyncError};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tokio::runtime::Runtime;
use tracing::{info, warn};

use crate::config::{self, Config, parse_flag};

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Help,
    Status,
    Connect { part: String, host: String },
    Remove { part: String },
    Reload,
    Poll(Interval),
    Logging(bool),
    Verbose(bool),
    Toggle { kind: QueryKind, on: bool },
    Quit,
}

/// Parse one input line.  `Ok(None)` for blank input, `Err` carries a usage
/// hint.
pub fn parse_command(line: &str) -> Result<Option<Command>, String> {
    let mut words = line.split_whitespace();
    let Some(head) = words.next() else {
        return Ok(None);
    };
    let args: Vec<&str> = words.collect();

    let command = match (head, args.as_slice()) {
        ("/help", []) => Command::Help,
        ("/status", []) => Command::Status,
        ("/connect", [part, host]) => Command::Connect {
            part: part.to_string(),
            host: host.to_string(),
        },
        ("/connect", _) => return Err("usage: /connect <part> <host>".to_string()),
        ("/remove", [part]) => Command::Remove { part: part.to_string() },
        ("/remove", _) => return Err("usage: /remove <part>".to_string()),
        ("/reload", []) => Command::Reload,
        ("/poll", ["off"]) => Command::Poll(Interval::Disabled),
        ("/poll", [ms]) => match ms.parse::<u64>() {
            Ok(ms) => Command::Poll(Interval::from_millis(ms)),
            Err(_) => return Err("usage: /poll <ms|off>".to_string()),
        },
        ("/poll", _) => return Err("usage: /poll <ms|off>".to_string()),
        ("/logging", [flag]) => Command::Logging(switch(flag, "/logging on|off")?),
        ("/logging", _) => return Err("usage: /logging on|off".to_string()),
        ("/verbose", [flag]) => Command::Verbose(switch(flag, "/verbose on|off")?),
        ("/verbose", _) => return Err("usage: /verbose on|off".to_string()),
        ("/toggle", [kind, flag]) => {
            let kind = QueryKind::parse(kind).ok_or_else(|| {
                let kinds: Vec<&str> = QueryKind::ALL.iter().map(|k| k.as_str()).collect();
                format!("unknown query kind '{kind}', expected one of: {}", kinds.join(", "))
            })?;
            Command::Toggle {
                kind,
                on: switch(flag, "/toggle <query-kind> on|off")?,
            }
        }
        ("/toggle", _) => return Err("usage: /toggle <query-kind> on|off".to_string()),
        ("/quit" | "/exit", []) => Command::Quit,
        (other, _) => return Err(format!("unknown command '{other}'")),
    };
    Ok(Some(command))
}

fn switch(flag: &str, usage: &str) -> Result<bool, String> {
    parse_flag(flag).ok_or_else(|| format!("usage: {usage}"))
}

// ─────────────────────────────────────────────────────────────────────────────
// Shell
// ─────────────────────────────────────────────────────────────────────────────

/// Everything the shell commands operate on.
pub struct Shell {
    cfg: Config,
    connector: SimConnector,
    ctx: FleetContext,
    logging: Arc<LoggingToggles>,
    statuses: MachineStatusProvider,
    names: ResourceNamesProvider,
}

impl Shell {
    /// Build the fleet context and providers.  Must run inside the runtime.
    pub fn start(cfg: Config) -> Result<Self, PartSyncError> {
        let connector = SimConnector::new();
        cfg.apply_simulation(&connector);
        let logging = Arc::new(LoggingToggles::new(cfg.query_logging, cfg.verbose_query_logging));
        let ctx = FleetContext::with_connector(Arc::new(connector.clone()), Arc::clone(&logging));
        let statuses = MachineStatusProvider::spawn(&ctx, cfg.poll_interval())?;
        let names = ResourceNamesProvider::spawn(&ctx, statuses.subscribe())?;
        Ok(Self {
            cfg,
            connector,
            ctx,
            logging,
            statuses,
            names,
        })
    }

    /// Reconcile the registry against the configured parts.
    pub async fn sync(&self) -> Result<(), PartSyncError> {
        let diff = self.ctx.registry()?.reconcile(self.cfg.desired_parts()).await;
        info!(
            added = diff.added.len(),
            removed = diff.removed.len(),
            unchanged = diff.unchanged.len(),
            "parts reconciled"
        );
        for part in &diff.added {
            let state = self.ctx.connection_status(part)?;
            let label = match state {
                ConnectionState::Connected => "connected".green(),
                other => other.to_string().yellow(),
            };
            println!("  {} {}", part.as_str().bold(), label);
        }
        for part in &diff.removed {
            println!("  {} {}", part.as_str().bold(), "removed".dimmed());
        }
        Ok(())
    }

    /// Run one command.  Returns `false` when the shell should exit.
    pub async fn execute(&mut self, command: Command) -> Result<bool, PartSyncError> {
        match command {
            Command::Help => print_help(),
            Command::Status => self.print_status()?,
            Command::Connect { part, host } => {
                self.cfg.parts.insert(part, ConnectionConfig::new(host));
                self.persist();
                self.sync().await?;
            }
            Command::Remove { part } => {
                if self.cfg.parts.remove(&part).is_none() {
                    println!("{} '{}'", "Unknown part:".red(), part.yellow());
                    return Ok(true);
                }
                self.persist();
                self.sync().await?;
            }
            Command::Reload => match config::load() {
                Ok(Some(cfg)) => self.reload(cfg).await?,
                Ok(None) => println!("  {}", "No config file; keeping current settings.".yellow()),
                Err(e) => println!("{}: {}", "Config error".red(), e),
            },
            Command::Poll(interval) => {
                self.statuses.set_interval(interval);
                self.cfg.poll_interval_ms = interval
                    .period()
                    .map_or(0, |p| u64::try_from(p.as_millis()).unwrap_or(u64::MAX));
                self.persist();
                println!("  polling: {}", describe_interval(interval).bold());
            }
            Command::Logging(on) => {
                let message = if on {
                    self.logging.enable_query_logging()
                } else {
                    self.logging.disable_query_logging()
                };
                self.cfg.query_logging = on;
                self.persist();
                println!("  {message}");
            }
            Command::Verbose(on) => {
                let message = if on {
                    self.logging.enable_verbose_logging()
                } else {
                    self.logging.disable_verbose_logging()
                };
                self.cfg.verbose_query_logging = on;
                self.persist();
                println!("  {message}");
            }
            Command::Toggle { kind, on } => {
                self.ctx.enabled().set(kind, on);
                let state = if on { "enabled".green() } else { "disabled".yellow() };
                println!("  {} {}", kind.as_str().bold(), state);
            }
            Command::Quit => return Ok(false),
        }
        Ok(true)
    }

    async fn reload(&mut self, cfg: Config) -> Result<(), PartSyncError> {
        cfg.apply_simulation(&self.connector);
        self.statuses.set_interval(cfg.poll_interval());
        if cfg.query_logging {
            self.logging.enable_query_logging();
        } else {
            self.logging.disable_query_logging();
        }
        if cfg.verbose_query_logging {
            self.logging.enable_verbose_logging();
        } else {
            self.logging.disable_verbose_logging();
        }
        self.cfg = cfg;
        println!("  {}", "Config reloaded.".green());
        self.sync().await
    }

    fn persist(&self) {
        if let Err(e) = config::save(&self.cfg) {
            warn!(error = %e, "failed to save config");
            println!("{}: {}", "Error saving config".red(), e);
        }
    }

    fn print_status(&self) -> Result<(), PartSyncError> {
        let registry = self.ctx.registry()?;
        let states = registry.connection_status();
        if states.is_empty() {
            println!("  {}", "No parts configured.".dimmed());
            return Ok(());
        }

        let mut parts: Vec<&PartId> = states.keys().collect();
        parts.sort();
        println!("{}", "Parts".bold().underline());
        for part in parts {
            let state = states.get(part).copied().unwrap_or_default();
            let state_label = match state {
                ConnectionState::Connected => "connected".green(),
                ConnectionState::Connecting => "connecting".yellow(),
                ConnectionState::Disconnecting => "disconnecting".yellow(),
                ConnectionState::Disconnected => "disconnected".red(),
            };
            let revision = self
                .statuses
                .status(part)
                .map(|s| s.config_revision)
                .unwrap_or_else(|| "-".to_string());
            println!("  {:<16} {:<14} revision {}", part.as_str().bold(), state_label, revision);
            for name in self.names.names(part, None) {
                println!(
                    "    {:<10} {:<18} {}",
                    name.kind.dimmed(),
                    name.subtype,
                    name.name.bold()
                );
            }
            if let Some(error) = self.statuses.state(part).and_then(|s| s.error) {
                println!("    {} {}", "last error:".red(), error);
            }
        }
        println!("  polling: {}", describe_interval(self.statuses.interval()).bold());
        Ok(())
    }

    /// Disconnect every part.
    pub async fn shutdown(&self) {
        if let Ok(registry) = self.ctx.registry() {
            registry.shutdown().await;
        }
    }
}

fn describe_interval(interval: Interval) -> String {
    match interval.period() {
        Some(period) => format!("every {} ms", period.as_millis()),
        None => "off".to_string(),
    }
}

fn print_help() {
    println!();
    println!("{}", "partsync Commands".bold().underline());
    println!("  {}                   – parts, states, revisions and resources", "/status".bold().cyan());
    println!("  {}   – add or re-point a part", "/connect <part> <host>".bold().cyan());
    println!("  {}           – drop a part", "/remove <part>".bold().cyan());
    println!("  {}                   – re-read the config file", "/reload".bold().cyan());
    println!("  {}            – machine-status polling interval", "/poll <ms|off>".bold().cyan());
    println!("  {}           – query logging", "/logging on|off".bold().cyan());
    println!("  {}           – verbose query logging", "/verbose on|off".bold().cyan());
    println!("  {} – switch a query family", "/toggle <kind> on|off".bold().cyan());
    let kinds: Vec<&str> = QueryKind::ALL.iter().map(|k| k.as_str()).collect();
    println!("      kinds: {}", kinds.join(", ").dimmed());
    println!("  {}             – disconnect and exit", "/quit  /exit".bold().cyan());
    println!();
}

// ─────────────────────────────────────────────────────────────────────────────
// Loop
// ─────────────────────────────────────────────────────────────────────────────

/// Read commands until `/quit`, EOF or `shutdown` is set, then tear down.
pub fn run(runtime: &Runtime, mut shell: Shell, shutdown: Arc<AtomicBool>) {
    let mut editor = match DefaultEditor::new() {
        Ok(editor) => Some(editor),
        Err(e) => {
            warn!(error = %e, "line editor unavailable; falling back to plain stdin");
            None
        }
    };

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        let line = match read_line(editor.as_mut()) {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                eprintln!("{}: {}", "Read error".red(), e);
                break;
            }
        };
        if let Some(editor) = editor.as_mut() {
            if !line.trim().is_empty() {
                let _ = editor.add_history_entry(line.as_str());
            }
        }

        let command = match parse_command(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(hint) => {
                println!("{} Type {} for available commands.", hint.red(), "/help".bold());
                continue;
            }
        };
        match runtime.block_on(shell.execute(command)) {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => println!("{}: {}", "Error".red(), e),
        }
    }

    println!("{}", "Disconnecting parts …".dimmed());
    runtime.block_on(shell.shutdown());
    println!("{}", "Goodbye.".green());
}

/// `Ok(None)` on EOF or interrupt.
fn read_line(editor: Option<&mut DefaultEditor>) -> Result<Option<String>, String> {
    let prompt = format!("{} ", "partsync>".bold().cyan());
    match editor {
        Some(editor) => match editor.readline(&prompt) {
            Ok(line) => Ok(Some(line)),
            Err(ReadlineError::Eof | ReadlineError::Interrupted) => Ok(None),
            Err(e) => Err(e.to_string()),
        },
        None => {
            use std::io::{BufRead, Write};
            print!("{prompt}");
            std::io::stdout().flush().ok();
            let mut line = String::new();
            match std::io::stdin().lock().read_line(&mut line) {
                Ok(0) => Ok(None),
                Ok(_) => Ok(Some(line)),
                Err(e) => Err(e.to_string()),
            }
        }
    }
}

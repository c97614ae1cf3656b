//! Request/response logging for queries and mutations.
//!
//! Off by default.  When enabled, every query call emits one line per phase:
//!
//! ```text
//! {index}\t{timestamp}\t{REQ|RES|ERR} \t{resource name}\t{method}
//! ```
//!
//! With verbose logging on, entries that carry data append `\n\t` followed by
//! the pretty-printed JSON payload.  Lines go to `tracing` at `info` level
//! under the `partsync::query` target.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use tracing::info;

const FORMAT: &str = "index timestamp type name method";

/// Phase of a logged call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    Req,
    Res,
    Err,
}

impl fmt::Display for LogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Req => "REQ",
            Self::Res => "RES",
            Self::Err => "ERR",
        })
    }
}

/// The two logging switches.  The host decides where they are persisted.
#[derive(Debug, Default)]
pub struct LoggingToggles {
    query: AtomicBool,
    verbose: AtomicBool,
}

impl LoggingToggles {
    pub fn new(query: bool, verbose: bool) -> Self {
        Self {
            query: AtomicBool::new(query),
            verbose: AtomicBool::new(verbose),
        }
    }

    pub fn enable_query_logging(&self) -> String {
        self.query.store(true, Ordering::SeqCst);
        format!("query logging enabled, format: \n\t{FORMAT}")
    }

    pub fn disable_query_logging(&self) -> String {
        self.query.store(false, Ordering::SeqCst);
        "query logging disabled".to_string()
    }

    pub fn enable_verbose_logging(&self) -> String {
        self.verbose.store(true, Ordering::SeqCst);
        format!("verbose query logging enabled, format: \n\t{FORMAT}\n\t\tdata")
    }

    pub fn disable_verbose_logging(&self) -> String {
        self.verbose.store(false, Ordering::SeqCst);
        "verbose query logging disabled".to_string()
    }

    pub fn query_logging(&self) -> bool {
        self.query.load(Ordering::SeqCst)
    }

    pub fn verbose_logging(&self) -> bool {
        self.verbose.load(Ordering::SeqCst)
    }
}

/// Hands out [`RequestLogger`]s with increasing indices.
#[derive(Debug, Clone)]
pub struct QueryLogger {
    toggles: Arc<LoggingToggles>,
    next_index: Arc<AtomicUsize>,
}

impl QueryLogger {
    pub fn new(toggles: Arc<LoggingToggles>) -> Self {
        Self {
            toggles,
            next_index: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn toggles(&self) -> &Arc<LoggingToggles> {
        &self.toggles
    }

    /// A logger for one call.  All of its entries share one index.
    pub fn create_logger(&self) -> RequestLogger {
        RequestLogger {
            index: self.next_index.fetch_add(1, Ordering::SeqCst),
            toggles: Arc::clone(&self.toggles),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RequestLogger {
    index: usize,
    toggles: Arc<LoggingToggles>,
}

impl RequestLogger {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Emit one entry.  Returns the emitted line, or `None` while query
    /// logging is disabled.
    pub fn log(&self, kind: LogKind, name: Option<&str>, method: &str, data: Option<&Value>) -> Option<String> {
        if !self.toggles.query_logging() {
            return None;
        }
        let data = data.filter(|_| self.toggles.verbose_logging());
        let line = format_entry(self.index, kind, name, method, data);
        info!(target: "partsync::query", "{line}");
        Some(line)
    }
}

fn format_entry(index: usize, kind: LogKind, name: Option<&str>, method: &str, data: Option<&Value>) -> String {
    let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    let mut line = format!("{index}\t{timestamp}\t{kind} \t{}\t{method}", name.unwrap_or("unknown"));
    if let Some(data) = data {
        let pretty = serde_json::to_string_pretty(data).unwrap_or_else(|_| data.to_string());
        line.push_str("\n\t");
        line.push_str(&pretty);
    }
    line
}

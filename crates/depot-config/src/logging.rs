//! Structured logging utilities for depot components.
//!
//! Provides consistent logging with component prefixes and structured fields.
//!
//! # Usage
//!
//! ```ignore
//! use depot_config::log_gc_info;
//!
//! log_gc_info!(deleted = 12, "sweep finished");
//! log_checkout_debug!(path = %resolved.display(), "created checkout directory");
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Component identifiers stamped on every event by the `log_*` macros
pub struct Component;

impl Component {
    pub const STORE: &'static str = "STORE";
    pub const CHECKOUT: &'static str = "CHECKOUT";
    pub const GC: &'static str = "GC";
    pub const SERVER: &'static str = "SERVER";
}

/// Log levels for runtime configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(format!("unknown log level: {other}")),
        }
    }
}

// === STORE logging macros ===

#[macro_export]
macro_rules! log_store_warn {
    ($($arg:tt)+) => {
        tracing::warn!(component = $crate::logging::Component::STORE, $($arg)+)
    };
}

#[macro_export]
macro_rules! log_store_info {
    ($($arg:tt)+) => {
        tracing::info!(component = $crate::logging::Component::STORE, $($arg)+)
    };
}

#[macro_export]
macro_rules! log_store_debug {
    ($($arg:tt)+) => {
        tracing::debug!(component = $crate::logging::Component::STORE, $($arg)+)
    };
}

// === CHECKOUT logging macros ===

#[macro_export]
macro_rules! log_checkout_error {
    ($($arg:tt)+) => {
        tracing::error!(component = $crate::logging::Component::CHECKOUT, $($arg)+)
    };
}

#[macro_export]
macro_rules! log_checkout_warn {
    ($($arg:tt)+) => {
        tracing::warn!(component = $crate::logging::Component::CHECKOUT, $($arg)+)
    };
}

#[macro_export]
macro_rules! log_checkout_info {
    ($($arg:tt)+) => {
        tracing::info!(component = $crate::logging::Component::CHECKOUT, $($arg)+)
    };
}

#[macro_export]
macro_rules! log_checkout_debug {
    ($($arg:tt)+) => {
        tracing::debug!(component = $crate::logging::Component::CHECKOUT, $($arg)+)
    };
}

// === GC logging macros ===

#[macro_export]
macro_rules! log_gc_warn {
    ($($arg:tt)+) => {
        tracing::warn!(component = $crate::logging::Component::GC, $($arg)+)
    };
}

#[macro_export]
macro_rules! log_gc_info {
    ($($arg:tt)+) => {
        tracing::info!(component = $crate::logging::Component::GC, $($arg)+)
    };
}

#[macro_export]
macro_rules! log_gc_debug {
    ($($arg:tt)+) => {
        tracing::debug!(component = $crate::logging::Component::GC, $($arg)+)
    };
}

// === SERVER logging macros ===

#[macro_export]
macro_rules! log_server_warn {
    ($($arg:tt)+) => {
        tracing::warn!(component = $crate::logging::Component::SERVER, $($arg)+)
    };
}

#[macro_export]
macro_rules! log_server_info {
    ($($arg:tt)+) => {
        tracing::info!(component = $crate::logging::Component::SERVER, $($arg)+)
    };
}

#[macro_export]
macro_rules! log_server_debug {
    ($($arg:tt)+) => {
        tracing::debug!(component = $crate::logging::Component::SERVER, $($arg)+)
    };
}

/// Initialize logging with the given level filter.
/// Call this once at application startup; `RUST_LOG` takes precedence.
pub fn init_logging(level: LogLevel) {
    use tracing_subscriber::EnvFilter;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}

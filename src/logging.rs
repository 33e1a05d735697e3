//! Console tracing for the relay binary.

use std::fmt;

use anyhow::{Result, anyhow};
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt as tracing_fmt};

/// Installs the global subscriber. `RUST_LOG` takes precedence over `level`.
pub fn init_tracing(level: LogLevel) -> Result<()> {
    let filter = console_filter(level);
    let console_layer = tracing_fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_filter(filter);

    tracing_subscriber::registry()
        .with(console_layer)
        .try_init()
        .map_err(|err| anyhow!("installing tracing subscriber: {err}"))?;

    tracing::debug!(level = %level, "tracing initialized");
    Ok(())
}

fn console_filter(level: LogLevel) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.directive()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LogLevel {
    /// Only error messages
    Error,
    /// Warning and error messages
    Warn,
    /// Request outcomes, backend fallbacks and stream completion
    #[default]
    Info,
    /// Per-attempt and per-strategy diagnostics
    Debug,
    /// Everything, including dependency internals
    Trace,
}

impl LogLevel {
    pub fn as_tracing_level(self) -> Level {
        match self {
            Self::Error => Level::ERROR,
            Self::Warn => Level::WARN,
            Self::Info => Level::INFO,
            Self::Debug => Level::DEBUG,
            Self::Trace => Level::TRACE,
        }
    }

    /// Our own crate at `self`, noisy dependencies one step quieter.
    fn directive(self) -> String {
        let ours = self.as_tracing_level().to_string().to_lowercase();
        match self {
            Self::Trace => ours,
            _ => format!("warn,mediarelay={ours},backend={ours},tower_http={ours}"),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        })
    }
}

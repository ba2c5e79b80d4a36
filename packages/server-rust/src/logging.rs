//! Process-wide `tracing` subscriber setup.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Log line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LogFormat {
    /// Human-readable, one event per line.
    #[default]
    Pretty,
    /// One JSON object per event, span fields included.
    Json,
}

/// Builds the filter: `RUST_LOG` if set, otherwise `default_directive`.
fn env_filter(default_directive: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive))
}

/// Installs the global subscriber.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init_tracing(format: LogFormat, default_directive: &str) -> anyhow::Result<()> {
    let filter = env_filter(default_directive);
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Pretty => registry.with(fmt::layer().with_target(true)).try_init()?,
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(true).with_span_list(false))
            .try_init()?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_fails_instead_of_panicking() {
        // Either this call installs the subscriber or another test already did;
        // the follow-up call must report an error in both cases.
        let _ = init_tracing(LogFormat::Json, "info");
        assert!(init_tracing(LogFormat::Pretty, "info").is_err());
    }

    #[test]
    fn default_format_is_pretty() {
        assert_eq!(LogFormat::default(), LogFormat::Pretty);
    }
}

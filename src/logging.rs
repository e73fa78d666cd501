// Diagnostic logging setup using `tracing` + `tracing-subscriber`.
//
// Priority for determining the log level:
// 1. `--debug` flag count (if provided)
// 2. `TESTBED_LOG` environment variable (e.g. "info", "debug")
// 3. default to `warn`

use anyhow::Result;
use tracing_subscriber::fmt;

/// Environment variable with the log level
pub const LOG_ENV: &str = "TESTBED_LOG";

/// Initialise global logging subscriber, writing to stderr.
///
/// Call once at startup.
pub fn init_logging(debug: u8) -> Result<()> {
    let level = match debug {
        0 => std::env::var(LOG_ENV)
            .ok()
            .and_then(|s| parse_level_str(&s))
            .unwrap_or(tracing::Level::WARN),
        level => level_from_debug(level),
    };

    fmt()
        .with_max_level(level)
        .with_target(debug > 1)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialise logging: {}", e))?;

    Ok(())
}

fn level_from_debug(debug: u8) -> tracing::Level {
    match debug {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    }
}

fn parse_level_str(s: &str) -> Option<tracing::Level> {
    match s.trim().to_lowercase().as_str() {
        "error" => Some(tracing::Level::ERROR),
        "warn" | "warning" => Some(tracing::Level::WARN),
        "info" => Some(tracing::Level::INFO),
        "debug" => Some(tracing::Level::DEBUG),
        "trace" => Some(tracing::Level::TRACE),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_selection() {
        assert_eq!(level_from_debug(1), tracing::Level::INFO);
        assert_eq!(level_from_debug(7), tracing::Level::TRACE);
        assert_eq!(parse_level_str(" Debug "), Some(tracing::Level::DEBUG));
        assert_eq!(parse_level_str("loud"), None);
    }
}

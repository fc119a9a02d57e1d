// src/infra/logger.rs — Structured logging with tracing

use tracing_subscriber::{fmt, EnvFilter};

/// HTTP client and connection internals stay quiet unless asked for.
const QUIET_CRATES: &[&str] = &["hyper", "hyper_util", "reqwest", "rustls", "h2"];

/// Directives used when `RUST_LOG` is unset: the configured level for
/// chathub and its request traces, `warn` for transport crates.
pub fn default_directives(level: &str) -> String {
    let level = match level.trim() {
        "" => "info",
        l => l,
    };
    let mut directives = vec![level.to_string()];
    directives.extend(QUIET_CRATES.iter().map(|c| format!("{c}=warn")));
    directives.join(",")
}

/// Install the global subscriber on stderr so `chathub models --json`
/// keeps stdout machine-readable. `RUST_LOG` wins over `level`.
pub fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(level)));

    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directives_keep_level_first() {
        let d = default_directives("debug");
        assert!(d.starts_with("debug,"));
        assert!(d.contains("hyper=warn"));
        assert!(d.contains("reqwest=warn"));
    }

    #[test]
    fn test_blank_level_falls_back_to_info() {
        assert!(default_directives("  ").starts_with("info,"));
    }

    #[test]
    fn test_directives_parse() {
        assert!(EnvFilter::try_new(default_directives("trace")).is_ok());
    }
}

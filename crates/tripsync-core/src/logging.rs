//! Tracing subscriber setup for hosts embedding the engine

use tracing_subscriber::EnvFilter;

/// Directive used when `RUST_LOG` is unset or unparsable
pub const DEFAULT_DIRECTIVE: &str = "tripsync_core=info";

/// Install a formatted subscriber filtered by `RUST_LOG`.
///
/// Returns false if a global subscriber was already installed.
pub fn init_logging() -> bool {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter(rust_log.as_deref()))
        .try_init()
        .is_ok()
}

/// `RUST_LOG` wins as given; only its absence falls back to the default
fn env_filter(rust_log: Option<&str>) -> EnvFilter {
    rust_log
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_DIRECTIVE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_init_is_idempotent() {
        init_logging();
        assert!(!init_logging());
    }

    #[test]
    fn test_rust_log_is_not_overridden() {
        assert_eq!(
            env_filter(Some("tripsync_core=trace")).to_string(),
            "tripsync_core=trace"
        );
        assert_eq!(env_filter(None).to_string(), DEFAULT_DIRECTIVE);
    }
}

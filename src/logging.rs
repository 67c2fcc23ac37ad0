//! Tracing subscriber setup.
//!
//! `RUST_LOG` wins over the configured level when it is set.

use tracing::Subscriber;
use tracing_subscriber::EnvFilter;

/// Subscriber writing `pretty` or `json` lines to stdout.
pub fn subscriber(level: &str, format: &str) -> Box<dyn Subscriber + Send + Sync> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    if format.eq_ignore_ascii_case("json") {
        Box::new(builder.json().finish())
    } else {
        Box::new(builder.finish())
    }
}

/// Install the global subscriber.
///
/// Returns `false` when a subscriber was already installed, so binaries may
/// call this more than once.
pub fn init(level: &str, format: &str) -> bool {
    tracing::subscriber::set_global_default(subscriber(level, format)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_both_formats_build() {
        for format in ["pretty", "json", "JSON"] {
            tracing::subscriber::with_default(subscriber("info", format), || {
                tracing::info!(format, "Subscriber built");
            });
        }
    }
}

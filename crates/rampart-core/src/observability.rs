//! tracing subscriber の初期化

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::LogSettings;

/// Install the global subscriber.
///
/// `RUST_LOG` overrides `settings.level`. Calling this twice (or after a test
/// harness installed its own subscriber) is a no-op; returns whether this call
/// installed the subscriber.
pub fn init_tracing(settings: &LogSettings) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);
    let installed = if settings.json {
        registry
            .with(fmt::layer().json().with_target(true).with_current_span(true))
            .try_init()
            .is_ok()
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .try_init()
            .is_ok()
    };

    if installed {
        tracing::debug!(level = %settings.level, json = settings.json, "tracing initialized");
    }
    installed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_harmless() {
        let settings = LogSettings::default();
        init_tracing(&settings);
        assert!(!init_tracing(&settings));
    }
}

use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Installs a global fmt subscriber. Embedders that already own one get the
/// error back instead of a panic.
pub fn init_tracing(filter: &str) -> Result<(), TryInitError> {
    let env_filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);
    Registry::default()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_install_is_reported_not_fatal() {
        // Whether this call installs depends on test ordering; the second
        // one always finds a subscriber in place.
        let _ = init_tracing("casebook=debug");
        let second = init_tracing("not a [valid filter");
        assert!(second.is_err());
    }
}

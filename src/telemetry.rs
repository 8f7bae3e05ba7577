// Tracing setup
use once_cell::sync::OnceCell;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

static SUBSCRIBER: OnceCell<()> = OnceCell::new();

/// Installs the global subscriber: a fmt layer filtered by `RUST_LOG`, or by
/// `default_directive` when that is unset. Later calls are no-ops.
pub fn init_tracing(default_directive: &str) {
    SUBSCRIBER.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_directive));
        let _ = tracing_subscriber::registry()
            .with(fmt::layer().with_target(false))
            .with(filter)
            .try_init();
    });
}

#[cfg(test)]
pub(crate) fn init_test_tracing() {
    SUBSCRIBER.get_or_init(|| {
        let _ = tracing_subscriber::registry()
            .with(fmt::layer().with_test_writer())
            .with(EnvFilter::new("rs_softphone=debug"))
            .try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init_test_tracing();
        init_tracing("rs_softphone=info");
        init_tracing("rs_softphone=trace");
        assert!(SUBSCRIBER.get().is_some());
    }
}

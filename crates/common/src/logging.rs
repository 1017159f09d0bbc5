//! Logging setup and configuration

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Setup the tracing subscriber for the application.
///
/// `RUST_LOG` wins when set; otherwise `default_level` is used. Initialising
/// twice is harmless (the second call is a no-op), so libraries may call this
/// without coordinating with the embedding process.
pub fn setup_logging(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}

/// Map a `LIBUSB_PROXY_DEBUG` level (0..4) onto a filter directive.
pub fn debug_level_filter(level: u8) -> &'static str {
    match level {
        0 => "error",
        1 => "warn",
        2 => "info",
        _ => "debug",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_level_filter() {
        assert_eq!(debug_level_filter(0), "error");
        assert_eq!(debug_level_filter(1), "warn");
        assert_eq!(debug_level_filter(2), "info");
        assert_eq!(debug_level_filter(3), "debug");
        assert_eq!(debug_level_filter(4), "debug");
    }
}

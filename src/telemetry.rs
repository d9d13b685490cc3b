//! Tracing subscriber setup.

use std::sync::Once;

use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Install a global fmt subscriber.
///
/// `RUST_LOG` takes precedence; `verbosity` maps to warn/info/debug/trace
/// otherwise. Idempotent, so tests may call it freely.
pub fn init(verbosity: u8) {
    INIT.call_once(|| {
        let default_directive = match verbosity {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("folio={default_directive}")));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init();
    });
}

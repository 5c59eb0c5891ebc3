//! Tracing subscriber wiring for embedding processes.
//!
//! The core never installs a global subscriber on its own; a host process
//! calls [`init`] once at startup. Filtering honors `RUST_LOG` and falls
//! back to `info` for this crate.

use tracing_error::ErrorLayer;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the default subscriber stack: env-filtered fmt layer plus span
/// traces on error paths. Calling this twice panics (tracing refuses a
/// second global default); embedders that bring their own subscriber just
/// skip it.
pub fn init() {
    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_span_events(FmtSpan::CLOSE);

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("warn,weavemesh=info"))
        .expect("static filter directive parses");

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(ErrorLayer::default())
        .init();

    miette::set_panic_hook();
}

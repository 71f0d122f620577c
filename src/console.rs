//! Console diagnostics.
//!
//! Everything the init prints goes through `tracing` to the console as a
//! single colour-highlighted line. There is no persistence: the root is
//! read-only and `/var/log` is a tmpfs.

use crate::error::Error;
use crate::syscall::System;
use std::fmt::Display;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

/// Set up the console subscriber.
///
/// No timestamps: appliance boards often have no RTC and the clock reads
/// 1970 until something sets it.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(true)
        .without_time()
        .init();
}

/// Print a warning attributed to `origin` and carry on.
pub fn warning(origin: &str, message: impl Display) {
    warn!(origin = origin, "{}", message);
}

/// Print the fatal diagnostic and halt forever.
pub fn fatal<S: System + ?Sized>(sys: &S, err: &Error) -> ! {
    error!("{}", err);
    error!("Stopping...");
    sys.halt()
}

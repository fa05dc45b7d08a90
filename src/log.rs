//! Structured logging for forgeplan.
//!
//! Log levels:
//! - WARN: recoverable problems such as corrupt persisted state
//! - INFO: lifecycle events (phases, checkpoints, runs)
//! - DEBUG: individual mutations (task transitions, store writes)
//!
//! Debug mode can be enabled with the `--debug` flag or `FORGEPLAN_DEBUG=1`.
//! `RUST_LOG` overrides both.

use std::fs::File;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::Result;

/// File the subscriber writes to inside the state directory.
pub const LOG_FILE: &str = "forgeplan.log";

const DEBUG_ENV: &str = "FORGEPLAN_DEBUG";

static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

fn env_debug() -> bool {
    std::env::var(DEBUG_ENV)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Default directive for the filter when `RUST_LOG` is unset.
fn default_directive(debug: bool) -> &'static str {
    if debug {
        "forgeplan=debug"
    } else {
        "forgeplan=info"
    }
}

/// Install the global subscriber, writing to `<dir>/forgeplan.log`.
///
/// The file is truncated on startup. Installing twice is a no-op.
pub fn init(debug: bool, dir: &Path) -> Result<()> {
    let debug_enabled = debug || env_debug();
    DEBUG_ENABLED.store(debug_enabled, Ordering::SeqCst);

    std::fs::create_dir_all(dir)?;
    let file = File::create(dir.join(LOG_FILE))?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(debug_enabled)));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .with_target(false),
        )
        .try_init();
    Ok(())
}

/// Check if debug mode is enabled.
pub fn is_debug() -> bool {
    DEBUG_ENABLED.load(Ordering::Relaxed)
}

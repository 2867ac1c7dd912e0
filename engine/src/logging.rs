//! Engine-side logging
//!
//! Engine diagnostics go through the `log` facade with `env_logger` as the
//! backend. Plugin-facing messages (load warnings, the verbose descriptor
//! dump) are written to the plugin output stream instead, see
//! [`crate::output`].
//!
//! # Log Levels
//!
//! - `error!` - plugin activation failed, a runtime lock could not be taken
//! - `warn!` - ABI warnings, configuration fallbacks
//! - `info!` - plugin activation and shutdown
//! - `debug!` - per-block dispatch
//! - `trace!` - per-op dispatch and operand patching
//!
//! ```bash
//! RUST_LOG=info tpi replay icount --block 0x1000:4:16
//! RUST_LOG=tpi_engine::codegen=trace tpi replay icount --block 0x1000:4:16
//! tpi --log-level debug replay icount --block 0x1000:4:16
//! ```
//!
//! An explicit `--log-level` goes through [`init_with_level`] and ignores
//! `RUST_LOG`.

use env_logger::Builder;
use log::LevelFilter;
use std::io::Write;
use std::sync::Once;

static INIT: Once = Once::new();

/// Initialize logging with a specific level. Subsequent calls are no-ops.
pub fn init_with_level(level: LevelFilter) {
    INIT.call_once(|| {
        Builder::new()
            .filter_level(level)
            .format(|buf, record| {
                writeln!(
                    buf,
                    "[{:5}] {} - {}",
                    record.level(),
                    record.target(),
                    record.args()
                )
            })
            .init();
    });
}

/// Initialize logging from `RUST_LOG`, defaulting to Warn.
pub fn init_from_env() {
    INIT.call_once(|| {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    });
}

/// Initialize logging for tests. Safe to call from every test.
pub fn init_test() {
    let _ = env_logger::builder()
        .filter_level(LevelFilter::Warn)
        .is_test(true)
        .try_init();
}

//! VisualIA bridge entrypoint.
//!
//! Launches the speech engine, keeps it configured the way the overlay asks
//! and relays its output as JSON lines.
//!
//! # Architecture
//!
//! - Stdin reader: overlay commands (`{"cmd": ...}`)
//! - Engine readers: stdout chunks, stderr lines and exit status per instance
//! - Bridge loop: supervisor, reconciler and router on one thread
//! - Writer thread: overlay events (`{"event": ...}`) to stdout

use anyhow::{Context, Result};
use std::panic;
use visualia_bridge::config::AppConfig;
use visualia_bridge::{
    init_logging, init_tracing, log_debug, log_debug_content, log_file_path, log_panic,
    run_bridge,
};

fn install_panic_hook() {
    let previous = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        log_panic(info);
        let location = info
            .location()
            .map(|loc| format!("{}:{}", loc.file(), loc.line()))
            .unwrap_or_else(|| "unknown".to_string());
        log_debug(&format!("panic at {location}"));
        log_debug_content(&format!("panic: {info}"));
        previous(info);
    }));
}

fn main() -> Result<()> {
    let config = AppConfig::parse_args()?;
    init_logging(&config);
    init_tracing(&config);
    install_panic_hook();
    log_debug("=== VisualIA Bridge Started ===");
    log_debug(&format!("Log file: {:?}", log_file_path()));

    run_bridge(config).context("bridge terminated with an error")
}

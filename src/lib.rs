//! Supervises the VisualIA speech engine and bridges its output to the caption overlay.

mod app;
pub mod config;
pub mod engine;
pub mod ipc;
pub mod reconciler;
pub mod settings;
pub mod supervisor;
mod telemetry;

pub use app::{
    crash_log_path, init_logging, log_debug, log_debug_content, log_file_path, log_panic,
};
pub use ipc::run_bridge;
pub use telemetry::init_tracing;

//! Command-line parsing and validation helpers.

mod defaults;
mod validation;

use clap::{ArgAction, Parser};
use std::path::PathBuf;

pub use defaults::{
    DEFAULT_DEBOUNCE_MS, DEFAULT_ENGINE_CMD, DEFAULT_MODEL, DEFAULT_MODELS_DIR,
    DEFAULT_STOP_GRACE_MS, DEFAULT_TRANSLATION_MODEL, MAX_DEBOUNCE_MS, MAX_STOP_GRACE_MS,
    MIN_DEBOUNCE_MS, MIN_STOP_GRACE_MS,
};

/// CLI options for the VisualIA caption bridge. Validated values keep the engine launch safe.
#[derive(Debug, Parser, Clone)]
#[command(about = "VisualIA caption bridge", author, version)]
pub struct AppConfig {
    /// Engine binary (name or path), optionally followed by leading arguments
    #[arg(long = "engine-cmd", env = "VISUALIA_ENGINE", default_value = DEFAULT_ENGINE_CMD)]
    pub engine_cmd: String,

    /// Extra arguments appended to every engine launch (repeatable)
    #[arg(long = "engine-arg", action = ArgAction::Append, value_name = "ARG")]
    pub engine_args: Vec<String>,

    /// Directory holding whisper-<model>.gguf and translation models
    #[arg(long = "models-dir", env = "VISUALIA_MODELS_DIR", default_value = DEFAULT_MODELS_DIR)]
    pub models_dir: PathBuf,

    /// Whisper model id
    #[arg(long, default_value = DEFAULT_MODEL)]
    pub model: String,

    /// Source language code, or 'auto' to let the engine detect it
    #[arg(long, env = "VISUALIA_LANG", default_value = "auto")]
    pub lang: String,

    /// Enable translation into this language
    #[arg(long = "translate-to")]
    pub translate_to: Option<String>,

    /// Translation model id
    #[arg(long = "translation-model", default_value = DEFAULT_TRANSLATION_MODEL)]
    pub translation_model: String,

    /// Persisted preferences file; seeds the initial config and is updated on every change
    #[arg(long)]
    pub settings: Option<PathBuf>,

    /// Quiet period used to coalesce configuration changes (milliseconds)
    #[arg(long = "debounce-ms", default_value_t = DEFAULT_DEBOUNCE_MS)]
    pub debounce_ms: u64,

    /// Time the engine gets to exit after SIGTERM before SIGKILL (milliseconds)
    #[arg(long = "stop-grace-ms", default_value_t = DEFAULT_STOP_GRACE_MS)]
    pub stop_grace_ms: u64,

    /// Enable file logging (debug)
    #[arg(long = "logs", env = "VISUALIA_LOGS", default_value_t = false)]
    pub logs: bool,

    /// Disable all file logging (overrides --logs and log env vars)
    #[arg(long = "no-logs", env = "VISUALIA_NO_LOGS", default_value_t = false)]
    pub no_logs: bool,

    /// Allow logging transcript snippets and engine diagnostics (debug log only)
    #[arg(
        long = "log-content",
        env = "VISUALIA_LOG_CONTENT",
        default_value_t = false
    )]
    pub log_content: bool,

    /// Program resolved from --engine-cmd during validation
    #[arg(skip)]
    pub engine_program: String,

    /// Leading arguments split off --engine-cmd during validation
    #[arg(skip)]
    pub engine_leading_args: Vec<String>,
}

//! Engine configuration values and the argument vector derived from them.
//!
//! An [`EngineConfig`] is an immutable description of what the external engine
//! should run with. Any change produces a whole new value; the reconciler owns
//! the applied one and the supervisor turns it into process arguments.

mod args;
mod config;

pub use args::{engine_args, EngineLaunchSpec};
pub use config::{
    ConfigWarning, EngineConfig, LanguageTag, ModelId, SourceLanguage, TranslationConfig,
};

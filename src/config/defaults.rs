pub const DEFAULT_ENGINE_CMD: &str = "visualia";
pub const DEFAULT_MODELS_DIR: &str = "models";
pub const DEFAULT_MODEL: &str = "base";
pub const DEFAULT_TRANSLATION_MODEL: &str = "mt5-small";

pub const DEFAULT_DEBOUNCE_MS: u64 = 400;
pub const MIN_DEBOUNCE_MS: u64 = 50;
pub const MAX_DEBOUNCE_MS: u64 = 5_000;

pub const DEFAULT_STOP_GRACE_MS: u64 = 1_500;
pub const MIN_STOP_GRACE_MS: u64 = 100;
pub const MAX_STOP_GRACE_MS: u64 = 30_000;

pub(super) const MAX_ENGINE_ARGS: usize = 64;
pub(super) const MAX_ENGINE_ARG_BYTES: usize = 8 * 1024;

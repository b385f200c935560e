use super::EngineConfig;
use std::path::PathBuf;

/// Launch parameters that do not change between restarts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineLaunchSpec {
    pub program: String,
    /// Arguments split off `--engine-cmd`, placed before the derived ones.
    pub leading_args: Vec<String>,
    pub models_dir: PathBuf,
    /// `--engine-arg` values, appended after the derived ones.
    pub extra_args: Vec<String>,
}

impl EngineLaunchSpec {
    pub fn whisper_model_path(&self, config: &EngineConfig) -> PathBuf {
        self.models_dir
            .join(format!("whisper-{}.gguf", config.model.as_str()))
    }
}

/// Build the engine argv (without the program) for `config`.
///
/// Output is a pure function of the inputs so two identical configs always
/// launch identical processes.
pub fn engine_args(spec: &EngineLaunchSpec, config: &EngineConfig) -> Vec<String> {
    let mut args = spec.leading_args.clone();
    args.push("-m".to_string());
    args.push(spec.whisper_model_path(config).display().to_string());
    args.push("-l".to_string());
    args.push(config.source_lang.as_arg().to_string());
    if let Some(translation) = &config.translation {
        let model_path = spec
            .models_dir
            .join(format!("{}.gguf", translation.translation_model.as_str()));
        args.push("-t".to_string());
        args.push(translation.target_lang.as_str().to_string());
        args.push("-tm".to_string());
        args.push(model_path.display().to_string());
    }
    args.extend(spec.extra_args.iter().cloned());
    args
}

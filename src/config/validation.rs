use super::defaults::{
    MAX_DEBOUNCE_MS, MAX_ENGINE_ARGS, MAX_ENGINE_ARG_BYTES, MAX_STOP_GRACE_MS,
    MIN_DEBOUNCE_MS, MIN_STOP_GRACE_MS,
};
use super::AppConfig;
use crate::engine::{
    EngineConfig, EngineLaunchSpec, LanguageTag, ModelId, SourceLanguage, TranslationConfig,
};
use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use std::{fs, path::Path, time::Duration};

const ENGINE_BINARY_NAMES: &[&str] = &["visualia", "visualia-engine"];

impl AppConfig {
    /// Parse CLI arguments and validate them right away.
    pub fn parse_args() -> Result<Self> {
        let mut config = Self::parse();
        config.validate()?;
        Ok(config)
    }

    /// Check CLI values and resolve the engine program.
    pub fn validate(&mut self) -> Result<()> {
        if !(MIN_DEBOUNCE_MS..=MAX_DEBOUNCE_MS).contains(&self.debounce_ms) {
            bail!(
                "--debounce-ms must be between {MIN_DEBOUNCE_MS} and {MAX_DEBOUNCE_MS}, got {}",
                self.debounce_ms
            );
        }
        if !(MIN_STOP_GRACE_MS..=MAX_STOP_GRACE_MS).contains(&self.stop_grace_ms) {
            bail!(
                "--stop-grace-ms must be between {MIN_STOP_GRACE_MS} and {MAX_STOP_GRACE_MS}, got {}",
                self.stop_grace_ms
            );
        }

        let (program, leading_args) = split_engine_command(&self.engine_cmd)?;
        self.engine_program = sanitize_binary(&program, "--engine-cmd", ENGINE_BINARY_NAMES)?;
        self.engine_leading_args = leading_args;

        // Keep argv small.
        let all_args = self.engine_leading_args.iter().chain(&self.engine_args);
        if all_args.clone().count() > MAX_ENGINE_ARGS {
            bail!("too many engine arguments (max {MAX_ENGINE_ARGS})");
        }
        let total_arg_bytes: usize = all_args.map(|arg| arg.len()).sum();
        if total_arg_bytes > MAX_ENGINE_ARG_BYTES {
            bail!("combined engine arguments exceed {MAX_ENGINE_ARG_BYTES} bytes");
        }

        validate_language(&self.lang, "--lang", true)?;
        if let Some(target) = &self.translate_to {
            validate_language(target, "--translate-to", false)?;
        }
        if ModelId::parse(&self.model).is_none() {
            bail!(
                "--model must be 1-64 characters of letters, digits, '-', '_' or '.', got '{}'",
                self.model
            );
        }
        if ModelId::parse(&self.translation_model).is_none() {
            bail!(
                "--translation-model must be 1-64 characters of letters, digits, '-', '_' or '.', got '{}'",
                self.translation_model
            );
        }
        Ok(())
    }

    /// Engine config described by the command line alone.
    pub fn cli_engine_config(&self) -> Result<EngineConfig> {
        let model = ModelId::parse(&self.model)
            .ok_or_else(|| anyhow!("invalid --model '{}'", self.model))?;
        let source_lang = SourceLanguage::parse(&self.lang)
            .ok_or_else(|| anyhow!("invalid --lang '{}'", self.lang))?;
        let translation = match &self.translate_to {
            Some(target) => Some(TranslationConfig {
                target_lang: LanguageTag::parse(target)
                    .ok_or_else(|| anyhow!("invalid --translate-to '{target}'"))?,
                translation_model: ModelId::parse(&self.translation_model).ok_or_else(|| {
                    anyhow!("invalid --translation-model '{}'", self.translation_model)
                })?,
            }),
            None => None,
        };
        Ok(EngineConfig {
            model,
            source_lang,
            translation,
        })
    }

    pub fn launch_spec(&self) -> EngineLaunchSpec {
        EngineLaunchSpec {
            program: self.engine_program.clone(),
            leading_args: self.engine_leading_args.clone(),
            models_dir: self.models_dir.clone(),
            extra_args: self.engine_args.clone(),
        }
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

/// Split `--engine-cmd` into program and leading arguments.
pub(super) fn split_engine_command(raw: &str) -> Result<(String, Vec<String>)> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        bail!("--engine-cmd cannot be empty");
    }
    let mut parts = shell_words::split(trimmed)
        .with_context(|| format!("failed to parse --engine-cmd '{trimmed}'"))?;
    if parts.is_empty() {
        bail!("--engine-cmd cannot be empty");
    }
    let program = parts.remove(0);
    Ok((program, parts))
}

/// Accept a language code with a valid ISO-639-1 primary subtag (or 'auto' when allowed).
pub(super) fn validate_language(value: &str, flag: &str, allow_auto: bool) -> Result<()> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        bail!("{flag} must not be empty");
    }
    if trimmed.eq_ignore_ascii_case("auto") {
        if allow_auto {
            return Ok(());
        }
        bail!("{flag} must name a concrete language, not 'auto'");
    }
    if LanguageTag::parse(trimmed).is_none() {
        bail!(
            "{flag} must be an ISO-639-1 code with an optional region{}, got '{trimmed}'",
            if allow_auto { " or 'auto'" } else { "" }
        );
    }
    Ok(())
}

/// Allow either a known binary name or an existing executable path.
pub(super) fn sanitize_binary(value: &str, flag: &str, allowlist: &[&str]) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        bail!("{flag} cannot be empty");
    }
    if let Some(allowed) = allowlist
        .iter()
        .find(|candidate| candidate.eq_ignore_ascii_case(trimmed))
    {
        return Ok((*allowed).to_string());
    }

    let path = Path::new(trimmed);
    if path.is_absolute() || trimmed.contains(std::path::MAIN_SEPARATOR) {
        let canonical = path
            .canonicalize()
            .with_context(|| format!("failed to canonicalize {flag} '{trimmed}'"))?;
        let metadata = fs::metadata(&canonical)
            .with_context(|| format!("failed to inspect {flag} '{}'", canonical.display()))?;
        if !metadata.is_file() {
            bail!("{flag} '{}' is not a file", canonical.display());
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = metadata.permissions().mode();
            if mode & 0o111 == 0 {
                bail!(
                    "{flag} '{}' exists but is not executable (mode {:o})",
                    canonical.display(),
                    mode
                );
            }
        }
        return canonical
            .to_str()
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow!("{flag} must be valid UTF-8"));
    }

    bail!("{flag} must be one of {allowlist:?} or an existing binary path");
}

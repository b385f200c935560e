//! Persisted overlay preferences.
//!
//! The file uses the same camelCase shape the overlay UI stores, so either
//! side can read what the other wrote. It seeds the initial engine config and
//! is rewritten whenever the bridge applies a new one.


use crate::engine::{EngineConfig, LanguageTag, ModelId, SourceLanguage, TranslationConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to access settings file '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("settings file '{}' is not valid JSON: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid {field} '{value}' in settings")]
    InvalidValue { field: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoredSettings {
    pub model: String,
    pub source_lang: String,
    /// Remembered even while translation is off.
    pub target_lang: String,
    pub translation_enabled: bool,
    pub translation_model: String,
}

impl Default for StoredSettings {
    fn default() -> Self {
        Self {
            model: "base".to_string(),
            source_lang: "auto".to_string(),
            target_lang: "en".to_string(),
            translation_enabled: false,
            translation_model: "mt5-small".to_string(),
        }
    }
}

impl StoredSettings {
    pub fn to_engine_config(&self) -> Result<EngineConfig, SettingsError> {
        let model = ModelId::parse(&self.model).ok_or_else(|| SettingsError::InvalidValue {
            field: "model",
            value: self.model.clone(),
        })?;
        let source_lang =
            SourceLanguage::parse(&self.source_lang).ok_or_else(|| SettingsError::InvalidValue {
                field: "sourceLang",
                value: self.source_lang.clone(),
            })?;
        let translation = if self.translation_enabled {
            let target_lang =
                LanguageTag::parse(&self.target_lang).ok_or_else(|| SettingsError::InvalidValue {
                    field: "targetLang",
                    value: self.target_lang.clone(),
                })?;
            let translation_model = ModelId::parse(&self.translation_model).ok_or_else(|| {
                SettingsError::InvalidValue {
                    field: "translationModel",
                    value: self.translation_model.clone(),
                }
            })?;
            Some(TranslationConfig {
                target_lang,
                translation_model,
            })
        } else {
            None
        };
        Ok(EngineConfig {
            model,
            source_lang,
            translation,
        })
    }

    /// Record an applied config, keeping the remembered target when translation is off.
    pub fn merge_from(&mut self, config: &EngineConfig) {
        self.model = config.model.to_string();
        self.source_lang = config.source_lang.to_string();
        match &config.translation {
            Some(translation) => {
                self.translation_enabled = true;
                self.target_lang = translation.target_lang.to_string();
                self.translation_model = translation.translation_model.to_string();
            }
            None => self.translation_enabled = false,
        }
    }
}

/// File-backed settings location.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `Ok(None)` when no file exists yet.
    pub fn load(&self) -> Result<Option<StoredSettings>, SettingsError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(SettingsError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| SettingsError::Parse {
                path: self.path.clone(),
                source,
            })
    }

    /// Write through a sibling temp file so a crash never leaves half a file behind.
    pub fn save(&self, settings: &StoredSettings) -> Result<(), SettingsError> {
        let io_err = |source| SettingsError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(io_err)?;
            }
        }
        let json = serde_json::to_string_pretty(settings).map_err(|source| SettingsError::Parse {
            path: self.path.clone(),
            source,
        })?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, json).map_err(io_err)?;
        fs::rename(&tmp, &self.path).map_err(io_err)?;
        Ok(())
    }
}

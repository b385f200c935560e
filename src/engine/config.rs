use std::fmt;

const MAX_MODEL_ID_LEN: usize = 64;
const MAX_LANGUAGE_TAG_LEN: usize = 16;

/// Primary subtags the engine's recognizer and translator know about.
const ISO_639_1_CODES: &[&str] = &[
    "af", "am", "ar", "az", "be", "bg", "bn", "bs", "ca", "cs", "cy", "da", "de", "el", "en", "es",
    "et", "eu", "fa", "fi", "fil", "fr", "ga", "gl", "gu", "he", "hi", "hr", "hu", "hy", "id",
    "is", "it", "ja", "jv", "ka", "kk", "km", "kn", "ko", "lo", "lt", "lv", "mk", "ml", "mn", "mr",
    "ms", "my", "ne", "nl", "no", "pa", "pl", "pt", "ro", "ru", "si", "sk", "sl", "sq", "sr", "sv",
    "sw", "ta", "te", "th", "tr", "uk", "ur", "vi", "zh",
];

/// Model identifier such as `base`, `large-v3` or `mt5-small`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelId(String);

impl ModelId {
    /// Accepts short identifiers that are safe to splice into a file name.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.len() > MAX_MODEL_ID_LEN {
            return None;
        }
        if trimmed.starts_with('.') {
            return None;
        }
        let valid = trimmed
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'));
        valid.then(|| Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Concrete language code (`en`, `fr`, `pt-BR`).
///
/// The primary subtag must be a known ISO-639-1 code. Stored in canonical case:
/// lowercase primary, uppercase two-letter region, anything else lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LanguageTag(String);

impl LanguageTag {
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.len() > MAX_LANGUAGE_TAG_LEN {
            return None;
        }
        if trimmed.eq_ignore_ascii_case("auto") {
            return None;
        }
        if !trimmed
            .chars()
            .all(|ch| ch.is_ascii_alphabetic() || ch == '-' || ch == '_')
        {
            return None;
        }
        let mut parts = trimmed.splitn(2, ['-', '_']);
        let primary = parts.next().unwrap_or("").to_ascii_lowercase();
        if !ISO_639_1_CODES.contains(&primary.as_str()) {
            return None;
        }
        let normalized = match parts.next() {
            Some(region)
                if region.len() == 2 && region.chars().all(|ch| ch.is_ascii_alphabetic()) =>
            {
                format!("{primary}-{}", region.to_ascii_uppercase())
            }
            Some(rest)
                if !rest.is_empty()
                    && !rest.starts_with(['-', '_'])
                    && !rest.ends_with(['-', '_']) =>
            {
                format!("{primary}-{}", rest.replace('_', "-").to_ascii_lowercase())
            }
            Some(_) => return None,
            None => primary,
        };
        Some(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Leading ISO-639 code, used when comparing source and target.
    pub fn primary(&self) -> &str {
        self.0.split('-').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for LanguageTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Source language: either detected by the engine or pinned.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SourceLanguage {
    Auto,
    Tag(LanguageTag),
}

impl SourceLanguage {
    pub fn parse(raw: &str) -> Option<Self> {
        if raw.trim().eq_ignore_ascii_case("auto") {
            return Some(Self::Auto);
        }
        LanguageTag::parse(raw).map(Self::Tag)
    }

    pub fn is_auto(&self) -> bool {
        matches!(self, Self::Auto)
    }

    /// Value passed on the engine command line.
    pub fn as_arg(&self) -> &str {
        match self {
            Self::Auto => "auto",
            Self::Tag(tag) => tag.as_str(),
        }
    }
}

impl fmt::Display for SourceLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_arg())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TranslationConfig {
    pub target_lang: LanguageTag,
    pub translation_model: ModelId,
}

/// Everything the engine needs to know at launch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EngineConfig {
    pub model: ModelId,
    pub source_lang: SourceLanguage,
    pub translation: Option<TranslationConfig>,
}

/// Non-fatal configuration problems. The engine is still started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    SameSourceAndTarget { language: String },
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SameSourceAndTarget { language } => write!(
                f,
                "source and target language are both '{language}'; translation will echo the input"
            ),
        }
    }
}

impl EngineConfig {
    pub fn new(model: ModelId, source_lang: SourceLanguage) -> Self {
        Self {
            model,
            source_lang,
            translation: None,
        }
    }

    pub fn with_model(&self, model: ModelId) -> Self {
        Self {
            model,
            ..self.clone()
        }
    }

    pub fn with_source_lang(&self, source_lang: SourceLanguage) -> Self {
        Self {
            source_lang,
            ..self.clone()
        }
    }

    pub fn with_translation(&self, translation: Option<TranslationConfig>) -> Self {
        Self {
            translation,
            ..self.clone()
        }
    }

    pub fn warnings(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        if let (SourceLanguage::Tag(source), Some(translation)) =
            (&self.source_lang, &self.translation)
        {
            if source.primary() == translation.target_lang.primary() {
                warnings.push(ConfigWarning::SameSourceAndTarget {
                    language: source.primary().to_string(),
                });
            }
        }
        warnings
    }

    /// Short human-readable summary for status lines.
    pub fn describe(&self) -> String {
        match &self.translation {
            Some(translation) => format!(
                "model {}, language {}, translating to {} with {}",
                self.model, self.source_lang, translation.target_lang, translation.translation_model
            ),
            None => format!("model {}, language {}", self.model, self.source_lang),
        }
    }
}

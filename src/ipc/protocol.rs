//! JSON-lines protocol between the bridge and the presentation layer.
//!
//! Events (bridge → overlay) carry an `"event"` tag, commands
//! (overlay → bridge) carry a `"cmd"` tag. One object per line.

use serde::{Deserialize, Serialize};

// ============================================================================
// Overlay Events (bridge → presentation)
// ============================================================================

/// Events delivered to the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event")]
pub enum OverlayEvent {
    /// Sent on startup and in reply to `get_status`
    #[serde(rename = "snapshot")]
    Snapshot {
        session_id: String,
        version: String,
        engine_cmd: String,
        state: String,
        model: String,
        source_lang: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        target_lang: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        translation_model: Option<String>,
        restart_pending: bool,
        transcriptions: u64,
        translations: u64,
        dropped_events: u64,
    },

    /// Recognized speech
    #[serde(rename = "transcription")]
    Transcription {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
    },

    /// Translated speech alongside the original
    #[serde(rename = "translation")]
    Translation {
        original: String,
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
    },

    /// Engine identified the spoken language
    #[serde(rename = "language_detected")]
    LanguageDetected { language: String },

    /// Human-readable status update
    #[serde(rename = "status")]
    Status { message: String },

    /// Error (recoverable or fatal)
    #[serde(rename = "error")]
    Error { message: String, recoverable: bool },

    /// Free-form engine diagnostic (stderr)
    #[serde(rename = "log")]
    Log { line: String },

    /// Supervisor state transition
    #[serde(rename = "engine_state")]
    EngineState { state: String },

    /// Engine process ended
    #[serde(rename = "engine_exited")]
    EngineExited {
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<i32>,
        crashed: bool,
    },

    /// Engine binary could not be launched
    #[serde(rename = "spawn_failed")]
    SpawnFailed { message: String },

    /// A new engine configuration took effect
    #[serde(rename = "config_applied")]
    ConfigApplied {
        model: String,
        source_lang: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        target_lang: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        translation_model: Option<String>,
    },
}

impl OverlayEvent {
    /// Failure reports that must reach the overlay even when the queue is full.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            OverlayEvent::Error { .. }
                | OverlayEvent::EngineExited { .. }
                | OverlayEvent::SpawnFailed { .. }
        )
    }
}

// ============================================================================
// Client Commands (presentation → bridge)
// ============================================================================

/// Configuration-change and control requests from the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "cmd")]
pub enum ClientCommand {
    #[serde(rename = "change_model")]
    ChangeModel { model: String },

    #[serde(rename = "change_source_lang")]
    ChangeSourceLang { language: String },

    #[serde(rename = "change_translation")]
    ChangeTranslation {
        enabled: bool,
        #[serde(default)]
        target_lang: Option<String>,
        #[serde(default)]
        translation_model: Option<String>,
    },

    /// Restart the engine with the applied configuration
    #[serde(rename = "restart")]
    Restart,

    /// Re-emit the snapshot event
    #[serde(rename = "get_status")]
    GetStatus,

    #[serde(rename = "shutdown")]
    Shutdown,
}

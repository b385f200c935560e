use super::decoder::EngineEvent;
use super::protocol::OverlayEvent;
use crate::supervisor::SupervisorEvent;

/// Result of routing one supervisor event.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Routed {
    /// Events for the presentation layer, in delivery order.
    pub overlay: Vec<OverlayEvent>,
    /// Language to feed back into the reconciler.
    pub detected_language: Option<String>,
    /// Set when the engine went away unsolicited.
    pub crashed: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub transcriptions: u64,
    pub translations: u64,
    pub detections: u64,
    pub statuses: u64,
    pub errors: u64,
    pub diagnostics: u64,
    pub exits: u64,
}

/// Stateless apart from counters: each input maps to a fixed set of outputs.
#[derive(Debug, Default)]
pub struct EventRouter {
    stats: RouterStats,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> RouterStats {
        self.stats
    }

    pub fn route(&mut self, event: SupervisorEvent) -> Routed {
        match event {
            SupervisorEvent::Engine(event) => self.route_engine(event),
            SupervisorEvent::Diagnostic(line) => {
                self.stats.diagnostics += 1;
                Routed {
                    overlay: vec![OverlayEvent::Log { line }],
                    ..Routed::default()
                }
            }
            SupervisorEvent::Exited {
                code,
                signal,
                crashed,
            } => {
                self.stats.exits += 1;
                let mut overlay = vec![OverlayEvent::EngineExited { code, crashed }];
                if crashed {
                    self.stats.errors += 1;
                    overlay.push(OverlayEvent::Error {
                        message: crash_message(code, signal),
                        recoverable: true,
                    });
                }
                overlay.push(OverlayEvent::EngineState {
                    state: "stopped".to_string(),
                });
                Routed {
                    overlay,
                    detected_language: None,
                    crashed,
                }
            }
        }
    }

    fn route_engine(&mut self, event: EngineEvent) -> Routed {
        let mut routed = Routed::default();
        let overlay = match event {
            EngineEvent::Transcription { text, timestamp } => {
                self.stats.transcriptions += 1;
                OverlayEvent::Transcription { text, timestamp }
            }
            EngineEvent::Translation {
                text,
                original,
                timestamp,
            } => {
                self.stats.translations += 1;
                OverlayEvent::Translation {
                    original,
                    text,
                    timestamp,
                }
            }
            EngineEvent::LanguageDetected { language } => {
                self.stats.detections += 1;
                routed.detected_language = Some(language.clone());
                OverlayEvent::LanguageDetected { language }
            }
            EngineEvent::Status { message } => {
                self.stats.statuses += 1;
                OverlayEvent::Status { message }
            }
            EngineEvent::Error { message } => {
                self.stats.errors += 1;
                OverlayEvent::Error {
                    message,
                    recoverable: true,
                }
            }
        };
        routed.overlay.push(overlay);
        routed
    }
}

fn crash_message(code: Option<i32>, signal: Option<i32>) -> String {
    match (code, signal) {
        (Some(code), _) => format!("Engine exited unexpectedly with code {code}"),
        (None, Some(signal)) => format!("Engine was terminated by signal {signal}"),
        (None, None) => "Engine exited unexpectedly".to_string(),
    }
}

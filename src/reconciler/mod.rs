//! Serializes engine configuration changes into restart sequences.
//!
//! Every change goes through [`Reconciler::request_change`], whether it came
//! from the presentation layer or from the engine's own language detection.
//! Requests are debounced; when the window closes the reconciler asks for a
//! stop, waits until the supervisor reports `Stopped`, applies the config and
//! asks for a start. It never talks to the process itself: the bridge loop
//! executes the returned [`ReconcilerAction`]s.


use crate::engine::{EngineConfig, LanguageTag, SourceLanguage};
use crate::log_debug;
use crate::supervisor::SupervisorState;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeReason {
    UserChange,
    AutoDetected,
    /// Explicit restart of the applied config.
    Restart,
}

impl ChangeReason {
    pub fn label(self) -> &'static str {
        match self {
            ChangeReason::UserChange => "user change",
            ChangeReason::AutoDetected => "language detection",
            ChangeReason::Restart => "restart",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartRequest {
    pub reason: ChangeReason,
    pub config: EngineConfig,
    pub requested_at: Instant,
}

/// What `request_change` did with a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeOutcome {
    /// Same as what is already applied or queued.
    Unchanged,
    /// Reverted to the healthy applied config; the queued restart was dropped.
    Cancelled,
    /// Queued; runs when the debounce window closes.
    Scheduled { due_at: Instant },
    /// Queued behind a restart that is already in flight.
    Deferred,
}

/// What the outcome of a language detection was.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectionOutcome {
    /// Source language is pinned; detections are informational only.
    Ignored,
    Requested(ChangeOutcome),
}

/// Work the bridge must perform on the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcilerAction {
    Stop,
    Start {
        config: EngineConfig,
        reason: ChangeReason,
    },
}

#[derive(Debug, Clone)]
struct InFlight {
    config: EngineConfig,
    reason: ChangeReason,
    stop_requested: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcilerStats {
    pub requests: u64,
    pub superseded: u64,
    pub restarts: u64,
}

pub struct Reconciler {
    applied: EngineConfig,
    applied_healthy: bool,
    pending: Option<RestartRequest>,
    in_flight: Option<InFlight>,
    debounce: Duration,
    stats: ReconcilerStats,
}

impl Reconciler {
    /// The initial config is started through the regular in-flight path.
    pub fn new(initial: EngineConfig, debounce: Duration) -> Self {
        Self {
            in_flight: Some(InFlight {
                config: initial.clone(),
                reason: ChangeReason::UserChange,
                stop_requested: false,
            }),
            applied: initial,
            applied_healthy: true,
            pending: None,
            debounce,
            stats: ReconcilerStats::default(),
        }
    }

    pub fn applied(&self) -> &EngineConfig {
        &self.applied
    }

    pub fn pending(&self) -> Option<&RestartRequest> {
        self.pending.as_ref()
    }

    pub fn is_restart_pending(&self) -> bool {
        self.pending.is_some() || self.in_flight.is_some()
    }

    pub fn stats(&self) -> ReconcilerStats {
        self.stats
    }

    /// The config the engine will run once everything queued has settled.
    pub fn desired(&self) -> &EngineConfig {
        if let Some(pending) = &self.pending {
            return &pending.config;
        }
        if let Some(in_flight) = &self.in_flight {
            return &in_flight.config;
        }
        &self.applied
    }

    pub fn request_change(
        &mut self,
        config: EngineConfig,
        reason: ChangeReason,
        now: Instant,
    ) -> ChangeOutcome {
        self.stats.requests += 1;
        let queued = self.pending.is_some() || self.in_flight.is_some();
        if *self.desired() == config && (queued || self.applied_healthy) {
            return ChangeOutcome::Unchanged;
        }

        if self.in_flight.is_none() && config == self.applied && self.applied_healthy {
            if self.pending.take().is_some() {
                self.stats.superseded += 1;
                log_debug("pending restart cancelled; config reverted to the applied one");
            }
            return ChangeOutcome::Cancelled;
        }

        if let Some(previous) = self.pending.replace(RestartRequest {
            reason,
            config,
            requested_at: now,
        }) {
            self.stats.superseded += 1;
            log_debug(&format!(
                "superseding pending {} request from {:?} ago",
                previous.reason.label(),
                now.saturating_duration_since(previous.requested_at)
            ));
        }

        if self.in_flight.is_some() {
            ChangeOutcome::Deferred
        } else {
            ChangeOutcome::Scheduled {
                due_at: now + self.debounce,
            }
        }
    }

    /// Restart with the applied config regardless of its health.
    pub fn request_restart(&mut self, now: Instant) -> ChangeOutcome {
        self.stats.requests += 1;
        let config = self.desired().clone();
        if self.in_flight.is_some() && self.pending.is_none() {
            return ChangeOutcome::Unchanged;
        }
        self.pending = Some(RestartRequest {
            reason: ChangeReason::Restart,
            config,
            requested_at: now,
        });
        if self.in_flight.is_some() {
            ChangeOutcome::Deferred
        } else {
            ChangeOutcome::Scheduled {
                due_at: now + self.debounce,
            }
        }
    }

    /// Feed back a `LanguageDetected` event. Only acts while the desired source
    /// language is `auto`, so repeated detections of a settled language are no-ops.
    pub fn on_language_detected(&mut self, language: &str, now: Instant) -> DetectionOutcome {
        if !self.desired().source_lang.is_auto() {
            return DetectionOutcome::Ignored;
        }
        let Some(tag) = LanguageTag::parse(language) else {
            log_debug(&format!("ignoring unusable detected language '{language}'"));
            return DetectionOutcome::Ignored;
        };
        let config = self
            .desired()
            .with_source_lang(SourceLanguage::Tag(tag));
        DetectionOutcome::Requested(self.request_change(config, ChangeReason::AutoDetected, now))
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        if self.in_flight.is_some() {
            return None;
        }
        self.pending
            .as_ref()
            .map(|request| request.requested_at + self.debounce)
    }

    /// Advance the restart sequence given the supervisor's current state.
    pub fn poll(&mut self, now: Instant, state: SupervisorState) -> Option<ReconcilerAction> {
        if self.in_flight.is_none() {
            let due = self
                .pending
                .as_ref()
                .is_some_and(|request| now >= request.requested_at + self.debounce);
            if !due {
                return None;
            }
            let request = self.pending.take()?;
            log_debug(&format!(
                "debounce elapsed; restarting engine for {}",
                request.reason.label()
            ));
            self.in_flight = Some(InFlight {
                config: request.config,
                reason: request.reason,
                stop_requested: false,
            });
        }

        let stop_requested = self.in_flight.as_ref()?.stop_requested;
        match state {
            SupervisorState::Stopped => {
                let in_flight = self.in_flight.take()?;
                self.applied = in_flight.config.clone();
                self.stats.restarts += 1;
                tracing::info!(
                    reason = in_flight.reason.label(),
                    model = %in_flight.config.model,
                    source_lang = %in_flight.config.source_lang,
                    "applying engine config"
                );
                Some(ReconcilerAction::Start {
                    config: in_flight.config,
                    reason: in_flight.reason,
                })
            }
            SupervisorState::Running | SupervisorState::Starting if !stop_requested => {
                if let Some(in_flight) = self.in_flight.as_mut() {
                    in_flight.stop_requested = true;
                }
                Some(ReconcilerAction::Stop)
            }
            _ => None,
        }
    }

    /// Result of executing a `Start` action.
    pub fn on_start_result(&mut self, succeeded: bool) {
        self.applied_healthy = succeeded;
    }

    /// The engine went away without being asked to.
    pub fn on_engine_crashed(&mut self) {
        self.applied_healthy = false;
    }
}

use crate::config::{AppConfig, DEFAULT_TRANSLATION_MODEL};
use crate::engine::{EngineConfig, LanguageTag, ModelId, SourceLanguage, TranslationConfig};
use crate::reconciler::{
    ChangeOutcome, ChangeReason, DetectionOutcome, Reconciler, ReconcilerAction,
};
use crate::settings::{SettingsStore, StoredSettings};
use crate::supervisor::{
    OsProcessControl, ProcessControl, ProcessMessage, Supervisor, SupervisorEvent,
    SupervisorState,
};
use crate::{log_debug, log_debug_content};
use anyhow::Result;
use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender, TrySendError};
use std::io::{self, BufRead, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use super::protocol::{ClientCommand, OverlayEvent};
use super::router::EventRouter;

/// Events queued for the stdout writer before new ones are dropped.
pub(super) const EVENT_QUEUE_CAPACITY: usize = 1024;
/// Upper bound on one select wait; timers are re-evaluated at least this often.
const LOOP_IDLE_MS: u64 = 250;

// ============================================================================
// Event Sending
// ============================================================================

/// Non-blocking handle on the overlay event queue.
///
/// When the queue is full, ordinary events are dropped and counted. A failure
/// event evicts the oldest non-failure event instead; queue order is kept.
#[derive(Clone)]
pub(super) struct EventEmitter {
    tx: Sender<OverlayEvent>,
    rx: Receiver<OverlayEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventEmitter {
    /// `rx` must be the receiving end of `tx`'s queue.
    pub(super) fn new(tx: Sender<OverlayEvent>, rx: Receiver<OverlayEvent>) -> Self {
        Self {
            tx,
            rx,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub(super) fn emit(&self, event: OverlayEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) if event.is_failure() => self.make_room_for(event),
            Err(TrySendError::Full(event)) => self.note_dropped(&event),
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    fn make_room_for(&self, event: OverlayEvent) {
        let mut queued: Vec<OverlayEvent> = self.rx.try_iter().collect();
        let capacity = self.tx.capacity().unwrap_or(usize::MAX);
        if !queued.is_empty() && queued.len() >= capacity {
            let victim = queued
                .iter()
                .position(|queued| !queued.is_failure())
                .unwrap_or(0);
            let evicted = queued.remove(victim);
            self.note_dropped(&evicted);
        }
        queued.push(event);
        for event in queued {
            if let Err(err) = self.tx.try_send(event) {
                self.note_dropped(&err.into_inner());
            }
        }
    }

    fn note_dropped(&self, event: &OverlayEvent) {
        let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        log_debug(&format!(
            "overlay queue full; dropped event #{dropped}: {event:?}"
        ));
    }

    pub(super) fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

fn write_event(out: &mut impl Write, event: &OverlayEvent) -> io::Result<()> {
    let json = serde_json::to_string(event).map_err(io::Error::other)?;
    writeln!(out, "{json}")?;
    out.flush()
}

/// Drain the queue to stdout until every emitter is gone.
fn spawn_event_writer(rx: Receiver<OverlayEvent>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        for event in rx.iter() {
            let mut stdout = io::stdout().lock();
            if let Err(err) = write_event(&mut stdout, &event) {
                log_debug(&format!("stdout writer stopping: {err}"));
                break;
            }
        }
    })
}

// ============================================================================
// Stdin Reader Thread
// ============================================================================

/// One line read from the presentation layer.
#[derive(Debug)]
pub(super) enum ClientInput {
    Command(ClientCommand),
    Invalid(String),
}

pub(super) fn parse_client_line(line: &str) -> Option<ClientInput> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(match serde_json::from_str::<ClientCommand>(trimmed) {
        Ok(cmd) => ClientInput::Command(cmd),
        Err(err) => ClientInput::Invalid(format!("Invalid command: {err}")),
    })
}

fn spawn_stdin_reader(tx: Sender<ClientInput>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else {
                break;
            };
            let Some(input) = parse_client_line(&line) else {
                continue;
            };
            if tx.send(input).is_err() {
                break; // Bridge loop has exited
            }
        }
        log_debug("Stdin reader thread exiting");
    })
}

// ============================================================================
// Bridge State
// ============================================================================

pub(super) struct SettingsSlot {
    pub(super) store: SettingsStore,
    pub(super) stored: StoredSettings,
}

pub(super) struct BridgeState<C: ProcessControl> {
    pub(super) supervisor: Supervisor<C>,
    pub(super) reconciler: Reconciler,
    pub(super) router: EventRouter,
    pub(super) emitter: EventEmitter,
    pub(super) settings: Option<SettingsSlot>,
    pub(super) session_id: String,
    /// Last source language the client chose; detections never overwrite it.
    preferred_source: SourceLanguage,
}

impl<C: ProcessControl> BridgeState<C> {
    pub(super) fn new(
        supervisor: Supervisor<C>,
        reconciler: Reconciler,
        emitter: EventEmitter,
        settings: Option<SettingsSlot>,
    ) -> Self {
        let session_id = format!(
            "{:x}",
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis()
        );
        let preferred_source = reconciler.applied().source_lang.clone();
        Self {
            supervisor,
            reconciler,
            router: EventRouter::new(),
            emitter,
            settings,
            session_id,
            preferred_source,
        }
    }

    fn emit(&self, event: OverlayEvent) {
        self.emitter.emit(event);
    }

    fn emit_state(&self) {
        self.emit(OverlayEvent::EngineState {
            state: self.supervisor.state().label().to_string(),
        });
    }

    fn emit_error(&self, message: String) {
        self.emit(OverlayEvent::Error {
            message,
            recoverable: true,
        });
    }

    pub(super) fn emit_snapshot(&self) {
        let applied = self.reconciler.applied();
        let translation = applied.translation.as_ref();
        let stats = self.router.stats();
        self.emit(OverlayEvent::Snapshot {
            session_id: self.session_id.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            engine_cmd: self.supervisor.launch_spec().program.clone(),
            state: self.supervisor.state().label().to_string(),
            model: applied.model.to_string(),
            source_lang: applied.source_lang.to_string(),
            target_lang: translation.map(|t| t.target_lang.to_string()),
            translation_model: translation.map(|t| t.translation_model.to_string()),
            restart_pending: self.reconciler.is_restart_pending(),
            transcriptions: stats.transcriptions,
            translations: stats.translations,
            dropped_events: self.emitter.dropped(),
        });
    }

    /// Earliest timer either state machine is waiting on.
    pub(super) fn next_deadline(&self) -> Option<Instant> {
        match (
            self.supervisor.next_deadline(),
            self.reconciler.next_deadline(),
        ) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Fire due timers and execute every action the reconciler is ready to take.
    pub(super) fn drive(&mut self, now: Instant) {
        let forced = self.supervisor.poll_timers(now);
        self.dispatch(forced, now);
        while let Some(action) = self.reconciler.poll(now, self.supervisor.state()) {
            match action {
                ReconcilerAction::Stop => {
                    self.supervisor.stop(now);
                    self.emit_state();
                }
                ReconcilerAction::Start { config, reason } => {
                    self.start_engine(&config, reason, now);
                }
            }
        }
    }

    fn start_engine(&mut self, config: &EngineConfig, reason: ChangeReason, now: Instant) {
        match self.supervisor.start(config, now) {
            Ok(()) => {
                self.reconciler.on_start_result(true);
                self.emit_state();
                let translation = config.translation.as_ref();
                self.emit(OverlayEvent::ConfigApplied {
                    model: config.model.to_string(),
                    source_lang: config.source_lang.to_string(),
                    target_lang: translation.map(|t| t.target_lang.to_string()),
                    translation_model: translation.map(|t| t.translation_model.to_string()),
                });
                self.emit(OverlayEvent::Status {
                    message: format!("Engine started ({}): {}", reason.label(), config.describe()),
                });
                for warning in config.warnings() {
                    self.emit(OverlayEvent::Status {
                        message: format!("Warning: {warning}"),
                    });
                }
                self.persist(config);
            }
            Err(err) => {
                self.reconciler.on_start_result(false);
                self.emit(OverlayEvent::SpawnFailed {
                    message: err.to_string(),
                });
                self.emit_error(format!("Failed to start engine: {err}"));
                self.emit_state();
            }
        }
    }

    fn persist(&mut self, config: &EngineConfig) {
        let Some(slot) = self.settings.as_mut() else {
            return;
        };
        slot.stored.merge_from(config);
        slot.stored.source_lang = self.preferred_source.to_string();
        if let Err(err) = slot.store.save(&slot.stored) {
            log_debug(&format!("failed to save settings: {err}"));
            tracing::warn!(error = %err, "settings not saved");
        }
    }

    /// Returns `false` when the bridge should exit.
    pub(super) fn handle_input(&mut self, input: ClientInput, now: Instant) -> bool {
        match input {
            ClientInput::Command(cmd) => self.handle_command(cmd, now),
            ClientInput::Invalid(message) => {
                self.emit_error(message);
                true
            }
        }
    }

    pub(super) fn handle_command(&mut self, cmd: ClientCommand, now: Instant) -> bool {
        log_debug_content(&format!("bridge command received: {cmd:?}"));
        match cmd {
            ClientCommand::ChangeModel { model } => match ModelId::parse(&model) {
                Some(model) => {
                    let config = self.reconciler.desired().with_model(model);
                    self.request_change(config, now);
                }
                None => self.emit_error(format!("Invalid model '{model}'")),
            },
            ClientCommand::ChangeSourceLang { language } => {
                match SourceLanguage::parse(&language) {
                    Some(source_lang) => {
                        self.preferred_source = source_lang.clone();
                        let config = self.reconciler.desired().with_source_lang(source_lang);
                        self.request_change(config, now);
                    }
                    None => self.emit_error(format!("Invalid source language '{language}'")),
                }
            }
            ClientCommand::ChangeTranslation {
                enabled,
                target_lang,
                translation_model,
            } => {
                let translation = if enabled {
                    match self.translation_from(target_lang.as_deref(), translation_model.as_deref())
                    {
                        Ok(translation) => Some(translation),
                        Err(message) => {
                            self.emit_error(message);
                            return true;
                        }
                    }
                } else {
                    None
                };
                let config = self.reconciler.desired().with_translation(translation);
                self.request_change(config, now);
            }
            ClientCommand::Restart => {
                let outcome = self.reconciler.request_restart(now);
                log_debug(&format!("restart requested: {outcome:?}"));
                if outcome != ChangeOutcome::Unchanged {
                    self.emit(OverlayEvent::Status {
                        message: "Restarting engine...".to_string(),
                    });
                }
            }
            ClientCommand::GetStatus => self.emit_snapshot(),
            ClientCommand::Shutdown => {
                log_debug("shutdown requested by client");
                return false;
            }
        }
        true
    }

    /// Fill omitted translation fields from the desired config, then settings, then defaults.
    fn translation_from(
        &self,
        target_lang: Option<&str>,
        translation_model: Option<&str>,
    ) -> Result<TranslationConfig, String> {
        let current = self.reconciler.desired().translation.as_ref();
        let remembered = self.settings.as_ref().map(|slot| &slot.stored);

        let target = match target_lang {
            Some(raw) => raw.to_string(),
            None => current
                .map(|t| t.target_lang.to_string())
                .or_else(|| remembered.map(|s| s.target_lang.clone()))
                .unwrap_or_else(|| StoredSettings::default().target_lang),
        };
        let model = match translation_model {
            Some(raw) => raw.to_string(),
            None => current
                .map(|t| t.translation_model.to_string())
                .or_else(|| remembered.map(|s| s.translation_model.clone()))
                .unwrap_or_else(|| DEFAULT_TRANSLATION_MODEL.to_string()),
        };

        let target_lang = LanguageTag::parse(&target)
            .ok_or_else(|| format!("Invalid target language '{target}'"))?;
        let translation_model = ModelId::parse(&model)
            .ok_or_else(|| format!("Invalid translation model '{model}'"))?;
        Ok(TranslationConfig {
            target_lang,
            translation_model,
        })
    }

    fn request_change(&mut self, config: EngineConfig, now: Instant) {
        let description = config.describe();
        let outcome = self
            .reconciler
            .request_change(config, ChangeReason::UserChange, now);
        log_debug(&format!("config change ({description}): {outcome:?}"));
        let message = match outcome {
            ChangeOutcome::Unchanged => return,
            ChangeOutcome::Cancelled => "Configuration change cancelled".to_string(),
            ChangeOutcome::Scheduled { .. } | ChangeOutcome::Deferred => {
                format!("Applying {description}...")
            }
        };
        self.emit(OverlayEvent::Status { message });
    }

    /// Feed one process message through supervisor, router and reconciler.
    pub(super) fn handle_output(&mut self, message: ProcessMessage, now: Instant) {
        let events = self.supervisor.handle_message(message);
        self.dispatch(events, now);
    }

    fn dispatch(&mut self, events: Vec<SupervisorEvent>, now: Instant) {
        for event in events {
            let routed = self.router.route(event);
            for overlay in routed.overlay {
                self.emit(overlay);
            }
            if routed.crashed {
                self.reconciler.on_engine_crashed();
            }
            if let Some(language) = routed.detected_language {
                self.on_language_detected(&language, now);
            }
        }
    }

    fn on_language_detected(&mut self, language: &str, now: Instant) {
        // A detection from an engine that is already being replaced describes the old config.
        if self.supervisor.state() != SupervisorState::Running {
            return;
        }
        match self.reconciler.on_language_detected(language, now) {
            DetectionOutcome::Requested(ChangeOutcome::Scheduled { .. })
            | DetectionOutcome::Requested(ChangeOutcome::Deferred) => {
                self.emit(OverlayEvent::Status {
                    message: format!("Detected language: {language} - switching model..."),
                });
            }
            DetectionOutcome::Requested(_) | DetectionOutcome::Ignored => {}
        }
    }

    /// Stop the engine and forward whatever it printed on the way out.
    pub(super) fn finish(&mut self, output_rx: &Receiver<ProcessMessage>) {
        for event in self.supervisor.shutdown(output_rx) {
            for overlay in self.router.route(event).overlay {
                self.emit(overlay);
            }
        }
        let stats = self.supervisor.stats();
        tracing::info!(
            spawns = stats.spawns,
            spawn_failures = stats.spawn_failures,
            decode_failures = stats.decode_failures,
            forced_kills = stats.forced_kills,
            restarts = self.reconciler.stats().restarts,
            dropped_events = self.emitter.dropped(),
            "bridge exiting"
        );
    }
}

// ============================================================================
// Main Event Loop
// ============================================================================

/// Seed the first engine config from the settings file when one is usable.
pub(super) fn resolve_initial_config(
    config: &AppConfig,
) -> Result<(EngineConfig, Option<SettingsSlot>, Option<String>)> {
    let cli = config.cli_engine_config()?;
    let Some(path) = &config.settings else {
        return Ok((cli, None, None));
    };
    let store = SettingsStore::new(path);
    let fresh = |cli: &EngineConfig| {
        let mut stored = StoredSettings::default();
        stored.merge_from(cli);
        stored
    };
    match store.load() {
        Ok(Some(stored)) => match stored.to_engine_config() {
            Ok(engine) => Ok((engine, Some(SettingsSlot { store, stored }), None)),
            Err(err) => {
                log_debug(&format!("ignoring stored settings: {err}"));
                let notice = format!("Ignoring saved settings: {err}");
                let stored = fresh(&cli);
                Ok((cli, Some(SettingsSlot { store, stored }), Some(notice)))
            }
        },
        Ok(None) => {
            let stored = fresh(&cli);
            Ok((cli, Some(SettingsSlot { store, stored }), None))
        }
        Err(err) => {
            log_debug(&format!("failed to load settings: {err}"));
            tracing::warn!(error = %err, "settings unreadable; using command-line values");
            let notice = format!("Ignoring saved settings: {err}");
            let stored = fresh(&cli);
            Ok((cli, Some(SettingsSlot { store, stored }), Some(notice)))
        }
    }
}

/// Run the bridge until stdin closes or a `shutdown` command arrives.
pub fn run_bridge(config: AppConfig) -> Result<()> {
    log_debug("Starting VisualIA bridge");

    let (initial, settings, notice) = resolve_initial_config(&config)?;
    let (event_tx, event_rx) = bounded(EVENT_QUEUE_CAPACITY);
    let emitter = EventEmitter::new(event_tx, event_rx.clone());
    let writer = spawn_event_writer(event_rx);

    let (output_tx, output_rx) = unbounded();
    let supervisor = Supervisor::new(
        OsProcessControl,
        config.launch_spec(),
        output_tx,
        config.stop_grace(),
    );
    let reconciler = Reconciler::new(initial, config.debounce());
    let mut state = BridgeState::new(supervisor, reconciler, emitter, settings);

    state.emit_snapshot();
    if let Some(notice) = notice {
        state.emit_error(notice);
    }

    let (cmd_tx, cmd_rx) = unbounded();
    let _stdin_handle = spawn_stdin_reader(cmd_tx);
    run_bridge_loop(&mut state, &cmd_rx, &output_rx);
    state.finish(&output_rx);

    // Dropping the last emitter ends the writer once the queue is drained.
    drop(state);
    if writer.join().is_err() {
        log_debug("stdout writer thread panicked");
    }
    log_debug("VisualIA bridge exiting");
    Ok(())
}

pub(super) fn run_bridge_loop<C: ProcessControl>(
    state: &mut BridgeState<C>,
    cmd_rx: &Receiver<ClientInput>,
    output_rx: &Receiver<ProcessMessage>,
) {
    let idle = Duration::from_millis(LOOP_IDLE_MS);
    loop {
        let now = Instant::now();
        state.drive(now);
        let wait = state
            .next_deadline()
            .map(|deadline| deadline.saturating_duration_since(now).min(idle))
            .unwrap_or(idle);

        select! {
            recv(cmd_rx) -> input => match input {
                Ok(input) => {
                    if !state.handle_input(input, Instant::now()) {
                        break;
                    }
                }
                Err(_) => {
                    log_debug("Command channel disconnected, exiting");
                    break;
                }
            },
            recv(output_rx) -> message => {
                if let Ok(message) = message {
                    state.handle_output(message, Instant::now());
                }
            },
            default(wait) => {}
        }
    }
}

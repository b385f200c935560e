use super::fake::FakeControl;
use super::*;
use crate::engine::{ModelId, SourceLanguage};
use crossbeam_channel::unbounded;
use std::path::PathBuf;

fn config(model: &str, lang: &str) -> EngineConfig {
    EngineConfig::new(
        ModelId::parse(model).unwrap(),
        SourceLanguage::parse(lang).unwrap(),
    )
}

fn launch(program: &str) -> EngineLaunchSpec {
    EngineLaunchSpec {
        program: program.to_string(),
        leading_args: Vec::new(),
        models_dir: PathBuf::from("models"),
        extra_args: Vec::new(),
    }
}

fn fake_supervisor(
    grace: Duration,
) -> (
    Supervisor<FakeControl>,
    FakeControl,
    Receiver<ProcessMessage>,
) {
    let control = FakeControl::new();
    let (tx, rx) = unbounded();
    let supervisor = Supervisor::new(control.clone(), launch("visualia"), tx, grace);
    (supervisor, control, rx)
}

fn drain<C: ProcessControl>(
    supervisor: &mut Supervisor<C>,
    rx: &Receiver<ProcessMessage>,
) -> Vec<SupervisorEvent> {
    let mut events = Vec::new();
    while let Ok(message) = rx.try_recv() {
        events.extend(supervisor.handle_message(message));
    }
    events
}

fn status(message: &str) -> SupervisorEvent {
    SupervisorEvent::Engine(EngineEvent::Status {
        message: message.to_string(),
    })
}

#[test]
fn start_spawns_with_derived_args() {
    let (mut supervisor, control, _rx) = fake_supervisor(Duration::from_millis(500));
    supervisor
        .start(&config("base", "auto"), Instant::now())
        .unwrap();
    assert_eq!(supervisor.state(), SupervisorState::Running);
    assert_eq!(supervisor.pid(), Some(4000));
    assert_eq!(supervisor.generation(), Some(1));
    let spawn = control.last_spawn().unwrap();
    assert_eq!(spawn.program, "visualia");
    assert_eq!(spawn.generation, 1);
    assert_eq!(
        spawn.args,
        vec!["-m", "models/whisper-base.gguf", "-l", "auto"]
    );
    assert_eq!(supervisor.stats().spawns, 1);
}

#[test]
fn start_is_rejected_unless_stopped() {
    let (mut supervisor, control, _rx) = fake_supervisor(Duration::from_millis(500));
    let now = Instant::now();
    supervisor.start(&config("base", "auto"), now).unwrap();
    let err = supervisor.start(&config("small", "auto"), now).unwrap_err();
    assert!(matches!(
        err,
        StartError::NotStopped(SupervisorState::Running)
    ));

    supervisor.stop(now);
    let err = supervisor.start(&config("small", "auto"), now).unwrap_err();
    assert!(matches!(
        err,
        StartError::NotStopped(SupervisorState::Stopping)
    ));
    assert_eq!(control.spawn_count(), 1);
}

#[test]
fn stop_is_idempotent() {
    let (mut supervisor, control, _rx) = fake_supervisor(Duration::from_millis(500));
    let now = Instant::now();
    supervisor.stop(now);
    assert!(control.signals().is_empty());

    supervisor.start(&config("base", "auto"), now).unwrap();
    supervisor.stop(now);
    supervisor.stop(now);
    assert_eq!(supervisor.state(), SupervisorState::Stopping);
    assert_eq!(control.signals(), vec![(4000, Signal::Term)]);
}

#[test]
fn grace_period_escalates_to_kill_once() {
    let grace = Duration::from_millis(500);
    let (mut supervisor, control, _rx) = fake_supervisor(grace);
    let t0 = Instant::now();
    supervisor.start(&config("base", "auto"), t0).unwrap();
    assert_eq!(supervisor.next_deadline(), None);

    supervisor.stop(t0);
    assert_eq!(supervisor.next_deadline(), Some(t0 + grace));
    assert!(supervisor
        .poll_timers(t0 + grace - Duration::from_millis(1))
        .is_empty());
    assert_eq!(control.signals(), vec![(4000, Signal::Term)]);

    assert!(supervisor.poll_timers(t0 + grace).is_empty());
    assert!(supervisor
        .poll_timers(t0 + grace + Duration::from_millis(10))
        .is_empty());
    assert_eq!(
        control.signals(),
        vec![(4000, Signal::Term), (4000, Signal::Kill)]
    );
    assert_eq!(supervisor.stats().forced_kills, 1);
    assert_eq!(supervisor.next_deadline(), Some(t0 + grace * 2));
}

#[test]
fn unreported_exit_after_kill_releases_the_handle() {
    let grace = Duration::from_millis(500);
    let (mut supervisor, control, rx) = fake_supervisor(grace);
    let t0 = Instant::now();
    supervisor.start(&config("base", "auto"), t0).unwrap();
    supervisor.stop(t0);
    supervisor.poll_timers(t0 + grace);

    let events = supervisor.poll_timers(t0 + grace * 2);
    assert_eq!(
        events,
        vec![SupervisorEvent::Exited {
            code: None,
            signal: None,
            crashed: false,
        }]
    );
    assert_eq!(supervisor.state(), SupervisorState::Stopped);
    assert_eq!(supervisor.pid(), None);
    assert_eq!(supervisor.next_deadline(), None);
    assert_eq!(supervisor.stats().abandoned, 1);

    // A late report from the released instance changes nothing.
    control.exit_last(None, Some(9));
    assert!(drain(&mut supervisor, &rx).is_empty());
    assert_eq!(supervisor.stats().stale_messages, 1);

    supervisor.start(&config("small", "auto"), t0 + grace * 2).unwrap();
    assert_eq!(supervisor.state(), SupervisorState::Running);
    assert_eq!(control.signals().len(), 2);
}

#[test]
fn reaped_engine_is_not_signalled_again() {
    let grace = Duration::from_millis(500);
    let (mut supervisor, control, rx) = fake_supervisor(grace);
    let t0 = Instant::now();
    supervisor.start(&config("base", "auto"), t0).unwrap();
    supervisor.stop(t0);
    control.last_sink().unwrap().send(ProcessOutput::Reaped {
        code: None,
        signal: Some(libc::SIGTERM),
    });
    assert!(drain(&mut supervisor, &rx).is_empty());
    assert_eq!(supervisor.state(), SupervisorState::Stopping);

    let deadline = supervisor.next_deadline().unwrap();
    let events = supervisor.poll_timers(deadline);
    assert_eq!(
        events,
        vec![SupervisorEvent::Exited {
            code: None,
            signal: Some(libc::SIGTERM),
            crashed: false,
        }]
    );
    assert_eq!(control.signals(), vec![(4000, Signal::Term)]);
    assert_eq!(supervisor.stats().forced_kills, 0);
    assert_eq!(supervisor.state(), SupervisorState::Stopped);
}

#[test]
fn reaped_engine_with_open_pipes_is_reported_as_crash() {
    let grace = Duration::from_millis(500);
    let (mut supervisor, control, rx) = fake_supervisor(grace);
    let t0 = Instant::now();
    supervisor.start(&config("base", "auto"), t0).unwrap();
    control.last_sink().unwrap().send(ProcessOutput::Reaped {
        code: Some(1),
        signal: None,
    });
    assert!(drain(&mut supervisor, &rx).is_empty());
    assert_eq!(supervisor.state(), SupervisorState::Running);

    let deadline = supervisor.next_deadline().unwrap();
    assert_eq!(
        supervisor.poll_timers(deadline),
        vec![SupervisorEvent::Exited {
            code: Some(1),
            signal: None,
            crashed: true,
        }]
    );
    assert!(control.signals().is_empty());
}

#[test]
fn dropping_a_reaped_supervisor_sends_nothing() {
    let (mut supervisor, control, rx) = fake_supervisor(Duration::from_millis(500));
    supervisor
        .start(&config("base", "auto"), Instant::now())
        .unwrap();
    control.last_sink().unwrap().send(ProcessOutput::Reaped {
        code: Some(0),
        signal: None,
    });
    drain(&mut supervisor, &rx);
    drop(supervisor);
    assert!(control.signals().is_empty());
}

#[test]
fn stdout_lines_are_decoded_across_chunks() {
    let (mut supervisor, control, rx) = fake_supervisor(Duration::from_millis(500));
    supervisor
        .start(&config("base", "auto"), Instant::now())
        .unwrap();
    let sink = control.last_sink().unwrap();

    sink.send(ProcessOutput::Stdout(
        b"{\"type\":\"transcription\",\"data\":{\"text\":\"hel".to_vec(),
    ));
    assert!(drain(&mut supervisor, &rx).is_empty());

    sink.send(ProcessOutput::Stdout(
        b"lo\",\"timestamp\":7}}\n{\"type\":\"status\",\"data\":{\"message\":\"ok\"}}\n".to_vec(),
    ));
    assert_eq!(
        drain(&mut supervisor, &rx),
        vec![
            SupervisorEvent::Engine(EngineEvent::Transcription {
                text: "hello".to_string(),
                timestamp: Some(7),
            }),
            status("ok"),
        ]
    );
}

#[test]
fn undecodable_lines_are_dropped_and_counted() {
    let (mut supervisor, control, rx) = fake_supervisor(Duration::from_millis(500));
    supervisor
        .start(&config("base", "auto"), Instant::now())
        .unwrap();
    let sink = control.last_sink().unwrap();
    sink.send(ProcessOutput::Stdout(
        b"loading model...\n\n{\"type\":\"bogus\"}\n{\"type\":\"status\",\"data\":{\"message\":\"ok\"}}\n"
            .to_vec(),
    ));
    assert_eq!(drain(&mut supervisor, &rx), vec![status("ok")]);
    assert_eq!(supervisor.stats().decode_failures, 2);
}

#[test]
fn stderr_lines_become_diagnostics() {
    let (mut supervisor, control, rx) = fake_supervisor(Duration::from_millis(500));
    supervisor
        .start(&config("base", "auto"), Instant::now())
        .unwrap();
    control
        .last_sink()
        .unwrap()
        .send(ProcessOutput::Stderr("whisper_init: loading".to_string()));
    assert_eq!(
        drain(&mut supervisor, &rx),
        vec![SupervisorEvent::Diagnostic(
            "whisper_init: loading".to_string()
        )]
    );
}

#[test]
fn unsolicited_exit_is_reported_as_crash() {
    let (mut supervisor, control, rx) = fake_supervisor(Duration::from_millis(500));
    supervisor
        .start(&config("base", "auto"), Instant::now())
        .unwrap();
    control.exit_last(Some(1), None);
    assert_eq!(
        drain(&mut supervisor, &rx),
        vec![SupervisorEvent::Exited {
            code: Some(1),
            signal: None,
            crashed: true,
        }]
    );
    assert_eq!(supervisor.state(), SupervisorState::Stopped);
    assert_eq!(supervisor.pid(), None);
}

#[test]
fn requested_exit_is_not_a_crash_and_flushes_tail() {
    let (mut supervisor, control, rx) = fake_supervisor(Duration::from_millis(500));
    let now = Instant::now();
    supervisor.start(&config("base", "auto"), now).unwrap();
    let sink = control.last_sink().unwrap();
    sink.send(ProcessOutput::Stdout(
        b"{\"type\":\"status\",\"data\":{\"message\":\"bye\"}}".to_vec(),
    ));
    supervisor.stop(now);
    control.exit_last(None, Some(15));
    assert_eq!(
        drain(&mut supervisor, &rx),
        vec![
            status("bye"),
            SupervisorEvent::Exited {
                code: None,
                signal: Some(15),
                crashed: false,
            },
        ]
    );
}

#[test]
fn output_from_a_previous_instance_is_ignored() {
    let (mut supervisor, control, rx) = fake_supervisor(Duration::from_millis(500));
    let now = Instant::now();
    supervisor.start(&config("base", "auto"), now).unwrap();
    let old_sink = control.last_sink().unwrap();
    old_sink.send(ProcessOutput::Stdout(b"{\"type\":\"sta".to_vec()));
    supervisor.stop(now);
    control.exit_last(None, Some(15));
    drain(&mut supervisor, &rx);
    // The unterminated fragment was flushed (and rejected) on exit.
    assert_eq!(supervisor.stats().decode_failures, 1);

    supervisor.start(&config("small", "auto"), now).unwrap();
    assert_eq!(supervisor.generation(), Some(2));
    old_sink.send(ProcessOutput::Stdout(
        b"{\"type\":\"status\",\"data\":{\"message\":\"late\"}}\n".to_vec(),
    ));
    old_sink.send(ProcessOutput::Exited {
        code: Some(0),
        signal: None,
    });
    control.last_sink().unwrap().send(ProcessOutput::Stdout(
        b"tus\",\"data\":{\"message\":\"x\"}}\n{\"type\":\"status\",\"data\":{\"message\":\"fresh\"}}\n"
            .to_vec(),
    ));
    assert_eq!(drain(&mut supervisor, &rx), vec![status("fresh")]);
    assert_eq!(supervisor.stats().stale_messages, 2);
    assert_eq!(supervisor.state(), SupervisorState::Running);
}

#[test]
fn spawn_failure_leaves_supervisor_stopped() {
    let (mut supervisor, control, _rx) = fake_supervisor(Duration::from_millis(500));
    control.fail_next_spawns(1);
    let now = Instant::now();
    let err = supervisor.start(&config("base", "auto"), now).unwrap_err();
    assert!(matches!(err, StartError::Spawn(SpawnError::Launch { .. })));
    assert!(err.to_string().contains("visualia"));
    assert_eq!(supervisor.state(), SupervisorState::Stopped);
    assert_eq!(supervisor.stats().spawn_failures, 1);

    supervisor.start(&config("base", "auto"), now).unwrap();
    assert_eq!(supervisor.state(), SupervisorState::Running);
    assert_eq!(supervisor.generation(), Some(2));
}

#[test]
fn shutdown_waits_for_reported_exit() {
    let (mut supervisor, control, rx) = fake_supervisor(Duration::from_millis(500));
    supervisor
        .start(&config("base", "auto"), Instant::now())
        .unwrap();
    control.exit_last(Some(0), None);
    let events = supervisor.shutdown(&rx);
    assert_eq!(
        events,
        vec![SupervisorEvent::Exited {
            code: Some(0),
            signal: None,
            crashed: false,
        }]
    );
    assert_eq!(control.signals(), vec![(4000, Signal::Term)]);
}

#[test]
fn shutdown_gives_up_on_an_engine_that_never_exits() {
    let (mut supervisor, control, rx) = fake_supervisor(Duration::from_millis(100));
    supervisor
        .start(&config("base", "auto"), Instant::now())
        .unwrap();
    let started = Instant::now();
    let events = supervisor.shutdown(&rx);
    assert_eq!(
        events,
        vec![SupervisorEvent::Exited {
            code: None,
            signal: None,
            crashed: false,
        }]
    );
    assert_eq!(supervisor.state(), SupervisorState::Stopped);
    assert_eq!(supervisor.stats().abandoned, 1);
    assert_eq!(
        control.signals(),
        vec![(4000, Signal::Term), (4000, Signal::Kill)]
    );
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[test]
fn dropping_a_live_supervisor_kills_the_engine() {
    let (mut supervisor, control, _rx) = fake_supervisor(Duration::from_millis(500));
    supervisor
        .start(&config("base", "auto"), Instant::now())
        .unwrap();
    drop(supervisor);
    assert_eq!(control.signals(), vec![(4000, Signal::Kill)]);
}

#[test]
fn retryable_read_errors() {
    assert!(super::process::should_retry_read_error(&std::io::Error::from(
        std::io::ErrorKind::Interrupted
    )));
    assert!(!super::process::should_retry_read_error(&std::io::Error::from(
        std::io::ErrorKind::BrokenPipe
    )));
}

#[cfg(unix)]
fn write_stub_script(contents: &str) -> std::path::PathBuf {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::time::{SystemTime, UNIX_EPOCH};

    let mut path = std::env::temp_dir();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    path.push(format!("visualia_stub_{nanos}.sh"));
    fs::write(&path, contents).expect("write stub");
    let mut perms = fs::metadata(&path).expect("stat stub").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).expect("chmod stub");
    path
}

#[cfg(unix)]
fn os_supervisor(
    script: &std::path::Path,
    grace: Duration,
) -> (Supervisor, Receiver<ProcessMessage>) {
    let (tx, rx) = unbounded();
    let supervisor = Supervisor::new(
        OsProcessControl,
        launch(script.to_str().unwrap()),
        tx,
        grace,
    );
    (supervisor, rx)
}

#[cfg(unix)]
fn wait_for_ready(supervisor: &mut Supervisor, rx: &Receiver<ProcessMessage>) {
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut ready = false;
    while !ready && Instant::now() < deadline {
        if let Ok(message) = rx.recv_timeout(Duration::from_millis(50)) {
            ready = supervisor.handle_message(message).contains(&status("ready"));
        }
    }
    assert!(ready, "stub engine never reported ready");
}

/// Feed messages until an exit is seen or the timeout passes.
#[cfg(unix)]
fn collect_until_exit(
    supervisor: &mut Supervisor,
    rx: &Receiver<ProcessMessage>,
) -> Vec<SupervisorEvent> {
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut events = Vec::new();
    while Instant::now() < deadline {
        let batch = match rx.recv_timeout(Duration::from_millis(50)) {
            Ok(message) => supervisor.handle_message(message),
            Err(_) => supervisor.poll_timers(Instant::now()),
        };
        let exited = batch
            .iter()
            .any(|event| matches!(event, SupervisorEvent::Exited { .. }));
        events.extend(batch);
        if exited {
            break;
        }
    }
    events
}

#[cfg(unix)]
#[test]
fn real_engine_output_precedes_its_exit() {
    let script = write_stub_script(
        "#!/bin/sh\n\
         echo '{\"type\":\"transcription\",\"data\":{\"text\":\"hi\",\"timestamp\":1}}'\n\
         echo 'model loaded' 1>&2\n\
         exit 3\n",
    );
    let (mut supervisor, rx) = os_supervisor(&script, Duration::from_millis(500));
    supervisor
        .start(&config("base", "auto"), Instant::now())
        .unwrap();
    let events = collect_until_exit(&mut supervisor, &rx);
    let _ = std::fs::remove_file(&script);

    let transcription = events
        .iter()
        .position(|event| matches!(event, SupervisorEvent::Engine(EngineEvent::Transcription { .. })))
        .expect("transcription event");
    let exit = events
        .iter()
        .position(|event| matches!(event, SupervisorEvent::Exited { .. }))
        .expect("exit event");
    assert!(transcription < exit);
    assert!(events.contains(&SupervisorEvent::Diagnostic("model loaded".to_string())));
    assert_eq!(
        events[exit],
        SupervisorEvent::Exited {
            code: Some(3),
            signal: None,
            crashed: true,
        }
    );
}

#[cfg(unix)]
#[test]
fn real_engine_stops_on_sigterm() {
    let script = write_stub_script("#!/bin/sh\nexec sleep 30\n");
    let (mut supervisor, rx) = os_supervisor(&script, Duration::from_millis(2000));
    supervisor
        .start(&config("base", "auto"), Instant::now())
        .unwrap();
    supervisor.stop(Instant::now());
    let events = collect_until_exit(&mut supervisor, &rx);
    let _ = std::fs::remove_file(&script);
    assert_eq!(
        events.last(),
        Some(&SupervisorEvent::Exited {
            code: None,
            signal: Some(libc::SIGTERM),
            crashed: false,
        })
    );
    assert_eq!(supervisor.stats().forced_kills, 0);
}

#[cfg(unix)]
#[test]
fn real_engine_ignoring_sigterm_is_killed() {
    let script = write_stub_script(
        "#!/bin/sh\n\
         trap '' TERM\n\
         echo '{\"type\":\"status\",\"data\":{\"message\":\"ready\"}}'\n\
         while true; do sleep 0.05; done\n",
    );
    let (mut supervisor, rx) = os_supervisor(&script, Duration::from_millis(200));
    supervisor
        .start(&config("base", "auto"), Instant::now())
        .unwrap();

    wait_for_ready(&mut supervisor, &rx);

    let events = supervisor.shutdown(&rx);
    let _ = std::fs::remove_file(&script);
    assert_eq!(supervisor.state(), SupervisorState::Stopped);
    assert_eq!(supervisor.stats().forced_kills, 1);
    assert!(events.contains(&SupervisorEvent::Exited {
        code: None,
        signal: Some(libc::SIGKILL),
        crashed: false,
    }));
}

#[cfg(unix)]
#[test]
fn real_engine_helpers_are_stopped_with_it() {
    let script = write_stub_script(
        "#!/bin/sh\n\
         sleep 30 &\n\
         echo '{\"type\":\"status\",\"data\":{\"message\":\"ready\"}}'\n\
         while true; do sleep 0.05; done\n",
    );
    let (mut supervisor, rx) = os_supervisor(&script, Duration::from_millis(200));
    supervisor
        .start(&config("base", "auto"), Instant::now())
        .unwrap();
    wait_for_ready(&mut supervisor, &rx);

    let stop_at = Instant::now();
    supervisor.stop(stop_at);
    let events = collect_until_exit(&mut supervisor, &rx);
    let _ = std::fs::remove_file(&script);
    assert_eq!(supervisor.state(), SupervisorState::Stopped);
    assert!(stop_at.elapsed() < Duration::from_secs(3));
    assert_eq!(
        events.last(),
        Some(&SupervisorEvent::Exited {
            code: None,
            signal: Some(libc::SIGTERM),
            crashed: false,
        })
    );
    assert_eq!(supervisor.stats().abandoned, 0);
}

#[cfg(unix)]
#[test]
fn helper_holding_pipes_does_not_block_stop() {
    let script = write_stub_script(
        "#!/bin/sh\n\
         (trap '' TERM; echo '{\"type\":\"status\",\"data\":{\"message\":\"ready\"}}'; exec sleep 3) &\n\
         while true; do sleep 0.05; done\n",
    );
    let (mut supervisor, rx) = os_supervisor(&script, Duration::from_millis(200));
    supervisor
        .start(&config("base", "auto"), Instant::now())
        .unwrap();
    wait_for_ready(&mut supervisor, &rx);

    let stop_at = Instant::now();
    supervisor.stop(stop_at);
    let events = collect_until_exit(&mut supervisor, &rx);
    let _ = std::fs::remove_file(&script);
    assert_eq!(supervisor.state(), SupervisorState::Stopped);
    assert!(stop_at.elapsed() < Duration::from_secs(2));
    assert_eq!(
        events.last(),
        Some(&SupervisorEvent::Exited {
            code: None,
            signal: Some(libc::SIGTERM),
            crashed: false,
        })
    );
    assert_eq!(supervisor.stats().abandoned, 1);
    assert_eq!(supervisor.stats().forced_kills, 0);
}

#[test]
fn missing_engine_binary_is_a_spawn_error() {
    let (tx, _rx) = unbounded();
    let mut supervisor = Supervisor::new(
        OsProcessControl,
        launch("/nonexistent/visualia-engine"),
        tx,
        Duration::from_millis(500),
    );
    let err = supervisor
        .start(&config("base", "auto"), Instant::now())
        .unwrap_err();
    assert!(matches!(err, StartError::Spawn(SpawnError::Launch { .. })));
    assert_eq!(supervisor.state(), SupervisorState::Stopped);
}

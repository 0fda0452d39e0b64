use std::io;
use std::thread;
use std::time::{Duration, Instant};
use proctrail::{Config, Error, Event, Handle, Kind, ProcessId};
use proctrail::backend::{Feeder, Replay};
use proctrail::data::Status;
use proctrail::raw::Raw;

fn open(config: Config) -> (Handle, Feeder) {
    let (replay, feeder) = Replay::new().unwrap();
    let handle = Handle::with_backend(config, Box::new(replay)).unwrap();
    (handle, feeder)
}

fn quiet() -> Config {
    Config { bootstrap: false, ..Config::default() }
}

fn names(events: &[Event]) -> Vec<&'static str> {
    events.iter().map(|e| e.kind.name()).collect()
}

#[test]
fn should_follow_fork_exec_exit() {
    let (mut handle, feeder) = open(quiet());

    feeder.extend(vec![
        Raw::fork(100, 10, 1),
        Raw::exec(100, 10, "/bin/ls", &["ls", "-l"]),
    ]);
    let mut events = handle.get_events().unwrap();

    let process = handle.lookup(100).unwrap().unwrap();
    assert_eq!(process.exe.as_deref(), Some("/bin/ls"));
    assert_eq!(process.args, vec!["ls", "-l"]);

    feeder.push(Raw::exit(100, 10, 0));
    events.extend(handle.get_events().unwrap());

    assert_eq!(names(&events), vec!["fork", "exec", "exit"]);
    assert!(events.iter().all(|e| e.id == Some(ProcessId::new(100, 10))));
    assert_eq!(events[1].kind, Kind::Exec {
        path: "/bin/ls".into(),
        args: vec!["ls".into(), "-l".into()],
    });
    assert_eq!(events[2].kind, Kind::Exit { code: 0, signal: None });
}

#[test]
fn should_drop_oldest_past_capacity() {
    let capacity = 4;
    let (mut handle, feeder) = open(Config { capacity, ..quiet() });

    feeder.extend((0..=capacity as u32).map(|n| Raw::fork(100 + n, 10, 0)));
    let events = handle.get_events().unwrap();

    assert_eq!(events.len(), capacity);
    assert_eq!(handle.stats().dropped, 1);

    let pids = events.iter().map(|e| e.id.unwrap().pid).collect::<Vec<_>>();
    assert_eq!(pids, vec![101, 102, 103, 104]);
    assert_eq!(events[0].seq, 1);
}

#[test]
fn should_carry_dropped_process_to_next_event() {
    let (mut handle, feeder) = open(Config { capacity: 2, ..quiet() });

    feeder.extend(vec![
        Raw::fork(100, 10, 0),
        Raw::fork(200, 20, 0),
        Raw::exec(100, 10, "/bin/ls", &["ls"]),
    ]);
    let events = handle.get_events().unwrap();

    assert_eq!(names(&events), vec!["fork", "exec"]);
    let carried = events[1].process.as_ref().unwrap();
    assert_eq!(carried.id, ProcessId::new(100, 10));
}

#[test]
fn should_return_promptly_from_zero_timeout() {
    let (mut handle, feeder) = open(quiet());

    let start = Instant::now();
    handle.block(Some(Duration::ZERO)).unwrap();

    feeder.push(Raw::fork(100, 10, 0));
    handle.block(Some(Duration::ZERO)).unwrap();

    assert!(start.elapsed() < Duration::from_secs(1));
}

#[test]
fn should_wake_when_notifications_arrive() {
    let (mut handle, feeder) = open(quiet());

    let producer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        feeder.push(Raw::fork(100, 10, 0));
    });

    let start = Instant::now();
    handle.block(Some(Duration::from_secs(10))).unwrap();
    producer.join().unwrap();

    assert!(start.elapsed() < Duration::from_secs(10));
    assert_eq!(names(&handle.get_events().unwrap()), vec!["fork"]);
}

#[test]
fn should_close_idempotently() {
    let (mut handle, _feeder) = open(quiet());

    handle.close();
    handle.close();

    assert!(matches!(handle.get_events(), Err(Error::InvalidState)));
    assert!(matches!(handle.block(Some(Duration::ZERO)), Err(Error::InvalidState)));
    assert!(matches!(handle.lookup(1), Err(Error::InvalidState)));
}

#[test]
fn should_not_find_unseen_pid() {
    let (mut handle, feeder) = open(quiet());
    feeder.push(Raw::fork(100, 10, 0));
    handle.get_events().unwrap();

    assert!(handle.lookup(4242).unwrap().is_none());
}

#[test]
fn should_find_running_processes_after_bootstrap() {
    let (mut handle, _feeder) = open(Config::default());

    let me = handle.lookup(std::process::id()).unwrap().unwrap();
    assert_eq!(me.id.pid, std::process::id());
    assert!(me.is_alive());

    assert!(handle.get_events().unwrap().is_empty());
}

#[test]
fn should_forget_exited_pid_after_grace() {
    let (mut handle, feeder) = open(Config { exit_grace: Duration::ZERO, ..quiet() });
    feeder.extend(vec![Raw::fork(100, 10, 0), Raw::exit(100, 10, 0)]);
    handle.get_events().unwrap();

    assert!(handle.lookup(100).unwrap().is_none());
}

#[test]
fn should_keep_exited_pid_within_grace() {
    let (mut handle, feeder) = open(Config { exit_grace: Duration::from_secs(60), ..quiet() });
    feeder.extend(vec![Raw::fork(100, 10, 0), Raw::exit(100, 10, 3)]);
    handle.get_events().unwrap();

    let process = handle.lookup(100).unwrap().unwrap();
    assert_eq!(process.status, Status::Dead);
    assert_eq!(process.exit.map(|e| e.code), Some(3));
}

#[test]
fn should_report_kernel_loss_in_stream() {
    let (mut handle, feeder) = open(Config { kinds: "exit".parse().unwrap(), ..quiet() });
    feeder.extend(vec![Raw::lost(12), Raw::fork(100, 10, 0)]);

    let events = handle.get_events().unwrap();
    assert_eq!(names(&events), vec!["lost"]);
    assert_eq!(events[0].kind, Kind::Lost { count: 12 });
    assert_eq!(handle.stats().counters.lost, 12);
}

#[test]
fn should_stay_usable_after_backend_error() {
    let (mut handle, feeder) = open(quiet());
    feeder.fail(io::ErrorKind::Other);
    feeder.push(Raw::fork(100, 10, 0));

    let err = handle.get_events().unwrap_err();
    assert!(matches!(err, Error::BackendIo(_)));
    assert!(err.is_transient());

    assert_eq!(names(&handle.get_events().unwrap()), vec!["fork"]);
}

#[test]
fn should_serve_lookups_from_other_threads() {
    let (mut handle, feeder) = open(quiet());
    feeder.push(Raw::exec(100, 10, "/bin/sh", &["sh"]));
    handle.get_events().unwrap();

    let tracker = handle.tracker();
    let found = thread::spawn(move || tracker.get(100)).join().unwrap();

    assert_eq!(found.and_then(|p| p.exe), Some("/bin/sh".to_owned()));
}

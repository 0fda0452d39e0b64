use std::collections::VecDeque;
use std::time::{Duration, Instant};
use log::{debug, info, warn};
use serde::Serialize;
use crate::aggregate::{Aggregator, Counters};
use crate::backend::{self, Backend};
use crate::cache::Cache;
use crate::clock;
use crate::config::Config;
use crate::data::{Process, ProcessId};
use crate::error::{Error, Result};
use crate::event::Event;
use crate::queue::EventQueue;
use crate::raw::Raw;
use crate::scan;
use crate::track::Tracker;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum State {
    Active,
    Closed,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct Stats {
    pub counters:  Counters,
    pub pushed:    u64,
    pub popped:    u64,
    pub dropped:   u64,
    pub processes: usize,
    pub live:      usize,
    pub over:      u64,
    pub replaced:  u64,
}

// A consumer's view of process lifecycle activity: one backend session, one
// process cache and one event queue, all driven from the caller's thread.
pub struct Handle {
    config:     Config,
    state:      State,
    backend:    Option<Box<dyn Backend>>,
    tracker:    Tracker,
    aggregator: Aggregator,
    queue:      EventQueue,
    backlog:    VecDeque<Raw>,
    snapshot:   Instant,
}

impl Handle {
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;
        let backend = backend::open(&config)?;
        Self::with_backend(config, backend)
    }

    // Opens a handle over an already attached backend.
    pub fn with_backend(config: Config, backend: Box<dyn Backend>) -> Result<Self> {
        config.validate()?;

        info!("opened {} queue, capacity {}", backend.name(), config.capacity);

        let mut handle = Self {
            tracker:    Tracker::new(Cache::from_config(&config)),
            aggregator: Aggregator::new(&config),
            queue:      EventQueue::new(config.capacity),
            backlog:    VecDeque::new(),
            snapshot:   Instant::now(),
            state:      State::Active,
            backend:    Some(backend),
            config:     config,
        };

        if handle.config.bootstrap {
            handle.backlog.extend(scan::bootstrap());
            handle.ingest()?;
        }

        Ok(handle)
    }

    // Drains what the backend has now into the queue, then returns every
    // queued event. Never waits.
    pub fn get_events(&mut self) -> Result<Vec<Event>> {
        self.active()?;

        let max = self.config.batch;
        let mut batch = match self.backend.as_mut() {
            Some(backend) => backend.read_batch(max)?,
            None          => Vec::new(),
        };

        batch.sort_by_key(|raw| raw.time);
        self.backlog.extend(batch);
        self.ingest()?;

        let now = Instant::now();
        self.tracker.sweep(now);

        if let Some(interval) = self.config.snapshot_interval {
            if now.duration_since(self.snapshot) >= interval {
                self.snapshot = now;
                let mut cache = self.tracker.write();
                self.aggregator.snapshot(&mut cache, &mut self.queue, clock::monotonic_ns());
            }
        }

        Ok(self.queue.pop_all(self.config.capacity))
    }

    pub fn lookup(&self, pid: u32) -> Result<Option<Process>> {
        self.active()?;
        Ok(self.tracker.get(pid))
    }

    pub fn lookup_id(&self, id: &ProcessId) -> Result<Option<Process>> {
        self.active()?;
        Ok(self.tracker.get_id(id))
    }

    // Waits for the backend to have notifications ready or for `timeout`
    // (the configured default when `None`). Timing out is not an error.
    pub fn block(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.active()?;

        if !self.queue.is_empty() || !self.backlog.is_empty() {
            return Ok(());
        }

        let timeout = timeout.unwrap_or(self.config.block_timeout);
        let fd = match self.backend.as_ref() {
            Some(backend) if backend.has_pending() => return Ok(()),
            Some(backend)                          => backend.fd(),
            None                                   => return Ok(()),
        };

        backend::wait(fd, timeout)?;

        Ok(())
    }

    pub fn close(&mut self) {
        if self.state == State::Closed {
            return;
        }

        self.state = State::Closed;

        if let Some(mut backend) = self.backend.take() {
            match backend.close() {
                Ok(()) => debug!("released {} backend", backend.name()),
                Err(e) => warn!("failed to release {} backend: {}", backend.name(), e),
            }
        }

        self.backlog.clear();
        self.queue.clear();
        self.tracker.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.state == State::Closed
    }

    // Shared cache view for lookups from other threads.
    pub fn tracker(&self) -> Tracker {
        self.tracker.clone()
    }

    pub fn stats(&self) -> Stats {
        let (processes, live, over, replaced) = self.tracker.stats();
        Stats {
            counters:  self.aggregator.counters(),
            pushed:    self.queue.pushed(),
            popped:    self.queue.popped(),
            dropped:   self.queue.dropped(),
            processes: processes,
            live:      live,
            over:      over,
            replaced:  replaced,
        }
    }

    fn active(&self) -> Result<()> {
        match self.state {
            State::Active => Ok(()),
            State::Closed => Err(Error::InvalidState),
        }
    }

    // Notifications stay in the backlog until room for them is claimed, so
    // an allocation failure loses nothing and the next call resumes.
    fn ingest(&mut self) -> Result<()> {
        let mut cache = self.tracker.write();
        let now = Instant::now();

        while !self.backlog.is_empty() {
            self.aggregator.ready(&mut cache, &mut self.queue)?;
            if let Some(raw) = self.backlog.pop_front() {
                self.aggregator.process(raw, &mut cache, &mut self.queue, now);
            }
        }

        Ok(())
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Feeder, Replay};

    fn handle(config: Config) -> (Handle, Feeder) {
        let (replay, feeder) = Replay::new().unwrap();
        let config = Config { bootstrap: false, ..config };
        (Handle::with_backend(config, Box::new(replay)).unwrap(), feeder)
    }

    #[test]
    fn should_sort_batch_by_time() {
        let (mut handle, feeder) = handle(Config::default());
        feeder.extend(vec![
            Raw::exec(100, 10, "/bin/ls", &["ls"]).at(2),
            Raw::fork(100, 10, 1).at(1),
        ]);

        let events = handle.get_events().unwrap();
        let names = events.iter().map(|e| e.kind.name()).collect::<Vec<_>>();
        assert_eq!(names, vec!["fork", "exec"]);
    }

    #[test]
    fn should_report_stats() {
        let (mut handle, feeder) = handle(Config { capacity: 1, ..Config::default() });
        feeder.extend(vec![Raw::fork(100, 10, 0), Raw::fork(101, 11, 0)]);

        assert_eq!(handle.get_events().unwrap().len(), 1);

        let stats = handle.stats();
        assert_eq!(stats.pushed, 2);
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.counters.received, 2);
        assert_eq!(stats.live, 2);
    }

    #[test]
    fn should_emit_periodic_snapshots() {
        let (mut handle, feeder) = handle(Config {
            snapshot_interval: Some(Duration::from_millis(1)),
            kinds:             crate::event::Kinds::NONE,
            ..Config::default()
        });
        feeder.push(Raw::fork(100, 10, 1));
        handle.get_events().unwrap();

        std::thread::sleep(Duration::from_millis(5));
        let events = handle.get_events().unwrap();
        assert!(events.iter().any(|e| e.kind.name() == "snapshot" && e.id == Some(ProcessId::new(100, 10))));
    }

    #[test]
    fn should_close_backend_once() {
        let (mut handle, feeder) = handle(Config::default());
        handle.close();
        handle.close();

        assert!(feeder.is_closed());
        assert!(handle.is_closed());
        assert!(matches!(handle.lookup(1), Err(Error::InvalidState)));
    }

    struct Held {
        rx:  std::os::unix::net::UnixStream,
        _tx: std::os::unix::net::UnixStream,
    }

    impl Backend for Held {
        fn name(&self) -> &'static str {
            "held"
        }

        fn read_batch(&mut self, _max: usize) -> Result<Vec<Raw>> {
            Ok(vec![Raw::fork(100, 10, 0)])
        }

        fn fd(&self) -> std::os::unix::io::RawFd {
            use std::os::unix::io::AsRawFd;
            self.rx.as_raw_fd()
        }

        fn has_pending(&self) -> bool {
            true
        }

        fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn should_not_wait_on_held_notifications() {
        let (rx, _tx) = std::os::unix::net::UnixStream::pair().unwrap();
        let config = Config { bootstrap: false, ..Config::default() };
        let mut handle = Handle::with_backend(config, Box::new(Held { rx, _tx })).unwrap();

        let start = Instant::now();
        handle.block(Some(Duration::from_secs(10))).unwrap();

        assert!(start.elapsed() < Duration::from_secs(5));
    }
}

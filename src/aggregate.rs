use std::time::Instant;
use log::{trace, warn};
use serde::Serialize;
use crate::cache::{Cache, Entry};
use crate::clock;
use crate::config::Config;
use crate::data::{Exit, ProcessId};
use crate::error::Result;
use crate::event::{Event, Kind, Kinds};
use crate::queue::EventQueue;
use crate::raw::{Raw, RawKind, Task};

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct Counters {
    pub received:   u64,
    pub malformed:  u64,
    pub filtered:   u64,
    pub masked:     u64,
    pub reconciled: u64,
    pub lost:       u64,
}

// Turns raw notifications into the event stream, one at a time and in the
// order received, keeping the cache in step with what has been emitted.
#[derive(Debug)]
pub struct Aggregator {
    kinds:    Kinds,
    threads:  bool,
    counters: Counters,
}

impl Aggregator {
    pub fn new(config: &Config) -> Self {
        Self {
            kinds:    config.kinds,
            threads:  config.threads,
            counters: Counters::default(),
        }
    }

    pub fn counters(&self) -> Counters {
        self.counters
    }

    // Claims the room one notification can need, so that `process` itself
    // cannot fail halfway through updating the cache and queue.
    pub fn ready(&self, cache: &mut Cache, queue: &mut EventQueue) -> Result<()> {
        cache.reserve()?;
        queue.reserve()
    }

    pub fn process(&mut self, raw: Raw, cache: &mut Cache, queue: &mut EventQueue, now: Instant) {
        trace!("{:?}", raw);

        self.counters.received += 1;

        if raw.is_thread() && !self.threads {
            self.counters.filtered += 1;
            return;
        }

        let Raw { time, pid, start, kind, .. } = raw;

        match kind {
            RawKind::Malformed { reason } => self.malformed(&reason),
            RawKind::Lost { count } => {
                self.counters.lost += count;
                queue.push(Event::lost(time, count));
            }
            _ if pid == 0 => self.malformed("notification without pid"),
            RawKind::Snapshot { ppid, parent_start, task } => {
                let start = match start {
                    Some(start) => start,
                    None        => return self.malformed("snapshot without start time"),
                };
                let parent = parent(cache, ppid, parent_start);
                cache.upsert(ProcessId::new(pid, start), parent, task, now);
            }
            RawKind::Fork { ppid, parent_start, task } => {
                let start = start.unwrap_or_else(|| clock::ns_to_ticks(time));
                self.fork(cache, queue, time, ProcessId::new(pid, start), ppid, parent_start, task, now);
            }
            RawKind::Exec { path, task } => {
                let id = cache.resolve(pid, start).unwrap_or_else(|| unseen(pid, start));
                self.exec(cache, queue, time, id, path, task, now);
            }
            RawKind::Exit { code, signal } => {
                let id = cache.resolve(pid, start).unwrap_or_else(|| unseen(pid, start));
                self.exit(cache, queue, Exit::new(code, signal, time), id, now);
            }
        }
    }

    pub fn snapshot(&mut self, cache: &mut Cache, queue: &mut EventQueue, time: u64) {
        let processes = cache.processes().cloned().collect::<Vec<_>>();

        for process in processes {
            let id = process.id;
            queue.push(Event::new(time, id, Kind::Snapshot).with_process(process));
            if let Some(entry) = cache.entry_mut(&id) {
                entry.announced = true;
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn fork(
        &mut self,
        cache:        &mut Cache,
        queue:        &mut EventQueue,
        time:         u64,
        id:           ProcessId,
        ppid:         u32,
        parent_start: Option<u64>,
        task:         Task,
        now:          Instant,
    ) {
        if let Some(entry) = cache.entry(&id) {
            let alive    = entry.process.is_alive();
            let orphaned = entry.process.parent.is_none();

            if entry.forked || entry.announced || !alive {
                self.counters.reconciled += 1;
                if alive {
                    let adopted = match orphaned {
                        true  => parent(cache, ppid, parent_start),
                        false => None,
                    };
                    cache.upsert(id, adopted, task, now);
                }
                return;
            }
        }

        let parent = parent(cache, ppid, parent_start);
        let entry  = cache.upsert(id, parent, task, now);
        entry.forked = true;

        self.emit(queue, entry, Event::new(time, id, Kind::Fork { parent }), true);
    }

    #[allow(clippy::too_many_arguments)]
    fn exec(
        &mut self,
        cache:    &mut Cache,
        queue:    &mut EventQueue,
        time:     u64,
        id:       ProcessId,
        path:     String,
        mut task: Task,
        now:      Instant,
    ) {
        if cache.entry(&id).map_or(false, |e| !e.process.is_alive()) {
            self.counters.reconciled += 1;
            return;
        }

        if task.exe.is_none() && !path.is_empty() {
            task.exe = Some(path.clone());
        }

        let entry = cache.upsert(id, None, task, now);
        let args  = entry.process.args.clone();

        self.emit(queue, entry, Event::new(time, id, Kind::Exec { path, args }), false);
    }

    fn exit(&mut self, cache: &mut Cache, queue: &mut EventQueue, exit: Exit, id: ProcessId, now: Instant) {
        match cache.entry(&id) {
            Some(entry) if !entry.process.is_alive() => {
                self.counters.reconciled += 1;
                return;
            }
            Some(_) => (),
            None    => {
                cache.upsert(id, None, Task::default(), now);
            }
        }

        cache.mark_exited(&id, Some(exit), now);

        if let Some(entry) = cache.entry_mut(&id) {
            let kind = Kind::Exit { code: exit.code, signal: exit.signal };
            self.emit(queue, entry, Event::new(exit.time, id, kind), false);
        }
    }

    // The first event queued for a process carries a copy of it, so a
    // consumer never sees a process it knows nothing about.
    fn emit(&mut self, queue: &mut EventQueue, entry: &mut Entry, event: Event, embed: bool) {
        if !self.kinds.allows(&event.kind) {
            self.counters.masked += 1;
            return;
        }

        let event = match embed || !entry.announced {
            true  => event.with_process(entry.process.clone()),
            false => event,
        };

        entry.announced = true;
        queue.push(event);
    }

    fn malformed(&mut self, reason: &str) {
        self.counters.malformed += 1;
        warn!("dropping malformed notification: {}", reason);
    }
}

fn parent(cache: &mut Cache, ppid: u32, start: Option<u64>) -> Option<ProcessId> {
    match ppid {
        0 => None,
        _ => Some(cache.resolve(ppid, start).unwrap_or_else(|| cache.placeholder(ppid, start))),
    }
}

// A process first seen at exec or exit whose start time was not reported.
fn unseen(pid: u32, start: Option<u64>) -> ProcessId {
    ProcessId::new(pid, start.unwrap_or(0))
}

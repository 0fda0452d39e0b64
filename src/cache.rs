use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use log::{debug, trace};
use crate::config::Config;
use crate::data::{Exit, Process, ProcessId, Status};
use crate::error::{Error, Result};
use crate::raw::Task;

#[derive(Clone, Debug)]
pub struct Entry {
    pub process:   Process,
    pub forked:    bool,
    pub announced: bool,
}

// Processes keyed by pid and start time. At most one entry per pid is live;
// exited entries linger for the grace window, oldest evicted first.
#[derive(Debug)]
pub struct Cache {
    table:      HashMap<ProcessId, Entry>,
    live:       HashMap<u32, ProcessId>,
    exited:     VecDeque<(ProcessId, Instant)>,
    grace:      Duration,
    retain:     usize,
    limit:      usize,
    generation: u64,
    over:       u64,
    replaced:   u64,
}

impl Cache {
    // At least the most recent exit is retained, so it can still be emitted.
    pub fn new(grace: Duration, retain: usize, limit: usize) -> Self {
        Self {
            table:      HashMap::new(),
            live:       HashMap::new(),
            exited:     VecDeque::new(),
            grace:      grace,
            retain:     retain.max(1),
            limit:      limit,
            generation: 0,
            over:       0,
            replaced:   0,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.exit_grace, config.exit_retain, config.cache_limit)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn live(&self) -> usize {
        self.live.len()
    }

    // Times the table stayed above its soft bound after evicting every exited
    // entry it could.
    pub fn over_limit(&self) -> u64 {
        self.over
    }

    // Live entries retired because a new process reused their pid before
    // their exit was seen.
    pub fn replaced(&self) -> u64 {
        self.replaced
    }

    pub fn reserve(&mut self) -> Result<()> {
        let exhausted = |_| Error::Exhausted("process cache");
        self.table.try_reserve(1).map_err(exhausted)?;
        self.live.try_reserve(1).map_err(exhausted)?;
        self.exited.try_reserve(1).map_err(exhausted)?;
        Ok(())
    }

    pub fn lookup(&self, pid: u32, now: Instant) -> Option<&Process> {
        if let Some(id) = self.live.get(&pid) {
            return self.visible(id);
        }

        let (id, _) = self.exited.iter().rev().find(|(id, at)| {
            id.pid == pid && now.saturating_duration_since(*at) < self.grace
        })?;

        self.visible(id)
    }

    pub fn lookup_id(&self, id: &ProcessId) -> Option<&Process> {
        self.visible(id)
    }

    pub fn processes(&self) -> impl Iterator<Item = &Process> {
        self.live.values().filter_map(move |id| self.visible(id))
    }

    pub fn entry(&self, id: &ProcessId) -> Option<&Entry> {
        self.table.get(id)
    }

    pub fn entry_mut(&mut self, id: &ProcessId) -> Option<&mut Entry> {
        self.table.get_mut(id)
    }

    pub fn live_id(&self, pid: u32) -> Option<ProcessId> {
        self.live.get(&pid).copied()
    }

    pub fn resolve(&self, pid: u32, start: Option<u64>) -> Option<ProcessId> {
        match start {
            Some(start) => {
                let id = ProcessId::new(pid, start);
                self.table.contains_key(&id).then(|| id)
            }
            None => self.live_id(pid),
        }
    }

    pub fn upsert(&mut self, id: ProcessId, parent: Option<ProcessId>, task: Task, now: Instant) -> &mut Entry {
        if !self.table.contains_key(&id) {
            self.claim(id, now);
        }

        self.generation += 1;
        let generation = self.generation;

        let entry = self.table.entry(id).or_insert_with(|| Entry {
            process:   Process::new(id),
            forked:    false,
            announced: false,
        });

        if parent.is_some() {
            entry.process.parent = parent;
        }
        entry.process.merge(task);
        entry.process.placeholder = false;
        entry.process.generation = generation;

        entry
    }

    // Stands in for a parent whose own notification has not arrived yet.
    pub fn placeholder(&mut self, pid: u32, start: Option<u64>) -> ProcessId {
        if let Some(id) = self.live_id(pid) {
            return id;
        }

        let id = ProcessId::new(pid, start.unwrap_or(0));
        self.live.insert(pid, id);
        self.table.entry(id).or_insert_with(|| Entry {
            process:   Process::placeholder(id),
            forked:    false,
            announced: false,
        });

        trace!("placeholder for {}", id);

        id
    }

    pub fn mark_exited(&mut self, id: &ProcessId, exit: Option<Exit>, now: Instant) -> bool {
        self.generation += 1;
        let generation = self.generation;

        let entry = match self.table.get_mut(id) {
            Some(entry) if entry.process.is_alive() => entry,
            _                                       => return false,
        };

        entry.process.status = Status::Dead;
        entry.process.exit = exit;
        entry.process.generation = generation;

        if self.live.get(&id.pid) == Some(id) {
            self.live.remove(&id.pid);
        }

        self.exited.push_back((*id, now));

        while self.exited.len() > self.retain {
            self.evict();
        }

        true
    }

    pub fn expire(&mut self, now: Instant) -> usize {
        let mut evicted = 0;

        while let Some((_, at)) = self.exited.front() {
            if now.saturating_duration_since(*at) < self.grace {
                break;
            }
            evicted += self.evict();
        }

        while self.table.len() > self.limit && !self.exited.is_empty() {
            evicted += self.evict();
        }

        if self.table.len() > self.limit {
            self.over += 1;
            debug!("process cache above soft limit: {} > {}", self.table.len(), self.limit);
        }

        evicted
    }

    pub fn clear(&mut self) {
        self.table.clear();
        self.live.clear();
        self.exited.clear();
    }

    fn visible(&self, id: &ProcessId) -> Option<&Process> {
        self.table.get(id).map(|e| &e.process).filter(|p| !p.placeholder)
    }

    fn evict(&mut self) -> usize {
        match self.exited.pop_front() {
            Some((id, _)) => match self.table.get(&id) {
                Some(e) if e.process.status == Status::Dead => {
                    self.table.remove(&id);
                    1
                }
                _ => 0,
            },
            None => 0,
        }
    }

    // Makes `id` the live process for its pid. A placeholder holding the pid
    // is renamed to `id`; any other live holder missed its exit.
    fn claim(&mut self, id: ProcessId, now: Instant) {
        let old = match self.live.insert(id.pid, id) {
            Some(old) if old != id => old,
            _                      => return,
        };

        let placeholder = self.table.get(&old).map_or(false, |e| e.process.placeholder);

        if placeholder {
            self.table.remove(&old);
            for entry in self.table.values_mut() {
                if entry.process.parent == Some(old) {
                    entry.process.parent = Some(id);
                }
            }
            trace!("placeholder {} resolved as {}", old, id);
        } else {
            self.live.insert(old.pid, old);
            self.mark_exited(&old, None, now);
            self.live.insert(id.pid, id);
            self.replaced += 1;
            debug!("{} replaced {} without an exit", id, old);
        }
    }
}

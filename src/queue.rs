use std::collections::{HashMap, VecDeque};
use log::trace;
use crate::data::{Process, ProcessId};
use crate::error::{Error, Result};
use crate::event::{Event, Kind};

// Bounded FIFO with drop-oldest overflow. Every pushed event takes the next
// sequence number, so a consumer sees drops as gaps in `seq`.
#[derive(Debug)]
pub struct EventQueue {
    events:   VecDeque<Event>,
    capacity: usize,
    seq:      u64,
    pushed:   u64,
    popped:   u64,
    dropped:  u64,
    orphans:  HashMap<ProcessId, Process>,
    order:    VecDeque<ProcessId>,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            events:   VecDeque::with_capacity(capacity.min(4096)),
            capacity: capacity.max(1),
            seq:      0,
            pushed:   0,
            popped:   0,
            dropped:  0,
            orphans:  HashMap::new(),
            order:    VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn pushed(&self) -> u64 {
        self.pushed
    }

    pub fn popped(&self) -> u64 {
        self.popped
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn reserve(&mut self) -> Result<()> {
        self.events.try_reserve(1).map_err(|_| Error::Exhausted("event queue"))
    }

    // Returns false when the oldest queued event had to be dropped.
    pub fn push(&mut self, mut event: Event) -> bool {
        let mut kept = true;

        if self.events.len() >= self.capacity {
            if let Some(old) = self.events.pop_front() {
                self.dropped += 1;
                self.salvage(old);
            }
            kept = false;
        }

        if let Some(id) = event.id {
            if event.process.is_none() {
                if let Some(process) = self.orphans.remove(&id) {
                    event.process = Some(process);
                }
            }
            if let Kind::Exit { .. } = event.kind {
                self.orphans.remove(&id);
            }
        }

        event.seq = self.seq;
        self.seq += 1;
        self.pushed += 1;
        self.events.push_back(event);

        kept
    }

    pub fn pop_all(&mut self, max: usize) -> Vec<Event> {
        let n = max.min(self.events.len());
        self.popped += n as u64;
        self.events.drain(..n).collect()
    }

    pub fn clear(&mut self) {
        self.events.clear();
        self.orphans.clear();
        self.order.clear();
    }

    // A dropped event may have carried the only copy of a process snapshot
    // the consumer has not seen yet; hand it to the next event for that id.
    fn salvage(&mut self, old: Event) {
        let (id, process) = match (old.id, old.process) {
            (Some(id), Some(process)) => (id, process),
            _                         => return,
        };

        trace!("dropped {} event for {}", old.kind.name(), id);

        let next = self.events.iter_mut().find(|e| e.id == Some(id));

        match next {
            Some(next) if next.process.is_none() => next.process = Some(process),
            Some(_)                              => (),
            None                                 => self.adopt(id, process),
        }
    }

    fn adopt(&mut self, id: ProcessId, process: Process) {
        if self.orphans.insert(id, process).is_none() {
            self.order.push_back(id);
        }

        while self.orphans.len() > self.capacity {
            match self.order.pop_front() {
                Some(id) => self.orphans.remove(&id),
                None     => break,
            };
        }

        if self.order.len() > self.capacity * 2 {
            let orphans = &self.orphans;
            self.order.retain(|id| orphans.contains_key(id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fork(pid: u32) -> Event {
        let id = ProcessId::new(pid, 1);
        Event::new(0, id, Kind::Fork { parent: None }).with_process(Process::new(id))
    }

    fn exit(pid: u32) -> Event {
        Event::new(0, ProcessId::new(pid, 1), Kind::Exit { code: 0, signal: None })
    }

    #[test]
    fn should_drop_exactly_the_oldest_on_overflow() {
        let mut queue = EventQueue::new(3);

        for pid in 1..=3 {
            assert!(queue.push(exit(pid)));
        }
        assert!(!queue.push(exit(4)));

        assert_eq!(queue.dropped(), 1);

        let events = queue.pop_all(usize::MAX);
        let pids = events.iter().map(|e| e.id.unwrap().pid).collect::<Vec<_>>();
        assert_eq!(pids, vec![2, 3, 4]);

        let seqs = events.iter().map(|e| e.seq).collect::<Vec<_>>();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn should_pop_at_most_max_in_order() {
        let mut queue = EventQueue::new(8);
        for pid in 1..=5 {
            queue.push(exit(pid));
        }

        let first = queue.pop_all(2);
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].id.unwrap().pid, 1);
        assert_eq!(queue.len(), 3);

        assert_eq!(queue.pop_all(10).len(), 3);
        assert!(queue.pop_all(10).is_empty());
        assert_eq!(queue.popped(), 5);
        assert_eq!(queue.pushed(), 5);
    }

    #[test]
    fn should_move_dropped_snapshot_to_queued_event() {
        let mut queue = EventQueue::new(2);

        queue.push(fork(1));
        queue.push(exit(1));
        queue.push(exit(2));

        let events = queue.pop_all(usize::MAX);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0].kind, Kind::Exit { .. }));
        assert_eq!(events[0].process.as_ref().unwrap().id.pid, 1);
        assert!(events[1].process.is_none());
    }

    #[test]
    fn should_attach_dropped_snapshot_to_later_push() {
        let mut queue = EventQueue::new(1);

        queue.push(fork(1));
        queue.push(exit(2));
        queue.push(exit(1));

        let events = queue.pop_all(usize::MAX);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id.unwrap().pid, 1);
        assert_eq!(events[0].process.as_ref().unwrap().id.pid, 1);
        assert_eq!(queue.dropped(), 2);
    }
}

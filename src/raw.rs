use crate::data::{Capabilities, Credentials};

// A backend-specific notification after decoding but before aggregation.
// `time` is the kernel monotonic clock in nanoseconds; `start` is the
// boot-relative start time in clock ticks when the backend knows it.
#[derive(Clone, Debug, PartialEq)]
pub struct Raw {
    pub time:  u64,
    pub pid:   u32,
    pub tid:   u32,
    pub start: Option<u64>,
    pub kind:  RawKind,
}

#[derive(Clone, Debug, PartialEq)]
pub enum RawKind {
    Snapshot {
        ppid:         u32,
        parent_start: Option<u64>,
        task:         Task,
    },
    Fork {
        ppid:         u32,
        parent_start: Option<u64>,
        task:         Task,
    },
    Exec {
        path: String,
        task: Task,
    },
    Exit {
        code:   i32,
        signal: Option<i32>,
    },
    Lost {
        count: u64,
    },
    Malformed {
        reason: String,
    },
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Task {
    pub comm:   Option<String>,
    pub exe:    Option<String>,
    pub args:   Option<Vec<String>>,
    pub cwd:    Option<String>,
    pub creds:  Option<Credentials>,
    pub caps:   Option<Capabilities>,
    pub cgroup: Option<String>,
}

impl Raw {
    pub fn new(pid: u32, start: Option<u64>, kind: RawKind) -> Self {
        Self { time: 0, pid, tid: pid, start, kind }
    }

    pub fn snapshot(pid: u32, start: u64, ppid: u32, task: Task) -> Self {
        Self::new(pid, Some(start), RawKind::Snapshot {
            ppid:         ppid,
            parent_start: None,
            task:         task,
        })
    }

    pub fn fork(pid: u32, start: u64, ppid: u32) -> Self {
        Self::new(pid, Some(start), RawKind::Fork {
            ppid:         ppid,
            parent_start: None,
            task:         Task::default(),
        })
    }

    pub fn exec(pid: u32, start: u64, path: &str, args: &[&str]) -> Self {
        let task = Task {
            exe:  Some(path.to_owned()),
            args: Some(args.iter().map(|s| s.to_string()).collect()),
            ..Task::default()
        };
        Self::new(pid, Some(start), RawKind::Exec { path: path.to_owned(), task })
    }

    pub fn exit(pid: u32, start: u64, code: i32) -> Self {
        Self::new(pid, Some(start), RawKind::Exit { code, signal: None })
    }

    pub fn lost(count: u64) -> Self {
        Self::new(0, None, RawKind::Lost { count })
    }

    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::new(0, None, RawKind::Malformed { reason: reason.into() })
    }

    pub fn at(mut self, time: u64) -> Self {
        self.time = time;
        self
    }

    pub fn thread(mut self, tid: u32) -> Self {
        self.tid = tid;
        self
    }

    pub fn is_thread(&self) -> bool {
        self.tid != 0 && self.tid != self.pid
    }
}

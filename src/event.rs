use std::fmt;
use std::str::FromStr;
use serde::Serialize;
use crate::data::{Process, ProcessId};
use crate::error::Error;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Event {
    pub seq:     u64,
    pub time:    u64,
    pub id:      Option<ProcessId>,
    pub kind:    Kind,
    pub process: Option<Process>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum Kind {
    Fork {
        parent: Option<ProcessId>,
    },
    Exec {
        path: String,
        args: Vec<String>,
    },
    Exit {
        code:   i32,
        signal: Option<i32>,
    },
    Snapshot,
    Lost {
        count: u64,
    },
}

impl Event {
    pub fn new(time: u64, id: ProcessId, kind: Kind) -> Self {
        Self { seq: 0, time, id: Some(id), kind, process: None }
    }

    pub fn lost(time: u64, count: u64) -> Self {
        Self { seq: 0, time, id: None, kind: Kind::Lost { count }, process: None }
    }

    pub fn with_process(mut self, process: Process) -> Self {
        self.process = Some(process);
        self
    }
}

impl Kind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Fork { .. } => "fork",
            Self::Exec { .. } => "exec",
            Self::Exit { .. } => "exit",
            Self::Snapshot    => "snapshot",
            Self::Lost { .. } => "lost",
        }
    }
}

// Selects which of fork, exec and exit are emitted. Snapshot and lost events
// are not subject to the mask.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Kinds(u8);

impl Kinds {
    pub const FORK: Kinds = Kinds(1 << 0);
    pub const EXEC: Kinds = Kinds(1 << 1);
    pub const EXIT: Kinds = Kinds(1 << 2);
    pub const ALL:  Kinds = Kinds(0b111);
    pub const NONE: Kinds = Kinds(0);

    pub fn contains(self, other: Kinds) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn allows(self, kind: &Kind) -> bool {
        match kind {
            Kind::Fork { .. } => self.contains(Self::FORK),
            Kind::Exec { .. } => self.contains(Self::EXEC),
            Kind::Exit { .. } => self.contains(Self::EXIT),
            Kind::Snapshot    => true,
            Kind::Lost { .. } => true,
        }
    }
}

impl Default for Kinds {
    fn default() -> Self {
        Self::ALL
    }
}

impl std::ops::BitOr for Kinds {
    type Output = Kinds;

    fn bitor(self, rhs: Kinds) -> Kinds {
        Kinds(self.0 | rhs.0)
    }
}

impl FromStr for Kinds {
    type Err = Error;

    fn from_str(arg: &str) -> Result<Self, Self::Err> {
        arg.split(',').map(str::trim).filter(|s| !s.is_empty()).try_fold(Kinds::NONE, |kinds, name| {
            Ok(kinds | match name {
                "fork" => Kinds::FORK,
                "exec" => Kinds::EXEC,
                "exit" => Kinds::EXIT,
                "all"  => Kinds::ALL,
                other  => return Err(Error::Config(format!("unknown event kind '{}'", other))),
            })
        })
    }
}

impl fmt::Display for Kinds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [(Self::FORK, "fork"), (Self::EXEC, "exec"), (Self::EXIT, "exit")];
        let names = names.iter().filter(|(k, _)| self.contains(*k)).map(|(_, n)| *n);
        write!(f, "{}", names.collect::<Vec<_>>().join(","))
    }
}

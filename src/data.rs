use std::fmt;
use serde::Serialize;
use crate::raw::Task;

#[derive(Copy, Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct ProcessId {
    pub pid:   u32,
    pub start: u64,
}

impl ProcessId {
    pub fn new(pid: u32, start: u64) -> Self {
        Self { pid, start }
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.pid, self.start)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Process {
    pub id:          ProcessId,
    pub parent:      Option<ProcessId>,
    pub comm:        String,
    pub exe:         Option<String>,
    pub args:        Vec<String>,
    pub cwd:         Option<String>,
    pub creds:       Option<Credentials>,
    pub caps:        Option<Capabilities>,
    pub cgroup:      Option<String>,
    pub container:   Option<Container>,
    pub exit:        Option<Exit>,
    pub status:      Status,
    pub generation:  u64,
    pub placeholder: bool,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct Credentials {
    pub uid:  u32,
    pub gid:  u32,
    pub euid: u32,
    pub egid: u32,
    pub suid: u32,
    pub sgid: u32,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct Capabilities {
    pub inheritable: u64,
    pub permitted:   u64,
    pub effective:   u64,
    pub bounding:    u64,
    pub ambient:     u64,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Container {
    pub id:      String,
    pub runtime: String,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Exit {
    pub code:   i32,
    pub signal: Option<i32>,
    pub time:   u64,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
pub enum Status {
    Alive,
    Dead,
}

impl Process {
    pub fn new(id: ProcessId) -> Self {
        Self {
            id:          id,
            parent:      None,
            comm:        String::new(),
            exe:         None,
            args:        Vec::new(),
            cwd:         None,
            creds:       None,
            caps:        None,
            cgroup:      None,
            container:   None,
            exit:        None,
            status:      Status::Alive,
            generation:  0,
            placeholder: false,
        }
    }

    pub fn placeholder(id: ProcessId) -> Self {
        Self { placeholder: true, ..Self::new(id) }
    }

    pub fn is_alive(&self) -> bool {
        self.status == Status::Alive
    }

    // Fields the notification does not carry are left untouched, so an exec
    // replaces path and args without resetting parent or start time.
    pub fn merge(&mut self, task: Task) {
        let Task { comm, exe, args, cwd, creds, caps, cgroup } = task;

        if let Some(comm) = comm {
            self.comm = comm;
        }
        if let Some(exe) = exe {
            self.exe = Some(exe);
        }
        if let Some(args) = args {
            self.args = args;
        }
        if cwd.is_some() {
            self.cwd = cwd;
        }
        if creds.is_some() {
            self.creds = creds;
        }
        if caps.is_some() {
            self.caps = caps;
        }
        if let Some(cgroup) = cgroup {
            self.container = Container::from_cgroup(&cgroup);
            self.cgroup = Some(cgroup);
        }
    }
}

impl Exit {
    pub fn new(code: i32, signal: Option<i32>, time: u64) -> Self {
        Self { code, signal, time }
    }

    pub fn from_wait_status(status: i32, time: u64) -> Self {
        let signal = match status & 0x7f {
            0 => None,
            n => Some(n),
        };
        Self::new((status >> 8) & 0xff, signal, time)
    }
}

impl Container {
    pub fn from_cgroup(path: &str) -> Option<Self> {
        let segments = path.split('/').filter(|s| !s.is_empty()).collect::<Vec<_>>();

        if let ["docker", id] = segments[..] {
            return container("docker", id);
        }

        let last = segments.last()?;
        let unit = last.strip_suffix(".scope").unwrap_or(last);

        for (prefix, runtime) in SCOPES {
            if let Some(id) = unit.strip_prefix(prefix) {
                return container(runtime, id);
            }
        }

        match segments.first() {
            Some(root) if root.starts_with("kubepods") => container("kubepods", last),
            _                                          => None,
        }
    }
}

const SCOPES: &[(&str, &str)] = &[
    ("docker-",          "docker"),
    ("cri-containerd-",  "containerd"),
    ("crio-",            "cri-o"),
    ("libpod-",          "podman"),
];

fn container(runtime: &str, id: &str) -> Option<Container> {
    let valid = id.len() >= 12 && id.bytes().all(|b| b.is_ascii_hexdigit());
    valid.then(|| Container {
        id:      id.to_owned(),
        runtime: runtime.to_owned(),
    })
}

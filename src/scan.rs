use std::convert::TryFrom;
use log::{debug, warn};
use procfs::process::{all_processes, Process};
use crate::clock;
use crate::data::{Capabilities, Container, Credentials};
use crate::raw::{Raw, Task};

#[derive(Clone, Debug)]
pub struct Inspect {
    pub pid:   u32,
    pub ppid:  u32,
    pub start: u64,
    pub task:  Task,
}

// Seeds the cache with every running process, as snapshot notifications.
pub fn bootstrap() -> Vec<Raw> {
    let procs = match all_processes() {
        Ok(procs) => procs,
        Err(e)    => {
            warn!("process enumeration failed: {:?}", e);
            return Vec::new();
        }
    };

    let time = clock::monotonic_ns();

    let raws = procs.iter().filter_map(read).map(|found| {
        Raw::snapshot(found.pid, found.start, found.ppid, found.task).at(time)
    }).collect::<Vec<_>>();

    debug!("enumerated {} processes", raws.len());

    raws
}

pub fn inspect(pid: u32) -> Option<Inspect> {
    let proc = Process::new(i32::try_from(pid).ok()?).ok()?;
    read(&proc)
}

pub fn start_of(pid: u32) -> Option<u64> {
    let proc = Process::new(i32::try_from(pid).ok()?).ok()?;
    Some(proc.stat.starttime as u64)
}

fn read(proc: &Process) -> Option<Inspect> {
    let stat  = &proc.stat;
    let pid   = u32::try_from(stat.pid).ok()?;
    let ppid  = u32::try_from(stat.ppid).unwrap_or(0);
    let start = stat.starttime as u64;

    let mut task = Task {
        comm: Some(stat.comm.clone()),
        exe:  proc.exe().ok().map(|p| p.to_string_lossy().into_owned()),
        args: proc.cmdline().ok(),
        cwd:  proc.cwd().ok().map(|p| p.to_string_lossy().into_owned()),
        ..Task::default()
    };

    if let Ok(status) = proc.status() {
        task.creds = Some(Credentials {
            uid:  status.ruid,
            gid:  status.rgid,
            euid: status.euid,
            egid: status.egid,
            suid: status.suid,
            sgid: status.sgid,
        });
        task.caps = Some(Capabilities {
            inheritable: status.capinh,
            permitted:   status.capprm,
            effective:   status.capeff,
            bounding:    status.capbnd.unwrap_or(0),
            ambient:     status.capamb.unwrap_or(0),
        });
    }

    if let Ok(cgroups) = proc.cgroups() {
        let paths = cgroups.into_iter().map(|c| (c.hierarchy, c.pathname)).collect::<Vec<_>>();
        let found = paths.iter().find(|(_, path)| Container::from_cgroup(path).is_some());
        let found = found.or_else(|| paths.iter().find(|(h, _)| *h == 0)).or_else(|| paths.first());
        task.cgroup = found.map(|(_, path)| path.clone());
    }

    Some(Inspect { pid, ppid, start, task })
}

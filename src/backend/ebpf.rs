use std::collections::VecDeque;
use std::convert::TryFrom;
use std::fs;
use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, RawFd};
use anyhow::{anyhow, Result};
use aya::{Bpf, BpfLoader, Btf};
use aya::maps::MapRefMut;
use aya::maps::perf::{PerfEventArray, PerfEventArrayBuffer};
use aya::programs::Program;
use aya::util::online_cpus;
use bytemuck::{try_pod_read_unaligned, Pod, Zeroable};
use bytes::BytesMut;
use log::{debug, warn};
use crate::clock;
use crate::config::Config;
use crate::data::{Credentials, Exit};
use crate::error::Error as QueueError;
use crate::raw::{Raw, RawKind, Task};
use crate::scan;
use super::{carry, failed, overflow, Backend};

const EVENTS: &str = "events";
const PAGES:  usize = 16;
const BUFS:   usize = 64;

const FORK: u32 = 1;
const EXEC: u32 = 2;
const EXIT: u32 = 3;

// Layout of the samples the probe programs write into the `events` perf
// array. Times are kernel nanoseconds; start times are boot-relative.
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[repr(C)]
struct Sample {
    kind:         u32,
    pid:          u32,
    tid:          u32,
    ppid:         u32,
    uid:          u32,
    gid:          u32,
    euid:         u32,
    egid:         u32,
    suid:         u32,
    sgid:         u32,
    start:        u64,
    parent_start: u64,
    time:         u64,
    exit_code:    i32,
    _pad:         u32,
    comm:         [u8; 16],
    path:         [u8; 256],
}

pub struct Ebpf {
    bpf:     Option<Bpf>,
    buffers: Vec<PerfEventArrayBuffer<MapRefMut>>,
    bufs:    Vec<BytesMut>,
    epoll:   Option<Epoll>,
    next:    usize,
    pending: VecDeque<Raw>,
}

impl Ebpf {
    pub fn open(config: &Config) -> Result<Self, QueueError> {
        let path = config.bytecode.as_ref().ok_or_else(|| {
            QueueError::BackendUnavailable("ebpf: no bytecode configured".into())
        })?;

        let bytecode = fs::read(path).map_err(|e| {
            QueueError::BackendUnavailable(format!("ebpf: {}: {}", path.display(), e))
        })?;

        Self::load(&bytecode).map_err(|e| failed("ebpf", e))
    }

    pub fn load(bytecode: &[u8]) -> Result<Self> {
        let btf = Btf::from_sys_fs().ok();
        let mut bpf = BpfLoader::new().btf(btf.as_ref()).load(bytecode)?;

        let epoll = Epoll::new()?;
        let mut buffers = Vec::new();

        let events = bpf.map_mut(EVENTS)?;
        let mut events = PerfEventArray::try_from(events)?;

        for cpu in online_cpus()? {
            let buf = events.open(cpu, Some(PAGES))?;
            epoll.add(buf.as_raw_fd())?;
            buffers.push(buf);
        }

        attach(&mut bpf)?;

        let bufs = (0..BUFS).map(|_| {
            BytesMut::with_capacity(mem::size_of::<Sample>() + 64)
        }).collect::<Vec<_>>();

        debug!("opened {} perf rings", buffers.len());

        Ok(Self {
            bpf:     Some(bpf),
            buffers: buffers,
            bufs:    bufs,
            epoll:   Some(epoll),
            next:    0,
            pending: VecDeque::new(),
        })
    }
}

impl Backend for Ebpf {
    fn name(&self) -> &'static str {
        "ebpf"
    }

    fn read_batch(&mut self, max: usize) -> Result<Vec<Raw>, QueueError> {
        let mut batch = self.pending.drain(..max.min(self.pending.len())).collect::<Vec<_>>();

        let rings = self.buffers.len();
        if rings == 0 {
            return Ok(batch);
        }

        let start = self.next;
        self.next = (start + 1) % rings;

        // A fair share of the batch per ring first, then whatever is left.
        for limit in [quota(max, rings), max] {
            for i in rotation(rings, start) {
                let room = max.saturating_sub(batch.len()).min(limit);
                let buffer = &mut self.buffers[i];
                let mut taken = 0;

                while taken < room && buffer.readable() {
                    let n = self.bufs.len().min(room - taken);
                    let events = buffer.read_events(&mut self.bufs[..n]).map_err(|e| {
                        io::Error::new(io::ErrorKind::Other, e)
                    })?;

                    batch.extend(lost(events.lost));

                    for buf in &self.bufs[..events.read] {
                        batch.push(match Raw::try_from(&buf[..]) {
                            Ok(raw) => enrich(raw),
                            Err(e)  => Raw::malformed(e.to_string()),
                        });
                    }

                    taken += events.read.max(1);
                }
            }
        }

        carry(&mut batch, &mut self.pending, max);

        Ok(batch)
    }

    fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    fn fd(&self) -> RawFd {
        self.epoll.as_ref().map_or(-1, |e| e.fd)
    }

    fn close(&mut self) -> Result<(), QueueError> {
        self.buffers.clear();
        self.epoll = None;
        if self.bpf.take().is_some() {
            debug!("detached ebpf programs");
        }
        Ok(())
    }
}

impl TryFrom<&[u8]> for Raw {
    type Error = anyhow::Error;

    fn try_from(buf: &[u8]) -> Result<Self, Self::Error> {
        let size = mem::size_of::<Sample>();
        let buf  = buf.get(..size).ok_or_else(|| {
            anyhow!("short sample: {} bytes", buf.len())
        })?;

        let s = try_pod_read_unaligned::<Sample>(buf).map_err(|e| {
            anyhow!("invalid sample: {:?}", e)
        })?;

        let task = Task {
            comm:  Some(cstr(&s.comm)),
            creds: Some(Credentials {
                uid:  s.uid,
                gid:  s.gid,
                euid: s.euid,
                egid: s.egid,
                suid: s.suid,
                sgid: s.sgid,
            }),
            ..Task::default()
        };

        let kind = match s.kind {
            FORK => RawKind::Fork {
                ppid:         s.ppid,
                parent_start: ticks(s.parent_start),
                task:         task,
            },
            EXEC => match cstr(&s.path) {
                path if path.is_empty() => return Err(anyhow!("exec without path")),
                path                    => RawKind::Exec { path, task },
            },
            EXIT => {
                let exit = Exit::from_wait_status(s.exit_code, s.time);
                RawKind::Exit { code: exit.code, signal: exit.signal }
            }
            n => return Err(anyhow!("invalid sample kind: {}", n)),
        };

        Ok(Raw {
            time:  s.time,
            pid:   s.pid,
            tid:   s.tid,
            start: ticks(s.start),
            kind:  kind,
        })
    }
}

// Samples carry what the probe can read cheaply; the rest comes from procfs
// while the task is still there.
fn enrich(mut raw: Raw) -> Raw {
    let pid = raw.pid;
    if let RawKind::Fork { task, .. } | RawKind::Exec { task, .. } = &mut raw.kind {
        if let Some(found) = scan::inspect(pid) {
            let Task { exe, args, cwd, caps, cgroup, .. } = found.task;
            task.exe    = task.exe.take().or(exe);
            task.args   = args;
            task.cwd    = cwd;
            task.caps   = caps;
            task.cgroup = cgroup;
        }
    }
    raw
}

fn attach(bpf: &mut Bpf) -> Result<()> {
    let names = bpf.programs().map(|p| {
        p.name().to_owned()
    }).collect::<Vec<_>>();

    for name in names {
        let prog = bpf.program_mut(&name)?;
        prog.load()?;

        debug!("loaded {}", name);

        match prog {
            Program::TracePoint(tp) => {
                tp.attach("sched", &name)?;
            }
            Program::KProbe(kprobe) => {
                let func = match name.as_str() {
                    "task-new"  => "wake_up_new_task",
                    "task-exit" => "taskstats_exit",
                    name        => name,
                };
                kprobe.attach(func, 0)?;
            }
            _ => warn!("not attaching {}", name),
        }
    }

    Ok(())
}

// Ring visiting order for one read. Each read starts one ring further on, so
// a busy ring cannot starve the others.
fn rotation(rings: usize, start: usize) -> impl Iterator<Item = usize> {
    (0..rings).map(move |i| (start + i) % rings)
}

fn quota(max: usize, rings: usize) -> usize {
    let rings = rings.max(1);
    ((max + rings - 1) / rings).max(1)
}

fn lost(count: usize) -> Option<Raw> {
    match count {
        0 => None,
        n => Some(overflow(n as u64)),
    }
}

fn ticks(ns: u64) -> Option<u64> {
    match ns {
        0  => None,
        ns => Some(clock::ns_to_ticks(ns)),
    }
}

fn cstr(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

struct Epoll {
    fd: RawFd,
}

impl Epoll {
    fn new() -> io::Result<Self> {
        match unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) } {
            -1 => Err(io::Error::last_os_error()),
            fd => Ok(Self { fd }),
        }
    }

    fn add(&self, fd: RawFd) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64:    fd as u64,
        };
        match unsafe { libc::epoll_ctl(self.fd, libc::EPOLL_CTL_ADD, fd, &mut event) } {
            -1 => Err(io::Error::last_os_error()),
            _  => Ok(()),
        }
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(kind: u32) -> Sample {
        let mut s = Sample::zeroed();
        s.kind  = kind;
        s.pid   = 100;
        s.tid   = 100;
        s.ppid  = 1;
        s.uid   = 1000;
        s.euid  = 1000;
        s.start = 1_000_000_000;
        s.time  = 5;
        s.comm[..2].copy_from_slice(b"ls");
        s
    }

    #[test]
    fn should_decode_fork_sample() {
        let s = sample(FORK);
        let raw = Raw::try_from(bytemuck::bytes_of(&s)).unwrap();

        assert_eq!(raw.pid, 100);
        assert_eq!(raw.time, 5);
        assert_eq!(raw.start, Some(clock::ticks_per_second()));

        match raw.kind {
            RawKind::Fork { ppid, parent_start, task } => {
                assert_eq!(ppid, 1);
                assert_eq!(parent_start, None);
                assert_eq!(task.comm.as_deref(), Some("ls"));
                assert_eq!(task.creds.map(|c| c.euid), Some(1000));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn should_decode_exec_path() {
        let mut s = sample(EXEC);
        s.path[..7].copy_from_slice(b"/bin/ls");

        let raw = Raw::try_from(bytemuck::bytes_of(&s)).unwrap();
        assert!(matches!(raw.kind, RawKind::Exec { ref path, .. } if path == "/bin/ls"));
    }

    #[test]
    fn should_decode_exit_status() {
        let mut s = sample(EXIT);
        s.exit_code = 2 << 8;

        let raw = Raw::try_from(bytemuck::bytes_of(&s)).unwrap();
        assert_eq!(raw.kind, RawKind::Exit { code: 2, signal: None });
    }

    #[test]
    fn should_accept_padded_unaligned_samples() {
        let s = sample(EXIT);
        let mut buf = vec![0u8; 1];
        buf.extend_from_slice(bytemuck::bytes_of(&s));
        buf.extend_from_slice(&[0u8; 4]);

        assert!(Raw::try_from(&buf[1..]).is_ok());
    }

    #[test]
    fn should_rotate_ring_order() {
        assert_eq!(rotation(3, 0).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(rotation(3, 1).collect::<Vec<_>>(), vec![1, 2, 0]);
        assert_eq!(rotation(3, 2).collect::<Vec<_>>(), vec![2, 0, 1]);
    }

    #[test]
    fn should_share_batch_between_rings() {
        assert_eq!(quota(256, 4), 64);
        assert_eq!(quota(10, 4), 3);
        assert_eq!(quota(2, 8), 1);
        assert_eq!(quota(5, 0), 5);
    }

    #[test]
    fn should_report_ring_loss() {
        assert!(lost(0).is_none());

        let raw = lost(17).unwrap();
        assert_eq!(raw.kind, RawKind::Lost { count: 17 });
        assert!(raw.time > 0);
    }

    #[test]
    fn should_reject_bad_samples() {
        let s = sample(9);
        assert!(Raw::try_from(bytemuck::bytes_of(&s)).is_err());
        assert!(Raw::try_from(&bytemuck::bytes_of(&s)[..10]).is_err());
        assert!(Raw::try_from(bytemuck::bytes_of(&sample(EXEC))).is_err());
    }
}

use std::collections::VecDeque;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use anyhow::{Context, Result};
use bytemuck::{bytes_of, try_pod_read_unaligned, Pod, Zeroable};
use log::{debug, trace};
use crate::config::Config;
use crate::data::Exit;
use crate::error::Error as QueueError;
use crate::raw::{Raw, RawKind, Task};
use crate::scan;
use super::{carry, failed, overflow, Backend};

const CN_IDX_PROC: u32 = 1;
const CN_VAL_PROC: u32 = 1;

const NLMSG_ERROR: u16 = 2;
const NLMSG_DONE:  u16 = 3;

const MCAST_LISTEN: u32 = 1;
const MCAST_IGNORE: u32 = 2;

const PROC_EVENT_FORK: u32 = 0x0000_0001;
const PROC_EVENT_EXEC: u32 = 0x0000_0002;
const PROC_EVENT_EXIT: u32 = 0x8000_0000;

const RECV_BUF: usize = 8192;

#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[repr(C)]
struct Header {
    len:   u32,
    kind:  u16,
    flags: u16,
    seq:   u32,
    pid:   u32,
}

#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[repr(C)]
struct Message {
    idx:   u32,
    val:   u32,
    seq:   u32,
    ack:   u32,
    len:   u16,
    flags: u16,
}

#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[repr(C)]
struct Control {
    header:  Header,
    message: Message,
    op:      u32,
}

#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[repr(C)]
struct ProcEvent {
    what: u32,
    cpu:  u32,
    time: u64,
}

#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[repr(C)]
struct Fork {
    parent_pid:  u32,
    parent_tgid: u32,
    child_pid:   u32,
    child_tgid:  u32,
}

#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[repr(C)]
struct Exec {
    pid:  u32,
    tgid: u32,
}

#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[repr(C)]
struct ExitEvent {
    pid:    u32,
    tgid:   u32,
    code:   u32,
    signal: u32,
}

// Kernel process-events connector: a netlink multicast socket that reports
// fork, exec and exit by pid. Everything else is read from procfs.
#[derive(Debug)]
pub struct Connector {
    fd:      RawFd,
    buf:     Vec<u8>,
    pending: VecDeque<Raw>,
}

impl Connector {
    pub fn open(_config: &Config) -> Result<Self, QueueError> {
        Self::subscribe().map_err(|e| failed("connector", e))
    }

    fn subscribe() -> Result<Self> {
        let flags = libc::SOCK_DGRAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC;
        let fd = match unsafe { libc::socket(libc::AF_NETLINK, flags, libc::NETLINK_CONNECTOR) } {
            -1 => return Err(io::Error::last_os_error()).context("netlink socket"),
            fd => fd,
        };

        let connector = Self { fd, buf: vec![0; RECV_BUF], pending: VecDeque::new() };

        let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        addr.nl_groups = CN_IDX_PROC;

        let rc = unsafe {
            libc::bind(
                fd,
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc == -1 {
            return Err(io::Error::last_os_error()).context("bind proc connector");
        }

        connector.control(MCAST_LISTEN).context("subscribe to proc events")?;

        debug!("subscribed to proc connector");

        Ok(connector)
    }

    fn control(&self, op: u32) -> io::Result<()> {
        let control = Control {
            header: Header {
                len:   mem::size_of::<Control>() as u32,
                kind:  NLMSG_DONE,
                flags: 0,
                seq:   0,
                pid:   std::process::id(),
            },
            message: Message {
                idx:   CN_IDX_PROC,
                val:   CN_VAL_PROC,
                seq:   0,
                ack:   0,
                len:   mem::size_of::<u32>() as u16,
                flags: 0,
            },
            op: op,
        };

        let bytes = bytes_of(&control);
        let n = unsafe { libc::send(self.fd, bytes.as_ptr() as *const libc::c_void, bytes.len(), 0) };
        match n {
            -1 => Err(io::Error::last_os_error()),
            _  => Ok(()),
        }
    }
}

impl Backend for Connector {
    fn name(&self) -> &'static str {
        "connector"
    }

    fn read_batch(&mut self, max: usize) -> Result<Vec<Raw>, QueueError> {
        let mut batch = self.pending.drain(..max.min(self.pending.len())).collect::<Vec<_>>();

        while batch.len() < max && self.fd >= 0 {
            let n = unsafe {
                libc::recv(self.fd, self.buf.as_mut_ptr() as *mut libc::c_void, self.buf.len(), 0)
            };

            if n < 0 {
                match failure(io::Error::last_os_error()) {
                    Recv::Drained   => break,
                    Recv::Retry     => continue,
                    Recv::Lost(raw) => batch.push(raw),
                    Recv::Failed(e) => return Err(e.into()),
                }
                continue;
            }

            if n == 0 {
                break;
            }

            let n = n as usize;
            for raw in parse(&self.buf[..n]) {
                batch.push(enrich(raw));
            }
        }

        // One datagram can hold several messages.
        carry(&mut batch, &mut self.pending, max);

        Ok(batch)
    }

    fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    fn fd(&self) -> RawFd {
        self.fd
    }

    fn close(&mut self) -> Result<(), QueueError> {
        if self.fd < 0 {
            return Ok(());
        }

        if let Err(e) = self.control(MCAST_IGNORE) {
            debug!("unsubscribe failed: {}", e);
        }

        let fd = mem::replace(&mut self.fd, -1);
        match unsafe { libc::close(fd) } {
            -1 => Err(io::Error::last_os_error().into()),
            _  => Ok(()),
        }
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe { libc::close(self.fd) };
        }
    }
}

#[derive(Debug)]
enum Recv {
    Drained,
    Retry,
    Lost(Raw),
    Failed(io::Error),
}

// ENOBUFS means the socket buffer overflowed and the kernel dropped messages
// without saying how many.
fn failure(e: io::Error) -> Recv {
    match e.raw_os_error() {
        Some(libc::EAGAIN)  => Recv::Drained,
        Some(libc::EINTR)   => Recv::Retry,
        Some(libc::ENOBUFS) => Recv::Lost(overflow(0)),
        _                   => Recv::Failed(e),
    }
}

fn read<T: Pod>(buf: &[u8]) -> Option<T> {
    try_pod_read_unaligned(buf.get(..mem::size_of::<T>())?).ok()
}

fn parse(buf: &[u8]) -> Vec<Raw> {
    let size = mem::size_of::<Header>();
    let mut raws = Vec::new();
    let mut off = 0;

    while off + size <= buf.len() {
        let header = match read::<Header>(&buf[off..]) {
            Some(header) => header,
            None         => break,
        };

        let len = header.len as usize;
        if len < size || off + len > buf.len() {
            raws.push(Raw::malformed(format!("netlink message length {}", len)));
            break;
        }

        if header.kind != NLMSG_ERROR {
            if let Some(raw) = decode(&buf[off + size..off + len]) {
                raws.push(raw);
            }
        }

        off += (len + 3) & !3;
    }

    raws
}

fn decode(body: &[u8]) -> Option<Raw> {
    let message = match read::<Message>(body) {
        Some(message) => message,
        None          => return Some(Raw::malformed("short connector message")),
    };

    if message.idx != CN_IDX_PROC || message.val != CN_VAL_PROC {
        return None;
    }

    let data = &body[mem::size_of::<Message>()..];
    let event = match read::<ProcEvent>(data) {
        Some(event) => event,
        None        => return Some(Raw::malformed("short proc event")),
    };

    let payload = &data[mem::size_of::<ProcEvent>()..];
    let short   = || Some(Raw::malformed(format!("short proc event payload {:#x}", event.what)));

    let raw = match event.what {
        PROC_EVENT_FORK => match read::<Fork>(payload) {
            Some(f) => Raw::new(f.child_tgid, None, RawKind::Fork {
                ppid:         f.parent_tgid,
                parent_start: None,
                task:         Task::default(),
            }).thread(f.child_pid),
            None => return short(),
        },
        PROC_EVENT_EXEC => match read::<Exec>(payload) {
            Some(e) => Raw::new(e.tgid, None, RawKind::Exec {
                path: String::new(),
                task: Task::default(),
            }).thread(e.pid),
            None => return short(),
        },
        PROC_EVENT_EXIT => match read::<ExitEvent>(payload) {
            Some(e) => {
                let exit = Exit::from_wait_status(e.code as i32, event.time);
                Raw::new(e.tgid, None, RawKind::Exit {
                    code:   exit.code,
                    signal: exit.signal,
                }).thread(e.pid)
            }
            None => return short(),
        },
        what => {
            trace!("ignoring proc event {:#x}", what);
            return None;
        }
    };

    Some(raw.at(event.time))
}

// The connector only names the pid; start time and the rest of the task come
// from procfs, which still holds the task at fork, exec and (as a zombie)
// exit.
fn enrich(mut raw: Raw) -> Raw {
    if raw.is_thread() {
        return raw;
    }

    match &mut raw.kind {
        RawKind::Fork { ppid, parent_start, task } => {
            if let Some(found) = scan::inspect(raw.pid) {
                raw.start = Some(found.start);
                *task = found.task;
            }
            *parent_start = scan::start_of(*ppid);
        }
        RawKind::Exec { path, task } => {
            if let Some(found) = scan::inspect(raw.pid) {
                raw.start = Some(found.start);
                *path = found.task.exe.clone().unwrap_or_default();
                *task = found.task;
            }
        }
        RawKind::Exit { .. } => {
            raw.start = scan::start_of(raw.pid);
        }
        _ => (),
    }

    raw
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame<T: Pod>(what: u32, time: u64, payload: T) -> Vec<u8> {
        let body = mem::size_of::<Message>() + mem::size_of::<ProcEvent>() + mem::size_of::<T>();
        let header = Header {
            len:   (mem::size_of::<Header>() + body) as u32,
            kind:  NLMSG_DONE,
            flags: 0,
            seq:   0,
            pid:   0,
        };
        let message = Message {
            idx:   CN_IDX_PROC,
            val:   CN_VAL_PROC,
            seq:   0,
            ack:   0,
            len:   (mem::size_of::<ProcEvent>() + mem::size_of::<T>()) as u16,
            flags: 0,
        };
        let event = ProcEvent { what, cpu: 0, time };

        let mut buf = Vec::new();
        buf.extend_from_slice(bytes_of(&header));
        buf.extend_from_slice(bytes_of(&message));
        buf.extend_from_slice(bytes_of(&event));
        buf.extend_from_slice(bytes_of(&payload));
        while buf.len() % 4 != 0 {
            buf.push(0);
        }
        buf
    }

    #[test]
    fn should_decode_process_fork() {
        let fork = Fork { parent_pid: 1, parent_tgid: 1, child_pid: 100, child_tgid: 100 };
        let raws = parse(&frame(PROC_EVENT_FORK, 42, fork));

        assert_eq!(raws.len(), 1);
        assert_eq!(raws[0].pid, 100);
        assert_eq!(raws[0].time, 42);
        assert!(!raws[0].is_thread());
        assert!(matches!(raws[0].kind, RawKind::Fork { ppid: 1, .. }));
    }

    #[test]
    fn should_mark_thread_creation() {
        let fork = Fork { parent_pid: 100, parent_tgid: 100, child_pid: 101, child_tgid: 100 };
        let raws = parse(&frame(PROC_EVENT_FORK, 0, fork));

        assert_eq!(raws[0].pid, 100);
        assert_eq!(raws[0].tid, 101);
        assert!(raws[0].is_thread());
    }

    #[test]
    fn should_decode_exit_status_and_batches() {
        let mut buf = frame(PROC_EVENT_EXEC, 1, Exec { pid: 100, tgid: 100 });
        buf.extend(frame(PROC_EVENT_EXIT, 2, ExitEvent { pid: 100, tgid: 100, code: 9, signal: 17 }));

        let raws = parse(&buf);
        assert_eq!(raws.len(), 2);
        assert!(matches!(raws[0].kind, RawKind::Exec { .. }));
        assert_eq!(raws[1].kind, RawKind::Exit { code: 0, signal: Some(9) });
    }

    #[test]
    fn should_ignore_other_event_kinds() {
        let raws = parse(&frame(0x0000_0200, 0, Exec { pid: 1, tgid: 1 }));
        assert!(raws.is_empty());
    }

    #[test]
    fn should_flag_truncated_messages() {
        let buf = frame(PROC_EVENT_FORK, 0, Fork { parent_pid: 1, parent_tgid: 1, child_pid: 2, child_tgid: 2 });
        let raws = parse(&buf[..buf.len() - 8]);
        assert!(matches!(raws[0].kind, RawKind::Malformed { .. }));
    }

    #[test]
    fn should_map_receive_errors() {
        let errno = |n| failure(io::Error::from_raw_os_error(n));

        assert!(matches!(errno(libc::EAGAIN), Recv::Drained));
        assert!(matches!(errno(libc::EINTR), Recv::Retry));
        assert!(matches!(errno(libc::EBADF), Recv::Failed(_)));

        match errno(libc::ENOBUFS) {
            Recv::Lost(raw) => assert_eq!(raw.kind, RawKind::Lost { count: 0 }),
            other           => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn should_enrich_exec_from_procfs() {
        let pid = std::process::id();
        let raw = Raw::new(pid, None, RawKind::Exec { path: String::new(), task: Task::default() });

        let raw = enrich(raw);
        assert!(raw.start.is_some());
        assert!(matches!(raw.kind, RawKind::Exec { ref path, .. } if !path.is_empty()));
    }
}

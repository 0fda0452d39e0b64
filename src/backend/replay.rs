use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use parking_lot::Mutex;
use crate::error::{Error, Result};
use crate::raw::Raw;
use super::Backend;

#[derive(Debug)]
enum Item {
    Raw(Raw),
    Fail(io::ErrorKind),
}

#[derive(Debug, Default)]
struct Script {
    items:  VecDeque<Item>,
    closed: bool,
}

// Backend fed from memory: notifications pushed through a `Feeder` come out
// of `read_batch` in order. A socket pair makes the descriptor pollable.
#[derive(Debug)]
pub struct Replay {
    script: Arc<Mutex<Script>>,
    rx:     UnixStream,
    tx:     Arc<UnixStream>,
}

#[derive(Clone, Debug)]
pub struct Feeder {
    script: Arc<Mutex<Script>>,
    tx:     Arc<UnixStream>,
}

impl Replay {
    pub fn new() -> io::Result<(Self, Feeder)> {
        let (rx, tx) = UnixStream::pair()?;
        rx.set_nonblocking(true)?;
        tx.set_nonblocking(true)?;

        let script = Arc::new(Mutex::new(Script::default()));
        let tx     = Arc::new(tx);

        let feeder = Feeder { script: script.clone(), tx: tx.clone() };

        Ok((Self { script, rx, tx }, feeder))
    }

    fn drain(&mut self) -> io::Result<()> {
        let mut buf = [0u8; 64];
        loop {
            match self.rx.read(&mut buf) {
                Ok(0)                                          => return Ok(()),
                Ok(_)                                          => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e)                                         => return Err(e),
            }
        }
    }
}

impl Backend for Replay {
    fn name(&self) -> &'static str {
        "replay"
    }

    fn read_batch(&mut self, max: usize) -> Result<Vec<Raw>> {
        self.drain()?;

        let mut script = self.script.lock();
        let mut batch  = Vec::new();

        while batch.len() < max {
            match script.items.front() {
                Some(Item::Fail(_)) if !batch.is_empty() => break,
                Some(_)                                  => (),
                None                                     => break,
            }
            match script.items.pop_front() {
                Some(Item::Raw(raw))  => batch.push(raw),
                Some(Item::Fail(kind)) => {
                    if !script.items.is_empty() {
                        wake(&self.tx);
                    }
                    return Err(Error::BackendIo(io::Error::new(kind, "scripted failure")));
                }
                None => break,
            }
        }

        if !script.items.is_empty() {
            wake(&self.tx);
        }

        Ok(batch)
    }

    fn fd(&self) -> RawFd {
        self.rx.as_raw_fd()
    }

    fn close(&mut self) -> Result<()> {
        let mut script = self.script.lock();
        script.items.clear();
        script.closed = true;
        Ok(())
    }
}

impl Feeder {
    pub fn push(&self, raw: Raw) {
        self.extend(std::iter::once(raw));
    }

    pub fn extend<I: IntoIterator<Item = Raw>>(&self, raws: I) {
        let mut script = self.script.lock();
        if script.closed {
            return;
        }
        script.items.extend(raws.into_iter().map(Item::Raw));
        wake(&self.tx);
    }

    // The next read fails with `kind` once the notifications ahead of it
    // have been returned.
    pub fn fail(&self, kind: io::ErrorKind) {
        let mut script = self.script.lock();
        script.items.push_back(Item::Fail(kind));
        wake(&self.tx);
    }

    pub fn is_closed(&self) -> bool {
        self.script.lock().closed
    }
}

fn wake(tx: &UnixStream) {
    // A full socket buffer already reads as ready.
    let _ = (&*tx).write(&[1]);
}

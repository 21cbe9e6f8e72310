// Copyright (c) The Keel Project Authors.
// Licensed under the MIT License.

use std::io;
use std::os::fd::RawFd;

use super::{Event, Interest, retry_eintr};

/// poll(2) fallback for POSIX systems without epoll. The descriptor set is
/// rebuilt per wait from a registration table, which is fine for the fan-out
/// this backend is expected to carry.
pub(crate) struct Poller {
    entries: Vec<Entry>,
}

struct Entry {
    fd: RawFd,
    token: u64,
    interest: Interest,
}

impl Poller {
    pub(crate) fn new() -> io::Result<Self> {
        Ok(Self { entries: Vec::new() })
    }

    pub(crate) fn register(&mut self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        if self.position(fd).is_some() {
            return Err(io::Error::from(io::ErrorKind::AlreadyExists));
        }
        self.entries.push(Entry { fd, token, interest });
        Ok(())
    }

    pub(crate) fn modify(&mut self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        let index = self.position(fd).ok_or(io::ErrorKind::NotFound)?;
        self.entries[index].token = token;
        self.entries[index].interest = interest;
        Ok(())
    }

    pub(crate) fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        let index = self.position(fd).ok_or(io::ErrorKind::NotFound)?;
        let _ = self.entries.swap_remove(index);
        Ok(())
    }

    /// Waits up to `timeout_ms` (`-1` blocks indefinitely) and appends one
    /// batch of ready events to `out`.
    pub(crate) fn wait(&mut self, timeout_ms: i32, out: &mut Vec<Event>) -> io::Result<()> {
        let mut fds: Vec<libc::pollfd> = self
            .entries
            .iter()
            .map(|entry| {
                let mut events = 0_i16;
                if entry.interest.read {
                    events |= libc::POLLIN;
                }
                if entry.interest.write {
                    events |= libc::POLLOUT;
                }
                libc::pollfd {
                    fd: entry.fd,
                    events,
                    revents: 0,
                }
            })
            .collect();

        // SAFETY: `fds` is a valid pollfd array of the stated length.
        let rc = retry_eintr!(unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) });
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }

        for (entry, pollfd) in self.entries.iter().zip(&fds) {
            if pollfd.revents == 0 {
                continue;
            }
            let fail = pollfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0;
            out.push(Event {
                token: entry.token,
                readable: pollfd.revents & libc::POLLIN != 0 || fail,
                writable: pollfd.revents & libc::POLLOUT != 0 || fail,
            });
        }
        Ok(())
    }

    fn position(&self, fd: RawFd) -> Option<usize> {
        self.entries.iter().position(|entry| entry.fd == fd)
    }
}

impl std::fmt::Debug for Poller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller").field("entries", &self.entries.len()).finish()
    }
}

// Copyright (c) The Keel Project Authors.
// Licensed under the MIT License.

use std::io;
use std::os::fd::RawFd;

use super::{Event, Interest, retry_eintr};

/// How many kernel events one wait pass collects at most.
const EVENT_BATCH: usize = 64;

pub(crate) struct Poller {
    epfd: RawFd,
}

impl Poller {
    pub(crate) fn new() -> io::Result<Self> {
        // SAFETY: plain syscall.
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { epfd })
    }

    pub(crate) fn register(&mut self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, token, interest)
    }

    pub(crate) fn modify(&mut self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, token, interest)
    }

    pub(crate) fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        // The event argument is ignored for EPOLL_CTL_DEL on modern kernels
        // but must still be non-null for portability to pre-2.6.9 ones.
        let mut ev = libc::epoll_event { events: 0, u64: 0 };
        // SAFETY: `ev` is a valid epoll_event for the duration of the call.
        let rc = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &raw mut ev) };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Waits up to `timeout_ms` (`-1` blocks indefinitely) and appends one
    /// batch of ready events to `out`.
    pub(crate) fn wait(&mut self, timeout_ms: i32, out: &mut Vec<Event>) -> io::Result<()> {
        let mut events: [libc::epoll_event; EVENT_BATCH] = // SAFETY: epoll_event is plain old data; all-zero is valid.
            unsafe { std::mem::zeroed() };

        // SAFETY: the buffer is valid for EVENT_BATCH entries.
        let rc = retry_eintr!(unsafe {
            libc::epoll_wait(self.epfd, events.as_mut_ptr(), EVENT_BATCH as i32, timeout_ms)
        });
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }

        for ev in events.iter().take(rc as usize) {
            // Error/hangup conditions surface as readability/writability so
            // the regular protocol paths observe them via the OS result.
            let fail = ev.events & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0;
            out.push(Event {
                token: ev.u64,
                readable: ev.events & libc::EPOLLIN as u32 != 0 || fail,
                writable: ev.events & libc::EPOLLOUT as u32 != 0 || fail,
            });
        }
        Ok(())
    }

    fn ctl(&mut self, op: libc::c_int, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        let mut events = 0_u32;
        if interest.read {
            events |= libc::EPOLLIN as u32;
        }
        if interest.write {
            events |= libc::EPOLLOUT as u32;
        }

        let mut ev = libc::epoll_event { events, u64: token };
        // SAFETY: `ev` is a valid epoll_event for the duration of the call.
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &raw mut ev) };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        // SAFETY: we own the epoll fd.
        unsafe {
            let _ = libc::close(self.epfd);
        }
    }
}

impl std::fmt::Debug for Poller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller").field("epfd", &self.epfd).finish()
    }
}

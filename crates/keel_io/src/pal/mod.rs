// Copyright (c) The Keel Project Authors.
// Licensed under the MIT License.

//! Readiness poller, one implementation per OS family.
//!
//! The engine talks to a small facade: register a file descriptor with a
//! token and an interest mask, mutate the interest, and wait for one batch of
//! ready events. Linux gets epoll; other POSIX systems fall back to poll(2).

#[cfg(target_os = "linux")]
mod epoll;
#[cfg(not(target_os = "linux"))]
mod poll;

#[cfg(target_os = "linux")]
pub(crate) use epoll::Poller;
#[cfg(not(target_os = "linux"))]
pub(crate) use poll::Poller;

/// One readiness report. `token` is whatever the fd was registered with.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Event {
    pub token: u64,
    pub readable: bool,
    pub writable: bool,
}

/// Interest mask for a registered descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Interest {
    pub read: bool,
    pub write: bool,
}

impl Interest {
    pub(crate) fn any(self) -> bool {
        self.read || self.write
    }
}

/// Retries a syscall-shaped expression on EINTR.
macro_rules! retry_eintr {
    ($call:expr) => {
        loop {
            let rc = $call;
            if rc != -1 || std::io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
                break rc;
            }
        }
    };
}
pub(crate) use retry_eintr;

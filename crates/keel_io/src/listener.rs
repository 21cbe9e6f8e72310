// Copyright (c) The Keel Project Authors.
// Licensed under the MIT License.

//! Listening sockets: accept connections and hand the resulting channels to
//! an acceptor callback.

use std::marker::PhantomData;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::ptr::NonNull;

use keel_error::{Error, ErrorHub, code_values};
use keel_mem::Pool;

use crate::addr;
use crate::channel::{Channel, ChannelFlags, ChannelKind, configure_stream, set_nonblocking};
use crate::engine::{ChannelEngine, EngineInner, absorb_error};
use crate::pal::{Interest, retry_eintr};

/// Backlog used when the application has no particular requirement.
pub const DEFAULT_BACKLOG: i32 = 5;

/// Receives accepted connections.
///
/// The scratch pool is cleared after each invocation.
pub trait Acceptor {
    /// Called once per accepted connection with the freshly created channel.
    ///
    /// Errors do not stop the listener; they are recorded on the context.
    fn accept(&mut self, listener: Listener<'_>, channel: Channel<'_>, scratch: Pool<'_>) -> keel_error::Result<()>;
}

pub(crate) struct ListenerData<'ctx> {
    pub fd: RawFd,
    pub engine: NonNull<EngineInner<'ctx>>,
    pub acceptor: Option<Box<dyn Acceptor>>,
    pub flags: ChannelFlags,
    pub next: Option<NonNull<ListenerData<'ctx>>>,
}

/// A copyable handle to a listening socket.
#[derive(Clone, Copy)]
pub struct Listener<'e> {
    data: NonNull<ListenerData<'e>>,

    _marker: PhantomData<(&'e (), *mut ())>,
}

impl std::fmt::Debug for Listener<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // SAFETY: the listener is live per the handle contract.
        f.debug_struct("Listener").field("fd", unsafe { &(*self.data.as_ptr()).fd }).finish()
    }
}

impl<'ctx> ChannelEngine<'ctx> {
    /// Binds and listens on `address` with the given `backlog`, accepting
    /// connections through `acceptor` as they arrive.
    ///
    /// `SO_REUSEADDR` is set unless [`ChannelFlags::NO_REUSE`] is given.
    /// Accepted channels inherit `flags` (Nagle handling in particular).
    ///
    /// # Errors
    ///
    /// `UNSPECIFIED_OS` for any socket-layer failure.
    pub fn listen(
        &self,
        address: &SocketAddr,
        backlog: i32,
        flags: ChannelFlags,
        acceptor: Box<dyn Acceptor>,
    ) -> keel_error::Result<Listener<'_>> {
        let hub = self.hub();
        let family = match address {
            SocketAddr::V4(_) => libc::AF_INET,
            SocketAddr::V6(_) => libc::AF_INET6,
        };

        // SAFETY: plain syscalls on a descriptor we own throughout.
        unsafe {
            let fd = libc::socket(family, libc::SOCK_STREAM, libc::IPPROTO_TCP);
            if fd == -1 {
                return Err(Error::os(hub, "creating listener socket"));
            }

            if let Err(msg) = set_nonblocking(fd) {
                return Err(close_after(hub, fd, msg));
            }

            if !flags.contains(ChannelFlags::NO_REUSE) {
                let one: i32 = 1;
                let rc = libc::setsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_REUSEADDR,
                    (&raw const one).cast(),
                    size_of::<i32>() as libc::socklen_t,
                );
                if rc == -1 {
                    return Err(close_after(hub, fd, format!("setting SO_REUSEADDR: {}", std::io::Error::last_os_error())));
                }
            }

            let (storage, len) = addr::to_raw(address);
            if libc::bind(fd, (&raw const storage).cast(), len) == -1 {
                return Err(close_after(hub, fd, format!("binding listener: {}", std::io::Error::last_os_error())));
            }

            if libc::listen(fd, backlog) == -1 {
                return Err(close_after(hub, fd, format!("listening: {}", std::io::Error::last_os_error())));
            }

            let eng = self.raw();
            let pool = (*eng.as_ptr()).pool;
            let ld = pool.alloc(size_of::<ListenerData<'_>>()).cast::<ListenerData<'ctx>>();
            ld.write(ListenerData {
                fd,
                engine: eng,
                acceptor: Some(acceptor),
                flags,
                next: (*eng.as_ptr()).listeners,
            });
            (*eng.as_ptr()).listeners = Some(ld);

            // Listeners always watch for readability; the token carries the
            // listener tag in bit 0.
            let token = ld.as_ptr() as u64 | 1;
            if let Err(err) = (*eng.as_ptr()).poller.register(fd, token, Interest { read: true, write: false }) {
                destroy_raw(eng, ld);
                return Err(Error::with_message(
                    hub,
                    code_values::UNSPECIFIED_OS,
                    format!("registering listener: {err}"),
                ));
            }

            Ok(Listener::from_raw(ld))
        }
    }
}

impl<'e> Listener<'e> {
    pub(crate) fn from_raw(data: NonNull<ListenerData<'e>>) -> Self {
        Self {
            data,
            _marker: PhantomData,
        }
    }

    /// The error hub of the owning context.
    #[must_use]
    pub fn hub(self) -> &'e ErrorHub {
        // SAFETY: the listener and its engine are live per the handle contract.
        unsafe { (*(*self.data.as_ptr()).engine.as_ptr()).ctx.hub() }
    }

    /// The local address the socket ended up bound to; useful after binding
    /// port 0.
    ///
    /// # Errors
    ///
    /// `UNSPECIFIED_OS` when the OS refuses `getsockname`.
    pub fn local_address(self) -> keel_error::Result<SocketAddr> {
        let hub = self.hub();
        // SAFETY: the listener is live; the storage is valid for the call.
        unsafe {
            let mut storage: libc::sockaddr_storage = std::mem::zeroed();
            let mut len = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            if libc::getsockname((*self.data.as_ptr()).fd, (&raw mut storage).cast(), &raw mut len) == -1 {
                return Err(Error::os(hub, "reading listener address"));
            }
            addr::from_raw(&storage)
                .ok_or_else(|| Error::with_message(hub, code_values::UNSPECIFIED_OS, "unknown address family"))
        }
    }

    /// Stops listening and releases the socket.
    pub fn close(self) {
        // SAFETY: the listener and its engine are live; the handle contract
        // forbids further use.
        unsafe {
            destroy_raw((*self.data.as_ptr()).engine, self.data);
        }
    }
}

/// Accepts every connection currently queued on `ld` and hands each to the
/// acceptor.
pub(crate) unsafe fn accept_ready<'ctx>(eng: NonNull<EngineInner<'ctx>>, ld: NonNull<ListenerData<'ctx>>) {
    // SAFETY: the listener, engine, and new descriptors are owned here.
    unsafe {
        let listen_fd = (*ld.as_ptr()).fd;
        let flags = (*ld.as_ptr()).flags;

        loop {
            let mut storage: libc::sockaddr_storage = std::mem::zeroed();
            let mut len = size_of::<libc::sockaddr_storage>() as libc::socklen_t;

            let fd = retry_eintr!(libc::accept(listen_fd, (&raw mut storage).cast(), &raw mut len));
            if fd == -1 {
                let errno = std::io::Error::last_os_error();
                match errno.raw_os_error() {
                    Some(libc::EAGAIN | libc::EWOULDBLOCK) => return,
                    // The peer gave up while queued; nothing to report.
                    Some(libc::ECONNABORTED) => continue,
                    _ => {
                        absorb_error(
                            eng,
                            Error::with_message(
                                (*eng.as_ptr()).ctx.hub(),
                                code_values::UNSPECIFIED_OS,
                                format!("accepting connection: {errno}"),
                            ),
                        );
                        return;
                    }
                }
            }

            if let Err(msg) = configure_stream(fd, flags) {
                let _ = libc::close(fd);
                absorb_error(
                    eng,
                    Error::with_message((*eng.as_ptr()).ctx.hub(), code_values::UNSPECIFIED_OS, msg),
                );
                continue;
            }

            let ch = crate::channel::create_record(eng, fd, ChannelKind::Stream);

            // Hand the channel over; the acceptor is detached for the call so
            // it may freely use the listener handle.
            let Some(mut acceptor) = (*ld.as_ptr()).acceptor.take() else {
                continue;
            };
            let scratch = (*eng.as_ptr()).scratch;
            let result = acceptor.accept(Listener::from_raw(ld), Channel::from_raw(ch), scratch);
            scratch.clear();
            if (*ld.as_ptr()).acceptor.is_none() {
                (*ld.as_ptr()).acceptor = Some(acceptor);
            }

            if let Err(err) = result {
                absorb_error(eng, err);
            }
        }
    }
}

/// Full listener teardown; shared by `Listener::close` and engine drop.
pub(crate) unsafe fn destroy_raw<'ctx>(eng: NonNull<EngineInner<'ctx>>, ld: NonNull<ListenerData<'ctx>>) {
    // SAFETY: the listener and engine are live; the record is dead afterwards.
    unsafe {
        let fd = (*ld.as_ptr()).fd;
        let _ = (*eng.as_ptr()).poller.deregister(fd);

        let mut link = &raw mut (*eng.as_ptr()).listeners;
        while let Some(scan) = *link {
            if scan == ld {
                *link = (*scan.as_ptr()).next;
                break;
            }
            link = &raw mut (*scan.as_ptr()).next;
        }

        std::ptr::drop_in_place(ld.as_ptr());
        (*eng.as_ptr()).pool.freemem(ld.cast(), size_of::<ListenerData<'_>>());

        let _ = libc::close(fd);
    }
}

/// Closes `fd` after a creation failure, joining a close failure onto the
/// primary error.
fn close_after(hub: &ErrorHub, fd: RawFd, msg: String) -> Error {
    let err = Error::with_message(hub, code_values::UNSPECIFIED_OS, msg);
    // SAFETY: the descriptor is ours and unused beyond this point.
    let rc = unsafe { libc::close(fd) };
    if rc == -1 {
        let close_err = Error::os(hub, "closing failed listener");
        return Error::join(Some(err), Some(close_err)).expect("primary error present");
    }
    err
}

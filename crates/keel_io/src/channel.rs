// Copyright (c) The Keel Project Authors.
// Licensed under the MIT License.

//! Channels: non-blocking sockets driven by the engine.
//!
//! A channel pairs an OS descriptor with one handler implementing the read
//! and write intents (a single trait object per channel keeps the per-channel
//! footprint small at high fan-out). The application arms interest with
//! [`Channel::desire_read`] / [`Channel::desire_write`]; the engine invokes
//! the handler as readiness arrives.

use std::marker::PhantomData;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::path::Path;
use std::ptr::NonNull;

use keel_error::{Error, ErrorHub, code_values};
use keel_mem::Pool;
use smallvec::SmallVec;

use crate::addr;
use crate::engine::{ChannelEngine, EngineInner};
use crate::pal::{Interest, retry_eintr};

bitflags::bitflags! {
    /// Options for channel and listener creation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ChannelFlags: u32 {
        /// Listeners should not reuse the listening address. By default they
        /// do (`SO_REUSEADDR`).
        const NO_REUSE = 0x0001;
        /// Leave Nagle's algorithm on. By default channels disable it.
        const USE_NAGLE = 0x0002;
    }
}

/// What a read consumer did with the bytes it was shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Took this many bytes from the front of the buffer. Anything short of
    /// the full length parks the remainder and exerts back-pressure.
    Consumed(usize),
    /// Stop reading; the application will re-arm with `desire_read` later.
    Stop,
    /// Keep reading as data arrives.
    Continue,
}

/// One element of a write vector: a borrowed span of bytes.
///
/// The pointed-to storage must remain valid and unchanged from the moment the
/// producer returns it until the producer is next invoked or the channel is
/// destroyed; the engine holds only this descriptor, never a copy of the data.
#[derive(Debug, Clone, Copy)]
pub struct IoVec {
    pub(crate) base: *const u8,
    pub(crate) len: usize,
}

impl IoVec {
    /// Describes `data`. The lifetime is erased: see the type-level contract.
    #[must_use]
    pub fn new(data: &[u8]) -> Self {
        Self {
            base: data.as_ptr(),
            len: data.len(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// A write vector. Inline capacity covers typical header+body shapes.
pub type WriteVec = SmallVec<[IoVec; 8]>;

/// Per-channel callbacks.
///
/// The scratch pool handed to each method is cleared when the method returns;
/// allocations that should survive must come from a pool the handler owns.
pub trait ChannelHandler {
    /// Consume readable data.
    ///
    /// `buf` is `Some(bytes)` when data arrived, or `None` when the kernel has
    /// no more data right now. In the `None` case the return value declares
    /// intent: [`ReadOutcome::Continue`] keeps the channel armed,
    /// [`ReadOutcome::Stop`] requires a later `desire_read`.
    ///
    /// Errors do not stop the engine; they are recorded on the context.
    fn on_read(&mut self, buf: Option<&[u8]>, channel: Channel<'_>, scratch: Pool<'_>) -> keel_error::Result<ReadOutcome> {
        let _ = (buf, channel, scratch);
        Ok(ReadOutcome::Stop)
    }

    /// Produce data to write, or `None` when there is nothing further (which
    /// disarms writing until the next `desire_write`).
    fn on_write(&mut self, channel: Channel<'_>, scratch: Pool<'_>) -> keel_error::Result<Option<WriteVec>> {
        let _ = (channel, scratch);
        Ok(None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChannelKind {
    Stream,
    Datagram,
}

pub(crate) struct ChannelData<'ctx> {
    pub fd: RawFd,
    pub engine: NonNull<EngineInner<'ctx>>,

    pub handler: Option<Box<dyn ChannelHandler>>,

    pub desire_read: bool,
    pub desire_write: bool,

    /// Interest currently registered with the poller, if any.
    pub registered: Option<Interest>,

    /// Pending write vector state; see the write protocol.
    pub pending: WriteVec,
    pub pending_idx: usize,
    pub pending_off: usize,

    pub readbuf_cap: usize,
    pub kind: ChannelKind,

    /// Engine-wide channel list, for teardown.
    pub next: Option<NonNull<ChannelData<'ctx>>>,
}

/// A copyable handle to a channel.
///
/// Valid until the channel is destroyed (explicitly or with its engine);
/// using a handle after that is a usage error, like any stale pool handle.
#[derive(Clone, Copy)]
pub struct Channel<'e> {
    data: NonNull<ChannelData<'e>>,

    _marker: PhantomData<(&'e (), *mut ())>,
}

impl std::fmt::Debug for Channel<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel").field("fd", &self.fd()).finish()
    }
}

impl<'ctx> ChannelEngine<'ctx> {
    /// Creates a TCP channel connecting to `destination`.
    ///
    /// The connect starts immediately but completes asynchronously: the
    /// channel becomes writable (or readable) once established. `source`, if
    /// given, is bound first. Nagle's algorithm is disabled unless
    /// [`ChannelFlags::USE_NAGLE`] is set.
    ///
    /// # Errors
    ///
    /// `UNSPECIFIED_OS` for any socket-layer failure.
    pub fn tcp_connect(
        &self,
        destination: &SocketAddr,
        source: Option<&SocketAddr>,
        flags: ChannelFlags,
    ) -> keel_error::Result<Channel<'_>> {
        let hub = self.hub();
        let family = match destination {
            SocketAddr::V4(_) => libc::AF_INET,
            SocketAddr::V6(_) => libc::AF_INET6,
        };

        // SAFETY: plain syscalls on a descriptor we own throughout.
        unsafe {
            let fd = libc::socket(family, libc::SOCK_STREAM, libc::IPPROTO_TCP);
            if fd == -1 {
                return Err(Error::os(hub, "creating TCP socket"));
            }

            if let Err(msg) = configure_stream(fd, flags) {
                return Err(close_after(hub, fd, Error::with_message(hub, code_values::UNSPECIFIED_OS, msg)));
            }

            if let Some(source) = source {
                let (storage, len) = addr::to_raw(source);
                if libc::bind(fd, (&raw const storage).cast(), len) == -1 {
                    return Err(close_after(hub, fd, Error::os(hub, "binding source address")));
                }
            }

            let (storage, len) = addr::to_raw(destination);
            if libc::connect(fd, (&raw const storage).cast(), len) == -1 {
                let errno = std::io::Error::last_os_error().raw_os_error();
                if errno != Some(libc::EINPROGRESS) {
                    return Err(close_after(hub, fd, Error::os(hub, "connecting TCP channel")));
                }
            }

            Ok(Channel::from_raw(create_record(self.raw(), fd, ChannelKind::Stream)))
        }
    }

    /// Creates a UDP channel. `source`, if given, is bound; `destination`, if
    /// given, becomes the default peer for [`Channel::write`]/[`Channel::read`].
    ///
    /// # Errors
    ///
    /// `UNSPECIFIED_OS` for any socket-layer failure.
    pub fn udp_open(
        &self,
        destination: Option<&SocketAddr>,
        source: Option<&SocketAddr>,
    ) -> keel_error::Result<Channel<'_>> {
        let hub = self.hub();
        let family = match destination.or(source) {
            Some(SocketAddr::V6(_)) => libc::AF_INET6,
            _ => libc::AF_INET,
        };

        // SAFETY: plain syscalls on a descriptor we own throughout.
        unsafe {
            let fd = libc::socket(family, libc::SOCK_DGRAM, 0);
            if fd == -1 {
                return Err(Error::os(hub, "creating UDP socket"));
            }

            if let Err(err) = set_nonblocking(fd) {
                return Err(close_after(hub, fd, Error::with_message(hub, code_values::UNSPECIFIED_OS, err)));
            }

            if let Some(source) = source {
                let (storage, len) = addr::to_raw(source);
                if libc::bind(fd, (&raw const storage).cast(), len) == -1 {
                    return Err(close_after(hub, fd, Error::os(hub, "binding source address")));
                }
            }

            if let Some(destination) = destination {
                let (storage, len) = addr::to_raw(destination);
                if libc::connect(fd, (&raw const storage).cast(), len) == -1 {
                    return Err(close_after(hub, fd, Error::os(hub, "setting UDP peer")));
                }
            }

            Ok(Channel::from_raw(create_record(self.raw(), fd, ChannelKind::Datagram)))
        }
    }

    /// Creates a connected bidirectional pipe, returning both endpoints.
    ///
    /// # Errors
    ///
    /// `UNSPECIFIED_OS` when the pair cannot be created.
    pub fn pipe(&self) -> keel_error::Result<(Channel<'_>, Channel<'_>)> {
        let hub = self.hub();
        let mut fds = [0 as RawFd; 2];

        // SAFETY: plain syscalls on descriptors we own throughout.
        unsafe {
            if libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) == -1 {
                return Err(Error::os(hub, "creating pipe pair"));
            }

            for fd in fds {
                if let Err(err) = set_nonblocking(fd) {
                    let _ = libc::close(fds[0]);
                    let _ = libc::close(fds[1]);
                    return Err(Error::with_message(hub, code_values::UNSPECIFIED_OS, err));
                }
            }

            Ok((
                Channel::from_raw(create_record(self.raw(), fds[0], ChannelKind::Stream)),
                Channel::from_raw(create_record(self.raw(), fds[1], ChannelKind::Stream)),
            ))
        }
    }

    /// Connects to a Unix domain socket at `path`.
    ///
    /// # Errors
    ///
    /// `BAD_PARAM` for over-long paths, `UNSPECIFIED_OS` for socket failures.
    pub fn local_connect(&self, path: &Path) -> keel_error::Result<Channel<'_>> {
        let hub = self.hub();
        let (storage, len) = sockaddr_local(hub, path)?;

        // SAFETY: plain syscalls on a descriptor we own throughout.
        unsafe {
            let fd = libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0);
            if fd == -1 {
                return Err(Error::os(hub, "creating local socket"));
            }

            if let Err(err) = set_nonblocking(fd) {
                return Err(close_after(hub, fd, Error::with_message(hub, code_values::UNSPECIFIED_OS, err)));
            }

            if libc::connect(fd, (&raw const storage).cast(), len) == -1 {
                let errno = std::io::Error::last_os_error().raw_os_error();
                if errno != Some(libc::EINPROGRESS) && errno != Some(libc::EAGAIN) {
                    return Err(close_after(hub, fd, Error::os(hub, "connecting local channel")));
                }
            }

            Ok(Channel::from_raw(create_record(self.raw(), fd, ChannelKind::Stream)))
        }
    }
}

impl<'e> Channel<'e> {
    pub(crate) fn from_raw(data: NonNull<ChannelData<'e>>) -> Self {
        Self {
            data,
            _marker: PhantomData,
        }
    }

    pub(crate) fn raw(self) -> NonNull<ChannelData<'e>> {
        self.data
    }

    /// The channel's file descriptor.
    #[must_use]
    pub fn fd(self) -> RawFd {
        // SAFETY: the channel is live per the handle contract.
        unsafe { (*self.data.as_ptr()).fd }
    }

    /// The error hub of the owning context.
    #[must_use]
    pub fn hub(self) -> &'e ErrorHub {
        // SAFETY: the channel and its engine are live per the handle contract.
        unsafe { (*(*self.data.as_ptr()).engine.as_ptr()).ctx.hub() }
    }

    /// The engine driving this channel.
    #[must_use]
    pub fn engine(self) -> crate::engine::EngineRef<'e> {
        // SAFETY: the channel is live, so its engine is too.
        crate::engine::EngineRef::from_raw(unsafe { (*self.data.as_ptr()).engine })
    }

    /// The local address this channel's socket is bound to.
    ///
    /// # Errors
    ///
    /// `UNSPECIFIED_OS` when the OS refuses `getsockname` (pipes, notably).
    pub fn local_address(self) -> keel_error::Result<SocketAddr> {
        let hub = self.hub();
        // SAFETY: the channel is live; the storage is valid for the call.
        unsafe {
            let mut storage: libc::sockaddr_storage = std::mem::zeroed();
            let mut len = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            if libc::getsockname((*self.data.as_ptr()).fd, (&raw mut storage).cast(), &raw mut len) == -1 {
                return Err(Error::os(hub, "reading channel address"));
            }
            addr::from_raw(&storage)
                .ok_or_else(|| Error::with_message(hub, code_values::UNSPECIFIED_OS, "unknown address family"))
        }
    }

    /// Installs the channel's handler, replacing any previous one.
    pub fn set_handler(self, handler: Box<dyn ChannelHandler>) {
        // SAFETY: the channel is live.
        unsafe {
            (*self.data.as_ptr()).handler = Some(handler);
        }
    }

    /// Declares the desire to read. The handler's `on_read` will be invoked as
    /// data (or buffered remainder from an earlier partial consumption)
    /// becomes available.
    pub fn desire_read(self) {
        // SAFETY: the channel and its engine are live.
        unsafe {
            (*self.data.as_ptr()).desire_read = true;
            sync_registration((*self.data.as_ptr()).engine, self.data);
        }
    }

    /// Declares the desire to write. The handler's `on_write` will be invoked
    /// as the channel accepts data.
    pub fn desire_write(self) {
        // SAFETY: the channel and its engine are live.
        unsafe {
            (*self.data.as_ptr()).desire_write = true;
            sync_registration((*self.data.as_ptr()).engine, self.data);
        }
    }

    /// Whether the channel currently desires to read. Engine-driven events
    /// (EOF, partial consumption) clear this.
    #[must_use]
    pub fn wants_read(self) -> bool {
        // SAFETY: the channel is live.
        unsafe { (*self.data.as_ptr()).desire_read }
    }

    /// Whether the channel currently desires to write.
    #[must_use]
    pub fn wants_write(self) -> bool {
        // SAFETY: the channel is live.
        unsafe { (*self.data.as_ptr()).desire_write }
    }

    /// Shuts down the chosen direction(s) of the connection. The descriptor
    /// itself stays open until [`destroy`](Self::destroy). With both flags
    /// false this is a no-op.
    ///
    /// # Errors
    ///
    /// `UNSPECIFIED_OS` when the shutdown fails.
    pub fn close(self, stop_reading: bool, stop_writing: bool) -> keel_error::Result<()> {
        if !stop_reading && !stop_writing {
            return Ok(());
        }

        let how = if stop_reading {
            if stop_writing { libc::SHUT_RDWR } else { libc::SHUT_RD }
        } else {
            libc::SHUT_WR
        };

        // SAFETY: the channel is live and owns its descriptor.
        unsafe {
            if libc::shutdown((*self.data.as_ptr()).fd, how) == -1 {
                return Err(Error::os(self.hub(), "shutting down channel").trace());
            }
        }
        Ok(())
    }

    /// Destroys the channel: deregisters it, returns any buffered data to the
    /// engine, and closes the descriptor.
    ///
    /// Must not be called from inside a callback for a *different* channel in
    /// the same pass (that channel's event may still be queued).
    pub fn destroy(self) {
        // SAFETY: the channel and its engine are live; the handle contract
        // forbids further use.
        unsafe {
            crate::channel::destroy_raw((*self.data.as_ptr()).engine, self.data);
        }
    }

    /// Sets this channel's engine read-buffer capacity. Buffers already in
    /// flight keep their size; future reads use the new one.
    pub fn set_readbuf(self, cap: usize) {
        // SAFETY: the channel is live.
        unsafe {
            (*self.data.as_ptr()).readbuf_cap = cap.max(1);
        }
    }

    /// Sets the kernel send-buffer size (`SO_SNDBUF`). The engine keeps no
    /// application-level write buffer (producers own their storage), so the
    /// kernel buffer is the write-side knob.
    ///
    /// # Errors
    ///
    /// `UNSPECIFIED_OS` when the option cannot be set.
    pub fn set_writebuf(self, bytes: usize) -> keel_error::Result<()> {
        let value = i32::try_from(bytes).unwrap_or(i32::MAX);
        // SAFETY: the channel is live and owns its descriptor.
        unsafe {
            let rc = libc::setsockopt(
                (*self.data.as_ptr()).fd,
                libc::SOL_SOCKET,
                libc::SO_SNDBUF,
                (&raw const value).cast(),
                size_of::<i32>() as libc::socklen_t,
            );
            if rc == -1 {
                return Err(Error::os(self.hub(), "setting send buffer").trace());
            }
        }
        Ok(())
    }

    /// Synchronous read. Blocks (by polling the one descriptor) until some
    /// data, EOF (`Ok(0)`), or an error.
    ///
    /// # Errors
    ///
    /// `UNSPECIFIED_OS` on read failure.
    pub fn read(self, buf: &mut [u8]) -> keel_error::Result<usize> {
        let fd = self.fd();
        loop {
            // SAFETY: the buffer is valid for `buf.len()` writable bytes.
            let n = retry_eintr!(unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) });
            if n >= 0 {
                return Ok(n as usize);
            }
            let errno = std::io::Error::last_os_error();
            if matches!(errno.raw_os_error(), Some(libc::EAGAIN | libc::EWOULDBLOCK)) {
                wait_single(fd, libc::POLLIN);
                continue;
            }
            return Err(Error::os(self.hub(), "reading channel").trace());
        }
    }

    /// Synchronous write of the whole of `data`. Blocks (by polling the one
    /// descriptor) as needed.
    ///
    /// # Errors
    ///
    /// `UNSPECIFIED_OS` on write failure.
    pub fn write(self, data: &[u8]) -> keel_error::Result<usize> {
        let fd = self.fd();
        let mut written = 0;
        while written < data.len() {
            let rest = &data[written..];
            // SAFETY: the buffer is valid for `rest.len()` readable bytes.
            let n = retry_eintr!(unsafe { libc::write(fd, rest.as_ptr().cast(), rest.len()) });
            if n >= 0 {
                written += n as usize;
                continue;
            }
            let errno = std::io::Error::last_os_error();
            if matches!(errno.raw_os_error(), Some(libc::EAGAIN | libc::EWOULDBLOCK)) {
                wait_single(fd, libc::POLLOUT);
                continue;
            }
            return Err(Error::os(self.hub(), "writing channel").trace());
        }
        Ok(written)
    }

    /// Receives one datagram, returning the byte count and the sender.
    ///
    /// # Errors
    ///
    /// `BAD_PARAM` on non-datagram channels, `UNSPECIFIED_OS` on failure.
    pub fn read_from(self, buf: &mut [u8]) -> keel_error::Result<(usize, Option<SocketAddr>)> {
        self.require_datagram()?;
        let fd = self.fd();

        // SAFETY: the buffer and sockaddr storage are valid for the call.
        unsafe {
            let mut storage: libc::sockaddr_storage = std::mem::zeroed();
            let mut len = size_of::<libc::sockaddr_storage>() as libc::socklen_t;

            loop {
                let n = retry_eintr!(libc::recvfrom(
                    fd,
                    buf.as_mut_ptr().cast(),
                    buf.len(),
                    0,
                    (&raw mut storage).cast(),
                    &raw mut len,
                ));
                if n >= 0 {
                    return Ok((n as usize, addr::from_raw(&storage)));
                }
                let errno = std::io::Error::last_os_error();
                if matches!(errno.raw_os_error(), Some(libc::EAGAIN | libc::EWOULDBLOCK)) {
                    wait_single(fd, libc::POLLIN);
                    continue;
                }
                return Err(Error::os(self.hub(), "receiving datagram").trace());
            }
        }
    }

    /// Sends one datagram to `destination`.
    ///
    /// # Errors
    ///
    /// `BAD_PARAM` on non-datagram channels, `UNSPECIFIED_OS` on failure.
    pub fn write_to(self, destination: &SocketAddr, data: &[u8]) -> keel_error::Result<usize> {
        self.require_datagram()?;
        let fd = self.fd();
        let (storage, len) = addr::to_raw(destination);

        // SAFETY: the buffer and sockaddr storage are valid for the call.
        unsafe {
            loop {
                let n = retry_eintr!(libc::sendto(
                    fd,
                    data.as_ptr().cast(),
                    data.len(),
                    0,
                    (&raw const storage).cast(),
                    len,
                ));
                if n >= 0 {
                    return Ok(n as usize);
                }
                let errno = std::io::Error::last_os_error();
                if matches!(errno.raw_os_error(), Some(libc::EAGAIN | libc::EWOULDBLOCK)) {
                    wait_single(fd, libc::POLLOUT);
                    continue;
                }
                return Err(Error::os(self.hub(), "sending datagram").trace());
            }
        }
    }

    /// Enters this channel into the context's tracking registry. Cleaning it
    /// through the registry destroys the channel; destroying it explicitly
    /// removes the registration.
    pub fn track(self) {
        // SAFETY: the channel and its engine are live.
        unsafe {
            let ctx = (*(*self.data.as_ptr()).engine.as_ptr()).ctx;
            ctx.track(self.data.as_ptr().cast(), destroy_tracked_channel);
        }
    }

    /// Declares that this channel owns `pool`: tearing the pool down destroys
    /// this channel first, while the pool's memory is still intact. The
    /// channel is entered into the registry if needed.
    ///
    /// # Errors
    ///
    /// Propagates registry errors (`NOT_REGISTERED` cannot occur here).
    pub fn owns_pool(self, pool: keel_mem::Pool<'_>) -> keel_error::Result<()> {
        self.track();
        // SAFETY: the channel and its engine are live.
        unsafe {
            let ctx = (*(*self.data.as_ptr()).engine.as_ptr()).ctx;
            ctx.track_owns_pool(self.data.as_ptr().cast(), pool)
        }
    }

    fn require_datagram(self) -> keel_error::Result<()> {
        // SAFETY: the channel is live.
        let kind = unsafe { (*self.data.as_ptr()).kind };
        if kind == ChannelKind::Datagram {
            Ok(())
        } else {
            Err(Error::with_message(
                self.hub(),
                code_values::BAD_PARAM,
                "datagram operation on a stream channel",
            ))
        }
    }
}

/// Allocates and links a channel record.
pub(crate) unsafe fn create_record<'ctx>(
    eng: NonNull<EngineInner<'ctx>>,
    fd: RawFd,
    kind: ChannelKind,
) -> NonNull<ChannelData<'ctx>> {
    // SAFETY: the engine and its pool are live.
    unsafe {
        let pool = (*eng.as_ptr()).pool;
        let ch = pool.alloc(size_of::<ChannelData<'_>>()).cast::<ChannelData<'ctx>>();
        ch.write(ChannelData {
            fd,
            engine: eng,
            handler: None,
            desire_read: false,
            desire_write: false,
            registered: None,
            pending: WriteVec::new(),
            pending_idx: 0,
            pending_off: 0,
            readbuf_cap: (*eng.as_ptr()).default_readbuf,
            kind,
            next: (*eng.as_ptr()).channels,
        });
        (*eng.as_ptr()).channels = Some(ch);
        ch
    }
}

/// Destroys the channel registered behind a tracked channel record.
///
/// # Safety
///
/// `data` must be the `ChannelData` pointer the record was registered with.
unsafe fn destroy_tracked_channel(data: *mut ()) {
    // SAFETY: per contract.
    unsafe {
        let ch = NonNull::new_unchecked(data.cast::<ChannelData<'_>>());
        destroy_raw((*ch.as_ptr()).engine, ch);
    }
}

/// Full channel teardown; shared by `Channel::destroy` and engine drop.
pub(crate) unsafe fn destroy_raw<'ctx>(eng: NonNull<EngineInner<'ctx>>, ch: NonNull<ChannelData<'ctx>>) {
    // SAFETY: the channel and engine are live; the record is dead afterwards.
    unsafe {
        // Forget any tracking registration; a registry-driven destruction has
        // already removed it by this point.
        if let Err(err) = (*eng.as_ptr()).ctx.track_deregister(ch.as_ptr().cast()) {
            err.handled();
        }

        let fd = (*ch.as_ptr()).fd;

        // Shut the connection down; nothing useful can be done with a failure
        // at this point.
        let _ = libc::shutdown(fd, libc::SHUT_RDWR);

        if (*ch.as_ptr()).registered.is_some() {
            let _ = (*eng.as_ptr()).poller.deregister(fd);
        }

        crate::engine::drop_channel_pending(eng, ch);

        // Unlink from the engine's channel list.
        let mut link = &raw mut (*eng.as_ptr()).channels;
        while let Some(scan) = *link {
            if scan == ch {
                *link = (*scan.as_ptr()).next;
                break;
            }
            link = &raw mut (*scan.as_ptr()).next;
        }

        // Run the record's droppable fields (handler box, spilled vectors),
        // then hand the memory back so the engine pool does not grow without
        // bound across channel churn.
        std::ptr::drop_in_place(ch.as_ptr());
        (*eng.as_ptr()).pool.freemem(ch.cast(), size_of::<ChannelData<'_>>());

        let _ = libc::close(fd);
    }
}

/// Brings the poller registration in line with the channel's desire flags.
/// The registration token is the record address (bit 0 clear distinguishes
/// channels from listeners).
pub(crate) unsafe fn sync_registration<'ctx>(eng: NonNull<EngineInner<'ctx>>, ch: NonNull<ChannelData<'ctx>>) {
    // SAFETY: the channel and engine are live.
    unsafe {
        let want = Interest {
            read: (*ch.as_ptr()).desire_read,
            write: (*ch.as_ptr()).desire_write,
        };
        let fd = (*ch.as_ptr()).fd;
        let token = ch.as_ptr() as u64;
        debug_assert_eq!(token & 1, 0);

        let result = match ((*ch.as_ptr()).registered, want.any()) {
            (None, true) => {
                let r = (*eng.as_ptr()).poller.register(fd, token, want);
                if r.is_ok() {
                    (*ch.as_ptr()).registered = Some(want);
                }
                r
            }
            (Some(_), false) => {
                let r = (*eng.as_ptr()).poller.deregister(fd);
                (*ch.as_ptr()).registered = None;
                r
            }
            (Some(current), true) if current != want => {
                let r = (*eng.as_ptr()).poller.modify(fd, token, want);
                if r.is_ok() {
                    (*ch.as_ptr()).registered = Some(want);
                }
                r
            }
            _ => Ok(()),
        };

        if let Err(err) = result {
            crate::engine::absorb_error(
                eng,
                Error::with_message(
                    (*eng.as_ptr()).ctx.hub(),
                    code_values::UNSPECIFIED_OS,
                    format!("updating poller registration: {err}"),
                ),
            );
        }
    }
}

/// Invokes the channel's read intent, clearing the scratch pool afterwards.
/// Without a handler, reading stops.
pub(crate) unsafe fn invoke_read<'ctx>(
    eng: NonNull<EngineInner<'ctx>>,
    ch: NonNull<ChannelData<'ctx>>,
    buf: Option<&[u8]>,
) -> keel_error::Result<ReadOutcome> {
    // SAFETY: the channel and engine are live; the handler is detached for
    // the duration of the call so it may freely use the channel handle.
    unsafe {
        let Some(mut handler) = (*ch.as_ptr()).handler.take() else {
            return Ok(ReadOutcome::Stop);
        };

        let scratch = (*eng.as_ptr()).scratch;
        let result = handler.on_read(buf, Channel::from_raw(ch), scratch);
        scratch.clear();

        if (*ch.as_ptr()).handler.is_none() {
            (*ch.as_ptr()).handler = Some(handler);
        }
        result
    }
}

/// Invokes the channel's write intent, clearing the scratch pool afterwards.
/// Without a handler there is nothing to write.
pub(crate) unsafe fn invoke_write<'ctx>(
    eng: NonNull<EngineInner<'ctx>>,
    ch: NonNull<ChannelData<'ctx>>,
) -> keel_error::Result<Option<WriteVec>> {
    // SAFETY: as `invoke_read`.
    unsafe {
        let Some(mut handler) = (*ch.as_ptr()).handler.take() else {
            return Ok(None);
        };

        let scratch = (*eng.as_ptr()).scratch;
        let result = handler.on_write(Channel::from_raw(ch), scratch);
        scratch.clear();

        if (*ch.as_ptr()).handler.is_none() {
            (*ch.as_ptr()).handler = Some(handler);
        }
        result
    }
}

/// Marks `fd` non-blocking. Returns a rendered message on failure (the caller
/// owns error-object creation).
pub(crate) fn set_nonblocking(fd: RawFd) -> Result<(), String> {
    // SAFETY: plain fcntl on a descriptor the caller owns.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags == -1 {
            return Err(format!("reading descriptor flags: {}", std::io::Error::last_os_error()));
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) == -1 {
            return Err(format!("setting O_NONBLOCK: {}", std::io::Error::last_os_error()));
        }
    }
    Ok(())
}

/// Applies the standard stream options: non-blocking, and Nagle disabled
/// unless requested otherwise. Returns a rendered message on failure (the
/// caller owns error-object creation).
pub(crate) fn configure_stream(fd: RawFd, flags: ChannelFlags) -> Result<(), String> {
    set_nonblocking(fd)?;

    if !flags.contains(ChannelFlags::USE_NAGLE) {
        let one: i32 = 1;
        // SAFETY: plain setsockopt on a descriptor the caller owns.
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::IPPROTO_TCP,
                libc::TCP_NODELAY,
                (&raw const one).cast(),
                size_of::<i32>() as libc::socklen_t,
            )
        };
        if rc == -1 {
            return Err(format!("disabling Nagle: {}", std::io::Error::last_os_error()));
        }
    }
    Ok(())
}

/// Closes `fd` after a creation failure, joining a close failure onto the
/// primary error.
pub(crate) fn close_after(hub: &ErrorHub, fd: RawFd, err: Error) -> Error {
    // SAFETY: the descriptor is ours and unused beyond this point.
    let rc = unsafe { libc::close(fd) };
    if rc == -1 {
        let close_err = Error::os(hub, "closing failed channel");
        return Error::join(Some(err), Some(close_err)).expect("primary error present");
    }
    err
}

/// Builds a sockaddr_un for `path`.
fn sockaddr_local(hub: &ErrorHub, path: &Path) -> keel_error::Result<(libc::sockaddr_un, libc::socklen_t)> {
    use std::os::unix::ffi::OsStrExt;

    let bytes = path.as_os_str().as_bytes();

    // SAFETY: sockaddr_un is plain old data; all-zero is valid.
    let mut sun: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    if bytes.len() >= sun.sun_path.len() {
        return Err(Error::with_message(
            hub,
            code_values::BAD_PARAM,
            format!("local socket path too long ({} bytes)", bytes.len()),
        ));
    }

    sun.sun_family = libc::AF_UNIX as libc::sa_family_t;
    for (dst, src) in sun.sun_path.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }

    let len = (std::mem::offset_of!(libc::sockaddr_un, sun_path) + bytes.len() + 1) as libc::socklen_t;
    Ok((sun, len))
}

/// Blocks on one descriptor until `events` (POLLIN/POLLOUT) is ready. Used by
/// the synchronous read/write helpers.
fn wait_single(fd: RawFd, events: libc::c_short) {
    let mut pollfd = libc::pollfd {
        fd,
        events,
        revents: 0,
    };
    // SAFETY: `pollfd` is a valid array of one entry.
    let _ = retry_eintr!(unsafe { libc::poll(&raw mut pollfd, 1, -1) });
}

#[cfg(test)]
mod tests {
    use static_assertions::assert_not_impl_any;

    use super::*;
    use crate::engine::ChannelEngine;
    use crate::listener::Listener;

    assert_not_impl_any!(Channel<'static>: Send, Sync);
    assert_not_impl_any!(ChannelEngine<'static>: Send, Sync);
    assert_not_impl_any!(Listener<'static>: Send, Sync);

    #[test]
    fn iovec_describes_its_slice() {
        let data = *b"remnant";
        let iov = IoVec::new(&data);
        assert_eq!(iov.len(), 7);
        assert!(!iov.is_empty());

        let empty = IoVec::new(&[]);
        assert!(empty.is_empty());
    }

    #[test]
    fn flag_defaults_are_empty() {
        assert_eq!(ChannelFlags::default(), ChannelFlags::empty());
        assert!(!ChannelFlags::default().contains(ChannelFlags::USE_NAGLE));
    }

    #[test]
    fn channels_report_their_descriptor() {
        let ctx = keel_mem::Context::new();
        let engine = ChannelEngine::new(&ctx).expect("engine");
        let (a, b) = engine.pipe().expect("pipe");

        assert_ne!(a.fd(), b.fd());
        assert!(a.fd() >= 0);
        assert!(!a.wants_read());
        assert!(!a.wants_write());
    }
}

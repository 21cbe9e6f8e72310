// Copyright (c) The Keel Project Authors.
// Licensed under the MIT License.

//! The per-context event engine.
//!
//! One engine multiplexes every channel and listener of its context over a
//! readiness poller. A [`run`](ChannelEngine::run) call makes exactly one
//! pass: re-present any buffered data to consumers that re-armed reading,
//! collect one batch of ready events, dispatch the read/write protocols, and
//! return. Applications drive passes in their own loop.

use std::marker::PhantomData;
use std::ptr::NonNull;
use std::time::Duration;

use keel_error::{Error, ErrorHub, code_values};
use keel_mem::{Context, Pool};

use crate::channel::{ChannelData, ReadOutcome};
use crate::listener::ListenerData;
use crate::pal::{Event, Poller};

/// Default capacity of an engine read buffer. Deliberately a little under
/// 16 KiB so the allocation plus its header stays within two standard pool
/// blocks' worth of slack.
pub const READ_BUFFER_DEFAULT: usize = 16_000;

/// A buffer holding data read from a channel that its consumer has not yet
/// taken. Buffers recycle through the engine's avail list once drained.
pub(crate) struct ReadBuf<'ctx> {
    /// The channel this data belongs to; `None` while on the avail list.
    pub channel: Option<NonNull<ChannelData<'ctx>>>,

    pub mem: NonNull<u8>,
    pub cap: usize,

    /// Unconsumed region after a partial consumption.
    pub current: NonNull<u8>,
    pub remaining: usize,

    /// Pending-list / avail-list link.
    pub next: Option<NonNull<ReadBuf<'ctx>>>,
}

pub(crate) struct EngineInner<'ctx> {
    pub ctx: &'ctx Context,

    /// Backing pool for channels, listeners, and read buffers.
    pub pool: Pool<'ctx>,

    /// Cleared after every callback invocation; callbacks must copy out
    /// anything they want to keep.
    pub scratch: Pool<'ctx>,

    pub poller: Poller,
    pub in_run: bool,

    pub default_readbuf: usize,

    /// Buffers with unconsumed data, exerting back-pressure on their peers.
    pub pending: Option<NonNull<ReadBuf<'ctx>>>,

    /// Drained buffers available for reuse.
    pub avail: Option<NonNull<ReadBuf<'ctx>>>,

    /// All live channels and listeners, for teardown.
    pub channels: Option<NonNull<ChannelData<'ctx>>>,
    pub listeners: Option<NonNull<ListenerData<'ctx>>>,

    /// Event batch storage, reused across passes.
    events: Vec<Event>,
}

/// The event-driven I/O engine of a context.
///
/// At most one engine may be attached to a context at a time. The engine owns
/// a private pool rooted in the context; channels, listeners, and read buffers
/// all live there.
pub struct ChannelEngine<'ctx> {
    inner: NonNull<EngineInner<'ctx>>,

    /// Engines are single-threaded, like their context.
    _not_send: PhantomData<*mut ()>,
}

impl<'ctx> ChannelEngine<'ctx> {
    /// Attaches an engine to `ctx`.
    ///
    /// # Errors
    ///
    /// `BAD_PARAM` when the context already has an engine;
    /// `UNSPECIFIED_OS` when the OS poller cannot be created.
    pub fn new(ctx: &'ctx Context) -> keel_error::Result<Self> {
        if !ctx.claim_engine_slot() {
            return Err(Error::with_message(
                ctx.hub(),
                code_values::BAD_PARAM,
                "context already has a channel engine",
            ));
        }

        let poller = match Poller::new() {
            Ok(poller) => poller,
            Err(err) => {
                ctx.release_engine_slot();
                return Err(Error::with_message(
                    ctx.hub(),
                    code_values::UNSPECIFIED_OS,
                    format!("creating the event poller: {err}"),
                ));
            }
        };

        let pool = ctx.root_pool();
        let scratch = pool.create();

        let inner = Box::new(EngineInner {
            ctx,
            pool,
            scratch,
            poller,
            in_run: false,
            default_readbuf: READ_BUFFER_DEFAULT,
            pending: None,
            avail: None,
            channels: None,
            listeners: None,
            events: Vec::new(),
        });

        Ok(Self {
            // SAFETY: Box::into_raw never returns null.
            inner: unsafe { NonNull::new_unchecked(Box::into_raw(inner)) },
            _not_send: PhantomData,
        })
    }

    pub(crate) fn raw(&self) -> NonNull<EngineInner<'ctx>> {
        self.inner
    }

    /// The error hub of the owning context.
    #[must_use]
    pub fn hub(&self) -> &'ctx ErrorHub {
        // SAFETY: the engine is live for &self.
        unsafe { (*self.inner.as_ptr()).ctx.hub() }
    }

    /// Runs one pass of the event loop, bounded by `timeout`.
    ///
    /// The pass first re-presents buffered data to any consumer that re-armed
    /// reading since the last pass, then collects and dispatches one batch of
    /// ready events. Returns once the batch is dispatched or the timeout
    /// elapses with nothing ready.
    ///
    /// # Errors
    ///
    /// `IMPROPER_REENTRY` when called from inside a callback of the same
    /// engine; `UNSPECIFIED_OS` if the poller itself fails. Errors returned by
    /// callbacks do not unwind through here; the engine records them (on the
    /// context's unhandled list when tracking is enabled) and keeps going.
    pub fn run(&self, timeout: Duration) -> keel_error::Result<()> {
        self.handle().run(timeout)
    }

    /// A copyable reference to this engine, usable from inside callbacks
    /// (reaching it through [`Channel::engine`](crate::Channel::engine)).
    #[must_use]
    pub fn handle(&self) -> EngineRef<'ctx> {
        EngineRef {
            inner: self.inner,
            _marker: PhantomData,
        }
    }

    /// Sets the default read-buffer capacity for channels that have not chosen
    /// their own via [`Channel::set_readbuf`](crate::Channel::set_readbuf).
    pub fn set_default_readbuf(&self, cap: usize) {
        // SAFETY: the engine is live for &self.
        unsafe {
            (*self.inner.as_ptr()).default_readbuf = cap.max(1);
        }
    }
}

impl Drop for ChannelEngine<'_> {
    fn drop(&mut self) {
        let eng = self.inner;
        // SAFETY: the engine and everything linked into it are live; this is
        // the single teardown point.
        unsafe {
            while let Some(ch) = (*eng.as_ptr()).channels {
                crate::channel::destroy_raw(eng, ch);
            }
            while let Some(ld) = (*eng.as_ptr()).listeners {
                crate::listener::destroy_raw(eng, ld);
            }

            let ctx = (*eng.as_ptr()).ctx;
            (*eng.as_ptr()).pool.destroy();
            ctx.release_engine_slot();

            drop(Box::from_raw(eng.as_ptr()));
        }
    }
}

impl std::fmt::Debug for ChannelEngine<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelEngine").finish_non_exhaustive()
    }
}

/// A copyable, non-owning reference to a [`ChannelEngine`].
///
/// Valid while the engine is alive, like channel handles. Callbacks receive
/// channels, and a channel yields this via
/// [`Channel::engine`](crate::Channel::engine), which is also how a callback
/// that tries to re-enter the loop gets its `IMPROPER_REENTRY` answer.
#[derive(Clone, Copy)]
pub struct EngineRef<'e> {
    inner: NonNull<EngineInner<'e>>,

    _marker: PhantomData<(&'e (), *mut ())>,
}

impl<'e> EngineRef<'e> {
    pub(crate) fn from_raw(inner: NonNull<EngineInner<'e>>) -> Self {
        Self {
            inner,
            _marker: PhantomData,
        }
    }

    /// The error hub of the owning context.
    #[must_use]
    pub fn hub(self) -> &'e ErrorHub {
        // SAFETY: the engine is live per the handle contract.
        unsafe { (*self.inner.as_ptr()).ctx.hub() }
    }

    /// Runs one pass of the event loop. See [`ChannelEngine::run`].
    ///
    /// # Errors
    ///
    /// As [`ChannelEngine::run`]; in particular `IMPROPER_REENTRY` when called
    /// from inside one of this engine's callbacks.
    pub fn run(self, timeout: Duration) -> keel_error::Result<()> {
        let eng = self.inner;

        // SAFETY: the engine is live; single-threaded by contract.
        unsafe {
            if (*eng.as_ptr()).in_run {
                return Err(Error::new(self.hub(), code_values::IMPROPER_REENTRY));
            }
            (*eng.as_ptr()).in_run = true;
            let result = run_pass(eng, timeout);
            (*eng.as_ptr()).in_run = false;
            result
        }
    }
}

impl std::fmt::Debug for EngineRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRef").finish_non_exhaustive()
    }
}

/// One loop pass: pending re-presentation, poll, dispatch.
///
/// # Safety
///
/// `eng` must be a live engine with the reentry guard held.
unsafe fn run_pass(eng: NonNull<EngineInner<'_>>, timeout: Duration) -> keel_error::Result<()> {
    // SAFETY: per contract.
    unsafe {
        present_pending(eng);

        let timeout_ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);

        // Detach the batch storage so dispatch can freely mutate the engine.
        let mut events = std::mem::take(&mut (*eng.as_ptr()).events);
        events.clear();

        let waited = (*eng.as_ptr()).poller.wait(timeout_ms, &mut events);
        if let Err(err) = waited {
            (*eng.as_ptr()).events = events;
            return Err(Error::with_message(
                (*eng.as_ptr()).ctx.hub(),
                code_values::UNSPECIFIED_OS,
                format!("polling for channel readiness: {err}"),
            ));
        }

        tracing::trace!(ready = events.len(), "event pass dispatching");

        for event in &events {
            dispatch(eng, *event);
        }

        (*eng.as_ptr()).events = events;
        Ok(())
    }
}

/// Routes one readiness report. Listener tokens carry a tag in bit 0 (both
/// record types are at least word-aligned, so the bit is free).
unsafe fn dispatch(eng: NonNull<EngineInner<'_>>, event: Event) {
    // SAFETY: tokens are the addresses of live records registered by us.
    unsafe {
        if event.token & 1 == 1 {
            let ld = NonNull::new_unchecked(((event.token & !1) as usize as *mut ()).cast::<ListenerData<'_>>());
            if event.readable {
                crate::listener::accept_ready(eng, ld);
            }
            return;
        }

        let ch = NonNull::new_unchecked((event.token as usize as *mut ()).cast::<ChannelData<'_>>());
        let mut dirty = false;

        if event.readable && (*ch.as_ptr()).desire_read {
            dirty = perform_read(eng, ch);
        }
        if event.writable && (*ch.as_ptr()).desire_write {
            dirty |= crate::write::perform_write(eng, ch);
        }

        if dirty {
            crate::channel::sync_registration(eng, ch);
        }
    }
}

/// Walks the pending list and re-presents buffered data to every channel that
/// has re-armed reading. Runs before any OS read in the pass.
unsafe fn present_pending(eng: NonNull<EngineInner<'_>>) {
    // SAFETY: pending buffers and their channels are live engine records.
    unsafe {
        let mut link: *mut Option<NonNull<ReadBuf<'_>>> = &raw mut (*eng.as_ptr()).pending;
        while let Some(buf) = *link {
            let ch = (*buf.as_ptr()).channel.expect("pending buffers always have a channel");
            if !(*ch.as_ptr()).desire_read {
                link = &raw mut (*buf.as_ptr()).next;
                continue;
            }

            let data = std::slice::from_raw_parts((*buf.as_ptr()).current.as_ptr(), (*buf.as_ptr()).remaining);
            let outcome = crate::channel::invoke_read(eng, ch, Some(data));

            match outcome {
                Ok(ReadOutcome::Consumed(n)) if n >= (*buf.as_ptr()).remaining => {
                    // Fully drained: detach and recycle. The channel keeps its
                    // read desire and will reach the OS in this same pass.
                    *link = (*buf.as_ptr()).next.take();
                    recycle_buf(eng, buf);
                }
                Ok(ReadOutcome::Continue) => {
                    *link = (*buf.as_ptr()).next.take();
                    recycle_buf(eng, buf);
                }
                Ok(ReadOutcome::Consumed(n)) => {
                    (*buf.as_ptr()).current = (*buf.as_ptr()).current.add(n);
                    (*buf.as_ptr()).remaining -= n;
                    (*ch.as_ptr()).desire_read = false;
                    crate::channel::sync_registration(eng, ch);
                    link = &raw mut (*buf.as_ptr()).next;
                }
                Ok(ReadOutcome::Stop) => {
                    (*ch.as_ptr()).desire_read = false;
                    crate::channel::sync_registration(eng, ch);
                    link = &raw mut (*buf.as_ptr()).next;
                }
                Err(err) => {
                    absorb_error(eng, err);
                    (*ch.as_ptr()).desire_read = false;
                    crate::channel::sync_registration(eng, ch);
                    link = &raw mut (*buf.as_ptr()).next;
                }
            }
        }
    }
}

/// The read protocol. Returns `true` when the channel's interest state
/// changed ("dirty") and its registration must be recomputed.
pub(crate) unsafe fn perform_read<'ctx>(eng: NonNull<EngineInner<'ctx>>, ch: NonNull<ChannelData<'ctx>>) -> bool {
    // SAFETY: engine and channel are live; buffers are exclusively owned
    // between the lists they sit on.
    unsafe {
        let fd = (*ch.as_ptr()).fd;

        loop {
            let cap = (*ch.as_ptr()).readbuf_cap;
            let buf = take_buf(eng, cap);

            let n = crate::pal::retry_eintr!(libc::read(fd, (*buf.as_ptr()).mem.as_ptr().cast(), cap));

            if n == 0 {
                // EOF. Reading is over until the application says otherwise.
                recycle_buf(eng, buf);
                (*ch.as_ptr()).desire_read = false;
                return true;
            }

            if n < 0 {
                let errno = std::io::Error::last_os_error();
                recycle_buf(eng, buf);

                if matches!(errno.raw_os_error(), Some(libc::EAGAIN | libc::EWOULDBLOCK)) {
                    // Kernel drained: let the consumer declare its intention.
                    return match crate::channel::invoke_read(eng, ch, None) {
                        Ok(ReadOutcome::Stop) => {
                            (*ch.as_ptr()).desire_read = false;
                            true
                        }
                        Ok(_) => false,
                        Err(err) => {
                            absorb_error(eng, err);
                            (*ch.as_ptr()).desire_read = false;
                            true
                        }
                    };
                }

                absorb_error(
                    eng,
                    Error::with_message(
                        (*eng.as_ptr()).ctx.hub(),
                        code_values::UNSPECIFIED_OS,
                        format!("reading from channel: {errno}"),
                    ),
                );
                (*ch.as_ptr()).desire_read = false;
                return true;
            }

            let n = n as usize;
            let data = std::slice::from_raw_parts((*buf.as_ptr()).mem.as_ptr(), n);

            match crate::channel::invoke_read(eng, ch, Some(data)) {
                Ok(ReadOutcome::Consumed(c)) if c >= n => {
                    // Everything taken: drain the kernel some more.
                    recycle_buf(eng, buf);
                }
                Ok(ReadOutcome::Continue) => {
                    recycle_buf(eng, buf);
                }
                Ok(ReadOutcome::Consumed(c)) => {
                    // Partial consumption: park the remainder and stop reading
                    // from the OS: back-pressure on the peer.
                    stash_pending(eng, ch, buf, c, n);
                    (*ch.as_ptr()).desire_read = false;
                    return true;
                }
                Ok(ReadOutcome::Stop) => {
                    stash_pending(eng, ch, buf, 0, n);
                    (*ch.as_ptr()).desire_read = false;
                    return true;
                }
                Err(err) => {
                    absorb_error(eng, err);
                    recycle_buf(eng, buf);
                    (*ch.as_ptr()).desire_read = false;
                    return true;
                }
            }
        }
    }
}

/// Parks `buf` (bytes `consumed..n`) on the pending list for `ch`.
unsafe fn stash_pending<'ctx>(
    eng: NonNull<EngineInner<'ctx>>,
    ch: NonNull<ChannelData<'ctx>>,
    buf: NonNull<ReadBuf<'ctx>>,
    consumed: usize,
    n: usize,
) {
    // SAFETY: per callers; the buffer holds `n` valid bytes.
    unsafe {
        (*buf.as_ptr()).channel = Some(ch);
        (*buf.as_ptr()).current = (*buf.as_ptr()).mem.add(consumed);
        (*buf.as_ptr()).remaining = n - consumed;
        (*buf.as_ptr()).next = (*eng.as_ptr()).pending;
        (*eng.as_ptr()).pending = Some(buf);
    }
}

/// Pops a drained buffer with at least `cap` capacity, or builds a fresh one
/// from the engine pool.
unsafe fn take_buf<'ctx>(eng: NonNull<EngineInner<'ctx>>, cap: usize) -> NonNull<ReadBuf<'ctx>> {
    // SAFETY: avail-list buffers are live and exclusively ours.
    unsafe {
        let mut link: *mut Option<NonNull<ReadBuf<'ctx>>> = &raw mut (*eng.as_ptr()).avail;
        while let Some(buf) = *link {
            if (*buf.as_ptr()).cap >= cap {
                *link = (*buf.as_ptr()).next.take();
                return buf;
            }
            link = &raw mut (*buf.as_ptr()).next;
        }

        let pool = (*eng.as_ptr()).pool;
        let mem = pool.alloc(cap);
        let buf = pool.alloc(size_of::<ReadBuf<'_>>()).cast::<ReadBuf<'ctx>>();
        buf.write(ReadBuf {
            channel: None,
            mem,
            cap,
            current: mem,
            remaining: 0,
            next: None,
        });
        buf
    }
}

/// Returns a drained buffer to the avail list.
pub(crate) unsafe fn recycle_buf<'ctx>(eng: NonNull<EngineInner<'ctx>>, buf: NonNull<ReadBuf<'ctx>>) {
    // SAFETY: the buffer is detached and exclusively ours.
    unsafe {
        (*buf.as_ptr()).channel = None;
        (*buf.as_ptr()).remaining = 0;
        (*buf.as_ptr()).current = (*buf.as_ptr()).mem;
        (*buf.as_ptr()).next = (*eng.as_ptr()).avail;
        (*eng.as_ptr()).avail = Some(buf);
    }
}

/// Drops every pending buffer belonging to `ch` back onto the avail list.
/// Used by channel destruction.
pub(crate) unsafe fn drop_channel_pending<'ctx>(eng: NonNull<EngineInner<'ctx>>, ch: NonNull<ChannelData<'ctx>>) {
    // SAFETY: pending buffers are live engine records.
    unsafe {
        let mut link: *mut Option<NonNull<ReadBuf<'ctx>>> = &raw mut (*eng.as_ptr()).pending;
        while let Some(buf) = *link {
            if (*buf.as_ptr()).channel == Some(ch) {
                *link = (*buf.as_ptr()).next.take();
                recycle_buf(eng, buf);
            } else {
                link = &raw mut (*buf.as_ptr()).next;
            }
        }
    }
}

/// Records an error produced by a callback or an I/O path the engine cannot
/// propagate from. With unhandled tracking on, the error stays inspectable on
/// the context; otherwise the engine releases it here.
pub(crate) unsafe fn absorb_error(eng: NonNull<EngineInner<'_>>, err: Error) {
    // SAFETY: the engine and its context are live.
    unsafe {
        let hub = (*eng.as_ptr()).ctx.hub();
        tracing::debug!(errval = err.errval(), "channel engine absorbed an error");
        if hub.tracks_unhandled() {
            // Already parked on the unhandled list at creation; keep it there
            // for post-mortem inspection.
            drop(err);
        } else {
            err.handled();
        }
    }
}

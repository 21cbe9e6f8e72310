// Copyright (c) The Keel Project Authors.
// Licensed under the MIT License.

use std::marker::PhantomData;
use std::ptr::NonNull;

use keel_error::{Errmap, Error, ErrorHub};
use rustc_hash::FxHashMap;

use crate::block::{os_free, round_up};
use crate::cleanup::CleanupRec;
use crate::memroot::Memroot;
use crate::memtree::{self, TreeNode};
use crate::pool::{Pool, PoolData};
use crate::track::{TrackList, TrackReg};

/// Requesting this standard block size means "use the context default".
pub const DEFAULT_STDSIZE: usize = 0;

/// The context default standard block size.
pub const STDSIZE_DEFAULT: usize = 8192;

/// The smallest permitted standard block size; smaller requests are clamped.
pub const STDSIZE_MIN: usize = 256;

/// What an OOM handler wants done about a failed OS allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OomResponse {
    /// Try the allocation again (the handler presumably released something).
    Retry,
    /// Give up on this allocation; `try_alloc` callers observe `None`.
    Surrender,
    /// Abort the process.
    Abort,
}

/// Policy callback invoked with the requested byte count when the OS refuses
/// an allocation.
pub type OomHandler = fn(usize) -> OomResponse;

/// The context record. Handles reach it through a raw pointer; everything
/// under one context is single-threaded by contract.
pub(crate) struct Cx {
    pub stdsize: usize,
    pub oom_handler: Option<OomHandler>,

    /// Root-pool configurations, most recent first.
    pub memroots: Option<NonNull<Memroot>>,

    /// Shared best-fit index of returned non-standard blocks.
    pub nonstd: Option<NonNull<TreeNode>>,

    /// Lazily-rooted private pools backing the registries.
    pub cleanup_pool: Option<NonNull<PoolData>>,
    pub track_pool: Option<NonNull<PoolData>>,

    /// Free-lists of recycled registry records.
    pub free_cleanups: Vec<NonNull<CleanupRec>>,
    pub free_tregs: Vec<NonNull<TrackReg>>,
    pub free_tlists: Vec<NonNull<TrackList>>,

    /// Tracked pointer -> record.
    pub tracked: FxHashMap<usize, NonNull<TrackReg>>,

    pub hub: ErrorHub,

    /// A context hosts at most one channel engine.
    pub engine_attached: bool,
}

impl Cx {
    pub(crate) fn hub(&self) -> &ErrorHub {
        &self.hub
    }
}

/// The top-level object: one independent instance of the runtime.
///
/// A context owns all of its pools, registries, and (if one is attached) its
/// channel engine. Contexts share nothing; an application may create several
/// and drive them from different threads, but everything belonging to a single
/// context stays on one thread.
pub struct Context {
    cx: NonNull<Cx>,

    /// Single-threaded by contract.
    _not_send: PhantomData<*mut ()>,
}

impl Context {
    /// Creates a context with default configuration: 8 KiB standard blocks,
    /// aborting OOM policy, unhandled-error tracking on.
    #[must_use]
    pub fn new() -> Self {
        Self::custom(DEFAULT_STDSIZE, None, true)
    }

    /// Creates a context with explicit configuration.
    ///
    /// `stdsize` of [`DEFAULT_STDSIZE`] selects the 8 KiB default; values
    /// below [`STDSIZE_MIN`] are clamped up. With no `oom_handler`, a refused
    /// OS allocation aborts, preserving the "alloc never returns null"
    /// invariant.
    #[must_use]
    pub fn custom(stdsize: usize, oom_handler: Option<OomHandler>, track_unhandled: bool) -> Self {
        let stdsize = if stdsize == DEFAULT_STDSIZE {
            STDSIZE_DEFAULT
        } else {
            round_up(stdsize.max(STDSIZE_MIN))
        };

        let cx = Box::new(Cx {
            stdsize,
            oom_handler,
            memroots: None,
            nonstd: None,
            cleanup_pool: None,
            track_pool: None,
            free_cleanups: Vec::new(),
            free_tregs: Vec::new(),
            free_tlists: Vec::new(),
            tracked: FxHashMap::default(),
            hub: ErrorHub::new(track_unhandled),
            engine_attached: false,
        });

        Self {
            // SAFETY: Box::into_raw never returns null.
            cx: unsafe { NonNull::new_unchecked(Box::into_raw(cx)) },
            _not_send: PhantomData,
        }
    }

    pub(crate) fn raw(&self) -> NonNull<Cx> {
        self.cx
    }

    /// The context's error hub: tracing/tracking flags and namespace maps.
    #[must_use]
    pub fn hub(&self) -> &ErrorHub {
        // SAFETY: the context is live for &self.
        unsafe { &(*self.cx.as_ptr()).hub }
    }

    /// Registers (or retrieves) an application error-code namespace.
    #[must_use]
    pub fn errmap(&self, namespace: &str) -> Errmap {
        self.hub().errmap(namespace)
    }

    /// Enables or disables error trace frames.
    pub fn set_tracing(&self, tracing: bool) {
        self.hub().set_tracing(tracing);
    }

    /// Returns the next unhandled error for post-mortem inspection, if any.
    /// See [`ErrorHub::unhandled`].
    #[must_use]
    pub fn unhandled(&self) -> Option<Error> {
        self.hub().unhandled()
    }

    /// The context's standard block size.
    #[must_use]
    pub fn stdsize(&self) -> usize {
        // SAFETY: the context is live for &self.
        unsafe { (*self.cx.as_ptr()).stdsize }
    }

    /// Claims the context's single channel-engine slot. Returns `false` when
    /// an engine is already attached. Used by the I/O layer.
    pub fn claim_engine_slot(&self) -> bool {
        // SAFETY: the context is live for &self.
        unsafe {
            if (*self.cx.as_ptr()).engine_attached {
                return false;
            }
            (*self.cx.as_ptr()).engine_attached = true;
            true
        }
    }

    /// Releases the channel-engine slot. Used by the I/O layer on engine
    /// teardown.
    pub fn release_engine_slot(&self) {
        // SAFETY: the context is live for &self.
        unsafe {
            (*self.cx.as_ptr()).engine_attached = false;
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        // SAFETY: the context is live until the end of this function and owns
        // everything it reaches.
        unsafe {
            // Blast all memroots; this covers the registries' private pools and
            // anything an attached engine left behind. Destroying the head each
            // round keeps the unlink cheap.
            while let Some(memroot) = (*self.cx.as_ptr()).memroots {
                crate::pool::destroy_raw((*memroot.as_ptr()).pool);
            }

            // Drain the shared non-standard index back to the OS, smallest
            // node first until it runs out.
            while (*self.cx.as_ptr()).nonstd.is_some() {
                let block = memtree::fetch(&mut (*self.cx.as_ptr()).nonstd, size_of::<TreeNode>())
                    .expect("a non-empty tree yields its smallest block");
                os_free(block);
            }

            drop(Box::from_raw(self.cx.as_ptr()));
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context").field("stdsize", &self.stdsize()).finish()
    }
}

/// Resolves a requested per-memroot block size against the context default.
pub(crate) fn resolve_stdsize(ctx_default: usize, requested: usize) -> usize {
    if requested == DEFAULT_STDSIZE {
        ctx_default
    } else {
        round_up(requested.max(STDSIZE_MIN))
    }
}

/// The context's cleanup-record pool, rooted on first use.
///
/// # Safety
///
/// `cx` must be a live context.
pub(crate) unsafe fn cleanup_pool_of(cx: NonNull<Cx>) -> Pool<'static> {
    // SAFETY: per contract.
    unsafe {
        if (*cx.as_ptr()).cleanup_pool.is_none() {
            (*cx.as_ptr()).cleanup_pool = Some(crate::pool::create_root(cx, DEFAULT_STDSIZE));
        }
        Pool::from_raw((*cx.as_ptr()).cleanup_pool.expect("just rooted"))
    }
}

/// The context's tracking-record pool, rooted on first use.
///
/// # Safety
///
/// `cx` must be a live context.
pub(crate) unsafe fn track_pool_of(cx: NonNull<Cx>) -> Pool<'static> {
    // SAFETY: per contract.
    unsafe {
        if (*cx.as_ptr()).track_pool.is_none() {
            (*cx.as_ptr()).track_pool = Some(crate::pool::create_root(cx, DEFAULT_STDSIZE));
        }
        Pool::from_raw((*cx.as_ptr()).track_pool.expect("just rooted"))
    }
}

#[cfg(test)]
mod tests {
    use static_assertions::assert_not_impl_any;

    use super::*;

    assert_not_impl_any!(Context: Send, Sync);

    #[test]
    fn contexts_are_independent() {
        let a = Context::new();
        let b = Context::custom(1024, None, false);

        assert_eq!(a.stdsize(), STDSIZE_DEFAULT);
        assert_eq!(b.stdsize(), 1024);

        let pa = a.root_pool();
        let pb = b.root_pool();
        let _ = pa.alloc(100);
        let _ = pb.alloc(100);

        pa.destroy();
        drop(a);

        // b is untouched by a's teardown.
        let _ = pb.alloc(100);
        pb.destroy();
    }

    #[test]
    fn teardown_collects_live_pools() {
        let ctx = Context::new();
        let root = ctx.root_pool();
        let child = root.create();
        let _ = child.alloc(50_000);

        // No explicit destroy: dropping the context reclaims everything.
        drop(ctx);
    }

    #[test]
    fn unhandled_errors_survive_until_inspected() {
        let ctx = Context::new();
        let pool = ctx.root_pool();
        let other = ctx.root_pool();

        let err = pool.reparent(other).expect_err("roots cannot be reparented");
        // Deliberately do not handle; it stays visible on the context.
        drop(err);

        let seen = ctx.unhandled().expect("the dropped error is parked");
        assert_eq!(seen.errval(), keel_error::code_values::BAD_PARAM);
        seen.handled();
        assert!(ctx.unhandled().is_none());

        pool.destroy();
        other.destroy();
    }

    #[test]
    fn engine_slot_is_exclusive() {
        let ctx = Context::new();
        assert!(ctx.claim_engine_slot());
        assert!(!ctx.claim_engine_slot());
        ctx.release_engine_slot();
        assert!(ctx.claim_engine_slot());
        ctx.release_engine_slot();
    }
}

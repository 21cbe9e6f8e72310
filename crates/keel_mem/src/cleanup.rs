// Copyright (c) The Keel Project Authors.
// Licensed under the MIT License.

//! Per-pool ordered teardown.
//!
//! Each pool keeps an ordered list of `(data, cleanup_fn)` records that run
//! head to tail when the pool is cleared or destroyed. Registration is
//! idempotent per `data` pointer (last functions win), and
//! [`Pool::cleanup_before`] imposes a partial order on execution.
//!
//! Records are recycled through a context-wide free-list; the records
//! themselves are allocated from a context-private pool that exists only once
//! cleanups are first used.

use std::ptr::NonNull;

use keel_error::{Error, code_values};

use crate::context::Cx;
use crate::pool::{Pool, PoolData};

/// A cleanup callback. Receives the registered `data` pointer.
///
/// # Safety
///
/// Invoked with the exact pointer registered; the registrant guarantees it is
/// still valid at teardown time.
pub type CleanupFn = unsafe fn(*mut ());

/// Invoked instead of the cleanup when the owning pool is moved to a different
/// context by a reparent.
///
/// # Safety
///
/// As [`CleanupFn`].
pub type ShiftFn = unsafe fn(*mut ());

pub(crate) struct CleanupRec {
    data: *mut (),
    cleanup: CleanupFn,
    shift: Option<ShiftFn>,
    next: Option<NonNull<CleanupRec>>,
}

/// Pops a record from the context free-list, or carves a fresh one out of the
/// context's cleanup pool.
unsafe fn get_record(cx: NonNull<Cx>) -> NonNull<CleanupRec> {
    // SAFETY: the context is live; recycled records are exclusively ours.
    unsafe {
        if let Some(rec) = (*cx.as_ptr()).free_cleanups.pop() {
            return rec;
        }
        let pool = crate::context::cleanup_pool_of(cx);
        pool.alloc(size_of::<CleanupRec>()).cast()
    }
}

/// Locates the record for `data`, detaches it, and recycles it. Returns the
/// registered cleanup, or `None` when `data` was never registered.
unsafe fn extract(cx: NonNull<Cx>, head: *mut Option<NonNull<CleanupRec>>, data: *mut ()) -> Option<CleanupFn> {
    // SAFETY: the list is live and owned by the pool `head` belongs to.
    unsafe {
        let mut link = head;
        while let Some(rec) = *link {
            if (*rec.as_ptr()).data == data {
                *link = (*rec.as_ptr()).next;
                (*rec.as_ptr()).next = None;
                let cleanup = (*rec.as_ptr()).cleanup;
                (*cx.as_ptr()).free_cleanups.push(rec);
                return Some(cleanup);
            }
            link = &raw mut (*rec.as_ptr()).next;
        }
        None
    }
}

impl Pool<'_> {
    /// Registers `cleanup` to run against `data` when this pool is cleared or
    /// destroyed.
    ///
    /// Registering the same `data` again only replaces the functions; it does
    /// not duplicate the record or change its position. `shift` (optional) is
    /// invoked instead of running anything if a reparent moves this pool to a
    /// different context.
    pub fn cleanup_register(self, data: *mut (), cleanup: CleanupFn, shift: Option<ShiftFn>) {
        let pd = self.raw();
        let cx = self.cx();

        // SAFETY: the pool and its list are live.
        unsafe {
            let mut scan = (*pd.as_ptr()).cleanups;
            while let Some(rec) = scan {
                if (*rec.as_ptr()).data == data {
                    (*rec.as_ptr()).cleanup = cleanup;
                    (*rec.as_ptr()).shift = shift;
                    return;
                }
                scan = (*rec.as_ptr()).next;
            }

            let rec = get_record(cx);
            rec.write(CleanupRec {
                data,
                cleanup,
                shift,
                next: (*pd.as_ptr()).cleanups,
            });
            (*pd.as_ptr()).cleanups = Some(rec);
        }
    }

    /// Detaches the record for `data` without running it. Unknown `data` is a
    /// no-op.
    pub fn cleanup_deregister(self, data: *mut ()) {
        let pd = self.raw();
        // SAFETY: the pool and its list are live.
        unsafe {
            let _ = extract(self.cx(), &raw mut (*pd.as_ptr()).cleanups, data);
        }
    }

    /// Ensures `before` runs before `after` at teardown.
    ///
    /// The rule is to push the *after* item away from the head, never to pull
    /// the *before* item toward it. Starting from `HEAD -> A -> B -> C` and
    /// applying `before(C, B)` then `before(B, A)`:
    ///
    /// - pulling the before item toward the head would end at
    ///   `HEAD -> B -> A -> C`, losing the first constraint;
    /// - pushing the after item away ends at `HEAD -> C -> B -> A`, keeping
    ///   both.
    ///
    /// When `before` is not registered at all, the detached `after` record is
    /// appended at the tail (pulling it to the head instead would break
    /// orderings already established against it).
    pub fn cleanup_before(self, before: *mut (), after: *mut ()) {
        let pd = self.raw();

        // SAFETY: the pool and its list are live.
        unsafe {
            let head = &raw mut (*pd.as_ptr()).cleanups;
            if (*head).is_none() {
                return;
            }

            // Fast path: BEFORE already at the head.
            if let Some(first) = *head {
                if (*first.as_ptr()).data == before {
                    return;
                }
            }

            // Detach AFTER when we pass it; re-insert just past BEFORE.
            let mut detached: Option<NonNull<CleanupRec>> = None;

            if let Some(first) = *head {
                if (*first.as_ptr()).data == after {
                    if (*first.as_ptr()).next.is_none() {
                        // The only record; nothing to reorder.
                        return;
                    }
                    detached = Some(first);
                    *head = (*first.as_ptr()).next;

                    if let Some(now_first) = *head {
                        if (*now_first.as_ptr()).data == before {
                            (*first.as_ptr()).next = (*now_first.as_ptr()).next;
                            (*now_first.as_ptr()).next = Some(first);
                            return;
                        }
                    }
                }
            }

            let mut scan = (*head).expect("list is non-empty here");
            loop {
                let Some(next) = (*scan.as_ptr()).next else { break };

                if (*next.as_ptr()).data == before {
                    let Some(rec) = detached else {
                        // Found BEFORE first: the order already holds.
                        return;
                    };
                    (*rec.as_ptr()).next = (*next.as_ptr()).next;
                    (*next.as_ptr()).next = Some(rec);
                    return;
                }

                if (*next.as_ptr()).data == after {
                    detached = Some(next);
                    (*scan.as_ptr()).next = (*next.as_ptr()).next;
                    continue;
                }

                scan = next;
            }

            // BEFORE is not registered. Append the detached record at the tail
            // (SCAN still points there) so orderings already established
            // against AFTER stay intact.
            if let Some(rec) = detached {
                (*rec.as_ptr()).next = None;
                (*scan.as_ptr()).next = Some(rec);
            }
        }
    }

    /// Runs the cleanup registered for `data` now and deregisters it. Unknown
    /// `data` is a no-op.
    ///
    /// # Errors
    ///
    /// `IMPROPER_CLEANUP` when `data` is in the tracking graph with live
    /// owners; the record is left in place.
    pub fn cleanup_run(self, data: *mut ()) -> keel_error::Result<()> {
        let cx = self.cx();

        // SAFETY: the pool, its list, and the context registry are live.
        unsafe {
            if crate::track::has_owners(cx, data) {
                return Err(Error::new((*cx.as_ptr()).hub(), code_values::IMPROPER_CLEANUP));
            }

            let pd = self.raw();
            if let Some(cleanup) = extract(cx, &raw mut (*pd.as_ptr()).cleanups, data) {
                cleanup(data);
            }
        }
        Ok(())
    }
}

/// Drains the pool's current cleanup list, head to tail. Each record is
/// detached and recycled before its callback runs, so a callback that
/// registers a new cleanup may reuse the storage; new registrations land on
/// the (now empty) live list and are picked up by the caller's next drain.
///
/// # Safety
///
/// `pd` must be a live pool.
pub(crate) unsafe fn drain(pd: NonNull<PoolData>) {
    // SAFETY: per contract; records are live until recycled here.
    unsafe {
        let cx = (*(*pd.as_ptr()).memroot.as_ptr()).cx;

        let mut scan = (*pd.as_ptr()).cleanups.take();
        while let Some(rec) = scan {
            scan = (*rec.as_ptr()).next.take();

            let cleanup = (*rec.as_ptr()).cleanup;
            let data = (*rec.as_ptr()).data;
            (*cx.as_ptr()).free_cleanups.push(rec);

            tracing::trace!(?data, "running pool cleanup");
            cleanup(data);
        }
    }
}

/// Fires the shift callback of every registered cleanup on `pd`; used when a
/// reparent moves the pool to a different context.
///
/// # Safety
///
/// `pd` must be a live pool.
pub(crate) unsafe fn shift_all(pd: NonNull<PoolData>) {
    // SAFETY: per contract.
    unsafe {
        let mut scan = (*pd.as_ptr()).cleanups;
        while let Some(rec) = scan {
            if let Some(shift) = (*rec.as_ptr()).shift {
                shift((*rec.as_ptr()).data);
            }
            scan = (*rec.as_ptr()).next;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use pretty_assertions::assert_eq;

    use crate::context::Context;

    /// Cleanup callbacks append one character to a shared log; the log order
    /// is the execution order.
    struct Probe<'a> {
        log: &'a RefCell<String>,
        tag: char,
    }

    impl<'a> Probe<'a> {
        fn new(log: &'a RefCell<String>, tag: char) -> Self {
            Self { log, tag }
        }

        fn ptr(&self) -> *mut () {
            (&raw const *self).cast_mut().cast()
        }

        unsafe fn run(data: *mut ()) {
            // SAFETY: tests only register pointers to live probes.
            let probe = unsafe { &*data.cast_const().cast::<Probe<'_>>() };
            probe.log.borrow_mut().push(probe.tag);
        }

        unsafe fn run_upper(data: *mut ()) {
            // SAFETY: tests only register pointers to live probes.
            let probe = unsafe { &*data.cast_const().cast::<Probe<'_>>() };
            probe.log.borrow_mut().push(probe.tag.to_ascii_uppercase());
        }
    }

    #[test]
    fn cleanups_run_lifo_by_default() {
        let ctx = Context::new();
        let pool = ctx.root_pool();

        let log = RefCell::new(String::new());
        let a = Probe::new(&log, 'a');
        let b = Probe::new(&log, 'b');

        pool.cleanup_register(a.ptr(), Probe::run, None);
        pool.cleanup_register(b.ptr(), Probe::run, None);

        pool.destroy();

        // Registration pushes at the head; execution is head to tail.
        assert_eq!(*log.borrow(), "ba");
    }

    #[test]
    fn before_orders_execution() {
        let ctx = Context::new();
        let pool = ctx.root_pool();

        let log = RefCell::new(String::new());
        let a = Probe::new(&log, 'a');
        let b = Probe::new(&log, 'b');
        let c = Probe::new(&log, 'c');

        // Registration order c, b, a leaves the list as HEAD -> A -> B -> C,
        // so the constraints below have real work to do.
        pool.cleanup_register(c.ptr(), Probe::run, None);
        pool.cleanup_register(b.ptr(), Probe::run, None);
        pool.cleanup_register(a.ptr(), Probe::run, None);

        pool.cleanup_before(c.ptr(), b.ptr());
        pool.cleanup_before(b.ptr(), a.ptr());

        pool.destroy();
        assert_eq!(*log.borrow(), "cba");
    }

    #[test]
    fn before_with_unregistered_items_is_a_no_op() {
        let ctx = Context::new();
        let pool = ctx.root_pool();

        let log = RefCell::new(String::new());
        let a = Probe::new(&log, 'a');
        let ghost = Probe::new(&log, 'x');

        pool.cleanup_register(a.ptr(), Probe::run, None);

        pool.cleanup_before(ghost.ptr(), ghost.ptr());
        pool.cleanup_before(ghost.ptr(), a.ptr());

        pool.destroy();
        assert_eq!(*log.borrow(), "a");
    }

    #[test]
    fn reregistration_overwrites_without_duplicating() {
        let ctx = Context::new();
        let pool = ctx.root_pool();

        let log = RefCell::new(String::new());
        let a = Probe::new(&log, 'a');

        pool.cleanup_register(a.ptr(), Probe::run, None);
        pool.cleanup_register(a.ptr(), Probe::run_upper, None);

        pool.destroy();
        assert_eq!(*log.borrow(), "A");
    }

    #[test]
    fn deregister_prevents_execution() {
        let ctx = Context::new();
        let pool = ctx.root_pool();

        let log = RefCell::new(String::new());
        let a = Probe::new(&log, 'a');
        let b = Probe::new(&log, 'b');

        pool.cleanup_register(a.ptr(), Probe::run, None);
        pool.cleanup_register(b.ptr(), Probe::run, None);
        pool.cleanup_deregister(b.ptr());
        // Deregistering something unknown is fine.
        pool.cleanup_deregister(b.ptr());

        pool.destroy();
        assert_eq!(*log.borrow(), "a");
    }

    #[test]
    fn run_executes_immediately_and_once() {
        let ctx = Context::new();
        let pool = ctx.root_pool();

        let log = RefCell::new(String::new());
        let a = Probe::new(&log, 'a');

        pool.cleanup_register(a.ptr(), Probe::run, None);
        pool.cleanup_run(a.ptr()).expect("untracked item runs");
        assert_eq!(*log.borrow(), "a");

        pool.destroy();
        // Not run a second time at destroy.
        assert_eq!(*log.borrow(), "a");
    }

    #[test]
    fn cleanup_registered_during_drain_runs_in_next_pass() {
        struct Chain<'a, 'p> {
            pool: crate::pool::Pool<'p>,
            late: &'a Probe<'a>,
        }

        impl Chain<'_, '_> {
            unsafe fn run(data: *mut ()) {
                // SAFETY: tests only register pointers to live probes.
                let chain = unsafe { &*data.cast_const().cast::<Chain<'_, '_>>() };
                chain.pool.cleanup_register(chain.late.ptr(), Probe::run, None);
            }
        }

        let ctx = Context::new();
        let pool = ctx.root_pool();

        let log = RefCell::new(String::new());
        let late = Probe::new(&log, 'l');

        // The first cleanup registers another one on the same pool; the
        // follow-up must run in the next drain pass.
        let chain = Chain { pool, late: &late };
        pool.cleanup_register((&raw const chain).cast_mut().cast(), Chain::run, None);

        pool.destroy();
        assert_eq!(*log.borrow(), "l");
    }

    #[test]
    fn clear_runs_cleanups_and_keeps_the_pool_usable() {
        let ctx = Context::new();
        let pool = ctx.root_pool();

        let log = RefCell::new(String::new());
        let a = Probe::new(&log, 'a');

        pool.cleanup_register(a.ptr(), Probe::run, None);
        pool.clear();
        assert_eq!(*log.borrow(), "a");

        // The list is gone; a second clear runs nothing.
        pool.clear();
        assert_eq!(*log.borrow(), "a");

        let _alive = pool.alloc(32);
        pool.destroy();
    }
}

// Copyright (c) The Keel Project Authors.
// Licensed under the MIT License.

//! Cross-module lifecycle scenarios: pool families, cleanup ordering across
//! child teardown, and the ownership graph, driven through the public API.

use std::cell::RefCell;

use keel_error::code_values;
use keel_mem::{Context, Pool};

/// Cleanup callbacks append one character to a shared log; the log order is
/// the teardown order.
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
}

#[test]
fn cleanups_registered_by_child_teardown_run_before_other_children_die() {
    struct LateRegister<'a, 'p> {
        parent: Pool<'p>,
        late: &'a Probe<'a>,
    }

    impl LateRegister<'_, '_> {
        unsafe fn run(data: *mut ()) {
            // SAFETY: tests only register pointers to live probes.
            let this = unsafe { &*data.cast_const().cast::<LateRegister<'_, '_>>() };
            this.parent.cleanup_register(this.late.ptr(), Probe::run, None);
        }
    }

    let ctx = Context::new();
    let parent = ctx.root_pool();
    let first_child = parent.create();
    let second_child = parent.create();

    let log = RefCell::new(String::new());
    let first_probe = Probe::new(&log, '1');
    let second_probe = Probe::new(&log, '2');
    let late = Probe::new(&log, 'p');

    first_child.cleanup_register(first_probe.ptr(), Probe::run, None);

    // The second child was created last, so parent teardown reaches it first.
    // Its teardown registers a cleanup on the parent, which must run *before*
    // the first child dies, since it may still read that child's data.
    let hook = LateRegister {
        parent,
        late: &late,
    };
    second_child.cleanup_register(second_probe.ptr(), Probe::run, None);
    second_child.cleanup_register((&raw const hook).cast_mut().cast(), LateRegister::run, None);

    parent.destroy();

    assert_eq!(*log.borrow(), "2p1");
}

#[test]
fn clear_leaves_a_working_pool_behind() {
    let ctx = Context::new();
    let pool = ctx.root_pool();

    let log = RefCell::new(String::new());
    let probe = Probe::new(&log, 'c');

    let before = pool.strdup("first generation");
    pool.cleanup_register(probe.ptr(), Probe::run, None);
    let child = pool.create();
    let _ = child.alloc(1000);

    pool.clear();
    assert_eq!(*log.borrow(), "c");

    // The pool is pristine again: same origin block, fresh allocations land
    // where the first generation did.
    let after = pool.strdup("second generation");
    assert_eq!(after.as_ptr(), before.as_ptr());

    pool.destroy();
}

#[test]
fn cleanup_run_respects_the_ownership_graph() {
    let ctx = Context::new();
    let pool = ctx.root_pool();

    let log = RefCell::new(String::new());
    let owner = Probe::new(&log, 'o');
    let item = Probe::new(&log, 'i');

    pool.cleanup_register(item.ptr(), Probe::run, None);

    // While the item has a live owner in the tracking graph, running its pool
    // cleanup is refused.
    ctx.track(owner.ptr(), Probe::run);
    ctx.track(item.ptr(), Probe::run);
    ctx.track_dependent(owner.ptr(), item.ptr()).expect("both tracked");

    let err = pool.cleanup_run(item.ptr()).expect_err("item has an owner");
    assert_eq!(err.errval(), code_values::IMPROPER_CLEANUP);
    err.handled();
    assert_eq!(*log.borrow(), "");

    // Clean the owner through the registry; the pool cleanup then runs.
    ctx.track_cleanup(owner.ptr()).expect("owner is free");
    pool.cleanup_run(item.ptr()).expect("owner is gone");
    assert_eq!(*log.borrow(), "oi");

    pool.destroy();
}

#[test]
fn tracked_pools_take_their_owners_down_with_them() {
    let ctx = Context::new();
    let root = ctx.root_pool();
    let work = root.create();

    let log = RefCell::new(String::new());
    let session = Probe::new(&log, 's');

    ctx.track(session.ptr(), Probe::run);
    ctx.track_owns_pool(session.ptr(), work).expect("session is tracked");

    // Destroying an ancestor reaches the tracked pool through the pool tree;
    // the session is cleaned on the way.
    root.destroy();
    assert_eq!(*log.borrow(), "s");
}

#[test]
fn freed_spans_are_reused_once_the_bump_region_drains() {
    let ctx = Context::custom(1024, None, true);
    let pool = ctx.root_pool();

    let span = pool.alloc(128);
    // SAFETY: the span came from this pool and is no longer used.
    unsafe {
        pool.freemem(span, 128);
    }

    // Keep allocating the same shape. Fresh requests come from the bump
    // region until it drains; the returned span must then be the recycled
    // answer, exactly once.
    let hits: Vec<_> = (0..50).map(|_| pool.alloc(128)).collect();
    let reused = hits.iter().filter(|&&hit| hit == span).count();
    assert_eq!(reused, 1);

    pool.destroy();
}

#[test]
fn unhandled_errors_from_pool_misuse_are_inspectable() {
    let ctx = Context::new();
    let a = ctx.root_pool();
    let b = ctx.root_pool();

    // Drop the error deliberately; the context remembers it.
    drop(a.reparent(b).expect_err("roots cannot be reparented"));

    let mut seen = 0;
    while let Some(err) = ctx.unhandled() {
        seen += 1;
        assert_eq!(err.errval(), code_values::BAD_PARAM);
        err.handled();
    }
    assert_eq!(seen, 1);

    a.destroy();
    b.destroy();
}

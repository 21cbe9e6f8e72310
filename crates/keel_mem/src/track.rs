// Copyright (c) The Keel Project Authors.
// Licensed under the MIT License.

//! Cross-object lifetime dependencies.
//!
//! The tracking registry is a context-wide directed acyclic graph of *owners*
//! and *dependents* over arbitrary pointers. A tracked item may be cleaned only
//! once it has no live owners; cleaning it strips it from every dependent's
//! owner list, which may in turn make those dependents eligible.
//!
//! Pools participate without any extra allocation: every pool embeds a
//! tracking record inline, and cleaning a pool through the registry is
//! equivalent to destroying it.

use std::ptr::NonNull;

use keel_error::{Error, code_values};

use crate::cleanup::CleanupFn;
use crate::context::{Context, Cx};
use crate::pool::{Pool, PoolData};

/// A tracking record. Lives either in the context's record pool or embedded in
/// a [`PoolData`].
pub(crate) struct TrackReg {
    /// The tracked pointer, kept here so owner-draining can invoke cleanups.
    item: *mut (),
    cleanup: Option<CleanupFn>,
    owners: Option<NonNull<TrackList>>,
    dependents: Option<NonNull<TrackList>>,
    /// Embedded records (pools) are not recycled to the free-list.
    embedded: bool,
}

pub(crate) struct TrackList {
    reg: NonNull<TrackReg>,
    next: Option<NonNull<TrackList>>,
}

impl TrackReg {
    pub(crate) fn empty() -> Self {
        Self {
            item: std::ptr::null_mut(),
            cleanup: None,
            owners: None,
            dependents: None,
            embedded: true,
        }
    }
}

unsafe fn get_reg(cx: NonNull<Cx>) -> NonNull<TrackReg> {
    // SAFETY: the context is live; recycled records are exclusively ours.
    unsafe {
        if let Some(reg) = (*cx.as_ptr()).free_tregs.pop() {
            return reg;
        }
        crate::context::track_pool_of(cx).alloc(size_of::<TrackReg>()).cast()
    }
}

unsafe fn get_list_node(cx: NonNull<Cx>) -> NonNull<TrackList> {
    // SAFETY: the context is live; recycled nodes are exclusively ours.
    unsafe {
        if let Some(node) = (*cx.as_ptr()).free_tlists.pop() {
            return node;
        }
        crate::context::track_pool_of(cx).alloc(size_of::<TrackList>()).cast()
    }
}

unsafe fn add_to_list(cx: NonNull<Cx>, list: *mut Option<NonNull<TrackList>>, reg: NonNull<TrackReg>) {
    // SAFETY: the list belongs to a live record.
    unsafe {
        let node = get_list_node(cx);
        node.write(TrackList { reg, next: *list });
        *list = Some(node);
    }
}

/// Removes the node referencing `reg` from `list`; the item is known to be
/// there.
unsafe fn remove_from_list(cx: NonNull<Cx>, list: *mut Option<NonNull<TrackList>>, reg: NonNull<TrackReg>) {
    // SAFETY: the list belongs to a live record and contains `reg`.
    unsafe {
        let mut link = list;
        while let Some(node) = *link {
            if (*node.as_ptr()).reg == reg {
                *link = (*node.as_ptr()).next;
                (*cx.as_ptr()).free_tlists.push(node);
                return;
            }
            link = &raw mut (*node.as_ptr()).next;
        }
        debug_assert!(false, "record was not on the list it was expected on");
    }
}

unsafe fn lookup(cx: NonNull<Cx>, item: *mut ()) -> Option<NonNull<TrackReg>> {
    // SAFETY: the context is live.
    unsafe { (*cx.as_ptr()).tracked.get(&(item as usize)).copied() }
}

/// Whether `item` is tracked with at least one live owner.
pub(crate) unsafe fn has_owners(cx: NonNull<Cx>, item: *mut ()) -> bool {
    // SAFETY: the context and any found record are live.
    unsafe { lookup(cx, item).is_some_and(|reg| (*reg.as_ptr()).owners.is_some()) }
}

/// In debug builds, refuses dependency edges that would close a cycle.
#[cfg(debug_assertions)]
unsafe fn reaches(from: NonNull<TrackReg>, needle: NonNull<TrackReg>) -> bool {
    // SAFETY: graph records are live.
    unsafe {
        if from == needle {
            return true;
        }
        let mut scan = (*from.as_ptr()).dependents;
        while let Some(node) = scan {
            if reaches((*node.as_ptr()).reg, needle) {
                return true;
            }
            scan = (*node.as_ptr()).next;
        }
        false
    }
}

/// Strips `reg` out of the graph: every dependent forgets it as an owner, its
/// dependents list is recycled, the hash entry goes away, and (for non-embedded
/// records) the record returns to the free-list.
///
/// The record must have no owners left.
unsafe fn deregister_record(cx: NonNull<Cx>, reg: NonNull<TrackReg>) {
    // SAFETY: the context and graph records are live.
    unsafe {
        debug_assert!((*reg.as_ptr()).owners.is_none());

        while let Some(node) = (*reg.as_ptr()).dependents {
            (*reg.as_ptr()).dependents = (*node.as_ptr()).next;
            let dependent = (*node.as_ptr()).reg;
            remove_from_list(cx, &raw mut (*dependent.as_ptr()).owners, reg);
            (*cx.as_ptr()).free_tlists.push(node);
        }

        let _ = (*cx.as_ptr()).tracked.remove(&((*reg.as_ptr()).item as usize));

        if !(*reg.as_ptr()).embedded {
            (*cx.as_ptr()).free_tregs.push(reg);
        }
    }
}

/// Cleans `reg`: recursively cleans its own owners first (topmost first), then
/// runs its cleanup and deregisters it.
unsafe fn clean_record(cx: NonNull<Cx>, reg: NonNull<TrackReg>) {
    // SAFETY: the context and graph records are live.
    unsafe {
        while let Some(node) = (*reg.as_ptr()).owners {
            clean_record(cx, (*node.as_ptr()).reg);
        }

        let item = (*reg.as_ptr()).item;
        if let Some(cleanup) = (*reg.as_ptr()).cleanup.take() {
            tracing::trace!(?item, "tracking registry cleaning item");
            cleanup(item);
        }

        // The cleanup may have deregistered the item itself (pool destruction
        // does); only finish the job if the record is still registered.
        if lookup(cx, item) == Some(reg) {
            deregister_record(cx, reg);
        }
    }
}

/// Drains the owners of `pd`'s embedded record down to `stop`, cleaning the
/// current head each round. Cleaning an owner removes it from the pool's list,
/// advancing the head.
pub(crate) unsafe fn cleanup_owners(cx: NonNull<Cx>, pd: NonNull<PoolData>, stop: Option<NonNull<TrackList>>) {
    // SAFETY: the pool's embedded record and the graph are live.
    unsafe {
        let reg = embedded_reg(pd);
        while (*reg.as_ptr()).owners != stop {
            let head = (*reg.as_ptr()).owners.expect("loop guard saw a non-stop head");
            clean_record(cx, (*head.as_ptr()).reg);
        }
    }
}

/// Called by pool destruction: cleans every owner of the pool, then removes the
/// pool's embedded record from the graph. A no-op for untracked pools.
pub(crate) unsafe fn pool_destroyed(cx: NonNull<Cx>, pd: NonNull<PoolData>) {
    // SAFETY: the pool is still live at this point of destruction.
    unsafe {
        let key = pd.as_ptr() as usize;
        if !(*cx.as_ptr()).tracked.contains_key(&key) {
            return;
        }
        cleanup_owners(cx, pd, None);
        deregister_record(cx, embedded_reg(pd));
    }
}

unsafe fn embedded_reg(pd: NonNull<PoolData>) -> NonNull<TrackReg> {
    // SAFETY: the embedded record is a field of the live pool.
    unsafe { NonNull::new_unchecked(&raw mut (*pd.as_ptr()).track) }
}

/// Destroys the pool registered behind a tracked pool record.
///
/// # Safety
///
/// `data` must be the `PoolData` pointer the record was registered with.
unsafe fn destroy_pool_item(data: *mut ()) {
    // SAFETY: per contract.
    unsafe {
        crate::pool::destroy_raw(NonNull::new_unchecked(data.cast::<PoolData>()));
    }
}

impl Context {
    /// Registers `item` in the tracking registry. Re-registering only replaces
    /// the cleanup.
    pub fn track(&self, item: *mut (), cleanup: CleanupFn) {
        let cx = self.raw();
        // SAFETY: the context is live for &self.
        unsafe {
            match lookup(cx, item) {
                Some(reg) => (*reg.as_ptr()).cleanup = Some(cleanup),
                None => {
                    let reg = get_reg(cx);
                    reg.write(TrackReg {
                        item,
                        cleanup: Some(cleanup),
                        owners: None,
                        dependents: None,
                        embedded: false,
                    });
                    let _ = (*cx.as_ptr()).tracked.insert(item as usize, reg);
                }
            }
        }
    }

    /// Removes `item` from the registry without running its cleanup. Every
    /// dependent forgets `item` as an owner. Unknown items are a no-op.
    ///
    /// # Errors
    ///
    /// `IMPROPER_DEREGISTER` when `item` still has owners.
    pub fn track_deregister(&self, item: *mut ()) -> keel_error::Result<()> {
        let cx = self.raw();
        // SAFETY: the context is live for &self.
        unsafe {
            let Some(reg) = lookup(cx, item) else {
                return Ok(());
            };
            if (*reg.as_ptr()).owners.is_some() {
                return Err(Error::new((*cx.as_ptr()).hub(), code_values::IMPROPER_DEREGISTER));
            }
            deregister_record(cx, reg);
        }
        Ok(())
    }

    /// Declares that `owner` owns `dependent`: the owner joins the dependent's
    /// owner list and vice versa. Both must already be tracked.
    ///
    /// # Errors
    ///
    /// `NOT_REGISTERED` when either pointer is unknown to the registry.
    pub fn track_dependent(&self, owner: *mut (), dependent: *mut ()) -> keel_error::Result<()> {
        let cx = self.raw();
        // SAFETY: the context is live for &self.
        unsafe {
            let Some(reg_owner) = lookup(cx, owner) else {
                return Err(Error::with_message(
                    (*cx.as_ptr()).hub(),
                    code_values::NOT_REGISTERED,
                    "owner is not tracked",
                ));
            };
            let Some(reg_dep) = lookup(cx, dependent) else {
                return Err(Error::with_message(
                    (*cx.as_ptr()).hub(),
                    code_values::NOT_REGISTERED,
                    "dependent is not tracked",
                ));
            };

            #[cfg(debug_assertions)]
            debug_assert!(!reaches(reg_dep, reg_owner), "dependency edge would close a cycle");

            add_to_list(cx, &raw mut (*reg_owner.as_ptr()).dependents, reg_dep);
            add_to_list(cx, &raw mut (*reg_dep.as_ptr()).owners, reg_owner);
        }
        Ok(())
    }

    /// Declares that `owner` owns `pool`. The pool is entered into the
    /// registry first if needed (via its embedded record); destroying the pool
    /// will then clean `owner` before the pool's memory goes away.
    ///
    /// # Errors
    ///
    /// `NOT_REGISTERED` when `owner` is unknown to the registry.
    pub fn track_owns_pool(&self, owner: *mut (), pool: Pool<'_>) -> keel_error::Result<()> {
        pool.track_pool();
        self.track_dependent(owner, pool.raw().as_ptr().cast())
    }

    /// Runs the cleanup for `item` now and deregisters it. Unknown items are a
    /// no-op.
    ///
    /// # Errors
    ///
    /// `IMPROPER_CLEANUP` when `item` still has owners.
    pub fn track_cleanup(&self, item: *mut ()) -> keel_error::Result<()> {
        let cx = self.raw();
        // SAFETY: the context is live for &self.
        unsafe {
            let Some(reg) = lookup(cx, item) else {
                return Ok(());
            };
            if (*reg.as_ptr()).owners.is_some() {
                return Err(Error::new((*cx.as_ptr()).hub(), code_values::IMPROPER_CLEANUP));
            }
            clean_record(cx, reg);
        }
        Ok(())
    }
}

impl Pool<'_> {
    /// Registers `item` in the tracking registry of this pool's context.
    pub fn track_via(self, item: *mut (), cleanup: CleanupFn) {
        let cx = self.cx();
        // SAFETY: the pool's context is live.
        unsafe {
            match lookup(cx, item) {
                Some(reg) => (*reg.as_ptr()).cleanup = Some(cleanup),
                None => {
                    let reg = get_reg(cx);
                    reg.write(TrackReg {
                        item,
                        cleanup: Some(cleanup),
                        owners: None,
                        dependents: None,
                        embedded: false,
                    });
                    let _ = (*cx.as_ptr()).tracked.insert(item as usize, reg);
                }
            }
        }
    }

    /// Enters this pool into the tracking registry via its embedded record.
    ///
    /// Usually reached through [`Context::track_owns_pool`] rather than
    /// directly. A pool cleaned up by the registry is destroyed, owners first.
    pub fn track_pool(self) {
        let cx = self.cx();
        let pd = self.raw();
        // SAFETY: the pool and its context are live.
        unsafe {
            let key = pd.as_ptr() as usize;
            if (*cx.as_ptr()).tracked.contains_key(&key) {
                return;
            }
            let reg = embedded_reg(pd);
            reg.write(TrackReg {
                item: pd.as_ptr().cast(),
                cleanup: Some(destroy_pool_item),
                owners: None,
                dependents: None,
                embedded: true,
            });
            let _ = (*cx.as_ptr()).tracked.insert(key, reg);
        }
    }
}

// Copyright (c) The Keel Project Authors.
// Licensed under the MIT License.

//! Region (arena) allocation.
//!
//! A pool hands out bump allocations from standard-sized blocks, recycles
//! returned spans through a per-pool best-fit remnant tree, and sends oversized
//! requests to the context's shared non-standard index. Pools form a tree:
//! destroying a pool destroys its children first, runs the ordered cleanup
//! list, and returns every block to the memroot or the context.
//!
//! The `PoolData` record itself lives at the head of the pool's first standard
//! block, so a pool costs no allocation beyond the block that backs it.

use std::marker::PhantomData;
use std::ptr::NonNull;

use keel_error::{Error, code_values};

use crate::block::{self, ALIGNMENT, BLOCK_HEADER, Block, round_up};
use crate::cleanup::{self, CleanupRec};
use crate::context::{Context, Cx};
use crate::memroot::Memroot;
use crate::memtree::{self, MIN_REMNANT, TreeNode};
use crate::track::{self, TrackReg};

/// The in-block pool record.
pub(crate) struct PoolData {
    /// Bump pointer into the current block.
    pub current: NonNull<u8>,
    /// End of usable memory in the current block.
    pub endmem: NonNull<u8>,

    /// The pool's first block, which also holds this record.
    pub origin: NonNull<Block>,
    /// End of the origin block; the bump region is reset to here on clear.
    pub initial_end: NonNull<u8>,

    /// Standard blocks acquired after the origin, in acquisition order.
    pub extra_head: Option<NonNull<Block>>,
    pub extra_tail: Option<NonNull<Block>>,

    /// Best-fit index of spans returned by `freemem`.
    pub remnants: Option<NonNull<TreeNode>>,

    /// Oversized blocks allocated for this pool.
    pub nonstd: Option<NonNull<Block>>,

    pub parent: Option<NonNull<PoolData>>,
    pub sibling: Option<NonNull<PoolData>>,
    pub first_child: Option<NonNull<PoolData>>,

    /// Ordered cleanup list, run head to tail on clear/destroy.
    pub cleanups: Option<NonNull<CleanupRec>>,

    pub memroot: NonNull<Memroot>,

    /// Freed spans carry a trailing size suffix for future coalescing work.
    pub coalesce: bool,

    /// Inlined tracking record, so the pool can join the ownership graph
    /// without an extra allocation.
    pub track: TrackReg,
}

const DATA_OFFSET: usize = BLOCK_HEADER + ((size_of::<PoolData>() + (ALIGNMENT - 1)) & !(ALIGNMENT - 1));

/// A copyable handle to a pool.
///
/// The lifetime ties the handle to the owning [`Context`]; it does not protect
/// against use after an explicit [`destroy`](Pool::destroy) or against a
/// reference outliving [`clear`](Pool::clear); those remain usage contracts,
/// and debug builds poison destroyed pools to surface violations early.
#[derive(Clone, Copy)]
pub struct Pool<'ctx> {
    data: NonNull<PoolData>,

    /// Pools are single-threaded and context-bound.
    _marker: PhantomData<(&'ctx Context, *mut ())>,
}

impl std::fmt::Debug for Pool<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool").field("data", &self.data).finish()
    }
}

impl Context {
    /// Creates a new top-level pool using the context's standard block size.
    #[must_use]
    pub fn root_pool(&self) -> Pool<'_> {
        self.root_pool_custom(crate::context::DEFAULT_STDSIZE)
    }

    /// Creates a new top-level pool with its own standard block size.
    ///
    /// `0` means "use the context default"; values below the minimum are
    /// clamped up to it.
    #[must_use]
    pub fn root_pool_custom(&self, stdsize: usize) -> Pool<'_> {
        // SAFETY: the context is live for &self.
        Pool::from_raw(unsafe { create_root(self.raw(), stdsize) })
    }
}

/// Builds a root pool (and its memroot) against `cx`.
///
/// # Safety
///
/// `cx` must be a live context.
pub(crate) unsafe fn create_root(cx: NonNull<Cx>, stdsize: usize) -> NonNull<PoolData> {
    // SAFETY: per contract; the memroot is created against this context.
    unsafe {
        let stdsize = crate::context::resolve_stdsize((*cx.as_ptr()).stdsize, stdsize);
        let memroot = Memroot::create(cx, stdsize);
        let block = block::acquire_standard(&*cx.as_ptr(), &mut *memroot.as_ptr())
            .expect("pool creation cannot proceed after an OOM surrender");
        let data = init_pool(block, memroot, None, false);
        (*memroot.as_ptr()).pool = data;
        data
    }
}

impl<'ctx> Pool<'ctx> {
    pub(crate) fn from_raw(data: NonNull<PoolData>) -> Self {
        Self {
            data,
            _marker: PhantomData,
        }
    }

    pub(crate) fn raw(self) -> NonNull<PoolData> {
        self.data
    }

    /// Creates a child pool. It shares this pool's memroot (and therefore its
    /// standard block size and block free-list) and is destroyed with it.
    #[must_use]
    pub fn create(self) -> Pool<'ctx> {
        self.create_child(false)
    }

    /// As [`create`](Self::create), but spans later returned with
    /// [`freemem`](Self::freemem) carry a trailing size suffix enabling future
    /// coalescing work.
    #[must_use]
    pub fn create_coalescing(self) -> Pool<'ctx> {
        self.create_child(true)
    }

    fn create_child(self, coalesce: bool) -> Pool<'ctx> {
        // SAFETY: `self` is a live pool; the memroot and context back it.
        let data = unsafe {
            let parent = self.data;
            let memroot = (*parent.as_ptr()).memroot;
            let cx = (*memroot.as_ptr()).cx;
            let block = block::acquire_standard(&*cx.as_ptr(), &mut *memroot.as_ptr())
                .expect("pool creation cannot proceed after an OOM surrender");
            let data = init_pool(block, memroot, Some(parent), coalesce);

            // Hook the new pool into the parent.
            (*data.as_ptr()).sibling = (*parent.as_ptr()).first_child;
            (*parent.as_ptr()).first_child = Some(data);
            data
        };

        Pool::from_raw(data)
    }

    /// Returns at least `amt` bytes, aligned to [`ALIGNMENT`].
    ///
    /// Never returns null: an out-of-memory condition is routed through the
    /// context's OOM policy, which retries or aborts by default.
    ///
    /// # Panics
    ///
    /// Panics if a custom OOM policy surrenders; use [`try_alloc`](Self::try_alloc)
    /// to observe surrender as `None`.
    #[must_use]
    pub fn alloc(self, amt: usize) -> NonNull<u8> {
        self.try_alloc(amt).expect("allocation surrendered by the OOM policy")
    }

    /// As [`alloc`](Self::alloc), but surrender from a custom OOM policy comes
    /// back as `None`.
    #[must_use]
    pub fn try_alloc(self, amt: usize) -> Option<NonNull<u8>> {
        let amt = round_up(amt.max(1));
        let pd = self.data.as_ptr();

        // SAFETY: `self` is a live pool; every block reached below is owned by
        // it or by its memroot/context.
        unsafe {
            // Fast path: bump within the current block.
            let current = (*pd).current;
            let room = (*pd).endmem.as_ptr() as usize - current.as_ptr() as usize;
            if amt <= room {
                (*pd).current = current.add(amt);
                return Some(current);
            }

            // Remnant path: best-fit from previously returned spans.
            if let Some(found) = memtree::fetch(&mut (*pd).remnants, amt) {
                let size = (*found.as_ptr()).size;
                let mem = found.cast::<u8>();
                if size - amt >= MIN_REMNANT {
                    memtree::insert(&mut (*pd).remnants, mem.add(amt), size - amt);
                }
                return Some(mem);
            }

            let memroot = (*pd).memroot;
            let stdsize = (*memroot.as_ptr()).stdsize;
            let cx = (*memroot.as_ptr()).cx;

            // Standard-block path.
            if amt <= stdsize - BLOCK_HEADER {
                tracing::trace!(amt, stdsize, "pool growing by one standard block");

                // The leftover bump region would otherwise be stranded; index
                // it with the remnants if it is big enough to matter.
                if room >= MIN_REMNANT {
                    memtree::insert(&mut (*pd).remnants, current, room);
                }

                let fresh = block::acquire_standard(&*cx.as_ptr(), &mut *memroot.as_ptr())?;
                match (*pd).extra_tail {
                    Some(tail) => (*tail.as_ptr()).next = Some(fresh),
                    None => (*pd).extra_head = Some(fresh),
                }
                (*pd).extra_tail = Some(fresh);

                let base = fresh.cast::<u8>();
                (*pd).current = base.add(BLOCK_HEADER + amt);
                (*pd).endmem = base.add(stdsize);
                return Some(base.add(BLOCK_HEADER));
            }

            // Oversized: a non-standard block of its own.
            let total = round_up(amt + BLOCK_HEADER);
            tracing::trace!(amt, total, "pool taking a non-standard block");

            let fresh = block::acquire_nonstandard(&mut *cx.as_ptr(), total)?;
            (*fresh.as_ptr()).next = (*pd).nonstd;
            (*pd).nonstd = Some(fresh);
            Some(fresh.cast::<u8>().add(BLOCK_HEADER))
        }
    }

    /// As [`alloc`](Self::alloc), zero-filled.
    #[must_use]
    pub fn alloc_zeroed(self, amt: usize) -> NonNull<u8> {
        let mem = self.alloc(amt);
        // SAFETY: `alloc` returned at least `amt` writable bytes.
        unsafe {
            mem.as_ptr().write_bytes(0, amt);
        }
        mem
    }

    /// Returns a previously allocated span to the pool's remnant index, making
    /// it available to later allocations.
    ///
    /// Spans too small to index (smaller than a remnant record) are silently
    /// dropped; they will come back with the next clear.
    ///
    /// # Safety
    ///
    /// `mem..mem+len` must be an allocation obtained from this pool that is no
    /// longer referenced.
    pub unsafe fn freemem(self, mem: NonNull<u8>, len: usize) {
        let len = round_up(len);
        if len < MIN_REMNANT {
            return;
        }

        let pd = self.data.as_ptr();
        // SAFETY: per contract, the span belongs to this pool and is dead.
        unsafe {
            if (*pd).coalesce {
                // Trailing size suffix in the span's last word. Nothing reads
                // it yet; the layout contract is what matters.
                let suffix = mem.add(len - size_of::<usize>()).cast::<usize>();
                suffix.write(len);
            }
            memtree::insert(&mut (*pd).remnants, mem, len);
        }
    }

    /// Runs the cleanup list, destroys all children, and resets the pool to its
    /// pristine state: origin block only, no extras, no remnants, no cleanups.
    ///
    /// Cleanup handlers may register further cleanups on this pool (including
    /// from child teardown); drains repeat until none remain, and cleanups
    /// always run while the children they might inspect still exist.
    pub fn clear(self) {
        // SAFETY: `self` is a live pool.
        unsafe {
            teardown_contents(self.data);

            let pd = self.data.as_ptr();
            (*pd).current = data_start(self.data);
            (*pd).endmem = (*pd).initial_end;
        }
    }

    /// Destroys the pool: children recursively, cleanups in order, blocks back
    /// to the memroot and the context. Destroying a root pool also retires its
    /// memroot and returns the standard-block free-list to the OS.
    pub fn destroy(self) {
        // SAFETY: `self` is a live pool, never used again through any copy of
        // this handle (usage contract).
        unsafe {
            destroy_raw(self.data);
        }
    }

    /// Detaches this pool from its parent and splices it under `new_parent`.
    ///
    /// When the two parents belong to different memroots, the whole subtree is
    /// re-bound to the new memroot; if that moves the subtree to a different
    /// context, registered cleanup shift callbacks are invoked.
    ///
    /// # Errors
    ///
    /// `BAD_PARAM` if this pool is a root pool.
    pub fn reparent(self, new_parent: Pool<'ctx>) -> keel_error::Result<()> {
        let pd = self.data;
        let np = new_parent.data;

        // SAFETY: both handles reference live pools in this context.
        unsafe {
            let Some(old_parent) = (*pd.as_ptr()).parent else {
                let cx = (*(*pd.as_ptr()).memroot.as_ptr()).cx;
                return Err(Error::with_message(
                    (*cx.as_ptr()).hub(),
                    code_values::BAD_PARAM,
                    "a root pool cannot be reparented",
                ));
            };

            unlink_from_parent(old_parent, pd);

            (*pd.as_ptr()).parent = Some(np);
            (*pd.as_ptr()).sibling = (*np.as_ptr()).first_child;
            (*np.as_ptr()).first_child = Some(pd);

            let new_memroot = (*np.as_ptr()).memroot;
            if (*pd.as_ptr()).memroot != new_memroot {
                let cx_changed = (*(*pd.as_ptr()).memroot.as_ptr()).cx != (*new_memroot.as_ptr()).cx;
                rebind_subtree(pd, new_memroot, cx_changed);
            }
        }
        Ok(())
    }

    /// The context this pool currently belongs to, for error raising.
    pub(crate) fn cx(self) -> NonNull<Cx> {
        // SAFETY: `self` is a live pool.
        unsafe { (*(*self.data.as_ptr()).memroot.as_ptr()).cx }
    }

    /// Bytes left in the current bump region.
    #[cfg(test)]
    fn bump_room(self) -> usize {
        // SAFETY: `self` is a live pool.
        unsafe {
            let pd = self.data.as_ptr();
            (*pd).endmem.as_ptr() as usize - (*pd).current.as_ptr() as usize
        }
    }
}

/// Overlays a fresh `PoolData` at the head of `block`.
///
/// # Safety
///
/// `block` must be a standard block of `memroot`, exclusively owned, large
/// enough for the pool record.
unsafe fn init_pool(
    block: NonNull<Block>,
    memroot: NonNull<Memroot>,
    parent: Option<NonNull<PoolData>>,
    coalesce: bool,
) -> NonNull<PoolData> {
    // SAFETY: per contract, the block is writable and at least stdsize (which
    // is clamped well above the record size).
    unsafe {
        let base = block.cast::<u8>();
        let size = (*block.as_ptr()).size;
        debug_assert!(size > DATA_OFFSET);

        let data = base.add(BLOCK_HEADER).cast::<PoolData>();
        data.write(PoolData {
            current: base.add(DATA_OFFSET),
            endmem: base.add(size),
            origin: block,
            initial_end: base.add(size),
            extra_head: None,
            extra_tail: None,
            remnants: None,
            nonstd: None,
            parent,
            sibling: None,
            first_child: None,
            cleanups: None,
            memroot,
            coalesce,
            track: TrackReg::empty(),
        });
        data
    }
}

pub(crate) fn data_start(data: NonNull<PoolData>) -> NonNull<u8> {
    // SAFETY: the record sits at a fixed offset inside its origin block.
    unsafe { data.cast::<u8>().byte_sub(BLOCK_HEADER).add(DATA_OFFSET) }
}

/// Drains cleanups and children (with the parent-cleanup-priority rule), then
/// returns every block beyond the origin.
///
/// # Safety
///
/// `pd` must be a live pool.
unsafe fn teardown_contents(pd: NonNull<PoolData>) {
    // SAFETY: per contract; children and blocks are owned by this pool.
    unsafe {
        // Cleanups drain before children die, and child teardown may register
        // new cleanups here. Those take priority because they may still read
        // child data, so the drain restarts until both lists are empty.
        loop {
            if (*pd.as_ptr()).cleanups.is_some() {
                cleanup::drain(pd);
                continue;
            }
            if let Some(child) = (*pd.as_ptr()).first_child {
                destroy_raw(child);
                continue;
            }
            break;
        }

        let memroot = (*pd.as_ptr()).memroot;
        let cx = (*memroot.as_ptr()).cx;

        // Non-standard blocks go to the context's shared index.
        while let Some(nonstd) = (*pd.as_ptr()).nonstd {
            (*pd.as_ptr()).nonstd = (*nonstd.as_ptr()).next;
            (*nonstd.as_ptr()).next = None;
            block::release_nonstandard(&mut *cx.as_ptr(), nonstd);
        }

        // Extra standard blocks go back to the memroot.
        while let Some(extra) = (*pd.as_ptr()).extra_head {
            (*pd.as_ptr()).extra_head = (*extra.as_ptr()).next;
            (*extra.as_ptr()).next = None;
            release_block(cx, memroot, extra);
        }
        (*pd.as_ptr()).extra_tail = None;

        // Everything the remnant tree indexed lived in those blocks.
        (*pd.as_ptr()).remnants = None;
    }
}

/// Returns a block to the memroot free-list when it is standard-sized for that
/// memroot, or to the context's shared index otherwise (a pool can hold blocks
/// of a foreign size after reparenting across memroots).
unsafe fn release_block(cx: NonNull<Cx>, memroot: NonNull<Memroot>, block: NonNull<Block>) {
    // SAFETY: the caller owns `block` exclusively.
    unsafe {
        if (*block.as_ptr()).size == (*memroot.as_ptr()).stdsize {
            block::release_standard(&mut *memroot.as_ptr(), block);
        } else {
            block::release_nonstandard(&mut *cx.as_ptr(), block);
        }
    }
}

/// Full pool destruction. See [`Pool::destroy`].
///
/// # Safety
///
/// `pd` must be a live pool that is never referenced again.
pub(crate) unsafe fn destroy_raw(pd: NonNull<PoolData>) {
    // SAFETY: per contract.
    unsafe {
        let cx = (*(*pd.as_ptr()).memroot.as_ptr()).cx;

        // Resources that own this pool must be cleaned while its memory is
        // still fully intact, so the ownership graph drains first.
        track::pool_destroyed(cx, pd);

        teardown_contents(pd);

        let memroot = (*pd.as_ptr()).memroot;
        let cx = (*memroot.as_ptr()).cx;

        let parent = (*pd.as_ptr()).parent;
        let origin = (*pd.as_ptr()).origin;

        if let Some(parent) = parent {
            unlink_from_parent(parent, pd);
        }

        // Any further use through a stale handle should fail loudly.
        #[cfg(debug_assertions)]
        {
            (*pd.as_ptr()).current = NonNull::dangling();
            (*pd.as_ptr()).endmem = NonNull::dangling();
        }

        match parent {
            Some(_) => release_block(cx, memroot, origin),
            None => {
                // A root takes its memroot with it: origin joins the free-list
                // and the whole list goes back to the OS.
                release_block(cx, memroot, origin);
                Memroot::teardown(memroot);
            }
        }
    }
}

/// Removes `pd` from `parent`'s child list.
///
/// # Safety
///
/// Both must be live, with `pd` currently a child of `parent`.
unsafe fn unlink_from_parent(parent: NonNull<PoolData>, pd: NonNull<PoolData>) {
    // SAFETY: per contract; the sibling chain is live.
    unsafe {
        let mut link = &raw mut (*parent.as_ptr()).first_child;
        while let Some(scan) = *link {
            if scan == pd {
                *link = (*scan.as_ptr()).sibling;
                (*pd.as_ptr()).sibling = None;
                return;
            }
            link = &raw mut (*scan.as_ptr()).sibling;
        }
        debug_assert!(false, "pool was not on its parent's child list");
    }
}

/// Points every pool in the subtree at `memroot`; when the move crosses
/// contexts, fires the cleanup shift callbacks.
///
/// # Safety
///
/// `pd` must be a live subtree.
unsafe fn rebind_subtree(pd: NonNull<PoolData>, memroot: NonNull<Memroot>, cx_changed: bool) {
    // SAFETY: per contract.
    unsafe {
        (*pd.as_ptr()).memroot = memroot;
        if cx_changed {
            cleanup::shift_all(pd);
        }

        let mut child = (*pd.as_ptr()).first_child;
        while let Some(c) = child {
            rebind_subtree(c, memroot, cx_changed);
            child = (*c.as_ptr()).sibling;
        }
    }
}

#[cfg(test)]
mod tests {
    use static_assertions::assert_not_impl_any;

    use super::*;
    use crate::context::STDSIZE_MIN;

    assert_not_impl_any!(Pool<'static>: Send, Sync);

    #[test]
    fn alloc_is_aligned_and_distinct() {
        let ctx = Context::new();
        let pool = ctx.root_pool();

        let a = pool.alloc(3);
        let b = pool.alloc(17);
        let c = pool.alloc(1);

        for p in [a, b, c] {
            assert_eq!(p.as_ptr() as usize % ALIGNMENT, 0);
        }
        assert_ne!(a, b);
        assert_ne!(b, c);

        pool.destroy();
    }

    #[test]
    fn bump_allocations_are_adjacent() {
        let ctx = Context::new();
        let pool = ctx.root_pool();

        let a = pool.alloc(8);
        let b = pool.alloc(8);
        assert_eq!(a.as_ptr() as usize + 8, b.as_ptr() as usize);

        pool.destroy();
    }

    #[test]
    fn clear_resets_to_the_original_block() {
        let ctx = Context::new();
        let pool = ctx.root_pool();

        let first = pool.alloc(10);
        let _second = pool.alloc(10);
        // Larger than a standard block: forces a non-standard block.
        let _big = pool.alloc(10_000);

        pool.clear();

        // Same request after clear lands exactly where the first one did.
        let again = pool.alloc(10);
        assert_eq!(first, again);

        pool.destroy();
    }

    #[test]
    fn exhausting_the_origin_block_chains_extras() {
        let ctx = Context::new();
        let pool = ctx.root_pool_custom(STDSIZE_MIN);

        // Far more than one minimum-size block can hold.
        let ptrs: Vec<NonNull<u8>> = (0..64).map(|_| pool.alloc(48)).collect();
        for window in ptrs.windows(2) {
            assert_ne!(window[0], window[1]);
        }

        // SAFETY: the pool is live.
        unsafe {
            assert!((*pool.raw().as_ptr()).extra_head.is_some());
        }

        pool.destroy();
    }

    #[test]
    fn freemem_spans_are_recycled_best_fit() {
        let ctx = Context::new();
        let pool = ctx.root_pool();

        let small = pool.alloc(64);
        let large = pool.alloc(256);

        // SAFETY: both spans came from this pool and are no longer used.
        unsafe {
            pool.freemem(small, 64);
            pool.freemem(large, 256);
        }

        // Exhaust the bump region so the remnant path is the one that answers.
        let _fill = pool.alloc(pool.bump_room());
        assert_eq!(pool.bump_room(), 0);

        // 64 is the best fit for a 48-byte request (the 16-byte slack is below
        // the remnant threshold and is absorbed).
        let hit = pool.alloc(48);
        assert_eq!(hit, small);

        let hit = pool.alloc(256);
        assert_eq!(hit, large);

        pool.destroy();
    }

    #[test]
    fn remnant_slack_is_reindexed() {
        let ctx = Context::new();
        let pool = ctx.root_pool();

        let span = pool.alloc(512);
        // SAFETY: the span came from this pool and is no longer used.
        unsafe {
            pool.freemem(span, 512);
        }

        // Exhaust the bump region so the remnant path is the one that answers.
        let _fill = pool.alloc(pool.bump_room());
        assert_eq!(pool.bump_room(), 0);

        // Taking 128 of the 512 leaves 384 indexed.
        let head = pool.alloc(128);
        assert_eq!(head, span);

        let tail = pool.alloc(384);
        assert_eq!(tail.as_ptr() as usize, span.as_ptr() as usize + 128);

        pool.destroy();
    }

    #[test]
    fn tiny_freemem_is_dropped() {
        let ctx = Context::new();
        let pool = ctx.root_pool();

        let span = pool.alloc(16);
        // SAFETY: the span came from this pool and is no longer used.
        unsafe {
            pool.freemem(span, 16);
        }

        // SAFETY: the pool is live.
        unsafe {
            assert!((*pool.raw().as_ptr()).remnants.is_none());
        }

        pool.destroy();
    }

    #[test]
    fn coalescing_pools_write_the_size_suffix() {
        let ctx = Context::new();
        let root = ctx.root_pool();
        let pool = root.create_coalescing();

        let span = pool.alloc(128);
        // SAFETY: the span came from this pool and is no longer used; reading
        // the suffix back is inspecting free memory we still own.
        unsafe {
            pool.freemem(span, 128);
            let suffix = span.add(128 - size_of::<usize>()).cast::<usize>().read();
            assert_eq!(suffix, 128);
        }

        root.destroy();
    }

    #[test]
    fn children_die_with_the_parent() {
        let ctx = Context::new();
        let root = ctx.root_pool();
        let child = root.create();
        let grandchild = child.create();

        let _a = child.alloc(100);
        let _b = grandchild.alloc(100);

        // Destroying the root must recursively tear down the whole family and
        // leave the context consistent enough to build a fresh family.
        root.destroy();

        let fresh = ctx.root_pool();
        let _c = fresh.alloc(100);
        fresh.destroy();
    }

    #[test]
    fn sibling_pools_do_not_overlap() {
        let ctx = Context::new();
        let root = ctx.root_pool();
        let left = root.create();
        let right = root.create();

        let a = left.alloc(64);
        let b = right.alloc(64);
        let (a, b) = (a.as_ptr() as usize, b.as_ptr() as usize);
        assert!(a + 64 <= b || b + 64 <= a);

        root.destroy();
    }

    #[test]
    fn oversized_blocks_are_reused_across_pools() {
        let ctx = Context::new();
        let first = ctx.root_pool();

        let big = first.alloc(100_000);
        // SAFETY: probing our own allocation.
        unsafe {
            big.as_ptr().write_bytes(0xab, 100_000);
        }
        first.destroy();

        // The non-standard block went back to the context index; an equal
        // request from a fresh pool gets the same memory.
        let second = ctx.root_pool();
        let again = second.alloc(100_000);
        assert_eq!(again, big);
        second.destroy();
    }

    #[test]
    fn reparent_moves_the_subtree() {
        let ctx = Context::new();
        let old_root = ctx.root_pool();
        let new_root = ctx.root_pool();
        let pool = old_root.create();

        let kept = pool.strdup("survives the move");
        pool.reparent(new_root).expect("non-root reparent succeeds");

        // The old family can die without taking the moved pool along.
        old_root.destroy();
        assert_eq!(kept, "survives the move");
        let _more = pool.alloc(64);

        new_root.destroy();
    }

    #[test]
    fn reparent_of_root_is_refused() {
        let ctx = Context::new();
        let a = ctx.root_pool();
        let b = ctx.root_pool();

        let err = a.reparent(b).expect_err("root pools cannot be reparented");
        assert_eq!(err.errval(), code_values::BAD_PARAM);
        err.handled();

        a.destroy();
        b.destroy();
    }

    #[test]
    fn custom_stdsize_is_clamped() {
        let ctx = Context::new();
        let pool = ctx.root_pool_custom(10);

        // SAFETY: the pool is live.
        unsafe {
            let memroot = (*pool.raw().as_ptr()).memroot;
            assert_eq!((*memroot.as_ptr()).stdsize, STDSIZE_MIN);
        }

        pool.destroy();
    }
}

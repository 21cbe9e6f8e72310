// Copyright (c) The Keel Project Authors.
// Licensed under the MIT License.

use std::alloc::{Layout, handle_alloc_error};
use std::ptr::NonNull;

use crate::context::{Cx, OomResponse};

/// Allocation alignment for everything handed out by pools.
///
/// Must be at least 2 so the low bit of rounded sizes is free for the memtree's
/// color bit; 8 keeps every allocation suitable for word-sized data.
pub const ALIGNMENT: usize = 8;

/// Header at the front of every OS-owned block. `size` is the total block size,
/// header included. Freed blocks of equal size chain through `next`.
#[repr(C)]
pub(crate) struct Block {
    pub size: usize,
    pub next: Option<NonNull<Block>>,
}

pub(crate) const BLOCK_HEADER: usize = size_of::<Block>();

/// Rounds a request up to the allocation alignment.
#[inline]
pub(crate) fn round_up(n: usize) -> usize {
    (n + (ALIGNMENT - 1)) & !(ALIGNMENT - 1)
}

/// Asks the OS for `size` bytes, consulting the context's OOM policy on failure.
///
/// Returns `None` only when a custom policy surrenders. With no policy (or an
/// aborting one), a failed allocation never returns.
pub(crate) fn os_alloc(cx: &Cx, size: usize) -> Option<NonNull<u8>> {
    debug_assert!(size >= BLOCK_HEADER);

    // Alignment is a small power of two and `size` was rounded by the caller.
    let layout = Layout::from_size_align(size, ALIGNMENT).expect("block layout");

    loop {
        // SAFETY: `size` is non-zero (at least BLOCK_HEADER).
        let mem = unsafe { std::alloc::alloc(layout) };
        if let Some(mem) = NonNull::new(mem) {
            return Some(mem);
        }

        match cx.oom_handler {
            None => handle_alloc_error(layout),
            Some(handler) => match handler(size) {
                OomResponse::Retry => {
                    tracing::debug!(size, "allocation failed, OOM policy requested retry");
                }
                OomResponse::Surrender => return None,
                OomResponse::Abort => handle_alloc_error(layout),
            },
        }
    }
}

/// Returns a block's memory to the OS.
///
/// # Safety
///
/// `block` must have come from [`os_alloc`] with the size recorded in its
/// header, and must not be referenced again.
pub(crate) unsafe fn os_free(block: NonNull<Block>) {
    // SAFETY: the header records the size the block was allocated with.
    unsafe {
        let size = (*block.as_ptr()).size;
        let layout = Layout::from_size_align(size, ALIGNMENT).expect("block layout");
        std::alloc::dealloc(block.as_ptr().cast(), layout);
    }
}

/// Pops a standard block from the memroot free-list, or allocates a fresh one.
/// The header is (re)initialized either way.
pub(crate) fn acquire_standard(cx: &Cx, memroot: &mut crate::memroot::Memroot) -> Option<NonNull<Block>> {
    if let Some(block) = memroot.std_blocks {
        // SAFETY: free-list entries are live blocks owned by the memroot.
        unsafe {
            memroot.std_blocks = (*block.as_ptr()).next;
            (*block.as_ptr()).next = None;
            debug_assert_eq!((*block.as_ptr()).size, memroot.stdsize);
        }
        return Some(block);
    }

    let mem = os_alloc(cx, memroot.stdsize)?;
    let block = mem.cast::<Block>();
    // SAFETY: the allocation is at least a header in size and freshly owned.
    unsafe {
        block.write(Block {
            size: memroot.stdsize,
            next: None,
        });
    }
    Some(block)
}

/// Pushes a standard block back onto the memroot free-list (LIFO).
///
/// # Safety
///
/// `block` must be a standard block of this memroot with no live allocations.
pub(crate) unsafe fn release_standard(memroot: &mut crate::memroot::Memroot, block: NonNull<Block>) {
    // SAFETY: per contract, the block is exclusively ours again.
    unsafe {
        (*block.as_ptr()).next = memroot.std_blocks;
    }
    memroot.std_blocks = Some(block);
}

/// Fetches a non-standard block of at least `size` bytes from the context's
/// global index, falling back to the OS.
pub(crate) fn acquire_nonstandard(cx: &mut Cx, size: usize) -> Option<NonNull<Block>> {
    // SAFETY: the global index only holds blocks released by this context.
    if let Some(block) = unsafe { crate::memtree::fetch(&mut cx.nonstd, size) } {
        return Some(block);
    }

    let mem = os_alloc(cx, size)?;
    let block = mem.cast::<Block>();
    // SAFETY: the allocation is at least a header in size and freshly owned.
    unsafe {
        block.write(Block { size, next: None });
    }
    Some(block)
}

/// Indexes a non-standard block in the context's global best-fit tree.
///
/// # Safety
///
/// `block` must be an OS block owned by `cx` with no live allocations.
pub(crate) unsafe fn release_nonstandard(cx: &mut Cx, block: NonNull<Block>) {
    // SAFETY: per contract; the block's memory becomes the tree node.
    unsafe {
        let size = (*block.as_ptr()).size;
        crate::memtree::insert(&mut cx.nonstd, block.cast(), size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounding() {
        assert_eq!(round_up(0), 0);
        assert_eq!(round_up(1), ALIGNMENT);
        assert_eq!(round_up(ALIGNMENT), ALIGNMENT);
        assert_eq!(round_up(ALIGNMENT + 1), 2 * ALIGNMENT);
    }

    #[test]
    fn rounded_sizes_leave_the_color_bit_clear() {
        for n in 1..64 {
            assert_eq!(round_up(n) & 1, 0);
        }
    }
}

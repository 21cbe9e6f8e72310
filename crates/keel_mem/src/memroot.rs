// Copyright (c) The Keel Project Authors.
// Licensed under the MIT License.

use std::ptr::NonNull;

use crate::block::{Block, os_free};
use crate::context::Cx;
use crate::pool::PoolData;

/// Configuration record behind each root pool.
///
/// Every pool family (a root and its descendants) shares one memroot: the
/// standard block size used for that family and a LIFO free-list of standard
/// blocks ready for fast reuse. The memroot is born with its root pool and dies
/// with it.
pub(crate) struct Memroot {
    pub stdsize: usize,

    /// LIFO free-list of standard-sized blocks.
    pub std_blocks: Option<NonNull<Block>>,

    pub pool: NonNull<PoolData>,
    pub cx: NonNull<Cx>,

    /// Next memroot in the context's list.
    pub next: Option<NonNull<Memroot>>,
}

impl Memroot {
    /// Heap-allocates a memroot and links it at the head of the context list.
    ///
    /// The `pool` backlink starts dangling; the caller stores the root pool as
    /// soon as it has carved it out of the first block.
    pub(crate) fn create(cx: NonNull<Cx>, stdsize: usize) -> NonNull<Memroot> {
        let memroot = Box::new(Memroot {
            stdsize,
            std_blocks: None,
            pool: NonNull::dangling(),
            cx,
            next: None,
        });
        // SAFETY: Box::into_raw never returns null.
        let memroot = unsafe { NonNull::new_unchecked(Box::into_raw(memroot)) };

        // SAFETY: the context outlives every memroot linked into it.
        unsafe {
            (*memroot.as_ptr()).next = (*cx.as_ptr()).memroots;
            (*cx.as_ptr()).memroots = Some(memroot);
        }
        memroot
    }

    /// Unlinks `memroot` from its context's list, OS-frees every block on its
    /// free-list, and releases the record itself.
    ///
    /// # Safety
    ///
    /// `memroot` must be live with its root pool already torn down, and must
    /// not be referenced again.
    pub(crate) unsafe fn teardown(memroot: NonNull<Memroot>) {
        // SAFETY: per contract; list nodes are live until freed here.
        unsafe {
            let cx = (*memroot.as_ptr()).cx;

            // Unlink from the context.
            let mut link = &raw mut (*cx.as_ptr()).memroots;
            while let Some(scan) = *link {
                if scan == memroot {
                    *link = (*scan.as_ptr()).next;
                    break;
                }
                link = &raw mut (*scan.as_ptr()).next;
            }

            // Give the standard blocks back to the OS.
            let mut scan = (*memroot.as_ptr()).std_blocks;
            while let Some(block) = scan {
                scan = (*block.as_ptr()).next;
                os_free(block);
            }

            drop(Box::from_raw(memroot.as_ptr()));
        }
    }
}

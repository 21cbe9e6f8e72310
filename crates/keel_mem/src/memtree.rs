// Copyright (c) The Keel Project Authors.
// Licensed under the MIT License.

//! Best-fit index of free memory blocks.
//!
//! A red-black tree keyed by block size, with two domain twists. First, the
//! nodes live *inside* the memory they index: a freed block is overlaid with a
//! [`TreeNode`] and becomes its own tree node, so the index needs no allocator
//! of its own. Second, because a node's storage is the free block itself, nodes
//! can never be relocated: deletion manipulates links and swaps positions
//! rather than copying payloads the way textbook red-black deletion does, and
//! the color stays attached to the *position* during a swap.
//!
//! The color bit is stolen from bit 0 of the size word. All indexed sizes are
//! rounded to [`ALIGNMENT`](crate::block::ALIGNMENT), so the bit is otherwise
//! always zero.
//!
//! Blocks of equal size chain LIFO off the representative node's `next` link;
//! only the first block of a size lives in the tree proper.

use std::ptr::NonNull;

use crate::block::Block;

/// The maximum depth of any node in the tree. A red-black tree does not have to
/// be perfectly balanced: the depth of a node can be up to twice that of
/// others, so 2^32 nodes may put some nodes at depth 32 and others at 64.
const MAX_DEPTH: usize = 64;

/// A free block wearing its tree-node overlay. The block header comes first so
/// a `TreeNode` pointer is also a valid [`Block`] pointer.
#[repr(C)]
pub(crate) struct TreeNode {
    pub b: Block,
    pub smaller: Option<NonNull<TreeNode>>,
    pub larger: Option<NonNull<TreeNode>>,
}

/// The smallest span worth indexing: a node overlay plus one word of slack.
pub(crate) const MIN_REMNANT: usize = size_of::<TreeNode>() + size_of::<usize>();

type Link = Option<NonNull<TreeNode>>;

#[inline]
unsafe fn node_size(node: NonNull<TreeNode>) -> usize {
    // SAFETY: caller guarantees `node` is a live tree node.
    unsafe { (*node.as_ptr()).b.size & !1 }
}

#[inline]
unsafe fn is_red(node: NonNull<TreeNode>) -> bool {
    // SAFETY: caller guarantees `node` is a live tree node.
    unsafe { (*node.as_ptr()).b.size & 1 == 1 }
}

#[inline]
unsafe fn is_black(node: NonNull<TreeNode>) -> bool {
    // SAFETY: caller guarantees `node` is a live tree node.
    unsafe { !is_red(node) }
}

/// Leaves (`None`) are implicitly black.
#[inline]
unsafe fn is_black_or_leaf(link: Link) -> bool {
    match link {
        None => true,
        // SAFETY: caller guarantees live nodes.
        Some(node) => unsafe { is_black(node) },
    }
}

#[inline]
unsafe fn make_red(node: NonNull<TreeNode>) {
    // SAFETY: caller guarantees `node` is a live tree node.
    unsafe { (*node.as_ptr()).b.size |= 1 };
}

#[inline]
unsafe fn make_black(node: NonNull<TreeNode>) {
    // SAFETY: caller guarantees `node` is a live tree node.
    unsafe { (*node.as_ptr()).b.size &= !1 };
}

/// Finds the link in NODE's parent which refers to NODE. This may be the root
/// link of the tree.
///
/// Deletion depends on this searching for the *stale* value: after a node has
/// been spliced out, its parent still points at it, and that is the link we
/// want to redirect. It is also used to find the link to a sibling.
///
/// # Safety
///
/// `parents[..depth]` must be the live ancestor chain of the node that is at
/// `depth`, and `root` must be valid for the lifetime of the returned pointer.
unsafe fn get_reference(parents: &[Link; MAX_DEPTH], depth: usize, node: NonNull<TreeNode>, root: *mut Link) -> *mut Link {
    if depth == 0 {
        return root;
    }
    let parent = parents[depth - 1].expect("ancestor chain is populated");
    // SAFETY: `parent` is a live node per the contract.
    unsafe {
        if (*parent.as_ptr()).smaller == Some(node) {
            &raw mut (*parent.as_ptr()).smaller
        } else {
            &raw mut (*parent.as_ptr()).larger
        }
    }
}

/// Rotates NEW_ROOT up over the node currently in `link`, pushing that node
/// down to the smaller side.
///
/// # Safety
///
/// `link` must point at the parent link of NEW_ROOT's current parent, and both
/// nodes must be live.
unsafe fn rotate_left(new_root: NonNull<TreeNode>, link: *mut Link) {
    // SAFETY: per contract.
    unsafe {
        let old_root = (*link).expect("rotation target is present");
        (*old_root.as_ptr()).larger = (*new_root.as_ptr()).smaller;
        (*new_root.as_ptr()).smaller = Some(old_root);
        *link = Some(new_root);
    }
}

/// Mirror of [`rotate_left`].
///
/// # Safety
///
/// As [`rotate_left`].
unsafe fn rotate_right(new_root: NonNull<TreeNode>, link: *mut Link) {
    // SAFETY: per contract.
    unsafe {
        let old_root = (*link).expect("rotation target is present");
        (*old_root.as_ptr()).smaller = (*new_root.as_ptr()).larger;
        (*new_root.as_ptr()).larger = Some(old_root);
        *link = Some(new_root);
    }
}

/// Places the free block `mem` of `size` bytes into the tree rooted at `root`.
///
/// If a node of the same size already exists, `mem` joins that node's chain
/// (LIFO) with no tree mutation; otherwise `mem` is overlaid with node fields,
/// inserted red, and the tree is rebalanced.
///
/// # Safety
///
/// `mem` must be exclusively owned free memory of at least `size` bytes,
/// aligned to [`ALIGNMENT`](crate::block::ALIGNMENT), with `size` rounded (bit
/// 0 clear) and at least `size_of::<TreeNode>()`. The same address must not be
/// inserted twice.
pub(crate) unsafe fn insert(root: &mut Link, mem: NonNull<u8>, size: usize) {
    debug_assert_eq!(size & 1, 0, "size must be rounded; bit 0 carries the color");
    debug_assert!(size >= size_of::<TreeNode>());

    let node = mem.cast::<TreeNode>();

    let Some(top) = *root else {
        // Empty tree: the block becomes the (black) root.
        // SAFETY: `mem` is writable free memory large enough for a node.
        unsafe {
            node.write(TreeNode {
                b: Block { size, next: None },
                smaller: None,
                larger: None,
            });
        }
        *root = Some(node);
        return;
    };

    // Binary-tree insertion, remembering the ancestor chain as we descend since
    // nodes do not track their parents.
    let mut parents: [Link; MAX_DEPTH] = [None; MAX_DEPTH];
    let mut depth = 0;
    let mut scan = top;

    // SAFETY (for the whole function body below): every node reached through
    // `root` is live free memory owned by this tree, and `mem` is writable.
    unsafe {
        loop {
            parents[depth] = Some(scan);

            if node_size(scan) == size {
                // Same size already present: chain the block off that node and
                // skip all tree manipulation.
                let chained = mem.cast::<Block>();
                chained.write(Block {
                    size,
                    next: (*scan.as_ptr()).b.next,
                });
                (*scan.as_ptr()).b.next = Some(chained);
                return;
            }

            if size < node_size(scan) {
                match (*scan.as_ptr()).smaller {
                    None => {
                        (*scan.as_ptr()).smaller = Some(node);
                        break;
                    }
                    Some(next) => scan = next,
                }
            } else {
                match (*scan.as_ptr()).larger {
                    None => {
                        (*scan.as_ptr()).larger = Some(node);
                        break;
                    }
                    Some(next) => scan = next,
                }
            }

            depth += 1;
            assert!(depth < MAX_DEPTH, "memtree exceeded its depth bound");
        }

        // Turn MEM into a proper node, marked red.
        node.write(TreeNode {
            b: Block { size: size | 1, next: None },
            smaller: None,
            larger: None,
        });

        // NODE hangs one level below SCAN.
        depth += 1;

        let mut node = node;
        loop {
            // A parent must exist here: either we just linked below SCAN, or we
            // jumped back up to a non-root grandparent.
            let parent = parents[depth - 1].expect("inserted node has a parent");
            if is_black(parent) {
                return;
            }

            // The parent is red, so it is not the root; a grandparent exists.
            let gramps = parents[depth - 2].expect("red parent is below the root");

            let uncle = if parents[depth - 1] == (*gramps.as_ptr()).smaller {
                (*gramps.as_ptr()).larger
            } else {
                (*gramps.as_ptr()).smaller
            };

            if let Some(uncle) = uncle {
                if is_red(uncle) {
                    make_black(parent);
                    make_black(uncle);
                    make_red(gramps);

                    if Some(gramps) == *root {
                        make_black(gramps);
                        return;
                    }

                    // Continue rebalancing from the grandparent. Only O(log n)
                    // jumps back up the tree can happen.
                    node = gramps;
                    depth -= 2;
                    continue;
                }
            }
            // Uncle is black (or absent, which is implicitly black).

            // Whack the tree into a state where a rotation around GRAMPS will
            // restore the invariants: if NODE is on the inside, rotate it to
            // the outside first.
            let (node, parent) = if Some(node) == (*parent.as_ptr()).larger && Some(parent) == (*gramps.as_ptr()).smaller {
                rotate_left(node, &raw mut (*gramps.as_ptr()).smaller);
                // NODE moved up a level, PARENT down; depth keeps pointing at
                // the lower of the two.
                (parent, node)
            } else if Some(node) == (*parent.as_ptr()).smaller && Some(parent) == (*gramps.as_ptr()).larger {
                rotate_right(node, &raw mut (*gramps.as_ptr()).larger);
                (parent, node)
            } else {
                (node, parent)
            };

            debug_assert!(is_red(parent));
            debug_assert!(is_red(node));

            make_black(parent);
            make_red(gramps);

            let rotation_parent = get_reference(&parents, depth - 2, gramps, root);
            if Some(node) == (*parent.as_ptr()).smaller && Some(parent) == (*gramps.as_ptr()).smaller {
                rotate_right(parent, rotation_parent);
            } else {
                rotate_left(parent, rotation_parent);
            }
            return;
        }
    }
}

/// Removes and returns a block whose size is at least `size` and as close to it
/// as possible, or `None` when no block is large enough.
///
/// When the best-fit node has chained equal-size blocks, the chain head is
/// unlinked and returned with no tree mutation. Otherwise the node itself is
/// removed and the tree rebalanced. The returned block's header holds its
/// exact (color-stripped) size.
///
/// # Safety
///
/// The tree rooted at `root` must consist of live, exclusively owned free
/// blocks.
pub(crate) unsafe fn fetch(root: &mut Link, size: usize) -> Option<NonNull<Block>> {
    let mut scan = (*root)?;

    let mut parents: [Link; MAX_DEPTH] = [None; MAX_DEPTH];
    let mut depth = 0;
    let mut larger_depth: Option<usize> = None;

    // SAFETY (whole body): all nodes reached through `root` are live free
    // memory owned by this tree.
    unsafe {
        // Descend toward SIZE, remembering the most recent node that was large
        // enough. Even on an exact size match the descent continues: the node
        // at the bottom is the predecessor needed for deletion.
        loop {
            parents[depth] = Some(scan);

            if size <= node_size(scan) {
                larger_depth = Some(depth);
                match (*scan.as_ptr()).smaller {
                    None => break,
                    Some(next) => scan = next,
                }
            } else {
                match (*scan.as_ptr()).larger {
                    None => break,
                    Some(next) => scan = next,
                }
            }

            depth += 1;
            assert!(depth < MAX_DEPTH, "memtree exceeded its depth bound");
        }

        // Never saw a sufficient size.
        let larger_depth = larger_depth?;

        // SCAN is the predecessor; the winner is SCAN itself when it is large
        // enough, else the remembered best fit.
        let target = if size <= node_size(scan) {
            scan
        } else {
            parents[larger_depth].expect("best-fit depth was recorded")
        };

        // Extra blocks chained off this node: pop one, no tree changes needed.
        if let Some(result) = (*target.as_ptr()).b.next {
            (*target.as_ptr()).b.next = (*result.as_ptr()).next;
            (*result.as_ptr()).next = None;
            return Some(result);
        }

        // TARGET leaves the tree; SCAN is its predecessor.
        let target_is_red;
        let mut child: Link;
        let mut depth = depth;

        if (*target.as_ptr()).smaller.is_some() && (*target.as_ptr()).larger.is_some() {
            // TARGET has two children, so swap it with SCAN, which bottomed out
            // the search and thus has at most one child. Data moves but colors
            // stay attached to positions, because the node storage *is* the free
            // block, so the textbook value-copy is not available.
            let target_color = (*target.as_ptr()).b.size & 1;
            target_is_red = is_red(scan);

            (*scan.as_ptr()).b.size = node_size(scan) | target_color;

            // The parent should point to SCAN now, not TARGET.
            *get_reference(&parents, larger_depth, target, root) = Some(scan);

            child = if (*scan.as_ptr()).smaller.is_some() {
                (*scan.as_ptr()).smaller
            } else {
                (*scan.as_ptr()).larger
            };

            if larger_depth == depth - 1 {
                // TARGET is SCAN's direct parent; careful with the links.
                if (*target.as_ptr()).smaller == Some(scan) {
                    (*scan.as_ptr()).smaller = child;
                    (*scan.as_ptr()).larger = (*target.as_ptr()).larger;
                } else {
                    (*scan.as_ptr()).smaller = (*target.as_ptr()).smaller;
                    (*scan.as_ptr()).larger = child;
                }
            } else {
                (*scan.as_ptr()).smaller = (*target.as_ptr()).smaller;
                (*scan.as_ptr()).larger = (*target.as_ptr()).larger;

                // The parent that was referring to SCAN now references CHILD.
                *get_reference(&parents, depth, scan, root) = child;
            }

            parents[larger_depth] = Some(scan);
        } else {
            target_is_red = is_red(target);

            child = if (*target.as_ptr()).smaller.is_some() {
                (*target.as_ptr()).smaller
            } else {
                (*target.as_ptr()).larger
            };

            // If TARGET is not SCAN, it sits higher in the tree.
            if target != scan {
                depth = larger_depth;
            }

            *get_reference(&parents, depth, target, root) = child;
        }

        // CHILD moved up a level.
        parents[depth] = child;

        // Strip the color so the returned header carries the exact size.
        make_black(target);

        if target_is_red {
            // Removing a red node never unbalances anything.
            return Some(target.cast());
        }
        if let Some(c) = child {
            if is_red(c) {
                make_black(c);
                return Some(target.cast());
            }
        }

        // CHILD (black or a leaf) now has one black too few on its paths.
        loop {
            if depth == 0 {
                return Some(target.cast());
            }

            let parent = parents[depth - 1].expect("non-root node has a parent");
            let sibling = if (*parent.as_ptr()).smaller == child {
                (*parent.as_ptr()).larger
            } else {
                (*parent.as_ptr()).smaller
            };
            // TARGET and CHILD were both black, so SIBLING's side of PARENT
            // carries two blacks, which a leaf cannot provide.
            let mut sibling = sibling.expect("sibling of a double-black cannot be a leaf");

            let mut parent_now_red = false;
            if is_red(sibling) {
                // Since SIBLING is red, PARENT is black.
                make_red(parent);
                make_black(sibling);

                let rotation_parent = get_reference(&parents, depth - 1, parent, root);
                let new_sibling = if (*parent.as_ptr()).smaller == child {
                    let new_sibling = (*sibling.as_ptr()).smaller;
                    rotate_left(sibling, rotation_parent);
                    new_sibling
                } else {
                    let new_sibling = (*sibling.as_ptr()).larger;
                    rotate_right(sibling, rotation_parent);
                    new_sibling
                };

                // CHILD moved further down the tree.
                parents[depth - 1] = Some(sibling);
                parents[depth] = Some(parent);
                depth += 1;
                parents[depth] = child;

                // Same parent, new sibling; each path through it still needs
                // multiple blacks, so it cannot be a leaf.
                sibling = new_sibling.expect("post-rotation sibling cannot be a leaf");
                parent_now_red = true;
            }

            if !parent_now_red
                && is_black(parent)
                && is_black(sibling)
                && is_black_or_leaf((*sibling.as_ptr()).smaller)
                && is_black_or_leaf((*sibling.as_ptr()).larger)
            {
                make_red(sibling);

                // Rebalance one level up from PARENT.
                child = Some(parent);
                depth -= 1;
                continue;
            }

            if is_red(parent)
                && is_black(sibling)
                && is_black_or_leaf((*sibling.as_ptr()).smaller)
                && is_black_or_leaf((*sibling.as_ptr()).larger)
            {
                make_red(sibling);
                make_black(parent);
                return Some(target.cast());
            }

            // The black/black-children cases were eliminated above, so SIBLING
            // is black with at least one red child; move that child to the
            // side the final rotation needs.
            debug_assert!(is_black(sibling));
            {
                let rotation_parent = get_reference(&parents, depth, sibling, root);

                if (*parent.as_ptr()).smaller == child && is_black_or_leaf((*sibling.as_ptr()).larger) {
                    let new_sibling = (*sibling.as_ptr()).smaller.expect("red/black children");
                    debug_assert!(is_red(new_sibling));

                    make_red(sibling);
                    make_black(new_sibling);

                    rotate_right(new_sibling, rotation_parent);
                    sibling = new_sibling;
                } else if (*parent.as_ptr()).larger == child && is_black_or_leaf((*sibling.as_ptr()).smaller) {
                    let new_sibling = (*sibling.as_ptr()).larger.expect("black/red children");
                    debug_assert!(is_red(new_sibling));

                    make_red(sibling);
                    make_black(new_sibling);

                    rotate_left(new_sibling, rotation_parent);
                    sibling = new_sibling;
                }
            }

            // Final rotation around PARENT.
            if is_black(parent) {
                make_black(sibling);
            } else {
                make_red(sibling);
                make_black(parent);
            }
            let rotation_parent = get_reference(&parents, depth - 1, parent, root);
            if (*parent.as_ptr()).smaller == child {
                make_black((*sibling.as_ptr()).larger.expect("outer child is red"));
                rotate_left(sibling, rotation_parent);
            } else {
                make_black((*sibling.as_ptr()).smaller.expect("outer child is red"));
                rotate_right(sibling, rotation_parent);
            }

            return Some(target.cast());
        }
    }
}

#[cfg(test)]
pub(crate) mod debug {
    //! Invariant validation and dumping for test suites.

    use super::*;

    /// Returns the black depth of `node`, treating leaves as black (property
    /// 3), and asserts along the way that children of red nodes are black
    /// (property 4) and that all paths carry the same number of blacks
    /// (property 5).
    ///
    /// The root is *not* required to be black: recoloring it cannot violate
    /// any invariant, so this implementation never bothers.
    ///
    /// # Safety
    ///
    /// `node` must be a live (sub)tree.
    pub(crate) unsafe fn depth(node: Link) -> usize {
        // SAFETY: per contract.
        unsafe {
            let Some(node) = node else { return 1 };

            if is_red(node) {
                if (*node.as_ptr()).smaller.is_none() {
                    assert!((*node.as_ptr()).larger.is_none());
                    return 1;
                }
                assert!((*node.as_ptr()).larger.is_some());

                assert!(is_black((*node.as_ptr()).smaller.expect("checked")));
                assert!(is_black((*node.as_ptr()).larger.expect("checked")));

                let d = depth((*node.as_ptr()).smaller);
                assert_eq!(depth((*node.as_ptr()).larger), d);
                return d;
            }

            if (*node.as_ptr()).smaller.is_none() {
                if (*node.as_ptr()).larger.is_some() {
                    assert_eq!(depth((*node.as_ptr()).larger), 1);
                }
                return 2;
            }
            if (*node.as_ptr()).larger.is_none() {
                assert_eq!(depth((*node.as_ptr()).smaller), 1);
                return 2;
            }

            let d = depth((*node.as_ptr()).smaller);
            assert_eq!(depth((*node.as_ptr()).larger), d);
            d + 1
        }
    }

    /// Renders the tree into `out`, one node per line, for eyeballing failed
    /// tests.
    ///
    /// # Safety
    ///
    /// `node` must be a live (sub)tree.
    pub(crate) unsafe fn dump(node: Link, level: usize, out: &mut String) {
        use std::fmt::Write;

        if level >= MAX_DEPTH {
            out.push_str("=== LOOP DETECTED\n");
            return;
        }

        for _ in 0..level {
            out.push_str(". ");
        }

        // SAFETY: per contract.
        unsafe {
            let Some(node) = node else {
                out.push_str("null\n");
                return;
            };

            let color = if is_black(node) { "BLACK" } else { "RED" };
            let _ = writeln!(out, "{color}:{}", node_size(node));

            dump((*node.as_ptr()).smaller, level + 1, out);
            dump((*node.as_ptr()).larger, level + 1, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Backing storage for tree nodes. `u64` elements keep every block aligned
    /// for the node overlay.
    struct Arena {
        buffers: Vec<Vec<u64>>,
    }

    impl Arena {
        fn new() -> Self {
            Self { buffers: Vec::new() }
        }

        fn block(&mut self, size: usize) -> NonNull<u8> {
            assert!(size >= size_of::<TreeNode>());
            let mut buf = vec![0_u64; size.div_ceil(8)];
            let ptr = NonNull::new(buf.as_mut_ptr().cast::<u8>()).expect("vec allocation");
            self.buffers.push(buf);
            ptr
        }
    }

    fn tree_size(root: Link) -> usize {
        // SAFETY: test trees only hold live arena blocks.
        unsafe {
            let Some(node) = root else { return 0 };
            let mut chained = 0;
            let mut next = (*node.as_ptr()).b.next;
            while let Some(block) = next {
                chained += 1;
                next = (*block.as_ptr()).next;
            }
            1 + chained + tree_size((*node.as_ptr()).smaller) + tree_size((*node.as_ptr()).larger)
        }
    }

    #[test]
    fn insert_then_fetch_exact() {
        let mut arena = Arena::new();
        let mut root: Link = None;

        let mem = arena.block(128);
        // SAFETY: arena blocks are exclusively owned and large enough.
        unsafe {
            insert(&mut root, mem, 128);
            let block = fetch(&mut root, 128).expect("exact fit");
            assert_eq!(block.cast::<u8>(), mem);
            assert_eq!((*block.as_ptr()).size, 128);
        }
        assert!(root.is_none());
    }

    #[test]
    fn best_fit_scenario() {
        let mut arena = Arena::new();
        let mut root: Link = None;

        let b100 = arena.block(100);
        let b200 = arena.block(200);
        let b300 = arena.block(300);

        // SAFETY: arena blocks are exclusively owned and large enough.
        unsafe {
            insert(&mut root, b100, 100);
            insert(&mut root, b200, 200);
            insert(&mut root, b300, 300);
            assert_eq!(tree_size(root), 3);

            // 150 fits best into the 200 block.
            let hit = fetch(&mut root, 150).expect("200 satisfies 150");
            assert_eq!(hit.cast::<u8>(), b200);
            assert_eq!(tree_size(root), 2);

            // 50 falls through to the smallest sufficient block.
            let hit = fetch(&mut root, 50).expect("100 satisfies 50");
            assert_eq!(hit.cast::<u8>(), b100);

            let hit = fetch(&mut root, 300).expect("exact 300");
            assert_eq!(hit.cast::<u8>(), b300);

            // Nothing left at all.
            assert!(fetch(&mut root, 10).is_none());
        }
        assert!(root.is_none());
    }

    #[test]
    fn equal_sizes_chain_lifo() {
        let mut arena = Arena::new();
        let mut root: Link = None;

        let first = arena.block(64);
        let second = arena.block(64);
        let third = arena.block(64);

        // SAFETY: arena blocks are exclusively owned and large enough.
        unsafe {
            insert(&mut root, first, 64);
            insert(&mut root, second, 64);
            insert(&mut root, third, 64);

            // The chain is LIFO and serviced before the tree node itself.
            assert_eq!(fetch(&mut root, 64).expect("chained").cast::<u8>(), third);
            assert_eq!(fetch(&mut root, 64).expect("chained").cast::<u8>(), second);
            assert_eq!(fetch(&mut root, 64).expect("tree node").cast::<u8>(), first);
            assert!(fetch(&mut root, 64).is_none());
        }
    }

    #[test]
    fn fetch_from_empty() {
        let mut root: Link = None;
        // SAFETY: an empty tree dereferences nothing.
        unsafe {
            assert!(fetch(&mut root, 64).is_none());
        }
    }

    #[test]
    fn color_bit_is_isolated_from_size() {
        let mut arena = Arena::new();
        let mut root: Link = None;

        // Enough inserts to force red nodes and rotations.
        let sizes: Vec<usize> = (1..=32).map(|i| 40 + 8 * i).collect();
        let blocks: Vec<NonNull<u8>> = sizes.iter().map(|&s| arena.block(s)).collect();

        // SAFETY: arena blocks are exclusively owned and large enough.
        unsafe {
            for (&size, &mem) in sizes.iter().zip(&blocks) {
                insert(&mut root, mem, size);
            }
            debug::depth(root);

            for &size in &sizes {
                let block = fetch(&mut root, size).expect("every inserted size comes back");
                // The returned header must carry the exact size, color stripped.
                assert_eq!((*block.as_ptr()).size, size);
                debug::depth(root);
            }
        }
        assert!(root.is_none());
    }

    /// N random insertions followed by N fetches of the same sizes, in all four
    /// insertion/fetch order combinations. Every fetch must succeed, the bytes
    /// must balance, and the tree must end empty.
    #[rstest::rstest]
    #[case(false, false)]
    #[case(false, true)]
    #[case(true, false)]
    #[case(true, true)]
    fn random_insert_fetch_grid(#[case] reverse_inserts: bool, #[case] reverse_fetches: bool) {
        const N: usize = 500;

        let mut rng = fastrand::Rng::with_seed(0x6b65_656c);
        let mut arena = Arena::new();
        let mut root: Link = None;

        let mut sizes: Vec<usize> = (0..N).map(|_| crate::block::round_up(rng.usize(48..4096))).collect();
        if reverse_inserts {
            sizes.reverse();
        }

        let total: usize = sizes.iter().sum();
        let blocks: Vec<NonNull<u8>> = sizes.iter().map(|&s| arena.block(s)).collect();

        // SAFETY: arena blocks are exclusively owned and large enough.
        unsafe {
            for (&size, &mem) in sizes.iter().zip(&blocks) {
                insert(&mut root, mem, size);
            }
            debug::depth(root);
            assert_eq!(tree_size(root), N);

            let mut fetch_sizes = sizes.clone();
            if reverse_fetches {
                fetch_sizes.reverse();
            }

            let mut returned = 0;
            for &size in &fetch_sizes {
                let block = fetch(&mut root, size).expect("every inserted size comes back");
                assert_eq!((*block.as_ptr()).size, size);
                returned += (*block.as_ptr()).size;
            }
            debug::depth(root);

            assert_eq!(returned, total);
        }
        assert!(root.is_none());
    }

    #[test]
    fn dump_renders_every_node() {
        let mut arena = Arena::new();
        let mut root: Link = None;

        // SAFETY: arena blocks are exclusively owned and large enough.
        unsafe {
            for size in [64, 128, 256] {
                let mem = arena.block(size);
                insert(&mut root, mem, size);
            }

            let mut out = String::new();
            debug::dump(root, 0, &mut out);
            for size in ["64", "128", "256"] {
                assert!(out.contains(size), "dump missing node {size}: {out}");
            }
        }
    }
}

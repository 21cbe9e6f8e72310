// Copyright (c) The Keel Project Authors.
// Licensed under the MIT License.

//! Memory substrate of the Keel runtime.
//!
//! Everything hangs off a [`Context`]: an independent instance of the runtime
//! that owns its pools, block caches, and registries, and is driven from a
//! single thread.
//!
//! [`Pool`]s are region allocators. An allocation is a pointer bump in the
//! common case; freed spans are recycled through a per-pool best-fit index
//! (the *memtree*, whose nodes live inside the free memory itself), and
//! requests larger than a standard block get blocks of their own, shared
//! across the context once released. Pools form a tree with transitive
//! destruction, an ordered cleanup list with a declarable partial order, and
//! membership in a context-wide ownership graph that lets arbitrary resources
//! tie their lifetime to a pool (and vice versa).
//!
//! ```
//! use keel_mem::Context;
//!
//! let ctx = Context::new();
//! let pool = ctx.root_pool();
//!
//! let greeting = pool.strdup("hello");
//! assert_eq!(greeting, "hello");
//!
//! let scratch = pool.create();
//! let _big = scratch.alloc(64 * 1024);
//! scratch.destroy();
//!
//! pool.destroy();
//! ```

mod block;
mod cleanup;
mod context;
mod memroot;
mod memtree;
mod pool;
mod strings;
mod track;

pub use block::ALIGNMENT;
pub use cleanup::{CleanupFn, ShiftFn};
pub use context::{Context, DEFAULT_STDSIZE, OomHandler, OomResponse, STDSIZE_DEFAULT, STDSIZE_MIN};
pub use pool::Pool;

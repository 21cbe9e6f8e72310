// Copyright (c) The Keel Project Authors.
// Licensed under the MIT License.

//! Convenience builders layered on [`Pool::alloc`].

use std::fmt;
use std::ptr::NonNull;

use crate::pool::Pool;

impl<'ctx> Pool<'ctx> {
    /// Copies `bytes` into the pool.
    #[must_use]
    pub fn memdup(self, bytes: &[u8]) -> &'ctx [u8] {
        if bytes.is_empty() {
            return &[];
        }
        let mem = self.alloc(bytes.len());
        // SAFETY: `alloc` returned at least `bytes.len()` writable bytes that
        // live until the pool is cleared or destroyed.
        unsafe {
            mem.as_ptr().copy_from_nonoverlapping(bytes.as_ptr(), bytes.len());
            std::slice::from_raw_parts(mem.as_ptr(), bytes.len())
        }
    }

    /// Copies `s` into the pool.
    #[must_use]
    pub fn strdup(self, s: &str) -> &'ctx str {
        let bytes = self.memdup(s.as_bytes());
        // SAFETY: the bytes are a verbatim copy of a valid UTF-8 string.
        unsafe { std::str::from_utf8_unchecked(bytes) }
    }

    /// Copies at most the first `amt` bytes of `s` into the pool, backing off
    /// to the nearest character boundary.
    #[must_use]
    pub fn strndup(self, s: &str, amt: usize) -> &'ctx str {
        if amt >= s.len() {
            return self.strdup(s);
        }
        let mut end = amt;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        self.strdup(&s[..end])
    }

    /// Concatenates `parts` into a single pool-allocated string.
    #[must_use]
    pub fn strcat(self, parts: &[&str]) -> &'ctx str {
        let total: usize = parts.iter().map(|p| p.len()).sum();
        if total == 0 {
            return "";
        }

        let mem = self.alloc(total);
        // SAFETY: `alloc` returned at least `total` writable bytes; the copies
        // are disjoint and cover the span exactly.
        unsafe {
            let mut dst = mem.as_ptr();
            for part in parts {
                dst.copy_from_nonoverlapping(part.as_ptr(), part.len());
                dst = dst.add(part.len());
            }
            std::str::from_utf8_unchecked(std::slice::from_raw_parts(mem.as_ptr(), total))
        }
    }

    /// Formats into the pool. Invoke as `pool.sprintf(format_args!(...))`.
    #[must_use]
    pub fn sprintf(self, args: fmt::Arguments<'_>) -> &'ctx str {
        if let Some(literal) = args.as_str() {
            return self.strdup(literal);
        }
        self.strdup(&fmt::format(args))
    }

    /// Copies a value into the pool, returning a raw pointer into pool memory.
    #[must_use]
    pub fn dup_value<T: Copy>(self, value: T) -> NonNull<T> {
        let mem = self.alloc(size_of::<T>()).cast::<T>();
        // SAFETY: `alloc` aligns to at least 8; `T: Copy` values used with
        // pools are plain data within that alignment.
        unsafe {
            debug_assert_eq!(mem.as_ptr() as usize % align_of::<T>(), 0);
            mem.write(value);
        }
        mem
    }
}

// Copyright (c) The Keel Project Authors.
// Licensed under the MIT License.

//! The write protocol: pending vectors, partial-write adjustment, and iovec
//! patching.
//!
//! A producer hands the engine a vector of borrowed spans. The engine writes
//! as much as the socket accepts and remembers its position as an element
//! index plus a byte offset into that element; the producer's storage is never
//! copied. On the next writable event the vector is re-issued *patched* — the
//! first live element advanced by the partial offset — and the producer is
//! only consulted again once the whole vector has departed.

use std::ptr::NonNull;

use keel_error::{Error, code_values};

use crate::channel::ChannelData;
use crate::engine::{EngineInner, absorb_error};
use crate::pal::retry_eintr;

/// On-stack patch array size. Vectors with more live elements fall back to
/// the engine's scratch pool for the patched copy.
const IOV_STACK: usize = 128;

/// The write protocol. Returns `true` when the channel's interest state
/// changed ("dirty") and its registration must be recomputed.
pub(crate) unsafe fn perform_write<'ctx>(eng: NonNull<EngineInner<'ctx>>, ch: NonNull<ChannelData<'ctx>>) -> bool {
    // SAFETY: engine and channel are live; pending spans are valid per the
    // producer contract.
    unsafe {
        let fd = (*ch.as_ptr()).fd;

        loop {
            if (*ch.as_ptr()).pending.is_empty() {
                match crate::channel::invoke_write(eng, ch) {
                    Ok(Some(vec)) if !vec.is_empty() => {
                        (*ch.as_ptr()).pending = vec;
                        (*ch.as_ptr()).pending_idx = 0;
                        (*ch.as_ptr()).pending_off = 0;
                    }
                    Ok(_) => {
                        // Nothing further to write.
                        (*ch.as_ptr()).desire_write = false;
                        return true;
                    }
                    Err(err) => {
                        absorb_error(eng, err);
                        (*ch.as_ptr()).desire_write = false;
                        return true;
                    }
                }
            }

            let idx = (*ch.as_ptr()).pending_idx;
            let off = (*ch.as_ptr()).pending_off;
            let live = &(&(*ch.as_ptr()).pending)[idx..];
            let count = live.len();

            // Patch the vector: element 0 advanced by the partial offset. The
            // stack array covers everything but pathological vector counts.
            let mut stack: [libc::iovec; IOV_STACK] =
                // SAFETY: iovec is plain old data; all-zero is valid.
                std::mem::zeroed();
            let iov: *mut libc::iovec = if count <= IOV_STACK {
                stack.as_mut_ptr()
            } else {
                (*eng.as_ptr())
                    .scratch
                    .alloc(count * size_of::<libc::iovec>())
                    .cast::<libc::iovec>()
                    .as_ptr()
            };

            for (i, span) in live.iter().enumerate() {
                let skip = if i == 0 { off } else { 0 };
                iov.add(i).write(libc::iovec {
                    iov_base: span.base.add(skip).cast_mut().cast(),
                    iov_len: span.len - skip,
                });
            }

            let n = retry_eintr!(libc::writev(fd, iov, count as libc::c_int));

            if n < 0 {
                let errno = std::io::Error::last_os_error();
                if matches!(errno.raw_os_error(), Some(libc::EAGAIN | libc::EWOULDBLOCK)) {
                    // Socket full; the pending state stays as-is and the event
                    // mask needs no re-evaluation.
                    return false;
                }
                absorb_error(
                    eng,
                    Error::with_message(
                        (*eng.as_ptr()).ctx.hub(),
                        code_values::UNSPECIFIED_OS,
                        format!("writing channel vector: {errno}"),
                    ),
                );
                (*ch.as_ptr()).desire_write = false;
                return true;
            }

            if n == 0 {
                return false;
            }

            if adjust_pending(ch, n as usize) {
                // The whole vector departed; ask the producer for more.
                (*ch.as_ptr()).pending.clear();
                (*ch.as_ptr()).pending_idx = 0;
                (*ch.as_ptr()).pending_off = 0;
            }
            // Partially consumed vectors loop too: the next writev usually
            // answers would-block and exits clean.
        }
    }
}

/// Consumes `amt` written bytes across the pending vector, stepping over
/// fully-departed elements and leaving a byte offset inside the first live
/// one. Returns `true` when the whole pending set is consumed.
pub(crate) unsafe fn adjust_pending(ch: NonNull<ChannelData<'_>>, mut amt: usize) -> bool {
    // SAFETY: the channel is live; indices stay within the pending vector.
    unsafe {
        let len = (*ch.as_ptr()).pending.len();
        let mut idx = (*ch.as_ptr()).pending_idx;
        let mut off = (*ch.as_ptr()).pending_off;

        while amt > 0 {
            debug_assert!(idx < len);
            let avail = (&(*ch.as_ptr()).pending)[idx].len - off;

            if amt >= avail {
                amt -= avail;
                idx += 1;
                off = 0;
                if idx == len {
                    debug_assert_eq!(amt, 0, "kernel reported more written than was offered");
                    (*ch.as_ptr()).pending_idx = idx;
                    (*ch.as_ptr()).pending_off = 0;
                    return true;
                }
            } else {
                off += amt;
                amt = 0;
            }
        }

        (*ch.as_ptr()).pending_idx = idx;
        (*ch.as_ptr()).pending_off = off;
        idx == len
    }
}

#[cfg(test)]
mod tests {
    use std::ptr::NonNull;

    use keel_mem::Context;

    use super::*;
    use crate::channel::{ChannelKind, IoVec, WriteVec};
    use crate::engine::ChannelEngine;

    /// Builds a throwaway channel record over an fd the engine never polls.
    fn scratch_channel<'e>(engine: &'e ChannelEngine<'_>) -> NonNull<ChannelData<'e>> {
        let (a, _b) = engine.pipe().expect("socketpair");
        a.raw()
    }

    #[test]
    fn adjust_steps_over_consumed_elements() {
        let ctx = Context::new();
        let engine = ChannelEngine::new(&ctx).expect("engine");
        let ch = scratch_channel(&engine);

        let first = *b"AB";
        let second = *b"CDEF";
        let mut vec = WriteVec::new();
        vec.push(IoVec::new(&first));
        vec.push(IoVec::new(&second));

        // SAFETY: the record is live; the spans outlive the assertions.
        unsafe {
            (*ch.as_ptr()).pending = vec;

            // Three bytes: all of "AB" plus one byte of "CDEF".
            assert!(!adjust_pending(ch, 3));
            assert_eq!((*ch.as_ptr()).pending_idx, 1);
            assert_eq!((*ch.as_ptr()).pending_off, 1);

            // The remaining three bytes finish the vector.
            assert!(adjust_pending(ch, 3));
        }
    }

    #[test]
    fn adjust_handles_exact_element_boundaries() {
        let ctx = Context::new();
        let engine = ChannelEngine::new(&ctx).expect("engine");
        let ch = scratch_channel(&engine);

        let first = *b"AB";
        let second = *b"CDEF";
        let mut vec = WriteVec::new();
        vec.push(IoVec::new(&first));
        vec.push(IoVec::new(&second));

        // SAFETY: the record is live; the spans outlive the assertions.
        unsafe {
            (*ch.as_ptr()).pending = vec;

            // Exactly the first element.
            assert!(!adjust_pending(ch, 2));
            assert_eq!((*ch.as_ptr()).pending_idx, 1);
            assert_eq!((*ch.as_ptr()).pending_off, 0);

            assert!(adjust_pending(ch, 4));
        }
    }

    #[test]
    fn channel_kind_gates_datagram_ops() {
        let ctx = Context::new();
        let engine = ChannelEngine::new(&ctx).expect("engine");
        let ch = scratch_channel(&engine);

        // SAFETY: the record is live.
        unsafe {
            assert_eq!((*ch.as_ptr()).kind, ChannelKind::Stream);
        }
    }
}

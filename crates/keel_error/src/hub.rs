// Copyright (c) The Keel Project Authors.
// Licensed under the MIT License.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::code::NS_SIZE;
use crate::errmap::Errmap;
use crate::error::{Error, ErrorData};

/// Per-instance error state.
///
/// A hub is embedded in each runtime context. It owns the policy flags (tracing,
/// unhandled-error tracking), the registry of application error-code namespaces,
/// and the list of errors that have been raised but not yet marked handled.
///
/// Hubs are single-threaded, like everything else attached to a context.
pub struct ErrorHub {
    pub(crate) inner: Rc<HubInner>,

    /// Contexts are single-threaded; the hub inherits that.
    _not_send: PhantomData<*mut ()>,
}

pub(crate) struct HubInner {
    tracing: Cell<bool>,
    track_unhandled: bool,

    /// Head of the doubly-linked unhandled list. Only outermost errors live here;
    /// wrapping an error unlinks it in favor of its wrapper.
    pub(crate) unhandled: Cell<Option<NonNull<ErrorData>>>,

    /// Registered namespaces in registration order. The namespace at index `i`
    /// owns the error values `[NS_SIZE * (i + 1), NS_SIZE * (i + 2))`.
    namespaces: RefCell<Vec<Box<str>>>,
    ns_lookup: RefCell<FxHashMap<Box<str>, usize>>,
}

impl ErrorHub {
    /// Creates a hub.
    ///
    /// When `track_unhandled` is set, every raised error stays reachable through
    /// [`unhandled`](Self::unhandled) until [`Error::handled`] releases it.
    #[must_use]
    pub fn new(track_unhandled: bool) -> Self {
        Self {
            inner: Rc::new(HubInner {
                tracing: Cell::new(false),
                track_unhandled,
                unhandled: Cell::new(None),
                namespaces: RefCell::new(Vec::new()),
                ns_lookup: RefCell::new(FxHashMap::default()),
            }),
            _not_send: PhantomData,
        }
    }

    /// Enables or disables trace frames. With tracing off, [`Error::trace`]
    /// returns its argument unchanged.
    pub fn set_tracing(&self, tracing: bool) {
        self.inner.tracing.set(tracing);
    }

    /// Whether trace frames are currently inserted.
    #[must_use]
    pub fn tracing(&self) -> bool {
        self.inner.tracing.get()
    }

    /// Whether raised errors are linked into the unhandled list.
    #[must_use]
    pub fn tracks_unhandled(&self) -> bool {
        self.inner.track_unhandled
    }

    /// Registers (or retrieves) the error map for `namespace`.
    ///
    /// Registration is idempotent: the same namespace string always maps to the
    /// same code range, regardless of how many times it is registered.
    #[must_use]
    pub fn errmap(&self, namespace: &str) -> Errmap {
        if let Some(&index) = self.inner.ns_lookup.borrow().get(namespace) {
            return Errmap::new(&self.inner, index);
        }

        let mut namespaces = self.inner.namespaces.borrow_mut();
        let index = namespaces.len();
        namespaces.push(namespace.into());
        self.inner.ns_lookup.borrow_mut().insert(namespace.into(), index);

        Errmap::new(&self.inner, index)
    }

    /// Returns the head of the unhandled list, if any.
    ///
    /// The application should report the error, mark it [`handled`](Error::handled),
    /// and call this again for the next one. Typically invoked at shutdown to
    /// discover errors that were dropped without inspection.
    #[must_use]
    pub fn unhandled(&self) -> Option<Error> {
        // SAFETY: everything on the unhandled list is a live, outermost error;
        // the view handle does not transfer ownership.
        self.inner.unhandled.get().map(|data| unsafe { Error::view(data) })
    }

    /// Iterates over the whole unhandled list without releasing anything.
    #[must_use]
    pub fn unhandled_iter(&self) -> UnhandledIter<'_> {
        UnhandledIter {
            next: self.inner.unhandled.get(),
            _hub: PhantomData,
        }
    }
}

impl HubInner {
    pub(crate) fn tracing_enabled(&self) -> bool {
        self.tracing.get()
    }

    pub(crate) fn tracks_unhandled(&self) -> bool {
        self.track_unhandled
    }

    pub(crate) fn namespace_at(&self, index: usize) -> Option<Box<str>> {
        self.namespaces.borrow().get(index).cloned()
    }

    /// Maps an error value to its namespace index, if it falls in a registered
    /// range.
    pub(crate) fn namespace_of(&self, errval: i32) -> Option<usize> {
        if errval < NS_SIZE {
            return None;
        }
        let index = (errval / NS_SIZE - 1) as usize;
        if index < self.namespaces.borrow().len() { Some(index) } else { None }
    }
}

impl Drop for ErrorHub {
    fn drop(&mut self) {
        // Errors still parked on the unhandled list are owned by the hub at this
        // point; release their trees so teardown does not leak.
        let mut scan = self.inner.unhandled.take();
        while let Some(data) = scan {
            // SAFETY: the list holds live outermost errors; we detach each one
            // before freeing so the free pass never walks a stale link.
            unsafe {
                scan = (*data.as_ptr()).next;
                (*data.as_ptr()).prev = None;
                (*data.as_ptr()).next = None;
                ErrorData::free_tree(data);
            }
        }
    }
}

impl fmt::Debug for ErrorHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorHub")
            .field("tracing", &self.inner.tracing.get())
            .field("track_unhandled", &self.inner.track_unhandled)
            .field("namespaces", &self.inner.namespaces.borrow().len())
            .finish()
    }
}

/// Iterator over the unhandled list. See [`ErrorHub::unhandled_iter`].
pub struct UnhandledIter<'a> {
    next: Option<NonNull<ErrorData>>,
    _hub: PhantomData<&'a ErrorHub>,
}

impl Iterator for UnhandledIter<'_> {
    type Item = Error;

    fn next(&mut self) -> Option<Error> {
        let data = self.next?;
        // SAFETY: list nodes stay live while the hub borrow is held.
        unsafe {
            self.next = (*data.as_ptr()).next;
            Some(Error::view(data))
        }
    }
}

impl fmt::Debug for UnhandledIter<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnhandledIter").finish_non_exhaustive()
    }
}

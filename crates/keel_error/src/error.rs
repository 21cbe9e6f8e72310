// Copyright (c) The Keel Project Authors.
// Licensed under the MIT License.

use std::fmt;
use std::marker::PhantomData;
use std::panic::Location;
use std::ptr::NonNull;
use std::rc::{Rc, Weak};

use crate::code::{BuiltinCode, default_message, is_builtin};
use crate::code_values as cv;
use crate::errmap::Errmap;
use crate::hub::{ErrorHub, HubInner};

/// A Keel error object.
///
/// Errors are raised against an [`ErrorHub`] and carry an error value, an
/// optional message, and the source location of the raise (captured via
/// `#[track_caller]`). Wrapping builds a chain toward the root cause; the
/// *separate* link records an orthogonal failure discovered while handling the
/// primary one.
///
/// # Ownership
///
/// An `Error` handle does not free anything on drop. The error tree is released
/// by [`handled`](Self::handled), exactly once, through the outermost error.
/// When the hub tracks unhandled errors, an error that is dropped without being
/// handled stays reachable through [`ErrorHub::unhandled`] and is released with
/// the hub. Calling `handled` through an inner error (one that has been wrapped)
/// is detected at runtime and parks an `IMPROPER_UNHANDLED_CALL` report on the
/// unhandled list instead of corrupting the tree.
///
/// Accessors such as [`original`](Self::original) return non-owning handles into
/// the same tree; they are views, valid while the tree is alive.
pub struct Error {
    data: NonNull<ErrorData>,

    /// Errors belong to a single-threaded hub.
    _not_send: PhantomData<*mut ()>,
}

pub(crate) struct ErrorData {
    hub: Weak<HubInner>,
    errval: i32,
    msg: Option<Box<str>>,
    file: &'static str,
    line: u32,

    pub(crate) original: Option<NonNull<ErrorData>>,
    pub(crate) separate: Option<NonNull<ErrorData>>,

    /// Unhandled-list links. Only outermost errors are on the list.
    pub(crate) prev: Option<NonNull<ErrorData>>,
    pub(crate) next: Option<NonNull<ErrorData>>,

    /// Set when an improper `handled`/wrap call referenced this error while it
    /// was owned by a wrapper. A marked error is excluded from tree release so
    /// the improper call cannot cause a double free; it is left for post-mortem
    /// investigation instead.
    pub(crate) marked: bool,
}

/// One frame of an error chain, as reported by [`Error::trace_info`].
#[derive(Debug)]
pub struct TraceFrame<'a> {
    /// Source file that raised this frame.
    pub file: &'static str,
    /// Source line that raised this frame.
    pub line: u32,
    /// The raw error value of this frame (trace frames report `TRACE`).
    pub errval: i32,
    /// The message attached to this frame, if any.
    pub msg: Option<&'a str>,
    /// The next frame toward the root cause, without skipping trace frames.
    pub original: Option<Error>,
    /// The separate error attached at this frame, without skipping trace frames.
    pub separate: Option<Error>,
}

impl Error {
    /// Raises an error with no message.
    #[track_caller]
    #[must_use]
    pub fn new(hub: &ErrorHub, errval: i32) -> Self {
        let loc = Location::caller();
        Self::from_data(create(&hub.inner, errval, None, loc, None))
    }

    /// Raises an error carrying `msg`.
    #[track_caller]
    #[must_use]
    pub fn with_message(hub: &ErrorHub, errval: i32, msg: impl Into<Box<str>>) -> Self {
        let loc = Location::caller();
        Self::from_data(create(&hub.inner, errval, Some(msg.into()), loc, None))
    }

    /// Raises an error in an application namespace, translating the local code.
    #[track_caller]
    #[must_use]
    pub fn mapped(hub: &ErrorHub, emap: &Errmap, code: i32) -> Self {
        let loc = Location::caller();
        Self::from_data(create(&hub.inner, emap.errval(code), None, loc, None))
    }

    /// Raises an [`UNSPECIFIED_OS`](cv::UNSPECIFIED_OS) error from the calling
    /// thread's last OS error, annotated with `context`.
    #[track_caller]
    #[must_use]
    pub fn os(hub: &ErrorHub, context: &str) -> Self {
        let loc = Location::caller();
        let os = std::io::Error::last_os_error();
        let msg = format!("{context}: {os}").into_boxed_str();
        Self::from_data(create(&hub.inner, cv::UNSPECIFIED_OS, Some(msg), loc, None))
    }

    /// Wraps this error with further information. The wrapper becomes the new
    /// outermost error; on a tracking hub it replaces this error on the
    /// unhandled list.
    #[track_caller]
    #[must_use]
    pub fn wrap(self, errval: i32, msg: impl Into<Box<str>>) -> Self {
        let loc = Location::caller();
        // SAFETY: `self` holds a live error tree.
        unsafe { unlink_wrapped(self.data, cv::IMPROPER_WRAP, loc) };
        let hub = self.hub();
        Self::from_data(create_in(hub, errval, Some(msg.into()), loc, Some(self.data)))
    }

    /// Annotates this error with a message, without changing its code. The
    /// annotation is a [`TRACE`](cv::TRACE) frame, so accessors skip it.
    #[track_caller]
    #[must_use]
    pub fn annotate(self, msg: impl Into<Box<str>>) -> Self {
        let loc = Location::caller();
        // SAFETY: `self` holds a live error tree.
        unsafe { unlink_wrapped(self.data, cv::IMPROPER_WRAP, loc) };
        let hub = self.hub();
        Self::from_data(create_in(hub, cv::TRACE, Some(msg.into()), loc, Some(self.data)))
    }

    /// Adds a trace frame recording the call site, if the hub has tracing
    /// enabled. With tracing off this is the identity.
    #[track_caller]
    #[must_use]
    pub fn trace(self) -> Self {
        let loc = Location::caller();
        let hub = self.hub();
        let tracing = hub.upgrade().is_some_and(|h| h.tracing_enabled());
        if !tracing {
            return self;
        }
        // SAFETY: `self` holds a live error tree.
        unsafe { unlink_wrapped(self.data, cv::IMPROPER_WRAP, loc) };
        let hub = self.hub();
        Self::from_data(create_in(hub, cv::TRACE, None, loc, Some(self.data)))
    }

    /// Joins `separate` onto `error`.
    ///
    /// Used when a second failure occurs while processing the first and both must
    /// reach the caller. `separate` is stored on a distinct path from the
    /// original chain, and the joined error is returned behind a trace frame (if
    /// tracing is on) to record where the join happened.
    ///
    /// Either argument may be `None`; with both `None`, the result is `None`.
    #[track_caller]
    #[must_use]
    pub fn join(error: Option<Self>, separate: Option<Self>) -> Option<Self> {
        let loc = Location::caller();

        let Some(separate) = separate else {
            return error.map(|e| e.trace_at(loc));
        };

        let Some(error) = error else {
            return Some(separate.trace_at(loc));
        };

        // SAFETY: both handles hold live error trees; the separate chain is
        // walked within the same tree.
        unsafe {
            unlink_wrapped(separate.data, cv::IMPROPER_WRAP, loc);

            // Hook SEPARATE onto the end of the useful error's separate chain.
            let mut scan = scan_useful(Some(error.data)).unwrap_or(error.data);
            while let Some(next) = (*scan.as_ptr()).separate {
                scan = next;
            }
            (*scan.as_ptr()).separate = Some(separate.data);
        }

        Some(error.trace_at(loc))
    }

    /// Marks this error, and every error it wraps or joins, as handled, and
    /// releases their memory. On a tracking hub the tree is removed from the
    /// unhandled list.
    ///
    /// Calling this through an error that has already been wrapped (only the
    /// outermost error may be handled) marks the error and parks an
    /// `IMPROPER_UNHANDLED_CALL` report on the unhandled list.
    pub fn handled(self) {
        let tracked = self
            .hub()
            .upgrade()
            .is_some_and(|h| h.tracks_unhandled());

        // SAFETY: `self` holds a live error tree that this call consumes.
        unsafe {
            if tracked {
                if !on_unhandled(self.data) {
                    // Only the wrapping error may be handled; flag the misuse.
                    (*self.data.as_ptr()).marked = true;
                    let hub = self.hub();
                    let _ = create_in(
                        hub,
                        cv::IMPROPER_UNHANDLED_CALL,
                        None,
                        Location::caller(),
                        Some(self.data),
                    );
                    return;
                }
                unlink(self.data);
            }
            ErrorData::free_tree(self.data);
        }
    }

    /// The useful error value: the first code along the original chain that is
    /// not a trace frame. Reported in the raising namespace's local space.
    #[must_use]
    pub fn code(&self) -> i32 {
        let errval = self.errval();
        if is_builtin(errval) {
            return errval;
        }
        match self.upgrade_hub().and_then(|h| h.namespace_of(errval)) {
            Some(index) => errval - crate::code::NS_SIZE * (index as i32 + 1),
            None => errval,
        }
    }

    /// The useful error value in the shared space, without namespace translation.
    #[must_use]
    pub fn errval(&self) -> i32 {
        match scan_useful(Some(self.data)) {
            // SAFETY: chain nodes are live while `self` is.
            Some(useful) => unsafe { (*useful.as_ptr()).errval },
            None => cv::SUCCESS,
        }
    }

    /// The typed form of the useful error value, when it is one of the runtime's
    /// own codes.
    #[must_use]
    pub fn builtin(&self) -> Option<BuiltinCode> {
        BuiltinCode::from_errval(self.errval())
    }

    /// The useful message: from the first non-trace frame, falling back to the
    /// code's default message.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        let useful = scan_useful(Some(self.data))?;
        // SAFETY: the tree is alive while `self` is; the returned borrow is tied
        // to `&self`.
        let data = unsafe { &*useful.as_ptr() };
        match &data.msg {
            Some(msg) => Some(msg),
            None => default_message(data.errval),
        }
    }

    /// The error this one wraps, skipping trace frames. A view handle.
    #[must_use]
    pub fn original(&self) -> Option<Self> {
        let useful = scan_useful(Some(self.data))?;
        // SAFETY: chain nodes are live while `self` is; views do not own.
        unsafe {
            let original = (*useful.as_ptr()).original;
            scan_useful(original).map(|data| Self::view(data))
        }
    }

    /// The separate error joined onto this one, skipping trace frames on both
    /// ends. A view handle.
    #[must_use]
    pub fn separate(&self) -> Option<Self> {
        let useful = scan_useful(Some(self.data))?;
        // SAFETY: chain nodes are live while `self` is; views do not own.
        unsafe {
            let separate = (*useful.as_ptr()).separate;
            scan_useful(separate).map(|data| Self::view(data))
        }
    }

    /// Raw frame information for traceback rendering. Unlike the other
    /// accessors, this does not skip trace frames.
    #[must_use]
    pub fn trace_info(&self) -> TraceFrame<'_> {
        // SAFETY: the tree is alive while `self` is.
        let data = unsafe { &*self.data.as_ptr() };
        TraceFrame {
            file: data.file,
            line: data.line,
            errval: data.errval,
            msg: data.msg.as_deref(),
            // SAFETY: chain nodes are live while `self` is; views do not own.
            original: data.original.map(|d| unsafe { Self::view(d) }),
            // SAFETY: as above.
            separate: data.separate.map(|d| unsafe { Self::view(d) }),
        }
    }

    /// Whether this error was raised against `hub`.
    #[must_use]
    pub fn belongs_to(&self, hub: &ErrorHub) -> bool {
        self.upgrade_hub().is_some_and(|h| Rc::ptr_eq(&h, &hub.inner))
    }

    /// Builds a non-owning view handle.
    ///
    /// # Safety
    ///
    /// `data` must point to a live error object.
    pub(crate) unsafe fn view(data: NonNull<ErrorData>) -> Self {
        Self {
            data,
            _not_send: PhantomData,
        }
    }

    fn from_data(data: NonNull<ErrorData>) -> Self {
        Self {
            data,
            _not_send: PhantomData,
        }
    }

    fn hub(&self) -> Weak<HubInner> {
        // SAFETY: the tree is alive while `self` is.
        unsafe { (*self.data.as_ptr()).hub.clone() }
    }

    fn upgrade_hub(&self) -> Option<Rc<HubInner>> {
        self.hub().upgrade()
    }

    fn trace_at(self, loc: &'static Location<'static>) -> Self {
        let tracing = self.upgrade_hub().is_some_and(|h| h.tracing_enabled());
        if !tracing {
            return self;
        }
        // SAFETY: `self` holds a live error tree.
        unsafe { unlink_wrapped(self.data, cv::IMPROPER_WRAP, loc) };
        let hub = self.hub();
        Self::from_data(create_in(hub, cv::TRACE, None, loc, Some(self.data)))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message() {
            Some(msg) => write!(f, "{msg} (err {})", self.errval()),
            None => write!(f, "err {}", self.errval()),
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let frame = self.trace_info();
        let mut dbg = f.debug_struct("Error");
        dbg.field("errval", &frame.errval)
            .field("at", &format_args!("{}:{}", frame.file, frame.line));
        if let Some(msg) = frame.msg {
            dbg.field("msg", &msg);
        }
        if let Some(original) = &frame.original {
            dbg.field("original", original);
        }
        if let Some(separate) = &frame.separate {
            dbg.field("separate", separate);
        }
        dbg.finish()
    }
}

impl ErrorData {
    /// Releases the whole tree below `data`, skipping marked errors (they are
    /// referenced by more than one wrapper and are intentionally leaked for
    /// post-mortem inspection).
    ///
    /// # Safety
    ///
    /// `data` must be a live, detached (not on the unhandled list) error.
    pub(crate) unsafe fn free_tree(data: NonNull<ErrorData>) {
        // SAFETY: per contract, `data` is live and owned by the caller.
        unsafe {
            if (*data.as_ptr()).marked {
                return;
            }
            debug_assert!(!on_unhandled(data), "freeing an error still on the unhandled list");

            if let Some(original) = (*data.as_ptr()).original {
                Self::free_tree(original);
            }
            if let Some(separate) = (*data.as_ptr()).separate {
                Self::free_tree(separate);
            }
            drop(Box::from_raw(data.as_ptr()));
        }
    }
}

/// Allocates an error and, on a tracking hub, links it at the head of the
/// unhandled list.
fn create(
    hub: &Rc<HubInner>,
    errval: i32,
    msg: Option<Box<str>>,
    loc: &'static Location<'static>,
    original: Option<NonNull<ErrorData>>,
) -> NonNull<ErrorData> {
    let data = Box::new(ErrorData {
        hub: Rc::downgrade(hub),
        errval,
        msg,
        file: loc.file(),
        line: loc.line(),
        original,
        separate: None,
        prev: None,
        next: None,
        marked: false,
    });

    // SAFETY: Box::into_raw never returns null.
    let data = unsafe { NonNull::new_unchecked(Box::into_raw(data)) };

    if hub.tracks_unhandled() {
        // SAFETY: `data` is fresh and the head (if any) is a live list node.
        unsafe {
            let head = hub.unhandled.get();
            (*data.as_ptr()).next = head;
            if let Some(head) = head {
                (*head.as_ptr()).prev = Some(data);
            }
            hub.unhandled.set(Some(data));
        }
    }

    data
}

/// As [`create`], from a weak hub reference. Falls back to an untracked
/// allocation when the hub is gone (context teardown racing a late error).
fn create_in(
    hub: Weak<HubInner>,
    errval: i32,
    msg: Option<Box<str>>,
    loc: &'static Location<'static>,
    original: Option<NonNull<ErrorData>>,
) -> NonNull<ErrorData> {
    if let Some(hub) = hub.upgrade() {
        return create(&hub, errval, msg, loc, original);
    }

    let data = Box::new(ErrorData {
        hub,
        errval,
        msg,
        file: loc.file(),
        line: loc.line(),
        original,
        separate: None,
        prev: None,
        next: None,
        marked: false,
    });
    // SAFETY: Box::into_raw never returns null.
    unsafe { NonNull::new_unchecked(Box::into_raw(data)) }
}

/// Whether `data` is currently linked on its hub's unhandled list.
///
/// # Safety
///
/// `data` must point to a live error object.
unsafe fn on_unhandled(data: NonNull<ErrorData>) -> bool {
    // SAFETY: per contract.
    unsafe {
        let d = &*data.as_ptr();
        if d.prev.is_some() || d.next.is_some() {
            return true;
        }
        d.hub
            .upgrade()
            .is_some_and(|hub| hub.unhandled.get() == Some(data))
    }
}

/// Detaches `data` from the unhandled list.
///
/// # Safety
///
/// `data` must be a live error currently on the list.
unsafe fn unlink(data: NonNull<ErrorData>) {
    // SAFETY: per contract; neighbors are live list nodes.
    unsafe {
        let prev = (*data.as_ptr()).prev.take();
        let next = (*data.as_ptr()).next.take();

        match prev {
            Some(prev) => (*prev.as_ptr()).next = next,
            None => {
                if let Some(hub) = (*data.as_ptr()).hub.upgrade() {
                    hub.unhandled.set(next);
                }
            }
        }
        if let Some(next) = next {
            (*next.as_ptr()).prev = prev;
        }
    }
}

/// Prepares `data` to be owned by a wrapper: on a tracking hub, unlinks it from
/// the unhandled list. If `data` is not on the list it is already owned by
/// another wrapper; the second wrap is flagged with an `improper_code` report
/// parked on the list, and `data` is marked against double release.
///
/// # Safety
///
/// `data` must point to a live error object.
unsafe fn unlink_wrapped(data: NonNull<ErrorData>, improper_code: i32, loc: &'static Location<'static>) {
    // SAFETY: per contract.
    unsafe {
        let hub = (*data.as_ptr()).hub.clone();
        let Some(strong) = hub.upgrade() else {
            return;
        };
        if !strong.tracks_unhandled() {
            return;
        }

        if !on_unhandled(data) {
            (*data.as_ptr()).marked = true;
            let _ = create(&strong, improper_code, None, loc, Some(data));
            return;
        }

        unlink(data);
    }
}

/// Skips trace frames along the original chain, returning the first frame with a
/// semantic code.
fn scan_useful(mut data: Option<NonNull<ErrorData>>) -> Option<NonNull<ErrorData>> {
    // SAFETY: chain nodes are live while the outermost error is.
    unsafe {
        while let Some(d) = data {
            if (*d.as_ptr()).errval != cv::TRACE {
                return Some(d);
            }
            data = (*d.as_ptr()).original;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use static_assertions::assert_not_impl_any;

    use super::*;
    use crate::code_values as cv;

    assert_not_impl_any!(Error: Send, Sync);
    assert_not_impl_any!(ErrorHub: Send, Sync);

    fn hub() -> ErrorHub {
        ErrorHub::new(true)
    }

    #[test]
    fn create_and_handle() {
        let hub = hub();
        let err = Error::with_message(&hub, cv::BAD_PARAM, "stdsize of zero");

        assert_eq!(err.errval(), cv::BAD_PARAM);
        assert_eq!(err.message(), Some("stdsize of zero"));
        assert!(hub.unhandled().is_some());

        err.handled();
        assert!(hub.unhandled().is_none());
    }

    #[test]
    fn default_message_fallback() {
        let hub = hub();
        let err = Error::new(&hub, cv::IMPROPER_REENTRY);
        assert_eq!(err.message(), Some("improper reentry of the event loop"));
        err.handled();
    }

    #[test]
    fn wrap_skips_to_useful_code() {
        let hub = hub();
        let inner = Error::with_message(&hub, cv::UNSPECIFIED_OS, "read failed");
        let outer = inner.wrap(cv::ADDRESS_LOOKUP, "resolving peer");

        assert_eq!(outer.errval(), cv::ADDRESS_LOOKUP);
        assert_eq!(outer.message(), Some("resolving peer"));

        let original = outer.original().expect("wrapped error present");
        assert_eq!(original.errval(), cv::UNSPECIFIED_OS);

        // Wrapping replaced the inner error on the unhandled list.
        let mut listed = 0;
        for _ in hub.unhandled_iter() {
            listed += 1;
        }
        assert_eq!(listed, 1);

        outer.handled();
        assert!(hub.unhandled().is_none());
    }

    #[test]
    fn annotate_is_transparent() {
        let hub = hub();
        let err = Error::with_message(&hub, cv::NOT_REGISTERED, "no such cleanup").annotate("while closing");

        // The annotation is a trace frame: code/message come from the inner error.
        assert_eq!(err.errval(), cv::NOT_REGISTERED);
        assert_eq!(err.message(), Some("no such cleanup"));

        // But trace_info sees the annotation frame itself.
        let frame = err.trace_info();
        assert_eq!(frame.errval, cv::TRACE);
        assert_eq!(frame.msg, Some("while closing"));

        err.handled();
    }

    #[test]
    fn trace_identity_when_disabled() {
        let hub = hub();
        let err = Error::new(&hub, cv::BAD_PARAM);
        let err = err.trace();
        assert_eq!(err.trace_info().errval, cv::BAD_PARAM);
        err.handled();
    }

    #[test]
    fn trace_wraps_when_enabled() {
        let hub = hub();
        hub.set_tracing(true);
        let err = Error::new(&hub, cv::BAD_PARAM).trace();
        assert_eq!(err.trace_info().errval, cv::TRACE);
        assert_eq!(err.errval(), cv::BAD_PARAM);
        err.handled();
    }

    #[test]
    fn join_preserves_both_paths() {
        let hub = hub();
        let read_err = Error::with_message(&hub, cv::UNSPECIFIED_OS, "read failed");
        let close_err = Error::with_message(&hub, cv::UNSPECIFIED_OS, "close failed");

        let joined = Error::join(Some(read_err), Some(close_err)).expect("joined error");
        assert_eq!(joined.message(), Some("read failed"));

        let separate = joined.separate().expect("separate error");
        assert_eq!(separate.message(), Some("close failed"));

        joined.handled();
        assert!(hub.unhandled().is_none());
    }

    #[test]
    fn join_with_missing_sides() {
        let hub = hub();
        assert!(Error::join(None, None).is_none());

        let only = Error::new(&hub, cv::BAD_PARAM);
        let out = Error::join(None, Some(only)).expect("separate side survives");
        assert_eq!(out.errval(), cv::BAD_PARAM);
        out.handled();
    }

    #[test]
    fn improper_handled_is_reported() {
        let hub = hub();
        let inner = Error::new(&hub, cv::UNSPECIFIED_OS);
        let inner_view = {
            let outer = inner.wrap(cv::BAD_PARAM, "outer");
            let view = outer.original().expect("inner view");
            // Handling the inner error while the wrapper owns it is improper.
            view.handled();
            outer
        };

        let head = hub.unhandled().expect("improper call was parked");
        assert_eq!(head.trace_info().errval, cv::IMPROPER_UNHANDLED_CALL);

        // The true wrapper is still on the list, after the report.
        let listed: Vec<i32> = hub.unhandled_iter().map(|e| e.trace_info().errval).collect();
        assert_eq!(listed, vec![cv::IMPROPER_UNHANDLED_CALL, cv::BAD_PARAM]);

        inner_view.handled();
    }

    #[test]
    fn untracked_hub_keeps_no_list() {
        let hub = ErrorHub::new(false);
        let err = Error::new(&hub, cv::BAD_PARAM);
        assert!(hub.unhandled().is_none());
        err.handled();
    }

    #[test]
    fn namespace_translation_via_code() {
        let hub = hub();
        let emap = hub.errmap("app");
        let err = Error::mapped(&hub, &emap, 42);

        assert_eq!(err.errval(), 10_042);
        assert_eq!(err.code(), 42);
        err.handled();
    }
}

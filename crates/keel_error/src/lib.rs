// Copyright (c) The Keel Project Authors.
// Licensed under the MIT License.

//! Error objects for the Keel runtime.
//!
//! Fallible Keel operations return [`Result<T, Error>`](Error). An [`Error`] is a
//! heap-allocated object carrying a numeric error value, an optional message, the
//! source location it was raised at, and links to the errors it wraps. Errors form
//! trees: wrapping places an outer error closer to the call site, and a *separate*
//! link preserves an orthogonal failure encountered while handling the primary one
//! (for example, a close failing during the teardown triggered by a read failure).
//!
//! Every error belongs to an [`ErrorHub`], the per-instance state block embedded in
//! a runtime context. The hub carries two policy flags:
//!
//! - **tracing**: when enabled, [`Error::trace`] inserts a lightweight trace frame
//!   recording the call site; when disabled, `trace` is the identity.
//! - **track unhandled**: when enabled, every created error is linked into the
//!   hub's *unhandled* list until [`Error::handled`] releases it. Whatever remains
//!   on the list can be inspected post-mortem via [`ErrorHub::unhandled`].
//!
//! Applications reserve their own error-code namespaces with [`ErrorHub::errmap`];
//! each namespace owns a range of 10 000 values.

mod code;
mod errmap;
mod error;
mod hub;

pub use code::{BuiltinCode, default_message, is_builtin};
pub use errmap::Errmap;
pub use error::{Error, TraceFrame};
pub use hub::{ErrorHub, UnhandledIter};

/// Shorthand for the result type used throughout Keel.
pub type Result<T> = std::result::Result<T, Error>;

pub mod code_values {
    //! Raw error values used by the runtime itself.
    //!
    //! These all fall below the first application namespace (see
    //! [`Errmap`](crate::Errmap)), so they never collide with mapped codes.

    /// Absence of error. Never carried by a live [`Error`](crate::Error) object.
    pub const SUCCESS: i32 = 0;

    /// Annotation wrapper inserted by `trace`/`annotate`; carries no semantic code.
    pub const TRACE: i32 = 100;

    /// `handled` was invoked on an error that is not a root of the unhandled list.
    pub const IMPROPER_UNHANDLED_CALL: i32 = 101;

    /// An error was wrapped a second time.
    pub const IMPROPER_WRAP: i32 = 102;

    /// Deregistration of an item that still has owners.
    pub const IMPROPER_DEREGISTER: i32 = 103;

    /// Cleanup of an item that still has owners.
    pub const IMPROPER_CLEANUP: i32 = 104;

    /// An operation referenced an item that was never registered.
    pub const NOT_REGISTERED: i32 = 105;

    /// An OS failure with no finer classification; wraps the OS error number.
    pub const UNSPECIFIED_OS: i32 = 106;

    /// The event loop was re-entered from within itself.
    pub const IMPROPER_REENTRY: i32 = 107;

    /// A parameter failed validation before any work was attempted.
    pub const BAD_PARAM: i32 = 108;

    /// Hostname resolution failed.
    pub const ADDRESS_LOOKUP: i32 = 109;

    /// An error value did not fall within any registered namespace.
    pub const MAPPING: i32 = 110;
}

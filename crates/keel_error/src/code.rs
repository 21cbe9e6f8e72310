// Copyright (c) The Keel Project Authors.
// Licensed under the MIT License.

use thiserror::Error;

use crate::code_values as cv;

/// The number of error values reserved for each namespace.
///
/// As a data point, large applications tend to arrange a few hundred codes into a
/// couple dozen categories; 10 000 provides for 100 categories of 100 codes each
/// under a reservation scheme like that.
pub(crate) const NS_SIZE: i32 = 10_000;

/// Error values below this belong to the runtime's own namespace.
pub(crate) const BUILTIN_LIMIT: i32 = NS_SIZE;

/// Returns `true` when `errval` belongs to the runtime's own namespace rather
/// than a registered application namespace.
#[must_use]
pub fn is_builtin(errval: i32) -> bool {
    (0..BUILTIN_LIMIT).contains(&errval)
}

/// The typed form of the runtime's own error values.
///
/// The numeric values in [`code_values`](crate::code_values) are the wire-level
/// representation; this enum exists to attach default messages and to give match
/// sites something better than integer literals.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum BuiltinCode {
    /// See [`code_values::TRACE`](crate::code_values::TRACE).
    #[error("trace annotation")]
    Trace,

    #[error("improper call to handled()")]
    ImproperUnhandledCall,

    #[error("error wrapped more than once")]
    ImproperWrap,

    #[error("deregistered an item that still has owners")]
    ImproperDeregister,

    #[error("cleaned up an item that still has owners")]
    ImproperCleanup,

    #[error("item is not registered")]
    NotRegistered,

    #[error("unspecified OS error")]
    UnspecifiedOs,

    #[error("improper reentry of the event loop")]
    ImproperReentry,

    #[error("bad parameter")]
    BadParam,

    #[error("address lookup failed")]
    AddressLookup,

    #[error("error value is not within a registered namespace")]
    Mapping,
}

impl BuiltinCode {
    /// The raw error value for this code.
    #[must_use]
    pub fn errval(self) -> i32 {
        match self {
            Self::Trace => cv::TRACE,
            Self::ImproperUnhandledCall => cv::IMPROPER_UNHANDLED_CALL,
            Self::ImproperWrap => cv::IMPROPER_WRAP,
            Self::ImproperDeregister => cv::IMPROPER_DEREGISTER,
            Self::ImproperCleanup => cv::IMPROPER_CLEANUP,
            Self::NotRegistered => cv::NOT_REGISTERED,
            Self::UnspecifiedOs => cv::UNSPECIFIED_OS,
            Self::ImproperReentry => cv::IMPROPER_REENTRY,
            Self::BadParam => cv::BAD_PARAM,
            Self::AddressLookup => cv::ADDRESS_LOOKUP,
            Self::Mapping => cv::MAPPING,
        }
    }

    /// Maps a raw error value back to its typed form.
    #[must_use]
    pub fn from_errval(errval: i32) -> Option<Self> {
        match errval {
            cv::TRACE => Some(Self::Trace),
            cv::IMPROPER_UNHANDLED_CALL => Some(Self::ImproperUnhandledCall),
            cv::IMPROPER_WRAP => Some(Self::ImproperWrap),
            cv::IMPROPER_DEREGISTER => Some(Self::ImproperDeregister),
            cv::IMPROPER_CLEANUP => Some(Self::ImproperCleanup),
            cv::NOT_REGISTERED => Some(Self::NotRegistered),
            cv::UNSPECIFIED_OS => Some(Self::UnspecifiedOs),
            cv::IMPROPER_REENTRY => Some(Self::ImproperReentry),
            cv::BAD_PARAM => Some(Self::BadParam),
            cv::ADDRESS_LOOKUP => Some(Self::AddressLookup),
            cv::MAPPING => Some(Self::Mapping),
            _ => None,
        }
    }
}

/// Returns the default message for a builtin error value, if one exists.
///
/// Used by [`Error::message`](crate::Error::message) when an error was raised
/// without an explicit message.
#[must_use]
pub fn default_message(errval: i32) -> Option<&'static str> {
    match BuiltinCode::from_errval(errval)? {
        BuiltinCode::Trace => Some("trace annotation"),
        BuiltinCode::ImproperUnhandledCall => Some("improper call to handled()"),
        BuiltinCode::ImproperWrap => Some("error wrapped more than once"),
        BuiltinCode::ImproperDeregister => Some("deregistered an item that still has owners"),
        BuiltinCode::ImproperCleanup => Some("cleaned up an item that still has owners"),
        BuiltinCode::NotRegistered => Some("item is not registered"),
        BuiltinCode::UnspecifiedOs => Some("unspecified OS error"),
        BuiltinCode::ImproperReentry => Some("improper reentry of the event loop"),
        BuiltinCode::BadParam => Some("bad parameter"),
        BuiltinCode::AddressLookup => Some("address lookup failed"),
        BuiltinCode::Mapping => Some("error value is not within a registered namespace"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errval_round_trip() {
        for code in [
            BuiltinCode::Trace,
            BuiltinCode::ImproperUnhandledCall,
            BuiltinCode::ImproperWrap,
            BuiltinCode::ImproperDeregister,
            BuiltinCode::ImproperCleanup,
            BuiltinCode::NotRegistered,
            BuiltinCode::UnspecifiedOs,
            BuiltinCode::ImproperReentry,
            BuiltinCode::BadParam,
            BuiltinCode::AddressLookup,
            BuiltinCode::Mapping,
        ] {
            assert_eq!(BuiltinCode::from_errval(code.errval()), Some(code));
        }
    }

    #[test]
    fn builtin_range() {
        assert!(is_builtin(cv::TRACE));
        assert!(is_builtin(cv::MAPPING));
        assert!(!is_builtin(NS_SIZE));
        assert!(!is_builtin(-1));
    }

    #[test]
    fn default_messages_match_display() {
        let code = BuiltinCode::ImproperReentry;
        assert_eq!(default_message(code.errval()), Some("improper reentry of the event loop"));
        assert_eq!(code.to_string(), "improper reentry of the event loop");
    }
}

// Copyright (c) The Keel Project Authors.
// Licensed under the MIT License.

use std::fmt;
use std::rc::{Rc, Weak};

use crate::code::NS_SIZE;
use crate::code_values::MAPPING;
use crate::hub::HubInner;

/// A registered error-code namespace.
///
/// Each namespace owns a contiguous range of 10 000 error values; the base value
/// is `10_000 * (registration_index + 1)`. Applications raise errors with their
/// own small code numbers and the map translates them to and from the shared
/// error-value space.
///
/// Maps are cheap handles; copies refer to the same registration.
#[derive(Clone)]
pub struct Errmap {
    hub: Weak<HubInner>,
    index: usize,
    baseval: i32,
}

impl Errmap {
    pub(crate) fn new(hub: &Rc<HubInner>, index: usize) -> Self {
        Self {
            hub: Rc::downgrade(hub),
            index,
            baseval: NS_SIZE * (index as i32 + 1),
        }
    }

    /// The first error value of this namespace's range.
    #[must_use]
    pub fn baseval(&self) -> i32 {
        self.baseval
    }

    /// The namespace string this map was registered under.
    #[must_use]
    pub fn namespace(&self) -> Box<str> {
        self.hub
            .upgrade()
            .and_then(|hub| hub.namespace_at(self.index))
            .unwrap_or_default()
    }

    /// Translates a namespace-local code to the shared error-value space.
    #[must_use]
    pub fn errval(&self, code: i32) -> i32 {
        self.baseval + code
    }

    /// Translates a shared error value back to this namespace's local code.
    ///
    /// Returns [`MAPPING`](crate::code_values::MAPPING) when the value does not
    /// fall within this namespace.
    #[must_use]
    pub fn code(&self, errval: i32) -> i32 {
        if self.contains(errval) { errval - self.baseval } else { MAPPING }
    }

    /// Whether `errval` falls inside this namespace's range.
    #[must_use]
    pub fn contains(&self, errval: i32) -> bool {
        (self.baseval..self.baseval + NS_SIZE).contains(&errval)
    }
}

impl fmt::Debug for Errmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Errmap")
            .field("index", &self.index)
            .field("baseval", &self.baseval)
            .finish()
    }
}

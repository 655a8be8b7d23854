//! Change notification plumbing.
//!
//! The store reports externally visible inserts and deletes to an optional
//! [`CookieDelegate`]. Internally, deletions carry a fine-grained
//! [`DeletionCause`]; the delegate sees the coarser [`ChangeCause`], and a
//! few internal causes (load-time duplicate resolution, bookkeeping-only
//! removal) are not reported at all.

use std::sync::Arc;

use crate::cookie::Cookie;

/// Cause reported to the delegate for a removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeCause {
    Explicit,
    Overwrite,
    Expired,
    Evicted,
    ExpiredOverwrite,
}

/// Internal classification of every deletion path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeletionCause {
    Explicit,
    Overwrite,
    Expired,
    ExpiredOverwrite,
    EvictedDomainPreSafe,
    EvictedDomainPostSafe,
    EvictedGlobal,
    DuplicateInBackingStore,
    ControlChar,
    DontRecord,
}

impl DeletionCause {
    /// Maps to the delegate-visible cause; `None` means the deletion is
    /// silent.
    pub fn change_cause(self) -> Option<ChangeCause> {
        match self {
            DeletionCause::Explicit => Some(ChangeCause::Explicit),
            DeletionCause::Overwrite => Some(ChangeCause::Overwrite),
            DeletionCause::Expired => Some(ChangeCause::Expired),
            DeletionCause::ExpiredOverwrite => Some(ChangeCause::ExpiredOverwrite),
            DeletionCause::EvictedDomainPreSafe
            | DeletionCause::EvictedDomainPostSafe
            | DeletionCause::EvictedGlobal
            | DeletionCause::ControlChar => Some(ChangeCause::Evicted),
            DeletionCause::DuplicateInBackingStore | DeletionCause::DontRecord => None,
        }
    }
}

/// Observer for cookie store changes.
///
/// `on_changed` fires for every externally visible insert (`removed ==
/// false`, cause [`ChangeCause::Explicit`]) and delete. `on_loaded` fires
/// once, after the initial load has completed and the deferred-operation
/// queue has drained.
pub trait CookieDelegate: Send + Sync {
    fn on_changed(&self, cookie: &Cookie, removed: bool, cause: ChangeCause);

    fn on_loaded(&self) {}
}

pub type CookieDelegateHandle = Arc<dyn CookieDelegate>;

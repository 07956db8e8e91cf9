//! # Current-Context Slot
//!
//! One slot per execution context holding whatever object the scheduler uses
//! to describe it. On bare metal this is a per-CPU register; here it is host
//! thread-local storage.

use core::any::Any;
use core::cell::RefCell;
use std::sync::Arc;

/// Object stored in the slot
pub type CurrentObject = Arc<dyn Any + Send + Sync>;

std::thread_local! {
    static CURRENT: RefCell<Option<CurrentObject>> = const { RefCell::new(None) };
}

/// Replace the current object, returning the previous one
pub fn set_current(object: Option<CurrentObject>) -> Option<CurrentObject> {
    CURRENT
        .try_with(|slot| slot.replace(object))
        .ok()
        .flatten()
}

/// Get the current object
///
/// Returns `None` when nothing was installed, or while the context is being
/// torn down.
pub fn current() -> Option<CurrentObject> {
    CURRENT.try_with(|slot| slot.borrow().clone()).ok().flatten()
}

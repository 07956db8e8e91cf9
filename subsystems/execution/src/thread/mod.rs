//! # Thread Management
//!
//! Thread creation, lifecycle, and management.

pub mod registry;
pub mod states;
#[allow(clippy::module_inception)]
pub mod thread;

pub use registry::{count, find_by_id, snapshot};
pub use states::*;
pub use thread::*;

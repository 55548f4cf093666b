//! Miscellaneous

mod dispose_once;
mod interruption;

pub use dispose_once::DisposeOnce;
pub(crate) use interruption::{deadline_after, until, Interruption};

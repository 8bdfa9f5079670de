//! Small shared helpers.

pub(crate) mod lock;
pub mod time;

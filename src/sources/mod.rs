//! Default implementations of [crate::source::Source]

pub mod dns;
pub mod fixed;

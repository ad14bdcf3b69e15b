//! Per-book database handles

pub mod init;
pub mod locks;
pub mod registry;

pub use init::*;
pub use locks::KeyedLocks;
pub use registry::*;

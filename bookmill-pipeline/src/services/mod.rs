//! Book-level services outside the version chains

pub mod image_index;

pub use image_index::{hash_base64, hash_bytes, ImageIndex};

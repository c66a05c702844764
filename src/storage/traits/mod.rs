//! Storage backend traits.

mod adapter;
mod vector;

pub use adapter::{Capabilities, StorageAdapter};
pub use vector::VectorIndex;

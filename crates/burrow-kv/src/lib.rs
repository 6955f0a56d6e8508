//! burrow-kv: the backing key-value medium.
//!
//! Media (memory, filesystem) are OpenDAL services; this crate layers
//! the two primitives the engine needs that OpenDAL does not model:
//! change notification and an exclusive advisory lock. Both are
//! in-process, which matches the engine's single-process single-writer
//! boundary.

pub mod store;

pub use store::{ChangeEvent, KvLock, KvStore};

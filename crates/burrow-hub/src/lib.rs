//! burrow-hub: the authoritative index over an encrypted bucket layout.
//!
//! The hub maps domain labels and item paths to compact codes, tracks
//! which size-bounded encrypted bucket holds each item, and maintains
//! secondary indexes. Every structural change rewrites the whole hub
//! as one encrypted entry; there is no incremental patch format.

pub mod bucket;
pub mod code;
pub mod hub;
pub mod rotation;

pub use bucket::{BucketIo, HUB_KEY};
pub use code::{decode_code, encode_code, random_bucket_key, IdentPattern};
pub use hub::{Hub, DB_VERSION};
pub use rotation::{spawn_rotation_task, RotationHandle};

//! Persistent local store.
//!
//! Keyed collections of projects, GPS points, photos and cached parcel
//! boundaries, with secondary indexes by parent id and sync status. Writes are
//! optimistic: a `put` lands locally first and is reconciled later.

mod storage;
mod traits;

pub use storage::LocalStore;
pub(crate) use storage::{format_timestamp, parse_timestamp};
pub use traits::{Collection, Index, Record};

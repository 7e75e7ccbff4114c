//! Core data types.

pub mod identity;
pub mod record;

pub use identity::{InstanceId, RecordId};
pub use record::{CacheRecord, LocalEntry};

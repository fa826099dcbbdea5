//! Job records and the bucket-per-state store that holds them.

pub mod models;
pub mod store;

pub use models::{Bucket, Complexity, Job, MAX_TITLE_LEN, Priority, sort_for_dispatch};
pub use store::JobStore;

//! Tracking stores: root analyses with optimistic concurrency and in-flight
//! analysis requests with lock/link semantics.

pub mod requests;
pub mod roots;

pub use requests::{MemoryRequestTracker, RequestTracker};
pub use roots::{MemoryRootStore, RootStore};

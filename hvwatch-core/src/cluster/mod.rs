//! Cluster abstraction layer
//!
//! The control plane operations the watcher consumes, plus an in-memory
//! implementation for tests.

mod interface;
mod mock;

pub use interface::*;
pub use mock::MockCluster;

//! Proxy routing: synchronization, in-memory backend and periodic checks

mod check;
mod memory;
mod sync;

pub use check::run_route_check;
pub use memory::InMemoryProxy;
pub use sync::{ProxySynchronizer, ReconcileReport};

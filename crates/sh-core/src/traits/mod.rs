//! Collaborator trait definitions

mod driver;
mod proxy;
mod store;

pub use driver::ProcessDriver;
pub use proxy::ProxyBackend;
pub use store::RecordStore;

//! Process drivers shipped with the daemon

mod local;

pub use local::LocalProcessDriver;

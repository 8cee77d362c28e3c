//! Host queries.

pub mod network;

pub use network::{InterfaceResolver, ResolveError, StaticResolver, SystemResolver};

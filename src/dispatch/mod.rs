//! Request dispatch: endpoint selection, failover and racing.

pub mod dispatcher;

pub use dispatcher::{DispatchSnapshot, Dispatcher};

//! Switchback - a DNS forwarder that races a primary and an alternative
//! resolver and keeps the answer it can trust.
//!
//! The library exposes the dispatcher and its parts for the binary, the
//! benchmarks and the integration tests.

pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod dns;
pub mod error;
pub mod hosts;
pub mod matcher;
pub mod policy;
pub mod proxy;
pub mod stats;
pub mod transport;
pub mod upstream;

pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use error::{Error, Result};

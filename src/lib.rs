//! A benchmark harness binding for tuple stores that speak the Tarantool
//! binary protocol.
//!
//! [`StoreAdapter`] maps keyed records onto tuples of a configured space and
//! reports every harness operation as a flat [`Status`]. [`TupleServer`]
//! serves an in-memory [`TupleStore`] over the same protocol for local runs.

pub mod adapter;
pub mod blocking;
pub mod client;
pub mod config;
pub mod connection;
pub mod db;
mod error;
pub mod proto;
pub mod server;
pub mod store;
pub mod tuple;

pub use adapter::{ScanCursor, StoreAdapter};
pub use blocking::BlockingAdapter;
pub use config::{Config, Properties};
pub use connection::Connection;
pub use db::{Db, Status};
pub use error::{Error, Result};
pub use server::TupleServer;
pub use store::TupleStore;
pub use tuple::Record;

/// Table name used when the harness does not supply one.
pub const DEFAULT_TABLE: &str = "usertable";

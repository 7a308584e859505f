#![doc = include_str!("../README.md")]

mod common;
mod error;

pub mod dht;
pub mod rpc;

pub use crate::common::{
    Id, MutableItem, Node, NodeSnapshot, RoutingTable, DEFAULT_BUCKET_SIZE,
};
pub use dht::{Dht, DhtBuilder};
pub use error::Error;

/// Alias Result to be the crate Result.
pub type Result<T, E = Error> = core::result::Result<T, E>;

//! Values produced by queries and the channels that carry them to the host.

use std::net::SocketAddrV4;

use bytes::Bytes;
use flume::Sender;

use crate::common::{Id, MutableItem, Node};

use super::put_query::PutError;

/// A single positive result observed during an iterative query.
#[derive(Clone, Debug)]
pub enum Response {
    Peer(SocketAddrV4),
    Immutable(Bytes),
    Mutable(MutableItem),
}

/// Where a query should deliver its results.
///
/// Dropping the sender when the query is done is what ends the
/// receiving iterator on the host side.
#[derive(Clone, Debug)]
pub enum ResponseSender {
    Peers(Sender<SocketAddrV4>),
    Immutable(Sender<Bytes>),
    Mutable(Sender<MutableItem>),
    ClosestNodes(Sender<Box<[Node]>>),
}

/// The target a put operation stored data at, or why it couldn't.
pub type PutResult = Result<Id, PutError>;

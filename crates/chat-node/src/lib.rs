//! Peer-to-peer chat node on libp2p: peer address resolution through a local
//! address book and the Kademlia DHT, plus a request/acknowledge messaging
//! session over a dedicated request-response protocol.

pub mod address_book;
pub mod error;
pub mod frame;
pub mod handler;
pub mod identity;
pub mod locator;
pub mod metrics;
pub mod net;
pub mod node;
pub mod resolver;
pub mod session;
pub mod target;

#[cfg(test)]
mod testing;

pub use crate::address_book::{AddressBook, MemoryAddressBook};
pub use crate::error::{ChatError, Result};
pub use crate::frame::{RequestFrame, ResponseFrame, Status};
pub use crate::handler::{
    AllowAll, AllowList, GatedHandler, InboundMessage, LoggingHandler, RequestHandler,
    SenderPolicy,
};
pub use crate::identity::NodeIdentity;
pub use crate::locator::{PeerAddresses, PeerLocator};
pub use crate::metrics::NodeMetrics;
pub use crate::net::NodeConfig;
pub use crate::node::{Node, NodeHandle};
pub use crate::resolver::PeerResolver;
pub use crate::session::{ChatSession, Dialer};
pub use crate::target::ChatTarget;

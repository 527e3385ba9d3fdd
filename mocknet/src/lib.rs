//! Simulate links and connections between virtual peers without sockets.
//!
//! A [Mocknet] hosts any number of virtual peers, each reachable through its own [Network] handle.
//! Test code decides which peers can reach each other by creating [Link]s, and then dials across
//! that topology exactly as it would over a real network:
//!
//! - a [Mocknet] has many [Network]s
//! - a [Mocknet] has many [Link]s
//! - a [Link] joins two [Network]s
//! - [Conn]s are opened between [Network]s, and only if a [Link] joins them
//!
//! Links are the **ability to connect**. Think of them as the physical medium: removing the links
//! between two peers makes every subsequent dial between them fail, which makes it possible to
//! test dial failures, partitions, and relaying.
//!
//! All operations are synchronous and every query that returns multiple results does so in a
//! random (but seeded) order, so code under test cannot come to depend on insertion order.
//!
//! # Status
//!
//! `commonware-mocknet` is **ALPHA** software and is not yet recommended for production use. Developers should
//! expect breaking changes and occasional instability.
//!
//! # Example
//!
//! ```rust
//! use commonware_mocknet::{Config, Error, Mocknet};
//!
//! let mocknet = Mocknet::new(Config::default());
//! let alice = mocknet.gen_peer().unwrap();
//! let bob = mocknet.gen_peer().unwrap();
//!
//! // Without a link, peers cannot reach each other
//! assert!(matches!(alice.dial(&bob.peer()), Err(Error::Unreachable(_, _))));
//!
//! // Once linked, a dial opens a connection on both sides
//! mocknet.link_nets(&alice, &bob).unwrap();
//! let conn = alice.dial(&bob.peer()).unwrap();
//! assert_eq!(bob.conns().unwrap(), vec![conn.mirror()]);
//! ```

#![doc(
    html_logo_url = "https://commonware.xyz/imgs/rustdoc_logo.svg",
    html_favicon_url = "https://commonware.xyz/favicon.ico"
)]

use thiserror::Error;

pub mod connection;
pub mod endpoint;
pub mod identity;
pub mod link;
mod metrics;
pub mod mocknet;

pub use connection::{Conn, Direction};
pub use endpoint::{Connectedness, Event, Network};
pub use identity::{Deterministic, PeerId, PrivateKey, Provider};
pub use link::{Link, LinkId, LinkMap, LinkOptions};
pub use mocknet::{Config, Mocknet};

/// A pair of peers that could not be connected during a batch operation.
#[derive(Debug)]
pub struct Failure {
    pub a: PeerId,
    pub b: PeerId,
    pub error: Error,
}

/// Errors that can occur when interacting with a [Mocknet].
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(PeerId),
    #[error("link not found: {0}")]
    LinkNotFound(LinkId),
    #[error("not connected: {0} <-> {1}")]
    NotConnected(PeerId, PeerId),
    #[error("unreachable: no link between {0} and {1}")]
    Unreachable(PeerId, PeerId),
    #[error("duplicate identity: {0}")]
    DuplicateIdentity(PeerId),
    #[error("unknown peer: {0}")]
    UnknownPeer(PeerId),
    #[error("attempted to dial self: {0}")]
    DialSelf(PeerId),
    #[error("{} pairs failed", .0.len())]
    Partial(Vec<Failure>),
}

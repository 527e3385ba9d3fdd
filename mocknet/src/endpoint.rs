//! Per-peer view of the simulated network.
//!
//! The [Endpoint] is the state the [crate::Mocknet] keeps for each peer (its identity, listen
//! address, open connections, and subscribers). Code under test never touches it directly: it
//! holds a [Network] handle instead, which is what a host or protocol stack would program against.

use crate::{
    connection::Conn,
    identity::{PeerId, PrivateKey},
    Error, Mocknet,
};
use futures::channel::mpsc;
use std::{collections::HashMap, fmt::Debug, net::SocketAddr};
use tracing::trace;

/// Notification delivered to subscribers of a [Network].
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    /// A connection was established (by either side).
    Connected(Conn),
    /// A connection was closed (by either side).
    Disconnected(Conn),
}

/// Relationship between a [Network] and some peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Connectedness {
    /// A connection is open.
    Connected,
    /// No connection is open but at least one link exists.
    CanConnect,
    /// No connection is open and no link exists.
    CannotConnect,
}

pub(crate) struct Endpoint {
    key: PrivateKey,
    peer: PeerId,
    address: SocketAddr,
    generation: u64,

    conns: HashMap<PeerId, Conn>,
    subscribers: Vec<mpsc::UnboundedSender<Event>>,
}

impl Endpoint {
    pub(crate) fn new(key: PrivateKey, address: SocketAddr, generation: u64) -> Self {
        Self {
            peer: key.peer_id(),
            key,
            address,
            generation,
            conns: HashMap::new(),
            subscribers: Vec::new(),
        }
    }

    pub(crate) fn peer(&self) -> PeerId {
        self.peer
    }

    pub(crate) fn key(&self) -> &PrivateKey {
        &self.key
    }

    pub(crate) fn address(&self) -> SocketAddr {
        self.address
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// Record an open connection and notify subscribers.
    pub(crate) fn add_conn(&mut self, conn: Conn) {
        self.conns.insert(conn.remote_peer(), conn.clone());
        self.notify(Event::Connected(conn));
    }

    /// Forget the connection to `remote` and notify subscribers.
    pub(crate) fn remove_conn(&mut self, remote: &PeerId) -> Option<Conn> {
        let conn = self.conns.remove(remote)?;
        self.notify(Event::Disconnected(conn.clone()));
        Some(conn)
    }

    pub(crate) fn conn(&self, remote: &PeerId) -> Option<&Conn> {
        self.conns.get(remote)
    }

    /// Open connections, ordered by identifier.
    pub(crate) fn conns(&self) -> Vec<Conn> {
        let mut conns: Vec<Conn> = self.conns.values().cloned().collect();
        conns.sort_by_key(Conn::id);
        conns
    }

    /// Connected peers, in key order.
    pub(crate) fn remotes(&self) -> Vec<PeerId> {
        let mut remotes: Vec<PeerId> = self.conns.keys().copied().collect();
        remotes.sort();
        remotes
    }

    pub(crate) fn subscribe(&mut self) -> mpsc::UnboundedReceiver<Event> {
        let (sender, receiver) = mpsc::unbounded();
        self.subscribers.push(sender);
        receiver
    }

    fn notify(&mut self, event: Event) {
        // Drop subscribers that are no longer listening
        self.subscribers
            .retain(|subscriber| subscriber.unbounded_send(event.clone()).is_ok());
        trace!(peer = %self.peer, ?event, subscribers = self.subscribers.len(), "notified");
    }
}

/// Handle to the simulated network of a single peer.
///
/// A handle is bound to the lifetime of the peer it was created for: once that peer is removed
/// from the [Mocknet], every operation on the handle fails with [Error::InvalidEndpoint], even if a
/// peer with the same identity is added again later.
#[derive(Clone)]
pub struct Network {
    mocknet: Mocknet,
    peer: PeerId,
    address: SocketAddr,
    generation: u64,
}

impl Network {
    pub(crate) fn new(mocknet: Mocknet, endpoint: &Endpoint) -> Self {
        Self {
            mocknet,
            peer: endpoint.peer(),
            address: endpoint.address(),
            generation: endpoint.generation(),
        }
    }

    pub(crate) fn mocknet(&self) -> &Mocknet {
        &self.mocknet
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// Identity of the local peer.
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// Address the local peer listens on.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Private key of the local peer.
    pub fn private_key(&self) -> Result<PrivateKey, Error> {
        self.mocknet.with_endpoint(self, |endpoint| endpoint.key().clone())
    }

    /// Open connections (in random order).
    pub fn conns(&self) -> Result<Vec<Conn>, Error> {
        self.mocknet.endpoint_conns(self, None)
    }

    /// Open connections to `peer` (in random order).
    pub fn conns_to_peer(&self, peer: &PeerId) -> Result<Vec<Conn>, Error> {
        self.mocknet.endpoint_conns(self, Some(peer))
    }

    /// Peers with an open connection (in random order).
    pub fn peers(&self) -> Result<Vec<PeerId>, Error> {
        self.mocknet.endpoint_peers(self)
    }

    /// Relationship between the local peer and `peer`.
    pub fn connectedness(&self, peer: &PeerId) -> Result<Connectedness, Error> {
        self.mocknet.connectedness(self, peer)
    }

    /// Dial `peer`.
    ///
    /// Fails with [Error::Unreachable] if no link joins the peers.
    pub fn dial(&self, peer: &PeerId) -> Result<Conn, Error> {
        self.mocknet.dial(self, peer)
    }

    /// Close the connection to `peer`.
    pub fn close_peer(&self, peer: &PeerId) -> Result<(), Error> {
        self.mocknet.hang_up(self, peer)
    }

    /// Receive an [Event] whenever a connection of this peer is opened or closed.
    pub fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<Event>, Error> {
        self.mocknet.with_endpoint_mut(self, Endpoint::subscribe)
    }
}

impl Debug for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Network")
            .field("peer", &self.peer)
            .field("address", &self.address)
            .finish()
    }
}

impl PartialEq for Network {
    fn eq(&self, other: &Self) -> bool {
        self.peer == other.peer
            && self.generation == other.generation
            && self.mocknet.same(&other.mocknet)
    }
}

impl Eq for Network {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{mocknet::Config, LinkOptions};
    use futures::{executor::block_on, StreamExt};

    fn linked_pair() -> (Mocknet, Network, Network) {
        let mocknet = Mocknet::new(Config::default());
        let a = mocknet.gen_peer().unwrap();
        let b = mocknet.gen_peer().unwrap();
        mocknet.link_nets(&a, &b).unwrap();
        (mocknet, a, b)
    }

    #[test]
    fn test_identity() {
        let mocknet = Mocknet::new(Config::default());
        let key = PrivateKey::from_seed(3);
        let address: SocketAddr = "10.0.0.1:4000".parse().unwrap();
        let net = mocknet.add_peer(key.clone(), address).unwrap();
        assert_eq!(net.peer(), key.peer_id());
        assert_eq!(net.address(), address);
        assert_eq!(net.private_key().unwrap(), key);
    }

    #[test]
    fn test_dial_and_close() {
        let (_, a, b) = linked_pair();
        assert_eq!(
            a.connectedness(&b.peer()).unwrap(),
            Connectedness::CanConnect
        );

        let conn = a.dial(&b.peer()).unwrap();
        assert_eq!(conn.remote_address(), b.address());
        assert_eq!(a.conns().unwrap(), vec![conn.clone()]);
        assert_eq!(b.conns_to_peer(&a.peer()).unwrap(), vec![conn.mirror()]);
        assert_eq!(a.peers().unwrap(), vec![b.peer()]);
        assert_eq!(b.peers().unwrap(), vec![a.peer()]);
        assert_eq!(
            b.connectedness(&a.peer()).unwrap(),
            Connectedness::Connected
        );

        b.close_peer(&a.peer()).unwrap();
        assert!(a.conns().unwrap().is_empty());
        assert!(b.conns().unwrap().is_empty());
        assert!(matches!(
            b.close_peer(&a.peer()),
            Err(Error::NotConnected(_, _))
        ));
    }

    #[test]
    fn test_dial_unknown_peer() {
        let (_, a, _) = linked_pair();
        let stranger = PrivateKey::from_seed(1234).peer_id();
        assert!(matches!(a.dial(&stranger), Err(Error::UnknownPeer(p)) if p == stranger));
        assert_eq!(
            a.connectedness(&stranger).unwrap(),
            Connectedness::CannotConnect
        );
    }

    #[test]
    fn test_subscribe_inbound() {
        let (_, a, b) = linked_pair();
        let mut inbound = b.subscribe().unwrap();
        let mut outbound = a.subscribe().unwrap();

        let conn = a.dial(&b.peer()).unwrap();
        assert_eq!(
            block_on(inbound.next()),
            Some(Event::Connected(conn.mirror()))
        );
        assert_eq!(block_on(outbound.next()), Some(Event::Connected(conn.clone())));

        a.close_peer(&b.peer()).unwrap();
        assert_eq!(
            block_on(inbound.next()),
            Some(Event::Disconnected(conn.mirror()))
        );
        assert_eq!(block_on(outbound.next()), Some(Event::Disconnected(conn)));
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let (mocknet, a, b) = linked_pair();
        let dropped = b.subscribe().unwrap();
        drop(dropped);
        let mut kept = b.subscribe().unwrap();

        a.dial(&b.peer()).unwrap();
        assert!(matches!(block_on(kept.next()), Some(Event::Connected(_))));
        let subscribers = mocknet
            .with_endpoint(&b, |endpoint| endpoint.subscribers.len())
            .unwrap();
        assert_eq!(subscribers, 1);
    }

    #[test]
    fn test_subscription_closes_on_removal() {
        let (mocknet, a, b) = linked_pair();
        let mut events = b.subscribe().unwrap();
        a.dial(&b.peer()).unwrap();
        mocknet.remove_peer(&b.peer()).unwrap();

        assert!(matches!(block_on(events.next()), Some(Event::Connected(_))));
        assert!(matches!(block_on(events.next()), Some(Event::Disconnected(_))));
        assert_eq!(block_on(events.next()), None);
    }

    #[test]
    fn test_stale_handle() {
        let mocknet = Mocknet::new(Config::default());
        let key = PrivateKey::from_seed(5);
        let address: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let stale = mocknet.add_peer(key.clone(), address).unwrap();
        mocknet.remove_peer(&stale.peer()).unwrap();

        // Re-adding the same identity does not revive the old handle
        let fresh = mocknet.add_peer(key, address).unwrap();
        assert_ne!(stale, fresh);
        assert!(matches!(stale.conns(), Err(Error::InvalidEndpoint(_))));
        assert!(matches!(stale.subscribe(), Err(Error::InvalidEndpoint(_))));
        assert!(fresh.conns().unwrap().is_empty());
    }

    #[test]
    fn test_handle_from_other_mocknet() {
        let first = Mocknet::new(Config::default());
        let second = Mocknet::new(Config::default());
        let a = first.gen_peer().unwrap();
        let b = first.gen_peer().unwrap();

        // Same seed, so `second` generates the same identities
        let c = second.gen_peer().unwrap();
        assert_eq!(a.peer(), c.peer());
        assert_ne!(a, c);
        assert!(matches!(
            second.link_nets(&c, &b),
            Err(Error::InvalidEndpoint(p)) if p == b.peer()
        ));
        assert_eq!(second.link_defaults(), LinkOptions::default());
    }
}

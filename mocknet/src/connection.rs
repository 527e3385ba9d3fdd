//! Establish and tear down sessions between linked peers.
//!
//! Every session is made of two mirrored [Conn] halves, one owned by each [Endpoint]. Both halves
//! are created and removed together by the [Manager], so neither side can ever observe a
//! connection the other side does not have.
//!
//! # Policies
//!
//! * A dial only succeeds if at least one [crate::Link] joins the pair **at dial time**. For
//!   distinct peers, a dial fails with [Error::Unreachable] exactly when no link joins them.
//! * A peer can never dial itself. Self-dials fail with [Error::DialSelf] whether or not the peer
//!   is linked to itself, so the self-pair is never reported as [Error::Unreachable].
//! * At most one session exists per (unordered) pair. Dialing a pair that is already connected
//!   (from either side) returns the dialer's existing half instead of opening a second session.
//! * Removing links never closes sessions. A connected pair stays connected after its last link
//!   is removed until one side disconnects explicitly.

use crate::{
    endpoint::Endpoint,
    identity::PeerId,
    link::{LinkOptions, Registry},
    metrics::{Dial, Metrics, Status},
    Error, Failure,
};
use prometheus_client::metrics::{counter::Counter, family::Family, gauge::Gauge};
use std::{
    collections::{BTreeMap, HashMap},
    net::SocketAddr,
};
use tracing::{debug, trace};

/// Side of a session a [Conn] belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    /// The local peer dialed.
    Outbound,
    /// The remote peer dialed.
    Inbound,
}

/// One half of an established session.
#[derive(Clone, Debug, PartialEq)]
pub struct Conn {
    id: u64,
    local: PeerId,
    local_address: SocketAddr,
    remote: PeerId,
    remote_address: SocketAddr,
    direction: Direction,
    options: LinkOptions,
}

impl Conn {
    /// Identifier of the session (shared by both halves).
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn local_peer(&self) -> PeerId {
        self.local
    }

    pub fn local_address(&self) -> SocketAddr {
        self.local_address
    }

    pub fn remote_peer(&self) -> PeerId {
        self.remote
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.remote_address
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Options of the link the session was established over, as of dial time.
    pub fn options(&self) -> LinkOptions {
        self.options
    }

    /// The half of the session held by the remote peer.
    pub fn mirror(&self) -> Conn {
        Conn {
            id: self.id,
            local: self.remote,
            local_address: self.remote_address,
            remote: self.local,
            remote_address: self.local_address,
            direction: match self.direction {
                Direction::Outbound => Direction::Inbound,
                Direction::Inbound => Direction::Outbound,
            },
            options: self.options,
        }
    }
}

/// Key of a session, independent of which side dialed.
fn pair(a: PeerId, b: PeerId) -> (PeerId, PeerId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

fn endpoint(endpoints: &BTreeMap<PeerId, Endpoint>, peer: PeerId) -> Result<&Endpoint, Error> {
    endpoints.get(&peer).ok_or(Error::InvalidEndpoint(peer))
}

/// Tracker of all sessions between endpoints.
pub(crate) struct Manager {
    next: u64,
    sessions: HashMap<(PeerId, PeerId), u64>,

    dials: Family<Dial, Counter>,
    connections: Gauge,
}

impl Manager {
    /// Create a manager with no sessions.
    pub fn new(metrics: &Metrics) -> Self {
        Self {
            next: 0,
            sessions: HashMap::new(),
            dials: metrics.dials.clone(),
            connections: metrics.connections.clone(),
        }
    }

    /// Dial `b` from `a`, returning `a`'s half of the session.
    pub fn connect(
        &mut self,
        endpoints: &mut BTreeMap<PeerId, Endpoint>,
        links: &Registry,
        a: PeerId,
        b: PeerId,
    ) -> Result<Conn, Error> {
        let local_address = endpoint(endpoints, a)?.address();
        let remote_address = endpoint(endpoints, b)?.address();
        if a == b {
            return Err(Error::DialSelf(a));
        }

        // Reachability is checked even if the pair is already connected
        let Some(link) = links.between(&a, &b).into_iter().min_by_key(|link| link.id()) else {
            self.dials.get_or_create(&Dial::new(Status::Unreachable)).inc();
            debug!(%a, %b, "dial failed: no link");
            return Err(Error::Unreachable(a, b));
        };

        // Return existing session
        if let Some(conn) = endpoints.get(&a).and_then(|local| local.conn(&b)) {
            self.dials.get_or_create(&Dial::new(Status::Existing)).inc();
            trace!(%a, %b, id = conn.id, "reusing connection");
            return Ok(conn.clone());
        }

        // Create both halves
        let id = self.next;
        self.next += 1;
        let outbound = Conn {
            id,
            local: a,
            local_address,
            remote: b,
            remote_address,
            direction: Direction::Outbound,
            options: link.options(),
        };
        let inbound = outbound.mirror();
        if let Some(local) = endpoints.get_mut(&a) {
            local.add_conn(outbound.clone());
        }
        if let Some(remote) = endpoints.get_mut(&b) {
            remote.add_conn(inbound);
        }
        self.sessions.insert(pair(a, b), id);
        self.connections.inc();
        self.dials.get_or_create(&Dial::new(Status::Success)).inc();
        debug!(%a, %b, id, link = link.id(), "connected");
        Ok(outbound)
    }

    /// Close the session between `a` and `b`, removing both halves.
    pub fn disconnect(
        &mut self,
        endpoints: &mut BTreeMap<PeerId, Endpoint>,
        a: PeerId,
        b: PeerId,
    ) -> Result<(), Error> {
        endpoint(endpoints, a)?;
        endpoint(endpoints, b)?;
        let Some(id) = self.sessions.remove(&pair(a, b)) else {
            return Err(Error::NotConnected(a, b));
        };
        if let Some(local) = endpoints.get_mut(&a) {
            local.remove_conn(&b);
        }
        if let Some(remote) = endpoints.get_mut(&b) {
            remote.remove_conn(&a);
        }
        self.connections.dec();
        debug!(%a, %b, id, "disconnected");
        Ok(())
    }

    /// Returns `true` if a session exists between `a` and `b`.
    pub fn is_connected(&self, a: PeerId, b: PeerId) -> bool {
        self.sessions.contains_key(&pair(a, b))
    }

    /// Number of open sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Dial every distinct pair of endpoints that is not yet connected.
    ///
    /// Failures do not stop the batch. If any pair could not be connected, the returned
    /// [Error::Partial] lists every such pair with its reason.
    pub fn connect_all(
        &mut self,
        endpoints: &mut BTreeMap<PeerId, Endpoint>,
        links: &Registry,
    ) -> Result<Vec<Conn>, Error> {
        let peers: Vec<PeerId> = endpoints.keys().copied().collect();
        let mut connected = Vec::new();
        let mut failures = Vec::new();
        for (i, a) in peers.iter().enumerate() {
            for b in &peers[i + 1..] {
                if self.is_connected(*a, *b) {
                    continue;
                }
                match self.connect(endpoints, links, *a, *b) {
                    Ok(conn) => connected.push(conn),
                    Err(error) => failures.push(Failure {
                        a: *a,
                        b: *b,
                        error,
                    }),
                }
            }
        }
        if !failures.is_empty() {
            debug!(
                connected = connected.len(),
                failed = failures.len(),
                "connect all incomplete"
            );
            return Err(Error::Partial(failures));
        }
        Ok(connected)
    }

    /// Close every session `peer` is part of.
    pub fn drop_peer(&mut self, endpoints: &mut BTreeMap<PeerId, Endpoint>, peer: PeerId) {
        let remotes = match endpoints.get(&peer) {
            Some(local) => local.remotes(),
            None => return,
        };
        for remote in remotes {
            // Both peers are known and connected, so this cannot fail
            let _ = self.disconnect(endpoints, peer, remote);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::PrivateKey;
    use std::net::{IpAddr, Ipv4Addr};

    struct Fixture {
        peers: Vec<PeerId>,
        endpoints: BTreeMap<PeerId, Endpoint>,
        links: Registry,
        manager: Manager,
        metrics: Metrics,
    }

    fn fixture(n: u64) -> Fixture {
        let metrics = Metrics::default();
        let mut endpoints = BTreeMap::new();
        let mut links = Registry::new(LinkOptions::default());
        let mut peers = Vec::new();
        for i in 0..n {
            let key = PrivateKey::from_seed(i);
            let peer = key.peer_id();
            let address = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 3000 + i as u16);
            endpoints.insert(peer, Endpoint::new(key, address, i));
            links.register(peer);
            peers.push(peer);
        }
        peers.sort();
        Fixture {
            peers,
            endpoints,
            links,
            manager: Manager::new(&metrics),
            metrics,
        }
    }

    impl Fixture {
        fn connect(&mut self, a: usize, b: usize) -> Result<Conn, Error> {
            self.manager.connect(
                &mut self.endpoints,
                &self.links,
                self.peers[a],
                self.peers[b],
            )
        }

        fn disconnect(&mut self, a: usize, b: usize) -> Result<(), Error> {
            self.manager
                .disconnect(&mut self.endpoints, self.peers[a], self.peers[b])
        }

        fn link(&mut self, a: usize, b: usize) -> crate::Link {
            self.links.link(self.peers[a], self.peers[b]).unwrap()
        }

        fn conns(&self, i: usize) -> Vec<Conn> {
            self.endpoints[&self.peers[i]].conns()
        }

        fn dials(&self, status: Status) -> u64 {
            self.metrics.dials.get_or_create(&Dial::new(status)).get()
        }
    }

    #[test]
    fn test_connect_requires_link() {
        let mut f = fixture(2);
        let result = f.connect(0, 1);
        assert!(matches!(
            result,
            Err(Error::Unreachable(a, b)) if a == f.peers[0] && b == f.peers[1]
        ));
        assert!(f.conns(0).is_empty());
        assert!(f.conns(1).is_empty());
        assert_eq!(f.dials(Status::Unreachable), 1);

        f.link(1, 0);
        assert!(f.connect(0, 1).is_ok());
    }

    #[test]
    fn test_connect_creates_mirrored_pair() {
        let mut f = fixture(2);
        let link = f.link(0, 1);
        let options = LinkOptions {
            latency: std::time::Duration::from_millis(40),
            bandwidth: 1_000_000.0,
        };
        link.set_options(options);

        let conn = f.connect(0, 1).unwrap();
        assert_eq!(conn.local_peer(), f.peers[0]);
        assert_eq!(conn.remote_peer(), f.peers[1]);
        assert_eq!(conn.direction(), Direction::Outbound);
        assert_eq!(conn.options(), options);

        assert_eq!(f.conns(0), vec![conn.clone()]);
        let remote = f.conns(1);
        assert_eq!(remote, vec![conn.mirror()]);
        assert_eq!(remote[0].direction(), Direction::Inbound);
        assert_eq!(remote[0].remote_peer(), f.peers[0]);
        assert_eq!(remote[0].remote_address(), conn.local_address());
        assert_eq!(remote[0].mirror(), conn);
        assert_eq!(f.manager.len(), 1);
        assert_eq!(f.metrics.connections.get(), 1);
    }

    #[test]
    fn test_connect_returns_existing() {
        let mut f = fixture(2);
        f.link(0, 1);
        let first = f.connect(0, 1).unwrap();
        let second = f.connect(0, 1).unwrap();
        assert_eq!(first, second);

        // Dialing back returns the listener's half of the same session
        let back = f.connect(1, 0).unwrap();
        assert_eq!(back, first.mirror());
        assert_eq!(back.direction(), Direction::Inbound);

        assert_eq!(f.conns(0).len(), 1);
        assert_eq!(f.conns(1).len(), 1);
        assert_eq!(f.manager.len(), 1);
        assert_eq!(f.dials(Status::Success), 1);
        assert_eq!(f.dials(Status::Existing), 2);
    }

    #[test]
    fn test_connect_self() {
        let mut f = fixture(1);

        // Unlinked self-dial is not reported as unreachable
        assert!(matches!(f.connect(0, 0), Err(Error::DialSelf(p)) if p == f.peers[0]));
        assert_eq!(f.dials(Status::Unreachable), 0);

        f.link(0, 0);
        assert!(matches!(f.connect(0, 0), Err(Error::DialSelf(p)) if p == f.peers[0]));
        assert!(f.conns(0).is_empty());
    }

    #[test]
    fn test_connect_unknown_endpoint() {
        let mut f = fixture(1);
        let stranger = PrivateKey::from_seed(99).peer_id();
        let result = f
            .manager
            .connect(&mut f.endpoints, &f.links, f.peers[0], stranger);
        assert!(matches!(result, Err(Error::InvalidEndpoint(p)) if p == stranger));
    }

    #[test]
    fn test_disconnect_removes_both_halves() {
        let mut f = fixture(2);
        f.link(0, 1);
        f.connect(0, 1).unwrap();

        // Either side may disconnect
        f.disconnect(1, 0).unwrap();
        assert!(f.conns(0).is_empty());
        assert!(f.conns(1).is_empty());
        assert_eq!(f.manager.len(), 0);
        assert_eq!(f.metrics.connections.get(), 0);

        assert!(matches!(f.disconnect(0, 1), Err(Error::NotConnected(_, _))));
    }

    #[test]
    fn test_unlink_does_not_close_sessions() {
        let mut f = fixture(2);
        let link = f.link(0, 1);
        let conn = f.connect(0, 1).unwrap();
        f.links.unlink(&link).unwrap();

        // Session survives the loss of its only link
        assert!(f.manager.is_connected(f.peers[0], f.peers[1]));
        assert_eq!(f.conns(0), vec![conn]);
        assert_eq!(f.conns(1).len(), 1);

        // But it cannot be dialed again without a link
        assert!(matches!(f.connect(0, 1), Err(Error::Unreachable(_, _))));
        f.disconnect(0, 1).unwrap();
    }

    #[test]
    fn test_relink_does_not_resurrect() {
        let mut f = fixture(2);
        f.link(0, 1);
        f.connect(0, 1).unwrap();
        f.disconnect(0, 1).unwrap();
        f.links.unlink_all(&f.peers[0], &f.peers[1]);
        f.link(0, 1);
        assert!(f.conns(0).is_empty());
        assert!(f.conns(1).is_empty());
        assert!(!f.manager.is_connected(f.peers[0], f.peers[1]));
    }

    #[test]
    fn test_connect_all() {
        let mut f = fixture(5);
        f.links.link_all();
        let conns = f
            .manager
            .connect_all(&mut f.endpoints, &f.links)
            .unwrap();
        assert_eq!(conns.len(), 10);
        assert_eq!(f.manager.len(), 10);
        for i in 0..5 {
            assert_eq!(f.conns(i).len(), 4);
        }

        // Everything is already connected
        let conns = f
            .manager
            .connect_all(&mut f.endpoints, &f.links)
            .unwrap();
        assert!(conns.is_empty());
    }

    #[test]
    fn test_connect_all_reports_unlinked_pair() {
        let mut f = fixture(4);
        f.links.link_all();
        f.links.unlink_all(&f.peers[1], &f.peers[3]);

        let result = f.manager.connect_all(&mut f.endpoints, &f.links);
        let Err(Error::Partial(failures)) = result else {
            panic!("expected partial failure");
        };
        assert_eq!(failures.len(), 1);
        assert_eq!((failures[0].a, failures[0].b), (f.peers[1], f.peers[3]));
        assert!(matches!(failures[0].error, Error::Unreachable(_, _)));
        assert_eq!(f.manager.len(), 5);
    }

    #[test]
    fn test_drop_peer() {
        let mut f = fixture(3);
        f.links.link_all();
        f.manager.connect_all(&mut f.endpoints, &f.links).unwrap();

        f.manager.drop_peer(&mut f.endpoints, f.peers[0]);
        assert!(f.conns(0).is_empty());
        assert_eq!(f.conns(1).len(), 1);
        assert_eq!(f.conns(2).len(), 1);
        assert_eq!(f.manager.len(), 1);
    }
}

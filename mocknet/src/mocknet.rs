//! Entry point for building and inspecting a simulated network.

use crate::{
    connection::{Conn, Manager},
    endpoint::{Connectedness, Endpoint, Network},
    identity::{Deterministic, PeerId, PrivateKey, Provider},
    link::{self, Link, LinkMap, LinkOptions},
    metrics::Metrics,
    Error,
};
use prometheus_client::registry::Registry;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use std::{
    collections::BTreeMap,
    fmt::Debug,
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard},
};
use tracing::debug;

/// Configuration for a [Mocknet].
pub struct Config {
    /// Seed for the RNG that shuffles query results (and, unless another [Provider] is supplied,
    /// generates peer identities).
    pub seed: u64,

    /// Options applied to links that are created without explicit options.
    pub link_defaults: LinkOptions,

    /// Registry for metrics.
    pub registry: Arc<Mutex<Registry>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            seed: 0,
            link_defaults: LinkOptions::default(),
            registry: Arc::new(Mutex::new(Registry::default())),
        }
    }
}

struct State {
    rng: StdRng,
    provider: Box<dyn Provider>,
    next_generation: u64,

    endpoints: BTreeMap<PeerId, Endpoint>,
    links: link::Registry,
    conns: Manager,

    metrics: Metrics,
}

impl State {
    /// Randomize the order of a query result.
    ///
    /// The output only depends on the seed if `items` arrive in a deterministic order.
    fn shuffle<T>(&mut self, mut items: Vec<T>) -> Vec<T> {
        items.shuffle(&mut self.rng);
        items
    }

    fn known(&self, peer: &PeerId) -> Result<PeerId, Error> {
        if !self.endpoints.contains_key(peer) {
            return Err(Error::UnknownPeer(*peer));
        }
        Ok(*peer)
    }

    fn record_links(&self) {
        self.metrics.links.set(self.links.len() as i64);
    }

    fn record_peers(&self) {
        self.metrics.peers.set(self.endpoints.len() as i64);
    }
}

/// A simulated network of virtual peers.
///
/// Cloning a [Mocknet] yields another handle to the same simulation. All state is guarded by a
/// single lock, so handles may be shared freely between threads and every operation (including
/// the creation and removal of both halves of a connection) is atomic.
#[derive(Clone)]
pub struct Mocknet {
    state: Arc<Mutex<State>>,
}

impl Mocknet {
    /// Create a new simulation that generates identities deterministically from `cfg.seed`.
    pub fn new(cfg: Config) -> Self {
        let provider = Deterministic::new(cfg.seed);
        Self::with_provider(cfg, provider)
    }

    /// Create a new simulation that generates identities with `provider`.
    pub fn with_provider(cfg: Config, provider: impl Provider) -> Self {
        let metrics = {
            let mut registry = cfg.registry.lock().unwrap();
            Metrics::init(&mut registry)
        };
        let conns = Manager::new(&metrics);
        Self {
            state: Arc::new(Mutex::new(State {
                rng: StdRng::seed_from_u64(cfg.seed),
                provider: Box::new(provider),
                next_generation: 0,
                endpoints: BTreeMap::new(),
                links: link::Registry::new(cfg.link_defaults),
                conns,
                metrics,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Returns `true` if both handles refer to the same simulation.
    pub(crate) fn same(&self, other: &Mocknet) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    /// Resolve a [Network] handle to the peer it represents.
    ///
    /// Handles from another simulation, or to a peer that has since been removed, are invalid.
    fn resolve(&self, state: &State, net: &Network) -> Result<PeerId, Error> {
        let peer = net.peer();
        if !self.same(net.mocknet()) {
            return Err(Error::InvalidEndpoint(peer));
        }
        match state.endpoints.get(&peer) {
            Some(endpoint) if endpoint.generation() == net.generation() => Ok(peer),
            _ => Err(Error::InvalidEndpoint(peer)),
        }
    }

    fn insert(
        &self,
        state: &mut State,
        key: PrivateKey,
        address: SocketAddr,
    ) -> Result<Network, Error> {
        let peer = key.peer_id();
        if state.endpoints.contains_key(&peer) {
            return Err(Error::DuplicateIdentity(peer));
        }

        let generation = state.next_generation;
        state.next_generation += 1;
        let endpoint = Endpoint::new(key, address, generation);
        let net = Network::new(self.clone(), &endpoint);
        state.links.register(peer);
        state.endpoints.insert(peer, endpoint);
        state.record_peers();
        debug!(%peer, %address, "added peer");
        Ok(net)
    }

    /// Generate a new peer with the configured [Provider] and add it.
    pub fn gen_peer(&self) -> Result<Network, Error> {
        let mut guard = self.state();
        let state = &mut *guard;
        let (key, address) = state.provider.generate();
        self.insert(state, key, address)
    }

    /// Add a peer with an existing identity.
    ///
    /// Fails (without modifying anything) if a peer with the same identity exists.
    pub fn add_peer(&self, key: PrivateKey, address: SocketAddr) -> Result<Network, Error> {
        let mut guard = self.state();
        self.insert(&mut guard, key, address)
    }

    /// Remove a peer, closing all of its connections and removing all of its links first.
    pub fn remove_peer(&self, peer: &PeerId) -> Result<(), Error> {
        let mut guard = self.state();
        let state = &mut *guard;
        let peer = state.known(peer)?;
        state.conns.drop_peer(&mut state.endpoints, peer);
        let links = state.links.deregister(&peer);
        state.endpoints.remove(&peer);
        state.record_links();
        state.record_peers();
        debug!(%peer, links = links.len(), "removed peer");
        Ok(())
    }

    /// All peers (in random order).
    pub fn peers(&self) -> Vec<PeerId> {
        let mut state = self.state();
        let peers = state.endpoints.keys().copied().collect();
        state.shuffle(peers)
    }

    /// The [Network] of `peer`, if it exists.
    pub fn net(&self, peer: &PeerId) -> Option<Network> {
        let state = self.state();
        state
            .endpoints
            .get(peer)
            .map(|endpoint| Network::new(self.clone(), endpoint))
    }

    /// The [Network]s of all peers (in random order).
    pub fn nets(&self) -> Vec<Network> {
        let mut state = self.state();
        let nets = state
            .endpoints
            .values()
            .map(|endpoint| Network::new(self.clone(), endpoint))
            .collect();
        state.shuffle(nets)
    }

    /// All links (in random order).
    pub fn links(&self) -> Vec<Link> {
        let mut state = self.state();
        let mut links = state.links.all();
        links.sort_by_key(Link::id);
        state.shuffle(links)
    }

    /// Snapshot of the full link table.
    pub fn link_map(&self) -> LinkMap {
        self.state().links.map()
    }

    /// Links between `a` and `b` (in random order).
    ///
    /// Unknown peers have no links.
    pub fn links_between_peers(&self, a: &PeerId, b: &PeerId) -> Vec<Link> {
        let mut guard = self.state();
        Self::links_between(&mut guard, a, b)
    }

    /// Links between the peers of `a` and `b` (in random order).
    pub fn links_between_nets(&self, a: &Network, b: &Network) -> Result<Vec<Link>, Error> {
        let mut guard = self.state();
        let (a, b) = (self.resolve(&guard, a)?, self.resolve(&guard, b)?);
        Ok(Self::links_between(&mut guard, &a, &b))
    }

    fn links_between(state: &mut State, a: &PeerId, b: &PeerId) -> Vec<Link> {
        let mut links = state.links.between(a, b);
        links.sort_by_key(Link::id);
        state.shuffle(links)
    }

    /// The [Network]s of the peers joined by `link`.
    ///
    /// Returns `None` if `link` is not registered in this simulation.
    pub fn link_nets_of(&self, link: &Link) -> Option<(Network, Network)> {
        let state = self.state();
        if !state.links.contains(link) {
            return None;
        }
        let (a, b) = link.peers();
        let a = Network::new(self.clone(), state.endpoints.get(&a)?);
        let b = Network::new(self.clone(), state.endpoints.get(&b)?);
        Some((a, b))
    }

    /// Options applied to new links.
    pub fn link_defaults(&self) -> LinkOptions {
        self.state().links.defaults()
    }

    /// Change the options applied to new links.
    ///
    /// Existing links are not affected.
    pub fn set_link_defaults(&self, options: LinkOptions) {
        self.state().links.set_defaults(options);
    }

    fn link(&self, state: &mut State, a: PeerId, b: PeerId) -> Result<Link, Error> {
        let link = state.links.link(a, b)?;
        state.record_links();
        Ok(link)
    }

    /// Link two peers.
    ///
    /// Every call creates a new link, even if the peers are already linked.
    pub fn link_peers(&self, a: &PeerId, b: &PeerId) -> Result<Link, Error> {
        let mut guard = self.state();
        let (a, b) = (guard.known(a)?, guard.known(b)?);
        self.link(&mut guard, a, b)
    }

    /// Link the peers of two [Network]s.
    pub fn link_nets(&self, a: &Network, b: &Network) -> Result<Link, Error> {
        let mut guard = self.state();
        let (a, b) = (self.resolve(&guard, a)?, self.resolve(&guard, b)?);
        self.link(&mut guard, a, b)
    }

    /// Create one link between every pair of distinct peers that is not yet linked.
    ///
    /// Returns the links created.
    pub fn link_all(&self) -> Vec<Link> {
        let mut guard = self.state();
        let links = guard.links.link_all();
        guard.record_links();
        links
    }

    /// Remove a single link.
    pub fn unlink(&self, link: &Link) -> Result<(), Error> {
        let mut guard = self.state();
        guard.links.unlink(link)?;
        guard.record_links();
        Ok(())
    }

    fn unlink_all(&self, state: &mut State, a: PeerId, b: PeerId) {
        state.links.unlink_all(&a, &b);
        state.record_links();
    }

    /// Remove every link between two peers.
    ///
    /// Succeeds if the peers were not linked.
    pub fn unlink_peers(&self, a: &PeerId, b: &PeerId) -> Result<(), Error> {
        let mut guard = self.state();
        let (a, b) = (guard.known(a)?, guard.known(b)?);
        self.unlink_all(&mut guard, a, b);
        Ok(())
    }

    /// Remove every link between the peers of two [Network]s.
    pub fn unlink_nets(&self, a: &Network, b: &Network) -> Result<(), Error> {
        let mut guard = self.state();
        let (a, b) = (self.resolve(&guard, a)?, self.resolve(&guard, b)?);
        self.unlink_all(&mut guard, a, b);
        Ok(())
    }

    fn connect(&self, state: &mut State, a: PeerId, b: PeerId) -> Result<Conn, Error> {
        state.conns.connect(&mut state.endpoints, &state.links, a, b)
    }

    /// Connect two peers, returning the half of the connection held by `a`.
    ///
    /// **To succeed, the peers must be linked beforehand.**
    pub fn connect_peers(&self, a: &PeerId, b: &PeerId) -> Result<Conn, Error> {
        let mut guard = self.state();
        let (a, b) = (guard.known(a)?, guard.known(b)?);
        self.connect(&mut guard, a, b)
    }

    /// Connect the peers of two [Network]s, returning the half of the connection held by `a`.
    pub fn connect_nets(&self, a: &Network, b: &Network) -> Result<Conn, Error> {
        let mut guard = self.state();
        let (a, b) = (self.resolve(&guard, a)?, self.resolve(&guard, b)?);
        self.connect(&mut guard, a, b)
    }

    /// Connect every pair of distinct peers that is not yet connected.
    ///
    /// Every pair is attempted. If any pair fails (typically because it is not linked), an
    /// [Error::Partial] lists each failed pair and why; the connections that succeeded stay open.
    pub fn connect_all_but_self(&self) -> Result<Vec<Conn>, Error> {
        let mut guard = self.state();
        let state = &mut *guard;
        state.conns.connect_all(&mut state.endpoints, &state.links)
    }

    fn disconnect(&self, state: &mut State, a: PeerId, b: PeerId) -> Result<(), Error> {
        state.conns.disconnect(&mut state.endpoints, a, b)
    }

    /// Close the connection between two peers (on both sides).
    pub fn disconnect_peers(&self, a: &PeerId, b: &PeerId) -> Result<(), Error> {
        let mut guard = self.state();
        let (a, b) = (guard.known(a)?, guard.known(b)?);
        self.disconnect(&mut guard, a, b)
    }

    /// Close the connection between the peers of two [Network]s (on both sides).
    pub fn disconnect_nets(&self, a: &Network, b: &Network) -> Result<(), Error> {
        let mut guard = self.state();
        let (a, b) = (self.resolve(&guard, a)?, self.resolve(&guard, b)?);
        self.disconnect(&mut guard, a, b)
    }

    /// Connections held by `a` to `b` (in random order).
    ///
    /// Unknown peers have no connections.
    pub fn conns_between_peers(&self, a: &PeerId, b: &PeerId) -> Vec<Conn> {
        let mut guard = self.state();
        Self::conns_between(&mut guard, a, b)
    }

    /// Connections held by the peer of `a` to the peer of `b` (in random order).
    pub fn conns_between_nets(&self, a: &Network, b: &Network) -> Result<Vec<Conn>, Error> {
        let mut guard = self.state();
        let (a, b) = (self.resolve(&guard, a)?, self.resolve(&guard, b)?);
        Ok(Self::conns_between(&mut guard, &a, &b))
    }

    fn conns_between(state: &mut State, a: &PeerId, b: &PeerId) -> Vec<Conn> {
        let conns = state
            .endpoints
            .get(a)
            .and_then(|endpoint| endpoint.conn(b))
            .cloned()
            .into_iter()
            .collect();
        state.shuffle(conns)
    }

    pub(crate) fn with_endpoint<T>(
        &self,
        net: &Network,
        f: impl FnOnce(&Endpoint) -> T,
    ) -> Result<T, Error> {
        let state = self.state();
        let peer = self.resolve(&state, net)?;
        Ok(f(&state.endpoints[&peer]))
    }

    pub(crate) fn with_endpoint_mut<T>(
        &self,
        net: &Network,
        f: impl FnOnce(&mut Endpoint) -> T,
    ) -> Result<T, Error> {
        let mut state = self.state();
        let peer = self.resolve(&state, net)?;
        let endpoint = state
            .endpoints
            .get_mut(&peer)
            .ok_or(Error::InvalidEndpoint(peer))?;
        Ok(f(endpoint))
    }

    pub(crate) fn endpoint_conns(
        &self,
        net: &Network,
        remote: Option<&PeerId>,
    ) -> Result<Vec<Conn>, Error> {
        let mut state = self.state();
        let peer = self.resolve(&state, net)?;
        let conns = state.endpoints[&peer]
            .conns()
            .into_iter()
            .filter(|conn| remote.map_or(true, |remote| conn.remote_peer() == *remote))
            .collect();
        Ok(state.shuffle(conns))
    }

    pub(crate) fn endpoint_peers(&self, net: &Network) -> Result<Vec<PeerId>, Error> {
        let mut state = self.state();
        let peer = self.resolve(&state, net)?;
        let remotes = state.endpoints[&peer].remotes();
        Ok(state.shuffle(remotes))
    }

    pub(crate) fn connectedness(
        &self,
        net: &Network,
        remote: &PeerId,
    ) -> Result<Connectedness, Error> {
        let state = self.state();
        let peer = self.resolve(&state, net)?;
        if state.conns.is_connected(peer, *remote) {
            return Ok(Connectedness::Connected);
        }
        if state.links.is_linked(&peer, remote) {
            return Ok(Connectedness::CanConnect);
        }
        Ok(Connectedness::CannotConnect)
    }

    pub(crate) fn dial(&self, net: &Network, remote: &PeerId) -> Result<Conn, Error> {
        let mut guard = self.state();
        let peer = self.resolve(&guard, net)?;
        let remote = guard.known(remote)?;
        self.connect(&mut guard, peer, remote)
    }

    pub(crate) fn hang_up(&self, net: &Network, remote: &PeerId) -> Result<(), Error> {
        let mut guard = self.state();
        let peer = self.resolve(&guard, net)?;
        let remote = guard.known(remote)?;
        self.disconnect(&mut guard, peer, remote)
    }
}

impl Debug for Mocknet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("Mocknet")
            .field("peers", &state.endpoints.len())
            .field("links", &state.links.len())
            .field("conns", &state.conns.len())
            .finish()
    }
}

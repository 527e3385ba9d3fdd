//! Track which virtual peers are physically able to reach each other.
//!
//! A [Link] is the **possibility** of a connection, like a cable between two machines. Without one,
//! peers can dial each other as often as they like and never succeed. Any number of links may join
//! the same pair of peers and each can be removed independently; a pair is reachable as long as at
//! least one link remains.

use crate::{identity::PeerId, Error};
use std::{
    collections::{HashMap, HashSet},
    fmt::Debug,
    hash::{Hash, Hasher},
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing::debug;

/// Unique identifier of a [Link].
pub type LinkId = u64;

/// Snapshot of the link table: peer -> peer -> links.
///
/// Every link appears under both of the peers it joins.
pub type LinkMap = HashMap<PeerId, HashMap<PeerId, Vec<Link>>>;

/// Parameters that describe the physical medium of a [Link].
///
/// These are advisory: the simulation records them (and snapshots them into every
/// [crate::Conn] dialed over the link) but does not delay or throttle anything.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LinkOptions {
    /// One-way latency of the link.
    pub latency: Duration,

    /// Bandwidth of the link in bytes per second.
    pub bandwidth: f64,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            latency: Duration::ZERO,
            bandwidth: f64::INFINITY,
        }
    }
}

/// Reachability between two virtual peers.
///
/// Cloning a [Link] yields another handle to the same link: options set through one handle are
/// visible through all of them. Two handles are equal only if they refer to the same link, so links
/// of different registries never compare equal even when their identifiers collide.
#[derive(Clone)]
pub struct Link {
    id: LinkId,
    peers: (PeerId, PeerId),
    options: Arc<Mutex<LinkOptions>>,
}

impl Link {
    fn new(id: LinkId, a: PeerId, b: PeerId, options: LinkOptions) -> Self {
        Self {
            id,
            peers: (a, b),
            options: Arc::new(Mutex::new(options)),
        }
    }

    /// Identifier of the link.
    pub fn id(&self) -> LinkId {
        self.id
    }

    /// The peers joined by the link (in the order they were passed when linking).
    pub fn peers(&self) -> (PeerId, PeerId) {
        self.peers
    }

    /// Returns `true` if the link has `peer` as one of its ends.
    pub fn joins(&self, peer: &PeerId) -> bool {
        self.peers.0 == *peer || self.peers.1 == *peer
    }

    /// Current options of the link.
    pub fn options(&self) -> LinkOptions {
        *self.options.lock().unwrap()
    }

    /// Replace the options of the link.
    pub fn set_options(&self, options: LinkOptions) {
        *self.options.lock().unwrap() = options;
    }
}

impl PartialEq for Link {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && Arc::ptr_eq(&self.options, &other.options)
    }
}

impl Eq for Link {}

impl Hash for Link {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("id", &self.id)
            .field("a", &self.peers.0)
            .field("b", &self.peers.1)
            .field("options", &self.options())
            .finish()
    }
}

/// Registry of all links between known peers.
///
/// Links are stored once (by identifier) and indexed symmetrically: a link between `a` and `b`
/// is present in both `index[a][b]` and `index[b][a]`. Inner entries are removed as soon as they
/// become empty, so `index[a]` only contains the peers `a` is currently linked to.
pub struct Registry {
    defaults: LinkOptions,
    next: LinkId,

    index: HashMap<PeerId, HashMap<PeerId, HashSet<LinkId>>>,
    links: HashMap<LinkId, Link>,
}

impl Registry {
    /// Create an empty registry that applies `defaults` to new links.
    pub fn new(defaults: LinkOptions) -> Self {
        Self {
            defaults,
            next: 0,
            index: HashMap::new(),
            links: HashMap::new(),
        }
    }

    /// Options applied to links created from now on.
    pub fn defaults(&self) -> LinkOptions {
        self.defaults
    }

    /// Change the options applied to future links.
    ///
    /// Existing links keep their options.
    pub fn set_defaults(&mut self, defaults: LinkOptions) {
        self.defaults = defaults;
    }

    /// Make `peer` known to the registry.
    ///
    /// Returns `false` if the peer was already registered.
    pub fn register(&mut self, peer: PeerId) -> bool {
        if self.index.contains_key(&peer) {
            return false;
        }
        self.index.insert(peer, HashMap::new());
        true
    }

    /// Forget `peer`, removing every link it is part of.
    pub fn deregister(&mut self, peer: &PeerId) -> Vec<Link> {
        let Some(neighbors) = self.index.remove(peer) else {
            return Vec::new();
        };
        let mut removed = Vec::new();
        for (other, ids) in neighbors {
            if other != *peer {
                if let Some(slots) = self.index.get_mut(&other) {
                    slots.remove(peer);
                }
            }
            removed.extend(ids.into_iter().filter_map(|id| self.links.remove(&id)));
        }
        removed
    }

    /// Returns `true` if `peer` is known to the registry.
    pub fn is_registered(&self, peer: &PeerId) -> bool {
        self.index.contains_key(peer)
    }

    /// Create a new link between `a` and `b` using the current defaults.
    pub fn link(&mut self, a: PeerId, b: PeerId) -> Result<Link, Error> {
        for peer in [&a, &b] {
            if !self.index.contains_key(peer) {
                return Err(Error::InvalidEndpoint(*peer));
            }
        }

        let link = self.add(a, b);
        debug!(link = link.id, %a, %b, "linked");
        Ok(link)
    }

    /// Remove exactly `link`.
    ///
    /// Fails if the link is not (or no longer) registered.
    pub fn unlink(&mut self, link: &Link) -> Result<(), Error> {
        if !self.contains(link) {
            return Err(Error::LinkNotFound(link.id));
        }
        self.links.remove(&link.id);
        let (a, b) = link.peers;
        self.remove(&a, &b, link.id);
        self.remove(&b, &a, link.id);
        debug!(link = link.id, %a, %b, "unlinked");
        Ok(())
    }

    /// Remove every link between `a` and `b`, returning the removed links.
    pub fn unlink_all(&mut self, a: &PeerId, b: &PeerId) -> Vec<Link> {
        let ids = self
            .index
            .get_mut(a)
            .and_then(|slots| slots.remove(b))
            .unwrap_or_default();
        if let Some(slots) = self.index.get_mut(b) {
            slots.remove(a);
        }
        let removed: Vec<Link> = ids
            .into_iter()
            .filter_map(|id| self.links.remove(&id))
            .collect();
        if !removed.is_empty() {
            debug!(%a, %b, count = removed.len(), "unlinked all");
        }
        removed
    }

    /// Returns `true` if `link` was created by this registry and has not been removed.
    pub fn contains(&self, link: &Link) -> bool {
        self.links.get(&link.id).is_some_and(|stored| stored == link)
    }

    /// Links between `a` and `b` (in no particular order).
    pub fn between(&self, a: &PeerId, b: &PeerId) -> Vec<Link> {
        self.index
            .get(a)
            .and_then(|slots| slots.get(b))
            .map(|ids| ids.iter().map(|id| self.links[id].clone()).collect())
            .unwrap_or_default()
    }

    /// Returns `true` if at least one link exists between `a` and `b`.
    pub fn is_linked(&self, a: &PeerId, b: &PeerId) -> bool {
        self.index
            .get(a)
            .is_some_and(|slots| slots.contains_key(b))
    }

    /// Create one default link for every distinct pair of registered peers that has none.
    ///
    /// Pairs are visited in key order so repeated runs assign identical link identifiers.
    pub fn link_all(&mut self) -> Vec<Link> {
        let mut peers: Vec<PeerId> = self.index.keys().copied().collect();
        peers.sort();

        let mut created = Vec::new();
        for (i, a) in peers.iter().enumerate() {
            for b in &peers[i + 1..] {
                if self.is_linked(a, b) {
                    continue;
                }
                created.push(self.add(*a, *b));
            }
        }
        debug!(count = created.len(), "linked all pairs");
        created
    }

    /// All registered links (in no particular order).
    pub fn all(&self) -> Vec<Link> {
        self.links.values().cloned().collect()
    }

    /// Snapshot of the full link table.
    pub fn map(&self) -> LinkMap {
        self.index
            .iter()
            .filter(|(_, slots)| !slots.is_empty())
            .map(|(a, slots)| {
                let slots: HashMap<PeerId, Vec<Link>> = slots
                    .iter()
                    .map(|(b, ids)| (*b, ids.iter().map(|id| self.links[id].clone()).collect()))
                    .collect();
                (*a, slots)
            })
            .collect()
    }

    /// Number of registered links.
    pub fn len(&self) -> usize {
        self.links.len()
    }

    /// Returns `true` if no links are registered.
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    fn add(&mut self, a: PeerId, b: PeerId) -> Link {
        let id = self.next;
        self.next += 1;
        let link = Link::new(id, a, b, self.defaults);
        self.insert(&a, &b, id);
        self.insert(&b, &a, id);
        self.links.insert(id, link.clone());
        link
    }

    fn insert(&mut self, from: &PeerId, to: &PeerId, id: LinkId) {
        if let Some(slots) = self.index.get_mut(from) {
            slots.entry(*to).or_default().insert(id);
        }
    }

    fn remove(&mut self, from: &PeerId, to: &PeerId, id: LinkId) {
        let Some(slots) = self.index.get_mut(from) else {
            return;
        };
        if let Some(ids) = slots.get_mut(to) {
            ids.remove(&id);
            if ids.is_empty() {
                slots.remove(to);
            }
        }
    }
}

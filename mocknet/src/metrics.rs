use prometheus_client::{
    encoding::{EncodeLabelSet, EncodeLabelValue},
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

/// Outcome of a dial.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Status {
    /// A new connection was established.
    Success,
    /// A connection already existed and was returned.
    Existing,
    /// No link existed between the peers.
    Unreachable,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct Dial {
    pub status: Status,
}

impl Dial {
    pub fn new(status: Status) -> Self {
        Self { status }
    }
}

/// Metrics tracked by a [crate::Mocknet].
#[derive(Default)]
pub struct Metrics {
    pub peers: Gauge,
    pub links: Gauge,
    pub connections: Gauge,
    pub dials: Family<Dial, Counter>,
}

impl Metrics {
    /// Create and register all metrics.
    pub fn init(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        registry.register("peers", "number of peers", metrics.peers.clone());
        registry.register("links", "number of links", metrics.links.clone());
        registry.register(
            "connections",
            "number of established connections",
            metrics.connections.clone(),
        );
        registry.register("dials", "dial attempts by outcome", metrics.dials.clone());
        metrics
    }
}

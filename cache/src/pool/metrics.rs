use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};

/// Metrics tracked by a [super::PoolRef].
///
/// Cloning shares the underlying values.
#[derive(Clone, Default)]
pub struct Metrics {
    pub hits: Counter,
    pub misses: Counter,
    pub coalesced: Counter,
    pub reads: Counter,
    pub read_failures: Counter,
    pub evictions: Counter,
    pub exhausted: Counter,
    pub slots: Gauge,
    pub reusable: Gauge,
}

impl Metrics {
    /// Register the metrics in the provided registry.
    pub(super) fn register(&self, registry: &mut Registry) {
        registry.register(
            "hits",
            "Number of line lookups that found the line already mapped to a slot",
            self.hits.clone(),
        );
        registry.register(
            "misses",
            "Number of line lookups that assigned a new slot",
            self.misses.clone(),
        );
        registry.register(
            "coalesced",
            "Number of lookups that joined a read already in flight",
            self.coalesced.clone(),
        );
        registry.register(
            "reads",
            "Number of line reads issued to sources",
            self.reads.clone(),
        );
        registry.register(
            "read_failures",
            "Number of line reads that failed",
            self.read_failures.clone(),
        );
        registry.register(
            "evictions",
            "Number of slots taken away from the line occupying them",
            self.evictions.clone(),
        );
        registry.register(
            "exhausted",
            "Number of requests rejected because every slot was locked or wanted",
            self.exhausted.clone(),
        );
        registry.register(
            "slots",
            "Number of slots currently allocated",
            self.slots.clone(),
        );
        registry.register(
            "reusable",
            "Number of slots eligible for eviction",
            self.reusable.clone(),
        );
    }
}

//! Metric identity interning.
//!
//! Every distinct fully-qualified name (FQN) maps to exactly one shared
//! [`MetricId`]. The identity is created on first use, cached for the life of
//! the registry, and carries the shard index computed once at creation.

use crate::core::{Result, TallyError};
use crate::metrics::types::AggregationKind;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rustc_hash::FxHasher;
use smallvec::SmallVec;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Separator between FQN fragments
pub const DELIM: char = '/';

/// Stable shard assignment for an FQN.
#[inline]
pub fn shard_for(fqn: &str, shards: usize) -> usize {
    let mut hasher = FxHasher::default();
    fqn.hash(&mut hasher);
    (hasher.finish() % shards as u64) as usize
}

/// Interned metric identity
#[derive(Debug)]
pub struct MetricId {
    host: Arc<str>,
    agent: Arc<str>,
    namespace: SmallVec<[Arc<str>; 4]>,
    name: Arc<str>,
    kind: AggregationKind,
    fqn: Arc<str>,
    shard: usize,
}

impl MetricId {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn agent(&self) -> &str {
        &self.agent
    }

    pub fn namespace(&self) -> impl Iterator<Item = &str> {
        self.namespace.iter().map(|s| s.as_ref())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> AggregationKind {
        self.kind
    }

    /// Fully qualified name: host/agent/namespace.../name
    pub fn fqn(&self) -> &str {
        &self.fqn
    }

    /// Shared handle to the FQN, used as the shard map key
    pub fn fqn_arc(&self) -> &Arc<str> {
        &self.fqn
    }

    /// Shard index assigned when the identity was interned
    #[inline]
    pub fn shard(&self) -> usize {
        self.shard
    }

    /// Namespace and metric name without host and agent
    pub fn local_name(&self) -> String {
        let mut local = String::new();
        for segment in &self.namespace {
            local.push_str(segment);
            local.push(DELIM);
        }
        local.push_str(&self.name);
        local
    }
}

impl PartialEq for MetricId {
    fn eq(&self, other: &Self) -> bool {
        self.fqn == other.fqn
    }
}

impl Eq for MetricId {}

impl Hash for MetricId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.fqn.hash(state);
    }
}

impl fmt::Display for MetricId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]{}", self.kind, self.fqn)
    }
}

fn check_fragment(label: &str, fragment: &str) -> Result<()> {
    if fragment.trim().is_empty() {
        return Err(TallyError::identity(format!("{} cannot be empty", label)));
    }
    if fragment.contains(DELIM) {
        return Err(TallyError::identity(format!(
            "{} {:?} cannot contain '{}'",
            label, fragment, DELIM
        )));
    }
    Ok(())
}

/// Concurrent FQN -> identity intern table
pub struct MetricRegistry {
    ids: DashMap<Arc<str>, Arc<MetricId>>,
    shards: usize,
}

impl MetricRegistry {
    /// Create a registry assigning identities across `shards` shards.
    ///
    /// # Panics
    ///
    /// Panics if `shards` is zero.
    pub fn new(shards: usize) -> Self {
        Self::with_capacity(shards, 1024)
    }

    /// Create with specified initial capacity
    pub fn with_capacity(shards: usize, capacity: usize) -> Self {
        assert!(shards > 0, "shard count must be greater than 0");
        Self {
            ids: DashMap::with_capacity(capacity),
            shards,
        }
    }

    /// Resolve (interning on first use) the identity for the given fragments.
    ///
    /// When the FQN is already interned the existing identity is returned
    /// unchanged, including its original aggregation kind.
    pub fn resolve<S: AsRef<str>>(
        &self,
        host: &str,
        agent: &str,
        namespace: &[S],
        name: &str,
        kind: AggregationKind,
    ) -> Result<Arc<MetricId>> {
        check_fragment("host", host)?;
        check_fragment("agent", agent)?;
        for segment in namespace {
            check_fragment("namespace segment", segment.as_ref())?;
        }
        check_fragment("metric name", name)?;

        let mut fqn = String::with_capacity(64);
        fqn.push_str(host);
        fqn.push(DELIM);
        fqn.push_str(agent);
        fqn.push(DELIM);
        for segment in namespace {
            fqn.push_str(segment.as_ref());
            fqn.push(DELIM);
        }
        fqn.push_str(name);

        // Fast path: already interned
        if let Some(entry) = self.ids.get(fqn.as_str()) {
            return Ok(Arc::clone(entry.value()));
        }

        Ok(self.intern_slow(fqn, host, agent, namespace, name, kind))
    }

    /// Resolve an identity from a full `host/agent/[namespace/...]name` path
    pub fn resolve_fqn(&self, fqn: &str, kind: AggregationKind) -> Result<Arc<MetricId>> {
        if let Some(entry) = self.ids.get(fqn) {
            return Ok(Arc::clone(entry.value()));
        }

        let fragments: Vec<&str> = fqn.split(DELIM).collect();
        if fragments.len() < 3 {
            return Err(TallyError::identity(format!(
                "{:?} needs at least host{d}agent{d}name",
                fqn,
                d = DELIM
            )));
        }
        let last = fragments.len() - 1;
        self.resolve(
            fragments[0],
            fragments[1],
            &fragments[2..last],
            fragments[last],
            kind,
        )
    }

    #[cold]
    fn intern_slow<S: AsRef<str>>(
        &self,
        fqn: String,
        host: &str,
        agent: &str,
        namespace: &[S],
        name: &str,
        kind: AggregationKind,
    ) -> Arc<MetricId> {
        let fqn: Arc<str> = Arc::from(fqn);

        // Entry API holds the DashMap shard lock, so racing resolvers agree
        match self.ids.entry(Arc::clone(&fqn)) {
            Entry::Occupied(e) => {
                let existing = Arc::clone(e.get());
                if existing.kind != kind {
                    tracing::debug!(
                        fqn = %existing.fqn,
                        interned = %existing.kind,
                        requested = %kind,
                        "Identity already interned with a different kind"
                    );
                }
                existing
            },
            Entry::Vacant(e) => {
                let id = Arc::new(MetricId {
                    host: Arc::from(host),
                    agent: Arc::from(agent),
                    namespace: namespace.iter().map(|s| Arc::from(s.as_ref())).collect(),
                    name: Arc::from(name),
                    kind,
                    shard: shard_for(&fqn, self.shards),
                    fqn,
                });
                e.insert(Arc::clone(&id));
                id
            },
        }
    }

    /// Look up an already interned identity
    pub fn get(&self, fqn: &str) -> Option<Arc<MetricId>> {
        self.ids.get(fqn).map(|e| Arc::clone(e.value()))
    }

    /// Shard index of an identity
    #[inline]
    pub fn shard_index_of(&self, id: &MetricId) -> usize {
        id.shard
    }

    /// Number of shards identities are spread over
    pub fn shard_count(&self) -> usize {
        self.shards
    }

    /// Get current number of interned identities
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Forget every interned identity. Outstanding `Arc<MetricId>`s stay valid.
    pub fn clear(&self) {
        self.ids.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    #[test]
    fn test_fqn_and_fragments() {
        let registry = MetricRegistry::new(4);
        let id = registry
            .resolve("host1", "agentA", &["cpu"], "usage", AggregationKind::MinMaxAvg)
            .unwrap();

        assert_eq!(id.fqn(), "host1/agentA/cpu/usage");
        assert_eq!(id.host(), "host1");
        assert_eq!(id.agent(), "agentA");
        assert_eq!(id.namespace().collect::<Vec<_>>(), vec!["cpu"]);
        assert_eq!(id.name(), "usage");
        assert_eq!(id.local_name(), "cpu/usage");
        assert_eq!(id.to_string(), "[min_max_avg]host1/agentA/cpu/usage");
        assert!(id.shard() < 4);
    }

    #[test]
    fn test_same_fqn_same_instance() {
        let registry = MetricRegistry::new(8);
        let a = registry
            .resolve("h", "a", &["ns1", "ns2"], "m", AggregationKind::IntervalCount)
            .unwrap();
        let b = registry
            .resolve_fqn("h/a/ns1/ns2/m", AggregationKind::IntervalCount)
            .unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_existing_kind_wins() {
        let registry = MetricRegistry::new(2);
        let first = registry
            .resolve("h", "a", &[] as &[&str], "m", AggregationKind::Messages)
            .unwrap();
        let second = registry
            .resolve("h", "a", &[] as &[&str], "m", AggregationKind::MinMaxAvg)
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.kind(), AggregationKind::Messages);
    }

    #[test]
    fn test_invalid_fragments_fail_fast() {
        let registry = MetricRegistry::new(2);
        let kind = AggregationKind::LastValue;

        assert!(matches!(
            registry.resolve("", "a", &["ns"], "m", kind),
            Err(TallyError::InvalidIdentity(_))
        ));
        assert!(registry.resolve("h", " ", &["ns"], "m", kind).is_err());
        assert!(registry.resolve("h", "a", &[""], "m", kind).is_err());
        assert!(registry.resolve("h", "a", &["ns"], "", kind).is_err());
        assert!(registry.resolve("h", "a", &["n/s"], "m", kind).is_err());
        assert!(registry.resolve_fqn("h/m", kind).is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_shard_index_is_stable() {
        let fqn = "host1/agentA/cpu/usage";
        let first = shard_for(fqn, 4);
        for _ in 0..100 {
            assert_eq!(shard_for(fqn, 4), first);
        }

        let registry = MetricRegistry::new(4);
        let id = registry.resolve_fqn(fqn, AggregationKind::MinMaxAvg).unwrap();
        assert_eq!(registry.shard_index_of(&id), first);
    }

    #[test]
    fn test_concurrent_resolve_single_flight() {
        let registry = Arc::new(MetricRegistry::new(4));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    (0..50)
                        .map(|i| {
                            registry
                                .resolve_fqn(
                                    &format!("h/a/ns/metric{}", i),
                                    AggregationKind::IntervalCount,
                                )
                                .unwrap()
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let results: Vec<Vec<Arc<MetricId>>> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(registry.len(), 50);
        for ids in &results[1..] {
            for (a, b) in results[0].iter().zip(ids) {
                assert!(Arc::ptr_eq(a, b));
                assert_eq!(a.shard(), b.shard());
            }
        }
    }

    #[test]
    fn test_clear() {
        let registry = MetricRegistry::new(1);
        let old = registry
            .resolve_fqn("h/a/m", AggregationKind::LastValue)
            .unwrap();
        registry.clear();
        assert!(registry.get("h/a/m").is_none());

        let new = registry
            .resolve_fqn("h/a/m", AggregationKind::LastValue)
            .unwrap();
        assert!(!Arc::ptr_eq(&old, &new));
        assert_eq!(*old, *new);
    }
}

//! Tablet balancing.
//!
//! The balancer only *chooses*; the watcher owns all metadata writes and
//! RPCs. Implementations are not required to be thread-safe: the watcher
//! serializes every call under its flush lock.

use std::collections::HashMap;

use tabletdb_common::{KeyExtent, TServerInstance};
use tabletdb_metadata::TabletMetadata;

/// Chooses destinations for unassigned tablets and proposes migrations for
/// balance.
pub trait Balancer: Send + Sync {
    /// Pick a destination for each unassigned tablet. `current_load` maps
    /// each live server to its hosted-tablet count; `last` is the tablet's
    /// sticky previous location, which implementations may prefer.
    fn assign(
        &self,
        unassigned: &[TabletMetadata],
        current_load: &HashMap<TServerInstance, usize>,
    ) -> HashMap<KeyExtent, TServerInstance>;

    /// Propose migrations `(extent, destination)` to even load out.
    fn balance(
        &self,
        current_load: &HashMap<TServerInstance, usize>,
    ) -> Vec<(KeyExtent, TServerInstance)>;
}

/// Least-loaded assignment with a preference for the tablet's previous
/// server.
#[derive(Default)]
pub struct SimpleLoadBalancer;

impl Balancer for SimpleLoadBalancer {
    fn assign(
        &self,
        unassigned: &[TabletMetadata],
        current_load: &HashMap<TServerInstance, usize>,
    ) -> HashMap<KeyExtent, TServerInstance> {
        if current_load.is_empty() {
            return HashMap::new();
        }
        let mut load: HashMap<TServerInstance, usize> = current_load.clone();
        let mut assignments = HashMap::with_capacity(unassigned.len());
        for tm in unassigned {
            let dest = match tm.last() {
                // stickiness: the previous server still exists, reuse it
                Some(last) if load.contains_key(last) => last.clone(),
                _ => load
                    .iter()
                    .min_by_key(|(server, count)| (**count, server.location.clone()))
                    .map(|(server, _)| server.clone())
                    .expect("load map checked non-empty"),
            };
            *load.entry(dest.clone()).or_insert(0) += 1;
            assignments.insert(tm.extent().clone(), dest);
        }
        assignments
    }

    fn balance(
        &self,
        current_load: &HashMap<TServerInstance, usize>,
    ) -> Vec<(KeyExtent, TServerInstance)> {
        // assignment-time spreading keeps this balancer's clusters level
        // enough; it never proposes migrations
        let _ = current_load;
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use tabletdb_common::TableId;

    use super::*;

    fn server(name: &str) -> TServerInstance {
        TServerInstance::new(name, 1)
    }

    fn tm(end: &'static str) -> TabletMetadata {
        TabletMetadata::builder(KeyExtent::new(TableId::new("t"), Some(end), None::<&str>)).build()
    }

    #[test]
    fn spreads_across_least_loaded() {
        let load: HashMap<_, _> = [(server("a:1"), 0), (server("b:1"), 0)].into();
        let tablets = vec![tm("a"), tm("b"), tm("c"), tm("d")];
        let assignments = SimpleLoadBalancer.assign(&tablets, &load);
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for dest in assignments.values() {
            *counts.entry(dest.location.as_str()).or_insert(0) += 1;
        }
        assert_eq!(counts["a:1"], 2);
        assert_eq!(counts["b:1"], 2);
    }

    #[test]
    fn no_servers_no_assignments() {
        let assignments = SimpleLoadBalancer.assign(&[tm("a")], &HashMap::new());
        assert!(assignments.is_empty());
    }
}

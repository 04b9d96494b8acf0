//! Routing table: hostname → fanout handler
//!
//! Sharded map so the ingress hot path never waits on a reconcile touching an
//! unrelated hostname.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;

use super::fanout::FanoutHandler;

/// Live routing table shared by the ingress and the dispatcher reconciler
#[derive(Debug, Default)]
pub struct RoutingTable {
    entries: DashMap<String, Arc<FanoutHandler>>,
}

impl RoutingTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Handler for `host`, if installed
    pub fn get(&self, host: &str) -> Option<Arc<FanoutHandler>> {
        self.entries.get(host).map(|entry| Arc::clone(entry.value()))
    }

    /// Install `handler` under `host`, returning the handler it replaced
    pub fn insert(&self, host: impl Into<String>, handler: Arc<FanoutHandler>) -> Option<Arc<FanoutHandler>> {
        self.entries.insert(host.into(), handler)
    }

    /// Remove the entry for `host`
    pub fn remove(&self, host: &str) -> Option<Arc<FanoutHandler>> {
        self.entries.remove(host).map(|(_, handler)| handler)
    }

    /// Remove every entry owned by `owner`, returning the removed hostnames
    pub fn remove_channel(&self, owner: &str) -> Vec<String> {
        let hosts = self.hosts_for(owner);
        hosts
            .into_iter()
            .filter(|host| {
                self.entries
                    .remove_if(host, |_, handler| handler.owner() == owner)
                    .is_some()
            })
            .collect()
    }

    /// Drop entries whose owner is not in `owners`, returning the removed hostnames
    pub fn retain_owners(&self, owners: &HashSet<String>) -> Vec<String> {
        let mut removed = Vec::new();
        self.entries.retain(|host, handler| {
            let keep = owners.contains(handler.owner());
            if !keep {
                removed.push(host.clone());
            }
            keep
        });
        removed
    }

    /// Hostnames currently routed to `owner`
    pub fn hosts_for(&self, owner: &str) -> Vec<String> {
        self.entries
            .iter()
            .filter(|entry| entry.value().owner() == owner)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Number of installed hostnames
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing is installed
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

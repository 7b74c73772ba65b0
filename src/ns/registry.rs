//! Forwarding-pointer registry.
//!
//! Per uri: an ordered list of at most two active addresses, plus the global
//! set of known addresses. Invariants: `actives[uri].len() <= 2`,
//! `actives[uri] ⊆ known`, and slot order survives pointer swaps so replica
//! positions stay stable.

use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use tracing::{debug, error};

use super::proximity::find_closest_ip;

/// Maximum simultaneously active servers per uri (the replica pair).
pub const MAX_ACTIVE: usize = 2;

#[derive(Default)]
struct Inner {
    known: HashSet<String>,
    actives: HashMap<String, Vec<String>>,
}

/// Shared registry state. Readers (resolution, random, replica lookups) run
/// in parallel; registration, swaps and eviction take the write side.
#[derive(Default)]
pub struct Registry {
    inner: RwLock<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `addr` as known and activate it if the uri has a free slot.
    /// Re-registering an already-active address answers `true` without
    /// double-booking the slot.
    pub async fn register(&self, uri: &str, addr: &str) -> bool {
        let mut inner = self.inner.write().await;
        inner.known.insert(addr.to_string());

        let actives = inner.actives.entry(uri.to_string()).or_default();
        if actives.iter().any(|a| a == addr) {
            return true;
        }
        if actives.len() < MAX_ACTIVE {
            actives.push(addr.to_string());
            return true;
        }
        false
    }

    /// Resolve `uri` to the active address closest to `caller` by IP
    /// distance. Candidates are shuffled first so exact ties rotate.
    pub async fn closest(&self, caller: std::net::IpAddr, uri: &str) -> Option<String> {
        let inner = self.inner.read().await;
        let actives = inner.actives.get(uri)?;
        if actives.is_empty() {
            return None;
        }
        let mut candidates: Vec<String> = actives.clone();
        candidates.shuffle(&mut rand::thread_rng());
        find_closest_ip(caller, &candidates)
    }

    /// Any known address not currently active for `uri` (a migration
    /// candidate), or None.
    pub async fn random_inactive(&self, uri: &str) -> Option<String> {
        let inner = self.inner.read().await;
        let actives = inner.actives.get(uri);
        let pool: Vec<&String> = inner
            .known
            .iter()
            .filter(|addr| actives.map_or(true, |a| !a.contains(*addr)))
            .collect();
        pool.choose(&mut rand::thread_rng()).map(|s| s.to_string())
    }

    /// Replace `old_addr` with `new_addr` at its slot. A successful swap
    /// also puts the incoming address in `known` (a migrated-in server
    /// never registered itself). A missing `old_addr` is logged and the
    /// registry is left untouched.
    pub async fn swap_active(&self, uri: &str, new_addr: &str, old_addr: &str) {
        let mut inner = self.inner.write().await;
        let inner = &mut *inner;
        let Some(actives) = inner.actives.get_mut(uri) else {
            error!("swap on unknown uri {}", uri);
            return;
        };
        match actives.iter().position(|a| a == old_addr) {
            Some(slot) => {
                actives[slot] = new_addr.to_string();
                inner.known.insert(new_addr.to_string());
                debug!("{}: active slot {} now {}", uri, slot, new_addr);
            }
            None => {
                error!(
                    "cannot update {} to {}: {} is not active for {}",
                    old_addr, new_addr, old_addr, uri
                );
            }
        }
    }

    /// The other active address for `uri`, if any.
    pub async fn replica_of(&self, uri: &str, my_addr: &str) -> Option<String> {
        let inner = self.inner.read().await;
        inner
            .actives
            .get(uri)?
            .iter()
            .find(|a| a.as_str() != my_addr)
            .cloned()
    }

    /// Drop a dead address from `known` and from the uri's actives.
    pub async fn remove(&self, uri: &str, addr: &str) {
        let mut inner = self.inner.write().await;
        inner.known.remove(addr);
        if let Some(actives) = inner.actives.get_mut(uri) {
            actives.retain(|a| a != addr);
        }
        debug!("evicted {} for {}", addr, uri);
    }

    /// Current actives for a uri (test and logging aid).
    pub async fn actives(&self, uri: &str) -> Vec<String> {
        let inner = self.inner.read().await;
        inner.actives.get(uri).cloned().unwrap_or_default()
    }

    /// Whether the address is still known at all.
    pub async fn is_known(&self, addr: &str) -> bool {
        self.inner.read().await.known.contains(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn at_most_two_actives_per_uri() {
        let reg = Registry::new();
        assert!(reg.register("chat", "http://10.0.0.1:4000").await);
        assert!(reg.register("chat", "http://10.0.0.2:4000").await);
        assert!(!reg.register("chat", "http://10.0.0.3:4000").await);

        let actives = reg.actives("chat").await;
        assert_eq!(actives.len(), 2);
        // The third server is a known migration candidate.
        assert!(reg.is_known("http://10.0.0.3:4000").await);
        assert_eq!(
            reg.random_inactive("chat").await.as_deref(),
            Some("http://10.0.0.3:4000")
        );
    }

    #[tokio::test]
    async fn reregistration_is_idempotent() {
        let reg = Registry::new();
        assert!(reg.register("chat", "http://10.0.0.1:4000").await);
        assert!(reg.register("chat", "http://10.0.0.1:4000").await);
        assert_eq!(reg.actives("chat").await.len(), 1);
    }

    #[tokio::test]
    async fn swap_preserves_slot_order() {
        let reg = Registry::new();
        reg.register("chat", "http://10.0.0.1:4000").await;
        reg.register("chat", "http://10.0.0.2:4000").await;

        reg.swap_active("chat", "http://10.0.0.9:4000", "http://10.0.0.1:4000")
            .await;
        assert_eq!(
            reg.actives("chat").await,
            vec!["http://10.0.0.9:4000", "http://10.0.0.2:4000"]
        );
        // The new address is known even though it never registered.
        assert!(reg.is_known("http://10.0.0.9:4000").await);
    }

    #[tokio::test]
    async fn swap_with_absent_old_addr_is_a_no_op() {
        let reg = Registry::new();
        reg.register("chat", "http://10.0.0.1:4000").await;
        reg.swap_active("chat", "http://10.0.0.9:4000", "http://10.0.0.7:4000")
            .await;
        assert_eq!(reg.actives("chat").await, vec!["http://10.0.0.1:4000"]);
        // A failed swap must not leave the unvouched address in the
        // candidate pool either.
        assert!(!reg.is_known("http://10.0.0.9:4000").await);
        assert_eq!(reg.random_inactive("chat").await, None);
    }

    #[tokio::test]
    async fn replica_lookup_skips_self() {
        let reg = Registry::new();
        reg.register("chat", "http://10.0.0.1:4000").await;
        assert_eq!(reg.replica_of("chat", "http://10.0.0.1:4000").await, None);

        reg.register("chat", "http://10.0.0.2:4000").await;
        assert_eq!(
            reg.replica_of("chat", "http://10.0.0.1:4000").await.as_deref(),
            Some("http://10.0.0.2:4000")
        );
        assert_eq!(reg.replica_of("other", "x").await, None);
    }

    #[tokio::test]
    async fn resolution_picks_the_numeric_neighbor() {
        let reg = Registry::new();
        reg.register("x", "http://10.0.0.5:4000").await;
        reg.register("x", "http://192.168.1.2:4000").await;

        let caller: std::net::IpAddr = "10.0.0.9".parse().unwrap();
        assert_eq!(
            reg.closest(caller, "x").await.as_deref(),
            Some("http://10.0.0.5:4000")
        );
        assert_eq!(reg.closest(caller, "unknown").await, None);
    }

    #[tokio::test]
    async fn eviction_clears_both_tables() {
        let reg = Registry::new();
        reg.register("chat", "http://10.0.0.1:4000").await;
        reg.remove("chat", "http://10.0.0.1:4000").await;
        assert!(reg.actives("chat").await.is_empty());
        assert!(!reg.is_known("http://10.0.0.1:4000").await);
        // The slot is free again.
        assert!(reg.register("chat", "http://10.0.0.5:4000").await);
    }
}

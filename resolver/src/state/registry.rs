//! Order registry
//!
//! `OrderStore` is the seam a durable backend plugs into. The in-memory
//! store keeps two sets: orders still being driven (`active`, including
//! failed orders until the sweep evicts them) and completed orders. Hashes
//! of evicted orders are remembered so they can never be accepted again.
//! Mutations to one order are serialized by the map's entry guard; other
//! orders are untouched.

use super::order::{Order, OrderHash, OrderMutation, OrderStatus};
use crate::error::{ResolverError, ResolverResult};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;

/// Optional filter for listing orders
#[derive(Debug, Clone, Default)]
pub struct OrderFilter {
    pub status: Option<OrderStatus>,
}

/// Order counts by status and by set
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderStats {
    pub total: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelling: usize,
    pub active_set: usize,
    pub completed_set: usize,
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Insert a new order; an order hash is accepted at most once, even
    /// after the order itself has been swept
    async fn insert(&self, order: Order) -> ResolverResult<()>;

    /// Whether the hash was ever accepted, evicted orders included
    async fn contains(&self, order_hash: &OrderHash) -> bool;

    async fn get(&self, order_hash: &OrderHash) -> Option<Order>;

    /// Apply a mutation and return the updated order
    async fn apply(
        &self,
        order_hash: &OrderHash,
        mutation: OrderMutation,
    ) -> ResolverResult<Order>;

    /// Page through orders, newest first. Returns the page and the filtered total.
    async fn list(&self, filter: &OrderFilter, offset: usize, limit: usize) -> (Vec<Order>, usize);

    async fn stats(&self) -> OrderStats;

    /// Evict failed orders that finished before `cutoff`. Their hashes
    /// stay claimed.
    async fn sweep_failed(&self, cutoff: DateTime<Utc>) -> Vec<OrderHash>;
}

/// Volatile order store
#[derive(Default)]
pub struct MemoryOrderStore {
    active: DashMap<OrderHash, Order>,
    completed: DashMap<OrderHash, Order>,
    evicted: DashMap<OrderHash, DateTime<Utc>>,
}

impl MemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OrderStore for MemoryOrderStore {
    async fn insert(&self, order: Order) -> ResolverResult<()> {
        let order_hash = order.order_hash;
        match self.active.entry(order_hash) {
            Entry::Occupied(_) => Err(ResolverError::DuplicateOrder {
                order_hash: order_hash.to_string(),
            }),
            Entry::Vacant(slot) => {
                // Vacant in active while held means any completion move has finished
                if self.completed.contains_key(&order_hash)
                    || self.evicted.contains_key(&order_hash)
                {
                    return Err(ResolverError::DuplicateOrder {
                        order_hash: order_hash.to_string(),
                    });
                }
                slot.insert(order);
                Ok(())
            }
        }
    }

    async fn contains(&self, order_hash: &OrderHash) -> bool {
        self.active.contains_key(order_hash)
            || self.completed.contains_key(order_hash)
            || self.evicted.contains_key(order_hash)
    }

    async fn get(&self, order_hash: &OrderHash) -> Option<Order> {
        if let Some(order) = self.active.get(order_hash) {
            return Some(order.clone());
        }
        self.completed.get(order_hash).map(|o| o.clone())
    }

    async fn apply(
        &self,
        order_hash: &OrderHash,
        mutation: OrderMutation,
    ) -> ResolverResult<Order> {
        let now = Utc::now();

        let updated = match self.active.get_mut(order_hash) {
            Some(mut entry) => {
                entry.apply(mutation, now)?;
                entry.clone()
            }
            None => {
                return match self.completed.get(order_hash) {
                    Some(order) => Err(ResolverError::InvalidStateTransition {
                        from: order.status.as_str().to_string(),
                        to: "updated".to_string(),
                    }),
                    None => Err(ResolverError::OrderNotFound {
                        order_hash: order_hash.to_string(),
                    }),
                };
            }
        };

        if updated.status == OrderStatus::Completed {
            // Visible in at least one set throughout the move
            self.completed.insert(*order_hash, updated.clone());
            self.active.remove(order_hash);
            debug!("Order {} moved to completed set", order_hash);
        }

        Ok(updated)
    }

    async fn list(&self, filter: &OrderFilter, offset: usize, limit: usize) -> (Vec<Order>, usize) {
        let mut orders: Vec<Order> = self
            .active
            .iter()
            .chain(self.completed.iter())
            .filter(|o| filter.status.map_or(true, |s| o.status == s))
            .map(|o| o.clone())
            .collect();

        orders.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.order_hash.cmp(&b.order_hash))
        });
        // A completion move in flight can surface the same order twice
        orders.dedup_by_key(|o| o.order_hash);

        let total = orders.len();
        let page = orders.into_iter().skip(offset).take(limit).collect();
        (page, total)
    }

    async fn stats(&self) -> OrderStats {
        let mut stats = OrderStats {
            active_set: self.active.len(),
            completed_set: self.completed.len(),
            ..Default::default()
        };

        for order in self.active.iter().chain(self.completed.iter()) {
            stats.total += 1;
            match order.status {
                OrderStatus::Processing => stats.processing += 1,
                OrderStatus::Completed => stats.completed += 1,
                OrderStatus::Failed => stats.failed += 1,
                OrderStatus::Cancelling => stats.cancelling += 1,
            }
        }

        stats
    }

    async fn sweep_failed(&self, cutoff: DateTime<Utc>) -> Vec<OrderHash> {
        let mut evicted = Vec::new();
        let now = Utc::now();
        self.active.retain(|hash, order| {
            let finished_at = order.completed_at.unwrap_or(order.created_at);
            let stale = order.status == OrderStatus::Failed && finished_at < cutoff;
            if stale {
                // Claimed before the shard lock drops so no insert can slip in
                self.evicted.insert(*hash, now);
                evicted.push(*hash);
            }
            !stale
        });
        if !evicted.is_empty() {
            debug!("Evicted {} failed orders, {} hashes retired", evicted.len(), self.evicted.len());
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::order::tests::sample_order;
    use chrono::Duration;

    #[tokio::test]
    async fn test_duplicate_insert_rejected() {
        let store = MemoryOrderStore::new();
        store.insert(sample_order(1)).await.unwrap();
        let err = store.insert(sample_order(1)).await.unwrap_err();
        assert!(matches!(err, ResolverError::DuplicateOrder { .. }));
        assert_eq!(store.stats().await.total, 1);
    }

    #[tokio::test]
    async fn test_completion_moves_order() {
        let store = MemoryOrderStore::new();
        let order = sample_order(2);
        let hash = order.order_hash;
        store.insert(order).await.unwrap();

        store.apply(&hash, OrderMutation::Completed).await.unwrap();

        let stats = store.stats().await;
        assert_eq!(stats.active_set, 0);
        assert_eq!(stats.completed_set, 1);
        assert_eq!(store.get(&hash).await.unwrap().status, OrderStatus::Completed);

        // Still a duplicate once completed
        assert!(store.insert(sample_order(2)).await.is_err());
        // And still terminal
        assert!(matches!(
            store
                .apply(&hash, OrderMutation::Failed { error: "x".into() })
                .await,
            Err(ResolverError::InvalidStateTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_apply_unknown_order() {
        let store = MemoryOrderStore::new();
        let err = store
            .apply(&OrderHash([9u8; 32]), OrderMutation::Cancelling)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolverError::OrderNotFound { .. }));
    }

    #[tokio::test]
    async fn test_list_filter_and_pagination() {
        let store = MemoryOrderStore::new();
        for i in 0..5u8 {
            let mut order = sample_order(i);
            order.created_at = Utc::now() + Duration::seconds(i as i64);
            store.insert(order).await.unwrap();
        }
        store
            .apply(&OrderHash([0u8; 32]), OrderMutation::Failed { error: "boom".into() })
            .await
            .unwrap();

        let (page, total) = store.list(&OrderFilter::default(), 0, 2).await;
        assert_eq!(total, 5);
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].order_hash, OrderHash([4u8; 32]));

        let failed = OrderFilter {
            status: Some(OrderStatus::Failed),
        };
        let (page, total) = store.list(&failed, 0, 10).await;
        assert_eq!(total, 1);
        assert_eq!(page[0].error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_sweep_evicts_only_stale_failed() {
        let store = MemoryOrderStore::new();
        store.insert(sample_order(1)).await.unwrap();
        store.insert(sample_order(2)).await.unwrap();
        store
            .apply(&OrderHash([1u8; 32]), OrderMutation::Failed { error: "x".into() })
            .await
            .unwrap();

        // Nothing is older than an hour yet
        let evicted = store.sweep_failed(Utc::now() - Duration::hours(1)).await;
        assert!(evicted.is_empty());

        let evicted = store.sweep_failed(Utc::now() + Duration::seconds(1)).await;
        assert_eq!(evicted, vec![OrderHash([1u8; 32])]);
        assert!(store.contains(&OrderHash([2u8; 32])).await);
        assert!(store.get(&OrderHash([1u8; 32])).await.is_none());
    }

    #[tokio::test]
    async fn test_swept_hash_cannot_be_reinserted() {
        let store = MemoryOrderStore::new();
        store.insert(sample_order(3)).await.unwrap();
        store
            .apply(&OrderHash([3u8; 32]), OrderMutation::Failed { error: "x".into() })
            .await
            .unwrap();
        assert_eq!(store.sweep_failed(Utc::now() + Duration::seconds(1)).await.len(), 1);

        assert!(store.contains(&OrderHash([3u8; 32])).await);
        let err = store.insert(sample_order(3)).await.unwrap_err();
        assert!(matches!(err, ResolverError::DuplicateOrder { .. }));
        assert!(store.get(&OrderHash([3u8; 32])).await.is_none());
        assert_eq!(store.stats().await.total, 0);

        // A second sweep has nothing left to evict
        assert!(store.sweep_failed(Utc::now() + Duration::seconds(1)).await.is_empty());
    }
}

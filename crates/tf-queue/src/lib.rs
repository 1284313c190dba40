// SPDX-License-Identifier: MIT OR Apache-2.0
//! In-memory transformation order queue.
//!
//! Tracks every order the server knows about, indexed both by id and by the
//! submitting user, and provides the admission (quota), filtering (OData
//! `$filter`), and eviction (keeping-period) operations the HTTP layer and
//! job runner both need. `orders`, `by_user`, and `by_order` are kept as
//! mutual inverses so lookups by either key stay O(1).
#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use tf_core::{OrderStatus, TransformationOrder};
use tf_error::{ErrorCode, TfError};
use tf_odata::FilterClause;
use uuid::Uuid;
use tracing::debug;

/// The in-memory order table.
///
/// `by_user` and `by_order` are always mutual inverses: `order_id` is in
/// `by_user[user_id]` if and only if `by_order[order_id] == user_id`.
#[derive(Debug, Default)]
pub struct Queue {
    orders: BTreeMap<Uuid, TransformationOrder>,
    by_user: BTreeMap<String, BTreeSet<Uuid>>,
    by_order: BTreeMap<Uuid, String>,
}

impl Queue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of uncompleted (`Queued` or `InProgress`) orders for `user_id`.
    pub fn count_uncompleted(&self, user_id: &str) -> usize {
        self.by_user
            .get(user_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.orders.get(id))
                    .filter(|o| !o.status.is_terminal())
                    .count()
            })
            .unwrap_or(0)
    }

    /// Admit a new order for `user_id` if doing so would not exceed `quota`
    /// uncompleted orders, inserting it and returning `Ok(())` on success.
    pub fn admit(
        &mut self,
        order: TransformationOrder,
        quota: usize,
    ) -> Result<(), TfError> {
        let user_id = order.user_id.clone();
        if self.count_uncompleted(&user_id) >= quota {
            return Err(TfError::new(
                ErrorCode::UncompletedOrderQuotaExceeded,
                format!("user '{user_id}' already has {quota} uncompleted orders"),
            )
            .with_context("user_id", user_id)
            .with_context("quota", quota));
        }
        self.insert(order);
        Ok(())
    }

    /// Insert or overwrite an order, without any quota check. Used for
    /// re-insertion after a status update.
    pub fn insert(&mut self, order: TransformationOrder) {
        let id = order.id;
        let user_id = order.user_id.clone();
        self.by_user.entry(user_id.clone()).or_default().insert(id);
        self.by_order.insert(id, user_id);
        self.orders.insert(id, order);
    }

    /// Look up an order by id.
    pub fn get(&self, id: Uuid) -> Option<&TransformationOrder> {
        self.orders.get(&id)
    }

    /// Look up an order by id, as a [`TfError`]-bearing `Result`.
    pub fn require(&self, id: Uuid) -> Result<&TransformationOrder, TfError> {
        self.get(id).ok_or_else(|| {
            TfError::new(ErrorCode::OrderNotFound, format!("no order with id {id}"))
                .with_context("order_id", id.to_string())
        })
    }

    /// Mutably look up an order by id.
    pub fn get_mut(&mut self, id: Uuid) -> Option<&mut TransformationOrder> {
        self.orders.get_mut(&id)
    }

    /// Remove an order entirely, keeping `by_user`/`by_order` consistent.
    pub fn remove(&mut self, id: Uuid) -> Option<TransformationOrder> {
        let order = self.orders.remove(&id)?;
        if let Some(user_id) = self.by_order.remove(&id)
            && let Some(ids) = self.by_user.get_mut(&user_id)
        {
            ids.remove(&id);
            if ids.is_empty() {
                self.by_user.remove(&user_id);
            }
        }
        Some(order)
    }

    /// Evict every terminal order whose `CompletedDate` is older than
    /// `keeping_period` relative to `now`, returning the ids removed.
    pub fn evict_old(&mut self, keeping_period: chrono::Duration, now: DateTime<Utc>) -> Vec<Uuid> {
        let cutoff = now - keeping_period;
        let stale: Vec<Uuid> = self
            .orders
            .values()
            .filter(|o| o.status.is_terminal())
            .filter(|o| o.completed_date.is_some_and(|d| d < cutoff))
            .map(|o| o.id)
            .collect();

        for id in &stale {
            self.remove(*id);
            debug!(order_id = %id, "evicted stale order");
        }
        stale
    }

    /// List orders, filtered by an OData `$filter` clause list and
    /// optionally scoped to one user.
    ///
    /// When `filter_by_user` is `true`, only `user_id`'s own orders are
    /// considered; when `false`, every order is considered regardless of
    /// owner (an admin-style view).
    pub fn list(
        &self,
        clauses: &[FilterClause],
        user_id: &str,
        filter_by_user: bool,
    ) -> Vec<&TransformationOrder> {
        let candidates: Box<dyn Iterator<Item = &TransformationOrder>> = if filter_by_user {
            Box::new(
                self.by_user
                    .get(user_id)
                    .into_iter()
                    .flatten()
                    .filter_map(|id| self.orders.get(id)),
            )
        } else {
            Box::new(self.orders.values())
        };

        candidates
            .filter(|order| {
                let value = serde_json::to_value(order).unwrap_or(serde_json::Value::Null);
                tf_odata::matches_all(&value, clauses)
            })
            .collect()
    }

    /// Count orders matching the same criteria as [`Queue::list`].
    pub fn count(&self, clauses: &[FilterClause], user_id: &str, filter_by_user: bool) -> usize {
        self.list(clauses, user_id, filter_by_user).len()
    }

    /// Is `order_id` owned by `user_id`?
    pub fn is_owned_by(&self, order_id: Uuid, user_id: &str) -> bool {
        self.by_order.get(&order_id).is_some_and(|owner| owner == user_id)
    }

    /// Total number of orders tracked, regardless of status.
    pub fn len(&self) -> usize {
        self.orders.len()
    }

    /// `true` if the queue tracks no orders.
    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    /// Verify the `by_user`/`by_order` mutual-inverse invariant holds.
    /// Exposed for tests and health checks; a production queue should never
    /// violate it given the mutation methods above only ever go through
    /// [`Queue::insert`]/[`Queue::remove`].
    pub fn invariant_holds(&self) -> bool {
        let forward_ok = self.by_user.iter().all(|(user, ids)| {
            ids.iter().all(|id| self.by_order.get(id) == Some(user))
        });
        let backward_ok = self
            .by_order
            .iter()
            .all(|(id, user)| self.by_user.get(user).is_some_and(|ids| ids.contains(id)));
        forward_ok && backward_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tf_core::ProductReference;

    fn sample_order(user: &str) -> TransformationOrder {
        TransformationOrder::new(
            Uuid::new_v4(),
            user,
            vec!["standard".into()],
            "wf",
            ProductReference {
                reference: "S2A_MSIL1C".into(),
                data_source_name: None,
                content_date: None,
            },
            BTreeMap::new(),
            Utc::now(),
        )
    }

    #[test]
    fn admit_respects_quota() {
        let mut queue = Queue::new();
        queue.admit(sample_order("alice"), 2).unwrap();
        queue.admit(sample_order("alice"), 2).unwrap();
        let err = queue.admit(sample_order("alice"), 2).unwrap_err();
        assert_eq!(err.code, ErrorCode::UncompletedOrderQuotaExceeded);
    }

    #[test]
    fn quota_is_per_user() {
        let mut queue = Queue::new();
        queue.admit(sample_order("alice"), 1).unwrap();
        // bob has his own quota, unaffected by alice's orders.
        queue.admit(sample_order("bob"), 1).unwrap();
        assert_eq!(queue.count_uncompleted("alice"), 1);
        assert_eq!(queue.count_uncompleted("bob"), 1);
    }

    #[test]
    fn completed_orders_do_not_count_against_quota() {
        let mut queue = Queue::new();
        let mut order = sample_order("alice");
        let id = order.id;
        queue.admit(order.clone(), 1).unwrap();
        order.mark_completed(Utc::now(), "out".into(), "https://x/");
        queue.get_mut(id).unwrap().mark_completed(Utc::now(), "out".into(), "https://x/");
        assert_eq!(queue.count_uncompleted("alice"), 0);
        queue.admit(sample_order("alice"), 1).unwrap();
    }

    #[test]
    fn by_user_by_order_invariant_holds_after_mutations() {
        let mut queue = Queue::new();
        let o1 = sample_order("alice");
        let o2 = sample_order("alice");
        let id1 = o1.id;
        queue.admit(o1, 5).unwrap();
        queue.admit(o2, 5).unwrap();
        assert!(queue.invariant_holds());
        queue.remove(id1);
        assert!(queue.invariant_holds());
    }

    #[test]
    fn evict_old_removes_only_stale_terminal_orders() {
        let mut queue = Queue::new();
        let mut old_order = sample_order("alice");
        old_order.mark_completed(Utc::now() - chrono::Duration::days(30), "out".into(), "https://x/");
        let old_id = old_order.id;
        queue.insert(old_order);

        let mut recent_order = sample_order("alice");
        recent_order.mark_completed(Utc::now(), "out".into(), "https://x/");
        let recent_id = recent_order.id;
        queue.insert(recent_order);

        let still_running = sample_order("alice");
        let running_id = still_running.id;
        queue.insert(still_running);

        let evicted = queue.evict_old(chrono::Duration::days(14), Utc::now());
        assert_eq!(evicted, vec![old_id]);
        assert!(queue.get(old_id).is_none());
        assert!(queue.get(recent_id).is_some());
        assert!(queue.get(running_id).is_some());
    }

    #[test]
    fn list_filters_by_user_when_requested() {
        let mut queue = Queue::new();
        queue.admit(sample_order("alice"), 5).unwrap();
        queue.admit(sample_order("bob"), 5).unwrap();
        assert_eq!(queue.list(&[], "alice", true).len(), 1);
        assert_eq!(queue.list(&[], "alice", false).len(), 2);
    }

    #[test]
    fn is_owned_by_respects_actual_owner() {
        let mut queue = Queue::new();
        let order = sample_order("alice");
        let id = order.id;
        queue.admit(order, 5).unwrap();
        assert!(queue.is_owned_by(id, "alice"));
        assert!(!queue.is_owned_by(id, "bob"));
    }

    #[test]
    fn require_missing_order_is_not_found() {
        let queue = Queue::new();
        let err = queue.require(Uuid::new_v4()).unwrap_err();
        assert_eq!(err.code, ErrorCode::OrderNotFound);
    }

    #[test]
    fn filter_by_status_excludes_non_matching() {
        let mut queue = Queue::new();
        let mut o = sample_order("alice");
        let id = o.id;
        o.mark_failed(Utc::now());
        queue.insert(o);
        let clauses = tf_odata::parse_filter("Status eq 'completed'").unwrap();
        assert!(queue.list(&clauses, "alice", true).is_empty());
        let clauses = tf_odata::parse_filter("Status eq 'failed'").unwrap();
        let results = queue.list(&clauses, "alice", true);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, id);
    }
}

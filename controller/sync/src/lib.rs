//! Keeps derived redirect rules in sync with the platform's NICs.
//!
//! NIC state flows from the [`informer`] producers into the [`NicCache`],
//! which enqueues every NIC that may have changed. Rule changes observed by
//! [`watch_rules`] enqueue the NIC that owns the rule. Workers pull NIC ids
//! from the [`WorkQueue`] and converge the NIC's rules through a
//! [`RuleStore`].

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod cache;
mod drift;
pub mod informer;
mod metrics;
mod queue;
pub mod reconcile;
mod store;

#[cfg(test)]
mod tests;

pub use self::{
    cache::{NicCache, NicEvent},
    drift::watch_rules,
    metrics::{EventSource, Metrics, ReconcileResult, WriteOp},
    queue::{Backoff, WorkQueue},
    reconcile::{run_workers, Reconciler},
    store::{KubeRuleStore, RuleStore, StoreError},
};

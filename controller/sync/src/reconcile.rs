use crate::{
    cache::NicCache,
    metrics::{Metrics, ReconcileResult, WriteOp},
    queue::WorkQueue,
    store::{RuleStore, StoreError},
};
use std::sync::Arc;
use tracing::{debug, info, info_span, trace, warn, Instrument};
use trafficredirect_controller_core::{desired_rules, DesiredRules, Direction, RuleKey};
use trafficredirect_controller_k8s_api::{Rule, RuleSpec};

/// The write needed to converge a single rule.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Action {
    None,
    Create,
    Update,
    Delete,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to get rule {name}: {source}")]
    Get {
        name: String,
        #[source]
        source: StoreError,
    },

    #[error("failed to {op} rule {name}: {source}")]
    Write {
        name: String,
        op: WriteOp,
        #[source]
        source: StoreError,
    },
}

/// Converges the rules derived from a NIC with the NIC's cached state.
pub struct Reconciler<S> {
    cache: NicCache,
    store: S,
    metrics: Metrics,
}

/// Determines how to converge a rule with its desired spec.
///
/// Specs are compared by value so that unchanged rules are never written.
pub fn plan(desired: Option<&RuleSpec>, actual: Option<&Rule>) -> Action {
    match (desired, actual) {
        (None, None) => Action::None,
        (None, Some(_)) => Action::Delete,
        (Some(_), None) => Action::Create,
        (Some(desired), Some(actual)) if *desired == actual.spec => Action::None,
        (Some(_), Some(_)) => Action::Update,
    }
}

// === impl Reconciler ===

impl<S: RuleStore> Reconciler<S> {
    pub fn new(cache: NicCache, store: S, metrics: Metrics) -> Self {
        Self {
            cache,
            store,
            metrics,
        }
    }

    /// Converges both rules derived from a NIC.
    ///
    /// A NIC that isn't cached or doesn't have DPI enabled should have no
    /// rules. The first failure aborts reconciliation; every step is
    /// idempotent, so the NIC may simply be reconciled again.
    pub async fn reconcile(&self, nic_id: &str) -> Result<(), Error> {
        let desired = self
            .cache
            .get(nic_id)
            .filter(|nic| nic.dpi_enabled)
            .map(|nic| desired_rules(&nic));
        if desired.is_none() {
            trace!("NIC has no rules");
        }

        for direction in Direction::ALL {
            self.reconcile_rule(nic_id, direction, desired.as_ref()).await?;
        }
        Ok(())
    }

    async fn reconcile_rule(
        &self,
        nic_id: &str,
        direction: Direction,
        desired: Option<&DesiredRules>,
    ) -> Result<(), Error> {
        let name = RuleKey::new(nic_id, direction).name();
        let actual = self.store.get(&name).await.map_err(|source| Error::Get {
            name: name.clone(),
            source,
        })?;

        let spec = desired.map(|rules| rules.get(direction));
        match plan(spec, actual.as_ref()) {
            Action::None => {
                trace!(%name, "Rule is up to date");
                Ok(())
            }

            Action::Create => {
                let Some(rules) = desired else {
                    return Ok(());
                };
                let rule = rules.to_rule(nic_id, direction);
                self.write(&name, WriteOp::Create, self.store.create(&rule).await)
            }

            Action::Update => {
                let (Some(spec), Some(mut rule)) = (spec, actual) else {
                    return Ok(());
                };
                // Only the spec is replaced so that the record's metadata,
                // including its resource version, is preserved.
                rule.spec = spec.clone();
                self.write(&name, WriteOp::Update, self.store.replace(&rule).await)
            }

            Action::Delete => match self.store.delete(&name).await {
                Err(StoreError::NotFound) => {
                    debug!(%name, "Rule already deleted");
                    Ok(())
                }
                res => self.write(&name, WriteOp::Delete, res),
            },
        }
    }

    fn write(&self, name: &str, op: WriteOp, res: Result<(), StoreError>) -> Result<(), Error> {
        match res {
            Ok(()) => {
                self.metrics.rule_written(op);
                info!(%name, op = op.as_str(), "Wrote rule");
                Ok(())
            }
            Err(source) => Err(Error::Write {
                name: name.to_string(),
                op,
                source,
            }),
        }
    }
}

/// Reconciles NICs from the queue with `workers` concurrent workers until the
/// queue is shut down.
///
/// Failed NICs are requeued with backoff; successful NICs have their backoff
/// reset. The queue never hands the same NIC to two workers at once.
pub async fn run_workers<S>(
    reconciler: Arc<Reconciler<S>>,
    queue: WorkQueue<String>,
    workers: usize,
) where
    S: RuleStore + 'static,
{
    let tasks = (0..workers.max(1))
        .map(|id| {
            let reconciler = reconciler.clone();
            let queue = queue.clone();
            tokio::spawn(process(reconciler, queue).instrument(info_span!("worker", id)))
        })
        .collect::<Vec<_>>();
    for task in futures::future::join_all(tasks).await {
        if let Err(error) = task {
            warn!(%error, "Worker failed");
        }
    }
    debug!("Workers stopped");
}

async fn process<S: RuleStore>(reconciler: Arc<Reconciler<S>>, queue: WorkQueue<String>) {
    while let Some(nic_id) = queue.get().await {
        let res = reconciler
            .reconcile(&nic_id)
            .instrument(info_span!("reconcile", vnic = %nic_id))
            .await;
        match res {
            Ok(()) => {
                reconciler.metrics.reconciled(ReconcileResult::Ok);
                queue.forget(&nic_id);
            }
            Err(error) => {
                reconciler.metrics.reconciled(ReconcileResult::Error);
                reconciler.metrics.retried();
                warn!(
                    vnic = %nic_id,
                    retries = queue.num_requeues(&nic_id),
                    %error,
                    "Failed to reconcile NIC; requeueing",
                );
                queue.add_rate_limited(nic_id.clone());
            }
        }
        queue.done(&nic_id);
    }
}

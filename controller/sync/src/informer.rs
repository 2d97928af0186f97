//! Keeps the NIC cache current.
//!
//! Two producers feed a single indexing task: a periodic full resync that
//! lists every NIC and a change feed that fetches each NIC it is notified
//! about. The indexing task applies their events to the cache and enqueues
//! every NIC that may have changed.

use crate::{
    cache::{NicCache, NicEvent},
    metrics::{EventSource, Metrics},
    queue::{Backoff, WorkQueue},
};
use futures::future;
use tokio::{sync::mpsc, time};
use tracing::{debug, info, trace, warn};
use trafficredirect_controller_core::{NicChange, NicSource};

/// How long to wait before retrying a failed resync.
const RESYNC_RETRY: time::Duration = time::Duration::from_secs(1);

/// Lists all NICs every `period`, publishing each listing as a restart.
///
/// Failed listings are retried promptly so that the cache's initial sync is
/// not held up by a transient failure. Returns once the receiver is dropped.
pub async fn resync<S: NicSource>(source: S, period: time::Duration, tx: mpsc::Sender<NicEvent>) {
    loop {
        let delay = match source.list_nics().await {
            Ok(nics) => {
                info!(nics = nics.len(), "Resynced");
                if tx.send(NicEvent::Restarted(nics)).await.is_err() {
                    return;
                }
                period
            }
            Err(error) => {
                warn!(%error, "Failed to list NICs");
                RESYNC_RETRY
            }
        };

        tokio::select! {
            _ = tx.closed() => return,
            _ = time::sleep(delay) => {}
        }
    }
}

/// Resolves change notifications into NIC events.
///
/// Notifications only identify a NIC, so every notification is resolved by
/// querying the NIC's current state; a NIC the platform no longer knows is
/// deleted. Lookups are deduplicated by NIC, and failed lookups are retried
/// with backoff until they succeed. Returns once the event receiver is
/// dropped.
pub async fn feed<S: NicSource>(
    source: S,
    mut changes: mpsc::Receiver<NicChange>,
    tx: mpsc::Sender<NicEvent>,
) {
    let lookups = WorkQueue::new(Backoff::default());

    let receive = {
        let lookups = lookups.clone();
        async move {
            while let Some(NicChange { action, id }) = changes.recv().await {
                trace!(%id, ?action, "NIC changed");
                lookups.add(id);
            }
            // Lookups that are already pending are still resolved.
            debug!("Change notifications closed");
            future::pending::<()>().await
        }
    };

    tokio::select! {
        _ = resolve(source, lookups.clone(), tx) => {}
        _ = receive => {}
    }
    lookups.shut_down();
}

async fn resolve<S: NicSource>(
    source: S,
    lookups: WorkQueue<String>,
    tx: mpsc::Sender<NicEvent>,
) {
    loop {
        let id = tokio::select! {
            _ = tx.closed() => return,
            id = lookups.get() => match id {
                Some(id) => id,
                None => return,
            },
        };

        let event = match source.get_nic(&id).await {
            Ok(Some(nic)) => NicEvent::Applied(nic),
            Ok(None) => {
                debug!(%id, "NIC no longer exists");
                NicEvent::Deleted(id.clone())
            }
            Err(error) => {
                warn!(
                    %id,
                    retries = lookups.num_requeues(&id),
                    %error,
                    "Failed to fetch NIC; retrying",
                );
                lookups.add_rate_limited(id.clone());
                lookups.done(&id);
                continue;
            }
        };

        lookups.forget(&id);
        let sent = tx.send(event).await;
        lookups.done(&id);
        if sent.is_err() {
            return;
        }
    }
}

/// Applies NIC events to the cache, enqueueing every affected NIC.
///
/// This is the cache's only writer, so writes are applied in the order they
/// were produced. Returns once all producers have stopped.
pub async fn index(
    cache: NicCache,
    mut events: mpsc::Receiver<NicEvent>,
    queue: WorkQueue<String>,
    metrics: Metrics,
) {
    while let Some(event) = events.recv().await {
        metrics.nic_event(if event.is_resync() {
            EventSource::Resync
        } else {
            EventSource::Feed
        });
        for id in cache.apply(event) {
            queue.add(id);
        }
    }
}

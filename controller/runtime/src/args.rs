use crate::{
    admission::Admission,
    core::{CONTROLLER_NAME, RULE_NAMESPACE},
    duration::Period,
    k8s::Rule,
    lease,
    sync::{self, informer, Backoff, KubeRuleStore, Metrics, NicCache, Reconciler, WorkQueue},
    platform,
};
use anyhow::{bail, Context, Result};
use clap::Parser;
use futures::{future, prelude::*};
use kube::runtime::watcher;
use prometheus_client::registry::Registry;
use std::{sync::Arc, time::Duration};
use tokio::{sync::mpsc, time};
use tracing::{info, info_span, Instrument};

/// The number of NIC events buffered between the producers and the cache.
const NIC_EVENTS_BUFFER: usize = 1024;

/// The number of change notifications buffered ahead of NIC lookups.
const NIC_CHANGES_BUFFER: usize = 256;

#[derive(Debug, Parser)]
#[clap(
    name = "trafficredirect",
    about = "Maintains traffic redirect rules for DPI-enabled NICs"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "trafficredirect=info,warn",
        env = "TRAFFICREDIRECT_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    server: kubert::ServerArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Disables the admission controller server.
    #[clap(long)]
    admission_controller_disabled: bool,

    /// The Tower API address, as `host[:port]`.
    #[clap(long, env = "TOWER_ADDR")]
    tower_addr: String,

    #[clap(long, env = "TOWER_USERNAME")]
    tower_username: String,

    #[clap(long, env = "TOWER_PASSWORD", hide_env_values = true)]
    tower_password: String,

    #[clap(long, env = "TOWER_USERSOURCE", default_value = "LOCAL")]
    tower_user_source: String,

    /// Basic auth username for Tower's change feed endpoint.
    #[clap(long, env = "TOWER_API_USERNAME", requires = "tower_api_password")]
    tower_api_username: Option<String>,

    #[clap(long, env = "TOWER_API_PASSWORD", hide_env_values = true)]
    tower_api_password: Option<String>,

    /// Skips TLS certificate verification for Tower queries.
    #[clap(long)]
    tower_allow_insecure: bool,

    /// How often all NICs are listed from Tower.
    #[clap(long, default_value = "10h")]
    tower_resync_period: Period,

    /// The number of NICs reconciled concurrently.
    #[clap(long, default_value = "4")]
    workers: usize,

    /// How long to wait for the initial NIC listing before giving up.
    #[clap(long, default_value = "2m")]
    cache_sync_timeout: Period,

    #[clap(long)]
    leader_election_disabled: bool,

    #[clap(long, default_value = "kube-system")]
    leader_election_namespace: String,

    #[clap(long, default_value = "tr-controller.leader-election.everoute.io")]
    leader_election_name: String,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            server,
            admission_controller_disabled,
            tower_addr,
            tower_username,
            tower_password,
            tower_user_source,
            tower_api_username,
            tower_api_password,
            tower_allow_insecure,
            tower_resync_period,
            workers,
            cache_sync_timeout,
            leader_election_disabled,
            leader_election_namespace,
            leader_election_name,
        } = self;

        let server = if admission_controller_disabled {
            None
        } else {
            Some(server)
        };

        let mut prom = <Registry>::default();
        let metrics = Metrics::register(prom.sub_registry_with_prefix("trafficredirect"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .with_optional_server(server)
            .build()
            .await?;

        let platform = platform::Client::new(
            tower_addr,
            platform::Credentials {
                username: tower_username,
                password: tower_password,
                source: tower_user_source,
            },
            tower_allow_insecure,
        )?;
        let mut feed = platform::ChangeFeed::new(platform.clone());
        if let (Some(username), Some(password)) = (tower_api_username, tower_api_password) {
            feed = feed.with_api_auth(username, password);
        }

        let cache = NicCache::default();
        let queue = WorkQueue::new(Backoff::default());

        // Spawn the NIC producers. Both send to the indexing task, which is
        // the only writer to the cache.
        let (events_tx, events_rx) = mpsc::channel(NIC_EVENTS_BUFFER);
        let (changes_tx, changes_rx) = mpsc::channel(NIC_CHANGES_BUFFER);
        tokio::spawn(
            informer::resync(platform.clone(), tower_resync_period.into(), events_tx.clone())
                .instrument(info_span!("nics")),
        );
        tokio::spawn(feed.run(changes_tx).instrument(info_span!("feed")));
        tokio::spawn(
            informer::feed(platform, changes_rx, events_tx).instrument(info_span!("nic_changes")),
        );
        tokio::spawn(
            informer::index(cache.clone(), events_rx, queue.clone(), metrics.clone())
                .instrument(info_span!("index")),
        );

        // Heal rules that are changed or removed out from under us.
        let rules = runtime.watch_all::<Rule>(watcher::Config::default());
        tokio::spawn(sync::watch_rules(rules, queue.clone()).instrument(info_span!("rules")));

        let claims = if leader_election_disabled {
            None
        } else {
            let hostname = std::env::var("HOSTNAME")
                .context("failed to fetch `HOSTNAME` environment variable")?;
            let claims = lease::init(
                &runtime,
                &leader_election_namespace,
                &leader_election_name,
                &hostname,
            )
            .await?;
            Some((claims, hostname))
        };

        let store = KubeRuleStore::new(runtime.client(), CONTROLLER_NAME);
        let reconciler = Arc::new(Reconciler::new(cache.clone(), store, metrics));
        let controller = tokio::spawn(
            controller(
                reconciler,
                cache,
                queue,
                workers,
                cache_sync_timeout.into(),
                claims,
                runtime.shutdown_handle(),
            )
            .instrument(info_span!("controller")),
        );

        let runtime = runtime.spawn_server(Admission::new);

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        tokio::select! {
            res = runtime.run() => {
                if res.is_err() {
                    bail!("Aborted");
                }
            }
            res = controller => {
                res??;
            }
        }

        Ok(())
    }
}

/// Runs reconciliation workers once this replica leads and the NIC cache has
/// synced, until shutdown.
async fn controller<S>(
    reconciler: Arc<Reconciler<S>>,
    cache: NicCache,
    queue: WorkQueue<String>,
    workers: usize,
    cache_sync_timeout: Duration,
    claims: Option<(lease::Claims, String)>,
    drain: drain::Watch,
) -> Result<()>
where
    S: sync::RuleStore + 'static,
{
    let ready = async {
        let lost = match claims {
            Some((mut claims, hostname)) => {
                lease::acquired(&mut claims, &hostname).await?;
                info!(%hostname, "Acquired leadership");
                lease::lost(claims, hostname).boxed()
            }
            None => future::pending::<()>().boxed(),
        };

        if time::timeout(cache_sync_timeout, cache.synced())
            .await
            .is_err()
        {
            bail!("timed out waiting for the NIC cache to sync");
        }
        Ok::<_, anyhow::Error>(lost)
    };
    let lost = tokio::select! {
        res = ready => res?,
        _ = drain.clone().signaled() => return Ok(()),
    };
    info!(nics = cache.len(), namespace = RULE_NAMESPACE, "Starting workers");

    let workers = sync::run_workers(reconciler, queue.clone(), workers);
    tokio::pin!(workers);
    tokio::select! {
        _ = &mut workers => Ok(()),
        _ = lost => {
            queue.shut_down();
            bail!("lost leadership")
        }
        release = drain.signaled() => {
            queue.shut_down();
            release.release_after(workers).await;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::{NicEvent, RuleStore, StoreError};
    use tokio::sync::watch;

    /// A rule store with no rules whose reads block until the gate opens.
    struct GatedStore {
        gets: mpsc::UnboundedSender<String>,
        open: watch::Receiver<bool>,
    }

    #[async_trait::async_trait]
    impl RuleStore for GatedStore {
        async fn get(&self, name: &str) -> Result<Option<Rule>, StoreError> {
            let _ = self.gets.send(name.to_string());
            let mut open = self.open.clone();
            let _ = open.wait_for(|open| *open).await;
            Ok(None)
        }

        async fn create(&self, _: &Rule) -> Result<(), StoreError> {
            Ok(())
        }

        async fn replace(&self, _: &Rule) -> Result<(), StoreError> {
            Ok(())
        }

        async fn delete(&self, _: &str) -> Result<(), StoreError> {
            Ok(())
        }
    }

    fn mk_store(open: bool) -> (GatedStore, mpsc::UnboundedReceiver<String>, watch::Sender<bool>) {
        let (gets, gets_rx) = mpsc::unbounded_channel();
        let (open_tx, open) = watch::channel(open);
        (GatedStore { gets, open }, gets_rx, open_tx)
    }

    #[test]
    fn tls_verification_is_on_by_default() {
        let args = Args::try_parse_from([
            "trafficredirect",
            "--tower-addr=tower.example.com",
            "--tower-username=admin",
            "--tower-password=secret",
        ])
        .expect("args must parse");
        assert!(!args.tower_allow_insecure);
        assert_eq!(
            Duration::from(args.tower_resync_period),
            Duration::from_secs(10 * 60 * 60)
        );
        assert_eq!(Duration::from(args.cache_sync_timeout), Duration::from_secs(120));
        assert_eq!(args.workers, 4);

        let args = Args::try_parse_from([
            "trafficredirect",
            "--tower-addr=tower.example.com",
            "--tower-username=admin",
            "--tower-password=secret",
            "--tower-allow-insecure",
        ])
        .expect("args must parse");
        assert!(args.tower_allow_insecure);
    }

    #[tokio::test(start_paused = true)]
    async fn fails_if_cache_never_syncs() {
        let (_signal, drain) = drain::channel();
        let (store, _gets, _open) = mk_store(true);
        let cache = NicCache::default();
        let queue = WorkQueue::new(Backoff::default());
        queue.add("vnic1".to_string());
        let reconciler = Arc::new(Reconciler::new(cache.clone(), store, Metrics::default()));

        let start = time::Instant::now();
        let error = controller(
            reconciler,
            cache,
            queue.clone(),
            2,
            Duration::from_secs(120),
            None,
            drain,
        )
        .await
        .expect_err("controller must not start without a synced cache");
        assert_eq!(
            error.to_string(),
            "timed out waiting for the NIC cache to sync"
        );
        assert!(start.elapsed() >= Duration::from_secs(120));

        // Nothing was handed to a worker.
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_finishes_in_flight_work() {
        let (signal, drain) = drain::channel();
        let (store, mut gets, open) = mk_store(false);
        let cache = NicCache::default();
        cache.apply(NicEvent::Restarted(vec![]));
        let queue = WorkQueue::new(Backoff::default());
        queue.add("vnic1".to_string());
        let reconciler = Arc::new(Reconciler::new(cache.clone(), store, Metrics::default()));

        let task = tokio::spawn(controller(
            reconciler,
            cache,
            queue.clone(),
            2,
            Duration::from_secs(120),
            None,
            drain,
        ));
        assert_eq!(gets.recv().await.as_deref(), Some("vnic-vnic1-ingress"));

        let drained = tokio::spawn(signal.drain());
        time::sleep(Duration::from_secs(1)).await;

        // No new work is accepted while the in-flight NIC completes.
        assert!(queue.is_shutting_down());
        queue.add("vnic2".to_string());
        assert!(queue.is_empty());
        assert!(!task.is_finished());
        assert!(!drained.is_finished());

        open.send_replace(true);
        task.await
            .expect("controller must not panic")
            .expect("controller must stop cleanly");
        drained.await.expect("drain must complete");

        assert_eq!(gets.recv().await.as_deref(), Some("vnic-vnic1-egress"));
        assert!(gets.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn drain_before_sync_stops_without_workers() {
        let (signal, drain) = drain::channel();
        let (store, mut gets, _open) = mk_store(true);
        let cache = NicCache::default();
        let queue = WorkQueue::new(Backoff::default());
        queue.add("vnic1".to_string());
        let reconciler = Arc::new(Reconciler::new(cache.clone(), store, Metrics::default()));

        let task = tokio::spawn(controller(
            reconciler,
            cache,
            queue,
            2,
            Duration::from_secs(120),
            None,
            drain,
        ));
        tokio::task::yield_now().await;

        signal.drain().await;
        task.await
            .expect("controller must not panic")
            .expect("controller must stop cleanly");
        assert!(gets.try_recv().is_err());
    }
}

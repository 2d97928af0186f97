use crate::{
    reconcile::{plan, Action},
    *,
};
use futures::prelude::*;
use kube::runtime::watcher::Event;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::{collections::BTreeMap, sync::Arc};
use tokio::time;
use trafficredirect_controller_core::{desired_rules, Direction, Nic, RuleKey, RULE_NAMESPACE};
use trafficredirect_controller_k8s_api::{Rule, RuleMatch, RuleOption, RuleSpec};

/// An in-memory rule store that counts writes.
#[derive(Clone, Default)]
struct MemoryStore(Arc<Mutex<State>>);

#[derive(Default)]
struct State {
    rules: BTreeMap<String, Rule>,
    writes: usize,
    version: u64,
    failing_writes: usize,
}

#[async_trait::async_trait]
impl RuleStore for MemoryStore {
    async fn get(&self, name: &str) -> Result<Option<Rule>, StoreError> {
        Ok(self.0.lock().rules.get(name).cloned())
    }

    async fn create(&self, rule: &Rule) -> Result<(), StoreError> {
        let mut state = self.0.lock();
        state.fail_write()?;
        let name = rule.metadata.name.clone().ok_or(StoreError::MissingName)?;
        if state.rules.contains_key(&name) {
            return Err(StoreError::AlreadyExists);
        }
        let mut rule = rule.clone();
        let version = state.next_version();
        rule.metadata.uid = Some(format!("uid-{version}"));
        rule.metadata.resource_version = Some(version.to_string());
        state.rules.insert(name, rule);
        Ok(())
    }

    async fn replace(&self, rule: &Rule) -> Result<(), StoreError> {
        let mut state = self.0.lock();
        state.fail_write()?;
        let name = rule.metadata.name.clone().ok_or(StoreError::MissingName)?;
        let current = state.rules.get(&name).ok_or(StoreError::NotFound)?;
        if current.metadata.resource_version != rule.metadata.resource_version {
            return Err(StoreError::Conflict);
        }
        let mut rule = rule.clone();
        rule.metadata.resource_version = Some(state.next_version().to_string());
        state.rules.insert(name, rule);
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        let mut state = self.0.lock();
        state.fail_write()?;
        state.rules.remove(name).ok_or(StoreError::NotFound)?;
        Ok(())
    }
}

impl State {
    fn fail_write(&mut self) -> Result<(), StoreError> {
        if self.failing_writes > 0 {
            self.failing_writes -= 1;
            return Err(StoreError::Conflict);
        }
        self.writes += 1;
        Ok(())
    }

    fn next_version(&mut self) -> u64 {
        self.version += 1;
        self.version
    }
}

impl MemoryStore {
    fn rule(&self, nic_id: &str, direction: Direction) -> Option<Rule> {
        let name = RuleKey::new(nic_id, direction).name();
        self.0.lock().rules.get(&name).cloned()
    }

    fn names(&self) -> Vec<String> {
        self.0.lock().rules.keys().cloned().collect()
    }

    fn writes(&self) -> usize {
        self.0.lock().writes
    }
}

/// A store whose reads are always stale, as if another writer raced each
/// write.
struct RacingStore {
    existing: Option<Rule>,
}

#[async_trait::async_trait]
impl RuleStore for RacingStore {
    async fn get(&self, _: &str) -> Result<Option<Rule>, StoreError> {
        Ok(self.existing.clone())
    }

    async fn create(&self, _: &Rule) -> Result<(), StoreError> {
        Err(StoreError::AlreadyExists)
    }

    async fn replace(&self, _: &Rule) -> Result<(), StoreError> {
        Err(StoreError::Conflict)
    }

    async fn delete(&self, _: &str) -> Result<(), StoreError> {
        Err(StoreError::NotFound)
    }
}

fn mk_nic(id: &str, dpi_enabled: bool, mac: &str) -> Nic {
    Nic {
        id: id.to_string(),
        dpi_enabled,
        mac_address: mac.to_string(),
        owner_vm_id: "vm1".to_string(),
    }
}

fn mk_reconciler<S: RuleStore>(cache: &NicCache, store: S) -> Reconciler<S> {
    Reconciler::new(cache.clone(), store, Metrics::default())
}

fn assert_rules(store: &MemoryStore, nic_id: &str, mac: &str) {
    let ingress = store
        .rule(nic_id, Direction::Ingress)
        .expect("ingress rule must exist");
    assert_eq!(ingress.metadata.namespace.as_deref(), Some(RULE_NAMESPACE));
    assert_eq!(
        ingress.spec,
        RuleSpec {
            mac_match: RuleMatch {
                src_mac: "".to_string(),
                dst_mac: mac.to_string(),
            },
            direct: Direction::Ingress,
            option: Some(RuleOption {
                tower_vm: "vm1".to_string(),
            }),
        }
    );

    let egress = store
        .rule(nic_id, Direction::Egress)
        .expect("egress rule must exist");
    assert_eq!(egress.metadata.namespace.as_deref(), Some(RULE_NAMESPACE));
    assert_eq!(
        egress.spec,
        RuleSpec {
            mac_match: RuleMatch {
                src_mac: mac.to_string(),
                dst_mac: "".to_string(),
            },
            direct: Direction::Egress,
            option: Some(RuleOption {
                tower_vm: "vm1".to_string(),
            }),
        }
    );
}

#[test]
fn plans_minimal_writes() {
    let nic = mk_nic("vnic1", true, "aa:bb:cc:dd:ee:ff");
    let rules = desired_rules(&nic);
    let current = rules.to_rule("vnic1", Direction::Ingress);
    let stale = desired_rules(&mk_nic("vnic1", true, "ff:ee:dd:cc:bb:aa"))
        .to_rule("vnic1", Direction::Ingress);

    assert_eq!(plan(None, None), Action::None);
    assert_eq!(plan(None, Some(&current)), Action::Delete);
    assert_eq!(plan(Some(&rules.ingress), None), Action::Create);
    assert_eq!(plan(Some(&rules.ingress), Some(&current)), Action::None);
    assert_eq!(plan(Some(&rules.ingress), Some(&stale)), Action::Update);
}

#[tokio::test]
async fn creates_rules_for_dpi_nic() {
    let cache = NicCache::default();
    let store = MemoryStore::default();
    let reconciler = mk_reconciler(&cache, store.clone());

    cache.apply(NicEvent::Applied(mk_nic("vnic1", true, "aa:bb:cc:dd:ee:ff")));
    reconciler.reconcile("vnic1").await.expect("must reconcile");

    assert_eq!(
        store.names(),
        vec!["vnic-vnic1-egress".to_string(), "vnic-vnic1-ingress".to_string()]
    );
    assert_rules(&store, "vnic1", "aa:bb:cc:dd:ee:ff");
    assert_eq!(store.writes(), 2);
}

#[tokio::test]
async fn reconciling_unchanged_nic_does_not_write() {
    let cache = NicCache::default();
    let store = MemoryStore::default();
    let reconciler = mk_reconciler(&cache, store.clone());

    cache.apply(NicEvent::Applied(mk_nic("vnic1", true, "aa:bb:cc:dd:ee:ff")));
    reconciler.reconcile("vnic1").await.expect("must reconcile");
    assert_eq!(store.writes(), 2);

    reconciler.reconcile("vnic1").await.expect("must reconcile");
    assert_eq!(store.writes(), 2);
}

#[tokio::test]
async fn updates_rules_in_place() {
    let cache = NicCache::default();
    let store = MemoryStore::default();
    let reconciler = mk_reconciler(&cache, store.clone());

    cache.apply(NicEvent::Applied(mk_nic("vnic1", true, "aa:bb:cc:dd:ee:ff")));
    reconciler.reconcile("vnic1").await.expect("must reconcile");
    let uids = Direction::ALL.map(|d| store.rule("vnic1", d).and_then(|r| r.metadata.uid));

    cache.apply(NicEvent::Applied(mk_nic("vnic1", true, "ff:ee:dd:cc:bb:aa")));
    reconciler.reconcile("vnic1").await.expect("must reconcile");

    assert_rules(&store, "vnic1", "ff:ee:dd:cc:bb:aa");
    assert_eq!(
        Direction::ALL.map(|d| store.rule("vnic1", d).and_then(|r| r.metadata.uid)),
        uids
    );
    assert_eq!(store.writes(), 4);
}

#[tokio::test]
async fn deletes_rules_of_missing_nic() {
    let cache = NicCache::default();
    let store = MemoryStore::default();
    let reconciler = mk_reconciler(&cache, store.clone());

    cache.apply(NicEvent::Applied(mk_nic("vnic1", true, "aa:bb:cc:dd:ee:ff")));
    reconciler.reconcile("vnic1").await.expect("must reconcile");

    cache.apply(NicEvent::Deleted("vnic1".to_string()));
    reconciler.reconcile("vnic1").await.expect("must reconcile");
    assert_eq!(store.names(), Vec::<String>::new());
    assert_eq!(store.writes(), 4);

    // Reconciling again is a no-op.
    reconciler.reconcile("vnic1").await.expect("must reconcile");
    assert_eq!(store.writes(), 4);
}

#[tokio::test]
async fn follows_dpi_toggle() {
    let cache = NicCache::default();
    let store = MemoryStore::default();
    let reconciler = mk_reconciler(&cache, store.clone());

    cache.apply(NicEvent::Applied(mk_nic("vnic1", true, "aa:bb:cc:dd:ee:ff")));
    reconciler.reconcile("vnic1").await.expect("must reconcile");
    assert_eq!(store.names().len(), 2);

    cache.apply(NicEvent::Applied(mk_nic("vnic1", false, "aa:bb:cc:dd:ee:ff")));
    reconciler.reconcile("vnic1").await.expect("must reconcile");
    assert_eq!(store.names(), Vec::<String>::new());

    cache.apply(NicEvent::Applied(mk_nic("vnic1", true, "ff:ee:dd:cc:bb:aa")));
    reconciler.reconcile("vnic1").await.expect("must reconcile");
    assert_rules(&store, "vnic1", "ff:ee:dd:cc:bb:aa");
}

#[tokio::test]
async fn never_creates_rules_for_non_dpi_nic() {
    let cache = NicCache::default();
    let store = MemoryStore::default();
    let reconciler = mk_reconciler(&cache, store.clone());

    cache.apply(NicEvent::Applied(mk_nic("vnic1", false, "aa:bb:cc:dd:ee:ff")));
    reconciler.reconcile("vnic1").await.expect("must reconcile");
    reconciler.reconcile("vnic2").await.expect("must reconcile");
    assert_eq!(store.names(), Vec::<String>::new());
    assert_eq!(store.writes(), 0);
}

#[tokio::test]
async fn tolerates_delete_races() {
    let cache = NicCache::default();
    let existing = desired_rules(&mk_nic("vnic1", true, "aa:bb:cc:dd:ee:ff"))
        .to_rule("vnic1", Direction::Ingress);
    let reconciler = mk_reconciler(
        &cache,
        RacingStore {
            existing: Some(existing),
        },
    );

    // The rule was deleted by someone else between the read and the delete.
    reconciler.reconcile("vnic1").await.expect("must reconcile");
}

#[tokio::test]
async fn create_races_are_retryable() {
    let cache = NicCache::default();
    cache.apply(NicEvent::Applied(mk_nic("vnic1", true, "aa:bb:cc:dd:ee:ff")));
    let reconciler = mk_reconciler(&cache, RacingStore { existing: None });

    let error = reconciler
        .reconcile("vnic1")
        .await
        .expect_err("must fail");
    assert!(
        matches!(
            error,
            reconcile::Error::Write {
                op: WriteOp::Create,
                source: StoreError::AlreadyExists,
                ..
            }
        ),
        "{error}"
    );
}

/// Waits for spawned tasks to make progress until `f` holds.
async fn eventually(f: impl Fn() -> bool) {
    for _ in 0..1000 {
        if f() {
            return;
        }
        time::sleep(time::Duration::from_millis(10)).await;
    }
    panic!("condition not met");
}

#[tokio::test(start_paused = true)]
async fn workers_retry_failures() {
    let cache = NicCache::default();
    let store = MemoryStore::default();
    store.0.lock().failing_writes = 1;
    let metrics = Metrics::default();
    let reconciler = Arc::new(Reconciler::new(
        cache.clone(),
        store.clone(),
        metrics.clone(),
    ));
    let queue = WorkQueue::new(Backoff::default());
    let workers = tokio::spawn(run_workers(reconciler, queue.clone(), 2));

    for id in cache.apply(NicEvent::Restarted(vec![mk_nic(
        "vnic1",
        true,
        "aa:bb:cc:dd:ee:ff",
    )])) {
        queue.add(id);
    }

    eventually(|| store.names().len() == 2).await;
    assert_rules(&store, "vnic1", "aa:bb:cc:dd:ee:ff");
    eventually(|| metrics.reconciles(ReconcileResult::Ok) == 1).await;
    assert_eq!(metrics.reconciles(ReconcileResult::Error), 1);
    assert_eq!(metrics.rule_writes(WriteOp::Create), 2);
    assert_eq!(queue.num_requeues(&"vnic1".to_string()), 0);

    queue.shut_down();
    workers.await.expect("workers must not panic");
}

#[tokio::test(start_paused = true)]
async fn drift_is_healed() {
    let cache = NicCache::default();
    let store = MemoryStore::default();
    let reconciler = Arc::new(mk_reconciler(&cache, store.clone()));
    let queue = WorkQueue::new(Backoff::default());
    let workers = tokio::spawn(run_workers(reconciler, queue.clone(), 4));

    for id in cache.apply(NicEvent::Applied(mk_nic("vnic1", true, "aa:bb:cc:dd:ee:ff"))) {
        queue.add(id);
    }
    eventually(|| store.names().len() == 2).await;

    // Someone deletes one of the rules and tampers with the other.
    let deleted = store
        .rule("vnic1", Direction::Ingress)
        .expect("rule must exist");
    store.0.lock().rules.remove(&deleted.metadata.name.clone().unwrap());
    let mut tampered = store
        .rule("vnic1", Direction::Egress)
        .expect("rule must exist");
    tampered.spec.mac_match.src_mac = "00:00:00:00:00:00".to_string();
    store.replace(&tampered).await.expect("must replace");

    watch_rules(
        stream::iter(vec![Event::Delete(deleted), Event::Apply(tampered)]),
        queue.clone(),
    )
    .await;

    eventually(|| {
        store.rule("vnic1", Direction::Ingress).is_some()
            && store
                .rule("vnic1", Direction::Egress)
                .map(|r| r.spec.mac_match.src_mac == "aa:bb:cc:dd:ee:ff")
                .unwrap_or(false)
    })
    .await;
    assert_rules(&store, "vnic1", "aa:bb:cc:dd:ee:ff");

    queue.shut_down();
    workers.await.expect("workers must not panic");
}

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use snat_apply::memory::Op;
use snat_apply::{Action, ApplyError, Family, MemoryTable, Mutation, RetryPolicy, RuleApplier, RuleTable, TableRule};
use snat_core::{ChangeEvent, ChangeKind, ObjectKey, ObjectSnapshot, ShardPlanner, SnatRule, SourceEvent};
use snat_engine::{Engine, EngineHandle, EngineOptions};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const CHAIN: &str = "KUBE-POSTROUTING";

struct Harness {
    table: Arc<MemoryTable>,
    tx: mpsc::Sender<SourceEvent>,
    engine: EngineHandle,
    cancel: CancellationToken,
}

fn spawn_engine(
    table: Arc<dyn RuleTable>,
    workers: usize,
    resync_interval: Duration,
    prune_orphans: bool,
) -> (mpsc::Sender<SourceEvent>, EngineHandle, CancellationToken) {
    let applier = Arc::new(RuleApplier::new(table, CHAIN, RetryPolicy { attempts: 2, backoff: Duration::from_millis(1) }));
    let opts = EngineOptions { workers, queue_capacity: 16, resync_interval, prune_orphans };
    let (tx, rx) = mpsc::channel(256);
    let cancel = CancellationToken::new();
    let engine = Engine::new(applier, opts).spawn(rx, cancel.clone());
    (tx, engine, cancel)
}

fn start(workers: usize, resync_interval: Duration, prune_orphans: bool) -> Harness {
    let table = Arc::new(MemoryTable::new());
    let (tx, engine, cancel) = spawn_engine(table.clone(), workers, resync_interval, prune_orphans);
    Harness { table, tx, engine, cancel }
}

/// Memory table whose mutating calls sleep before touching the rules, counting calls that overlap on
/// one source address.
struct SlowTable {
    inner: MemoryTable,
    ensure_delay: Duration,
    delete_delay: Duration,
    in_flight: Mutex<HashMap<IpAddr, usize>>,
    max_overlap: AtomicUsize,
}

impl SlowTable {
    fn new(ensure_delay: Duration, delete_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryTable::new(),
            ensure_delay,
            delete_delay,
            in_flight: Mutex::default(),
            max_overlap: AtomicUsize::new(0),
        })
    }

    fn enter(&self, source: IpAddr) {
        let mut m = self.in_flight.lock().unwrap();
        let n = m.entry(source).or_default();
        *n += 1;
        self.max_overlap.fetch_max(*n, Ordering::SeqCst);
    }

    fn leave(&self, source: IpAddr) {
        let mut m = self.in_flight.lock().unwrap();
        if let Some(n) = m.get_mut(&source) {
            *n -= 1;
        }
    }

    fn max_overlap(&self) -> usize { self.max_overlap.load(Ordering::SeqCst) }
}

#[async_trait::async_trait]
impl RuleTable for SlowTable {
    async fn ensure(&self, rule: &TableRule) -> Result<Mutation, ApplyError> {
        self.enter(rule.source);
        tokio::time::sleep(self.ensure_delay).await;
        let res = self.inner.ensure(rule).await;
        self.leave(rule.source);
        res
    }

    async fn delete(&self, rule: &TableRule) -> Result<Mutation, ApplyError> {
        self.enter(rule.source);
        tokio::time::sleep(self.delete_delay).await;
        let res = self.inner.delete(rule).await;
        self.leave(rule.source);
        res
    }

    async fn list(&self, family: Family, chain: &str) -> Result<Vec<TableRule>, ApplyError> { self.inner.list(family, chain).await }

    async fn ensure_chain(&self, family: Family, chain: &str) -> Result<Mutation, ApplyError> {
        self.inner.ensure_chain(family, chain).await
    }

    fn name(&self) -> &'static str { "slow-memory" }
}

fn key(name: &str) -> ObjectKey { ObjectKey::new("default", name) }

fn pod(target: &str, ip: &str) -> ObjectSnapshot {
    ObjectSnapshot { target_annotation: Some(target.into()), status_address: Some(ip.into()), ..Default::default() }
}

fn change(kind: ChangeKind, name: &str, obj: ObjectSnapshot) -> SourceEvent {
    SourceEvent::Change(ChangeEvent { kind, key: key(name), object: obj })
}

fn trule(src: &str, to: &str) -> TableRule {
    TableRule { chain: CHAIN.into(), source: src.parse().unwrap(), action: Action::SnatTo(to.parse().unwrap()) }
}

fn sorted(mut rules: Vec<TableRule>) -> Vec<TableRule> {
    rules.sort_by_key(|r| r.source);
    rules
}

fn by_text(mut rules: Vec<TableRule>) -> Vec<TableRule> {
    rules.sort_by_key(|r| r.to_string());
    rules
}

#[tokio::test]
async fn add_and_delete_drive_one_ensure_and_one_remove() {
    let h = start(4, Duration::ZERO, true);
    h.tx.send(change(ChangeKind::Add, "pod1", pod("10.0.0.5", "1.1.1.1"))).await.unwrap();
    h.engine.flush().await.unwrap();
    assert_eq!(h.table.rules(), vec![trule("1.1.1.1", "10.0.0.5")]);
    let applied = h.engine.applied().await.unwrap();
    assert_eq!(applied, vec![(key("pod1"), SnatRule { source: "1.1.1.1".parse().unwrap(), target: "10.0.0.5".parse().unwrap() })]);

    h.tx.send(change(ChangeKind::Delete, "pod1", pod("10.0.0.5", "1.1.1.1"))).await.unwrap();
    h.engine.flush().await.unwrap();
    assert!(h.table.rules().is_empty());
    assert_eq!(h.table.calls_for(Op::Ensure, &trule("1.1.1.1", "10.0.0.5")), 1);
    assert_eq!(h.table.calls_for(Op::Delete, &trule("1.1.1.1", "10.0.0.5")), 1);
    assert!(h.engine.applied().await.unwrap().is_empty());
    h.cancel.cancel();
    h.engine.join().await;
}

#[tokio::test]
async fn resync_is_skipped_before_first_full_list() {
    let h = start(2, Duration::ZERO, true);
    h.tx.send(change(ChangeKind::Add, "pod1", pod("10.0.0.5", "1.1.1.1"))).await.unwrap();
    h.engine.flush().await.unwrap();
    assert_eq!(h.engine.resync_now().await.unwrap(), None);
    h.tx.send(SourceEvent::Relisted(vec![(key("pod1"), pod("10.0.0.5", "1.1.1.1"))])).await.unwrap();
    h.engine.flush().await.unwrap();
    let report = h.engine.resync_now().await.unwrap().expect("synced cache resyncs");
    assert_eq!(report.checked, 1);
    assert_eq!(report.rules, 1);
}

#[tokio::test]
async fn relist_removes_rules_of_objects_deleted_while_disconnected() {
    let h = start(4, Duration::ZERO, true);
    h.tx.send(change(ChangeKind::Add, "pod1", pod("10.0.0.5", "1.1.1.1"))).await.unwrap();
    h.tx.send(change(ChangeKind::Add, "pod2", pod("10.0.0.5", "1.1.1.2"))).await.unwrap();
    h.engine.flush().await.unwrap();
    assert_eq!(h.table.rules().len(), 2);

    h.tx.send(SourceEvent::Relisted(vec![(key("pod1"), pod("10.0.0.5", "1.1.1.1"))])).await.unwrap();
    h.engine.flush().await.unwrap();
    assert_eq!(h.table.rules(), vec![trule("1.1.1.1", "10.0.0.5")]);
    assert_eq!(h.engine.applied().await.unwrap().len(), 1);
    assert!(h.engine.cache().current().synced);
}

#[tokio::test]
async fn resync_heals_rule_removed_behind_our_back() {
    let h = start(4, Duration::ZERO, true);
    h.tx.send(SourceEvent::Relisted(vec![(key("pod1"), pod("10.0.0.5", "1.1.1.1"))])).await.unwrap();
    h.engine.flush().await.unwrap();
    assert!(h.table.remove_externally(&trule("1.1.1.1", "10.0.0.5")));

    let report = h.engine.resync_now().await.unwrap().unwrap();
    assert_eq!(report.restored, 1);
    assert!(h.table.contains(&trule("1.1.1.1", "10.0.0.5")));
}

#[tokio::test]
async fn orphaned_owned_rules_are_pruned_on_relist() {
    let h = start(4, Duration::ZERO, true);
    // left behind by an earlier process for a pod that no longer exists
    h.table.insert_externally(trule("1.1.1.9", "10.0.0.5"));
    let mut foreign = trule("1.1.1.8", "10.0.0.5");
    foreign.chain = "OTHER".into();
    h.table.insert_externally(foreign.clone());

    h.tx.send(SourceEvent::Relisted(vec![(key("pod1"), pod("10.0.0.5", "1.1.1.1"))])).await.unwrap();
    h.engine.flush().await.unwrap();
    assert_eq!(sorted(h.table.rules()), vec![trule("1.1.1.1", "10.0.0.5"), foreign]);

    let report = h.engine.resync_now().await.unwrap().unwrap();
    assert_eq!(report.pruned, 0);
}

#[tokio::test]
async fn orphans_survive_when_pruning_is_off() {
    let h = start(2, Duration::ZERO, false);
    h.table.insert_externally(trule("1.1.1.9", "10.0.0.5"));
    h.tx.send(SourceEvent::Relisted(Vec::new())).await.unwrap();
    h.engine.flush().await.unwrap();
    assert_eq!(h.table.rules(), vec![trule("1.1.1.9", "10.0.0.5")]);
}

#[tokio::test]
async fn many_keys_across_shards_converge() {
    let h = start(4, Duration::ZERO, true);
    for i in 0..40u8 {
        let name = format!("pod{i}");
        h.tx.send(change(ChangeKind::Add, &name, pod("10.0.0.5", &format!("1.1.2.{i}")))).await.unwrap();
    }
    // retarget the even ones, drop every fifth
    for i in (0..40u8).step_by(2) {
        let name = format!("pod{i}");
        h.tx.send(change(ChangeKind::Update, &name, pod("10.0.0.6", &format!("1.1.2.{i}")))).await.unwrap();
    }
    for i in (0..40u8).step_by(5) {
        let name = format!("pod{i}");
        h.tx.send(change(ChangeKind::Delete, &name, ObjectSnapshot::default())).await.unwrap();
    }
    h.engine.flush().await.unwrap();

    let expected: Vec<TableRule> = (0..40u8)
        .filter(|i| i % 5 != 0)
        .map(|i| trule(&format!("1.1.2.{i}"), if i % 2 == 0 { "10.0.0.6" } else { "10.0.0.5" }))
        .collect();
    assert_eq!(sorted(h.table.rules()), sorted(expected.clone()));
    assert_eq!(h.engine.applied().await.unwrap().len(), expected.len());
    assert_eq!(h.engine.cache().current().len(), 0, "cache is only published on resync");
}

#[tokio::test]
async fn transient_failure_is_retried_by_the_next_resync() {
    let h = start(1, Duration::ZERO, true);
    for _ in 0..2 {
        h.table.fail_next(Op::Ensure, snat_apply::ApplyError::Transient("xtables lock".into()));
    }
    h.tx.send(SourceEvent::Relisted(vec![(key("pod1"), pod("10.0.0.5", "1.1.1.1"))])).await.unwrap();
    h.engine.flush().await.unwrap();
    assert!(h.table.rules().is_empty());

    let report = h.engine.resync_now().await.unwrap().unwrap();
    assert_eq!(report.applied, 1);
    assert_eq!(h.table.rules(), vec![trule("1.1.1.1", "10.0.0.5")]);
}

#[tokio::test(start_paused = true)]
async fn periodic_resync_heals_without_new_events() {
    let h = start(2, Duration::from_secs(60), true);
    h.tx.send(SourceEvent::Relisted(vec![(key("pod1"), pod("10.0.0.5", "1.1.1.1"))])).await.unwrap();
    h.engine.flush().await.unwrap();
    assert!(h.table.remove_externally(&trule("1.1.1.1", "10.0.0.5")));

    let mut healed = false;
    for _ in 0..120 {
        tokio::time::sleep(Duration::from_secs(1)).await;
        if h.table.contains(&trule("1.1.1.1", "10.0.0.5")) {
            healed = true;
            break;
        }
    }
    assert!(healed, "rule not restored by periodic resync");
}

#[tokio::test]
async fn cancellation_stops_all_tasks() {
    let h = start(4, Duration::from_secs(60), true);
    h.tx.send(change(ChangeKind::Add, "pod1", pod("10.0.0.5", "1.1.1.1"))).await.unwrap();
    h.engine.flush().await.unwrap();
    h.cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), h.engine.join()).await.expect("engine shut down");
    // rules stay in place across a shutdown
    assert_eq!(h.table.rules(), vec![trule("1.1.1.1", "10.0.0.5")]);
}

#[tokio::test]
async fn join_waits_for_prune_already_touching_the_table() {
    let table = SlowTable::new(Duration::ZERO, Duration::from_millis(300));
    table.inner.insert_externally(trule("1.1.1.9", "10.0.0.5"));
    let (tx, engine, cancel) = spawn_engine(table.clone(), 2, Duration::ZERO, true);

    tx.send(SourceEvent::Relisted(Vec::new())).await.unwrap();
    // the orphan removal is asleep inside the table when cancellation fires
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(table.inner.rules().len(), 1);
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), engine.join()).await.expect("engine shut down");

    assert!(table.inner.rules().is_empty(), "join returned before the removal finished");
    assert_eq!(table.inner.mutations(Op::Delete), 1);
}

#[tokio::test]
async fn relist_during_running_resync_gets_its_own_pass() {
    let table = SlowTable::new(Duration::from_millis(100), Duration::ZERO);
    let (tx, engine, cancel) = spawn_engine(table.clone(), 2, Duration::ZERO, true);

    tx.send(SourceEvent::Relisted(vec![(key("pod1"), pod("10.0.0.5", "1.1.1.1")), (key("pod3"), pod("10.0.0.5", "1.1.1.3"))]))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    // pod3 went away and pod2 appeared while the first pass was still ensuring
    tx.send(SourceEvent::Relisted(vec![(key("pod1"), pod("10.0.0.5", "1.1.1.1")), (key("pod2"), pod("10.0.0.5", "1.1.1.2"))]))
        .await
        .unwrap();
    engine.flush().await.unwrap();

    assert_eq!(sorted(table.inner.rules()), vec![trule("1.1.1.1", "10.0.0.5"), trule("1.1.1.2", "10.0.0.5")]);
    let keys: Vec<String> = engine.applied().await.unwrap().into_iter().map(|(k, _)| k.name).collect();
    assert_eq!(keys, vec!["pod1", "pod2"]);
    cancel.cancel();
    engine.join().await;
}

#[tokio::test]
async fn keys_sharing_a_source_never_touch_the_table_concurrently() {
    const WORKERS: usize = 4;
    let planner = ShardPlanner::new(WORKERS);
    let a = "pod-a";
    let b = (0..64)
        .map(|i| format!("pod-b{i}"))
        .find(|n| planner.shard_for(&key(n)) != planner.shard_for(&key(a)))
        .expect("a name on another shard");

    let table = SlowTable::new(Duration::from_millis(2), Duration::from_millis(2));
    let (tx, engine, cancel) = spawn_engine(table.clone(), WORKERS, Duration::ZERO, true);

    // both keys claim 1.1.1.1 and keep retargeting, interleaved
    for i in 0..12u8 {
        tx.send(change(ChangeKind::Update, a, pod(&format!("10.0.0.{}", 10 + i % 3), "1.1.1.1"))).await.unwrap();
        tx.send(change(ChangeKind::Update, &b, pod(&format!("10.0.0.{}", 20 + i % 3), "1.1.1.1"))).await.unwrap();
    }
    engine.flush().await.unwrap();
    assert_eq!(by_text(table.inner.rules()), by_text(vec![trule("1.1.1.1", "10.0.0.12"), trule("1.1.1.1", "10.0.0.22")]));

    // the most recent writer's rule sits at the head of the chain
    tx.send(change(ChangeKind::Update, a, pod("10.0.0.13", "1.1.1.1"))).await.unwrap();
    engine.flush().await.unwrap();
    assert_eq!(table.inner.rules()[0], trule("1.1.1.1", "10.0.0.13"));
    tx.send(change(ChangeKind::Update, &b, pod("10.0.0.23", "1.1.1.1"))).await.unwrap();
    engine.flush().await.unwrap();
    assert_eq!(table.inner.rules()[0], trule("1.1.1.1", "10.0.0.23"));

    tx.send(SourceEvent::Relisted(vec![(key(a), pod("10.0.0.13", "1.1.1.1")), (key(&b), pod("10.0.0.23", "1.1.1.1"))]))
        .await
        .unwrap();
    engine.flush().await.unwrap();
    assert_eq!(table.inner.rules(), vec![trule("1.1.1.1", "10.0.0.23"), trule("1.1.1.1", "10.0.0.13")]);
    assert_eq!(table.max_overlap(), 1, "two calls on one address overlapped");
    cancel.cancel();
    engine.join().await;
}

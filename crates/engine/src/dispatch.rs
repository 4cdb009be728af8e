//! Dispatcher and shard workers.
//!
//! The dispatcher owns the object cache and is the only consumer of the source channel. Changes are
//! routed to a fixed shard by key, so events for one key are applied in arrival order while different
//! keys proceed in parallel. Resync fans a frozen snapshot out to every shard and, once all shards have
//! answered, prunes owned rules no object wants.

use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::counter;
use rustc_hash::FxHashSet;
use snat_apply::RuleApplier;
use snat_core::{extract, ChangeEvent, Config, ObjectKey, ShardPlanner, SnatRule, SourceEvent};
use snat_store::{CacheHandle, CacheSnapshot, ObjectCache};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::locks::AddressLocks;
use crate::reconcile::{record_resync, Reconciler, ResyncReport};
use crate::resync::run_periodic;

const COMMAND_QUEUE: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("engine stopped")]
    Stopped,
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub workers: usize,
    pub queue_capacity: usize,
    /// Zero disables the periodic resync; relists and [`EngineHandle::resync_now`] still run one.
    pub resync_interval: Duration,
    pub prune_orphans: bool,
}

impl Default for EngineOptions {
    fn default() -> Self { Self::from_config(&Config::default()) }
}

impl EngineOptions {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            workers: cfg.workers,
            queue_capacity: cfg.queue_capacity,
            resync_interval: cfg.resync_interval,
            prune_orphans: cfg.prune_orphans,
        }
    }
}

pub(crate) enum Command {
    /// `None` in the reply means the pass was skipped.
    Resync(Option<oneshot::Sender<Option<ResyncReport>>>),
    ResyncFinished,
    Flush(oneshot::Sender<()>),
    /// Every shard passed the flush barrier.
    ShardsFlushed(oneshot::Sender<()>),
    Applied(oneshot::Sender<Vec<(ObjectKey, SnatRule)>>),
    Snapshot(oneshot::Sender<Arc<CacheSnapshot>>),
}

enum ShardMsg {
    Change(ChangeEvent),
    Resync { snap: Arc<CacheSnapshot>, ack: oneshot::Sender<ResyncReport> },
    Barrier(oneshot::Sender<()>),
    Applied(oneshot::Sender<Vec<(ObjectKey, SnatRule)>>),
}

pub struct Engine {
    applier: Arc<RuleApplier>,
    opts: EngineOptions,
}

impl Engine {
    pub fn new(applier: Arc<RuleApplier>, opts: EngineOptions) -> Self { Self { applier, opts } }

    /// Start the dispatcher, one worker per shard, and the periodic resync. Everything stops when
    /// `cancel` fires; an operation already handed to the table is allowed to finish first.
    pub fn spawn(self, source: mpsc::Receiver<SourceEvent>, cancel: CancellationToken) -> EngineHandle {
        let Engine { applier, opts } = self;
        let planner = ShardPlanner::new(opts.workers);
        let locks = Arc::new(AddressLocks::new());
        let mut tasks = Vec::with_capacity(planner.shards() + 2);

        let mut shards = Vec::with_capacity(planner.shards());
        for idx in 0..planner.shards() {
            let (tx, rx) = mpsc::channel(opts.queue_capacity.max(1));
            let rec = Reconciler::new(Arc::clone(&applier), Arc::clone(&locks));
            tasks.push(tokio::spawn(run_shard(idx, planner, rec, rx, cancel.clone())));
            shards.push(tx);
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
        let (cache, cache_handle) = ObjectCache::new();
        let dispatcher = Dispatcher {
            planner,
            shards,
            cache,
            applier,
            locks,
            prune_orphans: opts.prune_orphans,
            cmd_tx: cmd_tx.clone(),
            cancel: cancel.clone(),
            tasks: JoinSet::new(),
            resync_running: false,
            resync_pending: false,
            idle_waiters: Vec::new(),
        };
        tasks.push(tokio::spawn(dispatcher.run(source, cmd_rx)));
        if !opts.resync_interval.is_zero() {
            tasks.push(tokio::spawn(run_periodic(cmd_tx.clone(), opts.resync_interval, cancel.clone())));
        }
        info!(shards = planner.shards(), resync_secs = opts.resync_interval.as_secs(), prune = opts.prune_orphans, "engine started");
        EngineHandle { cmd: cmd_tx, cache: cache_handle, tasks }
    }
}

pub struct EngineHandle {
    cmd: mpsc::Sender<Command>,
    cache: CacheHandle,
    tasks: Vec<JoinHandle<()>>,
}

impl EngineHandle {
    /// Run a resync now and wait for it. `None` if the cache has not seen a full list yet or a pass is
    /// already running. A relist that lands during a pass always gets a pass of its own.
    pub async fn resync_now(&self) -> Result<Option<ResyncReport>, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.cmd.send(Command::Resync(Some(tx))).await.map_err(|_| EngineError::Stopped)?;
        rx.await.map_err(|_| EngineError::Stopped)
    }

    /// Wait until every source event queued so far, and any resync in flight, has been processed.
    pub async fn flush(&self) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.cmd.send(Command::Flush(tx)).await.map_err(|_| EngineError::Stopped)?;
        rx.await.map_err(|_| EngineError::Stopped)
    }

    /// Applied rules per key across all shards, sorted by key.
    pub async fn applied(&self) -> Result<Vec<(ObjectKey, SnatRule)>, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.cmd.send(Command::Applied(tx)).await.map_err(|_| EngineError::Stopped)?;
        rx.await.map_err(|_| EngineError::Stopped)
    }

    pub fn cache(&self) -> &CacheHandle { &self.cache }

    /// Wait for all engine tasks. They exit once the cancellation token fires; a resync or prune already
    /// touching the table completes first.
    pub async fn join(self) {
        drop(self.cmd);
        for t in self.tasks {
            if let Err(e) = t.await {
                warn!(error = %e, "engine task panicked");
            }
        }
    }
}

struct Dispatcher {
    planner: ShardPlanner,
    shards: Vec<mpsc::Sender<ShardMsg>>,
    cache: ObjectCache,
    applier: Arc<RuleApplier>,
    locks: Arc<AddressLocks>,
    prune_orphans: bool,
    cmd_tx: mpsc::Sender<Command>,
    cancel: CancellationToken,
    /// Resync passes and reply helpers. Drained before the dispatcher exits.
    tasks: JoinSet<()>,
    resync_running: bool,
    /// A relist arrived while a pass was running; another pass follows the current one.
    resync_pending: bool,
    /// Flushes whose shard barriers passed while a pass was running or pending.
    idle_waiters: Vec<oneshot::Sender<()>>,
}

impl Dispatcher {
    async fn run(mut self, mut source: mpsc::Receiver<SourceEvent>, mut cmds: mpsc::Receiver<Command>) {
        let cancel = self.cancel.clone();
        let mut source_open = true;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                cmd = cmds.recv() => match cmd {
                    Some(c) => self.on_command(c, &mut source).await,
                    None => break,
                },
                Some(res) = self.tasks.join_next(), if !self.tasks.is_empty() => log_join(res),
                ev = source.recv(), if source_open => match ev {
                    Some(ev) => self.on_source(ev).await,
                    None => {
                        info!("event source closed");
                        source_open = false;
                    }
                },
            }
        }
        self.drain(&mut cmds).await;
        info!("dispatcher stopped");
    }

    /// Wait for in-flight passes after cancellation. The pruner may still ask for a snapshot; every other
    /// command is dropped, which its caller sees as [`EngineError::Stopped`].
    async fn drain(&mut self, cmds: &mut mpsc::Receiver<Command>) {
        if !self.tasks.is_empty() {
            debug!(tasks = self.tasks.len(), "waiting for in-flight engine work");
        }
        while !self.tasks.is_empty() {
            tokio::select! {
                Some(res) = self.tasks.join_next() => log_join(res),
                Some(cmd) = cmds.recv() => {
                    if let Command::Snapshot(reply) = cmd {
                        let _ = reply.send(self.cache.freeze());
                    }
                }
            }
        }
    }

    async fn on_source(&mut self, ev: SourceEvent) {
        match ev {
            SourceEvent::Change(change) => {
                self.cache.apply(&change);
                let idx = self.planner.shard_for(&change.key);
                if self.shards[idx].send(ShardMsg::Change(change)).await.is_err() {
                    warn!(shard = idx, "shard worker gone; dropping change");
                }
            }
            SourceEvent::Relisted(list) => {
                let gone = self.cache.replace(list);
                info!(objects = self.cache.len(), gone = gone.len(), "full list received");
                if self.resync_running {
                    debug!("resync running; queueing another pass for the relist");
                    self.resync_pending = true;
                } else {
                    self.start_resync(None).await;
                }
            }
        }
    }

    async fn on_command(&mut self, cmd: Command, source: &mut mpsc::Receiver<SourceEvent>) {
        match cmd {
            Command::Resync(reply) => self.start_resync(reply).await,
            Command::ResyncFinished => {
                self.resync_running = false;
                if std::mem::take(&mut self.resync_pending) {
                    self.start_resync(None).await;
                }
                if !self.resync_running {
                    for w in self.idle_waiters.drain(..) {
                        let _ = w.send(());
                    }
                }
            }
            Command::Flush(reply) => {
                while let Ok(ev) = source.try_recv() {
                    self.on_source(ev).await;
                }
                let barriers = self.broadcast(ShardMsg::Barrier).await;
                let cmd = self.cmd_tx.clone();
                self.tasks.spawn(async move {
                    for b in barriers {
                        let _ = b.await;
                    }
                    let _ = cmd.send(Command::ShardsFlushed(reply)).await;
                });
            }
            Command::ShardsFlushed(reply) => {
                if self.resync_running || self.resync_pending {
                    self.idle_waiters.push(reply);
                } else {
                    let _ = reply.send(());
                }
            }
            Command::Applied(reply) => {
                let parts = self.broadcast(ShardMsg::Applied).await;
                self.tasks.spawn(async move {
                    let mut all = Vec::new();
                    for p in parts {
                        if let Ok(v) = p.await {
                            all.extend(v);
                        }
                    }
                    all.sort_by(|a, b| a.0.cmp(&b.0));
                    let _ = reply.send(all);
                });
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.cache.freeze());
            }
        }
    }

    /// Send one message per shard built from a fresh oneshot; returns the receivers of the shards reached.
    async fn broadcast<T>(&self, make: impl Fn(oneshot::Sender<T>) -> ShardMsg) -> Vec<oneshot::Receiver<T>> {
        let mut out = Vec::with_capacity(self.shards.len());
        for (idx, tx) in self.shards.iter().enumerate() {
            let (otx, orx) = oneshot::channel();
            if tx.send(make(otx)).await.is_err() {
                warn!(shard = idx, "shard worker gone");
                continue;
            }
            out.push(orx);
        }
        out
    }

    async fn start_resync(&mut self, reply: Option<oneshot::Sender<Option<ResyncReport>>>) {
        if !self.cache.is_synced() {
            debug!("no full list yet; skipping resync");
            if let Some(r) = reply { let _ = r.send(None); }
            return;
        }
        if self.resync_running {
            debug!("resync already running; skipping");
            if let Some(r) = reply { let _ = r.send(None); }
            return;
        }
        self.resync_running = true;
        let t0 = Instant::now();
        let snap = self.cache.freeze();
        debug!(epoch = snap.epoch, objects = snap.len(), "resync started");
        let acks = self.broadcast(|ack| ShardMsg::Resync { snap: Arc::clone(&snap), ack }).await;
        let prune = self.prune_orphans.then(|| Pruner {
            applier: Arc::clone(&self.applier),
            locks: Arc::clone(&self.locks),
            cmd: self.cmd_tx.clone(),
            cancel: self.cancel.clone(),
        });
        let locks = Arc::clone(&self.locks);
        let done = self.cmd_tx.clone();
        self.tasks.spawn(async move {
            let mut report = ResyncReport::default();
            for a in acks {
                if let Ok(r) = a.await {
                    report.merge(&r);
                }
            }
            if let Some(p) = prune {
                report.pruned = p.run().await;
            }
            locks.prune_idle();
            record_resync(t0, &report);
            info!(
                checked = report.checked,
                applied = report.applied,
                restored = report.restored,
                removed = report.removed,
                pruned = report.pruned,
                failed = report.failed,
                rules = report.rules,
                took_ms = %t0.elapsed().as_millis(),
                "resync finished"
            );
            if let Some(r) = reply { let _ = r.send(Some(report)); }
            let _ = done.send(Command::ResyncFinished).await;
        });
    }
}

fn log_join(res: Result<(), JoinError>) {
    if let Err(e) = res {
        warn!(error = %e, "engine task failed");
    }
}

/// Removes owned rules in the chain that no known object wants.
struct Pruner {
    applier: Arc<RuleApplier>,
    locks: Arc<AddressLocks>,
    cmd: mpsc::Sender<Command>,
    cancel: CancellationToken,
}

impl Pruner {
    async fn run(self) -> usize {
        // list first: anything applied after this point is also in the snapshot fetched below
        let owned = match self.applier.list_owned().await {
            Ok(rules) => rules,
            Err(e) => {
                warn!(error = %e, "listing owned rules failed; skipping orphan pruning");
                return 0;
            }
        };
        if owned.is_empty() {
            return 0;
        }
        let (tx, rx) = oneshot::channel();
        if self.cmd.send(Command::Snapshot(tx)).await.is_err() {
            return 0;
        }
        let Ok(snap) = rx.await else { return 0 };
        let wanted: FxHashSet<SnatRule> =
            snap.objects.iter().filter_map(|(k, o)| extract(k, o).ok().and_then(|d| d.rule)).collect();
        let mut pruned = 0usize;
        for rule in owned.into_iter().filter(|r| !wanted.contains(r)) {
            // a removal already started finishes; no new one starts after cancellation
            if self.cancel.is_cancelled() {
                debug!("cancelled; stopping orphan pruning");
                break;
            }
            let _g = self.locks.lock(&[rule.source]).await;
            match self.applier.remove(&rule).await {
                Ok(m) if m.changed() => {
                    info!(rule = %rule, "pruned orphaned rule");
                    pruned += 1;
                }
                Ok(_) => {}
                Err(e) => warn!(rule = %rule, error = %e, "pruning orphaned rule failed"),
            }
        }
        counter!("snat_orphans_pruned_total", pruned as u64);
        pruned
    }
}

async fn run_shard(
    idx: usize,
    planner: ShardPlanner,
    mut rec: Reconciler,
    mut rx: mpsc::Receiver<ShardMsg>,
    cancel: CancellationToken,
) {
    loop {
        // cancellation is only observed between messages
        let msg = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            m = rx.recv() => match m {
                Some(m) => m,
                None => break,
            },
        };
        match msg {
            ShardMsg::Change(ev) => {
                rec.on_change(&ev).await;
            }
            ShardMsg::Resync { snap, ack } => {
                let report = rec.resync(&snap, |k| planner.shard_for(k) == idx).await;
                let _ = ack.send(report);
            }
            ShardMsg::Barrier(done) => {
                let _ = done.send(());
            }
            ShardMsg::Applied(reply) => {
                let _ = reply.send(rec.applied_rules().map(|(k, r)| (k.clone(), *r)).collect());
            }
        }
    }
    debug!(shard = idx, rules = rec.applied_len(), "shard worker stopped");
}

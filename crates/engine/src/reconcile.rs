//! Per-shard reconciliation: diff desired vs last-applied per key and drive the applier.
//!
//! A [`Reconciler`] exclusively owns the applied state of the keys routed to its shard. The applied entry
//! for a key changes only after the table call succeeded, so a failed call is retried by the next event
//! for that key or by the next resync.

use std::sync::Arc;
use std::time::Instant;

use metrics::counter;
use rustc_hash::FxHashMap;
use snat_apply::{ApplyError, RuleApplier};
use snat_core::{extract, ChangeEvent, ChangeKind, ObjectKey, ObjectSnapshot, SnatRule};
use snat_store::CacheSnapshot;
use tracing::{debug, error, info, warn};

use crate::locks::AddressLocks;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    NoRule,
    /// A rule is wanted but not confirmed in the table.
    RuleDesired,
    RulePresent,
    /// The applied rule must go but its removal has not succeeded yet.
    RuleRemoving,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Unchanged,
    Applied,
    /// Forced ensure found the rule missing and put it back.
    Restored,
    Replaced,
    Removed,
    Failed(ApplyError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResyncReport {
    pub checked: usize,
    pub applied: usize,
    pub restored: usize,
    pub replaced: usize,
    pub removed: usize,
    pub failed: usize,
    pub pruned: usize,
    /// Size of applied state after the pass.
    pub rules: usize,
}

impl ResyncReport {
    fn tally(&mut self, o: &Outcome) {
        self.checked += 1;
        match o {
            Outcome::Unchanged => {}
            Outcome::Applied => self.applied += 1,
            Outcome::Restored => self.restored += 1,
            Outcome::Replaced => self.replaced += 1,
            Outcome::Removed => self.removed += 1,
            Outcome::Failed(_) => self.failed += 1,
        }
    }

    pub fn merge(&mut self, o: &ResyncReport) {
        self.checked += o.checked;
        self.applied += o.applied;
        self.restored += o.restored;
        self.replaced += o.replaced;
        self.removed += o.removed;
        self.failed += o.failed;
        self.pruned += o.pruned;
        self.rules += o.rules;
    }
}

#[derive(Debug, Clone)]
struct Entry {
    state: KeyState,
    applied: Option<SnatRule>,
}

/// Desired rule for an object; malformed input is reported and treated as "no rule".
pub fn desired_rule(key: &ObjectKey, obj: &ObjectSnapshot) -> Option<SnatRule> {
    match extract(key, obj) {
        Ok(d) => d.rule,
        Err(e) => {
            warn!(key = %key, error = %e, "ignoring malformed snat annotation");
            counter!("snat_extraction_errors_total", 1u64);
            None
        }
    }
}

pub struct Reconciler {
    applier: Arc<RuleApplier>,
    locks: Arc<AddressLocks>,
    entries: FxHashMap<ObjectKey, Entry>,
}

impl Reconciler {
    pub fn new(applier: Arc<RuleApplier>, locks: Arc<AddressLocks>) -> Self {
        Self { applier, locks, entries: FxHashMap::default() }
    }

    pub fn state(&self, key: &ObjectKey) -> KeyState {
        self.entries.get(key).map(|e| e.state).unwrap_or(KeyState::NoRule)
    }

    pub fn applied(&self, key: &ObjectKey) -> Option<SnatRule> {
        self.entries.get(key).and_then(|e| e.applied)
    }

    pub fn applied_rules(&self) -> impl Iterator<Item = (&ObjectKey, &SnatRule)> {
        self.entries.iter().filter_map(|(k, e)| e.applied.as_ref().map(|r| (k, r)))
    }

    pub fn applied_len(&self) -> usize { self.entries.values().filter(|e| e.applied.is_some()).count() }

    pub async fn on_change(&mut self, ev: &ChangeEvent) -> Outcome {
        debug!(key = %ev.key, kind = ev.kind.as_str(), "change");
        let desired = match ev.kind {
            ChangeKind::Delete => None,
            ChangeKind::Add | ChangeKind::Update => desired_rule(&ev.key, &ev.object),
        };
        self.converge(&ev.key, desired, false).await
    }

    /// Full pass over this shard's slice of `snap`. Keys with applied state that are no longer known lose
    /// their rule; every desired rule is re-ensured so external deletions are healed.
    pub async fn resync<F>(&mut self, snap: &CacheSnapshot, owns: F) -> ResyncReport
    where
        F: Fn(&ObjectKey) -> bool,
    {
        let mut report = ResyncReport::default();
        let mut stale: Vec<ObjectKey> = self.entries.keys().filter(|k| !snap.objects.contains_key(*k)).cloned().collect();
        stale.sort();
        for key in stale {
            let o = self.converge(&key, None, true).await;
            report.tally(&o);
        }
        let mut keys: Vec<&ObjectKey> = snap.objects.keys().filter(|k| owns(k)).collect();
        keys.sort();
        for key in keys {
            let desired = snap.objects.get(key).and_then(|obj| desired_rule(key, obj));
            let o = self.converge(key, desired, true).await;
            report.tally(&o);
        }
        report.rules = self.applied_len();
        report
    }

    /// Move `key` towards `desired`. With `force`, an unchanged desired rule is still ensured.
    pub async fn converge(&mut self, key: &ObjectKey, desired: Option<SnatRule>, force: bool) -> Outcome {
        let (applied, state) = match self.entries.get(key) {
            Some(e) => (e.applied, e.state),
            None => (None, KeyState::NoRule),
        };
        match (applied, desired) {
            (None, None) => {
                self.entries.remove(key);
                Outcome::Unchanged
            }
            (Some(a), Some(d)) if a == d => {
                if !force && state == KeyState::RulePresent {
                    return Outcome::Unchanged;
                }
                let _g = self.locks.lock(&[d.source]).await;
                match self.applier.ensure(&d).await {
                    Ok(m) => {
                        self.set(key, KeyState::RulePresent, Some(d));
                        if m.changed() {
                            info!(key = %key, rule = %d, "restored missing rule");
                            counter!("snat_drift_healed_total", 1u64);
                            Outcome::Restored
                        } else {
                            Outcome::Unchanged
                        }
                    }
                    Err(e) => self.failed(key, "ensure", &d, KeyState::RuleDesired, e),
                }
            }
            (None, Some(d)) => {
                self.set(key, KeyState::RuleDesired, None);
                let _g = self.locks.lock(&[d.source]).await;
                match self.applier.ensure(&d).await {
                    Ok(_) => {
                        info!(key = %key, rule = %d, "rule applied");
                        self.set(key, KeyState::RulePresent, Some(d));
                        Outcome::Applied
                    }
                    Err(e) => self.failed(key, "ensure", &d, KeyState::RuleDesired, e),
                }
            }
            (Some(a), desired) => {
                let mut addrs = vec![a.source];
                addrs.extend(desired.map(|d| d.source));
                let _g = self.locks.lock(&addrs).await;
                self.set(key, KeyState::RuleRemoving, Some(a));
                if let Err(e) = self.applier.remove(&a).await {
                    return self.failed(key, "remove", &a, KeyState::RuleRemoving, e);
                }
                let Some(d) = desired else {
                    info!(key = %key, rule = %a, "rule removed");
                    self.entries.remove(key);
                    return Outcome::Removed;
                };
                self.set(key, KeyState::RuleDesired, None);
                match self.applier.ensure(&d).await {
                    Ok(_) => {
                        info!(key = %key, old = %a, new = %d, "rule replaced");
                        self.set(key, KeyState::RulePresent, Some(d));
                        Outcome::Replaced
                    }
                    Err(e) => self.failed(key, "ensure", &d, KeyState::RuleDesired, e),
                }
            }
        }
    }

    fn set(&mut self, key: &ObjectKey, state: KeyState, applied: Option<SnatRule>) {
        match self.entries.get_mut(key) {
            Some(e) => { e.state = state; e.applied = applied; }
            None => { self.entries.insert(key.clone(), Entry { state, applied }); }
        }
    }

    /// Record a failed table call. The applied rule is left as it was before the call.
    fn failed(&mut self, key: &ObjectKey, op: &'static str, rule: &SnatRule, state: KeyState, e: ApplyError) -> Outcome {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.state = state;
        }
        if e.is_transient() {
            warn!(key = %key, op, rule = %rule, error = %e, "rule op failed; will retry");
        } else {
            error!(key = %key, op, rule = %rule, error = %e, "rule op failed");
        }
        counter!("snat_reconcile_failures_total", 1u64, "op" => op, "class" => e.class());
        Outcome::Failed(e)
    }
}

pub(crate) fn record_resync(t0: Instant, report: &ResyncReport) {
    metrics::histogram!("snat_resync_ms", t0.elapsed().as_secs_f64() * 1000.0);
    counter!("snat_resync_total", 1u64);
    metrics::gauge!("snat_applied_rules", report.rules as f64);
}

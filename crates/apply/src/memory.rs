//! In-process rule table. Backs `--dry-run` and the test suites: records every call, counts effective
//! mutations, and lets callers inject failures or tamper with the table behind the applier's back.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use rustc_hash::FxHashSet;
use tracing::debug;

use crate::table::{Family, Mutation, RuleTable, TableRule};
use crate::ApplyError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Ensure,
    Delete,
    List,
    EnsureChain,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpRecord {
    pub op: Op,
    pub rule: Option<TableRule>,
    pub result: Result<Mutation, ApplyError>,
}

#[derive(Default)]
struct State {
    rules: Vec<TableRule>,
    chains: FxHashSet<(Family, String)>,
    /// Chains deleted behind the applier's back; rule calls against them behave like iptables.
    missing: FxHashSet<String>,
    log: Vec<OpRecord>,
    failures: VecDeque<(Op, ApplyError)>,
}

#[derive(Default)]
pub struct MemoryTable {
    state: Mutex<State>,
}

impl MemoryTable {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current rules in insertion-head-first order.
    pub fn rules(&self) -> Vec<TableRule> { self.lock().rules.clone() }

    pub fn contains(&self, rule: &TableRule) -> bool { self.lock().rules.iter().any(|r| r == rule) }

    /// Make the next call of `op` fail with `err`. Queued failures are consumed in order.
    pub fn fail_next(&self, op: Op, err: ApplyError) { self.lock().failures.push_back((op, err)); }

    /// Drop a rule without going through the applier (simulated drift).
    pub fn remove_externally(&self, rule: &TableRule) -> bool {
        let mut st = self.lock();
        let before = st.rules.len();
        st.rules.retain(|r| r != rule);
        st.rules.len() != before
    }

    /// Add a rule without going through the applier (left over from an earlier process).
    pub fn insert_externally(&self, rule: TableRule) { self.lock().rules.insert(0, rule); }

    /// Delete `chain` and its rules without going through the applier. Until `ensure_chain` recreates it,
    /// `ensure` and `list` fail with [`ApplyError::MissingChain`] and `delete` finds nothing.
    pub fn drop_chain(&self, chain: &str) {
        let mut st = self.lock();
        st.rules.retain(|r| r.chain != chain);
        st.chains.retain(|(_, c)| c != chain);
        st.missing.insert(chain.to_string());
    }

    pub fn log(&self) -> Vec<OpRecord> { self.lock().log.clone() }

    /// Successful calls of `op` that changed the table.
    pub fn mutations(&self, op: Op) -> usize {
        self.lock().log.iter().filter(|r| r.op == op && matches!(r.result, Ok(Mutation::Applied))).count()
    }

    /// All calls of `op` touching `rule`, whatever their outcome.
    pub fn calls_for(&self, op: Op, rule: &TableRule) -> usize {
        self.lock().log.iter().filter(|r| r.op == op && r.rule.as_ref() == Some(rule)).count()
    }

    pub fn clear_log(&self) { self.lock().log.clear(); }

    fn take_failure(st: &mut State, op: Op) -> Option<ApplyError> {
        let idx = st.failures.iter().position(|(o, _)| *o == op)?;
        st.failures.remove(idx).map(|(_, e)| e)
    }

    fn record(st: &mut State, op: Op, rule: Option<&TableRule>, result: Result<Mutation, ApplyError>) -> Result<Mutation, ApplyError> {
        st.log.push(OpRecord { op, rule: rule.cloned(), result: result.clone() });
        result
    }
}

#[async_trait::async_trait]
impl RuleTable for MemoryTable {
    async fn ensure(&self, rule: &TableRule) -> Result<Mutation, ApplyError> {
        let mut st = self.lock();
        if let Some(e) = Self::take_failure(&mut st, Op::Ensure) {
            return Self::record(&mut st, Op::Ensure, Some(rule), Err(e));
        }
        if st.missing.contains(&rule.chain) {
            let err = ApplyError::MissingChain(format!("chain {} does not exist", rule.chain));
            return Self::record(&mut st, Op::Ensure, Some(rule), Err(err));
        }
        let res = if st.rules.contains(rule) {
            Mutation::Unchanged
        } else {
            st.rules.insert(0, rule.clone());
            Mutation::Applied
        };
        debug!(rule = %rule, ?res, "memory ensure");
        Self::record(&mut st, Op::Ensure, Some(rule), Ok(res))
    }

    async fn delete(&self, rule: &TableRule) -> Result<Mutation, ApplyError> {
        let mut st = self.lock();
        if let Some(e) = Self::take_failure(&mut st, Op::Delete) {
            return Self::record(&mut st, Op::Delete, Some(rule), Err(e));
        }
        let before = st.rules.len();
        st.rules.retain(|r| r != rule);
        let res = if st.rules.len() != before { Mutation::Applied } else { Mutation::Unchanged };
        debug!(rule = %rule, ?res, "memory delete");
        Self::record(&mut st, Op::Delete, Some(rule), Ok(res))
    }

    async fn list(&self, family: Family, chain: &str) -> Result<Vec<TableRule>, ApplyError> {
        let mut st = self.lock();
        if let Some(e) = Self::take_failure(&mut st, Op::List) {
            st.log.push(OpRecord { op: Op::List, rule: None, result: Err(e.clone()) });
            return Err(e);
        }
        if st.missing.contains(chain) {
            let err = ApplyError::MissingChain(format!("chain {chain} does not exist"));
            st.log.push(OpRecord { op: Op::List, rule: None, result: Err(err.clone()) });
            return Err(err);
        }
        let out: Vec<TableRule> = st.rules.iter().filter(|r| r.chain == chain && r.family() == family).cloned().collect();
        st.log.push(OpRecord { op: Op::List, rule: None, result: Ok(Mutation::Unchanged) });
        Ok(out)
    }

    async fn ensure_chain(&self, family: Family, chain: &str) -> Result<Mutation, ApplyError> {
        let mut st = self.lock();
        if let Some(e) = Self::take_failure(&mut st, Op::EnsureChain) {
            return Self::record(&mut st, Op::EnsureChain, None, Err(e));
        }
        st.missing.remove(chain);
        let res = if st.chains.insert((family, chain.to_string())) { Mutation::Applied } else { Mutation::Unchanged };
        Self::record(&mut st, Op::EnsureChain, None, Ok(res))
    }

    fn name(&self) -> &'static str { "memory" }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::Action;

    fn rule(src: &str, to: &str) -> TableRule {
        TableRule { chain: "KUBE-POSTROUTING".into(), source: src.parse().unwrap(), action: Action::SnatTo(to.parse().unwrap()) }
    }

    #[tokio::test]
    async fn ensure_and_delete_are_idempotent() {
        let t = MemoryTable::new();
        let r = rule("1.1.1.1", "10.0.0.5");
        assert_eq!(t.ensure(&r).await, Ok(Mutation::Applied));
        assert_eq!(t.ensure(&r).await, Ok(Mutation::Unchanged));
        assert_eq!(t.rules().len(), 1);
        assert_eq!(t.delete(&r).await, Ok(Mutation::Applied));
        assert_eq!(t.delete(&r).await, Ok(Mutation::Unchanged));
        assert!(t.rules().is_empty());
        assert_eq!(t.mutations(Op::Ensure), 1);
        assert_eq!(t.calls_for(Op::Delete, &r), 2);
    }

    #[tokio::test]
    async fn injected_failure_is_consumed_once() {
        let t = MemoryTable::new();
        let r = rule("1.1.1.1", "10.0.0.5");
        t.fail_next(Op::Ensure, ApplyError::Transient("lock".into()));
        assert!(t.ensure(&r).await.is_err());
        assert!(!t.contains(&r));
        assert_eq!(t.ensure(&r).await, Ok(Mutation::Applied));
    }

    #[tokio::test]
    async fn list_filters_by_chain_and_family() {
        let t = MemoryTable::new();
        t.ensure(&rule("1.1.1.1", "10.0.0.5")).await.unwrap();
        t.ensure(&rule("fd00::1", "fd00::5")).await.unwrap();
        let mut other = rule("1.1.1.2", "10.0.0.5");
        other.chain = "OTHER".into();
        t.insert_externally(other);
        assert_eq!(t.list(Family::V4, "KUBE-POSTROUTING").await.unwrap().len(), 1);
        assert_eq!(t.list(Family::V6, "KUBE-POSTROUTING").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn dropped_chain_fails_ensure_but_not_delete() {
        let t = MemoryTable::new();
        let r = rule("1.1.1.1", "10.0.0.5");
        t.ensure(&r).await.unwrap();
        t.drop_chain("KUBE-POSTROUTING");
        assert!(!t.contains(&r));
        assert_eq!(t.delete(&r).await, Ok(Mutation::Unchanged));
        assert!(matches!(t.ensure(&r).await, Err(ApplyError::MissingChain(_))));
        assert!(matches!(t.list(Family::V4, "KUBE-POSTROUTING").await, Err(ApplyError::MissingChain(_))));

        assert_eq!(t.ensure_chain(Family::V4, "KUBE-POSTROUTING").await, Ok(Mutation::Applied));
        assert_eq!(t.ensure(&r).await, Ok(Mutation::Applied));
    }
}

//! egress-snat apply: idempotent ensure/remove of SNAT rules on top of a [`RuleTable`] backend.
//!
//! [`RuleApplier`] validates descriptors, retries transient table failures with bounded backoff, and
//! records timings. It does not serialize callers; the engine holds per-address locks around it.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use snat_core::SnatRule;
use thiserror::Error;
use tracing::{debug, warn};

pub mod iptables;
pub mod memory;
pub mod table;

pub use iptables::IptablesTable;
pub use memory::MemoryTable;
pub use table::{Action, Family, Mutation, RuleTable, TableRule, OWNER_COMMENT};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApplyError {
    /// Lock contention, busy resource, timeout. Worth retrying.
    #[error("transient table failure: {0}")]
    Transient(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("invalid rule: {0}")]
    InvalidRule(String),
    #[error("chain missing: {0}")]
    MissingChain(String),
    #[error("table command failed: {0}")]
    Command(String),
}

impl ApplyError {
    pub fn is_transient(&self) -> bool { matches!(self, ApplyError::Transient(_)) }

    pub fn class(&self) -> &'static str {
        if self.is_transient() { "transient" } else { "structural" }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self { Self { attempts: 3, backoff: Duration::from_millis(200) } }
}

impl RetryPolicy {
    /// Delay before retry number `n` (1-based): backoff, 2*backoff, 4*backoff ...
    pub fn delay(&self, n: u32) -> Duration {
        self.backoff.saturating_mul(1u32 << n.saturating_sub(1).min(10))
    }
}

pub struct RuleApplier {
    table: Arc<dyn RuleTable>,
    chain: String,
    retry: RetryPolicy,
}

impl RuleApplier {
    pub fn new(table: Arc<dyn RuleTable>, chain: impl Into<String>, retry: RetryPolicy) -> Self {
        Self { table, chain: chain.into(), retry }
    }

    pub fn chain(&self) -> &str { &self.chain }
    pub fn backend(&self) -> &'static str { self.table.name() }

    /// Build the table rule for `rule`, rejecting descriptors that would produce bad match criteria.
    pub fn table_rule(&self, rule: &SnatRule) -> Result<TableRule, ApplyError> {
        if rule.source.is_unspecified() || rule.target.is_unspecified() {
            return Err(ApplyError::InvalidRule(format!("unspecified address in {rule}")));
        }
        if rule.source.is_ipv4() != rule.target.is_ipv4() {
            return Err(ApplyError::InvalidRule(format!("mixed address families in {rule}")));
        }
        Ok(TableRule { chain: self.chain.clone(), source: rule.source, action: Action::SnatTo(rule.target) })
    }

    pub async fn ensure(&self, rule: &SnatRule) -> Result<Mutation, ApplyError> {
        let tr = self.table_rule(rule)?;
        self.with_retry("ensure", &tr, || self.table.ensure(&tr)).await
    }

    pub async fn remove(&self, rule: &SnatRule) -> Result<Mutation, ApplyError> {
        let tr = self.table_rule(rule)?;
        self.with_retry("remove", &tr, || self.table.delete(&tr)).await
    }

    /// Owned rules currently in the chain, across both families. A family whose listing fails
    /// structurally (e.g. no ip6tables on the host) is skipped.
    pub async fn list_owned(&self) -> Result<Vec<SnatRule>, ApplyError> {
        let mut out = Vec::new();
        for family in [Family::V4, Family::V6] {
            match self.table.list(family, &self.chain).await {
                Ok(rules) => out.extend(rules.into_iter().map(|r| {
                    let Action::SnatTo(target) = r.action;
                    SnatRule { source: r.source, target }
                })),
                Err(e) if family == Family::V6 && !e.is_transient() => {
                    debug!(error = %e, "ipv6 listing unavailable; skipping");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    /// Make sure the chain exists and is reachable from POSTROUTING.
    pub async fn prepare_chain(&self, family: Family) -> Result<Mutation, ApplyError> {
        self.table.ensure_chain(family, &self.chain).await
    }

    async fn with_retry<F, Fut>(&self, op: &'static str, rule: &TableRule, mut call: F) -> Result<Mutation, ApplyError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<Mutation, ApplyError>>,
    {
        let t0 = Instant::now();
        let mut attempt = 1u32;
        let res = loop {
            match call().await {
                Err(e) if e.is_transient() && attempt < self.retry.attempts => {
                    let delay = self.retry.delay(attempt);
                    warn!(op, rule = %rule, attempt, delay_ms = %delay.as_millis(), error = %e, "transient table failure; retrying");
                    counter!("snat_rule_op_retries_total", 1u64, "op" => op);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => break other,
            }
        };
        histogram!("snat_rule_op_ms", t0.elapsed().as_secs_f64() * 1000.0, "op" => op);
        let result = match &res {
            Ok(Mutation::Applied) => "applied",
            Ok(Mutation::Unchanged) => "unchanged",
            Err(e) => e.class(),
        };
        counter!("snat_rule_ops_total", 1u64, "op" => op, "result" => result);
        debug!(op, rule = %rule, result, attempts = attempt, "rule op done");
        res
    }
}

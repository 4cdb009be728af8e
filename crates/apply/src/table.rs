//! Rule-table interface: the narrow surface the applier needs from a netfilter backend.

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::ApplyError;

/// Comment attached to every rule this controller writes. Used to tell our rules apart in shared chains.
pub const OWNER_COMMENT: &str = "egress-snat";

pub const NAT_TABLE: &str = "nat";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn of(ip: &IpAddr) -> Self {
        if ip.is_ipv4() { Family::V4 } else { Family::V6 }
    }

    pub fn host_prefix(&self) -> u8 {
        match self {
            Family::V4 => 32,
            Family::V6 => 128,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Family::V4 => "ipv4",
            Family::V6 => "ipv6",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    SnatTo(IpAddr),
}

/// One rule in a nat chain: match criteria plus action.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableRule {
    pub chain: String,
    pub source: IpAddr,
    pub action: Action,
}

impl TableRule {
    pub fn family(&self) -> Family { Family::of(&self.source) }

    /// Match criteria and target as iptables arguments (everything after the chain name).
    pub fn rule_args(&self) -> Vec<String> {
        let Action::SnatTo(to) = self.action;
        vec![
            "-s".into(),
            format!("{}/{}", self.source, self.family().host_prefix()),
            "-m".into(),
            "comment".into(),
            "--comment".into(),
            OWNER_COMMENT.into(),
            "-j".into(),
            "SNAT".into(),
            "--to-source".into(),
            to.to_string(),
        ]
    }
}

impl fmt::Display for TableRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Action::SnatTo(to) = self.action;
        write!(f, "{}: src={} snat-to={}", self.chain, self.source, to)
    }
}

/// Whether an idempotent call actually changed the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mutation {
    Applied,
    Unchanged,
}

impl Mutation {
    pub fn changed(&self) -> bool { matches!(self, Mutation::Applied) }
}

/// Netfilter backend. Both mutating calls converge: `ensure` leaves exactly one matching rule in the chain,
/// `delete` leaves none, whatever the prior contents were.
#[async_trait::async_trait]
pub trait RuleTable: Send + Sync {
    async fn ensure(&self, rule: &TableRule) -> Result<Mutation, ApplyError>;

    async fn delete(&self, rule: &TableRule) -> Result<Mutation, ApplyError>;

    /// Rules in `chain` carrying [`OWNER_COMMENT`]; foreign rules are skipped.
    async fn list(&self, family: Family, chain: &str) -> Result<Vec<TableRule>, ApplyError>;

    /// Create `chain` and a jump to it from POSTROUTING when missing.
    async fn ensure_chain(&self, family: Family, chain: &str) -> Result<Mutation, ApplyError>;

    fn name(&self) -> &'static str;
}

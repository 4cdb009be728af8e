//! egress-snat core types: object keys, rule descriptors, change events and sharding.

#![forbid(unsafe_code)]

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

pub mod config;
pub mod extract;

pub use config::{Config, ConfigError};
pub use extract::{extract, ExtractionError};

/// Identity of a watched object (`namespace/name`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A single SNAT rule: traffic sourced from `source` leaves with `target` as its source address.
/// The rule's identity in the table is the pair itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SnatRule {
    pub source: IpAddr,
    pub target: IpAddr,
}

impl fmt::Display for SnatRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "src={} snat-to={}", self.source, self.target)
    }
}

/// What should exist in the table for one object. `rule == None` means no rule is wanted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredRule {
    pub key: ObjectKey,
    pub rule: Option<SnatRule>,
}

impl DesiredRule {
    pub fn absent(key: ObjectKey) -> Self { Self { key, rule: None } }
    pub fn present(&self) -> bool { self.rule.is_some() }
}

/// The subset of a pod the extractor looks at. Projected by the event source so the core never sees the
/// full object schema.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectSnapshot {
    /// Raw value of the configured target annotation, if set.
    pub target_annotation: Option<String>,
    /// Status address (pod IP); empty until the pod is running.
    pub status_address: Option<String>,
    pub host_network: bool,
    /// Pod reached `Succeeded` or `Failed`.
    pub terminal: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Add,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Add => "add",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub key: ObjectKey,
    pub object: ObjectSnapshot,
}

/// What an event source delivers to the engine.
#[derive(Debug, Clone)]
pub enum SourceEvent {
    Change(ChangeEvent),
    /// The watch (re)started; this is the complete current object set.
    Relisted(Vec<(ObjectKey, ObjectSnapshot)>),
}

pub mod prelude {
    pub use super::{
        ChangeEvent, ChangeKind, DesiredRule, ObjectKey, ObjectSnapshot, SnatRule, SourceEvent,
        ShardPlanner,
    };
}

/// Maps object keys onto a fixed number of worker shards using FNV-1a over `namespace/name`.
/// Stable across runs so per-key ordering holds for the lifetime of a process.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ShardPlanner { shards: usize }

impl ShardPlanner {
    pub fn new(shards: usize) -> Self { Self { shards: shards.max(1) } }

    pub fn shards(&self) -> usize { self.shards }

    pub fn shard_for(&self, key: &ObjectKey) -> usize {
        if self.shards <= 1 { return 0; }
        let mut h: u64 = 0xcbf29ce484222325; // 64-bit FNV-1a offset
        let bytes = key.namespace.as_bytes().iter().chain(b"/").chain(key.name.as_bytes());
        for b in bytes { h ^= *b as u64; h = h.wrapping_mul(0x100000001b3); }
        (h % self.shards as u64) as usize
    }
}

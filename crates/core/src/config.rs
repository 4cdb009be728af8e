//! Controller configuration. Built once at startup and never mutated afterwards.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Longest chain name the kernel accepts (XT_EXTENSION_MAXNAMELEN - 1).
pub const MAX_CHAIN_LEN: usize = 28;

pub const DEFAULT_CHAIN: &str = "KUBE-POSTROUTING";
pub const DEFAULT_ANNOTATION: &str = "egressSNATIpAddress";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("resync interval must be greater than zero")]
    ZeroResyncInterval,
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("invalid chain name {0:?}")]
    InvalidChain(String),
    #[error("annotation key must not be empty")]
    EmptyAnnotation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub resync_interval: Duration,
    /// NAT chain the SNAT rules live in.
    pub chain: String,
    /// Pod annotation carrying the SNAT target address.
    pub annotation_key: String,
    /// Restrict the watch to pods scheduled on this node.
    pub node_name: Option<String>,
    pub workers: usize,
    pub queue_capacity: usize,
    pub op_timeout: Duration,
    pub retry_attempts: u32,
    pub retry_backoff: Duration,
    pub prune_orphans: bool,
    pub create_chain: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            resync_interval: Duration::from_secs(60),
            chain: DEFAULT_CHAIN.to_string(),
            annotation_key: DEFAULT_ANNOTATION.to_string(),
            node_name: None,
            workers: 4,
            queue_capacity: 2048,
            op_timeout: Duration::from_secs(10),
            retry_attempts: 3,
            retry_backoff: Duration::from_millis(200),
            prune_orphans: true,
            create_chain: false,
        }
    }
}

pub fn valid_chain_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_CHAIN_LEN
        && !name.starts_with('-')
        && name.chars().all(|c| c.is_ascii_graphic())
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.resync_interval.is_zero() { return Err(ConfigError::ZeroResyncInterval); }
        if self.workers == 0 { return Err(ConfigError::Zero("workers")); }
        if self.queue_capacity == 0 { return Err(ConfigError::Zero("queue capacity")); }
        if self.retry_attempts == 0 { return Err(ConfigError::Zero("retry attempts")); }
        if self.op_timeout.is_zero() { return Err(ConfigError::Zero("operation timeout")); }
        if !valid_chain_name(&self.chain) { return Err(ConfigError::InvalidChain(self.chain.clone())); }
        if self.annotation_key.trim().is_empty() { return Err(ConfigError::EmptyAnnotation); }
        Ok(())
    }
}

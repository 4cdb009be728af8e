use std::net::SocketAddr;
use std::time::Duration;

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use snat_core::config::{DEFAULT_ANNOTATION, DEFAULT_CHAIN};
use snat_core::Config;

#[derive(Parser, Debug)]
#[command(name = "snatd", version, about = "Egress SNAT controller")]
pub struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    pub output: Output,

    #[command(flatten)]
    pub opts: Opts,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum Output { Human, Json }

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Watch pods and keep SNAT rules in step with their annotations
    Run,
    /// List the SNAT rules this controller owns in the chain
    Rules,
    /// Remove every SNAT rule this controller owns from the chain
    Flush,
}

#[derive(clap::Args, Debug)]
pub struct Opts {
    /// Seconds between full resyncs
    #[arg(long = "resync-interval", env = "SNAT_RESYNC_SECS", default_value_t = 60, global = true)]
    pub resync_secs: u64,

    /// NAT chain holding the rules
    #[arg(long, env = "SNAT_CHAIN", default_value = DEFAULT_CHAIN, global = true)]
    pub chain: String,

    /// Pod annotation carrying the SNAT target address
    #[arg(long, env = "SNAT_ANNOTATION", default_value = DEFAULT_ANNOTATION, global = true)]
    pub annotation: String,

    /// Only handle pods scheduled on this node
    #[arg(long = "node-name", env = "SNAT_NODE_NAME", global = true)]
    pub node_name: Option<String>,

    #[arg(long, env = "SNAT_WORKERS", default_value_t = 4, global = true)]
    pub workers: usize,

    #[arg(long = "queue-cap", env = "SNAT_QUEUE_CAP", default_value_t = 2048, global = true)]
    pub queue_cap: usize,

    /// Per-command timeout for iptables, in seconds
    #[arg(long = "op-timeout", env = "SNAT_OP_TIMEOUT_SECS", default_value_t = 10, global = true)]
    pub op_timeout_secs: u64,

    #[arg(long = "retry-attempts", env = "SNAT_RETRY_ATTEMPTS", default_value_t = 3, global = true)]
    pub retry_attempts: u32,

    #[arg(long = "retry-backoff-ms", env = "SNAT_RETRY_BACKOFF_MS", default_value_t = 200, global = true)]
    pub retry_backoff_ms: u64,

    /// Remove owned rules no pod asks for during resync
    #[arg(long = "prune-orphans", env = "SNAT_PRUNE_ORPHANS", default_value_t = true, action = ArgAction::Set, global = true)]
    pub prune_orphans: bool,

    /// Create the chain and its POSTROUTING jump at startup if missing
    #[arg(long = "create-chain", env = "SNAT_CREATE_CHAIN", action = ArgAction::SetTrue, global = true)]
    pub create_chain: bool,

    /// Apply rules to an in-memory table instead of iptables (`run` only)
    #[arg(long = "dry-run", env = "SNAT_DRY_RUN", action = ArgAction::SetTrue, global = true)]
    pub dry_run: bool,

    /// IPv4 backend binary, e.g. iptables-legacy
    #[arg(long = "iptables-binary", env = "SNAT_IPTABLES", default_value = "iptables", global = true)]
    pub iptables_binary: String,

    /// IPv6 backend binary, e.g. ip6tables-legacy
    #[arg(long = "ip6tables-binary", env = "SNAT_IP6TABLES", default_value = "ip6tables", global = true)]
    pub ip6tables_binary: String,

    /// Serve Prometheus metrics on host:port
    #[arg(long = "metrics-addr", env = "SNAT_METRICS_ADDR", global = true)]
    pub metrics_addr: Option<SocketAddr>,
}

impl Cli {
    /// Reject flag combinations that parse but make no sense for the chosen command.
    pub fn check(&self) -> anyhow::Result<()> {
        if self.opts.dry_run && self.command != Commands::Run {
            anyhow::bail!("--dry-run only applies to `run`; `rules` and `flush` always act on the live table");
        }
        Ok(())
    }
}

impl Opts {
    pub fn to_config(&self) -> Config {
        Config {
            resync_interval: Duration::from_secs(self.resync_secs),
            chain: self.chain.clone(),
            annotation_key: self.annotation.clone(),
            node_name: self.node_name.clone().filter(|n| !n.is_empty()),
            workers: self.workers,
            queue_capacity: self.queue_cap,
            op_timeout: Duration::from_secs(self.op_timeout_secs),
            retry_attempts: self.retry_attempts,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            prune_orphans: self.prune_orphans,
            create_chain: self.create_chain,
        }
    }
}

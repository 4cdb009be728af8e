//! `iptables` / `ip6tables` backend. Every invocation waits on the xtables lock (`-w`) and is bounded by a
//! timeout; the child is killed if the timeout fires.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info};

use crate::table::{Action, Family, Mutation, RuleTable, TableRule, NAT_TABLE, OWNER_COMMENT};
use crate::ApplyError;

/// Upper bound on identical rules removed by one `delete` call.
const MAX_DUPLICATES: usize = 16;

const BUILTIN_NAT_CHAINS: [&str; 4] = ["PREROUTING", "INPUT", "OUTPUT", "POSTROUTING"];

/// Result of one process run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl RunOutput {
    pub fn success(&self) -> bool { self.code == Some(0) }
}

/// Runs one backend binary to completion.
#[async_trait::async_trait]
pub trait Exec: Send + Sync {
    async fn exec(&self, bin: &str, args: &[String], timeout: Duration) -> Result<RunOutput, ApplyError>;
}

/// Spawns a child process; the child is killed when `timeout` fires.
pub struct ProcessExec;

#[async_trait::async_trait]
impl Exec for ProcessExec {
    async fn exec(&self, bin: &str, args: &[String], timeout: Duration) -> Result<RunOutput, ApplyError> {
        let mut cmd = Command::new(bin);
        cmd.args(args).kill_on_drop(true);
        let out = match tokio::time::timeout(timeout, cmd.output()).await {
            Err(_) => return Err(ApplyError::Transient(format!("{bin} timed out after {timeout:?}"))),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ApplyError::Command(format!("{bin} not found")));
            }
            Ok(Err(e)) => return Err(ApplyError::Transient(format!("spawning {bin}: {e}"))),
            Ok(Ok(o)) => o,
        };
        Ok(RunOutput {
            code: out.status.code(),
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
        })
    }
}

pub struct IptablesTable {
    binary_v4: String,
    binary_v6: String,
    timeout: Duration,
    exec: Arc<dyn Exec>,
}

impl IptablesTable {
    pub fn new(timeout: Duration) -> Self {
        Self { binary_v4: "iptables".into(), binary_v6: "ip6tables".into(), timeout, exec: Arc::new(ProcessExec) }
    }

    pub fn with_exec(mut self, exec: Arc<dyn Exec>) -> Self {
        self.exec = exec;
        self
    }

    /// Override the binaries, e.g. `iptables-legacy`.
    pub fn with_binaries(mut self, v4: impl Into<String>, v6: impl Into<String>) -> Self {
        self.binary_v4 = v4.into();
        self.binary_v6 = v6.into();
        self
    }

    fn binary(&self, family: Family) -> &str {
        match family {
            Family::V4 => &self.binary_v4,
            Family::V6 => &self.binary_v6,
        }
    }

    fn base_args(&self) -> Vec<String> {
        let wait = self.timeout.as_secs().max(1);
        vec!["-w".into(), wait.to_string(), "-t".into(), NAT_TABLE.into()]
    }

    async fn run(&self, family: Family, args: &[String]) -> Result<RunOutput, ApplyError> {
        let bin = self.binary(family);
        let mut full = self.base_args();
        full.extend(args.iter().cloned());
        debug!(binary = %bin, args = %full.join(" "), "exec");
        self.exec.exec(bin, &full, self.timeout).await
    }

    async fn check(&self, rule: &TableRule) -> Result<bool, ApplyError> {
        let mut args = vec!["-C".to_string(), rule.chain.clone()];
        args.extend(rule.rule_args());
        let out = self.run(rule.family(), &args).await?;
        check_result(&out)
    }

    /// `check` for removal: a missing chain holds no rule.
    async fn present(&self, rule: &TableRule) -> Result<bool, ApplyError> {
        match self.check(rule).await {
            Err(ApplyError::MissingChain(msg)) => {
                debug!(rule = %rule, error = %msg, "chain missing; nothing to delete");
                Ok(false)
            }
            other => other,
        }
    }

    async fn check_jump(&self, family: Family, chain: &str) -> Result<bool, ApplyError> {
        let args = vec!["-C".into(), "POSTROUTING".into(), "-j".into(), chain.to_string()];
        check_result(&self.run(family, &args).await?)
    }
}

/// Interpret a `-C` run: exit 0 means present, a plain "bad rule" exit 1 means absent.
pub fn check_result(out: &RunOutput) -> Result<bool, ApplyError> {
    if out.success() { return Ok(true); }
    match classify(out) {
        ApplyError::Command(_) if out.code == Some(1) => Ok(false),
        e => Err(e),
    }
}

/// Map a failed run onto the error taxonomy.
pub fn classify(out: &RunOutput) -> ApplyError {
    let msg = if out.stderr.is_empty() { format!("exit code {:?}", out.code) } else { out.stderr.clone() };
    let lower = msg.to_lowercase();
    if lower.contains("permission denied") || lower.contains("you must be root") || lower.contains("operation not permitted") {
        return ApplyError::PermissionDenied(msg);
    }
    if lower.contains("xtables lock") || lower.contains("resource temporarily unavailable") || lower.contains("device or resource busy") {
        return ApplyError::Transient(msg);
    }
    if lower.contains("no chain/target/match by that name") || lower.contains("does not exist") {
        return ApplyError::MissingChain(msg);
    }
    match out.code {
        Some(2) => ApplyError::InvalidRule(msg),
        Some(4) => ApplyError::Transient(msg),
        _ => ApplyError::Command(msg),
    }
}

fn strip_prefix_len(s: &str) -> &str { s.split('/').next().unwrap_or(s) }

/// Parse one `-S` line into a rule we own. Foreign or unparseable lines yield `None`.
pub fn parse_rule_line(line: &str) -> Option<TableRule> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let mut chain = None;
    let mut source = None;
    let mut to = None;
    let mut comment = None;
    let mut jump = None;
    let mut i = 0;
    while i < tokens.len() {
        let next = tokens.get(i + 1).copied();
        match tokens[i] {
            "-A" => chain = next,
            "-s" => source = next,
            "--comment" => comment = next.map(|c| c.trim_matches('"')),
            "-j" => jump = next,
            "--to-source" => to = next,
            _ => { i += 1; continue; }
        }
        i += 2;
    }
    if comment != Some(OWNER_COMMENT) || jump != Some("SNAT") { return None; }
    let source: IpAddr = strip_prefix_len(source?).parse().ok()?;
    let to: IpAddr = to?.trim_start_matches('[').trim_end_matches(']').parse().ok()?;
    Some(TableRule { chain: chain?.to_string(), source, action: Action::SnatTo(to) })
}

#[async_trait::async_trait]
impl RuleTable for IptablesTable {
    async fn ensure(&self, rule: &TableRule) -> Result<Mutation, ApplyError> {
        if self.check(rule).await? { return Ok(Mutation::Unchanged); }
        let mut args = vec!["-I".to_string(), rule.chain.clone()];
        args.extend(rule.rule_args());
        let out = self.run(rule.family(), &args).await?;
        if !out.success() { return Err(classify(&out)); }
        Ok(Mutation::Applied)
    }

    async fn delete(&self, rule: &TableRule) -> Result<Mutation, ApplyError> {
        let mut removed = 0usize;
        while removed < MAX_DUPLICATES && self.present(rule).await? {
            let mut args = vec!["-D".to_string(), rule.chain.clone()];
            args.extend(rule.rule_args());
            let out = self.run(rule.family(), &args).await?;
            if !out.success() {
                // Lost a race with another writer between -C and -D: the rule or its chain is already gone.
                match check_result(&out) {
                    Ok(_) | Err(ApplyError::MissingChain(_)) => break,
                    Err(e) => return Err(e),
                }
            }
            removed += 1;
        }
        Ok(if removed > 0 { Mutation::Applied } else { Mutation::Unchanged })
    }

    async fn list(&self, family: Family, chain: &str) -> Result<Vec<TableRule>, ApplyError> {
        let out = self.run(family, &["-S".into(), chain.to_string()]).await?;
        if !out.success() { return Err(classify(&out)); }
        Ok(out.stdout.lines().filter_map(parse_rule_line).filter(|r| r.chain == chain).collect())
    }

    async fn ensure_chain(&self, family: Family, chain: &str) -> Result<Mutation, ApplyError> {
        if BUILTIN_NAT_CHAINS.contains(&chain) { return Ok(Mutation::Unchanged); }
        let mut changed = false;
        let listing = self.run(family, &["-S".into(), chain.to_string()]).await?;
        if !listing.success() {
            match classify(&listing) {
                ApplyError::MissingChain(_) | ApplyError::Command(_) => {
                    let out = self.run(family, &["-N".into(), chain.to_string()]).await?;
                    if !out.success() { return Err(classify(&out)); }
                    info!(family = family.as_str(), chain = %chain, "created chain");
                    changed = true;
                }
                e => return Err(e),
            }
        }
        if !self.check_jump(family, chain).await? {
            let args = vec!["-I".into(), "POSTROUTING".into(), "-j".into(), chain.to_string()];
            let out = self.run(family, &args).await?;
            if !out.success() { return Err(classify(&out)); }
            info!(family = family.as_str(), chain = %chain, "inserted POSTROUTING jump");
            changed = true;
        }
        Ok(if changed { Mutation::Applied } else { Mutation::Unchanged })
    }

    fn name(&self) -> &'static str { "iptables" }
}

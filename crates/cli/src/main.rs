use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use snat_apply::{Family, IptablesTable, MemoryTable, RetryPolicy, RuleApplier, RuleTable};
use snat_core::Config;
use snat_engine::{Engine, EngineOptions};
use snat_kubehub::{run_pod_source, SourceOptions};
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod args;

use args::{Cli, Commands, Opts, Output};

fn init_tracing() {
    let env = std::env::var("SNAT_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics(addr: Option<SocketAddr>) {
    let Some(sock) = addr else { return };
    match metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(sock).install() {
        Ok(()) => info!(addr = %sock, "Prometheus metrics exporter listening"),
        Err(e) => warn!(error = %e, "failed to install metrics exporter"),
    }
}

fn build_applier(cfg: &Config, opts: &Opts) -> Arc<RuleApplier> {
    let table: Arc<dyn RuleTable> = if opts.dry_run {
        Arc::new(MemoryTable::new())
    } else {
        Arc::new(IptablesTable::new(cfg.op_timeout).with_binaries(&opts.iptables_binary, &opts.ip6tables_binary))
    };
    let retry = RetryPolicy { attempts: cfg.retry_attempts, backoff: cfg.retry_backoff };
    Arc::new(RuleApplier::new(table, cfg.chain.clone(), retry))
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable; waiting for ctrl-c only");
                let _ = signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
    }
}

async fn run(opts: &Opts, cfg: Config) -> Result<()> {
    init_metrics(opts.metrics_addr);
    let applier = build_applier(&cfg, opts);
    info!(
        backend = applier.backend(),
        chain = %cfg.chain,
        annotation = %cfg.annotation_key,
        node = ?cfg.node_name,
        resync_secs = cfg.resync_interval.as_secs(),
        "snatd starting"
    );
    if cfg.create_chain {
        applier.prepare_chain(Family::V4).await.with_context(|| format!("preparing chain {}", cfg.chain))?;
    }
    let client = snat_kubehub::kube_client().await?;

    let cancel = CancellationToken::new();
    let (tx, rx) = mpsc::channel(cfg.queue_capacity);
    let engine = Engine::new(applier, EngineOptions::from_config(&cfg)).spawn(rx, cancel.clone());
    let source_opts = SourceOptions::new(cfg.annotation_key.clone(), cfg.node_name.clone());
    let source = tokio::spawn(run_pod_source(client, source_opts, tx, cancel.clone()));

    shutdown_signal().await;
    info!("shutdown requested");
    cancel.cancel();
    if let Err(e) = source.await {
        warn!(error = %e, "pod source task failed");
    }
    engine.join().await;
    info!("snatd stopped");
    Ok(())
}

async fn rules(applier: &RuleApplier, output: Output) -> Result<()> {
    let mut owned = applier.list_owned().await.with_context(|| format!("listing chain {}", applier.chain()))?;
    owned.sort_by_key(|r| (r.source, r.target));
    match output {
        Output::Human => {
            println!("{:<40} {}", "SOURCE", "SNAT-TO");
            for r in &owned {
                println!("{:<40} {}", r.source, r.target);
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(&owned)?),
    }
    Ok(())
}

async fn flush(applier: &RuleApplier) -> Result<()> {
    let owned = applier.list_owned().await.with_context(|| format!("listing chain {}", applier.chain()))?;
    let mut removed = 0usize;
    for rule in &owned {
        applier.remove(rule).await.with_context(|| format!("removing {rule}"))?;
        removed += 1;
    }
    info!(removed, chain = applier.chain(), "flushed owned rules");
    println!("removed {removed} rule(s) from {}", applier.chain());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    cli.check()?;
    let cfg = cli.opts.to_config();
    cfg.validate().context("invalid configuration")?;

    match cli.command {
        Commands::Run => run(&cli.opts, cfg).await,
        Commands::Rules => rules(&build_applier(&cfg, &cli.opts), cli.output).await,
        Commands::Flush => flush(&build_applier(&cfg, &cli.opts)).await,
    }
}

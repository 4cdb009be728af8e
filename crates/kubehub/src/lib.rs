//! egress-snat kubehub: list+watch of Pods, projected into typed change events for the engine.

#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::{Context, Result};
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::Api,
    runtime::watcher::{self, Event},
    Client, ResourceExt,
};
use metrics::counter;
use rustc_hash::FxHashMap;
use snat_core::{ChangeEvent, ChangeKind, ObjectKey, ObjectSnapshot, SourceEvent};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("pod watch failed: {0}")]
    Watch(#[from] watcher::Error),
    #[error("event channel closed")]
    ChannelClosed,
}

#[derive(Debug, Clone)]
pub struct SourceOptions {
    pub annotation_key: String,
    /// Only watch pods bound to this node.
    pub node_name: Option<String>,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
}

impl SourceOptions {
    pub fn new(annotation_key: impl Into<String>, node_name: Option<String>) -> Self {
        Self {
            annotation_key: annotation_key.into(),
            node_name,
            backoff_min: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
        }
    }

    pub fn field_selector(&self) -> Option<String> {
        self.node_name.as_deref().map(|n| format!("spec.nodeName={n}"))
    }
}

pub async fn kube_client() -> Result<Client> {
    Client::try_default().await.context("building kube client from kubeconfig or in-cluster env")
}

/// Project a pod onto the fields the extractor reads.
pub fn project(pod: &Pod, annotation_key: &str) -> (ObjectKey, ObjectSnapshot) {
    let key = ObjectKey::new(pod.namespace().unwrap_or_else(|| "default".to_string()), pod.name_any());
    let status = pod.status.as_ref();
    let snapshot = ObjectSnapshot {
        target_annotation: pod.annotations().get(annotation_key).cloned(),
        status_address: status.and_then(|s| s.pod_ip.clone()).filter(|ip| !ip.is_empty()),
        host_network: pod.spec.as_ref().and_then(|s| s.host_network).unwrap_or(false),
        terminal: matches!(status.and_then(|s| s.phase.as_deref()), Some("Succeeded") | Some("Failed")),
    };
    (key, snapshot)
}

/// Turns raw watch events into Add/Update/Delete, dropping redeliveries of the same resourceVersion.
#[derive(Default)]
pub struct EventLabeler {
    seen: FxHashMap<ObjectKey, String>,
}

impl EventLabeler {
    pub fn new() -> Self { Self::default() }

    pub fn applied(&mut self, key: ObjectKey, rv: String, object: ObjectSnapshot) -> Option<ChangeEvent> {
        let kind = match self.seen.get(&key) {
            Some(prev) if !rv.is_empty() && *prev == rv => return None,
            Some(_) => ChangeKind::Update,
            None => ChangeKind::Add,
        };
        self.seen.insert(key.clone(), rv);
        Some(ChangeEvent { kind, key, object })
    }

    pub fn deleted(&mut self, key: ObjectKey, object: ObjectSnapshot) -> ChangeEvent {
        self.seen.remove(&key);
        ChangeEvent { kind: ChangeKind::Delete, key, object }
    }

    pub fn restarted(&mut self, list: Vec<(ObjectKey, String, ObjectSnapshot)>) -> SourceEvent {
        self.seen.clear();
        let mut objects = Vec::with_capacity(list.len());
        for (key, rv, object) in list {
            self.seen.insert(key.clone(), rv);
            objects.push((key, object));
        }
        SourceEvent::Relisted(objects)
    }

    pub fn len(&self) -> usize { self.seen.len() }
    pub fn is_empty(&self) -> bool { self.seen.is_empty() }
}

/// Capped exponential backoff for resubscribing.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self { Self { min, max, next: min } }

    pub fn next_delay(&mut self) -> Duration {
        let cur = self.next;
        self.next = (self.next * 2).min(self.max);
        cur
    }

    pub fn reset(&mut self) { self.next = self.min; }
}

fn rv_of(pod: &Pod) -> String { pod.resource_version().unwrap_or_default() }

/// One list+watch attempt. Returns when the stream errors or ends.
async fn watch_pods(
    client: Client,
    opts: &SourceOptions,
    tx: &mpsc::Sender<SourceEvent>,
    backoff: &mut Backoff,
) -> Result<(), SourceError> {
    let api: Api<Pod> = Api::all(client);
    let mut cfg = watcher::Config::default();
    if let Some(sel) = opts.field_selector() {
        cfg = cfg.fields(&sel);
    }
    let stream = watcher::watcher(api, cfg);
    futures::pin_mut!(stream);
    let mut labeler = EventLabeler::new();
    info!(node = ?opts.node_name, annotation = %opts.annotation_key, "pod watcher started");
    while let Some(ev) = stream.try_next().await? {
        let out = match ev {
            Event::Applied(pod) => {
                let (key, snap) = project(&pod, &opts.annotation_key);
                match labeler.applied(key, rv_of(&pod), snap) {
                    Some(change) => SourceEvent::Change(change),
                    None => continue,
                }
            }
            Event::Deleted(pod) => {
                let (key, snap) = project(&pod, &opts.annotation_key);
                SourceEvent::Change(labeler.deleted(key, snap))
            }
            Event::Restarted(pods) => {
                debug!(count = pods.len(), "watch restart");
                backoff.reset();
                let list = pods.iter().map(|p| {
                    let (key, snap) = project(p, &opts.annotation_key);
                    (key, rv_of(p), snap)
                }).collect();
                labeler.restarted(list)
            }
        };
        if let SourceEvent::Change(c) = &out {
            counter!("snat_events_total", 1u64, "kind" => c.kind.as_str());
        }
        tx.send(out).await.map_err(|_| SourceError::ChannelClosed)?;
    }
    warn!("pod watch stream ended");
    Ok(())
}

/// Supervise the pod watch until cancelled: failures are logged and resubscribed with backoff. Every
/// resubscription starts with a full relist, which the engine uses to catch up.
pub async fn run_pod_source(client: Client, opts: SourceOptions, tx: mpsc::Sender<SourceEvent>, cancel: CancellationToken) {
    let mut backoff = Backoff::new(opts.backoff_min, opts.backoff_max);
    loop {
        let res = tokio::select! {
            _ = cancel.cancelled() => break,
            r = watch_pods(client.clone(), &opts, &tx, &mut backoff) => r,
        };
        match res {
            Ok(()) => {}
            Err(SourceError::ChannelClosed) => {
                info!("engine stopped receiving; pod source exiting");
                break;
            }
            Err(e) => warn!(error = %e, "pod watch failed; resubscribing"),
        }
        counter!("snat_source_restarts_total", 1u64);
        let delay = backoff.next_delay();
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    info!("pod source stopped");
}

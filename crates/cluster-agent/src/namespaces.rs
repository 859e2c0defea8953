//! Managed namespaces.
//!
//! Keeps the namespaces the console declares for this cluster present, with
//! the labels and annotations the console (and the owning service's
//! namespace metadata) ask for.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, ObjectMeta, PostParams};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cache::Cache;
use crate::client::{ConsoleClient, ManagedNamespace};
use crate::error::ConsoleError;
use crate::queue::WorkQueue;
use crate::reconciler::{ReconcileContext, ReconcileResult, Reconciler, ReconcilerState};
use crate::socket::{Publisher, QueuePublisher};

pub const IDENTIFIER: &str = "namespaces";
pub const EVENT: &str = "namespace.event";

pub struct NamespaceReconciler {
    console: ConsoleClient,
    kube: kube::Client,
    state: Arc<ReconcilerState<ManagedNamespace>>,
    page_size: u32,
}

impl NamespaceReconciler {
    pub fn new(console: ConsoleClient, kube: kube::Client, refresh: Duration, page_size: u32) -> Self {
        let fetcher = console.clone();
        let cache = Cache::new(refresh, move |id: String| {
            let fetcher = fetcher.clone();
            async move { fetcher.get_namespace(&id).await.map_err(anyhow::Error::from) }
        });

        Self {
            console,
            kube,
            state: Arc::new(ReconcilerState::new(cache)),
            page_size,
        }
    }

    #[must_use]
    pub fn cache(&self) -> &Cache<ManagedNamespace> {
        self.state.cache()
    }

    async fn upsert(&self, namespace: &ManagedNamespace) -> anyhow::Result<()> {
        let (labels, annotations) = desired_metadata(namespace);
        let api: Api<Namespace> = Api::all(self.kube.clone());

        let Some(mut existing) = api.get_opt(&namespace.name).await? else {
            info!(name = %namespace.name, "creating namespace");
            let created = Namespace {
                metadata: ObjectMeta {
                    name: Some(namespace.name.clone()),
                    labels: Some(labels),
                    annotations: Some(annotations),
                    ..ObjectMeta::default()
                },
                ..Namespace::default()
            };
            api.create(&PostParams::default(), &created).await?;
            return Ok(());
        };

        let labels_changed = merge_into(&mut existing.metadata.labels, &labels);
        let annotations_changed = merge_into(&mut existing.metadata.annotations, &annotations);
        if labels_changed || annotations_changed {
            info!(name = %namespace.name, "updating namespace metadata");
            api.replace(&namespace.name, &PostParams::default(), &existing)
                .await?;
        } else {
            debug!(name = %namespace.name, "namespace up to date");
        }

        Ok(())
    }
}

#[async_trait]
impl Reconciler for NamespaceReconciler {
    async fn reconcile(&self, _ctx: &ReconcileContext, id: &str) -> anyhow::Result<ReconcileResult> {
        info!(id = %id, "attempting to sync namespace");
        let namespace = match self.state.cache().get(id).await {
            Ok(namespace) => namespace,
            Err(e) if e.downcast_ref::<ConsoleError>().is_some_and(ConsoleError::is_not_found) => {
                info!(id = %id, "namespace already deleted");
                return Ok(ReconcileResult::done());
            }
            Err(e) => return Err(e.context(format!("failed to fetch namespace {id}"))),
        };

        self.upsert(&namespace).await?;
        Ok(ReconcileResult::done())
    }

    async fn poll(&self, cancel: &CancellationToken) -> anyhow::Result<()> {
        debug!("fetching namespaces");
        let mut after: Option<String> = None;

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            let page = self.console.list_namespaces(after.as_deref(), self.page_size).await?;
            let queue = self.state.queue();
            for edge in page.edges {
                let id = edge.node.id.clone();
                debug!(id = %id, "sending update for namespace");
                self.state.cache().add(&id, edge.node);
                queue.add(&id);
            }

            match page.page_info.end_cursor {
                Some(cursor) if page.page_info.has_next_page => after = Some(cursor),
                _ => return Ok(()),
            }
        }
    }

    fn queue(&self) -> Arc<WorkQueue> {
        self.state.queue()
    }

    fn publisher(&self) -> (String, Arc<dyn Publisher>) {
        (EVENT.to_string(), Arc::new(QueuePublisher::new(&self.state)))
    }

    fn restart(&self) {
        self.state.recycle();
    }

    fn shutdown(&self) {
        self.state.shutdown();
    }
}

/// Labels and annotations the namespace should carry. The service's
/// namespace metadata wins over the namespace's own on conflicts.
fn desired_metadata(namespace: &ManagedNamespace) -> (BTreeMap<String, String>, BTreeMap<String, String>) {
    let mut labels = namespace.labels.as_ref().map(strings).unwrap_or_default();
    let mut annotations = namespace.annotations.as_ref().map(strings).unwrap_or_default();

    let metadata = namespace
        .service
        .as_ref()
        .and_then(|s| s.sync_config.as_ref())
        .and_then(|c| c.namespace_metadata.as_ref());
    if let Some(metadata) = metadata {
        labels.extend(strings(&metadata.labels));
        annotations.extend(strings(&metadata.annotations));
    }

    (labels, annotations)
}

/// Non-string values are dropped.
fn strings(map: &BTreeMap<String, Value>) -> BTreeMap<String, String> {
    map.iter()
        .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
        .collect()
}

/// Merge `desired` into `current`, keeping keys set by others (e.g. the
/// `kubernetes.io/metadata.name` label). Returns whether anything changed.
fn merge_into(current: &mut Option<BTreeMap<String, String>>, desired: &BTreeMap<String, String>) -> bool {
    let current = current.get_or_insert_with(BTreeMap::new);
    let mut changed = false;
    for (key, value) in desired {
        if current.get(key) != Some(value) {
            current.insert(key.clone(), value.clone());
            changed = true;
        }
    }
    changed
}

//! Keel kubehub: one kube client per configured cluster, namespace listing
//! and label merge-patches.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use keel_apply::LabelSink;
use keel_inventory::{Changes, NamespaceRef, NamespaceSource, ObservedNamespace};
use kube::{
    api::{Api, ListParams, Patch, PatchParams},
    config::KubeConfigOptions,
    Client, Config,
};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as Json};
use tracing::{debug, info, warn};

const FIELD_MANAGER: &str = "keel";

/// A cluster entry in the configuration; `context` names a kubeconfig context,
/// defaulting to the inferred in-cluster/current one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSpec {
    pub name: String,
    #[serde(default)]
    pub context: Option<String>,
}

async fn client_for(spec: &ClusterSpec) -> Result<Client> {
    let config = match spec.context.as_deref() {
        Some(ctx) => {
            let opts = KubeConfigOptions { context: Some(ctx.to_string()), ..Default::default() };
            Config::from_kubeconfig(&opts)
                .await
                .with_context(|| format!("loading kubeconfig context {}", ctx))?
        }
        None => Config::infer().await.context("inferring kube config")?,
    };
    Client::try_from(config).context("building kube client")
}

/// Connected clusters. Clusters whose client cannot be built are left out
/// and therefore never handled.
#[derive(Clone, Default)]
pub struct KubeClusters {
    clients: BTreeMap<String, Client>,
}

impl KubeClusters {
    pub async fn connect(specs: &[ClusterSpec]) -> Self {
        let attempts = futures::future::join_all(specs.iter().map(|spec| async move {
            let t0 = Instant::now();
            let res = client_for(spec).await;
            (spec, res, t0.elapsed())
        }))
        .await;

        let mut clients = BTreeMap::new();
        for (spec, res, took) in attempts {
            match res {
                Ok(client) => {
                    debug!(cluster = %spec.name, took_ms = %took.as_millis(), "cluster client ready");
                    clients.insert(spec.name.clone(), client);
                }
                Err(e) => {
                    counter!("kube_connect_err", 1u64);
                    warn!(cluster = %spec.name, error = %e, "cluster unreachable; not handled this run");
                }
            }
        }
        info!(connected = clients.len(), configured = specs.len(), "clusters connected");
        Self { clients }
    }

    fn client(&self, cluster: &str) -> Option<Client> { self.clients.get(cluster).cloned() }
}

#[async_trait]
impl NamespaceSource for KubeClusters {
    fn clusters(&self) -> Vec<String> { self.clients.keys().cloned().collect() }

    async fn namespaces(&self, cluster: &str) -> Result<Option<Vec<ObservedNamespace>>> {
        let Some(client) = self.client(cluster) else { return Ok(None) };
        let t0 = Instant::now();
        let api: Api<Namespace> = Api::all(client);
        let list = api
            .list(&ListParams::default())
            .await
            .with_context(|| format!("listing namespaces on {}", cluster))?;
        histogram!("kube_list_namespaces_ms", t0.elapsed().as_secs_f64() * 1000.0);
        let out = list.items.into_iter().filter_map(observed).collect::<Vec<_>>();
        debug!(cluster, count = out.len(), "namespaces listed");
        Ok(Some(out))
    }
}

fn observed(ns: Namespace) -> Option<ObservedNamespace> {
    let name = ns.metadata.name?;
    Some(ObservedNamespace { name, labels: ns.metadata.labels.unwrap_or_default() })
}

/// Merge-patch body for a label change set; removals become `null`.
pub fn label_patch(changes: &Changes) -> Json {
    let labels: serde_json::Map<String, Json> = changes
        .iter()
        .map(|(k, v)| (k.clone(), v.as_ref().map_or(Json::Null, |v| Json::String(v.clone()))))
        .collect();
    json!({ "metadata": { "labels": labels } })
}

#[async_trait]
impl LabelSink for KubeClusters {
    async fn patch_labels(&self, unit: &NamespaceRef, changes: &Changes) -> Result<()> {
        let client = self.client(&unit.cluster).ok_or_else(|| anyhow!("cluster {} is not connected", unit.cluster))?;
        let api: Api<Namespace> = Api::all(client);
        let pp = PatchParams { field_manager: Some(FIELD_MANAGER.to_string()), ..Default::default() };
        api.patch(&unit.namespace, &pp, &Patch::Merge(&label_patch(changes)))
            .await
            .with_context(|| format!("patching labels of namespace {}", unit))?;
        Ok(())
    }
}

//! Kubernetes Gateway Adapter
//!
//! Maps volume claims onto PersistentVolumeClaims and name reservations onto
//! DiskNaming resources. Every API call is bounded by the request timeout;
//! API server status codes are translated into the gateway error taxonomy.

use crate::crd::{DiskNaming, DiskNamingSpec};
use crate::domain::disk::{Scope, MANAGED_LABEL, ORG_LABEL, PROJECT_LABEL};
use crate::domain::ports::{
    Mutation, NameReservation, NameReservationSpec, OrchestratorGateway, Resource, ResourceKey,
    ResourceKind, ResourceSpec, ScopeFilter, UsageSample, VolumeClaim, VolumeClaimPhase,
    VolumeClaimSpec,
};
use crate::domain::quantity::{format_quantity, parse_quantity};
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use k8s_openapi::api::core::v1::{
    Namespace, Node, PersistentVolumeClaim, PersistentVolumeClaimSpec, Pod,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::Client;
use serde::Deserialize;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Kubelets queried at once when collecting volume stats
const NODE_STATS_CONCURRENCY: usize = 8;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the Kubernetes gateway
#[derive(Debug, Clone)]
pub struct KubeGatewayConfig {
    /// Upper bound for a single API call
    pub request_timeout: Duration,
    /// Access mode requested for new claims
    pub access_mode: String,
    /// Field manager recorded on patches
    pub field_manager: String,
}

impl Default for KubeGatewayConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            access_mode: "ReadWriteOnce".to_string(),
            field_manager: "tenant-disk-operator".to_string(),
        }
    }
}

// =============================================================================
// Kubelet Stats
// =============================================================================

/// Subset of the kubelet `/stats/summary` document
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatsSummary {
    #[serde(default)]
    pods: Vec<PodStats>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodStats {
    #[serde(default)]
    volume: Vec<VolumeStats>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VolumeStats {
    used_bytes: Option<u64>,
    pvc_ref: Option<PvcRef>,
}

#[derive(Debug, Default, Deserialize)]
struct PvcRef {
    name: String,
    namespace: String,
}

impl StatsSummary {
    fn samples(self) -> impl Iterator<Item = UsageSample> {
        self.pods
            .into_iter()
            .flat_map(|pod| pod.volume)
            .filter_map(|volume| {
                let pvc = volume.pvc_ref?;
                Some(UsageSample {
                    key: ResourceKey::new(pvc.namespace, pvc.name),
                    used_bytes: volume.used_bytes?,
                })
            })
    }
}

/// Await an API call for at most `timeout`; expiry counts as `Unavailable`
async fn bounded<T, F>(operation: &str, timeout: Duration, fut: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, kube::Error>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result.map_err(|e| map_kube_error(operation, e)),
        Err(_) => Err(Error::unavailable(
            operation,
            format!("timed out after {:?}", timeout),
        )),
    }
}

// =============================================================================
// Kubernetes Gateway
// =============================================================================

/// Gateway talking to the Kubernetes API server
pub struct KubeGateway {
    client: Client,
    config: KubeGatewayConfig,
}

impl KubeGateway {
    /// Create a new Kubernetes gateway
    pub fn new(client: Client, config: KubeGatewayConfig) -> Self {
        Self { client, config }
    }

    /// Run one API call under the request timeout
    async fn call<T, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, kube::Error>>,
    {
        bounded(operation, self.config.request_timeout, fut).await
    }

    fn claims(&self, namespace: &str) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn reservations(&self, namespace: &str) -> Api<DiskNaming> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn patch_params(&self) -> PatchParams {
        PatchParams {
            field_manager: Some(self.config.field_manager.clone()),
            ..Default::default()
        }
    }

    async fn list_objects<K>(&self, api: Api<K>, selector: String) -> Result<Vec<K>>
    where
        K: kube::Resource + Clone + std::fmt::Debug + serde::de::DeserializeOwned,
    {
        let params = ListParams::default().labels(&selector);
        let list = self.call("list", api.list(&params)).await?;
        Ok(list.items)
    }

    /// Usage of every PVC mounted on one node
    async fn node_usage(&self, node: &str) -> Result<Vec<UsageSample>> {
        let path = format!(
            "/api/v1/nodes/{}/proxy/stats/summary",
            urlencoding::encode(node)
        );
        let request = hyper::Request::get(path)
            .body(Vec::new())
            .map_err(|e| Error::Internal(format!("bad stats request: {}", e)))?;
        let summary: StatsSummary = self.call("node stats", self.client.request(request)).await?;
        Ok(summary.samples().collect())
    }
}

/// Translate API server errors into gateway errors
fn map_kube_error(operation: &str, err: kube::Error) -> Error {
    match &err {
        kube::Error::Api(response) => match response.code {
            404 => Error::NotFound {
                kind: operation.to_string(),
                name: response.message.clone(),
            },
            409 if response.reason == "AlreadyExists" => Error::AlreadyExists {
                kind: operation.to_string(),
                name: response.message.clone(),
            },
            409 => Error::Conflict {
                kind: operation.to_string(),
                name: response.message.clone(),
            },
            _ => Error::unavailable(operation, &err),
        },
        _ => Error::unavailable(operation, &err),
    }
}

/// Label selector for a scope filter
fn selector_for(filter: &ScopeFilter, managed_only: bool) -> String {
    let mut terms = Vec::new();
    if managed_only {
        terms.push(format!("{}=true", MANAGED_LABEL));
    }
    if let Some(org) = &filter.org {
        terms.push(format!("{}={}", ORG_LABEL, org));
    }
    if let Some(project) = &filter.project {
        terms.push(format!("{}={}", PROJECT_LABEL, project));
    }
    terms.join(",")
}

// =============================================================================
// Conversions
// =============================================================================

fn storage_quantity(map: Option<&BTreeMap<String, Quantity>>) -> Result<Option<u64>> {
    map.and_then(|m| m.get("storage"))
        .map(|q| parse_quantity(&q.0))
        .transpose()
}

fn claim_to_pvc(spec: &VolumeClaimSpec, access_mode: &str) -> PersistentVolumeClaim {
    let mut requests = BTreeMap::new();
    requests.insert(
        "storage".to_string(),
        Quantity(format_quantity(spec.requested_bytes)),
    );

    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(spec.key.name.clone()),
            namespace: Some(spec.key.namespace.clone()),
            labels: Some(spec.labels.clone()),
            annotations: Some(spec.annotations.clone()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec![access_mode.to_string()]),
            storage_class_name: spec.storage_class.clone(),
            resources: Some(VolumeResourceRequirements {
                requests: Some(requests),
                ..Default::default()
            }),
            ..Default::default()
        }),
        status: None,
    }
}

fn pvc_to_claim(pvc: PersistentVolumeClaim) -> Result<VolumeClaim> {
    let meta = pvc.metadata;
    let key = ResourceKey::new(
        meta.namespace.unwrap_or_default(),
        meta.name.unwrap_or_default(),
    );
    let spec = pvc.spec.unwrap_or_default();
    let requested_bytes = storage_quantity(
        spec.resources
            .as_ref()
            .and_then(|r| r.requests.as_ref()),
    )?
    .unwrap_or(0);

    let status = pvc.status.unwrap_or_default();
    let phase = match status.phase.as_deref() {
        Some("Bound") => VolumeClaimPhase::Bound,
        Some("Lost") => VolumeClaimPhase::Lost,
        _ => VolumeClaimPhase::Pending,
    };

    Ok(VolumeClaim {
        key,
        storage_class: spec.storage_class_name,
        requested_bytes,
        capacity_bytes: storage_quantity(status.capacity.as_ref())?,
        phase,
        labels: meta.labels.unwrap_or_default(),
        annotations: meta.annotations.unwrap_or_default(),
        version: meta.resource_version,
        created_at: meta.creation_timestamp.map(|t| t.0),
    })
}

fn reservation_to_crd(spec: &NameReservationSpec) -> DiskNaming {
    let mut naming = DiskNaming::new(
        &spec.key.name,
        DiskNamingSpec {
            disk_id: spec.disk_id.clone(),
            reserved_at: Some(spec.reserved_at),
        },
    );
    naming.metadata.namespace = Some(spec.key.namespace.clone());
    naming.metadata.labels = Some(spec.labels.clone());
    naming
}

fn crd_to_reservation(naming: DiskNaming) -> NameReservation {
    let meta = naming.metadata;
    NameReservation {
        key: ResourceKey::new(
            meta.namespace.unwrap_or_default(),
            meta.name.unwrap_or_default(),
        ),
        disk_id: naming.spec.disk_id,
        labels: meta.labels.unwrap_or_default(),
        reserved_at: naming.spec.reserved_at,
        version: meta.resource_version,
        created_at: meta.creation_timestamp.map(|t| t.0),
    }
}

/// Merge patch body for a mutation
fn merge_patch(kind: ResourceKind, mutation: &Mutation) -> serde_json::Value {
    let mut metadata = serde_json::Map::new();
    if let Some(version) = &mutation.expected_version {
        metadata.insert("resourceVersion".into(), json!(version));
    }
    if !mutation.labels.is_empty() {
        metadata.insert("labels".into(), json!(mutation.labels));
    }
    if !mutation.annotations.is_empty() {
        metadata.insert("annotations".into(), json!(mutation.annotations));
    }

    let mut body = serde_json::Map::new();
    body.insert("metadata".into(), serde_json::Value::Object(metadata));

    if kind == ResourceKind::NameReservation {
        let mut spec = serde_json::Map::new();
        if let Some(disk_id) = &mutation.disk_id {
            spec.insert("diskId".into(), json!(disk_id));
        }
        if let Some(at) = mutation.reserved_at {
            spec.insert("reservedAt".into(), json!(at));
        }
        if !spec.is_empty() {
            body.insert("spec".into(), serde_json::Value::Object(spec));
        }
    }
    serde_json::Value::Object(body)
}

#[async_trait]
impl OrchestratorGateway for KubeGateway {
    async fn create(&self, spec: ResourceSpec) -> Result<Resource> {
        let pp = PostParams::default();
        match spec {
            ResourceSpec::VolumeClaim(spec) => {
                let pvc = claim_to_pvc(&spec, &self.config.access_mode);
                let created = self
                    .call(
                        "create PersistentVolumeClaim",
                        self.claims(&spec.key.namespace).create(&pp, &pvc),
                    )
                    .await?;
                debug!("Created PVC {}", spec.key);
                Ok(Resource::VolumeClaim(pvc_to_claim(created)?))
            }
            ResourceSpec::NameReservation(spec) => {
                let naming = reservation_to_crd(&spec);
                let created = self
                    .call(
                        "create DiskNaming",
                        self.reservations(&spec.key.namespace).create(&pp, &naming),
                    )
                    .await?;
                debug!("Created DiskNaming {}", spec.key);
                Ok(Resource::NameReservation(crd_to_reservation(created)))
            }
        }
    }

    async fn get(&self, kind: ResourceKind, key: &ResourceKey) -> Result<Resource> {
        match kind {
            ResourceKind::VolumeClaim => {
                let pvc = self
                    .call(
                        "get PersistentVolumeClaim",
                        self.claims(&key.namespace).get(&key.name),
                    )
                    .await?;
                Ok(Resource::VolumeClaim(pvc_to_claim(pvc)?))
            }
            ResourceKind::NameReservation => {
                let naming = self
                    .call(
                        "get DiskNaming",
                        self.reservations(&key.namespace).get(&key.name),
                    )
                    .await?;
                Ok(Resource::NameReservation(crd_to_reservation(naming)))
            }
        }
    }

    async fn list(&self, kind: ResourceKind, filter: &ScopeFilter) -> Result<Vec<Resource>> {
        let namespace = filter.as_scope().map(|scope| scope.namespace());
        match kind {
            ResourceKind::VolumeClaim => {
                let api = match &namespace {
                    Some(ns) => self.claims(ns),
                    None => Api::all(self.client.clone()),
                };
                self.list_objects(api, selector_for(filter, true))
                    .await?
                    .into_iter()
                    .map(|pvc| pvc_to_claim(pvc).map(Resource::VolumeClaim))
                    .collect()
            }
            ResourceKind::NameReservation => {
                let api = match &namespace {
                    Some(ns) => self.reservations(ns),
                    None => Api::all(self.client.clone()),
                };
                Ok(self
                    .list_objects(api, selector_for(filter, false))
                    .await?
                    .into_iter()
                    .map(|naming| Resource::NameReservation(crd_to_reservation(naming)))
                    .collect())
            }
        }
    }

    async fn delete(&self, kind: ResourceKind, key: &ResourceKey) -> Result<()> {
        let dp = DeleteParams::default();
        match kind {
            ResourceKind::VolumeClaim => {
                self.call(
                    "delete PersistentVolumeClaim",
                    self.claims(&key.namespace).delete(&key.name, &dp),
                )
                .await?;
            }
            ResourceKind::NameReservation => {
                self.call(
                    "delete DiskNaming",
                    self.reservations(&key.namespace).delete(&key.name, &dp),
                )
                .await?;
            }
        }
        debug!("Deleted {} {}", kind, key);
        Ok(())
    }

    async fn patch(
        &self,
        kind: ResourceKind,
        key: &ResourceKey,
        mutation: Mutation,
    ) -> Result<Resource> {
        let body = merge_patch(kind, &mutation);
        let pp = self.patch_params();
        let patch = Patch::Merge(&body);
        match kind {
            ResourceKind::VolumeClaim => {
                let pvc = self
                    .call(
                        "patch PersistentVolumeClaim",
                        self.claims(&key.namespace).patch(&key.name, &pp, &patch),
                    )
                    .await?;
                Ok(Resource::VolumeClaim(pvc_to_claim(pvc)?))
            }
            ResourceKind::NameReservation => {
                let naming = self
                    .call(
                        "patch DiskNaming",
                        self.reservations(&key.namespace).patch(&key.name, &pp, &patch),
                    )
                    .await?;
                Ok(Resource::NameReservation(crd_to_reservation(naming)))
            }
        }
    }

    async fn ensure_namespace(&self, scope: &Scope) -> Result<String> {
        let name = scope.namespace();
        let api: Api<Namespace> = Api::all(self.client.clone());
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                labels: Some(scope.labels()),
                ..Default::default()
            },
            ..Default::default()
        };

        match self
            .call("create Namespace", api.create(&PostParams::default(), &namespace))
            .await
        {
            Ok(_) => {
                info!("Created namespace {} for {}", name, scope);
                Ok(name)
            }
            Err(Error::AlreadyExists { .. }) => Ok(name),
            Err(e) => Err(e),
        }
    }

    async fn usage_samples(&self) -> Result<Vec<UsageSample>> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let nodes = self.call("list Node", nodes.list(&ListParams::default())).await?;

        let names: Vec<String> = nodes
            .items
            .into_iter()
            .filter_map(|node| node.metadata.name)
            .collect();
        let per_node: Vec<(String, Result<Vec<UsageSample>>)> = stream::iter(names)
            .map(|name| async move {
                let result = self.node_usage(&name).await;
                (name, result)
            })
            .buffer_unordered(NODE_STATS_CONCURRENCY)
            .collect()
            .await;

        let mut samples = Vec::new();
        for (name, result) in per_node {
            // one unreachable kubelet must not hide usage from the others
            match result {
                Ok(node_samples) => samples.extend(node_samples),
                Err(e) => warn!("Failed to read volume stats from node {}: {}", name, e),
            }
        }
        Ok(samples)
    }

    async fn mounted_claims(&self) -> Result<Vec<ResourceKey>> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let params = ListParams::default().fields("status.phase=Running");
        let pods = self.call("list Pod", pods.list(&params)).await?;

        let mut mounted = BTreeSet::new();
        for pod in pods.items {
            let namespace = pod.metadata.namespace.unwrap_or_default();
            let volumes = pod.spec.and_then(|s| s.volumes).unwrap_or_default();
            for volume in volumes {
                if let Some(source) = volume.persistent_volume_claim {
                    mounted.insert(ResourceKey::new(namespace.clone(), source.claim_name));
                }
            }
        }
        Ok(mounted.into_iter().collect())
    }

    fn gateway_name(&self) -> &str {
        "kubernetes"
    }
}

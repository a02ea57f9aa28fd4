use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{
    api::{ApiResource, DynamicObject, TypeMeta},
    core::ErrorResponse,
    ResourceExt,
};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{matches_selector, to_dynamic, ObjectStore, Selector};
use crate::{Error, Result};

type Key = (String, String, Option<String>, String);

/// One mutation performed through the store
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteRecord {
    pub verb: &'static str,
    pub kind: String,
    pub name: String,
}

#[derive(Default)]
struct Inner {
    objects: BTreeMap<Key, DynamicObject>,
    resource_version: u64,
    writes: Vec<WriteRecord>,
    manual_readiness: bool,
    allocated_ports: u16,
}

/// In-memory stand-in for the API server
///
/// Mimics the parts of the server the reconciler relies on: `resourceVersion`
/// conflicts, generations, finalizers, deletion timestamps and owner based garbage
/// collection. StatefulSets report themselves ready as soon as they are written,
/// unless manual readiness is requested.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

fn key(resource: &ApiResource, namespace: Option<&str>, name: &str) -> Key {
    (
        resource.api_version.clone(),
        resource.kind.clone(),
        namespace.map(String::from),
        name.to_string(),
    )
}

fn not_found(resource: &ApiResource, name: &str) -> Error {
    Error::KubeError(kube::Error::Api(ErrorResponse {
        status: "Failure".into(),
        message: format!("{} {name:?} not found", resource.kind),
        reason: "NotFound".into(),
        code: 404,
    }))
}

impl Inner {
    fn next_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }

    fn record(&mut self, verb: &'static str, resource: &ApiResource, name: &str) {
        self.writes.push(WriteRecord {
            verb,
            kind: resource.kind.clone(),
            name: name.into(),
        });
    }

    /// The part of the server's defaulting that owned objects run into
    fn apply_defaults(&mut self, object: &mut DynamicObject) {
        let kind = object.types.as_ref().map(|t| t.kind.clone()).unwrap_or_default();
        let Some(spec) = object.data.get_mut("spec").filter(|s| s.is_object()) else {
            return;
        };
        match kind.as_str() {
            "StatefulSet" => {
                let strategy = &mut spec["updateStrategy"];
                if strategy.is_null() {
                    *strategy = json!({ "type": "RollingUpdate" });
                }
                if strategy["type"] == "RollingUpdate" && strategy["rollingUpdate"].is_null() {
                    strategy["rollingUpdate"] = json!({ "partition": 0 });
                }
                if let Some(pod) = spec.pointer_mut("/template/spec") {
                    default_pod_spec(pod);
                }
            }
            "Service" => {
                if spec["type"].is_null() {
                    spec["type"] = json!("ClusterIP");
                }
                let exposed = matches!(spec["type"].as_str(), Some("NodePort" | "LoadBalancer"));
                if spec["clusterIP"].is_null() {
                    self.allocated_ports += 1;
                    spec["clusterIP"] = json!(format!("10.96.0.{}", self.allocated_ports % 250 + 1));
                }
                let ports = spec.get_mut("ports").and_then(Value::as_array_mut);
                for port in ports.into_iter().flatten().filter_map(Value::as_object_mut) {
                    port.entry("protocol").or_insert(json!("TCP"));
                    let target = port.get("port").cloned().unwrap_or(Value::Null);
                    port.entry("targetPort").or_insert(target);
                    if exposed && !port.contains_key("nodePort") {
                        self.allocated_ports += 1;
                        port.insert("nodePort".into(), json!(30000 + self.allocated_ports));
                    }
                }
            }
            _ => {}
        }
    }

    fn mark_ready(&self, object: &mut DynamicObject) {
        let is_statefulset = object
            .types
            .as_ref()
            .is_some_and(|t| t.kind == "StatefulSet");
        if self.manual_readiness || !is_statefulset {
            return;
        }
        let replicas = object.data["spec"]["replicas"].as_i64().unwrap_or(1);
        let mut status = object.data.get("status").cloned().unwrap_or_else(|| json!({}));
        status["replicas"] = json!(replicas);
        status["readyReplicas"] = json!(replicas);
        object.data["status"] = status;
    }

    fn remove(&mut self, key: &Key) {
        let Some(removed) = self.objects.remove(key) else {
            return;
        };
        let mut gone: BTreeSet<String> = removed.metadata.uid.into_iter().collect();

        // cascade to dependents whose every owner is gone
        loop {
            let live: BTreeSet<String> = self
                .objects
                .values()
                .filter_map(|o| o.metadata.uid.clone())
                .collect();
            let orphans: Vec<Key> = self
                .objects
                .iter()
                .filter(|(_, o)| {
                    let owners = o.owner_references();
                    !owners.is_empty()
                        && owners.iter().any(|r| gone.contains(&r.uid))
                        && owners.iter().all(|r| !live.contains(&r.uid))
                })
                .map(|(k, _)| k.clone())
                .collect();
            if orphans.is_empty() {
                break;
            }
            for orphan in orphans {
                if let Some(o) = self.objects.remove(&orphan) {
                    gone.extend(o.metadata.uid);
                }
            }
        }
    }
}

fn default_pod_spec(pod: &mut Value) {
    let volumes = pod.get_mut("volumes").and_then(Value::as_array_mut);
    for volume in volumes.into_iter().flatten() {
        for source in ["secret", "configMap"] {
            if let Some(source) = volume.get_mut(source).and_then(Value::as_object_mut) {
                source.entry("defaultMode").or_insert(json!(420));
            }
        }
    }
    for list in ["containers", "initContainers"] {
        let containers = pod.get_mut(list).and_then(Value::as_array_mut);
        for container in containers.into_iter().flatten() {
            let ports = container.get_mut("ports").and_then(Value::as_array_mut);
            for port in ports.into_iter().flatten().filter_map(Value::as_object_mut) {
                port.entry("protocol").or_insert(json!("TCP"));
            }
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// StatefulSets stay unready until [`MemoryStore::set_ready`] is called.
    pub fn with_manual_readiness() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                manual_readiness: true,
                ..Default::default()
            })),
        }
    }

    /// Seed an object without counting it as a write.
    pub async fn insert<K: Serialize>(&self, object: &K) -> Result<DynamicObject> {
        let mut object = to_dynamic(object)?;
        let types = object.types.clone().unwrap_or_default();
        let resource = ApiResource {
            group: String::new(),
            version: String::new(),
            api_version: types.api_version,
            kind: types.kind,
            plural: String::new(),
        };
        let mut inner = self.inner.lock().await;
        object.metadata.uid.get_or_insert_with(|| Uuid::new_v4().to_string());
        object.metadata.resource_version = Some(inner.next_version());
        object.metadata.generation.get_or_insert(1);
        let key = key(&resource, object.metadata.namespace.as_deref(), &object.name_any());
        inner.objects.insert(key, object.clone());
        Ok(object)
    }

    /// Number of mutations performed since creation or the last reset
    pub async fn writes(&self) -> usize {
        self.inner.lock().await.writes.len()
    }

    pub async fn write_log(&self) -> Vec<WriteRecord> {
        self.inner.lock().await.writes.clone()
    }

    pub async fn reset_writes(&self) {
        self.inner.lock().await.writes.clear();
    }

    /// Report `ready` ready replicas for a StatefulSet.
    pub async fn set_ready(&self, namespace: &str, name: &str, ready: i32) {
        let mut inner = self.inner.lock().await;
        let key = (
            "apps/v1".to_string(),
            "StatefulSet".to_string(),
            Some(namespace.to_string()),
            name.to_string(),
        );
        if let Some(object) = inner.objects.get_mut(&key) {
            let mut status = object.data.get("status").cloned().unwrap_or_else(|| json!({}));
            status["readyReplicas"] = json!(ready);
            object.data["status"] = status;
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        let inner = self.inner.lock().await;
        Ok(inner.objects.get(&key(resource, namespace, name)).cloned())
    }

    async fn list(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        selector: &Selector,
    ) -> Result<Vec<DynamicObject>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .objects
            .iter()
            .filter(|((api_version, kind, ns, _), _)| {
                *api_version == resource.api_version
                    && *kind == resource.kind
                    && (namespace.is_none() || ns.as_deref() == namespace)
            })
            .filter(|(_, o)| matches_selector(o.labels(), selector))
            .map(|(_, o)| o.clone())
            .collect())
    }

    async fn create(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        object: &DynamicObject,
    ) -> Result<DynamicObject> {
        let name = object.name_any();
        let key = key(resource, namespace, &name);
        let mut inner = self.inner.lock().await;
        if inner.objects.contains_key(&key) {
            return Err(Error::StoreConflict {
                kind: resource.kind.clone(),
                name,
            });
        }

        let mut created = object.clone();
        created.types = Some(TypeMeta {
            api_version: resource.api_version.clone(),
            kind: resource.kind.clone(),
        });
        created.metadata.namespace = namespace.map(String::from);
        created.metadata.uid = Some(Uuid::new_v4().to_string());
        created.metadata.resource_version = Some(inner.next_version());
        created.metadata.generation = Some(1);
        created.metadata.creation_timestamp = Some(Time(Utc::now()));
        inner.apply_defaults(&mut created);
        inner.mark_ready(&mut created);

        inner.objects.insert(key, created.clone());
        inner.record("create", resource, &name);
        Ok(created)
    }

    async fn replace(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        object: &DynamicObject,
    ) -> Result<DynamicObject> {
        let name = object.name_any();
        let key = key(resource, namespace, &name);
        let mut inner = self.inner.lock().await;
        let Some(current) = inner.objects.get(&key).cloned() else {
            return Err(not_found(resource, &name));
        };
        if object.metadata.resource_version.is_some()
            && object.metadata.resource_version != current.metadata.resource_version
        {
            return Err(Error::StoreConflict {
                kind: resource.kind.clone(),
                name,
            });
        }

        let mut replaced = object.clone();
        replaced.types = current.types.clone();
        replaced.metadata.namespace = current.metadata.namespace.clone();
        replaced.metadata.uid = current.metadata.uid.clone();
        replaced.metadata.creation_timestamp = current.metadata.creation_timestamp.clone();
        replaced.metadata.deletion_timestamp = current.metadata.deletion_timestamp.clone();

        // status only changes through the status subresource
        match current.data.get("status") {
            Some(status) => replaced.data["status"] = status.clone(),
            None => {
                if let Value::Object(map) = &mut replaced.data {
                    map.remove("status");
                }
            }
        }

        inner.apply_defaults(&mut replaced);
        let spec_changed = replaced.data.get("spec") != current.data.get("spec");
        let generation = current.metadata.generation.unwrap_or(1);
        replaced.metadata.generation = Some(if spec_changed { generation + 1 } else { generation });
        replaced.metadata.resource_version = Some(inner.next_version());
        inner.mark_ready(&mut replaced);
        inner.record("replace", resource, &name);

        if replaced.metadata.deletion_timestamp.is_some() && replaced.finalizers().is_empty() {
            inner.objects.insert(key.clone(), replaced.clone());
            inner.remove(&key);
        } else {
            inner.objects.insert(key, replaced.clone());
        }
        Ok(replaced)
    }

    async fn delete(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<()> {
        let key = key(resource, namespace, name);
        let mut inner = self.inner.lock().await;
        let Some(current) = inner.objects.get(&key).cloned() else {
            return Ok(());
        };
        inner.record("delete", resource, name);

        if current.finalizers().is_empty() {
            inner.remove(&key);
        } else if current.metadata.deletion_timestamp.is_none() {
            let version = inner.next_version();
            if let Some(object) = inner.objects.get_mut(&key) {
                object.metadata.deletion_timestamp = Some(Time(Utc::now()));
                object.metadata.resource_version = Some(version);
            }
        }
        Ok(())
    }

    async fn patch_status(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        status: &Value,
    ) -> Result<()> {
        let key = key(resource, namespace, name);
        let mut inner = self.inner.lock().await;
        let version = inner.next_version();
        let Some(object) = inner.objects.get_mut(&key) else {
            return Err(not_found(resource, name));
        };
        object.data["status"] = status.clone();
        object.metadata.resource_version = Some(version);
        inner.record("patch_status", resource, name);
        Ok(())
    }
}

use std::{collections::BTreeMap, fmt::Debug};

use k8s_openapi::{
    api::{
        apps::v1::StatefulSet,
        core::v1::{Container, PodSpec, Secret, Service, ServiceAccount, Volume},
        policy::v1::PodDisruptionBudget,
        rbac::v1::{Role, RoleBinding},
    },
    apimachinery::pkg::apis::meta::v1::OwnerReference,
};
use kube::{core::ObjectMeta, Resource, ResourceExt};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::{
    resources::{MongoDB, DATABASE_KIND_LABEL, LABEL_INSTANCE, LABEL_NAME},
    store::Store,
    Error, Result,
};

/// What converging one object did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verb {
    Created,
    Patched,
    Unchanged,
}

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Created => "created",
            Verb::Patched => "patched",
            Verb::Unchanged => "unchanged",
        }
    }

    pub fn changed(&self) -> bool {
        *self != Verb::Unchanged
    }
}

/// An owned object kind the operator knows how to converge
pub trait Converge:
    Resource<DynamicType = ()> + Clone + Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync
{
    /// Fold the fields this controller owns from `desired` into `current`,
    /// leaving everything else as found.
    fn merge(current: &Self, desired: &Self) -> Self;
}

/// Get-or-create, else merge the owned fields and replace if anything changed.
///
/// Objects found under the desired name that do not carry this database's labels
/// are never adopted nor touched.
pub async fn converge<K: Converge>(store: &Store, db: &MongoDB, desired: &K) -> Result<(K, Verb)> {
    let namespace = desired.meta().namespace.clone();
    let name = desired.name_any();
    let kind = K::kind(&()).to_string();

    let Some(current) = store.get::<K>(namespace.as_deref(), &name).await? else {
        let created = store.create(desired).await?;
        info!(%kind, %name, "created");
        return Ok((created, Verb::Created));
    };

    ensure_managed(db, &current)?;

    let merged = K::merge(&current, desired);
    if merged == current {
        debug!(%kind, %name, "unchanged");
        return Ok((current, Verb::Unchanged));
    }

    let replaced = store.replace(&merged).await?;
    info!(%kind, %name, "patched");
    Ok((replaced, Verb::Patched))
}

/// Fail with a naming collision unless `object` carries this database's identity labels.
pub fn ensure_managed<K: Resource<DynamicType = ()>>(db: &MongoDB, object: &K) -> Result<()> {
    let labels = object.labels();
    let ours = labels.get(LABEL_NAME).map(String::as_str) == Some(DATABASE_KIND_LABEL)
        && labels.get(LABEL_INSTANCE) == Some(&db.name_any());
    if ours {
        return Ok(());
    }
    Err(Error::NamingCollision {
        kind: K::kind(&()).to_string(),
        namespace: object.namespace().unwrap_or_default(),
        name: object.name_any(),
    })
}

fn upsert_map(
    current: &Option<BTreeMap<String, String>>,
    desired: &Option<BTreeMap<String, String>>,
) -> Option<BTreeMap<String, String>> {
    match (current, desired) {
        (current, None) => current.clone(),
        (None, Some(desired)) => Some(desired.clone()),
        (Some(current), Some(desired)) => {
            let mut merged = current.clone();
            merged.extend(desired.clone());
            Some(merged)
        }
    }
}

/// Add the desired owner references, replacing entries with the same uid
pub fn ensure_owners(
    current: &Option<Vec<OwnerReference>>,
    desired: &Option<Vec<OwnerReference>>,
) -> Option<Vec<OwnerReference>> {
    let Some(desired) = desired else {
        return current.clone();
    };
    let mut owners = current.clone().unwrap_or_default();
    for owner in desired {
        match owners.iter_mut().find(|o| o.uid == owner.uid) {
            Some(existing) => *existing = owner.clone(),
            None => owners.push(owner.clone()),
        }
    }
    Some(owners)
}

fn merge_meta(current: &ObjectMeta, desired: &ObjectMeta) -> ObjectMeta {
    ObjectMeta {
        labels: upsert_map(&current.labels, &desired.labels),
        annotations: upsert_map(&current.annotations, &desired.annotations),
        owner_references: ensure_owners(&current.owner_references, &desired.owner_references),
        ..current.clone()
    }
}

/// Upsert items by name, keeping the order of first appearance
fn upsert_named<T: Clone>(
    current: &[T],
    desired: &[T],
    name: impl Fn(&T) -> &str,
    merge: impl Fn(&T, &T) -> T,
) -> Vec<T> {
    let mut items = current.to_vec();
    for want in desired {
        match items.iter_mut().find(|have| name(have) == name(want)) {
            Some(have) => *have = merge(have, want),
            None => items.push(want.clone()),
        }
    }
    items
}

fn upsert_optional<T: Clone>(
    current: &Option<Vec<T>>,
    desired: &Option<Vec<T>>,
    name: impl Fn(&T) -> &str,
    merge: impl Fn(&T, &T) -> T,
) -> Option<Vec<T>> {
    match (current, desired) {
        (current, None) => current.clone(),
        (None, Some(desired)) => Some(desired.clone()),
        (Some(current), Some(desired)) => Some(upsert_named(current, desired, name, merge)),
    }
}

/// Members of a union of which the API server accepts only one at a time
const ONE_OF: &[&[&str]] = &[
    &["value", "valueFrom"],
    &[
        "emptyDir",
        "secret",
        "configMap",
        "persistentVolumeClaim",
        "projected",
        "hostPath",
        "downwardAPI",
        "csi",
        "ephemeral",
    ],
    &["exec", "httpGet", "tcpSocket", "grpc"],
];

/// Whether `key` belongs to a union `desired` already picked another member of
fn other_member_chosen(desired: &Map<String, Value>, key: &str) -> bool {
    ONE_OF.iter().any(|group| {
        group.contains(&key)
            && group
                .iter()
                .any(|other| *other != key && desired.get(*other).is_some_and(|v| !v.is_null()))
    })
}

/// How list items are matched up between the live and the desired object
fn item_key(item: &Value) -> Option<String> {
    ["mountPath", "name", "containerPort", "port"]
        .iter()
        .find_map(|field| item.get(field).map(|v| format!("{field}={v}")))
}

fn fill(desired: &mut Value, current: &Value) {
    match desired {
        Value::Null => *desired = current.clone(),
        Value::Object(want) => {
            let Value::Object(have) = current else {
                return;
            };
            for (key, value) in have {
                if other_member_chosen(want, key) {
                    continue;
                }
                let slot = want.entry(key.clone()).or_insert(Value::Null);
                fill(slot, value);
            }
        }
        Value::Array(want) => {
            let Value::Array(have) = current else {
                return;
            };
            for (index, item) in want.iter_mut().enumerate() {
                let counterpart = match item_key(item) {
                    Some(key) => have.iter().find(|h| item_key(h).as_ref() == Some(&key)),
                    None => have.get(index),
                };
                if let Some(counterpart) = counterpart {
                    fill(item, counterpart);
                }
            }
        }
        _ => {}
    }
}

/// Lay `desired` over `current`.
///
/// Fields set in `desired` win, fields it leaves out keep whatever the server
/// filled in. Lists follow `desired`, each item laid over its live counterpart.
pub fn overlay<T: Serialize + DeserializeOwned + Clone>(current: &T, desired: &T) -> T {
    let (Ok(mut merged), Ok(live)) = (serde_json::to_value(desired), serde_json::to_value(current))
    else {
        return desired.clone();
    };
    fill(&mut merged, &live);
    serde_json::from_value(merged).unwrap_or_else(|_| desired.clone())
}

fn merge_container(current: &Container, desired: &Container) -> Container {
    overlay(current, desired)
}

/// Foreign containers and volumes are kept, ours are laid over their live copy
fn merge_pod_spec(current: &PodSpec, desired: &PodSpec) -> PodSpec {
    fn by_name(c: &Container) -> &str {
        &c.name
    }
    fn volume_name(v: &Volume) -> &str {
        &v.name
    }

    PodSpec {
        containers: upsert_named(&current.containers, &desired.containers, by_name, merge_container),
        init_containers: upsert_optional(
            &current.init_containers,
            &desired.init_containers,
            by_name,
            merge_container,
        ),
        volumes: upsert_optional(&current.volumes, &desired.volumes, volume_name, overlay),
        ..overlay(current, desired)
    }
}

impl Converge for StatefulSet {
    fn merge(current: &Self, desired: &Self) -> Self {
        let mut merged = current.clone();
        merged.metadata = merge_meta(&current.metadata, &desired.metadata);

        let (Some(have), Some(want)) = (&current.spec, &desired.spec) else {
            merged.spec = current.spec.clone().or_else(|| desired.spec.clone());
            return merged;
        };
        let mut spec = have.clone();
        spec.replicas = want.replicas;
        // the server only fills in `rollingUpdate` for the RollingUpdate type
        spec.update_strategy = match (&have.update_strategy, &want.update_strategy) {
            (Some(have), Some(want)) if have.type_ == want.type_ => Some(overlay(have, want)),
            (have, want) => want.clone().or_else(|| have.clone()),
        };

        let mut template = have.template.clone();
        let have_meta = have.template.metadata.clone().unwrap_or_default();
        let want_meta = want.template.metadata.clone().unwrap_or_default();
        template.metadata = Some(ObjectMeta {
            labels: upsert_map(&have_meta.labels, &want_meta.labels),
            annotations: upsert_map(&have_meta.annotations, &want_meta.annotations),
            ..have_meta
        });
        template.spec = match (&have.template.spec, &want.template.spec) {
            (Some(have), Some(want)) => Some(merge_pod_spec(have, want)),
            (have, want) => want.clone().or_else(|| have.clone()),
        };
        spec.template = template;

        // claim templates are immutable once the workload exists
        if have.volume_claim_templates.as_ref().map_or(true, |t| t.is_empty()) {
            spec.volume_claim_templates = want.volume_claim_templates.clone();
        }

        merged.spec = Some(spec);
        merged
    }
}

impl Converge for Service {
    fn merge(current: &Self, desired: &Self) -> Self {
        let mut merged = current.clone();
        merged.metadata = merge_meta(&current.metadata, &desired.metadata);

        let (Some(have), Some(want)) = (&current.spec, &desired.spec) else {
            merged.spec = current.spec.clone().or_else(|| desired.spec.clone());
            return merged;
        };
        let mut spec = have.clone();
        spec.selector = want.selector.clone();
        // keeps allocated node ports and defaulted protocols
        spec.ports = overlay(&have.ports, &want.ports);
        spec.type_ = want.type_.clone().or_else(|| have.type_.clone());
        spec.publish_not_ready_addresses = want
            .publish_not_ready_addresses
            .or(have.publish_not_ready_addresses);
        spec.external_ips = want.external_ips.clone().or_else(|| have.external_ips.clone());
        spec.load_balancer_ip = want
            .load_balancer_ip
            .clone()
            .or_else(|| have.load_balancer_ip.clone());
        spec.load_balancer_source_ranges = want
            .load_balancer_source_ranges
            .clone()
            .or_else(|| have.load_balancer_source_ranges.clone());
        spec.external_traffic_policy = want
            .external_traffic_policy
            .clone()
            .or_else(|| have.external_traffic_policy.clone());
        // the cluster IP is allocated once and immutable afterwards
        if have.cluster_ip.is_none() {
            spec.cluster_ip = want.cluster_ip.clone();
        }
        merged.spec = Some(spec);
        merged
    }
}

impl Converge for Secret {
    /// Secret contents are never rewritten once present.
    fn merge(current: &Self, desired: &Self) -> Self {
        let mut merged = current.clone();
        merged.metadata = merge_meta(&current.metadata, &desired.metadata);
        if current.data.is_none() && current.string_data.is_none() {
            merged.data = desired.data.clone();
            merged.type_ = desired.type_.clone();
        }
        merged
    }
}

impl Converge for ServiceAccount {
    fn merge(current: &Self, desired: &Self) -> Self {
        let mut merged = current.clone();
        merged.metadata = merge_meta(&current.metadata, &desired.metadata);
        merged
    }
}

impl Converge for Role {
    fn merge(current: &Self, desired: &Self) -> Self {
        let mut merged = current.clone();
        merged.metadata = merge_meta(&current.metadata, &desired.metadata);
        merged.rules = desired.rules.clone();
        merged
    }
}

impl Converge for RoleBinding {
    /// The role reference cannot change, only subjects are converged.
    fn merge(current: &Self, desired: &Self) -> Self {
        let mut merged = current.clone();
        merged.metadata = merge_meta(&current.metadata, &desired.metadata);
        merged.subjects = desired.subjects.clone();
        merged
    }
}

impl Converge for PodDisruptionBudget {
    fn merge(current: &Self, desired: &Self) -> Self {
        let mut merged = current.clone();
        merged.metadata = merge_meta(&current.metadata, &desired.metadata);
        merged.spec = desired.spec.clone();
        merged
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::{
        apps::v1::{RollingUpdateStatefulSetStrategy, StatefulSetUpdateStrategy},
        core::v1::EnvVar,
    };
    use serde_json::json;

    use super::*;
    use crate::{
        fixtures::{db_with_uid, secret, version},
        resources::ServiceTemplate,
        store::MemoryStore,
        topology::resolve,
        workload::{
            build_auth_secret, build_client_service, build_governing_service, build_statefulset,
            DB_CONTAINER,
        },
    };

    fn replica_set() -> MongoDB {
        db_with_uid(json!({
            "version": "4.4.6",
            "replicas": 3,
            "replicaSet": { "name": "rs0" },
            "storage": { "resources": { "requests": { "storage": "1Gi" } } },
        }))
    }

    #[tokio::test]
    async fn creates_then_leaves_alone() {
        let memory = MemoryStore::new();
        let store = Store::new(memory.clone());
        let db = replica_set();
        let desired = build_statefulset(&db, &resolve(&db)[0], &version()).unwrap();

        let (_, verb) = converge(&store, &db, &desired).await.unwrap();
        assert_eq!(verb, Verb::Created);
        let (_, verb) = converge(&store, &db, &desired).await.unwrap();
        assert_eq!(verb, Verb::Unchanged);
        assert_eq!(memory.writes().await, 1);
    }

    #[tokio::test]
    async fn patches_owned_fields_and_keeps_foreign_ones() {
        let memory = MemoryStore::new();
        let store = Store::new(memory.clone());
        let db = replica_set();
        let role = &resolve(&db)[0];
        let desired = build_statefulset(&db, role, &version()).unwrap();
        let (mut live, _) = converge(&store, &db, &desired).await.unwrap();

        // another actor adds a label and a sidecar
        live.metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert("team".into(), "data".into());
        let pod = live.spec.as_mut().unwrap().template.spec.as_mut().unwrap();
        pod.containers.push(Container {
            name: "istio-proxy".into(),
            ..Default::default()
        });
        store.replace(&live).await.unwrap();

        let mut scaled = db.clone();
        scaled.spec.replicas = Some(5);
        let scaled_role = &resolve(&scaled)[0];
        let desired = build_statefulset(&scaled, scaled_role, &version()).unwrap();
        let (patched, verb) = converge(&store, &scaled, &desired).await.unwrap();
        assert_eq!(verb, Verb::Patched);

        let spec = patched.spec.unwrap();
        assert_eq!(spec.replicas, Some(5));
        assert_eq!(patched.metadata.labels.unwrap().get("team").map(String::as_str), Some("data"));
        let names: Vec<_> = spec
            .template
            .spec
            .unwrap()
            .containers
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec![DB_CONTAINER.to_string(), "istio-proxy".to_string()]);
    }

    #[test]
    fn server_defaulted_fields_survive_the_merge() {
        let db = replica_set();
        let desired = build_statefulset(&db, &resolve(&db)[0], &version()).unwrap();
        let mut live = serde_json::to_value(&desired).unwrap();
        live["spec"]["updateStrategy"]["rollingUpdate"] = json!({ "partition": 0 });
        let volumes = live["spec"]["template"]["spec"]["volumes"].as_array_mut();
        for volume in volumes.into_iter().flatten() {
            for source in ["secret", "configMap"] {
                if let Some(Value::Object(source)) = volume.get_mut(source) {
                    source.entry("defaultMode").or_insert(json!(420));
                }
            }
        }
        let current: StatefulSet = serde_json::from_value(live).unwrap();

        let merged = StatefulSet::merge(&current, &desired);
        assert_eq!(merged, current);
        let strategy = merged.spec.unwrap().update_strategy.unwrap();
        assert_eq!(strategy.rolling_update.unwrap().partition, Some(0));
    }

    #[test]
    fn switching_update_strategy_drops_the_rolling_update_block() {
        let db = replica_set();
        let mut current = build_statefulset(&db, &resolve(&db)[0], &version()).unwrap();
        let mut desired = current.clone();
        let strategy = current.spec.as_mut().unwrap().update_strategy.as_mut().unwrap();
        strategy.type_ = Some("RollingUpdate".into());
        strategy.rolling_update = Some(RollingUpdateStatefulSetStrategy {
            partition: Some(0),
            ..Default::default()
        });
        desired.spec.as_mut().unwrap().update_strategy = Some(StatefulSetUpdateStrategy {
            type_: Some("OnDelete".into()),
            rolling_update: None,
        });

        let merged = StatefulSet::merge(&current, &desired);
        let strategy = merged.spec.unwrap().update_strategy.unwrap();
        assert_eq!(strategy.type_.as_deref(), Some("OnDelete"));
        assert!(strategy.rolling_update.is_none());
    }

    #[tokio::test]
    async fn allocated_node_ports_are_kept() {
        let memory = MemoryStore::new();
        let store = Store::new(memory.clone());
        let mut db = replica_set();
        db.spec.service_template = Some(ServiceTemplate {
            type_: Some("NodePort".into()),
            ..Default::default()
        });
        let desired = build_client_service(&db, &resolve(&db)).unwrap();

        let (created, _) = converge(&store, &db, &desired).await.unwrap();
        let node_port = created.spec.unwrap().ports.unwrap()[0].node_port;
        assert!(node_port.is_some());

        let (kept, verb) = converge(&store, &db, &desired).await.unwrap();
        assert_eq!(verb, Verb::Unchanged);
        assert_eq!(kept.spec.unwrap().ports.unwrap()[0].node_port, node_port);
        assert_eq!(memory.writes().await, 1);
    }

    #[tokio::test]
    async fn foreign_objects_are_a_collision() {
        let memory = MemoryStore::new();
        let store = Store::new(memory.clone());
        let db = replica_set();
        let mut foreign = build_governing_service(&db, &resolve(&db)[0]).unwrap();
        foreign.metadata.labels = Some(BTreeMap::from([("app".to_string(), "other".to_string())]));
        foreign.metadata.owner_references = None;
        memory.insert(&foreign).await.unwrap();

        let desired = build_governing_service(&db, &resolve(&db)[0]).unwrap();
        let err = converge(&store, &db, &desired).await.unwrap_err();
        assert!(matches!(err, Error::NamingCollision { .. }));
        assert_eq!(memory.writes().await, 0);

        let stored: Service = store.get(Some("demo"), "mgo-pods").await.unwrap().unwrap();
        assert_eq!(stored.metadata.labels, foreign.metadata.labels);
    }

    #[tokio::test]
    async fn secret_data_is_never_rewritten() {
        let memory = MemoryStore::new();
        let store = Store::new(memory.clone());
        let db = replica_set();
        let first = build_auth_secret(&db).unwrap().unwrap();
        converge(&store, &db, &first).await.unwrap();

        // a fresh build carries a different random password
        let second = build_auth_secret(&db).unwrap().unwrap();
        assert_ne!(first.data, second.data);
        let (stored, verb) = converge(&store, &db, &second).await.unwrap();
        assert_eq!(verb, Verb::Unchanged);
        assert_eq!(stored.data, first.data);
    }

    #[test]
    fn env_overrides_are_folded_into_the_live_container() {
        let current = Container {
            name: "mongodb".into(),
            termination_message_path: Some("/dev/termination-log".into()),
            env: Some(vec![EnvVar {
                name: "A".into(),
                value: Some("1".into()),
                value_from: None,
            }]),
            ..Default::default()
        };
        let desired = Container {
            name: "mongodb".into(),
            env: Some(vec![EnvVar {
                name: "A".into(),
                value: Some("2".into()),
                value_from: None,
            }]),
            ..Default::default()
        };
        let merged = merge_container(&current, &desired);
        assert_eq!(merged.env, desired.env);
        assert_eq!(merged.termination_message_path, current.termination_message_path);
    }

    #[test]
    fn owner_references_are_deduplicated_by_uid() {
        let db = replica_set();
        let owner = db.controller_owner_ref(&()).unwrap();
        let merged = ensure_owners(&Some(vec![owner.clone()]), &Some(vec![owner.clone()]));
        assert_eq!(merged, Some(vec![owner]));

        let unlabeled = secret("mgo-auth", &[]);
        assert!(ensure_managed(&db, &unlabeled).is_err());
    }
}

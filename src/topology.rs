use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::PersistentVolumeClaimSpec;
use kube::ResourceExt;

use crate::resources::{
    MongoDB, PodTemplate, SecretRef, CONFIG_SERVER_REPL_SET, LABEL_COMPONENT, LABEL_NODE,
};

/// What a group of identical members does in the cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoleKind {
    Standalone,
    ReplicaSet,
    Shard(i32),
    ConfigServer,
    Mongos,
}

impl RoleKind {
    pub fn component(&self) -> &'static str {
        match self {
            RoleKind::Standalone | RoleKind::ReplicaSet => "database",
            RoleKind::Shard(_) => "shard",
            RoleKind::ConfigServer => "configsvr",
            RoleKind::Mongos => "mongos",
        }
    }
}

/// One named group of identical workload replicas
#[derive(Clone, Debug, PartialEq)]
pub struct NodeRole {
    pub kind: RoleKind,
    /// Name of the workload and prefix of its pods
    pub name: String,
    pub replicas: i32,
    /// Labels put on the workload
    pub labels: BTreeMap<String, String>,
    /// Labels selecting the role's pods
    pub selectors: BTreeMap<String, String>,
    /// Routers keep no data and get no data volume
    pub data_bearing: bool,
    pub replica_set_name: Option<String>,
    pub governing_service: String,
    pub pod_template: Option<PodTemplate>,
    pub storage: Option<PersistentVolumeClaimSpec>,
    pub config_secret: Option<SecretRef>,
}

impl NodeRole {
    fn new(db: &MongoDB, kind: RoleKind, name: String, replicas: i32) -> Self {
        let mut selectors = db.offshoot_selectors();
        if db.is_sharded() {
            selectors.insert(LABEL_NODE.into(), name.clone());
        }
        let mut labels = db.offshoot_labels();
        labels.extend(selectors.clone());
        labels.insert(LABEL_COMPONENT.into(), kind.component().into());

        Self {
            kind,
            governing_service: db.governing_service_name(&name),
            name,
            replicas,
            labels,
            selectors,
            data_bearing: kind != RoleKind::Mongos,
            replica_set_name: None,
            pod_template: db.spec.pod_template.clone(),
            storage: db.spec.storage.clone(),
            config_secret: db.spec.config_secret.clone(),
        }
    }
}

/// Resolve the node roles of a database, in creation order.
///
/// Sharded clusters list the config servers first, then every shard, then the
/// routers, which can only start once the former are up. Expects a validated spec.
pub fn resolve(db: &MongoDB) -> Vec<NodeRole> {
    let Some(topology) = &db.spec.shard_topology else {
        return match db.replica_set_name() {
            Some(repl_set) => {
                let mut role = NodeRole::new(
                    db,
                    RoleKind::ReplicaSet,
                    db.name_any(),
                    db.spec.replicas.unwrap_or(1),
                );
                role.replica_set_name = Some(repl_set.to_string());
                vec![role]
            }
            None => vec![NodeRole::new(db, RoleKind::Standalone, db.name_any(), 1)],
        };
    };

    let mut roles = Vec::with_capacity(topology.shard.shards.max(0) as usize + 2);

    let config = &topology.config_server;
    let mut config_role = NodeRole::new(
        db,
        RoleKind::ConfigServer,
        db.config_server_name(),
        config.replicas,
    );
    config_role.replica_set_name = Some(CONFIG_SERVER_REPL_SET.into());
    config_role.pod_template = config.pod_template.clone();
    config_role.storage = config.storage.clone();
    config_role.config_secret = config.config_secret.clone();
    roles.push(config_role);

    let shard = &topology.shard;
    for index in 0..shard.shards {
        let mut role = NodeRole::new(db, RoleKind::Shard(index), db.shard_name(index), shard.replicas);
        role.replica_set_name = Some(db.shard_repl_set_name(index));
        role.pod_template = shard.pod_template.clone();
        role.storage = shard.storage.clone();
        role.config_secret = shard.config_secret.clone();
        roles.push(role);
    }

    let mongos = &topology.mongos;
    let mut router = NodeRole::new(db, RoleKind::Mongos, db.mongos_name(), mongos.replicas);
    router.pod_template = mongos.pod_template.clone();
    router.storage = None;
    router.config_secret = mongos.config_secret.clone();
    roles.push(router);

    roles
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{fixtures::db, resources::LABEL_INSTANCE};

    #[test]
    fn standalone_is_a_single_member() {
        let roles = resolve(&db(json!({ "version": "4.4.6", "replicas": 3 })));
        assert_eq!(roles.len(), 1);
        assert_eq!(roles[0].kind, RoleKind::Standalone);
        assert_eq!(roles[0].name, "mgo");
        assert_eq!(roles[0].replicas, 1);
        assert_eq!(roles[0].governing_service, "mgo-pods");
        assert!(roles[0].data_bearing);
        assert_eq!(roles[0].replica_set_name, None);
    }

    #[test]
    fn replica_set_uses_the_flat_count() {
        let roles = resolve(&db(json!({
            "version": "4.4.6",
            "replicas": 3,
            "replicaSet": { "name": "rs0" },
        })));
        assert_eq!(roles.len(), 1);
        assert_eq!(roles[0].kind, RoleKind::ReplicaSet);
        assert_eq!(roles[0].replicas, 3);
        assert_eq!(roles[0].replica_set_name.as_deref(), Some("rs0"));
        assert_eq!(roles[0].selectors.get(LABEL_INSTANCE).map(String::as_str), Some("mgo"));
        assert!(!roles[0].selectors.contains_key(LABEL_NODE));
    }

    #[test]
    fn sharded_topology_sizing() {
        let roles = resolve(&db(json!({
            "version": "4.4.6",
            "shardTopology": {
                "shard": { "shards": 3, "replicas": 2 },
                "configServer": { "replicas": 3 },
                "mongos": { "replicas": 2 },
            },
        })));
        assert_eq!(roles.len(), 5);

        let shards: Vec<_> = roles
            .iter()
            .filter(|r| matches!(r.kind, RoleKind::Shard(_)))
            .collect();
        assert_eq!(
            shards.iter().map(|r| r.name.as_str()).collect::<Vec<_>>(),
            vec!["mgo-shard0", "mgo-shard1", "mgo-shard2"]
        );
        assert!(shards.iter().all(|r| r.replicas == 2 && r.data_bearing));
        assert_eq!(shards[2].replica_set_name.as_deref(), Some("shard2"));

        let config = roles.iter().find(|r| r.kind == RoleKind::ConfigServer).unwrap();
        assert_eq!(config.replicas, 3);
        assert_eq!(config.replica_set_name.as_deref(), Some(CONFIG_SERVER_REPL_SET));

        let router = roles.last().unwrap();
        assert_eq!(router.kind, RoleKind::Mongos);
        assert_eq!(router.replicas, 2);
        assert!(!router.data_bearing);
        assert!(router.storage.is_none());
        assert_eq!(router.selectors.get(LABEL_NODE).map(String::as_str), Some("mgo-mongos"));
    }

    #[test]
    fn config_servers_come_first() {
        let roles = resolve(&db(json!({
            "version": "4.4.6",
            "shardTopology": {
                "shard": { "shards": 1, "replicas": 1 },
                "configServer": { "replicas": 1 },
                "mongos": { "replicas": 1 },
            },
        })));
        let kinds: Vec<_> = roles.iter().map(|r| r.kind).collect();
        assert_eq!(
            kinds,
            vec![RoleKind::ConfigServer, RoleKind::Shard(0), RoleKind::Mongos]
        );
    }
}

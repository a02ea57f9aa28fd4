use std::collections::BTreeSet;

use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use tracing::debug;

use crate::{
    resources::MongoDB,
    store::Store,
    topology::NodeRole,
    Result,
};

/// Names of the secrets a role's workload needs before it may be created
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DependencySet {
    pub secrets: BTreeSet<String>,
}

impl DependencySet {
    /// Compute the dependencies of one role.
    ///
    /// Only secrets the operator does not generate itself are listed: user supplied
    /// credentials and keyfiles, and the certificates issued by the TLS collaborator.
    pub fn for_role(db: &MongoDB, role: &NodeRole) -> Self {
        let mut secrets = BTreeSet::new();
        if let Some(auth) = &db.spec.auth_secret {
            secrets.insert(auth.name.clone());
        }
        if let (Some(key_file), Some(_)) = (db.key_file_secret_name(), &db.spec.key_file_secret) {
            secrets.insert(key_file);
        }
        if let Some(config) = &role.config_secret {
            secrets.insert(config.name.clone());
        }
        if db.tls_enabled() {
            secrets.insert(db.server_cert_secret(&role.name));
            secrets.insert(db.client_cert_secret());
            if db.exporter().is_some() {
                secrets.insert(db.exporter_cert_secret());
            }
        }
        Self { secrets }
    }

    /// Union of the dependencies of every role
    pub fn for_roles(db: &MongoDB, roles: &[NodeRole]) -> Self {
        let secrets = roles
            .iter()
            .flat_map(|role| Self::for_role(db, role).secrets)
            .collect();
        Self { secrets }
    }
}

/// Outcome of probing a [`DependencySet`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    /// Secrets that do not exist yet
    Pending(Vec<String>),
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready)
    }
}

/// Check that every secret of `dependencies` exists next to the database.
///
/// Absent secrets are reported, not raised: the caller defers and waits for the
/// next event instead of failing.
pub async fn probe(store: &Store, db: &MongoDB, dependencies: &DependencySet) -> Result<Readiness> {
    let namespace = db.namespace();
    let mut missing = vec![];
    for name in &dependencies.secrets {
        if store.get::<Secret>(namespace.as_deref(), name).await?.is_none() {
            missing.push(name.clone());
        }
    }

    if missing.is_empty() {
        Ok(Readiness::Ready)
    } else {
        debug!(db = %db.name_any(), ?missing, "dependencies not ready");
        Ok(Readiness::Pending(missing))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        fixtures::{db, secret},
        store::MemoryStore,
        topology::resolve,
    };

    fn tls_db() -> MongoDB {
        db(json!({
            "version": "4.4.6",
            "replicas": 3,
            "replicaSet": { "name": "rs0" },
            "sslMode": "requireSSL",
            "tls": { "certificates": [] },
            "authSecret": { "name": "shared-auth" },
        }))
    }

    #[test]
    fn generated_secrets_are_not_dependencies() {
        let db = db(json!({ "version": "4.4.6", "replicaSet": { "name": "rs0" } }));
        let deps = DependencySet::for_roles(&db, &resolve(&db));
        assert!(deps.secrets.is_empty());
    }

    #[test]
    fn tls_requires_certificates_per_role() {
        let db = tls_db();
        let deps = DependencySet::for_roles(&db, &resolve(&db));
        let expected: BTreeSet<String> = ["mgo-client-cert", "mgo-server-cert", "shared-auth"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(deps.secrets, expected);
    }

    #[test]
    fn sharded_clusters_need_a_server_cert_per_node() {
        let db = db(json!({
            "version": "4.4.6",
            "sslMode": "requireSSL",
            "tls": { "certificates": [] },
            "shardTopology": {
                "shard": { "shards": 2, "replicas": 1 },
                "configServer": { "replicas": 1 },
                "mongos": { "replicas": 1 },
            },
        }));
        let deps = DependencySet::for_roles(&db, &resolve(&db));
        for name in [
            "mgo-shard0-server-cert",
            "mgo-shard1-server-cert",
            "mgo-configsvr-server-cert",
            "mgo-mongos-server-cert",
        ] {
            assert!(deps.secrets.contains(name), "{name} missing");
        }
    }

    #[tokio::test]
    async fn probe_reports_missing_secrets() {
        let memory = MemoryStore::new();
        let store = Store::new(memory.clone());
        let db = tls_db();
        let deps = DependencySet::for_roles(&db, &resolve(&db));

        memory.insert(&secret("shared-auth", &[("password", "pw")])).await.unwrap();
        let readiness = probe(&store, &db, &deps).await.unwrap();
        assert_eq!(
            readiness,
            Readiness::Pending(vec!["mgo-client-cert".into(), "mgo-server-cert".into()])
        );

        memory.insert(&secret("mgo-client-cert", &[])).await.unwrap();
        memory.insert(&secret("mgo-server-cert", &[])).await.unwrap();
        assert!(probe(&store, &db, &deps).await.unwrap().is_ready());
        assert_eq!(memory.writes().await, 0);
    }
}

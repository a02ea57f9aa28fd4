use k8s_openapi::{
    api::core::v1::{EnvVar, PersistentVolumeClaimSpec},
    apimachinery::pkg::api::resource::Quantity,
};
use kube_quantity::ParsedQuantity;

use crate::{
    resources::{
        ClusterAuthMode, MongoDB, MongoDBVersion, PodTemplate, SslMode, StorageType,
        TerminationPolicy,
    },
    workload::FORBIDDEN_ENV,
    Error, Result,
};

fn invalid(reason: impl Into<String>) -> Error {
    Error::Validation(reason.into())
}

fn check_env(env: &[EnvVar], role: &str) -> Result<()> {
    match env.iter().find(|e| FORBIDDEN_ENV.contains(&e.name.as_str())) {
        Some(var) => Err(invalid(format!(
            "environment variable {} is managed by the operator and cannot be set on {role}",
            var.name
        ))),
        None => Ok(()),
    }
}

fn check_template(template: &Option<PodTemplate>, role: &str) -> Result<()> {
    template
        .as_ref()
        .map_or(Ok(()), |t| check_env(&t.spec.env, role))
}

/// Storage requests must be parsable and positive
fn check_storage(
    storage_type: StorageType,
    storage: &Option<PersistentVolumeClaimSpec>,
    role: &str,
) -> Result<()> {
    let request: Option<&Quantity> = storage
        .as_ref()
        .and_then(|s| s.resources.as_ref())
        .and_then(|r| r.requests.as_ref())
        .and_then(|r| r.get("storage"));

    match (storage_type, request) {
        (StorageType::Durable, None) => Err(invalid(format!(
            "{role}: durable storage needs a storage request"
        ))),
        (_, None) => Ok(()),
        (_, Some(quantity)) => {
            let parsed = ParsedQuantity::try_from(quantity.clone()).map_err(|e| {
                invalid(format!("{role}: storage request {:?}: {e}", quantity.0))
            })?;
            match parsed.to_bytes_i64() {
                Some(bytes) if bytes > 0 => Ok(()),
                _ => Err(invalid(format!(
                    "{role}: storage request {:?} must be positive",
                    quantity.0
                ))),
            }
        }
    }
}

/// Validate a database against the catalog entry of its version.
///
/// Runs on every reconciliation; a failure parks the database in `Failed`.
pub fn validate(db: &MongoDB, version: &MongoDBVersion) -> Result<()> {
    let spec = &db.spec;

    if version.spec.deprecated {
        return Err(invalid(format!(
            "MongoDBVersion {} is deprecated",
            spec.version
        )));
    }

    match &spec.shard_topology {
        Some(topology) => {
            if spec.replicas.is_some() {
                return Err(invalid("replicas must not be set for a sharded database"));
            }
            if spec.pod_template.is_some() {
                return Err(invalid(
                    "podTemplate must not be set for a sharded database, use the per node templates",
                ));
            }
            if spec.storage.is_some() {
                return Err(invalid(
                    "storage must not be set for a sharded database, use the per node storage",
                ));
            }
            if spec.config_secret.is_some() {
                return Err(invalid(
                    "configSecret must not be set for a sharded database, use the per node secrets",
                ));
            }
            if topology.shard.shards < 1 {
                return Err(invalid("shardTopology.shard.shards must be at least 1"));
            }
            for (role, replicas) in [
                ("shard", topology.shard.replicas),
                ("configServer", topology.config_server.replicas),
                ("mongos", topology.mongos.replicas),
            ] {
                if replicas < 1 {
                    return Err(invalid(format!(
                        "shardTopology.{role}.replicas must be at least 1"
                    )));
                }
            }
            check_storage(spec.storage_type, &topology.shard.storage, "shard")?;
            check_storage(spec.storage_type, &topology.config_server.storage, "configServer")?;
            check_template(&topology.shard.pod_template, "shard")?;
            check_template(&topology.config_server.pod_template, "configServer")?;
            check_template(&topology.mongos.pod_template, "mongos")?;
        }
        None => {
            match (&spec.replica_set, spec.replicas) {
                (None, Some(replicas)) if replicas != 1 => {
                    return Err(invalid(format!(
                        "a standalone database runs exactly 1 replica, found {replicas}"
                    )));
                }
                (Some(_), Some(replicas)) if replicas < 1 => {
                    return Err(invalid(format!(
                        "a replica set needs at least 1 replica, found {replicas}"
                    )));
                }
                _ => {}
            }
            check_storage(spec.storage_type, &spec.storage, "database")?;
            check_template(&spec.pod_template, "database")?;
        }
    }

    if spec.replica_set.as_ref().is_some_and(|rs| rs.name.is_empty()) {
        return Err(invalid("replicaSet.name must not be empty"));
    }

    if spec.storage_type == StorageType::Ephemeral
        && spec.termination_policy.effective() == TerminationPolicy::Halt
    {
        return Err(invalid(
            "terminationPolicy Halt cannot be used with ephemeral storage",
        ));
    }

    if spec.halted && spec.termination_policy.effective() != TerminationPolicy::Halt {
        return Err(invalid(
            "a halted database must use the Halt termination policy",
        ));
    }

    match (spec.ssl_mode, db.cluster_auth_mode()) {
        (SslMode::Disabled | SslMode::AllowSsl, mode) if mode.uses_x509() => {
            return Err(invalid(format!(
                "clusterAuthMode {} needs sslMode preferSSL or requireSSL",
                mode.as_str()
            )));
        }
        (SslMode::Disabled, ClusterAuthMode::SendKeyFile) => {
            return Err(invalid(
                "clusterAuthMode sendKeyFile needs SSL to be enabled",
            ));
        }
        _ => {}
    }

    if db.ssl_enabled() && spec.tls.is_none() {
        return Err(invalid("tls must be configured when sslMode is not disabled"));
    }

    Ok(())
}

/// Reject updates to fields that are fixed once the database exists
pub fn validate_update(old: &MongoDB, new: &MongoDB) -> Result<()> {
    let (old_spec, new_spec) = (&old.spec, &new.spec);

    let immutable = |field: &str| invalid(format!("{field} cannot be changed once set"));

    if old_spec.storage_type != new_spec.storage_type {
        return Err(immutable("storageType"));
    }
    if old_spec.storage != new_spec.storage {
        return Err(immutable("storage"));
    }
    if old_spec.auth_secret.is_some() && old_spec.auth_secret != new_spec.auth_secret {
        return Err(immutable("authSecret"));
    }
    if old_spec.tls.as_ref().map(|t| &t.certificates) != new_spec.tls.as_ref().map(|t| &t.certificates)
        && old_spec.tls.is_some()
    {
        return Err(immutable("tls.certificates"));
    }
    if old_spec.replica_set != new_spec.replica_set {
        return Err(immutable("replicaSet.name"));
    }
    if old_spec.init != new_spec.init {
        return Err(immutable("init"));
    }

    match (&old_spec.shard_topology, &new_spec.shard_topology) {
        (None, None) => {}
        (Some(old), Some(new)) => {
            if old.shard.storage != new.shard.storage {
                return Err(immutable("shardTopology.shard.storage"));
            }
            if old.config_server.storage != new.config_server.storage {
                return Err(immutable("shardTopology.configServer.storage"));
            }
            if old.shard.prefix != new.shard.prefix
                || old.config_server.prefix != new.config_server.prefix
                || old.mongos.prefix != new.mongos.prefix
            {
                return Err(immutable("shardTopology prefixes"));
            }
        }
        _ => return Err(immutable("shardTopology")),
    }

    Ok(())
}

/// Reject deletion of databases that must never be terminated
pub fn validate_delete(db: &MongoDB) -> Result<()> {
    if db.spec.termination_policy == TerminationPolicy::DoNotTerminate {
        return Err(Error::TerminationRejected(format!(
            "terminationPolicy of {} is DoNotTerminate, set it to Halt, Delete or WipeOut first",
            db.metadata.name.as_deref().unwrap_or_default()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::fixtures::{db, version};

    fn storage() -> serde_json::Value {
        json!({ "resources": { "requests": { "storage": "1Gi" } } })
    }

    fn rejects(spec: serde_json::Value, needle: &str) {
        match validate(&db(spec), &version()) {
            Err(Error::Validation(reason)) => {
                assert!(reason.contains(needle), "{reason:?} does not mention {needle:?}")
            }
            other => panic!("expected a validation error about {needle:?}, got {other:?}"),
        }
    }

    #[test]
    fn accepts_the_common_shapes() {
        let version = version();
        for spec in [
            json!({ "version": "4.4.6", "storage": storage() }),
            json!({ "version": "4.4.6", "replicas": 3, "replicaSet": { "name": "rs0" }, "storage": storage() }),
            json!({
                "version": "4.4.6",
                "sslMode": "requireSSL",
                "tls": { "certificates": [] },
                "storage": storage(),
            }),
            json!({
                "version": "4.4.6",
                "shardTopology": {
                    "shard": { "shards": 2, "replicas": 3, "storage": storage() },
                    "configServer": { "replicas": 3, "storage": storage() },
                    "mongos": { "replicas": 2 },
                },
            }),
            json!({ "version": "4.4.6", "storageType": "Ephemeral" }),
        ] {
            validate(&db(spec.clone()), &version).unwrap_or_else(|e| panic!("{spec}: {e}"));
        }
    }

    #[test]
    fn deprecated_versions_are_rejected() {
        let mut version = version();
        version.spec.deprecated = true;
        let err = validate(&db(json!({ "version": "4.4.6", "storage": storage() })), &version);
        assert!(matches!(err, Err(Error::Validation(_))));
    }

    #[test]
    fn topology_rules() {
        rejects(json!({ "version": "4.4.6", "replicas": 3, "storage": storage() }), "standalone");
        rejects(
            json!({ "version": "4.4.6", "replicas": 0, "replicaSet": { "name": "rs0" }, "storage": storage() }),
            "at least 1",
        );
        rejects(
            json!({
                "version": "4.4.6",
                "replicas": 3,
                "shardTopology": {
                    "shard": { "shards": 2, "replicas": 3, "storage": storage() },
                    "configServer": { "replicas": 3, "storage": storage() },
                    "mongos": { "replicas": 2 },
                },
            }),
            "replicas must not be set",
        );
        rejects(
            json!({
                "version": "4.4.6",
                "shardTopology": {
                    "shard": { "shards": 2, "replicas": 3, "storage": storage() },
                    "configServer": { "replicas": 0, "storage": storage() },
                    "mongos": { "replicas": 2 },
                },
            }),
            "configServer.replicas",
        );
    }

    #[test]
    fn storage_rules() {
        rejects(json!({ "version": "4.4.6" }), "storage request");
        rejects(
            json!({
                "version": "4.4.6",
                "storage": { "resources": { "requests": { "storage": "lots" } } },
            }),
            "lots",
        );
        rejects(
            json!({ "version": "4.4.6", "storageType": "Ephemeral", "terminationPolicy": "Halt" }),
            "ephemeral",
        );
        rejects(
            json!({ "version": "4.4.6", "storageType": "Ephemeral", "terminationPolicy": "Pause" }),
            "ephemeral",
        );
    }

    #[test]
    fn tls_and_auth_rules() {
        rejects(
            json!({ "version": "4.4.6", "clusterAuthMode": "x509", "storage": storage() }),
            "x509",
        );
        rejects(
            json!({
                "version": "4.4.6",
                "sslMode": "allowSSL",
                "clusterAuthMode": "sendX509",
                "tls": {},
                "storage": storage(),
            }),
            "sendX509",
        );
        rejects(
            json!({ "version": "4.4.6", "clusterAuthMode": "sendKeyFile", "storage": storage() }),
            "sendKeyFile",
        );
        rejects(
            json!({ "version": "4.4.6", "sslMode": "requireSSL", "storage": storage() }),
            "tls must be configured",
        );
    }

    #[test]
    fn halted_needs_the_halt_policy() {
        rejects(
            json!({ "version": "4.4.6", "halted": true, "storage": storage() }),
            "Halt termination policy",
        );
        validate(
            &db(json!({
                "version": "4.4.6",
                "halted": true,
                "terminationPolicy": "Halt",
                "storage": storage(),
            })),
            &version(),
        )
        .unwrap();
    }

    #[test]
    fn operator_managed_env_is_forbidden() {
        rejects(
            json!({
                "version": "4.4.6",
                "storage": storage(),
                "podTemplate": { "spec": { "env": [
                    { "name": "MONGO_INITDB_ROOT_PASSWORD", "value": "hunter2" },
                ] } },
            }),
            "MONGO_INITDB_ROOT_PASSWORD",
        );
    }

    #[test]
    fn immutable_fields() {
        let old = db(json!({
            "version": "4.4.6",
            "replicas": 3,
            "replicaSet": { "name": "rs0" },
            "storage": storage(),
            "authSecret": { "name": "shared-auth" },
        }));

        let mut scaled = old.clone();
        scaled.spec.replicas = Some(5);
        scaled.spec.version = "4.4.10".into();
        validate_update(&old, &scaled).unwrap();

        let mut renamed = old.clone();
        renamed.spec.replica_set = Some(crate::resources::ReplicaSetSpec { name: "rs1".into() });
        assert!(validate_update(&old, &renamed).is_err());

        let mut resized = old.clone();
        resized.spec.storage = serde_json::from_value(
            json!({ "resources": { "requests": { "storage": "2Gi" } } }),
        )
        .unwrap();
        assert!(validate_update(&old, &resized).is_err());

        let mut rekeyed = old.clone();
        rekeyed.spec.auth_secret = Some("other".into());
        assert!(validate_update(&old, &rekeyed).is_err());
    }

    #[test]
    fn do_not_terminate_blocks_deletion() {
        let guarded = db(json!({ "version": "4.4.6", "terminationPolicy": "DoNotTerminate" }));
        assert!(matches!(
            validate_delete(&guarded),
            Err(Error::TerminationRejected(_))
        ));
        validate_delete(&db(json!({ "version": "4.4.6" }))).unwrap();
    }
}

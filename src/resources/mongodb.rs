use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::{
    Affinity, ConfigMapVolumeSource, Container, EnvVar, Lifecycle, LocalObjectReference,
    PersistentVolumeClaimSpec, PodSecurityContext, Probe, ResourceRequirements, SecretVolumeSource,
    SecurityContext, Toleration, TypedLocalObjectReference,
};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{SecretRef, DATABASE_KIND_LABEL, INITIALIZED_ANNOTATION, LABEL_INSTANCE, LABEL_NAME};

/// Specification for a managed MongoDB database
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[kube(
    kind = "MongoDB",
    group = "mongo.dbkeeper.io",
    version = "v1alpha1",
    status = "MongoDBStatus",
    shortname = "mg",
    plural = "mongodbs",
    derive = "PartialEq",
    doc = "A managed MongoDB database",
    namespaced,
    printcolumn = r#"{ "name": "version", "type": "string", "description": "engine version", "jsonPath": ".spec.version" }"#,
    printcolumn = r#"{ "name": "status", "type": "string", "description": "database phase", "jsonPath": ".status.phase" }"#,
    printcolumn = r#"{ "name": "age", "type": "date", "jsonPath": ".metadata.creationTimestamp" }"#
)]
#[serde(rename_all = "camelCase")]
pub struct MongoDBSpec {
    /// Name of the `MongoDBVersion` catalog entry to run.
    pub version: String,

    /// Number of members for standalone (must be 1) and replica set databases.
    ///
    /// Must be left unset for sharded databases.
    pub replicas: Option<i32>,

    /// Run the database as a replica set with the given name.
    pub replica_set: Option<ReplicaSetSpec>,

    /// Run the database as a sharded cluster.
    pub shard_topology: Option<ShardTopology>,

    /// Whether data survives pod restarts.
    #[serde(default)]
    pub storage_type: StorageType,

    /// Claim template for the data volume (the size limit for ephemeral storage).
    pub storage: Option<PersistentVolumeClaimSpec>,

    #[serde(default)]
    pub storage_engine: StorageEngine,

    /// Secret holding the root `username` and `password`.
    ///
    /// Generated by the operator as `<name>-auth` when unset.
    pub auth_secret: Option<SecretRef>,

    /// Secret holding the shared cluster keyfile under `key.txt`.
    ///
    /// Generated by the operator as `<name>-key` when needed and unset.
    pub key_file_secret: Option<SecretRef>,

    #[serde(default)]
    pub ssl_mode: SslMode,

    /// Cluster member authentication. Defaults to `x509` with SSL, `keyFile` without.
    pub cluster_auth_mode: Option<ClusterAuthMode>,

    /// Certificate configuration, required whenever SSL is enabled.
    pub tls: Option<TlsConfig>,

    /// Data to load into a fresh database.
    pub init: Option<InitSpec>,

    /// Monitoring configuration.
    pub monitor: Option<MonitorSpec>,

    /// Overrides for the generated pods.
    pub pod_template: Option<PodTemplate>,

    /// Overrides for the client facing service.
    pub service_template: Option<ServiceTemplate>,

    /// Secret holding a custom `mongod.conf`.
    pub config_secret: Option<SecretRef>,

    /// What happens to volumes and secrets once the database goes away.
    #[serde(default)]
    pub termination_policy: TerminationPolicy,

    /// Park the database: drop its workloads but keep data and credentials.
    #[serde(default)]
    pub halted: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaSetSpec {
    pub name: String,
}

/// Layout of a sharded cluster
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ShardTopology {
    pub shard: ShardNode,
    pub config_server: ConfigServerNode,
    pub mongos: MongosNode,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ShardNode {
    /// Number of shards, each one a replica set.
    pub shards: i32,
    /// Members per shard.
    pub replicas: i32,
    /// Name prefix of the shard workloads, `shard` by default.
    pub prefix: Option<String>,
    pub pod_template: Option<PodTemplate>,
    pub storage: Option<PersistentVolumeClaimSpec>,
    pub config_secret: Option<SecretRef>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigServerNode {
    pub replicas: i32,
    /// Name prefix of the config server workload, `configsvr` by default.
    pub prefix: Option<String>,
    pub pod_template: Option<PodTemplate>,
    pub storage: Option<PersistentVolumeClaimSpec>,
    pub config_secret: Option<SecretRef>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MongosNode {
    pub replicas: i32,
    /// Name prefix of the router workload, `mongos` by default.
    pub prefix: Option<String>,
    pub pod_template: Option<PodTemplate>,
    pub config_secret: Option<SecretRef>,
    #[serde(default)]
    pub strategy: UpdateStrategy,
}

/// Rollout strategy of a workload
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum UpdateStrategy {
    #[default]
    RollingUpdate,
    OnDelete,
}

impl UpdateStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateStrategy::RollingUpdate => "RollingUpdate",
            UpdateStrategy::OnDelete => "OnDelete",
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum StorageType {
    #[default]
    Durable,
    Ephemeral,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum StorageEngine {
    #[default]
    #[serde(rename = "wiredTiger")]
    WiredTiger,
    #[serde(rename = "inMemory")]
    InMemory,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum SslMode {
    #[default]
    #[serde(rename = "disabled")]
    Disabled,
    #[serde(rename = "allowSSL")]
    AllowSsl,
    #[serde(rename = "preferSSL")]
    PreferSsl,
    #[serde(rename = "requireSSL")]
    RequireSsl,
}

impl SslMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SslMode::Disabled => "disabled",
            SslMode::AllowSsl => "allowSSL",
            SslMode::PreferSsl => "preferSSL",
            SslMode::RequireSsl => "requireSSL",
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum ClusterAuthMode {
    #[serde(rename = "keyFile")]
    KeyFile,
    #[serde(rename = "sendKeyFile")]
    SendKeyFile,
    #[serde(rename = "sendX509")]
    SendX509,
    #[serde(rename = "x509")]
    X509,
}

impl ClusterAuthMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterAuthMode::KeyFile => "keyFile",
            ClusterAuthMode::SendKeyFile => "sendKeyFile",
            ClusterAuthMode::SendX509 => "sendX509",
            ClusterAuthMode::X509 => "x509",
        }
    }

    /// Modes relying on member certificates
    pub fn uses_x509(&self) -> bool {
        matches!(self, ClusterAuthMode::SendX509 | ClusterAuthMode::X509)
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum TerminationPolicy {
    /// Reject deletion of the database outright.
    DoNotTerminate,
    /// Keep volumes and secrets, remove everything else.
    Halt,
    /// Deprecated spelling of `Halt`.
    Pause,
    /// Remove volumes, keep secrets.
    #[default]
    Delete,
    /// Remove volumes and every secret no other database still uses.
    WipeOut,
}

impl TerminationPolicy {
    /// Collapse deprecated aliases onto the policy they stand for.
    pub fn effective(self) -> Self {
        match self {
            TerminationPolicy::Pause => TerminationPolicy::Halt,
            other => other,
        }
    }
}

/// Certificate configuration
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct TlsConfig {
    /// Issuer used by the certificate collaborator.
    pub issuer_ref: Option<TypedLocalObjectReference>,
    /// Secret name overrides, keyed by alias (`server`, `client`, `metrics-exporter`).
    pub certificates: Vec<CertificateSpec>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CertificateSpec {
    pub alias: String,
    pub secret_name: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct InitSpec {
    /// Scripts mounted into `/docker-entrypoint-initdb.d`.
    pub script: Option<ScriptSource>,
    /// Restore session that populates the database before it is marked running.
    pub restore_session: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ScriptSource {
    pub config_map: Option<ConfigMapVolumeSource>,
    pub secret: Option<SecretVolumeSource>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MonitorSpec {
    /// Monitoring agent, e.g. `prometheus.io/operator` or `prometheus.io/builtin`.
    pub agent: String,
    pub prometheus: Option<PrometheusSpec>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct PrometheusSpec {
    pub exporter: ExporterSpec,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ExporterSpec {
    pub port: i32,
    pub args: Vec<String>,
    pub env: Vec<EnvVar>,
    pub resources: Option<ResourceRequirements>,
    pub security_context: Option<SecurityContext>,
}

impl Default for ExporterSpec {
    fn default() -> Self {
        Self {
            port: defaults::exporter_port(),
            args: vec![],
            env: vec![],
            resources: None,
            security_context: None,
        }
    }
}

/// Overrides applied on top of the generated pods
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct PodTemplate {
    /// Metadata merged into the pod template.
    pub metadata: TemplateMeta,
    /// Metadata merged into the workload itself.
    pub controller: TemplateMeta,
    pub spec: PodOverrides,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct TemplateMeta {
    pub labels: Option<BTreeMap<String, String>>,
    pub annotations: Option<BTreeMap<String, String>>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct PodOverrides {
    /// Extra environment, winning over everything the operator computes.
    pub env: Vec<EnvVar>,
    /// Extra `mongod` arguments, replacing generated flags with the same key.
    pub args: Vec<String>,
    pub resources: Option<ResourceRequirements>,
    pub affinity: Option<Affinity>,
    pub tolerations: Option<Vec<Toleration>>,
    pub scheduler_name: Option<String>,
    pub service_account_name: Option<String>,
    pub node_selector: Option<BTreeMap<String, String>>,
    pub image_pull_secrets: Option<Vec<LocalObjectReference>>,
    pub priority_class_name: Option<String>,
    pub priority: Option<i32>,
    pub security_context: Option<PodSecurityContext>,
    pub container_security_context: Option<SecurityContext>,
    pub liveness_probe: Option<Probe>,
    pub readiness_probe: Option<Probe>,
    pub lifecycle: Option<Lifecycle>,
    pub init_containers: Vec<Container>,
}

/// Overrides for the client facing service
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ServiceTemplate {
    pub annotations: Option<BTreeMap<String, String>>,
    #[serde(rename = "type")]
    pub type_: Option<String>,
    #[serde(rename = "clusterIP")]
    pub cluster_ip: Option<String>,
    #[serde(rename = "externalIPs")]
    pub external_ips: Option<Vec<String>>,
    #[serde(rename = "loadBalancerIP")]
    pub load_balancer_ip: Option<String>,
    pub load_balancer_source_ranges: Option<Vec<String>>,
    pub external_traffic_policy: Option<String>,
}

/// The status of the database
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MongoDBStatus {
    /// Where the database is in its lifecycle
    pub phase: Option<DatabasePhase>,

    /// Generation of the spec last acted upon
    pub observed_generation: Option<i64>,

    /// Why the database is in its current phase
    pub reason: Option<String>,
}

/// The possible phases of a `MongoDB`
#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum DatabasePhase {
    /// Owned objects are being created.
    Creating,

    /// Waiting for the init source to be restored.
    Initializing,

    /// Every workload is converged and ready.
    Running,

    /// Workloads are removed, data and credentials are kept.
    Halted,

    /// The database is being deleted.
    Terminating,

    /// The spec cannot be acted upon until it changes.
    Failed,
}

/// Replica set name of the config servers
pub const CONFIG_SERVER_REPL_SET: &str = "cnfRepSet";

impl MongoDB {
    /// Generate a name with the database as a prefix
    pub fn prefixed_name(&self, rest: impl AsRef<str>) -> String {
        format!("{}-{}", self.name_any(), rest.as_ref())
    }

    /// Labels every owned object must carry
    pub fn offshoot_labels(&self) -> BTreeMap<String, String> {
        crate::labels!(instance: self.name_any())
    }

    /// Labels selecting every pod of this database
    pub fn offshoot_selectors(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (LABEL_NAME.to_string(), DATABASE_KIND_LABEL.to_string()),
            (LABEL_INSTANCE.to_string(), self.name_any()),
        ])
    }

    /// Label selector string matching every owned object
    pub fn offshoot_selector_string(&self) -> String {
        self.offshoot_selectors()
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn is_sharded(&self) -> bool {
        self.spec.shard_topology.is_some()
    }

    pub fn replica_set_name(&self) -> Option<&str> {
        self.spec.replica_set.as_ref().map(|rs| rs.name.as_str())
    }

    pub fn shard_name(&self, index: i32) -> String {
        let prefix = self
            .spec
            .shard_topology
            .as_ref()
            .and_then(|t| t.shard.prefix.clone())
            .unwrap_or_else(|| "shard".into());
        self.prefixed_name(format!("{prefix}{index}"))
    }

    pub fn shard_repl_set_name(&self, index: i32) -> String {
        format!("shard{index}")
    }

    pub fn config_server_name(&self) -> String {
        let prefix = self
            .spec
            .shard_topology
            .as_ref()
            .and_then(|t| t.config_server.prefix.clone())
            .unwrap_or_else(|| "configsvr".into());
        self.prefixed_name(prefix)
    }

    pub fn mongos_name(&self) -> String {
        let prefix = self
            .spec
            .shard_topology
            .as_ref()
            .and_then(|t| t.mongos.prefix.clone())
            .unwrap_or_else(|| "mongos".into());
        self.prefixed_name(prefix)
    }

    /// Headless service giving the pods of one workload stable names
    pub fn governing_service_name(&self, workload: &str) -> String {
        format!("{workload}-pods")
    }

    pub fn stats_service_name(&self) -> String {
        self.prefixed_name("stats")
    }

    pub fn ssl_enabled(&self) -> bool {
        self.spec.ssl_mode != SslMode::Disabled
    }

    /// SSL is on and certificates are configured
    pub fn tls_enabled(&self) -> bool {
        self.ssl_enabled() && self.spec.tls.is_some()
    }

    /// The explicit cluster auth mode, or the one implied by the SSL mode
    pub fn cluster_auth_mode(&self) -> ClusterAuthMode {
        self.spec.cluster_auth_mode.unwrap_or(if self.ssl_enabled() {
            ClusterAuthMode::X509
        } else {
            ClusterAuthMode::KeyFile
        })
    }

    pub fn auth_secret_name(&self) -> String {
        self.spec
            .auth_secret
            .as_ref()
            .map(|s| s.name.clone())
            .unwrap_or_else(|| self.prefixed_name("auth"))
    }

    /// Members of replica sets and sharded clusters authenticate with a shared keyfile
    pub fn needs_key_file(&self) -> bool {
        self.tls_enabled() || self.spec.replica_set.is_some() || self.is_sharded()
    }

    pub fn key_file_secret_name(&self) -> Option<String> {
        if !self.needs_key_file() {
            return None;
        }
        Some(
            self.spec
                .key_file_secret
                .as_ref()
                .map(|s| s.name.clone())
                .unwrap_or_else(|| self.prefixed_name("key")),
        )
    }

    fn certificate_override(&self, alias: &str) -> Option<String> {
        self.spec
            .tls
            .as_ref()?
            .certificates
            .iter()
            .find(|c| c.alias == alias)
            .and_then(|c| c.secret_name.clone())
    }

    /// Server certificate of one workload; sharded clusters get one per node
    pub fn server_cert_secret(&self, workload: &str) -> String {
        match self.certificate_override("server") {
            Some(name) if !self.is_sharded() => name,
            _ => format!("{workload}-server-cert"),
        }
    }

    pub fn client_cert_secret(&self) -> String {
        self.certificate_override("client")
            .unwrap_or_else(|| self.prefixed_name("client-cert"))
    }

    pub fn exporter_cert_secret(&self) -> String {
        self.certificate_override("metrics-exporter")
            .unwrap_or_else(|| self.prefixed_name("metrics-exporter-cert"))
    }

    pub fn exporter(&self) -> Option<ExporterSpec> {
        let monitor = self.spec.monitor.as_ref()?;
        if !monitor.agent.starts_with("prometheus.io") {
            return None;
        }
        Some(
            monitor
                .prometheus
                .as_ref()
                .map(|p| p.exporter.clone())
                .unwrap_or_default(),
        )
    }

    /// Whether a restore has to happen before the database is usable
    pub fn needs_restore(&self) -> bool {
        self.spec
            .init
            .as_ref()
            .is_some_and(|i| i.restore_session.is_some())
    }

    pub fn is_initialized(&self) -> bool {
        self.annotations().contains_key(INITIALIZED_ANNOTATION)
    }

    /// Every secret name this database reads from
    pub fn referenced_secrets(&self) -> BTreeSet<String> {
        let mut secrets = BTreeSet::from([self.auth_secret_name()]);
        secrets.extend(self.key_file_secret_name());
        secrets.extend(self.spec.config_secret.as_ref().map(|s| s.name.clone()));
        if let Some(topology) = &self.spec.shard_topology {
            secrets.extend(
                [
                    &topology.shard.config_secret,
                    &topology.config_server.config_secret,
                    &topology.mongos.config_secret,
                ]
                .into_iter()
                .flatten()
                .map(|s| s.name.clone()),
            );
        }
        if let Some(secret) = self
            .spec
            .init
            .as_ref()
            .and_then(|i| i.script.as_ref())
            .and_then(|s| s.secret.as_ref())
            .and_then(|s| s.secret_name.clone())
        {
            secrets.insert(secret);
        }
        secrets
    }
}

mod defaults {
    pub fn exporter_port() -> i32 {
        56790
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::db;

    #[test]
    fn defaults_fill_in() {
        let db = db(serde_json::json!({ "version": "4.4.6" }));
        assert_eq!(db.spec.storage_type, StorageType::Durable);
        assert_eq!(db.spec.termination_policy, TerminationPolicy::Delete);
        assert_eq!(db.spec.ssl_mode, SslMode::Disabled);
        assert!(!db.spec.halted);
        assert_eq!(db.auth_secret_name(), "mgo-auth");
        assert_eq!(db.key_file_secret_name(), None);
    }

    #[test]
    fn cluster_auth_follows_ssl_unless_explicit() {
        let plain = db(serde_json::json!({ "version": "4.4.6" }));
        assert_eq!(plain.cluster_auth_mode(), ClusterAuthMode::KeyFile);

        let ssl = db(serde_json::json!({ "version": "4.4.6", "sslMode": "requireSSL" }));
        assert_eq!(ssl.cluster_auth_mode(), ClusterAuthMode::X509);

        let explicit = db(serde_json::json!({
            "version": "4.4.6",
            "sslMode": "requireSSL",
            "clusterAuthMode": "sendKeyFile",
        }));
        assert_eq!(explicit.cluster_auth_mode(), ClusterAuthMode::SendKeyFile);
    }

    #[test]
    fn sharded_names_use_prefixes() {
        let db = db(serde_json::json!({
            "version": "4.4.6",
            "shardTopology": {
                "shard": { "shards": 2, "replicas": 3, "prefix": "part" },
                "configServer": { "replicas": 3 },
                "mongos": { "replicas": 2 },
            },
        }));
        assert_eq!(db.shard_name(1), "mgo-part1");
        assert_eq!(db.config_server_name(), "mgo-configsvr");
        assert_eq!(db.mongos_name(), "mgo-mongos");
        assert_eq!(db.key_file_secret_name().as_deref(), Some("mgo-key"));
        assert_eq!(db.server_cert_secret("mgo-part1"), "mgo-part1-server-cert");
    }

    #[test]
    fn pause_is_halt() {
        assert_eq!(TerminationPolicy::Pause.effective(), TerminationPolicy::Halt);
        assert_eq!(TerminationPolicy::WipeOut.effective(), TerminationPolicy::WipeOut);
    }

    #[test]
    fn referenced_secrets_cover_every_source() {
        let db = db(serde_json::json!({
            "version": "4.4.6",
            "replicaSet": { "name": "rs0" },
            "authSecret": { "name": "shared-auth" },
            "configSecret": { "name": "custom-conf" },
        }));
        let secrets = db.referenced_secrets();
        assert!(secrets.contains("shared-auth"));
        assert!(secrets.contains("mgo-key"));
        assert!(secrets.contains("custom-conf"));
    }
}

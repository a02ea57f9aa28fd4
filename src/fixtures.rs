//! Shared builders for unit tests

use std::{sync::Arc, time::Duration};

use k8s_openapi::{api::core::v1::Secret, ByteString};
use kube::{api::ObjectMeta, ResourceExt};
use serde_json::{json, Value};
use tokio::sync::RwLock;

use crate::{
    config::OperatorConfig,
    events::MemoryEventSink,
    operator::Diagnostics,
    reconcilers::Context,
    resources::{MongoDB, MongoDBVersion},
    store::{MemoryStore, Store},
    Metrics,
};

/// A database named `mgo` in namespace `demo`
pub fn db(spec: Value) -> MongoDB {
    named_db("mgo", spec)
}

pub fn named_db(name: &str, spec: Value) -> MongoDB {
    serde_json::from_value(json!({
        "apiVersion": "mongo.dbkeeper.io/v1alpha1",
        "kind": "MongoDB",
        "metadata": { "name": name, "namespace": "demo" },
        "spec": spec,
    }))
    .unwrap()
}

/// Like [`db`], with the uid the API server would have assigned
pub fn db_with_uid(spec: Value) -> MongoDB {
    let mut db = db(spec);
    db.metadata.uid = Some("4a1f4c4e-0d6c-4a53-9c6b-0f9b1f0f0001".into());
    db.metadata.generation = Some(1);
    db
}

/// The `4.4.6` catalog entry
pub fn version() -> MongoDBVersion {
    serde_json::from_value(json!({
        "apiVersion": "mongo.dbkeeper.io/v1alpha1",
        "kind": "MongoDBVersion",
        "metadata": { "name": "4.4.6" },
        "spec": {
            "version": "4.4.6",
            "db": { "image": "mongo:4.4.6" },
            "initContainer": { "image": "dbkeeper/mongo-init:4.4.6" },
            "exporter": { "image": "percona/mongodb_exporter:0.32" },
        },
    }))
    .unwrap()
}

/// A plain secret living next to the test databases
pub fn secret(name: &str, data: &[(&str, &str)]) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: Some("demo".into()),
            ..Default::default()
        },
        data: Some(
            data.iter()
                .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                .collect(),
        ),
        ..Default::default()
    }
}

/// Reconciler context over in-memory collaborators
pub struct Harness {
    pub memory: MemoryStore,
    pub events: MemoryEventSink,
    pub ctx: Arc<Context>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_store(MemoryStore::new()).await
    }

    /// Seeds the `4.4.6` version into `memory`
    pub async fn with_store(memory: MemoryStore) -> Self {
        memory.insert(&version()).await.unwrap();
        let events = MemoryEventSink::new();
        let config = OperatorConfig {
            readiness_timeout: Duration::from_millis(200),
            poll_interval: Duration::from_millis(1),
            backoff_base: Duration::from_millis(1),
            backoff_max: Duration::from_millis(10),
            ..Default::default()
        };
        let ctx = Arc::new(Context {
            store: Store::new(memory.clone()),
            events: Arc::new(events.clone()),
            diagnostics: Arc::new(RwLock::new(Diagnostics::default())),
            metrics: Metrics::default(),
            config,
        });
        Self { memory, events, ctx }
    }

    /// Store `db` as the API server would, returning the stored copy
    pub async fn seed(&self, db: &MongoDB) -> MongoDB {
        self.memory.insert(db).await.unwrap();
        self.fetch(&db.name_any()).await
    }

    /// Current stored copy of a database in `demo`
    pub async fn fetch(&self, name: &str) -> MongoDB {
        self.ctx
            .store
            .get::<MongoDB>(Some("demo"), name)
            .await
            .unwrap()
            .unwrap()
    }

    pub async fn try_fetch(&self, name: &str) -> Option<MongoDB> {
        self.ctx.store.get::<MongoDB>(Some("demo"), name).await.unwrap()
    }

    pub async fn put_secret(&self, name: &str) {
        self.memory
            .insert(&secret(name, &[("tls.crt", "cert"), ("tls.key", "key")]))
            .await
            .unwrap();
    }
}

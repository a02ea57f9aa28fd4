use std::{collections::HashMap, pin::pin, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use futures::{future::join_all, StreamExt};
use k8s_openapi::{api::core::v1::Secret, NamespaceResourceScope};
use kube::{
    api::ListParams,
    runtime::{
        events::Reporter,
        reflector::{self, store::Writer},
        watcher::{self, watcher, Event},
        WatchStreamExt,
    },
    Api, Client, Resource, ResourceExt,
};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::{
    admission::validate_update,
    config::OperatorConfig,
    events::{DbEvent, KubeEventSink},
    queue::{EventKind, WorkQueue},
    reconcilers::{reconcile_key, Context},
    resources::{MongoDB, MANAGER},
    retry::Backoff,
    store::{KubeStore, ObjectKey, Store},
    termination::secret_names,
    Error, Metrics,
};

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    #[serde(skip)]
    pub reporter: Reporter,
}
impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            reporter: MANAGER.into(),
        }
    }
}

/// State shared between the controller and the web server
#[derive(Clone, Default)]
pub struct State {
    /// Diagnostics populated by the reconciler
    diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    registry: prometheus::Registry,
}

/// State wrapper around the controller outputs for the web server
impl State {
    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    // Create a Controller Context that can update State
    pub(crate) fn to_context(
        &self,
        client: Client,
        config: OperatorConfig,
    ) -> Result<Arc<Context>, prometheus::Error> {
        Ok(Arc::new(Context {
            store: Store::new(KubeStore::new(client.clone())),
            events: Arc::new(KubeEventSink::new(client, MANAGER.into())),
            diagnostics: self.diagnostics.clone(),
            metrics: Metrics::default().register(&self.registry)?,
            config,
        }))
    }
}

pub struct MongoDBController {
    state: State,
}

impl MongoDBController {
    pub fn new(state: State) -> Self {
        Self { state }
    }

    /// Watch databases and their secrets, feeding the work queue until interrupted
    pub async fn run(self, config: OperatorConfig) -> anyhow::Result<()> {
        let client = Client::try_default().await?;
        let namespace = config.watch_namespace.clone();
        let databases: Api<MongoDB> = scoped(client.clone(), namespace.as_deref());
        let secrets: Api<Secret> = scoped(client.clone(), namespace.as_deref());

        // Test that we can actually query for our CRDs (a.k.a. they are installed)
        if let Err(e) = databases.list(&ListParams::default().limit(1)).await {
            error!("CRD is not queryable; {e:?}. Is the CRD installed?");
            info!("Installation: cargo run --bin crdgen | kubectl apply -f -");
            anyhow::bail!("the MongoDB CRD is not installed");
        }

        let ctx = self.state.to_context(client, config.clone())?;
        let queue = WorkQueue::new(Backoff::new(config.backoff_base, config.backoff_max));
        let (reader, writer) = reflector::store::<MongoDB>();

        let workers: Vec<_> = (0..config.workers)
            .map(|_| tokio::spawn(run_worker(queue.clone(), ctx.clone())))
            .collect();
        info!(
            workers = config.workers,
            namespace = namespace.as_deref().unwrap_or("*"),
            "controller started"
        );

        tokio::select! {
            _ = watch_databases(databases, writer, queue.clone()) => warn!("database watch ended"),
            _ = watch_secrets(secrets, reader.clone(), queue.clone()) => warn!("secret watch ended"),
            _ = resync(reader, queue.clone(), config.resync_period) => {},
            _ = tokio::signal::ctrl_c() => info!("shutdown requested"),
        }

        // Workers finish the key in hand before returning
        queue.shutdown().await;
        join_all(workers).await;
        Ok(())
    }
}

fn scoped<K>(client: Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope>,
    <K as Resource>::DynamicType: Default,
{
    match namespace {
        Some(namespace) => Api::namespaced(client, namespace),
        None => Api::all(client),
    }
}

/// Remember the latest copy of `db` and tell whether it is new to us.
///
/// Without an admission webhook in front of the API server, changes to fields
/// that are fixed once the database exists can only be reported here.
fn observe(seen: &mut HashMap<ObjectKey, MongoDB>, db: &MongoDB) -> Result<EventKind, Error> {
    match seen.insert(ObjectKey::of(db), db.clone()) {
        None => Ok(EventKind::Created),
        Some(previous) => validate_update(&previous, db).map(|_| EventKind::Updated),
    }
}

async fn watch_databases(api: Api<MongoDB>, writer: Writer<MongoDB>, queue: WorkQueue) {
    let mut seen = HashMap::new();
    let mut events = pin!(reflector::reflector(
        writer,
        watcher(api, watcher::Config::default().any_semantic())
    )
    .default_backoff());

    while let Some(event) = events.next().await {
        let dbs = match event {
            Ok(Event::Applied(db)) => vec![db],
            Ok(Event::Deleted(db)) => {
                let key = ObjectKey::of(&db);
                seen.remove(&key);
                queue.add(key, EventKind::Deleted).await;
                continue;
            }
            Ok(Event::Restarted(dbs)) => dbs,
            Err(e) => {
                warn!("database watch failed: {e}");
                continue;
            }
        };
        for db in dbs {
            let key = ObjectKey::of(&db);
            let kind = observe(&mut seen, &db).unwrap_or_else(|e| {
                warn!(%key, "accepted an update the admission contract rejects: {e}");
                EventKind::Updated
            });
            queue.add(key, kind).await;
        }
    }
}

async fn watch_secrets(api: Api<Secret>, databases: reflector::Store<MongoDB>, queue: WorkQueue) {
    let mut events = pin!(watcher(api, watcher::Config::default()).default_backoff());

    while let Some(event) = events.next().await {
        let secret = match event {
            Ok(Event::Applied(secret) | Event::Deleted(secret)) => secret,
            // initial listing, databases get their first pass from their own watch
            Ok(Event::Restarted(_)) => continue,
            Err(e) => {
                warn!("secret watch failed: {e}");
                continue;
            }
        };
        let known = databases.state();
        for key in dependents(known.iter().map(Arc::as_ref), &secret) {
            debug!(%key, secret = %secret.name_any(), "secret changed");
            queue.add(key, EventKind::Updated).await;
        }
    }
}

/// Databases in the namespace of `secret` that read from it
pub fn dependents<'a>(
    databases: impl IntoIterator<Item = &'a MongoDB>,
    secret: &Secret,
) -> Vec<ObjectKey> {
    let name = secret.name_any();
    databases
        .into_iter()
        .filter(|db| db.namespace() == secret.namespace())
        .filter(|db| secret_names(db).contains(&name))
        .map(ObjectKey::of)
        .collect()
}

async fn resync(databases: reflector::Store<MongoDB>, queue: WorkQueue, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    // the first tick completes immediately
    ticker.tick().await;
    loop {
        ticker.tick().await;
        for db in databases.state() {
            queue.add(ObjectKey::of(db.as_ref()), EventKind::Updated).await;
        }
    }
}

/// Take keys off the queue and reconcile them until the queue shuts down
pub async fn run_worker(queue: WorkQueue, ctx: Arc<Context>) {
    while let Some((key, kind)) = queue.get().await {
        debug!(%key, ?kind, "picked up");
        let result = reconcile_key(&key, ctx.clone()).await;
        let requeues = queue.num_requeues(&key).await;

        match result {
            Ok(action) => {
                queue.forget(&key).await;
                if let Some(delay) = action.requeue_after() {
                    queue.add_after(key.clone(), EventKind::Updated, delay).await;
                }
            }
            Err(e) if e.is_transient() && requeues < ctx.config.max_requeues => {
                let delay = queue.add_rate_limited(key.clone(), EventKind::Updated).await;
                warn!(%key, ?delay, "reconcile failed, retrying: {e}");
            }
            Err(e) if e.is_transient() => {
                error!(%key, "reconcile failed {} times, giving up: {e}", requeues + 1);
                if let Err(publish) = report_exhausted(&ctx, &key, &e).await {
                    warn!(%key, "failed to publish event: {publish}");
                }
                queue.forget(&key).await;
            }
            Err(e) => {
                error!(%key, "reconcile failed: {e}");
                queue.forget(&key).await;
            }
        }

        queue.done(&key).await;
    }
}

async fn report_exhausted(ctx: &Context, key: &ObjectKey, error: &Error) -> crate::Result<()> {
    let Some(db) = ctx
        .store
        .get::<MongoDB>(key.namespace.as_deref(), &key.name)
        .await?
    else {
        return Ok(());
    };
    ctx.events
        .publish(
            &db,
            DbEvent::warning("RetriesExhausted", "Reconciling", error.to_string()),
        )
        .await
}

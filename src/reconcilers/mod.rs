use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use kube::{CustomResourceExt, ResourceExt};
use tokio::sync::RwLock;
use tracing::{debug, field, info, instrument, Span};

use crate::{
    config::OperatorConfig,
    events::EventSink,
    operator::Diagnostics,
    queue::Action,
    resources::MongoDB,
    store::{ObjectKey, Store},
    telemetry, Error, Metrics, Result,
};

pub mod mongodb;

/// The context passed around
pub struct Context {
    /// Object store, live or in memory
    pub store: Store,

    /// Where database events go
    pub events: Arc<dyn EventSink>,

    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,

    /// Prometheus metrics
    pub metrics: Metrics,

    pub config: OperatorConfig,
}

/// How far deploying a database got in one pass
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Progress {
    /// Every workload is converged and ready
    Ready,
    /// Waiting for the listed secrets to appear
    Pending(Vec<String>),
}

/// A resource that can be reconciled by a controller
#[async_trait]
pub(crate) trait Reconcile
where
    Self: CustomResourceExt + ResourceExt,
{
    type Context;

    /// Attempt to reconcile a resource
    async fn reconcile(&self, context: Arc<Self::Context>) -> Result<Action, Error>;

    /// Attempt to deploy all necessary sub-resources for this CRD.
    async fn deploy_resources(&self, context: Arc<Self::Context>) -> Result<Progress, Error>;
}

/// Load the database behind `key` and reconcile it
#[instrument(skip(ctx), fields(trace_id))]
pub async fn reconcile_key(key: &ObjectKey, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    Span::current().record("trace_id", field::display(&trace_id));
    let _timer = ctx.metrics.count_and_measure();
    ctx.diagnostics.write().await.last_event = Utc::now();

    let Some(db) = ctx
        .store
        .get::<MongoDB>(key.namespace.as_deref(), &key.name)
        .await?
    else {
        debug!(%key, "database is gone");
        return Ok(Action::await_change());
    };

    info!(r#"Starting MongoDB reconciliation for "{key}""#);
    let result = db.reconcile(ctx.clone()).await;
    if let Err(error) = &result {
        ctx.metrics.reconcile_failure(&db, error);
    }
    result
}

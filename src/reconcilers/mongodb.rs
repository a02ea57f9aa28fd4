use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::{apps::v1::StatefulSet, policy::v1::PodDisruptionBudget};
use kube::{Resource, ResourceExt};
use tokio::try_join;
use tracing::{debug, info, warn};

use crate::{
    admission::{validate, validate_delete},
    converge::{converge, ensure_managed, Converge},
    dependency::{probe, DependencySet, Readiness},
    events::DbEvent,
    queue::Action,
    resources::{DatabasePhase, MongoDB, MongoDBStatus, MongoDBVersion, FINALIZER},
    retry::poll_until,
    termination,
    topology::{resolve, NodeRole, RoleKind},
    workload::{
        build_auth_secret, build_client_service, build_governing_service, build_key_file_secret,
        build_pdb, build_rbac, build_stats_service, build_statefulset,
    },
    Error, Result,
};

use super::{Context, Progress, Reconcile};

#[async_trait]
impl Reconcile for MongoDB {
    type Context = Context;

    async fn reconcile(&self, context: Arc<Context>) -> Result<Action, Error> {
        if self.meta().deletion_timestamp.is_some() {
            return self.finalize(&context).await;
        }

        let mut status = self.status.clone().unwrap_or_default();
        let generation = self.meta().generation;

        // A failed spec stays failed until someone changes it
        if status.phase == Some(DatabasePhase::Failed) && status.observed_generation == generation {
            debug!(db = %self.name_any(), "spec unchanged since it failed");
            return Ok(Action::await_change());
        }

        let checked = match self.resolve_version(&context).await {
            Ok(version) => validate(self, &version),
            Err(e) => Err(e),
        };
        match checked {
            Err(e) if e.is_fatal() => return self.fail(&context, &mut status, e).await,
            other => other?,
        }

        self.ensure_finalizer(&context).await?;

        // Handle what we need for now
        let phase = status.phase;
        let (action, next_phase): (Action, DatabasePhase) = match phase {
            // Parked databases keep their data and wait to be resumed. This holds
            // from any phase: a database created halted never deploys.
            _ if self.spec.halted => {
                if phase != Some(DatabasePhase::Halted) {
                    self.halt(&context).await?;
                }
                (Action::await_change(), DatabasePhase::Halted)
            }

            // Anything not under way yet starts over from creation
            None | Some(DatabasePhase::Failed) | Some(DatabasePhase::Halted) => {
                self.set_status(&context, &mut status, DatabasePhase::Creating, None)
                    .await?;
                match self.deploy(&context).await {
                    Ok(outcome) => outcome,
                    Err(e) if e.is_fatal() => return self.fail(&context, &mut status, e).await,
                    Err(e) => return Err(e),
                }
            }

            // Creating, Initializing and Running all converge the same way
            Some(_) => match self.deploy(&context).await {
                Ok(outcome) => outcome,
                Err(e) if e.is_fatal() => return self.fail(&context, &mut status, e).await,
                Err(e) => return Err(e),
            },
        };

        let observed = (next_phase == DatabasePhase::Running).then_some(generation).flatten();
        self.set_status(&context, &mut status, next_phase, observed)
            .await?;

        Ok(action)
    }

    async fn deploy_resources(&self, context: Arc<Context>) -> Result<Progress, Error> {
        let version = self.resolve_version(&context).await?;
        let roles = resolve(self);

        // Credentials and identity of the pods are independent of each other
        try_join!(self.create_secrets(&context), self.create_rbac(&context))?;
        self.create_services(&context, &roles).await?;

        let dependencies = DependencySet::for_roles(self, &roles);
        if let Readiness::Pending(missing) = probe(&context.store, self, &dependencies).await? {
            return Ok(Progress::Pending(missing));
        }

        // Routers can only join once the config servers and shards are up
        let (routers, members): (Vec<&NodeRole>, Vec<&NodeRole>) =
            roles.iter().partition(|r| r.kind == RoleKind::Mongos);
        for stage in [members, routers] {
            for role in &stage {
                self.apply(&context, &build_statefulset(self, role, &version)?)
                    .await?;
                match build_pdb(self, role)? {
                    Some(pdb) => {
                        self.apply(&context, &pdb).await?;
                    }
                    None => self.remove_stale_pdb(&context, role).await?,
                }
            }
            for role in &stage {
                self.wait_ready(&context, role).await?;
            }
        }

        Ok(Progress::Ready)
    }
}

impl MongoDB {
    async fn resolve_version(&self, context: &Context) -> Result<MongoDBVersion> {
        context
            .store
            .get::<MongoDBVersion>(None, &self.spec.version)
            .await?
            .ok_or_else(|| Error::UnknownVersion(self.spec.version.clone()))
    }

    /// Deploy and decide where the database stands afterwards
    async fn deploy(&self, context: &Arc<Context>) -> Result<(Action, DatabasePhase)> {
        let current = self
            .status
            .as_ref()
            .and_then(|s| s.phase)
            .filter(|p| !matches!(p, DatabasePhase::Failed | DatabasePhase::Halted))
            .unwrap_or(DatabasePhase::Creating);

        match self.deploy_resources(context.clone()).await? {
            Progress::Pending(missing) => {
                info!(db = %self.name_any(), ?missing, "waiting for dependencies");
                Ok((Action::requeue(context.config.dependency_requeue), current))
            }
            Progress::Ready if self.needs_restore() && !self.is_initialized() => {
                info!(db = %self.name_any(), "waiting for the init source to be restored");
                Ok((Action::await_change(), DatabasePhase::Initializing))
            }
            Progress::Ready => Ok((
                Action::requeue(context.config.resync_period),
                DatabasePhase::Running,
            )),
        }
    }

    /// Converge one owned object, reporting creations and patches
    async fn apply<K: Converge>(&self, context: &Context, desired: &K) -> Result<K> {
        let (object, verb) = converge(&context.store, self, desired).await?;
        if verb.changed() {
            let note = format!(
                "Successfully {} {} {}",
                verb.as_str(),
                K::kind(&()),
                object.name_any()
            );
            context
                .events
                .publish(self, DbEvent::normal("Successful", "Reconciling", note))
                .await?;
        }
        Ok(object)
    }

    /// A role scaled down to a single replica must not keep its disruption budget
    async fn remove_stale_pdb(&self, context: &Context, role: &NodeRole) -> Result<()> {
        let namespace = self.namespace();
        let Some(pdb) = context
            .store
            .get::<PodDisruptionBudget>(namespace.as_deref(), &role.name)
            .await?
        else {
            return Ok(());
        };
        if ensure_managed(self, &pdb).is_err() {
            debug!(name = %role.name, "leaving foreign PodDisruptionBudget alone");
            return Ok(());
        }
        context
            .store
            .delete::<PodDisruptionBudget>(namespace.as_deref(), &role.name)
            .await?;
        let note = format!("Successfully deleted PodDisruptionBudget {}", role.name);
        context
            .events
            .publish(self, DbEvent::normal("Successful", "Reconciling", note))
            .await
    }

    async fn create_secrets(&self, context: &Context) -> Result<()> {
        if let Some(auth) = build_auth_secret(self)? {
            self.apply(context, &auth).await?;
        }
        if let Some(key_file) = build_key_file_secret(self)? {
            self.apply(context, &key_file).await?;
        }
        Ok(())
    }

    async fn create_rbac(&self, context: &Context) -> Result<()> {
        let rbac = build_rbac(self)?;
        self.apply(context, &rbac.service_account).await?;
        self.apply(context, &rbac.role).await?;
        self.apply(context, &rbac.binding).await?;
        Ok(())
    }

    async fn create_services(&self, context: &Context, roles: &[NodeRole]) -> Result<()> {
        for role in roles {
            self.apply(context, &build_governing_service(self, role)?)
                .await?;
        }
        self.apply(context, &build_client_service(self, roles)?)
            .await?;

        // monitoring is best effort
        if let Some(stats) = build_stats_service(self)? {
            if let Err(e) = self.apply(context, &stats).await {
                warn!(db = %self.name_any(), "failed to create stats service: {e}");
                context
                    .events
                    .publish(
                        self,
                        DbEvent::warning("StatsServiceFailed", "Reconciling", e.to_string()),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    async fn wait_ready(&self, context: &Context, role: &NodeRole) -> Result<()> {
        let store = &context.store;
        let namespace = self.namespace();
        let namespace = namespace.as_deref();
        let (name, replicas) = (role.name.as_str(), role.replicas);

        let what = format!("StatefulSet {}/{name} to be ready", namespace.unwrap_or_default());
        poll_until(
            context.config.poll_interval,
            context.config.readiness_timeout,
            what,
            move || async move {
                let ready = store
                    .get::<StatefulSet>(namespace, name)
                    .await?
                    .and_then(|s| s.status)
                    .and_then(|s| s.ready_replicas)
                    .unwrap_or_default();
                Ok::<_, Error>(ready == replicas)
            },
        )
        .await
    }

    async fn halt(&self, context: &Context) -> Result<()> {
        if let Err(e) = termination::halt(&context.store, self, &context.config).await {
            warn!(db = %self.name_any(), "failed to halt: {e}");
            context
                .events
                .publish(self, DbEvent::warning("FailedToHalt", "Halting", e.to_string()))
                .await?;
            return Err(e);
        }
        context
            .events
            .publish(
                self,
                DbEvent::normal("Halted", "Halting", "Workloads removed, data kept"),
            )
            .await
    }

    /// Park the database in `Failed` and surface why
    async fn fail(
        &self,
        context: &Context,
        status: &mut MongoDBStatus,
        error: Error,
    ) -> Result<Action> {
        warn!(db = %self.name_any(), "reconcile failed permanently: {error}");
        let failed = MongoDBStatus {
            phase: Some(DatabasePhase::Failed),
            observed_generation: self.meta().generation,
            reason: Some(error.to_string()),
        };
        if *status != failed {
            context.store.patch_status(self, &failed).await?;
            *status = failed;
        }
        context
            .events
            .publish(
                self,
                DbEvent::warning(error.reason(), "Reconciling", error.to_string()),
            )
            .await?;
        Err(error)
    }

    /// Move to `phase`, writing only when the status actually changes
    async fn set_status(
        &self,
        context: &Context,
        status: &mut MongoDBStatus,
        phase: DatabasePhase,
        observed_generation: Option<i64>,
    ) -> Result<()> {
        let next = MongoDBStatus {
            phase: Some(phase),
            observed_generation: observed_generation.or(status.observed_generation),
            reason: None,
        };
        if *status == next {
            return Ok(());
        }
        info!(db = %self.name_any(), ?phase, "phase changed");
        context.store.patch_status(self, &next).await?;
        *status = next;
        Ok(())
    }

    async fn ensure_finalizer(&self, context: &Context) -> Result<()> {
        if self.finalizers().iter().any(|f| f == FINALIZER) {
            return Ok(());
        }
        self.edit_finalizers(context, |finalizers| finalizers.push(FINALIZER.into()))
            .await
    }

    /// Edit the finalizers of the latest stored copy of this database
    async fn edit_finalizers(
        &self,
        context: &Context,
        edit: impl FnOnce(&mut Vec<String>) + Send,
    ) -> Result<()> {
        let Some(mut latest) = context
            .store
            .get::<MongoDB>(self.namespace().as_deref(), &self.name_any())
            .await?
        else {
            return Ok(());
        };
        let before = latest.finalizers().to_vec();
        edit(latest.finalizers_mut());
        if latest.finalizers() == before.as_slice() {
            return Ok(());
        }
        context.store.replace(&latest).await?;
        Ok(())
    }

    /// Run the termination policy, then let the database go
    async fn finalize(&self, context: &Context) -> Result<Action> {
        if !self.finalizers().iter().any(|f| f == FINALIZER) {
            return Ok(Action::await_change());
        }

        if let Err(e) = validate_delete(self) {
            warn!(db = %self.name_any(), "{e}");
            context
                .events
                .publish(self, DbEvent::warning(e.reason(), "Terminating", e.to_string()))
                .await?;
            return Err(e);
        }

        let mut status = self.status.clone().unwrap_or_default();
        self.set_status(context, &mut status, DatabasePhase::Terminating, None)
            .await?;
        termination::terminate(&context.store, self, &context.config).await?;

        self.edit_finalizers(context, |finalizers| finalizers.retain(|f| f != FINALIZER))
            .await?;
        info!(db = %self.name_any(), "terminated");
        Ok(Action::await_change())
    }
}

use std::{collections::BTreeSet, fmt::Debug};

use k8s_openapi::{
    api::{
        apps::v1::StatefulSet,
        core::v1::{PersistentVolumeClaim, Pod, Secret, Service, ServiceAccount},
        policy::v1::PodDisruptionBudget,
        rbac::v1::{Role, RoleBinding},
    },
    apimachinery::pkg::apis::meta::v1::OwnerReference,
};
use kube::{Resource, ResourceExt};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info};

use crate::{
    config::OperatorConfig,
    dependency::DependencySet,
    resources::{MongoDB, TerminationPolicy},
    retry::poll_until,
    store::{Selector, Store},
    topology::resolve,
    Error, Result,
};

/// Every secret name a database depends on, generated or referenced
pub fn secret_names(db: &MongoDB) -> BTreeSet<String> {
    let mut names = db.referenced_secrets();
    names.extend(DependencySet::for_roles(db, &resolve(db)).secrets);
    names
}

/// Secrets of `db` still referenced by another database of the same namespace.
///
/// Always read live from the store: siblings come and go between passes.
pub async fn secrets_in_use_by_siblings(store: &Store, db: &MongoDB) -> Result<BTreeSet<String>> {
    let siblings: Vec<MongoDB> = store.list(db.namespace().as_deref(), &Selector::new()).await?;
    let mine = secret_names(db);
    Ok(siblings
        .iter()
        .filter(|sibling| sibling.name_any() != db.name_any())
        .filter(|sibling| sibling.meta().deletion_timestamp.is_none())
        .flat_map(secret_names)
        .filter(|name| mine.contains(name))
        .collect())
}

/// A non-controlling owner reference: secrets and volumes may outlive or be shared past us
pub(crate) fn owner_of(db: &MongoDB) -> Result<OwnerReference> {
    let mut owner = db
        .controller_owner_ref(&())
        .ok_or_else(|| Error::IllegalDatabase(db.name_any(), "missing uid".into()))?;
    owner.controller = None;
    owner.block_owner_deletion = None;
    Ok(owner)
}

/// Add or remove the database's owner reference, writing only on change
async fn set_owned<K>(store: &Store, db: &MongoDB, object: &K, owned: bool) -> Result<()>
where
    K: Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned,
{
    let owner = owner_of(db)?;
    let current = object.owner_references();
    let present = current.iter().any(|r| r.uid == owner.uid);
    if present == owned {
        return Ok(());
    }

    let mut updated = object.clone();
    let refs = updated.owner_references_mut();
    if owned {
        refs.push(owner);
    } else {
        refs.retain(|r| r.uid != owner.uid);
    }
    store.replace(&updated).await?;
    debug!(
        kind = %K::kind(&()),
        name = %object.name_any(),
        owned,
        "updated ownership"
    );
    Ok(())
}

async fn claims(store: &Store, db: &MongoDB) -> Result<Vec<PersistentVolumeClaim>> {
    store
        .list(db.namespace().as_deref(), &db.offshoot_selectors())
        .await
}

/// Secrets carrying the database's labels plus every secret it references
async fn secrets(store: &Store, db: &MongoDB) -> Result<Vec<Secret>> {
    let namespace = db.namespace();
    let mut found: Vec<Secret> = store
        .list(namespace.as_deref(), &db.offshoot_selectors())
        .await?;
    for name in secret_names(db) {
        if found.iter().any(|s| s.name_any() == name) {
            continue;
        }
        if let Some(secret) = store.get::<Secret>(namespace.as_deref(), &name).await? {
            found.push(secret);
        }
    }
    Ok(found)
}

async fn delete_all<K>(store: &Store, db: &MongoDB) -> Result<()>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
{
    let namespace = db.namespace();
    let objects: Vec<K> = store
        .list(namespace.as_deref(), &db.offshoot_selectors())
        .await?;
    for object in objects {
        store.delete::<K>(namespace.as_deref(), &object.name_any()).await?;
    }
    Ok(())
}

async fn gone<K>(store: &Store, db: &MongoDB) -> Result<bool>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
{
    let remaining: Vec<K> = store
        .list(db.namespace().as_deref(), &db.offshoot_selectors())
        .await?;
    Ok(remaining.is_empty())
}

/// Park a database: keep volumes and secrets, remove everything else.
///
/// Waits until pods, workloads and services are gone before returning.
pub async fn halt(store: &Store, db: &MongoDB, config: &OperatorConfig) -> Result<()> {
    info!(db = %db.name_any(), "halting");

    for claim in claims(store, db).await? {
        set_owned(store, db, &claim, false).await?;
    }
    for secret in secrets(store, db).await? {
        set_owned(store, db, &secret, false).await?;
    }

    delete_all::<StatefulSet>(store, db).await?;
    delete_all::<PodDisruptionBudget>(store, db).await?;
    delete_all::<Service>(store, db).await?;
    delete_all::<RoleBinding>(store, db).await?;
    delete_all::<Role>(store, db).await?;
    delete_all::<ServiceAccount>(store, db).await?;

    let (interval, timeout) = (config.poll_interval, config.readiness_timeout);
    let what = format!("pods of {} to terminate", db.name_any());
    poll_until(interval, timeout, what, || gone::<Pod>(store, db)).await?;
    let what = format!("workloads of {} to be removed", db.name_any());
    poll_until(interval, timeout, what, || gone::<StatefulSet>(store, db)).await?;
    let what = format!("services of {} to be removed", db.name_any());
    poll_until(interval, timeout, what, || gone::<Service>(store, db)).await
}

/// Prepare owned objects for the removal of a deleted database.
///
/// Afterwards, whatever still carries the database's owner reference is garbage
/// collected along with it, and everything else survives.
pub async fn terminate(store: &Store, db: &MongoDB, config: &OperatorConfig) -> Result<()> {
    let policy = db.spec.termination_policy.effective();
    info!(db = %db.name_any(), ?policy, "terminating");

    match policy {
        TerminationPolicy::DoNotTerminate => Err(Error::TerminationRejected(format!(
            "{} has terminationPolicy DoNotTerminate",
            db.name_any()
        ))),
        TerminationPolicy::Halt | TerminationPolicy::Pause => halt(store, db, config).await,
        TerminationPolicy::Delete => {
            for claim in claims(store, db).await? {
                set_owned(store, db, &claim, true).await?;
            }
            for secret in secrets(store, db).await? {
                set_owned(store, db, &secret, false).await?;
            }
            Ok(())
        }
        TerminationPolicy::WipeOut => {
            for claim in claims(store, db).await? {
                set_owned(store, db, &claim, true).await?;
            }
            let in_use = secrets_in_use_by_siblings(store, db).await?;
            for secret in secrets(store, db).await? {
                let shared = in_use.contains(&secret.name_any());
                if shared {
                    info!(secret = %secret.name_any(), "keeping secret still used by another database");
                }
                set_owned(store, db, &secret, !shared).await?;
            }
            Ok(())
        }
    }
}

use std::{collections::BTreeMap, fmt, sync::Arc};

use async_trait::async_trait;
use kube::{
    api::{ApiResource, DynamicObject},
    Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};

use crate::{Error, Result};

mod api;
mod memory;

pub use api::KubeStore;
pub use memory::MemoryStore;

/// Equality based label selector, empty matches everything
pub type Selector = BTreeMap<String, String>;

/// Identity of a stored object
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    pub fn of<K: Resource>(obj: &K) -> Self {
        Self {
            namespace: obj.meta().namespace.clone(),
            name: obj.meta().name.clone().unwrap_or_default(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{ns}/{}", self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Untyped access to the cluster's object store
///
/// Every component reads and writes through this seam, so the reconciler can run
/// against a live API server or an in-memory fake alike.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>>;

    async fn list(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        selector: &Selector,
    ) -> Result<Vec<DynamicObject>>;

    async fn create(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        object: &DynamicObject,
    ) -> Result<DynamicObject>;

    /// Replace the whole object; a stale `resourceVersion` is a conflict.
    async fn replace(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        object: &DynamicObject,
    ) -> Result<DynamicObject>;

    /// Request deletion. Missing objects are not an error.
    async fn delete(&self, resource: &ApiResource, namespace: Option<&str>, name: &str)
        -> Result<()>;

    async fn patch_status(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        status: &serde_json::Value,
    ) -> Result<()>;
}

/// Typed handle over an [`ObjectStore`]
#[derive(Clone)]
pub struct Store {
    inner: Arc<dyn ObjectStore>,
}

impl Store {
    pub fn new(inner: impl ObjectStore + 'static) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn from_arc(inner: Arc<dyn ObjectStore>) -> Self {
        Self { inner }
    }

    pub async fn get<K>(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned,
    {
        self.inner
            .get(&ApiResource::erase::<K>(&()), namespace, name)
            .await?
            .map(from_dynamic)
            .transpose()
    }

    pub async fn list<K>(&self, namespace: Option<&str>, selector: &Selector) -> Result<Vec<K>>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned,
    {
        self.inner
            .list(&ApiResource::erase::<K>(&()), namespace, selector)
            .await?
            .into_iter()
            .map(from_dynamic)
            .collect()
    }

    pub async fn create<K>(&self, object: &K) -> Result<K>
    where
        K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
    {
        let created = self
            .inner
            .create(
                &ApiResource::erase::<K>(&()),
                object.meta().namespace.as_deref(),
                &to_dynamic(object)?,
            )
            .await?;
        from_dynamic(created)
    }

    pub async fn replace<K>(&self, object: &K) -> Result<K>
    where
        K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
    {
        let replaced = self
            .inner
            .replace(
                &ApiResource::erase::<K>(&()),
                object.meta().namespace.as_deref(),
                &to_dynamic(object)?,
            )
            .await?;
        from_dynamic(replaced)
    }

    pub async fn delete<K>(&self, namespace: Option<&str>, name: &str) -> Result<()>
    where
        K: Resource<DynamicType = ()>,
    {
        self.inner
            .delete(&ApiResource::erase::<K>(&()), namespace, name)
            .await
    }

    pub async fn patch_status<K>(&self, object: &K, status: &impl Serialize) -> Result<()>
    where
        K: Resource<DynamicType = ()>,
    {
        let status = serde_json::to_value(status).map_err(Error::SerializationError)?;
        self.inner
            .patch_status(
                &ApiResource::erase::<K>(&()),
                object.meta().namespace.as_deref(),
                &object.name_any(),
                &status,
            )
            .await
    }
}

pub(crate) fn to_dynamic<K: Serialize>(object: &K) -> Result<DynamicObject> {
    serde_json::to_value(object)
        .and_then(serde_json::from_value)
        .map_err(Error::SerializationError)
}

pub(crate) fn from_dynamic<K: DeserializeOwned>(object: DynamicObject) -> Result<K> {
    serde_json::to_value(object)
        .and_then(serde_json::from_value)
        .map_err(Error::SerializationError)
}

/// Whether `labels` carry every pair of `selector`
pub fn matches_selector(labels: &BTreeMap<String, String>, selector: &Selector) -> bool {
    selector
        .iter()
        .all(|(key, value)| labels.get(key) == Some(value))
}

pub(crate) fn selector_string(selector: &Selector) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;

    use super::*;

    #[test]
    fn selector_matching() {
        let labels = BTreeMap::from([
            ("a".to_string(), "1".to_string()),
            ("b".to_string(), "2".to_string()),
        ]);
        assert!(matches_selector(&labels, &Selector::new()));
        assert!(matches_selector(
            &labels,
            &Selector::from([("a".to_string(), "1".to_string())])
        ));
        assert!(!matches_selector(
            &labels,
            &Selector::from([("a".to_string(), "2".to_string())])
        ));
        assert_eq!(
            selector_string(&Selector::from([
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "2".to_string()),
            ])),
            "a=1,b=2"
        );
    }

    #[test]
    fn typed_objects_survive_the_dynamic_detour() {
        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some("conf".into()),
                namespace: Some("demo".into()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([("k".to_string(), "v".to_string())])),
            ..Default::default()
        };
        let dynamic = to_dynamic(&cm).unwrap();
        assert_eq!(dynamic.types.as_ref().unwrap().kind, "ConfigMap");
        let back: ConfigMap = from_dynamic(dynamic).unwrap();
        assert_eq!(back, cm);
    }

    #[test]
    fn keys_display_with_namespace() {
        assert_eq!(ObjectKey::new("demo", "mgo").to_string(), "demo/mgo");
        let cluster = ObjectKey {
            namespace: None,
            name: "4.4.6".into(),
        };
        assert_eq!(cluster.to_string(), "4.4.6");
    }
}

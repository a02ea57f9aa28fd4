use async_trait::async_trait;
use kube::{
    api::{ApiResource, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams},
    Api, Client, ResourceExt,
};
use serde_json::json;

use super::{selector_string, ObjectStore, Selector};
use crate::{resources::MANAGER, Error, Result};

/// [`ObjectStore`] backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, resource: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, resource),
            None => Api::all_with(self.client.clone(), resource),
        }
    }

    fn post_params() -> PostParams {
        PostParams {
            field_manager: Some(MANAGER.into()),
            ..Default::default()
        }
    }
}

fn status_code(error: &kube::Error) -> Option<u16> {
    match error {
        kube::Error::Api(response) => Some(response.code),
        _ => None,
    }
}

/// Translate optimistic concurrency failures into conflicts
fn write_error(resource: &ApiResource, name: &str, error: kube::Error) -> Error {
    if status_code(&error) == Some(http::StatusCode::CONFLICT.as_u16()) {
        Error::StoreConflict {
            kind: resource.kind.clone(),
            name: name.into(),
        }
    } else {
        Error::KubeError(error)
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        self.api(resource, namespace)
            .get_opt(name)
            .await
            .map_err(Error::KubeError)
    }

    async fn list(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        selector: &Selector,
    ) -> Result<Vec<DynamicObject>> {
        let mut params = ListParams::default();
        if !selector.is_empty() {
            params = params.labels(&selector_string(selector));
        }
        let list = self
            .api(resource, namespace)
            .list(&params)
            .await
            .map_err(Error::KubeError)?;
        Ok(list.items)
    }

    async fn create(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        object: &DynamicObject,
    ) -> Result<DynamicObject> {
        self.api(resource, namespace)
            .create(&Self::post_params(), object)
            .await
            .map_err(|e| write_error(resource, &object.name_any(), e))
    }

    async fn replace(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        object: &DynamicObject,
    ) -> Result<DynamicObject> {
        let name = object.name_any();
        self.api(resource, namespace)
            .replace(&name, &Self::post_params(), object)
            .await
            .map_err(|e| write_error(resource, &name, e))
    }

    async fn delete(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<()> {
        match self
            .api(resource, namespace)
            .delete(name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if status_code(&e) == Some(http::StatusCode::NOT_FOUND.as_u16()) => Ok(()),
            Err(e) => Err(Error::KubeError(e)),
        }
    }

    async fn patch_status(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        status: &serde_json::Value,
    ) -> Result<()> {
        let patch = Patch::Apply(json!({
            "apiVersion": resource.api_version,
            "kind": resource.kind,
            "status": status,
        }));
        let ps = PatchParams::apply(MANAGER).force();
        self.api(resource, namespace)
            .patch_status(name, &ps, &patch)
            .await
            .map_err(Error::KubeError)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use http::{Request, Response};
    use hyper::Body;
    use k8s_openapi::api::core::v1::Secret;
    use serde_json::json;

    use super::*;
    use crate::store::Store;

    fn mock_store() -> (Store, tower_test::mock::Handle<Request<Body>, Response<Body>>) {
        let (mock_service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let client = Client::new(mock_service, "default");
        (Store::new(KubeStore::new(client)), handle)
    }

    fn status_body(code: u16, reason: &str) -> Body {
        Body::from(
            serde_json::to_vec(&json!({
                "kind": "Status",
                "apiVersion": "v1",
                "metadata": {},
                "status": "Failure",
                "message": reason,
                "reason": reason,
                "code": code,
            }))
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn missing_objects_are_none() {
        let (store, mut handle) = mock_store();
        let server = tokio::spawn(async move {
            let (request, send) = handle.next_request().await.expect("service not called");
            assert_eq!(request.method(), http::Method::GET);
            assert_eq!(
                request.uri().to_string(),
                "/api/v1/namespaces/demo/secrets/mgo-auth"
            );
            send.send_response(
                Response::builder()
                    .status(404)
                    .body(status_body(404, "NotFound"))
                    .unwrap(),
            );
        });

        let secret = store.get::<Secret>(Some("demo"), "mgo-auth").await.unwrap();
        assert!(secret.is_none());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn stale_replace_is_a_conflict() {
        let (store, mut handle) = mock_store();
        let server = tokio::spawn(async move {
            let (request, send) = handle.next_request().await.expect("service not called");
            assert_eq!(request.method(), http::Method::PUT);
            send.send_response(
                Response::builder()
                    .status(409)
                    .body(status_body(409, "Conflict"))
                    .unwrap(),
            );
        });

        let secret: Secret = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": { "name": "mgo-auth", "namespace": "demo", "resourceVersion": "1" },
        }))
        .unwrap();
        let err = store.replace(&secret).await.unwrap_err();
        assert!(matches!(err, Error::StoreConflict { .. }));
        assert!(err.is_transient());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn deleting_a_missing_object_succeeds() {
        let (store, mut handle) = mock_store();
        let server = tokio::spawn(async move {
            let (request, send) = handle.next_request().await.expect("service not called");
            assert_eq!(request.method(), http::Method::DELETE);
            send.send_response(
                Response::builder()
                    .status(404)
                    .body(status_body(404, "NotFound"))
                    .unwrap(),
            );
        });

        store.delete::<Secret>(Some("demo"), "gone").await.unwrap();
        server.await.unwrap();
    }
}

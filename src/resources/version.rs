use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Catalog entry describing the images of one MongoDB release
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[kube(
    kind = "MongoDBVersion",
    group = "mongo.dbkeeper.io",
    version = "v1alpha1",
    shortname = "mgversion",
    derive = "PartialEq",
    doc = "Images making up one MongoDB release",
    printcolumn = r#"{ "name": "version", "type": "string", "description": "engine version", "jsonPath": ".spec.version" }"#,
    printcolumn = r#"{ "name": "db", "type": "string", "description": "database image", "jsonPath": ".spec.db.image" }"#,
    printcolumn = r#"{ "name": "deprecated", "type": "boolean", "jsonPath": ".spec.deprecated" }"#
)]
#[serde(rename_all = "camelCase")]
pub struct MongoDBVersionSpec {
    /// Upstream release number, e.g. `4.4.6`
    pub version: String,
    pub db: ImageRef,
    pub init_container: ImageRef,
    pub exporter: ImageRef,
    /// Deprecated versions can no longer be used for new databases.
    #[serde(default)]
    pub deprecated: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
pub struct ImageRef {
    pub image: String,
}

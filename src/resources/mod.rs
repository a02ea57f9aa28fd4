use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

mod mongodb;
mod version;

pub use mongodb::*;
pub use version::*;

/// API group of every resource served by this operator
pub const GROUP: &str = "mongo.dbkeeper.io";

/// Field manager and reporter name
pub const MANAGER: &str = "mongo-operator";

/// Value of `app.kubernetes.io/name` on everything a database owns
pub const DATABASE_KIND_LABEL: &str = "mongodbs.mongo.dbkeeper.io";

pub const LABEL_NAME: &str = "app.kubernetes.io/name";
pub const LABEL_INSTANCE: &str = "app.kubernetes.io/instance";
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const LABEL_COMPONENT: &str = "app.kubernetes.io/component";
pub const LABEL_NODE: &str = "mongo.dbkeeper.io/node";

/// Finalizer placed on each database so termination can run before removal
pub const FINALIZER: &str = "mongo.dbkeeper.io/finalizer";

/// Set by the restore collaborator once the init source has been applied
pub const INITIALIZED_ANNOTATION: &str = "mongo.dbkeeper.io/initialized";

/// Reference to a secret living next to the database
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecretRef {
    /// The name of the secret
    pub name: String,
}

impl From<&str> for SecretRef {
    fn from(name: &str) -> Self {
        Self { name: name.into() }
    }
}

#[macro_export]
macro_rules! meta {
    (owners: $owners:expr) => {{
        ::kube::core::ObjectMeta {
            owner_references: Some($owners),

            ..Default::default()
        }
    }};

    (owners: $owners:expr, $($lhs:ident : $rhs:expr),*) => {{
        ::kube::core::ObjectMeta {
            owner_references: Some($owners),
            $($lhs : $rhs),*,

            ..Default::default()
        }
    }};
}

/// Labels identifying an object as belonging to one database
#[macro_export]
macro_rules! labels {
    (instance: $name:expr) => {{
        ::std::collections::BTreeMap::<String, String>::from_iter([
            ($crate::resources::LABEL_NAME.to_string(), $crate::resources::DATABASE_KIND_LABEL.to_string()),
            ($crate::resources::LABEL_INSTANCE.to_string(), ($name).to_string()),
            ($crate::resources::LABEL_MANAGED_BY.to_string(), $crate::resources::MANAGER.to_string()),
        ])
    }};

    (instance: $name:expr, $($lhs:expr => $rhs:expr),*) => {{
        let mut labels = $crate::labels!(instance: $name);
        $(labels.insert(($lhs).to_string(), ($rhs).to_string());)*
        labels
    }};
}

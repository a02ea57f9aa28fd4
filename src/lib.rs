use std::time::Duration;

use thiserror::Error;

/// Expose all controller components used by main
pub mod resources;

/// Controller wiring: watches, work queue and workers
pub mod operator;
pub mod queue;
pub mod reconcilers;

/// Pure pieces of the reconciliation engine
pub mod admission;
pub mod dependency;
pub mod topology;
pub mod workload;

pub mod converge;
pub mod termination;

/// Object store and event sink seams
pub mod events;
pub mod store;

pub mod config;
pub mod retry;

/// Log and trace integrations
pub mod telemetry;

/// Metrics
mod metrics;
pub use metrics::Metrics;

#[cfg(test)]
pub(crate) mod fixtures;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[source] serde_json::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[source] kube::Error),

    #[error("conflicting write to {kind} {name:?}, object was modified")]
    StoreConflict { kind: String, name: String },

    #[error("invalid database spec: {0}")]
    Validation(String),

    #[error("unknown MongoDBVersion {0:?}")]
    UnknownVersion(String),

    #[error(r#"intended {kind} "{namespace}/{name}" already exists and is not managed by this database"#)]
    NamingCollision {
        kind: String,
        namespace: String,
        name: String,
    },

    #[error("timed out after {timeout:?} waiting for {what}")]
    ReadinessTimeout { what: String, timeout: Duration },

    #[error("termination rejected: {0}")]
    TerminationRejected(String),

    #[error("IllegalDatabase {0}: {1}")]
    IllegalDatabase(String, String),

    #[error("invalid operator configuration: {0}")]
    Config(String),
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn metric_label(&self) -> String {
        let label = match self {
            Error::SerializationError(_) => "serialization",
            Error::KubeError(_) => "kube",
            Error::StoreConflict { .. } => "conflict",
            Error::Validation(_) => "validation",
            Error::UnknownVersion(_) => "unknown_version",
            Error::NamingCollision { .. } => "naming_collision",
            Error::ReadinessTimeout { .. } => "readiness_timeout",
            Error::TerminationRejected(_) => "termination_rejected",
            Error::IllegalDatabase(..) => "illegal_database",
            Error::Config(_) => "config",
        };
        label.to_string()
    }

    /// Errors worth retrying with backoff. Everything else needs a spec change.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::KubeError(_) | Error::StoreConflict { .. } | Error::ReadinessTimeout { .. }
        )
    }

    /// Errors that park the database in the `Failed` phase.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Validation(_) | Error::UnknownVersion(_) | Error::NamingCollision { .. }
        )
    }

    /// Short event reason used when surfacing the error.
    pub fn reason(&self) -> &'static str {
        match self {
            Error::NamingCollision { .. } => "NamingCollision",
            Error::UnknownVersion(_) | Error::Validation(_) => "Invalid",
            Error::TerminationRejected(_) => "TerminationRejected",
            Error::ReadinessTimeout { .. } => "NotReady",
            _ => "ReconcileError",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_errors() {
        let collision = Error::NamingCollision {
            kind: "StatefulSet".into(),
            namespace: "demo".into(),
            name: "mgo".into(),
        };
        assert!(collision.is_fatal());
        assert!(!collision.is_transient());
        assert_eq!(collision.metric_label(), "naming_collision");

        let timeout = Error::ReadinessTimeout {
            what: "statefulset demo/mgo".into(),
            timeout: Duration::from_secs(1),
        };
        assert!(timeout.is_transient());
        assert!(!timeout.is_fatal());

        let conflict = Error::StoreConflict {
            kind: "Service".into(),
            name: "mgo".into(),
        };
        assert!(conflict.is_transient());

        assert!(Error::Validation("bad".into()).is_fatal());
        assert!(!Error::TerminationRejected("nope".into()).is_transient());
    }
}

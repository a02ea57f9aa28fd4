use std::sync::Arc;

use async_trait::async_trait;
use kube::{
    runtime::events::{Event, EventType, Recorder, Reporter},
    Client, Resource,
};
use tokio::sync::Mutex;

use crate::{resources::MongoDB, store::ObjectKey, Error, Result};

/// An event about one database, as shown by `kubectl describe`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DbEvent {
    pub warning: bool,
    pub reason: String,
    pub note: String,
    pub action: String,
}

impl DbEvent {
    pub fn normal(reason: &str, action: &str, note: impl Into<String>) -> Self {
        Self {
            warning: false,
            reason: reason.into(),
            note: note.into(),
            action: action.into(),
        }
    }

    pub fn warning(reason: &str, action: &str, note: impl Into<String>) -> Self {
        Self {
            warning: true,
            reason: reason.into(),
            note: note.into(),
            action: action.into(),
        }
    }
}

/// Destination of database events
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, db: &MongoDB, event: DbEvent) -> Result<()>;
}

/// Publishes events through the Kubernetes events API
pub struct KubeEventSink {
    client: Client,
    reporter: Reporter,
}

impl KubeEventSink {
    pub fn new(client: Client, reporter: Reporter) -> Self {
        Self { client, reporter }
    }
}

#[async_trait]
impl EventSink for KubeEventSink {
    async fn publish(&self, db: &MongoDB, event: DbEvent) -> Result<()> {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), db.object_ref(&()));
        recorder
            .publish(Event {
                type_: if event.warning {
                    EventType::Warning
                } else {
                    EventType::Normal
                },
                reason: event.reason,
                note: Some(event.note),
                action: event.action,
                secondary: None,
            })
            .await
            .map_err(Error::KubeError)
    }
}

/// Keeps events in memory, for tests and dry runs
#[derive(Clone, Default)]
pub struct MemoryEventSink {
    events: Arc<Mutex<Vec<(ObjectKey, DbEvent)>>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<DbEvent> {
        self.events
            .lock()
            .await
            .iter()
            .map(|(_, e)| e.clone())
            .collect()
    }

    pub async fn events_for(&self, key: &ObjectKey) -> Vec<DbEvent> {
        self.events
            .lock()
            .await
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, e)| e.clone())
            .collect()
    }

    pub async fn warnings(&self) -> Vec<DbEvent> {
        self.events().await.into_iter().filter(|e| e.warning).collect()
    }
}

#[async_trait]
impl EventSink for MemoryEventSink {
    async fn publish(&self, db: &MongoDB, event: DbEvent) -> Result<()> {
        self.events.lock().await.push((ObjectKey::of(db), event));
        Ok(())
    }
}

//! In-process pub/sub with a durable event log.
//!
//! Every published event is persisted before delivery, with ids assigned in
//! publication order. Live delivery runs over a broadcast channel, so slow
//! subscribers can lag and drop (delivery is best-effort once the event is
//! durable). Replay streams the historical log in id order and then hands off
//! to live delivery.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::epoch_milli;
use crate::storage::{self, Db, StorageError};

/// Capacity of the live broadcast channel. Subscribers further behind than
/// this observe a lag error and miss events, per the delivery contract.
const LIVE_CHANNEL_CAPACITY: usize = 1024;

/// Page size used when replaying historical events from storage.
const REPLAY_PAGE_SIZE: u64 = 100;

#[derive(Debug, Error)]
pub enum EventError {
    #[error("could not persist event: {0}")]
    Storage(#[from] StorageError),

    #[error("could not encode event details: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Every event type the system emits, with its payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Kind {
    CreatedNamespace {
        namespace_id: String,
    },
    DeletedNamespace {
        namespace_id: String,
    },

    CreatedPipeline {
        namespace_id: String,
        pipeline_id: String,
    },
    EnabledPipeline {
        namespace_id: String,
        pipeline_id: String,
    },
    DisabledPipeline {
        namespace_id: String,
        pipeline_id: String,
    },
    DeletedPipeline {
        namespace_id: String,
        pipeline_id: String,
    },

    RegisteredPipelineConfig {
        namespace_id: String,
        pipeline_id: String,
        version: u64,
    },
    DeployedPipelineConfig {
        namespace_id: String,
        pipeline_id: String,
        version: u64,
    },
    DeletedPipelineConfig {
        namespace_id: String,
        pipeline_id: String,
        version: u64,
    },

    InstalledExtension {
        name: String,
        image: String,
    },
    EnabledExtension {
        name: String,
    },
    DisabledExtension {
        name: String,
    },
    UninstalledExtension {
        name: String,
    },

    CreatedSubscription {
        namespace_id: String,
        pipeline_id: String,
        extension_name: String,
        extension_label: String,
    },
    DeletedSubscription {
        namespace_id: String,
        pipeline_id: String,
        extension_name: String,
        extension_label: String,
    },

    StartedRun {
        namespace_id: String,
        pipeline_id: String,
        version: u64,
        run_id: u64,
    },
    CompletedRun {
        namespace_id: String,
        pipeline_id: String,
        version: u64,
        run_id: u64,
        status: String,
    },

    CreatedTaskExecution {
        namespace_id: String,
        pipeline_id: String,
        run_id: u64,
        task_id: String,
    },
    StartedTaskExecution {
        namespace_id: String,
        pipeline_id: String,
        run_id: u64,
        task_id: String,
    },
    CompletedTaskExecution {
        namespace_id: String,
        pipeline_id: String,
        run_id: u64,
        task_id: String,
        status: String,
    },

    EvictedObject {
        key: String,
        scope: String,
    },

    /// An extension resolved an external happening into a request for a new
    /// run on a subscribed pipeline.
    ExtensionResolved {
        extension_name: String,
        namespace_id: String,
        pipeline_id: String,
        extension_label: String,
        variables: HashMap<String, String>,
    },
}

impl Kind {
    /// The storable discriminant, used for subscription filtering.
    pub fn kind_str(&self) -> &'static str {
        match self {
            Kind::CreatedNamespace { .. } => "created_namespace",
            Kind::DeletedNamespace { .. } => "deleted_namespace",
            Kind::CreatedPipeline { .. } => "created_pipeline",
            Kind::EnabledPipeline { .. } => "enabled_pipeline",
            Kind::DisabledPipeline { .. } => "disabled_pipeline",
            Kind::DeletedPipeline { .. } => "deleted_pipeline",
            Kind::RegisteredPipelineConfig { .. } => "registered_pipeline_config",
            Kind::DeployedPipelineConfig { .. } => "deployed_pipeline_config",
            Kind::DeletedPipelineConfig { .. } => "deleted_pipeline_config",
            Kind::InstalledExtension { .. } => "installed_extension",
            Kind::EnabledExtension { .. } => "enabled_extension",
            Kind::DisabledExtension { .. } => "disabled_extension",
            Kind::UninstalledExtension { .. } => "uninstalled_extension",
            Kind::CreatedSubscription { .. } => "created_subscription",
            Kind::DeletedSubscription { .. } => "deleted_subscription",
            Kind::StartedRun { .. } => "started_run",
            Kind::CompletedRun { .. } => "completed_run",
            Kind::CreatedTaskExecution { .. } => "created_task_execution",
            Kind::StartedTaskExecution { .. } => "started_task_execution",
            Kind::CompletedTaskExecution { .. } => "completed_task_execution",
            Kind::EvictedObject { .. } => "evicted_object",
            Kind::ExtensionResolved { .. } => "extension_resolved",
        }
    }
}

/// A single published event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Monotonic id assigned at publish time, unique for the life of the log.
    pub id: u64,
    #[serde(flatten)]
    pub kind: Kind,
    /// Epoch milliseconds at publish time.
    pub emitted: u64,
}

impl TryFrom<storage::events::Event> for Event {
    type Error = serde_json::Error;

    fn try_from(row: storage::events::Event) -> Result<Self, Self::Error> {
        let kind: Kind = serde_json::from_str(&row.details)?;
        Ok(Event {
            id: row.id as u64,
            kind,
            emitted: row.emitted as u64,
        })
    }
}

/// Receiving end of a subscription. Events arrive after their durable write,
/// filtered down to the kinds requested at subscribe time.
pub struct Subscription {
    receiver: broadcast::Receiver<Event>,
    kinds: Option<Vec<&'static str>>,
}

impl Subscription {
    /// Next matching event. `None` means the bus shut down. Lagged receivers
    /// skip ahead and keep going; the missed events stay in the durable log.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if let Some(kinds) = &self.kinds {
                        if !kinds.contains(&event.kind.kind_str()) {
                            continue;
                        }
                    }
                    return Some(event);
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed = missed, "event subscriber lagged; dropping events");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// The process-wide event bus. Construct once at startup and share.
pub struct EventBus {
    storage: Db,
    sender: broadcast::Sender<Event>,
    /// Serializes id assignment with the durable insert so ids follow
    /// publication order.
    publish_lock: Mutex<()>,
}

impl EventBus {
    pub fn new(
        storage: Db,
        retention: Duration,
        prune_interval: Duration,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let (sender, _) = broadcast::channel(LIVE_CHANNEL_CAPACITY);

        let bus = Arc::new(EventBus {
            storage,
            sender,
            publish_lock: Mutex::new(()),
        });

        let pruner = bus.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(prune_interval) => {
                        pruner.prune(retention).await;
                    }
                }
            }
        });

        bus
    }

    /// Persist and deliver an event. The returned event carries its assigned
    /// id.
    pub async fn publish(&self, kind: Kind) -> Result<Event, EventError> {
        let details = serde_json::to_string(&kind)?;
        let emitted = epoch_milli();

        let _guard = self.publish_lock.lock().await;

        let mut conn = self.storage.conn().await?;
        let id =
            storage::events::insert(&mut conn, kind.kind_str(), &details, emitted as i64).await?;

        let event = Event {
            id: id as u64,
            kind,
            emitted,
        };

        debug!(id = event.id, kind = event.kind.kind_str(), "published event");

        // No receivers is fine; the log is still durable.
        let _ = self.sender.send(event.clone());

        Ok(event)
    }

    /// Subscribe to live events. An empty kind list means every kind.
    pub fn subscribe(&self, kinds: &[&'static str]) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
            kinds: if kinds.is_empty() {
                None
            } else {
                Some(kinds.to_vec())
            },
        }
    }

    /// Stream historical events with ids at or after `from_id`, then follow
    /// with live delivery. The channel closes when the receiver is dropped or
    /// the bus shuts down.
    pub fn replay(&self, from_id: u64) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(REPLAY_PAGE_SIZE as usize);
        let storage = self.storage.clone();
        // Register for live events up front so nothing published during the
        // historical read is lost; duplicates are filtered by id.
        let mut live = self.sender.subscribe();

        tokio::spawn(async move {
            let mut next_id = from_id;

            loop {
                let mut conn = match storage.conn().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!(error = %e, "could not open connection for event replay");
                        return;
                    }
                };

                let page = match storage::events::list_from(
                    &mut conn,
                    next_id as i64,
                    REPLAY_PAGE_SIZE,
                )
                .await
                {
                    Ok(page) => page,
                    Err(e) => {
                        error!(error = %e, "could not read events for replay");
                        return;
                    }
                };

                if page.is_empty() {
                    break;
                }

                for row in page {
                    next_id = row.id as u64 + 1;
                    match Event::try_from(row) {
                        Ok(event) => {
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "skipping undecodable event during replay");
                        }
                    }
                }
            }

            loop {
                match live.recv().await {
                    Ok(event) => {
                        if event.id < next_id {
                            continue;
                        }
                        next_id = event.id + 1;
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed = missed, "replay follower lagged; dropping events");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        rx
    }

    async fn prune(&self, retention: Duration) {
        let cutoff = epoch_milli().saturating_sub(retention.as_millis() as u64);

        let mut conn = match self.storage.conn().await {
            Ok(conn) => conn,
            Err(e) => {
                error!(error = %e, "could not open connection for event pruning");
                return;
            }
        };

        match storage::events::prune_before(&mut conn, cutoff as i64).await {
            Ok(0) => {}
            Ok(count) => debug!(count = count, "pruned expired events"),
            Err(e) => error!(error = %e, "could not prune events"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::testutil::temp_db;

    fn run_started(run_id: u64) -> Kind {
        Kind::StartedRun {
            namespace_id: "default".into(),
            pipeline_id: "build".into(),
            version: 1,
            run_id,
        }
    }

    fn new_bus(db: Db) -> Arc<EventBus> {
        EventBus::new(
            db,
            Duration::from_secs(3600),
            Duration::from_secs(3600),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn ids_are_monotonic_in_publish_order() {
        let (_dir, db) = temp_db().await;
        let bus = new_bus(db);

        let mut last = 0;
        for i in 0..10 {
            let event = bus.publish(run_started(i)).await.unwrap();
            assert!(event.id > last);
            last = event.id;
        }
    }

    #[tokio::test]
    async fn subscribers_filter_by_kind() {
        let (_dir, db) = temp_db().await;
        let bus = new_bus(db);

        let mut subscription = bus.subscribe(&["completed_run"]);

        bus.publish(run_started(1)).await.unwrap();
        bus.publish(Kind::CompletedRun {
            namespace_id: "default".into(),
            pipeline_id: "build".into(),
            version: 1,
            run_id: 1,
            status: "successful".into(),
        })
        .await
        .unwrap();

        let event = subscription.recv().await.unwrap();
        assert_eq!(event.kind.kind_str(), "completed_run");
    }

    #[tokio::test]
    async fn replay_streams_history_then_live() {
        let (_dir, db) = temp_db().await;
        let bus = new_bus(db);

        for i in 0..3 {
            bus.publish(run_started(i)).await.unwrap();
        }

        let mut rx = bus.replay(1);

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);

        let third = rx.recv().await.unwrap();
        assert_eq!(third.id, 3);

        // Events published after the replay started flow through live.
        bus.publish(run_started(99)).await.unwrap();
        let fourth = rx.recv().await.unwrap();
        assert!(matches!(fourth.kind, Kind::StartedRun { run_id: 99, .. }));
    }

    #[tokio::test]
    async fn events_round_trip_through_storage() {
        let (_dir, db) = temp_db().await;
        let bus = new_bus(db.clone());

        let published = bus
            .publish(Kind::ExtensionResolved {
                extension_name: "cron".into(),
                namespace_id: "default".into(),
                pipeline_id: "build".into(),
                extension_label: "nightly".into(),
                variables: HashMap::from([("CRON_EXPR".into(), "0 1 * * *".into())]),
            })
            .await
            .unwrap();

        let mut conn = db.conn().await.unwrap();
        let row = storage::events::get(&mut conn, published.id as i64)
            .await
            .unwrap();
        let decoded = Event::try_from(row).unwrap();
        assert_eq!(decoded, published);
    }
}

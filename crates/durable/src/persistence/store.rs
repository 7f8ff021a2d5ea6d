//! Store traits and types for deferred work and the worker fleet

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Store is unavailable (used by the in-memory store to simulate outages)
    #[error("store unavailable")]
    Unavailable,
}

/// Error raised by a compute launcher
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    /// The launch service refused the request
    #[error("launch rejected: {0}")]
    Rejected(String),

    /// The launch request never reached the service
    #[error("launch transport error: {0}")]
    Transport(String),
}

/// Error raised while retiring a worker from the fleet
#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Launch(#[from] LaunchError),
}

/// A task persisted for later execution
///
/// The payload is opaque to the queue; only `kind` takes part in ordering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeferredTask {
    /// Correlation id of the task (primary key in the queue)
    pub id: Uuid,

    /// Task kind, used for priority ordering
    pub kind: String,

    /// Serialized task
    pub payload: serde_json::Value,
}

impl DeferredTask {
    pub fn new(id: Uuid, kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id,
            kind: kind.into(),
            payload,
        }
    }

    /// Serialize a typed task into a queue row
    pub fn encode<T: Serialize + ?Sized>(id: Uuid, kind: &str, task: &T) -> Result<Self, StoreError> {
        let payload =
            serde_json::to_value(task).map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(Self::new(id, kind, payload))
    }

    /// Deserialize the payload back into a typed task
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }
}

/// A task that can be parked in a [`DeferredQueue`]
pub trait Deferrable: Serialize {
    /// Correlation id that identifies this task instance
    fn correlation_id(&self) -> Uuid;

    /// Kind name used for queue priority
    fn kind(&self) -> &'static str;

    fn to_deferred(&self) -> Result<DeferredTask, StoreError> {
        DeferredTask::encode(self.correlation_id(), self.kind(), self)
    }
}

/// Dequeue priority by task kind
///
/// Kinds earlier in the list are claimed first. Kinds not in the list sort
/// after every listed kind, and ties break on deferral order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindPriority(Vec<String>);

impl KindPriority {
    pub fn new<I, S>(kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(kinds.into_iter().map(Into::into).collect())
    }

    /// Rank of a kind (lower is claimed earlier)
    pub fn rank(&self, kind: &str) -> usize {
        self.0
            .iter()
            .position(|k| k == kind)
            .unwrap_or(self.0.len())
    }

    pub fn kinds(&self) -> &[String] {
        &self.0
    }
}

/// Backlog and fleet counts read at the start of a retirement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetSnapshot {
    /// Number of deferred tasks
    pub backlog: u64,

    /// Number of registered workers, including the retiring one
    pub fleet_size: u64,
}

/// Result of a committed retirement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetireOutcome {
    pub snapshot: FleetSnapshot,

    /// Ids of the workers launched as successors
    pub launched: Vec<String>,
}

/// Registered worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerRegistration {
    pub worker_id: String,
    pub registered_at: DateTime<Utc>,
}

/// Decides how many successors to launch and launches them
///
/// Invoked from inside the retirement transaction, so a launch failure
/// rolls back the registrations written before it.
#[async_trait]
pub trait LaunchPlanner: Send + Sync {
    /// Number of workers to launch for this snapshot
    fn plan(&self, snapshot: FleetSnapshot) -> u32;

    /// Launch one worker with the given id
    async fn launch(&self, worker_id: &str) -> Result<(), LaunchError>;
}

/// Durable queue of deferred tasks shared by every worker
#[async_trait]
pub trait DeferredQueue: Send + Sync + 'static {
    /// Persist a task. A row with the same id is overwritten.
    async fn enqueue(&self, task: DeferredTask) -> Result<(), StoreError>;

    /// Persist several tasks in one transaction
    async fn enqueue_batch(&self, tasks: Vec<DeferredTask>) -> Result<(), StoreError>;

    /// Claim up to `max` tasks in priority order
    ///
    /// Claimed rows are removed. A row claimed concurrently by another
    /// worker is skipped, so each row is returned to exactly one caller.
    /// On error nothing is claimed.
    async fn dequeue_up_to(&self, max: usize) -> Result<Vec<DeferredTask>, StoreError>;

    /// Number of deferred tasks
    async fn backlog(&self) -> Result<u64, StoreError>;
}

/// Registry of running workers
#[async_trait]
pub trait FleetRegistry: Send + Sync + 'static {
    /// Register a worker. Registering twice is a no-op.
    async fn register_worker(&self, worker_id: &str) -> Result<(), StoreError>;

    /// Remove a worker registration
    async fn deregister_worker(&self, worker_id: &str) -> Result<(), StoreError>;

    /// Number of registered workers
    async fn fleet_size(&self) -> Result<u64, StoreError>;

    /// List registered workers
    async fn list_workers(&self) -> Result<Vec<WorkerRegistration>, StoreError>;

    /// Retire a worker and launch its successors atomically
    ///
    /// Reads the backlog and fleet size, removes `worker_id`, then registers
    /// and launches as many workers as `planner` asks for. Either all of it
    /// commits or none of it does.
    async fn retire_worker(
        &self,
        worker_id: &str,
        planner: &dyn LaunchPlanner,
    ) -> Result<RetireOutcome, FleetError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize, serde::Deserialize, Debug, PartialEq)]
    struct Ping {
        id: Uuid,
        n: u32,
    }

    impl Deferrable for Ping {
        fn correlation_id(&self) -> Uuid {
            self.id
        }

        fn kind(&self) -> &'static str {
            "ping"
        }
    }

    #[test]
    fn test_deferrable_encodes_kind_and_payload() {
        let ping = Ping {
            id: Uuid::now_v7(),
            n: 7,
        };
        let row = ping.to_deferred().unwrap();

        assert_eq!(row.id, ping.id);
        assert_eq!(row.kind, "ping");
        assert_eq!(row.decode::<Ping>().unwrap(), ping);
    }

    #[test]
    fn test_decode_rejects_foreign_payload() {
        let row = DeferredTask::new(Uuid::now_v7(), "ping", serde_json::json!({"x": 1}));
        let err = row.decode::<Ping>().unwrap_err();
        assert!(matches!(err, StoreError::Serialization(_)));
    }

    #[test]
    fn test_kind_priority_ranks_unknown_last() {
        let priority = KindPriority::new(["a", "b"]);
        assert_eq!(priority.rank("a"), 0);
        assert_eq!(priority.rank("b"), 1);
        assert_eq!(priority.rank("zzz"), 2);
    }
}

//! Serving-core components and their composition.

pub mod admission;
pub mod background;
pub mod cache;
pub mod cursor;
pub mod dispatcher;
pub mod error;
pub mod fingerprint;
pub mod gateway;
pub mod outbox;
pub mod resource_pool;

pub use admission::{Admission, AdmissionController, BucketPolicy, RateBucket, RoutePolicy};
pub use background::{BackgroundLoop, Spawn};
pub use cache::{Cache, CacheEntry, CacheEvent, CacheSettings, CacheStats, InvalidationTarget, LoadOptions};
pub use cursor::{paginate, Cursor, CursorCodec, Direction, KeysetSource, Page, SortKey, SortKind, SortValue};
pub use dispatcher::{
    backoff_delay, Completion, Dispatcher, DispatcherSettings, Enqueued, RunReport, TaskFailure, TaskHandler,
    TaskKind, TaskRecord, TaskRequest, TaskState, TaskStore, TASK_TOPIC,
};
pub use error::{AppResult, GatewayError};
pub use fingerprint::Fingerprint;
pub use gateway::{CachePolicy, Effects, Gateway, GatewayStatus, Operation, TransactionalConnection, TxOf};
pub use outbox::{
    CacheInvalidator, DedupSubscriber, OutboxConnection, OutboxEvent, OutboxPublisher, OutboxRecord, OutboxRecorder,
    OutboxSubscriber, PublishReport, PublishedEvent, UnitOfWork,
};
pub use resource_pool::{PoolHealth, PoolLimits, PoolStats, ResourceManager, ResourcePool, Slot};

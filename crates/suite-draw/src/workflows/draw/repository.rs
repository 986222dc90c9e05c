use super::domain::{DrawAggregate, DrawId};
use super::notifications::{NotificationEvent, OutboxEntry};

/// One atomic write: the new aggregate state plus the events it produced.
#[derive(Debug, Clone)]
pub struct DrawCommit {
    pub expected_version: u64,
    pub aggregate: DrawAggregate,
    pub outbox: Vec<NotificationEvent>,
}

/// Storage abstraction for draws and their notification outbox.
///
/// `commit` must store the aggregate and append the outbox events together or
/// not at all, reject a stale `expected_version`, and reject aggregates failing
/// [`DrawAggregate::check_invariants`]. The stored aggregate carries
/// `expected_version + 1`.
pub trait DrawRepository: Send + Sync {
    fn insert(&self, aggregate: DrawAggregate) -> Result<DrawAggregate, RepositoryError>;
    fn fetch(&self, id: &DrawId) -> Result<Option<DrawAggregate>, RepositoryError>;
    fn commit(&self, commit: DrawCommit) -> Result<DrawAggregate, RepositoryError>;
    fn pending_notifications(&self, limit: usize) -> Result<Vec<OutboxEntry>, RepositoryError>;
    fn mark_delivered(&self, ids: &[u64]) -> Result<(), RepositoryError>;
    fn record_failed_attempt(&self, ids: &[u64]) -> Result<(), RepositoryError>;
}

/// Error enumeration for repository failures.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("draw already exists")]
    Duplicate,
    #[error("draw not found")]
    NotFound,
    #[error("draw was changed by another writer (expected version {expected}, found {found})")]
    VersionMismatch { expected: u64, found: u64 },
    #[error("draw rejected at the storage boundary: {}", .0.join("; "))]
    Invariant(Vec<String>),
    #[error("repository unavailable: {0}")]
    Unavailable(String),
}

//! Failure taxonomy for discovery, mutation, waits, and orchestration.

use thiserror::Error;

use crate::Phase;

/// Failures while resolving resource coordinates.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("resource not found")]
    NotFound,
    #[error("read failed: {0}")]
    ReadFailure(String),
    #[error("missing or non-string field: {0}")]
    SchemaMismatch(String),
}

/// Failures while applying a state-changing patch.
#[derive(Debug, Error)]
pub enum MutationError {
    #[error("patch rejected: {0}")]
    PatchRejected(String),
    #[error("failed to encode patch: {0}")]
    EncodingFailure(String),
}

/// Failures while waiting for a target phase.
#[derive(Debug, Error)]
pub enum WaitError {
    #[error("cancelled before the target phase was observed")]
    Cancelled,
    #[error("watch subscription failed: {0}")]
    SubscribeFailed(String),
    #[error("watch closed before the target phase was observed")]
    WatchClosed,
    #[error("unexpected watch event shape: {0}")]
    UnexpectedShape(String),
    #[error("status.phase missing on watched object")]
    PhaseFieldMissing,
}

/// Orchestration-level error: the underlying kind, tagged with the
/// operation and the stream id it was performed for.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("failed to discover coordinates for stream {id}")]
    Discovery {
        id: String,
        #[source]
        source: DiscoveryError,
    },
    #[error("stream class is required when the run for stream {id} is absent")]
    MissingStreamClass { id: String },
    #[error("failed to {op} stream {id}")]
    Mutation {
        op: &'static str,
        id: String,
        #[source]
        source: MutationError,
    },
    #[error("failed to reach {phase} phase for stream {id}")]
    Wait {
        phase: Phase,
        id: String,
        #[source]
        source: WaitError,
    },
}

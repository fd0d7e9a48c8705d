//! Quarry: a distributed priority job queue for scrape workers, backed by
//! FoundationDB.
//!
//! The queue guarantees that every pushed job is claimed by at most one
//! worker — even under aggressive contention — via a conflict-free
//! versionstamp claim protocol, and keeps tenants and crawls inside their
//! configured concurrency ceilings with a lease-based semaphore. Workers
//! are expected to be idempotent: the queue promises at-most-one *claim*,
//! not exactly-once *execution*.

pub mod backoff;
pub mod client;
pub mod codec;
pub mod janitor;
pub mod queue_store;
pub mod semaphore;
pub mod server;
pub mod settings;
pub mod trace;

/// Generated protobuf/gRPC types.
pub mod pb {
    tonic::include_proto!("quarry.v1");
}

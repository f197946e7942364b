//! Staged-job storage for the Portway bridge.
//!
//! The staging table is the hand-off point between ingestion (TCP frames or
//! an external producer writing rows directly) and the dispatch pipeline.
//! Ownership of a row is arbitrated by the database itself through row-level
//! locks: claimants select with `FOR UPDATE SKIP LOCKED`, so any number of
//! pollers can drain the same table without a coordinator.

mod error;
mod job;
mod repository;

pub use error::StoreError;
pub use job::{JobStatus, ResponseRecord, StagedJob};
pub use repository::{ClaimedBatch, JobRepository, StoreConfig};

//! Background job queue and scheduler for a Postgres-backed service.
//!
//! The database is the only coordination substrate: job claims use
//! `FOR UPDATE SKIP LOCKED`, scheduler ticks use a conditional
//! advance-and-enqueue transaction, and materialized-view refreshes are
//! serialized with advisory locks. Any number of instances can run the
//! same set of loops against the same database.

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod jobs;
pub mod matview;

pub use config::Config;
pub use error::{QueueError, QueueResult};
pub use jobs::service::JobService;

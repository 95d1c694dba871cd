//! Core library for the weather cache service.
//!
//! Two processes share this crate: the `api` binary serves the read path
//! through [`coordinator::CacheCoordinator`], and the `worker` binary drains
//! the fill queue through [`worker::FillWorker`]. Every external
//! collaborator (cache backend, work queue, observation store, geocoder,
//! weather source) sits behind a trait with a production implementation and
//! an in-memory one for tests.

pub mod cache;
pub mod config;
pub mod coordinator;
pub mod model;
pub mod queue;
pub mod routes;
pub mod source;
pub mod store;
pub mod worker;

pub use config::Config;
pub use coordinator::{CacheCoordinator, CoordinatorSettings, FetchOutcome};
pub use model::{LocationKey, Observation, QueueMessage};
pub use worker::FillWorker;

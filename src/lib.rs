//! Durable tracking for long-running generation runs.
//!
//! - [`tracker::RunTracker`] follows one submitted run to a terminal state by
//!   polling, surviving reloads through a persisted run id.
//! - [`registry::RegistrySync`] keeps a user's list of runs current from a
//!   bulk listing plus a push-event stream.
//!
//! Both talk to the server only through [`transport::TransportAdapter`] and
//! persist through [`storage::PersistenceAdapter`].

pub mod error;
pub mod model;
pub mod registry;
pub mod storage;
pub mod tracker;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{TrackerError, TrackerResult};
pub use model::{GenerationRecord, RunSnapshot, WorkflowRunStatus};
pub use registry::{RegistryConfig, RegistrySync, RegistryView};
pub use tracker::{RunTracker, TrackOptions};
pub use transport::{ClientConfig, HttpTransport, TransportAdapter};

//! Job Dispatch: admission control and reliable hand-off of jobs to a message broker.

pub mod admission;
pub mod broker;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod overflow;
pub mod results;
pub mod server;
pub mod store;
pub mod telemetry;

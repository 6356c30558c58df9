//! Embedded usage-metering agent.
//!
//! The agent accepts discrete usage reports for a set of declared metrics,
//! aggregates them according to a per-metric policy (passthrough or windowed
//! summation), and delivers finalized reports to one or more durable
//! endpoints. Aggregation state is persisted so a process restart resumes an
//! interrupted window instead of dropping it.
//!
//! The entry point is [`agent::Agent`], built from a declarative
//! [`config::Config`] and a state directory.

pub mod agent;
pub mod aggregator;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod persistence;
pub mod report;
pub mod source;

pub use agent::Agent;
pub use config::Config;
pub use error::Error;
pub use report::{MetricValue, Report};

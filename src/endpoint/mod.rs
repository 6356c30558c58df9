//! Delivery targets for finalized reports.
//!
//! Endpoints are enum-dispatched rather than boxed trait objects; adding a
//! new target means a new variant and match arm. The [`Dispatcher`] fans a
//! finalized report out to every endpoint its metric is bound to, isolating
//! per-endpoint failures so one broken target cannot block the others.

pub mod disk;

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::Config;
use crate::error::Error;
use crate::report::Report;

pub use disk::DiskEndpoint;

/// A single delivery target.
#[derive(Debug)]
pub enum Endpoint {
    Disk(DiskEndpoint),
}

impl Endpoint {
    /// Builds every endpoint declared in the configuration. The config has
    /// already been validated, so each entry carries exactly one kind.
    pub fn build_all(cfg: &Config) -> Result<Vec<Arc<Endpoint>>, Error> {
        let mut endpoints = Vec::with_capacity(cfg.endpoints.len());
        for ep in &cfg.endpoints {
            let Some(disk) = &ep.disk else {
                return Err(Error::config(format!(
                    "endpoint {}: missing kind configuration",
                    ep.name,
                )));
            };
            endpoints.push(Arc::new(Endpoint::Disk(DiskEndpoint::open(
                &ep.name, disk,
            )?)));
        }
        Ok(endpoints)
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Disk(ep) => ep.name(),
        }
    }

    /// Durably accepts one finalized report.
    pub fn send(&self, report: &Report) -> Result<(), Error> {
        match self {
            Self::Disk(ep) => ep.send(report),
        }
    }

    /// Spawns the endpoint's background maintenance task, if it has one.
    /// The task exits when `token` is cancelled.
    pub fn spawn_maintenance(
        self: &Arc<Self>,
        token: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        match self.as_ref() {
            Self::Disk(_) => {
                let ep = Arc::clone(self);
                Some(tokio::spawn(async move {
                    let Self::Disk(disk) = ep.as_ref();
                    disk.run_sweeper(token).await;
                }))
            }
        }
    }
}

/// The subset of endpoints one metric delivers to.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    endpoints: Vec<Arc<Endpoint>>,
}

impl Dispatcher {
    /// Selects the endpoints named in `names` out of `all`. Validation has
    /// already rejected dangling names.
    pub fn new(all: &[Arc<Endpoint>], names: &[String]) -> Self {
        let endpoints = all
            .iter()
            .filter(|ep| names.iter().any(|n| n == ep.name()))
            .cloned()
            .collect();
        Self { endpoints }
    }

    /// Sends the report to every bound endpoint. Each endpoint is attempted
    /// regardless of earlier failures; the first error is returned so the
    /// caller can retry the whole report later.
    pub fn dispatch(&self, report: &Report) -> Result<(), Error> {
        let mut first_err = None;
        for ep in &self.endpoints {
            if let Err(e) = ep.send(report) {
                warn!(
                    endpoint = %ep.name(),
                    metric = %report.name,
                    error = %e,
                    "failed to deliver report",
                );
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

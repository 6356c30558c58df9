//! Agent lifecycle: construction, report intake, and ordered shutdown.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::aggregator::Aggregator;
use crate::config::Config;
use crate::endpoint::{Dispatcher, Endpoint};
use crate::error::Error;
use crate::persistence::StateStore;
use crate::report::Report;
use crate::source::Source;

/// The embedded metering agent.
///
/// Built from a validated [`Config`]; accepts reports via [`Agent::submit`]
/// or [`Agent::add_report`] until [`Agent::shutdown`] completes. With a
/// state directory, buffered aggregation state survives restarts; without
/// one, state is held in memory only.
pub struct Agent {
    aggregators: HashMap<String, Arc<Aggregator>>,
    pipeline: Option<Pipeline>,
}

/// Running background tasks, grouped by shutdown stage.
struct Pipeline {
    sources: TaskGroup,
    aggregators: TaskGroup,
    endpoints: TaskGroup,
}

struct TaskGroup {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl TaskGroup {
    fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            handles: Vec::new(),
        }
    }

    /// Cancels the group and waits for every task to exit.
    async fn stop(self) {
        self.token.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "background task panicked during shutdown");
            }
        }
    }
}

impl Agent {
    /// Validates the configuration, builds the pipeline, and starts every
    /// background task. On any error nothing keeps running and no partial
    /// agent is returned.
    ///
    /// `state_dir` roots the persisted aggregation state; passing `None`
    /// keeps state in memory, trading crash recovery for zero filesystem
    /// footprint.
    pub async fn start(cfg: Config, state_dir: Option<&Path>) -> Result<Self, Error> {
        cfg.validate()?;

        let store = Arc::new(match state_dir {
            Some(dir) => StateStore::disk(dir)?,
            None => StateStore::memory(),
        });

        let endpoints = Endpoint::build_all(&cfg)?;

        let mut aggregators = HashMap::new();
        for (name, def) in cfg.metric_defs() {
            let dispatcher = Dispatcher::new(&endpoints, &def.endpoints);
            let aggregator = Arc::new(Aggregator::new(def, dispatcher, Arc::clone(&store))?);
            aggregators.insert(name, aggregator);
        }

        let mut aggregator_group = TaskGroup::new();
        for aggregator in aggregators.values() {
            aggregator_group
                .handles
                .push(aggregator.spawn(aggregator_group.token.child_token()));
        }

        let mut source_group = TaskGroup::new();
        for source in Source::build_all(&cfg, &aggregators)? {
            source_group
                .handles
                .push(source.spawn(source_group.token.child_token()));
        }

        let mut endpoint_group = TaskGroup::new();
        for endpoint in &endpoints {
            if let Some(handle) = endpoint.spawn_maintenance(endpoint_group.token.child_token())
            {
                endpoint_group.handles.push(handle);
            }
        }

        info!(
            metrics = aggregators.len(),
            endpoints = endpoints.len(),
            "agent started",
        );
        Ok(Self {
            aggregators,
            pipeline: Some(Pipeline {
                sources: source_group,
                aggregators: aggregator_group,
                endpoints: endpoint_group,
            }),
        })
    }

    /// Accepts one typed report for aggregation and delivery.
    pub fn submit(&self, report: Report) -> Result<(), Error> {
        if self.pipeline.is_none() {
            return Err(Error::Stopped);
        }
        let Some(aggregator) = self.aggregators.get(&report.name) else {
            return Err(Error::UnknownMetric(report.name));
        };
        aggregator.submit(report)
    }

    /// Accepts one report from its self-describing JSON encoding.
    pub fn add_report(&self, json: &str) -> Result<(), Error> {
        self.submit(Report::from_json(json)?)
    }

    /// Stops the agent without losing accepted reports.
    ///
    /// Sources stop first so no new reports are generated, then aggregators
    /// flush their windows and drain their queues, then endpoint
    /// maintenance tasks exit. A second call is a no-op.
    pub async fn shutdown(&mut self) -> Result<(), Error> {
        let Some(pipeline) = self.pipeline.take() else {
            return Ok(());
        };
        info!("agent shutting down");
        pipeline.sources.stop().await;
        pipeline.aggregators.stop().await;
        pipeline.endpoints.stop().await;
        info!("agent stopped");
        Ok(())
    }
}

//! Caller-independent report sources.
//!
//! Sources feed the same per-metric aggregators that external callers do,
//! so their reports are validated, aggregated, and delivered identically.
//! The only built-in source is the heartbeat, which meters elapsed time by
//! reporting a fixed value at a fixed interval.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::aggregator::Aggregator;
use crate::config::Config;
use crate::error::Error;
use crate::report::{MetricValue, Report};

/// A configured report source.
#[derive(Debug)]
pub enum Source {
    Heartbeat(HeartbeatSource),
}

impl Source {
    /// Builds every source declared in the configuration, binding each to
    /// its target metric's aggregator. The config has already been
    /// validated, so targets exist and kinds are unambiguous.
    pub fn build_all(
        cfg: &Config,
        aggregators: &HashMap<String, Arc<Aggregator>>,
    ) -> Result<Vec<Source>, Error> {
        let mut sources = Vec::with_capacity(cfg.sources.len());
        for src in &cfg.sources {
            let Some(hb) = &src.heartbeat else {
                return Err(Error::config(format!(
                    "source {}: missing kind configuration",
                    src.name,
                )));
            };
            let Some(aggregator) = aggregators.get(&hb.metric) else {
                return Err(Error::config(format!(
                    "source {}: unknown metric: {}",
                    src.name, hb.metric,
                )));
            };
            sources.push(Source::Heartbeat(HeartbeatSource::new(
                &src.name,
                &hb.metric,
                Duration::from_secs(hb.interval_seconds as u64),
                hb.value,
                Arc::clone(aggregator),
            )));
        }
        Ok(sources)
    }

    /// Starts the source's emit loop. The task exits when `token` is
    /// cancelled.
    pub fn spawn(self, token: CancellationToken) -> JoinHandle<()> {
        match self {
            Self::Heartbeat(src) => tokio::spawn(async move { src.run(token).await }),
        }
    }
}

/// Emits one fixed-value report per interval for a single metric.
///
/// Reports cover consecutive, gap-free spans: each report's start time is
/// the previous report's end time, beginning from the start instant rounded
/// to the nearest whole second.
#[derive(Debug)]
pub struct HeartbeatSource {
    name: String,
    metric: String,
    interval: Duration,
    value: MetricValue,
    aggregator: Arc<Aggregator>,
}

impl HeartbeatSource {
    pub fn new(
        name: &str,
        metric: &str,
        interval: Duration,
        value: MetricValue,
        aggregator: Arc<Aggregator>,
    ) -> Self {
        Self {
            name: name.to_string(),
            metric: metric.to_string(),
            interval,
            value,
            aggregator,
        }
    }

    async fn run(self, token: CancellationToken) {
        let span = chrono::Duration::from_std(self.interval)
            .unwrap_or_else(|_| chrono::Duration::seconds(1));
        let mut span_start = round_to_second(Utc::now());

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // Skip the immediate first tick; a beat marks the end of a span.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!(source = %self.name, "heartbeat stopped");
                    return;
                }
                _ = ticker.tick() => {
                    // A skipped tick leaves the span behind the wall clock;
                    // emit until caught up so metered time stays gap-free.
                    let now = Utc::now();
                    while span_start + span <= now {
                        let end = span_start + span;
                        self.beat(span_start, end);
                        span_start = end;
                    }
                }
            }
        }
    }

    fn beat(&self, start: DateTime<Utc>, end: DateTime<Utc>) {
        let report = Report {
            name: self.metric.clone(),
            start_time: start,
            end_time: end,
            value: self.value,
        };
        match self.aggregator.submit(report) {
            Ok(()) => debug!(source = %self.name, metric = %self.metric, "heartbeat"),
            Err(e) => warn!(source = %self.name, error = %e, "heartbeat rejected"),
        }
    }
}

/// Rounds a timestamp to the nearest whole second, halves up.
fn round_to_second(t: DateTime<Utc>) -> DateTime<Utc> {
    let mut secs = t.timestamp();
    if t.timestamp_subsec_nanos() >= 500_000_000 {
        secs += 1;
    }
    Utc.timestamp_opt(secs, 0).single().unwrap_or(t)
}

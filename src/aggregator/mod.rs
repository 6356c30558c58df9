//! Per-metric aggregation.
//!
//! Every configured metric owns one aggregator. Passthrough metrics forward
//! each accepted report to their endpoints as-is; buffered metrics fold
//! reports into a running window and emit one combined report per window.
//! Buffered state is persisted on every accepted report, so a restart
//! resumes the interrupted window instead of dropping it.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{AggregationPolicy, MetricDef};
use crate::endpoint::Dispatcher;
use crate::error::Error;
use crate::persistence::StateStore;
use crate::report::Report;

/// A metric's aggregation pipeline stage, dispatched by policy.
#[derive(Debug)]
pub enum Aggregator {
    Passthrough(PassthroughAggregator),
    Buffered(BufferedAggregator),
}

impl Aggregator {
    /// Builds the aggregator for one metric, restoring any persisted window
    /// state for buffered metrics.
    pub fn new(
        def: MetricDef,
        dispatcher: Dispatcher,
        store: Arc<StateStore>,
    ) -> Result<Self, Error> {
        match def.policy {
            AggregationPolicy::Passthrough => {
                Ok(Self::Passthrough(PassthroughAggregator::new(def, dispatcher)))
            }
            AggregationPolicy::BufferedSum { .. } => Ok(Self::Buffered(
                BufferedAggregator::new(def, dispatcher, store)?,
            )),
        }
    }

    pub fn metric(&self) -> &str {
        match self {
            Self::Passthrough(agg) => &agg.def.name,
            Self::Buffered(agg) => &agg.def.name,
        }
    }

    /// Accepts one report. Validation failures are returned to the caller;
    /// an accepted report is guaranteed to be delivered (buffered) or
    /// handed to the delivery worker (passthrough).
    pub fn submit(&self, report: Report) -> Result<(), Error> {
        match self {
            Self::Passthrough(agg) => agg.submit(report),
            Self::Buffered(agg) => agg.submit(report),
        }
    }

    /// Spawns the aggregator's background task: the flush loop for buffered
    /// metrics, the delivery worker for passthrough metrics. The task
    /// drains outstanding work before exiting on cancellation.
    pub fn spawn(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let agg = Arc::clone(self);
        tokio::spawn(async move {
            match agg.as_ref() {
                Self::Passthrough(inner) => inner.run(token).await,
                Self::Buffered(inner) => inner.run(token).await,
            }
        })
    }
}

/// Forwards each report to the metric's endpoints without modification.
///
/// Reports travel through an unbounded channel to a delivery worker so that
/// `submit` never blocks on endpoint I/O. A report that fails delivery is
/// logged and dropped; passthrough carries no retry state.
#[derive(Debug)]
pub struct PassthroughAggregator {
    def: MetricDef,
    dispatcher: Dispatcher,
    tx: mpsc::UnboundedSender<Report>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Report>>>,
}

impl PassthroughAggregator {
    fn new(def: MetricDef, dispatcher: Dispatcher) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            def,
            dispatcher,
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    fn submit(&self, report: Report) -> Result<(), Error> {
        report.validate(&self.def)?;
        self.tx.send(report).map_err(|_| Error::Stopped)
    }

    async fn run(&self, token: CancellationToken) {
        let rx = self
            .rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut rx) = rx else {
            // The worker was already started once; nothing to do.
            return;
        };

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    // Deliver everything already accepted before exiting.
                    while let Ok(report) = rx.try_recv() {
                        self.deliver(&report);
                    }
                    info!(metric = %self.def.name, "passthrough worker stopped");
                    return;
                }
                Some(report) = rx.recv() => {
                    self.deliver(&report);
                }
            }
        }
    }

    fn deliver(&self, report: &Report) {
        if let Err(e) = self.dispatcher.dispatch(report) {
            warn!(
                metric = %self.def.name,
                error = %e,
                "dropping passthrough report after delivery failure",
            );
        }
    }
}

/// Persisted window state for one buffered metric.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct BufferState {
    window: Option<WindowState>,
    /// A window taken out for delivery but not yet confirmed delivered.
    /// Kept durable so a crash mid-dispatch cannot lose it to a concurrent
    /// submit overwriting the state file. Restored into `window` on load.
    #[serde(default)]
    pending: Option<WindowState>,
}

/// The running window: combined time range and summed value of every
/// report accepted since the last flush.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WindowState {
    #[serde(rename = "startTime")]
    start_time: DateTime<Utc>,
    #[serde(rename = "endTime")]
    end_time: DateTime<Utc>,
    value: crate::report::MetricValue,
}

impl WindowState {
    fn from_report(report: &Report) -> Self {
        Self {
            start_time: report.start_time,
            end_time: report.end_time,
            value: report.value,
        }
    }

    /// Widens the time range to cover `report` and adds its value.
    fn merge(&mut self, report: &Report) -> Result<(), Error> {
        self.start_time = self.start_time.min(report.start_time);
        self.end_time = self.end_time.max(report.end_time);
        self.value.accumulate(report.value)
    }

    /// Folds another window into this one.
    fn absorb(&mut self, other: WindowState) -> Result<(), Error> {
        self.start_time = self.start_time.min(other.start_time);
        self.end_time = self.end_time.max(other.end_time);
        self.value.accumulate(other.value)
    }

    fn to_report(&self, metric: &str) -> Report {
        Report {
            name: metric.to_string(),
            start_time: self.start_time,
            end_time: self.end_time,
            value: self.value,
        }
    }
}

/// Sums reports over a fixed window and emits one report per window.
///
/// The window is flushed by a background ticker and once more on shutdown.
/// If any endpoint rejects the flushed report, the window is merged back
/// and retried on the next tick.
#[derive(Debug)]
pub struct BufferedAggregator {
    def: MetricDef,
    window: std::time::Duration,
    dispatcher: Dispatcher,
    store: Arc<StateStore>,
    state_key: String,
    state: Mutex<BufferState>,
}

impl BufferedAggregator {
    fn new(
        def: MetricDef,
        dispatcher: Dispatcher,
        store: Arc<StateStore>,
    ) -> Result<Self, Error> {
        let AggregationPolicy::BufferedSum { window } = def.policy else {
            return Err(Error::config(format!(
                "metric {}: not a buffered metric",
                def.name,
            )));
        };
        let state_key = format!("aggregator/{}", def.name);
        let mut state = match store.load::<BufferState>(&state_key) {
            Ok(Some(state)) => {
                if state.window.is_some() {
                    info!(metric = %def.name, "resuming interrupted aggregation window");
                }
                state
            }
            Ok(None) => BufferState::default(),
            // Unreadable state is discarded rather than wedging the agent.
            Err(Error::Validation(msg)) => {
                warn!(metric = %def.name, error = %msg, "discarding corrupt aggregation state");
                BufferState::default()
            }
            Err(e) => return Err(e),
        };
        // A pending window means the last run died mid-delivery. Fold it
        // back in; the report may be emitted twice, never zero times.
        if let Some(pending) = state.pending.take() {
            info!(metric = %def.name, "recovering window interrupted mid-delivery");
            match &mut state.window {
                Some(window) => {
                    if let Err(e) = window.absorb(pending) {
                        warn!(metric = %def.name, error = %e, "failed to recover pending window");
                    }
                }
                None => state.window = Some(pending),
            }
        }
        Ok(Self {
            def,
            window,
            dispatcher,
            store,
            state_key,
            state: Mutex::new(state),
        })
    }

    /// Folds one report into the current window and persists the result.
    /// The report is accepted even if persistence fails; only crash
    /// recovery degrades in that case.
    fn submit(&self, report: Report) -> Result<(), Error> {
        report.validate(&self.def)?;
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match &mut state.window {
            Some(window) => window.merge(&report)?,
            None => state.window = Some(WindowState::from_report(&report)),
        }
        self.persist(&state);
        debug!(metric = %self.def.name, "report folded into window");
        Ok(())
    }

    /// Emits the current window to the metric's endpoints, if non-empty.
    /// On delivery failure the window is merged back for the next attempt.
    fn flush(&self) -> Result<(), Error> {
        let window = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(window) = state.window.take() else {
                return Ok(());
            };
            // Record the in-flight window before releasing the lock. A
            // concurrent submit persists the state file; without this the
            // taken window would vanish from durable state mid-delivery.
            state.pending = Some(window.clone());
            self.persist(&state);
            window
        };

        let report = window.to_report(&self.def.name);
        match self.dispatcher.dispatch(&report) {
            Ok(()) => {
                let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
                state.pending = None;
                self.persist(&state);
                debug!(metric = %self.def.name, "window flushed");
                Ok(())
            }
            Err(e) => {
                let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
                state.pending = None;
                match &mut state.window {
                    // Reports accepted during the failed dispatch started a
                    // new window; fold the unsent one back into it.
                    Some(current) => {
                        if let Err(merge_err) = current.absorb(window) {
                            warn!(
                                metric = %self.def.name,
                                error = %merge_err,
                                "failed to restore unsent window",
                            );
                        }
                    }
                    None => state.window = Some(window),
                }
                self.persist(&state);
                Err(e)
            }
        }
    }

    fn persist(&self, state: &BufferState) {
        if let Err(e) = self.store.store(&self.state_key, state) {
            warn!(
                metric = %self.def.name,
                error = %e,
                "failed to persist aggregation state",
            );
        }
    }

    async fn run(&self, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.window);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // Consume the immediate first tick; the first flush happens one
        // full window after start.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    if let Err(e) = self.flush() {
                        warn!(metric = %self.def.name, error = %e, "final flush failed");
                    }
                    info!(metric = %self.def.name, "flush loop stopped");
                    return;
                }
                _ = ticker.tick() => {
                    // Errors were already logged per endpoint; the window
                    // was merged back and will retry next tick.
                    let _ = self.flush();
                }
            }
        }
    }
}

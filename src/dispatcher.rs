//! Concurrent fleet dispatcher.
//!
//! Fans one operation out across a target fleet under bounded concurrency.
//! Each worker runs the connection negotiator to completion, applies the
//! caller's operation when the device is authorized, always releases the
//! session, and reports its outcome by return value — the dispatcher joins
//! every worker and partitions the reports, so no result collection is ever
//! shared between tasks. The only cross-worker shared state is the
//! synchronized progress sink.

use futures::future::{BoxFuture, join_all};
use log::{debug, error};
use schemars::JsonSchema;
use serde::Serialize;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

use crate::error::{FailureKind, FleetError};
use crate::negotiator::{
    ConnectionNegotiator, Credentials, DeviceSession, DeviceTarget, NegotiatedSession,
    NegotiatorOptions,
};
use crate::shell::ShellDialer;

/// Default worker bound, capped to the target count at dispatch time.
pub const DEFAULT_CONCURRENCY: usize = 50;

/// Per-device operation applied to each authorized live session.
pub type DeviceOp<R> = Arc<
    dyn for<'a> Fn(&'a mut NegotiatedSession) -> BoxFuture<'a, anyhow::Result<R>> + Send + Sync,
>;

/// Wraps a closure into a [`DeviceOp`].
pub fn device_op<R, F>(f: F) -> DeviceOp<R>
where
    F: for<'a> Fn(&'a mut NegotiatedSession) -> BoxFuture<'a, anyhow::Result<R>>
        + Send
        + Sync
        + 'static,
{
    Arc::new(f)
}

/// Line-atomic progress output shared by concurrent workers.
///
/// Every line is written and flushed under one mutex so output from
/// concurrent workers never interleaves mid-line.
#[derive(Clone)]
pub struct ProgressSink {
    out: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl ProgressSink {
    /// Sink writing to the process stdout.
    pub fn stdout() -> Self {
        Self::from_writer(io::stdout())
    }

    /// Sink writing to an arbitrary writer (used by tests and embedders).
    pub fn from_writer(writer: impl Write + Send + 'static) -> Self {
        Self {
            out: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    fn line(&self, text: &str) {
        if let Ok(mut out) = self.out.lock() {
            let _ = writeln!(out, "{text}");
            let _ = out.flush();
        }
    }
}

/// One successful device: the negotiated session paired with the
/// operation's return value.
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct FleetSuccess<R> {
    /// Negotiation outcome and identity metadata.
    pub session: DeviceSession,
    /// The caller operation's return value.
    pub output: R,
}

/// Aggregate outcome of one dispatch.
///
/// Completion order is arbitrary; the position of a device inside either
/// collection carries no meaning. The original target list is retained for
/// the post-run reconciliation audit.
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct DispatchResult<R> {
    /// Devices whose operation ran against an authorized session.
    pub successes: Vec<FleetSuccess<R>>,
    /// Devices that failed negotiation or whose operation errored.
    pub failures: Vec<DeviceSession>,
    /// The input targets, unchanged.
    pub targets: Vec<DeviceTarget>,
}

enum DeviceReport<R> {
    Success { session: DeviceSession, output: R },
    Failure { session: DeviceSession },
}

/// Applies one operation to every reachable device in a target list.
pub struct FleetDispatcher {
    dialer: Arc<dyn ShellDialer>,
    concurrency: usize,
    verbose: bool,
    negotiator_options: NegotiatorOptions,
    progress: ProgressSink,
}

impl FleetDispatcher {
    /// Creates a dispatcher with default concurrency and silent progress.
    pub fn new(dialer: Arc<dyn ShellDialer>) -> Self {
        Self {
            dialer,
            concurrency: DEFAULT_CONCURRENCY,
            verbose: false,
            negotiator_options: NegotiatorOptions::default(),
            progress: ProgressSink::stdout(),
        }
    }

    /// Sets the worker bound. Capped to the target count at dispatch time;
    /// a bound of zero is treated as one.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Enables one progress line per completed device.
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Sets the per-device negotiation options.
    pub fn with_negotiator_options(mut self, options: NegotiatorOptions) -> Self {
        self.negotiator_options = options;
        self
    }

    /// Redirects progress output, e.g. into a capture buffer.
    pub fn with_progress_sink(mut self, sink: ProgressSink) -> Self {
        self.progress = sink;
        self
    }

    /// Dispatches the operation across the fleet and blocks until every
    /// worker has reported.
    ///
    /// The only errors raised are input errors, before any work starts.
    /// Every per-device failure is data in the returned result.
    pub async fn dispatch<R>(
        &self,
        targets: Vec<DeviceTarget>,
        credentials: Credentials,
        operation: DeviceOp<R>,
    ) -> Result<DispatchResult<R>, FleetError>
    where
        R: Send + 'static,
    {
        if targets.is_empty() {
            return Err(FleetError::EmptyTargetList);
        }
        credentials.validate()?;

        let bound = effective_concurrency(self.concurrency, targets.len());
        debug!("dispatching {} targets with {} workers", targets.len(), bound);
        let semaphore = Arc::new(Semaphore::new(bound));

        let tasks: Vec<_> = targets
            .iter()
            .map(|target| {
                let target = target.clone();
                let credentials = credentials.clone();
                let dialer = self.dialer.clone();
                let options = self.negotiator_options.clone();
                let operation = operation.clone();
                let semaphore = Arc::clone(&semaphore);
                let progress = self.verbose.then(|| self.progress.clone());

                tokio::spawn(async move {
                    // The semaphore is never closed; a failed acquire can
                    // only mean shutdown, in which case run unbounded.
                    let _permit = semaphore.acquire_owned().await.ok();
                    run_one(dialer, target, credentials, options, operation, progress).await
                })
            })
            .collect();

        let joined = join_all(tasks).await;

        let mut successes = Vec::new();
        let mut failures = Vec::new();
        for (idx, outcome) in joined.into_iter().enumerate() {
            match outcome {
                Ok(DeviceReport::Success { session, output }) => {
                    successes.push(FleetSuccess { session, output });
                }
                Ok(DeviceReport::Failure { session }) => failures.push(session),
                Err(join_err) => {
                    // A lost worker lands in neither collection; the
                    // reconciliation audit reports it afterwards.
                    error!(
                        "worker for {} was lost: {join_err}",
                        targets
                            .get(idx)
                            .map(|t| t.address.as_str())
                            .unwrap_or("unknown")
                    );
                }
            }
        }

        Ok(DispatchResult {
            successes,
            failures,
            targets,
        })
    }
}

fn effective_concurrency(bound: usize, target_count: usize) -> usize {
    bound.max(1).min(target_count)
}

async fn run_one<R>(
    dialer: Arc<dyn ShellDialer>,
    target: DeviceTarget,
    credentials: Credentials,
    options: NegotiatorOptions,
    operation: DeviceOp<R>,
    progress: Option<ProgressSink>,
) -> DeviceReport<R> {
    let address = target.address.clone();
    let negotiator = ConnectionNegotiator::new(dialer, target, credentials, options);
    let mut negotiated = negotiator.negotiate().await;

    let report = if negotiated.session.authorized {
        let op_result = operation(&mut negotiated).await;
        // Release the session before reporting, even when the operation
        // failed.
        if let Err(err) = negotiated.close().await {
            debug!("{address} session close failed: {err}");
        }
        match op_result {
            Ok(output) => DeviceReport::Success {
                session: negotiated.session,
                output,
            },
            Err(err) => {
                debug!("{address} operation failed: {err:#}");
                let mut session = negotiated.session;
                session.failure = FailureKind::Operation;
                DeviceReport::Failure { session }
            }
        }
    } else {
        if let Err(err) = negotiated.close().await {
            debug!("{address} session close failed: {err}");
        }
        DeviceReport::Failure {
            session: negotiated.session,
        }
    };

    if let Some(progress) = progress {
        match &report {
            DeviceReport::Success { .. } => progress.line(&format!("Success: {address}")),
            DeviceReport::Failure { .. } => progress.line(&format!("Failure: {address}")),
        }
    }

    report
}

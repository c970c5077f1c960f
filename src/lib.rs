//! # netfleet - Concurrent Network Device Fleet Runner
//!
//! `netfleet` is a Rust library for running one operation against a fleet of
//! network devices (routers, switches, etc.) whose exact OS dialect,
//! privilege requirements, and reachability are not known in advance. It
//! connects to every target concurrently over SSH or Telnet, negotiates the
//! correct dialect and privilege level with a bounded fallback chain, runs a
//! caller-supplied function against each live session, and aggregates
//! per-device outcomes into success/failure reports.
//!
//! ## Features
//!
//! - **Negotiated Connections**: SSH dialect autodetection with fixed-dialect
//!   and Telnet fallback, privilege probing and escalation
//! - **Bounded Fleet Dispatch**: one worker per device under a configurable
//!   concurrency limit; per-device failures are data, never panics
//! - **Reconciliation Audit**: post-run check that every target landed in
//!   exactly one outcome set
//! - **Structured Output**: command responses parsed into records by
//!   per-dialect schemas, with raw-text fallback
//! - **Maximum Compatibility**: selectable SSH algorithm profiles for
//!   connecting to legacy devices
//! - **Async/Await**: built on Tokio for high-performance asynchronous
//!   operations
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use futures::FutureExt;
//! use netfleet::audit;
//! use netfleet::dispatcher::{FleetDispatcher, device_op};
//! use netfleet::negotiator::{Credentials, DeviceTarget};
//! use netfleet::shell::NetworkDialer;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let targets: Vec<DeviceTarget> = ["192.168.1.1", "192.168.1.2"]
//!         .into_iter()
//!         .map(DeviceTarget::new)
//!         .collect();
//!
//!     let dispatcher = FleetDispatcher::new(Arc::new(NetworkDialer::new()))
//!         .with_concurrency(50)
//!         .verbose(true);
//!
//!     let operation = device_op(|session| {
//!         async move {
//!             let response = session.send_command("show ip interface brief").await?;
//!             Ok(response)
//!         }
//!         .boxed()
//!     });
//!
//!     let result = dispatcher
//!         .dispatch(targets, Credentials::new("admin", "password"), operation)
//!         .await?;
//!
//!     println!(
//!         "{} succeeded, {} failed",
//!         result.successes.len(),
//!         result.failures.len()
//!     );
//!
//!     let report = audit::reconcile(&result);
//!     if !report.is_clean() {
//!         eprintln!("devices lost by the run: {:?}", report.missing);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Main Components
//!
//! - [`dispatcher::FleetDispatcher`] - bounded concurrent fan-out and result
//!   aggregation
//! - [`negotiator::ConnectionNegotiator`] - per-device protocol/dialect/
//!   privilege negotiation state machine
//! - [`audit::reconcile`] - post-run reconciliation check
//! - [`shell`] - the remote shell capability (SSH and Telnet clients)
//! - [`parser::SchemaRegistry`] - structured output extraction
//! - [`config`] - SSH algorithm profiles for legacy device compatibility

pub mod audit;
pub mod config;
pub mod dialect;
pub mod dispatcher;
pub mod error;
pub mod negotiator;
pub mod parser;
pub mod shell;
pub mod validators;

pub use audit::{ReconciliationReport, reconcile};
pub use dispatcher::{
    DeviceOp, DispatchResult, FleetDispatcher, FleetSuccess, ProgressSink, device_op,
};
pub use error::{DialError, FailureKind, FleetError};
pub use negotiator::{
    ConnectionNegotiator, Credentials, DeviceIdentity, DeviceSession, DeviceTarget,
    NegotiatedSession, NegotiatorOptions, TelnetSecretSeed,
};
pub use shell::{CommandResponse, NetworkDialer, Protocol, RemoteShell, ShellDialer};

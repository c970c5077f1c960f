//! Post-run reconciliation audit.
//!
//! Under rare conditions a concurrency primitive can silently drop a
//! worker, leaving its device in neither outcome collection. This audit
//! detects that residual defect after a dispatch. It is a pure check: it
//! reports, and never retries or repairs.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::dispatcher::DispatchResult;

/// Result of reconciling a dispatch against its input targets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ReconciliationReport {
    /// Target addresses present in neither outcome collection.
    pub missing: Vec<String>,
}

impl ReconciliationReport {
    /// True when every target landed in exactly one outcome collection.
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty()
    }
}

/// Checks that every dispatched target landed in exactly one of the
/// success/failure collections.
///
/// The set difference is only computed when the counts disagree; a matching
/// count is taken as clean.
pub fn reconcile<R>(result: &DispatchResult<R>) -> ReconciliationReport {
    let observed = result.successes.len() + result.failures.len();
    if observed == result.targets.len() {
        return ReconciliationReport::default();
    }

    let missing = result
        .targets
        .iter()
        .filter(|target| {
            let in_successes = result
                .successes
                .iter()
                .any(|success| success.session.address == target.address);
            let in_failures = result
                .failures
                .iter()
                .any(|failure| failure.address == target.address);
            !in_successes && !in_failures
        })
        .map(|target| target.address.clone())
        .collect();

    ReconciliationReport { missing }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::FleetSuccess;
    use crate::error::FailureKind;
    use crate::negotiator::{DeviceSession, DeviceTarget};
    use crate::shell::Protocol;

    fn session(address: &str) -> DeviceSession {
        DeviceSession {
            address: address.to_string(),
            connectivity: true,
            authenticated: true,
            authorized: true,
            privileged: true,
            protocol: Protocol::Ssh,
            dialect: "cisco_ios".to_string(),
            failure: FailureKind::None,
            identity: None,
        }
    }

    fn result_with(
        success_addrs: &[&str],
        failure_addrs: &[&str],
        target_addrs: &[&str],
    ) -> DispatchResult<()> {
        DispatchResult {
            successes: success_addrs
                .iter()
                .map(|addr| FleetSuccess {
                    session: session(addr),
                    output: (),
                })
                .collect(),
            failures: failure_addrs.iter().map(|addr| session(addr)).collect(),
            targets: target_addrs
                .iter()
                .map(|addr| DeviceTarget::new(*addr))
                .collect(),
        }
    }

    #[test]
    fn matching_counts_report_clean() {
        let result = result_with(
            &["10.0.0.1"],
            &["10.0.0.2"],
            &["10.0.0.1", "10.0.0.2"],
        );
        let report = reconcile(&result);
        assert!(report.is_clean());
        assert!(report.missing.is_empty());
    }

    #[test]
    fn dropped_target_is_reported_by_address() {
        let result = result_with(
            &["10.0.0.1"],
            &[],
            &["10.0.0.1", "10.0.0.2", "10.0.0.3"],
        );
        let report = reconcile(&result);
        assert!(!report.is_clean());
        assert_eq!(report.missing, vec!["10.0.0.2", "10.0.0.3"]);
    }

    #[test]
    fn audit_never_mutates_its_input() {
        let result = result_with(&["10.0.0.1"], &[], &["10.0.0.1", "10.0.0.2"]);
        let _ = reconcile(&result);
        assert_eq!(result.successes.len(), 1);
        assert_eq!(result.targets.len(), 2);
    }
}

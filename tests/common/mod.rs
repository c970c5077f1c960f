//! Scripted in-memory fleet used by the integration tests.
//!
//! Each device address maps to a deterministic plan describing how the
//! transport behaves; the dialer and shells never touch the network.

use async_trait::async_trait;
use netfleet::error::DialError;
use netfleet::shell::{CommandResponse, Protocol, RemoteShell, ShellDialer, TransportParams};
use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

/// Failure class injected by a device plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockError {
    Detect,
    Auth,
    Refused,
    Timeout,
}

impl MockError {
    fn to_err(self) -> DialError {
        match self {
            MockError::Detect => DialError::DialectDetection("ambiguous banner".to_string()),
            MockError::Auth => DialError::Authentication("rejected".to_string()),
            MockError::Refused => DialError::ConnectionRefused("refused".to_string()),
            MockError::Timeout => DialError::ConnectionTimeout("timed out".to_string()),
        }
    }
}

/// Deterministic transport behavior for one device address.
#[derive(Clone)]
pub struct DevicePlan {
    pub detect: Result<&'static str, MockError>,
    pub ssh_open: Result<(), MockError>,
    pub telnet_open: Result<(), MockError>,
    pub version_ok: bool,
    pub privileged_plain: bool,
    pub privileged_elevated: bool,
    pub hostname: &'static str,
}

impl DevicePlan {
    /// A healthy SSH device that is already privileged.
    pub fn healthy(hostname: &'static str) -> Self {
        Self {
            detect: Ok("cisco_ios"),
            ssh_open: Ok(()),
            telnet_open: Ok(()),
            version_ok: true,
            privileged_plain: true,
            privileged_elevated: true,
            hostname,
        }
    }

    /// Credentials bounce on every transport.
    pub fn auth_failure() -> Self {
        Self {
            detect: Err(MockError::Auth),
            ssh_open: Err(MockError::Auth),
            telnet_open: Err(MockError::Auth),
            version_ok: false,
            privileged_plain: false,
            privileged_elevated: false,
            hostname: "",
        }
    }

    /// Nothing answers at this address.
    pub fn unreachable() -> Self {
        Self {
            detect: Err(MockError::Timeout),
            ssh_open: Err(MockError::Timeout),
            telnet_open: Err(MockError::Timeout),
            version_ok: false,
            privileged_plain: false,
            privileged_elevated: false,
            hostname: "",
        }
    }

    /// SSH autodetection fails; the fixed SSH dialect works.
    pub fn detect_failure(hostname: &'static str) -> Self {
        Self {
            detect: Err(MockError::Detect),
            ..Self::healthy(hostname)
        }
    }

    /// SSH is blocked entirely; Telnet works.
    pub fn telnet_only(hostname: &'static str) -> Self {
        Self {
            detect: Err(MockError::Refused),
            ssh_open: Err(MockError::Refused),
            ..Self::healthy(hostname)
        }
    }

    /// Login works but the account starts unprivileged; the enable secret
    /// is accepted on escalation.
    pub fn needs_escalation(hostname: &'static str) -> Self {
        Self {
            privileged_plain: false,
            ..Self::healthy(hostname)
        }
    }
}

/// Counters and captures shared across the scripted fleet.
#[derive(Default)]
pub struct FleetStats {
    pub opens: usize,
    pub closes: usize,
    pub config_batches: Vec<Vec<String>>,
}

/// Dialer whose behavior is scripted per target address.
pub struct ScriptedDialer {
    plans: HashMap<String, DevicePlan>,
    pub stats: Arc<Mutex<FleetStats>>,
}

impl ScriptedDialer {
    pub fn new(plans: HashMap<String, DevicePlan>) -> Self {
        Self {
            plans,
            stats: Arc::new(Mutex::new(FleetStats::default())),
        }
    }

    pub fn single(address: &str, plan: DevicePlan) -> Self {
        let mut plans = HashMap::new();
        plans.insert(address.to_string(), plan);
        Self::new(plans)
    }

    fn plan_for(&self, host: &str) -> DevicePlan {
        self.plans
            .get(host)
            .cloned()
            .unwrap_or_else(DevicePlan::unreachable)
    }
}

#[async_trait]
impl ShellDialer for ScriptedDialer {
    async fn detect_dialect(&self, params: &TransportParams) -> Result<String, DialError> {
        match self.plan_for(&params.host).detect {
            Ok(dialect) => Ok(dialect.to_string()),
            Err(kind) => Err(kind.to_err()),
        }
    }

    async fn open(&self, params: &TransportParams) -> Result<Box<dyn RemoteShell>, DialError> {
        let plan = self.plan_for(&params.host);
        let outcome = match params.protocol {
            Protocol::Ssh => plan.ssh_open,
            Protocol::Telnet => plan.telnet_open,
            Protocol::None => {
                return Err(DialError::InvalidParams("no protocol".to_string()));
            }
        };
        if let Err(kind) = outcome {
            return Err(kind.to_err());
        }
        self.stats.lock().unwrap().opens += 1;
        Ok(Box::new(ScriptedShell {
            plan,
            params: params.clone(),
            stats: self.stats.clone(),
        }))
    }
}

struct ScriptedShell {
    plan: DevicePlan,
    params: TransportParams,
    stats: Arc<Mutex<FleetStats>>,
}

#[async_trait]
impl RemoteShell for ScriptedShell {
    async fn send_command(&mut self, command: &str) -> Result<CommandResponse, DialError> {
        match command {
            "show version" => {
                if self.plan.version_ok {
                    let mut record = HashMap::new();
                    record.insert("hostname".to_string(), self.plan.hostname.to_string());
                    record.insert("version".to_string(), "15.0(2)SE11".to_string());
                    record.insert("serial".to_string(), "FOC1709Y0RW".to_string());
                    Ok(CommandResponse::Records(vec![record]))
                } else {
                    Ok(CommandResponse::Raw(
                        "% Failed to execute command".to_string(),
                    ))
                }
            }
            "show running-config" => {
                let allowed = if self.params.requires_privilege {
                    self.plan.privileged_elevated
                } else {
                    self.plan.privileged_plain
                };
                if allowed {
                    Ok(CommandResponse::Raw(format!(
                        "Building configuration...\nhostname {}\nend",
                        self.plan.hostname
                    )))
                } else {
                    Ok(CommandResponse::Raw(
                        "% Invalid input detected at '^' marker.".to_string(),
                    ))
                }
            }
            "show inventory" => {
                let mut record = HashMap::new();
                record.insert("pid".to_string(), "WS-C2960-24TT-L".to_string());
                record.insert("sn".to_string(), "FOC1709Y0RW".to_string());
                Ok(CommandResponse::Records(vec![record]))
            }
            _ => Ok(CommandResponse::Raw(String::new())),
        }
    }

    async fn send_config_batch(&mut self, lines: &[String]) -> Result<String, DialError> {
        self.stats
            .lock()
            .unwrap()
            .config_batches
            .push(lines.to_vec());
        Ok("config applied".to_string())
    }

    async fn close(&mut self) -> Result<(), DialError> {
        self.stats.lock().unwrap().closes += 1;
        Ok(())
    }
}

/// Writer that appends into a shared buffer, for capturing progress output.
pub struct CaptureWriter(pub Arc<Mutex<Vec<u8>>>);

impl Write for CaptureWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

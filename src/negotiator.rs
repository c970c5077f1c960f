//! Connection-establishment state machine.
//!
//! Given one device target, the negotiator determines the working transport
//! protocol, OS dialect, and privilege level, producing a [`DeviceSession`]
//! record plus an open shell on success. The fallback order is fixed and
//! every retry is bounded:
//!
//! 1. SSH with dialect autodetection,
//! 2. SSH with the fixed fallback dialect (retried once, identically),
//! 3. Telnet with the fixed Telnet dialect (authentication retried once,
//!    identically).
//!
//! Transport-level failures during SSH skip straight to the Telnet leg;
//! detection failures go through the fixed-dialect attempts first. Every
//! terminal failure is folded into the session record as data — the
//! negotiator itself never raises.

use log::debug;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::dialect::{
    AUTODETECT, DialectProfile, InventorySource, SSH_FALLBACK_DIALECT, TELNET_FALLBACK_DIALECT,
};
use crate::error::{DialError, FailureKind, FleetError};
use crate::shell::{CommandResponse, Protocol, RemoteShell, ShellDialer, TransportParams};

/// Attempts made with the fixed SSH fallback dialect after a detection
/// failure. The second attempt is deliberately identical to the first;
/// this is a retry-once policy, not a different fallback.
pub const DIALECT_RETRY_ATTEMPTS: u32 = 2;

/// Authentication attempts made on the Telnet leg before giving up.
/// Mirrors the identical-retry pattern of the SSH dialect fallback.
pub const TELNET_AUTH_ATTEMPTS: u32 = 2;

const DEFAULT_SSH_PORT: u16 = 22;
const DEFAULT_TELNET_PORT: u16 = 23;
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Login credentials shared across a fleet dispatch.
#[derive(Clone)]
pub struct Credentials {
    /// Login username.
    pub username: String,
    /// Login password.
    pub password: String,
    /// Privileged-mode secret, when the estate uses one.
    pub enable_secret: Option<String>,
}

impl Credentials {
    /// Creates credentials without a privileged-mode secret.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            enable_secret: None,
        }
    }

    /// Sets the privileged-mode secret.
    pub fn with_enable_secret(mut self, secret: impl Into<String>) -> Self {
        self.enable_secret = Some(secret.into());
        self
    }

    pub(crate) fn validate(&self) -> Result<(), FleetError> {
        if self.username.trim().is_empty() {
            return Err(FleetError::MissingCredential("username"));
        }
        if self.password.is_empty() {
            return Err(FleetError::MissingCredential("password"));
        }
        Ok(())
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .field("enable_secret", &self.enable_secret.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Input identity for one device. Immutable once dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DeviceTarget {
    /// Management address of the device.
    pub address: String,
    /// Explicit dialect, bypassing autodetection when set.
    pub dialect_hint: Option<String>,
}

impl DeviceTarget {
    /// Creates a target that autodetects its dialect.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            dialect_hint: None,
        }
    }

    /// Sets an explicit dialect, bypassing autodetection.
    pub fn with_dialect(mut self, dialect: impl Into<String>) -> Self {
        self.dialect_hint = Some(dialect.into());
        self
    }
}

impl From<&str> for DeviceTarget {
    fn from(address: &str) -> Self {
        Self::new(address)
    }
}

impl From<String> for DeviceTarget {
    fn from(address: String) -> Self {
        Self::new(address)
    }
}

/// Hardware/software identity extracted from an authorized session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DeviceIdentity {
    /// Configured hostname.
    pub hostname: Option<String>,
    /// Operating system version string.
    pub software_version: Option<String>,
    /// Hardware model / product ID.
    pub model: Option<String>,
    /// Chassis serial number.
    pub serial_number: Option<String>,
    /// Boot loader version.
    pub boot_loader: Option<String>,
}

/// Outcome record for one device's negotiation.
///
/// Mutated in place while the state machine runs; treated as immutable once
/// handed to the dispatcher. The capability flags are monotonic:
/// `privileged` implies `authorized` implies `authenticated` implies
/// `connectivity`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DeviceSession {
    /// Management address of the device.
    pub address: String,
    /// A transport-level connection was established at some point.
    pub connectivity: bool,
    /// Credentials were accepted by the device.
    pub authenticated: bool,
    /// An interactive command was accepted and answered.
    pub authorized: bool,
    /// The session can read the full configuration.
    pub privileged: bool,
    /// Transport the session was established over.
    pub protocol: Protocol,
    /// Negotiated dialect name, or the autodetect/fallback marker last tried.
    pub dialect: String,
    /// Terminal failure classification, when negotiation failed.
    pub failure: FailureKind,
    /// Identity fields, populated once authorized.
    pub identity: Option<DeviceIdentity>,
}

impl DeviceSession {
    fn new(address: impl Into<String>, dialect: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            connectivity: false,
            authenticated: false,
            authorized: false,
            privileged: false,
            protocol: Protocol::None,
            dialect: dialect.into(),
            failure: FailureKind::None,
            identity: None,
        }
    }
}

/// Where the Telnet leg takes its privileged-mode secret from.
///
/// The observed fleet behavior seeds the Telnet enable secret with the login
/// password rather than the supplied enable secret; that stays the default,
/// but the choice is explicit here rather than buried in the fallback path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TelnetSecretSeed {
    /// Seed the enable secret with the login password (default).
    #[default]
    LoginPassword,
    /// Use the supplied enable secret; falls back to the login password
    /// when none was supplied.
    EnableSecret,
}

/// Tunables for one negotiation.
#[derive(Debug, Clone)]
pub struct NegotiatorOptions {
    /// Request privileged mode up front instead of probing for it.
    pub request_privileged: bool,
    /// SSH port.
    pub ssh_port: u16,
    /// Telnet port.
    pub telnet_port: u16,
    /// Transport connect timeout.
    pub connect_timeout: Duration,
    /// Per-command round-trip timeout.
    pub command_timeout: Duration,
    /// Secret seeding policy for the Telnet leg.
    pub telnet_secret_seed: TelnetSecretSeed,
}

impl Default for NegotiatorOptions {
    fn default() -> Self {
        Self {
            request_privileged: false,
            ssh_port: DEFAULT_SSH_PORT,
            telnet_port: DEFAULT_TELNET_PORT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            telnet_secret_seed: TelnetSecretSeed::default(),
        }
    }
}

/// A finished negotiation: the session record plus the open shell when the
/// device was reachable and usable.
pub struct NegotiatedSession {
    /// Negotiation outcome record.
    pub session: DeviceSession,
    shell: Option<Box<dyn RemoteShell>>,
}

impl NegotiatedSession {
    /// True when an open shell is attached.
    pub fn has_shell(&self) -> bool {
        self.shell.is_some()
    }

    /// Runs a command on the live session.
    pub async fn send_command(&mut self, command: &str) -> Result<CommandResponse, DialError> {
        match self.shell.as_mut() {
            Some(shell) => shell.send_command(command).await,
            None => Err(DialError::SessionClosed),
        }
    }

    /// Pushes a batch of configuration lines on the live session.
    pub async fn send_config_batch(&mut self, lines: &[String]) -> Result<String, DialError> {
        match self.shell.as_mut() {
            Some(shell) => shell.send_config_batch(lines).await,
            None => Err(DialError::SessionClosed),
        }
    }

    /// Closes and releases the shell. Safe to call without one.
    pub async fn close(&mut self) -> Result<(), DialError> {
        if let Some(mut shell) = self.shell.take() {
            shell.close().await?;
        }
        Ok(())
    }
}

/// The per-device negotiation state machine.
pub struct ConnectionNegotiator {
    dialer: Arc<dyn ShellDialer>,
    target: DeviceTarget,
    credentials: Credentials,
    options: NegotiatorOptions,
}

impl ConnectionNegotiator {
    /// Creates a negotiator for one target.
    pub fn new(
        dialer: Arc<dyn ShellDialer>,
        target: DeviceTarget,
        credentials: Credentials,
        options: NegotiatorOptions,
    ) -> Self {
        Self {
            dialer,
            target,
            credentials,
            options,
        }
    }

    /// Runs the full fallback chain to completion.
    ///
    /// Never returns an error: every terminal failure is recorded in the
    /// returned session. At most one transport session is open at any
    /// moment, and none is left open unless it is handed back to the caller.
    pub async fn negotiate(self) -> NegotiatedSession {
        let initial_dialect = self
            .target
            .dialect_hint
            .clone()
            .unwrap_or_else(|| AUTODETECT.to_string());
        let mut session = DeviceSession::new(self.target.address.as_str(), initial_dialect);

        match self.ssh_leg(&mut session).await {
            Ok(shell) => {
                session.connectivity = true;
                session.authenticated = true;
                session.protocol = Protocol::Ssh;
                debug!("{} negotiated over SSH as {}", session.address, session.dialect);
                return NegotiatedSession {
                    session,
                    shell: Some(shell),
                };
            }
            Err(err) => {
                debug!(
                    "{} SSH negotiation failed ({err}), falling back to Telnet",
                    session.address
                );
            }
        }

        match self.telnet_leg(&mut session).await {
            Ok(shell) => {
                session.connectivity = true;
                session.authenticated = true;
                session.protocol = Protocol::Telnet;
                debug!(
                    "{} negotiated over Telnet as {}",
                    session.address, session.dialect
                );
                NegotiatedSession {
                    session,
                    shell: Some(shell),
                }
            }
            Err(err) => {
                session.failure = err.failure_kind();
                match session.failure {
                    // The transport connected; only credentials failed.
                    FailureKind::Authentication => session.connectivity = true,
                    // Login was accepted; only command execution failed.
                    FailureKind::Authorization => {
                        session.connectivity = true;
                        session.authenticated = true;
                    }
                    _ => {}
                }
                debug!("{} negotiation exhausted: {err}", session.address);
                NegotiatedSession {
                    session,
                    shell: None,
                }
            }
        }
    }

    /// SSH leg: autodetect, then the fixed-dialect retry-once fallback.
    async fn ssh_leg(
        &self,
        session: &mut DeviceSession,
    ) -> Result<Box<dyn RemoteShell>, DialError> {
        let mut params = self.base_params(Protocol::Ssh);

        if let Some(hint) = &self.target.dialect_hint {
            params.dialect = hint.clone();
            session.dialect = hint.clone();
            return self.authenticate_and_probe(params, session).await;
        }

        params.dialect = AUTODETECT.to_string();
        match self.dialer.detect_dialect(&params).await {
            Ok(detected) => {
                params.dialect = detected.clone();
                session.dialect = detected;
                self.authenticate_and_probe(params, session).await
            }
            Err(err) if err.is_detection() => {
                debug!(
                    "{} dialect detection failed ({err}), trying fixed dialect",
                    session.address
                );
                session.dialect = SSH_FALLBACK_DIALECT.to_string();
                let mut attempt = 0;
                loop {
                    attempt += 1;
                    let mut fixed = self.base_params(Protocol::Ssh);
                    fixed.dialect = SSH_FALLBACK_DIALECT.to_string();
                    match self.authenticate_and_probe(fixed, session).await {
                        Ok(shell) => return Ok(shell),
                        Err(err)
                            if err.is_dialect_retryable() && attempt < DIALECT_RETRY_ATTEMPTS =>
                        {
                            debug!(
                                "{} fixed-dialect attempt {attempt} failed ({err}), retrying identically",
                                session.address
                            );
                        }
                        Err(err) => return Err(err),
                    }
                }
            }
            // Transport-level failure: skip the fixed-dialect attempts and
            // escalate straight to the protocol fallback.
            Err(err) => Err(err),
        }
    }

    /// Telnet leg: fixed dialect, authentication retried once identically.
    async fn telnet_leg(
        &self,
        session: &mut DeviceSession,
    ) -> Result<Box<dyn RemoteShell>, DialError> {
        session.dialect = TELNET_FALLBACK_DIALECT.to_string();

        let secret = match self.options.telnet_secret_seed {
            TelnetSecretSeed::LoginPassword => self.credentials.password.clone(),
            TelnetSecretSeed::EnableSecret => self
                .credentials
                .enable_secret
                .clone()
                .unwrap_or_else(|| self.credentials.password.clone()),
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut params = self.base_params(Protocol::Telnet);
            params.dialect = TELNET_FALLBACK_DIALECT.to_string();
            params.secret = Some(secret.clone());
            match self.authenticate_and_probe(params, session).await {
                Ok(shell) => return Ok(shell),
                Err(err) if err.is_authentication() && attempt < TELNET_AUTH_ATTEMPTS => {
                    debug!(
                        "{} Telnet authentication attempt {attempt} failed ({err}), retrying identically",
                        session.address
                    );
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Shared authenticate-and-probe procedure for both protocol legs.
    ///
    /// Opens a session, verifies command execution with the version query,
    /// extracts identity, and probes privilege with the configuration dump.
    /// An unprivileged session is closed and re-opened once with the
    /// privileged secret set.
    async fn authenticate_and_probe(
        &self,
        mut params: TransportParams,
        session: &mut DeviceSession,
    ) -> Result<Box<dyn RemoteShell>, DialError> {
        // Probe-scoped fields start clean on every attempt so an earlier
        // partial probe cannot leak flags into a later leg's outcome.
        session.authorized = false;
        session.privileged = false;
        session.identity = None;

        params.requires_privilege = self.options.request_privileged;
        if params.requires_privilege && params.secret.is_none() {
            params.secret = Some(self.credentials.enable_secret.clone().unwrap_or_default());
        }
        let profile = params.profile()?;

        loop {
            let mut shell = self.dialer.open(&params).await?;

            if params.requires_privilege {
                // Elevation happened inside open; verify with the dump.
                let dump = match shell.send_command(profile.config_dump_command).await {
                    Ok(response) => response,
                    Err(err) => {
                        let _ = shell.close().await;
                        return Err(err);
                    }
                };
                if !dump.contains(profile.invalid_input_marker) {
                    session.authorized = true;
                    session.privileged = true;
                }
                return Ok(shell);
            }

            let version = match shell.send_command(profile.version_command).await {
                Ok(response) => response,
                Err(err) => {
                    let _ = shell.close().await;
                    return Err(err);
                }
            };
            if version_indicates_failure(&version, profile) {
                let _ = shell.close().await;
                return Err(DialError::Authorization(format!(
                    "{}: version query rejected",
                    params.device_addr()
                )));
            }
            session.authorized = true;
            session.identity = Some(extract_identity(profile, &version, shell.as_mut()).await);

            let dump = match shell.send_command(profile.config_dump_command).await {
                Ok(response) => response,
                Err(err) => {
                    let _ = shell.close().await;
                    return Err(err);
                }
            };
            if dump.contains(profile.invalid_input_marker) {
                // Not privileged: close, re-open with the secret set, and
                // run the privileged branch once.
                debug!(
                    "{} lacks privilege, re-opening with enable secret",
                    params.device_addr()
                );
                let _ = shell.close().await;
                params.requires_privilege = true;
                if params.secret.is_none() {
                    params.secret =
                        Some(self.credentials.enable_secret.clone().unwrap_or_default());
                }
                continue;
            }

            session.privileged = true;
            return Ok(shell);
        }
    }

    fn base_params(&self, protocol: Protocol) -> TransportParams {
        TransportParams {
            protocol,
            dialect: String::new(),
            host: self.target.address.clone(),
            port: match protocol {
                Protocol::Telnet => self.options.telnet_port,
                _ => self.options.ssh_port,
            },
            username: self.credentials.username.clone(),
            password: self.credentials.password.clone(),
            secret: None,
            requires_privilege: false,
            connect_timeout: self.options.connect_timeout,
            command_timeout: self.options.command_timeout,
        }
    }
}

/// True when a version response signals the device refused the query.
fn version_indicates_failure(response: &CommandResponse, profile: &DialectProfile) -> bool {
    match response {
        // Structured extraction only succeeds on real version output.
        CommandResponse::Records(_) => false,
        CommandResponse::Raw(text) => {
            text.contains(profile.command_failure_marker)
                || text.contains(profile.invalid_input_marker)
        }
    }
}

/// Pulls identity fields from the version response, supplemented by the
/// dialect's inventory command when it has one. Inventory failures leave the
/// identity partial rather than failing the probe.
async fn extract_identity(
    profile: &DialectProfile,
    version: &CommandResponse,
    shell: &mut dyn RemoteShell,
) -> DeviceIdentity {
    let field = |name: &str| version.field(name).map(str::to_string);
    let mut identity = DeviceIdentity {
        hostname: field("hostname"),
        software_version: field("version"),
        model: field("model"),
        serial_number: field("serial"),
        boot_loader: field("boot_loader"),
    };

    if let InventorySource::Command(command) = profile.inventory {
        match shell.send_command(command).await {
            Ok(inventory) => {
                if let Some(pid) = inventory.field("pid") {
                    identity.model = Some(pid.to_string());
                }
                if let Some(sn) = inventory.field("sn") {
                    identity.serial_number = Some(sn.to_string());
                }
            }
            Err(err) => debug!("inventory query failed: {err}"),
        }
    }

    identity
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::{CISCO_IOS, CISCO_NXOS};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum ErrKind {
        Detect,
        Auth,
        Refused,
        Timeout,
        Protocol,
    }

    impl ErrKind {
        fn to_err(self) -> DialError {
            match self {
                ErrKind::Detect => DialError::DialectDetection("ambiguous banner".to_string()),
                ErrKind::Auth => DialError::Authentication("rejected".to_string()),
                ErrKind::Refused => DialError::ConnectionRefused("refused".to_string()),
                ErrKind::Timeout => DialError::ConnectionTimeout("timed out".to_string()),
                ErrKind::Protocol => DialError::Protocol("unexpected".to_string()),
            }
        }
    }

    #[derive(Clone)]
    enum OpenOutcome {
        Succeed,
        Fail(ErrKind),
        /// Fail the first `n` attempts, then succeed.
        FailTimes(ErrKind, u32),
    }

    #[derive(Clone)]
    struct Behavior {
        detect: Result<&'static str, ErrKind>,
        ssh_open: OpenOutcome,
        telnet_open: OpenOutcome,
        ssh_cmd_error: Option<ErrKind>,
        telnet_cmd_error: Option<ErrKind>,
        ssh_version_ok: bool,
        telnet_version_ok: bool,
        privileged_plain: bool,
        privileged_elevated: bool,
    }

    impl Default for Behavior {
        fn default() -> Self {
            Self {
                detect: Ok(CISCO_IOS),
                ssh_open: OpenOutcome::Succeed,
                telnet_open: OpenOutcome::Succeed,
                ssh_cmd_error: None,
                telnet_cmd_error: None,
                ssh_version_ok: true,
                telnet_version_ok: true,
                privileged_plain: true,
                privileged_elevated: true,
            }
        }
    }

    #[derive(Default)]
    struct Stats {
        detect_calls: u32,
        opens: Vec<TransportParams>,
        ssh_open_failures: u32,
        telnet_open_failures: u32,
        closes: u32,
    }

    struct MockDialer {
        behavior: Behavior,
        stats: Arc<Mutex<Stats>>,
    }

    impl MockDialer {
        fn new(behavior: Behavior) -> Self {
            Self {
                behavior,
                stats: Arc::new(Mutex::new(Stats::default())),
            }
        }
    }

    struct MockShell {
        params: TransportParams,
        behavior: Behavior,
        stats: Arc<Mutex<Stats>>,
    }

    #[async_trait]
    impl ShellDialer for MockDialer {
        async fn detect_dialect(&self, _params: &TransportParams) -> Result<String, DialError> {
            self.stats.lock().unwrap().detect_calls += 1;
            match self.behavior.detect {
                Ok(dialect) => Ok(dialect.to_string()),
                Err(kind) => Err(kind.to_err()),
            }
        }

        async fn open(
            &self,
            params: &TransportParams,
        ) -> Result<Box<dyn RemoteShell>, DialError> {
            let mut stats = self.stats.lock().unwrap();
            stats.opens.push(params.clone());
            let outcome = match params.protocol {
                Protocol::Ssh => self.behavior.ssh_open.clone(),
                Protocol::Telnet => self.behavior.telnet_open.clone(),
                Protocol::None => {
                    return Err(DialError::InvalidParams("no protocol".to_string()));
                }
            };
            match outcome {
                OpenOutcome::Succeed => {}
                OpenOutcome::Fail(kind) => return Err(kind.to_err()),
                OpenOutcome::FailTimes(kind, n) => {
                    let used = match params.protocol {
                        Protocol::Telnet => &mut stats.telnet_open_failures,
                        _ => &mut stats.ssh_open_failures,
                    };
                    if *used < n {
                        *used += 1;
                        return Err(kind.to_err());
                    }
                }
            }
            Ok(Box::new(MockShell {
                params: params.clone(),
                behavior: self.behavior.clone(),
                stats: self.stats.clone(),
            }))
        }
    }

    #[async_trait]
    impl RemoteShell for MockShell {
        async fn send_command(&mut self, command: &str) -> Result<CommandResponse, DialError> {
            let (cmd_error, version_ok) = match self.params.protocol {
                Protocol::Telnet => (
                    self.behavior.telnet_cmd_error,
                    self.behavior.telnet_version_ok,
                ),
                _ => (self.behavior.ssh_cmd_error, self.behavior.ssh_version_ok),
            };
            if let Some(kind) = cmd_error {
                return Err(kind.to_err());
            }
            match command {
                "show version" => {
                    if version_ok {
                        let mut record = HashMap::new();
                        record.insert("hostname".to_string(), "edge-sw01".to_string());
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
                        self.behavior.privileged_elevated
                    } else {
                        self.behavior.privileged_plain
                    };
                    if allowed {
                        Ok(CommandResponse::Raw(
                            "Building configuration...\nhostname edge-sw01\nend".to_string(),
                        ))
                    } else {
                        Ok(CommandResponse::Raw(
                            "% Invalid input detected at '^' marker.".to_string(),
                        ))
                    }
                }
                "show inventory" => {
                    let mut record = HashMap::new();
                    record.insert("pid".to_string(), "N9K-C9336PQ".to_string());
                    record.insert("sn".to_string(), "SAL1922ABCD".to_string());
                    Ok(CommandResponse::Records(vec![record]))
                }
                _ => Ok(CommandResponse::Raw(String::new())),
            }
        }

        async fn send_config_batch(&mut self, _lines: &[String]) -> Result<String, DialError> {
            Ok(String::new())
        }

        async fn close(&mut self) -> Result<(), DialError> {
            self.stats.lock().unwrap().closes += 1;
            Ok(())
        }
    }

    fn negotiate_with(
        behavior: Behavior,
        options: NegotiatorOptions,
        credentials: Credentials,
        target: DeviceTarget,
    ) -> (
        impl std::future::Future<Output = NegotiatedSession>,
        Arc<Mutex<Stats>>,
    ) {
        let dialer = Arc::new(MockDialer::new(behavior));
        let stats = dialer.stats.clone();
        let negotiator = ConnectionNegotiator::new(dialer, target, credentials, options);
        (negotiator.negotiate(), stats)
    }

    fn default_credentials() -> Credentials {
        Credentials::new("admin", "hunter2")
    }

    fn assert_monotonic(session: &DeviceSession) {
        if session.privileged {
            assert!(session.authorized, "privileged implies authorized");
        }
        if session.authorized {
            assert!(session.authenticated, "authorized implies authenticated");
        }
        if session.authenticated {
            assert!(session.connectivity, "authenticated implies connectivity");
        }
    }

    fn open_counts(stats: &Stats) -> (usize, usize) {
        let ssh = stats
            .opens
            .iter()
            .filter(|p| p.protocol == Protocol::Ssh)
            .count();
        let telnet = stats
            .opens
            .iter()
            .filter(|p| p.protocol == Protocol::Telnet)
            .count();
        (ssh, telnet)
    }

    #[tokio::test]
    async fn autodetect_success_negotiates_over_ssh() {
        let (run, stats) = negotiate_with(
            Behavior::default(),
            NegotiatorOptions::default(),
            default_credentials(),
            DeviceTarget::new("10.0.0.1"),
        );
        let negotiated = run.await;

        let session = &negotiated.session;
        assert!(negotiated.has_shell());
        assert_eq!(session.protocol, Protocol::Ssh);
        assert_eq!(session.dialect, CISCO_IOS);
        assert!(session.privileged);
        assert_eq!(session.failure, FailureKind::None);
        assert_eq!(
            session.identity.as_ref().and_then(|i| i.hostname.as_deref()),
            Some("edge-sw01")
        );
        assert_monotonic(session);

        let stats = stats.lock().unwrap();
        assert_eq!(stats.detect_calls, 1);
        assert_eq!(open_counts(&stats), (1, 0));
    }

    #[tokio::test]
    async fn dialect_hint_bypasses_autodetection() {
        let (run, stats) = negotiate_with(
            Behavior::default(),
            NegotiatorOptions::default(),
            default_credentials(),
            DeviceTarget::new("10.0.0.1").with_dialect(CISCO_NXOS),
        );
        let negotiated = run.await;

        assert_eq!(negotiated.session.dialect, CISCO_NXOS);
        assert_eq!(stats.lock().unwrap().detect_calls, 0);
    }

    #[tokio::test]
    async fn detection_failure_falls_back_to_fixed_ssh_dialect() {
        let behavior = Behavior {
            detect: Err(ErrKind::Detect),
            ..Behavior::default()
        };
        let (run, stats) = negotiate_with(
            behavior,
            NegotiatorOptions::default(),
            default_credentials(),
            DeviceTarget::new("10.0.0.1"),
        );
        let negotiated = run.await;

        let session = &negotiated.session;
        assert_eq!(session.protocol, Protocol::Ssh);
        assert_eq!(session.dialect, SSH_FALLBACK_DIALECT);
        assert!(session.authorized);
        assert_monotonic(session);
        assert_eq!(open_counts(&stats.lock().unwrap()), (1, 0));
    }

    #[tokio::test]
    async fn fixed_dialect_retries_identically_then_escalates_to_telnet() {
        let behavior = Behavior {
            detect: Err(ErrKind::Detect),
            ssh_cmd_error: Some(ErrKind::Protocol),
            ..Behavior::default()
        };
        let (run, stats) = negotiate_with(
            behavior,
            NegotiatorOptions::default(),
            default_credentials(),
            DeviceTarget::new("10.0.0.1"),
        );
        let negotiated = run.await;

        let session = &negotiated.session;
        assert_eq!(session.protocol, Protocol::Telnet);
        assert_eq!(session.dialect, TELNET_FALLBACK_DIALECT);

        let stats = stats.lock().unwrap();
        let (ssh_opens, telnet_opens) = open_counts(&stats);
        assert_eq!(ssh_opens, DIALECT_RETRY_ATTEMPTS as usize);
        assert_eq!(telnet_opens, 1);
        // Both fixed-dialect attempts used identical parameters.
        let fixed: Vec<_> = stats
            .opens
            .iter()
            .filter(|p| p.protocol == Protocol::Ssh)
            .collect();
        assert!(fixed.iter().all(|p| p.dialect == SSH_FALLBACK_DIALECT));
    }

    #[tokio::test]
    async fn transport_failure_skips_fixed_dialect_and_goes_to_telnet() {
        let behavior = Behavior {
            detect: Err(ErrKind::Timeout),
            ..Behavior::default()
        };
        let (run, stats) = negotiate_with(
            behavior,
            NegotiatorOptions::default(),
            default_credentials(),
            DeviceTarget::new("10.0.0.1"),
        );
        let negotiated = run.await;

        assert_eq!(negotiated.session.protocol, Protocol::Telnet);
        assert_eq!(open_counts(&stats.lock().unwrap()), (0, 1));
    }

    #[tokio::test]
    async fn telnet_authentication_is_retried_once_identically() {
        let behavior = Behavior {
            detect: Err(ErrKind::Refused),
            telnet_open: OpenOutcome::FailTimes(ErrKind::Auth, 1),
            ..Behavior::default()
        };
        let (run, stats) = negotiate_with(
            behavior,
            NegotiatorOptions::default(),
            default_credentials(),
            DeviceTarget::new("10.0.0.1"),
        );
        let negotiated = run.await;

        assert_eq!(negotiated.session.protocol, Protocol::Telnet);
        assert!(negotiated.session.authenticated);
        assert_eq!(open_counts(&stats.lock().unwrap()), (0, 2));
    }

    #[tokio::test]
    async fn final_authentication_failure_is_recorded_with_connectivity() {
        let behavior = Behavior {
            detect: Err(ErrKind::Refused),
            telnet_open: OpenOutcome::Fail(ErrKind::Auth),
            ..Behavior::default()
        };
        let (run, stats) = negotiate_with(
            behavior,
            NegotiatorOptions::default(),
            default_credentials(),
            DeviceTarget::new("10.0.0.2"),
        );
        let negotiated = run.await;

        let session = &negotiated.session;
        assert!(!negotiated.has_shell());
        assert_eq!(session.failure, FailureKind::Authentication);
        assert!(session.connectivity);
        assert!(!session.authenticated);
        assert_eq!(session.protocol, Protocol::None);
        assert_monotonic(session);
        // Retried once, then gave up.
        assert_eq!(open_counts(&stats.lock().unwrap()), (0, 2));
    }

    #[tokio::test]
    async fn version_rejection_on_both_legs_is_an_authorization_failure() {
        let behavior = Behavior {
            ssh_version_ok: false,
            telnet_version_ok: false,
            ..Behavior::default()
        };
        let (run, _stats) = negotiate_with(
            behavior,
            NegotiatorOptions::default(),
            default_credentials(),
            DeviceTarget::new("10.0.0.3"),
        );
        let negotiated = run.await;

        let session = &negotiated.session;
        assert_eq!(session.failure, FailureKind::Authorization);
        assert!(session.connectivity);
        assert!(session.authenticated);
        assert!(!session.authorized);
        assert_monotonic(session);
    }

    #[tokio::test]
    async fn unprivileged_session_reopens_once_with_enable_secret() {
        let behavior = Behavior {
            privileged_plain: false,
            privileged_elevated: true,
            ..Behavior::default()
        };
        let (run, stats) = negotiate_with(
            behavior,
            NegotiatorOptions::default(),
            default_credentials().with_enable_secret("enablepw"),
            DeviceTarget::new("10.0.0.1"),
        );
        let negotiated = run.await;

        let session = &negotiated.session;
        assert!(session.privileged);
        assert_monotonic(session);

        let stats = stats.lock().unwrap();
        assert_eq!(open_counts(&stats), (2, 0));
        let escalated = &stats.opens[1];
        assert!(escalated.requires_privilege);
        assert_eq!(escalated.secret.as_deref(), Some("enablepw"));
    }

    #[tokio::test]
    async fn telnet_secret_defaults_to_login_password() {
        let behavior = Behavior {
            detect: Err(ErrKind::Refused),
            ..Behavior::default()
        };
        let (run, stats) = negotiate_with(
            behavior,
            NegotiatorOptions::default(),
            default_credentials().with_enable_secret("enablepw"),
            DeviceTarget::new("10.0.0.1"),
        );
        let _ = run.await;

        let stats = stats.lock().unwrap();
        let telnet_open = stats
            .opens
            .iter()
            .find(|p| p.protocol == Protocol::Telnet)
            .expect("telnet open");
        assert_eq!(telnet_open.secret.as_deref(), Some("hunter2"));
    }

    #[tokio::test]
    async fn telnet_secret_seed_policy_can_use_enable_secret() {
        let behavior = Behavior {
            detect: Err(ErrKind::Refused),
            ..Behavior::default()
        };
        let options = NegotiatorOptions {
            telnet_secret_seed: TelnetSecretSeed::EnableSecret,
            ..NegotiatorOptions::default()
        };
        let (run, stats) = negotiate_with(
            behavior,
            options,
            default_credentials().with_enable_secret("enablepw"),
            DeviceTarget::new("10.0.0.1"),
        );
        let _ = run.await;

        let stats = stats.lock().unwrap();
        let telnet_open = stats
            .opens
            .iter()
            .find(|p| p.protocol == Protocol::Telnet)
            .expect("telnet open");
        assert_eq!(telnet_open.secret.as_deref(), Some("enablepw"));
    }

    #[tokio::test]
    async fn every_opened_session_is_closed_or_handed_back() {
        let behavior = Behavior {
            privileged_plain: false,
            privileged_elevated: true,
            ..Behavior::default()
        };
        let (run, stats) = negotiate_with(
            behavior,
            NegotiatorOptions::default(),
            default_credentials(),
            DeviceTarget::new("10.0.0.1"),
        );
        let mut negotiated = run.await;
        assert!(negotiated.has_shell());
        negotiated.close().await.expect("close");

        let stats = stats.lock().unwrap();
        // Two opens: the unprivileged probe (closed during escalation) and
        // the privileged session (closed by the caller just above).
        assert_eq!(stats.opens.len(), 2);
        assert_eq!(stats.closes, 2);
    }

    #[tokio::test]
    async fn requested_privilege_opens_elevated_from_the_start() {
        let options = NegotiatorOptions {
            request_privileged: true,
            ..NegotiatorOptions::default()
        };
        let (run, stats) = negotiate_with(
            Behavior::default(),
            options,
            default_credentials().with_enable_secret("enablepw"),
            DeviceTarget::new("10.0.0.1"),
        );
        let negotiated = run.await;

        let session = &negotiated.session;
        assert!(session.privileged);
        assert!(session.authorized);
        assert_monotonic(session);

        let stats = stats.lock().unwrap();
        assert_eq!(stats.opens.len(), 1);
        assert!(stats.opens[0].requires_privilege);
        assert_eq!(stats.opens[0].secret.as_deref(), Some("enablepw"));
    }

    #[tokio::test]
    async fn nxos_identity_uses_supplementary_inventory_command() {
        let (run, _stats) = negotiate_with(
            Behavior::default(),
            NegotiatorOptions::default(),
            default_credentials(),
            DeviceTarget::new("10.0.0.1").with_dialect(CISCO_NXOS),
        );
        let negotiated = run.await;

        let identity = negotiated
            .session
            .identity
            .as_ref()
            .expect("identity populated");
        assert_eq!(identity.model.as_deref(), Some("N9K-C9336PQ"));
        assert_eq!(identity.serial_number.as_deref(), Some("SAL1922ABCD"));
    }

    #[tokio::test]
    async fn closed_negotiated_session_rejects_commands() {
        let behavior = Behavior {
            detect: Err(ErrKind::Refused),
            telnet_open: OpenOutcome::Fail(ErrKind::Timeout),
            ..Behavior::default()
        };
        let (run, _stats) = negotiate_with(
            behavior,
            NegotiatorOptions::default(),
            default_credentials(),
            DeviceTarget::new("10.0.0.1"),
        );
        let mut negotiated = run.await;

        assert!(!negotiated.has_shell());
        assert!(matches!(
            negotiated.send_command("show version").await,
            Err(DialError::SessionClosed)
        ));
    }

    #[test]
    fn credentials_validation_requires_username_and_password() {
        assert!(Credentials::new("admin", "pw").validate().is_ok());
        assert!(matches!(
            Credentials::new("", "pw").validate(),
            Err(FleetError::MissingCredential("username"))
        ));
        assert!(matches!(
            Credentials::new("admin", "").validate(),
            Err(FleetError::MissingCredential("password"))
        ));
    }

    #[test]
    fn credentials_debug_never_prints_secrets() {
        let creds = Credentials::new("admin", "hunter2").with_enable_secret("enablepw");
        let rendered = format!("{creds:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("enablepw"));
    }
}

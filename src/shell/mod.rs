//! Remote shell capability: the seam the negotiation core depends on.
//!
//! The core only ever talks to [`ShellDialer`] (detect a dialect, open a
//! session) and [`RemoteShell`] (run a command, push a config batch, close).
//! [`NetworkDialer`] is the production implementation, dispatching to the
//! SSH or Telnet client by the protocol in the transport parameters.
//!
//! # Main Components
//!
//! - [`ShellDialer`] / [`RemoteShell`] - capability traits
//! - [`TransportParams`] - per-attempt connection parameters
//! - [`CommandResponse`] - structured records or raw text
//! - [`NetworkDialer`] - production SSH/Telnet dialer

use async_trait::async_trait;
use log::debug;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ConnectionSecurityOptions;
use crate::dialect::{self, DialectProfile};
use crate::error::DialError;
use crate::parser::SchemaRegistry;

pub use ssh::SshShell;
pub use telnet::TelnetShell;

mod ssh;
mod telnet;

/// Transport protocol used (or attempted) for a device session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// No transport was ever established.
    #[default]
    None,
    /// SSH.
    Ssh,
    /// Telnet.
    Telnet,
}

/// Parameters for one transport connection attempt.
///
/// Cloned and adjusted between fallback attempts; a single attempt never
/// mutates another attempt's parameters.
#[derive(Clone)]
pub struct TransportParams {
    /// Transport protocol to use.
    pub protocol: Protocol,
    /// Dialect name selecting command syntax and prompt shapes.
    pub dialect: String,
    /// Device address.
    pub host: String,
    /// Transport port.
    pub port: u16,
    /// Login username.
    pub username: String,
    /// Login password.
    pub password: String,
    /// Privileged-mode secret, when elevation is requested.
    pub secret: Option<String>,
    /// Elevate to privileged mode during open.
    pub requires_privilege: bool,
    /// Transport connect timeout.
    pub connect_timeout: Duration,
    /// Per-command round-trip timeout.
    pub command_timeout: Duration,
}

impl TransportParams {
    /// Resolves the dialect profile for this attempt.
    pub fn profile(&self) -> Result<&'static DialectProfile, DialError> {
        dialect::profile_for(&self.dialect)
            .ok_or_else(|| DialError::InvalidParams(format!("unknown dialect '{}'", self.dialect)))
    }

    /// `user@host:port` label used in diagnostics.
    pub fn device_addr(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }
}

impl fmt::Debug for TransportParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportParams")
            .field("protocol", &self.protocol)
            .field("dialect", &self.dialect)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"***")
            .field("secret", &self.secret.as_ref().map(|_| "***"))
            .field("requires_privilege", &self.requires_privilege)
            .finish()
    }
}

/// Response from one command round-trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CommandResponse {
    /// Structured records extracted by an output schema.
    Records(Vec<HashMap<String, String>>),
    /// Raw terminal output (no schema, or the schema did not match).
    Raw(String),
}

impl CommandResponse {
    /// True when any record value or the raw text contains `marker`.
    pub fn contains(&self, marker: &str) -> bool {
        match self {
            CommandResponse::Raw(text) => text.contains(marker),
            CommandResponse::Records(records) => records
                .iter()
                .any(|record| record.values().any(|value| value.contains(marker))),
        }
    }

    /// Field value from the first record, when structured.
    pub fn field(&self, name: &str) -> Option<&str> {
        match self {
            CommandResponse::Records(records) => records
                .first()
                .and_then(|record| record.get(name))
                .map(String::as_str),
            CommandResponse::Raw(_) => None,
        }
    }

    /// Raw text, when unstructured.
    pub fn raw_text(&self) -> Option<&str> {
        match self {
            CommandResponse::Raw(text) => Some(text),
            CommandResponse::Records(_) => None,
        }
    }

    /// True when structured extraction succeeded.
    pub fn is_structured(&self) -> bool {
        matches!(self, CommandResponse::Records(_))
    }
}

/// Compiled prompt shapes for one dialect.
///
/// Lines are matched after stripping leading NULs and carriage returns,
/// which terminals are fond of prepending.
pub(crate) struct PromptMatcher {
    user: Regex,
    privileged: Regex,
    password: Regex,
    login: Regex,
    pagination: Regex,
}

impl PromptMatcher {
    pub(crate) fn for_profile(profile: &DialectProfile) -> Result<Self, DialError> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|err| {
                DialError::InvalidParams(format!(
                    "invalid prompt pattern for dialect '{}': {err}",
                    profile.name
                ))
            })
        };
        Ok(Self {
            user: compile(profile.user_prompt)?,
            privileged: compile(profile.privileged_prompt)?,
            password: compile(profile.password_prompt)?,
            login: compile(profile.login_prompt)?,
            pagination: compile(profile.pagination_prompt)?,
        })
    }

    fn clean<'a>(line: &'a str) -> &'a str {
        line.trim_start_matches(['\0', '\r'])
    }

    /// True for any command prompt, privileged or not.
    pub(crate) fn is_prompt(&self, line: &str) -> bool {
        let line = Self::clean(line);
        self.privileged.is_match(line) || self.user.is_match(line)
    }

    pub(crate) fn is_privileged_prompt(&self, line: &str) -> bool {
        self.privileged.is_match(Self::clean(line))
    }

    pub(crate) fn is_password_prompt(&self, line: &str) -> bool {
        self.password.is_match(Self::clean(line))
    }

    pub(crate) fn is_login_prompt(&self, line: &str) -> bool {
        self.login.is_match(Self::clean(line))
    }

    pub(crate) fn is_pagination_prompt(&self, line: &str) -> bool {
        self.pagination.is_match(Self::clean(line))
    }
}

/// An open interactive session with one device.
///
/// A shell is owned by exactly one worker for its whole lifetime and is
/// never shared or reused across workers.
#[async_trait]
pub trait RemoteShell: Send {
    /// Runs a command and returns its response once the prompt returns.
    ///
    /// Output is parsed into records when a schema exists for the session's
    /// dialect and the command; otherwise raw text is returned.
    async fn send_command(&mut self, command: &str) -> Result<CommandResponse, DialError>;

    /// Pushes a batch of configuration lines inside config mode and returns
    /// the accumulated raw output.
    async fn send_config_batch(&mut self, lines: &[String]) -> Result<String, DialError>;

    /// Closes the session. Safe to call more than once.
    async fn close(&mut self) -> Result<(), DialError>;
}

/// Opens sessions and detects dialects for the negotiation core.
#[async_trait]
pub trait ShellDialer: Send + Sync {
    /// Attempts to identify the device dialect over SSH.
    async fn detect_dialect(&self, params: &TransportParams) -> Result<String, DialError>;

    /// Opens an interactive session, elevating privilege when the
    /// parameters request it.
    async fn open(&self, params: &TransportParams) -> Result<Box<dyn RemoteShell>, DialError>;
}

/// Production dialer backed by the SSH and Telnet shell clients.
pub struct NetworkDialer {
    registry: Arc<SchemaRegistry>,
    security: ConnectionSecurityOptions,
}

impl NetworkDialer {
    /// Creates a dialer with the built-in schema registry and default
    /// security options.
    pub fn new() -> Self {
        Self {
            registry: Arc::new(SchemaRegistry::builtin()),
            security: ConnectionSecurityOptions::default(),
        }
    }

    /// Creates a dialer with explicit schema registry and security options.
    pub fn with_options(
        registry: Arc<SchemaRegistry>,
        security: ConnectionSecurityOptions,
    ) -> Self {
        Self { registry, security }
    }
}

impl Default for NetworkDialer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ShellDialer for NetworkDialer {
    async fn detect_dialect(&self, params: &TransportParams) -> Result<String, DialError> {
        // Probe with the fallback dialect's prompt shapes; the family shares
        // them closely enough to reach a prompt and read the banner.
        let mut probe = params.clone();
        probe.dialect = dialect::SSH_FALLBACK_DIALECT.to_string();
        probe.requires_privilege = false;
        let profile = probe.profile()?;

        let mut shell = SshShell::open(&probe, self.registry.clone(), &self.security).await?;
        let banner = shell.send_command_raw(profile.version_command).await;
        let _ = shell.close().await;

        match banner {
            Ok(text) => match dialect::detect_from_banner(&text) {
                Some(name) => {
                    debug!("{} detected dialect {}", params.device_addr(), name);
                    Ok(name.to_string())
                }
                None => Err(DialError::DialectDetection(format!(
                    "{}: ambiguous or unsupported banner",
                    params.device_addr()
                ))),
            },
            // End of input while probing is a detection failure, not a
            // transport failure: the device spoke, we just could not read it.
            Err(DialError::ChannelDisconnect) => Err(DialError::DialectDetection(format!(
                "{}: end of input during probing",
                params.device_addr()
            ))),
            Err(other) => Err(other),
        }
    }

    async fn open(&self, params: &TransportParams) -> Result<Box<dyn RemoteShell>, DialError> {
        match params.protocol {
            Protocol::Ssh => {
                let shell = SshShell::open(params, self.registry.clone(), &self.security).await?;
                Ok(Box::new(shell))
            }
            Protocol::Telnet => {
                let shell = TelnetShell::open(params, self.registry.clone()).await?;
                Ok(Box::new(shell))
            }
            Protocol::None => Err(DialError::InvalidParams(
                "no transport protocol selected".to_string(),
            )),
        }
    }
}

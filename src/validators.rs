//! Address syntax validation and reachability probing.
//!
//! These are deliberately simple collaborators: syntax checks are
//! full-match regexes, and the reachability probe is best-effort — a probe
//! failure means "not reachable", never an error.

use once_cell::sync::Lazy;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

static IPV4_RE: Lazy<Regex> = Lazy::new(|| {
    match Regex::new(
        r"^(?:(?:[0-9]|[1-9][0-9]|1[0-9]{2}|2[0-4][0-9]|25[0-5])\.){3}(?:[0-9]|[1-9][0-9]|1[0-9]{2}|2[0-4][0-9]|25[0-5])$",
    ) {
        Ok(re) => re,
        Err(err) => panic!("invalid IPV4_RE regex: {err}"),
    }
});

static IPV6_RE: Lazy<Regex> = Lazy::new(|| {
    match Regex::new(
        r"(?i)^(?:(?:[0-9a-f]{1,4}:){7}[0-9a-f]{1,4}|(?:[0-9a-f]{1,4}:){1,7}:|(?:[0-9a-f]{1,4}:){1,6}:[0-9a-f]{1,4}|(?:[0-9a-f]{1,4}:){1,5}(?::[0-9a-f]{1,4}){1,2}|(?:[0-9a-f]{1,4}:){1,4}(?::[0-9a-f]{1,4}){1,3}|(?:[0-9a-f]{1,4}:){1,3}(?::[0-9a-f]{1,4}){1,4}|(?:[0-9a-f]{1,4}:){1,2}(?::[0-9a-f]{1,4}){1,5}|[0-9a-f]{1,4}:(?::[0-9a-f]{1,4}){1,6}|:(?::[0-9a-f]{1,4}){1,7}|::|fe80:(?::[0-9a-f]{0,4}){0,4}%[0-9a-z]+)$",
    ) {
        Ok(re) => re,
        Err(err) => panic!("invalid IPV6_RE regex: {err}"),
    }
});

// Colon- and dash-separated pairs, plus the dotted four-digit group form
// used on switch CLIs.
static MAC_RE: Lazy<Regex> = Lazy::new(|| {
    match Regex::new(
        r"(?i)^(?:(?:[0-9a-f]{2}:){5}[0-9a-f]{2}|(?:[0-9a-f]{2}-){5}[0-9a-f]{2}|(?:[0-9a-f]{4}\.){2}[0-9a-f]{4})$",
    ) {
        Ok(re) => re,
        Err(err) => panic!("invalid MAC_RE regex: {err}"),
    }
});

/// Returns true if `address` is a well-formed dotted-quad IPv4 address.
pub fn ipv4(address: &str) -> bool {
    IPV4_RE.is_match(address)
}

/// Returns true if `address` is a well-formed IPv6 address.
pub fn ipv6(address: &str) -> bool {
    IPV6_RE.is_match(address)
}

/// Returns true if `address` is a well-formed MAC address in any of the
/// colon, dash, or dotted notations.
pub fn mac_address(address: &str) -> bool {
    MAC_RE.is_match(address)
}

/// Best-effort reachability probe against a management port.
///
/// A completed TCP handshake or an immediate refusal both prove the host is
/// alive; anything else (timeout, unreachable, resolution failure) counts as
/// not reachable.
pub async fn is_reachable(address: &str, port: u16, probe_timeout: Duration) -> bool {
    match timeout(probe_timeout, TcpStream::connect((address, port))).await {
        Ok(Ok(_)) => true,
        Ok(Err(err)) => err.kind() == io::ErrorKind::ConnectionRefused,
        Err(_elapsed) => false,
    }
}

/// One rejected line from a management address file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct InvalidAddressLine {
    /// 1-based line number in the input file.
    pub line: usize,
    /// The rejected text, trimmed.
    pub address: String,
}

/// Validated management IP address list loaded from a text file,
/// one address per line.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct MgmtAddresses {
    /// Addresses that passed IPv4 validation, in file order.
    pub addresses: Vec<String>,
    /// Rejected lines with their positions, for operator feedback.
    pub invalid: Vec<InvalidAddressLine>,
}

impl MgmtAddresses {
    /// Parses file content, keeping valid addresses and recording every
    /// rejected line with its line number. Blank lines are skipped.
    pub fn parse(content: &str) -> Self {
        let mut parsed = Self::default();
        for (idx, raw) in content.lines().enumerate() {
            let address = raw.trim();
            if address.is_empty() {
                continue;
            }
            if ipv4(address) {
                parsed.addresses.push(address.to_string());
            } else {
                parsed.invalid.push(InvalidAddressLine {
                    line: idx + 1,
                    address: address.to_string(),
                });
            }
        }
        parsed
    }

    /// Loads and parses a management address file.
    pub async fn from_file(path: impl AsRef<Path>) -> io::Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        Ok(Self::parse(&content))
    }

    /// True when no line was rejected.
    pub fn is_valid(&self) -> bool {
        self.invalid.is_empty()
    }
}

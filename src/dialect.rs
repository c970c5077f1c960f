//! Device dialect profiles.
//!
//! A dialect names the device OS family and fixes the command syntax, prompt
//! shapes, and output markers the negotiator and shell layers rely on. The
//! built-in set covers the Cisco IOS / NX-OS families plus the Telnet
//! rendition of IOS used by the protocol fallback.

/// Marker requesting banner-based dialect detection instead of a fixed name.
pub const AUTODETECT: &str = "autodetect";

/// Cisco IOS / IOS-XE over SSH.
pub const CISCO_IOS: &str = "cisco_ios";

/// Cisco NX-OS over SSH.
pub const CISCO_NXOS: &str = "cisco_nxos";

/// Cisco IOS syntax over Telnet.
pub const CISCO_IOS_TELNET: &str = "cisco_ios_telnet";

/// Fixed dialect used when SSH autodetection fails.
pub const SSH_FALLBACK_DIALECT: &str = CISCO_IOS;

/// Fixed dialect used by the Telnet protocol fallback.
pub const TELNET_FALLBACK_DIALECT: &str = CISCO_IOS_TELNET;

/// Names of all built-in dialects.
pub const BUILTIN_DIALECTS: &[&str] = &[CISCO_IOS, CISCO_NXOS, CISCO_IOS_TELNET];

/// Where a dialect's hardware inventory fields come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InventorySource {
    /// Model/serial/boot-loader are present in the version response.
    VersionOutput,
    /// A supplementary command returns chassis records (`pid`/`sn` fields).
    Command(&'static str),
}

/// Static command syntax and output markers for one dialect.
#[derive(Debug, Clone, Copy)]
pub struct DialectProfile {
    /// Dialect identifier, as carried in session records.
    pub name: &'static str,
    /// Command that reports software version and platform identity.
    pub version_command: &'static str,
    /// Full configuration dump command, used as the privilege probe.
    pub config_dump_command: &'static str,
    /// Where hardware inventory fields come from.
    pub inventory: InventorySource,
    /// Command that elevates to privileged mode.
    pub enable_command: &'static str,
    /// Command that disables output pagination for the session.
    pub disable_paging_command: &'static str,
    /// Command entering configuration mode for config batches.
    pub config_enter_command: &'static str,
    /// Command leaving configuration mode.
    pub config_exit_command: &'static str,
    /// Marker the device prints when a command is rejected at the parser.
    pub invalid_input_marker: &'static str,
    /// Marker indicating the version query failed outright.
    pub command_failure_marker: &'static str,
    /// Regex for the unprivileged prompt.
    pub user_prompt: &'static str,
    /// Regex for the privileged prompt.
    pub privileged_prompt: &'static str,
    /// Regex for an interactive password prompt.
    pub password_prompt: &'static str,
    /// Regex for the Telnet login prompt.
    pub login_prompt: &'static str,
    /// Regex for the pagination prompt.
    pub pagination_prompt: &'static str,
    /// Substrings that mark a rejected login attempt.
    pub auth_failure_markers: &'static [&'static str],
    /// Version-banner substrings used by autodetection.
    pub detection_hints: &'static [&'static str],
}

impl DialectProfile {
    /// True when `text` contains any login-rejection marker.
    pub fn is_auth_failure(&self, text: &str) -> bool {
        self.auth_failure_markers
            .iter()
            .any(|marker| text.contains(marker))
    }
}

const CISCO_IOS_PROFILE: DialectProfile = DialectProfile {
    name: CISCO_IOS,
    version_command: "show version",
    config_dump_command: "show running-config",
    inventory: InventorySource::VersionOutput,
    enable_command: "enable",
    disable_paging_command: "terminal length 0",
    config_enter_command: "configure terminal",
    config_exit_command: "end",
    invalid_input_marker: "Invalid input detected",
    command_failure_marker: "Failed",
    user_prompt: r"[\w.\-]+>\s*$",
    privileged_prompt: r"[\w.\-]+#\s*$",
    password_prompt: r"(?i)password:\s*$",
    login_prompt: r"(?i)(?:username|login):\s*$",
    pagination_prompt: r"--More--\s*$",
    auth_failure_markers: &[
        "% Authentication failed",
        "% Login invalid",
        "% Bad passwords",
        "% Access denied",
    ],
    detection_hints: &[
        "Cisco IOS Software",
        "Cisco Internetwork Operating System",
        "IOS-XE Software",
    ],
};

const CISCO_NXOS_PROFILE: DialectProfile = DialectProfile {
    name: CISCO_NXOS,
    version_command: "show version",
    config_dump_command: "show running-config",
    inventory: InventorySource::Command("show inventory"),
    enable_command: "enable",
    disable_paging_command: "terminal length 0",
    config_enter_command: "configure terminal",
    config_exit_command: "end",
    invalid_input_marker: "Invalid input detected",
    command_failure_marker: "Failed",
    user_prompt: r"[\w.\-]+>\s*$",
    privileged_prompt: r"[\w.\-]+#\s*$",
    password_prompt: r"(?i)password:\s*$",
    login_prompt: r"(?i)(?:username|login):\s*$",
    pagination_prompt: r"--More--\s*$",
    auth_failure_markers: &["% Authentication failed", "% Access denied"],
    detection_hints: &["Cisco Nexus Operating System", "NX-OS"],
};

// Same syntax as IOS; only the transport and the login sequence differ.
// Excluded from autodetection, which runs over SSH.
const CISCO_IOS_TELNET_PROFILE: DialectProfile = DialectProfile {
    name: CISCO_IOS_TELNET,
    detection_hints: &[],
    ..CISCO_IOS_PROFILE
};

/// Looks up a built-in dialect profile by name.
pub fn profile_for(name: &str) -> Option<&'static DialectProfile> {
    match name {
        CISCO_IOS => Some(&CISCO_IOS_PROFILE),
        CISCO_NXOS => Some(&CISCO_NXOS_PROFILE),
        CISCO_IOS_TELNET => Some(&CISCO_IOS_TELNET_PROFILE),
        _ => None,
    }
}

/// Identifies a dialect from version-banner text.
///
/// Returns `None` when no hint matches or when hints from more than one
/// dialect match (ambiguous banner) — callers treat both as a detection
/// failure.
pub fn detect_from_banner(banner: &str) -> Option<&'static str> {
    let mut detected = None;
    for name in BUILTIN_DIALECTS {
        let Some(profile) = profile_for(name) else {
            continue;
        };
        if profile
            .detection_hints
            .iter()
            .any(|hint| banner.contains(hint))
        {
            match detected {
                None => detected = Some(profile.name),
                Some(existing) if existing != profile.name => return None,
                Some(_) => {}
            }
        }
    }
    detected
}

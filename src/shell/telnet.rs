//! Telnet-backed remote shell.
//!
//! A deliberately small client: every option the server proposes is refused
//! (plain NVT mode), authentication is driven by the dialect's login and
//! password prompt shapes, and command execution uses the same prompt-driven
//! accumulation loop as the SSH shell.

use async_trait::async_trait;
use log::{debug, trace};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time::timeout;

use crate::dialect::DialectProfile;
use crate::error::{DialError, classify_io};
use crate::parser::SchemaRegistry;

use super::{CommandResponse, PromptMatcher, RemoteShell, TransportParams};

const IAC: u8 = 255;
const DONT: u8 = 254;
const DO: u8 = 253;
const WONT: u8 = 252;
const WILL: u8 = 251;
const SB: u8 = 250;
const SE: u8 = 240;

/// An interactive Telnet session with one network device.
pub struct TelnetShell {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    matcher: PromptMatcher,
    profile: &'static DialectProfile,
    registry: Arc<SchemaRegistry>,
    command_timeout: Duration,
    prompt: String,
    closed: bool,
}

/// Strips Telnet command sequences from a chunk, producing the visible text
/// and the refusal replies owed to the server.
fn strip_telnet_commands(bytes: &[u8]) -> (String, Vec<u8>) {
    let mut text = Vec::with_capacity(bytes.len());
    let mut replies = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != IAC {
            text.push(bytes[i]);
            i += 1;
            continue;
        }
        match bytes.get(i + 1) {
            Some(&IAC) => {
                // Escaped literal 0xFF.
                text.push(IAC);
                i += 2;
            }
            Some(&DO) => {
                if let Some(&opt) = bytes.get(i + 2) {
                    replies.extend_from_slice(&[IAC, WONT, opt]);
                }
                i += 3;
            }
            Some(&WILL) => {
                if let Some(&opt) = bytes.get(i + 2) {
                    replies.extend_from_slice(&[IAC, DONT, opt]);
                }
                i += 3;
            }
            Some(&DONT) | Some(&WONT) => {
                i += 3;
            }
            Some(&SB) => {
                // Skip subnegotiation up to IAC SE.
                let mut j = i + 2;
                while j + 1 < bytes.len() && !(bytes[j] == IAC && bytes[j + 1] == SE) {
                    j += 1;
                }
                i = j + 2;
            }
            Some(_) => {
                i += 2;
            }
            None => {
                i += 1;
            }
        }
    }
    (String::from_utf8_lossy(&text).into_owned(), replies)
}

impl TelnetShell {
    /// Opens a session, authenticates at the login prompt, and brings the
    /// shell to a ready prompt.
    pub async fn open(
        params: &TransportParams,
        registry: Arc<SchemaRegistry>,
    ) -> Result<TelnetShell, DialError> {
        let profile = params.profile()?;
        let matcher = PromptMatcher::for_profile(profile)?;
        let device_addr = params.device_addr();

        let stream = match timeout(
            params.connect_timeout,
            TcpStream::connect((params.host.clone(), params.port)),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => return Err(classify_io(&err, &device_addr)),
            Err(_elapsed) => {
                return Err(DialError::ConnectionTimeout(format!(
                    "{device_addr}: transport connect"
                )));
            }
        };
        debug!("{} TCP connection successful", device_addr);

        let (reader, writer) = stream.into_split();
        let mut shell = TelnetShell {
            reader,
            writer,
            matcher,
            profile,
            registry,
            command_timeout: params.command_timeout,
            prompt: String::new(),
            closed: false,
        };

        shell.login(params).await?;
        debug!("{} Telnet login successful", device_addr);

        shell
            .send_command_raw(profile.disable_paging_command)
            .await?;

        if params.requires_privilege {
            let secret = params.secret.clone().unwrap_or_default();
            shell.elevate(&secret).await?;
        }

        Ok(shell)
    }

    /// Reads one chunk, answering Telnet option proposals with refusals.
    async fn read_chunk(&mut self) -> Result<String, DialError> {
        let mut buf = [0u8; 4096];
        let n = self
            .reader
            .read(&mut buf)
            .await
            .map_err(|err| classify_io(&err, "telnet read"))?;
        if n == 0 {
            return Err(DialError::ChannelDisconnect);
        }
        let (text, replies) = strip_telnet_commands(&buf[..n]);
        if !replies.is_empty() {
            self.writer
                .write_all(&replies)
                .await
                .map_err(|err| classify_io(&err, "telnet write"))?;
        }
        Ok(text)
    }

    async fn write_raw(&mut self, text: &str) -> Result<(), DialError> {
        self.writer
            .write_all(text.as_bytes())
            .await
            .map_err(|err| classify_io(&err, "telnet write"))
    }

    async fn login(&mut self, params: &TransportParams) -> Result<(), DialError> {
        let wait_timeout = self.command_timeout;
        let username = params.username.clone();
        let password = params.password.clone();

        let mut sent_password = false;
        let result = timeout(wait_timeout, async {
            let mut buffer = String::new();
            let mut sent_username = false;
            loop {
                let data = self.read_chunk().await?;
                trace!("{:?}", data);
                buffer.push_str(&data);

                while let Some(newline_pos) = buffer.find('\n') {
                    let line = buffer.drain(..=newline_pos).collect::<String>();
                    if self.profile.is_auth_failure(&line) {
                        return Err(DialError::Authentication(
                            "login rejected by device".to_string(),
                        ));
                    }
                }

                if buffer.is_empty() {
                    continue;
                }
                if self.matcher.is_login_prompt(&buffer) {
                    // A second login prompt means the credentials bounced.
                    if sent_username {
                        return Err(DialError::Authentication(
                            "login rejected by device".to_string(),
                        ));
                    }
                    sent_username = true;
                    buffer.clear();
                    self.write_raw(&format!("{username}\n")).await?;
                } else if self.matcher.is_password_prompt(&buffer) {
                    if sent_password {
                        return Err(DialError::Authentication(
                            "password rejected by device".to_string(),
                        ));
                    }
                    sent_password = true;
                    buffer.clear();
                    self.write_raw(&format!("{password}\n")).await?;
                } else if self.matcher.is_prompt(&buffer) {
                    self.prompt = buffer.clone();
                    return Ok(());
                }
            }
        })
        .await;

        match result {
            Ok(Ok(())) => Ok(()),
            // Devices drop the connection after rejected credentials; report
            // that as an authentication failure, not a transport loss.
            Ok(Err(DialError::ChannelDisconnect)) if sent_password => Err(
                DialError::Authentication("connection closed after password".to_string()),
            ),
            Ok(Err(err)) => Err(err),
            Err(_elapsed) => Err(DialError::ConnectionTimeout(
                "waiting for login prompt".to_string(),
            )),
        }
    }

    /// Elevates to privileged mode with the enable secret.
    async fn elevate(&mut self, secret: &str) -> Result<(), DialError> {
        if self.matcher.is_privileged_prompt(&self.prompt) {
            return Ok(());
        }

        self.write_raw(&format!("{}\n", self.profile.enable_command))
            .await?;

        let wait_timeout = self.command_timeout;
        let result = timeout(wait_timeout, async {
            let mut buffer = String::new();
            let mut secret_sent = false;
            loop {
                let data = self.read_chunk().await?;
                buffer.push_str(&data);

                while let Some(newline_pos) = buffer.find('\n') {
                    let line = buffer.drain(..=newline_pos).collect::<String>();
                    if self.profile.is_auth_failure(&line) {
                        return Err(DialError::Authentication(
                            "privilege elevation rejected".to_string(),
                        ));
                    }
                }

                if buffer.is_empty() {
                    continue;
                }
                if self.matcher.is_password_prompt(&buffer) {
                    if secret_sent {
                        return Err(DialError::Authentication(
                            "privilege elevation rejected".to_string(),
                        ));
                    }
                    secret_sent = true;
                    buffer.clear();
                    self.write_raw(&format!("{secret}\n")).await?;
                } else if self.matcher.is_privileged_prompt(&buffer) {
                    self.prompt = buffer.clone();
                    return Ok(());
                }
            }
        })
        .await;

        match result {
            Ok(inner) => inner,
            Err(_elapsed) => Err(DialError::ExecTimeout(
                "waiting for privileged prompt".to_string(),
            )),
        }
    }

    /// Runs a command and returns the cleaned raw output.
    pub(crate) async fn send_command_raw(&mut self, command: &str) -> Result<String, DialError> {
        self.write_raw(&format!("{command}\n")).await?;

        let mut clean_output = String::new();
        let mut line_buffer = String::new();

        let wait_timeout = self.command_timeout;
        let result = timeout(wait_timeout, async {
            loop {
                let data = self.read_chunk().await?;
                line_buffer.push_str(&data);

                while let Some(newline_pos) = line_buffer.find('\n') {
                    let line = line_buffer.drain(..=newline_pos).collect::<String>();
                    clean_output.push_str(line.trim_start_matches(['\0', '\r']));
                }

                if line_buffer.is_empty() {
                    continue;
                }
                if self.matcher.is_prompt(&line_buffer) {
                    self.prompt = line_buffer.clone();
                    return Ok(());
                }
                if self.matcher.is_pagination_prompt(&line_buffer) {
                    trace!("answering pagination prompt");
                    line_buffer.clear();
                    self.write_raw(" ").await?;
                }
            }
        })
        .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err),
            Err(_elapsed) => return Err(DialError::ExecTimeout(clean_output)),
        }

        let mut content = clean_output.as_str();
        if !command.is_empty() && content.starts_with(command) {
            content = content
                .strip_prefix(command)
                .unwrap_or(content)
                .trim_start_matches(['\n', '\r']);
        }
        Ok(content.trim_end_matches(['\n', '\r']).to_string())
    }
}

#[async_trait]
impl RemoteShell for TelnetShell {
    async fn send_command(&mut self, command: &str) -> Result<CommandResponse, DialError> {
        let raw = self.send_command_raw(command).await?;
        match self.registry.parse(self.profile.name, command, &raw) {
            Some(records) => Ok(CommandResponse::Records(records)),
            None => {
                trace!("no structured schema matched for '{command}', returning raw");
                Ok(CommandResponse::Raw(raw))
            }
        }
    }

    async fn send_config_batch(&mut self, lines: &[String]) -> Result<String, DialError> {
        let mut all = String::new();
        all.push_str(&self.send_command_raw(self.profile.config_enter_command).await?);
        for line in lines {
            all.push('\n');
            all.push_str(&self.send_command_raw(line).await?);
        }
        all.push('\n');
        all.push_str(&self.send_command_raw(self.profile.config_exit_command).await?);
        Ok(all)
    }

    async fn close(&mut self) -> Result<(), DialError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        debug!("closing Telnet shell");

        let _ = self.write_raw("exit\n").await;
        let _ = self.writer.shutdown().await;
        Ok(())
    }
}

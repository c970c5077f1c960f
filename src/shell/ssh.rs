//! SSH-backed remote shell.
//!
//! Connects with the configured algorithm profile, requests a PTY and shell,
//! and bridges the russh channel to mpsc queues through a background I/O
//! task. Command execution is prompt-driven: output is accumulated line by
//! line until the dialect's prompt shape returns.

use async_ssh2_tokio::client::{AuthMethod, Client};
use async_ssh2_tokio::Config;
use async_trait::async_trait;
use log::{debug, trace};
use russh::ChannelMsg;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::time::timeout;

use crate::config::ConnectionSecurityOptions;
use crate::dialect::DialectProfile;
use crate::error::{DialError, classify_ssh};
use crate::parser::SchemaRegistry;

use super::{CommandResponse, PromptMatcher, RemoteShell, TransportParams};

/// An interactive SSH session with one network device.
pub struct SshShell {
    client: Client,
    sender: Sender<String>,
    recv: Receiver<String>,
    matcher: PromptMatcher,
    profile: &'static DialectProfile,
    registry: Arc<SchemaRegistry>,
    command_timeout: Duration,
    prompt: String,
    closed: bool,
}

impl SshShell {
    /// Opens a session and brings it to a ready prompt.
    ///
    /// Disables output pagination, and elevates to privileged mode when the
    /// parameters request it. Any failure after the TCP connect leaves the
    /// underlying client to close on drop.
    pub async fn open(
        params: &TransportParams,
        registry: Arc<SchemaRegistry>,
        security: &ConnectionSecurityOptions,
    ) -> Result<SshShell, DialError> {
        let profile = params.profile()?;
        let matcher = PromptMatcher::for_profile(profile)?;
        let device_addr = params.device_addr();

        let config = Config {
            preferred: security.preferred(),
            inactivity_timeout: Some(Duration::from_secs(60)),
            ..Default::default()
        };

        let connect = Client::connect_with_config(
            (params.host.clone(), params.port),
            &params.username,
            AuthMethod::with_password(&params.password),
            security.server_check.clone(),
            config,
        );
        let client = match timeout(params.connect_timeout, connect).await {
            Ok(Ok(client)) => client,
            Ok(Err(err)) => return Err(classify_ssh(err, &device_addr)),
            Err(_elapsed) => {
                return Err(DialError::ConnectionTimeout(format!(
                    "{device_addr}: transport connect"
                )));
            }
        };
        debug!("{} TCP connection successful", device_addr);

        let mut channel = client.get_channel().await?;
        channel
            .request_pty(false, "xterm", 800, 600, 0, 0, &[])
            .await?;
        channel.request_shell(false).await?;
        debug!("{} Shell request successful", device_addr);

        let (sender_to_shell, mut receiver_from_user) = mpsc::channel::<String>(256);
        let (sender_to_user, receiver_from_shell) = mpsc::channel::<String>(256);

        let io_task_addr = device_addr.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(data) = receiver_from_user.recv() => {
                        if let Err(e) = channel.data(data.as_bytes()).await {
                            debug!("{} failed to send data to shell: {:?}", io_task_addr, e);
                            break;
                        }
                    },
                    Some(msg) = channel.wait() => {
                        match msg {
                            ChannelMsg::Data { ref data } => {
                                if let Ok(s) = std::str::from_utf8(data)
                                    && sender_to_user.send(s.to_string()).await.is_err() {
                                        debug!("{} shell output receiver dropped", io_task_addr);
                                        break;
                                    }
                            }
                            ChannelMsg::ExitStatus { exit_status } => {
                                debug!("{} shell exited with status {}", io_task_addr, exit_status);
                                let _ = channel.eof().await;
                                break;
                            }
                            ChannelMsg::Eof => {
                                debug!("{} shell sent EOF", io_task_addr);
                                break;
                            }
                            _ => {}
                        }
                    }
                }
            }
            debug!("{} SSH I/O task ended", io_task_addr);
        });

        let mut shell = SshShell {
            client,
            sender: sender_to_shell,
            recv: receiver_from_shell,
            matcher,
            profile,
            registry,
            command_timeout: params.command_timeout,
            prompt: String::new(),
            closed: false,
        };

        shell.wait_initial_prompt(&device_addr).await?;
        shell
            .send_command_raw(profile.disable_paging_command)
            .await?;

        if params.requires_privilege {
            let secret = params.secret.clone().unwrap_or_default();
            shell.elevate(&secret).await?;
        }

        Ok(shell)
    }

    /// True while the underlying SSH connection is open.
    pub fn is_connected(&self) -> bool {
        !self.client.is_closed()
    }

    async fn wait_initial_prompt(&mut self, device_addr: &str) -> Result<(), DialError> {
        let wait_timeout = self.command_timeout;
        let mut buffer = String::new();
        let wait = timeout(wait_timeout, async {
            loop {
                match self.recv.recv().await {
                    Some(data) => {
                        trace!("{:?}", data);
                        buffer.push_str(&data);

                        while let Some(newline_pos) = buffer.find('\n') {
                            let _line = buffer.drain(..=newline_pos).collect::<String>();
                        }

                        if !buffer.is_empty() && self.matcher.is_prompt(&buffer) {
                            self.prompt = buffer.clone();
                            return Ok(());
                        }
                    }
                    None => return Err(DialError::ChannelDisconnect),
                }
            }
        })
        .await;

        match wait {
            Ok(result) => result,
            Err(_elapsed) => Err(DialError::ConnectionTimeout(format!(
                "{device_addr}: waiting for initial prompt"
            ))),
        }
    }

    /// Elevates to privileged mode with the enable secret.
    async fn elevate(&mut self, secret: &str) -> Result<(), DialError> {
        if self.matcher.is_privileged_prompt(&self.prompt) {
            return Ok(());
        }

        while self.recv.try_recv().is_ok() {}
        self.sender
            .send(format!("{}\n", self.profile.enable_command))
            .await
            .map_err(|_| DialError::ChannelDisconnect)?;

        let wait_timeout = self.command_timeout;
        let mut buffer = String::new();
        let mut secret_sent = false;
        let result = timeout(wait_timeout, async {
            loop {
                match self.recv.recv().await {
                    Some(data) => {
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
                            // A second password prompt means the first secret
                            // was rejected silently.
                            if secret_sent {
                                return Err(DialError::Authentication(
                                    "privilege elevation rejected".to_string(),
                                ));
                            }
                            secret_sent = true;
                            buffer.clear();
                            self.sender
                                .send(format!("{secret}\n"))
                                .await
                                .map_err(|_| DialError::ChannelDisconnect)?;
                        } else if self.matcher.is_privileged_prompt(&buffer) {
                            self.prompt = buffer.clone();
                            return Ok(());
                        }
                    }
                    None => return Err(DialError::ChannelDisconnect),
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
    ///
    /// The echoed command and the trailing prompt are stripped; pagination
    /// prompts are answered automatically.
    pub(crate) async fn send_command_raw(&mut self, command: &str) -> Result<String, DialError> {
        // Clear any residual data from a previous round-trip.
        while self.recv.try_recv().is_ok() {}

        self.sender
            .send(format!("{command}\n"))
            .await
            .map_err(|_| DialError::ChannelDisconnect)?;

        let wait_timeout = self.command_timeout;
        let mut clean_output = String::new();
        let mut line_buffer = String::new();

        let result = timeout(wait_timeout, async {
            loop {
                match self.recv.recv().await {
                    Some(data) => {
                        line_buffer.push_str(&data);

                        while let Some(newline_pos) = line_buffer.find('\n') {
                            let line = line_buffer.drain(..=newline_pos).collect::<String>();
                            clean_output.push_str(line.trim_start_matches(['\0', '\r']));
                        }

                        // The trailing incomplete line is the interesting one:
                        // prompts and pagination markers arrive without newline.
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
                            self.sender
                                .send(" ".to_string())
                                .await
                                .map_err(|_| DialError::ChannelDisconnect)?;
                        }
                    }
                    None => return Err(DialError::ChannelDisconnect),
                }
            }
        })
        .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err),
            Err(_elapsed) => return Err(DialError::ExecTimeout(clean_output)),
        }

        Ok(strip_echo(&clean_output, command))
    }
}

/// Removes the echoed command from the head of the output.
fn strip_echo(output: &str, command: &str) -> String {
    let mut content = output;
    if !command.is_empty() && content.starts_with(command) {
        content = content
            .strip_prefix(command)
            .unwrap_or(content)
            .trim_start_matches(['\n', '\r']);
    }
    content.trim_end_matches(['\n', '\r']).to_string()
}

#[async_trait]
impl RemoteShell for SshShell {
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
        debug!("closing SSH shell");

        self.recv.close();

        if self.is_connected() {
            if let Err(e) = self.sender.send("exit\n".to_string()).await {
                debug!("failed to send exit command: {:?}", e);
            }
            // Give the device a moment to tear the channel down cleanly.
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        Ok(())
    }
}

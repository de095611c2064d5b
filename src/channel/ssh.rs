//! SSH shell transport over russh.
//!
//! Connects, authenticates, and opens one interactive session channel with
//! a PTY and a shell. The channel is converted into a byte stream and
//! serviced by [`ChannelHandle`]; the client handle is returned alongside
//! and must be kept alive for the duration of the session.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use russh::client;
use russh::keys::{load_secret_key, PrivateKeyWithHashAlg};

use super::ChannelHandle;
use crate::error::ConnectError;
use crate::session::auth::Secret;

const TERM: &str = "xterm-256color";
const PTY_COLS: u32 = 512;
const PTY_ROWS: u32 = 48;

/// SSH connection configuration. Secrets are held in [`Secret`] wrappers
/// and are never serialized or logged.
#[derive(Debug)]
pub struct SshConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: SshAuth,
}

/// SSH authentication method.
#[derive(Debug)]
pub enum SshAuth {
    Password(Secret),
    KeyFile {
        path: String,
        passphrase: Option<Secret>,
    },
}

/// Minimal russh client handler.
struct ClientHandler;

impl client::Handler for ClientHandler {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // TODO: known_hosts verification before this ships outside trusted networks
        log::warn!("accepting server key without verification");
        Ok(true)
    }
}

/// Keeps the authenticated connection alive while the shell channel is in
/// use; dropping it tears the connection down.
pub struct SshGuard {
    _handle: client::Handle<ClientHandler>,
}

/// Connect, authenticate, and open an interactive shell channel.
pub async fn open_shell_channel(config: &SshConfig) -> Result<(ChannelHandle, SshGuard), ConnectError> {
    let target = format!("{}@{}:{}", config.username, config.host, config.port);

    let ssh_config = client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(Duration::from_secs(30)),
        ..Default::default()
    };

    let mut handle = client::connect(
        Arc::new(ssh_config),
        (config.host.as_str(), config.port),
        ClientHandler,
    )
    .await
    .map_err(|e| ConnectError::Transport {
        target: target.clone(),
        source: e.context("SSH connect failed"),
    })?;

    let auth_result = match &config.auth {
        SshAuth::Password(password) => handle
            .authenticate_password(config.username.clone(), password.expose().to_string())
            .await
            .map_err(|e| ConnectError::Transport {
                target: target.clone(),
                source: anyhow::Error::new(e).context("password auth request failed"),
            })?,
        SshAuth::KeyFile { path, passphrase } => {
            let key_pair = load_secret_key(path, passphrase.as_ref().map(|p| p.expose()))
                .map_err(|e| ConnectError::Transport {
                    target: target.clone(),
                    source: anyhow::Error::new(e)
                        .context(format!("failed to load secret key at {path}")),
                })?;
            let pk = PrivateKeyWithHashAlg::new(Arc::new(key_pair), None);
            handle
                .authenticate_publickey(config.username.clone(), pk)
                .await
                .map_err(|e| ConnectError::Transport {
                    target: target.clone(),
                    source: anyhow::Error::new(e).context("publickey auth request failed"),
                })?
        }
    };

    match auth_result {
        client::AuthResult::Success => {}
        client::AuthResult::Failure { .. } => {
            return Err(ConnectError::AuthRejected { target });
        }
    }

    let open = async {
        let channel = handle.channel_open_session().await?;
        channel
            .request_pty(false, TERM, PTY_COLS, PTY_ROWS, 0, 0, &[])
            .await?;
        channel.request_shell(false).await?;
        Ok::<_, russh::Error>(channel)
    };

    let channel = open.await.map_err(|e| ConnectError::Transport {
        target: target.clone(),
        source: anyhow::Error::new(e).context("failed to open shell channel"),
    })?;

    log::info!("SSH shell ready on {target}");

    let (reader, writer) = tokio::io::split(channel.into_stream());
    Ok((
        ChannelHandle::spawn(reader, writer),
        SshGuard { _handle: handle },
    ))
}

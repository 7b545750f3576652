//! russh transport plumbing: direct and gate-chained connects,
//! authentication, exec, and the SFTP subsystem.

use std::sync::Arc;
use std::time::Duration;

use russh::client::{self, Handle, Msg};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::PublicKey;
use russh::{Channel, ChannelMsg, Disconnect};
use russh_sftp::client::SftpSession;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::auth::{Credential, HostKeyCheck, TransportConfig};
use crate::error::{Error, Result};

/// Raw tunnelled byte stream over a `direct-tcpip` channel.
pub type TunnelStream = russh::ChannelStream<Msg>;

/// russh callback handler. Host keys are checked through the auth
/// descriptor's verifier; without one, any key is accepted.
pub(crate) struct ClientHandler {
    addr: String,
    check: Option<HostKeyCheck>,
}

impl client::Handler for ClientHandler {
    type Error = Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool> {
        match &self.check {
            Some(check) => {
                let ok = check(&self.addr, server_public_key);
                if !ok {
                    warn!(addr = %self.addr, "host key rejected");
                }
                Ok(ok)
            }
            None => {
                debug!(addr = %self.addr, "host key accepted (no verifier configured)");
                Ok(true)
            }
        }
    }
}

/// One authenticated SSH connection.
pub(crate) struct Transport {
    handle: Handle<ClientHandler>,
    addr: String,
}

fn ensure_port(addr: &str) -> String {
    if addr.contains(':') {
        addr.to_string()
    } else {
        format!("{}:22", addr)
    }
}

fn host_port(addr: &str) -> (String, u32) {
    match addr.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u32>() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (addr.to_string(), 22),
        },
        None => (addr.to_string(), 22),
    }
}

fn client_config() -> Arc<client::Config> {
    Arc::new(client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(Duration::from_secs(30)),
        keepalive_max: 3,
        ..Default::default()
    })
}

impl Transport {
    /// Direct TCP connect and handshake.
    pub async fn connect(addr: &str, cfg: &TransportConfig) -> Result<Transport> {
        let addr = ensure_port(addr);
        info!(%addr, "connecting");

        let handler = ClientHandler {
            addr: addr.clone(),
            check: cfg.host_key_check.clone(),
        };
        let connect = client::connect(client_config(), addr.as_str(), handler);
        let mut handle = match cfg.timeout {
            Some(t) => timeout(t, connect).await.map_err(|_| Error::DialFailed {
                addr: addr.clone(),
                reason: "connection timed out".to_string(),
            })?,
            None => connect.await,
        }
        .map_err(|e| Error::DialFailed {
            addr: addr.clone(),
            reason: e.to_string(),
        })?;

        authenticate(&mut handle, &addr, cfg).await?;
        Ok(Transport { handle, addr })
    }

    /// Handshake over a `direct-tcpip` channel of `gate`: SSH-over-SSH.
    pub async fn connect_via(gate: &Transport, addr: &str, cfg: &TransportConfig) -> Result<Transport> {
        let addr = ensure_port(addr);
        let (host, port) = host_port(&addr);
        info!(%addr, gate = %gate.addr, "connecting through gate");

        let channel = gate
            .handle
            .channel_open_direct_tcpip(&host, port, "127.0.0.1", 0)
            .await
            .map_err(|e| Error::DialFailed {
                addr: addr.clone(),
                reason: format!("tunnel via {}: {}", gate.addr, e),
            })?;

        let handler = ClientHandler {
            addr: addr.clone(),
            check: cfg.host_key_check.clone(),
        };
        let connect = client::connect_stream(client_config(), channel.into_stream(), handler);
        let mut handle = match cfg.timeout {
            Some(t) => timeout(t, connect).await.map_err(|_| Error::DialFailed {
                addr: addr.clone(),
                reason: "connection timed out".to_string(),
            })?,
            None => connect.await,
        }
        .map_err(|e| Error::DialFailed {
            addr: addr.clone(),
            reason: e.to_string(),
        })?;

        authenticate(&mut handle, &addr, cfg).await?;
        Ok(Transport { handle, addr })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub async fn open_session(&self) -> Result<Channel<Msg>> {
        Ok(self.handle.channel_open_session().await?)
    }

    pub async fn open_direct_tcpip(&self, host: &str, port: u32) -> Result<Channel<Msg>> {
        Ok(self
            .handle
            .channel_open_direct_tcpip(host, port, "127.0.0.1", 0)
            .await?)
    }

    /// Brings up the SFTP subsystem on a fresh session channel.
    pub async fn sftp(&self) -> Result<SftpSession> {
        let channel = self.open_session().await?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(Error::Ssh)?;
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(Error::Sftp)?;
        debug!(addr = %self.addr, "sftp subsystem ready");
        Ok(sftp)
    }

    pub async fn disconnect(&self) {
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            debug!(addr = %self.addr, error = %e, "disconnect");
        }
    }
}

async fn authenticate(
    handle: &mut Handle<ClientHandler>,
    addr: &str,
    cfg: &TransportConfig,
) -> Result<()> {
    let mut reason = String::from("no credentials accepted");
    for credential in &cfg.credentials {
        let outcome = match credential {
            Credential::Password(password) => {
                handle.authenticate_password(&cfg.user, password).await
            }
            Credential::Key(key) => {
                let hash = handle
                    .best_supported_rsa_hash()
                    .await
                    .ok()
                    .flatten()
                    .flatten();
                handle
                    .authenticate_publickey(
                        &cfg.user,
                        PrivateKeyWithHashAlg::new(key.clone(), hash),
                    )
                    .await
            }
        };
        match outcome {
            Ok(result) if result.success() => {
                info!(%addr, user = %cfg.user, "authenticated");
                return Ok(());
            }
            Ok(_) => reason = "credential rejected by server".to_string(),
            Err(e) => reason = e.to_string(),
        }
    }
    Err(Error::HandshakeFailed {
        addr: addr.to_string(),
        reason,
    })
}

/// Executes `command` on the channel and drains it, interleaving stdout and
/// stderr into one buffer in arrival order. A non-zero exit status becomes
/// [`Error::CommandFailed`] carrying the captured output.
pub(crate) async fn run_command(channel: &mut Channel<Msg>, command: &str) -> Result<Vec<u8>> {
    channel.exec(true, command).await?;

    let mut output = Vec::new();
    let mut status = 0u32;
    loop {
        match channel.wait().await {
            Some(ChannelMsg::Data { ref data }) => output.extend_from_slice(data),
            Some(ChannelMsg::ExtendedData { ref data, ext }) if ext == 1 => {
                output.extend_from_slice(data)
            }
            Some(ChannelMsg::ExitStatus { exit_status }) => status = exit_status,
            // ExitStatus can arrive before or after Eof; keep draining
            // until the channel fully closes.
            Some(_) => {}
            None => break,
        }
    }

    if status != 0 {
        return Err(Error::CommandFailed { status, output });
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_port_appends_default() {
        assert_eq!(ensure_port("10.0.0.1"), "10.0.0.1:22");
        assert_eq!(ensure_port("10.0.0.1:2222"), "10.0.0.1:2222");
    }

    #[test]
    fn host_port_split() {
        assert_eq!(host_port("10.0.0.1:2222"), ("10.0.0.1".to_string(), 2222));
        assert_eq!(host_port("bastion"), ("bastion".to_string(), 22));
        assert_eq!(host_port("bad:port"), ("bad:port".to_string(), 22));
    }
}

//! Reverse-SSH server.
//!
//! Listens for inbound SSH connections from end-user clients and
//! authenticates them exclusively by CA-signed certificates: plain public
//! keys are rejected outright. An accepted connection gets one session
//! channel, one PTY, and one shell, bridged to a local process running as
//! the certificate principal.

use std::net::SocketAddr;
use std::sync::Arc;

use russh::server::{Auth, Msg, Server as _, Session};
use russh::{Channel, ChannelId, CryptoVec};
use ssh_key::private::{KeypairData, RsaKeypair};
use ssh_key::rand_core::OsRng;
use ssh_key::{Certificate, LineEnding, PrivateKey, PublicKey};
use tokio_util::sync::CancellationToken;

use gough_core::SessionId;

use crate::certs::{AcceptedCert, CertChecker};
use crate::pty::{spawn_shell, PtyController, PtyRequest};
use crate::sessions::SessionRegistry;
use crate::tokens::set_owner_only;

const HOST_KEY_BITS: usize = 2048;
const OUTPUT_BUF_BYTES: usize = 32 * 1024;

/// Load the persistent host key, generating an RSA keypair at first start.
///
/// # Errors
///
/// Returns an error if the key cannot be read, generated, or written.
pub fn load_or_generate_host_key(path: &std::path::Path) -> anyhow::Result<PrivateKey> {
    if path.exists() {
        let pem = std::fs::read_to_string(path)?;
        return Ok(PrivateKey::from_openssh(&pem)?);
    }

    tracing::info!(path = %path.display(), "generating reverse-SSH host key");
    let keypair = RsaKeypair::random(&mut OsRng, HOST_KEY_BITS)?;
    let key = PrivateKey::new(KeypairData::Rsa(keypair), "gough-agent host key")?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, key.to_openssh(LineEnding::LF)?.as_bytes())?;
    set_owner_only(path)?;
    Ok(key)
}

/// The reverse-SSH server.
pub struct RsshServer {
    host_key: PrivateKey,
    checker: Arc<CertChecker>,
    sessions: Arc<SessionRegistry>,
    allow_root_fallback: bool,
}

impl RsshServer {
    /// Create the server.
    #[must_use]
    pub fn new(
        host_key: PrivateKey,
        checker: Arc<CertChecker>,
        sessions: Arc<SessionRegistry>,
        allow_root_fallback: bool,
    ) -> Self {
        Self {
            host_key,
            checker,
            sessions,
            allow_root_fallback,
        }
    }

    /// Accept connections until cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound.
    pub async fn run(mut self, port: u16, cancel: CancellationToken) -> anyhow::Result<()> {
        let config = Arc::new(russh::server::Config {
            keys: vec![self.host_key.clone()],
            auth_rejection_time: std::time::Duration::from_secs(1),
            ..Default::default()
        });

        tracing::info!(port, "reverse-SSH server listening");
        tokio::select! {
            result = self.run_on_address(config, ("0.0.0.0", port)) => {
                result.map_err(Into::into)
            }
            () = cancel.cancelled() => {
                tracing::info!("reverse-SSH server stopping");
                Ok(())
            }
        }
    }
}

impl russh::server::Server for RsshServer {
    type Handler = Connection;

    fn new_client(&mut self, peer: Option<SocketAddr>) -> Connection {
        Connection {
            checker: Arc::clone(&self.checker),
            sessions: Arc::clone(&self.sessions),
            allow_root_fallback: self.allow_root_fallback,
            peer,
            accepted: None,
            channel: None,
            pty_request: None,
            controller: Arc::new(tokio::sync::Mutex::new(None)),
            session_id: None,
            cancel: CancellationToken::new(),
        }
    }
}

/// Per-connection handler state.
pub struct Connection {
    checker: Arc<CertChecker>,
    sessions: Arc<SessionRegistry>,
    allow_root_fallback: bool,
    peer: Option<SocketAddr>,
    accepted: Option<AcceptedCert>,
    channel: Option<ChannelId>,
    pty_request: Option<PtyRequest>,
    // Shared with the teardown path so either side can reap the child.
    controller: Arc<tokio::sync::Mutex<Option<PtyController>>>,
    session_id: Option<SessionId>,
    cancel: CancellationToken,
}

impl Connection {
    fn teardown(&self) {
        self.cancel.cancel();
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let controller = Arc::clone(&self.controller);
        let sessions = Arc::clone(&self.sessions);
        let session_id = self.session_id;
        runtime.spawn(async move {
            if let Some(controller) = controller.lock().await.take() {
                controller.shutdown().await;
            }
            if let Some(session_id) = session_id {
                sessions.end(&session_id);
            }
        });
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.session_id.is_some() {
            self.teardown();
        }
    }
}

impl russh::server::Handler for Connection {
    type Error = anyhow::Error;

    async fn auth_publickey(
        &mut self,
        user: &str,
        _public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        // Plain public keys carry no authorization; only certificates pass.
        tracing::warn!(user, peer = ?self.peer, "rejecting plain public key");
        Ok(Auth::Reject {
            proceed_with_methods: None,
        })
    }

    async fn auth_openssh_certificate(
        &mut self,
        user: &str,
        certificate: &Certificate,
    ) -> Result<Auth, Self::Error> {
        match self.checker.check(certificate, user) {
            Ok(accepted) => {
                tracing::info!(
                    user,
                    key_id = %accepted.key_id,
                    serial = accepted.serial,
                    peer = ?self.peer,
                    "certificate accepted"
                );
                self.accepted = Some(accepted);
                Ok(Auth::Accept)
            }
            Err(e) => {
                tracing::warn!(user, peer = ?self.peer, error = %e, "certificate rejected");
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                })
            }
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if self.channel.is_some() {
            // One session channel per connection.
            return Ok(false);
        }
        self.channel = Some(channel.id());
        Ok(true)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.pty_request = Some(PtyRequest {
            term: term.to_string(),
            cols: u16::try_from(col_width).unwrap_or(80),
            rows: u16::try_from(row_height).unwrap_or(24),
        });
        session.channel_success(channel)?;
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let Some(accepted) = self.accepted.clone() else {
            anyhow::bail!("shell requested before authentication");
        };
        if self.session_id.is_some() {
            anyhow::bail!("shell already started on this connection");
        }

        let request = self.pty_request.clone().unwrap_or_default();
        let pty = spawn_shell(&accepted.principal, self.allow_root_fallback, &request)?;
        let (mut reader, controller) = pty.split();
        *self.controller.lock().await = Some(controller);

        // The broker embedded the session id it recorded; fall back to a
        // local id so accounting still works for hand-rolled certificates.
        let session_id = accepted.session_id.unwrap_or_else(SessionId::generate);
        self.session_id = Some(session_id);
        self.cancel = self.sessions.start(session_id);

        let handle = session.handle();
        let cancel = self.cancel.clone();
        let controller = Arc::clone(&self.controller);
        let sessions = Arc::clone(&self.sessions);
        tokio::spawn(async move {
            let mut buf = [0u8; OUTPUT_BUF_BYTES];
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    read = reader.read(&mut buf) => {
                        match read {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if handle
                                    .data(channel, CryptoVec::from_slice(&buf[..n]))
                                    .await
                                    .is_err()
                                {
                                    break;
                                }
                            }
                        }
                    }
                }
            }

            let _ = handle.eof(channel).await;
            let _ = handle.close(channel).await;
            if let Some(controller) = controller.lock().await.take() {
                controller.shutdown().await;
            }
            sessions.end(&session_id);
        });

        session.channel_success(channel)?;
        Ok(())
    }

    async fn data(
        &mut self,
        _channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(controller) = self.controller.lock().await.as_mut() {
            controller.write_input(data).await?;
        }
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        _channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(controller) = self.controller.lock().await.as_ref() {
            controller.resize(
                u16::try_from(col_width).unwrap_or(80),
                u16::try_from(row_height).unwrap_or(24),
            )?;
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        _channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.teardown();
        Ok(())
    }

    async fn channel_close(
        &mut self,
        _channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.teardown();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_key_is_persistent_and_private() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host_key");

        let first = load_or_generate_host_key(&path).unwrap();
        let second = load_or_generate_host_key(&path).unwrap();
        assert_eq!(
            first.public_key().to_openssh().unwrap(),
            second.public_key().to_openssh().unwrap()
        );

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}

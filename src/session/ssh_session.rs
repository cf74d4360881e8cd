use std::sync::Arc;
use std::time::Duration;

use russh::keys::agent::AgentIdentity;
use russh::keys::agent::client::AgentClient;
use russh::keys::{Algorithm, PrivateKeyWithHashAlg};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;

use crate::config::sftp_auth::SftpAuth;
use crate::config::sftp_config::SftpConfig;
use crate::protocol::sftp_channel::SftpChannel;
use crate::session::ssh_client::SshClient;
use crate::utils::error::{AuthError, Result, SftpError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Authenticated,
    Closed,
}

/// One ssh connection and its authenticated identity. Created per
/// operation call and owned exclusively by it; must reach `Closed` through
/// [`SshSession::disconnect`] on every exit path.
pub struct SshSession {
    handle: Option<russh::client::Handle<SshClient>>,
    state: SessionState,
    host: String,
    port: u16,
}

impl SshSession {
    /// Opens the tcp connection and runs the ssh handshake, bounded by the
    /// connect timeout. A failed connect leaves nothing behind to release.
    pub async fn connect(config: &SftpConfig) -> Result<Self> {
        let mut session = SshSession {
            handle: None,
            state: SessionState::Disconnected,
            host: config.host.clone(),
            port: config.port,
        };
        session.state = SessionState::Connecting;
        tracing::debug!("connecting to {}:{}", session.host, session.port);

        let ssh_config = Arc::new(russh::client::Config::default());
        let address = (config.host.as_str(), config.port);
        let handle = timeout(config.connect_timeout, russh::client::connect(ssh_config, address, SshClient {}))
            .await
            .map_err(|_| SftpError::Timeout(config.connect_timeout))??;

        session.handle = Some(handle);
        Ok(session)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Authenticates the connected session. A rejected credential is
    /// reported as `BadCredential`; transport failures during the auth
    /// exchange stay `Connection` errors.
    pub async fn authenticate(&mut self, user: &str, auth: &SftpAuth) -> Result<()> {
        let handle = match self.handle.as_mut() {
            Some(handle) => handle,
            None => return Err(SftpError::Connection("session is closed".to_string())),
        };

        match auth {
            SftpAuth::Password(password) => {
                let result = handle.authenticate_password(user, password).await?;
                if !result.success() {
                    return Err(AuthError::BadCredential(format!("password rejected for user '{}'", user)).into());
                }
            }
            SftpAuth::PrivateKey { key_path, passphrase } => {
                let key = russh::keys::load_secret_key(key_path, passphrase.as_deref())
                    .map_err(|err| AuthError::BadCredential(format!("cannot load key: {}", err)))?;
                let hash_alg = handle.best_supported_rsa_hash().await?.flatten();
                let key = PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg);
                let result = handle.authenticate_publickey(user, key).await?;
                if !result.success() {
                    return Err(AuthError::BadCredential(format!("key rejected for user '{}'", user)).into());
                }
            }
            SftpAuth::Agent => {
                let mut agent = AgentClient::connect_env()
                    .await
                    .map_err(|err| AuthError::BadCredential(format!("ssh agent unavailable: {}", err)))?;
                let identities = agent
                    .request_identities()
                    .await
                    .map_err(|err| AuthError::BadCredential(format!("ssh agent: {}", err)))?;
                if identities.is_empty() {
                    return Err(AuthError::BadCredential("no identities in ssh agent".to_string()).into());
                }

                let rsa_hash = handle.best_supported_rsa_hash().await?.flatten();
                let mut accepted = false;
                for identity in identities {
                    // Certificates are not offered, only plain keys.
                    let AgentIdentity::PublicKey { key, .. } = identity else {
                        continue;
                    };
                    let hash_alg = match key.algorithm() {
                        Algorithm::Rsa { .. } => rsa_hash,
                        _ => None,
                    };
                    let result = handle
                        .authenticate_publickey_with(user, key, hash_alg, &mut agent)
                        .await
                        .map_err(|err| AuthError::BadCredential(format!("ssh agent: {}", err)))?;
                    if result.success() {
                        accepted = true;
                        break;
                    }
                }
                if !accepted {
                    return Err(AuthError::BadCredential(format!("ssh agent keys rejected for user '{}'", user)).into());
                }
            }
        }

        self.state = SessionState::Authenticated;
        tracing::debug!("authenticated '{}' on {}:{}", user, self.host, self.port);
        Ok(())
    }

    /// Opens the sftp subsystem channel and negotiates the protocol. A
    /// rejection here, after a successful login, is reported as
    /// `SubsystemUnavailable`.
    pub async fn open_sftp(
        &mut self,
        roundtrip_timeout: Duration,
    ) -> Result<SftpChannel<impl AsyncRead + AsyncWrite + Unpin + Send + use<>>> {
        let handle = match self.handle.as_mut() {
            Some(handle) => handle,
            None => return Err(SftpError::Connection("session is closed".to_string())),
        };

        let channel = handle
            .channel_open_session()
            .await
            .map_err(|err| AuthError::SubsystemUnavailable(err.to_string()))?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|err| AuthError::SubsystemUnavailable(err.to_string()))?;

        SftpChannel::open(channel.into_stream(), roundtrip_timeout).await
    }

    /// Closes the connection. Idempotent and infallible so it can run on
    /// every exit path; failures are logged and swallowed.
    pub async fn disconnect(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.disconnect(russh::Disconnect::ByApplication, "", "english").await {
                tracing::debug!("disconnect from {}:{} failed: {}", self.host, self.port, err);
            }
        }
        self.state = SessionState::Closed;
    }
}

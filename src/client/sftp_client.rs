use std::path::Path;
use std::time::Duration;

use tokio::fs::OpenOptions;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;

use crate::client::remote_file::RemoteFile;
use crate::client::transfer;
use crate::config::sftp_auth::SftpAuth;
use crate::config::sftp_config::SftpConfig;
use crate::protocol::sftp_channel::SftpChannel;
use crate::session::ssh_session::SshSession;
use crate::utils::error::{Result, SftpError};

/// Sftp client exposing directory listing, upload, download and delete.
///
/// Every operation is a complete unit: it opens its own connection,
/// authenticates, runs exactly one protocol exchange and releases the
/// connection, regardless of outcome. A client holds no live resources
/// between calls, so independent tasks may run operations concurrently
/// on their own clients or share one behind a reference.
pub struct SftpClient {
    config: SftpConfig,
}

impl SftpClient {
    /// Builds a client for the host and user. The host may carry a port
    /// as `"host:port"`, otherwise port 22 is used.
    pub fn new<T: AsRef<str>>(host: T, user: T) -> Self {
        SftpClient { config: SftpConfig::new(host.as_ref(), user.as_ref()) }
    }

    pub fn from_config(config: SftpConfig) -> Self {
        SftpClient { config }
    }

    pub fn config(&self) -> &SftpConfig {
        &self.config
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Sets the password for authentication.
    pub fn auth_password<T: AsRef<str>>(mut self, password: T) -> Self {
        self.config.auth = Some(SftpAuth::Password(password.as_ref().to_string()));
        self
    }

    /// Sets the private key path and passphrase for authentication.
    pub fn auth_private_key<T: AsRef<Path>, S: AsRef<str>>(mut self, key_path: T, passphrase: Option<S>) -> Self {
        self.config.auth = Some(SftpAuth::PrivateKey {
            key_path: key_path.as_ref().to_path_buf(),
            passphrase: passphrase.map(|passphrase| passphrase.as_ref().to_string()),
        });
        self
    }

    /// Authenticate with an identity held by the running ssh agent.
    pub fn auth_agent(mut self) -> Self {
        self.config.auth = Some(SftpAuth::Agent);
        self
    }

    pub fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.config.connect_timeout = connect_timeout;
        self
    }

    pub fn roundtrip_timeout(mut self, roundtrip_timeout: Duration) -> Self {
        self.config.roundtrip_timeout = roundtrip_timeout;
        self
    }

    /// Bounds each complete operation after connect. The session is still
    /// torn down when the deadline cancels an exchange in flight.
    pub fn operation_timeout(mut self, operation_timeout: Duration) -> Self {
        self.config.operation_timeout = Some(operation_timeout);
        self
    }

    /// Lists all entries of a remote directory, directories included.
    /// Pass `"."` for the login directory.
    pub async fn list_all_files<T: AsRef<str>>(&self, remote_dir: T) -> Result<Vec<RemoteFile>> {
        let remote_dir = remote_dir.as_ref();
        let result = self.run_list(remote_dir).await;
        match &result {
            Ok(entries) => tracing::info!("listed {} entries under '{}'", entries.len(), remote_dir),
            Err(err) => tracing::error!("failed listing files under '{}': {}", remote_dir, err),
        }
        result
    }

    /// Uploads a local file to a remote path. The local source is opened
    /// before any connection is made, so a local failure is reported as
    /// such and nothing is written remotely.
    pub async fn upload_file<L: AsRef<Path>, R: AsRef<str>>(&self, local_path: L, remote_path: R) -> Result<()> {
        let local_path = local_path.as_ref();
        let remote_path = remote_path.as_ref();
        let result = self.run_upload(local_path, remote_path).await;
        match &result {
            Ok(bytes) => tracing::info!("uploaded '{}' to '{}' ({} bytes)", local_path.display(), remote_path, bytes),
            Err(err) => tracing::error!("failed uploading '{}' to '{}': {}", local_path.display(), remote_path, err),
        }
        result.map(|_| ())
    }

    /// Downloads a remote file to a local path. The remote file is opened
    /// first, a missing remote path never creates or truncates the local
    /// destination.
    pub async fn download_file<R: AsRef<str>, L: AsRef<Path>>(&self, remote_path: R, local_path: L) -> Result<()> {
        let remote_path = remote_path.as_ref();
        let local_path = local_path.as_ref();
        let result = self.run_download(remote_path, local_path).await;
        match &result {
            Ok(bytes) => tracing::info!("downloaded '{}' to '{}' ({} bytes)", remote_path, local_path.display(), bytes),
            Err(err) => tracing::error!("failed downloading '{}' to '{}': {}", remote_path, local_path.display(), err),
        }
        result.map(|_| ())
    }

    /// Continues an interrupted download, keeping the bytes already
    /// present at the local path and fetching only the remainder. A
    /// missing local file downloads from the start; a destination that is
    /// already complete transfers nothing.
    pub async fn resume_download_file<R: AsRef<str>, L: AsRef<Path>>(&self, remote_path: R, local_path: L) -> Result<()> {
        let remote_path = remote_path.as_ref();
        let local_path = local_path.as_ref();
        let result = self.run_resume(remote_path, local_path).await;
        match &result {
            Ok(bytes) => tracing::info!("resumed '{}' to '{}' ({} bytes)", remote_path, local_path.display(), bytes),
            Err(err) => tracing::error!("failed resuming '{}' to '{}': {}", remote_path, local_path.display(), err),
        }
        result.map(|_| ())
    }

    /// Deletes a remote file. Not idempotent, deleting an already removed
    /// path reports `NotFound`.
    pub async fn delete_file<T: AsRef<str>>(&self, remote_path: T) -> Result<()> {
        let remote_path = remote_path.as_ref();
        let result = self.run_delete(remote_path).await;
        match &result {
            Ok(()) => tracing::info!("deleted '{}'", remote_path),
            Err(err) => tracing::error!("failed deleting '{}': {}", remote_path, err),
        }
        result
    }

    async fn run_list(&self, remote_dir: &str) -> Result<Vec<RemoteFile>> {
        let mut session = SshSession::connect(&self.config).await?;
        let result = self
            .bounded(async {
                let mut channel = Self::open_channel(&mut session, &self.config).await?;
                let entries = channel.list_dir(remote_dir).await?;
                Ok(entries.into_iter().map(RemoteFile::from).collect::<Vec<_>>())
            })
            .await;
        session.disconnect().await;
        result
    }

    async fn run_upload(&self, local_path: &Path, remote_path: &str) -> Result<u64> {
        let mut source = OpenOptions::new()
            .read(true)
            .open(local_path)
            .await
            .map_err(|err| SftpError::LocalIo { path: local_path.display().to_string(), source: err })?;

        let mut session = SshSession::connect(&self.config).await?;
        let result = self
            .bounded(async {
                let mut channel = Self::open_channel(&mut session, &self.config).await?;
                transfer::copy_file_to_remote(&mut channel, &mut source, local_path, remote_path).await
            })
            .await;
        session.disconnect().await;
        result
    }

    async fn run_download(&self, remote_path: &str, local_path: &Path) -> Result<u64> {
        let mut session = SshSession::connect(&self.config).await?;
        let result = self
            .bounded(async {
                let mut channel = Self::open_channel(&mut session, &self.config).await?;
                transfer::copy_remote_to_local(&mut channel, remote_path, local_path).await
            })
            .await;
        session.disconnect().await;
        result
    }

    async fn run_resume(&self, remote_path: &str, local_path: &Path) -> Result<u64> {
        let mut session = SshSession::connect(&self.config).await?;
        let result = self
            .bounded(async {
                let mut channel = Self::open_channel(&mut session, &self.config).await?;
                transfer::resume_remote_to_local(&mut channel, remote_path, local_path).await
            })
            .await;
        session.disconnect().await;
        result
    }

    async fn run_delete(&self, remote_path: &str) -> Result<()> {
        let mut session = SshSession::connect(&self.config).await?;
        let result = self
            .bounded(async {
                let mut channel = Self::open_channel(&mut session, &self.config).await?;
                channel.remove(remote_path).await
            })
            .await;
        session.disconnect().await;
        result
    }

    async fn open_channel(
        session: &mut SshSession,
        config: &SftpConfig,
    ) -> Result<SftpChannel<impl AsyncRead + AsyncWrite + Unpin + Send + use<>>> {
        let auth = match &config.auth {
            Some(auth) => auth,
            None => return Err(SftpError::Config("no credential configured".to_string())),
        };
        session.authenticate(&config.user, auth).await?;
        session.open_sftp(config.roundtrip_timeout).await
    }

    async fn bounded<T>(&self, operation: impl Future<Output = Result<T>>) -> Result<T> {
        match self.config.operation_timeout {
            Some(limit) => match timeout(limit, operation).await {
                Ok(result) => result,
                Err(_) => Err(SftpError::Timeout(limit)),
            },
            None => operation.await,
        }
    }
}

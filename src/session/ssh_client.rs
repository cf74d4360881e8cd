use crate::utils::error::SftpError;

/// Transport event handler. Server keys are accepted without verification,
/// matching the observed clients which disable strict host key checking.
pub struct SshClient;

impl russh::client::Handler for SshClient {
    type Error = SftpError;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, SftpError> {
        Ok(true)
    }
}

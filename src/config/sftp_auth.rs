use std::path::PathBuf;

/// Credential used to authenticate the ssh session.
#[derive(Debug, Clone)]
pub enum SftpAuth {
    Password(String),
    PrivateKey {
        key_path: PathBuf,
        passphrase: Option<String>,
    },
    Agent,
}

use std::time::Duration;

use thiserror::Error;

/// Authentication failures, kept separate so callers can tell a rejected
/// credential apart from a server that accepted the login but refused to
/// start the sftp subsystem.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("authentication rejected: {0}")]
    BadCredential(String),
    #[error("sftp subsystem unavailable: {0}")]
    SubsystemUnavailable(String),
}

#[derive(Debug, Error)]
pub enum SftpError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("remote path not found: {0}")]
    NotFound(String),
    #[error("open of '{path}' rejected: {message}")]
    Open { path: String, message: String },
    #[error("listing of '{path}' rejected: {message}")]
    List { path: String, message: String },
    #[error("delete of '{path}' rejected: {message}")]
    Delete { path: String, message: String },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("local io error on '{path}': {source}")]
    LocalIo {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("config error: {0}")]
    Config(String),
}

impl From<russh::Error> for SftpError {
    fn from(err: russh::Error) -> Self {
        SftpError::Connection(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SftpError>;

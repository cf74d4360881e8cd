pub mod remote_file;
pub mod sftp_client;

mod transfer;

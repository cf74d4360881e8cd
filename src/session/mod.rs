pub mod ssh_client;
pub mod ssh_session;

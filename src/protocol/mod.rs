pub mod file_attributes;
pub mod packet;
pub mod sftp_channel;

#[cfg(test)]
pub(crate) mod stub_server;

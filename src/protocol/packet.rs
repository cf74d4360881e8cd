use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::protocol::file_attributes::FileAttributes;
use crate::utils::error::{Result, SftpError};

/// Protocol version spoken by this client (draft-ietf-secsh-filexfer-02).
pub const SFTP_VERSION: u32 = 3;

/// Upper bound on a single packet body, guards against a corrupt or
/// hostile length prefix.
pub const MAX_PACKET_SIZE: usize = 256 * 1024;

pub const SSH_FXP_INIT: u8 = 1;
pub const SSH_FXP_VERSION: u8 = 2;
pub const SSH_FXP_OPEN: u8 = 3;
pub const SSH_FXP_CLOSE: u8 = 4;
pub const SSH_FXP_READ: u8 = 5;
pub const SSH_FXP_WRITE: u8 = 6;
pub const SSH_FXP_OPENDIR: u8 = 11;
pub const SSH_FXP_READDIR: u8 = 12;
pub const SSH_FXP_REMOVE: u8 = 13;
pub const SSH_FXP_REALPATH: u8 = 16;
pub const SSH_FXP_STAT: u8 = 17;
pub const SSH_FXP_STATUS: u8 = 101;
pub const SSH_FXP_HANDLE: u8 = 102;
pub const SSH_FXP_DATA: u8 = 103;
pub const SSH_FXP_NAME: u8 = 104;
pub const SSH_FXP_ATTRS: u8 = 105;

pub const SSH_FX_OK: u32 = 0;
pub const SSH_FX_EOF: u32 = 1;
pub const SSH_FX_NO_SUCH_FILE: u32 = 2;
pub const SSH_FX_PERMISSION_DENIED: u32 = 3;
pub const SSH_FX_FAILURE: u32 = 4;
pub const SSH_FX_OP_UNSUPPORTED: u32 = 8;

pub const SSH_FXF_READ: u32 = 0x00000001;
pub const SSH_FXF_WRITE: u32 = 0x00000002;
pub const SSH_FXF_CREAT: u32 = 0x00000008;
pub const SSH_FXF_TRUNC: u32 = 0x00000010;

/// Frames a packet for the wire: u32 length prefix covering the type byte
/// and the payload, then the type byte, then the payload.
pub fn frame(packet_type: u8, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(payload.len() + 5);
    buf.put_u32(payload.len() as u32 + 1);
    buf.put_u8(packet_type);
    buf.put_slice(payload);
    buf.freeze()
}

pub fn put_string(buf: &mut BytesMut, value: &[u8]) {
    buf.put_u32(value.len() as u32);
    buf.put_slice(value);
}

pub fn get_u8(buf: &mut Bytes) -> Result<u8> {
    if buf.remaining() < 1 {
        return Err(SftpError::Protocol("packet truncated reading u8".to_string()));
    }
    Ok(buf.get_u8())
}

pub fn get_u32(buf: &mut Bytes) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(SftpError::Protocol("packet truncated reading u32".to_string()));
    }
    Ok(buf.get_u32())
}

pub fn get_u64(buf: &mut Bytes) -> Result<u64> {
    if buf.remaining() < 8 {
        return Err(SftpError::Protocol("packet truncated reading u64".to_string()));
    }
    Ok(buf.get_u64())
}

pub fn get_string(buf: &mut Bytes) -> Result<Bytes> {
    let length = get_u32(buf)? as usize;
    if buf.remaining() < length {
        return Err(SftpError::Protocol(format!("packet truncated reading string of {} bytes", length)));
    }
    Ok(buf.split_to(length))
}

/// Reads a string field as text. Remote names are not guaranteed to be
/// valid utf-8, invalid bytes are replaced rather than failing the packet.
pub fn get_text(buf: &mut Bytes) -> Result<String> {
    let raw = get_string(buf)?;
    Ok(String::from_utf8_lossy(&raw).into_owned())
}

/// One entry of an SSH_FXP_NAME response.
#[derive(Debug, Clone)]
pub struct NameEntry {
    pub name: String,
    pub longname: String,
    pub attrs: FileAttributes,
}

/// A response packet with the request id already stripped off.
#[derive(Debug)]
pub enum Response {
    Status { code: u32, message: String },
    Handle(Bytes),
    Data(Bytes),
    Name(Vec<NameEntry>),
    Attrs(FileAttributes),
}

impl Response {
    /// Decodes a response body, starting after the type byte and the
    /// request id.
    pub fn decode(packet_type: u8, mut body: Bytes) -> Result<Response> {
        match packet_type {
            SSH_FXP_STATUS => {
                let code = get_u32(&mut body)?;
                // Some v3 servers omit the message and language fields.
                let message = if body.has_remaining() { get_text(&mut body)? } else { String::new() };
                Ok(Response::Status { code, message })
            }
            SSH_FXP_HANDLE => Ok(Response::Handle(get_string(&mut body)?)),
            SSH_FXP_DATA => Ok(Response::Data(get_string(&mut body)?)),
            SSH_FXP_NAME => {
                let count = get_u32(&mut body)?;
                // The count is server-controlled, never reserve more than
                // the body could possibly hold.
                let mut entries = Vec::with_capacity((count as usize).min(body.remaining()));
                for _ in 0..count {
                    let name = get_text(&mut body)?;
                    let longname = get_text(&mut body)?;
                    let attrs = FileAttributes::decode(&mut body)?;
                    entries.push(NameEntry { name, longname, attrs });
                }
                Ok(Response::Name(entries))
            }
            SSH_FXP_ATTRS => Ok(Response::Attrs(FileAttributes::decode(&mut body)?)),
            other => Err(SftpError::Protocol(format!("unexpected packet type {}", other))),
        }
    }
}

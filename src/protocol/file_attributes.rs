use bytes::{Bytes, BytesMut, BufMut};

use crate::protocol::packet::{get_string, get_u32, get_u64};
use crate::utils::error::Result;

pub const SSH_FILEXFER_ATTR_SIZE: u32 = 0x00000001;
pub const SSH_FILEXFER_ATTR_UIDGID: u32 = 0x00000002;
pub const SSH_FILEXFER_ATTR_PERMISSIONS: u32 = 0x00000004;
pub const SSH_FILEXFER_ATTR_ACMODTIME: u32 = 0x00000008;
pub const SSH_FILEXFER_ATTR_EXTENDED: u32 = 0x80000000;

const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;

/// File attributes as carried in ATTRS blocks. Every field is optional,
/// servers only send what the flag word announces.
#[derive(Debug, Clone, Default)]
pub struct FileAttributes {
    pub size: Option<u64>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub permissions: Option<u32>,
    pub atime: Option<u32>,
    pub mtime: Option<u32>,
}

impl FileAttributes {
    pub fn decode(buf: &mut Bytes) -> Result<Self> {
        let flags = get_u32(buf)?;
        let mut attrs = FileAttributes::default();

        if flags & SSH_FILEXFER_ATTR_SIZE != 0 {
            attrs.size = Some(get_u64(buf)?);
        }
        if flags & SSH_FILEXFER_ATTR_UIDGID != 0 {
            attrs.uid = Some(get_u32(buf)?);
            attrs.gid = Some(get_u32(buf)?);
        }
        if flags & SSH_FILEXFER_ATTR_PERMISSIONS != 0 {
            attrs.permissions = Some(get_u32(buf)?);
        }
        if flags & SSH_FILEXFER_ATTR_ACMODTIME != 0 {
            attrs.atime = Some(get_u32(buf)?);
            attrs.mtime = Some(get_u32(buf)?);
        }
        if flags & SSH_FILEXFER_ATTR_EXTENDED != 0 {
            let count = get_u32(buf)?;
            for _ in 0..count {
                get_string(buf)?;
                get_string(buf)?;
            }
        }

        Ok(attrs)
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        let mut flags = 0;
        if self.size.is_some() {
            flags |= SSH_FILEXFER_ATTR_SIZE;
        }
        if self.uid.is_some() && self.gid.is_some() {
            flags |= SSH_FILEXFER_ATTR_UIDGID;
        }
        if self.permissions.is_some() {
            flags |= SSH_FILEXFER_ATTR_PERMISSIONS;
        }
        if self.atime.is_some() && self.mtime.is_some() {
            flags |= SSH_FILEXFER_ATTR_ACMODTIME;
        }

        buf.put_u32(flags);
        if let Some(size) = self.size {
            buf.put_u64(size);
        }
        if let (Some(uid), Some(gid)) = (self.uid, self.gid) {
            buf.put_u32(uid);
            buf.put_u32(gid);
        }
        if let Some(permissions) = self.permissions {
            buf.put_u32(permissions);
        }
        if let (Some(atime), Some(mtime)) = (self.atime, self.mtime) {
            buf.put_u32(atime);
            buf.put_u32(mtime);
        }
    }

    pub fn is_directory(&self) -> bool {
        self.permissions.is_some_and(|permissions| permissions & S_IFMT == S_IFDIR)
    }

    pub fn is_regular_file(&self) -> bool {
        self.permissions.is_some_and(|permissions| permissions & S_IFMT == S_IFREG)
    }
}

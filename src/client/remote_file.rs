use time::OffsetDateTime;

use crate::protocol::packet::NameEntry;

/// One entry of a remote directory listing. The modification time is best
/// effort, servers that omit attribute data leave it empty.
#[derive(Debug, Clone)]
pub struct RemoteFile {
    pub name: String,
    pub is_directory: bool,
    pub is_regular_file: bool,
    pub size: u64,
    pub modified: Option<OffsetDateTime>,
}

impl From<NameEntry> for RemoteFile {
    fn from(entry: NameEntry) -> Self {
        let attrs = entry.attrs;
        RemoteFile {
            name: entry.name,
            is_directory: attrs.is_directory(),
            is_regular_file: attrs.is_regular_file(),
            size: attrs.size.unwrap_or(0),
            modified: attrs
                .mtime
                .and_then(|mtime| OffsetDateTime::from_unix_timestamp(mtime as i64).ok()),
        }
    }
}

use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::protocol::file_attributes::FileAttributes;
use crate::protocol::packet::{self, NameEntry, Response};
use crate::utils::error::{Result, SftpError};

/// Client side of one sftp channel. Owns its stream exclusively and runs
/// the request/response cycle on it, strictly sequentially. Each request
/// carries a fresh id and the response is correlated against it.
pub struct SftpChannel<S> {
    stream: S,
    request_id: u32,
    roundtrip_timeout: Duration,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> SftpChannel<S> {
    /// Negotiates the protocol version over the stream and returns a
    /// channel ready for requests.
    pub async fn open(stream: S, roundtrip_timeout: Duration) -> Result<Self> {
        let mut channel = SftpChannel { stream, request_id: 0, roundtrip_timeout };

        let mut payload = BytesMut::new();
        payload.put_u32(packet::SFTP_VERSION);
        let negotiate = async {
            channel.send(packet::SSH_FXP_INIT, &payload).await?;
            channel.recv().await
        };
        let (packet_type, mut body) = timeout(roundtrip_timeout, negotiate)
            .await
            .map_err(|_| SftpError::Timeout(roundtrip_timeout))??;

        if packet_type != packet::SSH_FXP_VERSION {
            return Err(SftpError::Protocol(format!("expected version packet, got type {}", packet_type)));
        }
        let version = packet::get_u32(&mut body)?;
        if version != packet::SFTP_VERSION {
            return Err(SftpError::Protocol(format!("server negotiated unsupported sftp version {}", version)));
        }
        tracing::debug!("sftp channel ready, version {}", version);

        Ok(channel)
    }

    /// Resolves a path to its canonical absolute form on the server.
    pub async fn real_path(&mut self, path: &str) -> Result<String> {
        let id = self.next_request_id();
        let mut payload = BytesMut::new();
        payload.put_u32(id);
        packet::put_string(&mut payload, path.as_bytes());

        match self.roundtrip(packet::SSH_FXP_REALPATH, id, &payload).await? {
            Response::Name(entries) => match entries.into_iter().next() {
                Some(entry) => Ok(entry.name),
                None => Err(SftpError::Protocol("empty realpath response".to_string())),
            },
            Response::Status { code: packet::SSH_FX_NO_SUCH_FILE, .. } => Err(SftpError::NotFound(path.to_string())),
            Response::Status { message, .. } => Err(SftpError::List { path: path.to_string(), message }),
            _ => Err(SftpError::Protocol("unexpected response to realpath".to_string())),
        }
    }

    /// Enumerates a directory. The path is canonicalized first, then
    /// entries are pulled in batches until the server signals end of
    /// listing. The directory handle is closed on every path out.
    pub async fn list_dir(&mut self, path: &str) -> Result<Vec<NameEntry>> {
        let resolved = self.real_path(path).await?;
        let handle = self.open_dir(&resolved, path).await?;

        let mut entries = Vec::new();
        let result = self.collect_dir(&handle, path, &mut entries).await;
        let closed = self.close(&handle).await;

        result?;
        closed?;
        Ok(entries)
    }

    async fn open_dir(&mut self, resolved: &str, original: &str) -> Result<Bytes> {
        let id = self.next_request_id();
        let mut payload = BytesMut::new();
        payload.put_u32(id);
        packet::put_string(&mut payload, resolved.as_bytes());

        match self.roundtrip(packet::SSH_FXP_OPENDIR, id, &payload).await? {
            Response::Handle(handle) => Ok(handle),
            Response::Status { code: packet::SSH_FX_NO_SUCH_FILE, .. } => Err(SftpError::NotFound(original.to_string())),
            Response::Status { message, .. } => Err(SftpError::List { path: original.to_string(), message }),
            _ => Err(SftpError::Protocol("unexpected response to opendir".to_string())),
        }
    }

    async fn collect_dir(&mut self, handle: &[u8], path: &str, entries: &mut Vec<NameEntry>) -> Result<()> {
        loop {
            let id = self.next_request_id();
            let mut payload = BytesMut::new();
            payload.put_u32(id);
            packet::put_string(&mut payload, handle);

            match self.roundtrip(packet::SSH_FXP_READDIR, id, &payload).await? {
                Response::Name(batch) => entries.extend(batch),
                Response::Status { code: packet::SSH_FX_EOF, .. } => return Ok(()),
                Response::Status { message, .. } => return Err(SftpError::List { path: path.to_string(), message }),
                _ => return Err(SftpError::Protocol("unexpected response to readdir".to_string())),
            }
        }
    }

    /// Reads the attributes of a remote path, following symlinks.
    pub async fn stat(&mut self, path: &str) -> Result<FileAttributes> {
        let id = self.next_request_id();
        let mut payload = BytesMut::new();
        payload.put_u32(id);
        packet::put_string(&mut payload, path.as_bytes());

        match self.roundtrip(packet::SSH_FXP_STAT, id, &payload).await? {
            Response::Attrs(attrs) => Ok(attrs),
            Response::Status { code: packet::SSH_FX_NO_SUCH_FILE, .. } => Err(SftpError::NotFound(path.to_string())),
            Response::Status { message, .. } => Err(SftpError::Open { path: path.to_string(), message }),
            _ => Err(SftpError::Protocol("unexpected response to stat".to_string())),
        }
    }

    /// Opens a remote file for reading.
    pub async fn open_read(&mut self, path: &str) -> Result<Bytes> {
        self.open_file(path, packet::SSH_FXF_READ).await
    }

    /// Opens a remote file for writing, creating or truncating it.
    pub async fn open_write(&mut self, path: &str) -> Result<Bytes> {
        self.open_file(path, packet::SSH_FXF_WRITE | packet::SSH_FXF_CREAT | packet::SSH_FXF_TRUNC).await
    }

    async fn open_file(&mut self, path: &str, pflags: u32) -> Result<Bytes> {
        let id = self.next_request_id();
        let mut payload = BytesMut::new();
        payload.put_u32(id);
        packet::put_string(&mut payload, path.as_bytes());
        payload.put_u32(pflags);
        FileAttributes::default().encode(&mut payload);

        match self.roundtrip(packet::SSH_FXP_OPEN, id, &payload).await? {
            Response::Handle(handle) => Ok(handle),
            Response::Status { code: packet::SSH_FX_NO_SUCH_FILE, .. } => Err(SftpError::NotFound(path.to_string())),
            Response::Status { message, .. } => Err(SftpError::Open { path: path.to_string(), message }),
            _ => Err(SftpError::Protocol("unexpected response to open".to_string())),
        }
    }

    /// Reads up to `length` bytes at `offset`. Returns `None` once the
    /// server signals end of file. An empty data chunk is treated as end
    /// of file as well, a caller looping on the offset would otherwise
    /// never advance.
    pub async fn read(&mut self, handle: &[u8], offset: u64, length: u32) -> Result<Option<Bytes>> {
        let id = self.next_request_id();
        let mut payload = BytesMut::new();
        payload.put_u32(id);
        packet::put_string(&mut payload, handle);
        payload.put_u64(offset);
        payload.put_u32(length);

        match self.roundtrip(packet::SSH_FXP_READ, id, &payload).await? {
            Response::Data(data) if data.is_empty() => Ok(None),
            Response::Data(data) => Ok(Some(data)),
            Response::Status { code: packet::SSH_FX_EOF, .. } => Ok(None),
            Response::Status { message, .. } => Err(SftpError::Protocol(format!("remote read rejected: {}", message))),
            _ => Err(SftpError::Protocol("unexpected response to read".to_string())),
        }
    }

    /// Writes a chunk at `offset`.
    pub async fn write(&mut self, handle: &[u8], offset: u64, data: &[u8]) -> Result<()> {
        let id = self.next_request_id();
        let mut payload = BytesMut::with_capacity(data.len() + 64);
        payload.put_u32(id);
        packet::put_string(&mut payload, handle);
        payload.put_u64(offset);
        packet::put_string(&mut payload, data);

        match self.roundtrip(packet::SSH_FXP_WRITE, id, &payload).await? {
            Response::Status { code: packet::SSH_FX_OK, .. } => Ok(()),
            Response::Status { message, .. } => Err(SftpError::Protocol(format!("remote write rejected: {}", message))),
            _ => Err(SftpError::Protocol("unexpected response to write".to_string())),
        }
    }

    /// Releases a server handle.
    pub async fn close(&mut self, handle: &[u8]) -> Result<()> {
        let id = self.next_request_id();
        let mut payload = BytesMut::new();
        payload.put_u32(id);
        packet::put_string(&mut payload, handle);

        match self.roundtrip(packet::SSH_FXP_CLOSE, id, &payload).await? {
            Response::Status { code: packet::SSH_FX_OK, .. } => Ok(()),
            Response::Status { message, .. } => Err(SftpError::Protocol(format!("remote close rejected: {}", message))),
            _ => Err(SftpError::Protocol("unexpected response to close".to_string())),
        }
    }

    /// Removes a remote file. Not idempotent, a second remove of the same
    /// path reports `NotFound`.
    pub async fn remove(&mut self, path: &str) -> Result<()> {
        let id = self.next_request_id();
        let mut payload = BytesMut::new();
        payload.put_u32(id);
        packet::put_string(&mut payload, path.as_bytes());

        match self.roundtrip(packet::SSH_FXP_REMOVE, id, &payload).await? {
            Response::Status { code: packet::SSH_FX_OK, .. } => Ok(()),
            Response::Status { code: packet::SSH_FX_NO_SUCH_FILE, .. } => Err(SftpError::NotFound(path.to_string())),
            Response::Status { message, .. } => Err(SftpError::Delete { path: path.to_string(), message }),
            _ => Err(SftpError::Protocol("unexpected response to remove".to_string())),
        }
    }

    fn next_request_id(&mut self) -> u32 {
        self.request_id = self.request_id.wrapping_add(1);
        self.request_id
    }

    /// One complete exchange, bounded by the round-trip timeout.
    async fn roundtrip(&mut self, packet_type: u8, id: u32, payload: &[u8]) -> Result<Response> {
        let limit = self.roundtrip_timeout;
        match timeout(limit, self.exchange(packet_type, id, payload)).await {
            Ok(result) => result,
            Err(_) => Err(SftpError::Timeout(limit)),
        }
    }

    async fn exchange(&mut self, packet_type: u8, id: u32, payload: &[u8]) -> Result<Response> {
        self.send(packet_type, payload).await?;
        loop {
            let (response_type, mut body) = self.recv().await?;
            let response_id = packet::get_u32(&mut body)?;
            if response_id != id {
                tracing::warn!("discarding response id {} while waiting for {}", response_id, id);
                continue;
            }
            return Response::decode(response_type, body);
        }
    }

    async fn send(&mut self, packet_type: u8, payload: &[u8]) -> Result<()> {
        let framed = packet::frame(packet_type, payload);
        self.stream
            .write_all(&framed)
            .await
            .map_err(|err| SftpError::Connection(err.to_string()))?;
        self.stream
            .flush()
            .await
            .map_err(|err| SftpError::Connection(err.to_string()))?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<(u8, Bytes)> {
        let mut length = [0u8; 4];
        self.stream
            .read_exact(&mut length)
            .await
            .map_err(|err| SftpError::Connection(err.to_string()))?;
        let length = u32::from_be_bytes(length) as usize;
        if length == 0 || length > packet::MAX_PACKET_SIZE {
            return Err(SftpError::Protocol(format!("invalid packet length {}", length)));
        }

        let mut body = vec![0u8; length];
        self.stream
            .read_exact(&mut body)
            .await
            .map_err(|err| SftpError::Connection(err.to_string()))?;
        let mut body = Bytes::from(body);
        let packet_type = packet::get_u8(&mut body)?;
        Ok((packet_type, body))
    }
}

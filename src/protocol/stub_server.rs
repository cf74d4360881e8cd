//! Scripted in-memory sftp server used by tests. Speaks just enough of
//! the version 3 wire protocol to exercise the channel end to end over a
//! `tokio::io::duplex` pair, with files held in a shared map.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use crate::protocol::file_attributes::FileAttributes;
use crate::protocol::packet;

pub type StubFiles = Arc<Mutex<HashMap<String, Vec<u8>>>>;

pub fn files(entries: &[(&str, &[u8])]) -> StubFiles {
    let map = entries
        .iter()
        .map(|(path, data)| (path.to_string(), data.to_vec()))
        .collect();
    Arc::new(Mutex::new(map))
}

pub fn spawn(stream: DuplexStream, files: StubFiles, report_mtime: bool) {
    tokio::spawn(serve(stream, files, report_mtime));
}

async fn serve(mut stream: DuplexStream, files: StubFiles, report_mtime: bool) {
    let Some((packet_type, _)) = read_packet(&mut stream).await else {
        return;
    };
    assert_eq!(packet_type, packet::SSH_FXP_INIT);
    let mut version = BytesMut::new();
    version.put_u32(packet::SFTP_VERSION);
    send(&mut stream, packet::SSH_FXP_VERSION, &version).await;

    let mut exhausted_dirs: HashSet<Bytes> = HashSet::new();

    while let Some((packet_type, mut body)) = read_packet(&mut stream).await {
        let id = body.get_u32();
        match packet_type {
            packet::SSH_FXP_REALPATH => {
                let path = canonical(&text(&mut body));
                send_name(&mut stream, id, &[(path.as_str(), &FileAttributes::default())]).await;
            }
            packet::SSH_FXP_OPENDIR => {
                let path = text(&mut body);
                if path == "/" {
                    send_handle(&mut stream, id, b"D/").await;
                } else {
                    send_status(&mut stream, id, packet::SSH_FX_NO_SUCH_FILE, "no such directory").await;
                }
            }
            packet::SSH_FXP_READDIR => {
                let handle = raw(&mut body);
                if exhausted_dirs.insert(handle.clone()) {
                    let listing = snapshot(&files, report_mtime);
                    if listing.is_empty() {
                        send_status(&mut stream, id, packet::SSH_FX_EOF, "end of listing").await;
                    } else {
                        let entries: Vec<(&str, &FileAttributes)> =
                            listing.iter().map(|(name, attrs)| (name.as_str(), attrs)).collect();
                        send_name(&mut stream, id, &entries).await;
                    }
                } else {
                    send_status(&mut stream, id, packet::SSH_FX_EOF, "end of listing").await;
                }
            }
            packet::SSH_FXP_STAT => {
                let path = canonical(&text(&mut body));
                let attrs = files.lock().unwrap().get(&path).map(|data| attributes(data, report_mtime));
                match attrs {
                    Some(attrs) => send_attrs(&mut stream, id, &attrs).await,
                    None => send_status(&mut stream, id, packet::SSH_FX_NO_SUCH_FILE, "no such file").await,
                }
            }
            packet::SSH_FXP_OPEN => {
                let path = canonical(&text(&mut body));
                let pflags = body.get_u32();
                let mut handle = b"F".to_vec();
                handle.extend_from_slice(path.as_bytes());
                if pflags & packet::SSH_FXF_WRITE != 0 {
                    files.lock().unwrap().insert(path, Vec::new());
                    send_handle(&mut stream, id, &handle).await;
                } else if files.lock().unwrap().contains_key(&path) {
                    send_handle(&mut stream, id, &handle).await;
                } else {
                    send_status(&mut stream, id, packet::SSH_FX_NO_SUCH_FILE, "no such file").await;
                }
            }
            packet::SSH_FXP_READ => {
                let path = handle_path(&raw(&mut body));
                let offset = body.get_u64() as usize;
                let length = body.get_u32() as usize;
                let data = files.lock().unwrap().get(&path).map(|data| {
                    let end = data.len().min(offset + length);
                    data.get(offset..end).unwrap_or(&[]).to_vec()
                });
                match data {
                    Some(chunk) if !chunk.is_empty() => send_data(&mut stream, id, &chunk).await,
                    Some(_) => send_status(&mut stream, id, packet::SSH_FX_EOF, "end of file").await,
                    None => send_status(&mut stream, id, packet::SSH_FX_FAILURE, "bad handle").await,
                }
            }
            packet::SSH_FXP_WRITE => {
                let path = handle_path(&raw(&mut body));
                let offset = body.get_u64() as usize;
                let data = raw(&mut body);
                // Guard must end before the awaited reply, serve is spawned.
                let accepted = {
                    let mut map = files.lock().unwrap();
                    match map.get_mut(&path) {
                        Some(file) => {
                            if file.len() < offset + data.len() {
                                file.resize(offset + data.len(), 0);
                            }
                            file[offset..offset + data.len()].copy_from_slice(&data);
                            true
                        }
                        None => false,
                    }
                };
                if accepted {
                    send_status(&mut stream, id, packet::SSH_FX_OK, "ok").await;
                } else {
                    send_status(&mut stream, id, packet::SSH_FX_FAILURE, "bad handle").await;
                }
            }
            packet::SSH_FXP_CLOSE => {
                send_status(&mut stream, id, packet::SSH_FX_OK, "ok").await;
            }
            packet::SSH_FXP_REMOVE => {
                let path = canonical(&text(&mut body));
                if files.lock().unwrap().remove(&path).is_some() {
                    send_status(&mut stream, id, packet::SSH_FX_OK, "ok").await;
                } else {
                    send_status(&mut stream, id, packet::SSH_FX_NO_SUCH_FILE, "no such file").await;
                }
            }
            _ => {
                send_status(&mut stream, id, packet::SSH_FX_OP_UNSUPPORTED, "unsupported").await;
            }
        }
    }
}

fn snapshot(files: &StubFiles, report_mtime: bool) -> Vec<(String, FileAttributes)> {
    let map = files.lock().unwrap();
    let mut listing: Vec<(String, FileAttributes)> = map
        .iter()
        .map(|(path, data)| (path.trim_start_matches('/').to_string(), attributes(data, report_mtime)))
        .collect();
    listing.sort_by(|a, b| a.0.cmp(&b.0));
    listing
}

fn attributes(data: &[u8], report_mtime: bool) -> FileAttributes {
    FileAttributes {
        size: Some(data.len() as u64),
        permissions: Some(0o100644),
        atime: report_mtime.then_some(1_700_000_000),
        mtime: report_mtime.then_some(1_700_000_000),
        ..FileAttributes::default()
    }
}

fn canonical(path: &str) -> String {
    let trimmed = path.trim_start_matches("./");
    match trimmed {
        "" | "." => "/".to_string(),
        path if path.starts_with('/') => path.to_string(),
        path => format!("/{}", path),
    }
}

fn handle_path(handle: &[u8]) -> String {
    String::from_utf8_lossy(&handle[1..]).into_owned()
}

fn text(body: &mut Bytes) -> String {
    String::from_utf8_lossy(&raw(body)).into_owned()
}

fn raw(body: &mut Bytes) -> Bytes {
    let length = body.get_u32() as usize;
    body.split_to(length)
}

pub(crate) async fn read_packet(stream: &mut DuplexStream) -> Option<(u8, Bytes)> {
    let mut length = [0u8; 4];
    stream.read_exact(&mut length).await.ok()?;
    let mut body = vec![0u8; u32::from_be_bytes(length) as usize];
    stream.read_exact(&mut body).await.ok()?;
    let mut body = Bytes::from(body);
    let packet_type = body.get_u8();
    Some((packet_type, body))
}

pub(crate) async fn send(stream: &mut DuplexStream, packet_type: u8, payload: &[u8]) {
    let framed = packet::frame(packet_type, payload);
    stream.write_all(&framed).await.unwrap();
    stream.flush().await.unwrap();
}

async fn send_status(stream: &mut DuplexStream, id: u32, code: u32, message: &str) {
    let mut payload = BytesMut::new();
    payload.put_u32(id);
    payload.put_u32(code);
    packet::put_string(&mut payload, message.as_bytes());
    packet::put_string(&mut payload, b"en");
    send(stream, packet::SSH_FXP_STATUS, &payload).await;
}

async fn send_handle(stream: &mut DuplexStream, id: u32, handle: &[u8]) {
    let mut payload = BytesMut::new();
    payload.put_u32(id);
    packet::put_string(&mut payload, handle);
    send(stream, packet::SSH_FXP_HANDLE, &payload).await;
}

async fn send_attrs(stream: &mut DuplexStream, id: u32, attrs: &FileAttributes) {
    let mut payload = BytesMut::new();
    payload.put_u32(id);
    attrs.encode(&mut payload);
    send(stream, packet::SSH_FXP_ATTRS, &payload).await;
}

async fn send_data(stream: &mut DuplexStream, id: u32, data: &[u8]) {
    let mut payload = BytesMut::new();
    payload.put_u32(id);
    packet::put_string(&mut payload, data);
    send(stream, packet::SSH_FXP_DATA, &payload).await;
}

pub(crate) async fn send_name(stream: &mut DuplexStream, id: u32, entries: &[(&str, &FileAttributes)]) {
    let mut payload = BytesMut::new();
    payload.put_u32(id);
    payload.put_u32(entries.len() as u32);
    for (name, attrs) in entries {
        packet::put_string(&mut payload, name.as_bytes());
        packet::put_string(&mut payload, name.as_bytes());
        attrs.encode(&mut payload);
    }
    send(stream, packet::SSH_FXP_NAME, &payload).await;
}

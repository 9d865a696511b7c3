//! Link transport over TCP: the phone listens, the watch dials and redials. One live
//! connection at a time; frames are length-prefixed bincode `Frame`s.
//!
//! Activation is local: the link reports `Activated` once asked to activate. Reachability
//! follows the connection while activated.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use pairlink_core::integrity;
use pairlink_core::wire::{decode_body, encode_frame, frame_len, Frame};
use pairlink_core::{ActivationState, PeerMessage, Role};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::actor::HostEvent;

const LEN_SIZE: usize = 4;

/// Requests from the actor to the link.
#[derive(Debug)]
pub enum LinkCommand {
    Activate,
    /// Simulate the platform deactivating the link (e.g. the paired peer switched).
    Deactivate,
    Send {
        id: u64,
        message: PeerMessage,
        expects_reply: bool,
    },
    Reply {
        id: u64,
        message: PeerMessage,
    },
    TransferFile {
        path: PathBuf,
        metadata: PeerMessage,
    },
}

/// What the link reports back to the actor.
#[derive(Debug)]
pub enum TransportEvent {
    ActivationCompleted(ActivationState),
    Reachability(bool),
    PeerInstalled(bool),
    Deactivated,
    Delivered(u64),
    SendFailed(u64, String),
    Message {
        id: u64,
        expects_reply: bool,
        payload: PeerMessage,
    },
    Reply {
        id: u64,
        payload: PeerMessage,
    },
    FileReceived {
        path: PathBuf,
        metadata: PeerMessage,
    },
    FileFinished {
        path: PathBuf,
        metadata: PeerMessage,
        error: Option<String>,
    },
}

/// Link settings taken from the host config.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub role: Role,
    pub peer_addr: SocketAddr,
    pub reconnect_interval: Duration,
    /// Where received files are stored.
    pub inbox: PathBuf,
}

/// One encoded frame for the writer task.
enum Outgoing {
    Message { id: u64, bytes: Vec<u8> },
    File { transfer_id: [u8; 16], bytes: Vec<u8> },
    Control(Vec<u8>),
}

/// Outbound transfers waiting for the receiver's `FileAck`.
type Transfers = Arc<Mutex<HashMap<[u8; 16], (PathBuf, PeerMessage)>>>;

struct Connection {
    generation: u64,
    writer_tx: mpsc::UnboundedSender<Outgoing>,
    reader: JoinHandle<()>,
}

/// Capability check for the phone side: the listen port must be bindable. The watch only dials.
pub async fn bind(role: Role, listen_port: u16) -> std::io::Result<Option<TcpListener>> {
    match role {
        Role::Phone => Ok(Some(TcpListener::bind(("0.0.0.0", listen_port)).await?)),
        Role::Watch => Ok(None),
    }
}

/// Run the link until the command channel closes.
pub async fn run_link(
    config: LinkConfig,
    listener: Option<TcpListener>,
    events: mpsc::UnboundedSender<HostEvent>,
    mut commands: mpsc::UnboundedReceiver<LinkCommand>,
) -> std::io::Result<()> {
    tokio::fs::create_dir_all(&config.inbox).await?;
    info!(role = %config.role, inbox = %config.inbox.display(), "link running");
    let (conn_tx, mut conn_rx) = mpsc::unbounded_channel::<TcpStream>();
    let (closed_tx, mut closed_rx) = mpsc::unbounded_channel::<u64>();
    let (redial_tx, redial_rx) = mpsc::unbounded_channel::<()>();

    match listener {
        Some(listener) => {
            tokio::spawn(accept_loop(listener, conn_tx));
        }
        None => {
            tokio::spawn(dial_loop(
                config.peer_addr,
                config.reconnect_interval,
                conn_tx,
                redial_rx,
            ));
        }
    }

    let post = |ev: TransportEvent| {
        let _ = events.send(HostEvent::Transport(ev));
    };
    let transfers: Transfers = Arc::new(Mutex::new(HashMap::new()));
    let mut current: Option<Connection> = None;
    let mut generation: u64 = 0;
    let mut activated = false;
    let mut peer_seen = false;

    loop {
        tokio::select! {
            cmd = commands.recv() => {
                let Some(cmd) = cmd else { break };
                match cmd {
                    LinkCommand::Activate => {
                        activated = true;
                        post(TransportEvent::ActivationCompleted(ActivationState::Activated));
                        if current.is_some() {
                            post(TransportEvent::Reachability(true));
                        }
                    }
                    LinkCommand::Deactivate => {
                        if activated {
                            activated = false;
                            post(TransportEvent::Deactivated);
                        }
                    }
                    LinkCommand::Send { id, message, expects_reply } => {
                        let frame = Frame::Message { id, expects_reply, payload: message };
                        match (encode_frame(&frame), current.as_ref()) {
                            (Ok(bytes), Some(conn)) if activated => {
                                if conn.writer_tx.send(Outgoing::Message { id, bytes }).is_err() {
                                    post(TransportEvent::SendFailed(id, "connection closed".into()));
                                }
                            }
                            (Ok(_), _) => post(TransportEvent::SendFailed(id, "not connected".into())),
                            (Err(e), _) => post(TransportEvent::SendFailed(id, e.to_string())),
                        }
                    }
                    LinkCommand::Reply { id, message } => {
                        let frame = Frame::Reply { id, payload: message };
                        match (encode_frame(&frame), current.as_ref()) {
                            (Ok(bytes), Some(conn)) => {
                                let _ = conn.writer_tx.send(Outgoing::Control(bytes));
                            }
                            (Ok(_), None) => warn!(id, "reply dropped, not connected"),
                            (Err(e), _) => warn!(id, error = %e, "reply encode failed"),
                        }
                    }
                    LinkCommand::TransferFile { path, metadata } => {
                        let result = match current.as_ref() {
                            Some(conn) if activated => {
                                start_transfer(&path, metadata.clone(), conn, &transfers).await
                            }
                            _ => Err("not connected".to_string()),
                        };
                        if let Err(error) = result {
                            post(TransportEvent::FileFinished { path, metadata, error: Some(error) });
                        }
                    }
                }
            }
            Some(stream) = conn_rx.recv() => {
                generation += 1;
                if let Some(old) = current.take() {
                    info!(old = old.generation, "replacing connection");
                    old.reader.abort();
                    fail_transfers(&transfers, &post, "connection replaced").await;
                }
                let (reader, writer) = stream.into_split();
                let (writer_tx, writer_rx) = mpsc::unbounded_channel();
                tokio::spawn(write_loop(writer, writer_rx, events.clone(), transfers.clone()));
                let reader = tokio::spawn(read_loop(
                    reader,
                    generation,
                    writer_tx.clone(),
                    events.clone(),
                    transfers.clone(),
                    config.inbox.clone(),
                    closed_tx.clone(),
                ));
                current = Some(Connection { generation, writer_tx, reader });
                info!(generation, "peer connected");
                if !peer_seen {
                    peer_seen = true;
                    post(TransportEvent::PeerInstalled(true));
                }
                if activated {
                    post(TransportEvent::Reachability(true));
                }
            }
            Some(closed) = closed_rx.recv() => {
                if current.as_ref().map(|c| c.generation) != Some(closed) {
                    continue;
                }
                current = None;
                info!(generation = closed, "peer disconnected");
                fail_transfers(&transfers, &post, "connection closed").await;
                if activated {
                    post(TransportEvent::Reachability(false));
                }
                let _ = redial_tx.send(());
            }
        }
    }
    Ok(())
}

async fn accept_loop(listener: TcpListener, conn_tx: mpsc::UnboundedSender<TcpStream>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!(%addr, "accepted peer");
                if conn_tx.send(stream).is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

async fn dial_loop(
    addr: SocketAddr,
    interval: Duration,
    conn_tx: mpsc::UnboundedSender<TcpStream>,
    mut redial_rx: mpsc::UnboundedReceiver<()>,
) {
    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                info!(%addr, "connected to peer");
                if conn_tx.send(stream).is_err() {
                    break;
                }
                if redial_rx.recv().await.is_none() {
                    break;
                }
            }
            Err(e) => {
                debug!(%addr, error = %e, "dial failed");
                tokio::time::sleep(interval).await;
            }
        }
    }
}

async fn start_transfer(
    path: &Path,
    metadata: PeerMessage,
    conn: &Connection,
    transfers: &Transfers,
) -> Result<(), String> {
    let data = tokio::fs::read(path).await.map_err(|e| e.to_string())?;
    let transfer_id = *uuid::Uuid::new_v4().as_bytes();
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    let frame = Frame::File {
        transfer_id,
        name,
        metadata: metadata.clone(),
        digest: integrity::digest(&data),
        data,
    };
    let bytes = encode_frame(&frame).map_err(|e| e.to_string())?;
    transfers
        .lock()
        .await
        .insert(transfer_id, (path.to_path_buf(), metadata));
    if conn
        .writer_tx
        .send(Outgoing::File { transfer_id, bytes })
        .is_err()
    {
        transfers.lock().await.remove(&transfer_id);
        return Err("connection closed".into());
    }
    info!(path = %path.display(), "file transfer started");
    Ok(())
}

async fn fail_transfers(transfers: &Transfers, post: &impl Fn(TransportEvent), reason: &str) {
    let pending: Vec<_> = transfers.lock().await.drain().collect();
    for (_, (path, metadata)) in pending {
        post(TransportEvent::FileFinished {
            path,
            metadata,
            error: Some(reason.to_string()),
        });
    }
}

/// Writes frames in order. After the first write error every later frame fails too, until
/// the connection is dropped and the channel closes.
async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Outgoing>,
    events: mpsc::UnboundedSender<HostEvent>,
    transfers: Transfers,
) {
    let mut broken: Option<String> = None;
    while let Some(out) = rx.recv().await {
        let bytes = match &out {
            Outgoing::Message { bytes, .. }
            | Outgoing::File { bytes, .. }
            | Outgoing::Control(bytes) => bytes,
        };
        let result = match &broken {
            Some(e) => Err(e.clone()),
            None => write_frame(&mut writer, bytes).await.map_err(|e| e.to_string()),
        };
        if let Err(e) = &result {
            if broken.is_none() {
                warn!(error = %e, "link write failed");
                broken = Some(e.clone());
            }
        }
        let event = match (out, result) {
            (Outgoing::Message { id, .. }, Ok(())) => Some(TransportEvent::Delivered(id)),
            (Outgoing::Message { id, .. }, Err(e)) => Some(TransportEvent::SendFailed(id, e)),
            (Outgoing::File { transfer_id, .. }, Err(e)) => transfers
                .lock()
                .await
                .remove(&transfer_id)
                .map(|(path, metadata)| TransportEvent::FileFinished {
                    path,
                    metadata,
                    error: Some(e),
                }),
            (Outgoing::File { .. }, Ok(())) | (Outgoing::Control(_), _) => None,
        };
        if let Some(ev) = event {
            let _ = events.send(HostEvent::Transport(ev));
        }
    }
}

async fn write_frame(writer: &mut OwnedWriteHalf, bytes: &[u8]) -> std::io::Result<()> {
    writer.write_all(bytes).await?;
    writer.flush().await
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    generation: u64,
    writer_tx: mpsc::UnboundedSender<Outgoing>,
    events: mpsc::UnboundedSender<HostEvent>,
    transfers: Transfers,
    inbox: PathBuf,
    closed_tx: mpsc::UnboundedSender<u64>,
) {
    let post = |ev: TransportEvent| {
        let _ = events.send(HostEvent::Transport(ev));
    };
    loop {
        let mut len_buf = [0u8; LEN_SIZE];
        if reader.read_exact(&mut len_buf).await.is_err() {
            break;
        }
        let len = match frame_len(len_buf) {
            Ok(len) => len,
            Err(e) => {
                warn!(error = %e, "bad frame length, closing");
                break;
            }
        };
        let mut body = vec![0u8; len];
        if reader.read_exact(&mut body).await.is_err() {
            break;
        }
        let frame = match decode_body(&body) {
            Ok(f) => f,
            Err(e) => {
                warn!(error = %e, "undecodable frame, closing");
                break;
            }
        };
        match frame {
            Frame::Message {
                id,
                expects_reply,
                payload,
            } => post(TransportEvent::Message {
                id,
                expects_reply,
                payload,
            }),
            Frame::Reply { id, payload } => post(TransportEvent::Reply { id, payload }),
            Frame::File {
                transfer_id,
                name,
                metadata,
                digest,
                data,
            } => {
                let error = match store_file(&inbox, &transfer_id, &name, &digest, &data).await {
                    Ok(path) => {
                        post(TransportEvent::FileReceived { path, metadata });
                        None
                    }
                    Err(e) => {
                        warn!(%name, error = %e, "rejected incoming file");
                        Some(e)
                    }
                };
                let ack = Frame::FileAck { transfer_id, error };
                if let Ok(bytes) = encode_frame(&ack) {
                    let _ = writer_tx.send(Outgoing::Control(bytes));
                }
            }
            Frame::FileAck { transfer_id, error } => {
                if let Some((path, metadata)) = transfers.lock().await.remove(&transfer_id) {
                    post(TransportEvent::FileFinished {
                        path,
                        metadata,
                        error,
                    });
                }
            }
        }
    }
    let _ = closed_tx.send(generation);
}

/// Verify and store an incoming file as `<inbox>/<transfer id>-<name>`.
async fn store_file(
    inbox: &Path,
    transfer_id: &[u8; 16],
    name: &str,
    digest: &[u8; 32],
    data: &[u8],
) -> Result<PathBuf, String> {
    if !integrity::verify(data, digest) {
        return Err("digest mismatch".into());
    }
    let id = uuid::Uuid::from_bytes(*transfer_id);
    let path = inbox.join(format!("{}-{}", id.simple(), sanitize(name)));
    tokio::fs::write(&path, data)
        .await
        .map_err(|e| e.to_string())?;
    Ok(path)
}

/// Keep only the final path component's safe characters.
fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    match cleaned.trim_start_matches('.') {
        "" => "file".to_string(),
        s => s.to_string(),
    }
}

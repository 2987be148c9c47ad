// Socket reader/writer task
//
// A single task owns the TCP stream: it writes outgoing commands, correlates
// replies to them by packet id, and forwards composite event packets to the
// session's dispatcher unprocessed.

use crate::events::{parse_event_packet, EventSet};
use crate::protocol::{CommandPacket, JdwpError, JdwpResult, ReplyPacket, HEADER_SIZE, REPLY_FLAG};
use bytes::BytesMut;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, error, info, warn};

/// Maximum allowed JDWP packet size (10MB), so a corrupt length field cannot
/// exhaust memory.
const MAX_PACKET_SIZE: usize = 10 * 1024 * 1024;

/// Request to send a command and get a reply
pub struct CommandRequest {
    pub packet: CommandPacket,
    pub reply_tx: oneshot::Sender<JdwpResult<ReplyPacket>>,
}

/// Handle to the socket task for sending commands and receiving events
#[derive(Clone, Debug)]
pub struct EventLoopHandle {
    command_tx: mpsc::Sender<CommandRequest>,
    event_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<EventSet>>>,
    shutdown: Arc<Notify>,
}

impl EventLoopHandle {
    /// Send a command and wait for its reply
    pub async fn send_command(&self, packet: CommandPacket) -> JdwpResult<ReplyPacket> {
        let (reply_tx, reply_rx) = oneshot::channel();

        let request = CommandRequest { packet, reply_tx };

        self.command_tx
            .send(request)
            .await
            .map_err(|_| JdwpError::ConnectionClosed)?;

        reply_rx.await.map_err(|_| JdwpError::ConnectionClosed)?
    }

    /// Wait for the next event set. Returns None once the connection is gone.
    pub async fn recv_event(&self) -> Option<EventSet> {
        let mut rx = self.event_rx.lock().await;
        rx.recv().await
    }

    /// Ask the socket task to stop and drop the connection.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }
}

/// Spawn the socket task for an established, handshaken stream.
pub fn spawn_event_loop(reader: OwnedReadHalf, writer: OwnedWriteHalf) -> EventLoopHandle {
    let (command_tx, command_rx) = mpsc::channel(32);
    // Breakpoint events must not be dropped under load, so the event buffer
    // is larger than the command buffer.
    let (event_tx, event_rx) = mpsc::channel(256);
    let shutdown = Arc::new(Notify::new());

    tokio::spawn(event_loop_task(
        reader,
        writer,
        command_rx,
        event_tx,
        shutdown.clone(),
    ));

    EventLoopHandle {
        command_tx,
        event_rx: Arc::new(tokio::sync::Mutex::new(event_rx)),
        shutdown,
    }
}

async fn event_loop_task(
    mut reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    mut command_rx: mpsc::Receiver<CommandRequest>,
    event_tx: mpsc::Sender<EventSet>,
    shutdown: Arc<Notify>,
) {
    debug!("socket task started");

    let mut pending_replies: HashMap<u32, oneshot::Sender<JdwpResult<ReplyPacket>>> =
        HashMap::new();

    loop {
        tokio::select! {
            _ = shutdown.notified() => {
                debug!("socket task shutdown requested");
                break;
            }

            cmd = command_rx.recv() => {
                let Some(cmd) = cmd else {
                    // all connection handles dropped
                    break;
                };
                let packet_id = cmd.packet.id;
                debug!("sending command id={}", packet_id);

                let encoded = cmd.packet.encode();
                if let Err(e) = writer.write_all(&encoded).await {
                    error!("failed to write command: {}", e);
                    cmd.reply_tx.send(Err(JdwpError::Io(e))).ok();
                    continue;
                }
                if let Err(e) = writer.flush().await {
                    error!("failed to flush command: {}", e);
                    cmd.reply_tx.send(Err(JdwpError::Io(e))).ok();
                    continue;
                }

                pending_replies.insert(packet_id, cmd.reply_tx);
            }

            result = read_packet(&mut reader) => {
                match result {
                    Ok((is_reply, packet_id, data)) => {
                        if is_reply {
                            debug!("received reply id={}", packet_id);
                            if let Some(tx) = pending_replies.remove(&packet_id) {
                                tx.send(ReplyPacket::decode(&data)).ok();
                            } else {
                                warn!("received reply for unknown command id={}", packet_id);
                            }
                        } else {
                            // composite event packet, payload after the header
                            match parse_event_packet(&data[HEADER_SIZE..]) {
                                Ok(event_set) => {
                                    debug!(
                                        "received event set: {} events, suspend_policy={}",
                                        event_set.events.len(),
                                        event_set.suspend_policy
                                    );
                                    if event_tx.send(event_set).await.is_err() {
                                        warn!("event receiver dropped, stopping socket task");
                                        break;
                                    }
                                }
                                Err(e) => {
                                    // one bad event packet must not kill the session
                                    warn!("failed to parse event packet: {}", e);
                                }
                            }
                        }
                    }
                    Err(JdwpError::ConnectionClosed) => {
                        info!("remote VM closed the connection");
                        break;
                    }
                    Err(e) => {
                        error!("failed to read packet: {}", e);
                        break;
                    }
                }
            }
        }
    }

    // unblock any callers still waiting for a reply
    for (_, tx) in pending_replies {
        tx.send(Err(JdwpError::ConnectionClosed)).ok();
    }

    debug!("socket task exited");
}

/// Read one packet and report whether it is a reply or an event.
async fn read_packet(reader: &mut OwnedReadHalf) -> JdwpResult<(bool, u32, Vec<u8>)> {
    let mut header = BytesMut::with_capacity(HEADER_SIZE);
    header.resize(HEADER_SIZE, 0);

    reader.read_exact(&mut header).await.map_err(map_read_err)?;

    let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let packet_id = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    let flags = header[8];

    if length < HEADER_SIZE {
        return Err(JdwpError::Protocol(format!(
            "invalid packet length: {}",
            length
        )));
    }
    if length > MAX_PACKET_SIZE {
        return Err(JdwpError::Protocol(format!(
            "packet too large: {} bytes (max: {} bytes)",
            length, MAX_PACKET_SIZE
        )));
    }

    let data_len = length - HEADER_SIZE;
    let mut full_packet = header.to_vec();

    if data_len > 0 {
        let mut data = vec![0u8; data_len];
        reader.read_exact(&mut data).await.map_err(map_read_err)?;
        full_packet.extend_from_slice(&data);
    }

    let is_reply = flags == REPLY_FLAG;

    Ok((is_reply, packet_id, full_packet))
}

fn map_read_err(e: std::io::Error) -> JdwpError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        JdwpError::ConnectionClosed
    } else {
        JdwpError::Io(e)
    }
}

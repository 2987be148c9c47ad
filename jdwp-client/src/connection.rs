// JDWP connection management
//
// Handles the TCP connect, handshake, and socket task startup. The handle is
// cheap to clone; all clones share one socket task and one id counter.

use crate::eventloop::{spawn_event_loop, EventLoopHandle};
use crate::events::EventSet;
use crate::protocol::*;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct JdwpConnection {
    event_loop: EventLoopHandle,
    next_id: Arc<AtomicU32>,
}

impl JdwpConnection {
    /// Connect to a VM's debug port and perform the JDWP handshake.
    ///
    /// `timeout` bounds the connect and the handshake individually; an
    /// unresponsive remote end cannot stall the caller past it.
    pub async fn connect(host: &str, port: u16, timeout: Duration) -> JdwpResult<Self> {
        info!("connecting to JDWP at {}:{}", host, port);

        let mut stream = time::timeout(timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| JdwpError::Protocol(format!("connect timed out after {:?}", timeout)))??;

        time::timeout(timeout, Self::handshake(&mut stream))
            .await
            .map_err(|_| {
                JdwpError::Protocol(format!("handshake timed out after {:?}", timeout))
            })??;

        let (reader, writer) = stream.into_split();
        let event_loop = spawn_event_loop(reader, writer);

        Ok(Self {
            event_loop,
            next_id: Arc::new(AtomicU32::new(1)),
        })
    }

    async fn handshake(stream: &mut TcpStream) -> JdwpResult<()> {
        debug!("performing JDWP handshake");

        stream.write_all(JDWP_HANDSHAKE).await?;
        stream.flush().await?;

        let mut buf = vec![0u8; JDWP_HANDSHAKE.len()];
        stream.read_exact(&mut buf).await?;

        if buf != JDWP_HANDSHAKE {
            warn!("invalid handshake response: {:?}", buf);
            return Err(JdwpError::InvalidHandshake);
        }

        debug!("JDWP handshake successful");
        Ok(())
    }

    /// Send a command and wait for its reply.
    pub async fn send_command(&self, packet: CommandPacket) -> JdwpResult<ReplyPacket> {
        debug!(
            "sending command packet id={} set={} cmd={}",
            packet.id, packet.command_set, packet.command
        );
        self.event_loop.send_command(packet).await
    }

    /// Wait for the next event set. None once the connection is gone.
    pub async fn recv_event(&self) -> Option<EventSet> {
        self.event_loop.recv_event().await
    }

    /// Tear down the socket task and the underlying TCP stream.
    pub fn shutdown(&self) {
        self.event_loop.shutdown();
    }

    /// Next packet id. Monotonic across all clones of this connection.
    pub fn next_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }
}

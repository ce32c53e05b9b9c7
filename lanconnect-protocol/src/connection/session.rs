//! Session Loop
//!
//! After the TLS upgrade the stream is split. A reader task decodes packets
//! into a bounded queue; everything else happens in one loop that owns the
//! write half, so writes are totally ordered and never interleave. Every
//! write races the session's cancellation, so a peer that stops reading
//! cannot hold the loop past a supersede or shutdown.
//!
//! The loop multiplexes:
//!
//! - cancellation (shutdown or a superseding attempt)
//! - commands from the server ([`SessionCommand`])
//! - inbound packets, dispatched to the plugin router
//! - unsolicited packets from plugins (the outbound queue)

use super::events::{CloseReason, SessionState};
use super::registry::{Attempt, SessionCommand};
use super::SessionContext;
use crate::pairing::PairBody;
use crate::packet::PACKET_TYPE_PAIR;
use crate::plugins::{PluginContext, PluginRouter};
use crate::transport::{write_packet, PacketReader};
use crate::{Packet, ProtocolError, Result};
use tokio::io::{AsyncRead, AsyncWrite, WriteHalf};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

/// Inbound queue capacity
const INBOUND_CAPACITY: usize = 32;
/// Plugin outbound queue capacity
const OUTBOUND_CAPACITY: usize = 64;
/// Command queue capacity
const COMMAND_CAPACITY: usize = 16;

/// Split TLS stream: inbound queue fed by the reader task, plus the write half
pub(crate) struct SessionIo<S> {
    inbound: mpsc::Receiver<Result<Packet>>,
    writer: WriteHalf<S>,
    /// Aborts a write stuck on a full socket
    cancel: CancellationToken,
    /// Stops the reader task when the session goes away
    _reader: DropGuard,
}

impl<S> SessionIo<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Split `stream` and spawn its reader task
    pub(crate) fn start(stream: S, cancel: &CancellationToken) -> Self {
        let (read_half, writer) = tokio::io::split(stream);
        let (tx, inbound) = mpsc::channel(INBOUND_CAPACITY);
        let reader_cancel = cancel.child_token();

        tokio::spawn(read_packets(read_half, tx, reader_cancel.clone()));

        Self {
            inbound,
            writer,
            cancel: cancel.clone(),
            _reader: reader_cancel.drop_guard(),
        }
    }

    /// Next inbound packet
    ///
    /// A clean EOF is reported as [`ProtocolError::ConnectionClosed`].
    pub(crate) async fn recv(&mut self) -> Result<Packet> {
        match self.inbound.recv().await {
            Some(result) => result,
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    /// Write one packet, giving up once the session is cancelled
    pub(crate) async fn send(&mut self, packet: &Packet) -> Result<()> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ProtocolError::Cancelled(format!(
                "writing {}",
                packet.packet_type()
            ))),
            result = write_packet(&mut self.writer, packet) => result,
        }
    }
}

async fn read_packets<R>(
    read_half: R,
    tx: mpsc::Sender<Result<Packet>>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = PacketReader::new(read_half);

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = reader.next_packet() => next,
        };

        match next {
            Ok(Some(packet)) => {
                if tx.send(Ok(packet)).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                break;
            }
        }
    }
}

/// Attach plugins and run the loop until the session ends
pub(crate) async fn run<S>(
    ctx: &SessionContext,
    attempt: &Attempt,
    mut io: SessionIo<S>,
) -> Result<CloseReason>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let device_id = attempt.device_id.as_str();
    let cancel = attempt.cancel.child_token();
    // Plugin watchers stop with the loop, however it exits
    let _plugins_guard = cancel.clone().drop_guard();

    let (outbound_tx, mut outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
    let router = ctx.plugins.create_router(&PluginContext {
        device_id: device_id.to_string(),
        outbound: outbound_tx,
        cancel: cancel.clone(),
    })?;

    let (command_tx, mut commands) = mpsc::channel(COMMAND_CAPACITY);
    if !ctx.registry.activate(attempt, command_tx) {
        debug!("Session with {} superseded before activation", device_id);
        return Ok(CloseReason::Cancelled);
    }

    ctx.set_state(device_id, SessionState::Active);
    info!("Session with {} active", device_id);
    router.start().await?;

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => return Ok(CloseReason::Cancelled),

            command = commands.recv() => match command {
                Some(SessionCommand::Send(packet)) => io.send(&packet).await?,
                Some(SessionCommand::Unpair) => {
                    io.send(&Packet::from_body(&PairBody::reject())?).await?;
                    info!("Unpaired from {}", device_id);
                    return Ok(CloseReason::Unpaired);
                }
                None => return Ok(CloseReason::Cancelled),
            },

            inbound = io.inbound.recv() => {
                let packet = match inbound {
                    Some(result) => result?,
                    None => return Ok(CloseReason::PeerClosed),
                };
                if let Some(reason) = handle_inbound(ctx, device_id, &router, &mut io, packet).await? {
                    return Ok(reason);
                }
            }

            Some(packet) = outbound_rx.recv() => io.send(&packet).await?,
        }
    }
}

async fn handle_inbound<S>(
    ctx: &SessionContext,
    device_id: &str,
    router: &PluginRouter,
    io: &mut SessionIo<S>,
    packet: Packet,
) -> Result<Option<CloseReason>>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    if packet.is_type(PACKET_TYPE_PAIR) {
        let body = packet.body_as::<PairBody>()?;
        if body.pair {
            debug!("Ignoring pair request from already paired {}", device_id);
            return Ok(None);
        }

        ctx.trust.remove(device_id).await?;
        info!("{} unpaired", device_id);
        return Ok(Some(CloseReason::Unpaired));
    }

    match router.dispatch(&packet).await {
        Ok(Some(reply)) => io.send(&reply).await?,
        Ok(None) => {}
        Err(e) => {
            warn!("Closing session with {} after plugin failure", device_id);
            return Err(e);
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncWriteExt};

    #[tokio::test]
    async fn test_io_reads_in_order_and_reports_eof() {
        let (near, mut far) = duplex(4096);
        let cancel = CancellationToken::new();
        let mut io = SessionIo::start(near, &cancel);

        far.write_all(b"{\"id\":1,\"type\":\"kdeconnect.ping\",\"body\":{}}\n")
            .await
            .unwrap();
        far.write_all(b"{\"id\":2,\"type\":\"kdeconnect.ping\",\"body\":{}}\n")
            .await
            .unwrap();
        drop(far);

        assert_eq!(io.recv().await.unwrap().id, 1);
        assert_eq!(io.recv().await.unwrap().id, 2);
        assert!(matches!(io.recv().await, Err(ProtocolError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_send_gives_up_on_cancel_when_peer_stops_reading() {
        let (near, _far) = duplex(64);
        let cancel = CancellationToken::new();
        let mut io = SessionIo::start(near, &cancel);

        let packet = Packet::from_body(&crate::plugins::ping::PingBody::with_message(
            "x".repeat(4096),
        ))
        .unwrap();

        // Nobody drains `_far`, so the write parks on the full pipe
        let send = io.send(&packet);
        tokio::pin!(send);
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(50), &mut send)
                .await
                .is_err()
        );

        cancel.cancel();
        assert!(matches!(send.await, Err(ProtocolError::Cancelled(_))));
    }

    #[tokio::test]
    async fn test_io_forwards_decode_errors() {
        let (near, mut far) = duplex(4096);
        let mut io = SessionIo::start(near, &CancellationToken::new());

        far.write_all(b"garbage\n").await.unwrap();
        assert!(matches!(io.recv().await, Err(ProtocolError::InvalidPacket(_))));
    }
}

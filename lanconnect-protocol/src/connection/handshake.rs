//! Session Establishment
//!
//! ## Outbound (we dial, after a discovery announcement)
//!
//! 1. Dial the address the peer announced from, on its advertised port
//! 2. Write our identity line in plaintext
//! 3. TLS handshake in the **server** role
//!
//! ## Inbound (the peer dials us)
//!
//! 1. Read the peer's identity line in plaintext
//! 2. TLS handshake in the **client** role
//!
//! An inbound attempt stays detached from the session registry until the
//! peer presents the pinned certificate or asks to pair. Only then does it
//! supersede an existing session for the same device id.
//!
//! ## Trust decision (both directions)
//!
//! The certificate presented in this handshake is compared byte for byte
//! with the pinned one. A mismatch drops the connection without another
//! byte written. An unknown device must send `kdeconnect.pair` with
//! `pair: true`; the request goes to the [`PairingBroker`] and only an
//! approval pins the certificate.
//!
//! [`PairingBroker`]: crate::pairing::PairingBroker

use super::events::{CloseReason, SessionState};
use super::registry::Attempt;
use super::session::{self, SessionIo};
use super::SessionContext;
use crate::packet::PACKET_TYPE_PAIR;
use crate::pairing::{PairBody, PairingDecision};
use crate::transport::{peer_certificate, TcpConnection};
use crate::{CertificateInfo, DeviceInfo, Packet, ProtocolError, Result};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_openssl::SslStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Dial `peer` at `addr` and run the session to completion
pub async fn establish_outbound(
    ctx: &SessionContext,
    peer: DeviceInfo,
    addr: SocketAddr,
    attempt: Attempt,
) -> CloseReason {
    let result = dial(ctx, &peer, addr, &attempt).await;
    finish(ctx, &attempt, result)
}

/// Run the session for a connection the peer dialed
///
/// Fails only if the peer's identity line could not be read; everything
/// after that is reported as a [`CloseReason`].
pub async fn establish_inbound(
    ctx: &SessionContext,
    stream: TcpStream,
    remote_addr: SocketAddr,
    parent: &CancellationToken,
) -> Result<CloseReason> {
    let mut conn = TcpConnection::from_stream(stream, remote_addr);
    let peer = conn.receive_identity(ctx.timeouts.handshake, parent).await?;

    if peer.device_id == ctx.identity.device_id {
        return Err(ProtocolError::UnexpectedPacket(format!(
            "{} connected with our own device id",
            remote_addr
        )));
    }

    let attempt = ctx.registry.detached(&peer.device_id, parent);
    ctx.set_state(&attempt.device_id, SessionState::IdentityExchanged);

    let result = async {
        let stream = ctx
            .tls
            .connect(conn.into_stream(), ctx.timeouts.handshake, &attempt.cancel)
            .await?;
        ctx.set_state(&attempt.device_id, SessionState::TlsUpgraded);
        secure(ctx, &peer, stream, &attempt).await
    }
    .await;

    Ok(finish(ctx, &attempt, result))
}

async fn dial(
    ctx: &SessionContext,
    peer: &DeviceInfo,
    addr: SocketAddr,
    attempt: &Attempt,
) -> Result<CloseReason> {
    ctx.set_state(&attempt.device_id, SessionState::Connecting);
    let mut conn = TcpConnection::connect(addr, ctx.timeouts.connect, &attempt.cancel).await?;

    conn.send_identity(&ctx.identity).await?;
    ctx.set_state(&attempt.device_id, SessionState::IdentityExchanged);

    let stream = ctx
        .tls
        .accept(conn.into_stream(), ctx.timeouts.handshake, &attempt.cancel)
        .await?;
    ctx.set_state(&attempt.device_id, SessionState::TlsUpgraded);

    secure(ctx, peer, stream, attempt).await
}

/// Trust decision, pairing if needed, then the session loop
async fn secure<S>(
    ctx: &SessionContext,
    peer: &DeviceInfo,
    stream: SslStream<S>,
    attempt: &Attempt,
) -> Result<CloseReason>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let device_id = peer.device_id.as_str();
    let presented = peer_certificate(&stream)?;

    let trusted = match ctx.trust.get(device_id).await? {
        Some(pinned) if pinned == presented => true,
        Some(_) => return Err(ProtocolError::CertificateMismatch(device_id.to_string())),
        None => false,
    };

    let mut io = SessionIo::start(stream, &attempt.cancel);

    if trusted {
        claim(ctx, attempt)?;
        ctx.set_state(device_id, SessionState::Trusted);
    } else {
        ctx.set_state(device_id, SessionState::Pairing);
        pair(ctx, peer, &presented, &mut io, attempt).await?;
    }

    session::run(ctx, attempt, io).await
}

/// Wait for the peer's pairing request and the local decision
async fn pair<S>(
    ctx: &SessionContext,
    peer: &DeviceInfo,
    certificate: &[u8],
    io: &mut SessionIo<S>,
    attempt: &Attempt,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let device_id = peer.device_id.as_str();

    let packet = tokio::select! {
        biased;
        _ = attempt.cancel.cancelled() => {
            return Err(ProtocolError::Cancelled(format!("waiting for {} to pair", device_id)));
        }
        result = tokio::time::timeout(ctx.timeouts.pairing, io.recv()) => {
            result.map_err(|_| ProtocolError::PairingTimeout(format!("no pair request from {}", device_id)))??
        }
    };

    if !packet.is_type(PACKET_TYPE_PAIR) {
        return Err(ProtocolError::UnexpectedPacket(format!(
            "{} from unpaired device {}",
            packet.packet_type(),
            device_id
        )));
    }

    if !packet.body_as::<PairBody>()?.pair {
        ctx.trust.remove(device_id).await?;
        return Err(ProtocolError::PairingRejected(format!(
            "{} declined pairing",
            device_id
        )));
    }

    claim(ctx, attempt)?;

    let fingerprint = CertificateInfo::calculate_fingerprint(certificate);
    let decision = ctx
        .broker
        .request(device_id, &peer.device_name, fingerprint)
        .wait(&attempt.cancel, ctx.timeouts.pairing)
        .await?;

    match decision {
        PairingDecision::Approved => {}
        PairingDecision::Denied => {
            // Best effort, the connection is closed either way
            if let Ok(packet) = Packet::from_body(&PairBody::reject()) {
                let _ = io.send(&packet).await;
            }
            return Err(ProtocolError::PairingRejected(format!(
                "pairing with {} denied",
                device_id
            )));
        }
        PairingDecision::Superseded => {
            return Err(ProtocolError::PairingRejected(format!(
                "pairing request from {} superseded",
                device_id
            )));
        }
    }

    ctx.trust.add(device_id, certificate).await?;
    io.send(&Packet::from_body(&PairBody::accept())?).await?;
    io.send(&Packet::from_body(ctx.identity.as_ref())?).await?;

    info!("Paired with {} ({})", peer.device_name, device_id);
    Ok(())
}

/// Take the registry slot for `attempt`, superseding an older session
fn claim(ctx: &SessionContext, attempt: &Attempt) -> Result<()> {
    if ctx.registry.claim(attempt) {
        Ok(())
    } else {
        Err(ProtocolError::Cancelled(format!(
            "a newer attempt for {} is registered",
            attempt.device_id
        )))
    }
}

/// Log the outcome, drop bookkeeping and announce the close
fn finish(ctx: &SessionContext, attempt: &Attempt, result: Result<CloseReason>) -> CloseReason {
    let device_id = attempt.device_id.as_str();

    let reason = match result {
        Ok(reason) => reason,
        Err(e) => {
            if e.is_protocol_violation() {
                warn!("Dropping {}: {}", device_id, e);
            } else if e.is_pairing_outcome() {
                info!("Not paired with {}: {}", device_id, e);
            } else if matches!(e, ProtocolError::Cancelled(_)) {
                debug!("Session with {} cancelled", device_id);
            } else {
                info!("Session with {} failed: {}", device_id, e);
            }
            CloseReason::from(&e)
        }
    };

    ctx.registry.finish(attempt);
    ctx.closed(device_id, reason.clone());
    debug!("Session with {} closed: {}", device_id, reason);
    reason
}

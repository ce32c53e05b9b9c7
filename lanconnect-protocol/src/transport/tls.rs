//! TLS Upgrade
//!
//! After the plaintext identity line both sides switch to TLS on the same
//! socket. Roles are decided by who dialed:
//!
//! - the side that **dialed** TCP acts as TLS **server**
//! - the side that **accepted** TCP acts as TLS **client**
//!
//! Both roles present the local certificate and require one from the peer.
//! There is no chain or CA validation: the verify callback accepts any
//! certificate, and trust is decided afterwards by comparing the peer
//! certificate with the pinned one in the trust store.

use crate::{CertificateInfo, ProtocolError, Result};
use openssl::ssl::{
    NameType, Ssl, SslAcceptor, SslConnector, SslMethod, SslVerifyMode, SslVersion,
};
use std::pin::Pin;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_openssl::SslStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// OpenSSL contexts for both TLS roles, built once from the local certificate
pub struct TlsConfig {
    acceptor: SslAcceptor,
    connector: SslConnector,
    local_device_id: String,
}

impl TlsConfig {
    /// Build server and client contexts presenting `our_cert`
    pub fn new(our_cert: &CertificateInfo) -> Result<Self> {
        Ok(Self {
            acceptor: create_acceptor(our_cert)?,
            connector: create_connector(our_cert)?,
            local_device_id: our_cert.device_id.clone(),
        })
    }

    /// Run the handshake in the server role (we dialed)
    pub async fn accept<S>(
        &self,
        stream: S,
        handshake_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<SslStream<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let ssl = Ssl::new(self.acceptor.context())?;
        let mut tls_stream = SslStream::new(ssl, stream)?;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(ProtocolError::Cancelled("TLS handshake".to_string()));
            }
            result = tokio::time::timeout(handshake_timeout, Pin::new(&mut tls_stream).accept()) => {
                result.map_err(|_| ProtocolError::timeout("TLS handshake"))??;
            }
        }

        if let Some(name) = tls_stream.ssl().servername(NameType::HOST_NAME) {
            debug!("Peer requested server name {}", name);
        }

        Ok(tls_stream)
    }

    /// Run the handshake in the client role (we accepted)
    ///
    /// The local device id is sent as server name.
    pub async fn connect<S>(
        &self,
        stream: S,
        handshake_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<SslStream<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut ssl = Ssl::new(self.connector.context())?;
        ssl.set_hostname(&self.local_device_id)?;
        let mut tls_stream = SslStream::new(ssl, stream)?;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(ProtocolError::Cancelled("TLS handshake".to_string()));
            }
            result = tokio::time::timeout(handshake_timeout, Pin::new(&mut tls_stream).connect()) => {
                result.map_err(|_| ProtocolError::timeout("TLS handshake"))??;
            }
        }

        Ok(tls_stream)
    }
}

/// DER bytes of the certificate the peer presented in this handshake
pub fn peer_certificate<S>(stream: &SslStream<S>) -> Result<Vec<u8>>
where
    S: AsyncRead + AsyncWrite,
{
    let cert = stream
        .ssl()
        .peer_certificate()
        .ok_or(ProtocolError::MissingPeerCertificate)?;
    Ok(cert.to_der()?)
}

/// Server context: TLS 1.2+, client certificate required, any accepted
fn create_acceptor(our_cert: &CertificateInfo) -> Result<SslAcceptor> {
    let mut builder = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server())?;

    builder.set_min_proto_version(Some(SslVersion::TLS1_2))?;
    builder.set_verify_callback(
        SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT,
        |_preverify, _ctx| true,
    );
    // Required once client certificates are requested
    builder.set_session_id_context(b"lanconnect")?;

    builder.set_certificate(&*our_cert.x509()?)?;
    builder.set_private_key(&*our_cert.pkey()?)?;
    builder.check_private_key().map_err(|e| {
        ProtocolError::CertificateValidation(format!("Private key does not match certificate: {}", e))
    })?;

    debug!("TLS server context created");
    Ok(builder.build())
}

/// Client context: TLS 1.2+, server certificate required, any accepted
fn create_connector(our_cert: &CertificateInfo) -> Result<SslConnector> {
    let mut builder = SslConnector::builder(SslMethod::tls_client())?;

    builder.set_min_proto_version(Some(SslVersion::TLS1_2))?;
    builder.set_verify_callback(SslVerifyMode::PEER, |_preverify, _ctx| true);

    builder.set_certificate(&*our_cert.x509()?)?;
    builder.set_private_key(&*our_cert.pkey()?)?;

    debug!("TLS client context created");
    Ok(builder.build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    const TIMEOUT: Duration = Duration::from_secs(10);

    #[tokio::test]
    async fn test_mutual_handshake_exposes_peer_certificates() {
        let server_cert = CertificateInfo::generate("server_side").unwrap();
        let client_cert = CertificateInfo::generate("client_side").unwrap();
        let server_tls = TlsConfig::new(&server_cert).unwrap();
        let client_tls = TlsConfig::new(&client_cert).unwrap();

        let (a, b) = duplex(64 * 1024);
        let cancel = CancellationToken::new();

        let (server, client) = tokio::join!(
            server_tls.accept(a, TIMEOUT, &cancel),
            client_tls.connect(b, TIMEOUT, &cancel),
        );
        let mut server = server.unwrap();
        let mut client = client.unwrap();

        assert_eq!(peer_certificate(&server).unwrap(), client_cert.certificate);
        assert_eq!(peer_certificate(&client).unwrap(), server_cert.certificate);

        client.write_all(b"hello\n").await.unwrap();
        client.flush().await.unwrap();
        let mut buf = [0u8; 6];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello\n");
    }

    #[tokio::test]
    async fn test_server_requires_client_certificate() {
        let server_cert = CertificateInfo::generate("server_side").unwrap();
        let server_tls = TlsConfig::new(&server_cert).unwrap();

        // A client context without any certificate
        let mut builder = SslConnector::builder(SslMethod::tls_client()).unwrap();
        builder.set_verify(SslVerifyMode::NONE);
        let anonymous = builder.build();

        let (a, b) = duplex(64 * 1024);
        let cancel = CancellationToken::new();

        let client = async move {
            let ssl = Ssl::new(anonymous.context()).unwrap();
            let mut stream = SslStream::new(ssl, b).unwrap();
            let _ = Pin::new(&mut stream).connect().await;
            // Keep the stream alive until the server has reported
            stream
        };

        let (server, _client) = tokio::join!(server_tls.accept(a, TIMEOUT, &cancel), client);
        assert!(server.is_err());
    }

    #[tokio::test]
    async fn test_handshake_cancelled() {
        let server_cert = CertificateInfo::generate("server_side").unwrap();
        let server_tls = TlsConfig::new(&server_cert).unwrap();

        let (a, _b) = duplex(1024);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = server_tls.accept(a, TIMEOUT, &cancel).await;
        assert!(matches!(result, Err(ProtocolError::Cancelled(_))));
    }
}

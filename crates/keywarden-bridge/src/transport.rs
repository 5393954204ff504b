use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

use crate::config::{fingerprint_of, Bootstrap};
use crate::retry::{with_backoff, RetryPolicy};
use crate::{BridgeError, Result};

const ACK_OK: [u8; 2] = *b"OK";

/// Bounds the TLS handshake plus token exchange against a relay that accepts
/// the TCP connection and then goes silent.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) fn ensure_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Establishes the authenticated channel to the local relay: TCP with
/// no-delay and keep-alive, TLS pinned to the single bootstrap certificate,
/// then the bearer-token handshake. Plain connect failures are retried under
/// the default policy; pin and token failures fail closed immediately.
pub async fn connect(bootstrap: &Bootstrap) -> Result<TlsStream<TcpStream>> {
    connect_with_policy(bootstrap, RetryPolicy::default()).await
}

pub async fn connect_with_policy(
    bootstrap: &Bootstrap,
    policy: RetryPolicy,
) -> Result<TlsStream<TcpStream>> {
    with_backoff(policy, || connect_once(bootstrap, HANDSHAKE_TIMEOUT)).await
}

async fn connect_once(
    bootstrap: &Bootstrap,
    handshake_timeout: Duration,
) -> Result<TlsStream<TcpStream>> {
    let stream =
        TcpStream::connect((Ipv4Addr::LOCALHOST, bootstrap.proxy_port)).await?;
    stream.set_nodelay(true)?;
    enable_keepalive(&stream)?;

    // A timed-out handshake is an io error, so the retry policy treats it
    // like any other connect failure.
    timeout(handshake_timeout, handshake(bootstrap, stream))
        .await
        .map_err(|_| {
            BridgeError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "relay handshake timed out",
            ))
        })?
}

async fn handshake(bootstrap: &Bootstrap, stream: TcpStream) -> Result<TlsStream<TcpStream>> {
    ensure_crypto_provider();
    let tls_config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(DeferredPinVerification))
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(tls_config));
    let server_name = ServerName::from(IpAddr::V4(Ipv4Addr::LOCALHOST));

    let mut tls = connector.connect(server_name, stream).await?;
    verify_pin(&tls, &bootstrap.fingerprint)?;
    debug!(port = bootstrap.proxy_port, "relay certificate pin verified");

    tls.write_all(&bootstrap.auth_token).await?;
    tls.flush().await?;

    let mut ack = [0u8; 2];
    tls.read_exact(&mut ack).await?;
    if ack != ACK_OK {
        return Err(BridgeError::Authentication);
    }

    info!(port = bootstrap.proxy_port, "authenticated channel established");
    Ok(tls)
}

/// Compares the presented end-entity certificate's content hash against the
/// pinned fingerprint, byte for byte. Runs before any plaintext is written,
/// so a mismatch leaks nothing.
fn verify_pin(tls: &TlsStream<TcpStream>, expected: &str) -> Result<()> {
    let (_, session) = tls.get_ref();
    let presented = session
        .peer_certificates()
        .and_then(|certs| certs.first())
        .ok_or_else(|| BridgeError::Security {
            expected: expected.to_string(),
            presented: "no certificate".to_string(),
        })?;

    let actual = fingerprint_of(presented.as_ref());
    if actual != expected {
        return Err(BridgeError::Security {
            expected: expected.to_string(),
            presented: actual,
        });
    }
    Ok(())
}

fn enable_keepalive(stream: &TcpStream) -> std::io::Result<()> {
    let sock = SockRef::from(stream);
    sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(Duration::from_secs(60)))
}

/// Accepts any certificate during the handshake; the single-certificate pin
/// is enforced by `verify_pin` before a byte of application data moves. The
/// pin is the trust anchor, there is no fallback to a system store.
#[derive(Debug)]
struct DeferredPinVerification;

impl ServerCertVerifier for DeferredPinVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

use rustls::pki_types::CertificateDer;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::{BridgeError, Result};

/// Bootstrap payload as delivered by the discovery mechanism: everything is
/// optional on the wire, nothing is optional for a connect.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct BootstrapPayload {
    pub proxy_port: Option<u16>,
    /// Relay certificate, hex-encoded DER.
    pub certificate: Option<String>,
    /// Expected relay fingerprint, `sha256:` + lowercase hex of the DER hash.
    pub fingerprint: Option<String>,
    /// Bearer token, hex-encoded.
    pub auth_token: Option<String>,
}

/// Validated bootstrap material for one proxy session.
#[derive(Clone, Debug)]
pub struct Bootstrap {
    pub proxy_port: u16,
    pub certificate: CertificateDer<'static>,
    pub fingerprint: String,
    pub auth_token: Vec<u8>,
}

impl Bootstrap {
    /// All four fields must be present and well-formed; a gap is fatal to
    /// this session, not a crash.
    pub fn from_payload(payload: BootstrapPayload) -> Result<Self> {
        let proxy_port = payload
            .proxy_port
            .ok_or(BridgeError::Config("proxy_port missing"))?;

        let cert_hex = payload
            .certificate
            .ok_or(BridgeError::Config("certificate missing"))?;
        let der = hex::decode(cert_hex.trim())
            .map_err(|_| BridgeError::Config("certificate is not valid hex"))?;

        let fingerprint = payload
            .fingerprint
            .ok_or(BridgeError::Config("fingerprint missing"))?;
        if !fingerprint.starts_with("sha256:") {
            return Err(BridgeError::Config("fingerprint is not sha256-prefixed"));
        }
        if fingerprint != fingerprint_of(&der) {
            return Err(BridgeError::Config("fingerprint does not match certificate"));
        }

        let token_hex = payload
            .auth_token
            .ok_or(BridgeError::Config("auth_token missing"))?;
        let auth_token = hex::decode(token_hex.trim())
            .map_err(|_| BridgeError::Config("auth_token is not valid hex"))?;

        Ok(Self {
            proxy_port,
            certificate: CertificateDer::from(der),
            fingerprint,
            auth_token,
        })
    }
}

/// `sha256:` + lowercase hex of SHA-256 over the certificate DER bytes.
pub fn fingerprint_of(der: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(der)))
}

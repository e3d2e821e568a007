//! TLS certificate metadata of a device service. The certificate is
//! recorded, not trusted: any server certificate is accepted.

use recon_core::{CertInfo, ReconError, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use ::time::format_description::well_known::Rfc3339;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{error, info, warn, Span};
use x509_parser::prelude::*;

#[derive(Debug)]
struct AcceptAnyCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCert {
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
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

pub struct CertRetriever {
    connector: TlsConnector,
    timeout: Duration,
    log: Span,
}

impl CertRetriever {
    pub fn new(timeout: Duration, log: Span) -> Result<Self> {
        let provider = Arc::new(ring::default_provider());
        let config = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| ReconError::Http(e.to_string()))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert(provider)))
            .with_no_client_auth();
        Ok(CertRetriever { connector: TlsConnector::from(Arc::new(config)), timeout, log })
    }

    /// Certificate metadata of `host:port`, or `None` when the handshake
    /// fails or the server presents no certificate.
    pub async fn retrieve(&self, host: &str, port: u16) -> Option<CertInfo> {
        info!(parent: &self.log, host, port, "retrieving certificate");
        match self.handshake(host, port).await {
            Ok(Some(cert)) => {
                info!(parent: &self.log, host, port, "certificate retrieved");
                Some(cert)
            }
            Ok(None) => {
                error!(parent: &self.log, host, port, "no certificate presented");
                None
            }
            Err(e) => {
                error!(parent: &self.log, host, port, error = %e, "certificate retrieval failed");
                None
            }
        }
    }

    async fn handshake(&self, host: &str, port: u16) -> Result<Option<CertInfo>> {
        let name = server_name(host)?;
        let stream = timeout(self.timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| ReconError::Http(format!("connect to {host}:{port} timed out")))??;
        let mut tls = timeout(self.timeout, self.connector.connect(name, stream))
            .await
            .map_err(|_| ReconError::Http(format!("tls handshake with {host}:{port} timed out")))??;

        let cert = tls
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|chain| chain.first())
            .map(|der| cert_info_from_der(der.as_ref()))
            .transpose();

        if let Err(e) = tls.shutdown().await {
            warn!(parent: &self.log, host, port, error = %e, "tls shutdown failed");
        }
        cert
    }
}

fn server_name(host: &str) -> Result<ServerName<'static>> {
    match host.parse::<std::net::IpAddr>() {
        Ok(ip) => Ok(ServerName::IpAddress(ip.into())),
        Err(_) => ServerName::try_from(host.to_owned())
            .map_err(|_| ReconError::Validation(format!("invalid server name: {host}"))),
    }
}

/// Decode a DER end-entity certificate into the recorded metadata.
pub fn cert_info_from_der(der: &[u8]) -> Result<CertInfo> {
    let (_, x509) =
        X509Certificate::from_der(der).map_err(|e| ReconError::Validation(format!("unparsable certificate: {e}")))?;
    let validity = x509.validity();
    Ok(CertInfo {
        subject: name_fields(x509.subject()),
        issuer: name_fields(x509.issuer()),
        serial_number: hex::encode(x509.raw_serial()),
        version: x509.version().0,
        not_before: rfc3339(&validity.not_before)?,
        not_after: rfc3339(&validity.not_after)?,
    })
}

/// CN, OU, O, L, ST and C of a distinguished name; first value of each.
fn name_fields(name: &X509Name<'_>) -> BTreeMap<String, String> {
    [
        ("CN", name.iter_common_name().next()),
        ("OU", name.iter_organizational_unit().next()),
        ("O", name.iter_organization().next()),
        ("L", name.iter_locality().next()),
        ("ST", name.iter_state_or_province().next()),
        ("C", name.iter_country().next()),
    ]
    .into_iter()
    .filter_map(|(key, attr)| Some((key.to_string(), attr?.as_str().ok()?.to_string())))
    .collect()
}

fn rfc3339(t: &ASN1Time) -> Result<String> {
    t.to_datetime()
        .format(&Rfc3339)
        .map_err(|e| ReconError::Validation(format!("certificate time: {e}")))
}

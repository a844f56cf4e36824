use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tracing::{debug, info};

use crate::error::TransportError;
use crate::registry::UpstreamSpec;

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Client side of DNS-over-TLS upstreams. Two connectors: one verifying
/// against the webpki roots, one accepting any certificate.
pub struct TlsDialer {
    verified: TlsConnector,
    unverified: TlsConnector,
}

impl TlsDialer {
    pub fn new() -> anyhow::Result<Self> {
        let roots = RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        let config = ClientConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .context("tls protocol versions")?
            .with_root_certificates(roots)
            .with_no_client_auth();

        let mut lax = config.clone();
        let provider = lax.crypto_provider().clone();
        lax.dangerous()
            .set_certificate_verifier(Arc::new(SkipServerVerification { provider }));

        Ok(Self {
            verified: TlsConnector::from(Arc::new(config)),
            unverified: TlsConnector::from(Arc::new(lax)),
        })
    }

    pub async fn handshake(
        &self,
        spec: &UpstreamSpec,
        stream: TcpStream,
    ) -> Result<TlsStream<TcpStream>, TransportError> {
        let server_name = match spec.tls_name.as_deref() {
            Some(name) => ServerName::try_from(name.to_string()).map_err(|e| TransportError::TlsHandshake {
                upstream: spec.addr,
                reason: format!("invalid server name {name}: {e}"),
            })?,
            None => ServerName::IpAddress(spec.addr.ip().into()),
        };
        let connector = if spec.skip_cert_verify {
            &self.unverified
        } else {
            &self.verified
        };
        connector
            .connect(server_name, stream)
            .await
            .map_err(|e| {
                debug!(target = "tls", upstream = %spec.addr, error = %e, "tls handshake failed");
                TransportError::TlsHandshake {
                    upstream: spec.addr,
                    reason: e.to_string(),
                }
            })
    }
}

/// Accepts any upstream certificate (`skip_cert_verify`).
#[derive(Debug)]
struct SkipServerVerification {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Server config for TLS listeners from PEM files.
pub fn server_config_from_pem(cert_path: &Path, key_path: &Path) -> anyhow::Result<ServerConfig> {
    let mut reader = BufReader::new(
        File::open(cert_path).with_context(|| format!("open tls cert: {}", cert_path.display()))?,
    );
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("parse tls cert: {}", cert_path.display()))?;

    let mut reader = BufReader::new(
        File::open(key_path).with_context(|| format!("open tls key: {}", key_path.display()))?,
    );
    let key = rustls_pemfile::private_key(&mut reader)
        .with_context(|| format!("parse tls key: {}", key_path.display()))?
        .with_context(|| format!("no private key in {}", key_path.display()))?;

    server_config(certs, key)
}

/// 未配置证书时为 TLS 监听端点生成自签名证书。
pub fn self_signed_server_config() -> anyhow::Result<ServerConfig> {
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec!["localhost".to_string(), "127.0.0.1".to_string()])
            .context("generate self-signed certificate")?;
    info!(target = "tls", "using generated self-signed certificate");
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
    server_config(vec![cert.der().clone()], key)
}

fn server_config(certs: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> anyhow::Result<ServerConfig> {
    ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .context("tls protocol versions")?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("build tls server config")
}

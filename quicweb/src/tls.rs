//! rustls configuration for both roles, always on the ring provider and
//! TLS 1.3 (QUIC requires it).

use std::path::Path;
use std::sync::Arc;

use quicweb_quic::QuicConfig;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};

use crate::config::{ClientConfig, ServerConfig};
use crate::error::TlsError;

/// ALPN identifier for HTTP/3 (RFC 9114 Section 3.1).
pub const H3_ALPN: &[u8] = b"h3";

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let pem_error = |source| TlsError::Pem {
        path: path.to_owned(),
        source,
    };
    let certs = CertificateDer::pem_file_iter(path)
        .map_err(pem_error)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(pem_error)?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.to_owned()));
    }
    Ok(certs)
}

pub fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    PrivateKeyDer::from_pem_file(path).map_err(|source| TlsError::Pem {
        path: path.to_owned(),
        source,
    })
}

pub fn server_tls(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<rustls::ServerConfig, TlsError> {
    let config = rustls::ServerConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(config)
}

/// Client TLS: WebPKI roots by default, a CA file if given, or no
/// verification at all with `insecure`.
pub fn client_tls(config: &ClientConfig) -> Result<rustls::ClientConfig, TlsError> {
    let builder = rustls::ClientConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])?;

    if config.insecure {
        return Ok(builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert(provider())))
            .with_no_client_auth());
    }

    let mut roots = RootCertStore::empty();
    match &config.ca_cert {
        Some(path) => {
            for cert in load_certs(path)? {
                roots.add(cert)?;
            }
        }
        None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }
    Ok(builder.with_root_certificates(roots).with_no_client_auth())
}

/// QUIC endpoint config for the server: certificate and key from disk, ALPN `h3`.
pub fn server_quic_config(config: &ServerConfig) -> Result<QuicConfig, TlsError> {
    let tls = server_tls(load_certs(&config.cert)?, load_key(&config.key)?)?;
    Ok(QuicConfig::server(tls, &[H3_ALPN], &config.transport)?)
}

pub fn client_quic_config(config: &ClientConfig) -> Result<QuicConfig, TlsError> {
    Ok(QuicConfig::client(client_tls(config)?, &[H3_ALPN], &config.transport)?)
}

/// Accepts any server certificate. Handshake signatures are still checked,
/// so the peer must hold the key for whatever certificate it presents.
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
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_pair(dir: &Path) -> (std::path::PathBuf, std::path::PathBuf) {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_path = dir.join("server.crt");
        let key_path = dir.join("server.key");
        std::fs::write(&cert_path, cert.cert.pem()).unwrap();
        std::fs::write(&key_path, cert.key_pair.serialize_pem()).unwrap();
        (cert_path, key_path)
    }

    #[test]
    fn server_config_from_pem_files() {
        let dir = tempfile::tempdir().unwrap();
        let (cert, key) = write_pair(dir.path());
        let config = ServerConfig {
            cert,
            key,
            ..ServerConfig::default()
        };
        let quic = server_quic_config(&config).unwrap();
        assert!(quic.server_config.is_some());
        assert!(quic.client_config.is_none());
    }

    #[test]
    fn missing_cert_file_is_pem_error() {
        let config = ServerConfig {
            cert: "/nonexistent/server.crt".into(),
            ..ServerConfig::default()
        };
        assert!(matches!(server_quic_config(&config), Err(TlsError::Pem { .. })));
    }

    #[test]
    fn empty_cert_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.crt");
        std::fs::write(&path, "").unwrap();
        assert!(matches!(load_certs(&path), Err(TlsError::NoCertificates(_))));
    }

    #[test]
    fn client_trust_modes() {
        let dir = tempfile::tempdir().unwrap();
        let (cert, _) = write_pair(dir.path());

        let webpki = client_tls(&ClientConfig::default()).unwrap();
        assert!(webpki.alpn_protocols.is_empty());

        let pinned = ClientConfig {
            ca_cert: Some(cert),
            ..ClientConfig::default()
        };
        client_tls(&pinned).unwrap();

        let insecure = ClientConfig {
            insecure: true,
            ..ClientConfig::default()
        };
        let quic = client_quic_config(&insecure).unwrap();
        assert!(quic.client_config.is_some());
    }
}

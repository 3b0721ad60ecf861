//! QUIC client endpoint using Quinn

use crate::config::{ClientConfig, ClientTlsConfig};
use crate::error::{Error, Result};
use quinn::Endpoint;
use rustls::pki_types::CertificateDer;
use std::fs::File;
use std::io::BufReader;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, warn};

/// Create a QUIC client endpoint
pub fn make_client_endpoint(config: &ClientConfig) -> Result<Endpoint> {
    // Bind to any available port for client
    let bind_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0));

    let client_config = build_client_config(&config.tls)?;

    let mut endpoint = Endpoint::client(bind_addr)
        .map_err(|e| Error::Config(format!("Failed to create client endpoint: {}", e)))?;

    endpoint.set_default_client_config(client_config);

    debug!("Created client endpoint");
    Ok(endpoint)
}

/// Build rustls ClientConfig for QUIC
fn build_client_config(tls_config: &ClientTlsConfig) -> Result<quinn::ClientConfig> {
    let crypto = if tls_config.skip_verify {
        // WARNING: This is insecure and should only be used for development
        warn!("Server TLS verification disabled - INSECURE");

        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
            .with_no_client_auth()
    } else {
        let mut roots = rustls::RootCertStore::empty();

        if let Some(ref ca_path) = tls_config.ca_cert_path {
            for cert in load_ca_certs(ca_path)? {
                roots
                    .add(cert)
                    .map_err(|e| Error::Tls(format!("Failed to add CA cert: {}", e)))?;
            }
        } else {
            let native_certs = rustls_native_certs::load_native_certs();
            for cert in native_certs.certs {
                let _ = roots.add(cert);
            }
        }

        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    };

    let client_config = quinn::ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
            .map_err(|e| Error::Tls(format!("Failed to create QUIC client config: {}", e)))?,
    ));

    Ok(client_config)
}

fn load_ca_certs(path: &std::path::Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| Error::Tls(format!("Failed to open CA cert file {:?}: {}", path, e)))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Tls(format!("Failed to parse CA certs: {}", e)))?;

    if certs.is_empty() {
        return Err(Error::Tls(format!("No certificates found in {:?}", path)));
    }
    Ok(certs)
}

/// Certificate verifier that skips all verification (INSECURE)
#[derive(Debug)]
struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

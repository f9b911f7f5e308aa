//! TLS material loading for listeners and the relay client.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use log::info;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::error_handling::types::ServerError;

#[derive(Debug, Clone)]
pub struct TlsMaterial {
    /// Certificate chain; required for listeners, optional for the relay
    /// client side.
    pub cert: Option<std::path::PathBuf>,
    pub key: Option<std::path::PathBuf>,
    pub ca: Option<std::path::PathBuf>,
    /// Verify the peer's certificate chain (client certs on the listener
    /// side, the server certificate on the relay side).
    pub verify: bool,
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ServerError> {
    let mut reader = BufReader::new(
        File::open(path).map_err(|e| ServerError::TlsError(format!("{}: {}", path.display(), e)))?,
    );
    let certs: Result<Vec<_>, _> = rustls_pemfile::certs(&mut reader).collect();
    let certs = certs.map_err(|e| ServerError::TlsError(format!("{}: {}", path.display(), e)))?;
    if certs.is_empty() {
        return Err(ServerError::TlsError(format!(
            "{}: no certificates found",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, ServerError> {
    let mut reader = BufReader::new(
        File::open(path).map_err(|e| ServerError::TlsError(format!("{}: {}", path.display(), e)))?,
    );
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| ServerError::TlsError(format!("{}: {}", path.display(), e)))?
        .ok_or_else(|| ServerError::TlsError(format!("{}: no private key found", path.display())))
}

fn load_roots(path: &Path) -> Result<RootCertStore, ServerError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .map_err(|e| ServerError::TlsError(format!("{}: {}", path.display(), e)))?;
    }
    Ok(roots)
}

/// Build the acceptor used by TLS listeners. With `verify`, clients must
/// present a certificate chaining to the configured CA bundle.
pub fn build_acceptor(material: &TlsMaterial) -> Result<TlsAcceptor, ServerError> {
    let cert_path = material
        .cert
        .as_ref()
        .ok_or_else(|| ServerError::TlsError("TLS listeners require tls_cert".into()))?;
    let key_path = material
        .key
        .as_ref()
        .ok_or_else(|| ServerError::TlsError("TLS listeners require tls_key".into()))?;
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;
    let builder = ServerConfig::builder();
    let config = if material.verify {
        let ca = material.ca.as_ref().ok_or_else(|| {
            ServerError::TlsError("tls_verify requires a CA bundle (tls_cacert)".into())
        })?;
        let verifier = WebPkiClientVerifier::builder(Arc::new(load_roots(ca)?))
            .build()
            .map_err(|e| ServerError::TlsError(e.to_string()))?;
        builder
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs, key)
    } else {
        builder.with_no_client_auth().with_single_cert(certs, key)
    }
    .map_err(|e| ServerError::TlsError(e.to_string()))?;
    info!("TLS listener material loaded from {}", cert_path.display());
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Build the connector for TLS relay links. Without `verify` the upstream
/// certificate is accepted as-is, matching relays that use self-signed
/// certificates purely for transport encryption.
pub fn build_connector(material: &TlsMaterial) -> Result<TlsConnector, ServerError> {
    let builder = if material.verify {
        let ca = material.ca.as_ref().ok_or_else(|| {
            ServerError::TlsError("tls_verify requires a CA bundle (tls_cacert)".into())
        })?;
        ClientConfig::builder().with_root_certificates(load_roots(ca)?)
    } else {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
    };
    let config = match (&material.cert, &material.key) {
        (Some(cert), Some(key)) => builder
            .with_client_auth_cert(load_certs(cert)?, load_key(key)?)
            .map_err(|e| ServerError::TlsError(e.to_string()))?,
        _ => builder.with_no_client_auth(),
    };
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Certificate verifier that accepts any peer certificate.
#[derive(Debug)]
struct AcceptAnyCert;

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
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
        ]
    }
}

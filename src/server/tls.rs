//! TLS acceptor construction.
//!
//! Certificate-fingerprint authentication needs the peer to present a
//! client certificate, but any certificate: trust is decided by comparing
//! the leaf's SHA-256 against the allow-list after the handshake, so the
//! verifier here only checks the handshake signature itself.

use std::sync::Arc;

use anyhow::Result;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls::{
    DigitallySignedStruct, DistinguishedName, Error as RustlsError, ServerConfig, SignatureScheme,
    client::danger::HandshakeSignatureValid,
    crypto::{WebPkiSupportedAlgorithms, aws_lc_rs, verify_tls12_signature, verify_tls13_signature},
    pki_types::{CertificateDer, UnixTime},
    server::danger::{ClientCertVerified, ClientCertVerifier},
};

use crate::config::{AuthMode, Config};
use crate::pki;

pub use crate::pki::fingerprint;

/// Build the acceptor, or `None` when TLS is disabled.
pub fn acceptor(config: &Config) -> Result<Option<TlsAcceptor>> {
    if config.tls.disabled {
        return Ok(None);
    }

    pki::ensure_certificate(&config.tls)?;

    let certificates = pki::load_certificates(&config.tls.cert_file)?;
    let key = pki::load_private_key(
        &config.tls.key_file,
        config.tls.key_file_password.as_deref(),
    )?;

    let builder = ServerConfig::builder();
    let server_config = if config.auth.mode == AuthMode::Certificate {
        builder
            .with_client_cert_verifier(Arc::new(AcceptAnyClientCert::default()))
            .with_single_cert(certificates, key)?
    } else {
        builder
            .with_no_client_auth()
            .with_single_cert(certificates, key)?
    };

    Ok(Some(TlsAcceptor::from(Arc::new(server_config))))
}

/// Accepts any client chain; the fingerprint allow-list decides afterwards.
#[derive(Debug)]
struct AcceptAnyClientCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl Default for AcceptAnyClientCert {
    fn default() -> Self {
        Self {
            algorithms: aws_lc_rs::default_provider().signature_verification_algorithms,
        }
    }
}

impl ClientCertVerifier for AcceptAnyClientCert {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, RustlsError> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

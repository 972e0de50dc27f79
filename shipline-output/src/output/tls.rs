/// TLS client setup for secure Redis endpoints
///
/// Builds a `tokio-rustls` connector whose certificate checks follow the
/// configured verification mode:
///
/// | mode          | chain | hostname |
/// |---------------|-------|----------|
/// | `full`        | yes   | yes      |
/// | `certificate` | yes   | no       |
/// | `none`        | no    | no       |
///
/// Trust roots come from `ssl.certificate_authorities` when given, otherwise
/// from the bundled Mozilla root set.

use rustls::client::{ServerCertVerified, ServerCertVerifier, WebPkiVerifier};
use rustls::{Certificate, CertificateError, ClientConfig, OwnedTrustAnchor, RootCertStore, ServerName};
use std::io::BufReader;
use std::sync::Arc;
use std::time::SystemTime;
use tokio_rustls::TlsConnector;

use super::config::{ConfigError, TlsConfig, VerificationMode};

/// Builds a TLS connector for the given settings
///
/// `None` means TLS was forced by a `rediss://` host without an `ssl`
/// section: full verification against the bundled roots.
///
/// # Errors
///
/// Returns `ConfigError::Tls` if an authority cannot be read or holds no
/// usable certificate.
pub fn build_connector(tls: Option<&TlsConfig>) -> Result<TlsConnector, ConfigError> {
    let mode = tls.map(|t| t.verification_mode).unwrap_or_default();
    let authorities = tls
        .map(|t| t.certificate_authorities.as_slice())
        .unwrap_or_default();

    let builder = ClientConfig::builder().with_safe_defaults();

    let config = match mode {
        VerificationMode::Full => builder
            .with_root_certificates(root_store(authorities)?)
            .with_no_client_auth(),
        VerificationMode::Certificate => builder
            .with_custom_certificate_verifier(Arc::new(ChainOnlyVerifier::new(root_store(
                authorities,
            )?)))
            .with_no_client_auth(),
        VerificationMode::None => builder
            .with_custom_certificate_verifier(Arc::new(NoVerification))
            .with_no_client_auth(),
    };

    tracing::debug!(
        verification_mode = ?mode,
        authorities = authorities.len(),
        "TLS connector configured"
    );

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Builds the trust store from configured authorities or the bundled roots
fn root_store(authorities: &[String]) -> Result<RootCertStore, ConfigError> {
    let mut roots = RootCertStore::empty();

    if authorities.is_empty() {
        roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
            OwnedTrustAnchor::from_subject_spki_name_constraints(
                ta.subject,
                ta.spki,
                ta.name_constraints,
            )
        }));
        return Ok(roots);
    }

    for source in authorities {
        for der in load_pem_certificates(source)? {
            roots.add(&Certificate(der)).map_err(|e| {
                ConfigError::Tls(format!("Invalid certificate authority {}: {}", source, e))
            })?;
        }
    }

    Ok(roots)
}

/// Reads DER certificates from a PEM file path or an inline PEM block
fn load_pem_certificates(source: &str) -> Result<Vec<Vec<u8>>, ConfigError> {
    let pem = if source.trim_start().starts_with("-----BEGIN") {
        source.as_bytes().to_vec()
    } else {
        std::fs::read(source).map_err(|e| {
            ConfigError::Tls(format!("Failed to read certificate authority {}: {}", source, e))
        })?
    };

    let certs = rustls_pemfile::certs(&mut BufReader::new(pem.as_slice())).map_err(|e| {
        ConfigError::Tls(format!("Failed to parse certificate authority {}: {}", source, e))
    })?;

    if certs.is_empty() {
        return Err(ConfigError::Tls(format!(
            "No certificates found in certificate authority {}",
            source
        )));
    }

    Ok(certs)
}

/// Validates the peer chain but accepts any hostname
struct ChainOnlyVerifier {
    inner: WebPkiVerifier,
}

impl ChainOnlyVerifier {
    fn new(roots: RootCertStore) -> Self {
        ChainOnlyVerifier {
            inner: WebPkiVerifier::new(roots, None),
        }
    }
}

impl ServerCertVerifier for ChainOnlyVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &Certificate,
        intermediates: &[Certificate],
        server_name: &ServerName,
        scts: &mut dyn Iterator<Item = &[u8]>,
        ocsp_response: &[u8],
        now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        // webpki checks the chain before the name, so a name mismatch means
        // the chain itself was trusted.
        match self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            scts,
            ocsp_response,
            now,
        ) {
            Err(rustls::Error::InvalidCertificate(CertificateError::NotValidForName)) => {
                Ok(ServerCertVerified::assertion())
            }
            other => other,
        }
    }
}

/// Accepts every peer certificate
struct NoVerification;

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

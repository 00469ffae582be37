//! TLS client configuration for ldaps:// servers.

use anyhow::{Context, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::ClientConfig;
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use std::fs;
use std::io::BufReader;
use std::sync::Arc;
use tracing::{debug, warn};

/// Accepts any server certificate. Only for `skip_verify` on test or internal networks.
#[derive(Debug)]
struct InsecureServerVerifier;

impl ServerCertVerifier for InsecureServerVerifier {
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
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::ED25519,
        ]
    }
}

/// Client config that skips server certificate verification.
pub fn insecure_client_config() -> Arc<ClientConfig> {
    let mut config = ClientConfig::builder()
        .with_root_certificates(RootCertStore::empty())
        .with_no_client_auth();
    config
        .dangerous()
        .set_certificate_verifier(Arc::new(InsecureServerVerifier));
    Arc::new(config)
}

/// PEM certificates from `path`. An empty file is an error.
pub fn load_ca_certs_from_file(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let file = fs::File::open(path).with_context(|| format!("Open CA file: {}", path))?;
    let mut reader = BufReader::new(file);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Parse PEM certificates in {}", path))?;
    if certs.is_empty() {
        anyhow::bail!("No certificates found in {}", path);
    }
    Ok(certs)
}

/// Client config trusting the system roots plus the certificates in `ca_file`.
pub fn client_config_with_ca(ca_file: Option<&str>) -> Result<Arc<ClientConfig>> {
    let mut root_store = RootCertStore::empty();
    match rustls_native_certs::load_native_certs() {
        Ok(certs) => {
            let (added, ignored) = root_store.add_parsable_certificates(certs);
            debug!("Loaded {} system CA certificates ({} ignored)", added, ignored);
        }
        Err(e) => warn!("Unable to load system CA certificates: {}", e),
    }
    if let Some(path) = ca_file {
        let (added, _) = root_store.add_parsable_certificates(load_ca_certs_from_file(path)?);
        if added == 0 {
            anyhow::bail!("No usable CA certificates in {}", path);
        }
    }
    if root_store.is_empty() {
        anyhow::bail!("No trusted CA certificates available for ldaps:// connections");
    }
    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Client config for `skip_verify` / `ca_file` as given in the configuration file.
pub fn client_config(skip_verify: bool, ca_file: Option<&str>) -> Result<Arc<ClientConfig>> {
    if skip_verify {
        warn!("TLS certificate verification is disabled");
        return Ok(insecure_client_config());
    }
    client_config_with_ca(ca_file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_insecure_config_builds() {
        let config = client_config(true, Some("/nonexistent/ca.pem")).unwrap();
        assert!(config.alpn_protocols.is_empty());
    }

    #[test]
    fn test_missing_ca_file() {
        let err = load_ca_certs_from_file("/nonexistent/ca.pem").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/ca.pem"));
    }

    #[test]
    fn test_ca_file_without_certificates() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"not a certificate\n").unwrap();
        file.flush().unwrap();
        let path = file.path().to_str().unwrap().to_string();
        assert!(load_ca_certs_from_file(&path).is_err());
        assert!(client_config(false, Some(&path)).is_err());
    }
}

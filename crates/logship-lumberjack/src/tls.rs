use logship_core::config::TlsConfig;
use logship_core::ShipError;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use std::sync::Arc;

fn config_err(what: &str, e: impl std::fmt::Display) -> ShipError {
    ShipError::Config(format!("{}: {}", what, e))
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, ShipError> {
    CertificateDer::pem_file_iter(path)
        .map_err(|e| config_err(path, e))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| config_err(path, e))
}

fn load_key(path: &str) -> Result<PrivateKeyDer<'static>, ShipError> {
    PrivateKeyDer::from_pem_file(path).map_err(|e| config_err(path, e))
}

fn root_store(ca_file: &str) -> Result<RootCertStore, ShipError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(ca_file)? {
        roots.add(cert).map_err(|e| config_err(ca_file, e))?;
    }
    Ok(roots)
}

/// Build the rustls client configuration for the Lumberjack client from the
/// configured PEM material. Without a CA file the platform trust is not
/// consulted; a CA or `tls_skip_verify` must be given.
pub fn client_config(tls: &TlsConfig) -> Result<ClientConfig, ShipError> {
    let builder = if tls.tls_skip_verify {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
    } else {
        let ca = tls.ssl_ca_file.as_deref().ok_or_else(|| {
            ShipError::Config(
                "lumberjack output requires ssl_ca_file or tls_skip_verify".to_string(),
            )
        })?;
        ClientConfig::builder().with_root_certificates(root_store(ca)?)
    };

    match (&tls.ssl_cert_file, &tls.ssl_key_file) {
        (Some(cert), Some(key)) => builder
            .with_client_auth_cert(load_certs(cert)?, load_key(key)?)
            .map_err(|e| config_err("client certificate", e)),
        (None, None) => Ok(builder.with_no_client_auth()),
        _ => Err(ShipError::Config(
            "ssl_cert_file and ssl_key_file must be given together".to_string(),
        )),
    }
}

/// Build the rustls server configuration for the Lumberjack listener.
/// When a CA file is configured, peer certificates are required and
/// verified against it.
pub fn server_config(tls: &TlsConfig) -> Result<ServerConfig, ShipError> {
    let cert = tls.ssl_cert_file.as_deref().ok_or_else(|| {
        ShipError::Config("lumberjack input requires ssl_cert_file".to_string())
    })?;
    let key = tls.ssl_key_file.as_deref().ok_or_else(|| {
        ShipError::Config("lumberjack input requires ssl_key_file".to_string())
    })?;

    let builder = match tls.ssl_ca_file.as_deref() {
        Some(ca) => {
            let verifier = WebPkiClientVerifier::builder(Arc::new(root_store(ca)?))
                .build()
                .map_err(|e| config_err("client verifier", e))?;
            ServerConfig::builder().with_client_cert_verifier(verifier)
        }
        None => ServerConfig::builder().with_no_client_auth(),
    };

    builder
        .with_single_cert(load_certs(cert)?, load_key(key)?)
        .map_err(|e| config_err("server certificate", e))
}

pub fn server_name(host: &str) -> Result<ServerName<'static>, ShipError> {
    ServerName::try_from(host.to_string())
        .map_err(|e| ShipError::Config(format!("bad TLS server name {:?}: {}", host, e)))
}

/// Verifier that trusts any server certificate. Only reachable through the
/// explicit `tls_skip_verify` setting.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
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
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn self_signed() -> (tempfile::NamedTempFile, tempfile::NamedTempFile) {
        let signed = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let mut cert_file = tempfile::NamedTempFile::new().unwrap();
        cert_file.write_all(signed.cert.pem().as_bytes()).unwrap();
        cert_file.flush().unwrap();
        let mut key_file = tempfile::NamedTempFile::new().unwrap();
        key_file
            .write_all(signed.key_pair.serialize_pem().as_bytes())
            .unwrap();
        key_file.flush().unwrap();
        (cert_file, key_file)
    }

    #[test]
    fn test_client_requires_ca_or_skip() {
        let tls = TlsConfig::default();
        assert!(client_config(&tls).is_err());

        let tls = TlsConfig {
            tls_skip_verify: true,
            ..Default::default()
        };
        assert!(client_config(&tls).is_ok());
    }

    #[test]
    fn test_server_config_from_self_signed() {
        let (cert_file, key_file) = self_signed();
        let tls = TlsConfig {
            ssl_cert_file: Some(cert_file.path().to_string_lossy().to_string()),
            ssl_key_file: Some(key_file.path().to_string_lossy().to_string()),
            ..Default::default()
        };
        assert!(server_config(&tls).is_ok());
    }

    #[test]
    fn test_client_with_ca() {
        let (cert_file, _key) = self_signed();
        let tls = TlsConfig {
            ssl_ca_file: Some(cert_file.path().to_string_lossy().to_string()),
            ..Default::default()
        };
        assert!(client_config(&tls).is_ok());
    }

    #[test]
    fn test_server_name_parse() {
        assert!(server_name("logs.example.com").is_ok());
        assert!(server_name("127.0.0.1").is_ok());
    }
}

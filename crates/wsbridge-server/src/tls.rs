//! TLS material: PEM loading and rustls context construction.
//!
//! Inbound listeners always get a server context; when no key material is
//! configured a self-signed certificate is minted with rcgen. Outbound dials
//! share one default client context built on the webpki root store unless
//! the entity asks for its own trust anchors or client certificate.

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};
use wsbridge_core::entity::{InboundTls, OutboundTls};
use wsbridge_core::{BridgeError, BridgeResult, ClientAuth};

pub fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn tls_err(context: &str, e: impl std::fmt::Display) -> BridgeError {
    BridgeError::Tls(format!("{context}: {e}"))
}

/// Read every certificate in a PEM file.
pub fn load_certs(path: &Path) -> BridgeResult<Vec<CertificateDer<'static>>> {
    let pem = std::fs::read(path)
        .map_err(|e| tls_err(&format!("cannot read {}", path.display()), e))?;
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| tls_err(&format!("bad PEM in {}", path.display()), e))?;
    if certs.is_empty() {
        return Err(BridgeError::Tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

/// Read the first private key in a PEM file.
pub fn load_key(path: &Path) -> BridgeResult<PrivateKeyDer<'static>> {
    let pem = std::fs::read(path)
        .map_err(|e| tls_err(&format!("cannot read {}", path.display()), e))?;
    rustls_pemfile::private_key(&mut &pem[..])
        .map_err(|e| tls_err(&format!("bad PEM in {}", path.display()), e))?
        .ok_or_else(|| BridgeError::Tls(format!("no private key found in {}", path.display())))
}

fn load_roots(path: &Path) -> BridgeResult<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .map_err(|e| tls_err(&format!("bad CA in {}", path.display()), e))?;
    }
    Ok(roots)
}

/// Mint a self-signed certificate for `localhost`.
pub fn self_signed() -> BridgeResult<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let certified = rcgen::generate_simple_self_signed(vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
        "::1".to_string(),
    ])
    .map_err(|e| tls_err("self-signed certificate", e))?;
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
        certified.key_pair.serialize_der(),
    ));
    Ok((vec![certified.cert.der().clone()], key))
}

/// Server context for an inbound listener.
pub fn server_config(settings: &InboundTls) -> BridgeResult<Arc<ServerConfig>> {
    let (certs, key) = match (&settings.cert_path, &settings.key_path) {
        (Some(cert), Some(key)) => (load_certs(Path::new(cert))?, load_key(Path::new(key))?),
        _ => {
            info!("no inbound key material configured, using a self-signed certificate");
            self_signed()?
        }
    };

    let builder = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| tls_err("protocol versions", e))?;

    let builder = match settings.client_auth {
        ClientAuth::None => builder.with_no_client_auth(),
        mode => {
            let ca = settings.client_ca_path.as_deref().ok_or_else(|| {
                BridgeError::Tls("client certificate auth needs client_ca_path".into())
            })?;
            let roots = Arc::new(load_roots(Path::new(ca))?);
            let verifier = WebPkiClientVerifier::builder_with_provider(roots, provider());
            let verifier = if mode == ClientAuth::Optional {
                verifier.allow_unauthenticated()
            } else {
                verifier
            };
            let verifier = verifier
                .build()
                .map_err(|e| tls_err("client verifier", e))?;
            builder.with_client_cert_verifier(verifier)
        }
    };

    let mut config = builder
        .with_single_cert(certs, key)
        .map_err(|e| tls_err("server certificate", e))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    debug!(client_auth = ?settings.client_auth, "inbound TLS context built");
    Ok(Arc::new(config))
}

fn webpki_roots() -> RootCertStore {
    RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    }
}

/// The shared outbound context: public roots, no client certificate.
pub fn default_client_config() -> BridgeResult<Arc<ClientConfig>> {
    let config = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| tls_err("protocol versions", e))?
        .with_root_certificates(webpki_roots())
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// A dedicated outbound context for one entity.
pub fn client_config(settings: &OutboundTls) -> BridgeResult<Arc<ClientConfig>> {
    let builder = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| tls_err("protocol versions", e))?;

    let builder = if settings.accept_invalid_certs {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
    } else {
        let mut roots = webpki_roots();
        if let Some(ca) = &settings.ca_path {
            for cert in load_certs(Path::new(ca))? {
                roots
                    .add(cert)
                    .map_err(|e| tls_err(&format!("bad CA in {ca}"), e))?;
            }
        }
        builder.with_root_certificates(roots)
    };

    let config = match (&settings.cert_path, &settings.key_path) {
        (Some(cert), Some(key)) => builder
            .with_client_auth_cert(load_certs(Path::new(cert))?, load_key(Path::new(key))?)
            .map_err(|e| tls_err("client certificate", e))?,
        _ => builder.with_no_client_auth(),
    };
    Ok(Arc::new(config))
}

/// Accepts any backend certificate. Only used when an entity sets
/// `accept_invalid_certs`.
#[derive(Debug)]
struct SkipServerVerification;

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
        vec![
            SignatureScheme::ED25519,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_signed_server_context() {
        let config = server_config(&InboundTls::default()).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn server_context_from_pem_files() {
        let dir = std::env::temp_dir().join(format!("wsbridge-tls-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");
        std::fs::write(&cert_path, certified.cert.pem()).unwrap();
        std::fs::write(&key_path, certified.key_pair.serialize_pem()).unwrap();

        let settings = InboundTls {
            cert_path: Some(cert_path.to_string_lossy().into_owned()),
            key_path: Some(key_path.to_string_lossy().into_owned()),
            client_auth: ClientAuth::Optional,
            client_ca_path: Some(cert_path.to_string_lossy().into_owned()),
        };
        assert!(server_config(&settings).is_ok());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_pem_is_tls_error() {
        let err = load_certs(Path::new("/nonexistent/cert.pem")).unwrap_err();
        assert!(matches!(err, BridgeError::Tls(_)));
    }

    #[test]
    fn client_contexts_build() {
        assert!(default_client_config().is_ok());
        let insecure = OutboundTls {
            enabled: true,
            accept_invalid_certs: true,
            ..Default::default()
        };
        assert!(client_config(&insecure).is_ok());
    }
}

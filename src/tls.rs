//! TLS material and client configuration.
use std::{
    net::{IpAddr, Ipv4Addr, TcpStream},
    path::{Path, PathBuf},
    sync::Arc,
};

use rustls::{
    client::{
        danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        verify_server_cert_signed_by_trust_anchor,
    },
    crypto::{ring, verify_tls12_signature, verify_tls13_signature, CryptoProvider},
    pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime},
    server::ParsedCertificate,
    ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore, SignatureScheme,
    StreamOwned,
};
use tracing::warn;

use crate::Error;

#[derive(Clone, Debug)]
enum Material {
    Path(PathBuf),
    Pem(Vec<u8>),
}

impl Material {
    fn read(&self, what: &str) -> Result<Vec<u8>, Error> {
        match self {
            Material::Path(path) => std::fs::read(path).map_err(|e| {
                Error::Tls(format!("unable to read {} {}: {}", what, path.display(), e))
            }),
            Material::Pem(pem) => Ok(pem.clone()),
        }
    }
}

/// TLS settings of a sender.
///
/// Material is loaded when the sender is built, so broken files are reported before any
/// connection is made.
///
/// With a CA bundle and [`TlsConfig::with_server_name`] the server is fully verified. A CA bundle
/// alone verifies the certificate chain but not the name. Without either the server certificate
/// is NOT verified, which leaves the connection open to man-in-the-middle attacks.
#[derive(Clone, Debug, Default)]
pub struct TlsConfig {
    cert: Option<Material>,
    key: Option<Material>,
    ca: Option<Material>,
    server_name: Option<String>,
}

impl TlsConfig {
    pub fn new() -> Self {
        Self::default()
    }
    /// Client certificate chain and private key files (PEM).
    pub fn with_client_cert<C: AsRef<Path>, K: AsRef<Path>>(mut self, cert: C, key: K) -> Self {
        self.cert = Some(Material::Path(cert.as_ref().to_owned()));
        self.key = Some(Material::Path(key.as_ref().to_owned()));
        self
    }
    /// Client certificate chain and private key as in-memory PEM.
    pub fn with_client_cert_pem(mut self, cert: Vec<u8>, key: Vec<u8>) -> Self {
        self.cert = Some(Material::Pem(cert));
        self.key = Some(Material::Pem(key));
        self
    }
    /// CA bundle file (PEM) the server certificate chain must lead to.
    pub fn with_ca<P: AsRef<Path>>(mut self, ca: P) -> Self {
        self.ca = Some(Material::Path(ca.as_ref().to_owned()));
        self
    }
    pub fn with_ca_pem(mut self, ca: Vec<u8>) -> Self {
        self.ca = Some(Material::Pem(ca));
        self
    }
    /// Name the server certificate must be valid for. Enables verification.
    pub fn with_server_name<S: Into<String>>(mut self, name: S) -> Self {
        self.server_name = Some(name.into());
        self
    }

    pub(crate) fn build(&self) -> Result<TlsConnector, Error> {
        let provider = Arc::new(ring::default_provider());
        let builder = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()?;
        let roots = self.ca.as_ref().map(load_roots).transpose()?;
        let (builder, server_name) = match (&self.server_name, roots) {
            (Some(name), Some(roots)) => {
                let server_name = ServerName::try_from(name.clone())
                    .map_err(|e| Error::Tls(format!("invalid server name {}: {}", name, e)))?;
                (builder.with_root_certificates(roots), Some(server_name))
            }
            (Some(_), None) => {
                return Err(Error::Tls(
                    "a CA bundle is required to verify the server".to_owned(),
                ))
            }
            (None, Some(roots)) => {
                warn!("no TLS server name configured, the server certificate name is not checked");
                let verifier = ChainOnlyVerification { roots, provider };
                let builder = builder
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(verifier));
                (builder, None)
            }
            (None, None) => {
                warn!("no TLS server name or CA configured, server certificate verification is disabled");
                let builder = builder
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(NoServerVerification(provider)));
                (builder, None)
            }
        };
        let config = match (&self.cert, &self.key) {
            (Some(cert), Some(key)) => {
                builder.with_client_auth_cert(load_certs(cert, "certificate")?, load_key(key)?)?
            }
            (None, None) => builder.with_no_client_auth(),
            _ => {
                return Err(Error::Tls(
                    "client certificate and key must be set together".to_owned(),
                ))
            }
        };
        Ok(TlsConnector {
            config: Arc::new(config),
            server_name,
        })
    }
}

fn load_roots(material: &Material) -> Result<RootCertStore, Error> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(material, "CA bundle")? {
        roots.add(cert)?;
    }
    Ok(roots)
}

fn load_certs(material: &Material, what: &str) -> Result<Vec<CertificateDer<'static>>, Error> {
    let pem = material.read(what)?;
    let certs = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::Tls(format!("invalid {}: {}", what, e)))?;
    if certs.is_empty() {
        return Err(Error::Tls(format!("no certificates found in {}", what)));
    }
    Ok(certs)
}

fn load_key(material: &Material) -> Result<PrivateKeyDer<'static>, Error> {
    let pem = material.read("private key")?;
    rustls_pemfile::private_key(&mut pem.as_slice())
        .map_err(|e| Error::Tls(format!("invalid private key: {}", e)))?
        .ok_or_else(|| Error::Tls("no private key found".to_owned()))
}

#[derive(Clone)]
pub(crate) struct TlsConnector {
    config: Arc<ClientConfig>,
    server_name: Option<ServerName<'static>>,
}

impl TlsConnector {
    /// Wraps `stream` and completes the handshake.
    ///
    /// `host` is only used for SNI when no server name is configured.
    pub(crate) fn connect(
        &self,
        host: &str,
        mut stream: TcpStream,
    ) -> Result<StreamOwned<ClientConnection, TcpStream>, Error> {
        let server_name = match &self.server_name {
            Some(name) => name.clone(),
            None => ServerName::try_from(host.to_owned())
                .unwrap_or_else(|_| ServerName::from(IpAddr::from(Ipv4Addr::LOCALHOST))),
        };
        let mut conn = ClientConnection::new(self.config.clone(), server_name)?;
        while conn.is_handshaking() {
            conn.complete_io(&mut stream).map_err(|source| Error::Connect {
                addr: host.to_owned(),
                source,
            })?;
        }
        Ok(StreamOwned::new(conn, stream))
    }
}

/// Verifies the chain against `roots`, ignoring the name the certificate was issued for.
#[derive(Debug)]
struct ChainOnlyVerification {
    roots: RootCertStore,
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for ChainOnlyVerification {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let cert = ParsedCertificate::try_from(end_entity)?;
        verify_server_cert_signed_by_trust_anchor(
            &cert,
            &self.roots,
            intermediates,
            now,
            self.provider.signature_verification_algorithms.all,
        )?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

#[derive(Debug)]
struct NoServerVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for NoServerVerification {
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
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_files_are_reported() {
        let err = TlsConfig::new()
            .with_client_cert("/nonexistent/cert.pem", "/nonexistent/key.pem")
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, Error::Tls(ref msg) if msg.contains("certificate")));
    }

    #[test]
    fn verification_needs_ca() {
        let err = TlsConfig::new()
            .with_server_name("zabbix.example.com")
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, Error::Tls(_)));
    }

    #[test]
    fn garbage_pem_is_rejected() {
        let err = TlsConfig::new()
            .with_server_name("zabbix.example.com")
            .with_ca_pem(b"not a certificate".to_vec())
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, Error::Tls(ref msg) if msg.contains("no certificates")));
    }

    #[test]
    fn unverified_without_client_auth() {
        assert!(TlsConfig::new().build().is_ok());
    }

    #[test]
    fn cert_without_key_is_rejected() {
        let config = TlsConfig {
            cert: Some(Material::Pem(Vec::new())),
            ..TlsConfig::default()
        };
        assert!(matches!(config.build(), Err(Error::Tls(_))));
    }
}

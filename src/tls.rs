// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

//! rustls server and client configurations built from the keystore.

use crate::error::{Error, Result};
use crate::keystore::Keystore;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Runtime TLS state for one listener lifetime. Nothing here is persisted.
#[derive(Clone)]
pub struct TlsContext {
    provider: Arc<CryptoProvider>,
    server: Arc<ServerConfig>,
    client: Arc<ClientConfig>,
    certificate: CertificateDer<'static>,
}

impl TlsContext {
    /// Build the server identity and a matching trust anchor from `keystore`.
    ///
    /// The private key is unwrapped here and handed straight to rustls.
    pub fn build(keystore: &Keystore, entry_password: &str) -> Result<Self> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let certificate = keystore.certificate().der().clone();

        let key = keystore.private_key(entry_password)?;
        let key_der =
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.pkcs8_der().to_vec()));

        let server = ServerConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::TlsInit(format!("no usable protocol versions: {}", e)))?
            .with_no_client_auth()
            .with_single_cert(vec![certificate.clone()], key_der)
            .map_err(|e| Error::TlsInit(format!("server identity rejected: {}", e)))?;

        let mut roots = RootCertStore::empty();
        roots
            .add(certificate.clone())
            .map_err(|e| Error::TlsInit(format!("trust anchor rejected: {}", e)))?;

        let client = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::TlsInit(format!("no usable protocol versions: {}", e)))?
            .with_root_certificates(roots)
            .with_no_client_auth();

        tracing::debug!(
            alias = keystore.alias(),
            suites = provider.cipher_suites.len(),
            "TLS context ready"
        );

        Ok(Self {
            provider,
            server: Arc::new(server),
            client: Arc::new(client),
            certificate,
        })
    }

    pub fn acceptor(&self) -> TlsAcceptor {
        TlsAcceptor::from(self.server.clone())
    }

    /// Client configuration trusting only the keystore certificate.
    pub fn client_config(&self) -> Arc<ClientConfig> {
        self.client.clone()
    }

    pub fn connector(&self) -> TlsConnector {
        TlsConnector::from(self.client.clone())
    }

    pub fn certificate(&self) -> &CertificateDer<'static> {
        &self.certificate
    }

    /// Enabled protocol versions, newest first.
    pub fn protocol_versions(&self) -> Vec<String> {
        rustls::DEFAULT_VERSIONS
            .iter()
            .map(|v| format!("{:?}", v.version))
            .collect()
    }

    /// Cipher suites in preference order.
    pub fn cipher_suites(&self) -> Vec<String> {
        self.provider
            .cipher_suites
            .iter()
            .map(|s| format!("{:?}", s.suite()))
            .collect()
    }
}

impl std::fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsContext")
            .field("protocols", &self.protocol_versions())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MemorySecretStore, SecretStore, KEYENTRY_PASSWORD_KEY};
    use crate::keystore::KeystoreProvisioner;
    use tempfile::TempDir;

    fn keystore() -> (TempDir, Keystore, String) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("remote-tls.keystore");
        let secrets = Arc::new(MemorySecretStore::new());
        let provisioner = KeystoreProvisioner::new(secrets.clone(), 8112);
        provisioner.ensure_keystore(&path).unwrap();
        let keystore = provisioner.load_keystore(&path).unwrap();
        let entry = secrets.get(KEYENTRY_PASSWORD_KEY).unwrap().unwrap();
        (dir, keystore, entry)
    }

    #[test]
    fn test_build_and_diagnostics() {
        let (_dir, keystore, entry) = keystore();
        let ctx = TlsContext::build(&keystore, &entry).unwrap();

        assert_eq!(ctx.certificate(), keystore.certificate().der());
        assert!(ctx.protocol_versions().iter().any(|v| v == "TLSv1_3"));
        assert!(ctx
            .cipher_suites()
            .iter()
            .any(|s| s.starts_with("TLS13_")));
    }

    #[test]
    fn test_wrong_entry_password_fails() {
        let (_dir, keystore, _) = keystore();
        let err = TlsContext::build(&keystore, "wrong").unwrap_err();
        assert!(matches!(err, Error::KeystoreCorrupt { .. }));
    }

    #[tokio::test]
    async fn test_handshake_over_loopback() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (_dir, keystore, entry) = keystore();
        let ctx = TlsContext::build(&keystore, &entry).unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let acceptor = ctx.acceptor();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut tls = acceptor.accept(stream).await.unwrap();
            tls.write_all(b"pong").await.unwrap();
            tls.shutdown().await.unwrap();
        });

        let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let name = rustls::pki_types::ServerName::try_from("localhost").unwrap();
        let mut tls = ctx.connector().connect(name, stream).await.unwrap();
        let mut buf = Vec::new();
        tls.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"pong");
        server.await.unwrap();
    }
}

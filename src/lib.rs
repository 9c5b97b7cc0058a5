// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

//! Self-provisioned HTTPS listener for local remote-control endpoints.
//!
//! On first start a self-signed `localhost` certificate and RSA key are
//! generated into a password-protected keystore; later starts load it unchanged.
//!
//! ```rust,no_run
//! use remote_tls::{Config, FileSecretStore, Paths, RemoteControlServer, StatusDispatcher};
//! use std::sync::Arc;
//!
//! # async fn run() -> remote_tls::Result<()> {
//! let paths = Paths::new()?;
//! let config = Config::load(&paths.config)?;
//! let secrets = Arc::new(FileSecretStore::open(&paths.preferences)?);
//!
//! let server = RemoteControlServer::new(
//!     paths,
//!     &config.https,
//!     secrets,
//!     Arc::new(StatusDispatcher::default()),
//! );
//! let addr = server.start(config.https.port).await?;
//! println!("listening on https://{}", addr);
//! server.stop().await;
//! # Ok(())
//! # }
//! ```

/// Certificate generation.
pub mod cert;
/// Configuration, paths and secret storage.
pub mod config;
/// Connection hand-off.
pub mod dispatch;
/// Error types.
pub mod error;
/// Filesystem utilities.
pub mod fs;
/// Keystore provisioning.
pub mod keystore;
/// Password generation.
pub mod secret;
/// Listener lifecycle.
pub mod server;
/// rustls configuration.
pub mod tls;
/// System trust store integration.
pub mod trust;
/// X.509 certificate parsing.
pub mod x509;

pub use cert::{
    generate_certificate, parse_subject_alt_names, validate_days, KeyMaterial, SanEntry,
    SelfSignedCert, DEFAULT_SIGNING_ALGORITHM, MAX_CERT_DAYS,
};
pub use config::{
    Config, FileSecretStore, HttpsConfig, MemorySecretStore, Paths, SecretStore, DEFAULT_HOST,
    DEFAULT_PORT,
};
pub use dispatch::{Dispatcher, SecureConnection, StatusDispatcher};
pub use error::{Error, Result};
pub use keystore::{load_keystore, Keystore, KeystoreHandle, KeystoreProvisioner, ENTRY_ALIAS};
pub use secret::Password;
pub use server::{prepare_tls, ListenerState, RemoteControlServer};
pub use tls::TlsContext;
pub use trust::{platform_trust, NoopTrust, PlatformTrust};
pub use x509::{parse_cert_der, parse_cert_pem, CertInfo};

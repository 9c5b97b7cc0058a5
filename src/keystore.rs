// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

//! First-run provisioning and loading of the listener keystore.
//!
//! The keystore is a PKCS#12 file holding one private-key entry. The file is
//! encrypted with the store password; the entry's key bytes are additionally
//! wrapped as an encrypted PKCS#8 document under the entry password. Both
//! passwords are generated once and kept in the [`SecretStore`].

use crate::cert::{
    generate_certificate, KeyMaterial, SelfSignedCert, DEFAULT_SIGNING_ALGORITHM, RSA_KEY_BITS,
};
use crate::config::{SecretStore, KEYENTRY_PASSWORD_KEY, KEYSTORE_PASSWORD_KEY};
use crate::error::{Error, Result};
use crate::secret::Password;
use crate::x509::CertInfo;
use fs2::FileExt;
use p12_keystore::{Certificate, KeyStore, KeyStoreEntry, PrivateKeyChain};
use pkcs8::{EncryptedPrivateKeyInfo, PrivateKeyInfo};
use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Alias of the single key entry.
pub const ENTRY_ALIAS: &str = "remote_tls_localhost";

/// Validity of the provisioned certificate (5 years).
pub const KEYSTORE_VALIDITY_DAYS: u32 = 1825;

/// Subject and issuer of the provisioned certificate.
pub const KEYSTORE_SUBJECT: &str = "CN=localhost, OU=remote-tls, O=remote-tls";

/// SAN list covering every loopback spelling a client may use for `port`.
pub fn default_subject_alt_names(port: u16) -> String {
    format!(
        "dns:localhost,ip:127.0.0.1,dns:127.0.0.1,ip:::1,\
         uri:https://127.0.0.1:{port},uri:https://[::1]:{port}"
    )
}

/// Result of [`KeystoreProvisioner::ensure_keystore`].
#[derive(Debug, Clone)]
pub struct KeystoreHandle {
    pub path: PathBuf,
    /// True when this call generated the keystore.
    pub created: bool,
}

/// Creates the keystore on first use and opens it afterwards.
#[derive(Clone)]
pub struct KeystoreProvisioner {
    secrets: Arc<dyn SecretStore>,
    port: u16,
}

impl KeystoreProvisioner {
    /// `port` only feeds the URI SANs of a newly generated certificate.
    pub fn new(secrets: Arc<dyn SecretStore>, port: u16) -> Self {
        Self { secrets, port }
    }

    /// Make sure a keystore exists at `path`, generating one if needed.
    ///
    /// An existing file is never touched, even if it turns out to be unreadable.
    pub fn ensure_keystore(&self, path: &Path) -> Result<KeystoreHandle> {
        if path.exists() {
            tracing::debug!(path = %path.display(), "keystore already provisioned");
            return Ok(KeystoreHandle {
                path: path.to_path_buf(),
                created: false,
            });
        }

        if let Some(parent) = path.parent() {
            crate::fs::ensure_dir(parent)?;
        }

        let lock_path = lock_path_for(path);
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|e| Error::WriteFile {
                path: lock_path.clone(),
                source: e,
            })?;
        lock.lock_exclusive().map_err(|e| Error::WriteFile {
            path: lock_path.clone(),
            source: e,
        })?;

        // Another process may have finished while we waited for the lock
        let provisioned = if path.exists() {
            Ok(false)
        } else {
            self.provision(path).map(|()| true)
        };

        // Waiters still holding the old lock file re-check the keystore after locking
        let _ = std::fs::remove_file(&lock_path);
        let _ = FileExt::unlock(&lock);
        let created = provisioned?;

        Ok(KeystoreHandle {
            path: path.to_path_buf(),
            created,
        })
    }

    fn provision(&self, path: &Path) -> Result<()> {
        tracing::info!(path = %path.display(), "provisioning loopback TLS identity");

        let key = KeyMaterial::generate_rsa(RSA_KEY_BITS)?;
        let certificate = generate_certificate(
            KEYSTORE_SUBJECT,
            &key,
            KEYSTORE_VALIDITY_DAYS,
            DEFAULT_SIGNING_ALGORITHM,
            Some(&default_subject_alt_names(self.port)),
        )?;

        let store_password = Password::generate();
        let entry_password = Password::generate();

        let wrapped_key = encrypt_key(key.pkcs8_der(), &entry_password)?;
        let contents = write_pkcs12(&certificate, &wrapped_key, &store_password)?;

        // Passwords first: a keystore nobody can open is worse than no keystore
        self.secrets.put(KEYSTORE_PASSWORD_KEY, &store_password)?;
        self.secrets.put(KEYENTRY_PASSWORD_KEY, &entry_password)?;
        crate::fs::atomic_write_secret(path, &contents)?;

        tracing::info!(
            path = %path.display(),
            alias = ENTRY_ALIAS,
            sha256 = %certificate.fingerprint_sha256(),
            "keystore written"
        );
        Ok(())
    }

    /// Open the keystore at `path` with the persisted store password.
    pub fn load_keystore(&self, path: &Path) -> Result<Keystore> {
        let store_password = self
            .secrets
            .get(KEYSTORE_PASSWORD_KEY)?
            .filter(|p| !p.is_empty())
            .map(Password::from_stored)
            .ok_or_else(|| Error::corrupt(path, "keystore password is not configured"))?;
        load_keystore(path, &store_password)
    }

    /// The persisted entry password.
    pub fn entry_password(&self, path: &Path) -> Result<Password> {
        self.secrets
            .get(KEYENTRY_PASSWORD_KEY)?
            .filter(|p| !p.is_empty())
            .map(Password::from_stored)
            .ok_or_else(|| Error::corrupt(path, "key entry password is not configured"))
    }
}

impl std::fmt::Debug for KeystoreProvisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeystoreProvisioner")
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

/// The opened keystore. The private key stays wrapped until a TLS context
/// asks for it with the entry password.
pub struct Keystore {
    path: PathBuf,
    alias: String,
    certificate: SelfSignedCert,
    wrapped_key: Vec<u8>,
}

impl Keystore {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn certificate(&self) -> &SelfSignedCert {
        &self.certificate
    }

    pub fn certificate_info(&self) -> Result<CertInfo> {
        self.certificate.info()
    }

    /// Unwrap the entry key. A wrong password means the keystore no longer
    /// matches the secret store and is reported as corrupt.
    pub(crate) fn private_key(&self, entry_password: &str) -> Result<KeyMaterial> {
        decrypt_key(&self.wrapped_key, entry_password)
            .map(KeyMaterial::from_pkcs8_der)
            .map_err(|reason| Error::corrupt(&self.path, reason))
    }
}

impl std::fmt::Debug for Keystore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keystore")
            .field("path", &self.path)
            .field("alias", &self.alias)
            .field("certificate", &self.certificate)
            .finish_non_exhaustive()
    }
}

/// Open a PKCS#12 keystore. Every failure to read the container, including a
/// wrong password, is [`Error::KeystoreCorrupt`].
pub fn load_keystore(path: &Path, store_password: &str) -> Result<Keystore> {
    let data = fs::read(path).map_err(|e| Error::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    let store = KeyStore::from_pkcs12(&data, store_password)
        .map_err(|e| Error::corrupt(path, format!("cannot decrypt PKCS#12 container: {}", e)))?;

    for (alias, _) in store.entries() {
        tracing::debug!(path = %path.display(), alias = %alias, "keystore entry");
    }

    let chain = match store.entry(ENTRY_ALIAS) {
        Some(KeyStoreEntry::PrivateKeyChain(chain)) => chain,
        Some(_) => {
            return Err(Error::corrupt(
                path,
                format!("entry '{}' holds no private key", ENTRY_ALIAS),
            ))
        }
        None => {
            return Err(Error::corrupt(
                path,
                format!("entry '{}' not found", ENTRY_ALIAS),
            ))
        }
    };

    let leaf = match chain.chain() {
        [leaf] => leaf,
        other => {
            return Err(Error::corrupt(
                path,
                format!("expected a chain of one certificate, found {}", other.len()),
            ))
        }
    };

    let certificate = SelfSignedCert::from_der(leaf.as_der().to_vec());
    certificate
        .info()
        .map_err(|e| Error::corrupt(path, format!("stored certificate unreadable: {}", e)))?;

    Ok(Keystore {
        path: path.to_path_buf(),
        alias: ENTRY_ALIAS.to_string(),
        certificate,
        wrapped_key: chain.key().to_vec(),
    })
}

fn write_pkcs12(
    certificate: &SelfSignedCert,
    wrapped_key: &[u8],
    store_password: &str,
) -> Result<Vec<u8>> {
    let cert = Certificate::from_der(certificate.der().as_ref())
        .map_err(|e| Error::KeyEncryption(format!("Failed to embed certificate: {}", e)))?;
    let local_key_id = Sha256::digest(certificate.der().as_ref());

    let mut store = KeyStore::new();
    store.add_entry(
        ENTRY_ALIAS,
        KeyStoreEntry::PrivateKeyChain(PrivateKeyChain::new(
            wrapped_key,
            local_key_id.as_slice(),
            vec![cert],
        )),
    );

    store
        .writer(store_password)
        .write()
        .map_err(|e| Error::KeyEncryption(format!("Failed to write PKCS#12: {}", e)))
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

/// Wrap a PKCS#8 key with a password using PBES2 (scrypt + AES-256-CBC).
fn encrypt_key(pkcs8_der: &[u8], password: &str) -> Result<Vec<u8>> {
    use pkcs8::der::Decode;
    use rand::RngCore;

    if password.is_empty() {
        return Err(Error::KeyEncryption("Password cannot be empty".to_string()));
    }

    let pki = PrivateKeyInfo::from_der(pkcs8_der)
        .map_err(|e| Error::KeyEncryption(format!("Failed to parse key: {}", e)))?;

    let mut rng = rand::rng();
    let mut salt = [0u8; 16];
    let mut iv = [0u8; 16];
    rng.fill_bytes(&mut salt);
    rng.fill_bytes(&mut iv);

    let params = pkcs8::pkcs5::pbes2::Parameters::scrypt_aes256cbc(
        pkcs8::pkcs5::scrypt::Params::recommended(),
        &salt,
        &iv,
    )
    .map_err(|e| Error::KeyEncryption(format!("Failed to create encryption params: {}", e)))?;

    let encrypted = pki
        .encrypt_with_params(params, password)
        .map_err(|e| Error::KeyEncryption(format!("Encryption failed: {}", e)))?;

    Ok(encrypted.as_bytes().to_vec())
}

/// Reverse of [`encrypt_key`]. Errors are plain reasons; the caller knows the path.
fn decrypt_key(encrypted_der: &[u8], password: &str) -> std::result::Result<Vec<u8>, String> {
    use pkcs8::der::Decode;

    if password.is_empty() {
        return Err("key entry password is empty".to_string());
    }

    let encrypted = EncryptedPrivateKeyInfo::from_der(encrypted_der)
        .map_err(|e| format!("key entry is not an encrypted PKCS#8 document: {}", e))?;

    let decrypted = encrypted
        .decrypt(password)
        .map_err(|_| "key entry password is incorrect".to_string())?;

    Ok(decrypted.as_bytes().to_vec())
}

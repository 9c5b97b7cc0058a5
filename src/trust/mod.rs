// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

//! Optional installation of the listener certificate into OS and browser
//! trust stores.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "macos")]
mod macos;
#[cfg(any(target_os = "linux", target_os = "macos"))]
mod nss;
#[cfg(windows)]
mod windows;

use crate::error::{Error, Result};
use rustls::pki_types::CertificateDer;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Timeout for a single trust-store command (30 seconds)
const COMMAND_TIMEOUT_SECS: u64 = 30;

const DANGEROUS_CHARS: &[char] = &[
    ';', '&', '|', '$', '`', '(', ')', '{', '}', '[', ']', '<', '>', '!', '~', '*', '?', '#', '\n',
    '\r', '\0',
];

/// Hook that makes local clients trust the listener certificate.
pub trait PlatformTrust: Send + Sync {
    /// Install `certificate` under `alias`. Returns true when any store changed.
    fn install_certificate(&self, alias: &str, certificate: &CertificateDer<'_>) -> Result<bool>;

    fn name(&self) -> &'static str;
}

/// Trust hook that never touches anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTrust;

impl PlatformTrust for NoopTrust {
    fn install_certificate(&self, _alias: &str, _certificate: &CertificateDer<'_>) -> Result<bool> {
        Ok(false)
    }

    fn name(&self) -> &'static str {
        "none"
    }
}

pub fn platform_trust() -> Arc<dyn PlatformTrust> {
    #[cfg(target_os = "macos")]
    {
        Arc::new(macos::KeychainTrust)
    }

    #[cfg(target_os = "linux")]
    {
        Arc::new(linux::NssTrust)
    }

    #[cfg(windows)]
    {
        Arc::new(windows::CertStoreTrust)
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux", windows)))]
    {
        tracing::warn!("no trust store integration for this platform");
        Arc::new(NoopTrust)
    }
}

/// A PEM copy of the certificate in the temp directory, removed on drop.
/// Trust-store tools only accept files.
pub(crate) struct StagedCertificate {
    path: PathBuf,
}

impl StagedCertificate {
    pub(crate) fn write(certificate: &CertificateDer<'_>) -> Result<Self> {
        let pem = pem::encode(&pem::Pem::new("CERTIFICATE", certificate.as_ref().to_vec()));
        let suffix: u64 = rand::random();
        let path = std::env::temp_dir().join(format!("remote-tls-{:016x}.crt", suffix));
        std::fs::write(&path, pem).map_err(|e| Error::WriteFile {
            path: path.clone(),
            source: e,
        })?;

        // Removed again by Drop if validation fails
        let mut staged = Self { path };
        staged.path = validate_cert_path(&staged.path)?;
        Ok(staged)
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagedCertificate {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Validate a path for use in trust store operations.
/// Prevents command injection and path traversal attacks.
pub fn validate_cert_path(path: &Path) -> Result<PathBuf> {
    if !path.is_file() {
        return Err(Error::TrustStore(format!(
            "Path is not a regular file: {}",
            path.display()
        )));
    }

    // Canonicalize to resolve symlinks and get absolute path
    let canonical = path.canonicalize().map_err(|e| Error::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    if !is_safe_path(&canonical) {
        return Err(Error::TrustStore(format!(
            "Path is unsafe to pass to trust store tools: {}",
            path.display()
        )));
    }

    Ok(canonical)
}

/// Validate a directory taken from an environment variable such as HOME.
pub fn validate_env_path(env_var: &str) -> Option<PathBuf> {
    let value = std::env::var(env_var).ok()?;
    let path = PathBuf::from(&value);

    if !path.is_dir() {
        return None;
    }

    let canonical = path.canonicalize().ok()?;
    is_safe_path(&canonical).then_some(canonical)
}

/// True when the path contains no shell metacharacters and cannot be read as a flag.
pub(crate) fn is_safe_path(path: &Path) -> bool {
    match path.to_str() {
        None => false,
        Some(s) => !DANGEROUS_CHARS.iter().any(|c| s.contains(*c)) && !s.starts_with('-'),
    }
}

/// Aliases end up as certutil nicknames and keychain labels.
pub(crate) fn validate_alias(alias: &str) -> Result<()> {
    if alias.is_empty()
        || alias.starts_with('-')
        || !alias
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ' '))
    {
        return Err(Error::TrustStore(format!("Invalid certificate alias '{}'", alias)));
    }
    Ok(())
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
pub(crate) fn is_command_available(command: &str) -> bool {
    Command::new("which")
        .arg(command)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Run a command with a timeout, capturing its output.
pub(crate) fn run_command(command: &str, args: &[&str]) -> Result<Output> {
    let mut child = Command::new(command)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::Command {
            command: command.to_string(),
            stderr: e.to_string(),
        })?;

    let timeout = Duration::from_secs(COMMAND_TIMEOUT_SECS);
    let start = std::time::Instant::now();

    loop {
        match child.try_wait() {
            Ok(Some(_)) => {
                return child.wait_with_output().map_err(|e| Error::Command {
                    command: command.to_string(),
                    stderr: e.to_string(),
                });
            }
            Ok(None) => {
                if start.elapsed() >= timeout {
                    // Kill and reap so no zombie is left behind
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(Error::TrustStore(format!(
                        "{} timed out after {}s",
                        command, COMMAND_TIMEOUT_SECS
                    )));
                }
                thread::sleep(Duration::from_millis(100));
            }
            Err(e) => {
                return Err(Error::Command {
                    command: command.to_string(),
                    stderr: e.to_string(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_trust_reports_unchanged() {
        let cert = CertificateDer::from(vec![0x30, 0x00]);
        assert!(!NoopTrust.install_certificate("alias", &cert).unwrap());
        assert_eq!(NoopTrust.name(), "none");
    }

    #[test]
    fn test_is_safe_path() {
        assert!(is_safe_path(Path::new("/tmp/remote-tls.crt")));
        assert!(!is_safe_path(Path::new("/tmp/a;rm -rf.crt")));
        assert!(!is_safe_path(Path::new("-rf")));
        assert!(!is_safe_path(Path::new("/tmp/$(whoami)")));
    }

    #[test]
    fn test_validate_alias() {
        assert!(validate_alias("remote_tls_localhost").is_ok());
        assert!(validate_alias("").is_err());
        assert!(validate_alias("-n").is_err());
        assert!(validate_alias("a\"b").is_err());
    }

    #[test]
    fn test_staged_certificate_is_removed() {
        let cert = CertificateDer::from(vec![0x30, 0x03, 0x02, 0x01, 0x00]);
        let path = {
            let staged = StagedCertificate::write(&cert).unwrap();
            let contents = std::fs::read_to_string(staged.path()).unwrap();
            assert!(contents.starts_with("-----BEGIN CERTIFICATE-----"));
            staged.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn test_validate_cert_path_rejects_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(validate_cert_path(dir.path()).is_err());
    }
}

// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

use crate::error::{Error, Result};
use crate::fs::path_to_str;
use crate::trust::{
    nss, run_command, validate_alias, validate_env_path, PlatformTrust, StagedCertificate,
};
use rustls::pki_types::CertificateDer;

/// Installs into the user's login keychain, plus Firefox NSS profiles.
pub struct KeychainTrust;

impl PlatformTrust for KeychainTrust {
    fn install_certificate(&self, alias: &str, certificate: &CertificateDer<'_>) -> Result<bool> {
        validate_alias(alias)?;
        let staged = StagedCertificate::write(certificate)?;
        let cert_path_str = path_to_str(staged.path())?;

        let mut changed = false;

        // verify-cert succeeds once the keychain trusts the certificate for SSL
        let verify = run_command("security", &["verify-cert", "-p", "ssl", "-c", cert_path_str])?;
        if verify.status.success() {
            tracing::debug!("certificate already trusted by keychain");
        } else {
            let keychain = get_user_keychain()?;
            let output = run_command(
                "security",
                &[
                    "add-trusted-cert",
                    "-r",
                    "trustRoot",
                    "-p",
                    "ssl",
                    "-k",
                    &keychain,
                    cert_path_str,
                ],
            )?;

            if !output.status.success() {
                return Err(Error::TrustStore(format!(
                    "Failed to add certificate to {}: {}",
                    keychain,
                    String::from_utf8_lossy(&output.stderr).trim()
                )));
            }
            tracing::info!(keychain = %keychain, "certificate added to keychain");
            changed = true;
        }

        // Firefox keeps its own store
        if let Some(home) = validate_env_path("HOME") {
            let roots = vec![home
                .join("Library")
                .join("Application Support")
                .join("Firefox")
                .join("Profiles")];
            let databases = nss::find_nss_databases(&home, &roots);
            changed |= nss::install(&databases, alias, staged.path(), certificate.as_ref());
        }

        Ok(changed)
    }

    fn name(&self) -> &'static str {
        "macOS Keychain"
    }
}

fn get_user_keychain() -> Result<String> {
    let output = run_command("security", &["default-keychain"])?;

    let keychain = String::from_utf8_lossy(&output.stdout)
        .trim()
        .trim_matches('"')
        .to_string();

    if !keychain.is_empty() {
        return Ok(keychain);
    }

    validate_env_path("HOME")
        .map(|home| format!("{}/Library/Keychains/login.keychain-db", home.display()))
        .ok_or_else(|| Error::TrustStore("Cannot locate the login keychain".into()))
}
